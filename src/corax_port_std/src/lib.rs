//! Simulation environment for running Corax on a hosted environment.
//!
//! Every kernel execution context (the boot phase, each task, and the
//! timer interrupt) is backed by an OS thread, gated so that at most one
//! of them makes progress as "the CPU" at any time:
//!
//!  - The kernel's CPU Lock becomes a flag guarded by a mutex/condvar pair.
//!    `enter_cpu_lock` blocks until the flag is free, which also models a
//!    pended interrupt waiting for the mask to drop.
//!  - The dispatcher maps [`State::running_task`] to a backing thread
//!    (spawning one on first dispatch) and wakes it; a task thread that is
//!    no longer scheduled parks itself until it is.
//!  - The tick source is a *virtual clock*: [`advance`] bumps it and runs
//!    the timer interrupt inline, so every timed scenario is deterministic.
//!
//! Forcibly-stopped tasks leave their backing thread parked forever; the
//! simulation leaks it. That is acceptable for a test environment.
//!
//! [`State::running_task`]: corax_kernel::State
use std::{
    cell::Cell,
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Condvar, Mutex,
    },
    thread::{self, ThreadId},
    time::Duration,
};

use corax_kernel::{KernelTraits, PortToKernel, Task, Ticks};

/// Used by `use_port!`
#[doc(hidden)]
pub use corax_kernel;
/// Used by `use_port!`
#[doc(hidden)]
pub use env_logger;

/// Implemented on a kernel trait type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
pub unsafe trait PortInstance:
    KernelTraits + corax_kernel::PortThreading<PortTaskState = TaskState>
{
    fn port_state() -> &'static State;
}

/// The role of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    Boot,
    /// The thread currently impersonating an interrupt handler.
    Interrupt,
    /// The backing thread for a task.
    Task,
}

thread_local! {
    /// The current thread's role. Assigned when the port creates or borrows
    /// the thread.
    static THREAD_ROLE: Cell<ThreadRole> = Cell::new(ThreadRole::Unknown);
}

/// The panic payload used to unwind and retire a task's backing thread.
struct ThreadExit;

/// The port-private per-task state.
#[derive(Debug)]
pub struct TaskState {
    tsm: Mutex<Tsm>,
}

/// Task context state machine.
///
/// These don't exactly align with the task states defined in the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tsm {
    /// No context. The kernel must call `initialize_task_state` before
    /// dispatching this task.
    Uninit,
    /// The context is initialized but has no backing thread yet.
    Dormant,
    /// The task is backed by a live thread.
    Running(ThreadId),
}

impl TaskState {
    pub const fn new() -> Self {
        Self {
            tsm: Mutex::new(Tsm::Uninit),
        }
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct Sched {
    /// The thread (if any) currently holding CPU Lock.
    cpu_lock_holder: Option<ThreadId>,

    /// The backing thread of the task the dispatcher last scheduled.
    running_thread: Option<ThreadId>,

    /// Set by `dispatch_first_task`; `yield_cpu` is a no-op before that.
    started: bool,

    shutdown: bool,
}

/// The internal state of the port.
#[derive(Debug)]
pub struct State {
    sched: Mutex<Sched>,
    wakeup: Condvar,

    /// The virtual monotonic clock, in ticks.
    now: AtomicU64,
}

#[allow(clippy::missing_safety_doc)]
impl State {
    pub const fn new() -> Self {
        Self {
            sched: Mutex::new(Sched {
                cpu_lock_holder: None,
                running_thread: None,
                started: false,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
            now: AtomicU64::new(0),
        }
    }

    /// Boot the kernel on a dedicated thread and block until [`shutdown`]
    /// is called.
    pub fn port_boot<Traits: PortInstance>(&'static self) {
        let _ = env_logger::builder().is_test(true).try_init();

        log::trace!("port_boot");
        thread::spawn(move || {
            THREAD_ROLE.with(|role| role.set(ThreadRole::Boot));

            // The kernel wants CPU Lock active on entry to `boot`.
            Self::enter_cpu_lock_inner(Traits::port_state());

            let result = catch_unwind(AssertUnwindSafe(|| {
                // Safety: We are the port, booting the kernel exactly once
                unsafe { <Traits as PortToKernel>::boot() };
            }));
            match result {
                Err(payload) if payload.is::<ThreadExit>() => {}
                Err(payload) => resume_unwind(payload),
                Ok(()) => unreachable!("`boot` returned"),
            }
        });

        // Wait for a shutdown request.
        let mut sched = self.sched.lock().unwrap();
        while !sched.shutdown {
            sched = self.wakeup.wait(sched).unwrap();
        }
        log::trace!("port_boot: shut down");
    }

    pub unsafe fn dispatch_first_task<Traits: PortInstance>(&'static self) -> ! {
        log::trace!("dispatch_first_task");
        assert_eq!(THREAD_ROLE.with(|r| r.get()), ThreadRole::Boot);
        assert!(self.is_cpu_lock_active());

        self.sched.lock().unwrap().started = true;

        // The kernel chose the first task before calling us; map it to a
        // thread and let it go.
        // Safety: CPU Lock active
        let task = unsafe { corax_kernel::running_task::<Traits>() };
        let thread = task.map(|task| self.ensure_task_thread::<Traits>(task));
        self.sched.lock().unwrap().running_thread = thread;

        self.leave_cpu_lock();

        // Retire the boot thread.
        std::panic::panic_any(ThreadExit);
    }

    pub unsafe fn yield_cpu<Traits: PortInstance>(&'static self) {
        log::trace!("yield_cpu");
        assert!(!self.is_cpu_lock_active());

        if !self.sched.lock().unwrap().started {
            // The scheduler isn't running yet; the request stays pending
            // until `dispatch_first_task`.
            return;
        }

        self.dispatch::<Traits>();

        if THREAD_ROLE.with(|r| r.get()) == ThreadRole::Task {
            self.park_until_scheduled();
        }
    }

    pub unsafe fn exit_and_dispatch<Traits: PortInstance>(
        &'static self,
        task: &'static Task<Traits>,
    ) -> ! {
        log::trace!("exit_and_dispatch({task:p})");
        assert_eq!(THREAD_ROLE.with(|r| r.get()), ThreadRole::Task);
        assert!(self.is_cpu_lock_active());

        // Dissociate this thread from the task. A restart path
        // (`initialize_task_state`) may already have replaced the context
        // with a fresh dormant one; leave that alone.
        {
            let mut tsm = task.port_task_state.tsm.lock().unwrap();
            if *tsm == Tsm::Running(thread::current().id()) {
                *tsm = Tsm::Uninit;
            }
        }

        self.leave_cpu_lock();
        self.dispatch::<Traits>();

        // Retire this thread. The spawn wrapper swallows the payload.
        std::panic::panic_any(ThreadExit);
    }

    pub unsafe fn enter_cpu_lock(&self) {
        log::trace!("enter_cpu_lock");
        Self::enter_cpu_lock_inner(self);
    }

    fn enter_cpu_lock_inner(&self) {
        let me = thread::current().id();
        let mut sched = self.sched.lock().unwrap();
        debug_assert_ne!(
            sched.cpu_lock_holder,
            Some(me),
            "CPU Lock is not recursive"
        );
        while sched.cpu_lock_holder.is_some() {
            sched = self.wakeup.wait(sched).unwrap();
        }
        sched.cpu_lock_holder = Some(me);
    }

    pub unsafe fn leave_cpu_lock(&self) {
        log::trace!("leave_cpu_lock");
        let me = thread::current().id();
        let mut sched = self.sched.lock().unwrap();
        assert_eq!(sched.cpu_lock_holder, Some(me));
        sched.cpu_lock_holder = None;
        drop(sched);
        self.wakeup.notify_all();
    }

    /// Enter a CPU Lock state, blocking while another context holds it,
    /// which is how a pended interrupt behaves on real hardware. Returns
    /// `false` iff the current context already holds it.
    pub unsafe fn try_enter_cpu_lock(&self) -> bool {
        let me = thread::current().id();
        {
            let sched = self.sched.lock().unwrap();
            if sched.cpu_lock_holder == Some(me) {
                return false;
            }
        }
        Self::enter_cpu_lock_inner(self);
        true
    }

    pub fn is_cpu_lock_active(&self) -> bool {
        let me = thread::current().id();
        self.sched.lock().unwrap().cpu_lock_holder == Some(me)
    }

    pub unsafe fn initialize_task_state<Traits: PortInstance>(
        &self,
        task: &'static Task<Traits>,
    ) {
        log::trace!("initialize_task_state({task:p})");
        assert!(self.is_cpu_lock_active());

        // A `Running` context being reinitialized belongs to a task that is
        // being restarted or forcibly stopped; its old thread never runs
        // again (it is either about to retire itself or parked forever).
        *task.port_task_state.tsm.lock().unwrap() = Tsm::Dormant;
    }

    pub fn wait_for_interrupt(&self) {
        thread::sleep(Duration::from_micros(100));
    }

    pub const MAX_TIMEOUT: Ticks = Ticks::MAX / 2;

    pub unsafe fn tick_count(&self) -> Ticks {
        self.now.load(Ordering::SeqCst)
    }

    /// The virtual clock only moves through [`advance`], which also runs
    /// the timer interrupt, so the alarm request needs no bookkeeping;
    /// this port behaves like a ticked one.
    pub unsafe fn pend_tick_after(&self, _delta: Ticks) {}

    pub unsafe fn pend_tick(&self) {}

    /// Run the dispatcher: let the kernel elect a task, then hand the
    /// virtual CPU to its backing thread.
    fn dispatch<Traits: PortInstance>(&'static self) {
        Self::enter_cpu_lock_inner(self);

        // Safety: We are the port; CPU Lock active
        unsafe { <Traits as PortToKernel>::choose_running_task() };
        // Safety: CPU Lock active
        let task = unsafe { corax_kernel::running_task::<Traits>() };

        let thread = task.map(|task| self.ensure_task_thread::<Traits>(task));
        self.sched.lock().unwrap().running_thread = thread;

        // Safety: We just entered the CPU Lock state above
        unsafe { self.leave_cpu_lock() };
    }

    /// Get the backing thread for `task`, spawning one if its context has
    /// never run.
    fn ensure_task_thread<Traits: PortInstance>(
        &'static self,
        task: &'static Task<Traits>,
    ) -> ThreadId {
        let mut tsm = task.port_task_state.tsm.lock().unwrap();
        match *tsm {
            Tsm::Running(thread) => thread,
            Tsm::Dormant => {
                let handle = thread::spawn(move || {
                    THREAD_ROLE.with(|role| role.set(ThreadRole::Task));
                    Traits::port_state().park_until_scheduled();

                    log::debug!("task {task:p} is now running");
                    let result = catch_unwind(AssertUnwindSafe(|| {
                        corax_kernel::task::entry_loop::<Traits>(task);
                    }));
                    match result {
                        Err(payload) if payload.is::<ThreadExit>() => {
                            log::trace!("task thread for {task:p} retired");
                        }
                        Err(payload) => resume_unwind(payload),
                        Ok(()) => unreachable!("`entry_loop` returned"),
                    }
                });
                let thread = handle.thread().id();
                *tsm = Tsm::Running(thread);
                thread
            }
            Tsm::Uninit => unreachable!("dispatched a task with no context"),
        }
    }

    /// Park the calling task thread until the dispatcher schedules it.
    fn park_until_scheduled(&self) {
        let me = thread::current().id();
        let mut sched = self.sched.lock().unwrap();
        loop {
            if sched.shutdown {
                // The simulation is over; this thread will never be
                // scheduled again.
                drop(sched);
                loop {
                    thread::park();
                }
            }
            if sched.running_thread == Some(me) {
                break;
            }
            sched = self.wakeup.wait(sched).unwrap();
        }
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// Return a flag indicating whether a task context is active.
pub fn is_task_context() -> bool {
    THREAD_ROLE.with(|r| r.get()) == ThreadRole::Task
}

/// Return a flag indicating whether an interrupt context is active.
pub fn is_interrupt_context() -> bool {
    THREAD_ROLE.with(|r| r.get()) == ThreadRole::Interrupt
}

/// Advance the virtual clock by `delta` ticks, then run the timer interrupt
/// inline, impersonating the interrupt controller.
///
/// It's illegal to call this from a thread managed by the port.
pub fn advance<Traits: PortInstance>(delta: Ticks) {
    let state = Traits::port_state();
    assert_eq!(
        THREAD_ROLE.with(|r| r.get()),
        ThreadRole::Unknown,
        "this method cannot be called from a port-managed thread"
    );

    state.now.fetch_add(delta, Ordering::SeqCst);

    THREAD_ROLE.with(|role| role.set(ThreadRole::Interrupt));
    // Safety: CPU Lock inactive on this thread, an interrupt context
    unsafe { <Traits as PortToKernel>::timer_tick() };
    THREAD_ROLE.with(|role| role.set(ThreadRole::Unknown));
}

/// Park the calling task until the dispatcher schedules it again. Busy
/// tasks call this in their work loop to create a preemption point, like
/// the instruction boundaries of a real CPU.
pub fn checkpoint<Traits: PortInstance>() {
    assert!(is_task_context());
    Traits::port_state().park_until_scheduled();
}

/// Initiate graceful shutdown: [`State::port_boot`] returns, and all
/// port-managed threads park forever.
pub fn shutdown<Traits: PortInstance>() {
    log::trace!("shutdown");
    let state = Traits::port_state();
    state.sched.lock().unwrap().shutdown = true;
    state.wakeup.notify_all();
}

#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident) => {
        $vis struct $SystemTraits;

        mod port_std_impl {
            use super::$SystemTraits;
            use $crate::corax_kernel::{PortThreading, PortTimer, Task, Ticks};
            use $crate::{PortInstance, State, TaskState};

            pub(super) static PORT_STATE: State = State::new();

            unsafe impl PortInstance for $SystemTraits {
                #[inline]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }

            unsafe impl PortThreading for $SystemTraits {
                type PortTaskState = TaskState;
                #[allow(clippy::declare_interior_mutable_const)]
                const PORT_TASK_STATE_INIT: Self::PortTaskState = TaskState::new();

                unsafe fn dispatch_first_task() -> ! {
                    PORT_STATE.dispatch_first_task::<Self>()
                }

                unsafe fn yield_cpu() {
                    PORT_STATE.yield_cpu::<Self>()
                }

                unsafe fn exit_and_dispatch(task: &'static Task<Self>) -> ! {
                    PORT_STATE.exit_and_dispatch::<Self>(task)
                }

                unsafe fn enter_cpu_lock() {
                    PORT_STATE.enter_cpu_lock()
                }

                unsafe fn leave_cpu_lock() {
                    PORT_STATE.leave_cpu_lock()
                }

                unsafe fn try_enter_cpu_lock() -> bool {
                    PORT_STATE.try_enter_cpu_lock()
                }

                unsafe fn initialize_task_state(task: &'static Task<Self>) {
                    PORT_STATE.initialize_task_state::<Self>(task)
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active()
                }

                fn is_task_context() -> bool {
                    $crate::is_task_context()
                }

                fn is_interrupt_context() -> bool {
                    $crate::is_interrupt_context()
                }

                fn wait_for_interrupt() {
                    PORT_STATE.wait_for_interrupt()
                }
            }

            unsafe impl PortTimer for $SystemTraits {
                const MAX_TIMEOUT: Ticks = State::MAX_TIMEOUT;

                unsafe fn tick_count() -> Ticks {
                    PORT_STATE.tick_count()
                }

                unsafe fn pend_tick() {
                    PORT_STATE.pend_tick()
                }

                unsafe fn pend_tick_after(tick_count_delta: Ticks) {
                    PORT_STATE.pend_tick_after(tick_count_delta)
                }
            }
        }

        impl $SystemTraits {
            /// Boot the kernel and block until `corax_port_std::shutdown`
            /// is called.
            $vis fn port_boot() {
                port_std_impl::PORT_STATE.port_boot::<$SystemTraits>();
            }
        }
    };
}
