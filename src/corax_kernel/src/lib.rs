//! The Corax kernel, a preemptive, priority-driven RTOS core for
//! single-core microcontrollers.
//!
//! The kernel proper is machine-independent. Everything that touches the CPU
//! (context frames, the deferred-switch interrupt, the interrupt mask, the
//! hardware tick) is delegated to a *port* through [`PortThreading`] and
//! [`PortTimer`]. The port, in turn, drives the kernel through
//! [`PortToKernel`].
//!
//! # Kernel objects
//!
//! Every kernel object type can be constructed in place (`const fn new`, for
//! `static` storage provided by the application) or allocated at runtime from
//! the pools embedded in [`State`] (`create`, which returns `None` on pool
//! exhaustion). Objects blocked on by tasks wake their waiters with
//! [`Stopped`] when reset and [`Deleted`] when destroyed.
//!
//! [`Stopped`]: crate::error::ResultCode::Stopped
//! [`Deleted`]: crate::error::ResultCode::Deleted
//!
//! # Contexts
//!
//! A *task context* is established whenever a task's body is executing. An
//! *interrupt context* is established by the port around interrupt handlers.
//! Operations that can block the caller are usable only in a task context.
//! Operations marked *ISR-safe* never reference the current task and are
//! additionally usable in an interrupt context.
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
use core::fmt;

pub mod utils;

pub mod error;
mod klock;
mod object;
mod ring;
mod state;
mod wait;

pub mod alloc;
pub mod event_queue;
pub mod flag;
pub mod job_queue;
pub mod mailbox;
pub mod message;
pub mod mutex;
pub mod semaphore;
pub mod signal;
pub mod stream;
pub mod sync;
pub mod task;
pub mod timeout;
pub mod timer;

pub use crate::{
    error::ResultCode,
    event_queue::EventQueue,
    flag::Flag,
    job_queue::JobQueue,
    mailbox::Mailbox,
    message::MessageBuffer,
    mutex::Mutex,
    semaphore::Semaphore,
    signal::Signal,
    stream::StreamBuffer,
    task::Task,
    timer::Timer,
    utils::{BufferStorage, Init},
};

/// Unsigned integer type representing a point in time or a duration, measured
/// in kernel ticks.
///
/// The first tick is at boot. The counter is monotonic and, at 64 bits, never
/// wraps within the lifetime of a deployment.
pub type Ticks = u64;

/// Task priority. **Larger values are more urgent.**
///
/// [`IDLE_PRIORITY`] is reserved for the kernel-owned idle task; application
/// tasks use `1..`.
pub type Priority = u32;

/// The priority of the kernel-owned idle task.
pub const IDLE_PRIORITY: Priority = 0;

/// The reserved delay value meaning "do not block at all".
///
/// A blocking operation given this delay behaves like its polling variant: it
/// returns `Timeout` without touching any wait queue.
pub const IMMEDIATE: Ticks = 0;

/// The reserved delay value meaning "block indefinitely".
pub const INFINITE: Ticks = Ticks::MAX;

/// The number of task control blocks in [`State`]'s pool for
/// [`Task::create`].
pub const TASK_POOL_LEN: usize = 16;
/// The number of timer control blocks in [`State`]'s pool.
pub const TIMER_POOL_LEN: usize = 16;
/// The number of mutex control blocks in [`State`]'s pool.
pub const MUTEX_POOL_LEN: usize = 16;
/// The number of semaphore control blocks in [`State`]'s pool.
pub const SEMAPHORE_POOL_LEN: usize = 16;
/// The number of flag control blocks in [`State`]'s pool.
pub const FLAG_POOL_LEN: usize = 8;
/// The number of signal control blocks in [`State`]'s pool.
pub const SIGNAL_POOL_LEN: usize = 8;
/// The number of mailbox control blocks in [`State`]'s pool.
pub const MAILBOX_POOL_LEN: usize = 8;
/// The number of stream-buffer control blocks in [`State`]'s pool.
pub const STREAM_POOL_LEN: usize = 8;
/// The number of message-buffer control blocks in [`State`]'s pool.
pub const MESSAGE_POOL_LEN: usize = 8;
/// The number of event-queue control blocks in [`State`]'s pool.
pub const EVENT_QUEUE_POOL_LEN: usize = 8;
/// The number of job-queue control blocks in [`State`]'s pool.
pub const JOB_QUEUE_POOL_LEN: usize = 8;
/// The size in bytes of the segment heap backing dynamically created queue
/// and buffer storage.
pub const HEAP_LEN: usize = 16384;

/// Implemented by a port. Provides access to the CPU: context frames, the
/// deferred context switch, and the interrupt mask.
///
/// # Safety
///
/// These methods are only meant to be called by the kernel.
pub unsafe trait PortThreading: Sized + Send + Sync + 'static {
    /// The port-private per-task context data, stored in each
    /// [`Task`](crate::task::Task) control block.
    type PortTaskState: Send + Sync + fmt::Debug + 'static;

    /// The initial value of [`Self::PortTaskState`] for all tasks.
    const PORT_TASK_STATE_INIT: Self::PortTaskState;

    /// Transfer control to [`State::running_task`] for the first time.
    ///
    /// Precondition: CPU Lock active, Startup phase.
    unsafe fn dispatch_first_task() -> !;

    /// Request a deferred context switch. Must be idempotent: pending a
    /// switch that is already pending is a no-op. Calls made before
    /// [`Self::dispatch_first_task`] are ignored.
    ///
    /// Precondition: CPU Lock inactive.
    unsafe fn yield_cpu();

    /// Discard the current context and transfer control to
    /// [`State::running_task`].
    ///
    /// `task` is the task that held the discarded context.
    ///
    /// Precondition: CPU Lock active, Task context.
    unsafe fn exit_and_dispatch(task: &'static task::Task<Self>) -> !;

    /// Raise the interrupt mask to the kernel's critical-section ceiling.
    unsafe fn enter_cpu_lock();

    /// Restore the interrupt mask.
    unsafe fn leave_cpu_lock();

    /// Enter a CPU Lock state, returning `false` if it was already active.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Prepare the task's context so that its next dispatch enters the
    /// kernel's [entry loop](crate::task::entry_loop).
    ///
    /// Precondition: CPU Lock active; the task is stopped.
    unsafe fn initialize_task_state(task: &'static task::Task<Self>);

    /// Return a flag indicating whether a CPU Lock state is active.
    fn is_cpu_lock_active() -> bool;

    /// Return a flag indicating whether a task context is active.
    fn is_task_context() -> bool;

    /// Return a flag indicating whether an interrupt context is active.
    fn is_interrupt_context() -> bool;

    /// Called by the idle task in a loop. A hardware port would execute a
    /// wait-for-interrupt instruction here.
    fn wait_for_interrupt();
}

/// Implemented by a port. Provides access to the hardware tick source.
///
/// Two styles of port are supported:
///
///  - A *ticked* port calls [`PortToKernel::timer_tick`] at a fixed rate and
///    implements [`Self::pend_tick_after`] as a no-op.
///  - A *tick-less* port lets the counter run free and arms a one-shot alarm
///    in [`Self::pend_tick_after`]; the kernel re-arms it after every timing
///    list mutation.
///
/// # Safety
///
/// These methods are only meant to be called by the kernel.
pub unsafe trait PortTimer: Sized + 'static {
    /// The longest interval the port can reliably program into its alarm.
    /// The kernel never passes a larger value to [`Self::pend_tick_after`].
    const MAX_TIMEOUT: Ticks;

    /// Read the monotonic tick counter.
    ///
    /// Precondition: CPU Lock active.
    unsafe fn tick_count() -> Ticks;

    /// Pend a call to [`PortToKernel::timer_tick`] as soon as possible.
    ///
    /// Precondition: CPU Lock active.
    unsafe fn pend_tick();

    /// Pend a call to [`PortToKernel::timer_tick`] in `delta` ticks.
    /// Ticked ports may implement this as a no-op.
    ///
    /// Precondition: CPU Lock active.
    unsafe fn pend_tick_after(delta: Ticks);
}

/// Attaches the application-side configuration (the kernel state storage,
/// the startup hook, and the scheduling options) to a port trait type.
pub trait KernelCfg: PortThreading {
    /// The startup hook, called in the boot context (CPU Lock inactive)
    /// before the first task is dispatched. This is where the application
    /// starts its initial tasks.
    const STARTUP_HOOK: fn();

    /// The round-robin time slice, in ticks, shared among equal-priority
    /// tasks. Zero disables round-robin scheduling.
    const TIME_SLICE: Ticks;

    /// Access the kernel-global state.
    fn state() -> &'static State<Self>;
}

/// A combined trait bound for a fully-configured kernel trait type.
pub trait KernelTraits: PortThreading + PortTimer + KernelCfg + 'static {}
impl<T: PortThreading + PortTimer + KernelCfg + 'static> KernelTraits for T {}

/// Global kernel state.
///
/// The application instantiates exactly one `State` per kernel trait type
/// (usually through the port's wiring macro) and returns it from
/// [`KernelCfg::state`].
pub struct State<Traits: PortThreading> {
    /// The currently running task. `None` during the startup phase.
    running_task: klock::CpuLockCell<Traits, Option<&'static task::Task<Traits>>>,

    /// Tasks in the Ready state, sorted by descending effective priority.
    task_ready_queue: task::readyqueue::ReadyQueue<Traits>,

    /// Timekeeping: the timing list and round-robin accounting.
    timeout: timeout::TimeoutGlobals<Traits>,

    /// The kernel-owned idle task. Always startable, lowest priority.
    idle_task: task::Task<Traits>,

    /// Storage for dynamically created kernel objects.
    task_pool: [task::Task<Traits>; TASK_POOL_LEN],
    timer_pool: [timer::Timer<Traits>; TIMER_POOL_LEN],
    mutex_pool: [mutex::Mutex<Traits>; MUTEX_POOL_LEN],
    semaphore_pool: [semaphore::Semaphore<Traits>; SEMAPHORE_POOL_LEN],
    flag_pool: [flag::Flag<Traits>; FLAG_POOL_LEN],
    signal_pool: [signal::Signal<Traits>; SIGNAL_POOL_LEN],
    mailbox_pool: [mailbox::Mailbox<Traits>; MAILBOX_POOL_LEN],
    stream_pool: [stream::StreamBuffer<Traits>; STREAM_POOL_LEN],
    message_pool: [message::MessageBuffer<Traits>; MESSAGE_POOL_LEN],
    event_queue_pool: [event_queue::EventQueue<Traits>; EVENT_QUEUE_POOL_LEN],
    job_queue_pool: [job_queue::JobQueue<Traits>; JOB_QUEUE_POOL_LEN],

    /// The segment heap backing dynamically created queue/buffer storage.
    heap: alloc::SegHeap<Traits>,
}

impl<Traits: PortThreading> utils::Init for State<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        running_task: utils::Init::INIT,
        task_ready_queue: utils::Init::INIT,
        timeout: utils::Init::INIT,
        idle_task: task::Task::new_idle(),
        task_pool: utils::Init::INIT,
        timer_pool: utils::Init::INIT,
        mutex_pool: utils::Init::INIT,
        semaphore_pool: utils::Init::INIT,
        flag_pool: utils::Init::INIT,
        signal_pool: utils::Init::INIT,
        mailbox_pool: utils::Init::INIT,
        stream_pool: utils::Init::INIT,
        message_pool: utils::Init::INIT,
        event_queue_pool: utils::Init::INIT,
        job_queue_pool: utils::Init::INIT,
        heap: utils::Init::INIT,
    };
}

impl<Traits: PortThreading> State<Traits> {
    /// A const initializer, for use in a `static` item.
    #[allow(clippy::declare_interior_mutable_const)]
    pub const INIT: Self = <Self as utils::Init>::INIT;

    /// Get the currently running task.
    pub(crate) fn running_task(
        &self,
        lock: klock::CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static task::Task<Traits>> {
        self.running_task.get(&*lock)
    }
}

impl<Traits: PortThreading> fmt::Debug for State<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("State").finish_non_exhaustive()
    }
}

/// Implemented by the kernel. The port calls these methods to drive the
/// kernel.
///
/// # Safety
///
/// These methods are only meant to be called by the port.
pub unsafe trait PortToKernel {
    /// Initialize the kernel, run the startup hook, and dispatch the first
    /// task.
    ///
    /// Precondition: CPU Lock active, Startup phase.
    unsafe fn boot() -> !;

    /// Determine the next task to run and update [`State::running_task`].
    ///
    /// Precondition: CPU Lock active.
    unsafe fn choose_running_task();

    /// Advance the kernel clock: process due timeouts, fire timers, account
    /// the round-robin slice, and re-arm the alarm.
    ///
    /// Precondition: CPU Lock inactive, an interrupt context.
    unsafe fn timer_tick();
}

unsafe impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn boot() -> ! {
        // Safety: CPU Lock is active on entry, per this method's precondition
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };

        timeout::init::<Traits>(lock.borrow_mut());
        task::init_idle_task::<Traits>(lock.borrow_mut());

        // The startup hook runs with CPU Lock inactive so that it can use the
        // normal object construction APIs.
        drop(lock);
        (Traits::STARTUP_HOOK)();

        let mut lock = klock::lock_cpu::<Traits>()
            .expect("the startup hook returned with CPU Lock active");
        task::choose_next_running_task::<Traits>(lock.borrow_mut());

        // `dispatch_first_task` wants CPU Lock active; hand our lock over to
        // the dispatcher.
        core::mem::forget(lock);

        // Safety: CPU Lock active, Startup phase
        unsafe { Traits::dispatch_first_task() }
    }

    unsafe fn choose_running_task() {
        // Safety: CPU Lock is active on entry, per this method's precondition
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
        task::choose_next_running_task::<Traits>(lock.borrow_mut());

        // The port owns the CPU Lock state here; don't touch it on exit.
        core::mem::forget(lock);
    }

    unsafe fn timer_tick() {
        timeout::handle_tick::<Traits>();
    }
}

/// Attach the application-side configuration to a port trait type:
/// instantiates the kernel state storage and implements [`KernelCfg`].
///
/// ```rust,ignore
/// corax_port_std::use_port!(unsafe struct SystemTraits);
/// corax_kernel::configure_kernel! {
///     SystemTraits {
///         startup_hook: my_startup,
///         time_slice: 0,
///     }
/// }
/// ```
#[macro_export]
macro_rules! configure_kernel {
    ($Traits:ty {
        startup_hook: $hook:expr,
        time_slice: $slice:expr $(,)?
    }) => {
        const _: () = {
            static KERNEL_STATE: $crate::State<$Traits> = $crate::State::INIT;

            impl $crate::KernelCfg for $Traits {
                const STARTUP_HOOK: fn() = $hook;
                const TIME_SLICE: $crate::Ticks = $slice;

                #[inline(always)]
                fn state() -> &'static $crate::State<Self> {
                    &KERNEL_STATE
                }
            }
        };
    };
}

/// Get the current kernel time in ticks.
///
/// Returns `BadContext` if CPU Lock is active.
pub fn time<Traits: KernelTraits>() -> Result<Ticks, error::BadContextError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    Ok(timeout::system_time::<Traits>(lock.borrow_mut()))
}

/// Get the currently scheduled task, leaving the CPU Lock state untouched.
///
/// This is only meant to be used by a port while implementing a dispatcher.
///
/// # Safety
///
/// CPU Lock must be active.
pub unsafe fn running_task<Traits: KernelTraits>() -> Option<&'static task::Task<Traits>> {
    // Safety: CPU Lock is active, per this function's precondition
    let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
    let task = Traits::state().running_task(lock.borrow_mut());
    // The port owns the CPU Lock state here; don't touch it on exit.
    core::mem::forget(lock);
    task
}

/// Get the currently scheduled task, as last decided by the dispatcher.
///
/// This is a diagnostic interface: the returned reference is a snapshot and
/// may be outdated by the time the caller inspects it. Returns `None` during
/// the startup phase. Returns `BadContext` if CPU Lock is active.
pub fn scheduled_task<Traits: KernelTraits>(
) -> Result<Option<&'static task::Task<Traits>>, error::BadContextError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    Ok(Traits::state().running_task(lock.borrow_mut()))
}
