//! Tasks
//!
//! A task is a unit of execution with its own context and priority. Tasks
//! are created either in application-provided statics ([`Task::new`]) or
//! from the kernel pool ([`Task::create`]), started with [`Task::start`],
//! and terminated by [`Task::stop`], [`exit_task`], [`Task::reset`], or
//! [`Task::destroy`].
//!
//! Returning from a task's entry function re-enters the same function; the
//! kernel provides the enclosing infinite loop ([`entry_loop`]).
use core::{convert::Infallible, fmt};

use crate::{
    error::{
        BadContextError, ExitTaskError, FlipTaskError, JoinError, ResetTaskError,
        ResumeTaskError, SetTaskPriorityError, SleepError, StartTaskError, StopTaskError,
        SuspendError, WaitTimeoutError,
    },
    klock, mutex,
    object::{self, KernelObject, Obj},
    state, timeout,
    utils::Init,
    wait::{self, TaskWait, WaitPayload},
    KernelTraits, PortThreading, Priority, Ticks, IDLE_PRIORITY, INFINITE,
};

pub(crate) mod readyqueue;

/// The entry function of a task and its parameter.
#[derive(Clone, Copy, Debug)]
pub(super) struct TaskEntry {
    pub(super) entry: fn(usize),
    pub(super) param: usize,
}

fn unconfigured_entry(_: usize) {}

/// Task state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum TaskSt {
    /// Just created, exited, or reset. Not schedulable.
    Stopped,
    /// In the ready queue, runnable.
    Ready,
    /// Executing on the processor.
    Running,
    /// Blocked on a wait queue, a sleep, or a park.
    Waiting,
}

impl Init for TaskSt {
    const INIT: Self = Self::Stopped;
}

/// Per-task signal state: a pending set, a delivery mask, and an optional
/// action handler.
pub(super) struct TaskSig<Traits: PortThreading> {
    pending: klock::CpuLockCell<Traits, u32>,
    mask: klock::CpuLockCell<Traits, u32>,
    action: klock::CpuLockCell<Traits, Option<fn(u32)>>,
}

impl<Traits: PortThreading> Init for TaskSig<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        pending: Init::INIT,
        mask: Init::INIT,
        action: Init::INIT,
    };
}

/// *Task control block*: the state data of a task, embedding the common
/// object header (whose wait queue holds the task's joiners) and the timing
/// list header.
///
/// `port_task_state` is placed at the beginning of the struct so that
/// assembler code can refer to it easily.
#[repr(C)]
pub struct Task<Traits: PortThreading> {
    /// The port-private context data.
    pub port_task_state: Traits::PortTaskState,

    pub(super) obj: Obj<Traits>,
    pub(super) hdr: timeout::Hdr<Traits>,

    pub(super) entry: klock::CpuLockCell<Traits, TaskEntry>,

    /// The statically assigned priority.
    pub(super) base_priority: klock::CpuLockCell<Traits, Priority>,

    /// The effective priority: `base_priority`, possibly raised by priority
    /// inheritance or a priority ceiling, restored on release.
    pub(super) effective_priority: klock::CpuLockCell<Traits, Priority>,

    pub(super) st: klock::CpuLockCell<Traits, TaskSt>,

    /// Remaining round-robin quantum.
    pub(super) slice: klock::CpuLockCell<Traits, Ticks>,

    /// Links the task into the ready queue.
    pub(super) ready_next: klock::CpuLockCell<Traits, Option<&'static Task<Traits>>>,

    /// The wait state of the task.
    pub(super) wait: TaskWait<Traits>,

    /// The last mutex locked by the task. Heads a linked list threaded
    /// through [`mutex::Mutex::prev_mutex_held`].
    pub(super) last_mutex_held: klock::CpuLockCell<Traits, Option<&'static mutex::Mutex<Traits>>>,

    /// The mutex this task is blocked on, used for walking priority
    /// inheritance chains. `None` when not waiting on a mutex.
    pub(super) waiting_mutex: klock::CpuLockCell<Traits, Option<&'static mutex::Mutex<Traits>>>,

    /// `true` if the task self-destructs on termination instead of lingering
    /// for a joiner.
    pub(super) detached: klock::CpuLockCell<Traits, bool>,

    pub(super) sig: TaskSig<Traits>,
}

impl<Traits: PortThreading> Task<Traits> {
    /// Construct a task in place, for `static` storage provided by the
    /// application.
    ///
    /// `priority` must not be [`IDLE_PRIORITY`], which is reserved for the
    /// kernel-owned idle task.
    pub const fn new(priority: Priority, entry: fn(usize), param: usize) -> Self {
        assert!(
            priority > IDLE_PRIORITY,
            "priority 0 is reserved for the idle task"
        );
        Self::with_obj(Obj::new_static(), priority, entry, param)
    }

    pub(super) const fn new_idle() -> Self {
        Self::with_obj(Obj::new_static(), IDLE_PRIORITY, idle_entry::<Traits>, 0)
    }

    const fn with_obj(obj: Obj<Traits>, priority: Priority, entry: fn(usize), param: usize) -> Self {
        Self {
            port_task_state: Traits::PORT_TASK_STATE_INIT,
            obj,
            hdr: timeout::Hdr::new(),
            entry: klock::CpuLockCell::new(TaskEntry { entry, param }),
            base_priority: klock::CpuLockCell::new(priority),
            effective_priority: klock::CpuLockCell::new(priority),
            st: Init::INIT,
            slice: Init::INIT,
            ready_next: Init::INIT,
            wait: Init::INIT,
            last_mutex_held: Init::INIT,
            waiting_mutex: Init::INIT,
            detached: Init::INIT,
            sig: Init::INIT,
        }
    }
}

impl<Traits: PortThreading> Init for Task<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::with_obj(Obj::new_free(), 1, unconfigured_entry, 0);
}

impl<Traits: PortThreading> KernelObject<Traits> for Task<Traits> {
    fn obj(&self) -> &Obj<Traits> {
        &self.obj
    }
}

impl<Traits: PortThreading> fmt::Debug for Task<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Task")
            .field("self", &(self as *const _))
            .finish_non_exhaustive()
    }
}

/// The entry function of the kernel-owned idle task.
fn idle_entry<Traits: PortThreading>(_: usize) {
    loop {
        Traits::wait_for_interrupt();
    }
}

/// The outermost frame of every task: calls the task's entry function in a
/// loop, so that returning from the entry function re-enters it.
///
/// This function is only meant to be called by a port, as the target of the
/// initial task context.
pub fn entry_loop<Traits: KernelTraits>(task: &'static Task<Traits>) -> ! {
    loop {
        let entry = {
            let lock = klock::lock_cpu::<Traits>()
                .expect("task entry reached with CPU Lock active");
            task.entry.get(&*lock)
        };
        (entry.entry)(entry.param);
    }
}

impl<Traits: KernelTraits> Task<Traits> {
    /// Allocate and construct a task from the kernel pool. Returns `None` on
    /// pool exhaustion.
    pub fn create(priority: Priority, entry: fn(usize), param: usize) -> Option<&'static Self> {
        if priority == IDLE_PRIORITY {
            return None;
        }
        let mut lock = klock::lock_cpu::<Traits>().ok()?;
        let task = object::allocate_from_pool(&Traits::state().task_pool[..], lock.borrow_mut())?;
        task.entry
            .replace(&mut *lock, TaskEntry { entry, param });
        task.base_priority.replace(&mut *lock, priority);
        task.effective_priority.replace(&mut *lock, priority);
        task.detached.replace(&mut *lock, false);
        Some(task)
    }

    /// Make the task runnable.
    ///
    /// The task context is (re-)initialized so that execution begins at the
    /// task's entry function.
    pub fn start(&'static self) -> Result<(), StartTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        if self.st.get(&*lock) != TaskSt::Stopped {
            return Err(StartTaskError::BadObjectState);
        }

        self.sig.pending.replace(&mut *lock, 0);
        let base = self.base_priority.get(&*lock);
        self.effective_priority.replace(&mut *lock, base);

        // Safety: CPU Lock active, the task is stopped
        unsafe { Traits::initialize_task_state(self) };

        // Safety: The previous state is Stopped, and we just initialized the
        // task context
        unsafe { make_ready(lock.borrow_mut(), self) };

        // If `self` has a higher priority, perform a context switch.
        unlock_cpu_and_check_preemption(lock);

        Ok(())
    }

    /// Terminate the task.
    ///
    /// Joiners are woken with a successful result. If the task is detached,
    /// its storage is retired as if by [`Task::destroy`]. Stopping the
    /// currently running task does not return.
    pub fn stop(&'static self) -> Result<(), StopTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        if is_current(lock.borrow_mut(), self) {
            exit_current_task(lock, Ok(()));
        }

        if self.st.get(&*lock) == TaskSt::Stopped {
            return Err(StopTaskError::BadObjectState);
        }

        terminate_task(lock.borrow_mut(), self, Ok(()));
        if self.detached.get(&*lock) {
            self.obj.finalize(lock.borrow_mut());
        }
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Forcibly return the task to its initial (stopped) state.
    ///
    /// All mutexes held by the task are released (robust ones are marked
    /// inconsistent) and its joiners are woken with `Stopped`. Resetting
    /// the currently running task does not return.
    pub fn reset(&'static self) -> Result<(), ResetTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        if is_current(lock.borrow_mut(), self) {
            exit_current_task(lock, Err(WaitTimeoutError::Stopped));
        }

        terminate_task(lock.borrow_mut(), self, Err(WaitTimeoutError::Stopped));
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// [`Task::reset`], plus the task's storage is retired: a pooled task's
    /// slot is returned, a static task is permanently marked released.
    ///
    /// Joiners are woken with `Deleted` if the task is pooled, `Stopped`
    /// otherwise. Destroying the currently running task does not return.
    pub fn destroy(&'static self) -> Result<(), ResetTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let joiner_result = if self.obj.is_pooled(lock.borrow_mut()) {
            Err(WaitTimeoutError::Deleted)
        } else {
            Err(WaitTimeoutError::Stopped)
        };

        if is_current(lock.borrow_mut(), self) {
            // The exit path retires the storage of a detached task.
            self.detached.replace(&mut *lock, true);
            exit_current_task(lock, joiner_result);
        }

        terminate_task(lock.borrow_mut(), self, joiner_result);
        self.obj.finalize(lock.borrow_mut());
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Mark the task as detached: on termination it self-destructs instead
    /// of lingering for a joiner.
    pub fn detach(&'static self) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        self.detached.replace(&mut *lock, true);
        if self.st.get(&*lock) == TaskSt::Stopped {
            // Already terminated; retire the storage now.
            self.obj.finalize(lock.borrow_mut());
        }
        Ok(())
    }

    /// Wait until the task terminates.
    ///
    /// On success, a pooled task's slot is returned to the pool. Joining a
    /// static task leaves it stopped and restartable.
    pub fn join(&'static self) -> Result<(), JoinError> {
        self.join_for(INFINITE)
    }

    /// [`Task::join`] with a timeout.
    pub fn join_for(&'static self, delay: Ticks) -> Result<(), JoinError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        if self.detached.get(&*lock) {
            return Err(JoinError::BadObjectState);
        }
        if is_current(lock.borrow_mut(), self) {
            return Err(JoinError::WouldDeadlock);
        }

        if self.st.get(&*lock) != TaskSt::Stopped {
            self.obj
                .wait_queue
                .wait_timeout(lock.borrow_mut(), WaitPayload::Join, delay)
                .map_err(JoinError::from)
                .map(|_| ())?;
        }

        if self.obj.is_pooled(lock.borrow_mut()) {
            self.obj.finalize(lock.borrow_mut());
        }
        return_to_task(lock);
        Ok(())
    }

    /// [`Task::join`] with an absolute deadline.
    pub fn join_until(&'static self, time: Ticks) -> Result<(), JoinError> {
        self.join_for(delay_until::<Traits>(time)?)
    }

    /// Forcibly suspend a Ready task, or park the current task (equivalent
    /// to [`suspend`]).
    ///
    /// The suspension is indefinite; [`Task::resume`] ends it.
    pub fn suspend(&'static self) -> Result<(), SuspendError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        if is_current(lock.borrow_mut(), self) {
            drop(lock);
            return suspend::<Traits>();
        }

        if self.st.get(&*lock) != TaskSt::Ready {
            return Err(SuspendError::BadContext);
        }

        // Move the task from Ready into an indefinite, queue-less wait, as
        // if it had parked itself.
        let was_linked = Traits::state()
            .task_ready_queue
            .remove_task(lock.borrow_mut(), self);
        debug_assert!(was_linked);
        self.st.replace(&mut *lock, TaskSt::Waiting);
        wait::prepare_forced_park(lock.borrow_mut(), self);
        Ok(())
    }

    /// Resume the task iff it is currently suspended (blocked indefinitely
    /// on its park).
    ///
    /// *ISR-safe.*
    pub fn resume(&'static self) -> Result<(), ResumeTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        if wait::release_forced_park(lock.borrow_mut(), self).is_ok() {
            unlock_cpu_and_check_preemption(lock);
            return Ok(());
        }

        let is_parked = wait::with_current_wait_payload(lock.borrow_mut(), self, |payload| {
            matches!(payload, Some(WaitPayload::Park))
        });

        if !is_parked {
            return Err(ResumeTaskError::BadObjectState);
        }

        // We confirmed the task is parked, so this can't fail.
        wait::interrupt_task(lock.borrow_mut(), self, Ok(())).unwrap();
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Update the task's base priority.
    ///
    /// The effective priority is re-evaluated against the mutexes the task
    /// holds; if the task is blocked on a mutex, the inheritance chain is
    /// re-propagated.
    pub fn set_priority(&'static self, priority: Priority) -> Result<(), SetTaskPriorityError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        if priority == IDLE_PRIORITY {
            return Err(SetTaskPriorityError::BadParam);
        }
        let st = self.st.get(&*lock);
        if st == TaskSt::Stopped {
            return Err(SetTaskPriorityError::BadObjectState);
        }

        // Raising the priority above the ceiling of a held mutex would
        // violate the ceiling protocol's precondition.
        if !mutex::held_mutexes_allow_base_priority(lock.borrow_mut(), self, priority) {
            return Err(SetTaskPriorityError::BadParam);
        }

        self.base_priority.replace(&mut *lock, priority);

        // Re-evaluate the effective priority against held mutexes.
        let effective = mutex::evaluate_task_effective_priority(lock.borrow_mut(), self, priority);
        let old_effective = self.effective_priority.replace(&mut *lock, effective);

        if old_effective != effective {
            match st {
                TaskSt::Ready => {
                    Traits::state()
                        .task_ready_queue
                        .reorder_task(lock.borrow_mut(), self);
                }
                TaskSt::Running => {}
                TaskSt::Waiting => {
                    wait::reorder_wait_of_task(lock.borrow_mut(), self);
                }
                TaskSt::Stopped => unreachable!(),
            }
        }

        // If the task is blocked on a mutex, the owner's inherited priority
        // follows the waiter's in both directions.
        if let Some(mtx) = self.waiting_mutex.get(&*lock) {
            mutex::on_waiter_priority_changed(lock.borrow_mut(), self, mtx);
        }

        if let TaskSt::Running | TaskSt::Ready = st {
            unlock_cpu_and_check_preemption(lock);
        }
        Ok(())
    }

    /// Get the task's base priority.
    pub fn base_priority(&'static self) -> Result<Priority, BadContextError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.base_priority.get(&*lock))
    }

    /// Get the task's effective priority.
    pub fn effective_priority(&'static self) -> Result<Priority, BadContextError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.effective_priority.get(&*lock))
    }

    /// Mark signal `signo` (`0..32`) pending for this task.
    ///
    /// Pending unmasked signals run the task's action handler, in the
    /// task's own context, at its next kernel exit point.
    ///
    /// *ISR-safe.*
    pub fn raise(&'static self, signo: u32) -> Result<(), BadContextError> {
        debug_assert!(signo < 32);
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let pending = self.sig.pending.get(&*lock);
        self.sig.pending.replace(&mut *lock, pending | (1 << signo));
        Ok(())
    }

    /// Install or remove the task's signal action handler.
    pub fn set_signal_action(&'static self, action: Option<fn(u32)>) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());
        self.sig.action.replace(&mut *lock, action);
        Ok(())
    }

    /// Set the task's signal mask. Masked signals stay pending without being
    /// delivered.
    pub fn set_signal_mask(&'static self, mask: u32) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());
        self.sig.mask.replace(&mut *lock, mask);
        Ok(())
    }

    /// Get the currently running task.
    pub fn current() -> Result<&'static Task<Traits>, BadContextError> {
        state::expect_task_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        Ok(Traits::state().running_task(lock.borrow_mut()).unwrap())
    }
}

/// Compute the relative delay corresponding to the absolute deadline `time`,
/// saturating at zero (which is [`IMMEDIATE`](crate::IMMEDIATE)).
pub(super) fn delay_until<Traits: KernelTraits>(time: Ticks) -> Result<Ticks, BadContextError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let now = timeout::system_time::<Traits>(lock.borrow_mut());
    Ok(time.saturating_sub(now))
}

/// Terminate the current task. Does not return unless the current context
/// disallows it.
///
/// `Task::stop` on the current task is equivalent.
pub fn exit_task<Traits: KernelTraits>() -> Result<Infallible, ExitTaskError> {
    if !Traits::is_task_context() {
        return Err(ExitTaskError::BadContext);
    }

    // If CPU Lock is inactive, activate it.
    let lock = unsafe {
        if !Traits::is_cpu_lock_active() {
            Traits::enter_cpu_lock();
        }
        klock::assume_cpu_lock::<Traits>()
    };

    exit_current_task(lock, Ok(()))
}

/// The common exit path of the currently running task.
fn exit_current_task<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
    joiner_result: Result<(), WaitTimeoutError>,
) -> ! {
    let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();

    // Abandon held mutexes, waking up their next waiters (if any)
    mutex::abandon_held_mutexes(lock.borrow_mut(), running_task);
    debug_assert!(running_task.last_mutex_held.read(&*lock).is_none());

    running_task
        .obj
        .wait_queue
        .wake_up_all(lock.borrow_mut(), joiner_result);

    assert_eq!(*running_task.st.read(&*lock), TaskSt::Running);
    running_task.st.replace(&mut *lock, TaskSt::Stopped);

    if running_task.detached.get(&*lock) {
        running_task.obj.finalize(lock.borrow_mut());
    }

    // Erase `running_task`
    Traits::state().running_task.replace(&mut *lock, None);

    core::mem::forget(lock);

    // Safety: (1) The stack of the exiting task will not be touched again.
    // (2) CPU Lock active
    unsafe { Traits::exit_and_dispatch(running_task) }
}

/// Terminate a task that is not the currently running one.
fn terminate_task<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: &'static Task<Traits>,
    joiner_result: Result<(), WaitTimeoutError>,
) {
    match task.st.get(&*lock) {
        TaskSt::Stopped => {}
        TaskSt::Ready => {
            let was_linked = Traits::state()
                .task_ready_queue
                .remove_task(lock.borrow_mut(), task);
            debug_assert!(was_linked);
        }
        TaskSt::Waiting => {
            wait::detach_waiting_task(lock.borrow_mut(), task);

            // Leaving a mutex's wait queue may deflate the owner's inherited
            // priority.
            if let Some(mtx) = task.waiting_mutex.get(&*lock) {
                task.waiting_mutex.replace(&mut *lock, None);
                mutex::reevaluate_owner_chain(lock.borrow_mut(), mtx);
            }
        }
        // The running task takes the `exit_current_task` path instead.
        TaskSt::Running => unreachable!(),
    }

    mutex::abandon_held_mutexes(lock.borrow_mut(), task);
    task.obj.wait_queue.wake_up_all(lock.borrow_mut(), joiner_result);
    task.sig.pending.replace(&mut *lock, 0);
    task.st.replace(&mut *lock, TaskSt::Stopped);
}

#[inline]
fn is_current<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: &'static Task<Traits>,
) -> bool {
    match Traits::state().running_task(lock.borrow_mut()) {
        Some(t) => core::ptr::eq(t, task) && task.st.get(&*lock) == TaskSt::Running,
        None => false,
    }
}

/// Initialize and ready the kernel-owned idle task at boot time.
pub(super) fn init_idle_task<Traits: KernelTraits>(mut lock: klock::CpuLockTokenRefMut<'_, Traits>) {
    let idle = &Traits::state().idle_task;

    // Safety: CPU Lock active, the task is stopped
    unsafe { Traits::initialize_task_state(idle) };
    // Safety: Ditto
    unsafe { make_ready(lock.borrow_mut(), idle) };
}

/// Transition the task into the Ready state.
///
/// # Safety
///
/// If the previous state is `Stopped`, the caller must initialize the task
/// context first by calling `initialize_task_state`.
pub(super) unsafe fn make_ready<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: &'static Task<Traits>,
) {
    task.st.replace(&mut *lock, TaskSt::Ready);
    Traits::state()
        .task_ready_queue
        .push_back_task(lock.borrow_mut(), task);
}

/// Relinquish CPU Lock. After that, if there's a higher-priority task than
/// the running one, call `Port::yield_cpu`.
///
/// System services that transition a task into the Ready state should call
/// this before returning to the caller.
pub(super) fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
) {
    let running_priority = Traits::state()
        .running_task(lock.borrow_mut())
        .filter(|t| t.st.get(&*lock) == TaskSt::Running)
        .map(|t| t.effective_priority.get(&*lock));

    let has_preempting_task = Traits::state()
        .task_ready_queue
        .has_preempting_task(lock.borrow_mut(), running_priority);

    // Relinquish CPU Lock
    drop(lock);

    if has_preempting_task {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }
}

/// The common exit of every potentially-blocking operation: deliver the
/// current task's unmasked pending signals (running the action handler in
/// the task's own context, with CPU Lock inactive), then relinquish CPU
/// Lock, yielding if the operation readied a higher-priority task.
pub(super) fn return_to_task<Traits: KernelTraits>(mut lock: klock::CpuLockGuard<Traits>) {
    if Traits::is_task_context() {
        loop {
            let Some(task) = Traits::state().running_task(lock.borrow_mut()) else { break };

            let deliverable =
                task.sig.pending.get(&*lock) & !task.sig.mask.get(&*lock);
            let Some(action) = task.sig.action.get(&*lock) else { break };
            if deliverable == 0 {
                break;
            }

            let signo = deliverable.trailing_zeros();
            let pending = task.sig.pending.get(&*lock);
            task.sig.pending.replace(&mut *lock, pending & !(1 << signo));

            drop(lock);
            action(signo);
            lock = match klock::lock_cpu::<Traits>() {
                Ok(lock) => lock,
                Err(_) => return,
            };
        }
    }

    unlock_cpu_and_check_preemption(lock);
}

/// Implements `PortToKernel::choose_running_task`.
#[inline]
pub(super) fn choose_next_running_task<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    // The priority of the task that will keep running unless preempted
    let prev_running_task = Traits::state().running_task(lock.borrow_mut());
    let prev_task_priority = prev_running_task
        .filter(|t| t.st.get(&*lock) == TaskSt::Running)
        .map(|t| t.effective_priority.get(&*lock));

    let decision = Traits::state()
        .task_ready_queue
        .pop_front_task(lock.borrow_mut(), prev_task_priority);

    let next_running_task = match decision {
        readyqueue::ScheduleDecision::SwitchTo(task) => task,
        // There's no task willing to take over the current one, and the
        // current one can still run.
        readyqueue::ScheduleDecision::Keep => return,
    };

    if let Some(task) = next_running_task {
        // Transition `next_running_task` into the Running state
        task.st.replace(&mut *lock, TaskSt::Running);
        task.slice.replace(&mut *lock, Traits::TIME_SLICE);

        if let Some(prev) = prev_running_task {
            if core::ptr::eq(prev, task) {
                // Skip the remaining steps if the decision was to keep
                // running the task that was just rotated out and back in.
                return;
            }
        }
    }

    // `prev_running_task` now loses control of the processor.
    if let Some(running_task) = prev_running_task {
        match running_task.st.get(&*lock) {
            TaskSt::Running => {
                // Safety: The previous state is Running, so the context is
                // valid
                unsafe { make_ready(lock.borrow_mut(), running_task) };
            }
            // Stays in whatever state a kernel service left it in.
            TaskSt::Waiting | TaskSt::Ready | TaskSt::Stopped => {}
        }
    }

    Traits::state()
        .running_task
        .replace(&mut *lock, next_running_task);
}

/// Transition the currently running task into the Waiting state. Returns
/// when woken up.
///
/// The current context must be waitable (this function doesn't check that).
pub(super) fn wait_until_woken_up<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    debug_assert_eq!(state::expect_waitable_context::<Traits>(), Ok(()));

    // Transition the current task to Waiting
    let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();
    assert_eq!(*running_task.st.read(&*lock), TaskSt::Running);
    running_task.st.replace(&mut *lock, TaskSt::Waiting);

    loop {
        // Temporarily release CPU Lock while the dispatcher runs other
        // tasks. The port brings us back here when this task is scheduled
        // again.
        // Safety: (1) We don't access resources protected by CPU Lock.
        //         (2) We currently have CPU Lock.
        //         (3) We will re-acquire CPU Lock before returning from this
        //             function.
        unsafe { Traits::leave_cpu_lock() };

        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };

        // Re-acquire CPU Lock
        unsafe { Traits::enter_cpu_lock() };

        if *running_task.st.read(&*lock) == TaskSt::Running {
            break;
        }

        // Still Waiting, or woken up but immediately preempted (Ready)
        // before this context observed it.
        debug_assert!(matches!(
            *running_task.st.read(&*lock),
            TaskSt::Waiting | TaskSt::Ready
        ));
    }
}

/// Charge `elapsed` ticks against the running task's round-robin quantum.
/// On expiry, if another task of equal priority is ready, rotate the running
/// task to the tail of its priority group.
///
/// Called from the tick handler; the caller is responsible for requesting a
/// dispatch afterwards (`unlock_cpu_and_check_preemption`).
pub(super) fn charge_time_slice<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    elapsed: Ticks,
) {
    if Traits::TIME_SLICE == 0 || elapsed == 0 {
        return;
    }
    let Some(running_task) = Traits::state().running_task(lock.borrow_mut()) else { return };
    if running_task.st.get(&*lock) != TaskSt::Running {
        return;
    }

    let slice = running_task.slice.get(&*lock);
    if slice > elapsed {
        running_task.slice.replace(&mut *lock, slice - elapsed);
        return;
    }

    // The quantum is exhausted.
    running_task.slice.replace(&mut *lock, Traits::TIME_SLICE);

    let prio = running_task.effective_priority.get(&*lock);
    if Traits::state()
        .task_ready_queue
        .has_ready_task_at_priority(lock.borrow_mut(), prio)
    {
        // Rotate: re-enter the ready queue behind the equal-priority peers.
        // The dispatch requested by the tick handler elects the next peer.
        // Safety: The previous state is Running, so the context is valid
        unsafe { make_ready(lock.borrow_mut(), running_task) };
    }
}

/// The remaining round-robin quantum of the running task, if rotation is
/// currently possible. Used to clamp the tick-less alarm.
pub(super) fn time_slice_remaining<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> Option<Ticks> {
    if Traits::TIME_SLICE == 0 {
        return None;
    }
    let running_task = Traits::state().running_task(lock.borrow_mut())?;
    if running_task.st.get(&*lock) != TaskSt::Running {
        return None;
    }
    let prio = running_task.effective_priority.get(&*lock);
    if Traits::state()
        .task_ready_queue
        .has_ready_task_at_priority(lock.borrow_mut(), prio)
    {
        Some(running_task.slice.get(&*lock).max(1))
    } else {
        None
    }
}

/// Restart the current task with a new entry function.
///
/// The current context is discarded; execution restarts at `entry` with a
/// fresh context. Fails with `BadObjectState` if the caller holds any
/// mutexes, since restarting would leak their ownership.
pub fn flip<Traits: KernelTraits>(
    entry: fn(usize),
    param: usize,
) -> Result<Infallible, FlipTaskError> {
    if !Traits::is_task_context() {
        return Err(FlipTaskError::BadContext);
    }
    let mut lock = klock::lock_cpu::<Traits>()?;
    let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();

    if running_task.last_mutex_held.get(&*lock).is_some() {
        return Err(FlipTaskError::BadObjectState);
    }

    running_task
        .entry
        .replace(&mut *lock, TaskEntry { entry, param });

    // Discard the current context and re-enter through a fresh one.
    running_task.st.replace(&mut *lock, TaskSt::Ready);
    // Safety: CPU Lock active; the context is about to be discarded
    unsafe { Traits::initialize_task_state(running_task) };
    Traits::state()
        .task_ready_queue
        .push_back_task(lock.borrow_mut(), running_task);
    Traits::state().running_task.replace(&mut *lock, None);

    core::mem::forget(lock);

    // Safety: (1) The stack of the restarting task will not be touched until
    // its fresh context runs. (2) CPU Lock active
    unsafe { Traits::exit_and_dispatch(running_task) }
}

/// Put the current task to sleep for `delay` ticks.
///
/// `IMMEDIATE` returns at once; `INFINITE` sleeps until the task is reset.
pub fn sleep_for<Traits: KernelTraits>(delay: Ticks) -> Result<(), SleepError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_waitable_context::<Traits>()?;

    if delay == crate::IMMEDIATE {
        return Ok(());
    }

    let result = wait::wait_no_queue_timeout(lock.borrow_mut(), WaitPayload::Sleep, delay);
    let result = match result {
        // Expiry is the normal completion of a sleep.
        Err(WaitTimeoutError::Timeout) => Ok(()),
        Err(e) => Err(SleepError::from(crate::error::expect_not_timeout(e))),
        // Nothing wakes a sleeping task with a success result.
        Ok(_) => unreachable!(),
    };
    return_to_task(lock);
    result
}

/// Put the current task to sleep until the absolute time `time`.
pub fn sleep_until<Traits: KernelTraits>(time: Ticks) -> Result<(), SleepError> {
    sleep_for::<Traits>(delay_until::<Traits>(time)?)
}

/// Park the current task indefinitely. [`Task::resume`] wakes it.
pub fn suspend<Traits: KernelTraits>() -> Result<(), SuspendError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_waitable_context::<Traits>()?;

    let result = wait::wait_no_queue(lock.borrow_mut(), WaitPayload::Park)
        .map(|_| ())
        .map_err(SuspendError::from);
    return_to_task(lock);
    result
}

/// Relinquish the processor to the next task of equal priority, if any.
pub fn yield_now<Traits: KernelTraits>() -> Result<(), BadContextError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_task_context::<Traits>()?;

    let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();

    // Rotate to the tail of this task's priority group and elect a
    // successor. The dispatcher may immediately elect this task again.
    // Safety: The previous state is Running, so the context is valid
    unsafe { make_ready(lock.borrow_mut(), running_task) };

    drop(lock);
    // Safety: CPU Lock inactive
    unsafe { Traits::yield_cpu() };

    let lock = klock::lock_cpu::<Traits>()?;
    return_to_task(lock);
    Ok(())
}
