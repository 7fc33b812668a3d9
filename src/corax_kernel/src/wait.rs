//! Wait queues and the per-task wait state
//!
//! Every waitable kernel object embeds a [`WaitQueue`]: a linked list of
//! blocked tasks sorted by descending effective priority, FIFO among equal
//! priorities. The links and the wait payload (the "scratch slot" carrying
//! the parameters of the ongoing blocking call) live in the task control
//! block, so a task can be spliced out of its queue from any context that
//! holds CPU Lock.
use core::{fmt, ptr::NonNull};

use crate::{
    error::{expect_not_timeout, WaitError, WaitTimeoutError},
    flag::FlagMode,
    klock::{CpuLockCell, CpuLockTokenRefMut},
    mutex, task,
    task::{Task, TaskSt},
    timeout,
    utils::Init,
    KernelTraits, PortThreading, Ticks, IMMEDIATE, INFINITE,
};

/// Additional information included in a task's wait state, specific to
/// waitable object types.
///
/// The variant is written by the blocking primitive before the task blocks
/// and read (and possibly updated) by the matching wake-up path. The
/// invariant: a variant other than `Empty` is meaningful only while
/// `task.st == Waiting` on the corresponding primitive.
pub(super) enum WaitPayload<Traits: PortThreading> {
    Empty,
    Sleep,
    Park,
    Join,
    Semaphore,
    Mutex(&'static mutex::Mutex<Traits>),
    Timer,
    /// Flag wait; `bits` is the set of bits still required, which consuming
    /// wake-ups whittle down in `All` mode.
    Flag {
        bits: u32,
        mode: FlagMode,
    },
    /// Signal wait; `accept` is the accepted set (empty accepts any), and
    /// `taken` receives the delivered signal number.
    Signal {
        accept: u32,
        taken: u32,
    },
    /// Mailbox send; `src` points at one record in the blocked sender's
    /// memory.
    BoxSend {
        src: NonNull<u8>,
    },
    /// Mailbox receive; `dst` points at one record's worth of space in the
    /// blocked receiver's memory.
    BoxRecv {
        dst: NonNull<u8>,
    },
    /// Stream-buffer send of exactly `len` bytes.
    StreamSend {
        src: NonNull<u8>,
        len: usize,
    },
    /// Stream-buffer receive of up to `len` bytes; `len` is updated to the
    /// transferred count by the wake-up path.
    StreamRecv {
        dst: NonNull<u8>,
        len: usize,
    },
    /// Message-buffer send of one `len`-byte frame.
    MsgSend {
        src: NonNull<u8>,
        len: usize,
    },
    /// Message-buffer receive into a `len`-byte buffer; `len` is updated to
    /// the frame length by the wake-up path.
    MsgRecv {
        dst: NonNull<u8>,
        len: usize,
    },
    /// Event-queue send of one event value.
    EventSend {
        event: u32,
    },
    /// Event-queue receive; `event` is filled in by the wake-up path.
    EventRecv {
        event: u32,
    },
    /// Job-queue send of one job function.
    JobSend {
        job: fn(),
    },
    /// Job-queue receive; `job` is filled in by the wake-up path.
    JobRecv {
        job: Option<fn()>,
    },
}

impl<Traits: PortThreading> Clone for WaitPayload<Traits> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: PortThreading> Copy for WaitPayload<Traits> {}

// Safety: The raw pointers stored in some variants refer to buffers owned by
// a blocked task. The wait protocol guarantees the owner does not touch them
// until it is woken up, and wake-up paths only dereference them while CPU
// Lock is active.
unsafe impl<Traits: PortThreading> Send for WaitPayload<Traits> {}
unsafe impl<Traits: PortThreading> Sync for WaitPayload<Traits> {}

impl<Traits: PortThreading> Init for WaitPayload<Traits> {
    const INIT: Self = Self::Empty;
}

impl<Traits: PortThreading> fmt::Debug for WaitPayload<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Sleep => f.write_str("Sleep"),
            Self::Park => f.write_str("Park"),
            Self::Join => f.write_str("Join"),
            Self::Semaphore => f.write_str("Semaphore"),
            Self::Mutex(m) => write!(f, "Mutex({:p})", *m),
            Self::Timer => f.write_str("Timer"),
            Self::Flag { bits, mode } => f
                .debug_struct("Flag")
                .field("bits", bits)
                .field("mode", mode)
                .finish(),
            Self::Signal { accept, taken } => f
                .debug_struct("Signal")
                .field("accept", accept)
                .field("taken", taken)
                .finish(),
            Self::BoxSend { .. } => f.write_str("BoxSend"),
            Self::BoxRecv { .. } => f.write_str("BoxRecv"),
            Self::StreamSend { len, .. } => write!(f, "StreamSend({len})"),
            Self::StreamRecv { len, .. } => write!(f, "StreamRecv({len})"),
            Self::MsgSend { len, .. } => write!(f, "MsgSend({len})"),
            Self::MsgRecv { len, .. } => write!(f, "MsgRecv({len})"),
            Self::EventSend { event } => write!(f, "EventSend({event})"),
            Self::EventRecv { event } => write!(f, "EventRecv({event})"),
            Self::JobSend { .. } => f.write_str("JobSend"),
            Self::JobRecv { .. } => f.write_str("JobRecv"),
        }
    }
}

/// The wait state of a task.
pub(super) struct TaskWait<Traits: PortThreading> {
    /// The wait queue the task is currently enqueued on, if any. A task can
    /// be `Waiting` with no queue (sleep, park).
    current_queue: CpuLockCell<Traits, Option<&'static WaitQueue<Traits>>>,

    /// The next task in `current_queue`'s list.
    next: CpuLockCell<Traits, Option<&'static Task<Traits>>>,

    /// The parameters of the ongoing blocking call.
    pub(super) payload: CpuLockCell<Traits, WaitPayload<Traits>>,

    /// The result of the last wait operation. Set by a wake-upper.
    wait_result: CpuLockCell<Traits, Result<(), WaitTimeoutError>>,

    /// `true` while the task is held in a forced suspension
    /// (`Task::suspend` on a Ready task). Kept apart from `payload` so that
    /// the suspension does not disturb the result of a wait that had already
    /// completed when the task was suspended.
    pub(super) forced_park: CpuLockCell<Traits, bool>,
}

impl<Traits: PortThreading> Init for TaskWait<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        current_queue: Init::INIT,
        next: Init::INIT,
        payload: Init::INIT,
        wait_result: CpuLockCell::new(Ok(())),
        forced_park: Init::INIT,
    };
}

impl<Traits: PortThreading> fmt::Debug for TaskWait<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskWait").finish_non_exhaustive()
    }
}

/// A queue of tasks waiting on a particular waitable object, sorted by
/// descending effective priority, FIFO among equal priorities.
pub(super) struct WaitQueue<Traits: PortThreading> {
    head: CpuLockCell<Traits, Option<&'static Task<Traits>>>,
}

impl<Traits: PortThreading> WaitQueue<Traits> {
    pub(super) const fn new() -> Self {
        Self {
            head: CpuLockCell::new(None),
        }
    }
}

impl<Traits: PortThreading> Init for WaitQueue<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: KernelTraits> WaitQueue<Traits> {
    /// Insert `task` before the first task of strictly lower effective
    /// priority.
    fn insert_sorted(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, task: &'static Task<Traits>) {
        let prio = task.effective_priority.get(&*lock);

        let mut prev: Option<&'static Task<Traits>> = None;
        let mut cur = self.head.get(&*lock);
        while let Some(t) = cur {
            if t.effective_priority.get(&*lock) < prio {
                break;
            }
            prev = cur;
            cur = t.wait.next.get(&*lock);
        }

        task.wait.next.replace(&mut *lock, cur);
        match prev {
            None => {
                self.head.replace(&mut *lock, Some(task));
            }
            Some(p) => {
                p.wait.next.replace(&mut *lock, Some(task));
            }
        }
    }

    /// Unlink `task` from this queue. Returns `false` if it was not linked.
    pub(super) fn remove(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        task: &'static Task<Traits>,
    ) -> bool {
        let mut prev: Option<&'static Task<Traits>> = None;
        let mut cur = self.head.get(&*lock);
        while let Some(t) = cur {
            if core::ptr::eq(t, task) {
                let next = t.wait.next.get(&*lock);
                match prev {
                    None => {
                        self.head.replace(&mut *lock, next);
                    }
                    Some(p) => {
                        p.wait.next.replace(&mut *lock, next);
                    }
                }
                t.wait.next.replace(&mut *lock, None);
                return true;
            }
            prev = cur;
            cur = t.wait.next.get(&*lock);
        }
        false
    }

    /// Get the next waiting task to be woken up.
    pub(super) fn first_waiting_task(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static Task<Traits>> {
        self.head.get(&*lock)
    }

    /// Wake up up to one waiting task with a successful result. Returns the
    /// woken task, whose wait payload the caller may still inspect under the
    /// same critical section.
    ///
    /// This method may make a task Ready, but doesn't yield the processor.
    /// Call `unlock_cpu_and_check_preemption` as needed.
    pub(super) fn wake_up_one(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static Task<Traits>> {
        let task = self.head.get(&*lock)?;
        let next = task.wait.next.get(&*lock);
        self.head.replace(&mut *lock, next);
        task.wait.next.replace(&mut *lock, None);

        complete_wait(lock.borrow_mut(), task, Ok(()));
        Some(task)
    }

    /// Wake up every waiting task with the given result, highest priority
    /// first.
    pub(super) fn wake_up_all(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        wait_result: Result<(), WaitTimeoutError>,
    ) {
        while let Some(task) = self.head.get(&*lock) {
            let next = task.wait.next.get(&*lock);
            self.head.replace(&mut *lock, next);
            task.wait.next.replace(&mut *lock, None);
            complete_wait(lock.borrow_mut(), task, wait_result);
        }
    }

    /// Conditionally wake up waiting tasks, in queue order.
    ///
    /// `cond` receives each waiting task and a mutable copy of its wait
    /// payload; the (possibly updated) payload is stored back regardless of
    /// the verdict, so a partial match can be recorded without a wake-up.
    pub(super) fn wake_up_all_conditional(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        mut cond: impl FnMut(&'static Task<Traits>, &mut WaitPayload<Traits>) -> bool,
    ) {
        let mut prev: Option<&'static Task<Traits>> = None;
        let mut cur = self.head.get(&*lock);
        while let Some(task) = cur {
            let next = task.wait.next.get(&*lock);

            let mut payload = task.wait.payload.get(&*lock);
            let wake = cond(task, &mut payload);
            task.wait.payload.replace(&mut *lock, payload);

            if wake {
                // Unlink and wake `task`; `prev` is unchanged.
                match prev {
                    None => {
                        self.head.replace(&mut *lock, next);
                    }
                    Some(p) => {
                        p.wait.next.replace(&mut *lock, next);
                    }
                }
                task.wait.next.replace(&mut *lock, None);
                complete_wait(lock.borrow_mut(), task, Ok(()));
            } else {
                prev = cur;
            }
            cur = next;
        }
    }

    /// Block the currently running task on this queue indefinitely.
    ///
    /// The current context must be waitable (this function doesn't check
    /// that). Returns the final wait payload, which wake-up paths may have
    /// updated.
    pub(super) fn wait(
        &'static self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        payload: WaitPayload<Traits>,
    ) -> Result<WaitPayload<Traits>, WaitError> {
        wait_inner(Some(self), lock, payload, None).map_err(expect_not_timeout)
    }

    /// Block the currently running task on this queue with a timeout.
    ///
    /// `delay == IMMEDIATE` fails with `Timeout` without touching the queue;
    /// `delay == INFINITE` never times out.
    pub(super) fn wait_timeout(
        &'static self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        payload: WaitPayload<Traits>,
        delay: Ticks,
    ) -> Result<WaitPayload<Traits>, WaitTimeoutError> {
        if delay == INFINITE {
            wait_inner(Some(self), lock, payload, None)
        } else if delay == IMMEDIATE {
            Err(WaitTimeoutError::Timeout)
        } else {
            wait_inner(Some(self), lock, payload, Some(delay))
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for WaitQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WaitQueue").finish_non_exhaustive()
    }
}

/// Block the currently running task without any wait queue (sleep, park).
///
/// The only ways to end such a wait are [`interrupt_task`] and the timeout.
pub(super) fn wait_no_queue<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    payload: WaitPayload<Traits>,
) -> Result<WaitPayload<Traits>, WaitError> {
    wait_inner(None, lock, payload, None).map_err(expect_not_timeout)
}

/// Block the currently running task without any wait queue, with a timeout.
pub(super) fn wait_no_queue_timeout<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    payload: WaitPayload<Traits>,
    delay: Ticks,
) -> Result<WaitPayload<Traits>, WaitTimeoutError> {
    if delay == INFINITE {
        wait_inner(None, lock, payload, None)
    } else if delay == IMMEDIATE {
        Err(WaitTimeoutError::Timeout)
    } else {
        wait_inner(None, lock, payload, Some(delay))
    }
}

/// The core portion of every blocking operation.
fn wait_inner<Traits: KernelTraits>(
    wait_queue: Option<&'static WaitQueue<Traits>>,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    payload: WaitPayload<Traits>,
    timeout_delay: Option<Ticks>,
) -> Result<WaitPayload<Traits>, WaitTimeoutError> {
    let task = Traits::state().running_task(lock.borrow_mut()).unwrap();

    task.wait.payload.replace(&mut *lock, payload);
    task.wait.current_queue.replace(&mut *lock, wait_queue);
    task.wait.wait_result.replace(&mut *lock, Ok(()));

    if let Some(wait_queue) = wait_queue {
        wait_queue.insert_sorted(lock.borrow_mut(), task);
    }

    if let Some(delay) = timeout_delay {
        let now = timeout::system_time::<Traits>(lock.borrow_mut());
        timeout::insert_task_timeout(lock.borrow_mut(), task, now.saturating_add(delay));
    }

    // Transition the task into Waiting. This statement completes when the
    // task is woken up.
    task::wait_until_woken_up(lock.borrow_mut());

    // A wake-upper must have detached us from the queue and the timing list.
    debug_assert!(task.wait.current_queue.get(&*lock).is_none());
    debug_assert!(!task.hdr.is_linked(lock.borrow_mut()));

    let result = task.wait.wait_result.get(&*lock);
    let payload = task.wait.payload.replace(&mut *lock, WaitPayload::Empty);
    result.map(|()| payload)
}

/// Deassociate the task from its wait bookkeeping (timing list included) and
/// wake it up with the given result.
///
/// The caller is responsible for unlinking the task from its wait queue
/// beforehand.
///
/// This method may make a task Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
fn complete_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static Task<Traits>,
    wait_result: Result<(), WaitTimeoutError>,
) {
    assert_eq!(*task.st.read(&*lock), TaskSt::Waiting);

    if task.hdr.is_linked(lock.borrow_mut()) {
        timeout::remove_task_timeout(lock.borrow_mut(), task);
    }

    task.wait.current_queue.replace(&mut *lock, None);
    let _ = task.wait.wait_result.replace(&mut *lock, wait_result);

    // Safety: The task is in the Waiting state, so its context is valid and
    // ready to resume from the point where it was suspended.
    unsafe { task::make_ready(lock, task) };
}

/// Interrupt any ongoing wait operation of the task.
///
/// Returns `Err(())` if the task is not in the Waiting state.
///
/// If the task was blocked on a mutex, the owner's inherited priority is
/// re-evaluated, since the chain just lost a waiter.
///
/// This method may make a task Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
pub(super) fn interrupt_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static Task<Traits>,
    wait_result: Result<(), WaitTimeoutError>,
) -> Result<(), ()> {
    if *task.st.read(&*lock) != TaskSt::Waiting {
        return Err(());
    }

    if let Some(wait_queue) = task.wait.current_queue.get(&*lock) {
        let was_linked = wait_queue.remove(lock.borrow_mut(), task);
        debug_assert!(was_linked);
    }

    complete_wait(lock.borrow_mut(), task, wait_result);

    // Leaving a mutex's wait queue may deflate the owner's inherited
    // priority.
    if let WaitPayload::Mutex(mtx) = task.wait.payload.get(&*lock) {
        mutex::reevaluate_owner_chain(lock.borrow_mut(), mtx);
    }

    Ok(())
}

/// Mark a task as held in forced suspension. The caller has already removed
/// it from the ready queue and transitioned it into the Waiting state; the
/// wait bookkeeping is left untouched so that a wait that completed right
/// before the suspension keeps its result.
pub(super) fn prepare_forced_park<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static Task<Traits>,
) {
    debug_assert_eq!(*task.st.read(&*lock), TaskSt::Waiting);
    debug_assert!(task.wait.current_queue.get(&*lock).is_none());
    task.wait.forced_park.replace(&mut *lock, true);
}

/// End a forced suspension, making the task Ready again.
///
/// Returns `Err(())` if the task is not in a forced suspension.
pub(super) fn release_forced_park<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static Task<Traits>,
) -> Result<(), ()> {
    if *task.st.read(&*lock) != TaskSt::Waiting || !task.wait.forced_park.get(&*lock) {
        return Err(());
    }
    task.wait.forced_park.replace(&mut *lock, false);
    // Safety: The task was Waiting, so its context is valid
    unsafe { task::make_ready(lock, task) };
    Ok(())
}

/// Detach a Waiting task from its wait queue and the timing list without
/// waking it. Used by the task termination paths.
pub(super) fn detach_waiting_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static Task<Traits>,
) {
    debug_assert_eq!(*task.st.read(&*lock), TaskSt::Waiting);

    if let Some(wait_queue) = task.wait.current_queue.replace(&mut *lock, None) {
        let was_linked = wait_queue.remove(lock.borrow_mut(), task);
        debug_assert!(was_linked);
    }
    if task.hdr.is_linked(lock.borrow_mut()) {
        timeout::remove_task_timeout(lock.borrow_mut(), task);
    }
    task.wait.payload.replace(&mut *lock, WaitPayload::Empty);
    task.wait.forced_park.replace(&mut *lock, false);
}

/// Check whether the task is waiting with the given payload kind, then
/// interrupt it. Used by operations that only cancel a specific kind of
/// wait (e.g. `resume` cancels a park).
pub(super) fn with_current_wait_payload<Traits: KernelTraits, R>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static Task<Traits>,
    f: impl FnOnce(Option<&WaitPayload<Traits>>) -> R,
) -> R {
    if *task.st.read(&*lock) == TaskSt::Waiting {
        f(Some(task.wait.payload.read(&*lock)))
    } else {
        f(None)
    }
}

/// Reposition the task within its wait queue after a change in its
/// effective priority.
///
/// This function does nothing if the task is not currently enqueued on a
/// wait queue.
pub(super) fn reorder_wait_of_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static Task<Traits>,
) {
    if let Some(wait_queue) = task.wait.current_queue.get(&*lock) {
        let was_linked = wait_queue.remove(lock.borrow_mut(), task);
        debug_assert!(was_linked);
        wait_queue.insert_sorted(lock.borrow_mut(), task);
    }
}
