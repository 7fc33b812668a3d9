//! Job queues
//!
//! A job queue is a mailbox specialized to function-pointer jobs. The
//! consumer side can either fetch a job or fetch-and-execute it
//! ([`JobQueue::process`]).
use core::fmt;

use crate::{
    error::{
        BadContextError, RecvError, RecvTimeoutError, SendError, SendTimeoutError, TryRecvError,
        TrySendError, WaitTimeoutError,
    },
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    object::{self, KernelObject, Obj},
    state, task,
    utils::{Init, RawCell},
    wait::WaitPayload,
    KernelTraits, PortThreading, Ticks, INFINITE,
};

/// *Job queue control block*.
pub struct JobQueue<Traits: PortThreading> {
    pub(super) obj: Obj<Traits>,
    slots: CpuLockCell<Traits, Option<&'static [RawCell<Option<fn()>>]>>,
    count: CpuLockCell<Traits, usize>,
    head: CpuLockCell<Traits, usize>,
    tail: CpuLockCell<Traits, usize>,
}

impl<Traits: PortThreading> JobQueue<Traits> {
    /// Construct a job queue in place over application-provided storage.
    pub const fn new(slots: &'static [RawCell<Option<fn()>>]) -> Self {
        assert!(!slots.is_empty(), "storage must be nonzero");
        Self {
            obj: Obj::new_static(),
            slots: CpuLockCell::new(Some(slots)),
            count: CpuLockCell::new(0),
            head: CpuLockCell::new(0),
            tail: CpuLockCell::new(0),
        }
    }
}

impl<Traits: PortThreading> Init for JobQueue<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        obj: Obj::new_free(),
        slots: CpuLockCell::new(None),
        count: CpuLockCell::new(0),
        head: CpuLockCell::new(0),
        tail: CpuLockCell::new(0),
    };
}

impl<Traits: PortThreading> KernelObject<Traits> for JobQueue<Traits> {
    fn obj(&self) -> &Obj<Traits> {
        &self.obj
    }
}

impl<Traits: PortThreading> fmt::Debug for JobQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("self", &(self as *const _))
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> JobQueue<Traits> {
    /// Allocate and construct a job queue from the kernel pool, with
    /// `limit` slots carved from the segment heap. Returns `None` on
    /// exhaustion of either.
    pub fn create(limit: usize) -> Option<&'static Self> {
        if limit == 0 {
            return None;
        }
        let mut lock = klock::lock_cpu::<Traits>().ok()?;
        let state = Traits::state();

        let slots = state
            .heap
            .alloc_array::<Option<fn()>>(lock.borrow_mut(), limit, None)?;
        let Some(jobq) = object::allocate_from_pool(&state.job_queue_pool[..], lock.borrow_mut())
        else {
            state.heap.free_array(lock.borrow_mut(), slots);
            return None;
        };
        jobq.slots.replace(&mut *lock, Some(slots));
        jobq.count.replace(&mut *lock, 0);
        jobq.head.replace(&mut *lock, 0);
        jobq.tail.replace(&mut *lock, 0);
        Some(jobq)
    }

    /// Fetch one job without blocking.
    ///
    /// *ISR-safe.*
    pub fn take(&'static self) -> Result<fn(), TryRecvError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        if self.count.get(&*lock) == 0 {
            return Err(TryRecvError::Timeout);
        }
        let job = self.get_update(lock.borrow_mut());
        task::unlock_cpu_and_check_preemption(lock);
        Ok(job)
    }

    /// Fetch one job, blocking indefinitely while the queue is empty.
    pub fn recv(&'static self) -> Result<fn(), RecvError> {
        match self.recv_for(INFINITE) {
            Ok(job) => Ok(job),
            Err(RecvTimeoutError::BadContext) => Err(RecvError::BadContext),
            Err(RecvTimeoutError::BadParam) => Err(RecvError::BadParam),
            Err(RecvTimeoutError::Stopped) => Err(RecvError::Stopped),
            Err(RecvTimeoutError::Deleted) => Err(RecvError::Deleted),
            Err(RecvTimeoutError::Timeout) => {
                unreachable!("got timeout result for a non-timeout wait")
            }
        }
    }

    /// Fetch one job, blocking for up to `delay` ticks.
    pub fn recv_for(&'static self, delay: Ticks) -> Result<fn(), RecvTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let result = if self.count.get(&*lock) > 0 {
            Ok(self.get_update(lock.borrow_mut()))
        } else {
            self.obj
                .wait_queue
                .wait_timeout(lock.borrow_mut(), WaitPayload::JobRecv { job: None }, delay)
                .map(|payload| match payload {
                    WaitPayload::JobRecv { job: Some(job) } => job,
                    _ => unreachable!(),
                })
                .map_err(RecvTimeoutError::from)
        };
        task::return_to_task(lock);
        result
    }

    /// Fetch one job, blocking until the absolute time `time`.
    pub fn recv_until(&'static self, time: Ticks) -> Result<fn(), RecvTimeoutError> {
        self.recv_for(task::delay_until::<Traits>(time)?)
    }

    /// Fetch and execute one job, blocking indefinitely while the queue is
    /// empty. The job runs in the caller's context with CPU Lock inactive.
    pub fn process(&'static self) -> Result<(), RecvError> {
        let job = self.recv()?;
        job();
        Ok(())
    }

    /// [`JobQueue::process`] with a timeout on the fetch.
    pub fn process_for(&'static self, delay: Ticks) -> Result<(), RecvTimeoutError> {
        let job = self.recv_for(delay)?;
        job();
        Ok(())
    }

    /// Submit one job without blocking. `Timeout` when the queue is full.
    ///
    /// *ISR-safe.*
    pub fn give(&'static self, job: fn()) -> Result<(), TrySendError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        if self.count.get(&*lock) == self.capacity(lock.borrow_mut()) {
            return Err(TrySendError::Timeout);
        }
        self.put_update(lock.borrow_mut(), job);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Submit one job, blocking indefinitely while the queue is full.
    pub fn send(&'static self, job: fn()) -> Result<(), SendError> {
        match self.send_for(job, INFINITE) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::BadContext) => Err(SendError::BadContext),
            Err(SendTimeoutError::BadParam) => Err(SendError::BadParam),
            Err(SendTimeoutError::Stopped) => Err(SendError::Stopped),
            Err(SendTimeoutError::Deleted) => Err(SendError::Deleted),
            Err(SendTimeoutError::Timeout) => {
                unreachable!("got timeout result for a non-timeout wait")
            }
        }
    }

    /// Submit one job, blocking for up to `delay` ticks.
    pub fn send_for(&'static self, job: fn(), delay: Ticks) -> Result<(), SendTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let result = if self.count.get(&*lock) < self.capacity(lock.borrow_mut()) {
            self.put_update(lock.borrow_mut(), job);
            Ok(())
        } else {
            self.obj
                .wait_queue
                .wait_timeout(lock.borrow_mut(), WaitPayload::JobSend { job }, delay)
                .map(|_| ())
                .map_err(SendTimeoutError::from)
        };
        task::return_to_task(lock);
        result
    }

    /// Submit one job, blocking until the absolute time `time`.
    pub fn send_until(&'static self, job: fn(), time: Ticks) -> Result<(), SendTimeoutError> {
        self.send_for(job, task::delay_until::<Traits>(time)?)
    }

    /// The number of queued jobs.
    pub fn count(&'static self) -> Result<usize, BadContextError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.count.get(&*lock))
    }

    /// Drop all queued jobs and wake all waiters with `Stopped`.
    pub fn reset(&'static self) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        self.count.replace(&mut *lock, 0);
        self.head.replace(&mut *lock, 0);
        self.tail.replace(&mut *lock, 0);
        self.obj
            .wait_queue
            .wake_up_all(lock.borrow_mut(), Err(WaitTimeoutError::Stopped));
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// [`JobQueue::reset`], plus the queue's storage is retired.
    pub fn destroy(&'static self) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let pooled = self.obj.is_pooled(lock.borrow_mut());
        let result = if pooled {
            WaitTimeoutError::Deleted
        } else {
            WaitTimeoutError::Stopped
        };
        self.count.replace(&mut *lock, 0);
        self.obj
            .wait_queue
            .wake_up_all(lock.borrow_mut(), Err(result));

        let slots = self.slots.replace(&mut *lock, None);
        if pooled {
            if let Some(slots) = slots {
                Traits::state().heap.free_array(lock.borrow_mut(), slots);
            }
        }
        self.obj.finalize(lock.borrow_mut());
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    fn capacity(&'static self, lock: CpuLockTokenRefMut<'_, Traits>) -> usize {
        self.slots.get(&*lock).map_or(0, |s| s.len())
    }

    fn put_slot(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, job: fn()) {
        let slots = self.slots.get(&*lock).unwrap();
        let tail = self.tail.get(&*lock);
        // Safety: The slot is owned by this queue and only accessed under
        // CPU Lock.
        unsafe { *slots[tail].get() = Some(job) };
        self.tail
            .replace(&mut *lock, if tail + 1 == slots.len() { 0 } else { tail + 1 });
        let count = self.count.get(&*lock);
        self.count.replace(&mut *lock, count + 1);
    }

    fn pop_slot(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> fn() {
        let slots = self.slots.get(&*lock).unwrap();
        let head = self.head.get(&*lock);
        // Safety: Ditto.
        let job = unsafe { (*slots[head].get()).take() };
        self.head
            .replace(&mut *lock, if head + 1 == slots.len() { 0 } else { head + 1 });
        let count = self.count.get(&*lock);
        self.count.replace(&mut *lock, count - 1);
        job.unwrap()
    }

    fn get_update(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> fn() {
        let job = self.pop_slot(lock.borrow_mut());
        if let Some(sender) = self.obj.wait_queue.wake_up_one(lock.borrow_mut()) {
            let WaitPayload::JobSend { job } = sender.wait.payload.get(&*lock) else {
                unreachable!()
            };
            self.put_slot(lock.borrow_mut(), job);
        }
        job
    }

    fn put_update(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, job: fn()) {
        self.put_slot(lock.borrow_mut(), job);
        if let Some(receiver) = self.obj.wait_queue.wake_up_one(lock.borrow_mut()) {
            let delivered = self.pop_slot(lock.borrow_mut());
            receiver
                .wait
                .payload
                .replace(&mut *lock, WaitPayload::JobRecv { job: Some(delivered) });
        }
    }
}
