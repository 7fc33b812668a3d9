//! Semaphores
use core::fmt;

use crate::{
    error::{
        BadContextError, PollSemaphoreError, SignalSemaphoreError, WaitSemaphoreError,
        WaitSemaphoreTimeoutError, WaitTimeoutError,
    },
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    object::{self, KernelObject, Obj},
    state, task,
    utils::Init,
    wait::WaitPayload,
    KernelTraits, PortThreading, Ticks, INFINITE,
};

/// *Semaphore control block*: a counter bounded by a limit, with a wait
/// queue of takers.
pub struct Semaphore<Traits: PortThreading> {
    pub(super) obj: Obj<Traits>,
    count: CpuLockCell<Traits, u32>,
    limit: CpuLockCell<Traits, u32>,
}

impl<Traits: PortThreading> Semaphore<Traits> {
    /// Construct a semaphore in place, for `static` storage provided by the
    /// application.
    pub const fn new(count: u32, limit: u32) -> Self {
        assert!(count <= limit, "initial count exceeds the limit");
        Self::with_obj(Obj::new_static(), count, limit)
    }

    const fn with_obj(obj: Obj<Traits>, count: u32, limit: u32) -> Self {
        Self {
            obj,
            count: CpuLockCell::new(count),
            limit: CpuLockCell::new(limit),
        }
    }
}

impl<Traits: PortThreading> Init for Semaphore<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::with_obj(Obj::new_free(), 0, 0);
}

impl<Traits: PortThreading> KernelObject<Traits> for Semaphore<Traits> {
    fn obj(&self) -> &Obj<Traits> {
        &self.obj
    }
}

impl<Traits: PortThreading> fmt::Debug for Semaphore<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("self", &(self as *const _))
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> Semaphore<Traits> {
    /// Allocate and construct a semaphore from the kernel pool. Returns
    /// `None` on pool exhaustion.
    pub fn create(count: u32, limit: u32) -> Option<&'static Self> {
        if count > limit {
            return None;
        }
        let mut lock = klock::lock_cpu::<Traits>().ok()?;
        let sem =
            object::allocate_from_pool(&Traits::state().semaphore_pool[..], lock.borrow_mut())?;
        sem.count.replace(&mut *lock, count);
        sem.limit.replace(&mut *lock, limit);
        Some(sem)
    }

    /// Attempt to take one permit without blocking.
    ///
    /// *ISR-safe.*
    pub fn take(&'static self) -> Result<(), PollSemaphoreError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        if self.poll_core(lock.borrow_mut()) {
            Ok(())
        } else {
            Err(PollSemaphoreError::Timeout)
        }
    }

    /// Take one permit, blocking indefinitely while none is available.
    pub fn wait(&'static self) -> Result<(), WaitSemaphoreError> {
        match self.wait_for(INFINITE) {
            Ok(()) => Ok(()),
            Err(WaitSemaphoreTimeoutError::BadContext) => Err(WaitSemaphoreError::BadContext),
            Err(WaitSemaphoreTimeoutError::Stopped) => Err(WaitSemaphoreError::Stopped),
            Err(WaitSemaphoreTimeoutError::Deleted) => Err(WaitSemaphoreError::Deleted),
            Err(WaitSemaphoreTimeoutError::Timeout) => {
                unreachable!("got timeout result for a non-timeout wait")
            }
        }
    }

    /// Take one permit, blocking for up to `delay` ticks.
    pub fn wait_for(&'static self, delay: Ticks) -> Result<(), WaitSemaphoreTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let result = if self.poll_core(lock.borrow_mut()) {
            Ok(())
        } else {
            // The giver completes the take on our behalf before waking us.
            self.obj
                .wait_queue
                .wait_timeout(lock.borrow_mut(), WaitPayload::Semaphore, delay)
                .map(|_| ())
                .map_err(WaitSemaphoreTimeoutError::from)
        };
        task::return_to_task(lock);
        result
    }

    /// Take one permit, blocking until the absolute time `time`.
    pub fn wait_until(&'static self, time: Ticks) -> Result<(), WaitSemaphoreTimeoutError> {
        self.wait_for(task::delay_until::<Traits>(time)?)
    }

    /// Release one permit: hand it directly to the longest-waiting
    /// highest-priority taker, or increment the count. Returns `Timeout`
    /// when the count is at its limit and there is no taker.
    ///
    /// *ISR-safe.*
    pub fn give(&'static self) -> Result<(), SignalSemaphoreError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        if self.obj.wait_queue.wake_up_one(lock.borrow_mut()).is_some() {
            task::unlock_cpu_and_check_preemption(lock);
            return Ok(());
        }

        let count = self.count.get(&*lock);
        if count >= self.limit.get(&*lock) {
            return Err(SignalSemaphoreError::Timeout);
        }
        self.count.replace(&mut *lock, count + 1);
        Ok(())
    }

    /// Get the current permit count.
    pub fn value(&'static self) -> Result<u32, BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());
        Ok(self.count.get(&*lock))
    }

    /// Drain all permits and wake all waiters with `Stopped`.
    pub fn reset(&'static self) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        self.count.replace(&mut *lock, 0);
        self.obj
            .wait_queue
            .wake_up_all(lock.borrow_mut(), Err(WaitTimeoutError::Stopped));
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// [`Semaphore::reset`], plus the semaphore's storage is retired.
    /// Waiters are woken with `Deleted` if the semaphore is pooled,
    /// `Stopped` otherwise.
    pub fn destroy(&'static self) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let result = if self.obj.is_pooled(lock.borrow_mut()) {
            WaitTimeoutError::Deleted
        } else {
            WaitTimeoutError::Stopped
        };
        self.count.replace(&mut *lock, 0);
        self.obj
            .wait_queue
            .wake_up_all(lock.borrow_mut(), Err(result));
        self.obj.finalize(lock.borrow_mut());
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Decrement the count if it is positive.
    fn poll_core(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        let count = self.count.get(&*lock);
        if count > 0 {
            self.count.replace(&mut *lock, count - 1);
            true
        } else {
            false
        }
    }
}
