//! Condition variables
use crate::{
    error::{LockMutexError, WaitSemaphoreError, WaitSemaphoreTimeoutError},
    klock::{self, CpuLockCell},
    mutex::Mutex,
    semaphore::Semaphore,
    utils::Init,
    KernelTraits, PortThreading, Ticks,
};

/// The outcome of a [`CondVar::wait_for`]: whether the wait was notified or
/// timed out. The associated mutex is re-acquired either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondVarWait {
    Notified,
    TimedOut,
}

/// A condition variable built on a [`Semaphore`], with Mesa semantics:
/// spurious wake-ups are possible and waiters must re-check their predicate.
pub struct CondVar<Traits: PortThreading> {
    sem: Semaphore<Traits>,
    waiters: CpuLockCell<Traits, u32>,
}

impl<Traits: PortThreading> CondVar<Traits> {
    /// Construct a condition variable in place, for `static` storage
    /// provided by the application.
    pub const fn new() -> Self {
        Self {
            sem: Semaphore::new(0, u32::MAX),
            waiters: CpuLockCell::new(0),
        }
    }
}

impl<Traits: PortThreading> Init for CondVar<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: PortThreading> Default for CondVar<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors reported by [`CondVar::wait`]: from the wait itself or from
/// re-acquiring the mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondVarWaitError {
    Wait(WaitSemaphoreError),
    Relock(LockMutexError),
}

impl<Traits: KernelTraits> CondVar<Traits> {
    /// Atomically release `mutex` and wait for a notification, then
    /// re-acquire `mutex`.
    pub fn wait(&'static self, mutex: &'static Mutex<Traits>) -> Result<(), CondVarWaitError> {
        self.register_waiter().map_err(|e| {
            CondVarWaitError::Wait(WaitSemaphoreError::from(e))
        })?;
        mutex
            .give()
            .expect("condition variable used without holding the mutex");

        let wait_result = self.sem.wait();

        let relock = mutex.wait();
        match (wait_result, relock) {
            (Err(e), _) => Err(CondVarWaitError::Wait(e)),
            (_, Err(e)) => Err(CondVarWaitError::Relock(e)),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    /// [`CondVar::wait`] with a timeout on the notification wait.
    pub fn wait_for(
        &'static self,
        mutex: &'static Mutex<Traits>,
        delay: Ticks,
    ) -> Result<CondVarWait, CondVarWaitError> {
        self.register_waiter().map_err(|e| {
            CondVarWaitError::Wait(WaitSemaphoreError::from(e))
        })?;
        mutex
            .give()
            .expect("condition variable used without holding the mutex");

        let wait_result = self.sem.wait_for(delay);

        let relock = mutex.wait();
        if let Err(e) = relock {
            return Err(CondVarWaitError::Relock(e));
        }
        match wait_result {
            Ok(()) => Ok(CondVarWait::Notified),
            Err(WaitSemaphoreTimeoutError::Timeout) => {
                // Retract our registration; a concurrent notify may already
                // have consumed it, leaving a surplus permit behind (a
                // spurious wake-up for a later waiter).
                if let Ok(mut lock) = klock::lock_cpu::<Traits>() {
                    let waiters = self.waiters.get(&*lock);
                    if waiters > 0 {
                        self.waiters.replace(&mut *lock, waiters - 1);
                    }
                }
                Ok(CondVarWait::TimedOut)
            }
            Err(WaitSemaphoreTimeoutError::BadContext) => {
                Err(CondVarWaitError::Wait(WaitSemaphoreError::BadContext))
            }
            Err(WaitSemaphoreTimeoutError::Stopped) => {
                Err(CondVarWaitError::Wait(WaitSemaphoreError::Stopped))
            }
            Err(WaitSemaphoreTimeoutError::Deleted) => {
                Err(CondVarWaitError::Wait(WaitSemaphoreError::Deleted))
            }
        }
    }

    /// Wake one waiter, if any.
    ///
    /// *ISR-safe.*
    pub fn notify_one(&'static self) -> Result<(), crate::error::BadContextError> {
        if self.take_waiter()? {
            let _ = self.sem.give();
        }
        Ok(())
    }

    /// Wake every current waiter.
    ///
    /// *ISR-safe.*
    pub fn notify_all(&'static self) -> Result<(), crate::error::BadContextError> {
        while self.take_waiter()? {
            let _ = self.sem.give();
        }
        Ok(())
    }

    fn register_waiter(&'static self) -> Result<(), crate::error::BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let waiters = self.waiters.get(&*lock);
        self.waiters.replace(&mut *lock, waiters + 1);
        Ok(())
    }

    fn take_waiter(&'static self) -> Result<bool, crate::error::BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let waiters = self.waiters.get(&*lock);
        if waiters > 0 {
            self.waiters.replace(&mut *lock, waiters - 1);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
