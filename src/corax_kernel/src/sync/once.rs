//! Once-flags and fast mutexes
use crate::{
    error::{
        LockMutexError, PollSemaphoreError, SignalSemaphoreError, WaitSemaphoreError,
        WaitSemaphoreTimeoutError,
    },
    klock::{self, CpuLockCell},
    mutex::{Mutex, MutexProtocol, MutexType},
    semaphore::Semaphore,
    utils::Init,
    KernelTraits, PortThreading, Ticks,
};

/// Runs an initialization function exactly once, even when raced.
pub struct OnceFlag<Traits: PortThreading> {
    done: CpuLockCell<Traits, bool>,
    mutex: Mutex<Traits>,
}

impl<Traits: PortThreading> OnceFlag<Traits> {
    /// Construct a once-flag in place, for `static` storage provided by the
    /// application.
    pub const fn new() -> Self {
        Self {
            done: CpuLockCell::new(false),
            mutex: Mutex::new(MutexType::Normal, MutexProtocol::None),
        }
    }
}

impl<Traits: PortThreading> Init for OnceFlag<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: PortThreading> Default for OnceFlag<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> OnceFlag<Traits> {
    /// Call `f` if no previous `call_once` on this flag has completed.
    /// Concurrent callers block until the in-flight call finishes.
    pub fn call_once(&'static self, f: fn()) -> Result<(), LockMutexError> {
        if self.is_completed()? {
            return Ok(());
        }

        self.mutex.wait()?;
        let run = !self.is_completed()?;
        if run {
            f();
            let mut lock = klock::lock_cpu::<Traits>()?;
            self.done.replace(&mut *lock, true);
        }
        let _ = self.mutex.give();
        Ok(())
    }

    /// Whether a `call_once` has completed.
    pub fn is_completed(&'static self) -> Result<bool, crate::error::BadContextError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.done.get(&*lock))
    }
}

/// A non-recursive, non-inheriting lock: a binary semaphore with a mutex
/// flavored API. Unlike [`Mutex`], it has no ownership bookkeeping, which
/// also makes the release side *ISR-safe*.
pub struct FastMutex<Traits: PortThreading> {
    sem: Semaphore<Traits>,
}

impl<Traits: PortThreading> FastMutex<Traits> {
    /// Construct a fast mutex in place, for `static` storage provided by
    /// the application.
    pub const fn new() -> Self {
        Self {
            sem: Semaphore::new(1, 1),
        }
    }
}

impl<Traits: PortThreading> Init for FastMutex<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: PortThreading> Default for FastMutex<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> FastMutex<Traits> {
    /// Attempt to acquire the lock without blocking.
    pub fn take(&'static self) -> Result<(), PollSemaphoreError> {
        self.sem.take()
    }

    /// Acquire the lock, blocking indefinitely.
    pub fn wait(&'static self) -> Result<(), WaitSemaphoreError> {
        self.sem.wait()
    }

    /// Acquire the lock, blocking for up to `delay` ticks.
    pub fn wait_for(&'static self, delay: Ticks) -> Result<(), WaitSemaphoreTimeoutError> {
        self.sem.wait_for(delay)
    }

    /// Release the lock.
    pub fn give(&'static self) -> Result<(), SignalSemaphoreError> {
        self.sem.give()
    }
}
