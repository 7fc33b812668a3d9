//! Reader-writer locks
use crate::{
    error::{LockMutexError, UnlockMutexError, WaitSemaphoreError},
    klock::{self, CpuLockCell},
    mutex::{Mutex, MutexProtocol, MutexType},
    semaphore::Semaphore,
    utils::Init,
    KernelTraits, PortThreading,
};

/// Errors reported by the read/write lock operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwLockError {
    Lock(LockMutexError),
    Gate(WaitSemaphoreError),
    Unlock(UnlockMutexError),
    /// Unlock of a lock that is not held in the expected mode.
    NotLocked,
}

/// A writer-gate reader-writer lock: readers share a gate semaphore that the
/// first reader takes and the last reader returns; writers take the gate
/// exclusively.
pub struct RwLock<Traits: PortThreading> {
    reader_lock: Mutex<Traits>,
    gate: Semaphore<Traits>,
    readers: CpuLockCell<Traits, u32>,
}

impl<Traits: PortThreading> RwLock<Traits> {
    /// Construct a reader-writer lock in place, for `static` storage
    /// provided by the application.
    pub const fn new() -> Self {
        Self {
            reader_lock: Mutex::new(MutexType::ErrorCheck, MutexProtocol::None),
            gate: Semaphore::new(1, 1),
            readers: CpuLockCell::new(0),
        }
    }
}

impl<Traits: PortThreading> Init for RwLock<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: PortThreading> Default for RwLock<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> RwLock<Traits> {
    /// Acquire the lock for shared reading.
    pub fn read_lock(&'static self) -> Result<(), RwLockError> {
        self.reader_lock.wait().map_err(RwLockError::Lock)?;

        let first = self.adjust_readers(1)? == 1;
        if first {
            if let Err(e) = self.gate.wait() {
                self.adjust_readers(-1)?;
                let _ = self.reader_lock.give();
                return Err(RwLockError::Gate(e));
            }
        }

        self.reader_lock.give().map_err(RwLockError::Unlock)
    }

    /// Release a shared-reading hold.
    pub fn read_unlock(&'static self) -> Result<(), RwLockError> {
        self.reader_lock.wait().map_err(RwLockError::Lock)?;

        let remaining = {
            let mut lock = klock::lock_cpu::<Traits>()
                .map_err(|e| RwLockError::Gate(WaitSemaphoreError::from(e)))?;
            let readers = self.readers.get(&*lock);
            if readers == 0 {
                drop(lock);
                let _ = self.reader_lock.give();
                return Err(RwLockError::NotLocked);
            }
            self.readers.replace(&mut *lock, readers - 1);
            readers - 1
        };

        if remaining == 0 {
            let _ = self.gate.give();
        }

        self.reader_lock.give().map_err(RwLockError::Unlock)
    }

    /// Acquire the lock for exclusive writing.
    pub fn write_lock(&'static self) -> Result<(), RwLockError> {
        self.gate.wait().map_err(RwLockError::Gate)
    }

    /// Release an exclusive-writing hold.
    pub fn write_unlock(&'static self) -> Result<(), RwLockError> {
        match self.gate.give() {
            Ok(()) => Ok(()),
            Err(_) => Err(RwLockError::NotLocked),
        }
    }

    /// Attempt to acquire the lock for exclusive writing without blocking.
    pub fn try_write_lock(&'static self) -> Result<bool, RwLockError> {
        match self.gate.take() {
            Ok(()) => Ok(true),
            Err(crate::error::PollSemaphoreError::Timeout) => Ok(false),
            Err(crate::error::PollSemaphoreError::BadContext) => {
                Err(RwLockError::Gate(WaitSemaphoreError::BadContext))
            }
        }
    }

    fn adjust_readers(&'static self, delta: i32) -> Result<u32, RwLockError> {
        let mut lock = klock::lock_cpu::<Traits>()
            .map_err(|e| RwLockError::Gate(WaitSemaphoreError::from(e)))?;
        let readers = self.readers.get(&*lock).wrapping_add_signed(delta);
        self.readers.replace(&mut *lock, readers);
        Ok(readers)
    }
}
