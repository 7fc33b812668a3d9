//! Signal objects
//!
//! A signal object is a set of numbered signals (`0..32`). Takers receive
//! the lowest-numbered pending signal they accept, clearing it unless the
//! object's *sticky mask* declares it persistent.
use core::fmt;

use crate::{
    error::{
        BadContextError, PollSignalError, WaitSignalError, WaitSignalTimeoutError,
        WaitTimeoutError,
    },
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    object::{self, KernelObject, Obj},
    state, task,
    utils::Init,
    wait::WaitPayload,
    KernelTraits, PortThreading, Ticks, INFINITE,
};

/// *Signal control block*.
pub struct Signal<Traits: PortThreading> {
    pub(super) obj: Obj<Traits>,
    pending: CpuLockCell<Traits, u32>,

    /// Signals in this set stay pending after being taken.
    sticky: CpuLockCell<Traits, u32>,
}

impl<Traits: PortThreading> Signal<Traits> {
    /// Construct a signal object in place, for `static` storage provided by
    /// the application. `sticky` is the set of signals that are not cleared
    /// by delivery.
    pub const fn new(sticky: u32) -> Self {
        Self {
            obj: Obj::new_static(),
            pending: CpuLockCell::new(0),
            sticky: CpuLockCell::new(sticky),
        }
    }
}

impl<Traits: PortThreading> Init for Signal<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        obj: Obj::new_free(),
        pending: CpuLockCell::new(0),
        sticky: CpuLockCell::new(0),
    };
}

impl<Traits: PortThreading> KernelObject<Traits> for Signal<Traits> {
    fn obj(&self) -> &Obj<Traits> {
        &self.obj
    }
}

impl<Traits: PortThreading> fmt::Debug for Signal<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Signal")
            .field("self", &(self as *const _))
            .finish_non_exhaustive()
    }
}

/// Normalize an accepted-signal set: an empty set accepts every signal.
#[inline]
fn accept_set(accept: u32) -> u32 {
    if accept == 0 {
        u32::MAX
    } else {
        accept
    }
}

impl<Traits: KernelTraits> Signal<Traits> {
    /// Allocate and construct a signal object from the kernel pool. Returns
    /// `None` on pool exhaustion.
    pub fn create(sticky: u32) -> Option<&'static Self> {
        let mut lock = klock::lock_cpu::<Traits>().ok()?;
        let sig = object::allocate_from_pool(&Traits::state().signal_pool[..], lock.borrow_mut())?;
        sig.pending.replace(&mut *lock, 0);
        sig.sticky.replace(&mut *lock, sticky);
        Some(sig)
    }

    /// Take the lowest-numbered pending signal in `accept` (an empty set
    /// accepts any) without blocking.
    ///
    /// *ISR-safe.*
    pub fn take(&'static self, accept: u32) -> Result<u32, PollSignalError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        self.poll_core(lock.borrow_mut(), accept)
            .ok_or(PollSignalError::Timeout)
    }

    /// Wait for a signal in `accept`, blocking indefinitely.
    pub fn wait(&'static self, accept: u32) -> Result<u32, WaitSignalError> {
        match self.wait_for(accept, INFINITE) {
            Ok(signo) => Ok(signo),
            Err(WaitSignalTimeoutError::BadContext) => Err(WaitSignalError::BadContext),
            Err(WaitSignalTimeoutError::Stopped) => Err(WaitSignalError::Stopped),
            Err(WaitSignalTimeoutError::Deleted) => Err(WaitSignalError::Deleted),
            Err(WaitSignalTimeoutError::Timeout) => {
                unreachable!("got timeout result for a non-timeout wait")
            }
        }
    }

    /// [`Signal::wait`] with a timeout.
    pub fn wait_for(
        &'static self,
        accept: u32,
        delay: Ticks,
    ) -> Result<u32, WaitSignalTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let result = match self.poll_core(lock.borrow_mut(), accept) {
            Some(signo) => Ok(signo),
            None => self
                .obj
                .wait_queue
                .wait_timeout(
                    lock.borrow_mut(),
                    WaitPayload::Signal { accept, taken: 0 },
                    delay,
                )
                .map(|payload| match payload {
                    WaitPayload::Signal { taken, .. } => taken,
                    _ => unreachable!(),
                })
                .map_err(WaitSignalTimeoutError::from),
        };
        task::return_to_task(lock);
        result
    }

    /// [`Signal::wait`] with an absolute deadline.
    pub fn wait_until(
        &'static self,
        accept: u32,
        time: Ticks,
    ) -> Result<u32, WaitSignalTimeoutError> {
        self.wait_for(accept, task::delay_until::<Traits>(time)?)
    }

    /// Raise signal `signo`, waking the first waiter that accepts it.
    ///
    /// *ISR-safe.*
    pub fn give(&'static self, signo: u32) -> Result<(), BadContextError> {
        debug_assert!(signo < 32);
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let bit = 1u32 << signo;
        let pending = self.pending.get(&*lock) | bit;
        self.pending.replace(&mut *lock, pending);

        let sticky = self.sticky.get(&*lock);
        let mut delivered = false;
        self.obj
            .wait_queue
            .wake_up_all_conditional(lock.borrow_mut(), |_task, payload| {
                if delivered {
                    return false;
                }
                let WaitPayload::Signal { accept, taken } = payload else {
                    unreachable!()
                };
                if accept_set(*accept) & bit == 0 {
                    return false;
                }
                *taken = signo;
                delivered = true;
                true
            });

        if delivered && (sticky & bit) == 0 {
            self.pending.replace(&mut *lock, pending & !bit);
        }

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Clear signal `signo`.
    ///
    /// *ISR-safe.*
    pub fn clear(&'static self, signo: u32) -> Result<(), BadContextError> {
        debug_assert!(signo < 32);
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let pending = self.pending.get(&*lock);
        self.pending.replace(&mut *lock, pending & !(1 << signo));
        Ok(())
    }

    /// Get the pending-signal set.
    ///
    /// *ISR-safe.*
    pub fn get(&'static self) -> Result<u32, BadContextError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.pending.get(&*lock))
    }

    /// Clear all pending signals and wake all waiters with `Stopped`.
    pub fn reset(&'static self) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        self.pending.replace(&mut *lock, 0);
        self.obj
            .wait_queue
            .wake_up_all(lock.borrow_mut(), Err(WaitTimeoutError::Stopped));
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// [`Signal::reset`], plus the signal object's storage is retired.
    /// Waiters are woken with `Deleted` if the object is pooled, `Stopped`
    /// otherwise.
    pub fn destroy(&'static self) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let result = if self.obj.is_pooled(lock.borrow_mut()) {
            WaitTimeoutError::Deleted
        } else {
            WaitTimeoutError::Stopped
        };
        self.pending.replace(&mut *lock, 0);
        self.obj
            .wait_queue
            .wake_up_all(lock.borrow_mut(), Err(result));
        self.obj.finalize(lock.borrow_mut());
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Take the lowest accepted pending signal, clearing it unless sticky.
    fn poll_core(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        accept: u32,
    ) -> Option<u32> {
        let pending = self.pending.get(&*lock);
        let candidates = pending & accept_set(accept);
        if candidates == 0 {
            return None;
        }

        let lowest = candidates & candidates.wrapping_neg();
        let sticky = self.sticky.get(&*lock);
        if sticky & lowest == 0 {
            self.pending.replace(&mut *lock, pending & !lowest);
        }
        Some(lowest.trailing_zeros())
    }
}
