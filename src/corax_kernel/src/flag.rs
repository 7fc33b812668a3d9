//! Flags
//!
//! A flag object is a 32-bit set. Waiters specify the bits they are
//! interested in and a wait mode; `give` ORs bits in and satisfies matching
//! waiters, letting consuming waiters clear the bits they took.
use core::fmt;

use bitflags::bitflags;

use crate::{
    error::{
        BadContextError, PollFlagError, WaitFlagError, WaitFlagTimeoutError, WaitTimeoutError,
    },
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    object::{self, KernelObject, Obj},
    state, task,
    utils::Init,
    wait::WaitPayload,
    KernelTraits, PortThreading, Ticks, INFINITE,
};

bitflags! {
    /// The wait mode of a flag operation.
    ///
    /// The empty mode waits for *any* of the requested bits and consumes the
    /// matched ones.
    pub struct FlagMode: u32 {
        /// Wait until *all* requested bits are set; partial matches are
        /// accumulated (and consumed, unless `PROTECT`).
        const ALL = 1 << 0;
        /// Do not consume the matched bits.
        const PROTECT = 1 << 1;
        /// Ignore the current state; only bits arriving through `give` while
        /// waiting can satisfy the wait.
        const IGNORE = 1 << 2;
    }
}

/// Compute the subset of `bits` that is still outstanding given the current
/// `state`, consuming matched bits from `state` as the mode dictates.
/// A zero return value means the wait condition is satisfied.
fn poll_core(state: &mut u32, bits: u32, mode: FlagMode) -> u32 {
    let mut remaining = bits;

    if !mode.contains(FlagMode::IGNORE) {
        remaining &= !*state;
        if !mode.contains(FlagMode::PROTECT) {
            *state &= !bits;
        }
    }

    if remaining != bits && !mode.contains(FlagMode::ALL) {
        // Any-mode: one matched bit satisfies the whole wait.
        remaining = 0;
    }

    remaining
}

/// *Flag control block*.
pub struct Flag<Traits: PortThreading> {
    pub(super) obj: Obj<Traits>,
    flags: CpuLockCell<Traits, u32>,
}

impl<Traits: PortThreading> Flag<Traits> {
    /// Construct a flag in place, for `static` storage provided by the
    /// application.
    pub const fn new(init: u32) -> Self {
        Self {
            obj: Obj::new_static(),
            flags: CpuLockCell::new(init),
        }
    }
}

impl<Traits: PortThreading> Init for Flag<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        obj: Obj::new_free(),
        flags: CpuLockCell::new(0),
    };
}

impl<Traits: PortThreading> KernelObject<Traits> for Flag<Traits> {
    fn obj(&self) -> &Obj<Traits> {
        &self.obj
    }
}

impl<Traits: PortThreading> fmt::Debug for Flag<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Flag")
            .field("self", &(self as *const _))
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> Flag<Traits> {
    /// Allocate and construct a flag from the kernel pool. Returns `None` on
    /// pool exhaustion.
    pub fn create(init: u32) -> Option<&'static Self> {
        let mut lock = klock::lock_cpu::<Traits>().ok()?;
        let flag = object::allocate_from_pool(&Traits::state().flag_pool[..], lock.borrow_mut())?;
        flag.flags.replace(&mut *lock, init);
        Some(flag)
    }

    /// Check the wait condition without blocking. `Timeout` when it is not
    /// yet satisfied (partial matches are still consumed, mode permitting).
    ///
    /// *ISR-safe.*
    pub fn take(&'static self, bits: u32, mode: FlagMode) -> Result<(), PollFlagError> {
        debug_assert!(bits != 0);
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let mut state = self.flags.get(&*lock);
        let remaining = poll_core(&mut state, bits, mode);
        self.flags.replace(&mut *lock, state);

        if remaining == 0 {
            Ok(())
        } else {
            Err(PollFlagError::Timeout)
        }
    }

    /// Wait until the requested bits are given.
    pub fn wait(&'static self, bits: u32, mode: FlagMode) -> Result<(), WaitFlagError> {
        match self.wait_for(bits, mode, INFINITE) {
            Ok(()) => Ok(()),
            Err(WaitFlagTimeoutError::BadContext) => Err(WaitFlagError::BadContext),
            Err(WaitFlagTimeoutError::Stopped) => Err(WaitFlagError::Stopped),
            Err(WaitFlagTimeoutError::Deleted) => Err(WaitFlagError::Deleted),
            Err(WaitFlagTimeoutError::Timeout) => {
                unreachable!("got timeout result for a non-timeout wait")
            }
        }
    }

    /// [`Flag::wait`] with a timeout.
    pub fn wait_for(
        &'static self,
        bits: u32,
        mode: FlagMode,
        delay: Ticks,
    ) -> Result<(), WaitFlagTimeoutError> {
        debug_assert!(bits != 0);
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let mut state = self.flags.get(&*lock);
        let remaining = poll_core(&mut state, bits, mode);
        self.flags.replace(&mut *lock, state);

        let result = if remaining == 0 {
            Ok(())
        } else {
            self.obj
                .wait_queue
                .wait_timeout(
                    lock.borrow_mut(),
                    WaitPayload::Flag {
                        bits: remaining,
                        mode,
                    },
                    delay,
                )
                .map(|_| ())
                .map_err(WaitFlagTimeoutError::from)
        };
        task::return_to_task(lock);
        result
    }

    /// [`Flag::wait`] with an absolute deadline.
    pub fn wait_until(
        &'static self,
        bits: u32,
        mode: FlagMode,
        time: Ticks,
    ) -> Result<(), WaitFlagTimeoutError> {
        self.wait_for(bits, mode, task::delay_until::<Traits>(time)?)
    }

    /// OR `bits` into the flag, then satisfy matching waiters in queue
    /// order. Returns the resulting flag value.
    ///
    /// *ISR-safe.*
    pub fn give(&'static self, bits: u32) -> Result<u32, BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let mut state = self.flags.get(&*lock) | bits;

        self.obj
            .wait_queue
            .wake_up_all_conditional(lock.borrow_mut(), |_task, payload| {
                let WaitPayload::Flag {
                    bits: waiter_bits,
                    mode,
                } = payload
                else {
                    unreachable!()
                };

                let matched = *waiter_bits & bits;
                if matched == 0 {
                    return false;
                }
                if !mode.contains(FlagMode::PROTECT) {
                    state &= !matched;
                }
                *waiter_bits &= !bits;
                *waiter_bits == 0 || !mode.contains(FlagMode::ALL)
            });

        self.flags.replace(&mut *lock, state);

        let result = state;
        task::unlock_cpu_and_check_preemption(lock);
        Ok(result)
    }

    /// Clear the given bits. Returns the previous flag value.
    ///
    /// *ISR-safe.*
    pub fn clear(&'static self, bits: u32) -> Result<u32, BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let old = self.flags.get(&*lock);
        self.flags.replace(&mut *lock, old & !bits);
        Ok(old)
    }

    /// Get the current flag value.
    ///
    /// *ISR-safe.*
    pub fn get(&'static self) -> Result<u32, BadContextError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.flags.get(&*lock))
    }

    /// Clear the flag and wake all waiters with `Stopped`.
    pub fn reset(&'static self) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        self.reset_inner(lock.borrow_mut(), WaitTimeoutError::Stopped);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// [`Flag::reset`], plus the flag's storage is retired. Waiters are
    /// woken with `Deleted` if the flag is pooled, `Stopped` otherwise.
    pub fn destroy(&'static self) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let result = if self.obj.is_pooled(lock.borrow_mut()) {
            WaitTimeoutError::Deleted
        } else {
            WaitTimeoutError::Stopped
        };
        self.reset_inner(lock.borrow_mut(), result);
        self.obj.finalize(lock.borrow_mut());
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    fn reset_inner(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        wait_result: WaitTimeoutError,
    ) {
        self.flags.replace(&mut *lock, 0);
        self.obj
            .wait_queue
            .wake_up_all(lock.borrow_mut(), Err(wait_result));
    }
}

#[cfg(test)]
mod tests {
    use super::{poll_core, FlagMode};

    #[test]
    fn any_mode_matches_one_bit()
    {
        let mut state = 0b0100;
        assert_eq!(poll_core(&mut state, 0b0101, FlagMode::empty()), 0);
        // The matched bit is consumed.
        assert_eq!(state, 0);
    }

    #[test]
    fn all_mode_accumulates() {
        let mut state = 0b0001;
        // Only one of the two requested bits is present.
        assert_eq!(poll_core(&mut state, 0b0101, FlagMode::ALL), 0b0100);
        assert_eq!(state, 0);

        let mut state = 0b0101;
        assert_eq!(poll_core(&mut state, 0b0101, FlagMode::ALL), 0);
        assert_eq!(state, 0);
    }

    #[test]
    fn protect_mode_does_not_consume() {
        let mut state = 0b0101;
        assert_eq!(poll_core(&mut state, 0b0101, FlagMode::PROTECT), 0);
        assert_eq!(state, 0b0101);
    }

    #[test]
    fn ignore_mode_never_satisfied_by_state() {
        let mut state = 0b1111;
        assert_eq!(
            poll_core(&mut state, 0b0101, FlagMode::IGNORE),
            0b0101
        );
        assert_eq!(state, 0b1111);
    }
}
