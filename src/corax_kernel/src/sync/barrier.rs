//! Barriers
use crate::{
    error::{WaitFlagError, WaitFlagTimeoutError},
    flag::{Flag, FlagMode},
    klock::{self, CpuLockCell},
    utils::Init,
    KernelTraits, PortThreading, Ticks,
};

/// A sense-reversing barrier for a fixed party count, built on a [`Flag`].
///
/// Each generation uses one of two flag bits; the last arriver clears the
/// *next* generation's bit and then releases everyone waiting on the current
/// one.
pub struct Barrier<Traits: PortThreading> {
    flag: Flag<Traits>,
    remaining: CpuLockCell<Traits, u32>,
    parties: u32,
    sense: CpuLockCell<Traits, bool>,
}

impl<Traits: PortThreading> Barrier<Traits> {
    /// Construct a barrier for `parties` tasks, for `static` storage
    /// provided by the application.
    pub const fn new(parties: u32) -> Self {
        assert!(parties > 0, "a barrier needs at least one party");
        Self {
            flag: Flag::new(0),
            remaining: CpuLockCell::new(parties),
            parties,
            sense: CpuLockCell::new(false),
        }
    }
}

#[inline]
fn gen_bit(sense: bool) -> u32 {
    1 << (sense as u32)
}

impl<Traits: KernelTraits> Barrier<Traits> {
    /// Block until all parties have arrived. The last arriver releases the
    /// others and begins the next generation.
    pub fn wait(&'static self) -> Result<(), WaitFlagError> {
        match self.arrive()? {
            None => Ok(()),
            Some(bit) => self
                .flag
                .wait(bit, FlagMode::PROTECT)
                .map(|_| ()),
        }
    }

    /// [`Barrier::wait`] with a timeout. A timed-out waiter still counts as
    /// arrived.
    pub fn wait_for(&'static self, delay: Ticks) -> Result<(), WaitFlagTimeoutError> {
        match self.arrive()? {
            None => Ok(()),
            Some(bit) => self
                .flag
                .wait_for(bit, FlagMode::PROTECT, delay)
                .map(|_| ()),
        }
    }

    /// Record the caller's arrival. Returns the flag bit to wait on, or
    /// `None` if the caller was the last arriver and has already released
    /// the others.
    fn arrive(&'static self) -> Result<Option<u32>, crate::error::BadContextError> {
        let (sense, last) = {
            let mut lock = klock::lock_cpu::<Traits>()?;
            let sense = self.sense.get(&*lock);
            let remaining = self.remaining.get(&*lock) - 1;
            if remaining == 0 {
                self.remaining.replace(&mut *lock, self.parties);
                self.sense.replace(&mut *lock, !sense);
                (sense, true)
            } else {
                self.remaining.replace(&mut *lock, remaining);
                (sense, false)
            }
        };

        if last {
            // Retire the next generation's bit before opening this one, so
            // that early arrivers of the next generation always block.
            self.flag.clear(gen_bit(!sense))?;
            self.flag.give(gen_bit(sense))?;
            Ok(None)
        } else {
            Ok(Some(gen_bit(sense)))
        }
    }
}

impl<Traits: PortThreading> Init for Barrier<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new(1);
}
