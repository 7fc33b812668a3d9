//! The common kernel object header
//!
//! Every kernel object embeds an [`Obj`]: its residence (who owns the
//! storage) and the queue of tasks blocked on it.
use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    utils::Init,
    wait::WaitQueue,
    PortThreading,
};

/// Who owns an object's storage, and whether the object is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Residence {
    /// An unclaimed pool slot.
    Free,
    /// Live, in application-provided storage. Destruction marks the object
    /// `Released` but cannot reclaim the storage.
    Static,
    /// Live, in a pool slot claimed by `create`. Destruction returns the
    /// slot.
    Pooled,
    /// Destroyed. Any API touch other than observing the tag is a contract
    /// violation.
    Released,
}

/// The common object header.
pub(super) struct Obj<Traits: PortThreading> {
    res: CpuLockCell<Traits, Residence>,
    pub(super) wait_queue: WaitQueue<Traits>,
}

impl<Traits: PortThreading> Obj<Traits> {
    /// Construct a header for an object in application-provided storage.
    pub(super) const fn new_static() -> Self {
        Self {
            res: CpuLockCell::new(Residence::Static),
            wait_queue: WaitQueue::new(),
        }
    }

    /// Construct a header for an unclaimed pool slot.
    pub(super) const fn new_free() -> Self {
        Self {
            res: CpuLockCell::new(Residence::Free),
            wait_queue: WaitQueue::new(),
        }
    }

    /// Assert that the object is live.
    ///
    /// Misuse of a destroyed object is a contract violation (fatal in debug
    /// builds), not a reportable error.
    pub(super) fn expect_live(&self, lock: CpuLockTokenRefMut<'_, Traits>) {
        debug_assert!(
            matches!(
                self.res.get(&*lock),
                Residence::Static | Residence::Pooled
            ),
            "operation on a destroyed or unconstructed kernel object"
        );
    }

    /// Return `true` if the object's storage came from a kernel pool.
    pub(super) fn is_pooled(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.res.get(&*lock) == Residence::Pooled
    }

    /// Retire the object. A pooled slot becomes reusable; a static object is
    /// permanently marked `Released`. Returns `true` if the slot was pooled.
    pub(super) fn finalize(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        match self.res.get(&*lock) {
            Residence::Pooled => {
                self.res.replace(&mut *lock, Residence::Free);
                true
            }
            _ => {
                self.res.replace(&mut *lock, Residence::Released);
                false
            }
        }
    }
}

impl<Traits: PortThreading> Init for Obj<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new_free();
}

/// Implemented by every control block type so that the pool allocator can
/// reach its header.
pub(super) trait KernelObject<Traits: PortThreading>: Sized + Sync + 'static {
    fn obj(&self) -> &Obj<Traits>;
}

/// Claim a free slot from `pool`.
pub(super) fn allocate_from_pool<Traits: PortThreading, T: KernelObject<Traits>>(
    pool: &'static [T],
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) -> Option<&'static T> {
    for slot in pool {
        if slot.obj().res.get(&*lock) == Residence::Free {
            slot.obj().res.replace(&mut *lock, Residence::Pooled);
            return Some(slot);
        }
    }
    None
}
