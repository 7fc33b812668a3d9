//! The segment heap
//!
//! Dynamically created transfer primitives need queue/buffer storage. The
//! kernel carves it out of a fixed byte hunk embedded in
//! [`State`](crate::State), managed as tagged segments: a sorted free list
//! with first-fit allocation and neighbor merging on release.
use arrayvec::ArrayVec;

use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    utils::{Init, RawCell},
    PortThreading, HEAP_LEN,
};

/// Every segment is a multiple of this size and at least this aligned,
/// which satisfies every element type stored in kernel buffers.
const SEG_ALIGN: usize = 8;

/// The maximum number of disjoint free segments. Frees that would fragment
/// the heap beyond this are leaked (with a debug assertion).
const MAX_SEGMENTS: usize = 32;

#[derive(Debug, Clone, Copy)]
struct Segment {
    off: usize,
    len: usize,
}

/// A first-fit segment allocator over a fixed byte hunk.
pub(super) struct SegHeap<Traits: PortThreading> {
    storage: RawCell<[u8; HEAP_LEN]>,

    /// Free segments, sorted by offset, non-adjacent (merged eagerly).
    free: CpuLockCell<Traits, ArrayVec<Segment, MAX_SEGMENTS>>,

    initialized: CpuLockCell<Traits, bool>,
}

impl<Traits: PortThreading> Init for SegHeap<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        storage: RawCell::new([0; HEAP_LEN]),
        free: Init::INIT,
        initialized: Init::INIT,
    };
}

#[inline]
fn round_up(len: usize) -> usize {
    (len + SEG_ALIGN - 1) / SEG_ALIGN * SEG_ALIGN
}

impl<Traits: PortThreading> SegHeap<Traits> {
    fn ensure_init(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        if !self.initialized.get(&*lock) {
            self.free.write(&mut *lock).push(Segment {
                off: 0,
                len: HEAP_LEN,
            });
            self.initialized.replace(&mut *lock, true);
        }
    }

    /// Allocate `len` bytes (rounded up to the segment granule). Returns
    /// `None` when no segment is large enough.
    pub(super) fn alloc_bytes(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        len: usize,
    ) -> Option<&'static [RawCell<u8>]> {
        if len == 0 {
            return None;
        }
        self.ensure_init(lock.borrow_mut());
        let len = round_up(len);

        let free = self.free.write(&mut *lock);
        let index = free.iter().position(|seg| seg.len >= len)?;

        let seg = &mut free[index];
        let off = seg.off;
        seg.off += len;
        seg.len -= len;
        if seg.len == 0 {
            free.remove(index);
        }

        // Safety: `off..off + len` is in bounds of `storage` and was handed
        // out to nobody else. `RawCell<u8>` is layout-identical to `u8`.
        Some(unsafe {
            core::slice::from_raw_parts(
                (self.storage.get() as *const RawCell<u8>).add(off),
                len,
            )
        })
    }

    /// Release a region previously returned by [`Self::alloc_bytes`].
    pub(super) fn free_bytes(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        region: &'static [RawCell<u8>],
    ) {
        let base = self.storage.get() as usize;
        let off = region.as_ptr() as usize - base;
        let len = round_up(region.len());
        debug_assert!(off % SEG_ALIGN == 0 && off + len <= HEAP_LEN);

        let free = self.free.write(&mut *lock);

        // Insert, keeping the list sorted by offset.
        let index = free
            .iter()
            .position(|seg| seg.off > off)
            .unwrap_or(free.len());

        // Merge with the right neighbor?
        if index < free.len() && off + len == free[index].off {
            free[index].off = off;
            free[index].len += len;
        } else if free.try_insert(index, Segment { off, len }).is_err() {
            // The free list is full; the segment is leaked.
            debug_assert!(false, "segment heap free list overflow");
            return;
        }

        // Merge with the left neighbor?
        if index > 0 && free[index - 1].off + free[index - 1].len == free[index].off {
            free[index - 1].len += free[index].len;
            free.remove(index);
        }
    }

    /// Allocate an array of `n` elements of `T`, each initialized to
    /// `init_value`.
    pub(super) fn alloc_array<T: Copy>(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        n: usize,
        init_value: T,
    ) -> Option<&'static [RawCell<T>]> {
        debug_assert!(core::mem::align_of::<T>() <= SEG_ALIGN);
        let bytes = self.alloc_bytes(lock.borrow_mut(), n.checked_mul(core::mem::size_of::<T>())?)?;

        // Safety: The region is suitably sized and aligned for `[T; n]` and
        // exclusively ours; writes go through the raw pointer.
        let cells = unsafe {
            let ptr = bytes.as_ptr() as *const RawCell<T>;
            for i in 0..n {
                (*ptr.add(i)).get().write(init_value);
            }
            core::slice::from_raw_parts(ptr, n)
        };
        Some(cells)
    }

    /// Release an array previously returned by [`Self::alloc_array`].
    pub(super) fn free_array<T>(
        &'static self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        region: &'static [RawCell<T>],
    ) {
        let len = region.len() * core::mem::size_of::<T>();
        // Safety: Reconstructs the byte view of the same region.
        let bytes = unsafe {
            core::slice::from_raw_parts(region.as_ptr() as *const RawCell<u8>, len)
        };
        self.free_bytes(lock, bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::round_up;

    #[quickcheck_macros::quickcheck]
    fn round_up_is_aligned_and_sufficient(len: usize) -> bool {
        let len = len % (1 << 20);
        let rounded = round_up(len);
        rounded % super::SEG_ALIGN == 0 && rounded >= len
    }
}
