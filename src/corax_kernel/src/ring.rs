//! The byte ring shared by the transfer primitives (mailbox, stream buffer,
//! message buffer).
use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    utils::{Init, RawCell},
    PortThreading,
};

/// A bounded byte ring over kernel-managed storage.
///
/// All accesses happen under CPU Lock; the storage cells are only ever
/// touched through these methods.
pub(super) struct Ring<Traits: PortThreading> {
    buf: CpuLockCell<Traits, Option<&'static [RawCell<u8>]>>,

    /// Capacity in bytes. May be less than the storage length (a mailbox
    /// rounds it down to a whole number of records).
    limit: CpuLockCell<Traits, usize>,

    count: CpuLockCell<Traits, usize>,
    head: CpuLockCell<Traits, usize>,
    tail: CpuLockCell<Traits, usize>,
}

impl<Traits: PortThreading> Ring<Traits> {
    pub(super) const fn new(buf: Option<&'static [RawCell<u8>]>, limit: usize) -> Self {
        Self {
            buf: CpuLockCell::new(buf),
            limit: CpuLockCell::new(limit),
            count: CpuLockCell::new(0),
            head: CpuLockCell::new(0),
            tail: CpuLockCell::new(0),
        }
    }

    /// Attach storage at runtime (`create` path).
    pub(super) fn configure(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        buf: &'static [RawCell<u8>],
        limit: usize,
    ) {
        debug_assert!(limit <= buf.len());
        self.buf.replace(&mut *lock, Some(buf));
        self.limit.replace(&mut *lock, limit);
        self.clear(lock);
    }

    /// Detach the storage (`destroy` path), returning it for deallocation.
    pub(super) fn take_storage(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static [RawCell<u8>]> {
        self.limit.replace(&mut *lock, 0);
        self.clear(lock.borrow_mut());
        self.buf.replace(&mut *lock, None)
    }

    pub(super) fn clear(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        self.count.replace(&mut *lock, 0);
        self.head.replace(&mut *lock, 0);
        self.tail.replace(&mut *lock, 0);
    }

    pub(super) fn count(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> usize {
        self.count.get(&*lock)
    }

    pub(super) fn limit(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> usize {
        self.limit.get(&*lock)
    }

    pub(super) fn space(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> usize {
        self.limit(lock.borrow_mut()) - self.count(lock.borrow_mut())
    }

    /// Copy `n` bytes from `src` into the ring.
    ///
    /// # Safety
    ///
    /// `src` must be valid for reading `n` bytes, and `n` must not exceed
    /// the free space.
    pub(super) unsafe fn put(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        src: *const u8,
        n: usize,
    ) {
        let buf = self.buf.get(&*lock).unwrap();
        let limit = self.limit.get(&*lock);
        debug_assert!(self.count.get(&*lock) + n <= limit);

        let mut i = self.tail.get(&*lock);
        for k in 0..n {
            // Safety: In bounds; the cell is owned by this ring and only
            // accessed under CPU Lock. The caller vouches for `src`.
            unsafe { *buf[i].get() = *src.add(k) };
            i += 1;
            if i == limit {
                i = 0;
            }
        }
        self.tail.replace(&mut *lock, i);
        let count = self.count.get(&*lock);
        self.count.replace(&mut *lock, count + n);
    }

    /// Copy `n` bytes out of the ring into `dst`.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writing `n` bytes, and `n` must not exceed
    /// the current count.
    pub(super) unsafe fn get(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        dst: *mut u8,
        n: usize,
    ) {
        let buf = self.buf.get(&*lock).unwrap();
        let limit = self.limit.get(&*lock);
        debug_assert!(n <= self.count.get(&*lock));

        let mut i = self.head.get(&*lock);
        for k in 0..n {
            // Safety: In bounds; the caller vouches for `dst`.
            unsafe { *dst.add(k) = *buf[i].get() };
            i += 1;
            if i == limit {
                i = 0;
            }
        }
        self.head.replace(&mut *lock, i);
        let count = self.count.get(&*lock);
        self.count.replace(&mut *lock, count - n);
    }

    /// Copy the `n` oldest bytes into `dst` without consuming them.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writing `n` bytes, and `n` must not exceed
    /// the current count.
    pub(super) unsafe fn peek(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        dst: *mut u8,
        n: usize,
    ) {
        let buf = self.buf.get(&*lock).unwrap();
        let limit = self.limit.get(&*lock);
        debug_assert!(n <= self.count.get(&*lock));

        let mut i = self.head.get(&*lock);
        for k in 0..n {
            // Safety: In bounds; the caller vouches for `dst`.
            unsafe { *dst.add(k) = *buf[i].get() };
            i += 1;
            if i == limit {
                i = 0;
            }
        }
    }

    /// Discard the `n` oldest bytes.
    pub(super) fn skip(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, n: usize) {
        let limit = self.limit.get(&*lock);
        debug_assert!(n <= self.count.get(&*lock));

        let mut head = self.head.get(&*lock) + n;
        if head >= limit {
            head -= limit;
        }
        self.head.replace(&mut *lock, head);
        let count = self.count.get(&*lock);
        self.count.replace(&mut *lock, count - n);
    }
}

impl<Traits: PortThreading> Init for Ring<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new(None, 0);
}
