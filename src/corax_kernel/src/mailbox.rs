//! Mailbox queues
//!
//! A mailbox transfers fixed-size records through a ring buffer. When the
//! ring is full, senders block and the receiver copies directly from the
//! blocked sender's record (and symmetrically for empty-ring receivers);
//! this is the rendezvous path.
use core::{fmt, ptr::NonNull};

use crate::{
    error::{
        BadContextError, RecvError, RecvTimeoutError, SendError, SendTimeoutError, TryRecvError,
        TrySendError, WaitTimeoutError,
    },
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    object::{self, KernelObject, Obj},
    ring::Ring,
    state, task,
    utils::{Init, RawCell},
    wait::WaitPayload,
    KernelTraits, PortThreading, Ticks, INFINITE,
};

/// *Mailbox control block*.
pub struct Mailbox<Traits: PortThreading> {
    pub(super) obj: Obj<Traits>,
    ring: Ring<Traits>,
    rec_size: CpuLockCell<Traits, usize>,
}

impl<Traits: PortThreading> Mailbox<Traits> {
    /// Construct a mailbox in place over application-provided storage.
    ///
    /// The capacity is `buf.len() / rec_size` records.
    pub const fn new(buf: &'static [RawCell<u8>], rec_size: usize) -> Self {
        assert!(rec_size > 0, "record size must be nonzero");
        assert!(
            buf.len() >= rec_size,
            "storage holds less than one record"
        );
        Self {
            obj: Obj::new_static(),
            ring: Ring::new(Some(buf), buf.len() / rec_size * rec_size),
            rec_size: CpuLockCell::new(rec_size),
        }
    }
}

impl<Traits: PortThreading> Init for Mailbox<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        obj: Obj::new_free(),
        ring: Init::INIT,
        rec_size: CpuLockCell::new(1),
    };
}

impl<Traits: PortThreading> KernelObject<Traits> for Mailbox<Traits> {
    fn obj(&self) -> &Obj<Traits> {
        &self.obj
    }
}

impl<Traits: PortThreading> fmt::Debug for Mailbox<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("self", &(self as *const _))
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> Mailbox<Traits> {
    /// Allocate and construct a mailbox from the kernel pool, with storage
    /// for `limit` records of `rec_size` bytes carved from the segment
    /// heap. Returns `None` on exhaustion of either.
    pub fn create(limit: usize, rec_size: usize) -> Option<&'static Self> {
        if limit == 0 || rec_size == 0 {
            return None;
        }
        let mut lock = klock::lock_cpu::<Traits>().ok()?;
        let state = Traits::state();

        let bytes = limit.checked_mul(rec_size)?;
        let buf = state.heap.alloc_bytes(lock.borrow_mut(), bytes)?;

        let Some(mbox) = object::allocate_from_pool(&state.mailbox_pool[..], lock.borrow_mut())
        else {
            state.heap.free_bytes(lock.borrow_mut(), buf);
            return None;
        };
        mbox.ring.configure(lock.borrow_mut(), buf, bytes);
        mbox.rec_size.replace(&mut *lock, rec_size);
        Some(mbox)
    }

    /// Receive one record without blocking. `data` must hold at least one
    /// record.
    ///
    /// *ISR-safe.*
    pub fn take(&'static self, data: &mut [u8]) -> Result<(), TryRecvError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());
        self.check_buffer(lock.borrow_mut(), data.len());

        if self.ring.count(lock.borrow_mut()) == 0 {
            return Err(TryRecvError::Timeout);
        }
        self.get_update(lock.borrow_mut(), data.as_mut_ptr());
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Receive one record, blocking indefinitely while the mailbox is
    /// empty.
    pub fn recv(&'static self, data: &mut [u8]) -> Result<(), RecvError> {
        match self.recv_for(data, INFINITE) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::BadContext) => Err(RecvError::BadContext),
            Err(RecvTimeoutError::BadParam) => Err(RecvError::BadParam),
            Err(RecvTimeoutError::Stopped) => Err(RecvError::Stopped),
            Err(RecvTimeoutError::Deleted) => Err(RecvError::Deleted),
            Err(RecvTimeoutError::Timeout) => {
                unreachable!("got timeout result for a non-timeout wait")
            }
        }
    }

    /// Receive one record, blocking for up to `delay` ticks.
    pub fn recv_for(&'static self, data: &mut [u8], delay: Ticks) -> Result<(), RecvTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());
        self.check_buffer(lock.borrow_mut(), data.len());

        let result = if self.ring.count(lock.borrow_mut()) > 0 {
            self.get_update(lock.borrow_mut(), data.as_mut_ptr());
            Ok(())
        } else {
            self.obj
                .wait_queue
                .wait_timeout(
                    lock.borrow_mut(),
                    WaitPayload::BoxRecv {
                        dst: NonNull::new(data.as_mut_ptr()).unwrap(),
                    },
                    delay,
                )
                .map(|_| ())
                .map_err(RecvTimeoutError::from)
        };
        task::return_to_task(lock);
        result
    }

    /// Receive one record, blocking until the absolute time `time`.
    pub fn recv_until(&'static self, data: &mut [u8], time: Ticks) -> Result<(), RecvTimeoutError> {
        self.recv_for(data, task::delay_until::<Traits>(time)?)
    }

    /// Send one record without blocking. Returns `Timeout` when the mailbox
    /// is full.
    ///
    /// *ISR-safe.*
    pub fn give(&'static self, data: &[u8]) -> Result<(), TrySendError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());
        self.check_buffer(lock.borrow_mut(), data.len());

        if self.ring.space(lock.borrow_mut()) == 0 {
            return Err(TrySendError::Timeout);
        }
        self.put_update(lock.borrow_mut(), data.as_ptr());
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Send one record, blocking indefinitely while the mailbox is full.
    pub fn send(&'static self, data: &[u8]) -> Result<(), SendError> {
        match self.send_for(data, INFINITE) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::BadContext) => Err(SendError::BadContext),
            Err(SendTimeoutError::BadParam) => Err(SendError::BadParam),
            Err(SendTimeoutError::Stopped) => Err(SendError::Stopped),
            Err(SendTimeoutError::Deleted) => Err(SendError::Deleted),
            Err(SendTimeoutError::Timeout) => {
                unreachable!("got timeout result for a non-timeout wait")
            }
        }
    }

    /// Send one record, blocking for up to `delay` ticks.
    pub fn send_for(&'static self, data: &[u8], delay: Ticks) -> Result<(), SendTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());
        self.check_buffer(lock.borrow_mut(), data.len());

        let result = if self.ring.space(lock.borrow_mut()) > 0 {
            self.put_update(lock.borrow_mut(), data.as_ptr());
            Ok(())
        } else {
            self.obj
                .wait_queue
                .wait_timeout(
                    lock.borrow_mut(),
                    WaitPayload::BoxSend {
                        src: NonNull::new(data.as_ptr() as *mut u8).unwrap(),
                    },
                    delay,
                )
                .map(|_| ())
                .map_err(SendTimeoutError::from)
        };
        task::return_to_task(lock);
        result
    }

    /// Send one record, blocking until the absolute time `time`.
    pub fn send_until(&'static self, data: &[u8], time: Ticks) -> Result<(), SendTimeoutError> {
        self.send_for(data, task::delay_until::<Traits>(time)?)
    }

    /// Send one record, overwriting the oldest one if the mailbox is full.
    ///
    /// *ISR-safe.*
    pub fn push(&'static self, data: &[u8]) -> Result<(), TrySendError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());
        self.check_buffer(lock.borrow_mut(), data.len());

        // Flush blocked senders into the slots freed by skipping, oldest
        // record first.
        let rec_size = self.rec_size.get(&*lock);
        while self.ring.space(lock.borrow_mut()) == 0 {
            self.ring.skip(lock.borrow_mut(), rec_size);
            if let Some(sender) = self.obj.wait_queue.wake_up_one(lock.borrow_mut()) {
                let WaitPayload::BoxSend { src } = sender.wait.payload.get(&*lock) else {
                    unreachable!()
                };
                // Safety: `src` is one record owned by the (until now)
                // blocked sender.
                unsafe { self.ring.put(lock.borrow_mut(), src.as_ptr(), rec_size) };
            }
        }

        self.put_update(lock.borrow_mut(), data.as_ptr());
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// The number of buffered records.
    pub fn count(&'static self) -> Result<usize, BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());
        let rec_size = self.rec_size.get(&*lock);
        Ok(self.ring.count(lock.borrow_mut()) / rec_size)
    }

    /// The number of free record slots.
    pub fn space(&'static self) -> Result<usize, BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());
        let rec_size = self.rec_size.get(&*lock);
        Ok(self.ring.space(lock.borrow_mut()) / rec_size)
    }

    /// The capacity in records.
    pub fn limit(&'static self) -> Result<usize, BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());
        let rec_size = self.rec_size.get(&*lock);
        Ok(self.ring.limit(lock.borrow_mut()) / rec_size)
    }

    /// Drop all buffered records and wake all waiters with `Stopped`.
    pub fn reset(&'static self) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        self.ring.clear(lock.borrow_mut());
        self.obj
            .wait_queue
            .wake_up_all(lock.borrow_mut(), Err(WaitTimeoutError::Stopped));
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// [`Mailbox::reset`], plus the mailbox's storage is retired (and, for
    /// a pooled mailbox, its ring storage is returned to the segment heap).
    pub fn destroy(&'static self) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let pooled = self.obj.is_pooled(lock.borrow_mut());
        let result = if pooled {
            WaitTimeoutError::Deleted
        } else {
            WaitTimeoutError::Stopped
        };
        self.obj
            .wait_queue
            .wake_up_all(lock.borrow_mut(), Err(result));

        let storage = self.ring.take_storage(lock.borrow_mut());
        if pooled {
            if let Some(storage) = storage {
                Traits::state().heap.free_bytes(lock.borrow_mut(), storage);
            }
        }
        self.obj.finalize(lock.borrow_mut());
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    fn check_buffer(&'static self, lock: CpuLockTokenRefMut<'_, Traits>, len: usize) {
        debug_assert!(
            len >= self.rec_size.get(&*lock),
            "caller buffer is smaller than one record"
        );
        let _ = (lock, len);
    }

    /// Take one record out of the ring, then top the ring up from a blocked
    /// sender if there is one.
    fn get_update(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, dst: *mut u8) {
        let rec_size = self.rec_size.get(&*lock);
        // Safety: `dst` is at least one record, per `check_buffer`.
        unsafe { self.ring.get(lock.borrow_mut(), dst, rec_size) };

        if let Some(sender) = self.obj.wait_queue.wake_up_one(lock.borrow_mut()) {
            let WaitPayload::BoxSend { src } = sender.wait.payload.get(&*lock) else {
                unreachable!()
            };
            // Safety: `src` is one record owned by the blocked sender.
            unsafe { self.ring.put(lock.borrow_mut(), src.as_ptr(), rec_size) };
        }
    }

    /// Put one record into the ring, then serve a blocked receiver if there
    /// is one.
    fn put_update(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, src: *const u8) {
        let rec_size = self.rec_size.get(&*lock);
        // Safety: `src` is at least one record, per `check_buffer`.
        unsafe { self.ring.put(lock.borrow_mut(), src, rec_size) };

        if let Some(receiver) = self.obj.wait_queue.wake_up_one(lock.borrow_mut()) {
            let WaitPayload::BoxRecv { dst } = receiver.wait.payload.get(&*lock) else {
                unreachable!()
            };
            // Safety: `dst` is one record's worth of space owned by the
            // blocked receiver.
            unsafe { self.ring.get(lock.borrow_mut(), dst.as_ptr(), rec_size) };
        }
    }
}
