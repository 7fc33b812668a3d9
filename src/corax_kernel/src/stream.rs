//! Stream buffers
//!
//! A stream buffer transfers an unframed byte stream. Sends are
//! all-or-nothing: a send that does not fit the free space blocks (or times
//! out), and a send larger than the whole buffer fails outright. Receives
//! return up to the requested count.
use core::{fmt, ptr::NonNull};

use crate::{
    error::{
        BadContextError, RecvError, RecvTimeoutError, SendError, SendTimeoutError, TryRecvError,
        TrySendError, WaitTimeoutError,
    },
    klock::{self, CpuLockTokenRefMut},
    object::{self, KernelObject, Obj},
    ring::Ring,
    state, task,
    utils::{Init, RawCell},
    wait::WaitPayload,
    KernelTraits, PortThreading, Ticks, INFINITE,
};

/// *Stream buffer control block*.
pub struct StreamBuffer<Traits: PortThreading> {
    pub(super) obj: Obj<Traits>,
    ring: Ring<Traits>,
}

impl<Traits: PortThreading> StreamBuffer<Traits> {
    /// Construct a stream buffer in place over application-provided
    /// storage.
    pub const fn new(buf: &'static [RawCell<u8>]) -> Self {
        assert!(!buf.is_empty(), "storage must be nonzero");
        Self {
            obj: Obj::new_static(),
            ring: Ring::new(Some(buf), buf.len()),
        }
    }
}

impl<Traits: PortThreading> Init for StreamBuffer<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        obj: Obj::new_free(),
        ring: Init::INIT,
    };
}

impl<Traits: PortThreading> KernelObject<Traits> for StreamBuffer<Traits> {
    fn obj(&self) -> &Obj<Traits> {
        &self.obj
    }
}

impl<Traits: PortThreading> fmt::Debug for StreamBuffer<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StreamBuffer")
            .field("self", &(self as *const _))
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> StreamBuffer<Traits> {
    /// Allocate and construct a stream buffer from the kernel pool, with
    /// `limit` bytes of ring storage carved from the segment heap. Returns
    /// `None` on exhaustion of either.
    pub fn create(limit: usize) -> Option<&'static Self> {
        if limit == 0 {
            return None;
        }
        let mut lock = klock::lock_cpu::<Traits>().ok()?;
        let state = Traits::state();

        let buf = state.heap.alloc_bytes(lock.borrow_mut(), limit)?;
        let Some(stm) = object::allocate_from_pool(&state.stream_pool[..], lock.borrow_mut())
        else {
            state.heap.free_bytes(lock.borrow_mut(), buf);
            return None;
        };
        stm.ring.configure(lock.borrow_mut(), buf, limit);
        Some(stm)
    }

    /// Receive up to `data.len()` bytes without blocking. Returns the number
    /// of bytes read; an empty buffer reports `Timeout`.
    ///
    /// *ISR-safe.*
    pub fn take(&'static self, data: &mut [u8]) -> Result<usize, TryRecvError> {
        debug_assert!(!data.is_empty());
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        if self.ring.count(lock.borrow_mut()) == 0 {
            return Err(TryRecvError::Timeout);
        }
        let read = self.get_update(lock.borrow_mut(), data.as_mut_ptr(), data.len());
        task::unlock_cpu_and_check_preemption(lock);
        Ok(read)
    }

    /// Receive up to `data.len()` bytes, blocking indefinitely while the
    /// buffer is empty.
    pub fn recv(&'static self, data: &mut [u8]) -> Result<usize, RecvError> {
        match self.recv_for(data, INFINITE) {
            Ok(read) => Ok(read),
            Err(RecvTimeoutError::BadContext) => Err(RecvError::BadContext),
            Err(RecvTimeoutError::BadParam) => Err(RecvError::BadParam),
            Err(RecvTimeoutError::Stopped) => Err(RecvError::Stopped),
            Err(RecvTimeoutError::Deleted) => Err(RecvError::Deleted),
            Err(RecvTimeoutError::Timeout) => {
                unreachable!("got timeout result for a non-timeout wait")
            }
        }
    }

    /// Receive up to `data.len()` bytes, blocking for up to `delay` ticks.
    pub fn recv_for(
        &'static self,
        data: &mut [u8],
        delay: Ticks,
    ) -> Result<usize, RecvTimeoutError> {
        debug_assert!(!data.is_empty());
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let result = if self.ring.count(lock.borrow_mut()) > 0 {
            Ok(self.get_update(lock.borrow_mut(), data.as_mut_ptr(), data.len()))
        } else {
            self.obj
                .wait_queue
                .wait_timeout(
                    lock.borrow_mut(),
                    WaitPayload::StreamRecv {
                        dst: NonNull::new(data.as_mut_ptr()).unwrap(),
                        len: data.len(),
                    },
                    delay,
                )
                .map(|payload| match payload {
                    // The sender records how many bytes it delivered.
                    WaitPayload::StreamRecv { len, .. } => len,
                    _ => unreachable!(),
                })
                .map_err(RecvTimeoutError::from)
        };
        task::return_to_task(lock);
        result
    }

    /// Receive up to `data.len()` bytes, blocking until the absolute time
    /// `time`.
    pub fn recv_until(
        &'static self,
        data: &mut [u8],
        time: Ticks,
    ) -> Result<usize, RecvTimeoutError> {
        self.recv_for(data, task::delay_until::<Traits>(time)?)
    }

    /// Send `data` without blocking. `Timeout` when it does not currently
    /// fit; `BadParam` when it can never fit.
    ///
    /// *ISR-safe.*
    pub fn give(&'static self, data: &[u8]) -> Result<(), TrySendError> {
        debug_assert!(!data.is_empty());
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        match self.poll_send(lock.borrow_mut(), data) {
            Ok(()) => {
                task::unlock_cpu_and_check_preemption(lock);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Send `data`, blocking indefinitely until it fits.
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

    /// Send `data`, blocking for up to `delay` ticks until it fits.
    pub fn send_for(&'static self, data: &[u8], delay: Ticks) -> Result<(), SendTimeoutError> {
        debug_assert!(!data.is_empty());
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let result = match self.poll_send(lock.borrow_mut(), data) {
            Ok(()) => Ok(()),
            Err(TrySendError::BadParam) => Err(SendTimeoutError::BadParam),
            Err(TrySendError::Timeout) => self
                .obj
                .wait_queue
                .wait_timeout(
                    lock.borrow_mut(),
                    WaitPayload::StreamSend {
                        src: NonNull::new(data.as_ptr() as *mut u8).unwrap(),
                        len: data.len(),
                    },
                    delay,
                )
                .map(|_| ())
                .map_err(SendTimeoutError::from),
            Err(TrySendError::BadContext) => unreachable!(),
        };
        task::return_to_task(lock);
        result
    }

    /// Send `data`, blocking until the absolute time `time`.
    pub fn send_until(&'static self, data: &[u8], time: Ticks) -> Result<(), SendTimeoutError> {
        self.send_for(data, task::delay_until::<Traits>(time)?)
    }

    /// Send `data` unconditionally, discarding the oldest buffered bytes as
    /// needed to make room. Blocked senders are flushed into the ring
    /// first, with the same skip-ahead policy.
    ///
    /// *ISR-safe.*
    pub fn push(&'static self, data: &[u8]) -> Result<(), TrySendError> {
        debug_assert!(!data.is_empty());
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let limit = self.ring.limit(lock.borrow_mut());
        if data.len() > limit {
            return Err(TrySendError::BadParam);
        }

        self.skip_update(lock.borrow_mut(), data.len());
        self.put_update(lock.borrow_mut(), data.as_ptr(), data.len());
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// The number of buffered bytes.
    pub fn count(&'static self) -> Result<usize, BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());
        Ok(self.ring.count(lock.borrow_mut()))
    }

    /// The number of free bytes.
    pub fn space(&'static self) -> Result<usize, BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());
        Ok(self.ring.space(lock.borrow_mut()))
    }

    /// The capacity in bytes.
    pub fn limit(&'static self) -> Result<usize, BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());
        Ok(self.ring.limit(lock.borrow_mut()))
    }

    /// Drop all buffered bytes and wake all waiters with `Stopped`.
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

    /// [`StreamBuffer::reset`], plus the stream buffer's storage is retired
    /// (and, for a pooled one, its ring storage is returned to the segment
    /// heap).
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

    fn poll_send(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        data: &[u8],
    ) -> Result<(), TrySendError> {
        let limit = self.ring.limit(lock.borrow_mut());
        if self.ring.count(lock.borrow_mut()) + data.len() <= limit {
            self.put_update(lock.borrow_mut(), data.as_ptr(), data.len());
            Ok(())
        } else if data.len() <= limit {
            Err(TrySendError::Timeout)
        } else {
            Err(TrySendError::BadParam)
        }
    }

    /// Read up to `want` bytes, then admit as many whole blocked sends as
    /// now fit, in queue order.
    fn get_update(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        dst: *mut u8,
        want: usize,
    ) -> usize {
        let read = want.min(self.ring.count(lock.borrow_mut()));
        // Safety: `dst` is valid for `want >= read` bytes.
        unsafe { self.ring.get(lock.borrow_mut(), dst, read) };

        loop {
            let Some(sender) = self.obj.wait_queue.first_waiting_task(lock.borrow_mut()) else {
                break;
            };
            let WaitPayload::StreamSend { src, len } = sender.wait.payload.get(&*lock) else {
                unreachable!()
            };
            if self.ring.count(lock.borrow_mut()) + len > self.ring.limit(lock.borrow_mut()) {
                break;
            }
            // Safety: `src` is `len` bytes owned by the blocked sender.
            unsafe { self.ring.put(lock.borrow_mut(), src.as_ptr(), len) };
            self.obj.wait_queue.wake_up_one(lock.borrow_mut());
        }

        read
    }

    /// Write `n` bytes, then serve blocked receivers while bytes remain, in
    /// queue order.
    fn put_update(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, src: *const u8, n: usize) {
        // Safety: `src` is valid for `n` bytes; the caller checked the
        // space.
        unsafe { self.ring.put(lock.borrow_mut(), src, n) };

        loop {
            if self.ring.count(lock.borrow_mut()) == 0 {
                break;
            }
            let Some(receiver) = self.obj.wait_queue.first_waiting_task(lock.borrow_mut()) else {
                break;
            };
            let WaitPayload::StreamRecv { dst, len } = receiver.wait.payload.get(&*lock) else {
                unreachable!()
            };
            let served = len.min(self.ring.count(lock.borrow_mut()));
            // Safety: `dst` is valid for `len >= served` bytes and owned by
            // the blocked receiver.
            unsafe { self.ring.get(lock.borrow_mut(), dst.as_ptr(), served) };
            receiver
                .wait
                .payload
                .replace(&mut *lock, WaitPayload::StreamRecv { dst, len: served });
            self.obj.wait_queue.wake_up_one(lock.borrow_mut());
        }
    }

    /// Flush blocked senders and then make room for `n` incoming bytes,
    /// discarding the oldest buffered bytes as needed.
    fn skip_update(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, n: usize) {
        loop {
            let Some(sender) = self.obj.wait_queue.first_waiting_task(lock.borrow_mut()) else {
                break;
            };
            let WaitPayload::StreamSend { src, len } = sender.wait.payload.get(&*lock) else {
                unreachable!()
            };
            let limit = self.ring.limit(lock.borrow_mut());
            let count = self.ring.count(lock.borrow_mut());
            if count + len > limit {
                self.ring.skip(lock.borrow_mut(), count + len - limit);
            }
            // Safety: `src` is `len` bytes owned by the blocked sender.
            unsafe { self.ring.put(lock.borrow_mut(), src.as_ptr(), len) };
            self.obj.wait_queue.wake_up_one(lock.borrow_mut());
        }

        let limit = self.ring.limit(lock.borrow_mut());
        let count = self.ring.count(lock.borrow_mut());
        if count + n > limit {
            self.ring.skip(lock.borrow_mut(), count + n - limit);
        }
    }
}
