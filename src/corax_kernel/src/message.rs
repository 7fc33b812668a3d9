//! Message buffers
//!
//! A message buffer is a framed stream buffer: each write is prepended with
//! its length, and a reader always gets exactly one whole frame.
use core::{fmt, mem, ptr::NonNull};

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

/// The per-frame length prefix.
type FrameLen = u32;
const HEADER: usize = mem::size_of::<FrameLen>();

/// *Message buffer control block*.
pub struct MessageBuffer<Traits: PortThreading> {
    pub(super) obj: Obj<Traits>,
    ring: Ring<Traits>,
}

impl<Traits: PortThreading> MessageBuffer<Traits> {
    /// Construct a message buffer in place over application-provided
    /// storage. The length prefix of every frame counts against the
    /// capacity.
    pub const fn new(buf: &'static [RawCell<u8>]) -> Self {
        assert!(buf.len() > HEADER, "storage cannot hold any frame");
        Self {
            obj: Obj::new_static(),
            ring: Ring::new(Some(buf), buf.len()),
        }
    }
}

impl<Traits: PortThreading> Init for MessageBuffer<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        obj: Obj::new_free(),
        ring: Init::INIT,
    };
}

impl<Traits: PortThreading> KernelObject<Traits> for MessageBuffer<Traits> {
    fn obj(&self) -> &Obj<Traits> {
        &self.obj
    }
}

impl<Traits: PortThreading> fmt::Debug for MessageBuffer<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MessageBuffer")
            .field("self", &(self as *const _))
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> MessageBuffer<Traits> {
    /// Allocate and construct a message buffer from the kernel pool, with
    /// `limit` bytes of ring storage carved from the segment heap. Returns
    /// `None` on exhaustion of either.
    pub fn create(limit: usize) -> Option<&'static Self> {
        if limit <= HEADER {
            return None;
        }
        let mut lock = klock::lock_cpu::<Traits>().ok()?;
        let state = Traits::state();

        let buf = state.heap.alloc_bytes(lock.borrow_mut(), limit)?;
        let Some(msg) = object::allocate_from_pool(&state.message_pool[..], lock.borrow_mut())
        else {
            state.heap.free_bytes(lock.borrow_mut(), buf);
            return None;
        };
        msg.ring.configure(lock.borrow_mut(), buf, limit);
        Some(msg)
    }

    /// Receive one frame without blocking. Returns the frame length.
    /// `Timeout` when the buffer is empty; `BadParam` when the head frame
    /// does not fit in `data`.
    ///
    /// *ISR-safe.*
    pub fn take(&'static self, data: &mut [u8]) -> Result<usize, TryRecvError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        if self.ring.count(lock.borrow_mut()) == 0 {
            return Err(TryRecvError::Timeout);
        }
        if self.peek_len(lock.borrow_mut()) > data.len() {
            return Err(TryRecvError::BadParam);
        }
        let read = self.get_update(lock.borrow_mut(), data.as_mut_ptr());
        task::unlock_cpu_and_check_preemption(lock);
        Ok(read)
    }

    /// Receive one frame, blocking indefinitely while the buffer is empty.
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

    /// Receive one frame, blocking for up to `delay` ticks.
    pub fn recv_for(
        &'static self,
        data: &mut [u8],
        delay: Ticks,
    ) -> Result<usize, RecvTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let result = if self.ring.count(lock.borrow_mut()) > 0 {
            if self.peek_len(lock.borrow_mut()) > data.len() {
                Err(RecvTimeoutError::BadParam)
            } else {
                Ok(self.get_update(lock.borrow_mut(), data.as_mut_ptr()))
            }
        } else {
            self.obj
                .wait_queue
                .wait_timeout(
                    lock.borrow_mut(),
                    WaitPayload::MsgRecv {
                        dst: NonNull::new(data.as_mut_ptr()).unwrap(),
                        len: data.len(),
                    },
                    delay,
                )
                .map(|payload| match payload {
                    // The sender records the delivered frame length.
                    WaitPayload::MsgRecv { len, .. } => len,
                    _ => unreachable!(),
                })
                .map_err(RecvTimeoutError::from)
        };
        task::return_to_task(lock);
        result
    }

    /// Receive one frame, blocking until the absolute time `time`.
    pub fn recv_until(
        &'static self,
        data: &mut [u8],
        time: Ticks,
    ) -> Result<usize, RecvTimeoutError> {
        self.recv_for(data, task::delay_until::<Traits>(time)?)
    }

    /// Send one frame without blocking. `Timeout` when it does not
    /// currently fit; `BadParam` when it can never fit.
    ///
    /// *ISR-safe.*
    pub fn give(&'static self, data: &[u8]) -> Result<(), TrySendError> {
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

    /// Send one frame, blocking indefinitely until it fits.
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

    /// Send one frame, blocking for up to `delay` ticks until it fits.
    pub fn send_for(&'static self, data: &[u8], delay: Ticks) -> Result<(), SendTimeoutError> {
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
                    WaitPayload::MsgSend {
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

    /// Send one frame, blocking until the absolute time `time`.
    pub fn send_until(&'static self, data: &[u8], time: Ticks) -> Result<(), SendTimeoutError> {
        self.send_for(data, task::delay_until::<Traits>(time)?)
    }

    /// The number of buffered payload bytes (headers excluded).
    pub fn count(&'static self) -> Result<usize, BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());
        let count = self.ring.count(lock.borrow_mut());
        Ok(count.saturating_sub(HEADER))
    }

    /// The capacity in bytes, headers included.
    pub fn limit(&'static self) -> Result<usize, BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());
        Ok(self.ring.limit(lock.borrow_mut()))
    }

    /// Drop all buffered frames and wake all waiters with `Stopped`.
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

    /// [`MessageBuffer::reset`], plus the message buffer's storage is
    /// retired (and, for a pooled one, its ring storage is returned to the
    /// segment heap).
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
        let needed = HEADER + data.len();
        let limit = self.ring.limit(lock.borrow_mut());
        if self.ring.count(lock.borrow_mut()) + needed <= limit {
            self.put_update(lock.borrow_mut(), data.as_ptr(), data.len());
            Ok(())
        } else if needed <= limit {
            Err(TrySendError::Timeout)
        } else {
            Err(TrySendError::BadParam)
        }
    }

    /// Read the head frame's length prefix without consuming it.
    fn peek_len(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> usize {
        let mut header = [0u8; HEADER];
        // Safety: A local buffer of exactly `HEADER` bytes.
        unsafe { self.ring.peek(lock.borrow_mut(), header.as_mut_ptr(), HEADER) };
        FrameLen::from_ne_bytes(header) as usize
    }

    /// Consume the head frame into `dst`, then admit blocked sends that now
    /// fit, in queue order. Returns the frame length.
    fn get_update(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, dst: *mut u8) -> usize {
        let len = self.peek_len(lock.borrow_mut());
        self.ring.skip(lock.borrow_mut(), HEADER);
        // Safety: The caller verified `dst` holds `len` bytes.
        unsafe { self.ring.get(lock.borrow_mut(), dst, len) };

        loop {
            let Some(sender) = self.obj.wait_queue.first_waiting_task(lock.borrow_mut()) else {
                break;
            };
            let WaitPayload::MsgSend { src, len } = sender.wait.payload.get(&*lock) else {
                unreachable!()
            };
            let limit = self.ring.limit(lock.borrow_mut());
            if self.ring.count(lock.borrow_mut()) + HEADER + len > limit {
                break;
            }
            self.put_frame(lock.borrow_mut(), src.as_ptr(), len);
            self.obj.wait_queue.wake_up_one(lock.borrow_mut());
        }

        len
    }

    /// Write one frame, then serve blocked receivers whose buffers can hold
    /// the next frames, in queue order.
    fn put_update(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, src: *const u8, n: usize) {
        self.put_frame(lock.borrow_mut(), src, n);

        loop {
            if self.ring.count(lock.borrow_mut()) == 0 {
                break;
            }
            let Some(receiver) = self.obj.wait_queue.first_waiting_task(lock.borrow_mut()) else {
                break;
            };
            let WaitPayload::MsgRecv { dst, len } = receiver.wait.payload.get(&*lock) else {
                unreachable!()
            };
            let frame_len = self.peek_len(lock.borrow_mut());
            if frame_len > len {
                // The head frame does not fit the first receiver's buffer;
                // it stays buffered until a receiver that can hold it asks.
                break;
            }
            self.ring.skip(lock.borrow_mut(), HEADER);
            // Safety: `dst` holds at least `frame_len` bytes and is owned by
            // the blocked receiver.
            unsafe { self.ring.get(lock.borrow_mut(), dst.as_ptr(), frame_len) };
            receiver.wait.payload.replace(
                &mut *lock,
                WaitPayload::MsgRecv {
                    dst,
                    len: frame_len,
                },
            );
            self.obj.wait_queue.wake_up_one(lock.borrow_mut());
        }
    }

    fn put_frame(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, src: *const u8, n: usize) {
        let header = (n as FrameLen).to_ne_bytes();
        // Safety: A local buffer of exactly `HEADER` bytes; the caller
        // checked the space for the whole frame.
        unsafe { self.ring.put(lock.borrow_mut(), header.as_ptr(), HEADER) };
        // Safety: `src` is valid for `n` bytes.
        unsafe { self.ring.put(lock.borrow_mut(), src, n) };
    }
}
