//! Event queues
//!
//! An event queue is a mailbox specialized to `u32` event values, with the
//! same blocked-peer rendezvous.
use core::fmt;

use crate::{
    error::{
        BadContextError, RecvError, RecvTimeoutError, SendError, SendTimeoutError, TryRecvError,
        TrySendError, WaitTimeoutError,
    },
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    object::{self, KernelObject, Obj},
    state, task,
    utils::{Init, RawCell},
    wait::WaitPayload,
    KernelTraits, PortThreading, Ticks, INFINITE,
};

/// *Event queue control block*.
pub struct EventQueue<Traits: PortThreading> {
    pub(super) obj: Obj<Traits>,
    slots: CpuLockCell<Traits, Option<&'static [RawCell<u32>]>>,
    count: CpuLockCell<Traits, usize>,
    head: CpuLockCell<Traits, usize>,
    tail: CpuLockCell<Traits, usize>,
}

impl<Traits: PortThreading> EventQueue<Traits> {
    /// Construct an event queue in place over application-provided storage.
    pub const fn new(slots: &'static [RawCell<u32>]) -> Self {
        assert!(!slots.is_empty(), "storage must be nonzero");
        Self {
            obj: Obj::new_static(),
            slots: CpuLockCell::new(Some(slots)),
            count: CpuLockCell::new(0),
            head: CpuLockCell::new(0),
            tail: CpuLockCell::new(0),
        }
    }
}

impl<Traits: PortThreading> Init for EventQueue<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        obj: Obj::new_free(),
        slots: CpuLockCell::new(None),
        count: CpuLockCell::new(0),
        head: CpuLockCell::new(0),
        tail: CpuLockCell::new(0),
    };
}

impl<Traits: PortThreading> KernelObject<Traits> for EventQueue<Traits> {
    fn obj(&self) -> &Obj<Traits> {
        &self.obj
    }
}

impl<Traits: PortThreading> fmt::Debug for EventQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventQueue")
            .field("self", &(self as *const _))
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> EventQueue<Traits> {
    /// Allocate and construct an event queue from the kernel pool, with
    /// `limit` slots carved from the segment heap. Returns `None` on
    /// exhaustion of either.
    pub fn create(limit: usize) -> Option<&'static Self> {
        if limit == 0 {
            return None;
        }
        let mut lock = klock::lock_cpu::<Traits>().ok()?;
        let state = Traits::state();

        let slots = state.heap.alloc_array::<u32>(lock.borrow_mut(), limit, 0)?;
        let Some(evq) = object::allocate_from_pool(&state.event_queue_pool[..], lock.borrow_mut())
        else {
            state.heap.free_array(lock.borrow_mut(), slots);
            return None;
        };
        evq.slots.replace(&mut *lock, Some(slots));
        evq.count.replace(&mut *lock, 0);
        evq.head.replace(&mut *lock, 0);
        evq.tail.replace(&mut *lock, 0);
        Some(evq)
    }

    /// Receive one event without blocking.
    ///
    /// *ISR-safe.*
    pub fn take(&'static self) -> Result<u32, TryRecvError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        if self.count.get(&*lock) == 0 {
            return Err(TryRecvError::Timeout);
        }
        let event = self.get_update(lock.borrow_mut());
        task::unlock_cpu_and_check_preemption(lock);
        Ok(event)
    }

    /// Receive one event, blocking indefinitely while the queue is empty.
    pub fn recv(&'static self) -> Result<u32, RecvError> {
        match self.recv_for(INFINITE) {
            Ok(event) => Ok(event),
            Err(RecvTimeoutError::BadContext) => Err(RecvError::BadContext),
            Err(RecvTimeoutError::BadParam) => Err(RecvError::BadParam),
            Err(RecvTimeoutError::Stopped) => Err(RecvError::Stopped),
            Err(RecvTimeoutError::Deleted) => Err(RecvError::Deleted),
            Err(RecvTimeoutError::Timeout) => {
                unreachable!("got timeout result for a non-timeout wait")
            }
        }
    }

    /// Receive one event, blocking for up to `delay` ticks.
    pub fn recv_for(&'static self, delay: Ticks) -> Result<u32, RecvTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let result = if self.count.get(&*lock) > 0 {
            Ok(self.get_update(lock.borrow_mut()))
        } else {
            self.obj
                .wait_queue
                .wait_timeout(lock.borrow_mut(), WaitPayload::EventRecv { event: 0 }, delay)
                .map(|payload| match payload {
                    WaitPayload::EventRecv { event } => event,
                    _ => unreachable!(),
                })
                .map_err(RecvTimeoutError::from)
        };
        task::return_to_task(lock);
        result
    }

    /// Receive one event, blocking until the absolute time `time`.
    pub fn recv_until(&'static self, time: Ticks) -> Result<u32, RecvTimeoutError> {
        self.recv_for(task::delay_until::<Traits>(time)?)
    }

    /// Send one event without blocking. `Timeout` when the queue is full.
    ///
    /// *ISR-safe.*
    pub fn give(&'static self, event: u32) -> Result<(), TrySendError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        if self.count.get(&*lock) == self.capacity(lock.borrow_mut()) {
            return Err(TrySendError::Timeout);
        }
        self.put_update(lock.borrow_mut(), event);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Send one event, blocking indefinitely while the queue is full.
    pub fn send(&'static self, event: u32) -> Result<(), SendError> {
        match self.send_for(event, INFINITE) {
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

    /// Send one event, blocking for up to `delay` ticks.
    pub fn send_for(&'static self, event: u32, delay: Ticks) -> Result<(), SendTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let result = if self.count.get(&*lock) < self.capacity(lock.borrow_mut()) {
            self.put_update(lock.borrow_mut(), event);
            Ok(())
        } else {
            self.obj
                .wait_queue
                .wait_timeout(lock.borrow_mut(), WaitPayload::EventSend { event }, delay)
                .map(|_| ())
                .map_err(SendTimeoutError::from)
        };
        task::return_to_task(lock);
        result
    }

    /// Send one event, blocking until the absolute time `time`.
    pub fn send_until(&'static self, event: u32, time: Ticks) -> Result<(), SendTimeoutError> {
        self.send_for(event, task::delay_until::<Traits>(time)?)
    }

    /// Send one event, overwriting the oldest one if the queue is full.
    ///
    /// *ISR-safe.*
    pub fn push(&'static self, event: u32) -> Result<(), TrySendError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        while self.count.get(&*lock) == self.capacity(lock.borrow_mut()) {
            self.pop_slot(lock.borrow_mut());
            if let Some(sender) = self.obj.wait_queue.wake_up_one(lock.borrow_mut()) {
                let WaitPayload::EventSend { event } = sender.wait.payload.get(&*lock) else {
                    unreachable!()
                };
                self.put_slot(lock.borrow_mut(), event);
            }
        }
        self.put_update(lock.borrow_mut(), event);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// The number of buffered events.
    pub fn count(&'static self) -> Result<usize, BadContextError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.count.get(&*lock))
    }

    /// Drop all buffered events and wake all waiters with `Stopped`.
    pub fn reset(&'static self) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        self.count.replace(&mut *lock, 0);
        self.head.replace(&mut *lock, 0);
        self.tail.replace(&mut *lock, 0);
        self.obj
            .wait_queue
            .wake_up_all(lock.borrow_mut(), Err(WaitTimeoutError::Stopped));
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// [`EventQueue::reset`], plus the queue's storage is retired.
    pub fn destroy(&'static self) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let pooled = self.obj.is_pooled(lock.borrow_mut());
        let result = if pooled {
            WaitTimeoutError::Deleted
        } else {
            WaitTimeoutError::Stopped
        };
        self.count.replace(&mut *lock, 0);
        self.obj
            .wait_queue
            .wake_up_all(lock.borrow_mut(), Err(result));

        let slots = self.slots.replace(&mut *lock, None);
        if pooled {
            if let Some(slots) = slots {
                Traits::state().heap.free_array(lock.borrow_mut(), slots);
            }
        }
        self.obj.finalize(lock.borrow_mut());
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    fn capacity(&'static self, lock: CpuLockTokenRefMut<'_, Traits>) -> usize {
        self.slots.get(&*lock).map_or(0, |s| s.len())
    }

    fn put_slot(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, event: u32) {
        let slots = self.slots.get(&*lock).unwrap();
        let tail = self.tail.get(&*lock);
        // Safety: The slot is owned by this queue and only accessed under
        // CPU Lock.
        unsafe { *slots[tail].get() = event };
        self.tail
            .replace(&mut *lock, if tail + 1 == slots.len() { 0 } else { tail + 1 });
        let count = self.count.get(&*lock);
        self.count.replace(&mut *lock, count + 1);
    }

    fn pop_slot(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> u32 {
        let slots = self.slots.get(&*lock).unwrap();
        let head = self.head.get(&*lock);
        // Safety: Ditto.
        let event = unsafe { *slots[head].get() };
        self.head
            .replace(&mut *lock, if head + 1 == slots.len() { 0 } else { head + 1 });
        let count = self.count.get(&*lock);
        self.count.replace(&mut *lock, count - 1);
        event
    }

    fn get_update(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> u32 {
        let event = self.pop_slot(lock.borrow_mut());
        if let Some(sender) = self.obj.wait_queue.wake_up_one(lock.borrow_mut()) {
            let WaitPayload::EventSend { event } = sender.wait.payload.get(&*lock) else {
                unreachable!()
            };
            self.put_slot(lock.borrow_mut(), event);
        }
        event
    }

    fn put_update(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, event: u32) {
        self.put_slot(lock.borrow_mut(), event);
        if let Some(receiver) = self.obj.wait_queue.wake_up_one(lock.borrow_mut()) {
            let delivered = self.pop_slot(lock.borrow_mut());
            receiver
                .wait
                .payload
                .replace(&mut *lock, WaitPayload::EventRecv { event: delivered });
        }
    }
}
