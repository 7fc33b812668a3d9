//! Timers
//!
//! A timer schedules a callback to run in interrupt context after a delay,
//! optionally repeating with a drift-free period (each expiry is scheduled
//! at `previous expiry + period`, not `now + period`). Tasks can also block
//! until a one-shot timer fires.
use core::fmt;

use crate::{
    error::{BadContextError, PollTimerError, WaitTimerError, WaitTimerTimeoutError, WaitTimeoutError},
    klock::{self, CpuLockCell, CpuLockGuard},
    object::{self, KernelObject, Obj},
    task, timeout,
    utils::Init,
    wait::WaitPayload,
    KernelTraits, PortThreading, Ticks, INFINITE,
};

/// *Timer control block*: the state data of a timer, embedding the common
/// object header (whose wait queue holds the tasks waiting for expiry) and
/// the timing list header.
pub struct Timer<Traits: PortThreading> {
    pub(super) obj: Obj<Traits>,
    pub(super) hdr: timeout::Hdr<Traits>,

    /// The expiry callback. Runs in an interrupt context.
    callback: CpuLockCell<Traits, Option<fn()>>,

    /// The repeat period. Zero makes the timer one-shot.
    period: CpuLockCell<Traits, Ticks>,

    /// `true` after the first `start`; a never-started timer cannot be
    /// waited for.
    started: CpuLockCell<Traits, bool>,

    /// `true` once a one-shot expiry has fired and the timer is idle.
    expired: CpuLockCell<Traits, bool>,
}

impl<Traits: PortThreading> Timer<Traits> {
    /// Construct a timer in place, for `static` storage provided by the
    /// application.
    pub const fn new(callback: Option<fn()>) -> Self {
        Self::with_obj(Obj::new_static(), callback)
    }

    const fn with_obj(obj: Obj<Traits>, callback: Option<fn()>) -> Self {
        Self {
            obj,
            hdr: timeout::Hdr::new(),
            callback: CpuLockCell::new(callback),
            period: CpuLockCell::new(0),
            started: CpuLockCell::new(false),
            expired: CpuLockCell::new(false),
        }
    }
}

impl<Traits: PortThreading> Init for Timer<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::with_obj(Obj::new_free(), None);
}

impl<Traits: PortThreading> KernelObject<Traits> for Timer<Traits> {
    fn obj(&self) -> &Obj<Traits> {
        &self.obj
    }
}

impl<Traits: PortThreading> fmt::Debug for Timer<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Timer")
            .field("self", &(self as *const _))
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> Timer<Traits> {
    /// Allocate and construct a timer from the kernel pool. Returns `None`
    /// on pool exhaustion.
    pub fn create(callback: Option<fn()>) -> Option<&'static Self> {
        let mut lock = klock::lock_cpu::<Traits>().ok()?;
        let timer = object::allocate_from_pool(&Traits::state().timer_pool[..], lock.borrow_mut())?;
        timer.callback.replace(&mut *lock, callback);
        timer.period.replace(&mut *lock, 0);
        timer.started.replace(&mut *lock, false);
        timer.expired.replace(&mut *lock, false);
        Some(timer)
    }

    /// Arm the timer to fire in `delay` ticks and then every `period` ticks
    /// (`period == 0` makes it one-shot). Re-arms an already-running timer.
    ///
    /// *ISR-safe.*
    pub fn start(&'static self, delay: Ticks, period: Ticks) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let now = timeout::system_time::<Traits>(lock.borrow_mut());
        self.arm(lock.borrow_mut(), now.saturating_add(delay), period);
        Ok(())
    }

    /// Arm the timer to fire once at the absolute time `time`.
    ///
    /// *ISR-safe.*
    pub fn start_until(&'static self, time: Ticks) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        self.arm(lock.borrow_mut(), time, 0);
        Ok(())
    }

    /// Replace the callback, then arm the timer like [`Timer::start`].
    ///
    /// *ISR-safe.*
    pub fn start_from(
        &'static self,
        delay: Ticks,
        period: Ticks,
        callback: Option<fn()>,
    ) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        self.callback.replace(&mut *lock, callback);
        let now = timeout::system_time::<Traits>(lock.borrow_mut());
        self.arm(lock.borrow_mut(), now.saturating_add(delay), period);
        Ok(())
    }

    fn arm(
        &'static self,
        mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
        at: Ticks,
        period: Ticks,
    ) {
        if self.hdr.is_linked(lock.borrow_mut()) {
            timeout::remove_timeout::<Traits>(lock.borrow_mut(), timeout::TimeNodeRef::Timer(self));
        }
        self.period.replace(&mut *lock, period);
        self.started.replace(&mut *lock, true);
        self.expired.replace(&mut *lock, false);
        timeout::insert_timeout::<Traits>(lock, timeout::TimeNodeRef::Timer(self), at);
    }

    /// Disarm the timer and wake all tasks waiting for it with `Stopped`.
    ///
    /// *ISR-safe.*
    pub fn stop(&'static self) -> Result<(), BadContextError> {
        self.reset()
    }

    /// Return the timer to its initial (never-started) state, waking all
    /// waiting tasks with `Stopped`.
    ///
    /// *ISR-safe.*
    pub fn reset(&'static self) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        self.reset_inner(lock.borrow_mut(), Err(WaitTimeoutError::Stopped));
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// [`Timer::reset`], plus the timer's storage is retired. Waiting tasks
    /// are woken with `Deleted` if the timer is pooled, `Stopped` otherwise.
    pub fn destroy(&'static self) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let result = if self.obj.is_pooled(lock.borrow_mut()) {
            Err(WaitTimeoutError::Deleted)
        } else {
            Err(WaitTimeoutError::Stopped)
        };
        self.reset_inner(lock.borrow_mut(), result);
        self.obj.finalize(lock.borrow_mut());
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    fn reset_inner(
        &'static self,
        mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
        wait_result: Result<(), WaitTimeoutError>,
    ) {
        if self.hdr.is_linked(lock.borrow_mut()) {
            timeout::remove_timeout::<Traits>(lock.borrow_mut(), timeout::TimeNodeRef::Timer(self));
        }
        self.started.replace(&mut *lock, false);
        self.expired.replace(&mut *lock, false);
        self.obj.wait_queue.wake_up_all(lock.borrow_mut(), wait_result);
    }

    /// Check whether a one-shot expiry has fired: `Ok` if it has,
    /// `Timeout` while the timer is armed, `BadObjectState` if the timer was
    /// never started.
    ///
    /// *ISR-safe.*
    pub fn take(&'static self) -> Result<(), PollTimerError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());
        self.poll_core(lock.borrow_mut())
    }

    fn poll_core(
        &'static self,
        mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    ) -> Result<(), PollTimerError> {
        if !self.started.get(&*lock) {
            Err(PollTimerError::BadObjectState)
        } else if self.expired.get(&*lock) {
            Ok(())
        } else {
            debug_assert!(self.hdr.is_linked(lock.borrow_mut()));
            Err(PollTimerError::Timeout)
        }
    }

    /// Wait until the timer fires.
    pub fn wait(&'static self) -> Result<(), WaitTimerError> {
        match self.wait_for(INFINITE) {
            Ok(()) => Ok(()),
            Err(WaitTimerTimeoutError::BadContext) => Err(WaitTimerError::BadContext),
            Err(WaitTimerTimeoutError::BadObjectState) => Err(WaitTimerError::BadObjectState),
            Err(WaitTimerTimeoutError::Stopped) => Err(WaitTimerError::Stopped),
            Err(WaitTimerTimeoutError::Deleted) => Err(WaitTimerError::Deleted),
            Err(WaitTimerTimeoutError::Timeout) => {
                unreachable!("got timeout result for a non-timeout wait")
            }
        }
    }

    /// [`Timer::wait`] with a timeout.
    pub fn wait_for(&'static self, delay: Ticks) -> Result<(), WaitTimerTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        crate::state::expect_waitable_context::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let result = match self.poll_core(lock.borrow_mut()) {
            Ok(()) => Ok(()),
            Err(PollTimerError::BadObjectState) => Err(WaitTimerTimeoutError::BadObjectState),
            Err(PollTimerError::Timeout) => self
                .obj
                .wait_queue
                .wait_timeout(lock.borrow_mut(), WaitPayload::Timer, delay)
                .map(|_| ())
                .map_err(WaitTimerTimeoutError::from),
            Err(PollTimerError::BadContext) => unreachable!(),
        };
        task::return_to_task(lock);
        result
    }

    /// [`Timer::wait`] with an absolute deadline.
    pub fn wait_until(&'static self, time: Ticks) -> Result<(), WaitTimerTimeoutError> {
        self.wait_for(task::delay_until::<Traits>(time)?)
    }
}

/// Process the expiry of `timer_cb`, whose timing node the tick handler has
/// just detached: re-queue a periodic timer at `previous expiry + period`
/// (drift-free), wake the tasks waiting for the expiry, and run the callback
/// with CPU Lock temporarily released.
pub(super) fn timer_expired<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
    timer_cb: &'static Timer<Traits>,
) -> CpuLockGuard<Traits> {
    debug_assert!(!timer_cb.hdr.is_linked(lock.borrow_mut()));

    let period = timer_cb.period.get(&*lock);
    if period == 0 {
        timer_cb.expired.replace(&mut *lock, true);
    } else {
        let at = timer_cb.hdr.expires_at(lock.borrow_mut()).saturating_add(period);
        timeout::insert_timeout::<Traits>(
            lock.borrow_mut(),
            timeout::TimeNodeRef::Timer(timer_cb),
            at,
        );
    }

    timer_cb.obj.wait_queue.wake_up_all(lock.borrow_mut(), Ok(()));

    let callback = timer_cb.callback.get(&*lock);
    if let Some(callback) = callback {
        // Release CPU Lock before calling the application-provided callback
        // function
        drop(lock);

        callback();

        // Re-acquire CPU Lock
        lock = klock::lock_cpu().unwrap_or_else(|_| unsafe { klock::assume_cpu_lock() });
    }

    lock
}
