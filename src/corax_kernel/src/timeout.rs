//! Timekeeping: the monotonic kernel clock and the timing list
//!
//! The *timing list* is the single system-wide list of pending time
//! deadlines (timed task waits and running timers), sorted by absolute
//! expiry, FIFO on ties. Both kinds of entry embed an [`Hdr`]; the list
//! links dispatch on the [`TimeNodeRef`] capability ("schedulable on
//! expiry") to find out which kind they are attached to.
//!
//! The kernel clock is the port's monotonic tick counter, read through
//! [`PortTimer::tick_count`]. After every mutation of the timing list the
//! kernel re-arms the port's alarm to the earliest deadline (tick-less
//! ports) or simply waits for the next periodic tick (ticked ports, whose
//! `pend_tick_after` is a no-op).
use crate::{
    error::WaitTimeoutError,
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    task::{self, Task},
    timer::{self, Timer},
    utils::Init,
    wait, KernelTraits, PortThreading, PortTimer, Ticks,
};

/// A reference to an entity linked into the timing list.
pub(super) enum TimeNodeRef<Traits: PortThreading> {
    Task(&'static Task<Traits>),
    Timer(&'static Timer<Traits>),
}

impl<Traits: PortThreading> Clone for TimeNodeRef<Traits> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: PortThreading> Copy for TimeNodeRef<Traits> {}

impl<Traits: PortThreading> TimeNodeRef<Traits> {
    #[inline]
    fn hdr(self) -> &'static Hdr<Traits> {
        match self {
            Self::Task(t) => &t.hdr,
            Self::Timer(t) => &t.hdr,
        }
    }
}

/// The timing-list header embedded in every schedulable entity (task and
/// stand-alone timer).
pub(super) struct Hdr<Traits: PortThreading> {
    next: CpuLockCell<Traits, Option<TimeNodeRef<Traits>>>,
    /// The previous node, or `None` when this node is the list head.
    prev: CpuLockCell<Traits, Option<TimeNodeRef<Traits>>>,
    linked: CpuLockCell<Traits, bool>,
    expires_at: CpuLockCell<Traits, Ticks>,
}

impl<Traits: PortThreading> Hdr<Traits> {
    pub(super) const fn new() -> Self {
        Self {
            next: CpuLockCell::new(None),
            prev: CpuLockCell::new(None),
            linked: CpuLockCell::new(false),
            expires_at: CpuLockCell::new(0),
        }
    }

    /// Get a flag indicating whether this header is currently in the timing
    /// list.
    pub(super) fn is_linked(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.linked.get(&*lock)
    }

    /// Get the absolute expiry. Meaningful only while linked (timers also
    /// use it to stash state while stopped).
    pub(super) fn expires_at(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> Ticks {
        self.expires_at.get(&*lock)
    }
}

impl<Traits: PortThreading> Init for Hdr<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

/// Kernel-global timekeeping state.
pub(super) struct TimeoutGlobals<Traits: PortThreading> {
    /// The earliest-deadline end of the timing list.
    head: CpuLockCell<Traits, Option<TimeNodeRef<Traits>>>,

    /// The kernel time at the previous tick, for round-robin accounting.
    last_tick_time: CpuLockCell<Traits, Ticks>,

    /// Flag suppressing redundant alarm re-arming while `handle_tick` runs.
    handle_tick_in_progress: CpuLockCell<Traits, bool>,
}

impl<Traits: PortThreading> Init for TimeoutGlobals<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        head: Init::INIT,
        last_tick_time: Init::INIT,
        handle_tick_in_progress: Init::INIT,
    };
}

/// Get the current kernel time.
#[inline]
pub(super) fn system_time<Traits: KernelTraits>(
    _lock: CpuLockTokenRefMut<'_, Traits>,
) -> Ticks {
    // Safety: CPU Lock active, witnessed by `_lock`
    unsafe { Traits::tick_count() }
}

/// Initialize the timekeeping system at boot.
pub(super) fn init<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let now = system_time::<Traits>(lock.borrow_mut());
    Traits::state().timeout.last_tick_time.replace(&mut *lock, now);

    // No deadlines are registered yet.
    // Safety: CPU Lock active
    unsafe { Traits::pend_tick_after(Traits::MAX_TIMEOUT) };
}

/// Link `node` into the timing list with the given absolute expiry, after
/// every node with an equal or earlier expiry (FIFO on ties), and re-arm the
/// alarm.
pub(super) fn insert_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    node: TimeNodeRef<Traits>,
    at: Ticks,
) {
    let g = &Traits::state().timeout;
    let hdr = node.hdr();

    debug_assert!(!hdr.linked.get(&*lock), "timing node is already linked");
    hdr.expires_at.replace(&mut *lock, at);

    let mut prev: Option<TimeNodeRef<Traits>> = None;
    let mut cur = g.head.get(&*lock);
    while let Some(c) = cur {
        if c.hdr().expires_at.get(&*lock) > at {
            break;
        }
        prev = cur;
        cur = c.hdr().next.get(&*lock);
    }

    hdr.next.replace(&mut *lock, cur);
    hdr.prev.replace(&mut *lock, prev);
    match prev {
        None => {
            g.head.replace(&mut *lock, Some(node));
        }
        Some(p) => {
            p.hdr().next.replace(&mut *lock, Some(node));
        }
    }
    if let Some(c) = cur {
        c.hdr().prev.replace(&mut *lock, Some(node));
    }
    hdr.linked.replace(&mut *lock, true);

    pend_next_tick::<Traits>(lock);
}

/// Unlink `node` from the timing list.
pub(super) fn remove_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    node: TimeNodeRef<Traits>,
) {
    let g = &Traits::state().timeout;
    let hdr = node.hdr();

    debug_assert!(hdr.linked.get(&*lock), "timing node is not linked");

    let next = hdr.next.replace(&mut *lock, None);
    let prev = hdr.prev.replace(&mut *lock, None);
    match prev {
        None => {
            g.head.replace(&mut *lock, next);
        }
        Some(p) => {
            p.hdr().next.replace(&mut *lock, next);
        }
    }
    if let Some(n) = next {
        n.hdr().prev.replace(&mut *lock, prev);
    }
    hdr.linked.replace(&mut *lock, false);
}

/// Register a timeout for a task's ongoing blocking operation.
pub(super) fn insert_task_timeout<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static Task<Traits>,
    at: Ticks,
) {
    insert_timeout(lock, TimeNodeRef::Task(task), at);
}

/// Cancel a task's registered timeout.
pub(super) fn remove_task_timeout<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static Task<Traits>,
) {
    remove_timeout(lock, TimeNodeRef::Task(task));
}

/// Re-arm the port's alarm for the earliest deadline (and, under
/// round-robin, no later than the running task's remaining quantum).
///
/// Suppressed while `handle_tick` is in progress; it re-arms once, at the
/// end.
pub(super) fn pend_next_tick<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let g = &Traits::state().timeout;
    if g.handle_tick_in_progress.get(&*lock) {
        return;
    }

    let now = system_time::<Traits>(lock.borrow_mut());

    let mut delta = match g.head.get(&*lock) {
        Some(node) => {
            let at = node.hdr().expires_at.get(&*lock);
            if at <= now {
                // Overdue; fire as soon as possible.
                // Safety: CPU Lock active
                unsafe { Traits::pend_tick() };
                return;
            }
            at - now
        }
        None => Traits::MAX_TIMEOUT,
    };

    if let Some(slice) = task::time_slice_remaining::<Traits>(lock.borrow_mut()) {
        delta = delta.min(slice);
    }

    // Safety: CPU Lock active
    unsafe { Traits::pend_tick_after(delta.min(Traits::MAX_TIMEOUT)) };
}

/// Implements [`PortToKernel::timer_tick`](crate::PortToKernel::timer_tick).
pub(super) fn handle_tick<Traits: KernelTraits>() {
    // The precondition (CPU Lock inactive) makes this `unwrap` infallible
    let mut lock = klock::lock_cpu::<Traits>().unwrap();
    let g = &Traits::state().timeout;

    // Suppress redundant alarm re-arming by the timeout processing below.
    g.handle_tick_in_progress.replace(&mut *lock, true);

    let now = system_time::<Traits>(lock.borrow_mut());

    // Charge the round-robin quantum for the elapsed wall time.
    let elapsed = now.saturating_sub(g.last_tick_time.get(&*lock));
    g.last_tick_time.replace(&mut *lock, now);
    task::charge_time_slice::<Traits>(lock.borrow_mut(), elapsed);

    // Process expired deadlines, earliest first.
    loop {
        let Some(node) = g.head.get(&*lock) else { break };
        if node.hdr().expires_at.get(&*lock) > now {
            break;
        }

        remove_timeout::<Traits>(lock.borrow_mut(), node);

        match node {
            TimeNodeRef::Task(task) => {
                // The task's wait operation times out. It might have been
                // woken in the interim, in which case there's nothing to do.
                let _ = wait::interrupt_task(
                    lock.borrow_mut(),
                    task,
                    Err(WaitTimeoutError::Timeout),
                );
            }
            TimeNodeRef::Timer(timer_cb) => {
                // Runs the timer callback with CPU Lock temporarily
                // released.
                lock = timer::timer_expired(lock, timer_cb);
            }
        }
    }

    g.handle_tick_in_progress.replace(&mut *lock, false);
    pend_next_tick::<Traits>(lock.borrow_mut());

    // Wake-ups above may have readied a higher-priority task.
    task::unlock_cpu_and_check_preemption(lock);
}
