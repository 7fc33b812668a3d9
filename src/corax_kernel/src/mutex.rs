//! Mutexes
//!
//! A mutex combines a type (`Normal`, `ErrorCheck`, `Recursive`), a locking
//! protocol (`None`, `Inherit`, `Ceiling`), and an optional robustness flag.
//!
//! Under `Inherit`, a blocked waiter raises the owner's effective priority
//! to its own, transitively along chains of mutexes (a waiter's owner may
//! itself be blocked on another mutex). Under `Ceiling`, holding the mutex
//! raises the owner to the ceiling priority, and tasks above the ceiling may
//! not acquire it at all.
//!
//! When a task terminates while holding a *robust* mutex, the mutex is
//! marked inconsistent and the next acquirer observes `Abandoned` while
//! still obtaining the lock, with the flag cleared, so that a subsequent
//! release/acquire cycle is clean.
use core::fmt;

use crate::{
    error::{
        LockMutexError, LockMutexPrecheckError, LockMutexTimeoutError, SetCeilingError,
        TryLockMutexError, UnlockMutexError,
    },
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    object::{self, KernelObject, Obj},
    state,
    task::{self, Task, TaskSt},
    utils::Init,
    wait::WaitPayload,
    KernelTraits, PortThreading, Priority, Ticks, INFINITE,
};

/// How repeated acquisition by the owner behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexType {
    /// Relocking deadlocks; anyone may unlock.
    Normal,
    /// Relocking and unlocking-by-non-owner are reported as errors.
    ErrorCheck,
    /// Relocking increments a recursion count.
    Recursive,
}

/// The priority protocol of a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexProtocol {
    /// No priority adjustment.
    None,
    /// Priority inheritance: the owner inherits the highest waiter's
    /// effective priority, transitively along mutex chains.
    Inherit,
    /// Priority ceiling: the owner runs at least at the ceiling priority;
    /// tasks above the ceiling cannot acquire the mutex.
    Ceiling(Priority),
}

/// The maximum recursion depth of a [`MutexType::Recursive`] mutex.
pub const MUTEX_RECURSION_LIMIT: u32 = u32::MAX;

/// *Mutex control block*: the state data of a mutex.
pub struct Mutex<Traits: PortThreading> {
    pub(super) obj: Obj<Traits>,

    ty: CpuLockCell<Traits, MutexType>,
    protocol: CpuLockCell<Traits, MutexProtocol>,
    robust: CpuLockCell<Traits, bool>,

    /// Set when a robust owner terminated while holding the lock; cleared
    /// when the next acquirer observes `Abandoned`.
    inconsistent: CpuLockCell<Traits, bool>,

    /// Recursion depth beyond the first acquisition.
    count: CpuLockCell<Traits, u32>,

    /// The task that currently owns the mutex lock.
    pub(super) owning_task: CpuLockCell<Traits, Option<&'static Task<Traits>>>,

    /// The next element in the singly-linked list headed by
    /// `Task::last_mutex_held`, containing all mutexes currently held by the
    /// owning task.
    pub(super) prev_mutex_held: CpuLockCell<Traits, Option<&'static Mutex<Traits>>>,
}

impl<Traits: PortThreading> Mutex<Traits> {
    /// Construct a mutex in place, for `static` storage provided by the
    /// application.
    pub const fn new(ty: MutexType, protocol: MutexProtocol) -> Self {
        Self::with_obj(Obj::new_static(), ty, protocol, false)
    }

    /// [`Mutex::new`] with the robustness flag set.
    pub const fn new_robust(ty: MutexType, protocol: MutexProtocol) -> Self {
        Self::with_obj(Obj::new_static(), ty, protocol, true)
    }

    const fn with_obj(
        obj: Obj<Traits>,
        ty: MutexType,
        protocol: MutexProtocol,
        robust: bool,
    ) -> Self {
        Self {
            obj,
            ty: CpuLockCell::new(ty),
            protocol: CpuLockCell::new(protocol),
            robust: CpuLockCell::new(robust),
            inconsistent: CpuLockCell::new(false),
            count: CpuLockCell::new(0),
            owning_task: CpuLockCell::new(None),
            prev_mutex_held: CpuLockCell::new(None),
        }
    }
}

impl<Traits: PortThreading> Init for Mutex<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::with_obj(Obj::new_free(), MutexType::Normal, MutexProtocol::None, false);
}

impl<Traits: PortThreading> KernelObject<Traits> for Mutex<Traits> {
    fn obj(&self) -> &Obj<Traits> {
        &self.obj
    }
}

impl<Traits: PortThreading> fmt::Debug for Mutex<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("self", &(self as *const _))
            .finish_non_exhaustive()
    }
}

/// The outcome of a successful fast-path poll.
enum PollOutcome {
    /// The lock was acquired (or the recursion count was incremented).
    Acquired,
    /// The lock was acquired, but the previous owner died holding it.
    AcquiredAbandoned,
    /// The mutex is contended; the caller should block.
    Contended,
}

impl<Traits: KernelTraits> Mutex<Traits> {
    /// Allocate and construct a mutex from the kernel pool. Returns `None`
    /// on pool exhaustion.
    pub fn create(ty: MutexType, protocol: MutexProtocol, robust: bool) -> Option<&'static Self> {
        let mut lock = klock::lock_cpu::<Traits>().ok()?;
        let mutex = object::allocate_from_pool(&Traits::state().mutex_pool[..], lock.borrow_mut())?;
        mutex.ty.replace(&mut *lock, ty);
        mutex.protocol.replace(&mut *lock, protocol);
        mutex.robust.replace(&mut *lock, robust);
        mutex.inconsistent.replace(&mut *lock, false);
        mutex.count.replace(&mut *lock, 0);
        mutex.owning_task.replace(&mut *lock, None);
        Some(mutex)
    }

    /// Attempt to acquire the mutex without blocking. Contention is reported
    /// as `Timeout`.
    pub fn take(&'static self) -> Result<(), TryLockMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();
        match self.poll_core(lock.borrow_mut(), running_task)? {
            PollOutcome::Acquired => Ok(()),
            PollOutcome::AcquiredAbandoned => Err(TryLockMutexError::Abandoned),
            PollOutcome::Contended => Err(TryLockMutexError::Timeout),
        }
    }

    /// Acquire the mutex, blocking indefinitely while it is contended.
    pub fn wait(&'static self) -> Result<(), LockMutexError> {
        match self.wait_for(INFINITE) {
            Ok(()) => Ok(()),
            Err(LockMutexTimeoutError::BadContext) => Err(LockMutexError::BadContext),
            Err(LockMutexTimeoutError::Stopped) => Err(LockMutexError::Stopped),
            Err(LockMutexTimeoutError::Deleted) => Err(LockMutexError::Deleted),
            Err(LockMutexTimeoutError::WouldDeadlock) => Err(LockMutexError::WouldDeadlock),
            Err(LockMutexTimeoutError::BadParam) => Err(LockMutexError::BadParam),
            Err(LockMutexTimeoutError::QueueOverflow) => Err(LockMutexError::QueueOverflow),
            Err(LockMutexTimeoutError::Abandoned) => Err(LockMutexError::Abandoned),
            Err(LockMutexTimeoutError::Timeout) => {
                unreachable!("got timeout result for a non-timeout wait")
            }
        }
    }

    /// Acquire the mutex, blocking for up to `delay` ticks.
    pub fn wait_for(&'static self, delay: Ticks) -> Result<(), LockMutexTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();
        let result = match self.poll_core(lock.borrow_mut(), running_task)? {
            PollOutcome::Acquired => Ok(()),
            PollOutcome::AcquiredAbandoned => Err(LockMutexTimeoutError::Abandoned),
            PollOutcome::Contended => {
                // Raise the owner's effective priority along the mutex chain
                // before going to sleep behind it.
                if self.protocol.get(&*lock) == MutexProtocol::Inherit {
                    let priority = running_task.effective_priority.get(&*lock);
                    boost_priority_chain(lock.borrow_mut(), self, priority);
                }

                running_task.waiting_mutex.replace(&mut *lock, Some(self));
                let wait_result =
                    self.obj
                        .wait_queue
                        .wait_timeout(lock.borrow_mut(), WaitPayload::Mutex(self), delay);
                running_task.waiting_mutex.replace(&mut *lock, None);

                match wait_result {
                    Ok(_) => {
                        // A releaser transfers ownership before waking a
                        // waiter. Being woken without the lock means the
                        // ceiling was lowered below our priority.
                        let is_owner = match self.owning_task.get(&*lock) {
                            Some(t) => core::ptr::eq(t, running_task),
                            None => false,
                        };
                        if !is_owner {
                            Err(LockMutexTimeoutError::BadParam)
                        } else if self.inconsistent.replace(&mut *lock, false) {
                            Err(LockMutexTimeoutError::Abandoned)
                        } else {
                            Ok(())
                        }
                    }
                    Err(e) => Err(e.into()),
                }
            }
        };
        task::return_to_task(lock);
        result
    }

    /// Acquire the mutex, blocking until the absolute time `time`.
    pub fn wait_until(&'static self, time: Ticks) -> Result<(), LockMutexTimeoutError> {
        self.wait_for(task::delay_until::<Traits>(time)?)
    }

    /// Release the mutex, transferring ownership to the highest-priority
    /// waiter if there is one.
    pub fn give(&'static self) -> Result<(), UnlockMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();
        let owner = self.owning_task.get(&*lock);

        // A `Normal` non-robust mutex skips the ownership check, like its
        // POSIX counterpart.
        let unchecked_unlock =
            self.ty.get(&*lock) == MutexType::Normal && !self.robust.get(&*lock);
        let is_owner = match owner {
            Some(t) => core::ptr::eq(t, running_task),
            None => false,
        };
        if !unchecked_unlock && !is_owner {
            return Err(UnlockMutexError::NotOwner);
        }

        let count = self.count.get(&*lock);
        if count > 0 {
            self.count.replace(&mut *lock, count - 1);
            return Ok(());
        }

        if let Some(owner) = owner {
            unlink_from_holder(lock.borrow_mut(), self, owner);

            // Lower the ex-owner's effective priority. This may cause
            // preemption.
            let base = owner.base_priority.get(&*lock);
            let effective = evaluate_task_effective_priority(lock.borrow_mut(), owner, base);
            set_effective_priority(lock.borrow_mut(), owner, effective);
        }

        transfer_lock(lock.borrow_mut(), self);

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Change the ceiling priority of a `Ceiling` mutex.
    ///
    /// Waiters whose effective priority exceeds the new ceiling are woken
    /// with `BadParam`, upholding the ceiling protocol's precondition.
    pub fn set_ceiling(&'static self, priority: Priority) -> Result<(), SetCeilingError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        match self.protocol.get(&*lock) {
            MutexProtocol::Ceiling(_) => {}
            _ => return Err(SetCeilingError::BadObjectState),
        }
        self.protocol
            .replace(&mut *lock, MutexProtocol::Ceiling(priority));

        // Evict waiters that are now above the ceiling. They observe the
        // missing ownership and report `BadParam`.
        loop {
            let Some(waiter) = self.obj.wait_queue.first_waiting_task(lock.borrow_mut()) else {
                break;
            };
            if waiter.effective_priority.get(&*lock) <= priority {
                break;
            }
            crate::wait::interrupt_task(lock.borrow_mut(), waiter, Ok(())).unwrap();
        }

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Get the ceiling priority of a `Ceiling` mutex.
    pub fn ceiling(&'static self) -> Result<Option<Priority>, crate::error::BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());
        Ok(match self.protocol.get(&*lock) {
            MutexProtocol::Ceiling(c) => Some(c),
            _ => None,
        })
    }

    /// Return a flag indicating whether the mutex is currently locked.
    pub fn is_locked(&'static self) -> Result<bool, crate::error::BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());
        Ok(self.owning_task.get(&*lock).is_some())
    }

    /// Reset the mutex: wake all waiters with `Stopped` and release the
    /// lock without transferring it.
    pub fn reset(&'static self) -> Result<(), crate::error::BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        self.reset_inner(lock.borrow_mut(), crate::error::WaitTimeoutError::Stopped);
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// [`Mutex::reset`], plus the mutex's storage is retired. Waiters are
    /// woken with `Deleted` if the mutex is pooled, `Stopped` otherwise.
    pub fn destroy(&'static self) -> Result<(), crate::error::BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.obj.expect_live(lock.borrow_mut());

        let result = if self.obj.is_pooled(lock.borrow_mut()) {
            crate::error::WaitTimeoutError::Deleted
        } else {
            crate::error::WaitTimeoutError::Stopped
        };
        self.reset_inner(lock.borrow_mut(), result);
        self.obj.finalize(lock.borrow_mut());
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    fn reset_inner(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        wait_result: crate::error::WaitTimeoutError,
    ) {
        if let Some(owner) = self.owning_task.replace(&mut *lock, None) {
            unlink_from_holder(lock.borrow_mut(), self, owner);
            let base = owner.base_priority.get(&*lock);
            let effective = evaluate_task_effective_priority(lock.borrow_mut(), owner, base);
            set_effective_priority(lock.borrow_mut(), owner, effective);
        }
        self.count.replace(&mut *lock, 0);
        self.inconsistent.replace(&mut *lock, false);
        self.obj
            .wait_queue
            .wake_up_all(lock.borrow_mut(), Err(wait_result));
    }

    /// Check if the current state of the mutex allows `running_task` to
    /// acquire it, and do so if it does.
    fn poll_core(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        running_task: &'static Task<Traits>,
    ) -> Result<PollOutcome, LockMutexPrecheckError> {
        if let MutexProtocol::Ceiling(ceiling) = self.protocol.get(&*lock) {
            if running_task.effective_priority.get(&*lock) > ceiling {
                return Err(LockMutexPrecheckError::BadParam);
            }
        }

        let owner = self.owning_task.get(&*lock);
        match owner {
            None => {
                debug_assert_eq!(self.count.get(&*lock), 0);
                lock_core(lock.borrow_mut(), self, running_task);
                if self.inconsistent.replace(&mut *lock, false) {
                    Ok(PollOutcome::AcquiredAbandoned)
                } else {
                    Ok(PollOutcome::Acquired)
                }
            }
            Some(owner) if core::ptr::eq(owner, running_task) => {
                match self.ty.get(&*lock) {
                    MutexType::Recursive => {
                        let count = self.count.get(&*lock);
                        if count < MUTEX_RECURSION_LIMIT {
                            self.count.replace(&mut *lock, count + 1);
                            Ok(PollOutcome::Acquired)
                        } else {
                            Err(LockMutexPrecheckError::QueueOverflow)
                        }
                    }
                    MutexType::ErrorCheck => Err(LockMutexPrecheckError::WouldDeadlock),
                    // Self-lock of a `Normal` mutex deadlocks, like its
                    // POSIX counterpart.
                    MutexType::Normal => Ok(PollOutcome::Contended),
                }
            }
            Some(_) => Ok(PollOutcome::Contended),
        }
    }
}

/// Give the ownership of the mutex to `task`.
///
/// The task must be in the Running state or the Waiting state (as the head
/// of the mutex's wait queue, about to be woken).
fn lock_core<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex: &'static Mutex<Traits>,
    task: &'static Task<Traits>,
) {
    debug_assert!(matches!(
        task.st.get(&*lock),
        TaskSt::Running | TaskSt::Waiting
    ));

    mutex.owning_task.replace(&mut *lock, Some(task));

    // Push `mutex` to the list of the mutexes held by the task.
    let prev_mutex_held = task.last_mutex_held.replace(&mut *lock, Some(mutex));
    mutex.prev_mutex_held.replace(&mut *lock, prev_mutex_held);

    if let MutexProtocol::Ceiling(ceiling) = mutex.protocol.get(&*lock) {
        let effective = task.effective_priority.get(&*lock);
        if effective < ceiling {
            // The task is Running or about to be popped from the head of
            // the wait queue, so no repositioning is needed.
            task.effective_priority.replace(&mut *lock, ceiling);
        }
    }
}

/// Remove `mutex` from `owner`'s held-mutex list.
fn unlink_from_holder<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex: &'static Mutex<Traits>,
    owner: &'static Task<Traits>,
) {
    let mut prev: Option<&'static Mutex<Traits>> = None;
    let mut cur = owner.last_mutex_held.get(&*lock);
    while let Some(m) = cur {
        if core::ptr::eq(m, mutex) {
            let next = m.prev_mutex_held.get(&*lock);
            match prev {
                None => {
                    owner.last_mutex_held.replace(&mut *lock, next);
                }
                Some(p) => {
                    p.prev_mutex_held.replace(&mut *lock, next);
                }
            }
            m.prev_mutex_held.replace(&mut *lock, None);
            return;
        }
        prev = cur;
        cur = m.prev_mutex_held.get(&*lock);
    }
    debug_assert!(false, "mutex was not in the holder's list");
}

/// Pass the lock to the next waiter, or leave the mutex unlocked.
fn transfer_lock<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex: &'static Mutex<Traits>,
) {
    if let Some(next_task) = mutex.obj.wait_queue.first_waiting_task(lock.borrow_mut()) {
        // Give the ownership of the mutex to `next_task` and wake it up
        lock_core(lock.borrow_mut(), mutex, next_task);
        let woken = mutex.obj.wait_queue.wake_up_one(lock.borrow_mut());
        debug_assert!(woken.is_some());

        // The new owner may still inherit from the remaining waiters (or
        // hold other contended mutexes).
        let base = next_task.base_priority.get(&*lock);
        let effective = evaluate_task_effective_priority(lock.borrow_mut(), next_task, base);
        set_effective_priority(lock.borrow_mut(), next_task, effective);
    } else {
        mutex.owning_task.replace(&mut *lock, None);
    }
}

/// Abandon all mutexes held by the task, marking robust ones inconsistent.
///
/// This method may make tasks Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` (or something similar) as needed.
pub(super) fn abandon_held_mutexes<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static Task<Traits>,
) {
    let mut maybe_mutex = task.last_mutex_held.replace(&mut *lock, None);
    while let Some(mutex) = maybe_mutex {
        maybe_mutex = mutex.prev_mutex_held.replace(&mut *lock, None);
        if mutex.robust.get(&*lock) {
            mutex.inconsistent.replace(&mut *lock, true);
        }
        mutex.count.replace(&mut *lock, 0);
        transfer_lock(lock.borrow_mut(), mutex);
    }
}

/// Reevaluate the task's effective priority from its base priority and held
/// mutexes. (This function doesn't update `Task::effective_priority`.)
pub(super) fn evaluate_task_effective_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static Task<Traits>,
    base_priority: Priority,
) -> Priority {
    let mut effective = base_priority;
    let mut maybe_mutex = task.last_mutex_held.get(&*lock);

    while let Some(mutex) = maybe_mutex {
        match mutex.protocol.get(&*lock) {
            MutexProtocol::Ceiling(ceiling) => {
                effective = effective.max(ceiling);
            }
            MutexProtocol::Inherit => {
                if let Some(waiter) = mutex.obj.wait_queue.first_waiting_task(lock.borrow_mut()) {
                    effective = effective.max(waiter.effective_priority.get(&*lock));
                }
            }
            MutexProtocol::None => {}
        }
        maybe_mutex = mutex.prev_mutex_held.get(&*lock);
    }

    effective
}

/// Check that raising the task's base priority to `new_base_priority` does
/// not violate the ceiling of any mutex it holds.
pub(super) fn held_mutexes_allow_base_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static Task<Traits>,
    new_base_priority: Priority,
) -> bool {
    let mut maybe_mutex = task.last_mutex_held.get(&*lock);
    while let Some(mutex) = maybe_mutex {
        if let MutexProtocol::Ceiling(ceiling) = mutex.protocol.get(&*lock) {
            if new_base_priority > ceiling {
                return false;
            }
        }
        maybe_mutex = mutex.prev_mutex_held.get(&*lock);
    }
    true
}

/// Assign a new effective priority and reposition the task in whatever
/// priority-ordered structure it currently occupies.
fn set_effective_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static Task<Traits>,
    priority: Priority,
) {
    let old = task.effective_priority.replace(&mut *lock, priority);
    if old == priority {
        return;
    }
    match task.st.get(&*lock) {
        TaskSt::Ready => {
            Traits::state()
                .task_ready_queue
                .reorder_task(lock.borrow_mut(), task);
        }
        TaskSt::Waiting => {
            crate::wait::reorder_wait_of_task(lock.borrow_mut(), task);
        }
        TaskSt::Running | TaskSt::Stopped => {}
    }
}

/// Raise owners' effective priorities to at least `priority` along the
/// chain starting at `mutex`: if an owner is itself blocked on another
/// `Inherit` mutex, the raise propagates to that mutex's owner.
fn boost_priority_chain<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mut mutex: &'static Mutex<Traits>,
    priority: Priority,
) {
    loop {
        if mutex.protocol.get(&*lock) != MutexProtocol::Inherit {
            break;
        }
        let Some(owner) = mutex.owning_task.get(&*lock) else { break };
        if owner.effective_priority.get(&*lock) >= priority {
            break;
        }
        set_effective_priority(lock.borrow_mut(), owner, priority);

        match owner.waiting_mutex.get(&*lock) {
            Some(next_mutex) => mutex = next_mutex,
            None => break,
        }
    }
}

/// Re-evaluate the owners' effective priorities along the chain starting at
/// `mutex`, in either direction. Called when a waiter leaves a wait queue or
/// changes its priority.
pub(super) fn reevaluate_owner_chain<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mut mutex: &'static Mutex<Traits>,
) {
    loop {
        let Some(owner) = mutex.owning_task.get(&*lock) else { break };
        let base = owner.base_priority.get(&*lock);
        let effective = evaluate_task_effective_priority(lock.borrow_mut(), owner, base);
        if owner.effective_priority.get(&*lock) == effective {
            break;
        }
        set_effective_priority(lock.borrow_mut(), owner, effective);

        match owner.waiting_mutex.get(&*lock) {
            Some(next_mutex) => mutex = next_mutex,
            None => break,
        }
    }
}

/// A waiter's priority changed while it was blocked on `mutex`; let the
/// inheritance chain follow, in either direction.
pub(super) fn on_waiter_priority_changed<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    _waiter: &'static Task<Traits>,
    mutex: &'static Mutex<Traits>,
) {
    reevaluate_owner_chain(lock, mutex);
}
