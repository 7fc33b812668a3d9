//! Task ready queue implementation (internal use only).
//!
//! The ready queue is a linked list of `Ready` tasks sorted by descending
//! effective priority, FIFO among equal priorities. Corax priorities are
//! arbitrary `u32`s, so a segregated-queue-per-level structure is not an
//! option; the list threads through `Task::ready_next`.
use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    task::Task,
    utils::Init,
    KernelTraits, PortThreading, Priority,
};

/// The result type of [`ReadyQueue::pop_front_task`].
pub(crate) enum ScheduleDecision<T> {
    /// The kernel should not perform a context switch and should continue to
    /// schedule the current task.
    Keep,
    /// The kernel should perform a context switch to the specified task.
    SwitchTo(Option<T>),
}

pub(crate) struct ReadyQueue<Traits: PortThreading> {
    head: CpuLockCell<Traits, Option<&'static Task<Traits>>>,
}

impl<Traits: PortThreading> Init for ReadyQueue<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        head: CpuLockCell::new(None),
    };
}

impl<Traits: KernelTraits> ReadyQueue<Traits> {
    /// Insert `task` as close to the back as possible without violating the
    /// priority ordering: after every task of equal or higher effective
    /// priority.
    ///
    /// The task must not already be in the queue.
    pub(crate) fn push_back_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        task: &'static Task<Traits>,
    ) {
        debug_assert!(task.ready_next.get(&*lock).is_none());

        let prio = task.effective_priority.get(&*lock);

        let mut prev: Option<&'static Task<Traits>> = None;
        let mut cur = self.head.get(&*lock);
        while let Some(t) = cur {
            if t.effective_priority.get(&*lock) < prio {
                break;
            }
            prev = cur;
            cur = t.ready_next.get(&*lock);
        }

        task.ready_next.replace(&mut *lock, cur);
        match prev {
            None => {
                self.head.replace(&mut *lock, Some(task));
            }
            Some(p) => {
                p.ready_next.replace(&mut *lock, Some(task));
            }
        }
    }

    /// Unlink `task` from the queue. Returns `false` if it was not linked.
    pub(crate) fn remove_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        task: &'static Task<Traits>,
    ) -> bool {
        let mut prev: Option<&'static Task<Traits>> = None;
        let mut cur = self.head.get(&*lock);
        while let Some(t) = cur {
            if core::ptr::eq(t, task) {
                let next = t.ready_next.get(&*lock);
                match prev {
                    None => {
                        self.head.replace(&mut *lock, next);
                    }
                    Some(p) => {
                        p.ready_next.replace(&mut *lock, next);
                    }
                }
                t.ready_next.replace(&mut *lock, None);
                return true;
            }
            prev = cur;
            cur = t.ready_next.get(&*lock);
        }
        false
    }

    /// Choose the next task to schedule.
    ///
    /// `prev_task_priority` is the effective priority of the task that would
    /// keep running if this decision does not preempt it, or `None` if there
    /// is no such task (there is no running task, or it is leaving the
    /// Running state) and a new one must be elected.
    ///
    /// If this method returns `SwitchTo(Some(task))`, `task` is removed from
    /// the queue.
    pub(crate) fn pop_front_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        prev_task_priority: Option<Priority>,
    ) -> ScheduleDecision<&'static Task<Traits>> {
        let front = self.head.get(&*lock);

        if let (Some(prev_prio), Some(front)) = (prev_task_priority, front) {
            if front.effective_priority.get(&*lock) <= prev_prio {
                // There's no task willing to take over the current one, and
                // the current one can still run.
                return ScheduleDecision::Keep;
            }
        } else if prev_task_priority.is_some() {
            // The queue is empty and the current task can still run.
            return ScheduleDecision::Keep;
        }

        if let Some(front) = front {
            let next = front.ready_next.get(&*lock);
            self.head.replace(&mut *lock, next);
            front.ready_next.replace(&mut *lock, None);
            ScheduleDecision::SwitchTo(Some(front))
        } else {
            ScheduleDecision::SwitchTo(None)
        }
    }

    /// Return a flag indicating whether a Ready task should preempt a
    /// running task of priority `running_priority` (`None` meaning "no
    /// runnable current task").
    pub(crate) fn has_preempting_task(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        running_priority: Option<Priority>,
    ) -> bool {
        match (self.head.get(&*lock), running_priority) {
            (Some(front), Some(prio)) => front.effective_priority.get(&*lock) > prio,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Return a flag indicating whether any Ready task has exactly the given
    /// effective priority. Used by the round-robin scheduler to decide
    /// whether rotation is worthwhile.
    pub(crate) fn has_ready_task_at_priority(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        priority: Priority,
    ) -> bool {
        let mut cur = self.head.get(&*lock);
        while let Some(t) = cur {
            let prio = t.effective_priority.get(&*lock);
            if prio == priority {
                return true;
            }
            if prio < priority {
                break;
            }
            cur = t.ready_next.get(&*lock);
        }
        false
    }

    /// Reposition `task` after a change in its effective priority.
    ///
    /// The task must be in the queue.
    pub(crate) fn reorder_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        task: &'static Task<Traits>,
    ) {
        let was_linked = self.remove_task(lock.borrow_mut(), task);
        debug_assert!(was_linked);
        self.push_back_task(lock.borrow_mut(), task);
    }
}
