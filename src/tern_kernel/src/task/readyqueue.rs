//! Task ready queue (internal use only).
//!
//! One intrusive doubly-linked list per priority level, plus a two-level
//! bitmap of the non-empty levels for constant-time top-priority lookup.
use core::ops::RangeTo;

use crate::{
    cfg::PRIORITY_LEVELS,
    klock::{CpuLockCell, CpuLockTokenRefMut},
    task::{self, ListHead, TaskRef},
    utils::{FixedPrioBitmap, Init},
    KernelTraits, Port,
};

/// The set of segregated ready lists, one per priority.
pub(crate) struct ReadyQueue<Traits: Port> {
    /// Invariant: `bitmap` bit `i` is set iff `buckets[i].first.is_some()`.
    buckets: [CpuLockCell<Traits, ListHead<Traits>>; PRIORITY_LEVELS],
    bitmap: CpuLockCell<Traits, FixedPrioBitmap>,
}

impl<Traits: Port> Init for ReadyQueue<Traits> {
    const INIT: Self = Self {
        buckets: Init::INIT,
        bitmap: Init::INIT,
    };
}

/// The result type of [`pop_front_task`].
pub(crate) enum ScheduleDecision<T> {
    /// Keep scheduling the current task.
    Keep,
    /// Switch to the specified task.
    SwitchTo(Option<T>),
}

/// Insert the task at the tail of the bucket for its priority (FIFO within
/// priority).
///
/// The caller guarantees the task is not already queued.
pub(crate) fn push_back_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
) {
    let rq = &Traits::state().ready_queue;
    let priority = task.priority.get(&*lock) as usize;
    task::list_push_back(lock.borrow_mut(), &rq.buckets[priority], task);
    rq.bitmap.write(&mut *lock).set(priority);
}

/// Remove a Ready task from its bucket (suspension, deletion).
pub(crate) fn remove_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
) {
    let rq = &Traits::state().ready_queue;
    let priority = task.priority.get(&*lock) as usize;
    task::list_remove(lock.borrow_mut(), &rq.buckets[priority], task);
    if rq.buckets[priority].get(&*lock).first.is_none() {
        rq.bitmap.write(&mut *lock).clear(priority);
    }
}

/// Choose the next task to schedule based on `prev_task_priority`, the
/// priority of the task that would keep running if no preemption happened
/// (`usize::MAX` if there is no such task).
///
/// | Current task can run? | Higher-priority ready task? | Returns             |
/// |-----------------------|-----------------------------|---------------------|
/// | yes                   | no                          | `Keep`              |
/// | yes                   | yes                         | `SwitchTo(Some(_))` |
/// | no                    | (any ready task)            | `SwitchTo(Some(_))` |
/// | no                    | (none ready)                | `SwitchTo(None)`    |
///
/// If this returns `SwitchTo(Some(task))`, `task` has been removed from the
/// queue.
pub(crate) fn pop_front_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    prev_task_priority: usize,
) -> ScheduleDecision<TaskRef<Traits>> {
    let rq = &Traits::state().ready_queue;

    // The default value is `usize::MAX - 1`: if nothing is ready and there's
    // no current task (`prev_task_priority == usize::MAX`), this method must
    // return `SwitchTo(None)` rather than `Keep`, so the default must
    // compare lower than `usize::MAX`. It can't collide with a real priority
    // because of `PRIORITY_LEVELS`.
    let next_task_priority = rq.bitmap.read(&*lock).find_set().unwrap_or(usize::MAX - 1);

    if prev_task_priority <= next_task_priority {
        ScheduleDecision::Keep
    } else if next_task_priority < PRIORITY_LEVELS {
        let task = task::list_pop_front(lock.borrow_mut(), &rq.buckets[next_task_priority])
            // The bitmap said the bucket is non-empty
            .unwrap();

        if rq.buckets[next_task_priority].get(&*lock).first.is_none() {
            rq.bitmap.write(&mut *lock).clear(next_task_priority);
        }

        ScheduleDecision::SwitchTo(Some(task))
    } else {
        ScheduleDecision::SwitchTo(None)
    }
}

/// Reposition a Ready task after its priority changed from `old_priority`
/// to `priority`. It re-enters the new bucket at the tail.
pub(crate) fn reorder_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
    priority: usize,
    old_priority: usize,
) {
    debug_assert_ne!(priority, old_priority);
    let rq = &Traits::state().ready_queue;

    task::list_remove(lock.borrow_mut(), &rq.buckets[old_priority], task);
    task::list_push_back(lock.borrow_mut(), &rq.buckets[priority], task);

    rq.bitmap.write(&mut *lock).set(priority);
    if rq.buckets[old_priority].get(&*lock).first.is_none() {
        rq.bitmap.write(&mut *lock).clear(old_priority);
    }
}

/// Is there a Ready task whose priority is in the given range?
pub(crate) fn has_ready_task_in_priority_range<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    range: RangeTo<usize>,
) -> bool {
    let rq = &Traits::state().ready_queue;
    let highest = rq.bitmap.read(&*lock).find_set().unwrap_or(usize::MAX);
    highest < range.end
}
