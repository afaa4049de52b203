//! Wait queues and the blocking state of tasks
//!
//! A blocking service call enqueues the calling task on the object's wait
//! queue (or on no queue at all for event waits), optionally arms the task's
//! embedded timeout, and gives up the processor. The waker — a signalling
//! task, the timeout handler, or an object deletion — detaches the task,
//! records the wait's outcome in the TCB, and re-inserts the task into the
//! ready set.
use crate::{
    error::KernelError,
    klock::{CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    task::{self, ListHead, TaskRef, TaskSt},
    timeout,
    utils::Init,
    KernelTraits, Port, Result, Ticks,
};

bitflags::bitflags! {
    /// Flags accepted by blocking acquire/receive operations.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct WaitFlags: u32 {
        /// Fail instead of blocking when the operation cannot complete
        /// immediately.
        const NO_WAIT = 1 << 0;
    }
}

impl Init for WaitFlags {
    const INIT: Self = Self::empty();
}

/// Ordering policy of a wait queue, fixed at object creation.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueOrder {
    /// Tasks wake in arrival order.
    Fifo,
    /// Tasks wake in ascending priority-number order; ties preserve arrival
    /// order.
    Priority,
}

impl Init for QueueOrder {
    const INIT: Self = Self::Fifo;
}

/// What a blocked task is waiting for. The payload-specific data (event
/// masks, message slots) lives in the respective subsystem's control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitPayload {
    None,
    Semaphore,
    Queue,
    Event,
}

impl Init for WaitPayload {
    const INIT: Self = Self::None;
}

/// A queue of tasks blocked on one kernel object.
pub(crate) struct WaitQueue<Traits: Port> {
    head: CpuLockCell<Traits, ListHead<Traits>>,
    order: CpuLockCell<Traits, QueueOrder>,
}

impl<Traits: Port> Init for WaitQueue<Traits> {
    const INIT: Self = Self {
        head: Init::INIT,
        order: Init::INIT,
    };
}

/// The wait descriptor embedded in every TCB.
pub(crate) struct TaskWait<Traits: Port> {
    pub(crate) payload: CpuLockCell<Traits, WaitPayload>,
    /// The queue the task is enqueued on, if any. `None` for queue-less
    /// waits (events) and for unblocked tasks.
    queue: CpuLockCell<Traits, Option<&'static WaitQueue<Traits>>>,
    /// The outcome recorded by the waker; `None` is success.
    outcome: CpuLockCell<Traits, Option<KernelError>>,
}

impl<Traits: Port> Init for TaskWait<Traits> {
    const INIT: Self = Self {
        payload: Init::INIT,
        queue: Init::INIT,
        outcome: Init::INIT,
    };
}

impl<Traits: KernelTraits> WaitQueue<Traits> {
    pub(crate) fn set_order(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, order: QueueOrder) {
        self.order.replace(&mut *lock, order);
    }

    pub(crate) fn is_empty(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.head.get(&*lock).first.is_none()
    }

    fn enqueue(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, task: TaskRef<Traits>) {
        match self.order.get(&*lock) {
            QueueOrder::Fifo => task::list_push_back(lock.borrow_mut(), &self.head, task),
            QueueOrder::Priority => {
                task::list_insert_priority(lock.borrow_mut(), &self.head, task)
            }
        }
        task.wait.queue.replace(&mut *lock, Some(self));
    }
}

/// Block the current task on `queue` until a waker completes the wait.
pub(crate) fn wait<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    queue: &'static WaitQueue<Traits>,
    payload: WaitPayload,
) -> Result<()> {
    wait_inner(lock, Some(queue), payload, None)
}

/// Like [`wait`], but also arm the task's timeout for the given absolute
/// deadline (`None` = wait forever).
pub(crate) fn wait_timeout<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    queue: &'static WaitQueue<Traits>,
    payload: WaitPayload,
    deadline: Option<Ticks>,
) -> Result<()> {
    wait_inner(lock, Some(queue), payload, deadline)
}

/// Block the current task without enqueueing it anywhere (event waits). The
/// waker finds the task through its id.
pub(crate) fn wait_no_queue_timeout<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    payload: WaitPayload,
    deadline: Option<Ticks>,
) -> Result<()> {
    wait_inner(lock, None, payload, deadline)
}

fn wait_inner<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    queue: Option<&'static WaitQueue<Traits>>,
    payload: WaitPayload,
    deadline: Option<Ticks>,
) -> Result<()> {
    let task = Traits::state().running_task.get(&*lock).unwrap();
    debug_assert_eq!(task.st.get(&*lock), TaskSt::Running);
    debug_assert_eq!(task.wait.payload.get(&*lock), WaitPayload::None);

    task.wait.payload.replace(&mut *lock, payload);
    task.wait.outcome.replace(&mut *lock, None);
    match queue {
        Some(queue) => queue.enqueue(lock.borrow_mut(), task),
        None => {
            task.wait.queue.replace(&mut *lock, None);
        }
    }

    if let Some(at) = deadline {
        task.timeout.arm(
            lock.borrow_mut(),
            at,
            wait_timeout_handler::<Traits>,
            task::task_slot(task),
        );
        timeout::insert_timeout(lock.borrow_mut(), &task.timeout);
    }

    task.st.replace(&mut *lock, TaskSt::Blocked);
    task::wait_until_woken_up(lock.borrow_mut());

    task.wait.payload.replace(&mut *lock, WaitPayload::None);
    match task.wait.outcome.get(&*lock) {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

/// The timeout callback armed by [`wait_timeout`]. Removes the task from
/// whatever wait queue holds it and wakes it with `Timeout`.
fn wait_timeout_handler<Traits: KernelTraits>(
    param: usize,
    mut guard: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    let task: TaskRef<Traits> = &Traits::state().task_pool.tasks[param];

    if task.st.get(&*guard) == TaskSt::Blocked {
        let mut lock = guard.borrow_mut();
        if let Some(queue) = task.wait.queue.get(&*lock) {
            task::list_remove(lock.borrow_mut(), &queue.head, task);
            task.wait.queue.replace(&mut *lock, None);
        }
        task.wait
            .outcome
            .replace(&mut *lock, Some(KernelError::Timeout));
        ready_or_suspend(lock, task);
    }

    guard
}

/// Conclude a wait: cancel the timeout, record the outcome, and move the
/// task to Ready (or park it in Suspended if a deferred suspension is
/// pending). The caller has already detached the task from its wait queue.
pub(crate) fn complete_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
    outcome: Option<KernelError>,
) {
    debug_assert_eq!(task.st.get(&*lock), TaskSt::Blocked);

    task.wait.queue.replace(&mut *lock, None);
    timeout::remove_timeout(lock.borrow_mut(), &task.timeout);
    task.wait.outcome.replace(&mut *lock, outcome);
    ready_or_suspend(lock, task);
}

fn ready_or_suspend<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
) {
    if task.suspend_pending.get(&*lock) {
        task.suspend_pending.replace(&mut *lock, false);
        task.st.replace(&mut *lock, TaskSt::Suspended);
    } else {
        // Safety: the task has been detached from every list
        unsafe { task::make_ready(lock, task) };
    }
}

/// Wake up the longest-waiting (or highest-priority) waiter. Returns `false`
/// if the queue is empty.
pub(crate) fn wake_up_one<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    queue: &WaitQueue<Traits>,
) -> bool {
    match task::list_pop_front(lock.borrow_mut(), &queue.head) {
        Some(task) => {
            complete_wait(lock, task, None);
            true
        }
        None => false,
    }
}

/// Wake every waiter with the given error (object deletion). Returns the
/// number of tasks woken.
pub(crate) fn wake_up_all_with<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    queue: &WaitQueue<Traits>,
    err: KernelError,
) -> usize {
    let mut count = 0;
    while let Some(task) = task::list_pop_front(lock.borrow_mut(), &queue.head) {
        complete_wait(lock.borrow_mut(), task, Some(err));
        count += 1;
    }
    count
}

/// Tear down a Blocked task's wait without waking it (deletion, restart).
pub(crate) fn abort_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
) {
    debug_assert_eq!(task.st.get(&*lock), TaskSt::Blocked);
    if let Some(queue) = task.wait.queue.get(&*lock) {
        task::list_remove(lock.borrow_mut(), &queue.head, task);
        task.wait.queue.replace(&mut *lock, None);
    }
    timeout::remove_timeout(lock.borrow_mut(), &task.timeout);
    task.wait.payload.replace(&mut *lock, WaitPayload::None);
}

/// Reposition a blocked task within its wait queue after a priority change.
pub(crate) fn reorder_wait_of_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
) {
    if let Some(queue) = task.wait.queue.get(&*lock) {
        if queue.order.get(&*lock) == QueueOrder::Priority {
            task::list_remove(lock.borrow_mut(), &queue.head, task);
            task::list_insert_priority(lock.borrow_mut(), &queue.head, task);
        }
    }
}

/// Clear the wait descriptor of a freed TCB.
pub(crate) fn reset<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
) {
    task.wait.payload.replace(&mut *lock, WaitPayload::None);
    task.wait.queue.replace(&mut *lock, None);
    task.wait.outcome.replace(&mut *lock, None);
    timeout::remove_timeout(lock.borrow_mut(), &task.timeout);
}
