//! Tasks
//!
//! The task table is a fixed pool of task control blocks. A TCB's `st` field
//! is the single source of truth for which list (ready bucket, wait queue,
//! or none) currently owns it; the intrusive `link` field belongs to that
//! list.
use core::fmt;

use crate::{
    cfg,
    error::KernelError,
    event, klock,
    klock::{CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    state, timeout, timer,
    utils::Init,
    wait, KernelTraits, ObjName, Port, Result, System, TaskEntry, TaskId, Ticks,
};

pub mod readyqueue;

/// A reference to a task control block in the static task pool.
pub(crate) type TaskRef<Traits> = &'static TaskCb<Traits>;

/// The pool slot reserved for the kernel-created idle task.
const IDLE_SLOT: usize = 0;

const TASK_MAGIC: u32 = 0x5443_4201;

bitflags::bitflags! {
    /// Task creation flags.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u32 {
        /// The task uses the FPU; the port preserves FPU context for it.
        const FPU = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Task mode bits, set at start and adjusted with
    /// [`System::task_mode`].
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct TaskMode: u32 {
        /// The task cannot be preempted while it runs.
        const NO_PREEMPT = 1 << 0;
        /// The task is round-robin scheduled within its priority.
        const TIME_SLICE = 1 << 1;
        /// Asynchronous signal routines are masked.
        const NO_ASR = 1 << 2;
        /// The task runs with interrupts masked.
        const INTS_MASKED = 1 << 8;
    }
}

impl Init for TaskFlags {
    const INIT: Self = Self::empty();
}

impl Init for TaskMode {
    const INIT: Self = Self::empty();
}

/// Task state machine.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum TaskSt {
    /// The pool slot is vacant.
    Free,
    /// Created but never started.
    Created,
    /// On a ready bucket, waiting for the processor.
    Ready,
    /// Owns the processor.
    Running,
    /// Waiting on an IPC object or a timeout.
    Blocked,
    /// Explicitly suspended.
    Suspended,
}

impl Init for TaskSt {
    const INIT: Self = Self::Free;
}

/// Intrusive list links. Owned by whichever list currently holds the task;
/// a task is on at most one list at a time.
pub(crate) struct Link<Traits: Port> {
    pub(crate) prev: Option<TaskRef<Traits>>,
    pub(crate) next: Option<TaskRef<Traits>>,
}

impl<Traits: Port> Clone for Link<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: Port> Copy for Link<Traits> {}

impl<Traits: Port> Init for Link<Traits> {
    const INIT: Self = Self {
        prev: None,
        next: None,
    };
}

/// Head of an intrusive task list.
pub(crate) struct ListHead<Traits: Port> {
    pub(crate) first: Option<TaskRef<Traits>>,
    pub(crate) last: Option<TaskRef<Traits>>,
}

impl<Traits: Port> Clone for ListHead<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: Port> Copy for ListHead<Traits> {}

impl<Traits: Port> Init for ListHead<Traits> {
    const INIT: Self = Self {
        first: None,
        last: None,
    };
}

/// *Task control block* — the state data of a task.
#[repr(C)]
pub struct TaskCb<Traits: Port> {
    /// The port's per-task context. Guaranteed to be placed at the beginning
    /// of the struct so that low-level code can refer to it easily.
    pub port_task_state: Traits::PortTaskState,

    pub(crate) magic: CpuLockCell<Traits, u32>,
    pub(crate) generation: CpuLockCell<Traits, u32>,
    pub(crate) st: CpuLockCell<Traits, TaskSt>,
    pub(crate) name: CpuLockCell<Traits, ObjName>,
    pub(crate) priority: CpuLockCell<Traits, u8>,
    pub(crate) flags: CpuLockCell<Traits, TaskFlags>,
    pub(crate) mode: CpuLockCell<Traits, TaskMode>,
    pub(crate) entry: CpuLockCell<Traits, Option<TaskEntry>>,
    pub(crate) args: CpuLockCell<Traits, [u32; 4]>,
    pub(crate) regs: CpuLockCell<Traits, [u32; cfg::TASK_REGS]>,
    pub(crate) stack_size: CpuLockCell<Traits, usize>,
    pub(crate) slice_remaining: CpuLockCell<Traits, Ticks>,

    /// A suspension requested while the task was blocked; takes effect when
    /// the wait concludes.
    pub(crate) suspend_pending: CpuLockCell<Traits, bool>,

    pub(crate) link: CpuLockCell<Traits, Link<Traits>>,
    pub(crate) wait: wait::TaskWait<Traits>,

    /// The timeout backing this task's blocking calls.
    pub(crate) timeout: timeout::Timeout<Traits>,
}

impl<Traits: Port> Init for TaskCb<Traits> {
    const INIT: Self = Self {
        port_task_state: Init::INIT,
        magic: Init::INIT,
        generation: Init::INIT,
        st: Init::INIT,
        name: Init::INIT,
        priority: Init::INIT,
        flags: Init::INIT,
        mode: Init::INIT,
        entry: Init::INIT,
        args: Init::INIT,
        regs: Init::INIT,
        stack_size: Init::INIT,
        slice_remaining: Init::INIT,
        suspend_pending: Init::INIT,
        link: Init::INIT,
        wait: Init::INIT,
        timeout: Init::INIT,
    };
}

impl<Traits: KernelTraits> TaskCb<Traits> {
    /// The entry point and argument vector recorded by the last
    /// [`System::task_start`] or restart. Used by ports when they build the
    /// task's initial context lazily.
    pub fn start_info(&self) -> Option<(TaskEntry, [u32; 4])> {
        let lock = klock::lock_cpu::<Traits>().ok()?;
        let entry = self.entry.get(&*lock)?;
        Some((entry, self.args.get(&*lock)))
    }
}

impl<Traits: Port> fmt::Debug for TaskCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("TaskCb").field(&(self as *const _)).finish()
    }
}

/// The task pool and stack budget.
pub(crate) struct TaskPool<Traits: Port> {
    pub(crate) tasks: [TaskCb<Traits>; cfg::MAX_TASKS],
    stack_used: CpuLockCell<Traits, usize>,
}

impl<Traits: Port> Init for TaskPool<Traits> {
    const INIT: Self = Self {
        tasks: Init::INIT,
        stack_used: Init::INIT,
    };
}

/// Recover a task's pool slot from its address.
pub(crate) fn task_slot<Traits: KernelTraits>(cb: &TaskCb<Traits>) -> usize {
    let base = Traits::state().task_pool.tasks.as_ptr() as usize;
    let offset_bytes = cb as *const TaskCb<Traits> as usize - base;
    offset_bytes / core::mem::size_of::<TaskCb<Traits>>()
}

pub(crate) fn task_id_of<Traits: KernelTraits>(
    lock: &klock::CpuLockToken<Traits>,
    cb: &TaskCb<Traits>,
) -> TaskId {
    TaskId::from_parts(task_slot(cb), cb.generation.get(lock))
}

/// Resolve a task id to its control block, validating the slot, the
/// generation, and the block's liveness.
pub(crate) fn task_cb<Traits: KernelTraits>(
    lock: &klock::CpuLockToken<Traits>,
    id: TaskId,
) -> Result<TaskRef<Traits>> {
    let slot = id.slot();
    if slot >= cfg::MAX_TASKS {
        return Err(KernelError::BadId);
    }
    let cb = &Traits::state().task_pool.tasks[slot];
    if cb.st.get(lock) == TaskSt::Free {
        return Err(KernelError::ObjectDeleted);
    }
    if cb.generation.get(lock) != id.generation() {
        return Err(KernelError::BadId);
    }
    debug_assert_eq!(cb.magic.get(lock), TASK_MAGIC);
    Ok(cb)
}

// Intrusive list primitives
// ---------------------------------------------------------------------------
//
// These operate on any `ListHead` cell (ready buckets, wait queues) and the
// per-task `link` field. The caller is responsible for membership: removing
// a task from a list it is not on corrupts both lists.

pub(crate) fn list_push_back<Traits: Port>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    head_cell: &CpuLockCell<Traits, ListHead<Traits>>,
    task: TaskRef<Traits>,
) {
    let mut head = head_cell.get(&*lock);
    task.link.replace(
        &mut *lock,
        Link {
            prev: head.last,
            next: None,
        },
    );
    match head.last {
        Some(last) => {
            let mut last_link = last.link.get(&*lock);
            last_link.next = Some(task);
            last.link.replace(&mut *lock, last_link);
        }
        None => head.first = Some(task),
    }
    head.last = Some(task);
    head_cell.replace(&mut *lock, head);
}

/// Insert `task` keeping the list sorted by ascending priority number
/// (highest priority first). Equal priorities preserve arrival order.
pub(crate) fn list_insert_priority<Traits: Port>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    head_cell: &CpuLockCell<Traits, ListHead<Traits>>,
    task: TaskRef<Traits>,
) {
    let task_priority = task.priority.get(&*lock);
    let mut at = head_cell.get(&*lock).first;
    while let Some(cur) = at {
        if cur.priority.get(&*lock) > task_priority {
            break;
        }
        at = cur.link.get(&*lock).next;
    }

    let Some(before) = at else {
        return list_push_back(lock, head_cell, task);
    };

    let before_link = before.link.get(&*lock);
    task.link.replace(
        &mut *lock,
        Link {
            prev: before_link.prev,
            next: Some(before),
        },
    );
    match before_link.prev {
        Some(prev) => {
            let mut prev_link = prev.link.get(&*lock);
            prev_link.next = Some(task);
            prev.link.replace(&mut *lock, prev_link);
        }
        None => {
            let mut head = head_cell.get(&*lock);
            head.first = Some(task);
            head_cell.replace(&mut *lock, head);
        }
    }
    let mut before_link = before.link.get(&*lock);
    before_link.prev = Some(task);
    before.link.replace(&mut *lock, before_link);
}

pub(crate) fn list_remove<Traits: Port>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    head_cell: &CpuLockCell<Traits, ListHead<Traits>>,
    task: TaskRef<Traits>,
) {
    let mut head = head_cell.get(&*lock);
    let link = task.link.get(&*lock);
    match link.prev {
        Some(prev) => {
            let mut prev_link = prev.link.get(&*lock);
            prev_link.next = link.next;
            prev.link.replace(&mut *lock, prev_link);
        }
        None => {
            debug_assert!(matches!(head.first, Some(f) if core::ptr::eq(f, task)));
            head.first = link.next;
        }
    }
    match link.next {
        Some(next) => {
            let mut next_link = next.link.get(&*lock);
            next_link.prev = link.prev;
            next.link.replace(&mut *lock, next_link);
        }
        None => {
            debug_assert!(matches!(head.last, Some(l) if core::ptr::eq(l, task)));
            head.last = link.prev;
        }
    }
    task.link.replace(&mut *lock, Link::INIT);
    head_cell.replace(&mut *lock, head);
}

pub(crate) fn list_pop_front<Traits: Port>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    head_cell: &CpuLockCell<Traits, ListHead<Traits>>,
) -> Option<TaskRef<Traits>> {
    let first = head_cell.get(&*lock).first?;
    list_remove(lock, head_cell, first);
    Some(first)
}

// Pool management
// ---------------------------------------------------------------------------

fn alloc_task_cb<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) -> Result<TaskRef<Traits>> {
    let pool = &Traits::state().task_pool;
    for cb in pool.tasks.iter() {
        if cb.st.get(&*lock) == TaskSt::Free {
            cb.magic.replace(&mut *lock, TASK_MAGIC);
            cb.st.replace(&mut *lock, TaskSt::Created);
            return Ok(cb);
        }
    }
    Err(KernelError::NoTcb)
}

/// Zero a control block and return its slot to the pool. The caller must
/// have unlinked the task from any list and cancelled its timers.
fn free_task_cb<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>, cb: TaskRef<Traits>) {
    let pool = &Traits::state().task_pool;
    let stack_size = cb.stack_size.get(&*lock);
    let used = pool.stack_used.get(&*lock);
    pool.stack_used.replace(&mut *lock, used - stack_size);

    event::reset_block::<Traits>(lock.borrow_mut(), task_slot(cb));

    cb.magic.replace(&mut *lock, 0);
    cb.name.replace(&mut *lock, ObjName::INIT);
    cb.priority.replace(&mut *lock, 0);
    cb.flags.replace(&mut *lock, TaskFlags::empty());
    cb.mode.replace(&mut *lock, TaskMode::empty());
    cb.entry.replace(&mut *lock, None);
    cb.args.replace(&mut *lock, [0; 4]);
    cb.regs.replace(&mut *lock, [0; cfg::TASK_REGS]);
    cb.stack_size.replace(&mut *lock, 0);
    cb.slice_remaining.replace(&mut *lock, 0);
    cb.suspend_pending.replace(&mut *lock, false);
    cb.link.replace(&mut *lock, Link::INIT);
    wait::reset(lock.borrow_mut(), cb);

    let generation = cb.generation.get(&*lock);
    cb.generation
        .replace(&mut *lock, generation.wrapping_add(1) & TaskId::GENERATION_MASK);
    cb.st.replace(&mut *lock, TaskSt::Free);
}

// Scheduling
// ---------------------------------------------------------------------------

/// Transition the task into the Ready state and insert it at the tail of its
/// priority bucket.
///
/// # Safety
///
/// The task must not currently be on any list.
pub(crate) unsafe fn make_ready<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    cb: TaskRef<Traits>,
) {
    cb.st.replace(&mut *lock, TaskSt::Ready);
    readyqueue::push_back_task(lock, cb);
}

#[inline]
fn ptr_from_option_ref<T>(x: Option<&T>) -> *const T {
    if let Some(x) = x {
        x
    } else {
        core::ptr::null()
    }
}

/// Elect the next running task.
///
/// A Running task that has disabled preemption keeps the processor. The
/// outgoing task, if still Ready, rotates to the tail of its bucket.
pub(crate) fn choose_next_running_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    let state = Traits::state();
    let prev_running_task = state.running_task.get(&*lock);

    if let Some(prev) = prev_running_task {
        if prev.st.get(&*lock) == TaskSt::Running
            && prev.mode.get(&*lock).contains(TaskMode::NO_PREEMPT)
        {
            return;
        }
    }

    // The special value `usize::MAX` indicates that there is no task that
    // could keep running, and a new one must be elected even if none is
    // ready.
    let prev_task_priority = match prev_running_task {
        Some(task) if task.st.get(&*lock) == TaskSt::Running => {
            task.priority.get(&*lock) as usize
        }
        _ => usize::MAX,
    };

    let decision = readyqueue::pop_front_task(lock.borrow_mut(), prev_task_priority);

    let next_running_task = match decision {
        readyqueue::ScheduleDecision::SwitchTo(task) => task,
        // There's no task willing to take over, and the current one can
        // still run.
        readyqueue::ScheduleDecision::Keep => {
            debug_assert_ne!(prev_task_priority, usize::MAX);
            return;
        }
    };

    if let Some(task) = next_running_task {
        task.st.replace(&mut *lock, TaskSt::Running);

        if ptr_from_option_ref(prev_running_task) == (task as *const _) {
            // The same task was re-elected
            return;
        }

        let count = state.context_switch_count.get(&*lock);
        state
            .context_switch_count
            .replace(&mut *lock, count.wrapping_add(1));
    }

    // `prev_running_task` loses the processor
    if let Some(prev) = prev_running_task {
        if prev.st.get(&*lock) == TaskSt::Running {
            // Preempted, not blocking: rotate to the tail of its bucket.
            // Safety: a Running task is on no list
            unsafe { make_ready(lock.borrow_mut(), prev) };
        }
    }

    state.running_task.replace(&mut *lock, next_running_task);
}

/// Relinquish CPU Lock. After that, if there's a higher-priority ready task
/// than the running one, call `Port::yield_cpu`.
///
/// Services that transition a task into the Ready state call this before
/// returning to the caller.
pub(crate) fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
) {
    let state = Traits::state();
    let running = state.running_task.get(&*lock);

    if let Some(task) = running {
        if task.st.get(&*lock) == TaskSt::Running
            && task.mode.get(&*lock).contains(TaskMode::NO_PREEMPT)
        {
            return;
        }
    }

    let prev_task_priority = match running {
        Some(task) if task.st.get(&*lock) == TaskSt::Running => {
            task.priority.get(&*lock) as usize
        }
        _ => usize::MAX,
    };

    let has_preempting_task =
        readyqueue::has_ready_task_in_priority_range(lock.borrow_mut(), ..prev_task_priority);

    // Relinquish CPU Lock
    drop(lock);

    if has_preempting_task {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }
}

/// Give up the processor until the current task is Running again. The caller
/// has already moved the task out of the Running state (Blocked or
/// Suspended); whoever wakes it re-inserts it into the ready set.
pub(crate) fn wait_until_woken_up<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    debug_assert_eq!(state::expect_waitable_context::<Traits>(), Ok(()));

    let running_task = Traits::state().running_task.get(&*lock).unwrap();
    debug_assert_ne!(running_task.st.get(&*lock), TaskSt::Free);

    while running_task.st.get(&*lock) != TaskSt::Running {
        // Temporarily release CPU Lock before calling `yield_cpu`.
        // Safety: (1) No cell is accessed while unlocked. (2) CPU Lock is
        //         active now and will be re-acquired before the loop
        //         continues.
        unsafe { Traits::leave_cpu_lock() };
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
        unsafe { Traits::enter_cpu_lock() };
    }
}

/// Debit the running task's round-robin quantum by `elapsed` ticks,
/// rotating it to the tail of its bucket when the quantum runs out.
pub(crate) fn debit_time_slice<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    elapsed: Ticks,
) {
    let Some(task) = Traits::state().running_task.get(&*lock) else {
        return;
    };
    if task.st.get(&*lock) != TaskSt::Running {
        return;
    }
    let mode = task.mode.get(&*lock);
    if !mode.contains(TaskMode::TIME_SLICE) || mode.contains(TaskMode::NO_PREEMPT) {
        return;
    }

    let remaining = task.slice_remaining.get(&*lock);
    if remaining > elapsed {
        task.slice_remaining.replace(&mut *lock, remaining - elapsed);
    } else {
        task.slice_remaining
            .replace(&mut *lock, cfg::DEFAULT_TIME_SLICE);
        // Safety: a Running task is on no list
        unsafe { make_ready(lock, task) };
        // The caller's dispatch path elects the new head of the bucket
    }
}

/// The alarm budget imposed by the running task's round-robin quantum, if
/// any.
pub(crate) fn current_slice_budget<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> Option<Ticks> {
    let task = Traits::state().running_task.get(&*lock)?;
    if task.st.get(&*lock) != TaskSt::Running {
        return None;
    }
    let mode = task.mode.get(&*lock);
    if !mode.contains(TaskMode::TIME_SLICE) || mode.contains(TaskMode::NO_PREEMPT) {
        return None;
    }
    Some(task.slice_remaining.get(&*lock).max(1))
}

/// Wake a suspended task. Shared by [`System::task_resume`] and the timer
/// service's wake action.
pub(crate) fn resume_task_core<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    cb: TaskRef<Traits>,
) -> Result<()> {
    match cb.st.get(&*lock) {
        TaskSt::Blocked if cb.suspend_pending.get(&*lock) => {
            cb.suspend_pending.replace(&mut *lock, false);
            Ok(())
        }
        TaskSt::Suspended => {
            // Safety: a Suspended task is on no list
            unsafe { make_ready(lock, cb) };
            Ok(())
        }
        _ => Err(KernelError::NotSuspended),
    }
}

// Boot-time task creation
// ---------------------------------------------------------------------------

fn idle_task_body<Traits: KernelTraits>(_args: [u32; 4]) {
    loop {
        // Safety: we are the idle task; the port decides what idling means
        unsafe { Traits::idle() };
    }
}

pub(crate) fn init_idle_task<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let cb = alloc_task_cb(lock.borrow_mut()).unwrap();
    debug_assert_eq!(task_slot(cb), IDLE_SLOT);

    cb.name.replace(&mut *lock, ObjName::new(*b"IDLE"));
    cb.priority.replace(&mut *lock, cfg::IDLE_PRIORITY);
    cb.stack_size.replace(&mut *lock, cfg::MIN_TASK_STACK);
    let pool = &Traits::state().task_pool;
    let used = pool.stack_used.get(&*lock);
    pool.stack_used.replace(&mut *lock, used + cfg::MIN_TASK_STACK);
    cb.entry
        .replace(&mut *lock, Some(idle_task_body::<Traits> as TaskEntry));

    // Safety: CPU Lock active, the task is in the Created state
    unsafe { Traits::initialize_task_state(cb) };
    // Safety: the task is on no list
    unsafe { make_ready(lock, cb) };
}

pub(crate) fn init_root_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    entry: TaskEntry,
    args: [u32; 4],
) {
    let cb = alloc_task_cb(lock.borrow_mut()).unwrap();

    cb.name.replace(&mut *lock, ObjName::new(*b"ROOT"));
    cb.priority.replace(&mut *lock, cfg::ROOT_PRIORITY);
    cb.stack_size.replace(&mut *lock, cfg::MIN_TASK_STACK);
    let pool = &Traits::state().task_pool;
    let used = pool.stack_used.get(&*lock);
    pool.stack_used.replace(&mut *lock, used + cfg::MIN_TASK_STACK);
    cb.entry.replace(&mut *lock, Some(entry));
    cb.args.replace(&mut *lock, args);

    // Safety: CPU Lock active, the task is in the Created state
    unsafe { Traits::initialize_task_state(cb) };
    // Safety: the task is on no list
    unsafe { make_ready(lock, cb) };
}

// Public interface
// ---------------------------------------------------------------------------

impl<Traits: KernelTraits> System<Traits> {
    /// Allocate a task control block and charge its stack against the stack
    /// budget. The task is created in the Created state and does not run
    /// until [`System::task_start`].
    pub fn task_create(
        name: ObjName,
        priority: u8,
        stack_bytes: usize,
        flags: TaskFlags,
    ) -> Result<TaskId> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        if !(cfg::MIN_TASK_PRIORITY..=cfg::MAX_TASK_PRIORITY).contains(&priority) {
            return Err(KernelError::BadPriority);
        }
        if stack_bytes < cfg::MIN_TASK_STACK {
            return Err(KernelError::TinyStack);
        }
        let pool = &Traits::state().task_pool;
        let used = pool.stack_used.get(&*lock);
        if used + stack_bytes > cfg::STACK_POOL_SIZE {
            return Err(KernelError::NoStack);
        }

        let cb = alloc_task_cb(lock.borrow_mut())?;
        pool.stack_used.replace(&mut *lock, used + stack_bytes);
        cb.name.replace(&mut *lock, name);
        cb.priority.replace(&mut *lock, priority);
        cb.flags.replace(&mut *lock, flags);
        cb.stack_size.replace(&mut *lock, stack_bytes);

        Ok(task_id_of(&*lock, cb))
    }

    /// Start a Created task: record its mode, entry point and argument
    /// vector, initialize its context, and make it Ready. If it outranks the
    /// running task, a switch is requested.
    pub fn task_start(id: TaskId, mode: TaskMode, entry: TaskEntry, args: [u32; 4]) -> Result<()> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = task_cb(&*lock, id)?;

        if cb.st.get(&*lock) != TaskSt::Created {
            return Err(KernelError::Active);
        }

        cb.mode.replace(&mut *lock, mode);
        if mode.contains(TaskMode::TIME_SLICE) {
            cb.slice_remaining
                .replace(&mut *lock, cfg::DEFAULT_TIME_SLICE);
        }
        cb.entry.replace(&mut *lock, Some(entry));
        cb.args.replace(&mut *lock, args);

        // Safety: CPU Lock active, the task is in the Created state
        unsafe { Traits::initialize_task_state(cb) };
        // Safety: a Created task is on no list
        unsafe { make_ready(lock.borrow_mut(), cb) };

        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Delete a task, cancelling its timers, detaching it from any wait
    /// queue, and returning its TCB and stack budget to the pools. Deleting
    /// the running task reschedules unconditionally.
    pub fn task_delete(id: TaskId) -> Result<()> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = task_cb(&*lock, id)?;

        if task_slot(cb) == IDLE_SLOT {
            return Err(KernelError::BadParam);
        }

        timer::cancel_owned_by::<Traits>(lock.borrow_mut(), id);

        match cb.st.get(&*lock) {
            TaskSt::Blocked => wait::abort_wait(lock.borrow_mut(), cb),
            TaskSt::Ready => readyqueue::remove_task(lock.borrow_mut(), cb),
            _ => {}
        }

        let is_current =
            ptr_from_option_ref(Traits::state().running_task.get(&*lock)) == (cb as *const _);

        if is_current {
            free_task_cb(lock.borrow_mut(), cb);
            Traits::state().running_task.replace(&mut *lock, None);
            // The port releases the CPU Lock state in `exit_and_dispatch`
            core::mem::forget(lock);
            // Safety: CPU Lock active, `cb` is no longer the running task
            unsafe { Traits::exit_and_dispatch(cb) };
        } else {
            // Safety: CPU Lock active, the task is not running
            unsafe { Traits::discard_task_state(cb) };
            free_task_cb(lock.borrow_mut(), cb);
            Ok(())
        }
    }

    /// Destroy and recreate a started task's context in place with a new
    /// argument vector; the task becomes Ready.
    pub fn task_restart(id: TaskId, args: [u32; 4]) -> Result<()> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = task_cb(&*lock, id)?;

        let st = cb.st.get(&*lock);
        if st == TaskSt::Created {
            return Err(KernelError::NotActive);
        }
        if task_slot(cb) == IDLE_SLOT {
            return Err(KernelError::BadParam);
        }

        // The old activation's timers and waits don't survive the restart
        timer::cancel_owned_by::<Traits>(lock.borrow_mut(), id);
        if st == TaskSt::Blocked {
            wait::abort_wait(lock.borrow_mut(), cb);
        }
        cb.suspend_pending.replace(&mut *lock, false);
        cb.args.replace(&mut *lock, args);
        event::clear_wait_state::<Traits>(lock.borrow_mut(), task_slot(cb));
        if cb.mode.get(&*lock).contains(TaskMode::TIME_SLICE) {
            cb.slice_remaining
                .replace(&mut *lock, cfg::DEFAULT_TIME_SLICE);
        }

        // Safety: CPU Lock active
        unsafe {
            Traits::discard_task_state(cb);
            Traits::initialize_task_state(cb);
        }

        match st {
            TaskSt::Running => {
                // Restarting the running task: its current activation ends
                // here and the next dispatch enters the entry point afresh.
                // Safety: the task is on no list
                unsafe { make_ready(lock.borrow_mut(), cb) };
                Traits::state().running_task.replace(&mut *lock, None);
                core::mem::forget(lock);
                // Safety: CPU Lock active, `cb` is no longer the running task
                unsafe { Traits::exit_and_dispatch(cb) };
            }
            TaskSt::Ready => {
                // Already queued; the rebuilt context takes effect at the
                // next dispatch
                drop(lock);
                Ok(())
            }
            TaskSt::Blocked | TaskSt::Suspended => {
                // Safety: the task was detached above / is on no list
                unsafe { make_ready(lock.borrow_mut(), cb) };
                unlock_cpu_and_check_preemption(lock);
                Ok(())
            }
            TaskSt::Free | TaskSt::Created => unreachable!(),
        }
    }

    /// Suspend a task. Suspending the running task gives up the processor
    /// before returning; suspending a blocked task takes effect when its
    /// wait concludes.
    pub fn task_suspend(id: TaskId) -> Result<()> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = task_cb(&*lock, id)?;

        if task_slot(cb) == IDLE_SLOT {
            return Err(KernelError::BadParam);
        }

        match cb.st.get(&*lock) {
            TaskSt::Suspended => Err(KernelError::Suspended),
            TaskSt::Created => Err(KernelError::NotActive),
            TaskSt::Blocked => {
                if cb.suspend_pending.get(&*lock) {
                    Err(KernelError::Suspended)
                } else {
                    cb.suspend_pending.replace(&mut *lock, true);
                    Ok(())
                }
            }
            TaskSt::Ready => {
                readyqueue::remove_task(lock.borrow_mut(), cb);
                cb.st.replace(&mut *lock, TaskSt::Suspended);
                Ok(())
            }
            TaskSt::Running => {
                // Suspending the current task (on a single core, only the
                // current task can be Running)
                state::expect_waitable_context::<Traits>()?;
                cb.st.replace(&mut *lock, TaskSt::Suspended);
                wait_until_woken_up(lock.borrow_mut());
                Ok(())
            }
            TaskSt::Free => unreachable!(),
        }
    }

    /// Resume a suspended task, or clear a pending deferred suspension.
    pub fn task_resume(id: TaskId) -> Result<()> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = task_cb(&*lock, id)?;
        resume_task_core(lock.borrow_mut(), cb)?;
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Change a task's priority, repositioning it in whatever ordered list
    /// holds it. Returns the previous priority.
    pub fn task_set_priority(id: TaskId, new_priority: u8) -> Result<u8> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = task_cb(&*lock, id)?;

        if !(cfg::MIN_TASK_PRIORITY..=cfg::MAX_TASK_PRIORITY).contains(&new_priority) {
            return Err(KernelError::BadPriority);
        }

        let old_priority = cb.priority.get(&*lock);
        if old_priority == new_priority {
            return Ok(old_priority);
        }

        let st = cb.st.get(&*lock);
        cb.priority.replace(&mut *lock, new_priority);
        match st {
            TaskSt::Ready => {
                readyqueue::reorder_task(
                    lock.borrow_mut(),
                    cb,
                    new_priority as usize,
                    old_priority as usize,
                );
            }
            TaskSt::Blocked => wait::reorder_wait_of_task(lock.borrow_mut(), cb),
            _ => {}
        }

        if matches!(st, TaskSt::Running | TaskSt::Ready) {
            // Lowering the running task below a ready one, or raising a
            // ready task above the running one, forces a switch
            unlock_cpu_and_check_preemption(lock);
        }
        Ok(old_priority)
    }

    /// Update the running task's mode bits selected by `mask`. Returns the
    /// previous mode.
    pub fn task_mode(mask: TaskMode, new_mode: TaskMode) -> Result<TaskMode> {
        state::expect_task_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = Traits::state().running_task.get(&*lock).unwrap();

        let old_mode = cb.mode.get(&*lock);
        let mode = (old_mode & !mask) | (new_mode & mask);
        cb.mode.replace(&mut *lock, mode);

        if mask.contains(TaskMode::TIME_SLICE) && mode.contains(TaskMode::TIME_SLICE) {
            cb.slice_remaining
                .replace(&mut *lock, cfg::DEFAULT_TIME_SLICE);
        }

        if old_mode.contains(TaskMode::NO_PREEMPT) && !mode.contains(TaskMode::NO_PREEMPT) {
            // Re-enabling preemption may immediately yield to a task that
            // became ready in the meantime
            unlock_cpu_and_check_preemption(lock);
        }
        Ok(old_mode)
    }

    /// Find a task by name.
    pub fn task_ident(name: ObjName) -> Result<TaskId> {
        let lock = klock::lock_cpu::<Traits>()?;
        let pool = &Traits::state().task_pool;
        for cb in pool.tasks.iter() {
            if cb.st.get(&*lock) != TaskSt::Free && cb.name.get(&*lock) == name {
                return Ok(task_id_of(&*lock, cb));
            }
        }
        Err(KernelError::ObjectNotFound)
    }

    /// The id of the calling task.
    pub fn current_task() -> Result<TaskId> {
        state::expect_task_context::<Traits>()?;
        let lock = klock::lock_cpu::<Traits>()?;
        let cb = Traits::state().running_task.get(&*lock).unwrap();
        Ok(task_id_of(&*lock, cb))
    }

    /// Read a task's notepad register.
    pub fn task_get_register(id: TaskId, regnum: usize) -> Result<u32> {
        let lock = klock::lock_cpu::<Traits>()?;
        let cb = task_cb(&*lock, id)?;
        if regnum >= cfg::TASK_REGS {
            return Err(KernelError::BadRegister);
        }
        Ok(cb.regs.get(&*lock)[regnum])
    }

    /// Write a task's notepad register.
    pub fn task_set_register(id: TaskId, regnum: usize, value: u32) -> Result<()> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = task_cb(&*lock, id)?;
        if regnum >= cfg::TASK_REGS {
            return Err(KernelError::BadRegister);
        }
        let mut regs = cb.regs.get(&*lock);
        regs[regnum] = value;
        cb.regs.replace(&mut *lock, regs);
        Ok(())
    }
}
