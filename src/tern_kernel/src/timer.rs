//! Timers
//!
//! The timer service arms entries in the timeout list on behalf of tasks.
//! Expiry either posts events to the arming task or wakes it from the sleep
//! it entered when it armed the timer. Firing runs at the kernel's
//! critical-section level inside the tick pipeline.
use crate::{
    cfg,
    error::KernelError,
    event, klock,
    klock::{CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    state, task,
    task::TaskSt,
    timeout,
    timeout::{TimeOfDay, Timeout},
    utils::Init,
    Id, KernelTraits, Port, Result, System, TaskId, Ticks, TimerId,
};

const TIMER_MAGIC: u32 = 0x544d_4201;

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// Fires once, `n` ticks after arming.
    OneShot,
    /// Fires every `period` ticks.
    Periodic,
    /// Fires when the calendar clock reaches a target instant.
    Absolute,
}

impl Init for TimerKind {
    const INIT: Self = Self::OneShot;
}

/// What happens when a timer fires. An action naming a task that no longer
/// exists is dropped silently.
#[derive(Clone, Copy)]
pub(crate) enum TimerAction {
    None,
    SendEvents { task: TaskId, events: u32 },
    WakeTask { task: TaskId },
}

impl Init for TimerAction {
    const INIT: Self = Self::None;
}

/// *Timer control block* — the state data of a timer.
pub struct TimerCb<Traits: Port> {
    magic: CpuLockCell<Traits, u32>,
    generation: CpuLockCell<Traits, u32>,
    armed: CpuLockCell<Traits, bool>,
    kind: CpuLockCell<Traits, TimerKind>,
    period: CpuLockCell<Traits, Ticks>,
    action: CpuLockCell<Traits, TimerAction>,
    /// The task that armed the timer. Deleting it cancels the timer.
    owner: CpuLockCell<Traits, Option<TaskId>>,
    timeout: Timeout<Traits>,
}

impl<Traits: Port> Init for TimerCb<Traits> {
    const INIT: Self = Self {
        magic: Init::INIT,
        generation: Init::INIT,
        armed: Init::INIT,
        kind: Init::INIT,
        period: Init::INIT,
        action: Init::INIT,
        owner: Init::INIT,
        timeout: Init::INIT,
    };
}

pub(crate) struct TimerPool<Traits: Port> {
    blocks: [TimerCb<Traits>; cfg::MAX_TIMERS],
}

impl<Traits: Port> Init for TimerPool<Traits> {
    const INIT: Self = Self {
        blocks: Init::INIT,
    };
}

fn timer_slot<Traits: KernelTraits>(cb: &TimerCb<Traits>) -> usize {
    let base = Traits::state().timer_pool.blocks.as_ptr() as usize;
    (cb as *const TimerCb<Traits> as usize - base) / core::mem::size_of::<TimerCb<Traits>>()
}

fn timer_cb<Traits: KernelTraits>(
    lock: &klock::CpuLockToken<Traits>,
    id: TimerId,
) -> Result<&'static TimerCb<Traits>> {
    let slot = id.slot();
    if slot >= cfg::MAX_TIMERS {
        return Err(KernelError::BadTimerId);
    }
    let cb = &Traits::state().timer_pool.blocks[slot];
    if !cb.armed.get(lock) || cb.generation.get(lock) != id.generation() {
        // Also covers a one-shot that already fired: its block was freed and
        // its generation bumped
        return Err(KernelError::BadTimerId);
    }
    debug_assert_eq!(cb.magic.get(lock), TIMER_MAGIC);
    Ok(cb)
}

fn free_timer_cb<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    cb: &TimerCb<Traits>,
) {
    debug_assert!(!cb.timeout.is_linked(lock.borrow_mut()));
    cb.magic.replace(&mut *lock, 0);
    cb.armed.replace(&mut *lock, false);
    cb.action.replace(&mut *lock, TimerAction::None);
    cb.owner.replace(&mut *lock, None);
    cb.period.replace(&mut *lock, 0);
    let generation = cb.generation.get(&*lock);
    cb.generation
        .replace(&mut *lock, generation.wrapping_add(1) & Id::GENERATION_MASK);
}

/// Allocate a timer block, configure it, and insert its timeout.
fn arm_timer<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    kind: TimerKind,
    action: TimerAction,
    at: Ticks,
    period: Ticks,
) -> Result<TimerId> {
    let pool = &Traits::state().timer_pool;

    let mut found = None;
    for cb in pool.blocks.iter() {
        if !cb.armed.get(&*lock) {
            found = Some(cb);
            break;
        }
    }
    let cb = found.ok_or(KernelError::NoTimers)?;

    let owner = Traits::state()
        .running_task
        .get(&*lock)
        .map(|t| task::task_id_of(&*lock, t));

    cb.magic.replace(&mut *lock, TIMER_MAGIC);
    cb.armed.replace(&mut *lock, true);
    cb.kind.replace(&mut *lock, kind);
    cb.period.replace(&mut *lock, period);
    cb.action.replace(&mut *lock, action);
    cb.owner.replace(&mut *lock, owner);

    cb.timeout.arm(
        lock.borrow_mut(),
        at,
        timer_timeout_handler::<Traits>,
        timer_slot(cb),
    );
    timeout::insert_timeout(lock.borrow_mut(), &cb.timeout);

    Ok(Id::from_parts(timer_slot(cb), cb.generation.get(&*lock)))
}

/// The timeout callback for a timer block: perform the action, then re-arm
/// (periodic) or free the block.
fn timer_timeout_handler<Traits: KernelTraits>(
    slot: usize,
    mut guard: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    let cb = &Traits::state().timer_pool.blocks[slot];
    debug_assert!(cb.armed.get(&*guard));

    let mut lock = guard.borrow_mut();
    match cb.action.get(&*lock) {
        TimerAction::SendEvents { task, events } => {
            if let Ok(target) = task::task_cb::<Traits>(&*lock, task) {
                event::send_core(lock.borrow_mut(), target, events);
            }
        }
        TimerAction::WakeTask { task } => {
            if let Ok(target) = task::task_cb::<Traits>(&*lock, task) {
                let _ = task::resume_task_core(lock.borrow_mut(), target);
            }
        }
        TimerAction::None => {}
    }

    if cb.kind.get(&*lock) == TimerKind::Periodic {
        let period = cb.period.get(&*lock);
        cb.timeout.adjust_expiration(lock.borrow_mut(), period);
        timeout::insert_timeout(lock.borrow_mut(), &cb.timeout);
    } else {
        free_timer_cb(lock, cb);
    }

    guard
}

/// Cancel every armed timer owned by the given task (task deletion).
pub(crate) fn cancel_owned_by<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    owner: TaskId,
) {
    let pool = &Traits::state().timer_pool;
    for cb in pool.blocks.iter() {
        if cb.armed.get(&*lock) && cb.owner.get(&*lock) == Some(owner) {
            timeout::remove_timeout(lock.borrow_mut(), &cb.timeout);
            free_timer_cb(lock.borrow_mut(), cb);
        }
    }
}

impl<Traits: KernelTraits> System<Traits> {
    /// Arm a one-shot timer that sends `events` to the calling task after
    /// `ticks` ticks.
    pub fn timer_event_after(ticks: Ticks, events: u32) -> Result<TimerId> {
        if ticks == 0 {
            return Err(KernelError::IllegalTicks);
        }
        state::expect_task_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        let current = Traits::state().running_task.get(&*lock).unwrap();
        let task = task::task_id_of(&*lock, current);
        let at = Traits::tick_count() + ticks;
        arm_timer(
            lock.borrow_mut(),
            TimerKind::OneShot,
            TimerAction::SendEvents { task, events },
            at,
            0,
        )
    }

    /// Arm a periodic timer that sends `events` to the calling task every
    /// `ticks` ticks.
    pub fn timer_event_every(ticks: Ticks, events: u32) -> Result<TimerId> {
        if ticks == 0 {
            return Err(KernelError::IllegalTicks);
        }
        state::expect_task_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        let current = Traits::state().running_task.get(&*lock).unwrap();
        let task = task::task_id_of(&*lock, current);
        let at = Traits::tick_count() + ticks;
        arm_timer(
            lock.borrow_mut(),
            TimerKind::Periodic,
            TimerAction::SendEvents { task, events },
            at,
            ticks,
        )
    }

    /// Arm a timer that sends `events` to the calling task when the calendar
    /// clock reaches `when`. A target not in the future fires at the next
    /// tick.
    pub fn timer_event_when(when: TimeOfDay, events: u32) -> Result<TimerId> {
        if events == 0 {
            return Err(KernelError::BadParam);
        }
        state::expect_task_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        let current = Traits::state().running_task.get(&*lock).unwrap();
        let task = task::task_id_of(&*lock, current);
        let at = timeout::ticks_for_wall_clock::<Traits>(lock.borrow_mut(), when)?;
        arm_timer(
            lock.borrow_mut(),
            TimerKind::Absolute,
            TimerAction::SendEvents { task, events },
            at,
            0,
        )
    }

    /// Sleep for `ticks` ticks: arm a wake-up timer and suspend the calling
    /// task until it fires.
    pub fn timer_wake_after(ticks: Ticks) -> Result<()> {
        if ticks == 0 {
            return Err(KernelError::IllegalTicks);
        }
        state::expect_waitable_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        let current = Traits::state().running_task.get(&*lock).unwrap();
        let task = task::task_id_of(&*lock, current);
        let at = Traits::tick_count() + ticks;
        arm_timer(
            lock.borrow_mut(),
            TimerKind::OneShot,
            TimerAction::WakeTask { task },
            at,
            0,
        )?;

        current.st.replace(&mut *lock, TaskSt::Suspended);
        task::wait_until_woken_up(lock.borrow_mut());
        Ok(())
    }

    /// Sleep until the calendar clock reaches `when`.
    pub fn timer_wake_when(when: TimeOfDay) -> Result<()> {
        state::expect_waitable_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        let current = Traits::state().running_task.get(&*lock).unwrap();
        let task = task::task_id_of(&*lock, current);
        let at = timeout::ticks_for_wall_clock::<Traits>(lock.borrow_mut(), when)?;
        arm_timer(
            lock.borrow_mut(),
            TimerKind::Absolute,
            TimerAction::WakeTask { task },
            at,
            0,
        )?;

        current.st.replace(&mut *lock, TaskSt::Suspended);
        task::wait_until_woken_up(lock.borrow_mut());
        Ok(())
    }

    /// Disarm a timer. Cancelling the earliest timer reprograms the alarm.
    pub fn timer_cancel(id: TimerId) -> Result<()> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = timer_cb(&*lock, id)?;
        timeout::remove_timeout(lock.borrow_mut(), &cb.timeout);
        free_timer_cb(lock.borrow_mut(), cb);
        Ok(())
    }
}
