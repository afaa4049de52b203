//! Events
//!
//! Every task owns a 32-bit event word. Senders accumulate bits into
//! `pending`; a receiver declares the set it wants and whether any one bit
//! or all of them satisfy it. The satisfying send captures
//! `pending & waiting` at that moment — later sends accumulate for future
//! receives but never alter a completed wake.
use crate::{
    cfg,
    error::KernelError,
    klock,
    klock::{CpuLockCell, CpuLockTokenRefMut},
    state, task,
    task::{TaskRef, TaskSt},
    utils::Init,
    wait, KernelTraits, Port, Result, System, TaskId, Ticks,
};

bitflags::bitflags! {
    /// Flags accepted by [`System::ev_receive`].
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct EventWaitFlags: u32 {
        /// Fail with `NoEvents` instead of blocking.
        const NO_WAIT = 1 << 0;
        /// Any one of the requested bits satisfies the wait (the default is
        /// all of them).
        const ANY = 1 << 1;
    }
}

impl Init for EventWaitFlags {
    const INIT: Self = Self::empty();
}

/// *Event block* — the event state of one task, indexed by task slot.
pub(crate) struct EventCb<Traits: Port> {
    /// Bits sent but not yet received.
    pending: CpuLockCell<Traits, u32>,
    /// The set a blocked receiver is waiting for (0 when not waiting).
    waiting: CpuLockCell<Traits, u32>,
    /// Whether all of `waiting` must be pending to satisfy the wait.
    wait_all: CpuLockCell<Traits, bool>,
    /// The bits handed to the receiver by the satisfying send.
    captured: CpuLockCell<Traits, u32>,
}

impl<Traits: Port> Init for EventCb<Traits> {
    const INIT: Self = Self {
        pending: Init::INIT,
        waiting: Init::INIT,
        wait_all: Init::INIT,
        captured: Init::INIT,
    };
}

pub(crate) struct EventPool<Traits: Port> {
    blocks: [EventCb<Traits>; cfg::MAX_TASKS],
}

impl<Traits: Port> Init for EventPool<Traits> {
    const INIT: Self = Self {
        blocks: Init::INIT,
    };
}

/// Check the wait condition.
#[inline]
fn condition_met(pending: u32, waiting: u32, wait_all: bool) -> bool {
    if wait_all {
        pending & waiting == waiting
    } else {
        pending & waiting != 0
    }
}

/// Post events to a task. If the task is blocked in a receive and the
/// condition is now met, capture the satisfied bits, clear them from
/// `pending`, and wake the task. Returns `true` if a task was woken.
pub(crate) fn send_core<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    target: TaskRef<Traits>,
    events: u32,
) -> bool {
    let ecb = &Traits::state().event_pool.blocks[task::task_slot(target)];

    let pending = ecb.pending.get(&*lock) | events;
    ecb.pending.replace(&mut *lock, pending);

    if target.st.get(&*lock) != TaskSt::Blocked
        || target.wait.payload.get(&*lock) != wait::WaitPayload::Event
    {
        return false;
    }

    let waiting = ecb.waiting.get(&*lock);
    if !condition_met(pending, waiting, ecb.wait_all.get(&*lock)) {
        return false;
    }

    let received = pending & waiting;
    ecb.pending.replace(&mut *lock, pending & !received);
    ecb.captured.replace(&mut *lock, received);
    ecb.waiting.replace(&mut *lock, 0);
    wait::complete_wait(lock, target, None);
    true
}

/// Zero the event block of a freed task slot.
pub(crate) fn reset_block<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    slot: usize,
) {
    let ecb = &Traits::state().event_pool.blocks[slot];
    ecb.pending.replace(&mut *lock, 0);
    ecb.waiting.replace(&mut *lock, 0);
    ecb.wait_all.replace(&mut *lock, false);
    ecb.captured.replace(&mut *lock, 0);
}

/// Clear only the receive-side state (task restart keeps pending events).
pub(crate) fn clear_wait_state<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    slot: usize,
) {
    let ecb = &Traits::state().event_pool.blocks[slot];
    ecb.waiting.replace(&mut *lock, 0);
    ecb.wait_all.replace(&mut *lock, false);
    ecb.captured.replace(&mut *lock, 0);
}

impl<Traits: KernelTraits> System<Traits> {
    /// Post events to a task.
    pub fn ev_send(task: TaskId, events: u32) -> Result<()> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let target = task::task_cb(&*lock, task)?;
        if send_core(lock.borrow_mut(), target, events) {
            task::unlock_cpu_and_check_preemption(lock);
        }
        Ok(())
    }

    /// Receive events. Returns the satisfied bits, which are cleared from
    /// the pending set; unrequested pending bits are left for later
    /// receives.
    pub fn ev_receive(events: u32, flags: EventWaitFlags, timeout: Ticks) -> Result<u32> {
        if events == 0 {
            return Err(KernelError::BadParam);
        }
        state::expect_waitable_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        let current = Traits::state().running_task.get(&*lock).unwrap();
        let ecb = &Traits::state().event_pool.blocks[task::task_slot(current)];

        let wait_all = !flags.contains(EventWaitFlags::ANY);
        let pending = ecb.pending.get(&*lock);
        if condition_met(pending, events, wait_all) {
            let received = pending & events;
            ecb.pending.replace(&mut *lock, pending & !received);
            return Ok(received);
        }

        if flags.contains(EventWaitFlags::NO_WAIT) {
            return Err(KernelError::NoEvents);
        }

        ecb.waiting.replace(&mut *lock, events);
        ecb.wait_all.replace(&mut *lock, wait_all);
        let deadline = (timeout > 0).then(|| Traits::tick_count() + timeout);

        match wait::wait_no_queue_timeout(lock.borrow_mut(), wait::WaitPayload::Event, deadline) {
            Ok(()) => Ok(ecb.captured.replace(&mut *lock, 0)),
            Err(e) => {
                ecb.waiting.replace(&mut *lock, 0);
                Err(e)
            }
        }
    }
}
