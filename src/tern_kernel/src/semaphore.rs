//! Semaphores
//!
//! Counting semaphores with FIFO- or priority-ordered waiters. A signal
//! with waiters present is a direct hand-off: the head waiter is resumed
//! and the count is left untouched.
use crate::{
    cfg,
    error::KernelError,
    klock,
    klock::CpuLockCell,
    state, task,
    utils::Init,
    wait,
    wait::{QueueOrder, WaitFlags, WaitQueue},
    Id, KernelTraits, ObjName, Port, Result, SemId, System, Ticks,
};

const SEM_MAGIC: u32 = 0x5343_4201;

bitflags::bitflags! {
    /// Semaphore creation flags.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct SemFlags: u32 {
        /// Waiters queue in priority order instead of FIFO.
        const PRIORITY_WAIT = 1 << 1;
    }
}

impl Init for SemFlags {
    const INIT: Self = Self::empty();
}

/// *Semaphore control block* — the state data of a semaphore.
pub struct SemaphoreCb<Traits: Port> {
    magic: CpuLockCell<Traits, u32>,
    generation: CpuLockCell<Traits, u32>,
    active: CpuLockCell<Traits, bool>,
    name: CpuLockCell<Traits, ObjName>,
    count: CpuLockCell<Traits, u32>,
    max_count: CpuLockCell<Traits, u32>,
    wait_queue: WaitQueue<Traits>,

    // Statistics
    taken: CpuLockCell<Traits, u32>,
    given: CpuLockCell<Traits, u32>,
}

impl<Traits: Port> Init for SemaphoreCb<Traits> {
    const INIT: Self = Self {
        magic: Init::INIT,
        generation: Init::INIT,
        active: Init::INIT,
        name: Init::INIT,
        count: Init::INIT,
        max_count: Init::INIT,
        wait_queue: Init::INIT,
        taken: Init::INIT,
        given: Init::INIT,
    };
}

pub(crate) struct SemaphorePool<Traits: Port> {
    blocks: [SemaphoreCb<Traits>; cfg::MAX_SEMAPHORES],
}

impl<Traits: Port> Init for SemaphorePool<Traits> {
    const INIT: Self = Self {
        blocks: Init::INIT,
    };
}

fn sem_slot<Traits: KernelTraits>(cb: &SemaphoreCb<Traits>) -> usize {
    let base = Traits::state().semaphore_pool.blocks.as_ptr() as usize;
    (cb as *const SemaphoreCb<Traits> as usize - base)
        / core::mem::size_of::<SemaphoreCb<Traits>>()
}

fn sem_cb<Traits: KernelTraits>(
    lock: &klock::CpuLockToken<Traits>,
    id: SemId,
) -> Result<&'static SemaphoreCb<Traits>> {
    let slot = id.slot();
    if slot >= cfg::MAX_SEMAPHORES {
        return Err(KernelError::BadId);
    }
    let cb = &Traits::state().semaphore_pool.blocks[slot];
    if !cb.active.get(lock) {
        return Err(KernelError::ObjectDeleted);
    }
    if cb.generation.get(lock) != id.generation() {
        return Err(KernelError::BadId);
    }
    debug_assert_eq!(cb.magic.get(lock), SEM_MAGIC);
    Ok(cb)
}

/// Check whether the semaphore's current `value` satisfies an acquire. On
/// success the value is updated.
#[inline]
pub(crate) fn poll_core(value: &mut u32) -> bool {
    if *value > 0 {
        *value -= 1;
        true
    } else {
        false
    }
}

impl<Traits: KernelTraits> System<Traits> {
    /// Create a counting semaphore with the given initial count.
    pub fn sem_create(name: ObjName, count: u32, flags: SemFlags) -> Result<SemId> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        if count > cfg::SEM_MAX_COUNT {
            return Err(KernelError::BadParam);
        }

        let pool = &Traits::state().semaphore_pool;
        let mut found = None;
        for cb in pool.blocks.iter() {
            if !cb.active.get(&*lock) {
                found = Some(cb);
                break;
            }
        }
        let cb = found.ok_or(KernelError::NoScb)?;

        cb.magic.replace(&mut *lock, SEM_MAGIC);
        cb.active.replace(&mut *lock, true);
        cb.name.replace(&mut *lock, name);
        cb.count.replace(&mut *lock, count);
        cb.max_count.replace(&mut *lock, cfg::SEM_MAX_COUNT);
        cb.taken.replace(&mut *lock, 0);
        cb.given.replace(&mut *lock, 0);
        cb.wait_queue.set_order(
            lock.borrow_mut(),
            if flags.contains(SemFlags::PRIORITY_WAIT) {
                QueueOrder::Priority
            } else {
                QueueOrder::Fifo
            },
        );

        Ok(Id::from_parts(sem_slot(cb), cb.generation.get(&*lock)))
    }

    /// Delete a semaphore. Every waiter is resumed with `ObjectDeleted`.
    pub fn sem_delete(id: SemId) -> Result<()> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = sem_cb(&*lock, id)?;

        cb.active.replace(&mut *lock, false);
        cb.magic.replace(&mut *lock, 0);
        let generation = cb.generation.get(&*lock);
        cb.generation
            .replace(&mut *lock, generation.wrapping_add(1) & Id::GENERATION_MASK);
        cb.count.replace(&mut *lock, 0);

        let woken =
            wait::wake_up_all_with(lock.borrow_mut(), &cb.wait_queue, KernelError::ObjectDeleted);
        if woken > 0 {
            task::unlock_cpu_and_check_preemption(lock);
        }
        Ok(())
    }

    /// Find a semaphore by name.
    pub fn sem_ident(name: ObjName) -> Result<SemId> {
        let lock = klock::lock_cpu::<Traits>()?;
        let pool = &Traits::state().semaphore_pool;
        for cb in pool.blocks.iter() {
            if cb.active.get(&*lock) && cb.name.get(&*lock) == name {
                return Ok(Id::from_parts(sem_slot(cb), cb.generation.get(&*lock)));
            }
        }
        Err(KernelError::ObjectNotFound)
    }

    /// Acquire the semaphore (the P operation). With `NO_WAIT`, an
    /// unavailable semaphore fails with `NoSemaphore`; otherwise the caller
    /// blocks, bounded by `timeout` ticks when it is non-zero.
    pub fn sem_p(id: SemId, flags: WaitFlags, timeout: Ticks) -> Result<()> {
        state::expect_waitable_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = sem_cb(&*lock, id)?;

        if poll_core(cb.count.write(&mut *lock)) {
            let taken = cb.taken.get(&*lock);
            cb.taken.replace(&mut *lock, taken.wrapping_add(1));
            return Ok(());
        }

        if flags.contains(WaitFlags::NO_WAIT) {
            return Err(KernelError::NoSemaphore);
        }

        let deadline = (timeout > 0).then(|| Traits::tick_count() + timeout);
        wait::wait_timeout(
            lock.borrow_mut(),
            &cb.wait_queue,
            wait::WaitPayload::Semaphore,
            deadline,
        )?;

        // Woken by a direct hand-off; the signaller left the count alone
        if cb.active.get(&*lock) {
            let taken = cb.taken.get(&*lock);
            cb.taken.replace(&mut *lock, taken.wrapping_add(1));
        }
        Ok(())
    }

    /// Release the semaphore (the V operation). If a task is waiting, it
    /// receives the permit directly; otherwise the count is incremented,
    /// failing with `BadParam` at the bound.
    pub fn sem_v(id: SemId) -> Result<()> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = sem_cb(&*lock, id)?;

        let given = cb.given.get(&*lock);
        cb.given.replace(&mut *lock, given.wrapping_add(1));

        if wait::wake_up_one(lock.borrow_mut(), &cb.wait_queue) {
            task::unlock_cpu_and_check_preemption(lock);
            Ok(())
        } else {
            let count = cb.count.get(&*lock);
            if count >= cb.max_count.get(&*lock) {
                return Err(KernelError::BadParam);
            }
            cb.count.replace(&mut *lock, count + 1);
            Ok(())
        }
    }
}
