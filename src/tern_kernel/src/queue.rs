//! Message queues
//!
//! A queue is a circular ring of fixed four-word message slots reserved out
//! of a global buffer arena. Senders copy into `nextin`; urgent senders copy
//! into the slot just before `nextout`, so the message is received next.
//! Receive-side blocking is mediated by an internal counting semaphore:
//! every queued message carries one permit, delivered either by incrementing
//! the permit count or by a direct hand-off to a waiting receiver.
use arrayvec::ArrayVec;

use crate::{
    cfg,
    error::KernelError,
    klock,
    klock::{CpuLockCell, CpuLockTokenRefMut},
    semaphore, state, task, wait,
    wait::{QueueOrder, WaitFlags, WaitQueue},
    utils::Init,
    Id, KernelTraits, ObjName, Port, QueueId, Result, System, Ticks,
};

const QUEUE_MAGIC: u32 = 0x5143_4201;

/// One more extent than the queue count can exist when every queue's
/// reservation is surrounded by free space.
const MAX_FREE_EXTENTS: usize = cfg::MAX_QUEUES + 1;

bitflags::bitflags! {
    /// Queue creation flags.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct QueueFlags: u32 {
        /// Waiting receivers queue in priority order instead of FIFO.
        const PRIORITY_WAIT = 1 << 1;
    }
}

impl Init for QueueFlags {
    const INIT: Self = Self::empty();
}

/// A free run of arena slots.
#[derive(Clone, Copy)]
struct Extent {
    start: u32,
    len: u32,
}

/// *Queue control block* — the state data of a message queue.
///
/// The ring occupies `capacity + 1` arena slots starting at `base`, so that
/// `capacity` messages fit while `nextin == nextout` still means "empty".
pub struct QueueCb<Traits: Port> {
    magic: CpuLockCell<Traits, u32>,
    generation: CpuLockCell<Traits, u32>,
    active: CpuLockCell<Traits, bool>,
    name: CpuLockCell<Traits, ObjName>,
    capacity: CpuLockCell<Traits, u32>,
    base: CpuLockCell<Traits, u32>,
    nextin: CpuLockCell<Traits, u32>,
    nextout: CpuLockCell<Traits, u32>,
    msg_count: CpuLockCell<Traits, u32>,

    /// The internal semaphore counting available-for-receive messages.
    sem_count: CpuLockCell<Traits, u32>,
    receivers: WaitQueue<Traits>,
}

impl<Traits: Port> Init for QueueCb<Traits> {
    const INIT: Self = Self {
        magic: Init::INIT,
        generation: Init::INIT,
        active: Init::INIT,
        name: Init::INIT,
        capacity: Init::INIT,
        base: Init::INIT,
        nextin: Init::INIT,
        nextout: Init::INIT,
        msg_count: Init::INIT,
        sem_count: Init::INIT,
        receivers: Init::INIT,
    };
}

pub(crate) struct QueuePool<Traits: Port> {
    blocks: [QueueCb<Traits>; cfg::MAX_QUEUES],
    arena: [CpuLockCell<Traits, [u32; 4]>; cfg::MAX_MSG_BUFFERS],
    free_extents: CpuLockCell<Traits, ArrayVec<Extent, MAX_FREE_EXTENTS>>,
}

impl<Traits: Port> Init for QueuePool<Traits> {
    const INIT: Self = Self {
        blocks: Init::INIT,
        arena: Init::INIT,
        free_extents: Init::INIT,
    };
}

/// Boot-time arena initialization: one free extent spanning everything.
pub(crate) fn init_arena<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let pool = &Traits::state().queue_pool;
    let mut extents = ArrayVec::new();
    extents.push(Extent {
        start: 0,
        len: cfg::MAX_MSG_BUFFERS as u32,
    });
    pool.free_extents.replace(&mut *lock, extents);
}

/// First-fit reservation of `len` contiguous arena slots.
fn alloc_extent<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    len: u32,
) -> Result<u32> {
    let pool = &Traits::state().queue_pool;
    let mut extents = pool.free_extents.get(&*lock);
    for i in 0..extents.len() {
        if extents[i].len >= len {
            let start = extents[i].start;
            if extents[i].len == len {
                extents.remove(i);
            } else {
                extents[i].start += len;
                extents[i].len -= len;
            }
            pool.free_extents.replace(&mut *lock, extents);
            return Ok(start);
        }
    }
    Err(KernelError::NoMsgBuffers)
}

/// Return a reservation to the arena, coalescing adjacent free extents.
fn free_extent<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    start: u32,
    len: u32,
) {
    let pool = &Traits::state().queue_pool;
    let mut extents = pool.free_extents.get(&*lock);

    let pos = extents
        .iter()
        .position(|e| e.start > start)
        .unwrap_or(extents.len());
    extents.insert(pos, Extent { start, len });

    if pos + 1 < extents.len() && extents[pos].start + extents[pos].len == extents[pos + 1].start {
        extents[pos].len += extents[pos + 1].len;
        extents.remove(pos + 1);
    }
    if pos > 0 && extents[pos - 1].start + extents[pos - 1].len == extents[pos].start {
        extents[pos - 1].len += extents[pos].len;
        extents.remove(pos);
    }

    pool.free_extents.replace(&mut *lock, extents);
}

fn queue_slot<Traits: KernelTraits>(cb: &QueueCb<Traits>) -> usize {
    let base = Traits::state().queue_pool.blocks.as_ptr() as usize;
    (cb as *const QueueCb<Traits> as usize - base) / core::mem::size_of::<QueueCb<Traits>>()
}

fn queue_cb<Traits: KernelTraits>(
    lock: &klock::CpuLockToken<Traits>,
    id: QueueId,
) -> Result<&'static QueueCb<Traits>> {
    let slot = id.slot();
    if slot >= cfg::MAX_QUEUES {
        return Err(KernelError::BadId);
    }
    let cb = &Traits::state().queue_pool.blocks[slot];
    if !cb.active.get(lock) {
        return Err(KernelError::ObjectDeleted);
    }
    if cb.generation.get(lock) != id.generation() {
        return Err(KernelError::BadId);
    }
    debug_assert_eq!(cb.magic.get(lock), QUEUE_MAGIC);
    Ok(cb)
}

#[inline]
fn ring_advance(base: u32, last: u32, i: u32) -> u32 {
    if i == last {
        base
    } else {
        i + 1
    }
}

#[inline]
fn ring_retreat(base: u32, last: u32, i: u32) -> u32 {
    if i == base {
        last
    } else {
        i - 1
    }
}

/// Copy a message into the ring and deliver one receive permit. Returns
/// whether a waiting receiver was woken.
fn send_core<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    cb: &'static QueueCb<Traits>,
    msg: [u32; 4],
    urgent: bool,
) -> Result<bool> {
    let base = cb.base.get(&*lock);
    let last = base + cb.capacity.get(&*lock);
    let nextin = cb.nextin.get(&*lock);
    let nextout = cb.nextout.get(&*lock);

    if ring_advance(base, last, nextin) == nextout {
        return Err(KernelError::QueueFull);
    }

    let arena = &Traits::state().queue_pool.arena;
    if urgent {
        let slot = ring_retreat(base, last, nextout);
        arena[slot as usize].replace(&mut *lock, msg);
        cb.nextout.replace(&mut *lock, slot);
    } else {
        arena[nextin as usize].replace(&mut *lock, msg);
        cb.nextin
            .replace(&mut *lock, ring_advance(base, last, nextin));
    }
    let msg_count = cb.msg_count.get(&*lock);
    cb.msg_count.replace(&mut *lock, msg_count + 1);

    // V the internal semaphore: hand the permit to a waiting receiver, or
    // bank it
    if wait::wake_up_one(lock.borrow_mut(), &cb.receivers) {
        Ok(true)
    } else {
        let sem_count = cb.sem_count.get(&*lock);
        cb.sem_count.replace(&mut *lock, sem_count + 1);
        Ok(false)
    }
}

impl<Traits: KernelTraits> System<Traits> {
    /// Create a message queue, reserving `capacity` message slots in the
    /// buffer arena.
    pub fn queue_create(name: ObjName, capacity: u32, flags: QueueFlags) -> Result<QueueId> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        if capacity == 0 {
            return Err(KernelError::BadParam);
        }

        let pool = &Traits::state().queue_pool;
        let mut found = None;
        for cb in pool.blocks.iter() {
            if !cb.active.get(&*lock) {
                found = Some(cb);
                break;
            }
        }
        let cb = found.ok_or(KernelError::NoQcb)?;

        let base = alloc_extent(lock.borrow_mut(), capacity + 1)?;

        cb.magic.replace(&mut *lock, QUEUE_MAGIC);
        cb.active.replace(&mut *lock, true);
        cb.name.replace(&mut *lock, name);
        cb.capacity.replace(&mut *lock, capacity);
        cb.base.replace(&mut *lock, base);
        cb.nextin.replace(&mut *lock, base);
        cb.nextout.replace(&mut *lock, base);
        cb.msg_count.replace(&mut *lock, 0);
        cb.sem_count.replace(&mut *lock, 0);
        cb.receivers.set_order(
            lock.borrow_mut(),
            if flags.contains(QueueFlags::PRIORITY_WAIT) {
                QueueOrder::Priority
            } else {
                QueueOrder::Fifo
            },
        );

        Ok(Id::from_parts(queue_slot(cb), cb.generation.get(&*lock)))
    }

    /// Delete a queue, releasing its arena reservation. Waiting receivers
    /// are unblocked with `ObjectDeleted`; pending messages are discarded.
    pub fn queue_delete(id: QueueId) -> Result<()> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = queue_cb(&*lock, id)?;

        let base = cb.base.get(&*lock);
        let capacity = cb.capacity.get(&*lock);
        free_extent(lock.borrow_mut(), base, capacity + 1);

        cb.active.replace(&mut *lock, false);
        cb.magic.replace(&mut *lock, 0);
        let generation = cb.generation.get(&*lock);
        cb.generation
            .replace(&mut *lock, generation.wrapping_add(1) & Id::GENERATION_MASK);
        cb.msg_count.replace(&mut *lock, 0);
        cb.sem_count.replace(&mut *lock, 0);

        let woken =
            wait::wake_up_all_with(lock.borrow_mut(), &cb.receivers, KernelError::ObjectDeleted);
        if woken > 0 {
            task::unlock_cpu_and_check_preemption(lock);
        }
        Ok(())
    }

    /// Find a queue by name.
    pub fn queue_ident(name: ObjName) -> Result<QueueId> {
        let lock = klock::lock_cpu::<Traits>()?;
        let pool = &Traits::state().queue_pool;
        for cb in pool.blocks.iter() {
            if cb.active.get(&*lock) && cb.name.get(&*lock) == name {
                return Ok(Id::from_parts(queue_slot(cb), cb.generation.get(&*lock)));
            }
        }
        Err(KernelError::ObjectNotFound)
    }

    /// Send a message to the tail of the queue.
    pub fn queue_send(id: QueueId, msg: [u32; 4]) -> Result<()> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = queue_cb(&*lock, id)?;
        if send_core(lock.borrow_mut(), cb, msg, false)? {
            task::unlock_cpu_and_check_preemption(lock);
        }
        Ok(())
    }

    /// Send a message to the head of the queue; it is received before every
    /// normally-queued message.
    pub fn queue_urgent(id: QueueId, msg: [u32; 4]) -> Result<()> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = queue_cb(&*lock, id)?;
        if send_core(lock.borrow_mut(), cb, msg, true)? {
            task::unlock_cpu_and_check_preemption(lock);
        }
        Ok(())
    }

    /// Deliver `msg` to every currently-waiting receiver, bounded by the
    /// ring's free space. Returns the number of receivers woken; with no
    /// receivers waiting this behaves as [`System::queue_send`].
    pub fn queue_broadcast(id: QueueId, msg: [u32; 4]) -> Result<u32> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = queue_cb(&*lock, id)?;

        if cb.receivers.is_empty(lock.borrow_mut()) {
            send_core(lock.borrow_mut(), cb, msg, false)?;
            return Ok(0);
        }

        let mut count = 0;
        while !cb.receivers.is_empty(lock.borrow_mut()) {
            match send_core(lock.borrow_mut(), cb, msg, false) {
                Ok(woke) => {
                    debug_assert!(woke);
                    count += 1;
                }
                Err(KernelError::QueueFull) => break,
                Err(e) => return Err(e),
            }
        }

        if count > 0 {
            task::unlock_cpu_and_check_preemption(lock);
        }
        Ok(count)
    }

    /// Receive the message at the head of the queue. With `NO_WAIT`, an
    /// empty queue fails with `NoMessage`; otherwise the caller blocks on
    /// the internal semaphore, bounded by `timeout` ticks when it is
    /// non-zero.
    pub fn queue_receive(id: QueueId, flags: WaitFlags, timeout: Ticks) -> Result<[u32; 4]> {
        state::expect_waitable_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = queue_cb(&*lock, id)?;

        // P the internal semaphore
        if !semaphore::poll_core(cb.sem_count.write(&mut *lock)) {
            if flags.contains(WaitFlags::NO_WAIT) {
                return Err(KernelError::NoMessage);
            }
            let deadline = (timeout > 0).then(|| Traits::tick_count() + timeout);
            wait::wait_timeout(
                lock.borrow_mut(),
                &cb.receivers,
                wait::WaitPayload::Queue,
                deadline,
            )?;
            if !cb.active.get(&*lock) {
                return Err(KernelError::ObjectDeleted);
            }
        }

        // The permit reserves exactly one queued message
        let base = cb.base.get(&*lock);
        let last = base + cb.capacity.get(&*lock);
        let nextout = cb.nextout.get(&*lock);
        let msg_count = cb.msg_count.get(&*lock);
        debug_assert!(msg_count > 0);

        let msg = Traits::state().queue_pool.arena[nextout as usize].get(&*lock);
        cb.nextout
            .replace(&mut *lock, ring_advance(base, last, nextout));
        cb.msg_count.replace(&mut *lock, msg_count - 1);
        Ok(msg)
    }
}
