//! The tern real-time kernel
//!
//! `tern` is a fixed-priority preemptive microkernel for single-core,
//! deeply-embedded targets. It provides tasks, counting semaphores, per-task
//! event flags, fixed-size message queues, and a timer service, all coupled
//! through one interrupt-masking critical section.
//!
//! The kernel is portable: everything hardware-specific is reached through
//! the [`Port`] trait, implemented by a *port* crate for each target. The
//! kernel's state is statically allocated and bound to a marker "system
//! traits" type by [`KernelTraits`]; the public API is the associated
//! functions of [`System`].
//!
//! # Contexts
//!
//! Public operations assume *task context*. The single interrupt-context
//! entry point is [`PortToKernel::timer_tick`], which drives the timer
//! pipeline and may preempt the interrupted task.
#![cfg_attr(not(test), no_std)]

use core::{fmt, marker::PhantomData, num::NonZeroU32};

pub mod cfg;
mod error;
pub mod event;
mod klock;
pub mod queue;
pub mod semaphore;
mod state;
pub mod task;
pub mod timeout;
pub mod timer;
pub mod utils;
mod wait;

pub use crate::{
    error::{KernelError, Result},
    event::EventWaitFlags,
    queue::QueueFlags,
    semaphore::SemFlags,
    task::{TaskCb, TaskFlags, TaskMode},
    timeout::TimeOfDay,
    wait::WaitFlags,
};

use crate::utils::Init;

/// The kernel's integer time unit, in ticks since boot.
pub type Ticks = u64;

/// A task priority. Numerically lower is more urgent; the valid range is
/// [`cfg::MIN_TASK_PRIORITY`]`..=`[`cfg::MAX_TASK_PRIORITY`].
pub type Priority = u8;

/// A task entry point. The four 32-bit words are the argument vector given
/// to [`System::task_start`], passed positionally.
pub type TaskEntry = fn([u32; 4]);

/// A four-byte object name.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ObjName([u8; 4]);

impl ObjName {
    #[inline]
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub const fn bytes(self) -> [u8; 4] {
        self.0
    }
}

impl From<&[u8; 4]> for ObjName {
    #[inline]
    fn from(bytes: &[u8; 4]) -> Self {
        Self(*bytes)
    }
}

impl Init for ObjName {
    const INIT: Self = Self([0; 4]);
}

impl fmt::Debug for ObjName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.0.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            write!(
                f,
                "\"{}{}{}{}\"",
                self.0[0] as char, self.0[1] as char, self.0[2] as char, self.0[3] as char
            )
        } else {
            write!(
                f,
                "[{:02x} {:02x} {:02x} {:02x}]",
                self.0[0], self.0[1], self.0[2], self.0[3]
            )
        }
    }
}

/// An object id: a pool slot in the low bits and the slot's generation above
/// it. Never zero. A freed slot's generation is bumped, so stale ids are
/// rejected with [`KernelError::BadId`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Id(NonZeroU32);

impl Id {
    const SLOT_BITS: u32 = 8;
    const GENERATION_MASK: u32 = (1 << (32 - Self::SLOT_BITS)) - 1;

    #[inline]
    pub(crate) fn from_parts(slot: usize, generation: u32) -> Self {
        debug_assert!(slot < (1 << Self::SLOT_BITS) - 1);
        let raw = ((generation & Self::GENERATION_MASK) << Self::SLOT_BITS) | (slot as u32 + 1);
        // The slot field is non-zero, so `raw` is non-zero
        Self(NonZeroU32::new(raw).unwrap())
    }

    /// The raw numeric value, e.g. for transport across an FFI boundary.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0.get()
    }

    /// Reconstruct an id from [`Id::raw`]. Returns `None` for zero.
    #[inline]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match NonZeroU32::new(raw) {
            Some(x) => Some(Self(x)),
            None => None,
        }
    }

    #[inline]
    pub(crate) fn slot(self) -> usize {
        (self.0.get() & ((1 << Self::SLOT_BITS) - 1)) as usize - 1
    }

    #[inline]
    pub(crate) fn generation(self) -> u32 {
        self.0.get() >> Self::SLOT_BITS
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Id({}.{})", self.slot(), self.generation())
    }
}

pub type TaskId = Id;
pub type SemId = Id;
pub type QueueId = Id;
pub type TimerId = Id;

/// The port layer: the capability set an integrator supplies to bridge the
/// kernel to a specific target.
///
/// # Safety
///
/// Implementations must uphold the documented contract of every method; the
/// kernel's memory safety depends on it (e.g. the CPU Lock methods realize
/// the critical section that makes the kernel's interior mutability sound).
pub unsafe trait Port: Sized + 'static {
    /// Port-private per-task context. Placed at the beginning of
    /// [`task::TaskCb`] so that low-level code can locate it with a known
    /// offset.
    type PortTaskState: Init + Send + Sync + 'static;

    /// Enter the interrupt-masking critical section, unless the current
    /// context already holds it (in which case return `false`).
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Enter the critical section. The caller guarantees it's inactive.
    unsafe fn enter_cpu_lock();

    /// Leave the critical section. Interrupts are actually re-enabled only
    /// at the outermost leave.
    unsafe fn leave_cpu_lock();

    fn is_cpu_lock_active() -> bool;

    /// `false` in interrupt or boot context.
    fn is_task_context() -> bool;

    /// Monotonic ticks since boot. Never moves backward.
    fn tick_count() -> Ticks;

    /// Request a [`PortToKernel::timer_tick`] no later than the given
    /// absolute tick. A tick at or before the current one must cause an
    /// imminent `timer_tick`.
    unsafe fn pend_tick_at(at: Ticks);

    /// Cancel any pending alarm.
    unsafe fn clear_pending_tick();

    /// Prepare the initial execution context of a task so that its first
    /// dispatch invokes the entry point with the argument vector recorded in
    /// the TCB. Called with CPU Lock active.
    unsafe fn initialize_task_state(task: &'static task::TaskCb<Self>);

    /// Release the execution context of a deleted or restarted task. Called
    /// with CPU Lock active.
    unsafe fn discard_task_state(task: &'static task::TaskCb<Self>);

    /// Deferred dispatch: call [`PortToKernel::choose_running_task`] and
    /// transfer control to the elected task. May return to the caller with
    /// the switch pending until the outermost critical section exits; a
    /// synchronous implementation is permitted on cooperative hosts. Called
    /// with CPU Lock inactive.
    unsafe fn yield_cpu();

    /// Terminate the current task's context and dispatch the next one.
    /// Called with CPU Lock active; never returns.
    unsafe fn exit_and_dispatch(task: &'static task::TaskCb<Self>) -> !;

    /// One iteration of the idle task: wait-for-interrupt on hardware, a
    /// polite sleep on a host.
    unsafe fn idle();
}

/// Binds the kernel's statically-allocated [`State`] to a system type.
///
/// # Safety
///
/// `state` must return the same instance every time, used by nothing else.
pub unsafe trait KernelTraits: Port {
    fn state() -> &'static State<Self>;
}

/// The global state of a kernel instance. Allocate one per system type:
///
/// ```ignore
/// static KERNEL_STATE: State<SystemTraits> = State::INIT;
/// ```
pub struct State<Traits: Port> {
    running_task: klock::CpuLockCell<Traits, Option<task::TaskRef<Traits>>>,
    context_switch_count: klock::CpuLockCell<Traits, u32>,
    task_pool: task::TaskPool<Traits>,
    ready_queue: task::readyqueue::ReadyQueue<Traits>,
    event_pool: event::EventPool<Traits>,
    semaphore_pool: semaphore::SemaphorePool<Traits>,
    queue_pool: queue::QueuePool<Traits>,
    timer_pool: timer::TimerPool<Traits>,
    timeout: timeout::TimeoutGlobals<Traits>,
}

impl<Traits: Port> State<Traits> {
    pub const INIT: Self = Self {
        running_task: Init::INIT,
        context_switch_count: Init::INIT,
        task_pool: Init::INIT,
        ready_queue: Init::INIT,
        event_pool: Init::INIT,
        semaphore_pool: Init::INIT,
        queue_pool: Init::INIT,
        timer_pool: Init::INIT,
        timeout: Init::INIT,
    };
}

impl<Traits: Port> Init for State<Traits> {
    const INIT: Self = Self::INIT;
}

/// The public API surface of a kernel instance, exposed as associated
/// functions of this zero-sized facade. The operations are defined in the
/// respective subsystem modules.
pub struct System<Traits>(PhantomData<Traits>);

/// The entry points a port calls into the kernel.
pub trait PortToKernel: KernelTraits {
    /// Boot the kernel: run the one-time init sweep, create the idle and
    /// root tasks, and dispatch the first task. On a host port this returns
    /// once the port shuts down; an embedded port's dispatch never returns.
    ///
    /// # Safety
    ///
    /// Must be called exactly once, before any other kernel entry, with CPU
    /// Lock inactive.
    unsafe fn boot(root_entry: TaskEntry, root_args: [u32; 4]);

    /// Elect the next running task. Returns the task that owns the processor
    /// after the decision (`None` only before the first dispatch).
    ///
    /// # Safety
    ///
    /// Must be called with CPU Lock active, from a port's dispatch path.
    unsafe fn choose_running_task() -> Option<&'static task::TaskCb<Self>>;

    /// The tick pipeline entry, called by the port when the programmed alarm
    /// fires. The single interrupt-context entry point.
    ///
    /// # Safety
    ///
    /// Must be called with CPU Lock inactive, outside task context.
    unsafe fn timer_tick();
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn boot(root_entry: TaskEntry, root_args: [u32; 4]) {
        // Safety: CPU Lock inactive per this function's contract
        unsafe { Traits::enter_cpu_lock() };
        // Safety: we just entered the CPU Lock state
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };

        // Bring up each subsystem in dependency order
        Traits::state().timeout.init(lock.borrow_mut());
        queue::init_arena::<Traits>(lock.borrow_mut());
        task::init_idle_task(lock.borrow_mut());
        task::init_root_task(lock.borrow_mut(), root_entry, root_args);

        drop(lock);

        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }

    unsafe fn choose_running_task() -> Option<&'static task::TaskCb<Self>> {
        debug_assert!(Traits::is_cpu_lock_active());
        // Safety: CPU Lock is active and the port owns it; the kernel holds
        // no guard at this point
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
        task::choose_next_running_task(lock.borrow_mut());
        let task = Traits::state().running_task.get(&*lock);
        // The port retains ownership of the CPU Lock state
        core::mem::forget(lock);
        task
    }

    unsafe fn timer_tick() {
        timeout::handle_tick::<Traits>();
    }
}

impl<Traits: KernelTraits> System<Traits> {
    /// Monotonic ticks since boot.
    #[inline]
    pub fn tick_count() -> Ticks {
        Traits::tick_count()
    }

    /// Total number of context switches performed so far.
    pub fn context_switch_count() -> Result<u32> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(Traits::state().context_switch_count.get(&*lock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_round_trip() {
        for slot in [0usize, 1, 63, 127] {
            for generation in [0u32, 1, 0xff_ffff] {
                let id = Id::from_parts(slot, generation);
                assert_eq!(id.slot(), slot);
                assert_eq!(id.generation(), generation & 0xff_ffff);
                assert_eq!(Id::from_raw(id.raw()), Some(id));
            }
        }
    }

    #[test]
    fn id_never_zero() {
        assert_ne!(Id::from_parts(0, 0).raw(), 0);
        assert_eq!(Id::from_raw(0), None);
    }

    #[test]
    fn name_debug() {
        assert_eq!(format!("{:?}", ObjName::new(*b"ROOT")), "\"ROOT\"");
    }
}
