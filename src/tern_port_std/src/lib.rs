//! Simulator port for the tern kernel
//!
//! Each task runs on its own OS thread, but only the thread of the task the
//! kernel elected as Running executes at a time; every other task thread is
//! parked on a per-task gate. The kernel's critical section is a
//! process-wide lock, nestable through a thread-local depth counter.
//!
//! Time is virtual: the tick counter advances only when the idle task runs
//! and finds an alarm armed, in which case the clock jumps straight to the
//! alarm and the tick pipeline fires. A sleeping system therefore consumes
//! no wall-clock time, and test runs are deterministic as long as the tasks
//! themselves are.
//!
//! Preemption is cooperative at the host level: when an elected task
//! changes, the preempted thread notices and parks at its next kernel call.
use std::{
    cell::Cell,
    mem,
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
    time::Duration,
};

use spin::Mutex as SpinMutex;
use tern_kernel::{utils::Init, PortToKernel, System, TaskCb, TaskEntry, Ticks};

/// Re-exported for [`use_port!`].
#[doc(hidden)]
pub use tern_kernel;

/// How long [`run_kernel`] waits for [`shutdown`] before declaring the
/// system wedged.
const WATCHDOG: Duration = Duration::from_secs(60);

thread_local! {
    /// CPU Lock nesting depth of this thread. Only the outermost leave
    /// releases the lock.
    static CPU_LOCK_DEPTH: Cell<usize> = Cell::new(0);
    /// The TCB of the task this thread runs, as a raw address. Zero on
    /// non-task threads (the boot thread).
    static CURRENT_TASK: Cell<usize> = Cell::new(0);
    /// The gate of the task activation this thread belongs to. A restarted
    /// task gets a fresh gate (and thread); the old thread keeps its own.
    static MY_GATE: std::cell::RefCell<Option<Arc<TaskGate>>> =
        const { std::cell::RefCell::new(None) };
    /// Set while this thread is simulating the timer interrupt.
    static IN_INTERRUPT: Cell<bool> = Cell::new(false);
}

/// Sentinel unwind payload used to terminate a task thread without noise.
struct TaskExit;

/// Implemented on a system traits type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
pub unsafe trait PortInstance:
    tern_kernel::KernelTraits + tern_kernel::Port<PortTaskState = TaskState>
{
    fn port_state() -> &'static PortState;
}

/// The per-kernel state of the port.
pub struct PortState {
    /// The critical-section lock ("interrupts disabled").
    cpu_lock: SpinMutex<()>,
    /// Virtual monotonic tick counter.
    clock: AtomicU64,
    /// The armed alarm tick, if any.
    alarm: SpinMutex<Option<Ticks>>,
    /// Address of the TCB the kernel last elected as Running.
    current: AtomicUsize,
    shutdown: AtomicBool,
    boot_gate: (Mutex<bool>, Condvar),
    /// The first panic recorded from a task thread.
    failure: Mutex<Option<String>>,
}

impl PortState {
    pub const fn new() -> Self {
        Self {
            cpu_lock: SpinMutex::new(()),
            clock: AtomicU64::new(0),
            alarm: SpinMutex::new(None),
            current: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            boot_gate: (Mutex::new(false), Condvar::new()),
            failure: Mutex::new(None),
        }
    }
}

impl Default for PortState {
    fn default() -> Self {
        Self::new()
    }
}

/// The port's per-task context.
pub struct TaskState {
    tsm: SpinMutex<Tsm>,
}

/// Task thread state machine.
enum Tsm {
    /// No thread exists; one is spawned on the first dispatch.
    Dormant,
    /// A thread exists and parks on this gate whenever its task is not the
    /// elected one.
    Live(Arc<TaskGate>),
}

impl Init for TaskState {
    const INIT: Self = Self {
        tsm: SpinMutex::new(Tsm::Dormant),
    };
}

struct TaskGate {
    state: Mutex<GateSt>,
    cond: Condvar,
}

#[derive(Clone, Copy)]
struct GateSt {
    /// One permit is issued every time the task becomes the elected one.
    permits: u32,
    /// The task was deleted or restarted; its thread must terminate.
    exit: bool,
}

impl TaskGate {
    fn new(permits: u32) -> Self {
        Self {
            state: Mutex::new(GateSt {
                permits,
                exit: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Block until a permit arrives. Returns `false` if the thread must
    /// terminate instead.
    fn wait(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        loop {
            if st.exit {
                return false;
            }
            if st.permits > 0 {
                st.permits -= 1;
                return true;
            }
            st = self.cond.wait(st).unwrap();
        }
    }

    fn post_permit(&self) {
        let mut st = self.state.lock().unwrap();
        st.permits += 1;
        self.cond.notify_all();
    }

    fn post_exit(&self) {
        let mut st = self.state.lock().unwrap();
        st.exit = true;
        self.cond.notify_all();
    }
}

/// Boot the kernel with the given root task entry point and block until
/// [`shutdown`] is called. Panics if a task thread panicked or if nothing
/// shuts the system down within the watchdog interval.
pub fn run_kernel<Traits: PortInstance>(root_entry: TaskEntry) {
    let _ = env_logger::builder().is_test(true).try_init();

    log::debug!("booting the kernel");
    // Safety: called once per system type, with CPU Lock inactive
    unsafe { <Traits as PortToKernel>::boot(root_entry, [0; 4]) };

    let ps = Traits::port_state();
    let (mutex, cond) = &ps.boot_gate;
    let mut done = mutex.lock().unwrap();
    while !*done {
        let (guard, timeout) = cond.wait_timeout(done, WATCHDOG).unwrap();
        done = guard;
        if timeout.timed_out() && !*done {
            panic!("the kernel did not shut down within {WATCHDOG:?}");
        }
    }
    drop(done);

    if let Some(msg) = ps.failure.lock().unwrap().take() {
        panic!("a task panicked: {msg}");
    }
    log::debug!("kernel shut down");
}

/// Stop the simulation: the virtual clock freezes and [`run_kernel`]
/// returns. Callable from any context.
pub fn shutdown<Traits: PortInstance>() {
    let ps = Traits::port_state();
    ps.shutdown.store(true, Ordering::SeqCst);
    let (mutex, cond) = &ps.boot_gate;
    *mutex.lock().unwrap() = true;
    cond.notify_all();
}

fn record_failure<Traits: PortInstance>(payload: Box<dyn std::any::Any + Send>) {
    let msg = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic payload>".to_owned());
    log::error!("task thread panicked: {msg}");
    let ps = Traits::port_state();
    let mut failure = ps.failure.lock().unwrap();
    if failure.is_none() {
        *failure = Some(msg);
    }
    drop(failure);
    shutdown::<Traits>();
}

/// The `Port` method implementations behind [`use_port!`].
#[doc(hidden)]
pub mod imp {
    use super::*;

    pub fn try_enter_cpu_lock<Traits: PortInstance>() -> bool {
        CPU_LOCK_DEPTH.with(|depth| {
            if depth.get() > 0 {
                return false;
            }
            mem::forget(Traits::port_state().cpu_lock.lock());
            depth.set(1);
            true
        })
    }

    pub fn enter_cpu_lock<Traits: PortInstance>() {
        let entered = try_enter_cpu_lock::<Traits>();
        debug_assert!(entered, "CPU Lock is already active on this thread");
    }

    pub fn leave_cpu_lock<Traits: PortInstance>() {
        CPU_LOCK_DEPTH.with(|depth| {
            debug_assert_eq!(depth.get(), 1);
            depth.set(0);
        });
        // Safety: this thread acquired the lock in `try_enter_cpu_lock`
        unsafe { Traits::port_state().cpu_lock.force_unlock() };

        // A dispatch decision may have deprived this thread's task of the
        // processor while it was inside the kernel; this is where the
        // deferred switch takes effect.
        park_if_preempted::<Traits>();
    }

    pub fn is_cpu_lock_active() -> bool {
        CPU_LOCK_DEPTH.with(|depth| depth.get() > 0)
    }

    pub fn is_task_context() -> bool {
        CURRENT_TASK.with(|c| c.get()) != 0 && !IN_INTERRUPT.with(|c| c.get())
    }

    pub fn tick_count<Traits: PortInstance>() -> Ticks {
        Traits::port_state().clock.load(Ordering::SeqCst)
    }

    pub fn pend_tick_at<Traits: PortInstance>(at: Ticks) {
        *Traits::port_state().alarm.lock() = Some(at);
    }

    pub fn clear_pending_tick<Traits: PortInstance>() {
        *Traits::port_state().alarm.lock() = None;
    }

    pub fn initialize_task_state<Traits: PortInstance>(task: &'static TaskCb<Traits>) {
        // Any previous activation's thread must not run again
        discard_task_state::<Traits>(task);
    }

    pub fn discard_task_state<Traits: PortInstance>(task: &'static TaskCb<Traits>) {
        let mut tsm = task.port_task_state.tsm.lock();
        if let Tsm::Live(gate) = &*tsm {
            gate.post_exit();
        }
        *tsm = Tsm::Dormant;
    }

    pub fn yield_cpu<Traits: PortInstance>() {
        enter_cpu_lock::<Traits>();
        // Safety: CPU Lock active, called from a dispatch path
        let next = unsafe { <Traits as PortToKernel>::choose_running_task() };
        match next {
            Some(next) => dispatch::<Traits>(next),
            None => Traits::port_state().current.store(0, Ordering::SeqCst),
        }
        leave_cpu_lock::<Traits>();
    }

    pub fn exit_and_dispatch<Traits: PortInstance>(task: &'static TaskCb<Traits>) -> ! {
        log::trace!("task {task:?} exiting");
        // This thread no longer represents a task, so `leave_cpu_lock` below
        // won't try to park it
        CURRENT_TASK.with(|c| c.set(0));
        // Nobody owns the processor now. This matters when the exiting task
        // is immediately re-elected (self-restart): the dispatch below must
        // not be treated as a no-op.
        Traits::port_state().current.store(0, Ordering::SeqCst);

        // Safety: CPU Lock is active (inherited from the exit path)
        let next = unsafe { <Traits as PortToKernel>::choose_running_task() };
        match next {
            Some(next) => dispatch::<Traits>(next),
            None => Traits::port_state().current.store(0, Ordering::SeqCst),
        }
        CPU_LOCK_DEPTH.with(|depth| {
            debug_assert_eq!(depth.get(), 1);
            depth.set(0);
        });
        // Safety: this thread owns the lock
        unsafe { Traits::port_state().cpu_lock.force_unlock() };

        resume_unwind(Box::new(TaskExit));
    }

    pub fn idle<Traits: PortInstance>() {
        let ps = Traits::port_state();

        if ps.shutdown.load(Ordering::SeqCst) {
            // Freeze: the simulation is over
            loop {
                thread::park();
            }
        }

        park_if_preempted::<Traits>();

        // The system is quiescent. If an alarm is armed, warp the virtual
        // clock to it and deliver the timer interrupt.
        let due = {
            let mut alarm = ps.alarm.lock();
            alarm.take()
        };
        if let Some(at) = due {
            let now = ps.clock.load(Ordering::SeqCst);
            if at > now {
                ps.clock.store(at, Ordering::SeqCst);
            }
            log::trace!("idle: warping to tick {at} and firing the alarm");
            IN_INTERRUPT.with(|c| c.set(true));
            // Safety: CPU Lock inactive, outside task context
            unsafe { <Traits as PortToKernel>::timer_tick() };
            IN_INTERRUPT.with(|c| c.set(false));
            return;
        }

        // Nothing armed and nothing to run
        thread::sleep(Duration::from_micros(200));
    }

    /// Park the calling task thread until its task is the elected one again.
    ///
    /// A thread whose activation was discarded (task deleted or restarted by
    /// another task) must not unwind here — arbitrary kernel frames may be
    /// live on its stack. It freezes instead.
    fn park_if_preempted<Traits: PortInstance>() {
        let me = CURRENT_TASK.with(|c| c.get());
        if me == 0 {
            return;
        }
        loop {
            if Traits::port_state().current.load(Ordering::SeqCst) == me {
                return;
            }
            let gate = MY_GATE.with(|g| g.borrow().clone()).unwrap();
            if !gate.wait() {
                freeze_thread();
            }
        }
    }

    /// Permanently park a task thread whose activation is gone.
    fn freeze_thread() -> ! {
        loop {
            thread::park();
        }
    }

    /// Transfer the processor to `next`, spawning its thread on first
    /// dispatch. Called with CPU Lock held.
    fn dispatch<Traits: PortInstance>(next: &'static TaskCb<Traits>) {
        let ps = Traits::port_state();
        let next_addr = next as *const TaskCb<Traits> as usize;
        let prev_addr = ps.current.swap(next_addr, Ordering::SeqCst);
        if prev_addr == next_addr {
            return;
        }
        log::trace!("dispatch: {prev_addr:#x} -> {next_addr:#x}");

        let mut tsm = next.port_task_state.tsm.lock();
        match &*tsm {
            Tsm::Live(gate) => gate.post_permit(),
            Tsm::Dormant => {
                let gate = Arc::new(TaskGate::new(1));
                *tsm = Tsm::Live(Arc::clone(&gate));
                drop(tsm);
                spawn_task_thread::<Traits>(next, gate);
            }
        }
    }

    fn spawn_task_thread<Traits: PortInstance>(task: &'static TaskCb<Traits>, gate: Arc<TaskGate>) {
        thread::Builder::new()
            .name("tern task".to_owned())
            .spawn(move || {
                CURRENT_TASK.with(|c| c.set(task as *const TaskCb<Traits> as usize));
                MY_GATE.with(|g| *g.borrow_mut() = Some(gate));

                let result = catch_unwind(AssertUnwindSafe(|| {
                    // The initial permit is banked; run only once the task
                    // is the elected one
                    park_if_preempted::<Traits>();
                    if let Some((entry, args)) = task.start_info() {
                        entry(args);
                    }
                    // Returning from the entry point deletes the task. On
                    // success this does not come back.
                    if let Ok(id) = System::<Traits>::current_task() {
                        let _ = System::<Traits>::task_delete(id);
                    }
                }));

                if let Err(payload) = result {
                    if !payload.is::<TaskExit>() {
                        record_failure::<Traits>(payload);
                    }
                }
            })
            .unwrap();
    }
}

/// Generate the trait implementations binding a system traits type to this
/// port:
///
/// ```ignore
/// tern_port_std::use_port!(struct SystemTraits);
///
/// fn root(_: [u32; 4]) { /* ... */ }
///
/// tern_port_std::run_kernel::<SystemTraits>(root);
/// ```
#[macro_export]
macro_rules! use_port {
    ($vis:vis struct $Traits:ident) => {
        $vis struct $Traits;

        const _: () = {
            use $crate::tern_kernel as tk;

            static PORT_STATE: $crate::PortState = $crate::PortState::new();
            static KERNEL_STATE: tk::State<$Traits> = tk::State::INIT;

            unsafe impl tk::Port for $Traits {
                type PortTaskState = $crate::TaskState;

                unsafe fn try_enter_cpu_lock() -> bool {
                    $crate::imp::try_enter_cpu_lock::<Self>()
                }
                unsafe fn enter_cpu_lock() {
                    $crate::imp::enter_cpu_lock::<Self>()
                }
                unsafe fn leave_cpu_lock() {
                    $crate::imp::leave_cpu_lock::<Self>()
                }
                fn is_cpu_lock_active() -> bool {
                    $crate::imp::is_cpu_lock_active()
                }
                fn is_task_context() -> bool {
                    $crate::imp::is_task_context()
                }
                fn tick_count() -> tk::Ticks {
                    $crate::imp::tick_count::<Self>()
                }
                unsafe fn pend_tick_at(at: tk::Ticks) {
                    $crate::imp::pend_tick_at::<Self>(at)
                }
                unsafe fn clear_pending_tick() {
                    $crate::imp::clear_pending_tick::<Self>()
                }
                unsafe fn initialize_task_state(task: &'static tk::TaskCb<Self>) {
                    $crate::imp::initialize_task_state::<Self>(task)
                }
                unsafe fn discard_task_state(task: &'static tk::TaskCb<Self>) {
                    $crate::imp::discard_task_state::<Self>(task)
                }
                unsafe fn yield_cpu() {
                    $crate::imp::yield_cpu::<Self>()
                }
                unsafe fn exit_and_dispatch(task: &'static tk::TaskCb<Self>) -> ! {
                    $crate::imp::exit_and_dispatch::<Self>(task)
                }
                unsafe fn idle() {
                    $crate::imp::idle::<Self>()
                }
            }

            unsafe impl tk::KernelTraits for $Traits {
                fn state() -> &'static tk::State<Self> {
                    &KERNEL_STATE
                }
            }

            unsafe impl $crate::PortInstance for $Traits {
                fn port_state() -> &'static $crate::PortState {
                    &PORT_STATE
                }
            }
        };
    };
}
