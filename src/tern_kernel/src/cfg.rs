//! Static configuration
//!
//! Every limit in the kernel is a compile-time constant; the kernel performs
//! no allocation and reads no configuration at run time.

use crate::Ticks;

/// Maximum number of concurrently existing tasks, including the idle task.
pub const MAX_TASKS: usize = 64;

/// Maximum number of concurrently existing semaphores.
pub const MAX_SEMAPHORES: usize = 128;

/// Maximum number of concurrently existing message queues.
pub const MAX_QUEUES: usize = 32;

/// Number of 16-byte message buffers in the global arena shared by all
/// message queues.
pub const MAX_MSG_BUFFERS: usize = 2048;

/// Maximum number of concurrently armed timers.
pub const MAX_TIMERS: usize = 64;

/// Number of priority levels tracked by the ready queue. Valid task
/// priorities occupy `MIN_TASK_PRIORITY..=MAX_TASK_PRIORITY`; level 0 is
/// reserved.
pub const PRIORITY_LEVELS: usize = 256;

/// The highest-urgency task priority (numerically lowest).
pub const MIN_TASK_PRIORITY: u8 = 1;

/// The lowest-urgency task priority (numerically highest).
pub const MAX_TASK_PRIORITY: u8 = 255;

/// The priority of the kernel-created idle task.
pub const IDLE_PRIORITY: u8 = MAX_TASK_PRIORITY;

/// The priority of the root task created at boot.
pub const ROOT_PRIORITY: u8 = MIN_TASK_PRIORITY;

/// The nominal tick rate. The calendar clock uses this to relate sub-second
/// ticks to seconds.
pub const TICKS_PER_SEC: Ticks = 100;

/// Smallest stack a task may be created with, in bytes.
pub const MIN_TASK_STACK: usize = 256;

/// Total stack budget shared by all tasks, in bytes.
pub const STACK_POOL_SIZE: usize = 128 * 1024;

/// Round-robin quantum, in ticks, for tasks running with the time-slice mode
/// bit set.
pub const DEFAULT_TIME_SLICE: Ticks = 10;

/// Upper bound on a counting semaphore's value.
pub const SEM_MAX_COUNT: u32 = 65535;

/// Notepad registers per task.
pub const TASK_REGS: usize = 8;
