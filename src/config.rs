//! Compile-time tunables for the kernel core.
//!
//! Everything here used to be a build-time `#define` in the C sources this
//! core is ported from. They are collected in one place so a downstream
//! fork can retune the kernel without hunting through every module.

/// Number of distinct priority levels. Priority 0 is reserved for the idle
/// thread; the highest index is reserved for the timer thread.
pub const NUM_PRIORITY: usize = 32;

/// Maximum number of threads the kernel can hold control blocks for.
pub const MAX_THREADS: usize = 32;

/// Maximum number of software timers.
pub const MAX_TIMERS: usize = 16;

/// Maximum number of mutexes.
pub const MAX_MUTEXES: usize = 16;

/// Maximum number of semaphores.
pub const MAX_SEMAPHORES: usize = 16;

/// Maximum number of event flag groups.
pub const MAX_EVENT_FLAGS: usize = 16;

/// Maximum number of memory pools (user-visible `osMemoryPool` objects, not
/// counting the internal pools that back message queues).
pub const MAX_MEMORY_POOLS: usize = 8;

/// Maximum number of message queues.
pub const MAX_MESSAGE_QUEUES: usize = 8;

/// Maximum number of data queues.
pub const MAX_DATA_QUEUES: usize = 8;

/// Depth of the global ISR post-processing queue. Bounded by the number of
/// distinct postable objects in the system (one entry per object at most,
/// since posting is idempotent), so this must be at least the sum of all
/// the `MAX_*` counts above that name a postable kind.
pub const POST_QUEUE_CAPACITY: usize = 64;

/// Priority of the mandatory idle thread. Always the lowest priority.
pub const IDLE_THREAD_PRIORITY: u8 = 0;

/// Priority of the mandatory timer thread. Always the highest priority, so
/// timer callbacks preempt any application thread.
pub const TIMER_THREAD_PRIORITY: u8 = (NUM_PRIORITY - 1) as u8;

/// Depth of the timer thread's internal message queue (one slot per
/// concurrently-expirable timer is generous but keeps worst case bounded).
pub const TIMER_QUEUE_CAPACITY: usize = MAX_TIMERS;

/// Sentinel timeout value meaning "wait forever".
pub const WAIT_FOREVER: u32 = u32::MAX;

/// Reserved "infinite" wakeup tick used for threads parked without a
/// deadline; kept off the delay list entirely (see `delay` module) but
/// used as a saturation bound when computing wakeup = tick + timeout.
pub const TICK_INFINITE: u64 = u64::MAX;

/// Nominal rate, in Hz, at which an integrator is expected to call
/// `Kernel::tick_handler`. The port contract has no independent
/// high-resolution hardware counter distinct from the OS tick (see
/// `Kernel::kernel_get_sys_timer_count`), so this is also the system
/// timer's reported frequency.
pub const TICK_FREQ_HZ: u32 = 1000;
