//! A preemptive, priority-based RTOS kernel core: the thread state
//! machine and scheduler, the CMSIS-RTOS2-style synchronization
//! primitives (thread flags, event flags, semaphores, mutexes with
//! optional priority inheritance, memory pools, message queues, data
//! queues, software timers), and the ISR post-processing pipeline that
//! lets all of them be driven safely from interrupt context.
//!
//! This crate owns policy only: the actual context switch, interrupt
//! masking, and pendable/tick interrupt sources are supplied by an
//! integrator through [`port::Port`]. All storage (stacks, pool/queue
//! backing buffers) is caller-provided; nothing here allocates.
#![no_std]

pub mod config;
pub mod delay;
pub mod error;
pub mod kernel;
pub mod mempool;
pub mod mqueue;
pub mod object;
pub mod port;
pub mod queue;
pub mod sched;
pub mod sync;
pub mod thread;
pub mod thread_api;
pub mod timer;

pub use error::{KernelResult, Status};
pub use kernel::{Kernel, KernelState};
pub use mqueue::data_queue::{DataQueue, DataQueueHandle};
pub use mqueue::message_queue::{MessageQueue, MessageQueueHandle};
pub use object::{ObjectFlags, ObjectKind};
pub use port::{Port, StackPointer, ThreadEntry};
pub use sync::event_flags::EventFlagsHandle;
pub use sync::memory_pool::MemoryPoolHandle;
pub use sync::mutex::MutexHandle;
pub use sync::semaphore::SemaphoreHandle;
pub use thread::{BlockKind, FlagsOptions, ThreadId, ThreadState};
pub use timer::{TimerCallback, TimerHandle};
