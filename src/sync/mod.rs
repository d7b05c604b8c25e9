//! Inter-thread synchronization primitives: thread flags, event flags,
//! semaphores, mutexes (with priority inheritance), and the user-visible
//! memory pool object. Message queues and data queues live in
//! [`crate::mqueue`] since they additionally depend on the memory pool
//! allocator.

pub mod event_flags;
pub mod memory_pool;
pub mod mutex;
pub mod semaphore;
pub mod thread_flags;

pub use crate::thread::FlagsOptions;
