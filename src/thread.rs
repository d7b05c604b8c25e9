//! Thread control block and state machine.

use crate::config::MAX_THREADS;
use crate::object::{Handle, ObjectFlags, Slab};
use crate::port::StackPointer;
use crate::queue::Links;

/// Marker type selecting the thread table in [`Handle`]/[`Slab`].
pub struct ThreadMarker;

/// A validated reference to a thread control block. Fails to resolve once
/// the thread has exited and its slot has been reused (generation bump),
/// mirroring the original's ID-tag check on a deleted control block.
pub type ThreadId = Handle<ThreadMarker>;

pub type ThreadSlab = Slab<Thread, ThreadMarker, MAX_THREADS>;

/// Sub-kind of a `Blocked` thread, carried in the upper nibble of the
/// original's state byte. Kept as a proper enum payload here instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
    ThreadFlags,
    EventFlags,
    Mutex,
    Semaphore,
    MemoryPool,
    QueueGet,
    QueuePut,
    Delay,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Inactive,
    Ready,
    Running,
    Blocked(BlockKind),
    Terminated,
}

impl ThreadState {
    pub fn is_blocked(self) -> bool {
        matches!(self, ThreadState::Blocked(_))
    }
}

/// `Wait(options, mask, timeout)` semantics shared by thread flags and
/// event flags: match on any set bit, match only when every masked bit is
/// set, and whether a successful match consumes (clears) the matched
/// bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlagsOptions {
    pub wait_all: bool,
    pub auto_clear: bool,
}

impl FlagsOptions {
    pub const fn any() -> Self {
        FlagsOptions { wait_all: false, auto_clear: true }
    }

    pub const fn all() -> Self {
        FlagsOptions { wait_all: true, auto_clear: true }
    }

    pub const fn no_clear(mut self) -> Self {
        self.auto_clear = false;
        self
    }

    /// Does `flags` satisfy `mask` under these options?
    pub fn matches(self, flags: u32, mask: u32) -> bool {
        if self.wait_all {
            (flags & mask) == mask
        } else {
            (flags & mask) != 0
        }
    }
}

/// Per-thread discriminated union of wait parameters, keyed by
/// [`BlockKind`]. Carries whatever the blocking call needs to complete
/// once woken, plus (via `ret_val` on [`Thread`]) the result to hand back.
///
/// Buffer pointers borrow into the caller's own stack for the duration of
/// the blocking call; since the calling thread stays suspended (its stack
/// frame is preserved) until it is woken or the object is deleted, these
/// raw pointers remain valid for the lifetime they are used.
#[derive(Clone, Copy, Debug)]
pub enum WaitInfo {
    None,
    ThreadFlags { options: FlagsOptions, mask: u32 },
    EventFlags { handle: u16, options: FlagsOptions, mask: u32 },
    Mutex { handle: u16 },
    Semaphore { handle: u16 },
    MemoryPool { handle: u16 },
    MessageGet { handle: u16, buffer: *mut u8, out_priority: *mut u8 },
    MessagePut { handle: u16, buffer: *const u8, priority: u8 },
    DataGet { handle: u16, buffer: *mut u8 },
    DataPut { handle: u16, buffer: *const u8 },
    Delay,
}

// SAFETY: the raw pointers embedded in `WaitInfo` are only ever read or
// written while the kernel's global lock is held and the owning thread is
// parked (not concurrently touching its own stack), so `Thread` can be
// treated as `Send` across the lock boundary.
unsafe impl Send for WaitInfo {}

pub struct Thread {
    pub name: &'static str,
    pub state: ThreadState,
    pub base_priority: u8,
    pub effective_priority: u8,
    pub stack_sp: StackPointer,
    pub stack_base: *mut u8,
    pub stack_size: usize,
    pub arg: usize,

    /// Link while on exactly one of: a ready list, a wait queue. Not
    /// linked anywhere while `Running`, `Inactive`, or `Terminated`.
    pub thread_links: Links<ThreadId>,
    /// Link while on the global delay list. Independent of `thread_links`
    /// so a thread can be simultaneously on a wait queue *and* the delay
    /// list (bounded wait).
    pub delay_links: Links<ThreadId>,
    pub wakeup_tick: u64,
    pub has_deadline: bool,

    pub wait_info: WaitInfo,
    pub ret_val: i32,

    /// Head of the list of mutexes this thread currently owns, threaded
    /// through each `Mutex`'s own `owned_links` field. Walked on thread
    /// exit to release them (robust mode) and when recomputing this
    /// thread's effective priority from inherited boosts.
    pub owned_mutexes: crate::queue::List<u16>,

    /// This thread's own post-queue membership, used when `ThreadFlags`
    /// are set from ISR context (see `sync::thread_flags`).
    pub object_flags: ObjectFlags,
    pub thread_flags: u32,

    pub joinable: bool,
    pub exit_code: i32,
}

impl crate::queue::NodeLinks<ThreadId> for ThreadSlab {
    fn links(&self, id: ThreadId) -> Links<ThreadId> {
        self.get_by_index(id.index).map(|t| t.thread_links).unwrap_or(Links::empty())
    }

    fn set_links(&mut self, id: ThreadId, links: Links<ThreadId>) {
        if let Some(t) = self.get_mut_by_index(id.index) {
            t.thread_links = links;
        }
    }
}

impl Thread {
    pub fn new(name: &'static str, priority: u8, stack_base: *mut u8, stack_size: usize, arg: usize, joinable: bool) -> Self {
        Thread {
            name,
            state: ThreadState::Inactive,
            base_priority: priority,
            effective_priority: priority,
            stack_sp: 0,
            stack_base,
            stack_size,
            arg,
            thread_links: Links::empty(),
            delay_links: Links::empty(),
            wakeup_tick: 0,
            has_deadline: false,
            wait_info: WaitInfo::None,
            ret_val: 0,
            owned_mutexes: crate::queue::List::new(),
            object_flags: ObjectFlags::empty(),
            thread_flags: 0,
            joinable,
            exit_code: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_of_matches_partial_overlap() {
        let opt = FlagsOptions::any();
        assert!(opt.matches(0b0100, 0b0110));
        assert!(!opt.matches(0b1000, 0b0110));
    }

    #[test]
    fn all_of_requires_full_mask() {
        let opt = FlagsOptions::all();
        assert!(opt.matches(0b0111, 0b0110));
        assert!(!opt.matches(0b0100, 0b0110));
    }
}
