//! Ready-set and scheduler core (spec §4.3) plus the thread wait
//! enter/exit/delete mechanics of §4.4. Kept together because both
//! operate directly on the same ready-list/bitmap/delay-list state and
//! are, in the original, the two halves of one `krnThreadWait*`/`Sched*`
//! translation unit.

use crate::config::{NUM_PRIORITY, WAIT_FOREVER};
use crate::delay::DelayList;
use crate::error::Status;
use crate::kernel::{Kernel, KernelState};
use crate::port::Port;
use crate::queue::List;
use crate::thread::{BlockKind, ThreadId, ThreadSlab, ThreadState, WaitInfo};

pub type ReadyList = [List<ThreadId>; NUM_PRIORITY];

/// Build a fresh, empty ready set. `List<ThreadId>` is not `Copy`-free of
/// const-context quirks, so this goes through `array::from_fn`.
pub fn new_ready_list() -> ReadyList {
    core::array::from_fn(|_| List::new())
}

impl<P: Port> Kernel<P> {
    /// Append `tid` to the ready list for its current effective priority,
    /// set the corresponding bitmap bit, and mark it `Ready`.
    pub(crate) fn ready_add(&mut self, tid: ThreadId) {
        let prio = self.threads.get_mut_by_index(tid.index).unwrap().effective_priority;
        self.threads.get_mut_by_index(tid.index).unwrap().state = ThreadState::Ready;
        self.ready_list[prio as usize].push_back(&mut self.threads, tid);
        self.ready_bmp |= 1u32 << prio;
    }

    /// Remove `tid` from whichever ready list currently holds it (a
    /// no-op if it is not on one) and set its new state.
    pub(crate) fn ready_del(&mut self, tid: ThreadId, new_state: ThreadState) {
        let prio = self.threads.get_mut_by_index(tid.index).unwrap().effective_priority;
        self.ready_list[prio as usize].remove(&mut self.threads, tid);
        if self.ready_list[prio as usize].is_empty() {
            self.ready_bmp &= !(1u32 << prio);
        }
        self.threads.get_mut_by_index(tid.index).unwrap().state = new_state;
    }

    /// Index of the highest set bit in the ready bitmap, i.e. the
    /// priority of the best ready thread, or `None` if nothing is ready.
    pub(crate) fn highest_ready(&self) -> Option<u8> {
        if self.ready_bmp == 0 {
            None
        } else {
            Some(31 - self.ready_bmp.leading_zeros() as u8)
        }
    }

    /// Pick `candidate` (or, if `None`, the head of the highest-priority
    /// ready list) and, if it differs from the currently running thread,
    /// request the pendable interrupt that performs the actual context
    /// switch. A no-op if the kernel is locked or not yet running.
    pub(crate) fn dispatch(&mut self, candidate: Option<ThreadId>) {
        if self.state != KernelState::Running {
            return;
        }
        let next = match candidate {
            Some(t) => Some(t),
            None => self.highest_ready().and_then(|p| self.ready_list[p as usize].front()),
        };
        let next = match next {
            Some(t) => t,
            None => return,
        };
        if Some(next) == self.run_curr {
            return;
        }
        self.run_next = Some(next);
        self.port.pendable_request();
    }

    /// Move the running thread to the tail of its own ready list and
    /// re-dispatch, letting an equal-priority peer run (explicit yield;
    /// the kernel never time-slices threads of its own accord).
    pub(crate) fn yield_running(&mut self) {
        let Some(tid) = self.run_curr else { return };
        let prio = self.threads.get_mut_by_index(tid.index).unwrap().effective_priority;
        self.ready_list[prio as usize].remove(&mut self.threads, tid);
        self.ready_list[prio as usize].push_back(&mut self.threads, tid);
        self.dispatch(None);
    }

    /// Change `tid`'s priority. If ready, re-insert it at the new
    /// priority's tail; if running, re-dispatch in case a higher-priority
    /// peer became eligible.
    pub(crate) fn set_priority(&mut self, tid: ThreadId, new_base: u8) {
        let t = self.threads.get_mut_by_index(tid.index).unwrap();
        let was_ready = matches!(t.state, ThreadState::Ready);
        let was_running = matches!(t.state, ThreadState::Running);
        let old_prio = t.effective_priority;
        t.base_priority = new_base;
        // Only raise effective priority here; a mutex-held boost must not
        // be undone by a plain SetPriority (re-applied on mutex release).
        if new_base > t.effective_priority {
            t.effective_priority = new_base;
        }
        if was_ready {
            self.ready_list[old_prio as usize].remove(&mut self.threads, tid);
            if self.ready_list[old_prio as usize].is_empty() {
                self.ready_bmp &= !(1u32 << old_prio);
            }
            self.ready_add(tid);
        }
        if was_running || was_ready {
            self.dispatch(None);
        }
    }

    /// Force `tid`'s effective priority to exactly `new_eff`, without
    /// touching `base_priority`. Used by mutex priority inheritance to
    /// boost an owner and later revert it; a plain [`Kernel::set_priority`]
    /// call must not undo an active boost, so that path only ever raises
    /// `effective_priority`, never lowers it — reverting is this
    /// function's job once the boosting condition goes away.
    pub(crate) fn set_effective_priority(&mut self, tid: ThreadId, new_eff: u8) {
        let t = self.threads.get_mut_by_index(tid.index).unwrap();
        let was_ready = matches!(t.state, ThreadState::Ready);
        let was_running = matches!(t.state, ThreadState::Running);
        let old_prio = t.effective_priority;
        if old_prio == new_eff {
            return;
        }
        t.effective_priority = new_eff;
        if was_ready {
            self.ready_list[old_prio as usize].remove(&mut self.threads, tid);
            if self.ready_list[old_prio as usize].is_empty() {
                self.ready_bmp &= !(1u32 << old_prio);
            }
            self.ready_add(tid);
        }
        if was_running || was_ready {
            self.dispatch(None);
        }
    }

    /// Stash the running thread's blocking-call result and hand it back
    /// once rescheduled. Internal handlers that block return
    /// [`crate::error::THREAD_WAIT`]; the gate (§4.14) reads this slot
    /// after the thread resumes.
    pub(crate) fn running_ret_val(&self) -> i32 {
        self.run_curr.and_then(|tid| self.threads.get_by_index(tid.index)).map(|t| t.ret_val).unwrap_or(Status::Error as i32)
    }

    /// Wait-exit (§4.4): unlink from the delay list if present, stash
    /// `ret_val`, mark ready, and optionally dispatch immediately. A
    /// batch release (e.g. `Delete` draining every waiter) passes
    /// `dispatch = false` for all but a final call.
    pub(crate) fn thread_wait_exit(&mut self, tid: ThreadId, ret_val: i32, dispatch: bool) {
        let has_deadline = self.threads.get_by_index(tid.index).unwrap().has_deadline;
        if has_deadline {
            self.delay_list.remove(&mut self.threads, tid);
        }
        let t = self.threads.get_mut_by_index(tid.index).unwrap();
        t.ret_val = ret_val;
        t.wait_info = WaitInfo::None;
        self.ready_add(tid);
        if dispatch {
            self.dispatch(None);
        }
    }
}

/// Move the running thread `tid` out of the ready set into `Blocked(kind)`,
/// link it onto `wait_queue`, and (for a finite `timeout`) onto the delay
/// list sorted by absolute wakeup tick. A free function rather than a
/// `Kernel` method so callers can pass `wait_queue` borrowed from whatever
/// primitive's slab they already hold a `&mut` into alongside the other
/// kernel-core fields, without fighting the borrow checker over `&mut self`
/// aliasing a field it's already borrowing.
#[allow(clippy::too_many_arguments)]
pub(crate) fn enter_wait(
    threads: &mut ThreadSlab,
    ready_list: &mut ReadyList,
    ready_bmp: &mut u32,
    delay_list: &mut DelayList,
    tick: u64,
    tid: ThreadId,
    kind: BlockKind,
    info: WaitInfo,
    timeout: u32,
    wait_queue: &mut List<ThreadId>,
) {
    let prio = threads.get_mut_by_index(tid.index).unwrap().effective_priority;
    ready_list[prio as usize].remove(threads, tid);
    if ready_list[prio as usize].is_empty() {
        *ready_bmp &= !(1u32 << prio);
    }
    threads.get_mut_by_index(tid.index).unwrap().state = ThreadState::Blocked(kind);
    wait_queue.push_back(threads, tid);
    if timeout != WAIT_FOREVER {
        let wakeup = tick.saturating_add(timeout as u64);
        delay_list.insert_sorted(threads, tid, wakeup);
    }
    let t = threads.get_mut_by_index(tid.index).unwrap();
    t.wait_info = info;
}

/// Like [`enter_wait`], but for a wait with no backing object wait queue
/// (thread flags: the only possible waiter is the thread itself, so
/// there is nothing to link onto). The caller is responsible for having
/// already stashed the relevant `WaitInfo` on the thread.
pub(crate) fn enter_wait_self(threads: &mut ThreadSlab, ready_list: &mut ReadyList, ready_bmp: &mut u32, delay_list: &mut DelayList, tick: u64, tid: ThreadId, kind: BlockKind, timeout: u32) {
    let prio = threads.get_mut_by_index(tid.index).unwrap().effective_priority;
    ready_list[prio as usize].remove(threads, tid);
    if ready_list[prio as usize].is_empty() {
        *ready_bmp &= !(1u32 << prio);
    }
    threads.get_mut_by_index(tid.index).unwrap().state = ThreadState::Blocked(kind);
    if timeout != WAIT_FOREVER {
        let wakeup = tick.saturating_add(timeout as u64);
        delay_list.insert_sorted(threads, tid, wakeup);
    }
}
