//! Mutex with optional priority inheritance and recursive locking (spec
//! §4.11).
//!
//! A mutex is linked into its owner's `owned_mutexes` list (keyed by raw
//! slab index rather than a validated [`crate::object::Handle`], matching
//! [`crate::thread::Thread::owned_mutexes`]) so that on release — or on
//! the owner's termination in robust mode — the kernel can recompute the
//! owner's effective priority from every mutex it still holds.

use crate::config::MAX_MUTEXES;
use crate::error::{KernelResult, Status};
use crate::kernel::Kernel;
use crate::object::{Handle, ObjectFlags, Slab};
use crate::port::Port;
use crate::queue::{Links, List, NodeLinks};
use crate::thread::{BlockKind, ThreadId, WaitInfo};

pub struct MutexMarker;
pub type MutexHandle = Handle<MutexMarker>;
pub type MutexSlab = Slab<Mutex, MutexMarker, MAX_MUTEXES>;

pub struct Mutex {
    pub owner: Option<ThreadId>,
    pub recursion: u32,
    pub prio_inherit: bool,
    pub robust: bool,
    pub recursive: bool,
    pub waiters: List<ThreadId>,
    /// This mutex's link in its owner's `owned_mutexes` list.
    pub owned_links: Links<u16>,
    pub flags: ObjectFlags,
}

impl NodeLinks<u16> for MutexSlab {
    fn links(&self, id: u16) -> Links<u16> {
        self.get_by_index(id).map(|m| m.owned_links).unwrap_or(Links::empty())
    }

    fn set_links(&mut self, id: u16, links: Links<u16>) {
        if let Some(m) = self.get_mut_by_index(id) {
            m.owned_links = links;
        }
    }
}

impl<P: Port> Kernel<P> {
    pub fn mutex_new(&mut self, prio_inherit: bool, robust: bool, recursive: bool) -> KernelResult<MutexHandle> {
        let m = Mutex {
            owner: None,
            recursion: 0,
            prio_inherit,
            robust,
            recursive,
            waiters: List::new(),
            owned_links: Links::empty(),
            flags: ObjectFlags::empty(),
        };
        self.mutexes.insert(m).ok_or(Status::ErrorNoMemory)
    }

    pub fn mutex_delete(&mut self, handle: MutexHandle) -> KernelResult<()> {
        let index = handle.index;
        let prior_owner = {
            let m = self.mutexes.get_mut(handle).ok_or(Status::ErrorParameter)?;
            m.owner.take()
        };
        if let Some(owner) = prior_owner {
            self.threads.get_mut_by_index(owner.index).unwrap().owned_mutexes.remove(&mut self.mutexes, index);
        }
        {
            let m = self.mutexes.get_mut_by_index(index).unwrap();
            let mut waiters = core::mem::replace(&mut m.waiters, List::new());
            while let Some(tid) = waiters.pop_front(&mut self.threads) {
                self.thread_wait_exit(tid, Status::ErrorResource as i32, false);
            }
        }
        self.mutexes.remove(handle);
        self.dispatch(None);
        Ok(())
    }

    pub fn mutex_get_owner(&self, handle: MutexHandle) -> KernelResult<Option<ThreadId>> {
        self.mutexes.get(handle).map(|m| m.owner).ok_or(Status::ErrorParameter)
    }

    pub fn mutex_acquire(&mut self, handle: MutexHandle, timeout: u32) -> KernelResult<()> {
        if self.port.irq_in_handler() {
            return Err(Status::ErrorIsr);
        }
        let index = handle.index;
        let caller = self.run_curr.ok_or(Status::Error)?;
        {
            let m = self.mutexes.get_mut(handle).ok_or(Status::ErrorParameter)?;
            match m.owner {
                None => {
                    m.owner = Some(caller);
                    m.recursion = 1;
                    let prio_inherit = m.prio_inherit;
                    let _ = prio_inherit;
                    self.threads.get_mut_by_index(caller.index).unwrap().owned_mutexes.push_back(&mut self.mutexes, index);
                    return Ok(());
                }
                Some(owner) if owner == caller => {
                    if !m.recursive {
                        return Err(Status::ErrorResource);
                    }
                    m.recursion += 1;
                    return Ok(());
                }
                Some(owner) => {
                    if m.prio_inherit {
                        let caller_eff = self.threads.get_by_index(caller.index).unwrap().effective_priority;
                        let owner_eff = self.threads.get_by_index(owner.index).unwrap().effective_priority;
                        if caller_eff > owner_eff {
                            self.set_effective_priority(owner, caller_eff);
                            log::debug!("mutex {} inheritance: boosting owner {:?} to {}", index, owner, caller_eff);
                        }
                    }
                }
            }
        }
        if timeout == 0 {
            return Err(Status::ErrorResource);
        }
        {
            let m = self.mutexes.get_mut_by_index(index).unwrap();
            crate::sched::enter_wait(
                &mut self.threads,
                &mut self.ready_list,
                &mut self.ready_bmp,
                &mut self.delay_list,
                self.tick,
                caller,
                BlockKind::Mutex,
                WaitInfo::Mutex { handle: index },
                timeout,
                &mut m.waiters,
            );
        }
        self.dispatch(None);
        let ret = self.running_ret_val();
        if ret == Status::Ok as i32 {
            Ok(())
        } else {
            Err(status_from_raw(ret))
        }
    }

    pub fn mutex_release(&mut self, handle: MutexHandle) -> KernelResult<()> {
        if self.port.irq_in_handler() {
            return Err(Status::ErrorIsr);
        }
        let index = handle.index;
        let caller = self.run_curr.ok_or(Status::Error)?;
        {
            let m = self.mutexes.get_mut(handle).ok_or(Status::ErrorParameter)?;
            if m.owner != Some(caller) {
                return Err(Status::ErrorResource);
            }
            m.recursion -= 1;
            if m.recursion > 0 {
                return Ok(());
            }
        }
        self.mutex_transfer_or_release(index, caller);
        Ok(())
    }

    /// Detach `index` from `prev_owner`'s owned-mutex list, hand it to
    /// the head waiter if any (or mark it free), then recompute
    /// `prev_owner`'s effective priority from whatever it still holds.
    fn mutex_transfer_or_release(&mut self, index: u16, prev_owner: ThreadId) {
        self.threads.get_mut_by_index(prev_owner.index).unwrap().owned_mutexes.remove(&mut self.mutexes, index);
        let next_owner = self.mutexes.get_mut_by_index(index).unwrap().waiters.pop_front(&mut self.threads);
        match next_owner {
            Some(new_owner) => {
                let m = self.mutexes.get_mut_by_index(index).unwrap();
                m.owner = Some(new_owner);
                m.recursion = 1;
                self.threads.get_mut_by_index(new_owner.index).unwrap().owned_mutexes.push_back(&mut self.mutexes, index);
                if self.mutexes.get_by_index(index).unwrap().prio_inherit {
                    self.reapply_inheritance(new_owner);
                }
                self.thread_wait_exit(new_owner, Status::Ok as i32, false);
            }
            None => {
                let m = self.mutexes.get_mut_by_index(index).unwrap();
                m.owner = None;
                m.recursion = 0;
            }
        }
        self.recompute_effective_priority(prev_owner);
        self.dispatch(None);
    }

    /// Effective priority floor for `tid`: its own base priority, boosted
    /// to the highest priority of any thread waiting on any mutex it
    /// still owns. Walks every owned mutex (spec §9's open question:
    /// inheritance is recomputed across *all* held mutexes, not just the
    /// one just released).
    fn recompute_effective_priority(&mut self, tid: ThreadId) {
        let base = self.threads.get_by_index(tid.index).unwrap().base_priority;
        let mut floor = base;
        let owned = self.threads.get_by_index(tid.index).unwrap().owned_mutexes;
        owned.for_each(&self.mutexes, |mutex_index| {
            if let Some(p) = self.highest_waiter_priority(mutex_index) {
                if p > floor {
                    floor = p;
                }
            }
        });
        self.set_effective_priority(tid, floor);
    }

    /// Re-evaluate whether `new_owner` (having just taken over a mutex)
    /// needs a fresh inheritance boost from the waiters it inherited.
    fn reapply_inheritance(&mut self, new_owner: ThreadId) {
        self.recompute_effective_priority(new_owner);
    }

    fn highest_waiter_priority(&self, mutex_index: u16) -> Option<u8> {
        let waiters = self.mutexes.get_by_index(mutex_index)?.waiters;
        let mut best: Option<u8> = None;
        waiters.for_each(&self.threads, |tid| {
            if let Some(t) = self.threads.get_by_index(tid.index) {
                if best.map(|b| t.effective_priority > b).unwrap_or(true) {
                    best = Some(t.effective_priority);
                }
            }
        });
        best
    }

    /// Release every mutex `tid` still owns, on thread termination
    /// (§5 "Terminating a thread releases all its owned mutexes"). Robust
    /// mutexes wake every waiter with `ErrorResource`; non-robust mutexes
    /// transfer ownership normally, as if the dying thread had released
    /// them one at a time.
    pub(crate) fn release_owned_mutexes_on_exit(&mut self, tid: ThreadId) {
        let owned = core::mem::replace(&mut self.threads.get_mut_by_index(tid.index).unwrap().owned_mutexes, List::new());
        let mut indices: heapless::Vec<u16, MAX_MUTEXES> = heapless::Vec::new();
        owned.for_each(&self.mutexes, |idx| {
            let _ = indices.push(idx);
        });
        for idx in indices {
            let robust = self.mutexes.get_by_index(idx).map(|m| m.robust).unwrap_or(false);
            if robust {
                let m = self.mutexes.get_mut_by_index(idx).unwrap();
                m.owner = None;
                m.recursion = 0;
                let mut waiters = core::mem::replace(&mut m.waiters, List::new());
                while let Some(waiter) = waiters.pop_front(&mut self.threads) {
                    self.thread_wait_exit(waiter, Status::ErrorResource as i32, false);
                }
                log::warn!("mutex {} left inconsistent by terminated owner {:?}", idx, tid);
            } else {
                self.mutex_transfer_or_release(idx, tid);
            }
        }
        self.dispatch(None);
    }
}

fn status_from_raw(raw: i32) -> Status {
    match raw {
        x if x == Status::ErrorTimeout as i32 => Status::ErrorTimeout,
        x if x == Status::ErrorResource as i32 => Status::ErrorResource,
        _ => Status::Error,
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::kernel::Kernel;
    use crate::port::TestPort;
    use crate::thread::ThreadState;
    use std::boxed::Box;
    use std::vec;

    fn leak_stack() -> &'static mut [u8] {
        Box::leak(vec![0u8; 256].into_boxed_slice())
    }

    extern "C" fn noop_entry(_arg: usize) {}

    /// Boot a kernel with its mandatory system threads and suspend the
    /// (highest-priority) timer thread so application threads can be
    /// scheduled freely.
    fn boot() -> Kernel<TestPort> {
        let mut k = Kernel::new(TestPort::new());
        k.initialize().unwrap();
        k.start(leak_stack(), noop_entry, leak_stack(), noop_entry).unwrap();
        let timer_id = k.thread_get_id().unwrap();
        k.thread_suspend(timer_id).unwrap();
        pump(&mut k);
        k
    }

    fn pump(k: &mut Kernel<TestPort>) {
        if k.port().take_pending() {
            k.pendable_handler();
        }
    }

    #[test]
    fn acquire_release_round_trip() {
        let mut k = boot();
        let a = k.thread_new("a", noop_entry, 0, 1, leak_stack(), false).unwrap();
        pump(&mut k);
        assert_eq!(k.thread_get_state(a).unwrap(), ThreadState::Running);

        let h = k.mutex_new(true, false, false).unwrap();
        assert_eq!(k.mutex_get_owner(h).unwrap(), None);

        k.mutex_acquire(h, 0).unwrap();
        assert_eq!(k.mutex_get_owner(h).unwrap(), Some(a));

        k.mutex_release(h).unwrap();
        assert_eq!(k.mutex_get_owner(h).unwrap(), None);
    }

    #[test]
    fn double_lock_non_recursive_by_other_thread_is_blocking() {
        let mut k = boot();
        let l = k.thread_new("l", noop_entry, 0, 1, leak_stack(), false).unwrap();
        pump(&mut k);
        assert_eq!(k.thread_get_state(l).unwrap(), ThreadState::Running);

        let h = k.mutex_new(false, false, false).unwrap();
        k.mutex_acquire(h, 0).unwrap();
        assert_eq!(k.mutex_get_owner(h).unwrap(), Some(l));

        let o = k.thread_new("o", noop_entry, 0, 2, leak_stack(), false).unwrap();
        pump(&mut k);
        assert_eq!(k.thread_get_state(o).unwrap(), ThreadState::Running);

        let _ = k.mutex_acquire(h, 1000);
        assert_eq!(k.thread_get_state(o).unwrap(), ThreadState::Blocked(BlockKind::Mutex));
        assert_eq!(k.mutex_get_owner(h).unwrap(), Some(l));
    }

    #[test]
    fn same_owner_relock_without_recursive_is_resource_error() {
        let mut k = boot();
        let l = k.thread_new("l", noop_entry, 0, 1, leak_stack(), false).unwrap();
        pump(&mut k);
        assert_eq!(k.thread_get_state(l).unwrap(), ThreadState::Running);

        let h = k.mutex_new(false, false, false).unwrap();
        k.mutex_acquire(h, 0).unwrap();
        assert_eq!(k.mutex_acquire(h, 0), Err(Status::ErrorResource));
    }

    #[test]
    fn delete_then_acquire_is_parameter_error() {
        let mut k = Kernel::new(TestPort::new());
        let h = k.mutex_new(true, false, false).unwrap();
        k.mutex_delete(h).unwrap();
        assert_eq!(k.mutex_get_owner(h), Err(Status::ErrorParameter));
    }
}
