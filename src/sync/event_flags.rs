//! Event flags: a shared 32-bit flag word with `AnyOf`/`AllOf`/`AutoClear`
//! wait semantics (spec §4.9).
//!
//! Unlike thread flags, any number of threads may wait on the same event
//! flags object at once, so `Set` evaluates every waiter in FIFO order
//! instead of touching at most one thread.

use crate::config::MAX_EVENT_FLAGS;
use crate::error::{KernelResult, Status};
use crate::kernel::Kernel;
use crate::object::{Handle, ObjectFlags, ObjectKind, ObjectRef, Slab};
use crate::port::Port;
use crate::queue::List;
use crate::thread::{BlockKind, FlagsOptions, ThreadId, WaitInfo};

pub struct EventFlagsMarker;
pub type EventFlagsHandle = Handle<EventFlagsMarker>;
pub type EventFlagsSlab = Slab<EventFlags, EventFlagsMarker, MAX_EVENT_FLAGS>;

pub struct EventFlags {
    pub flags: u32,
    pub waiters: List<ThreadId>,
    pub object_flags: ObjectFlags,
}

impl<P: Port> Kernel<P> {
    pub fn event_flags_new(&mut self) -> KernelResult<EventFlagsHandle> {
        let ef = EventFlags { flags: 0, waiters: List::new(), object_flags: ObjectFlags::empty() };
        self.event_flags.insert(ef).ok_or(Status::ErrorNoMemory)
    }

    pub fn event_flags_delete(&mut self, handle: EventFlagsHandle) -> KernelResult<()> {
        {
            let ef = self.event_flags.get_mut(handle).ok_or(Status::ErrorParameter)?;
            let mut waiters = core::mem::replace(&mut ef.waiters, List::new());
            while let Some(tid) = waiters.pop_front(&mut self.threads) {
                self.thread_wait_exit(tid, Status::ErrorResource as i32, false);
            }
        }
        self.event_flags.remove(handle);
        self.dispatch(None);
        Ok(())
    }

    /// OR `flags` into the group, then wake every waiter (in FIFO order)
    /// whose condition is now satisfied, clearing only the bits each
    /// woken waiter actually consumed. Returns the resulting flags value.
    pub fn event_flags_set(&mut self, handle: EventFlagsHandle, flags: u32) -> KernelResult<u32> {
        let index = handle.index;
        let from_isr = self.port.irq_in_handler();
        let ef = self.event_flags.get_mut(handle).ok_or(Status::ErrorParameter)?;
        ef.flags |= flags;
        if from_isr {
            if !ef.waiters.is_empty() {
                ef.object_flags.insert(ObjectFlags::POST_PROC);
                self.post_queue_request(ObjectRef { kind: ObjectKind::EventFlags, index });
            }
            return Ok(self.event_flags.get(handle).unwrap().flags);
        }
        self.event_flags_scan_waiters(index);
        Ok(self.event_flags.get_by_index(index).unwrap().flags)
    }

    pub fn event_flags_clear(&mut self, handle: EventFlagsHandle, mask: u32) -> KernelResult<u32> {
        let ef = self.event_flags.get_mut(handle).ok_or(Status::ErrorParameter)?;
        let prev = ef.flags;
        ef.flags &= !mask;
        Ok(prev)
    }

    pub fn event_flags_get(&self, handle: EventFlagsHandle) -> KernelResult<u32> {
        self.event_flags.get(handle).map(|e| e.flags).ok_or(Status::ErrorParameter)
    }

    pub fn event_flags_wait(&mut self, handle: EventFlagsHandle, options: FlagsOptions, mask: u32, timeout: u32) -> KernelResult<u32> {
        if self.port.irq_in_handler() {
            return Err(Status::ErrorIsr);
        }
        let index = handle.index;
        {
            let ef = self.event_flags.get_mut(handle).ok_or(Status::ErrorParameter)?;
            if options.matches(ef.flags, mask) {
                let matched = ef.flags & mask;
                if options.auto_clear {
                    ef.flags &= !matched;
                }
                return Ok(matched);
            }
        }
        if timeout == 0 {
            return Err(Status::ErrorResource);
        }
        let tid = self.run_curr.ok_or(Status::Error)?;
        {
            let ef = self.event_flags.get_mut_by_index(index).ok_or(Status::ErrorParameter)?;
            crate::sched::enter_wait(
                &mut self.threads,
                &mut self.ready_list,
                &mut self.ready_bmp,
                &mut self.delay_list,
                self.tick,
                tid,
                BlockKind::EventFlags,
                WaitInfo::EventFlags { handle: index, options, mask },
                timeout,
                &mut ef.waiters,
            );
        }
        self.dispatch(None);
        let ret = self.running_ret_val();
        if ret >= 0 {
            Ok(ret as u32)
        } else {
            Err(status_from_raw(ret))
        }
    }

    /// Walk `waiters` front to back, waking and removing each thread
    /// whose `(options, mask)` is now satisfied by the current flags
    /// value, clearing only the bits it consumed before evaluating the
    /// next waiter. Re-fetches state by index every step rather than
    /// holding a field reference across the loop, since waking a waiter
    /// needs `&mut self.threads` alongside `&mut self.event_flags`.
    fn event_flags_scan_waiters(&mut self, index: u16) {
        let mut woken: heapless::Vec<(ThreadId, i32), { crate::config::MAX_THREADS }> = heapless::Vec::new();
        let mut cur = match self.event_flags.get_by_index(index) {
            Some(e) => e.waiters.front(),
            None => return,
        };
        while let Some(tid) = cur {
            let next = self.threads.get_by_index(tid.index).and_then(|t| t.thread_links.next);
            let wi = self.threads.get_by_index(tid.index).map(|t| t.wait_info);
            if let Some(WaitInfo::EventFlags { options, mask, .. }) = wi {
                let flags_now = self.event_flags.get_by_index(index).unwrap().flags;
                if options.matches(flags_now, mask) {
                    let matched = flags_now & mask;
                    if options.auto_clear {
                        self.event_flags.get_mut_by_index(index).unwrap().flags &= !matched;
                    }
                    self.event_flags.get_mut_by_index(index).unwrap().waiters.remove(&mut self.threads, tid);
                    let _ = woken.push((tid, matched as i32));
                }
            }
            cur = next;
        }
        for (tid, ret) in woken {
            self.thread_wait_exit(tid, ret, false);
        }
        self.dispatch(None);
    }

    pub(crate) fn event_flags_post_process(&mut self, index: u16) {
        if let Some(ef) = self.event_flags.get_mut_by_index(index) {
            ef.object_flags.remove(ObjectFlags::POST_PROC);
        }
        self.event_flags_scan_waiters(index);
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
    use super::*;
    use crate::kernel::Kernel;
    use crate::port::TestPort;

    #[test]
    fn set_then_wait_any_consumes_matched_bits_only() {
        let mut k = Kernel::new(TestPort::new());
        let h = k.event_flags_new().unwrap();
        k.event_flags_set(h, 0b0110).unwrap();
        let got = k.event_flags_wait(h, FlagsOptions::any(), 0b0010, 0).unwrap();
        assert_eq!(got, 0b0010);
        assert_eq!(k.event_flags_get(h).unwrap(), 0b0100);
    }

    #[test]
    fn wait_all_requires_full_mask() {
        let mut k = Kernel::new(TestPort::new());
        let h = k.event_flags_new().unwrap();
        k.event_flags_set(h, 0b0100).unwrap();
        assert_eq!(k.event_flags_wait(h, FlagsOptions::all(), 0b0110, 0), Err(Status::ErrorResource));
    }

    #[test]
    fn delete_wakes_waiter_with_resource_error() {
        let mut k = Kernel::new(TestPort::new());
        let h = k.event_flags_new().unwrap();
        k.event_flags_delete(h).unwrap();
        assert_eq!(k.event_flags_get(h), Err(Status::ErrorParameter));
    }
}
