//! Thread flags: the per-thread counterpart to [`super::event_flags`]
//! (spec §4.8). Exactly one thread can ever be waiting on a given
//! thread's flags (itself), so unlike event flags there is no wait
//! queue to scan — `Set` only ever has to check the one target thread.

use crate::error::{KernelResult, Status};
use crate::kernel::Kernel;
use crate::object::{ObjectFlags, ObjectKind, ObjectRef};
use crate::port::Port;
use crate::thread::{BlockKind, FlagsOptions, ThreadId, ThreadState, WaitInfo};

impl<P: Port> Kernel<P> {
    /// OR `flags` into `target`'s word and, if `target` is currently
    /// blocked waiting on a now-satisfied condition, wake it. Callable
    /// from ISR context (deferred through the post queue, same as every
    /// other ISR-safe `Set`/`Release`/`Put`).
    pub fn thread_flags_set(&mut self, target: ThreadId, flags: u32) -> KernelResult<u32> {
        let from_isr = self.port.irq_in_handler();
        let t = self.threads.get_mut(target).ok_or(Status::ErrorParameter)?;
        t.thread_flags |= flags;
        let result = t.thread_flags;
        let is_waiting_flags = matches!(t.state, ThreadState::Blocked(BlockKind::ThreadFlags));
        if !is_waiting_flags {
            return Ok(result);
        }
        if from_isr {
            t.object_flags.insert(ObjectFlags::POST_PROC);
            self.post_queue_request(ObjectRef { kind: ObjectKind::Thread, index: target.index });
            return Ok(result);
        }
        self.thread_flags_try_wake(target);
        Ok(result)
    }

    /// Clear `mask` bits from the *calling* thread's own flags, returning
    /// the value prior to clearing.
    pub fn thread_flags_clear(&mut self, mask: u32) -> KernelResult<u32> {
        let tid = self.run_curr.ok_or(Status::Error)?;
        let t = self.threads.get_mut_by_index(tid.index).ok_or(Status::ErrorParameter)?;
        let prev = t.thread_flags;
        t.thread_flags &= !mask;
        Ok(prev)
    }

    pub fn thread_flags_get(&self) -> KernelResult<u32> {
        let tid = self.run_curr.ok_or(Status::Error)?;
        self.threads.get_by_index(tid.index).map(|t| t.thread_flags).ok_or(Status::ErrorParameter)
    }

    /// Block the calling thread until its own flags satisfy
    /// `(options, mask)`, or until `timeout` elapses.
    pub fn thread_flags_wait(&mut self, options: FlagsOptions, mask: u32, timeout: u32) -> KernelResult<u32> {
        if self.port.irq_in_handler() {
            return Err(Status::ErrorIsr);
        }
        let tid = self.run_curr.ok_or(Status::Error)?;
        {
            let t = self.threads.get_mut_by_index(tid.index).ok_or(Status::ErrorParameter)?;
            if options.matches(t.thread_flags, mask) {
                let matched = t.thread_flags & mask;
                if options.auto_clear {
                    t.thread_flags &= !matched;
                }
                return Ok(matched);
            }
        }
        if timeout == 0 {
            return Err(Status::ErrorResource);
        }
        self.threads.get_mut_by_index(tid.index).unwrap().wait_info = WaitInfo::ThreadFlags { options, mask };
        crate::sched::enter_wait_self(&mut self.threads, &mut self.ready_list, &mut self.ready_bmp, &mut self.delay_list, self.tick, tid, BlockKind::ThreadFlags, timeout);
        self.dispatch(None);
        let ret = self.running_ret_val();
        if ret >= 0 {
            Ok(ret as u32)
        } else {
            Err(status_from_raw(ret))
        }
    }

    fn thread_flags_try_wake(&mut self, tid: ThreadId) {
        let wi = self.threads.get_by_index(tid.index).map(|t| t.wait_info);
        if let Some(WaitInfo::ThreadFlags { options, mask }) = wi {
            let flags_now = self.threads.get_by_index(tid.index).unwrap().thread_flags;
            if options.matches(flags_now, mask) {
                let matched = flags_now & mask;
                if options.auto_clear {
                    self.threads.get_mut_by_index(tid.index).unwrap().thread_flags &= !matched;
                }
                self.thread_wait_exit(tid, matched as i32, true);
            }
        }
    }

    pub(crate) fn thread_flags_post_process(&mut self, index: u16) {
        if self.threads.get_by_index(index).is_none() {
            return;
        }
        self.threads.get_mut_by_index(index).unwrap().object_flags.remove(ObjectFlags::POST_PROC);
        self.thread_flags_try_wake(ThreadId::from_index_unchecked(index));
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
    use std::boxed::Box;
    use std::vec;

    fn leak_stack() -> &'static mut [u8] {
        Box::leak(vec![0u8; 64].into_boxed_slice())
    }

    extern "C" fn noop_entry(_arg: usize) {}

    #[test]
    fn set_then_get_round_trip() {
        let mut k = Kernel::new(TestPort::new());
        let tid = k.thread_new("t", noop_entry, 0, 1, leak_stack(), false).unwrap();
        k.thread_flags_set(tid, 0b101).unwrap();
        assert_eq!(k.threads.get_by_index(tid.index).unwrap().thread_flags, 0b101);
    }
}
