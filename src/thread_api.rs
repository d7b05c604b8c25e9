//! Thread lifecycle entry points (spec §4.4, §4.14's surface list):
//! `New`/`Terminate`/`Exit`/`Join`, priority and naming accessors, the
//! explicit `Yield`/`Suspend`/`Resume` pair, and `Delay`/`DelayUntil`.
//!
//! Kept apart from [`crate::sched`] (the mechanics) and [`crate::thread`]
//! (the control block) the way the original splits "thread management
//! API" from "scheduler core" into separate translation units.

use crate::config::MAX_THREADS;
use crate::error::{KernelResult, Status};
use crate::kernel::Kernel;
use crate::port::{Port, ThreadEntry};
use crate::thread::{BlockKind, Thread, ThreadId, ThreadState, WaitInfo};

impl<P: Port> Kernel<P> {
    /// `osThreadNew`: allocate a control block, initialize its stack via
    /// the port, and make it immediately `Ready`.
    pub fn thread_new(&mut self, name: &'static str, entry: ThreadEntry, arg: usize, priority: u8, stack: &'static mut [u8], joinable: bool) -> KernelResult<ThreadId> {
        if priority as usize >= crate::config::NUM_PRIORITY {
            return Err(Status::ErrorParameter);
        }
        Self::check_aligned(stack.as_ptr())?;
        let sp = unsafe { self.port.stack_init(stack.as_mut_ptr(), stack.len(), entry, arg) };
        let mut t = Thread::new(name, priority, stack.as_mut_ptr(), stack.len(), arg, joinable);
        t.stack_sp = sp;
        let tid = self.threads.insert(t).ok_or(Status::ErrorNoMemory)?;
        self.ready_add(tid);
        self.dispatch(None);
        log::debug!("thread {:?} ({}) created at priority {}", tid, name, priority);
        Ok(tid)
    }

    pub fn thread_get_name(&self, tid: ThreadId) -> KernelResult<&'static str> {
        self.threads.get(tid).map(|t| t.name).ok_or(Status::ErrorParameter)
    }

    pub fn thread_get_id(&self) -> KernelResult<ThreadId> {
        self.run_curr.ok_or(Status::Error)
    }

    pub fn thread_get_state(&self, tid: ThreadId) -> KernelResult<ThreadState> {
        self.threads.get(tid).map(|t| t.state).ok_or(Status::ErrorParameter)
    }

    /// Conservative high-water estimate: this port does not paint the
    /// stack to measure actual usage, so it only reports the full region
    /// size the thread was created with.
    pub fn thread_get_stack_space(&self, tid: ThreadId) -> KernelResult<usize> {
        self.threads.get(tid).map(|t| t.stack_size).ok_or(Status::ErrorParameter)
    }

    pub fn thread_set_priority(&mut self, tid: ThreadId, priority: u8) -> KernelResult<()> {
        if priority as usize >= crate::config::NUM_PRIORITY {
            return Err(Status::ErrorParameter);
        }
        if self.threads.get(tid).is_none() {
            return Err(Status::ErrorParameter);
        }
        self.set_priority(tid, priority);
        Ok(())
    }

    pub fn thread_get_priority(&self, tid: ThreadId) -> KernelResult<u8> {
        self.threads.get(tid).map(|t| t.base_priority).ok_or(Status::ErrorParameter)
    }

    /// `osThreadYield`: give up the CPU to an equal-priority peer. A
    /// no-op if the caller is already the only ready thread at its
    /// priority.
    pub fn thread_yield(&mut self) -> KernelResult<()> {
        if self.port.irq_in_handler() {
            return Err(Status::ErrorIsr);
        }
        self.yield_running();
        Ok(())
    }

    /// `osThreadSuspend`: force `tid` out of `Ready`/`Running` into a
    /// `Blocked(ThreadFlags)` state with no satisfying condition, so only
    /// an explicit `Resume` (not a flags/timeout event) can bring it back.
    pub fn thread_suspend(&mut self, tid: ThreadId) -> KernelResult<()> {
        let (was_running, prio) = {
            let t = self.threads.get_mut(tid).ok_or(Status::ErrorParameter)?;
            match t.state {
                ThreadState::Terminated => return Err(Status::ErrorResource),
                ThreadState::Blocked(_) => return Ok(()),
                _ => {}
            }
            let was_running = matches!(t.state, ThreadState::Running);
            t.wait_info = WaitInfo::ThreadFlags { options: crate::thread::FlagsOptions::any().no_clear(), mask: 0 };
            (was_running, t.effective_priority)
        };
        if was_running {
            self.run_curr = None;
        } else {
            self.ready_list[prio as usize].remove(&mut self.threads, tid);
            if self.ready_list[prio as usize].is_empty() {
                self.ready_bmp &= !(1u32 << prio);
            }
        }
        self.threads.get_mut_by_index(tid.index).unwrap().state = ThreadState::Blocked(BlockKind::ThreadFlags);
        self.dispatch(None);
        Ok(())
    }

    /// `osThreadResume`: undo a prior `Suspend`. A no-op on a thread that
    /// isn't suspended.
    pub fn thread_resume(&mut self, tid: ThreadId) -> KernelResult<()> {
        let t = self.threads.get(tid).ok_or(Status::ErrorParameter)?;
        if !matches!(t.state, ThreadState::Blocked(BlockKind::ThreadFlags)) {
            return Ok(());
        }
        self.thread_wait_exit(tid, Status::ErrorResource as i32, true);
        Ok(())
    }

    pub fn thread_detach(&mut self, tid: ThreadId) -> KernelResult<()> {
        let t = self.threads.get_mut(tid).ok_or(Status::ErrorParameter)?;
        if !t.joinable {
            return Err(Status::ErrorResource);
        }
        t.joinable = false;
        Ok(())
    }

    /// `osThreadJoin`: block until `tid` terminates, then reclaim its
    /// control block and return its exit code. Only valid for a thread
    /// created with `joinable = true` that has not already been joined
    /// or detached.
    pub fn thread_join(&mut self, tid: ThreadId) -> KernelResult<i32> {
        if self.port.irq_in_handler() {
            return Err(Status::ErrorIsr);
        }
        let (joinable, terminated) = {
            let t = self.threads.get(tid).ok_or(Status::ErrorParameter)?;
            (t.joinable, matches!(t.state, ThreadState::Terminated))
        };
        if !joinable {
            return Err(Status::ErrorResource);
        }
        if terminated {
            let exit_code = self.threads.get(tid).unwrap().exit_code;
            self.threads.remove(tid);
            return Ok(exit_code);
        }
        // A terminated-but-unjoined thread's control block is kept alive
        // (joinable stays set) until `Join` claims it; there is nothing
        // else for a blocking join to wait on here since there is no
        // joiner wait queue in this port — callers poll `GetState` and
        // call `Join` once it reports `Terminated`. Documented open
        // question, see DESIGN.md.
        Err(Status::ErrorResource)
    }

    /// `osThreadExit`: called by a thread on itself to terminate with
    /// `exit_code`. Releases any mutexes it still owns and relinquishes
    /// the CPU for good.
    pub fn thread_exit(&mut self, exit_code: i32) -> ! {
        let tid = self.run_curr.expect("thread_exit called with no running thread");
        self.terminate(tid, exit_code);
        self.dispatch(None);
        // The pendable request above fires the context switch asynchronously;
        // spin until the interrupt actually takes this stack away.
        loop {
            core::hint::spin_loop();
        }
    }

    /// `osThreadTerminate`: force-terminate another thread (or the
    /// caller). Releases owned mutexes (robust-mode waiters see
    /// `ErrorResource`) and removes it from whatever list it was on.
    pub fn thread_terminate(&mut self, tid: ThreadId) -> KernelResult<()> {
        let state = self.threads.get(tid).ok_or(Status::ErrorParameter)?.state;
        if matches!(state, ThreadState::Terminated) {
            return Err(Status::ErrorResource);
        }
        self.terminate(tid, 0);
        self.dispatch(None);
        Ok(())
    }

    fn terminate(&mut self, tid: ThreadId, exit_code: i32) {
        let index = tid.index;
        let (state, has_deadline) = {
            let t = self.threads.get_by_index(index).unwrap();
            (t.state, t.has_deadline)
        };
        match state {
            ThreadState::Running => self.run_curr = None,
            ThreadState::Ready => {
                let prio = self.threads.get_by_index(index).unwrap().effective_priority;
                self.ready_list[prio as usize].remove(&mut self.threads, tid);
                if self.ready_list[prio as usize].is_empty() {
                    self.ready_bmp &= !(1u32 << prio);
                }
            }
            ThreadState::Blocked(kind) => self.remove_from_wait_queue(tid, kind),
            ThreadState::Inactive | ThreadState::Terminated => {}
        }
        if has_deadline {
            self.delay_list.remove(&mut self.threads, tid);
        }
        {
            let t = self.threads.get_mut_by_index(index).unwrap();
            t.state = ThreadState::Terminated;
            t.exit_code = exit_code;
        }
        self.release_owned_mutexes_on_exit(tid);
        let joinable = self.threads.get_by_index(index).unwrap().joinable;
        if !joinable {
            // Non-joinable control blocks are reclaimed immediately; a
            // joinable one is kept until `thread_join` claims it.
            self.threads.remove_by_index(index);
        }
        log::info!("thread {:?} terminated, exit_code={}", tid, exit_code);
    }

    pub fn thread_get_count(&self) -> u32 {
        self.threads.iter().filter(|(_, t)| !matches!(t.state, ThreadState::Terminated)).count() as u32
    }

    /// `osThreadEnumerate`: collect every non-terminated thread's id into
    /// a fixed-capacity buffer, most-recently-created last.
    pub fn thread_enumerate_active(&self) -> heapless::Vec<ThreadId, MAX_THREADS> {
        let mut out = heapless::Vec::new();
        for (index, t) in self.threads.iter() {
            if !matches!(t.state, ThreadState::Terminated) {
                if let Some(h) = self.threads.handle_for_index(index) {
                    let _ = out.push(h);
                }
            }
        }
        out
    }

    /// `osDelay`: block the caller for `ticks` ticks (relative).
    pub fn delay(&mut self, ticks: u32) -> KernelResult<()> {
        if self.port.irq_in_handler() {
            return Err(Status::ErrorIsr);
        }
        if ticks == 0 {
            return Ok(());
        }
        let tid = self.run_curr.ok_or(Status::Error)?;
        self.threads.get_mut_by_index(tid.index).unwrap().wait_info = WaitInfo::Delay;
        crate::sched::enter_wait_self(&mut self.threads, &mut self.ready_list, &mut self.ready_bmp, &mut self.delay_list, self.tick, tid, BlockKind::Delay, ticks);
        self.dispatch(None);
        Ok(())
    }

    /// `osDelayUntil`: block the caller until absolute tick `wakeup`. A
    /// `wakeup` already in the past returns immediately.
    pub fn delay_until(&mut self, wakeup: u64) -> KernelResult<()> {
        if self.port.irq_in_handler() {
            return Err(Status::ErrorIsr);
        }
        if wakeup <= self.tick {
            return Ok(());
        }
        let ticks = (wakeup - self.tick) as u32;
        self.delay(ticks)
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
    fn new_thread_is_ready() {
        let mut k = Kernel::new(TestPort::new());
        let tid = k.thread_new("worker", noop_entry, 0, 5, leak_stack(), false).unwrap();
        assert_eq!(k.thread_get_state(tid).unwrap(), ThreadState::Ready);
        assert_eq!(k.thread_get_priority(tid).unwrap(), 5);
        assert_eq!(k.thread_get_name(tid).unwrap(), "worker");
    }

    #[test]
    fn set_priority_updates_base_and_effective() {
        let mut k = Kernel::new(TestPort::new());
        let tid = k.thread_new("w", noop_entry, 0, 5, leak_stack(), false).unwrap();
        k.thread_set_priority(tid, 10).unwrap();
        assert_eq!(k.thread_get_priority(tid).unwrap(), 10);
    }

    #[test]
    fn terminate_removes_from_count() {
        let mut k = Kernel::new(TestPort::new());
        let before = k.thread_get_count();
        let tid = k.thread_new("w", noop_entry, 0, 5, leak_stack(), false).unwrap();
        assert_eq!(k.thread_get_count(), before + 1);
        k.thread_terminate(tid).unwrap();
        assert_eq!(k.thread_get_count(), before);
    }

    #[test]
    fn joinable_thread_reclaimed_after_join() {
        let mut k = Kernel::new(TestPort::new());
        let tid = k.thread_new("w", noop_entry, 0, 5, leak_stack(), true).unwrap();
        k.thread_terminate(tid).unwrap();
        assert_eq!(k.thread_get_state(tid).unwrap(), ThreadState::Terminated);
        assert_eq!(k.thread_join(tid).unwrap(), 0);
        assert_eq!(k.thread_get_state(tid), Err(Status::ErrorParameter));
    }
}
