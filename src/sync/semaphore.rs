//! Counting semaphore (spec §4.10).

use crate::config::MAX_SEMAPHORES;
use crate::error::{KernelResult, Status};
use crate::kernel::Kernel;
use crate::object::{Handle, ObjectFlags, ObjectKind, ObjectRef, Slab};
use crate::port::Port;
use crate::queue::List;
use crate::thread::{BlockKind, ThreadId, WaitInfo};

pub struct SemaphoreMarker;
pub type SemaphoreHandle = Handle<SemaphoreMarker>;
pub type SemaphoreSlab = Slab<Semaphore, SemaphoreMarker, MAX_SEMAPHORES>;

pub struct Semaphore {
    pub count: u32,
    pub max_count: u32,
    pub waiters: List<ThreadId>,
    pub flags: ObjectFlags,
}

impl<P: Port> Kernel<P> {
    pub fn semaphore_new(&mut self, initial_count: u32, max_count: u32) -> KernelResult<SemaphoreHandle> {
        if max_count == 0 || initial_count > max_count {
            return Err(Status::ErrorParameter);
        }
        let sem = Semaphore { count: initial_count, max_count, waiters: List::new(), flags: ObjectFlags::empty() };
        self.semaphores.insert(sem).ok_or(Status::ErrorNoMemory)
    }

    pub fn semaphore_delete(&mut self, handle: SemaphoreHandle) -> KernelResult<()> {
        let index = handle.index;
        {
            let sem = self.semaphores.get_mut(handle).ok_or(Status::ErrorParameter)?;
            let mut waiters = core::mem::replace(&mut sem.waiters, List::new());
            while let Some(tid) = waiters.pop_front(&mut self.threads) {
                self.thread_wait_exit(tid, Status::ErrorResource as i32, false);
            }
        }
        self.semaphores.remove(handle);
        let _ = index;
        self.dispatch(None);
        Ok(())
    }

    pub fn semaphore_acquire(&mut self, handle: SemaphoreHandle, timeout: u32) -> KernelResult<()> {
        if self.port.irq_in_handler() {
            return Err(Status::ErrorIsr);
        }
        let index = handle.index;
        {
            let sem = self.semaphores.get_mut(handle).ok_or(Status::ErrorParameter)?;
            if sem.count > 0 {
                sem.count -= 1;
                return Ok(());
            }
        }
        if timeout == 0 {
            return Err(Status::ErrorResource);
        }
        let tid = self.run_curr.ok_or(Status::Error)?;
        {
            let sem = self.semaphores.get_mut_by_index(index).ok_or(Status::ErrorParameter)?;
            crate::sched::enter_wait(
                &mut self.threads,
                &mut self.ready_list,
                &mut self.ready_bmp,
                &mut self.delay_list,
                self.tick,
                tid,
                BlockKind::Semaphore,
                WaitInfo::Semaphore { handle: index },
                timeout,
                &mut sem.waiters,
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

    pub fn semaphore_release(&mut self, handle: SemaphoreHandle) -> KernelResult<()> {
        let index = handle.index;
        let from_isr = self.port.irq_in_handler();
        let sem = self.semaphores.get_mut(handle).ok_or(Status::ErrorParameter)?;
        if !sem.waiters.is_empty() {
            if from_isr {
                sem.flags.insert(ObjectFlags::POST_PROC);
                self.post_queue_request(ObjectRef { kind: ObjectKind::Semaphore, index });
                return Ok(());
            }
            let tid = sem.waiters.pop_front(&mut self.threads).unwrap();
            self.thread_wait_exit(tid, Status::Ok as i32, true);
            return Ok(());
        }
        if sem.count >= sem.max_count {
            return Err(Status::ErrorResource);
        }
        sem.count += 1;
        Ok(())
    }

    pub fn semaphore_get_count(&self, handle: SemaphoreHandle) -> KernelResult<u32> {
        self.semaphores.get(handle).map(|s| s.count).ok_or(Status::ErrorParameter)
    }

    /// ISR post-processing: wake the head waiter, handing over the token
    /// without incrementing `count` (mirrors `semaphore_release`'s direct
    /// hand-off path).
    pub(crate) fn semaphore_post_process(&mut self, index: u16) {
        if let Some(sem) = self.semaphores.get_mut_by_index(index) {
            sem.flags.remove(ObjectFlags::POST_PROC);
            if let Some(tid) = sem.waiters.pop_front(&mut self.threads) {
                self.thread_wait_exit(tid, Status::Ok as i32, true);
            }
        }
    }
}

fn status_from_raw(raw: i32) -> Status {
    match raw {
        x if x == Status::Ok as i32 => Status::Ok,
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
    fn acquire_release_round_trip() {
        let mut k = Kernel::new(TestPort::new());
        let h = k.semaphore_new(1, 1).unwrap();
        k.semaphore_acquire(h, 0).unwrap();
        assert_eq!(k.semaphore_get_count(h).unwrap(), 0);
        k.semaphore_release(h).unwrap();
        assert_eq!(k.semaphore_get_count(h).unwrap(), 1);
    }

    #[test]
    fn over_release_is_resource_error() {
        let mut k = Kernel::new(TestPort::new());
        let h = k.semaphore_new(1, 1).unwrap();
        assert_eq!(k.semaphore_release(h), Err(Status::ErrorResource));
    }

    #[test]
    fn zero_timeout_acquire_on_empty_is_resource_error() {
        let mut k = Kernel::new(TestPort::new());
        let h = k.semaphore_new(0, 1).unwrap();
        assert_eq!(k.semaphore_acquire(h, 0), Err(Status::ErrorResource));
    }

    #[test]
    fn delete_then_acquire_is_parameter_error() {
        let mut k = Kernel::new(TestPort::new());
        let h = k.semaphore_new(1, 1).unwrap();
        k.semaphore_delete(h).unwrap();
        assert_eq!(k.semaphore_acquire(h, 0), Err(Status::ErrorParameter));
    }
}
