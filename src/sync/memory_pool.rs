//! The user-visible `osMemoryPool` object: [`crate::mempool::MemoryPool`]
//! plus a wait queue, so `Alloc` can block when the pool is exhausted
//! (spec §4.2 "waking a waiter on `Free` is handled by the owning object,
//! not the pool itself").

use crate::config::MAX_MEMORY_POOLS;
use crate::error::{KernelResult, Status};
use crate::kernel::Kernel;
use crate::mempool::MemoryPool as RawPool;
use crate::object::{Handle, ObjectFlags, ObjectKind, ObjectRef, Slab};
use crate::port::Port;
use crate::queue::List;
use crate::thread::{BlockKind, ThreadId, WaitInfo};

pub struct MemoryPoolMarker;
pub type MemoryPoolHandle = Handle<MemoryPoolMarker>;
pub type MemoryPoolSlab = Slab<MemoryPool, MemoryPoolMarker, MAX_MEMORY_POOLS>;

pub struct MemoryPool {
    pub pool: RawPool,
    pub waiters: List<ThreadId>,
    pub flags: ObjectFlags,
}

impl<P: Port> Kernel<P> {
    pub fn memory_pool_new(&mut self, storage: &'static mut [u8], block_size: u32, max_blocks: u32) -> KernelResult<MemoryPoolHandle> {
        let pool = RawPool::new(storage, block_size, max_blocks)?;
        let mp = MemoryPool { pool, waiters: List::new(), flags: ObjectFlags::empty() };
        self.memory_pools.insert(mp).ok_or(Status::ErrorNoMemory)
    }

    pub fn memory_pool_delete(&mut self, handle: MemoryPoolHandle) -> KernelResult<()> {
        {
            let mp = self.memory_pools.get_mut(handle).ok_or(Status::ErrorParameter)?;
            let mut waiters = core::mem::replace(&mut mp.waiters, List::new());
            while let Some(tid) = waiters.pop_front(&mut self.threads) {
                self.thread_wait_exit(tid, Status::ErrorResource as i32, false);
            }
        }
        self.memory_pools.remove(handle);
        self.dispatch(None);
        Ok(())
    }

    /// Allocate a block, blocking (up to `timeout`) if the pool is
    /// exhausted. On success the returned pointer is `block_size` bytes,
    /// 4-byte aligned, and owned by the caller until `memory_pool_free`.
    pub fn memory_pool_alloc(&mut self, handle: MemoryPoolHandle, timeout: u32) -> KernelResult<*mut u8> {
        if self.port.irq_in_handler() {
            return Err(Status::ErrorIsr);
        }
        let index = handle.index;
        {
            let mp = self.memory_pools.get_mut(handle).ok_or(Status::ErrorParameter)?;
            if let Some(block) = mp.pool.alloc() {
                return Ok(mp.pool.block_mut(block).as_mut_ptr());
            }
        }
        if timeout == 0 {
            return Err(Status::ErrorResource);
        }
        let tid = self.run_curr.ok_or(Status::Error)?;
        {
            let mp = self.memory_pools.get_mut_by_index(index).ok_or(Status::ErrorParameter)?;
            crate::sched::enter_wait(
                &mut self.threads,
                &mut self.ready_list,
                &mut self.ready_bmp,
                &mut self.delay_list,
                self.tick,
                tid,
                BlockKind::MemoryPool,
                WaitInfo::MemoryPool { handle: index },
                timeout,
                &mut mp.waiters,
            );
        }
        self.dispatch(None);
        let ret = self.running_ret_val();
        if ret < 0 {
            return Err(status_from_raw(ret));
        }
        // A woken waiter's `ret_val` carries the allocated block's raw
        // address (always representable in 32 bits on this kernel's
        // 32-bit microcontroller targets), handed over directly by
        // `memory_pool_post_process`/`memory_pool_free` rather than
        // re-attempting allocation after rescheduling.
        Ok(ret as u32 as usize as *mut u8)
    }

    pub fn memory_pool_free(&mut self, handle: MemoryPoolHandle, block: *mut u8) -> KernelResult<()> {
        let index = handle.index;
        let from_isr = self.port.irq_in_handler();
        let mp = self.memory_pools.get_mut(handle).ok_or(Status::ErrorParameter)?;
        let block_index = mp.pool.index_of_ptr(block).ok_or(Status::ErrorParameter)?;
        mp.pool.free(block_index);
        if !mp.waiters.is_empty() {
            if from_isr {
                mp.flags.insert(ObjectFlags::POST_PROC);
                self.post_queue_request(ObjectRef { kind: ObjectKind::MemoryPool, index });
                return Ok(());
            }
            self.memory_pool_wake_one(index);
        }
        Ok(())
    }

    fn memory_pool_wake_one(&mut self, index: u16) {
        let mp = match self.memory_pools.get_mut_by_index(index) {
            Some(mp) => mp,
            None => return,
        };
        let Some(tid) = mp.waiters.pop_front(&mut self.threads) else { return };
        let Some(block) = mp.pool.alloc() else {
            // Lost the race (shouldn't happen under the global lock, but
            // stay defensive): put the waiter back at the front.
            self.memory_pools.get_mut_by_index(index).unwrap().waiters.push_back(&mut self.threads, tid);
            return;
        };
        let ptr = self.memory_pools.get_mut_by_index(index).unwrap().pool.block_mut(block).as_mut_ptr();
        self.thread_wait_exit(tid, ptr as usize as i32, true);
    }

    pub(crate) fn memory_pool_post_process(&mut self, index: u16) {
        if let Some(mp) = self.memory_pools.get_mut_by_index(index) {
            mp.flags.remove(ObjectFlags::POST_PROC);
        }
        self.memory_pool_wake_one(index);
    }

    pub fn memory_pool_get_capacity(&self, handle: MemoryPoolHandle) -> KernelResult<u32> {
        self.memory_pools.get(handle).map(|m| m.pool.capacity()).ok_or(Status::ErrorParameter)
    }

    pub fn memory_pool_get_block_size(&self, handle: MemoryPoolHandle) -> KernelResult<u32> {
        self.memory_pools.get(handle).map(|m| m.pool.block_size()).ok_or(Status::ErrorParameter)
    }

    pub fn memory_pool_get_count(&self, handle: MemoryPoolHandle) -> KernelResult<u32> {
        self.memory_pools.get(handle).map(|m| m.pool.used_count()).ok_or(Status::ErrorParameter)
    }

    pub fn memory_pool_get_space(&self, handle: MemoryPoolHandle) -> KernelResult<u32> {
        self.memory_pools.get(handle).map(|m| m.pool.free_count()).ok_or(Status::ErrorParameter)
    }
}

fn status_from_raw(raw: i32) -> Status {
    match raw {
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

    fn leak_storage(size: usize) -> &'static mut [u8] {
        Box::leak(vec![0u8; size].into_boxed_slice())
    }

    #[test]
    fn alloc_free_round_trip() {
        let mut k = Kernel::new(TestPort::new());
        let h = k.memory_pool_new(leak_storage(4 * 4), 4, 4).unwrap();
        let p = k.memory_pool_alloc(h, 0).unwrap();
        assert_eq!(k.memory_pool_get_count(h).unwrap(), 1);
        k.memory_pool_free(h, p).unwrap();
        assert_eq!(k.memory_pool_get_count(h).unwrap(), 0);
    }

    #[test]
    fn exhaustion_with_zero_timeout_is_resource_error() {
        let mut k = Kernel::new(TestPort::new());
        let h = k.memory_pool_new(leak_storage(4), 4, 1).unwrap();
        k.memory_pool_alloc(h, 0).unwrap();
        assert_eq!(k.memory_pool_alloc(h, 0).err(), Some(Status::ErrorResource));
    }
}
