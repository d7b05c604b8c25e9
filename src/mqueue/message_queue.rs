//! Priority-ordered message queue (spec §4.12).
//!
//! Slot storage is a [`crate::mempool::MemoryPool`] sized `round_up(msg_size,
//! 4) + 8`; the extra 8 bytes are a header this module threads through each
//! allocated block itself — `[next: u32][priority: u8][reserved: 3]` — the
//! same trick the underlying pool uses for its own free list, just on the
//! allocated side. `Put` inserts before the first existing element whose
//! priority is strictly lower than the new one; `priority == 0` always
//! lands at the tail, i.e. behaves as plain FIFO among zero-priority puts.

use crate::config::MAX_MESSAGE_QUEUES;
use crate::error::{KernelResult, Status};
use crate::kernel::Kernel;
use crate::mempool::{BlockIndex, MemoryPool};
use crate::object::{Handle, ObjectFlags, ObjectKind, ObjectRef, Slab};
use crate::port::Port;
use crate::queue::List;
use crate::thread::{BlockKind, ThreadId, WaitInfo};

const HEADER_LEN: usize = 8;

pub struct MessageQueueMarker;
pub type MessageQueueHandle = Handle<MessageQueueMarker>;
pub type MessageQueueSlab = Slab<MessageQueue, MessageQueueMarker, MAX_MESSAGE_QUEUES>;

pub struct MessageQueue {
    pool: MemoryPool,
    msg_size: u32,
    head: Option<BlockIndex>,
    tail: Option<BlockIndex>,
    pub producers: List<ThreadId>,
    pub consumers: List<ThreadId>,
    flags: ObjectFlags,
}

impl MessageQueue {
    fn header(&self, block: BlockIndex) -> (Option<BlockIndex>, u8) {
        let b = self.pool.block(block);
        let next = u32::from_ne_bytes(b[0..4].try_into().unwrap());
        let next = if next == u32::MAX { None } else { Some(BlockIndex::from_raw(next)) };
        (next, b[4])
    }

    fn set_header(&mut self, block: BlockIndex, next: Option<BlockIndex>, priority: u8) {
        let raw_next = next.map(BlockIndex::raw).unwrap_or(u32::MAX);
        let b = self.pool.block_mut(block);
        b[0..4].copy_from_slice(&raw_next.to_ne_bytes());
        b[4] = priority;
        b[5] = 0;
        b[6] = 0;
        b[7] = 0;
    }

    fn payload(&self, block: BlockIndex) -> &[u8] {
        &self.pool.block(block)[HEADER_LEN..]
    }

    fn payload_mut(&mut self, block: BlockIndex) -> &mut [u8] {
        &mut self.pool.block_mut(block)[HEADER_LEN..]
    }

    fn append_tail(&mut self, block: BlockIndex, priority: u8) {
        self.set_header(block, None, priority);
        match self.tail {
            Some(t) => {
                let (_, t_prio) = self.header(t);
                self.set_header(t, Some(block), t_prio);
            }
            None => self.head = Some(block),
        }
        self.tail = Some(block);
    }

    /// Insert before the first existing element whose priority is
    /// strictly lower than `priority`; `priority == 0` always appends.
    fn insert_sorted(&mut self, block: BlockIndex, priority: u8) {
        if priority == 0 || self.head.is_none() {
            self.append_tail(block, priority);
            return;
        }
        let mut prev: Option<BlockIndex> = None;
        let mut cur = self.head;
        while let Some(c) = cur {
            let (next, p) = self.header(c);
            if p < priority {
                break;
            }
            prev = Some(c);
            cur = next;
        }
        match prev {
            Some(p) => {
                let (p_next, p_prio) = self.header(p);
                self.set_header(p, Some(block), p_prio);
                self.set_header(block, p_next, priority);
                if p_next.is_none() {
                    self.tail = Some(block);
                }
            }
            None => {
                self.set_header(block, self.head, priority);
                self.head = Some(block);
            }
        }
    }

    fn pop_head(&mut self) -> Option<(BlockIndex, u8)> {
        let head = self.head?;
        let (next, prio) = self.header(head);
        self.head = next;
        if next.is_none() {
            self.tail = None;
        }
        Some((head, prio))
    }
}

fn round_up4(n: u32) -> u32 {
    (n + 3) & !3
}

impl<P: Port> Kernel<P> {
    pub fn message_queue_new(&mut self, storage: &'static mut [u8], msg_size: u32, capacity: u32) -> KernelResult<MessageQueueHandle> {
        let slot_size = round_up4(msg_size) + HEADER_LEN as u32;
        let pool = MemoryPool::new(storage, slot_size, capacity)?;
        let q = MessageQueue { pool, msg_size, head: None, tail: None, producers: List::new(), consumers: List::new(), flags: ObjectFlags::empty() };
        self.message_queues.insert(q).ok_or(Status::ErrorNoMemory)
    }

    pub fn message_queue_delete(&mut self, handle: MessageQueueHandle) -> KernelResult<()> {
        {
            let q = self.message_queues.get_mut(handle).ok_or(Status::ErrorParameter)?;
            let mut producers = core::mem::replace(&mut q.producers, List::new());
            while let Some(tid) = producers.pop_front(&mut self.threads) {
                self.thread_wait_exit(tid, Status::ErrorResource as i32, false);
            }
        }
        {
            let q = self.message_queues.get_mut_by_index(handle.index).unwrap();
            let mut consumers = core::mem::replace(&mut q.consumers, List::new());
            while let Some(tid) = consumers.pop_front(&mut self.threads) {
                self.thread_wait_exit(tid, Status::ErrorResource as i32, false);
            }
        }
        self.message_queues.remove(handle);
        self.dispatch(None);
        Ok(())
    }

    /// Send `msg_size` bytes from `data` at `priority`. From ISR, `timeout`
    /// must be 0; a direct hand-off to an already-waiting consumer is only
    /// attempted from thread context (an ISR may not touch a wait queue
    /// directly — see `message_queue_post_process`).
    pub fn message_queue_put(&mut self, handle: MessageQueueHandle, data: *const u8, priority: u8, timeout: u32) -> KernelResult<()> {
        let index = handle.index;
        let from_isr = self.port.irq_in_handler();
        if from_isr && timeout != 0 {
            return Err(Status::ErrorParameter);
        }
        let msg_size = self.message_queues.get(handle).ok_or(Status::ErrorParameter)?.msg_size as usize;

        if !from_isr {
            let consumer = self.message_queues.get_mut_by_index(index).unwrap().consumers.pop_front(&mut self.threads);
            if let Some(consumer) = consumer {
                let wi = self.threads.get_by_index(consumer.index).map(|t| t.wait_info);
                if let Some(WaitInfo::MessageGet { buffer, out_priority, .. }) = wi {
                    unsafe {
                        core::ptr::copy_nonoverlapping(data, buffer, msg_size);
                        if !out_priority.is_null() {
                            *out_priority = priority;
                        }
                    }
                    self.thread_wait_exit(consumer, Status::Ok as i32, true);
                    return Ok(());
                }
            }
        }

        let block = self.message_queues.get_mut_by_index(index).unwrap().pool.alloc();
        if let Some(block) = block {
            let q = self.message_queues.get_mut_by_index(index).unwrap();
            unsafe { core::ptr::copy_nonoverlapping(data, q.payload_mut(block).as_mut_ptr(), msg_size) };
            q.insert_sorted(block, priority);
            if from_isr && !q.consumers.is_empty() {
                q.flags.insert(ObjectFlags::POST_PROC);
                self.post_queue_request(ObjectRef { kind: ObjectKind::MessageQueue, index });
            }
            return Ok(());
        }

        if from_isr {
            return Err(Status::ErrorResource);
        }
        if timeout == 0 {
            return Err(Status::ErrorResource);
        }
        let tid = self.run_curr.ok_or(Status::Error)?;
        {
            let q = self.message_queues.get_mut_by_index(index).unwrap();
            crate::sched::enter_wait(&mut self.threads, &mut self.ready_list, &mut self.ready_bmp, &mut self.delay_list, self.tick, tid, BlockKind::QueuePut, WaitInfo::MessagePut { handle: index, buffer: data, priority }, timeout, &mut q.producers);
        }
        self.dispatch(None);
        let ret = self.running_ret_val();
        if ret == Status::Ok as i32 {
            Ok(())
        } else {
            Err(status_from_raw(ret))
        }
    }

    /// Receive into `buffer` (`msg_size` bytes), optionally writing the
    /// sender's priority to `out_priority` unless it is null.
    pub fn message_queue_get(&mut self, handle: MessageQueueHandle, buffer: *mut u8, out_priority: *mut u8, timeout: u32) -> KernelResult<()> {
        let index = handle.index;
        let from_isr = self.port.irq_in_handler();
        if from_isr && timeout != 0 {
            return Err(Status::ErrorParameter);
        }
        let msg_size = self.message_queues.get(handle).ok_or(Status::ErrorParameter)?.msg_size as usize;

        let popped = self.message_queues.get_mut_by_index(index).unwrap().pop_head();
        if let Some((block, priority)) = popped {
            let q = self.message_queues.get_mut_by_index(index).unwrap();
            unsafe {
                core::ptr::copy_nonoverlapping(q.payload(block).as_ptr(), buffer, msg_size);
                if !out_priority.is_null() {
                    *out_priority = priority;
                }
            }
            q.pool.free(block);
            if !q.producers.is_empty() {
                if from_isr {
                    q.flags.insert(ObjectFlags::POST_PROC);
                    self.post_queue_request(ObjectRef { kind: ObjectKind::MessageQueue, index });
                } else {
                    self.try_service_producer(index);
                }
            }
            return Ok(());
        }

        if from_isr {
            return Err(Status::ErrorResource);
        }
        if timeout == 0 {
            return Err(Status::ErrorResource);
        }
        let tid = self.run_curr.ok_or(Status::Error)?;
        {
            let q = self.message_queues.get_mut_by_index(index).unwrap();
            crate::sched::enter_wait(&mut self.threads, &mut self.ready_list, &mut self.ready_bmp, &mut self.delay_list, self.tick, tid, BlockKind::QueueGet, WaitInfo::MessageGet { handle: index, buffer, out_priority }, timeout, &mut q.consumers);
        }
        self.dispatch(None);
        let ret = self.running_ret_val();
        if ret == Status::Ok as i32 {
            Ok(())
        } else {
            Err(status_from_raw(ret))
        }
    }

    /// Drop every stored message and rebuild the slot pool, then
    /// re-admit waiting producers one at a time. Stops at the first
    /// producer that doesn't fit, leaving the rest blocked — this is the
    /// original's documented behavior, not a bug (see the design notes).
    pub fn message_queue_reset(&mut self, handle: MessageQueueHandle) -> KernelResult<()> {
        let index = handle.index;
        {
            let q = self.message_queues.get_mut(handle).ok_or(Status::ErrorParameter)?;
            q.head = None;
            q.tail = None;
            q.pool.reset();
        }
        while self.message_queues.get_by_index(index).map(|q| !q.producers.is_empty()).unwrap_or(false) {
            if !self.try_service_producer(index) {
                break;
            }
        }
        self.dispatch(None);
        Ok(())
    }

    pub fn message_queue_get_capacity(&self, handle: MessageQueueHandle) -> KernelResult<u32> {
        self.message_queues.get(handle).map(|q| q.pool.capacity()).ok_or(Status::ErrorParameter)
    }

    pub fn message_queue_get_msg_size(&self, handle: MessageQueueHandle) -> KernelResult<u32> {
        self.message_queues.get(handle).map(|q| q.msg_size).ok_or(Status::ErrorParameter)
    }

    pub fn message_queue_get_count(&self, handle: MessageQueueHandle) -> KernelResult<u32> {
        self.message_queues.get(handle).map(|q| q.pool.used_count()).ok_or(Status::ErrorParameter)
    }

    pub fn message_queue_get_space(&self, handle: MessageQueueHandle) -> KernelResult<u32> {
        self.message_queues.get(handle).map(|q| q.pool.free_count()).ok_or(Status::ErrorParameter)
    }

    /// Try to hand a message to a waiting consumer, then try to service a
    /// waiting producer; called repeatedly until neither makes progress.
    /// This is where a Put/Get deferred from ISR context actually
    /// completes the hand-off the ISR itself was not allowed to perform.
    pub(crate) fn message_queue_post_process(&mut self, index: u16) {
        if let Some(q) = self.message_queues.get_mut_by_index(index) {
            q.flags.remove(ObjectFlags::POST_PROC);
        }
        loop {
            let consumer_handled = self.try_handoff_to_consumer(index);
            let producer_handled = self.try_service_producer(index);
            if !consumer_handled && !producer_handled {
                break;
            }
        }
        self.dispatch(None);
    }

    fn try_handoff_to_consumer(&mut self, index: u16) -> bool {
        let ready = self.message_queues.get_by_index(index).map(|q| !q.consumers.is_empty() && q.head.is_some()).unwrap_or(false);
        if !ready {
            return false;
        }
        let consumer = self.message_queues.get_mut_by_index(index).unwrap().consumers.pop_front(&mut self.threads).unwrap();
        let wi = self.threads.get_by_index(consumer.index).map(|t| t.wait_info);
        let Some(WaitInfo::MessageGet { buffer, out_priority, .. }) = wi else { return false };
        let q = self.message_queues.get_mut_by_index(index).unwrap();
        let (block, priority) = q.pop_head().unwrap();
        let msg_size = q.msg_size as usize;
        unsafe {
            core::ptr::copy_nonoverlapping(q.payload(block).as_ptr(), buffer, msg_size);
            if !out_priority.is_null() {
                *out_priority = priority;
            }
        }
        q.pool.free(block);
        self.thread_wait_exit(consumer, Status::Ok as i32, false);
        true
    }

    fn try_service_producer(&mut self, index: u16) -> bool {
        let ready = self.message_queues.get_by_index(index).map(|q| !q.producers.is_empty() && q.pool.free_count() > 0).unwrap_or(false);
        if !ready {
            return false;
        }
        let producer = self.message_queues.get_mut_by_index(index).unwrap().producers.pop_front(&mut self.threads).unwrap();
        let wi = self.threads.get_by_index(producer.index).map(|t| t.wait_info);
        let Some(WaitInfo::MessagePut { buffer, priority, .. }) = wi else { return false };
        let q = self.message_queues.get_mut_by_index(index).unwrap();
        let block = q.pool.alloc().unwrap();
        let msg_size = q.msg_size as usize;
        unsafe { core::ptr::copy_nonoverlapping(buffer, q.payload_mut(block).as_mut_ptr(), msg_size) };
        q.insert_sorted(block, priority);
        self.thread_wait_exit(producer, Status::Ok as i32, false);
        true
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

    fn leak_storage(size: usize) -> &'static mut [u8] {
        Box::leak(vec![0u8; size].into_boxed_slice())
    }

    #[test]
    fn fifo_at_priority_zero() {
        let mut k = Kernel::new(TestPort::new());
        let h = k.message_queue_new(leak_storage(4 * 16), 4, 4).unwrap();
        let a = 0xAAu32.to_ne_bytes();
        let b = 0xBBu32.to_ne_bytes();
        k.message_queue_put(h, a.as_ptr(), 0, 0).unwrap();
        k.message_queue_put(h, b.as_ptr(), 0, 0).unwrap();
        let mut out = [0u8; 4];
        k.message_queue_get(h, out.as_mut_ptr(), core::ptr::null_mut(), 0).unwrap();
        assert_eq!(u32::from_ne_bytes(out), 0xAA);
        k.message_queue_get(h, out.as_mut_ptr(), core::ptr::null_mut(), 0).unwrap();
        assert_eq!(u32::from_ne_bytes(out), 0xBB);
    }

    #[test]
    fn priority_ordering() {
        let mut k = Kernel::new(TestPort::new());
        let h = k.message_queue_new(leak_storage(4 * 16), 4, 4).unwrap();
        let vals: [(u32, u8); 4] = [(0xAA, 2), (0xBB, 5), (0xCC, 0), (0xDD, 5)];
        for (v, prio) in vals {
            let b = v.to_ne_bytes();
            k.message_queue_put(h, b.as_ptr(), prio, 0).unwrap();
        }
        let expected = [0xBBu32, 0xDD, 0xAA, 0xCC];
        for want in expected {
            let mut out = [0u8; 4];
            k.message_queue_get(h, out.as_mut_ptr(), core::ptr::null_mut(), 0).unwrap();
            assert_eq!(u32::from_ne_bytes(out), want);
        }
    }

    #[test]
    fn get_on_empty_with_zero_timeout_is_resource_error() {
        let mut k = Kernel::new(TestPort::new());
        let h = k.message_queue_new(leak_storage(4 * 4), 4, 4).unwrap();
        let mut out = [0u8; 4];
        assert_eq!(k.message_queue_get(h, out.as_mut_ptr(), core::ptr::null_mut(), 0), Err(Status::ErrorResource));
    }

    #[test]
    fn delete_wakes_waiters_with_resource_error() {
        let mut k = Kernel::new(TestPort::new());
        let h = k.message_queue_new(leak_storage(4 * 4), 4, 4).unwrap();
        k.message_queue_delete(h).unwrap();
        let mut out = [0u8; 4];
        assert_eq!(k.message_queue_get(h, out.as_mut_ptr(), core::ptr::null_mut(), 0), Err(Status::ErrorParameter));
    }
}
