//! Plain FIFO data queue (spec §4.13): fixed-size raw items in a ring
//! buffer, no priority ordering and no per-slot allocation — the simpler
//! sibling of [`super::message_queue`], sharing the same producer/consumer
//! blocking pattern and the same ISR post-processing discipline.

use crate::config::MAX_DATA_QUEUES;
use crate::error::{KernelResult, Status};
use crate::kernel::Kernel;
use crate::object::{Handle, ObjectFlags, ObjectKind, ObjectRef, Slab};
use crate::port::Port;
use crate::queue::List;
use crate::thread::{BlockKind, ThreadId, WaitInfo};

pub struct DataQueueMarker;
pub type DataQueueHandle = Handle<DataQueueMarker>;
pub type DataQueueSlab = Slab<DataQueue, DataQueueMarker, MAX_DATA_QUEUES>;

pub struct DataQueue {
    storage: &'static mut [u8],
    item_size: u32,
    capacity: u32,
    head: u32,
    count: u32,
    pub producers: List<ThreadId>,
    pub consumers: List<ThreadId>,
    flags: ObjectFlags,
}

impl DataQueue {
    fn slot(&self, index: u32) -> &[u8] {
        let off = index as usize * self.item_size as usize;
        &self.storage[off..off + self.item_size as usize]
    }

    fn slot_mut(&mut self, index: u32) -> &mut [u8] {
        let off = index as usize * self.item_size as usize;
        &mut self.storage[off..off + self.item_size as usize]
    }

    fn push(&mut self, data: *const u8) {
        let slot_index = (self.head + self.count) % self.capacity;
        let item_size = self.item_size as usize;
        unsafe { core::ptr::copy_nonoverlapping(data, self.slot_mut(slot_index).as_mut_ptr(), item_size) };
        self.count += 1;
    }

    fn pop(&mut self, out: *mut u8) {
        let item_size = self.item_size as usize;
        unsafe { core::ptr::copy_nonoverlapping(self.slot(self.head).as_ptr(), out, item_size) };
        self.head = (self.head + 1) % self.capacity;
        self.count -= 1;
    }
}

impl<P: Port> Kernel<P> {
    pub fn data_queue_new(&mut self, storage: &'static mut [u8], item_size: u32, capacity: u32) -> KernelResult<DataQueueHandle> {
        if item_size == 0 || capacity == 0 || storage.len() < item_size as usize * capacity as usize {
            return Err(Status::ErrorParameter);
        }
        let q = DataQueue { storage, item_size, capacity, head: 0, count: 0, producers: List::new(), consumers: List::new(), flags: ObjectFlags::empty() };
        self.data_queues.insert(q).ok_or(Status::ErrorNoMemory)
    }

    pub fn data_queue_delete(&mut self, handle: DataQueueHandle) -> KernelResult<()> {
        {
            let q = self.data_queues.get_mut(handle).ok_or(Status::ErrorParameter)?;
            let mut producers = core::mem::replace(&mut q.producers, List::new());
            while let Some(tid) = producers.pop_front(&mut self.threads) {
                self.thread_wait_exit(tid, Status::ErrorResource as i32, false);
            }
        }
        {
            let q = self.data_queues.get_mut_by_index(handle.index).unwrap();
            let mut consumers = core::mem::replace(&mut q.consumers, List::new());
            while let Some(tid) = consumers.pop_front(&mut self.threads) {
                self.thread_wait_exit(tid, Status::ErrorResource as i32, false);
            }
        }
        self.data_queues.remove(handle);
        self.dispatch(None);
        Ok(())
    }

    pub fn data_queue_put(&mut self, handle: DataQueueHandle, data: *const u8, timeout: u32) -> KernelResult<()> {
        let index = handle.index;
        let from_isr = self.port.irq_in_handler();
        if from_isr && timeout != 0 {
            return Err(Status::ErrorParameter);
        }
        let item_size = self.data_queues.get(handle).ok_or(Status::ErrorParameter)?.item_size as usize;

        if !from_isr {
            let consumer = self.data_queues.get_mut_by_index(index).unwrap().consumers.pop_front(&mut self.threads);
            if let Some(consumer) = consumer {
                let wi = self.threads.get_by_index(consumer.index).map(|t| t.wait_info);
                if let Some(WaitInfo::DataGet { buffer, .. }) = wi {
                    unsafe { core::ptr::copy_nonoverlapping(data, buffer, item_size) };
                    self.thread_wait_exit(consumer, Status::Ok as i32, true);
                    return Ok(());
                }
            }
        }

        let has_space = self.data_queues.get_by_index(index).map(|q| q.count < q.capacity).unwrap_or(false);
        if has_space {
            let q = self.data_queues.get_mut_by_index(index).unwrap();
            q.push(data);
            if from_isr && !q.consumers.is_empty() {
                q.flags.insert(ObjectFlags::POST_PROC);
                self.post_queue_request(ObjectRef { kind: ObjectKind::DataQueue, index });
            }
            return Ok(());
        }

        if from_isr || timeout == 0 {
            return Err(Status::ErrorResource);
        }
        let tid = self.run_curr.ok_or(Status::Error)?;
        {
            let q = self.data_queues.get_mut_by_index(index).unwrap();
            crate::sched::enter_wait(&mut self.threads, &mut self.ready_list, &mut self.ready_bmp, &mut self.delay_list, self.tick, tid, BlockKind::QueuePut, WaitInfo::DataPut { handle: index, buffer: data }, timeout, &mut q.producers);
        }
        self.dispatch(None);
        let ret = self.running_ret_val();
        if ret == Status::Ok as i32 {
            Ok(())
        } else {
            Err(status_from_raw(ret))
        }
    }

    pub fn data_queue_get(&mut self, handle: DataQueueHandle, buffer: *mut u8, timeout: u32) -> KernelResult<()> {
        let index = handle.index;
        let from_isr = self.port.irq_in_handler();
        if from_isr && timeout != 0 {
            return Err(Status::ErrorParameter);
        }

        let has_item = self.data_queues.get(handle).ok_or(Status::ErrorParameter)?.count > 0;
        if has_item {
            let q = self.data_queues.get_mut_by_index(index).unwrap();
            q.pop(buffer);
            if !q.producers.is_empty() {
                if from_isr {
                    q.flags.insert(ObjectFlags::POST_PROC);
                    self.post_queue_request(ObjectRef { kind: ObjectKind::DataQueue, index });
                } else {
                    self.try_service_data_producer(index);
                }
            }
            return Ok(());
        }

        if from_isr || timeout == 0 {
            return Err(Status::ErrorResource);
        }
        let tid = self.run_curr.ok_or(Status::Error)?;
        {
            let q = self.data_queues.get_mut_by_index(index).unwrap();
            crate::sched::enter_wait(&mut self.threads, &mut self.ready_list, &mut self.ready_bmp, &mut self.delay_list, self.tick, tid, BlockKind::QueueGet, WaitInfo::DataGet { handle: index, buffer }, timeout, &mut q.consumers);
        }
        self.dispatch(None);
        let ret = self.running_ret_val();
        if ret == Status::Ok as i32 {
            Ok(())
        } else {
            Err(status_from_raw(ret))
        }
    }

    pub fn data_queue_reset(&mut self, handle: DataQueueHandle) -> KernelResult<()> {
        let index = handle.index;
        {
            let q = self.data_queues.get_mut(handle).ok_or(Status::ErrorParameter)?;
            q.head = 0;
            q.count = 0;
        }
        while self.data_queues.get_by_index(index).map(|q| !q.producers.is_empty() && q.count < q.capacity).unwrap_or(false) {
            if !self.try_service_data_producer(index) {
                break;
            }
        }
        self.dispatch(None);
        Ok(())
    }

    pub fn data_queue_get_capacity(&self, handle: DataQueueHandle) -> KernelResult<u32> {
        self.data_queues.get(handle).map(|q| q.capacity).ok_or(Status::ErrorParameter)
    }

    pub fn data_queue_get_item_size(&self, handle: DataQueueHandle) -> KernelResult<u32> {
        self.data_queues.get(handle).map(|q| q.item_size).ok_or(Status::ErrorParameter)
    }

    pub fn data_queue_get_count(&self, handle: DataQueueHandle) -> KernelResult<u32> {
        self.data_queues.get(handle).map(|q| q.count).ok_or(Status::ErrorParameter)
    }

    pub fn data_queue_get_space(&self, handle: DataQueueHandle) -> KernelResult<u32> {
        self.data_queues.get(handle).map(|q| q.capacity - q.count).ok_or(Status::ErrorParameter)
    }

    pub(crate) fn data_queue_post_process(&mut self, index: u16) {
        if let Some(q) = self.data_queues.get_mut_by_index(index) {
            q.flags.remove(ObjectFlags::POST_PROC);
        }
        loop {
            let consumer_handled = self.try_handoff_to_data_consumer(index);
            let producer_handled = self.try_service_data_producer(index);
            if !consumer_handled && !producer_handled {
                break;
            }
        }
        self.dispatch(None);
    }

    fn try_handoff_to_data_consumer(&mut self, index: u16) -> bool {
        let ready = self.data_queues.get_by_index(index).map(|q| !q.consumers.is_empty() && q.count > 0).unwrap_or(false);
        if !ready {
            return false;
        }
        let consumer = self.data_queues.get_mut_by_index(index).unwrap().consumers.pop_front(&mut self.threads).unwrap();
        let wi = self.threads.get_by_index(consumer.index).map(|t| t.wait_info);
        let Some(WaitInfo::DataGet { buffer, .. }) = wi else { return false };
        let q = self.data_queues.get_mut_by_index(index).unwrap();
        q.pop(buffer);
        self.thread_wait_exit(consumer, Status::Ok as i32, false);
        true
    }

    fn try_service_data_producer(&mut self, index: u16) -> bool {
        let ready = self.data_queues.get_by_index(index).map(|q| !q.producers.is_empty() && q.count < q.capacity).unwrap_or(false);
        if !ready {
            return false;
        }
        let producer = self.data_queues.get_mut_by_index(index).unwrap().producers.pop_front(&mut self.threads).unwrap();
        let wi = self.threads.get_by_index(producer.index).map(|t| t.wait_info);
        let Some(WaitInfo::DataPut { buffer, .. }) = wi else { return false };
        let q = self.data_queues.get_mut_by_index(index).unwrap();
        q.push(buffer);
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
    fn fifo_round_trip() {
        let mut k = Kernel::new(TestPort::new());
        let h = k.data_queue_new(leak_storage(4 * 4), 4, 4).unwrap();
        let a = 1u32.to_ne_bytes();
        let b = 2u32.to_ne_bytes();
        k.data_queue_put(h, a.as_ptr(), 0).unwrap();
        k.data_queue_put(h, b.as_ptr(), 0).unwrap();
        let mut out = [0u8; 4];
        k.data_queue_get(h, out.as_mut_ptr(), 0).unwrap();
        assert_eq!(u32::from_ne_bytes(out), 1);
        k.data_queue_get(h, out.as_mut_ptr(), 0).unwrap();
        assert_eq!(u32::from_ne_bytes(out), 2);
    }

    #[test]
    fn full_with_zero_timeout_is_resource_error() {
        let mut k = Kernel::new(TestPort::new());
        let h = k.data_queue_new(leak_storage(4), 4, 1).unwrap();
        let a = 1u32.to_ne_bytes();
        k.data_queue_put(h, a.as_ptr(), 0).unwrap();
        assert_eq!(k.data_queue_put(h, a.as_ptr(), 0), Err(Status::ErrorResource));
    }
}
