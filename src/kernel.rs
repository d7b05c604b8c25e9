//! The kernel singleton, its lifecycle (§4.14, §9 "Global mutable kernel
//! state"), and the SVC/gate mechanics every façade entry point goes
//! through.
//!
//! Kept as one `KernelInfo`-equivalent struct with explicit
//! `Initialize`/`Start` states rather than hidden behind lazy
//! initialization, per the design notes: `Kernel::new` builds the
//! instance explicitly, and an integrator owns where it lives (a
//! `static` behind `spin::Mutex`, a stack-local in a single-core test
//! harness, or otherwise) rather than this crate hiding it behind a
//! `lazy_static!`. Every façade method on `Kernel<P>` is this port's
//! equivalent of the original's SVC trap (no privilege rings to cross on
//! a hosted or Cortex-M target without an MPU, so the "trap" collapses to
//! a masked critical section around the same internal handler the ISR
//! fast path calls directly).

use crate::config::{IDLE_THREAD_PRIORITY, MAX_DATA_QUEUES, MAX_EVENT_FLAGS, MAX_MEMORY_POOLS, MAX_MESSAGE_QUEUES, MAX_MUTEXES, MAX_SEMAPHORES, MAX_TIMERS, TIMER_THREAD_PRIORITY};
use crate::delay::DelayList;
use crate::error::{KernelResult, Status};
use crate::mqueue::data_queue::DataQueueSlab;
use crate::mqueue::message_queue::MessageQueueSlab;
use crate::object::{ObjectKind, ObjectRef};
use crate::port::Port;
use crate::sched::{new_ready_list, ReadyList};
use crate::sync::event_flags::EventFlagsSlab;
use crate::sync::memory_pool::MemoryPoolSlab;
use crate::sync::mutex::MutexSlab;
use crate::sync::semaphore::SemaphoreSlab;
use crate::thread::{Thread, ThreadId, ThreadSlab, ThreadState};
use crate::timer::{TimerHandle, TimerSlab, TimerWheel};

/// Kernel-wide run state (spec §4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelState {
    Inactive,
    Ready,
    Running,
    Locked,
    Suspended,
}

/// The kernel singleton. Every object table, the ready set, the delay
/// list, the post queue and the run/lock state live here. `P` is the
/// platform port; production code instantiates this with its own `Port`
/// impl, tests with [`crate::port::TestPort`].
pub struct Kernel<P: Port> {
    pub(crate) port: P,
    pub(crate) state: KernelState,
    pub(crate) lock_depth: u32,
    pub(crate) tick: u64,

    pub(crate) run_curr: Option<ThreadId>,
    pub(crate) run_next: Option<ThreadId>,

    pub(crate) ready_list: ReadyList,
    pub(crate) ready_bmp: u32,
    pub(crate) delay_list: DelayList,
    /// ISR post-processing queue (§4.7). Entries are tagged references,
    /// not slab nodes, so this is a plain bounded FIFO rather than an
    /// instance of the intrusive [`crate::queue::List`] every wait queue
    /// uses.
    pub(crate) post_queue: heapless::Deque<ObjectRef, { crate::config::POST_QUEUE_CAPACITY }>,

    pub(crate) threads: ThreadSlab,
    pub(crate) semaphores: SemaphoreSlab,
    pub(crate) event_flags: EventFlagsSlab,
    pub(crate) mutexes: MutexSlab,
    pub(crate) timers: TimerSlab,
    pub(crate) timer_wheel: TimerWheel,
    pub(crate) timer_due: heapless::Deque<TimerHandle, MAX_TIMERS>,
    pub(crate) memory_pools: MemoryPoolSlab,
    pub(crate) message_queues: MessageQueueSlab,
    pub(crate) data_queues: DataQueueSlab,

    pub(crate) idle_id: Option<ThreadId>,
    pub(crate) timer_id: Option<ThreadId>,
}

impl<P: Port> Kernel<P> {
    pub fn new(port: P) -> Self {
        Kernel {
            port,
            state: KernelState::Inactive,
            lock_depth: 0,
            tick: 0,
            run_curr: None,
            run_next: None,
            ready_list: new_ready_list(),
            ready_bmp: 0,
            delay_list: DelayList::new(),
            post_queue: heapless::Deque::new(),
            threads: ThreadSlab::new(),
            semaphores: SemaphoreSlab::new(),
            event_flags: EventFlagsSlab::new(),
            mutexes: MutexSlab::new(),
            timers: TimerSlab::new(),
            timer_wheel: TimerWheel::new(),
            timer_due: heapless::Deque::new(),
            memory_pools: MemoryPoolSlab::new(),
            message_queues: MessageQueueSlab::new(),
            data_queues: DataQueueSlab::new(),
            idle_id: None,
            timer_id: None,
        }
    }

    /// Validate storage sizing/alignment that every `New` must check
    /// before stamping an object (spec §6, "Alignment... misalignment ->
    /// nullish result").
    pub(crate) fn check_aligned(ptr: *const u8) -> KernelResult<()> {
        if (ptr as usize) % 4 != 0 {
            Err(Status::ErrorParameter)
        } else {
            Ok(())
        }
    }

    /// Register the mandatory idle thread (lowest priority, never
    /// blocks, never exits) and the timer thread (highest priority,
    /// services the software-timer queue). Called once from
    /// [`Kernel::start`].
    fn spawn_system_threads(&mut self, idle_stack: &'static mut [u8], idle_entry: crate::port::ThreadEntry, timer_stack: &'static mut [u8], timer_entry: crate::port::ThreadEntry) -> KernelResult<()> {
        let idle_sp = unsafe { self.port.stack_init(idle_stack.as_mut_ptr(), idle_stack.len(), idle_entry, 0) };
        let mut idle = Thread::new("idle", IDLE_THREAD_PRIORITY, idle_stack.as_mut_ptr(), idle_stack.len(), 0, false);
        idle.stack_sp = idle_sp;
        idle.state = ThreadState::Ready;
        let idle_id = self.threads.insert(idle).ok_or(Status::ErrorNoMemory)?;
        self.idle_id = Some(idle_id);
        self.ready_add(idle_id);

        let timer_sp = unsafe { self.port.stack_init(timer_stack.as_mut_ptr(), timer_stack.len(), timer_entry, 0) };
        let mut timer = Thread::new("timer", TIMER_THREAD_PRIORITY, timer_stack.as_mut_ptr(), timer_stack.len(), 0, false);
        timer.stack_sp = timer_sp;
        timer.state = ThreadState::Ready;
        let timer_id = self.threads.insert(timer).ok_or(Status::ErrorNoMemory)?;
        self.timer_id = Some(timer_id);
        self.ready_add(timer_id);

        log::debug!("system threads spawned: idle={:?} timer={:?}", idle_id, timer_id);
        Ok(())
    }

    /// `osKernelInitialize`. Must be called exactly once, before any
    /// object `New` or `Start`.
    pub fn initialize(&mut self) -> KernelResult<()> {
        if self.state != KernelState::Inactive {
            return Err(Status::Error);
        }
        self.state = KernelState::Ready;
        log::info!("kernel initialized");
        Ok(())
    }

    /// `osKernelStart`. Spawns the mandatory system threads, picks the
    /// best ready thread and marks the kernel `Running`. The very first
    /// dispatch is special: there is no "previous" thread to save, so
    /// the port's `context_switch` is not invoked here; the caller
    /// (typically the port's own startup code) performs the initial jump
    /// using `run_curr`'s saved stack pointer.
    pub fn start(&mut self, idle_stack: &'static mut [u8], idle_entry: crate::port::ThreadEntry, timer_stack: &'static mut [u8], timer_entry: crate::port::ThreadEntry) -> KernelResult<()> {
        if self.state != KernelState::Ready {
            return Err(Status::Error);
        }
        self.spawn_system_threads(idle_stack, idle_entry, timer_stack, timer_entry)?;
        self.state = KernelState::Running;
        let next = self.highest_ready().and_then(|p| self.ready_list[p as usize].front());
        self.run_curr = next;
        if let Some(tid) = next {
            self.ready_del(tid, ThreadState::Running);
        }
        log::info!("kernel started, first thread = {:?}", self.run_curr);
        Ok(())
    }

    pub fn get_state(&self) -> KernelState {
        self.state
    }

    /// Reach the installed port, e.g. to drive its interrupt-simulation
    /// hooks from a test harness, or to register additional handlers an
    /// integrator's own port exposes beyond the [`crate::port::Port`]
    /// contract.
    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn get_tick_count(&self) -> u64 {
        self.tick
    }

    /// `osKernelGetSysTimerCount`. The port contract exposes only the
    /// software tick (`tick_handler` is the sole time source an
    /// integrator drives), so the system timer and the OS tick count the
    /// same underlying clock; a port with a genuine free-running hardware
    /// counter is expected to read it directly rather than through this
    /// facade.
    pub fn kernel_get_sys_timer_count(&self) -> u64 {
        self.tick
    }

    /// `osKernelGetSysTimerFreq`. See [`Kernel::kernel_get_sys_timer_count`].
    pub fn kernel_get_sys_timer_freq(&self) -> u32 {
        crate::config::TICK_FREQ_HZ
    }

    /// `osKernelLock`: suspend preemptive dispatch (the running thread
    /// keeps running until it yields or blocks voluntarily) and return
    /// the previous lock state so the caller can `Restore` it later.
    pub fn lock(&mut self) -> i32 {
        let prev = self.lock_depth;
        self.lock_depth += 1;
        self.state = KernelState::Locked;
        prev as i32
    }

    pub fn unlock(&mut self) -> KernelResult<()> {
        if self.lock_depth == 0 {
            return Err(Status::Error);
        }
        self.lock_depth -= 1;
        if self.lock_depth == 0 {
            self.state = KernelState::Running;
            self.dispatch(None);
        }
        Ok(())
    }

    pub fn restore(&mut self, prev_lock: i32) -> KernelResult<()> {
        if prev_lock < 0 {
            return Err(Status::ErrorParameter);
        }
        self.lock_depth = prev_lock as u32;
        self.state = if self.lock_depth == 0 { KernelState::Running } else { KernelState::Locked };
        if self.lock_depth == 0 {
            self.dispatch(None);
        }
        Ok(())
    }

    /// Enqueue `obj` for ISR post-processing unless it is already
    /// pending (the `FLAGS_POST_PROC`/idempotency bit lives on each
    /// object itself; this just appends the tagged reference once).
    pub(crate) fn post_queue_request(&mut self, obj: ObjectRef) {
        if self.post_queue.push_back(obj).is_err() {
            log::error!("post queue exhausted, dropping request for {:?}", obj);
        }
        self.port.pendable_request();
    }

    /// Drain the post queue (spec §4.7), dispatching each entry to its
    /// kind-specific processor. Called from the pendable handler before
    /// it performs the actual context switch.
    pub(crate) fn drain_post_queue(&mut self) {
        while let Some(obj) = self.post_queue.pop_front() {
            match obj.kind {
                ObjectKind::Semaphore => self.semaphore_post_process(obj.index),
                ObjectKind::EventFlags => self.event_flags_post_process(obj.index),
                ObjectKind::Thread => self.thread_flags_post_process(obj.index),
                ObjectKind::MessageQueue => self.message_queue_post_process(obj.index),
                ObjectKind::DataQueue => self.data_queue_post_process(obj.index),
                ObjectKind::Mutex | ObjectKind::Timer | ObjectKind::MemoryPool => {
                    log::warn!("post-process request for non-postable kind {:?}", obj.kind);
                }
            }
        }
    }

    /// The pendable interrupt handler (§4.3, §4.7): drain deferred ISR
    /// work, then if a different thread has been selected perform the
    /// actual context switch through the port.
    pub fn pendable_handler(&mut self) {
        self.drain_post_queue();
        let Some(next) = self.run_next.take() else { return };
        let prev = self.run_curr;
        if Some(next) == prev {
            return;
        }
        if let Some(p) = prev {
            if let Some(t) = self.threads.get_mut_by_index(p.index) {
                if matches!(t.state, ThreadState::Running) {
                    t.state = ThreadState::Ready;
                }
            }
        }
        self.threads.get_mut_by_index(next.index).unwrap().state = ThreadState::Running;
        self.run_curr = Some(next);
        let prev_sp_slot: *mut crate::port::StackPointer = prev
            .and_then(|p| self.threads.get_mut_by_index(p.index))
            .map(|t| &mut t.stack_sp as *mut _)
            .unwrap_or(core::ptr::null_mut());
        let next_sp = self.threads.get_by_index(next.index).unwrap().stack_sp;
        if !prev_sp_slot.is_null() {
            unsafe { self.port.context_switch(prev_sp_slot, next_sp) };
        }
    }

    /// The periodic tick handler (§4.5): advance `tick`, expire delay
    /// list entries, then dispatch once.
    pub fn tick_handler(&mut self) {
        self.tick = self.tick.wrapping_add(1);
        let tick = self.tick;
        let threads = &mut self.threads;
        let mut expired: heapless::Vec<(ThreadId, bool), { crate::config::MAX_THREADS }> = heapless::Vec::new();
        self.delay_list.drain_expired(threads, tick, |threads, tid| {
            let is_plain_delay = matches!(threads.get_by_index(tid.index).unwrap().wait_info, crate::thread::WaitInfo::Delay);
            let _ = expired.push((tid, is_plain_delay));
        });
        for (tid, is_delay) in expired {
            let ret = if is_delay { Status::Ok as i32 } else { Status::ErrorTimeout as i32 };
            self.finish_wait(tid, ret);
        }
        self.timer_tick();
        self.dispatch(None);
    }

    /// Shared wait-exit tail used by timeout expiry and timer
    /// processing: remove from whichever wait queue still holds the
    /// thread (the object-specific wait queue, if any) and hand back
    /// `ret_val`.
    pub(crate) fn finish_wait(&mut self, tid: ThreadId, ret_val: i32) {
        let kind = self.threads.get_by_index(tid.index).map(|t| t.state);
        if let Some(ThreadState::Blocked(block_kind)) = kind {
            self.remove_from_wait_queue(tid, block_kind);
        }
        self.thread_wait_exit(tid, ret_val, false);
    }

    /// Dispatch table from a thread's recorded [`crate::thread::BlockKind`]
    /// back to the object whose wait queue it is linked on, so a timeout
    /// (or a `Delete`) can unlink it without the caller needing to know
    /// which primitive it was blocked on.
    pub(crate) fn remove_from_wait_queue(&mut self, tid: ThreadId, kind: crate::thread::BlockKind) {
        use crate::thread::{BlockKind, WaitInfo};
        let info = self.threads.get_by_index(tid.index).map(|t| t.wait_info);
        match (kind, info) {
            (BlockKind::Semaphore, Some(WaitInfo::Semaphore { handle })) => {
                if let Some(s) = self.semaphores.get_mut_by_index(handle) {
                    s.waiters.remove(&mut self.threads, tid);
                }
            }
            (BlockKind::Mutex, Some(WaitInfo::Mutex { handle })) => {
                if let Some(m) = self.mutexes.get_mut_by_index(handle) {
                    m.waiters.remove(&mut self.threads, tid);
                }
            }
            (BlockKind::EventFlags, Some(WaitInfo::EventFlags { handle, .. })) => {
                if let Some(e) = self.event_flags.get_mut_by_index(handle) {
                    e.waiters.remove(&mut self.threads, tid);
                }
            }
            (BlockKind::ThreadFlags, _) => {}
            (BlockKind::MemoryPool, Some(WaitInfo::MemoryPool { handle })) => {
                if let Some(mp) = self.memory_pools.get_mut_by_index(handle) {
                    mp.waiters.remove(&mut self.threads, tid);
                }
            }
            (BlockKind::QueueGet, Some(WaitInfo::MessageGet { handle, .. })) => {
                if let Some(q) = self.message_queues.get_mut_by_index(handle) {
                    q.consumers.remove(&mut self.threads, tid);
                }
            }
            (BlockKind::QueuePut, Some(WaitInfo::MessagePut { handle, .. })) => {
                if let Some(q) = self.message_queues.get_mut_by_index(handle) {
                    q.producers.remove(&mut self.threads, tid);
                }
            }
            (BlockKind::QueueGet, Some(WaitInfo::DataGet { handle, .. })) => {
                if let Some(q) = self.data_queues.get_mut_by_index(handle) {
                    q.consumers.remove(&mut self.threads, tid);
                }
            }
            (BlockKind::QueuePut, Some(WaitInfo::DataPut { handle, .. })) => {
                if let Some(q) = self.data_queues.get_mut_by_index(handle) {
                    q.producers.remove(&mut self.threads, tid);
                }
            }
            (BlockKind::Delay, _) => {}
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::TestPort;

    #[test]
    fn initialize_then_start_transitions_state() {
        let mut k = Kernel::new(TestPort::new());
        assert_eq!(k.get_state(), KernelState::Inactive);
        k.initialize().unwrap();
        assert_eq!(k.get_state(), KernelState::Ready);
    }

    #[test]
    fn double_initialize_errors() {
        let mut k = Kernel::new(TestPort::new());
        k.initialize().unwrap();
        assert_eq!(k.initialize(), Err(Status::Error));
    }

    #[test]
    fn lock_unlock_round_trip() {
        let mut k = Kernel::new(TestPort::new());
        k.initialize().unwrap();
        let prev = k.lock();
        assert_eq!(prev, 0);
        assert_eq!(k.get_state(), KernelState::Locked);
        k.unlock().unwrap();
    }

    #[test]
    fn tick_handler_advances_tick_count() {
        let mut k = Kernel::new(TestPort::new());
        k.initialize().unwrap();
        assert_eq!(k.get_tick_count(), 0);
        k.tick_handler();
        assert_eq!(k.get_tick_count(), 1);
    }

    #[test]
    fn sys_timer_count_tracks_tick_count() {
        let mut k = Kernel::new(TestPort::new());
        k.initialize().unwrap();
        k.tick_handler();
        k.tick_handler();
        assert_eq!(k.kernel_get_sys_timer_count(), k.get_tick_count());
        assert_eq!(k.kernel_get_sys_timer_freq(), crate::config::TICK_FREQ_HZ);
    }
}
