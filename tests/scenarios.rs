//! Crate-level end-to-end scenarios.
//!
//! These exercise sequences spanning several modules at once (the
//! scheduler, a sync primitive, and the ISR post-processing pipeline
//! together) rather than one module in isolation, the way the unit
//! tests local to each source file do. The host has no real concurrency,
//! so a "running" thread here just means the one `Kernel` bookkeeping
//! currently calls current; [`pump`] stands in for the pendable
//! interrupt actually firing.

use rtos_core::port::TestPort;
use rtos_core::{BlockKind, Kernel, Status, ThreadState};
use std::boxed::Box;
use std::vec;

fn leak_stack() -> &'static mut [u8] {
    Box::leak(vec![0u8; 256].into_boxed_slice())
}

extern "C" fn noop_entry(_arg: usize) {}

/// Boot a kernel with the two mandatory system threads and return it
/// with the timer thread (highest priority) immediately suspended, so
/// application threads at priorities 1..=30 can be scheduled freely.
fn boot() -> Kernel<TestPort> {
    let mut k = Kernel::new(TestPort::new());
    k.initialize().unwrap();
    k.start(leak_stack(), noop_entry, leak_stack(), noop_entry).unwrap();
    let timer_id = k.thread_get_id().unwrap();
    k.thread_suspend(timer_id).unwrap();
    pump(&mut k);
    k
}

/// Drive the pendable handler if the port has a switch pending, the way
/// real hardware would tail-chain it after the triggering interrupt
/// returns.
fn pump(k: &mut Kernel<TestPort>) {
    if k.port().take_pending() {
        k.pendable_handler();
    }
}

#[test]
fn priority_preemption_wakes_higher_priority_waiter_immediately() {
    let mut k = boot();

    let a = k.thread_new("a", noop_entry, 0, 1, leak_stack(), false).unwrap();
    pump(&mut k);
    assert_eq!(k.thread_get_state(a).unwrap(), ThreadState::Running);

    let sem = k.semaphore_new(0, 1).unwrap();

    let b = k.thread_new("b", noop_entry, 0, 3, leak_stack(), false).unwrap();
    pump(&mut k);
    assert_eq!(k.thread_get_state(b).unwrap(), ThreadState::Running);

    // b blocks on the semaphore; a becomes the best ready candidate again.
    let _ = k.semaphore_acquire(sem, 1000);
    assert_eq!(k.thread_get_state(b).unwrap(), ThreadState::Blocked(BlockKind::Semaphore));
    pump(&mut k);
    assert_eq!(k.thread_get_state(a).unwrap(), ThreadState::Running);

    // An ISR releases the semaphore; b must preempt a as soon as the
    // pendable handler drains the post queue, without a ever observing
    // another dispatch in between.
    k.port().enter_irq();
    k.semaphore_release(sem).unwrap();
    k.port().exit_irq();
    pump(&mut k);

    assert_eq!(k.thread_get_state(b).unwrap(), ThreadState::Running);
    assert_eq!(k.thread_get_state(a).unwrap(), ThreadState::Ready);
}

#[test]
fn priority_inheritance_boosts_owner_and_reverts_on_release() {
    let mut k = boot();

    let m = k.mutex_new(true, false, false).unwrap();

    let l = k.thread_new("l", noop_entry, 0, 1, leak_stack(), false).unwrap();
    pump(&mut k);
    assert_eq!(k.thread_get_state(l).unwrap(), ThreadState::Running);
    k.mutex_acquire(m, 0).unwrap();
    assert_eq!(k.mutex_get_owner(m).unwrap(), Some(l));
    assert_eq!(k.thread_get_priority(l).unwrap(), 1);

    // A mid-priority thread that never touches the mutex, to prove l
    // would starve at priority 1 without inheritance.
    let mi = k.thread_new("mi", noop_entry, 0, 2, leak_stack(), false).unwrap();
    pump(&mut k);
    assert_eq!(k.thread_get_state(mi).unwrap(), ThreadState::Running);
    // Park mi so l can run again and attempt to hand control to h below.
    k.thread_suspend(mi).unwrap();
    pump(&mut k);
    assert_eq!(k.thread_get_state(l).unwrap(), ThreadState::Running);

    let h = k.thread_new("h", noop_entry, 0, 3, leak_stack(), false).unwrap();
    pump(&mut k);
    assert_eq!(k.thread_get_state(h).unwrap(), ThreadState::Running);

    // h contends for the mutex l still holds: l gets boosted to h's
    // priority and h blocks.
    let _ = k.mutex_acquire(m, 1000);
    assert_eq!(k.thread_get_state(h).unwrap(), ThreadState::Blocked(BlockKind::Mutex));
    assert_eq!(k.thread_get_priority(l).unwrap(), 3);
    pump(&mut k);
    assert_eq!(k.thread_get_state(l).unwrap(), ThreadState::Running);

    // l releases the mutex: ownership transfers straight to h, and l's
    // effective priority reverts to its own base (1).
    k.mutex_release(m).unwrap();
    assert_eq!(k.mutex_get_owner(m).unwrap(), Some(h));
    assert_eq!(k.thread_get_priority(l).unwrap(), 1);
    pump(&mut k);
    assert_eq!(k.thread_get_state(h).unwrap(), ThreadState::Running);
}

#[test]
fn message_queue_priority_ordering_across_mixed_priority_puts() {
    let mut k = boot();
    let storage: &'static mut [u8] = Box::leak(vec![0u8; 4 * 16].into_boxed_slice());
    let h = k.message_queue_new(storage, 4, 4).unwrap();

    let puts: [(u32, u8); 4] = [(0xAA, 2), (0xBB, 5), (0xCC, 0), (0xDD, 5)];
    for (value, prio) in puts {
        let bytes = value.to_ne_bytes();
        k.message_queue_put(h, bytes.as_ptr(), prio, 0).unwrap();
    }

    let expected = [0xBBu32, 0xDD, 0xAA, 0xCC];
    for want in expected {
        let mut out = [0u8; 4];
        k.message_queue_get(h, out.as_mut_ptr(), core::ptr::null_mut(), 0).unwrap();
        assert_eq!(u32::from_ne_bytes(out), want);
    }
}

#[test]
fn delay_wakes_exactly_at_the_requested_tick_not_earlier() {
    let mut k = boot();
    let a = k.thread_new("a", noop_entry, 0, 1, leak_stack(), false).unwrap();
    pump(&mut k);
    assert_eq!(k.thread_get_state(a).unwrap(), ThreadState::Running);

    let start_tick = k.get_tick_count();
    let _ = k.delay(10);
    assert_eq!(k.thread_get_state(a).unwrap(), ThreadState::Blocked(BlockKind::Delay));

    for _ in 0..9 {
        k.tick_handler();
        assert_eq!(k.thread_get_state(a).unwrap(), ThreadState::Blocked(BlockKind::Delay), "must not wake before its tick");
    }
    k.tick_handler();
    assert_eq!(k.get_tick_count(), start_tick + 10);
    pump(&mut k);
    assert_eq!(k.thread_get_state(a).unwrap(), ThreadState::Running);
}

#[test]
fn reset_releases_blocked_producers_into_the_now_empty_queue() {
    let mut k = boot();
    let storage: &'static mut [u8] = Box::leak(vec![0u8; 4 * 10].into_boxed_slice());
    let h = k.message_queue_new(storage, 4, 2).unwrap();

    let v1 = 1u32.to_ne_bytes();
    let v2 = 2u32.to_ne_bytes();
    k.message_queue_put(h, v1.as_ptr(), 0, 0).unwrap();
    k.message_queue_put(h, v2.as_ptr(), 0, 0).unwrap();
    assert_eq!(k.message_queue_get_count(h).unwrap(), 2);

    let p1 = k.thread_new("p1", noop_entry, 0, 2, leak_stack(), false).unwrap();
    pump(&mut k);
    let v3 = 3u32.to_ne_bytes();
    let _ = k.message_queue_put(h, v3.as_ptr(), 0, 1000);
    assert_eq!(k.thread_get_state(p1).unwrap(), ThreadState::Blocked(BlockKind::QueuePut));
    pump(&mut k);

    let p2 = k.thread_new("p2", noop_entry, 0, 2, leak_stack(), false).unwrap();
    pump(&mut k);
    let v4 = 4u32.to_ne_bytes();
    let _ = k.message_queue_put(h, v4.as_ptr(), 0, 1000);
    assert_eq!(k.thread_get_state(p2).unwrap(), ThreadState::Blocked(BlockKind::QueuePut));
    pump(&mut k);

    k.message_queue_reset(h).unwrap();
    pump(&mut k);

    assert_eq!(k.thread_get_state(p1).unwrap(), ThreadState::Ready);
    assert_eq!(k.thread_get_state(p2).unwrap(), ThreadState::Ready);
    assert_eq!(k.message_queue_get_count(h).unwrap(), 2);
}

#[test]
fn delete_wakes_waiter_with_resource_error_and_handle_then_fails() {
    let mut k = boot();
    let sem = k.semaphore_new(0, 1).unwrap();

    let t = k.thread_new("t", noop_entry, 0, 1, leak_stack(), false).unwrap();
    pump(&mut k);
    assert_eq!(k.thread_get_state(t).unwrap(), ThreadState::Running);

    let _ = k.semaphore_acquire(sem, rtos_core::config::WAIT_FOREVER);
    assert_eq!(k.thread_get_state(t).unwrap(), ThreadState::Blocked(BlockKind::Semaphore));

    k.semaphore_delete(sem).unwrap();
    pump(&mut k);
    assert_eq!(k.thread_get_state(t).unwrap(), ThreadState::Running);

    assert_eq!(k.semaphore_acquire(sem, 0), Err(Status::ErrorParameter));
}
