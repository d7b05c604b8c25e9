//! Software timers (spec §4.6): a sorted wheel of pending deadlines,
//! advanced by the tick handler, whose actual callbacks are expected to
//! run on a dedicated highest-priority Timer thread so they execute in
//! thread context (and may therefore call any blocking kernel API) rather
//! than in the tick ISR itself.
//!
//! Unlike the thread delay list (`crate::delay`), a `Timer` only ever
//! occupies one list at a time — the wheel — so this reuses the generic
//! [`crate::queue::List`]/[`crate::queue::NodeLinks`] machinery instead of
//! a bespoke type.

use crate::config::MAX_TIMERS;
use crate::error::{KernelResult, Status};
use crate::kernel::Kernel;
use crate::object::{Handle, Slab};
use crate::port::Port;
use crate::queue::{Links, List, NodeLinks};

pub struct TimerMarker;
pub type TimerHandle = Handle<TimerMarker>;
pub type TimerSlab = Slab<Timer, TimerMarker, MAX_TIMERS>;

/// A timer callback, invoked with its registered argument. Runs on the
/// Timer thread, never directly from the tick ISR.
pub type TimerCallback = extern "C" fn(arg: usize);

pub struct Timer {
    pub period: u32,
    pub callback: TimerCallback,
    pub arg: usize,
    pub periodic: bool,
    pub running: bool,
    deadline: u64,
    wheel_links: Links<TimerHandle>,
}

impl NodeLinks<TimerHandle> for TimerSlab {
    fn links(&self, id: TimerHandle) -> Links<TimerHandle> {
        self.get_by_index(id.index).map(|t| t.wheel_links).unwrap_or(Links::empty())
    }

    fn set_links(&mut self, id: TimerHandle, links: Links<TimerHandle>) {
        if let Some(t) = self.get_mut_by_index(id.index) {
            t.wheel_links = links;
        }
    }
}

/// Sorted-by-absolute-deadline wheel, built on the generic intrusive list
/// since a timer has only this one linkage role.
pub struct TimerWheel(List<TimerHandle>);

impl TimerWheel {
    pub const fn new() -> Self {
        TimerWheel(List::new())
    }

    fn insert_sorted(&mut self, timers: &mut TimerSlab, tid: TimerHandle, deadline: u64) {
        timers.get_mut_by_index(tid.index).unwrap().deadline = deadline;
        let mut cursor = self.0.front();
        while let Some(id) = cursor {
            let d = timers.get_by_index(id.index).unwrap().deadline;
            if d > deadline {
                break;
            }
            cursor = timers.links(id).next;
        }
        match cursor {
            Some(before) => self.0.insert_before(timers, before, tid),
            None => self.0.push_back(timers, tid),
        }
    }

    fn remove(&mut self, timers: &mut TimerSlab, tid: TimerHandle) {
        self.0.remove(timers, tid);
    }

    fn drain_expired(&mut self, timers: &mut TimerSlab, tick: u64, mut f: impl FnMut(&mut TimerSlab, TimerHandle)) {
        while let Some(id) = self.0.front() {
            let d = timers.get_by_index(id.index).unwrap().deadline;
            if d > tick {
                break;
            }
            self.0.remove(timers, id);
            f(timers, id);
        }
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Port> Kernel<P> {
    pub fn timer_new(&mut self, callback: TimerCallback, arg: usize, period: u32, periodic: bool) -> KernelResult<TimerHandle> {
        if period == 0 {
            return Err(Status::ErrorParameter);
        }
        let t = Timer { period, callback, arg, periodic, running: false, deadline: 0, wheel_links: Links::empty() };
        self.timers.insert(t).ok_or(Status::ErrorNoMemory)
    }

    pub fn timer_start(&mut self, handle: TimerHandle) -> KernelResult<()> {
        let index = handle.index;
        {
            let t = self.timers.get_mut(handle).ok_or(Status::ErrorParameter)?;
            if t.running {
                self.timer_wheel.remove(&mut self.timers, handle);
            }
            self.timers.get_mut_by_index(index).unwrap().running = true;
        }
        let period = self.timers.get_by_index(index).unwrap().period;
        let deadline = self.tick.saturating_add(period as u64);
        self.timer_wheel.insert_sorted(&mut self.timers, handle, deadline);
        Ok(())
    }

    pub fn timer_stop(&mut self, handle: TimerHandle) -> KernelResult<()> {
        let t = self.timers.get_mut(handle).ok_or(Status::ErrorParameter)?;
        if !t.running {
            return Err(Status::ErrorResource);
        }
        t.running = false;
        self.timer_wheel.remove(&mut self.timers, handle);
        Ok(())
    }

    pub fn timer_is_running(&self, handle: TimerHandle) -> KernelResult<bool> {
        self.timers.get(handle).map(|t| t.running).ok_or(Status::ErrorParameter)
    }

    pub fn timer_delete(&mut self, handle: TimerHandle) -> KernelResult<()> {
        let running = self.timers.get(handle).ok_or(Status::ErrorParameter)?.running;
        if running {
            self.timer_wheel.remove(&mut self.timers, handle);
        }
        self.timers.remove(handle);
        Ok(())
    }

    /// Drain every timer whose deadline has passed into `timer_due`;
    /// periodic timers are immediately re-armed for their next period.
    /// Called once per tick, before the dispatch at the end of
    /// [`Kernel::tick_handler`].
    pub(crate) fn timer_tick(&mut self) {
        let tick = self.tick;
        let timers = &mut self.timers;
        let due = &mut self.timer_due;
        self.timer_wheel.drain_expired(timers, tick, |_timers, tid| {
            if due.push_back(tid).is_err() {
                log::error!("timer due queue exhausted, dropping expiry for {:?}", tid);
            }
        });
        let mut rearm: heapless::Vec<TimerHandle, MAX_TIMERS> = heapless::Vec::new();
        for tid in self.timer_due.iter() {
            let t = self.timers.get_by_index(tid.index).unwrap();
            if t.periodic && t.running {
                let _ = rearm.push(*tid);
            } else if t.running {
                self.timers.get_mut_by_index(tid.index).unwrap().running = false;
            }
        }
        for tid in rearm {
            let period = self.timers.get_by_index(tid.index).unwrap().period as u64;
            let deadline = tick.saturating_add(period);
            self.timer_wheel.insert_sorted(&mut self.timers, tid, deadline);
        }
    }

    /// Pop one due timer and run its callback directly. A simplification:
    /// a real Timer thread would `Get` this from an internal message
    /// queue and is the port/integrator's responsibility to drive (spec
    /// §4.6's "dedicated Timer thread"); this crate only owns the wheel
    /// and the due list the thread polls.
    pub fn timer_thread_poll(&mut self) -> bool {
        let Some(tid) = self.timer_due.pop_front() else { return false };
        let Some(t) = self.timers.get_by_index(tid.index) else { return false };
        let callback = t.callback;
        let arg = t.arg;
        log::trace!("timer {:?} fired", tid);
        callback(arg);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Kernel;
    use crate::port::TestPort;

    extern "C" fn noop(_arg: usize) {}

    #[test]
    fn start_then_stop_round_trip() {
        let mut k = Kernel::new(TestPort::new());
        let h = k.timer_new(noop, 0, 10, false).unwrap();
        assert!(!k.timer_is_running(h).unwrap());
        k.timer_start(h).unwrap();
        assert!(k.timer_is_running(h).unwrap());
        k.timer_stop(h).unwrap();
        assert!(!k.timer_is_running(h).unwrap());
    }

    #[test]
    fn one_shot_fires_once_after_its_period() {
        let mut k = Kernel::new(TestPort::new());
        let h = k.timer_new(noop, 0, 5, false).unwrap();
        k.timer_start(h).unwrap();
        for _ in 0..4 {
            k.tick_handler();
        }
        assert!(k.timer_is_running(h).unwrap());
        k.tick_handler();
        assert!(!k.timer_is_running(h).unwrap());
        assert!(k.timer_thread_poll());
        assert!(!k.timer_thread_poll());
    }

    #[test]
    fn stop_then_delete_is_parameter_error_after() {
        let mut k = Kernel::new(TestPort::new());
        let h = k.timer_new(noop, 0, 10, true).unwrap();
        k.timer_start(h).unwrap();
        k.timer_delete(h).unwrap();
        assert_eq!(k.timer_is_running(h), Err(Status::ErrorParameter));
    }
}
