//! Global delay list and tick processing (spec §4.5).
//!
//! Kept as a bespoke sorted list rather than an instance of the generic
//! [`crate::queue::List`] because threads are simultaneously members of
//! at most one *other* list (a ready list or a wait queue, via
//! `thread_links`) while independently also being a delay-list member
//! (via `delay_links`); reusing the generic list would require the
//! thread slab to implement `NodeLinks<ThreadId>` twice over, which traits
//! do not allow. This list manipulates `delay_links` directly instead.

use crate::queue::Links;
use crate::thread::{ThreadId, ThreadSlab};

#[derive(Clone, Copy)]
pub struct DelayList {
    head: Option<ThreadId>,
    tail: Option<ThreadId>,
}

impl DelayList {
    pub const fn new() -> Self {
        DelayList { head: None, tail: None }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn front(&self) -> Option<ThreadId> {
        self.head
    }

    /// Insert `tid`, waking at absolute tick `wakeup`, sorted ascending;
    /// ties keep insertion (FIFO) order.
    pub fn insert_sorted(&mut self, threads: &mut ThreadSlab, tid: ThreadId, wakeup: u64) {
        {
            let t = threads.get_mut_by_index(tid.index).unwrap();
            t.wakeup_tick = wakeup;
            t.has_deadline = true;
        }
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let w = threads.get_by_index(id.index).unwrap().wakeup_tick;
            if w > wakeup {
                break;
            }
            prev = Some(id);
            cursor = threads.get_by_index(id.index).unwrap().delay_links.next;
        }
        let next = cursor;
        threads.get_mut_by_index(tid.index).unwrap().delay_links = Links { prev, next };
        match prev {
            Some(p) => threads.get_mut_by_index(p.index).unwrap().delay_links.next = Some(tid),
            None => self.head = Some(tid),
        }
        match next {
            Some(n) => threads.get_mut_by_index(n.index).unwrap().delay_links.prev = Some(tid),
            None => self.tail = Some(tid),
        }
    }

    pub fn remove(&mut self, threads: &mut ThreadSlab, tid: ThreadId) {
        let links = threads.get_by_index(tid.index).unwrap().delay_links;
        match links.prev {
            Some(p) => threads.get_mut_by_index(p.index).unwrap().delay_links.next = links.next,
            None => self.head = links.next,
        }
        match links.next {
            Some(n) => threads.get_mut_by_index(n.index).unwrap().delay_links.prev = links.prev,
            None => self.tail = links.prev,
        }
        threads.get_mut_by_index(tid.index).unwrap().delay_links = Links::empty();
        threads.get_mut_by_index(tid.index).unwrap().has_deadline = false;
    }

    /// Pop every entry whose wakeup has arrived (`wakeup_tick <= tick`),
    /// front to back, invoking `f` for each. Used by the tick handler;
    /// `f` is responsible for resolving the wake reason (timeout vs. a
    /// plain `Delay`) and moving the thread back to ready.
    pub fn drain_expired(&mut self, threads: &mut ThreadSlab, tick: u64, mut f: impl FnMut(&mut ThreadSlab, ThreadId)) {
        while let Some(id) = self.head {
            let wakeup = threads.get_by_index(id.index).unwrap().wakeup_tick;
            if wakeup > tick {
                break;
            }
            self.remove(threads, id);
            f(threads, id);
        }
    }
}

impl Default for DelayList {
    fn default() -> Self {
        Self::new()
    }
}
