//! The generic object pattern shared by every kernel primitive.
//!
//! The original C kernel gives every postable primitive (thread,
//! semaphore, event flags, mutex, timer, message queue, message, data
//! queue, memory pool) a common header: a one-byte identity tag used to
//! validate a handle before any operation and to detect use of a deleted
//! object, plus a `post_queue` link and a flags byte carrying
//! `FLAGS_POST_PROC`/`FLAGS_TIMER_PROC`.
//!
//! This module replaces the tag-byte trick with the idiomatic
//! strict-ownership equivalent: a generation-counted [`Handle`] plus a
//! fixed-capacity [`Slab`] that owns the actual storage. A handle from a
//! deleted (and possibly reused) slot fails validation the same way a
//! stale ID tag would in the original.

use bitflags::bitflags;
use core::marker::PhantomData;

bitflags! {
    /// Per-object flags. Only two bits are used by the kernel itself; the
    /// rest are reserved.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ObjectFlags: u8 {
        /// Object already queued for ISR post-processing; set by the first
        /// ISR-context poke and cleared once the drain routine services it.
        /// Keeps repeated ISR pokes idempotent.
        const POST_PROC = 1 << 0;
        /// Object is linked on the software-timer wheel rather than the
        /// plain delay list.
        const TIMER_PROC = 1 << 1;
    }
}

/// Tag identifying which kind of object a post-queue entry (or a
/// type-erased reference) refers to. Mirrors the original's `ID_*`
/// byte constants, minus `ID_INVALID` (a `Handle` that fails validation
/// plays that role here) and `ID_MESSAGE` (a message's storage has no
/// independent lifetime of its own in this port; see `mqueue`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Thread,
    Semaphore,
    EventFlags,
    Mutex,
    Timer,
    MemoryPool,
    MessageQueue,
    DataQueue,
}

/// A tagged reference into one of the kernel's object slabs. This is the
/// Rust replacement for the source's "generic object" post-processing
/// record: instead of a common struct prefix, the drain routine matches on
/// `kind` and dispatches to the right post processor with `index`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub index: u16,
}

/// A generation-counted handle into a [`Slab<T, N>`]. `K` is a
/// zero-sized marker type so e.g. a `Handle<ThreadMarker>` and a
/// `Handle<MutexMarker>` are distinct types even though both are really
/// `(u16, u32)` underneath.
pub struct Handle<K> {
    pub(crate) index: u16,
    generation: u32,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for Handle<K> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<K> Copy for Handle<K> {}
impl<K> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}
impl<K> Eq for Handle<K> {}
impl<K> Handle<K> {
    /// Build a handle carrying only `index`, with a dummy generation.
    /// Only valid for call paths that resolve objects via
    /// `Slab::get_by_index`/`get_mut_by_index` (which do not check the
    /// generation) rather than `get`/`get_mut`/`remove`. Used to
    /// reconstruct a thread/object reference from a post-queue entry,
    /// which carries a bare index (see [`crate::object::ObjectRef`]).
    pub(crate) fn from_index_unchecked(index: u16) -> Self {
        Handle { index, generation: 0, _kind: PhantomData }
    }
}

impl<K> core::fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Handle").field("index", &self.index).field("generation", &self.generation).finish()
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Fixed-capacity, generation-counted object table. Every kernel
/// primitive's `New`/`Delete` pair is `alloc`/`free` here; every API call
/// first validates its handle against the slot's current generation,
/// which is this port's replacement for the original's ID-tag check.
pub struct Slab<T, K, const N: usize> {
    slots: [Slot<T>; N],
    _kind: PhantomData<K>,
}

impl<T, K, const N: usize> Slab<T, K, N> {
    pub fn new() -> Self {
        Slab {
            slots: core::array::from_fn(|_| Slot { generation: 1, value: None }),
            _kind: PhantomData,
        }
    }

    /// Claim the slot at `index` (caller-provided storage is pre-addressed
    /// by index in this port, matching the original's "control block
    /// memory is caller-supplied" model) and stamp a fresh generation.
    /// Returns `None` if the slot is already occupied.
    pub fn insert_at(&mut self, index: u16, value: T) -> Option<Handle<K>> {
        let slot = self.slots.get_mut(index as usize)?;
        if slot.value.is_some() {
            return None;
        }
        slot.value = Some(value);
        Some(Handle { index, generation: slot.generation, _kind: PhantomData })
    }

    /// Find a free slot and claim it, returning its handle.
    pub fn insert(&mut self, value: T) -> Option<Handle<K>> {
        let index = self.slots.iter().position(|s| s.value.is_none())? as u16;
        self.insert_at(index, value)
    }

    fn validate(&self, handle: Handle<K>) -> bool {
        self.slots
            .get(handle.index as usize)
            .map(|s| s.generation == handle.generation && s.value.is_some())
            .unwrap_or(false)
    }

    pub fn get(&self, handle: Handle<K>) -> Option<&T> {
        if !self.validate(handle) {
            return None;
        }
        self.slots[handle.index as usize].value.as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle<K>) -> Option<&mut T> {
        if !self.validate(handle) {
            return None;
        }
        self.slots[handle.index as usize].value.as_mut()
    }

    pub fn get_by_index(&self, index: u16) -> Option<&T> {
        self.slots.get(index as usize)?.value.as_ref()
    }

    pub fn get_mut_by_index(&mut self, index: u16) -> Option<&mut T> {
        self.slots.get_mut(index as usize)?.value.as_mut()
    }

    /// Remove the object referenced by `handle`, bumping the slot's
    /// generation so any retained stale handle subsequently fails
    /// validation (`ErrorParameter`), mirroring the original zeroing the
    /// ID tag on delete.
    pub fn remove(&mut self, handle: Handle<K>) -> Option<T> {
        if !self.validate(handle) {
            return None;
        }
        let slot = &mut self.slots[handle.index as usize];
        slot.generation = slot.generation.wrapping_add(1).max(1);
        slot.value.take()
    }

    /// Remove whatever occupies `index`, bumping its generation, without
    /// needing a validated [`Handle`] on hand. Used by internal paths
    /// (thread termination reclaiming a non-joinable control block) that
    /// only carry a bare index, analogous to `get_by_index`/
    /// `get_mut_by_index`.
    pub(crate) fn remove_by_index(&mut self, index: u16) -> Option<T> {
        let slot = self.slots.get_mut(index as usize)?;
        slot.generation = slot.generation.wrapping_add(1).max(1);
        slot.value.take()
    }

    /// Rebuild a validated [`Handle`] for an occupied slot from its bare
    /// index, stamped with the slot's current generation. Used by
    /// enumeration APIs that only have an index on hand (from
    /// [`Slab::iter`]) but need to hand callers a handle that will still
    /// validate against later `get`/`get_mut`/`remove` calls.
    pub fn handle_for_index(&self, index: u16) -> Option<Handle<K>> {
        let slot = self.slots.get(index as usize)?;
        slot.value.as_ref()?;
        Some(Handle { index, generation: slot.generation, _kind: PhantomData })
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| s.value.as_ref().map(|v| (i as u16, v)))
    }
}

impl<T, K, const N: usize> Default for Slab<T, K, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Marker;

    #[test]
    fn stale_handle_fails_after_delete() {
        let mut slab: Slab<u32, Marker, 4> = Slab::new();
        let h = slab.insert(42).unwrap();
        assert_eq!(slab.get(h), Some(&42));
        slab.remove(h);
        assert_eq!(slab.get(h), None);

        let h2 = slab.insert(7).unwrap();
        // Same index may be reused, but the old handle must not validate.
        if h2.index == h.index {
            assert_eq!(slab.get(h), None);
        }
        assert_eq!(slab.get(h2), Some(&7));
    }
}
