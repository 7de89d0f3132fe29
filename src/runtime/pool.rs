//! Fixed-size slot pool for operation storage.
//!
//! Slots live in chunks of `element_count` entries, each chunk allocated as a
//! single block. Vacant slots are threaded into a free list through their own
//! storage, so the steady state (get, release, get, ...) never touches the heap.
//! The pool only grows, one chunk at a time, when the free list runs dry.
//!
//! ## Handles
//!
//! `get` hands out a [`SlotId`] made of the slot index and a generation. Releasing
//! a slot bumps its generation, so an old handle can never reach the value that
//! reuses the slot later.
//!
//! ## Locking
//!
//! [`ObjectPool`] has no internal synchronization. [`SyncPool`] wraps one in a
//! [`PoolLock`]: [`NullLock`] for single-threaded owners, `std::sync::Mutex`
//! for pools shared between worker threads.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Slots per chunk when no size is configured.
pub const DEFAULT_CHUNK_SLOTS: usize = 512;

/// End of the free list. Never a valid slot index.
const NIL: u32 = u32::MAX;

/// Handle to a pool slot: index plus the generation it was handed out with.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

impl SlotId {
    /// Position of the slot across all chunks.
    #[inline]
    pub fn index(self) -> usize {
        self.index as usize
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }

    /// Pack into one word, e.g. an io_uring `user_data` value.
    #[inline]
    pub fn to_u64(self) -> u64 {
        (u64::from(self.index) << 32) | u64::from(self.generation)
    }

    /// Inverse of [`to_u64`](Self::to_u64).
    #[inline]
    pub fn from_u64(raw: u64) -> Self {
        Self {
            index: (raw >> 32) as u32,
            generation: raw as u32,
        }
    }
}

impl fmt::Debug for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotId({}v{})", self.index, self.generation)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

enum SlotState<T> {
    /// Free; links to the next free slot (or `NIL`).
    Vacant { next_free: u32 },
    /// Holds a live value.
    Occupied(T),
    /// Value moved out by `checkout`; the slot stays reserved.
    CheckedOut,
}

struct Slot<T> {
    generation: u32,
    state: SlotState<T>,
}

/// Chunked fixed-slot allocator with an intrusive free list.
pub struct ObjectPool<T> {
    chunks: Vec<Box<[Slot<T>]>>,
    free_head: u32,
    element_count: usize,
    in_use: usize,
    chunk_allocations: usize,
    /// Generation new chunks start at; raised past every handed-out
    /// generation by `purge`.
    base_generation: u32,
}

impl<T> ObjectPool<T> {
    /// Create a pool whose chunks hold `element_count` slots.
    ///
    /// With `preallocate` one chunk is allocated up front, so the first `get`
    /// does not pay for a heap allocation.
    pub fn new(element_count: usize, preallocate: bool) -> Self {
        let mut pool = Self {
            chunks: Vec::new(),
            free_head: NIL,
            element_count: element_count.max(1),
            in_use: 0,
            chunk_allocations: 0,
            base_generation: 0,
        };
        if preallocate {
            pool.grow();
        }
        pool
    }

    /// Store `value` in a free slot, growing by one chunk if none is left.
    pub fn get(&mut self, value: T) -> SlotId {
        if self.free_head == NIL {
            self.grow();
        }

        let index = self.free_head;
        let (chunk, offset) = self.locate(index);
        let slot = &mut self.chunks[chunk][offset];
        let SlotState::Vacant { next_free } = slot.state else {
            unreachable!("free list points at live slot {index}");
        };

        slot.state = SlotState::Occupied(value);
        let generation = slot.generation;
        self.free_head = next_free;
        self.in_use += 1;

        SlotId { index, generation }
    }

    /// Return a slot to the free list in O(1).
    ///
    /// A value still stored in the slot is dropped. Returns `false` if `id` is
    /// stale or the slot is already free.
    pub fn release(&mut self, id: SlotId) -> bool {
        self.vacate(id).is_some()
    }

    /// Move the value out of its slot, keeping the slot reserved for `id`.
    ///
    /// Only one caller can check a value out; a second call returns `None`
    /// until the value is restored.
    pub fn checkout(&mut self, id: SlotId) -> Option<T> {
        let slot = self.slot_mut(id)?;
        match mem::replace(&mut slot.state, SlotState::CheckedOut) {
            SlotState::Occupied(value) => Some(value),
            other => {
                slot.state = other;
                None
            }
        }
    }

    /// Put a checked-out value back into its slot.
    pub fn restore(&mut self, id: SlotId, value: T) -> Result<(), T> {
        match self.slot_mut(id) {
            Some(slot) if matches!(slot.state, SlotState::CheckedOut) => {
                slot.state = SlotState::Occupied(value);
                Ok(())
            }
            _ => Err(value),
        }
    }

    /// Remove the value and free its slot.
    pub fn take(&mut self, id: SlotId) -> Option<T> {
        let value = self.checkout(id)?;
        self.vacate(id);
        Some(value)
    }

    pub fn peek(&self, id: SlotId) -> Option<&T> {
        match &self.slot(id)?.state {
            SlotState::Occupied(value) => Some(value),
            _ => None,
        }
    }

    pub fn peek_mut(&mut self, id: SlotId) -> Option<&mut T> {
        match &mut self.slot_mut(id)?.state {
            SlotState::Occupied(value) => Some(value),
            _ => None,
        }
    }

    /// Whether `id` still refers to a reserved slot.
    pub fn is_live(&self, id: SlotId) -> bool {
        self.slot(id)
            .is_some_and(|slot| !matches!(slot.state, SlotState::Vacant { .. }))
    }

    /// Relink every slot of every chunk as free.
    ///
    /// Live values are dropped and every outstanding handle becomes stale.
    /// Afterwards `available() == chunk_count() * element_count()`.
    pub fn cleanup(&mut self) {
        let total = self.capacity();
        let element_count = self.element_count;

        for (chunk_idx, chunk) in self.chunks.iter_mut().enumerate() {
            for (offset, slot) in chunk.iter_mut().enumerate() {
                let next = chunk_idx * element_count + offset + 1;
                let next_free = if next < total { next as u32 } else { NIL };
                slot.generation = slot.generation.wrapping_add(1);
                slot.state = SlotState::Vacant { next_free };
            }
        }

        self.free_head = if total > 0 { 0 } else { NIL };
        self.in_use = 0;
    }

    /// Free every chunk. Outstanding handles become stale.
    pub fn purge(&mut self) {
        let newest = self
            .chunks
            .iter()
            .flat_map(|chunk| chunk.iter())
            .map(|slot| slot.generation)
            .max();
        if let Some(newest) = newest {
            self.base_generation = newest.wrapping_add(1);
        }
        self.chunks.clear();
        self.free_head = NIL;
        self.in_use = 0;
    }

    /// Handles of every slot that currently holds a value.
    pub fn occupied_ids(&self) -> Vec<SlotId> {
        let mut ids = Vec::with_capacity(self.in_use);
        for (chunk_idx, chunk) in self.chunks.iter().enumerate() {
            for (offset, slot) in chunk.iter().enumerate() {
                if matches!(slot.state, SlotState::Occupied(_)) {
                    ids.push(SlotId {
                        index: (chunk_idx * self.element_count + offset) as u32,
                        generation: slot.generation,
                    });
                }
            }
        }
        ids
    }

    /// Remove and return every stored value, freeing the slots.
    ///
    /// Checked-out slots are left alone.
    pub fn drain(&mut self) -> Vec<(SlotId, T)> {
        self.occupied_ids()
            .into_iter()
            .filter_map(|id| self.take(id).map(|value| (id, value)))
            .collect()
    }

    /// Slots per chunk.
    pub fn element_count(&self) -> usize {
        self.element_count
    }

    /// Chunks currently held.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Chunks allocated over the pool's lifetime, including purged ones.
    pub fn chunk_allocations(&self) -> usize {
        self.chunk_allocations
    }

    /// Total slots across all chunks.
    pub fn capacity(&self) -> usize {
        self.chunks.len() * self.element_count
    }

    /// Reserved slots (occupied or checked out).
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Free slots.
    pub fn available(&self) -> usize {
        self.capacity() - self.in_use
    }

    fn grow(&mut self) {
        let base = self.capacity();
        let last = base + self.element_count - 1;
        assert!(last < NIL as usize, "operation pool exceeded the slot index space");

        // A new chunk is only needed when the free list is empty, but keep the
        // old head as the tail so a preallocated chunk never orphans slots.
        let tail = self.free_head;
        let chunk: Box<[Slot<T>]> = (base..=last)
            .map(|index| Slot {
                generation: self.base_generation,
                state: SlotState::Vacant {
                    next_free: if index == last { tail } else { index as u32 + 1 },
                },
            })
            .collect();

        self.chunks.push(chunk);
        self.free_head = base as u32;
        self.chunk_allocations += 1;

        debug!(
            chunks = self.chunks.len(),
            slots = self.capacity(),
            "Operation pool grew"
        );
    }

    #[inline]
    fn locate(&self, index: u32) -> (usize, usize) {
        let index = index as usize;
        (index / self.element_count, index % self.element_count)
    }

    fn slot(&self, id: SlotId) -> Option<&Slot<T>> {
        let (chunk, offset) = self.locate(id.index);
        let slot = self.chunks.get(chunk)?.get(offset)?;
        (slot.generation == id.generation).then_some(slot)
    }

    fn slot_mut(&mut self, id: SlotId) -> Option<&mut Slot<T>> {
        let (chunk, offset) = self.locate(id.index);
        let slot = self.chunks.get_mut(chunk)?.get_mut(offset)?;
        (slot.generation == id.generation).then_some(slot)
    }

    /// Free a reserved slot. `Some(value)` if it still held one.
    fn vacate(&mut self, id: SlotId) -> Option<Option<T>> {
        let free_head = self.free_head;
        let slot = self.slot_mut(id)?;
        if matches!(slot.state, SlotState::Vacant { .. }) {
            return None;
        }

        slot.generation = slot.generation.wrapping_add(1);
        let previous = mem::replace(
            &mut slot.state,
            SlotState::Vacant {
                next_free: free_head,
            },
        );
        self.free_head = id.index;
        self.in_use -= 1;

        Some(match previous {
            SlotState::Occupied(value) => Some(value),
            _ => None,
        })
    }
}

impl<T> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("element_count", &self.element_count)
            .field("chunks", &self.chunks.len())
            .field("in_use", &self.in_use)
            .field("available", &self.available())
            .finish()
    }
}

/// Mutual exclusion around a pool.
pub trait PoolLock<P> {
    fn wrap(pool: P) -> Self;

    /// Run `f` with exclusive access to the pool.
    fn with<R>(&self, f: impl FnOnce(&mut P) -> R) -> R;
}

/// No-op lock for pools owned by a single thread.
///
/// Not `Sync`, so a `SyncPool` using it cannot be shared across threads.
pub struct NullLock<P>(RefCell<P>);

impl<P> PoolLock<P> for NullLock<P> {
    fn wrap(pool: P) -> Self {
        NullLock(RefCell::new(pool))
    }

    #[inline]
    fn with<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        f(&mut *self.0.borrow_mut())
    }
}

impl<P> PoolLock<P> for Mutex<P> {
    fn wrap(pool: P) -> Self {
        Mutex::new(pool)
    }

    #[inline]
    fn with<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        let mut guard = self.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut *guard)
    }
}

/// An [`ObjectPool`] behind a configurable lock.
///
/// The lock is held for exactly one pool call; nothing runs user code while
/// holding it.
pub struct SyncPool<T, L = Mutex<ObjectPool<T>>> {
    inner: L,
    _values: PhantomData<fn() -> T>,
}

impl<T, L: PoolLock<ObjectPool<T>>> SyncPool<T, L> {
    pub fn new(element_count: usize, preallocate: bool) -> Self {
        Self::from_pool(ObjectPool::new(element_count, preallocate))
    }

    pub fn from_pool(pool: ObjectPool<T>) -> Self {
        Self {
            inner: L::wrap(pool),
            _values: PhantomData,
        }
    }

    pub fn get(&self, value: T) -> SlotId {
        self.inner.with(|pool| pool.get(value))
    }

    pub fn release(&self, id: SlotId) -> bool {
        self.inner.with(|pool| pool.release(id))
    }

    pub fn checkout(&self, id: SlotId) -> Option<T> {
        self.inner.with(|pool| pool.checkout(id))
    }

    pub fn restore(&self, id: SlotId, value: T) -> Result<(), T> {
        self.inner.with(|pool| pool.restore(id, value))
    }

    pub fn take(&self, id: SlotId) -> Option<T> {
        self.inner.with(|pool| pool.take(id))
    }

    /// Run `f` on a stored value without moving it out of its slot.
    pub fn with_value<R>(&self, id: SlotId, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.inner.with(|pool| pool.peek_mut(id).map(f))
    }

    pub fn is_live(&self, id: SlotId) -> bool {
        self.inner.with(|pool| pool.is_live(id))
    }

    pub fn cleanup(&self) {
        self.inner.with(ObjectPool::cleanup)
    }

    pub fn purge(&self) {
        self.inner.with(ObjectPool::purge)
    }

    pub fn occupied_ids(&self) -> Vec<SlotId> {
        self.inner.with(|pool| pool.occupied_ids())
    }

    pub fn drain(&self) -> Vec<(SlotId, T)> {
        self.inner.with(ObjectPool::drain)
    }

    pub fn chunk_count(&self) -> usize {
        self.inner.with(|pool| pool.chunk_count())
    }

    pub fn chunk_allocations(&self) -> usize {
        self.inner.with(|pool| pool.chunk_allocations())
    }

    pub fn capacity(&self) -> usize {
        self.inner.with(|pool| pool.capacity())
    }

    pub fn in_use(&self) -> usize {
        self.inner.with(|pool| pool.in_use())
    }

    pub fn available(&self) -> usize {
        self.inner.with(|pool| pool.available())
    }
}
