//! Fixed-capacity slot pools.
//!
//! The gateway preallocates every message buffer it uses at initialization
//! time; at runtime the pools only hand out slot indexes. A slot carries a
//! `busy` flag (allocated) and a `ready` flag (fully initialized by its
//! producer and visible to consumers), so a producer can fill a slot before
//! announcing it. Exhaustion is a distinct error so callers can tell
//! saturation from configuration mistakes.

use crate::error::GatewayError;
use std::sync::{Arc, Mutex};

struct Slot<T> {
    busy: bool,
    ready: bool,
    value: T,
}

/// Fixed-capacity pool of uniform records addressed by index.
///
/// Internally a single short-held mutex guards the slot array; every
/// operation is a handful of loads and stores, so the pool can be shared
/// freely across producer and consumer tasks.
pub struct MessagePool<T> {
    name: &'static str,
    slots: Mutex<Vec<Slot<T>>>,
}

impl<T: Default> MessagePool<T> {
    /// Create a pool with `capacity` slots, all free.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot {
                busy: false,
                ready: false,
                value: T::default(),
            });
        }
        MessagePool {
            name,
            slots: Mutex::new(slots),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().expect("pool mutex poisoned").len()
    }

    /// Number of busy slots.
    pub fn in_use(&self) -> usize {
        let slots = self.slots.lock().expect("pool mutex poisoned");
        slots.iter().filter(|s| s.busy).count()
    }

    /// Allocate a free slot and return its index. The slot starts busy but
    /// not ready; the producer flips it with [`MessagePool::mark_ready`] once
    /// the record is fully initialized.
    pub fn acquire(&self) -> Result<u8, GatewayError> {
        let mut slots = self.slots.lock().expect("pool mutex poisoned");
        for (index, slot) in slots.iter_mut().enumerate() {
            if !slot.busy {
                slot.busy = true;
                slot.ready = false;
                slot.value = T::default();
                return Ok(index as u8);
            }
        }
        Err(GatewayError::PoolExhausted(self.name))
    }

    /// Mark a busy slot visible to consumers.
    pub fn mark_ready(&self, index: u8) -> bool {
        let mut slots = self.slots.lock().expect("pool mutex poisoned");
        match slots.get_mut(index as usize) {
            Some(slot) if slot.busy => {
                slot.ready = true;
                true
            }
            _ => false,
        }
    }

    pub fn is_ready(&self, index: u8) -> bool {
        let slots = self.slots.lock().expect("pool mutex poisoned");
        slots
            .get(index as usize)
            .map(|s| s.busy && s.ready)
            .unwrap_or(false)
    }

    /// Run `f` against the record stored in a busy slot. Returns `None` when
    /// the index is out of range or the slot is free.
    pub fn with_slot<R>(&self, index: u8, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut slots = self.slots.lock().expect("pool mutex poisoned");
        match slots.get_mut(index as usize) {
            Some(slot) if slot.busy => Some(f(&mut slot.value)),
            _ => None,
        }
    }

    /// Free a slot. Returns `false` when the slot was not busy (a double
    /// release, which callers treat as an internal fault).
    pub fn release(&self, index: u8) -> bool {
        let mut slots = self.slots.lock().expect("pool mutex poisoned");
        match slots.get_mut(index as usize) {
            Some(slot) if slot.busy => {
                slot.busy = false;
                slot.ready = false;
                slot.value = T::default();
                true
            }
            _ => false,
        }
    }
}

impl<T> std::fmt::Debug for MessagePool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePool").field("name", &self.name).finish()
    }
}

/// Owning handle to a pool slot, released on drop.
///
/// Used on the downlink path where the record leaves the allocating task and
/// is consumed elsewhere; the guard travels with the data and gives the slot
/// back when the consumer is done (or lost interest).
pub struct PoolHandle<T: Default> {
    pool: Arc<MessagePool<T>>,
    index: u8,
}

impl<T: Default> PoolHandle<T> {
    pub fn acquire(pool: &Arc<MessagePool<T>>) -> Result<Self, GatewayError> {
        let index = pool.acquire()?;
        Ok(PoolHandle {
            pool: Arc::clone(pool),
            index,
        })
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.pool.with_slot(self.index, f)
    }

    pub fn mark_ready(&self) {
        self.pool.mark_ready(self.index);
    }

    /// Move the record out of the slot, leaving a default value behind.
    pub fn take(&self) -> Option<T> {
        self.pool.with_slot(self.index, std::mem::take)
    }
}

impl<T: Default> Drop for PoolHandle<T> {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_until_exhausted() {
        let pool: MessagePool<u32> = MessagePool::new("test", 2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a, b);
        assert!(matches!(
            pool.acquire(),
            Err(GatewayError::PoolExhausted("test"))
        ));
        assert!(pool.release(a));
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn ready_flag_tracks_producer_handoff() {
        let pool: MessagePool<u32> = MessagePool::new("test", 1);
        let idx = pool.acquire().unwrap();
        assert!(!pool.is_ready(idx));
        pool.with_slot(idx, |v| *v = 42);
        assert!(pool.mark_ready(idx));
        assert!(pool.is_ready(idx));
        assert_eq!(pool.with_slot(idx, |v| *v), Some(42));
    }

    #[test]
    fn double_release_reports_fault() {
        let pool: MessagePool<u32> = MessagePool::new("test", 1);
        let idx = pool.acquire().unwrap();
        assert!(pool.release(idx));
        assert!(!pool.release(idx));
    }

    #[test]
    fn handle_releases_on_drop() {
        let pool = Arc::new(MessagePool::<u32>::new("test", 1));
        {
            let handle = PoolHandle::acquire(&pool).unwrap();
            handle.with(|v| *v = 7);
            assert_eq!(pool.in_use(), 1);
        }
        assert_eq!(pool.in_use(), 0);
    }
}
