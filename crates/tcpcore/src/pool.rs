//! Fixed-capacity slab allocator backing every per-engine object pool
//! (streams, send/recv buffer bytes). Mirrors the C source's `mem_pool`:
//! a flat array plus a free list, sized once at engine startup and never
//! grown, so exhaustion is a normal, handled condition rather than an
//! allocator failure.

/// A generational index into a [`Pool`]. The generation catches use of a
/// stale index after the slot has been freed and reused, which a plain
/// `usize` index into the backing array cannot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolIndex {
    pub slot: u32,
    pub generation: u32,
}

struct Slot<T> {
    value: Option<T>,
    generation: u32,
}

/// A fixed-capacity object pool. `alloc` returns `None` once `capacity`
/// live objects exist; callers surface that as `EngineError::OutOfMemory`
/// rather than growing the pool, matching the "no pool grows past startup
/// size" resource policy.
pub struct Pool<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Pool<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        let mut free = Vec::with_capacity(capacity);
        for i in (0..capacity).rev() {
            slots.push(Slot { value: None, generation: 0 });
            free.push(i as u32);
        }
        Self { slots, free, live: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn alloc(&mut self, value: T) -> Option<PoolIndex> {
        let slot = self.free.pop()?;
        let entry = &mut self.slots[slot as usize];
        entry.value = Some(value);
        self.live += 1;
        Some(PoolIndex { slot, generation: entry.generation })
    }

    pub fn free(&mut self, idx: PoolIndex) -> Option<T> {
        let entry = self.slots.get_mut(idx.slot as usize)?;
        if entry.generation != idx.generation {
            return None;
        }
        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(idx.slot);
        self.live -= 1;
        Some(value)
    }

    pub fn get(&self, idx: PoolIndex) -> Option<&T> {
        let entry = self.slots.get(idx.slot as usize)?;
        if entry.generation != idx.generation {
            return None;
        }
        entry.value.as_ref()
    }

    pub fn get_mut(&mut self, idx: PoolIndex) -> Option<&mut T> {
        let entry = self.slots.get_mut(idx.slot as usize)?;
        if entry.generation != idx.generation {
            return None;
        }
        entry.value.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_reuses_slot_with_bumped_generation() {
        let mut pool: Pool<u32> = Pool::with_capacity(2);
        let a = pool.alloc(10).unwrap();
        assert_eq!(pool.live_count(), 1);
        pool.free(a).unwrap();
        assert_eq!(pool.live_count(), 0);

        let b = pool.alloc(20).unwrap();
        assert_eq!(b.slot, a.slot);
        assert_ne!(b.generation, a.generation);
        assert!(pool.get(a).is_none());
        assert_eq!(*pool.get(b).unwrap(), 20);
    }

    #[test]
    fn exhausted_pool_returns_none() {
        let mut pool: Pool<u32> = Pool::with_capacity(1);
        pool.alloc(1).unwrap();
        assert!(pool.alloc(2).is_none());
    }

    #[test]
    fn stale_index_after_free_is_rejected() {
        let mut pool: Pool<u32> = Pool::with_capacity(1);
        let a = pool.alloc(1).unwrap();
        pool.free(a).unwrap();
        assert!(pool.free(a).is_none());
    }
}
