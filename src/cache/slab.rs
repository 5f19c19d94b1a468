//! Bounded slab pool backing a shared cache zone.
//!
//! Requests are rounded up to a power-of-two size class between
//! [`MIN_CHUNK_SIZE`] and [`PAGE_SIZE`]. The pool only accounts for memory;
//! node contents live in the cache arena, and a node may exist only while it
//! holds a [`SlabChunk`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest chunk handed out.
pub const MIN_CHUNK_SIZE: usize = 8;

/// Largest chunk handed out.
pub const PAGE_SIZE: usize = 4096;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SlabError {
    #[error("out of memory: {requested} bytes requested, {free} of {capacity} free")]
    OutOfMemory {
        requested: usize,
        free: usize,
        capacity: usize,
    },

    #[error("allocation of {0} bytes exceeds the largest size class")]
    TooLarge(usize),

    #[error("size class {0} has no live chunks")]
    NotAllocated(usize),
}

/// Handle to memory allocated from a [`SlabPool`]. Returned to the pool with [`SlabPool::free`].
#[derive(Debug, PartialEq, Eq)]
pub struct SlabChunk {
    class: usize,
    size: usize,
}

impl SlabChunk {
    /// Size of the chunk in bytes (the size class, not the request).
    pub fn size(&self) -> usize {
        self.size
    }
}

#[derive(Debug, Clone, Default)]
struct SizeClass {
    size: usize,
    live: usize,
    total_allocs: u64,
    failures: u64,
}

/// Per-class usage snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeClassStats {
    pub size: usize,
    pub live: usize,
    pub total_allocs: u64,
    pub failures: u64,
}

#[derive(Debug)]
pub struct SlabPool {
    capacity: usize,
    used: usize,
    classes: Vec<SizeClass>,
}

impl SlabPool {
    /// Create a pool that hands out at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        let mut classes = Vec::new();
        let mut size = MIN_CHUNK_SIZE;
        while size <= PAGE_SIZE {
            classes.push(SizeClass {
                size,
                ..Default::default()
            });
            size <<= 1;
        }

        Self {
            capacity,
            used: 0,
            classes,
        }
    }

    /// Size class a request of `n` bytes would occupy, or `None` when it is larger than a page.
    pub fn chunk_size(n: usize) -> Option<usize> {
        if n > PAGE_SIZE {
            return None;
        }
        Some(n.max(MIN_CHUNK_SIZE).next_power_of_two())
    }

    fn class_index(size: usize) -> usize {
        (size.trailing_zeros() - MIN_CHUNK_SIZE.trailing_zeros()) as usize
    }

    pub fn alloc(&mut self, n: usize) -> Result<SlabChunk, SlabError> {
        let size = Self::chunk_size(n).ok_or(SlabError::TooLarge(n))?;
        let idx = Self::class_index(size);

        if self.used + size > self.capacity {
            self.classes[idx].failures += 1;
            return Err(SlabError::OutOfMemory {
                requested: size,
                free: self.free_bytes(),
                capacity: self.capacity,
            });
        }

        let class = &mut self.classes[idx];
        class.live += 1;
        class.total_allocs += 1;
        self.used += size;

        Ok(SlabChunk { class: idx, size })
    }

    pub fn free(&mut self, chunk: SlabChunk) -> Result<(), SlabError> {
        let class = &mut self.classes[chunk.class];
        if class.live == 0 {
            return Err(SlabError::NotAllocated(chunk.size));
        }
        class.live -= 1;
        self.used = self.used.saturating_sub(chunk.size);
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn free_bytes(&self) -> usize {
        self.capacity.saturating_sub(self.used)
    }

    /// Used bytes as a fraction of capacity.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.used as f64 / self.capacity as f64
    }

    /// Number of live chunks across all classes.
    pub fn live_chunks(&self) -> usize {
        self.classes.iter().map(|c| c.live).sum()
    }

    /// Snapshot of classes that have seen any traffic.
    pub fn class_stats(&self) -> Vec<SizeClassStats> {
        self.classes
            .iter()
            .filter(|c| c.total_allocs > 0 || c.failures > 0)
            .map(|c| SizeClassStats {
                size: c.size,
                live: c.live,
                total_allocs: c.total_allocs,
                failures: c.failures,
            })
            .collect()
    }
}
