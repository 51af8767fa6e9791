//! Bounded per-lookup generation window
//!
//! Lookups scan tier files newest-data-first, so the first sighting of
//! a generation is authoritative and later sightings are stale copies.
//! The window keeps the highest N distinct generations seen, evicting
//! the lowest when a higher one arrives.

use std::collections::BTreeMap;

use crate::shard::PostingsRef;

pub struct GenerationWindow {
    cap: usize,
    entries: BTreeMap<u32, (PostingsRef, u32)>,
    total_count: u64,
}

impl GenerationWindow {
    /// A cap of zero means unbounded.
    pub fn new(cap: usize) -> Self {
        GenerationWindow {
            cap: if cap == 0 { usize::MAX } else { cap },
            entries: BTreeMap::new(),
            total_count: 0,
        }
    }

    /// Offer one generation's postings. Returns whether it was kept.
    pub fn insert(&mut self, generation: u32, postings: PostingsRef, count: u32) -> bool {
        if self.entries.contains_key(&generation) {
            return false;
        }
        if self.entries.len() >= self.cap {
            let lowest = self
                .entries
                .first_key_value()
                .map(|(generation, _)| *generation);
            match lowest {
                Some(low) if generation > low => {
                    if let Some((_, (_, evicted))) = self.entries.pop_first() {
                        self.total_count -= u64::from(evicted);
                    }
                }
                _ => return false,
            }
        }
        self.entries.insert(generation, (postings, count));
        self.total_count += u64::from(count);
        true
    }

    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Kept generations in ascending order.
    pub fn into_entries(self) -> Vec<(u32, PostingsRef)> {
        self.entries
            .into_iter()
            .map(|(generation, (postings, _))| (generation, postings))
            .collect()
    }
}
