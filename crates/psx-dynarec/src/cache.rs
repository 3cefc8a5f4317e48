//! Direct-mapped block cache with an overflow node pool.
//!
//! Slot index is `(pc >> 2) & mask`. The first block hashing to a slot lives
//! in the slot itself so the common lookup is one compare; later blocks that
//! collide are chained through nodes taken from a fixed-size pool.

use crate::block::{BlockEntry, IdleKind};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("block cache allocation failed ({slots} slots, {pool} pool nodes)")]
    Alloc { slots: usize, pool: usize },
    #[error("block cache overflow pool exhausted ({capacity} nodes)")]
    PoolExhausted { capacity: usize },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub direct_hits: u64,
    pub chain_hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub replacements: u64,
    pub collisions: u64,
    pub removals: u64,
    pub clears: u64,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    entry: BlockEntry,
    next: Option<u32>,
}

pub struct BlockCache {
    slots: Vec<Option<BlockEntry>>,
    chains: Vec<Option<u32>>,
    pool: Vec<Node>,
    free: Vec<u32>,
    pool_capacity: usize,
    mask: u32,
    len: usize,
    stats: CacheStats,
}

impl BlockCache {
    /// `slots` is rounded up to a power of two. All storage is reserved up
    /// front; failure here is fatal for the caller.
    pub fn new(slots: usize, pool_capacity: usize) -> Result<Self, CacheError> {
        let slots = slots.max(1).next_power_of_two();
        let err = || CacheError::Alloc {
            slots,
            pool: pool_capacity,
        };

        let mut slot_vec = Vec::new();
        slot_vec.try_reserve_exact(slots).map_err(|_| err())?;
        slot_vec.resize(slots, None);
        let mut chains = Vec::new();
        chains.try_reserve_exact(slots).map_err(|_| err())?;
        chains.resize(slots, None);
        let mut pool = Vec::new();
        pool.try_reserve_exact(pool_capacity).map_err(|_| err())?;
        let mut free = Vec::new();
        free.try_reserve_exact(pool_capacity).map_err(|_| err())?;

        Ok(Self {
            slots: slot_vec,
            chains,
            pool,
            free,
            pool_capacity,
            mask: (slots - 1) as u32,
            len: 0,
            stats: CacheStats::default(),
        })
    }

    #[inline]
    fn slot_index(&self, pc: u32) -> usize {
        ((pc >> 2) & self.mask) as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Overflow nodes currently in use.
    pub fn pool_used(&self) -> usize {
        self.pool.len() - self.free.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = CacheStats::default();
    }

    /// Fast path: the slot's resident block, if it is for `pc`.
    #[inline]
    pub fn lookup_direct(&self, pc: u32) -> Option<&BlockEntry> {
        self.slots[self.slot_index(pc)]
            .as_ref()
            .filter(|entry| entry.pc == pc)
    }

    fn find_in_chain(&self, pc: u32) -> Option<u32> {
        let mut cursor = self.chains[self.slot_index(pc)];
        while let Some(idx) = cursor {
            let node = &self.pool[idx as usize];
            if node.entry.pc == pc {
                return Some(idx);
            }
            cursor = node.next;
        }
        None
    }

    /// Full lookup: slot first, then the overflow chain.
    pub fn lookup(&self, pc: u32) -> Option<&BlockEntry> {
        self.lookup_direct(pc).or_else(|| {
            self.find_in_chain(pc)
                .map(|idx| &self.pool[idx as usize].entry)
        })
    }

    /// Lookup that records which path answered.
    pub fn lookup_counted(&mut self, pc: u32) -> Option<BlockEntry> {
        if let Some(entry) = self.lookup_direct(pc).copied() {
            self.stats.direct_hits += 1;
            return Some(entry);
        }
        if let Some(idx) = self.find_in_chain(pc) {
            self.stats.chain_hits += 1;
            return Some(self.pool[idx as usize].entry);
        }
        self.stats.misses += 1;
        None
    }

    /// Publish a block. An existing block for the same PC is replaced in
    /// place, so the cache never holds two entries for one PC.
    pub fn insert(&mut self, entry: BlockEntry) -> Result<(), CacheError> {
        let slot = self.slot_index(entry.pc);
        match self.slots[slot] {
            None => {
                self.slots[slot] = Some(entry);
                self.len += 1;
                self.stats.inserts += 1;
                return Ok(());
            }
            Some(resident) if resident.pc == entry.pc => {
                self.slots[slot] = Some(entry);
                self.stats.replacements += 1;
                return Ok(());
            }
            Some(_) => {}
        }

        if let Some(idx) = self.find_in_chain(entry.pc) {
            self.pool[idx as usize].entry = entry;
            self.stats.replacements += 1;
            return Ok(());
        }

        let node = Node {
            entry,
            next: self.chains[slot],
        };
        let idx = if let Some(idx) = self.free.pop() {
            self.pool[idx as usize] = node;
            idx
        } else if self.pool.len() < self.pool_capacity {
            self.pool.push(node);
            (self.pool.len() - 1) as u32
        } else {
            return Err(CacheError::PoolExhausted {
                capacity: self.pool_capacity,
            });
        };
        self.chains[slot] = Some(idx);
        self.len += 1;
        self.stats.inserts += 1;
        self.stats.collisions += 1;
        Ok(())
    }

    /// Refine the idle classification of a published block.
    pub fn set_idle(&mut self, pc: u32, idle: IdleKind) -> bool {
        let slot = self.slot_index(pc);
        if let Some(entry) = self.slots[slot].as_mut().filter(|e| e.pc == pc) {
            entry.idle = idle;
            return true;
        }
        if let Some(idx) = self.find_in_chain(pc) {
            self.pool[idx as usize].entry.idle = idle;
            return true;
        }
        false
    }

    /// Remove the block for `pc`, promoting the chain head into the slot.
    pub fn remove(&mut self, pc: u32) -> Option<BlockEntry> {
        let slot = self.slot_index(pc);
        if let Some(resident) = self.slots[slot].filter(|e| e.pc == pc) {
            self.slots[slot] = match self.chains[slot] {
                Some(head) => {
                    let node = self.pool[head as usize];
                    self.chains[slot] = node.next;
                    self.free.push(head);
                    Some(node.entry)
                }
                None => None,
            };
            self.len -= 1;
            self.stats.removals += 1;
            return Some(resident);
        }

        let mut prev: Option<u32> = None;
        let mut cursor = self.chains[slot];
        while let Some(idx) = cursor {
            let node = self.pool[idx as usize];
            if node.entry.pc == pc {
                match prev {
                    Some(p) => self.pool[p as usize].next = node.next,
                    None => self.chains[slot] = node.next,
                }
                self.free.push(idx);
                self.len -= 1;
                self.stats.removals += 1;
                return Some(node.entry);
            }
            prev = Some(idx);
            cursor = node.next;
        }
        None
    }

    /// Remove every block matching `pred`, returning them.
    pub fn remove_where(&mut self, mut pred: impl FnMut(&BlockEntry) -> bool) -> Vec<BlockEntry> {
        let doomed: Vec<u32> = self.iter().filter(|e| pred(e)).map(|e| e.pc).collect();
        doomed.into_iter().filter_map(|pc| self.remove(pc)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockEntry> + '_ {
        let slots = self.slots.iter().flatten();
        let chained = self.chains.iter().flat_map(move |head| {
            let mut cursor = *head;
            std::iter::from_fn(move || {
                let idx = cursor?;
                let node = &self.pool[idx as usize];
                cursor = node.next;
                Some(&node.entry)
            })
        });
        slots.chain(chained)
    }

    /// Drop every entry. Storage stays reserved.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.chains.iter_mut().for_each(|head| *head = None);
        self.pool.clear();
        self.free.clear();
        self.len = 0;
        self.stats.clears += 1;
    }
}
