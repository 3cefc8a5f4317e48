//! Direct Block Linker.
//!
//! Every rewrite of a link word goes through [`DirectBlockLinker::patch`],
//! which pairs the store with an instruction-cache invalidation of the word.

use crate::arena::{CodeArena, LinkSite};
use crate::block::BlockCode;
use crate::cache::BlockCache;
use crate::translator::DirectExit;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkerStats {
    /// Exits linked at compile time because the target was already cached.
    pub immediate: u64,
    /// Exits recorded as pending patch sites.
    pub deferred: u64,
    /// Pending sites resolved when their target was compiled.
    pub applied: u64,
    /// Sites dropped because the pending list was full.
    pub dropped: u64,
    /// Linked sites reset to the slow path because their target went away.
    pub unlinked: u64,
    /// Sites discarded because the block holding them went away.
    pub forgotten: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Linked,
    Deferred,
    Dropped,
}

/// Patch site: a link word, the guest PC it should reach and the PC of the
/// block whose code reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchSite {
    pub site: LinkSite,
    pub target_pc: u32,
    pub owner: u32,
}

pub struct DirectBlockLinker {
    pending: Vec<PatchSite>,
    linked: Vec<PatchSite>,
    capacity: usize,
    stats: LinkerStats,
}

impl DirectBlockLinker {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: Vec::with_capacity(capacity),
            linked: Vec::new(),
            capacity,
            stats: LinkerStats::default(),
        }
    }

    pub fn stats(&self) -> LinkerStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = LinkerStats::default();
    }

    pub fn pending(&self) -> &[PatchSite] {
        &self.pending
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Rewrite one link word to `code`. Idempotent.
    pub fn patch(arena: &mut CodeArena, site: LinkSite, code: BlockCode) {
        arena.write_link(site, code.addr());
        arena.invalidate_icache(arena.link_address(site), std::mem::size_of::<usize>());
    }

    fn defer(&mut self, patch: PatchSite) -> LinkOutcome {
        if self.pending.len() >= self.capacity {
            // Stays on the slow path for good.
            self.stats.dropped += 1;
            log::warn!(
                "Patch site list full ({}), dropping edge to {:#010X}",
                self.capacity,
                patch.target_pc
            );
            return LinkOutcome::Dropped;
        }
        self.pending.push(patch);
        self.stats.deferred += 1;
        LinkOutcome::Deferred
    }

    /// Link an exit of the freshly translated block at `owner` now if its
    /// target is cached, or record it as pending.
    pub fn link_exit(
        &mut self,
        arena: &mut CodeArena,
        cache: &BlockCache,
        owner: u32,
        exit: DirectExit,
    ) -> LinkOutcome {
        let patch = PatchSite {
            site: exit.site,
            target_pc: exit.target_pc,
            owner,
        };
        match cache.lookup(exit.target_pc) {
            Some(target) => {
                Self::patch(arena, exit.site, target.code);
                self.linked.push(patch);
                self.stats.immediate += 1;
                LinkOutcome::Linked
            }
            None => self.defer(patch),
        }
    }

    /// Resolve every pending site waiting on `target_pc`, compacting the
    /// pending list. Returns the number of sites patched.
    pub fn apply(&mut self, arena: &mut CodeArena, target_pc: u32, code: BlockCode) -> usize {
        let mut patched = 0;
        let mut kept = 0;
        for i in 0..self.pending.len() {
            let patch = self.pending[i];
            if patch.target_pc == target_pc {
                Self::patch(arena, patch.site, code);
                self.linked.push(patch);
                patched += 1;
            } else {
                self.pending[kept] = patch;
                kept += 1;
            }
        }
        self.pending.truncate(kept);
        self.stats.applied += patched as u64;
        patched
    }

    /// Point every linked site whose target matches `pred` back at
    /// `slow_path` and return it to the pending list.
    pub fn unlink_where(
        &mut self,
        arena: &mut CodeArena,
        slow_path: BlockCode,
        mut pred: impl FnMut(u32) -> bool,
    ) -> usize {
        let mut unlinked = Vec::new();
        self.linked.retain(|patch| {
            if pred(patch.target_pc) {
                unlinked.push(*patch);
                false
            } else {
                true
            }
        });
        for patch in &unlinked {
            Self::patch(arena, patch.site, slow_path);
            self.defer(*patch);
        }
        self.stats.unlinked += unlinked.len() as u64;
        unlinked.len()
    }

    /// Drop every site, pending or linked, owned by a block matching `pred`.
    /// Their link words are never read again.
    pub fn forget_owned_by(&mut self, mut pred: impl FnMut(u32) -> bool) -> usize {
        let before = self.pending.len() + self.linked.len();
        self.pending.retain(|patch| !pred(patch.owner));
        self.linked.retain(|patch| !pred(patch.owner));
        let forgotten = before - self.pending.len() - self.linked.len();
        self.stats.forgotten += forgotten as u64;
        forgotten
    }

    /// Forget every site (used with a full arena reset).
    pub fn clear(&mut self) {
        self.pending.clear();
        self.linked.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaConfig;
    use crate::block::{BlockEntry, IdleKind};
    use crate::cpu::CpuState;
    use crate::trampoline::TrampolineSet;

    unsafe extern "C" fn block_a(_: *mut CpuState, _: *mut u8, cycles: i32) -> i32 {
        cycles - 1
    }

    unsafe extern "C" fn block_b(_: *mut CpuState, _: *mut u8, cycles: i32) -> i32 {
        cycles - 2
    }

    fn setup() -> (CodeArena, TrampolineSet, BlockCache) {
        let mut arena = CodeArena::new(ArenaConfig {
            code_capacity: 256 * 1024,
            link_capacity: 64,
            flush_margin: 0,
        })
        .expect("arena");
        let tramps = TrampolineSet::emit(&mut arena).expect("trampolines");
        let cache = BlockCache::new(64, 64).expect("cache");
        (arena, tramps, cache)
    }

    fn entry(pc: u32, code: BlockCode) -> BlockEntry {
        BlockEntry {
            pc,
            code,
            native_len: 0,
            source_len: 1,
            cycles: 1,
            idle: IdleKind::None,
        }
    }

    #[test]
    fn forward_edge_waits_on_slow_path_until_target_compiles() {
        let (mut arena, tramps, mut cache) = setup();
        let mut linker = DirectBlockLinker::new(16);
        let site = arena.alloc_link(tramps.slow_path().as_ptr()).expect("site");

        let outcome = linker.link_exit(
            &mut arena,
            &cache,
            0x1000,
            DirectExit {
                target_pc: 0x2000,
                site,
            },
        );
        assert_eq!(outcome, LinkOutcome::Deferred);
        assert_eq!(arena.link_target(site), tramps.slow_path().addr());

        let target = BlockCode::from_fn(block_b);
        cache.insert(entry(0x2000, target)).expect("insert");
        assert_eq!(linker.apply(&mut arena, 0x2000, target), 1);
        assert_eq!(arena.link_target(site), target.addr());
        assert_eq!(linker.pending_len(), 0);
        assert_eq!(linker.stats().applied, 1);
    }

    #[test]
    fn cached_target_links_immediately() {
        let (mut arena, tramps, mut cache) = setup();
        let target = BlockCode::from_fn(block_a);
        cache.insert(entry(0x3000, target)).expect("insert");
        let mut linker = DirectBlockLinker::new(16);
        let site = arena.alloc_link(tramps.slow_path().as_ptr()).expect("site");
        let outcome = linker.link_exit(
            &mut arena,
            &cache,
            0x1000,
            DirectExit {
                target_pc: 0x3000,
                site,
            },
        );
        assert_eq!(outcome, LinkOutcome::Linked);
        assert_eq!(arena.link_target(site), target.addr());
        assert_eq!(linker.stats().immediate, 1);
    }

    #[test]
    fn patching_twice_matches_patching_once() {
        let (mut arena, tramps, _) = setup();
        let site = arena.alloc_link(tramps.slow_path().as_ptr()).expect("site");
        let target = BlockCode::from_fn(block_a);

        DirectBlockLinker::patch(&mut arena, site, target);
        let once = arena.link_target(site);
        DirectBlockLinker::patch(&mut arena, site, target);
        assert_eq!(arena.link_target(site), once);
        assert_eq!(once, target.addr());
        assert_eq!(arena.stats().icache_invalidations, 2);
    }

    #[test]
    fn apply_only_touches_matching_sites() {
        let (mut arena, tramps, cache) = setup();
        let mut linker = DirectBlockLinker::new(16);
        let slow = tramps.slow_path();
        let s1 = arena.alloc_link(slow.as_ptr()).expect("site");
        let s2 = arena.alloc_link(slow.as_ptr()).expect("site");
        let s3 = arena.alloc_link(slow.as_ptr()).expect("site");
        for (site, target_pc) in [(s1, 0x100), (s2, 0x200), (s3, 0x100)] {
            linker.link_exit(&mut arena, &cache, 0x40, DirectExit { target_pc, site });
        }

        let code = BlockCode::from_fn(block_a);
        assert_eq!(linker.apply(&mut arena, 0x100, code), 2);
        assert_eq!(arena.link_target(s1), code.addr());
        assert_eq!(arena.link_target(s2), slow.addr());
        assert_eq!(arena.link_target(s3), code.addr());
        assert_eq!(
            linker.pending(),
            &[PatchSite {
                site: s2,
                target_pc: 0x200,
                owner: 0x40
            }]
        );
    }

    #[test]
    fn full_pending_list_drops_sites() {
        let (mut arena, tramps, cache) = setup();
        let mut linker = DirectBlockLinker::new(1);
        let slow = tramps.slow_path();
        let s1 = arena.alloc_link(slow.as_ptr()).expect("site");
        let s2 = arena.alloc_link(slow.as_ptr()).expect("site");
        assert_eq!(
            linker.link_exit(&mut arena, &cache, 0x40, DirectExit { target_pc: 0x10, site: s1 }),
            LinkOutcome::Deferred
        );
        assert_eq!(
            linker.link_exit(&mut arena, &cache, 0x40, DirectExit { target_pc: 0x20, site: s2 }),
            LinkOutcome::Dropped
        );
        assert_eq!(linker.apply(&mut arena, 0x20, BlockCode::from_fn(block_a)), 0);
        assert_eq!(arena.link_target(s2), slow.addr());
        assert_eq!(linker.stats().dropped, 1);
    }

    #[test]
    fn unlink_returns_sites_to_pending() {
        let (mut arena, tramps, mut cache) = setup();
        let mut linker = DirectBlockLinker::new(16);
        let slow = tramps.slow_path();
        let code = BlockCode::from_fn(block_a);
        cache.insert(entry(0x8000_1000, code)).expect("insert");
        let site = arena.alloc_link(slow.as_ptr()).expect("site");
        linker.link_exit(
            &mut arena,
            &cache,
            0x8000_0800,
            DirectExit {
                target_pc: 0x8000_1000,
                site,
            },
        );
        assert_eq!(arena.link_target(site), code.addr());

        let n = linker.unlink_where(&mut arena, slow, |pc| pc & 0x1FFF_FFFF == 0x1000);
        assert_eq!(n, 1);
        assert_eq!(arena.link_target(site), slow.addr());
        assert_eq!(linker.pending_len(), 1);

        let fresh = BlockCode::from_fn(block_b);
        assert_eq!(linker.apply(&mut arena, 0x8000_1000, fresh), 1);
        assert_eq!(arena.link_target(site), fresh.addr());
    }

    #[test]
    fn forgetting_an_owner_drops_its_sites() {
        let (mut arena, tramps, mut cache) = setup();
        let mut linker = DirectBlockLinker::new(16);
        let slow = tramps.slow_path();
        let code = BlockCode::from_fn(block_a);
        cache.insert(entry(0x500, code)).expect("insert");
        let pending = arena.alloc_link(slow.as_ptr()).expect("site");
        let linked = arena.alloc_link(slow.as_ptr()).expect("site");
        let other = arena.alloc_link(slow.as_ptr()).expect("site");
        linker.link_exit(&mut arena, &cache, 0x100, DirectExit { target_pc: 0x900, site: pending });
        linker.link_exit(&mut arena, &cache, 0x100, DirectExit { target_pc: 0x500, site: linked });
        linker.link_exit(&mut arena, &cache, 0x200, DirectExit { target_pc: 0x900, site: other });
        assert_eq!(linker.pending_len(), 2);

        assert_eq!(linker.forget_owned_by(|pc| pc == 0x100), 2);
        assert_eq!(linker.pending_len(), 1);
        assert_eq!(linker.pending()[0].owner, 0x200);
        assert_eq!(linker.stats().forgotten, 2);

        // The forgotten linked site is no longer reset when its target goes.
        assert_eq!(linker.unlink_where(&mut arena, slow, |pc| pc == 0x500), 0);
        assert_eq!(arena.link_target(linked), code.addr());
        assert_eq!(linker.apply(&mut arena, 0x900, code), 1);
        assert_eq!(arena.link_target(pending), slow.addr());
    }
}
