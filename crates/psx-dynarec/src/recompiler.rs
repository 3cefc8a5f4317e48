//! Recompiler pipeline: cache lookup, translation, publication and linking.

use crate::arena::{ArenaConfig, ArenaError, ArenaStats, CodeArena};
use crate::block::{BlockEntry, IdleKind};
use crate::cache::{BlockCache, CacheError, CacheStats};
use crate::linker::{DirectBlockLinker, LinkerStats};
use crate::trampoline::TrampolineSet;
use crate::translator::{
    CompileError, InstructionSource, TranslateRequest, Translator, TranslatorStats,
};

#[derive(Debug, Clone, Copy)]
pub struct RecompilerConfig {
    pub arena: ArenaConfig,
    pub cache_slots: usize,
    pub pool_nodes: usize,
    pub patch_sites: usize,
    pub max_block_instructions: u32,
}

impl Default for RecompilerConfig {
    fn default() -> Self {
        Self {
            arena: ArenaConfig::default(),
            cache_slots: 4096,
            pool_nodes: 32768,
            patch_sites: 8192,
            max_block_instructions: 64,
        }
    }
}

/// Fatal pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum DynarecError {
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("block at {pc:#010X} still failed after a full flush: {source}")]
    Compile { pc: u32, source: CompileError },
}

#[derive(Debug)]
pub enum Resolved {
    Hit(BlockEntry),
    Compiled(BlockEntry),
    /// The guest PC cannot be translated (unreadable or unsupported).
    Failed(CompileError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecompilerStats {
    pub cache_hits: u64,
    pub blocks_compiled: u64,
    pub compile_failures: u64,
    pub flushes: u64,
    pub invalidated_blocks: u64,
}

enum PublishError {
    Compile(CompileError),
    Cache(CacheError),
}

impl PublishError {
    fn is_guest_fault(&self) -> bool {
        matches!(self, PublishError::Compile(err) if err.is_guest_fault())
    }
}

/// Core recompiler pipeline: arena + cache + linker + backend translator.
pub struct Recompiler {
    translator: Box<dyn Translator>,
    config: RecompilerConfig,
    arena: CodeArena,
    trampolines: TrampolineSet,
    cache: BlockCache,
    linker: DirectBlockLinker,
    stats: RecompilerStats,
}

impl Recompiler {
    pub fn new(translator: Box<dyn Translator>, config: RecompilerConfig) -> Result<Self, DynarecError> {
        let mut arena = CodeArena::new(config.arena)?;
        let trampolines = TrampolineSet::emit(&mut arena)?;
        let cache = BlockCache::new(config.cache_slots, config.pool_nodes)?;
        log::debug!(
            "Recompiler: backend={} slots={} pool={} patch_sites={}",
            translator.name(),
            cache.slot_count(),
            config.pool_nodes,
            config.patch_sites
        );
        Ok(Self {
            translator,
            linker: DirectBlockLinker::new(config.patch_sites),
            config,
            arena,
            trampolines,
            cache,
            stats: RecompilerStats::default(),
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.translator.name()
    }

    pub fn config(&self) -> &RecompilerConfig {
        &self.config
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    pub fn linker(&self) -> &DirectBlockLinker {
        &self.linker
    }

    pub fn arena(&self) -> &CodeArena {
        &self.arena
    }

    pub fn trampolines(&self) -> &TrampolineSet {
        &self.trampolines
    }

    pub fn stats(&self) -> RecompilerStats {
        self.stats
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn linker_stats(&self) -> LinkerStats {
        self.linker.stats()
    }

    pub fn arena_stats(&self) -> ArenaStats {
        self.arena.stats()
    }

    pub fn translator_stats(&self) -> TranslatorStats {
        self.translator.stats()
    }

    pub fn reset_stats(&mut self) {
        self.stats = RecompilerStats::default();
        self.cache.reset_stats();
        self.linker.reset_stats();
        self.translator.reset_stats();
    }

    /// Fast-path probe used before falling back to [`Recompiler::resolve`].
    #[inline]
    pub fn lookup_direct(&self, pc: u32) -> Option<BlockEntry> {
        self.cache.lookup_direct(pc).copied()
    }

    pub fn lookup(&self, pc: u32) -> Option<BlockEntry> {
        self.cache.lookup(pc).copied()
    }

    pub fn refine_idle(&mut self, pc: u32, idle: IdleKind) -> bool {
        self.cache.set_idle(pc, idle)
    }

    /// Find or build the block for `pc`.
    ///
    /// Guest faults come back as [`Resolved::Failed`]. Running out of arena,
    /// link words or overflow nodes flushes everything and retries once.
    pub fn resolve(
        &mut self,
        pc: u32,
        source: &mut dyn InstructionSource,
    ) -> Result<Resolved, DynarecError> {
        if let Some(entry) = self.cache.lookup_counted(pc) {
            self.stats.cache_hits += 1;
            return Ok(Resolved::Hit(entry));
        }

        if self.arena.needs_flush() {
            self.flush()?;
        }

        let err = match self.publish(pc, source) {
            Ok(entry) => return Ok(Resolved::Compiled(entry)),
            Err(err) if err.is_guest_fault() => return Ok(self.failed(pc, err)),
            Err(err) => err,
        };
        match &err {
            PublishError::Compile(e) => log::warn!("Compile at {pc:#010X} hit a resource limit: {e}"),
            PublishError::Cache(e) => log::warn!("Publishing {pc:#010X} failed: {e}"),
        }

        self.flush()?;
        match self.publish(pc, source) {
            Ok(entry) => Ok(Resolved::Compiled(entry)),
            Err(err) if err.is_guest_fault() => Ok(self.failed(pc, err)),
            Err(PublishError::Compile(source)) => Err(DynarecError::Compile { pc, source }),
            Err(PublishError::Cache(err)) => Err(err.into()),
        }
    }

    fn failed(&mut self, pc: u32, err: PublishError) -> Resolved {
        self.stats.compile_failures += 1;
        let err = match err {
            PublishError::Compile(err) => err,
            PublishError::Cache(err) => CompileError::Backend {
                message: err.to_string(),
            },
        };
        log::debug!(
            "Compile failed at {pc:#010X} (backend={}): {err}",
            self.translator.name()
        );
        Resolved::Failed(err)
    }

    fn publish(
        &mut self,
        pc: u32,
        source: &mut dyn InstructionSource,
    ) -> Result<BlockEntry, PublishError> {
        let request = TranslateRequest {
            pc,
            max_instructions: self.config.max_block_instructions.max(1),
        };
        let translation = self
            .translator
            .translate(&request, source, &mut self.arena, &self.trampolines)
            .map_err(PublishError::Compile)?;

        let entry = BlockEntry {
            pc,
            code: translation.code,
            native_len: translation.native_len,
            source_len: translation.source_len,
            cycles: translation.cycles,
            idle: translation.idle,
        };
        self.cache.insert(entry).map_err(PublishError::Cache)?;

        for exit in &translation.exits {
            self.linker.link_exit(&mut self.arena, &self.cache, pc, *exit);
        }
        self.linker.apply(&mut self.arena, pc, entry.code);
        self.arena
            .invalidate_icache(entry.code.addr(), entry.native_len as usize);
        self.stats.blocks_compiled += 1;
        Ok(entry)
    }

    /// Drop every block, patch site and byte of generated code.
    pub fn flush(&mut self) -> Result<(), DynarecError> {
        let dropped = self.cache.len();
        self.cache.clear();
        self.linker.clear();
        // SAFETY: the cache and linker no longer hold any code pointer, and
        // the dispatcher only calls in here between blocks.
        unsafe { self.arena.reset()? };
        self.trampolines = TrampolineSet::emit(&mut self.arena)?;
        self.stats.flushes += 1;
        log::warn!(
            "Code buffer flushed ({dropped} blocks dropped, generation {})",
            self.arena.generation()
        );
        Ok(())
    }

    /// Remove blocks overlapping physical `[start, start + len)`, forget the
    /// patch sites they owned, and send every edge that reached them back
    /// through the slow path.
    pub fn invalidate_range(&mut self, phys_start: u32, len: u32) -> usize {
        if len == 0 {
            return 0;
        }
        let end = phys_start.saturating_add(len);
        let removed = self.cache.remove_where(|e| e.overlaps_phys(phys_start, end));
        if removed.is_empty() {
            return 0;
        }
        let gone: Vec<u32> = removed.iter().map(|e| e.pc).collect();
        self.linker.forget_owned_by(|pc| gone.contains(&pc));
        let slow = self.trampolines.slow_path();
        let unlinked = self
            .linker
            .unlink_where(&mut self.arena, slow, |pc| gone.contains(&pc));
        self.stats.invalidated_blocks += removed.len() as u64;
        log::debug!(
            "Invalidated {} blocks in {phys_start:#010X}..{end:#010X} ({unlinked} links reset)",
            removed.len()
        );
        removed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockCode;
    use crate::cpu::CpuState;
    use crate::translator::{DirectExit, Translation};
    use std::cell::Cell;
    use std::collections::HashMap;
    use std::rc::Rc;

    unsafe extern "C" fn mock_block(_: *mut CpuState, _: *mut u8, cycles: i32) -> i32 {
        cycles - 4
    }

    /// Publishes `mock_block` for every PC, with one direct exit where
    /// `exits` says so.
    struct MockTranslator {
        calls: Rc<Cell<u32>>,
        exits: HashMap<u32, u32>,
    }

    impl Translator for MockTranslator {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn stats(&self) -> TranslatorStats {
            TranslatorStats {
                blocks: u64::from(self.calls.get()),
                ..TranslatorStats::default()
            }
        }

        fn reset_stats(&mut self) {
            self.calls.set(0);
        }

        fn translate(
            &mut self,
            request: &TranslateRequest,
            source: &mut dyn InstructionSource,
            arena: &mut CodeArena,
            trampolines: &TrampolineSet,
        ) -> Result<Translation, CompileError> {
            self.calls.set(self.calls.get() + 1);
            source.read_u32(request.pc)?;
            let mut exits = Vec::new();
            if let Some(&target_pc) = self.exits.get(&request.pc) {
                let site = arena.alloc_link(trampolines.slow_path().as_ptr())?;
                exits.push(DirectExit { target_pc, site });
            }
            Ok(Translation {
                code: BlockCode::from_fn(mock_block),
                native_len: 0,
                source_len: 4,
                cycles: 4,
                idle: IdleKind::None,
                exits,
            })
        }
    }

    struct Source;

    impl InstructionSource for Source {
        fn read_u32(&mut self, addr: u32) -> Result<u32, CompileError> {
            if addr & 0x1FFF_FFFF >= 0x1F00_0000 {
                Err(CompileError::MemoryRead { addr })
            } else {
                Ok(0)
            }
        }
    }

    fn config() -> RecompilerConfig {
        RecompilerConfig {
            arena: ArenaConfig {
                code_capacity: 256 * 1024,
                link_capacity: 64,
                flush_margin: 0,
            },
            cache_slots: 64,
            pool_nodes: 64,
            patch_sites: 64,
            max_block_instructions: 64,
        }
    }

    fn recompiler(config: RecompilerConfig, exits: &[(u32, u32)]) -> (Recompiler, Rc<Cell<u32>>) {
        let calls = Rc::new(Cell::new(0));
        let translator = MockTranslator {
            calls: calls.clone(),
            exits: exits.iter().copied().collect(),
        };
        let rc = Recompiler::new(Box::new(translator), config).expect("recompiler");
        (rc, calls)
    }

    #[test]
    fn cold_compile_then_cache_hit() {
        let (mut rc, calls) = recompiler(config(), &[]);
        assert!(matches!(
            rc.resolve(0x1000, &mut Source).expect("resolve"),
            Resolved::Compiled(entry) if entry.pc == 0x1000
        ));
        assert_eq!(calls.get(), 1);
        assert_eq!(rc.cache_len(), 1);

        assert!(matches!(
            rc.resolve(0x1000, &mut Source).expect("resolve"),
            Resolved::Hit(_)
        ));
        assert_eq!(calls.get(), 1);
        assert_eq!(rc.stats().cache_hits, 1);
        assert_eq!(rc.cache_stats().direct_hits, 1);
        assert!(rc.lookup_direct(0x1000).is_some());
    }

    #[test]
    fn guest_fault_is_reported_not_cached() {
        let (mut rc, calls) = recompiler(config(), &[]);
        let res = rc.resolve(0x1F00_0000, &mut Source).expect("resolve");
        assert!(matches!(
            res,
            Resolved::Failed(CompileError::MemoryRead { addr: 0x1F00_0000 })
        ));
        assert_eq!(rc.cache_len(), 0);
        assert_eq!(rc.stats().compile_failures, 1);

        rc.resolve(0x1F00_0000, &mut Source).expect("resolve");
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn pending_edge_is_patched_when_target_compiles() {
        let (mut rc, _) = recompiler(config(), &[(0x1000, 0x2000)]);
        rc.resolve(0x1000, &mut Source).expect("resolve");
        assert_eq!(rc.linker().pending_len(), 1);
        let site = rc.linker().pending()[0].site;
        assert_eq!(rc.arena().link_target(site), rc.trampolines().slow_path().addr());

        rc.resolve(0x2000, &mut Source).expect("resolve");
        assert_eq!(rc.linker().pending_len(), 0);
        assert_eq!(
            rc.arena().link_target(site),
            BlockCode::from_fn(mock_block).addr()
        );
        assert_eq!(rc.linker_stats().applied, 1);
    }

    #[test]
    fn low_arena_flushes_before_compiling() {
        let mut cfg = config();
        cfg.arena.link_capacity = 2;
        let (mut rc, _) = recompiler(cfg, &[(0x100, 0x900), (0x200, 0x900), (0x300, 0x900)]);
        rc.resolve(0x100, &mut Source).expect("resolve");
        rc.resolve(0x200, &mut Source).expect("resolve");
        assert!(rc.arena().needs_flush());
        assert_eq!(rc.stats().flushes, 0);

        rc.resolve(0x300, &mut Source).expect("resolve");
        assert_eq!(rc.stats().flushes, 1);
        assert_eq!(rc.cache_len(), 1);
        assert!(rc.lookup(0x100).is_none());
        assert_eq!(rc.arena().generation(), 1);
        assert_eq!(rc.trampolines().generation(), 1);
    }

    #[test]
    fn pool_exhaustion_flushes_and_retries_once() {
        let mut cfg = config();
        cfg.cache_slots = 1;
        cfg.pool_nodes = 0;
        let (mut rc, calls) = recompiler(cfg, &[]);
        rc.resolve(0x1000, &mut Source).expect("resolve");
        let res = rc.resolve(0x2000, &mut Source).expect("resolve");
        assert!(matches!(res, Resolved::Compiled(entry) if entry.pc == 0x2000));
        assert_eq!(calls.get(), 3);
        assert_eq!(rc.stats().flushes, 1);
        assert_eq!(rc.cache_len(), 1);
    }

    #[test]
    fn invalidate_range_unlinks_and_relinks() {
        let (mut rc, _) = recompiler(config(), &[(0x8000_1000, 0x8000_2000)]);
        rc.resolve(0x8000_2000, &mut Source).expect("resolve");
        rc.resolve(0x8000_1000, &mut Source).expect("resolve");
        assert_eq!(rc.linker().pending_len(), 0);

        assert_eq!(rc.invalidate_range(0x2008, 4), 1);
        assert!(rc.lookup(0x8000_2000).is_none());
        assert!(rc.lookup(0x8000_1000).is_some());
        assert_eq!(rc.linker().pending_len(), 1);
        let site = rc.linker().pending()[0].site;
        assert_eq!(rc.arena().link_target(site), rc.trampolines().slow_path().addr());
        assert_eq!(rc.stats().invalidated_blocks, 1);

        rc.resolve(0x8000_2000, &mut Source).expect("resolve");
        assert_eq!(rc.linker().pending_len(), 0);
        assert_eq!(rc.invalidate_range(0x5000, 0x100), 0);
    }

    #[test]
    fn invalidated_blocks_release_their_patch_sites() {
        let mut cfg = config();
        cfg.patch_sites = 4;
        let (mut rc, _) = recompiler(
            cfg,
            &[(0x8000_1000, 0x8000_9000), (0x8000_3000, 0x8000_9000)],
        );
        for _ in 0..4 {
            rc.resolve(0x8000_1000, &mut Source).expect("resolve");
            assert_eq!(rc.linker().pending_len(), 1);
            assert_eq!(rc.invalidate_range(0x1000, 4), 1);
            assert_eq!(rc.linker().pending_len(), 0);
        }

        rc.resolve(0x8000_3000, &mut Source).expect("resolve");
        assert_eq!(rc.linker().pending_len(), 1);
        assert_eq!(rc.linker().pending()[0].owner, 0x8000_3000);
        assert_eq!(rc.linker_stats().dropped, 0);
        assert_eq!(rc.linker_stats().forgotten, 4);
    }

    #[test]
    fn reset_stats_clears_translator_counters() {
        let (mut rc, _) = recompiler(config(), &[]);
        rc.resolve(0x1000, &mut Source).expect("resolve");
        assert_eq!(rc.translator_stats().blocks, 1);
        rc.reset_stats();
        assert_eq!(rc.translator_stats(), TranslatorStats::default());
        assert_eq!(rc.stats(), RecompilerStats::default());
    }
}
