use std::fmt::Write as _;

use psx_dynarec::{ArenaStats, CacheStats, LinkerStats, RecompilerStats, TranslatorStats};

/// Dispatcher counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub blocks_executed: u64,
    /// Blocks found on the direct-mapped slot without a full resolve.
    pub fast_hits: u64,
    /// Blocks that reported no cycles and were charged the minimum.
    pub min_charges: u64,
    pub aborts: u64,
    pub bus_errors: u64,
    pub address_errors: u64,
    pub interrupts: u64,
    /// Interrupts held back because no RAM handler is installed yet.
    pub interrupts_ignored: u64,
    pub idle_skips: u64,
    pub idle_cycles_skipped: u64,
    pub events_dispatched: u64,
    pub bios_intercepts: u64,
    pub smc_pages: u64,
    pub frames: u64,
}

/// Snapshot of every counter in the machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct PsxStats {
    pub cycles: u64,
    pub dispatch: DispatchStats,
    pub recompiler: RecompilerStats,
    pub translator: TranslatorStats,
    pub cache: CacheStats,
    pub linker: LinkerStats,
    pub arena: ArenaStats,
    pub cache_len: usize,
    pub arena_used: usize,
}

impl PsxStats {
    /// One `key=value` line for logs.
    pub fn stats_line(&self) -> String {
        let d = &self.dispatch;
        let r = &self.recompiler;
        let mut line = String::new();
        let _ = write!(
            line,
            "cycles={} frames={} blocks={} fast_hits={} cache_hits={} compiled={} compile_failures={} \
             flushes={} invalidated={} translated_insns={} idle_blocks={} cache_len={} \
             direct_hits={} chain_hits={} collisions={} links_immediate={} links_deferred={} \
             links_applied={} links_dropped={} links_forgotten={} \
             arena_used={} arena_bytes={} min_charges={} aborts={} bus_errors={} address_errors={} \
             interrupts={} interrupts_ignored={} idle_skips={} idle_cycles={} events={} \
             bios_intercepts={} smc_pages={}",
            self.cycles,
            d.frames,
            d.blocks_executed,
            d.fast_hits,
            r.cache_hits,
            r.blocks_compiled,
            r.compile_failures,
            r.flushes,
            r.invalidated_blocks,
            self.translator.instructions,
            self.translator.idle_blocks,
            self.cache_len,
            self.cache.direct_hits,
            self.cache.chain_hits,
            self.cache.collisions,
            self.linker.immediate,
            self.linker.deferred,
            self.linker.applied,
            self.linker.dropped,
            self.linker.forgotten,
            self.arena_used,
            self.arena.bytes_emitted,
            d.min_charges,
            d.aborts,
            d.bus_errors,
            d.address_errors,
            d.interrupts,
            d.interrupts_ignored,
            d.idle_skips,
            d.idle_cycles_skipped,
            d.events_dispatched,
            d.bios_intercepts,
            d.smc_pages,
        );
        line
    }
}
