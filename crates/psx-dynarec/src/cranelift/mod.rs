//! Cranelift backend for R3000A blocks.
//!
//! A block is planned first (decode up to the first control transfer plus its
//! delay slot, a block-ending instruction, the length cap, or an unreadable
//! word) and then emitted as one function with the block ABI. Memory accesses,
//! coprocessor 0 and exceptions go through host helpers via the call bridge.

mod decode;
mod emit;

use crate::arena::CodeArena;
use crate::block::{BlockCode, HelperFn};
use crate::trampoline::{block_signature, bridge_signature, exit_signature, TrampolineSet};
use crate::translator::{
    CompileError, DirectExit, InstructionSource, TranslateRequest, Translation, Translator,
    TranslatorStats,
};

/// Host routines generated code may call.
///
/// Every helper receives `(cpu, host, a0, a1)`. Helpers that raise a guest
/// exception set `CpuState::block_aborted` and `abort_pc`; the block then
/// leaves through the exit trampoline.
#[derive(Clone, Copy)]
pub struct HelperTable {
    /// `(addr, _) -> zero-extended byte`
    pub load_u8: HelperFn,
    pub load_u16: HelperFn,
    pub load_u32: HelperFn,
    /// `(addr, old rt) -> merged rt`
    pub load_word_left: HelperFn,
    pub load_word_right: HelperFn,
    /// `(addr, value)`
    pub store_u8: HelperFn,
    pub store_u16: HelperFn,
    pub store_u32: HelperFn,
    pub store_word_left: HelperFn,
    pub store_word_right: HelperFn,
    /// `(reg, _) -> value`
    pub mfc0: HelperFn,
    /// `(reg, value)`
    pub mtc0: HelperFn,
    pub rfe: HelperFn,
    pub syscall: HelperFn,
    pub brk: HelperFn,
    /// `(rs, rt)`, writes HI/LO.
    pub div: HelperFn,
    pub divu: HelperFn,
    /// Raises the arithmetic overflow exception.
    pub overflow: HelperFn,
    /// `(instruction word, _)`: COP2 operations and LWC2/SWC2.
    pub cop2: HelperFn,
    /// `(instruction word, _)`: fallback for encodings with no translation.
    /// Without it such encodings end the block instead.
    pub reserved: Option<HelperFn>,
}

impl std::fmt::Debug for HelperTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperTable")
            .field("reserved", &self.reserved.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct TranslatorConfig {
    pub helpers: HelperTable,
    /// Physical addresses direct exits never link to. Entering them always
    /// goes through the dispatcher, which may intercept the call.
    pub unlinked_targets: Vec<u32>,
}

impl TranslatorConfig {
    /// BIOS A0/B0/C0 function call vectors.
    pub const BIOS_VECTORS: [u32; 3] = [0xA0, 0xB0, 0xC0];

    pub fn new(helpers: HelperTable) -> Self {
        Self {
            helpers,
            unlinked_targets: Self::BIOS_VECTORS.to_vec(),
        }
    }
}

pub struct CraneliftTranslator {
    config: TranslatorConfig,
    stats: TranslatorStats,
}

impl CraneliftTranslator {
    pub fn new(config: TranslatorConfig) -> Self {
        Self {
            config,
            stats: TranslatorStats::default(),
        }
    }
}

impl Translator for CraneliftTranslator {
    fn name(&self) -> &'static str {
        "cranelift"
    }

    fn stats(&self) -> TranslatorStats {
        self.stats
    }

    fn reset_stats(&mut self) {
        self.stats = TranslatorStats::default();
    }

    fn translate(
        &mut self,
        request: &TranslateRequest,
        source: &mut dyn InstructionSource,
        arena: &mut CodeArena,
        trampolines: &TrampolineSet,
    ) -> Result<Translation, CompileError> {
        let has_fallback = self.config.helpers.reserved.is_some();
        let plan = decode::plan_block(request.pc, request.max_instructions, source, has_fallback)?;

        let mut exits = Vec::new();
        for target_pc in emit::direct_targets(&plan, &self.config.unlinked_targets) {
            let site = arena.alloc_link(trampolines.slow_path().as_ptr())?;
            exits.push(DirectExit { target_pc, site });
        }
        let links: Vec<(u32, usize)> = exits
            .iter()
            .map(|e| (e.target_pc, arena.link_address(e.site)))
            .collect();

        let block_sig = block_signature(arena);
        let env = emit::EmitEnv {
            ptr: arena.pointer_type(),
            helpers: &self.config.helpers,
            bridge: trampolines.call_bridge_addr(),
            exit: trampolines.exit_addr(),
            block_sig: block_sig.clone(),
            exit_sig: exit_signature(arena),
            bridge_sig: bridge_signature(arena),
            links: &links,
        };
        let region = arena.define("psx_block", block_sig, |builder, entry| {
            emit::emit_block(builder, entry, &env, &plan);
        })?;
        // SAFETY: defined just above with the block signature.
        let code = unsafe { BlockCode::from_raw(region.entry) };

        let source_len = plan.source_len();
        self.stats.blocks += 1;
        self.stats.instructions += u64::from(source_len);
        if plan.idle.is_idle() {
            self.stats.idle_blocks += 1;
        }
        log::trace!(
            "Translated {:#010X}: {} insns, {} cycles, {} bytes, idle={:?}",
            request.pc,
            source_len,
            plan.cycles,
            region.len,
            plan.idle
        );

        Ok(Translation {
            code,
            native_len: region.len as u32,
            source_len,
            cycles: plan.cycles,
            idle: plan.idle,
            exits,
        })
    }
}
