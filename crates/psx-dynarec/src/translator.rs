//! Translator contract consumed by the recompiler.

use crate::arena::{ArenaError, CodeArena, LinkSite};
use crate::block::{BlockCode, IdleKind};
use crate::trampoline::TrampolineSet;

/// Input needed to translate one guest block.
#[derive(Debug, Clone, Copy)]
pub struct TranslateRequest {
    /// Guest PC of the first instruction (cache key).
    pub pc: u32,
    /// Maximum number of instructions to include in the block.
    pub max_instructions: u32,
}

/// Guest instruction source used by the translator.
pub trait InstructionSource {
    fn read_u32(&mut self, addr: u32) -> Result<u32, CompileError>;
}

/// Translation failure.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// Source memory could not be read.
    #[error("instruction fetch failed at {addr:#010X}")]
    MemoryRead { addr: u32 },
    /// Instruction is not supported and no fallback helper is available.
    #[error("unsupported opcode {opcode:#010X} at {addr:#010X}")]
    UnsupportedOpcode { addr: u32, opcode: u32 },
    /// Generic backend failure.
    #[error("backend: {message}")]
    Backend { message: String },
    #[error(transparent)]
    Arena(#[from] ArenaError),
}

impl CompileError {
    /// Errors caused by the guest program rather than the host.
    pub fn is_guest_fault(&self) -> bool {
        matches!(
            self,
            CompileError::MemoryRead { .. } | CompileError::UnsupportedOpcode { .. }
        )
    }
}

/// A direct control-flow edge whose target is a known guest PC.
///
/// The site starts out pointing at the slow-path trampoline; the linker
/// rewrites it once the target has a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectExit {
    pub target_pc: u32,
    pub site: LinkSite,
}

/// Output of one translation.
#[derive(Debug, Clone)]
pub struct Translation {
    pub code: BlockCode,
    pub native_len: u32,
    pub source_len: u32,
    pub cycles: u32,
    pub idle: IdleKind,
    pub exits: Vec<DirectExit>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TranslatorStats {
    pub blocks: u64,
    pub instructions: u64,
    pub idle_blocks: u64,
}

/// Backend trait for block translators.
///
/// Translators carve code and link sites out of `arena` and may call the
/// trampolines in `trampolines`; they never touch the block cache.
pub trait Translator {
    fn name(&self) -> &'static str;

    fn stats(&self) -> TranslatorStats {
        TranslatorStats::default()
    }

    fn reset_stats(&mut self) {}

    fn translate(
        &mut self,
        request: &TranslateRequest,
        source: &mut dyn InstructionSource,
        arena: &mut CodeArena,
        trampolines: &TrampolineSet,
    ) -> Result<Translation, CompileError>;
}
