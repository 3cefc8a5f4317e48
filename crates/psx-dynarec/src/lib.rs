//! Dynamic recompiler core for the PlayStation's R3000A.
//!
//! Guest blocks are translated with Cranelift into a bump-allocated code
//! arena, published in a direct-mapped block cache, and stitched together by
//! the Direct Block Linker so hot paths chain from block to block without
//! returning to the dispatcher. The dispatcher and the hardware model live in
//! `psx-core`; this crate only knows about [`CpuState`] and the helper table.

pub mod arena;
pub mod block;
pub mod cache;
pub mod cpu;
pub mod cranelift;
pub mod linker;
pub mod recompiler;
pub mod trampoline;
pub mod translator;

pub use arena::{ArenaConfig, ArenaError, ArenaStats, CodeArena, LinkSite};
pub use block::{BlockCode, BlockEntry, BlockFn, ExitFn, HelperFn, IdleKind};
pub use cache::{BlockCache, CacheError, CacheStats};
pub use cpu::{Cop0, CpuState};
pub use cranelift::{CraneliftTranslator, HelperTable, TranslatorConfig};
pub use linker::{DirectBlockLinker, LinkOutcome, LinkerStats, PatchSite};
pub use recompiler::{DynarecError, Recompiler, RecompilerConfig, RecompilerStats, Resolved};
pub use trampoline::TrampolineSet;
pub use translator::{
    CompileError, DirectExit, InstructionSource, TranslateRequest, Translation, Translator,
    TranslatorStats,
};
