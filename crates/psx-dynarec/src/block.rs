//! Compiled block handles and the calling convention they share.

use crate::cpu::CpuState;

/// Entry signature of every compiled block and trampoline that stands in for one.
///
/// Arguments are the CPU state, the host context handed through to helpers,
/// and the cycle budget. The return value is the budget left unspent, which
/// may be negative when a block overshoots.
pub type BlockFn = unsafe extern "C" fn(*mut CpuState, *mut u8, i32) -> i32;

/// Host routine reachable from generated code through the call bridge.
pub type HelperFn = unsafe extern "C" fn(*mut CpuState, *mut u8, u32, u32) -> u32;

/// Exit trampoline: `(cpu, remaining, v0, sp, fp, ra) -> remaining`.
///
/// Writes the pinned registers (in [`CpuState::PINNED`] order) and the budget
/// back to `cpu` before returning.
pub type ExitFn = unsafe extern "C" fn(*mut CpuState, i32, u32, u32, u32, u32) -> i32;

/// Pointer to a compiled native entry point.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BlockCode(*const u8);

impl BlockCode {
    /// Wrap a raw entry produced by the code arena.
    ///
    /// # Safety
    ///
    /// `entry` must point at code with the [`BlockFn`] signature.
    pub unsafe fn from_raw(entry: *const u8) -> Self {
        Self(entry)
    }

    /// Wrap a host function as a block (used by tests and interpreters).
    pub fn from_fn(f: BlockFn) -> Self {
        Self(f as *const u8)
    }

    pub fn addr(self) -> usize {
        self.0 as usize
    }

    pub fn as_ptr(self) -> *const u8 {
        self.0
    }

    fn as_fn(self) -> BlockFn {
        // SAFETY: constructors only accept pointers with the BlockFn signature.
        unsafe { std::mem::transmute::<*const u8, BlockFn>(self.0) }
    }

    /// Run the block.
    ///
    /// # Safety
    ///
    /// The code must still be live (no arena reset since it was published),
    /// `cpu` must be valid for the call, and `host` must be the context the
    /// block's helpers were built for.
    pub unsafe fn call(self, cpu: *mut CpuState, host: *mut u8, cycles: i32) -> i32 {
        // SAFETY: forwarded from the caller's contract.
        unsafe { (self.as_fn())(cpu, host, cycles) }
    }
}

impl std::fmt::Debug for BlockCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlockCode({:p})", self.0)
    }
}

/// Idle-loop classification assigned by the translator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum IdleKind {
    #[default]
    None,
    /// Conditional branch back to its own start.
    Weak,
    /// Unconditional jump back to its own start.
    Strong,
}

impl IdleKind {
    pub fn is_idle(self) -> bool {
        self != IdleKind::None
    }
}

/// Metadata and executable for one cached block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry {
    /// Guest PC the block was compiled from (cache key).
    pub pc: u32,
    pub code: BlockCode,
    /// Native code size in bytes.
    pub native_len: u32,
    /// Number of guest instructions covered.
    pub source_len: u32,
    /// Cycle cost charged along the block's straight-line path.
    pub cycles: u32,
    pub idle: IdleKind,
}

impl BlockEntry {
    /// Exclusive end of the guest range covered.
    pub fn end_pc(&self) -> u32 {
        self.pc.wrapping_add(self.source_len.saturating_mul(4))
    }

    /// True if the guest range overlaps `[start, end)` in physical space.
    pub fn overlaps_phys(&self, start: u32, end: u32) -> bool {
        let phys = self.pc & 0x1FFF_FFFF;
        let phys_end = phys.saturating_add(self.source_len.saturating_mul(4));
        phys < end && start < phys_end
    }
}
