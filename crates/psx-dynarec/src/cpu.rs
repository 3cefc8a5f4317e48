//! Guest CPU state shared between generated code and host helpers.
//!
//! The field order is part of the block calling convention: generated code
//! addresses registers by fixed byte offsets, so the struct is `repr(C)` and
//! every offset the translator uses is exported below.

use std::mem::offset_of;

/// COP0 (system control coprocessor) register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Cop0 {
    pub regs: [u32; 32],
}

// COP0 register indices
impl Cop0 {
    pub const BPC: usize = 3;
    pub const BDA: usize = 5;
    pub const JUMPDEST: usize = 6;
    pub const DCIC: usize = 7;
    pub const BAD_VADDR: usize = 8;
    pub const BDAM: usize = 9;
    pub const BPCM: usize = 11;
    pub const SR: usize = 12;
    pub const CAUSE: usize = 13;
    pub const EPC: usize = 14;
    pub const PRID: usize = 15;
}

impl Cop0 {
    /// SR.IEc: current interrupt enable.
    pub const SR_IEC: u32 = 1 << 0;
    /// SR.Im2: hardware interrupt line mask.
    pub const SR_IM_HW: u32 = 1 << 10;
    /// SR.IsC: isolate cache (stores do not reach memory).
    pub const SR_ISC: u32 = 1 << 16;
    /// SR.BEV: exception vectors in BIOS.
    pub const SR_BEV: u32 = 1 << 22;
    /// SR.CU2: GTE enabled.
    pub const SR_CU2: u32 = 1 << 30;
    /// CAUSE.IP2: hardware interrupt pending.
    pub const CAUSE_IP_HW: u32 = 1 << 10;

    pub fn new() -> Self {
        let mut regs = [0u32; 32];
        regs[Self::SR] = 0x1040_0000; // CU0 + BEV
        regs[Self::PRID] = 0x0000_0002; // R3000A
        Self { regs }
    }

    pub fn sr(&self) -> u32 {
        self.regs[Self::SR]
    }

    pub fn cause(&self) -> u32 {
        self.regs[Self::CAUSE]
    }

    /// True when SR allows the hardware interrupt line through.
    pub fn interrupts_enabled(&self) -> bool {
        let sr = self.sr();
        sr & Self::SR_IEC != 0 && sr & Self::SR_IM_HW != 0
    }

    pub fn set_hw_interrupt_pending(&mut self, pending: bool) {
        if pending {
            self.regs[Self::CAUSE] |= Self::CAUSE_IP_HW;
        } else {
            self.regs[Self::CAUSE] &= !Self::CAUSE_IP_HW;
        }
    }

    /// MTC0 with the R3000A's writable-bit rules for CAUSE.
    pub fn write_reg(&mut self, index: usize, val: u32) {
        let index = index & 0x1F;
        match index {
            Self::CAUSE => {
                // Only the two software interrupt bits are writable.
                let writable = val & 0x0000_0300;
                let preserved = self.regs[Self::CAUSE] & !0x0000_0300;
                self.regs[Self::CAUSE] = preserved | writable;
            }
            Self::PRID | Self::BAD_VADDR => {}
            _ => self.regs[index] = val,
        }
    }

    pub fn read_reg(&self, index: usize) -> u32 {
        self.regs[index & 0x1F]
    }
}

impl Default for Cop0 {
    fn default() -> Self {
        Self::new()
    }
}

/// MIPS R3000A register file plus dispatcher side channels.
#[derive(Debug, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct CpuState {
    /// 32 general-purpose registers. regs[0] is always 0.
    pub regs: [u32; 32],
    pub pc: u32,
    pub hi: u32,
    pub lo: u32,
    pub cop0: Cop0,
    /// GTE data registers (owned by the COP2 collaborator).
    pub cp2_data: [u32; 32],
    /// GTE control registers.
    pub cp2_ctrl: [u32; 32],
    /// Address of the instruction being executed, written by generated code
    /// before any helper call that may fault.
    pub current_pc: u32,
    /// Set when an exception was raised while a block was running.
    pub block_aborted: u32,
    /// PC to resume at after an aborted block.
    pub abort_pc: u32,
    /// Non-zero while the dispatcher is inside a compiled block.
    pub in_block: u32,
    pub initial_cycles_left: i32,
    /// Budget left when the block last left through the exit trampoline.
    pub cycles_left: i32,
    /// Direct links a block chain may still follow before returning.
    pub link_budget: u32,
}

impl CpuState {
    pub const RESET_VECTOR: u32 = 0xBFC0_0000;

    /// GPRs generated code keeps in SSA values for a whole block: v0, sp, fp
    /// and ra. The call bridge and the exit trampoline take them in this order.
    pub const PINNED: [u8; 4] = [2, 29, 30, 31];

    pub const PC_OFFSET: i32 = offset_of!(CpuState, pc) as i32;
    pub const HI_OFFSET: i32 = offset_of!(CpuState, hi) as i32;
    pub const LO_OFFSET: i32 = offset_of!(CpuState, lo) as i32;
    pub const COP0_OFFSET: i32 = offset_of!(CpuState, cop0) as i32;
    pub const CURRENT_PC_OFFSET: i32 = offset_of!(CpuState, current_pc) as i32;
    pub const BLOCK_ABORTED_OFFSET: i32 = offset_of!(CpuState, block_aborted) as i32;
    pub const CYCLES_LEFT_OFFSET: i32 = offset_of!(CpuState, cycles_left) as i32;
    pub const LINK_BUDGET_OFFSET: i32 = offset_of!(CpuState, link_budget) as i32;

    pub fn new() -> Self {
        Self {
            regs: [0; 32],
            pc: Self::RESET_VECTOR,
            hi: 0,
            lo: 0,
            cop0: Cop0::new(),
            cp2_data: [0; 32],
            cp2_ctrl: [0; 32],
            current_pc: Self::RESET_VECTOR,
            block_aborted: 0,
            abort_pc: 0,
            in_block: 0,
            initial_cycles_left: 0,
            cycles_left: 0,
            link_budget: 0,
        }
    }

    /// Byte offset of GPR `n` (`CPU_REG(n)`).
    pub const fn reg_offset(n: u8) -> i32 {
        (n as i32 & 0x1F) * 4
    }

    pub fn reg(&self, n: usize) -> u32 {
        self.regs[n & 0x1F]
    }

    pub fn set_reg(&mut self, n: usize, val: u32) {
        let n = n & 0x1F;
        if n != 0 {
            self.regs[n] = val;
        }
    }

    /// Takes the abort side channel, returning the resume PC if a block aborted.
    pub fn take_abort(&mut self) -> Option<u32> {
        if self.block_aborted != 0 {
            self.block_aborted = 0;
            Some(self.abort_pc)
        } else {
            None
        }
    }
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CpuState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const NAMES: [&str; 32] = [
            "zero", "at", "v0", "v1", "a0", "a1", "a2", "a3", "t0", "t1", "t2", "t3", "t4", "t5",
            "t6", "t7", "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "t8", "t9", "k0", "k1",
            "gp", "sp", "fp", "ra",
        ];
        writeln!(
            f,
            "pc={:08X} hi={:08X} lo={:08X} sr={:08X} cause={:08X} epc={:08X}",
            self.pc,
            self.hi,
            self.lo,
            self.cop0.sr(),
            self.cop0.cause(),
            self.cop0.regs[Cop0::EPC]
        )?;
        for (i, chunk) in self.regs.chunks(4).enumerate() {
            for (j, val) in chunk.iter().enumerate() {
                write!(f, "{:>4}={:08X} ", NAMES[i * 4 + j], val)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
