use psx_dynarec::{Cop0, CpuState};

/// Exception codes for the R3000A (stored in COP0 Cause register bits [6:2]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    Interrupt = 0,
    AddressErrorLoad = 4,
    AddressErrorStore = 5,
    BusErrorInstruction = 6,
    BusErrorData = 7,
    Syscall = 8,
    Breakpoint = 9,
    ReservedInstruction = 10,
    CoprocessorUnusable = 11,
    Overflow = 12,
}

/// General exception vector with SR.BEV clear.
pub const RAM_VECTOR: u32 = 0x8000_0080;
/// General exception vector with SR.BEV set.
pub const ROM_VECTOR: u32 = 0xBFC0_0180;

pub fn exception_vector(cop0: &Cop0) -> u32 {
    if cop0.sr() & Cop0::SR_BEV != 0 {
        ROM_VECTOR
    } else {
        RAM_VECTOR
    }
}

/// Take an exception at `cpu.current_pc` and jump to the handler.
///
/// Pushes the SR mode/interrupt-enable stack, records the code in CAUSE and
/// returns the vector. Inside a block the vector is also published through
/// the abort side channel so the dispatcher resumes there.
pub fn enter_exception(cpu: &mut CpuState, code: ExceptionCode) -> u32 {
    let cop0 = &mut cpu.cop0;
    cop0.regs[Cop0::EPC] = cpu.current_pc;
    let cause = cop0.regs[Cop0::CAUSE];
    cop0.regs[Cop0::CAUSE] = (cause & 0xFF00) | ((code as u32) << 2);
    let sr = cop0.regs[Cop0::SR];
    cop0.regs[Cop0::SR] = (sr & !0x3F) | ((sr << 2) & 0x3F);

    let vector = exception_vector(cop0);
    cpu.pc = vector;
    if cpu.in_block != 0 {
        cpu.block_aborted = 1;
        cpu.abort_pc = vector;
    }
    vector
}

/// RFE: pop the SR mode/interrupt-enable stack.
pub fn rfe(cpu: &mut CpuState) {
    let sr = cpu.cop0.regs[Cop0::SR];
    cpu.cop0.regs[Cop0::SR] = (sr & !0x0F) | ((sr >> 2) & 0x0F);
}
