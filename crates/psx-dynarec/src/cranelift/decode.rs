//! R3000A instruction decoding and block planning.

use crate::block::IdleKind;
use crate::translator::{CompileError, InstructionSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoadKind {
    Byte,
    ByteUnsigned,
    Half,
    HalfUnsigned,
    Word,
    WordLeft,
    WordRight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StoreKind {
    Byte,
    Half,
    Word,
    WordLeft,
    WordRight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BranchCond {
    Eq,
    Ne,
    Lez,
    Gtz,
    Ltz,
    Gez,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Addi { rs: u8, rt: u8, imm: i16 },
    Addiu { rs: u8, rt: u8, imm: i16 },
    Slti { rs: u8, rt: u8, imm: i16 },
    Sltiu { rs: u8, rt: u8, imm: i16 },
    Andi { rs: u8, rt: u8, imm: u16 },
    Ori { rs: u8, rt: u8, imm: u16 },
    Xori { rs: u8, rt: u8, imm: u16 },
    Lui { rt: u8, imm: u16 },
    Add { rs: u8, rt: u8, rd: u8 },
    Addu { rs: u8, rt: u8, rd: u8 },
    Sub { rs: u8, rt: u8, rd: u8 },
    Subu { rs: u8, rt: u8, rd: u8 },
    And { rs: u8, rt: u8, rd: u8 },
    Or { rs: u8, rt: u8, rd: u8 },
    Xor { rs: u8, rt: u8, rd: u8 },
    Nor { rs: u8, rt: u8, rd: u8 },
    Slt { rs: u8, rt: u8, rd: u8 },
    Sltu { rs: u8, rt: u8, rd: u8 },
    Sll { rt: u8, rd: u8, sa: u8 },
    Srl { rt: u8, rd: u8, sa: u8 },
    Sra { rt: u8, rd: u8, sa: u8 },
    Sllv { rs: u8, rt: u8, rd: u8 },
    Srlv { rs: u8, rt: u8, rd: u8 },
    Srav { rs: u8, rt: u8, rd: u8 },
    Mult { rs: u8, rt: u8 },
    Multu { rs: u8, rt: u8 },
    Div { rs: u8, rt: u8 },
    Divu { rs: u8, rt: u8 },
    Mfhi { rd: u8 },
    Mflo { rd: u8 },
    Mthi { rs: u8 },
    Mtlo { rs: u8 },
    Load { kind: LoadKind, rs: u8, rt: u8, imm: i16 },
    Store { kind: StoreKind, rs: u8, rt: u8, imm: i16 },
    Mfc0 { rt: u8, rd: u8 },
    Mtc0 { rt: u8, rd: u8 },
    Rfe,
    /// COP2 operation or LWC2/SWC2, forwarded whole.
    Cop2 { raw: u32 },
    Syscall,
    Break,
    Jump { target: u32, link: bool },
    JumpReg { rs: u8, link: Option<u8> },
    Branch { cond: BranchCond, rs: u8, rt: u8, target: u32, link: bool },
    /// Encoding with no translation; raises a reserved-instruction exception.
    Reserved { raw: u32 },
}

impl Op {
    pub(crate) fn is_control(self) -> bool {
        matches!(self, Op::Jump { .. } | Op::JumpReg { .. } | Op::Branch { .. })
    }

    /// Instructions after which the dispatcher must look at the CPU again.
    pub(crate) fn ends_block(self) -> bool {
        matches!(self, Op::Syscall | Op::Break | Op::Mtc0 { .. } | Op::Rfe)
    }

    /// Whether the instruction writes guest-visible state outside the GPRs.
    pub(crate) fn has_side_effects(self) -> bool {
        match self {
            Op::Store { .. } | Op::Mtc0 { .. } | Op::Syscall | Op::Break => true,
            Op::Cop2 { raw } => {
                let opcode = raw >> 26;
                let rs = (raw >> 21) & 0x1F;
                opcode == 0x3A || (opcode == 0x12 && (rs == 4 || rs == 6))
            }
            _ => false,
        }
    }

    /// R3000A cycle cost used for budget accounting.
    pub(crate) fn cycles(self) -> u32 {
        match self {
            Op::Mult { .. } | Op::Multu { .. } => 6,
            Op::Div { .. } | Op::Divu { .. } => 36,
            Op::Load { .. } => 2,
            _ => 1,
        }
    }
}

fn branch_target(pc: u32, imm: i16) -> u32 {
    pc.wrapping_add(4)
        .wrapping_add(((imm as i32) << 2) as u32)
}

pub(crate) fn decode(raw: u32, pc: u32) -> Op {
    let opcode = (raw >> 26) as u8;
    let rs = ((raw >> 21) & 0x1F) as u8;
    let rt = ((raw >> 16) & 0x1F) as u8;
    let rd = ((raw >> 11) & 0x1F) as u8;
    let sa = ((raw >> 6) & 0x1F) as u8;
    let funct = (raw & 0x3F) as u8;
    let imm_u16 = raw as u16;
    let imm_i16 = imm_u16 as i16;
    let reserved = Op::Reserved { raw };

    match opcode {
        0x00 => match funct {
            0x00 => Op::Sll { rt, rd, sa },
            0x02 => Op::Srl { rt, rd, sa },
            0x03 => Op::Sra { rt, rd, sa },
            0x04 => Op::Sllv { rs, rt, rd },
            0x06 => Op::Srlv { rs, rt, rd },
            0x07 => Op::Srav { rs, rt, rd },
            0x08 => Op::JumpReg { rs, link: None },
            0x09 => Op::JumpReg { rs, link: Some(rd) },
            0x0C => Op::Syscall,
            0x0D => Op::Break,
            0x10 => Op::Mfhi { rd },
            0x11 => Op::Mthi { rs },
            0x12 => Op::Mflo { rd },
            0x13 => Op::Mtlo { rs },
            0x18 => Op::Mult { rs, rt },
            0x19 => Op::Multu { rs, rt },
            0x1A => Op::Div { rs, rt },
            0x1B => Op::Divu { rs, rt },
            0x20 => Op::Add { rs, rt, rd },
            0x21 => Op::Addu { rs, rt, rd },
            0x22 => Op::Sub { rs, rt, rd },
            0x23 => Op::Subu { rs, rt, rd },
            0x24 => Op::And { rs, rt, rd },
            0x25 => Op::Or { rs, rt, rd },
            0x26 => Op::Xor { rs, rt, rd },
            0x27 => Op::Nor { rs, rt, rd },
            0x2A => Op::Slt { rs, rt, rd },
            0x2B => Op::Sltu { rs, rt, rd },
            _ => reserved,
        },
        0x01 => {
            // The R3000A only looks at bit 0 (GEZ) and bit 4 (link) of rt.
            let cond = if rt & 0x01 != 0 {
                BranchCond::Gez
            } else {
                BranchCond::Ltz
            };
            Op::Branch {
                cond,
                rs,
                rt: 0,
                target: branch_target(pc, imm_i16),
                link: rt & 0x1E == 0x10,
            }
        }
        0x02 | 0x03 => Op::Jump {
            target: (pc.wrapping_add(4) & 0xF000_0000) | ((raw & 0x03FF_FFFF) << 2),
            link: opcode == 0x03,
        },
        0x04..=0x07 => Op::Branch {
            cond: match opcode {
                0x04 => BranchCond::Eq,
                0x05 => BranchCond::Ne,
                0x06 => BranchCond::Lez,
                _ => BranchCond::Gtz,
            },
            rs,
            rt,
            target: branch_target(pc, imm_i16),
            link: false,
        },
        0x08 => Op::Addi { rs, rt, imm: imm_i16 },
        0x09 => Op::Addiu { rs, rt, imm: imm_i16 },
        0x0A => Op::Slti { rs, rt, imm: imm_i16 },
        0x0B => Op::Sltiu { rs, rt, imm: imm_i16 },
        0x0C => Op::Andi { rs, rt, imm: imm_u16 },
        0x0D => Op::Ori { rs, rt, imm: imm_u16 },
        0x0E => Op::Xori { rs, rt, imm: imm_u16 },
        0x0F => Op::Lui { rt, imm: imm_u16 },
        0x10 => match rs {
            0x00 => Op::Mfc0 { rt, rd },
            0x04 => Op::Mtc0 { rt, rd },
            0x10 if funct == 0x10 => Op::Rfe,
            _ => reserved,
        },
        0x12 | 0x32 | 0x3A => Op::Cop2 { raw },
        0x20..=0x26 => Op::Load {
            kind: match opcode {
                0x20 => LoadKind::Byte,
                0x21 => LoadKind::Half,
                0x22 => LoadKind::WordLeft,
                0x23 => LoadKind::Word,
                0x24 => LoadKind::ByteUnsigned,
                0x25 => LoadKind::HalfUnsigned,
                _ => LoadKind::WordRight,
            },
            rs,
            rt,
            imm: imm_i16,
        },
        0x28 | 0x29 | 0x2A | 0x2B | 0x2E => Op::Store {
            kind: match opcode {
                0x28 => StoreKind::Byte,
                0x29 => StoreKind::Half,
                0x2A => StoreKind::WordLeft,
                0x2B => StoreKind::Word,
                _ => StoreKind::WordRight,
            },
            rs,
            rt,
            imm: imm_i16,
        },
        _ => reserved,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Insn {
    pub pc: u32,
    pub op: Op,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BranchPlan {
    pub insn: Insn,
    /// None when the delay slot was unreadable or held another branch.
    pub delay: Option<Insn>,
}

/// Instructions selected for one block, before any code is emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BlockPlan {
    pub start: u32,
    pub body: Vec<Insn>,
    pub branch: Option<BranchPlan>,
    /// PC reached by falling off the end of the block.
    pub fallthrough: u32,
    pub cycles: u32,
    pub idle: IdleKind,
}

impl BlockPlan {
    pub(crate) fn source_len(&self) -> u32 {
        // A branch always covers its delay slot, readable or not.
        let branch = if self.branch.is_some() { 2 } else { 0 };
        self.body.len() as u32 + branch
    }
}

fn classify_idle(start: u32, body: &[Insn], branch: &BranchPlan) -> IdleKind {
    let delay_effects = branch.delay.map(|d| d.op.has_side_effects()).unwrap_or(false);
    if delay_effects || body.iter().any(|i| i.op.has_side_effects()) {
        return IdleKind::None;
    }
    match branch.insn.op {
        Op::Jump {
            target,
            link: false,
        } if target == start => IdleKind::Strong,
        Op::Branch {
            cond,
            rs,
            rt,
            target,
            link: false,
        } if target == start => {
            let always = match cond {
                BranchCond::Eq => rs == rt,
                BranchCond::Gez | BranchCond::Lez => rs == 0,
                _ => false,
            };
            if always {
                IdleKind::Strong
            } else {
                IdleKind::Weak
            }
        }
        _ => IdleKind::None,
    }
}

/// Read and decode one block's worth of instructions.
///
/// With `has_fallback == false` reserved encodings end the block (or fail it
/// when they come first) instead of being routed to the fallback helper.
pub(crate) fn plan_block(
    start: u32,
    max_instructions: u32,
    source: &mut dyn InstructionSource,
    has_fallback: bool,
) -> Result<BlockPlan, CompileError> {
    let mut body: Vec<Insn> = Vec::new();
    let mut branch = None;
    let mut pc = start;

    for _ in 0..max_instructions.max(1) {
        let raw = match source.read_u32(pc) {
            Ok(raw) => raw,
            Err(err) if body.is_empty() => return Err(err),
            Err(_) => break,
        };
        let op = decode(raw, pc);
        if matches!(op, Op::Reserved { .. }) && !has_fallback {
            if body.is_empty() {
                return Err(CompileError::UnsupportedOpcode {
                    addr: pc,
                    opcode: raw,
                });
            }
            break;
        }

        if op.is_control() {
            let delay_pc = pc.wrapping_add(4);
            let delay = source
                .read_u32(delay_pc)
                .ok()
                .map(|raw| Insn {
                    pc: delay_pc,
                    op: decode(raw, delay_pc),
                })
                .filter(|d| {
                    let usable = !d.op.is_control()
                        && (has_fallback || !matches!(d.op, Op::Reserved { .. }));
                    if !usable {
                        log::debug!("Delay slot at {:#010X} treated as NOP ({:?})", d.pc, d.op);
                    }
                    usable
                });
            branch = Some(BranchPlan {
                insn: Insn { pc, op },
                delay,
            });
            pc = pc.wrapping_add(8);
            break;
        }

        body.push(Insn { pc, op });
        pc = pc.wrapping_add(4);
        if op.ends_block() {
            break;
        }
    }

    let mut cycles: u32 = body.iter().map(|i| i.op.cycles()).sum();
    if let Some(b) = &branch {
        cycles += b.insn.op.cycles() + b.delay.map(|d| d.op.cycles()).unwrap_or(1);
    }
    let idle = branch
        .as_ref()
        .map(|b| classify_idle(start, &body, b))
        .unwrap_or(IdleKind::None);

    Ok(BlockPlan {
        start,
        body,
        branch,
        fallthrough: pc,
        cycles,
        idle,
    })
}
