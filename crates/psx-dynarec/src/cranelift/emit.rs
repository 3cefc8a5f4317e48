//! Cranelift IR emission for one planned block.

use cranelift_codegen::entity::EntityRef;
use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{types, Block, InstBuilder, MemFlags, SigRef, Signature, Type, Value};
use cranelift_frontend::{FunctionBuilder, Variable};

use super::decode::{BlockPlan, BranchCond, BranchPlan, Insn, LoadKind, Op, StoreKind};
use super::HelperTable;
use crate::block::HelperFn;
use crate::cpu::CpuState;

pub(crate) struct EmitEnv<'a> {
    pub ptr: Type,
    pub helpers: &'a HelperTable,
    pub bridge: usize,
    pub exit: usize,
    pub block_sig: Signature,
    pub exit_sig: Signature,
    pub bridge_sig: Signature,
    /// Link word address per linkable target PC.
    pub links: &'a [(u32, usize)],
}

struct Emitter<'a, 'b> {
    b: &'a mut FunctionBuilder<'b>,
    env: &'a EmitEnv<'a>,
    cpu: Value,
    host: Value,
    cycles: Value,
    flags: MemFlags,
    block_sig: SigRef,
    exit_sig: SigRef,
    bridge_sig: SigRef,
    pinned: [bool; 32],
    /// Cycles charged up to and including the instruction being emitted.
    spent: u32,
}

fn var(r: u8) -> Variable {
    Variable::new(usize::from(r))
}

impl Emitter<'_, '_> {
    fn konst(&mut self, value: u32) -> Value {
        self.b.ins().iconst(types::I32, i64::from(value))
    }

    fn kptr(&mut self, value: usize) -> Value {
        let ptr = self.env.ptr;
        self.b.ins().iconst(ptr, value as i64)
    }

    fn load_field(&mut self, offset: i32) -> Value {
        self.b.ins().load(types::I32, self.flags, self.cpu, offset)
    }

    fn store_field(&mut self, offset: i32, value: Value) {
        self.b.ins().store(self.flags, value, self.cpu, offset);
    }

    fn read(&mut self, r: u8) -> Value {
        if r == 0 {
            self.konst(0)
        } else if self.pinned[usize::from(r)] {
            self.b.use_var(var(r))
        } else {
            self.load_field(CpuState::reg_offset(r))
        }
    }

    fn write(&mut self, r: u8, value: Value) {
        if r == 0 {
            return;
        }
        if self.pinned[usize::from(r)] {
            self.b.def_var(var(r), value);
        } else {
            self.store_field(CpuState::reg_offset(r), value);
        }
    }

    fn flush_pinned(&mut self) {
        for r in CpuState::PINNED {
            let value = self.b.use_var(var(r));
            self.store_field(CpuState::reg_offset(r), value);
        }
    }

    fn reload_pinned(&mut self) {
        for r in CpuState::PINNED {
            let value = self.load_field(CpuState::reg_offset(r));
            self.b.def_var(var(r), value);
        }
    }

    fn pinned_values(&mut self) -> Vec<Value> {
        CpuState::PINNED
            .iter()
            .map(|&r| self.b.use_var(var(r)))
            .collect()
    }

    /// Leave through the exit trampoline with `remaining` cycles. The
    /// trampoline writes the pinned registers back.
    fn leave(&mut self, remaining: Value) {
        let exit = self.kptr(self.env.exit);
        let mut args = vec![self.cpu, remaining];
        args.extend(self.pinned_values());
        let call = self.b.ins().call_indirect(self.exit_sig, exit, &args);
        let result = self.b.inst_results(call)[0];
        self.b.ins().return_(&[result]);
    }

    fn remaining(&mut self) -> Value {
        let spent = self.konst(self.spent);
        self.b.ins().isub(self.cycles, spent)
    }

    fn leave_spent(&mut self) {
        let remaining = self.remaining();
        self.leave(remaining);
    }

    /// Call `helper(cpu, host, a0, a1)` through the bridge.
    ///
    /// The bridge writes the pinned registers out before the helper runs and
    /// returns them afterwards, so the helper sees and may change the
    /// architectural register file.
    fn call_helper(&mut self, helper: HelperFn, a0: Value, a1: Value, pc: u32, may_fault: bool) -> Value {
        let pc = self.konst(pc);
        self.store_field(CpuState::CURRENT_PC_OFFSET, pc);
        let bridge = self.kptr(self.env.bridge);
        let target = self.kptr(helper as usize);
        let mut args = vec![self.cpu, self.host, target, a0, a1];
        args.extend(self.pinned_values());
        let call = self.b.ins().call_indirect(self.bridge_sig, bridge, &args);
        let results = self.b.inst_results(call).to_vec();
        for (&r, &value) in CpuState::PINNED.iter().zip(&results[1..]) {
            self.b.def_var(var(r), value);
        }
        let result = results[0];
        if may_fault {
            self.check_abort();
        }
        result
    }

    fn check_abort(&mut self) {
        let aborted = self.load_field(CpuState::BLOCK_ABORTED_OFFSET);
        let abort = self.b.create_block();
        let cont = self.b.create_block();
        self.b.ins().brif(aborted, abort, &[], cont, &[]);
        self.b.switch_to_block(abort);
        self.leave_spent();
        self.b.switch_to_block(cont);
    }

    /// Branch to `helper` and out of the block when `cond` holds.
    fn trap_if(&mut self, cond: Value, helper: HelperFn, pc: u32) {
        let trap = self.b.create_block();
        let cont = self.b.create_block();
        self.b.ins().brif(cond, trap, &[], cont, &[]);
        self.b.switch_to_block(trap);
        let zero = self.konst(0);
        self.call_helper(helper, zero, zero, pc, false);
        self.leave_spent();
        self.b.switch_to_block(cont);
    }

    fn checked_add(&mut self, a: Value, b: Value, pc: u32) -> Value {
        let sum = self.b.ins().iadd(a, b);
        let x = self.b.ins().bxor(a, sum);
        let y = self.b.ins().bxor(b, sum);
        let both = self.b.ins().band(x, y);
        let overflow = self.b.ins().icmp_imm(IntCC::SignedLessThan, both, 0);
        self.trap_if(overflow, self.env.helpers.overflow, pc);
        sum
    }

    fn checked_sub(&mut self, a: Value, b: Value, pc: u32) -> Value {
        let diff = self.b.ins().isub(a, b);
        let x = self.b.ins().bxor(a, b);
        let y = self.b.ins().bxor(a, diff);
        let both = self.b.ins().band(x, y);
        let overflow = self.b.ins().icmp_imm(IntCC::SignedLessThan, both, 0);
        self.trap_if(overflow, self.env.helpers.overflow, pc);
        diff
    }

    fn effective_address(&mut self, rs: u8, imm: i16) -> Value {
        let base = self.read(rs);
        let offset = self.konst(imm as i32 as u32);
        self.b.ins().iadd(base, offset)
    }

    fn emit(&mut self, insn: Insn) {
        let Insn { pc, op } = insn;
        self.spent += op.cycles();
        match op {
            Op::Addi { rs, rt, imm } => {
                let a = self.read(rs);
                let k = self.konst(imm as i32 as u32);
                let sum = self.checked_add(a, k, pc);
                self.write(rt, sum);
            }
            Op::Addiu { rs, rt, imm } => {
                let a = self.read(rs);
                let k = self.konst(imm as i32 as u32);
                let sum = self.b.ins().iadd(a, k);
                self.write(rt, sum);
            }
            Op::Slti { rs, rt, imm } => {
                let a = self.read(rs);
                let k = self.konst(imm as i32 as u32);
                let cmp = self.b.ins().icmp(IntCC::SignedLessThan, a, k);
                let result = self.b.ins().uextend(types::I32, cmp);
                self.write(rt, result);
            }
            Op::Sltiu { rs, rt, imm } => {
                let a = self.read(rs);
                let k = self.konst(imm as i32 as u32);
                let cmp = self.b.ins().icmp(IntCC::UnsignedLessThan, a, k);
                let result = self.b.ins().uextend(types::I32, cmp);
                self.write(rt, result);
            }
            Op::Andi { rs, rt, imm } => {
                let a = self.read(rs);
                let k = self.konst(u32::from(imm));
                let result = self.b.ins().band(a, k);
                self.write(rt, result);
            }
            Op::Ori { rs, rt, imm } => {
                let a = self.read(rs);
                let k = self.konst(u32::from(imm));
                let result = self.b.ins().bor(a, k);
                self.write(rt, result);
            }
            Op::Xori { rs, rt, imm } => {
                let a = self.read(rs);
                let k = self.konst(u32::from(imm));
                let result = self.b.ins().bxor(a, k);
                self.write(rt, result);
            }
            Op::Lui { rt, imm } => {
                let value = self.konst(u32::from(imm) << 16);
                self.write(rt, value);
            }
            Op::Add { rs, rt, rd } => {
                let a = self.read(rs);
                let b = self.read(rt);
                let sum = self.checked_add(a, b, pc);
                self.write(rd, sum);
            }
            Op::Sub { rs, rt, rd } => {
                let a = self.read(rs);
                let b = self.read(rt);
                let diff = self.checked_sub(a, b, pc);
                self.write(rd, diff);
            }
            Op::Addu { rs, rt, rd }
            | Op::Subu { rs, rt, rd }
            | Op::And { rs, rt, rd }
            | Op::Or { rs, rt, rd }
            | Op::Xor { rs, rt, rd }
            | Op::Nor { rs, rt, rd }
            | Op::Slt { rs, rt, rd }
            | Op::Sltu { rs, rt, rd } => {
                let a = self.read(rs);
                let b = self.read(rt);
                let ins = self.b.ins();
                let result = match op {
                    Op::Addu { .. } => ins.iadd(a, b),
                    Op::Subu { .. } => ins.isub(a, b),
                    Op::And { .. } => ins.band(a, b),
                    Op::Or { .. } => ins.bor(a, b),
                    Op::Xor { .. } => ins.bxor(a, b),
                    Op::Nor { .. } => {
                        let or = ins.bor(a, b);
                        self.b.ins().bnot(or)
                    }
                    Op::Slt { .. } => {
                        let cmp = ins.icmp(IntCC::SignedLessThan, a, b);
                        self.b.ins().uextend(types::I32, cmp)
                    }
                    _ => {
                        let cmp = ins.icmp(IntCC::UnsignedLessThan, a, b);
                        self.b.ins().uextend(types::I32, cmp)
                    }
                };
                self.write(rd, result);
            }
            Op::Sll { rt, rd, sa } => {
                let a = self.read(rt);
                let result = self.b.ins().ishl_imm(a, i64::from(sa));
                self.write(rd, result);
            }
            Op::Srl { rt, rd, sa } => {
                let a = self.read(rt);
                let result = self.b.ins().ushr_imm(a, i64::from(sa));
                self.write(rd, result);
            }
            Op::Sra { rt, rd, sa } => {
                let a = self.read(rt);
                let result = self.b.ins().sshr_imm(a, i64::from(sa));
                self.write(rd, result);
            }
            Op::Sllv { rs, rt, rd } | Op::Srlv { rs, rt, rd } | Op::Srav { rs, rt, rd } => {
                let a = self.read(rt);
                let s = self.read(rs);
                let mask = self.konst(0x1F);
                let amount = self.b.ins().band(s, mask);
                let result = match op {
                    Op::Sllv { .. } => self.b.ins().ishl(a, amount),
                    Op::Srlv { .. } => self.b.ins().ushr(a, amount),
                    _ => self.b.ins().sshr(a, amount),
                };
                self.write(rd, result);
            }
            Op::Mult { rs, rt } | Op::Multu { rs, rt } => {
                let a = self.read(rs);
                let b = self.read(rt);
                let (a, b) = if matches!(op, Op::Mult { .. }) {
                    (self.b.ins().sextend(types::I64, a), self.b.ins().sextend(types::I64, b))
                } else {
                    (self.b.ins().uextend(types::I64, a), self.b.ins().uextend(types::I64, b))
                };
                let product = self.b.ins().imul(a, b);
                let lo = self.b.ins().ireduce(types::I32, product);
                let high = self.b.ins().ushr_imm(product, 32);
                let hi = self.b.ins().ireduce(types::I32, high);
                self.store_field(CpuState::LO_OFFSET, lo);
                self.store_field(CpuState::HI_OFFSET, hi);
            }
            Op::Div { rs, rt } | Op::Divu { rs, rt } => {
                let a = self.read(rs);
                let b = self.read(rt);
                let helper = if matches!(op, Op::Div { .. }) {
                    self.env.helpers.div
                } else {
                    self.env.helpers.divu
                };
                self.call_helper(helper, a, b, pc, false);
            }
            Op::Mfhi { rd } => {
                let value = self.load_field(CpuState::HI_OFFSET);
                self.write(rd, value);
            }
            Op::Mflo { rd } => {
                let value = self.load_field(CpuState::LO_OFFSET);
                self.write(rd, value);
            }
            Op::Mthi { rs } => {
                let value = self.read(rs);
                self.store_field(CpuState::HI_OFFSET, value);
            }
            Op::Mtlo { rs } => {
                let value = self.read(rs);
                self.store_field(CpuState::LO_OFFSET, value);
            }
            Op::Load { kind, rs, rt, imm } => {
                let addr = self.effective_address(rs, imm);
                let h = self.env.helpers;
                let value = match kind {
                    LoadKind::Byte | LoadKind::ByteUnsigned => {
                        let zero = self.konst(0);
                        let raw = self.call_helper(h.load_u8, addr, zero, pc, true);
                        if kind == LoadKind::Byte {
                            let narrow = self.b.ins().ireduce(types::I8, raw);
                            self.b.ins().sextend(types::I32, narrow)
                        } else {
                            raw
                        }
                    }
                    LoadKind::Half | LoadKind::HalfUnsigned => {
                        let zero = self.konst(0);
                        let raw = self.call_helper(h.load_u16, addr, zero, pc, true);
                        if kind == LoadKind::Half {
                            let narrow = self.b.ins().ireduce(types::I16, raw);
                            self.b.ins().sextend(types::I32, narrow)
                        } else {
                            raw
                        }
                    }
                    LoadKind::Word => {
                        let zero = self.konst(0);
                        self.call_helper(h.load_u32, addr, zero, pc, true)
                    }
                    LoadKind::WordLeft | LoadKind::WordRight => {
                        let old = self.read(rt);
                        let helper = if kind == LoadKind::WordLeft {
                            h.load_word_left
                        } else {
                            h.load_word_right
                        };
                        self.call_helper(helper, addr, old, pc, true)
                    }
                };
                self.write(rt, value);
            }
            Op::Store { kind, rs, rt, imm } => {
                let addr = self.effective_address(rs, imm);
                let value = self.read(rt);
                let h = self.env.helpers;
                let helper = match kind {
                    StoreKind::Byte => h.store_u8,
                    StoreKind::Half => h.store_u16,
                    StoreKind::Word => h.store_u32,
                    StoreKind::WordLeft => h.store_word_left,
                    StoreKind::WordRight => h.store_word_right,
                };
                self.call_helper(helper, addr, value, pc, true);
            }
            Op::Mfc0 { rt, rd } => {
                let index = self.konst(u32::from(rd));
                let zero = self.konst(0);
                let value = self.call_helper(self.env.helpers.mfc0, index, zero, pc, true);
                self.write(rt, value);
            }
            Op::Mtc0 { rt, rd } => {
                let index = self.konst(u32::from(rd));
                let value = self.read(rt);
                self.call_helper(self.env.helpers.mtc0, index, value, pc, true);
            }
            Op::Rfe => {
                let zero = self.konst(0);
                self.call_helper(self.env.helpers.rfe, zero, zero, pc, false);
            }
            Op::Cop2 { raw } => {
                let word = self.konst(raw);
                let zero = self.konst(0);
                self.call_helper(self.env.helpers.cop2, word, zero, pc, true);
            }
            Op::Syscall | Op::Break => {
                let zero = self.konst(0);
                let helper = if op == Op::Syscall {
                    self.env.helpers.syscall
                } else {
                    self.env.helpers.brk
                };
                self.call_helper(helper, zero, zero, pc, true);
            }
            Op::Reserved { raw } => {
                if let Some(helper) = self.env.helpers.reserved {
                    let word = self.konst(raw);
                    let zero = self.konst(0);
                    self.call_helper(helper, word, zero, pc, true);
                }
            }
            // Control transfers only appear as a block's branch.
            Op::Jump { .. } | Op::JumpReg { .. } | Op::Branch { .. } => {}
        }
    }

    fn emit_delay(&mut self, delay: Option<Insn>) {
        match delay {
            Some(insn) => self.emit(insn),
            None => self.spent += 1,
        }
    }

    fn condition(&mut self, cond: BranchCond, rs: u8, rt: u8) -> Value {
        let a = self.read(rs);
        match cond {
            BranchCond::Eq | BranchCond::Ne => {
                let b = self.read(rt);
                let cc = if cond == BranchCond::Eq {
                    IntCC::Equal
                } else {
                    IntCC::NotEqual
                };
                self.b.ins().icmp(cc, a, b)
            }
            BranchCond::Lez => self.b.ins().icmp_imm(IntCC::SignedLessThanOrEqual, a, 0),
            BranchCond::Gtz => self.b.ins().icmp_imm(IntCC::SignedGreaterThan, a, 0),
            BranchCond::Ltz => self.b.ins().icmp_imm(IntCC::SignedLessThan, a, 0),
            BranchCond::Gez => self.b.ins().icmp_imm(IntCC::SignedGreaterThanOrEqual, a, 0),
        }
    }

    /// Store the next PC and either chain through the target's link word or
    /// return.
    ///
    /// Chaining needs budget left and a non-zero `link_budget`; each hop
    /// consumes one unit of the latter so a chain always terminates. Targets
    /// without a link word always return.
    fn direct_exit(&mut self, target_pc: u32) {
        let pc = self.konst(target_pc);
        self.store_field(CpuState::PC_OFFSET, pc);
        let remaining = self.remaining();
        let link = self
            .env
            .links
            .iter()
            .find(|(at, _)| *at == target_pc)
            .map(|&(_, link)| link);
        let Some(link) = link else {
            self.leave(remaining);
            return;
        };
        let budget = self.load_field(CpuState::LINK_BUDGET_OFFSET);
        let spent_all = self
            .b
            .ins()
            .icmp_imm(IntCC::SignedLessThanOrEqual, remaining, 0);
        let no_links = self.b.ins().icmp_imm(IntCC::Equal, budget, 0);
        let stop = self.b.ins().bor(spent_all, no_links);

        let out = self.b.create_block();
        let chain = self.b.create_block();
        self.b.ins().brif(stop, out, &[], chain, &[]);

        self.b.switch_to_block(out);
        self.leave(remaining);

        self.b.switch_to_block(chain);
        // The next block reloads its pinned registers from CpuState.
        self.flush_pinned();
        let one = self.konst(1);
        let left = self.b.ins().isub(budget, one);
        self.store_field(CpuState::LINK_BUDGET_OFFSET, left);
        let slot = self.kptr(link);
        let ptr = self.env.ptr;
        let target = self.b.ins().load(ptr, self.flags, slot, 0);
        let call = self
            .b
            .ins()
            .call_indirect(self.block_sig, target, &[self.cpu, self.host, remaining]);
        let result = self.b.inst_results(call)[0];
        self.b.ins().return_(&[result]);
    }

    /// Exit to the dispatcher with a PC only known at run time.
    ///
    /// `current_pc` names the jump, which is where a misaligned target
    /// gets reported.
    fn indirect_exit(&mut self, target: Value, jump_pc: u32) {
        let jump_pc = self.konst(jump_pc);
        self.store_field(CpuState::CURRENT_PC_OFFSET, jump_pc);
        self.store_field(CpuState::PC_OFFSET, target);
        self.leave_spent();
    }

    fn emit_branch(&mut self, branch: &BranchPlan, fallthrough: u32) {
        let Insn { pc, op } = branch.insn;
        self.spent += op.cycles();
        let return_addr = pc.wrapping_add(8);
        match op {
            Op::Jump { target, link } => {
                if link {
                    let ra = self.konst(return_addr);
                    self.write(31, ra);
                }
                self.emit_delay(branch.delay);
                self.direct_exit(target);
            }
            Op::JumpReg { rs, link } => {
                let target = self.read(rs);
                if let Some(rd) = link {
                    let ra = self.konst(return_addr);
                    self.write(rd, ra);
                }
                self.emit_delay(branch.delay);
                self.indirect_exit(target, pc);
            }
            Op::Branch {
                cond,
                rs,
                rt,
                target,
                link,
            } => {
                // The condition reads registers before the delay slot runs.
                let taken = self.condition(cond, rs, rt);
                if link {
                    let ra = self.konst(return_addr);
                    self.write(31, ra);
                }
                self.emit_delay(branch.delay);
                let yes = self.b.create_block();
                let no = self.b.create_block();
                self.b.ins().brif(taken, yes, &[], no, &[]);
                self.b.switch_to_block(yes);
                self.direct_exit(target);
                self.b.switch_to_block(no);
                self.direct_exit(fallthrough);
            }
            _ => self.direct_exit(fallthrough),
        }
    }
}

/// True when the block's last instruction may change interrupt state or
/// raise an exception, so control must go back to the dispatcher.
fn ends_at_barrier(plan: &BlockPlan) -> bool {
    plan.branch.is_none() && plan.body.last().is_some_and(|insn| insn.op.ends_block())
}

/// Guest PCs of a plan's direct exits that may be linked, deduplicated.
///
/// Exits whose physical target is in `unlinked` always return to the
/// dispatcher.
pub(crate) fn direct_targets(plan: &BlockPlan, unlinked: &[u32]) -> Vec<u32> {
    let mut targets = match plan.branch.map(|b| b.insn.op) {
        Some(Op::Branch { target, .. }) => vec![target, plan.fallthrough],
        Some(Op::Jump { target, .. }) => vec![target],
        Some(Op::JumpReg { .. }) => Vec::new(),
        _ if ends_at_barrier(plan) => Vec::new(),
        _ => vec![plan.fallthrough],
    };
    targets.retain(|pc| !unlinked.contains(&(pc & 0x1FFF_FFFF)));
    targets.dedup();
    targets
}

/// Emit the body of a block function into `builder`.
///
/// `env.links` must hold a link word for every PC [`direct_targets`]
/// returned for `plan`.
pub(crate) fn emit_block(builder: &mut FunctionBuilder<'_>, entry: Block, env: &EmitEnv<'_>, plan: &BlockPlan) {
    let params = builder.block_params(entry).to_vec();
    let block_sig = builder.import_signature(env.block_sig.clone());
    let exit_sig = builder.import_signature(env.exit_sig.clone());
    let bridge_sig = builder.import_signature(env.bridge_sig.clone());

    let mut pinned = [false; 32];
    for r in CpuState::PINNED {
        pinned[usize::from(r)] = true;
        builder.declare_var(var(r), types::I32);
    }

    let mut flags = MemFlags::new();
    flags.set_notrap();
    flags.set_aligned();

    let mut e = Emitter {
        b: builder,
        env,
        cpu: params[0],
        host: params[1],
        cycles: params[2],
        flags,
        block_sig,
        exit_sig,
        bridge_sig,
        pinned,
        spent: 0,
    };
    e.reload_pinned();

    for insn in &plan.body {
        e.emit(*insn);
    }
    match &plan.branch {
        Some(branch) => e.emit_branch(branch, plan.fallthrough),
        None if ends_at_barrier(plan) => {
            let pc = e.konst(plan.fallthrough);
            e.store_field(CpuState::PC_OFFSET, pc);
            e.leave_spent();
        }
        None => e.direct_exit(plan.fallthrough),
    }
}
