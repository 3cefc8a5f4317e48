//! Fixed code fragments emitted once per arena generation.
//!
//! - slow path: default target of unresolved direct links; hands the budget
//!   straight back so the dispatcher resolves the PC the block already stored.
//! - exit: single way out of a block back to the dispatcher; writes the
//!   pinned registers and the remaining budget into `CpuState`.
//! - call bridge: lets blocks reach host helpers with one small call site.
//!   It takes the pinned registers, writes them out before the helper runs
//!   and hands the (possibly changed) values back afterwards.

use cranelift_codegen::ir::{types, AbiParam, InstBuilder, MemFlags, Signature};

use crate::arena::{ArenaError, CodeArena};
use crate::block::{BlockCode, ExitFn};
use crate::cpu::CpuState;

fn push_pinned(sig: &mut Signature, returns: bool) {
    for _ in CpuState::PINNED {
        if returns {
            sig.returns.push(AbiParam::new(types::I32));
        } else {
            sig.params.push(AbiParam::new(types::I32));
        }
    }
}

/// `(cpu, host, cycles) -> remaining`, shared by blocks and the slow path.
pub(crate) fn block_signature(arena: &CodeArena) -> Signature {
    let ptr = arena.pointer_type();
    let mut sig = arena.make_signature();
    sig.params.push(AbiParam::new(ptr));
    sig.params.push(AbiParam::new(ptr));
    sig.params.push(AbiParam::new(types::I32));
    sig.returns.push(AbiParam::new(types::I32));
    sig
}

/// `(cpu, remaining, pinned..) -> remaining`, see [`ExitFn`].
pub(crate) fn exit_signature(arena: &CodeArena) -> Signature {
    let mut sig = arena.make_signature();
    sig.params.push(AbiParam::new(arena.pointer_type()));
    sig.params.push(AbiParam::new(types::I32));
    push_pinned(&mut sig, false);
    sig.returns.push(AbiParam::new(types::I32));
    sig
}

/// `(cpu, host, helper, a0, a1, pinned..) -> (result, pinned..)`.
pub(crate) fn bridge_signature(arena: &CodeArena) -> Signature {
    let ptr = arena.pointer_type();
    let mut sig = arena.make_signature();
    sig.params.push(AbiParam::new(ptr));
    sig.params.push(AbiParam::new(ptr));
    sig.params.push(AbiParam::new(ptr));
    sig.params.push(AbiParam::new(types::I32));
    sig.params.push(AbiParam::new(types::I32));
    push_pinned(&mut sig, false);
    sig.returns.push(AbiParam::new(types::I32));
    push_pinned(&mut sig, true);
    sig
}

fn state_flags() -> MemFlags {
    let mut flags = MemFlags::new();
    flags.set_notrap();
    flags.set_aligned();
    flags
}

#[derive(Debug, Clone, Copy)]
pub struct TrampolineSet {
    slow_path: BlockCode,
    exit: *const u8,
    call_bridge: *const u8,
    generation: u64,
}

impl TrampolineSet {
    pub fn emit(arena: &mut CodeArena) -> Result<Self, ArenaError> {
        let slow = arena.define("psx_slow_path", block_signature(arena), |builder, entry| {
            let cycles = builder.block_params(entry)[2];
            builder.ins().return_(&[cycles]);
        })?;

        let exit = arena.define("psx_exit", exit_signature(arena), |builder, entry| {
            let params = builder.block_params(entry).to_vec();
            let (cpu, cycles) = (params[0], params[1]);
            let flags = state_flags();
            builder
                .ins()
                .store(flags, cycles, cpu, CpuState::CYCLES_LEFT_OFFSET);
            for (&r, &value) in CpuState::PINNED.iter().zip(&params[2..]) {
                builder
                    .ins()
                    .store(flags, value, cpu, CpuState::reg_offset(r));
            }
            builder.ins().return_(&[cycles]);
        })?;

        let ptr = arena.pointer_type();
        let mut helper_sig = arena.make_signature();
        helper_sig.params.push(AbiParam::new(ptr));
        helper_sig.params.push(AbiParam::new(ptr));
        helper_sig.params.push(AbiParam::new(types::I32));
        helper_sig.params.push(AbiParam::new(types::I32));
        helper_sig.returns.push(AbiParam::new(types::I32));

        let bridge = arena.define("psx_call_bridge", bridge_signature(arena), move |builder, entry| {
            let params = builder.block_params(entry).to_vec();
            let (cpu, host, helper, a0, a1) = (params[0], params[1], params[2], params[3], params[4]);
            let flags = state_flags();
            for (&r, &value) in CpuState::PINNED.iter().zip(&params[5..]) {
                builder
                    .ins()
                    .store(flags, value, cpu, CpuState::reg_offset(r));
            }
            let sig_ref = builder.import_signature(helper_sig);
            let call = builder
                .ins()
                .call_indirect(sig_ref, helper, &[cpu, host, a0, a1]);
            let mut results = vec![builder.inst_results(call)[0]];
            for &r in &CpuState::PINNED {
                results.push(
                    builder
                        .ins()
                        .load(types::I32, flags, cpu, CpuState::reg_offset(r)),
                );
            }
            builder.ins().return_(&results);
        })?;

        // SAFETY: defined just above with the block signature.
        let slow_path = unsafe { BlockCode::from_raw(slow.entry) };
        log::debug!(
            "Trampolines emitted: slow={:?} exit={:p} bridge={:p}",
            slow_path,
            exit.entry,
            bridge.entry
        );
        Ok(Self {
            slow_path,
            exit: exit.entry,
            call_bridge: bridge.entry,
            generation: arena.generation(),
        })
    }

    pub fn slow_path(&self) -> BlockCode {
        self.slow_path
    }

    pub fn exit_addr(&self) -> usize {
        self.exit as usize
    }

    pub fn exit(&self) -> ExitFn {
        // SAFETY: the exit fragment is defined with exactly the ExitFn signature.
        unsafe { std::mem::transmute::<*const u8, ExitFn>(self.exit) }
    }

    /// Entry of the call bridge. Only generated code may call it: its
    /// return values do not fit a C return.
    pub fn call_bridge_addr(&self) -> usize {
        self.call_bridge as usize
    }

    /// Arena generation these fragments belong to.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaConfig;
    use crate::block::HelperFn;

    /// Reads sp as the bridge wrote it, bumps ra, returns `a0 + a1`.
    unsafe extern "C" fn add_helper(cpu: *mut CpuState, host: *mut u8, a0: u32, a1: u32) -> u32 {
        // SAFETY: test passes a live CpuState and a live u32 as host.
        let cpu = unsafe { &mut *cpu };
        // SAFETY: as above.
        let counter = unsafe { &mut *(host as *mut u32) };
        *counter += 1;
        cpu.regs[31] = cpu.regs[29] + 1;
        a0.wrapping_add(a1)
    }

    fn arena() -> CodeArena {
        CodeArena::new(ArenaConfig {
            code_capacity: 256 * 1024,
            link_capacity: 16,
            flush_margin: 0,
        })
        .expect("arena")
    }

    #[test]
    fn slow_path_returns_budget_untouched() {
        let mut arena = arena();
        let tramps = TrampolineSet::emit(&mut arena).expect("emit");
        let mut cpu = CpuState::new();
        let left = unsafe { tramps.slow_path().call(&mut cpu, std::ptr::null_mut(), 123) };
        assert_eq!(left, 123);
        assert_eq!(cpu.cycles_left, 0);
    }

    #[test]
    fn exit_records_remaining_cycles_and_pinned_registers() {
        let mut arena = arena();
        let tramps = TrampolineSet::emit(&mut arena).expect("emit");
        let mut cpu = CpuState::new();
        let left = unsafe { (tramps.exit())(&mut cpu, -5, 1, 2, 3, 4) };
        assert_eq!(left, -5);
        assert_eq!(cpu.cycles_left, -5);
        assert_eq!((cpu.regs[2], cpu.regs[29], cpu.regs[30], cpu.regs[31]), (1, 2, 3, 4));
        assert_eq!(cpu.regs[8], 0);
    }

    #[test]
    fn call_bridge_flushes_and_reloads_pinned_registers() {
        let mut arena = arena();
        let tramps = TrampolineSet::emit(&mut arena).expect("emit");
        let bridge = tramps.call_bridge_addr();
        let bridge_sig = bridge_signature(&arena);
        let helper: HelperFn = add_helper;

        // (cpu, host) -> ra as the bridge handed it back; result lands in t0.
        let ptr = arena.pointer_type();
        let mut sig = arena.make_signature();
        sig.params.push(AbiParam::new(ptr));
        sig.params.push(AbiParam::new(ptr));
        sig.returns.push(AbiParam::new(types::I32));
        let caller = arena
            .define("test_bridge_caller", sig, |builder, entry| {
                let params = builder.block_params(entry).to_vec();
                let sig_ref = builder.import_signature(bridge_sig);
                let target = builder.ins().iconst(ptr, bridge as i64);
                let helper = builder.ins().iconst(ptr, helper as usize as i64);
                let mut args = vec![params[0], params[1], helper];
                for v in [40, 2, 10, 20, 30, 40] {
                    args.push(builder.ins().iconst(types::I32, v));
                }
                let call = builder.ins().call_indirect(sig_ref, target, &args);
                let results = builder.inst_results(call).to_vec();
                assert_eq!(results.len(), 5);
                builder
                    .ins()
                    .store(state_flags(), results[0], params[0], CpuState::reg_offset(8));
                builder.ins().return_(&[results[4]]);
            })
            .expect("caller");

        let f: unsafe extern "C" fn(*mut CpuState, *mut u8) -> i32 =
            unsafe { std::mem::transmute(caller.entry) };
        let mut cpu = CpuState::new();
        let mut calls = 0u32;
        let ra = unsafe { f(&mut cpu, (&mut calls as *mut u32).cast::<u8>()) };
        assert_eq!(calls, 1);
        assert_eq!(cpu.regs[8], 42);
        assert_eq!((cpu.regs[2], cpu.regs[29], cpu.regs[30]), (10, 20, 30));
        assert_eq!(cpu.regs[31], 21);
        assert_eq!(ra, 21);
    }
}
