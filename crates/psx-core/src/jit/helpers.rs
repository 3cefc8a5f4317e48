//! Host side of the helper table: memory, COP0 and exception entry points
//! generated code calls through the bridge.

use psx_dynarec::{Cop0, CpuState, HelperTable};

use crate::bus::{HwSink, IoPort};
use crate::cpu::{enter_exception, rfe, ExceptionCode};
use crate::hw::{AccessSize, Hardware};
use crate::interrupts::Interrupts;
use crate::memory::Memory;
use crate::psx::Psx;
use crate::scheduler::Scheduler;

/// Host context handed to every helper as the block's `host` pointer.
///
/// Each pointer comes from a distinct field of the [`Psx`] running the block
/// and stays valid for the duration of the call in `run_block`.
pub(crate) struct CallbackContext<H: Hardware> {
    pub memory: *mut Memory,
    pub interrupts: *mut Interrupts,
    pub hw: *mut H,
    pub scheduler: *mut Scheduler<Psx<H>>,
    /// Cycle count when the block was entered.
    pub now: u64,
}

impl<H: Hardware> CallbackContext<H> {
    fn split(&mut self) -> (&mut Memory, IoPort<'_, H>) {
        // SAFETY: pointers come from disjoint live fields held by `run_block`.
        unsafe {
            (
                &mut *self.memory,
                IoPort {
                    hw: &mut *self.hw,
                    sink: HwSink {
                        scheduler: &mut *self.scheduler,
                        interrupts: &mut *self.interrupts,
                        now: self.now,
                    },
                },
            )
        }
    }

    fn hw(&mut self) -> &mut H {
        // SAFETY: pointers come from disjoint live fields held by `run_block`.
        unsafe { &mut *self.hw }
    }

    fn read(&mut self, addr: u32, size: AccessSize) -> u32 {
        let (memory, mut port) = self.split();
        memory.read(addr, size, &mut port)
    }

    fn write(&mut self, addr: u32, value: u32, size: AccessSize, isolated: bool) {
        let (memory, mut port) = self.split();
        memory.write(addr, value, size, isolated, &mut port);
    }
}

/// # Safety
///
/// `cpu` must be the block's live CPU state and `host` a
/// `CallbackContext<H>` built by `run_block`.
unsafe fn enter<'a, H: Hardware>(
    cpu: *mut CpuState,
    host: *mut u8,
) -> (&'a mut CpuState, &'a mut CallbackContext<H>) {
    // SAFETY: forwarded from the caller's contract.
    unsafe { (&mut *cpu, &mut *(host as *mut CallbackContext<H>)) }
}

fn address_error(cpu: &mut CpuState, addr: u32, code: ExceptionCode) {
    cpu.cop0.regs[Cop0::BAD_VADDR] = addr;
    enter_exception(cpu, code);
}

fn load<H: Hardware>(
    cpu: &mut CpuState,
    ctx: &mut CallbackContext<H>,
    addr: u32,
    size: AccessSize,
) -> Option<u32> {
    if addr & (size.bytes() - 1) != 0 {
        address_error(cpu, addr, ExceptionCode::AddressErrorLoad);
        return None;
    }
    Some(ctx.read(addr, size))
}

fn store<H: Hardware>(
    cpu: &mut CpuState,
    ctx: &mut CallbackContext<H>,
    addr: u32,
    value: u32,
    size: AccessSize,
) {
    if addr & (size.bytes() - 1) != 0 {
        address_error(cpu, addr, ExceptionCode::AddressErrorStore);
        return;
    }
    let isolated = cpu.cop0.sr() & Cop0::SR_ISC != 0;
    ctx.write(addr, value, size, isolated);
}

pub(crate) fn lwl_merge(addr: u32, word: u32, rt: u32) -> u32 {
    match addr & 3 {
        0 => (rt & 0x00FF_FFFF) | (word << 24),
        1 => (rt & 0x0000_FFFF) | (word << 16),
        2 => (rt & 0x0000_00FF) | (word << 8),
        _ => word,
    }
}

pub(crate) fn lwr_merge(addr: u32, word: u32, rt: u32) -> u32 {
    match addr & 3 {
        0 => word,
        1 => (rt & 0xFF00_0000) | (word >> 8),
        2 => (rt & 0xFFFF_0000) | (word >> 16),
        _ => (rt & 0xFFFF_FF00) | (word >> 24),
    }
}

pub(crate) fn swl_merge(addr: u32, mem: u32, rt: u32) -> u32 {
    match addr & 3 {
        0 => (mem & 0xFFFF_FF00) | (rt >> 24),
        1 => (mem & 0xFFFF_0000) | (rt >> 16),
        2 => (mem & 0xFF00_0000) | (rt >> 8),
        _ => rt,
    }
}

pub(crate) fn swr_merge(addr: u32, mem: u32, rt: u32) -> u32 {
    match addr & 3 {
        0 => rt,
        1 => (mem & 0x0000_00FF) | (rt << 8),
        2 => (mem & 0x0000_FFFF) | (rt << 16),
        _ => (mem & 0x00FF_FFFF) | (rt << 24),
    }
}

/// R3000A DIV: division by zero and `i32::MIN / -1` do not trap.
pub(crate) fn div(cpu: &mut CpuState, n: u32, d: u32) {
    let (n, d) = (n as i32, d as i32);
    if d == 0 {
        cpu.hi = n as u32;
        cpu.lo = if n >= 0 { 0xFFFF_FFFF } else { 1 };
    } else if n == i32::MIN && d == -1 {
        cpu.hi = 0;
        cpu.lo = i32::MIN as u32;
    } else {
        cpu.hi = (n % d) as u32;
        cpu.lo = (n / d) as u32;
    }
}

pub(crate) fn divu(cpu: &mut CpuState, n: u32, d: u32) {
    if d == 0 {
        cpu.hi = n;
        cpu.lo = 0xFFFF_FFFF;
    } else {
        cpu.hi = n % d;
        cpu.lo = n / d;
    }
}

unsafe extern "C" fn cb_load_u8<H: Hardware>(cpu: *mut CpuState, host: *mut u8, addr: u32, _: u32) -> u32 {
    // SAFETY: blocks pass their live CpuState and the context from `run_block`.
    let (cpu, ctx) = unsafe { enter::<H>(cpu, host) };
    load(cpu, ctx, addr, AccessSize::Byte).unwrap_or(0)
}

unsafe extern "C" fn cb_load_u16<H: Hardware>(cpu: *mut CpuState, host: *mut u8, addr: u32, _: u32) -> u32 {
    // SAFETY: blocks pass their live CpuState and the context from `run_block`.
    let (cpu, ctx) = unsafe { enter::<H>(cpu, host) };
    load(cpu, ctx, addr, AccessSize::Half).unwrap_or(0)
}

unsafe extern "C" fn cb_load_u32<H: Hardware>(cpu: *mut CpuState, host: *mut u8, addr: u32, _: u32) -> u32 {
    // SAFETY: blocks pass their live CpuState and the context from `run_block`.
    let (cpu, ctx) = unsafe { enter::<H>(cpu, host) };
    load(cpu, ctx, addr, AccessSize::Word).unwrap_or(0)
}

unsafe extern "C" fn cb_load_word_left<H: Hardware>(cpu: *mut CpuState, host: *mut u8, addr: u32, rt: u32) -> u32 {
    // SAFETY: blocks pass their live CpuState and the context from `run_block`.
    let (cpu, ctx) = unsafe { enter::<H>(cpu, host) };
    match load(cpu, ctx, addr & !3, AccessSize::Word) {
        Some(word) => lwl_merge(addr, word, rt),
        None => rt,
    }
}

unsafe extern "C" fn cb_load_word_right<H: Hardware>(cpu: *mut CpuState, host: *mut u8, addr: u32, rt: u32) -> u32 {
    // SAFETY: blocks pass their live CpuState and the context from `run_block`.
    let (cpu, ctx) = unsafe { enter::<H>(cpu, host) };
    match load(cpu, ctx, addr & !3, AccessSize::Word) {
        Some(word) => lwr_merge(addr, word, rt),
        None => rt,
    }
}

unsafe extern "C" fn cb_store_u8<H: Hardware>(cpu: *mut CpuState, host: *mut u8, addr: u32, value: u32) -> u32 {
    // SAFETY: blocks pass their live CpuState and the context from `run_block`.
    let (cpu, ctx) = unsafe { enter::<H>(cpu, host) };
    store(cpu, ctx, addr, value & 0xFF, AccessSize::Byte);
    0
}

unsafe extern "C" fn cb_store_u16<H: Hardware>(cpu: *mut CpuState, host: *mut u8, addr: u32, value: u32) -> u32 {
    // SAFETY: blocks pass their live CpuState and the context from `run_block`.
    let (cpu, ctx) = unsafe { enter::<H>(cpu, host) };
    store(cpu, ctx, addr, value & 0xFFFF, AccessSize::Half);
    0
}

unsafe extern "C" fn cb_store_u32<H: Hardware>(cpu: *mut CpuState, host: *mut u8, addr: u32, value: u32) -> u32 {
    // SAFETY: blocks pass their live CpuState and the context from `run_block`.
    let (cpu, ctx) = unsafe { enter::<H>(cpu, host) };
    store(cpu, ctx, addr, value, AccessSize::Word);
    0
}

unsafe extern "C" fn cb_store_word_left<H: Hardware>(cpu: *mut CpuState, host: *mut u8, addr: u32, value: u32) -> u32 {
    // SAFETY: blocks pass their live CpuState and the context from `run_block`.
    let (cpu, ctx) = unsafe { enter::<H>(cpu, host) };
    let aligned = addr & !3;
    let mem = ctx.read(aligned, AccessSize::Word);
    store(cpu, ctx, aligned, swl_merge(addr, mem, value), AccessSize::Word);
    0
}

unsafe extern "C" fn cb_store_word_right<H: Hardware>(cpu: *mut CpuState, host: *mut u8, addr: u32, value: u32) -> u32 {
    // SAFETY: blocks pass their live CpuState and the context from `run_block`.
    let (cpu, ctx) = unsafe { enter::<H>(cpu, host) };
    let aligned = addr & !3;
    let mem = ctx.read(aligned, AccessSize::Word);
    store(cpu, ctx, aligned, swr_merge(addr, mem, value), AccessSize::Word);
    0
}

unsafe extern "C" fn cb_mfc0<H: Hardware>(cpu: *mut CpuState, _host: *mut u8, reg: u32, _: u32) -> u32 {
    // SAFETY: blocks pass their live CpuState.
    let cpu = unsafe { &mut *cpu };
    cpu.cop0.read_reg(reg as usize)
}

unsafe extern "C" fn cb_mtc0<H: Hardware>(cpu: *mut CpuState, _host: *mut u8, reg: u32, value: u32) -> u32 {
    // SAFETY: blocks pass their live CpuState.
    let cpu = unsafe { &mut *cpu };
    cpu.cop0.write_reg(reg as usize, value);
    0
}

unsafe extern "C" fn cb_rfe<H: Hardware>(cpu: *mut CpuState, _host: *mut u8, _: u32, _: u32) -> u32 {
    // SAFETY: blocks pass their live CpuState.
    rfe(unsafe { &mut *cpu });
    0
}

unsafe extern "C" fn cb_syscall<H: Hardware>(cpu: *mut CpuState, _host: *mut u8, _: u32, _: u32) -> u32 {
    // SAFETY: blocks pass their live CpuState.
    enter_exception(unsafe { &mut *cpu }, ExceptionCode::Syscall);
    0
}

unsafe extern "C" fn cb_break<H: Hardware>(cpu: *mut CpuState, _host: *mut u8, _: u32, _: u32) -> u32 {
    // SAFETY: blocks pass their live CpuState.
    enter_exception(unsafe { &mut *cpu }, ExceptionCode::Breakpoint);
    0
}

unsafe extern "C" fn cb_div<H: Hardware>(cpu: *mut CpuState, _host: *mut u8, n: u32, d: u32) -> u32 {
    // SAFETY: blocks pass their live CpuState.
    div(unsafe { &mut *cpu }, n, d);
    0
}

unsafe extern "C" fn cb_divu<H: Hardware>(cpu: *mut CpuState, _host: *mut u8, n: u32, d: u32) -> u32 {
    // SAFETY: blocks pass their live CpuState.
    divu(unsafe { &mut *cpu }, n, d);
    0
}

unsafe extern "C" fn cb_overflow<H: Hardware>(cpu: *mut CpuState, _host: *mut u8, _: u32, _: u32) -> u32 {
    // SAFETY: blocks pass their live CpuState.
    enter_exception(unsafe { &mut *cpu }, ExceptionCode::Overflow);
    0
}

unsafe extern "C" fn cb_reserved<H: Hardware>(cpu: *mut CpuState, _host: *mut u8, raw: u32, _: u32) -> u32 {
    // SAFETY: blocks pass their live CpuState.
    let cpu = unsafe { &mut *cpu };
    log::debug!("Reserved instruction {raw:#010X} at {:#010X}", cpu.current_pc);
    enter_exception(cpu, ExceptionCode::ReservedInstruction);
    0
}

fn cop2_address(cpu: &CpuState, raw: u32) -> u32 {
    let base = cpu.reg(((raw >> 21) & 0x1F) as usize);
    base.wrapping_add(raw as u16 as i16 as i32 as u32)
}

/// COP2 moves, LWC2/SWC2 and GTE commands.
pub(crate) fn cop2<H: Hardware>(cpu: &mut CpuState, ctx: &mut CallbackContext<H>, raw: u32) {
    if cpu.cop0.sr() & Cop0::SR_CU2 == 0 {
        enter_exception(cpu, ExceptionCode::CoprocessorUnusable);
        cpu.cop0.regs[Cop0::CAUSE] |= 2 << 28;
        return;
    }
    let rt = ((raw >> 16) & 0x1F) as usize;
    let rd = ((raw >> 11) & 0x1F) as usize;
    match raw >> 26 {
        0x12 if raw & (1 << 25) != 0 => ctx.hw().cop2(cpu, raw & 0x01FF_FFFF),
        0x12 => match (raw >> 21) & 0x1F {
            0x00 => {
                let value = cpu.cp2_data[rd];
                cpu.set_reg(rt, value);
            }
            0x02 => {
                let value = cpu.cp2_ctrl[rd];
                cpu.set_reg(rt, value);
            }
            0x04 => cpu.cp2_data[rd] = cpu.reg(rt),
            0x06 => cpu.cp2_ctrl[rd] = cpu.reg(rt),
            _ => {
                enter_exception(cpu, ExceptionCode::ReservedInstruction);
            }
        },
        0x32 => {
            let addr = cop2_address(cpu, raw);
            if let Some(value) = load(cpu, ctx, addr, AccessSize::Word) {
                cpu.cp2_data[rt] = value;
            }
        }
        0x3A => {
            let addr = cop2_address(cpu, raw);
            let value = cpu.cp2_data[rt];
            store(cpu, ctx, addr, value, AccessSize::Word);
        }
        _ => {
            enter_exception(cpu, ExceptionCode::ReservedInstruction);
        }
    }
}

unsafe extern "C" fn cb_cop2<H: Hardware>(cpu: *mut CpuState, host: *mut u8, raw: u32, _: u32) -> u32 {
    // SAFETY: blocks pass their live CpuState and the context from `run_block`.
    let (cpu, ctx) = unsafe { enter::<H>(cpu, host) };
    cop2(cpu, ctx, raw);
    0
}

/// Helper table for machines with hardware `H`.
pub fn helper_table<H: Hardware>() -> HelperTable {
    HelperTable {
        load_u8: cb_load_u8::<H>,
        load_u16: cb_load_u16::<H>,
        load_u32: cb_load_u32::<H>,
        load_word_left: cb_load_word_left::<H>,
        load_word_right: cb_load_word_right::<H>,
        store_u8: cb_store_u8::<H>,
        store_u16: cb_store_u16::<H>,
        store_u32: cb_store_u32::<H>,
        store_word_left: cb_store_word_left::<H>,
        store_word_right: cb_store_word_right::<H>,
        mfc0: cb_mfc0::<H>,
        mtc0: cb_mtc0::<H>,
        rfe: cb_rfe::<H>,
        syscall: cb_syscall::<H>,
        brk: cb_break::<H>,
        div: cb_div::<H>,
        divu: cb_divu::<H>,
        overflow: cb_overflow::<H>,
        cop2: cb_cop2::<H>,
        reserved: Some(cb_reserved::<H>),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::exceptions::{RAM_VECTOR, ROM_VECTOR};
    use crate::hw::{EventSink, NullHardware};
    use crate::interrupts::I_MASK;

    struct Rig {
        memory: Memory,
        interrupts: Interrupts,
        hw: NullHardware,
        scheduler: Scheduler<Psx<NullHardware>>,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                memory: Memory::new(&[]),
                interrupts: Interrupts::new(),
                hw: NullHardware,
                scheduler: Scheduler::new(),
            }
        }

        fn ctx(&mut self) -> CallbackContext<NullHardware> {
            CallbackContext {
                memory: &mut self.memory,
                interrupts: &mut self.interrupts,
                hw: &mut self.hw,
                scheduler: &mut self.scheduler,
                now: 0,
            }
        }
    }

    fn call(helper: psx_dynarec::HelperFn, cpu: &mut CpuState, rig: &mut Rig, a0: u32, a1: u32) -> u32 {
        let mut ctx = rig.ctx();
        unsafe { helper(cpu, (&mut ctx as *mut CallbackContext<NullHardware>).cast(), a0, a1) }
    }

    #[test]
    fn unaligned_load_raises_address_error() {
        let table = helper_table::<NullHardware>();
        let mut rig = Rig::new();
        let mut cpu = CpuState::new();
        cpu.in_block = 1;
        cpu.current_pc = 0xBFC0_0100;

        call(table.load_u32, &mut cpu, &mut rig, 0x8000_0002, 0);
        assert_eq!(cpu.cop0.regs[Cop0::BAD_VADDR], 0x8000_0002);
        assert_eq!(cpu.cop0.regs[Cop0::EPC], 0xBFC0_0100);
        assert_eq!(cpu.cop0.cause() >> 2 & 0x1F, 4);
        assert_eq!(cpu.take_abort(), Some(ROM_VECTOR));

        cpu.cop0.regs[Cop0::SR] = 0;
        call(table.store_u16, &mut cpu, &mut rig, 0x8000_0001, 7);
        assert_eq!(cpu.cop0.cause() >> 2 & 0x1F, 5);
        assert_eq!(cpu.take_abort(), Some(RAM_VECTOR));
        assert_eq!(rig.memory.ram_u32(0), 0);
    }

    #[test]
    fn stores_and_loads_reach_memory_and_irq_registers() {
        let table = helper_table::<NullHardware>();
        let mut rig = Rig::new();
        let mut cpu = CpuState::new();

        call(table.store_u32, &mut cpu, &mut rig, 0x8000_0010, 0xCAFE_F00D);
        assert_eq!(call(table.load_u16, &mut cpu, &mut rig, 0x8000_0012, 0), 0xCAFE);
        assert_eq!(call(table.load_u8, &mut cpu, &mut rig, 0xA000_0010, 0), 0x0D);

        call(table.store_u32, &mut cpu, &mut rig, I_MASK, 0x5);
        assert_eq!(rig.interrupts.mask, 0x5);
        assert_eq!(call(table.load_u32, &mut cpu, &mut rig, I_MASK, 0), 0x5);
        assert_eq!(call(table.load_u32, &mut cpu, &mut rig, 0x1F80_1814, 0), 0xFFFF_FFFF);
    }

    #[test]
    fn isolated_cache_swallows_stores() {
        let table = helper_table::<NullHardware>();
        let mut rig = Rig::new();
        let mut cpu = CpuState::new();
        cpu.cop0.regs[Cop0::SR] |= Cop0::SR_ISC;
        call(table.store_u32, &mut cpu, &mut rig, 0x8000_0020, 1);
        assert_eq!(rig.memory.ram_u32(0x20), 0);
    }

    #[test]
    fn unaligned_word_merges() {
        let mem = 0x4433_2211;
        let rt = 0xDDCC_BBAA;
        assert_eq!(lwl_merge(0, mem, rt), 0x11CC_BBAA);
        assert_eq!(lwl_merge(3, mem, rt), mem);
        assert_eq!(lwr_merge(0, mem, rt), mem);
        assert_eq!(lwr_merge(1, mem, rt), 0xDD44_3322);
        assert_eq!(swl_merge(0, mem, rt), 0x4433_22DD);
        assert_eq!(swl_merge(2, mem, rt), 0x44DD_CCBB);
        assert_eq!(swr_merge(1, mem, rt), 0xCCBB_AA11);
        assert_eq!(swr_merge(3, mem, rt), 0xAA33_2211);

        // lwl + lwr at +3 / +0 reassemble an unaligned word.
        let table = helper_table::<NullHardware>();
        let mut rig = Rig::new();
        let mut cpu = CpuState::new();
        call(table.store_u32, &mut cpu, &mut rig, 0x100, 0x4433_2211);
        call(table.store_u32, &mut cpu, &mut rig, 0x104, 0x8877_6655);
        let v = call(table.load_word_right, &mut cpu, &mut rig, 0x101, 0);
        let v = call(table.load_word_left, &mut cpu, &mut rig, 0x104, v);
        assert_eq!(v, 0x5544_3322);
    }

    #[test]
    fn division_edge_cases() {
        let mut cpu = CpuState::new();
        div(&mut cpu, 7, 0);
        assert_eq!((cpu.hi, cpu.lo), (7, 0xFFFF_FFFF));
        div(&mut cpu, (-7i32) as u32, 0);
        assert_eq!((cpu.hi, cpu.lo), ((-7i32) as u32, 1));
        div(&mut cpu, 0x8000_0000, 0xFFFF_FFFF);
        assert_eq!((cpu.hi, cpu.lo), (0, 0x8000_0000));
        div(&mut cpu, (-7i32) as u32, 2);
        assert_eq!((cpu.hi, cpu.lo), ((-1i32) as u32, (-3i32) as u32));
        divu(&mut cpu, 9, 0);
        assert_eq!((cpu.hi, cpu.lo), (9, 0xFFFF_FFFF));
        divu(&mut cpu, 9, 4);
        assert_eq!((cpu.hi, cpu.lo), (1, 2));
    }

    #[test]
    fn cop2_needs_cu2_and_moves_registers() {
        let table = helper_table::<NullHardware>();
        let mut rig = Rig::new();
        let mut cpu = CpuState::new();
        cpu.in_block = 1;
        // mtc2 t0, $5
        let mtc2 = 0x4888_2800;
        cpu.regs[8] = 0x1234;
        call(table.cop2, &mut cpu, &mut rig, mtc2, 0);
        assert_eq!(cpu.cop0.cause() >> 2 & 0x1F, 11);
        assert_eq!(cpu.cop0.cause() >> 28 & 3, 2);
        assert!(cpu.take_abort().is_some());
        assert_eq!(cpu.cp2_data[5], 0);

        cpu.cop0.regs[Cop0::SR] |= Cop0::SR_CU2;
        call(table.cop2, &mut cpu, &mut rig, mtc2, 0);
        assert_eq!(cpu.cp2_data[5], 0x1234);
        // mfc2 t1, $5
        call(table.cop2, &mut cpu, &mut rig, 0x4809_2800, 0);
        assert_eq!(cpu.regs[9], 0x1234);
        // swc2 $5, 0x40(r0)
        call(table.cop2, &mut cpu, &mut rig, 0xE805_0040, 0);
        assert_eq!(rig.memory.ram_u32(0x40), 0x1234);
        assert_eq!(cpu.take_abort(), None);
    }

    #[test]
    fn hardware_sees_event_sink() {
        struct Timed;
        impl Hardware for Timed {
            fn read(&mut self, _: u32, _: AccessSize, bus: &mut dyn EventSink) -> u32 {
                bus.now() as u32
            }
            fn write(&mut self, _: u32, value: u32, _: AccessSize, bus: &mut dyn EventSink) {
                bus.schedule(crate::scheduler::EventKind::Timer0, u64::from(value));
                bus.signal_interrupt(4);
            }
        }
        let mut memory = Memory::new(&[]);
        let mut interrupts = Interrupts::new();
        let mut hw = Timed;
        let mut scheduler = Scheduler::<Psx<Timed>>::new();
        let mut ctx = CallbackContext {
            memory: &mut memory,
            interrupts: &mut interrupts,
            hw: &mut hw,
            scheduler: &mut scheduler,
            now: 77,
        };
        assert_eq!(ctx.read(0x1F80_1100, AccessSize::Word), 77);
        ctx.write(0x1F80_1104, 500, AccessSize::Word, false);
        assert_eq!(scheduler.next_deadline(), Some(500));
        assert_eq!(interrupts.stat, 1 << 4);
    }
}
