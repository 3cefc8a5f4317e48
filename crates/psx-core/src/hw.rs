//! Collaborator interfaces: hardware I/O, BIOS call intercepts and the
//! boot-time binary loader.

use std::path::Path;

use psx_dynarec::CpuState;

use crate::memory::{self, Memory};
use crate::scheduler::EventKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessSize {
    Byte,
    Half,
    Word,
}

impl AccessSize {
    pub fn bytes(self) -> u32 {
        match self {
            AccessSize::Byte => 1,
            AccessSize::Half => 2,
            AccessSize::Word => 4,
        }
    }

    pub fn mask(self) -> u32 {
        match self {
            AccessSize::Byte => 0xFF,
            AccessSize::Half => 0xFFFF,
            AccessSize::Word => 0xFFFF_FFFF,
        }
    }
}

/// What hardware models may do to the rest of the machine.
pub trait EventSink {
    /// Current global cycle count.
    fn now(&self) -> u64;
    /// Schedule (or move) `kind` to fire at absolute cycle `deadline`;
    /// the machine routes it back to [`Hardware::on_event`].
    fn schedule(&mut self, kind: EventKind, deadline: u64);
    fn cancel(&mut self, kind: EventKind);
    /// Raise I_STAT bit `irq`; numbers above 10 are ignored.
    fn signal_interrupt(&mut self, irq: u32);
}

/// Peripherals behind the I/O window (0x1F80_1000..0x1F80_3000, excluding
/// the interrupt controller) plus the GTE.
///
/// Addresses are physical. Implementations must not block and must not call
/// back into the dispatcher.
pub trait Hardware {
    fn read(&mut self, addr: u32, size: AccessSize, bus: &mut dyn EventSink) -> u32;
    fn write(&mut self, addr: u32, value: u32, size: AccessSize, bus: &mut dyn EventSink);

    /// Called at power-on; the place to schedule the first timer events.
    fn reset(&mut self, _bus: &mut dyn EventSink) {}

    /// A hardware-owned event fired.
    fn on_event(&mut self, _kind: EventKind, _bus: &mut dyn EventSink) {}

    /// The last scanline batch of a frame completed.
    fn on_frame(&mut self, _bus: &mut dyn EventSink) {}

    /// The frame-blank event fired.
    fn on_frame_blank(&mut self, _bus: &mut dyn EventSink) {}

    /// Level-triggered lines and elapsed fallback interrupts to re-assert
    /// after every block, as an I_STAT bit set.
    fn poll_interrupts(&mut self, _now: u64) -> u16 {
        0
    }

    /// GTE command (COP2 with bit 25 set); `command` is the low 25 bits.
    fn cop2(&mut self, _cpu: &mut CpuState, _command: u32) {}
}

/// No peripherals: reads float high, writes vanish.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHardware;

impl Hardware for NullHardware {
    fn read(&mut self, _addr: u32, size: AccessSize, _bus: &mut dyn EventSink) -> u32 {
        size.mask()
    }

    fn write(&mut self, _addr: u32, _value: u32, _size: AccessSize, _bus: &mut dyn EventSink) {}
}

/// High-level replacements for the BIOS function tables.
pub trait BiosHooks {
    /// Offered the call when the PC reaches physical 0xA0, 0xB0 or 0xC0.
    /// Returning true means the call was fully handled and `cpu.pc` already
    /// points at the return address.
    fn intercept(&mut self, vector: u32, cpu: &mut CpuState, memory: &mut Memory) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoBiosHooks;

impl BiosHooks for NoBiosHooks {
    fn intercept(&mut self, _vector: u32, _cpu: &mut CpuState, _memory: &mut Memory) -> bool {
        false
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a PS-X EXE image")]
    BadHeader,
    #[error("section at {addr:#010X} ({len:#X} bytes) does not fit in RAM")]
    OutOfRange { addr: u32, len: u32 },
}

/// Loads a program once the BIOS has finished booting.
pub trait BinaryLoader {
    /// Copy the program into memory and point `cpu.pc` at its entry.
    fn load(&mut self, cpu: &mut CpuState, memory: &mut Memory) -> Result<(), LoadError>;
}

/// PS-X EXE header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExeHeader {
    pub pc0: u32,
    pub gp0: u32,
    pub t_addr: u32,
    pub t_size: u32,
    pub s_addr: u32,
    pub s_size: u32,
}

impl ExeHeader {
    const MAGIC: &'static [u8; 8] = b"PS-X EXE";
    /// Size of the header; the text section follows it.
    pub const SIZE: usize = 0x800;

    pub fn parse(image: &[u8]) -> Result<Self, LoadError> {
        if image.len() < 0x38 || &image[..8] != Self::MAGIC {
            return Err(LoadError::BadHeader);
        }
        let word = |off: usize| {
            u32::from_le_bytes([image[off], image[off + 1], image[off + 2], image[off + 3]])
        };
        Ok(Self {
            pc0: word(0x10),
            gp0: word(0x14),
            t_addr: word(0x18),
            t_size: word(0x1C),
            s_addr: word(0x30),
            s_size: word(0x34),
        })
    }
}

/// Loads a PS-X EXE image: text to `t_addr`, registers from the header.
#[derive(Debug, Clone)]
pub struct PsxExeLoader {
    image: Vec<u8>,
}

impl PsxExeLoader {
    pub fn new(image: Vec<u8>) -> Self {
        Self { image }
    }

    pub fn from_path(path: &Path) -> Result<Self, LoadError> {
        Ok(Self::new(std::fs::read(path)?))
    }

    pub fn header(&self) -> Result<ExeHeader, LoadError> {
        ExeHeader::parse(&self.image)
    }
}

impl BinaryLoader for PsxExeLoader {
    fn load(&mut self, cpu: &mut CpuState, memory: &mut Memory) -> Result<(), LoadError> {
        let header = self.header()?;
        let phys = header.t_addr & 0x1FFF_FFFF;
        let end = u64::from(phys) + u64::from(header.t_size);
        if end > memory::RAM_SIZE as u64 {
            return Err(LoadError::OutOfRange {
                addr: header.t_addr,
                len: header.t_size,
            });
        }

        let text = self.image.get(ExeHeader::SIZE..).unwrap_or_default();
        let len = text.len().min(header.t_size as usize);
        if len < header.t_size as usize {
            log::warn!(
                "PS-X EXE text truncated: {len:#X} of {:#X} bytes present",
                header.t_size
            );
        }
        memory.load_ram(phys, &text[..len]);

        cpu.pc = header.pc0;
        cpu.set_reg(28, header.gp0);
        if header.s_addr != 0 {
            let sp = header.s_addr.wrapping_add(header.s_size);
            cpu.set_reg(29, sp);
            cpu.set_reg(30, sp);
        }
        cpu.set_reg(4, 0);
        cpu.set_reg(5, 0);
        log::info!(
            "Loaded PS-X EXE: {len:#X} bytes at {:#010X}, entry {:#010X}",
            header.t_addr,
            header.pc0
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn exe_image(pc0: u32, t_addr: u32, text: &[u8]) -> Vec<u8> {
        let mut image = vec![0u8; ExeHeader::SIZE];
        image[..8].copy_from_slice(b"PS-X EXE");
        image[0x10..0x14].copy_from_slice(&pc0.to_le_bytes());
        image[0x14..0x18].copy_from_slice(&0x8001_2000u32.to_le_bytes());
        image[0x18..0x1C].copy_from_slice(&t_addr.to_le_bytes());
        image[0x1C..0x20].copy_from_slice(&(text.len() as u32).to_le_bytes());
        image[0x30..0x34].copy_from_slice(&0x801F_FF00u32.to_le_bytes());
        image[0x34..0x38].copy_from_slice(&0xF0u32.to_le_bytes());
        image.extend_from_slice(text);
        image
    }

    #[test]
    fn loads_text_and_sets_registers() {
        let text = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
        let mut loader = PsxExeLoader::new(exe_image(0x8001_0000, 0x8001_0000, &text));
        let mut cpu = CpuState::new();
        cpu.regs[4] = 9;
        let mut memory = Memory::new(&[]);

        loader.load(&mut cpu, &mut memory).expect("load");
        assert_eq!(cpu.pc, 0x8001_0000);
        assert_eq!(cpu.regs[28], 0x8001_2000);
        assert_eq!(cpu.regs[29], 0x801F_FFF0);
        assert_eq!(cpu.regs[30], 0x801F_FFF0);
        assert_eq!(cpu.regs[4], 0);
        assert_eq!(memory.ram_u32(0x1_0000), 0x4433_2211);
        assert_eq!(memory.ram_u32(0x1_0004), 0x8877_6655);
    }

    #[test]
    fn rejects_bad_magic_and_oversized_text() {
        let mut cpu = CpuState::new();
        let mut memory = Memory::new(&[]);

        let mut image = exe_image(0x8001_0000, 0x8001_0000, &[0; 4]);
        image[0] = b'X';
        let err = PsxExeLoader::new(image).load(&mut cpu, &mut memory);
        assert!(matches!(err, Err(LoadError::BadHeader)));

        let mut image = exe_image(0x8001_0000, 0x801F_FFF0, &[0; 4]);
        image[0x1C..0x20].copy_from_slice(&0x100u32.to_le_bytes());
        let err = PsxExeLoader::new(image).load(&mut cpu, &mut memory);
        assert!(matches!(err, Err(LoadError::OutOfRange { addr: 0x801F_FFF0, len: 0x100 })));
        assert_eq!(cpu.pc, CpuState::RESET_VECTOR);
    }

    #[test]
    fn null_hardware_reads_open_bus() {
        struct Sink;
        impl EventSink for Sink {
            fn now(&self) -> u64 {
                0
            }
            fn schedule(&mut self, _: EventKind, _: u64) {}
            fn cancel(&mut self, _: EventKind) {}
            fn signal_interrupt(&mut self, _: u32) {}
        }
        let mut hw = NullHardware;
        assert_eq!(hw.read(0x1F80_1800, AccessSize::Byte, &mut Sink), 0xFF);
        assert_eq!(hw.read(0x1F80_1810, AccessSize::Word, &mut Sink), 0xFFFF_FFFF);
    }
}
