//! Physical memory map.
//!
//! | Physical                  | Region                               |
//! |---------------------------|--------------------------------------|
//! | 0x0000_0000..0x0080_0000  | 2 MiB main RAM, mirrored four times  |
//! | 0x1F00_0000..0x1F80_0000  | expansion 1 (reads float high)       |
//! | 0x1F80_0000..0x1F80_0400  | 1 KiB scratchpad                     |
//! | 0x1F80_1000..0x1F80_3000  | hardware I/O                         |
//! | 0x1FC0_0000..0x1FC8_0000  | 512 KiB BIOS ROM                     |
//! | 0x1FFE_0130               | cache control (KSEG2 0xFFFE_0130)    |
//!
//! KUSEG, KSEG0 and KSEG1 all map here by dropping the top three bits.
//! All accesses are little-endian.

use crate::hw::AccessSize;

pub const RAM_SIZE: usize = 2 * 1024 * 1024;
pub const BIOS_SIZE: usize = 512 * 1024;
pub const SCRATCHPAD_SIZE: usize = 1024;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u32 = 1 << PAGE_SHIFT;
const RAM_PAGES: usize = RAM_SIZE >> PAGE_SHIFT;

const RAM_WINDOW: u32 = 0x0080_0000;
const EXPANSION1: u32 = 0x1F00_0000;
const SCRATCHPAD: u32 = 0x1F80_0000;
const IO_START: u32 = 0x1F80_1000;
const IO_END: u32 = 0x1F80_3000;
const BIOS: u32 = 0x1FC0_0000;
const CACHE_CONTROL: u32 = 0x1FFE_0130;

#[inline]
pub fn physical(addr: u32) -> u32 {
    addr & 0x1FFF_FFFF
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// Offset into main RAM (mirrors folded).
    Ram(u32),
    Expansion1,
    Scratchpad(u32),
    /// Physical I/O address.
    Io(u32),
    Bios(u32),
    CacheControl,
    Unmapped,
}

pub fn decode(addr: u32) -> Region {
    let phys = physical(addr);
    match phys {
        0..RAM_WINDOW => Region::Ram(phys & (RAM_SIZE as u32 - 1)),
        EXPANSION1..SCRATCHPAD => Region::Expansion1,
        SCRATCHPAD..0x1F80_0400 => Region::Scratchpad(phys - SCRATCHPAD),
        IO_START..IO_END => Region::Io(phys),
        BIOS..0x1FC8_0000 => Region::Bios(phys - BIOS),
        _ if phys & !3 == CACHE_CONTROL => Region::CacheControl,
        _ => Region::Unmapped,
    }
}

/// Receiver for accesses that fall in the I/O window.
pub trait IoBus {
    fn io_read(&mut self, phys: u32, size: AccessSize) -> u32;
    fn io_write(&mut self, phys: u32, value: u32, size: AccessSize);
}

fn read_le(buf: &[u8], offset: usize, size: AccessSize) -> u32 {
    match size {
        AccessSize::Byte => u32::from(buf[offset]),
        AccessSize::Half => {
            let o = offset & !1;
            u32::from(u16::from_le_bytes([buf[o], buf[o + 1]]))
        }
        AccessSize::Word => {
            let o = offset & !3;
            u32::from_le_bytes([buf[o], buf[o + 1], buf[o + 2], buf[o + 3]])
        }
    }
}

fn write_le(buf: &mut [u8], offset: usize, value: u32, size: AccessSize) {
    match size {
        AccessSize::Byte => buf[offset] = value as u8,
        AccessSize::Half => {
            let o = offset & !1;
            buf[o..o + 2].copy_from_slice(&(value as u16).to_le_bytes());
        }
        AccessSize::Word => {
            let o = offset & !3;
            buf[o..o + 4].copy_from_slice(&value.to_le_bytes());
        }
    }
}

pub struct Memory {
    ram: Box<[u8]>,
    scratchpad: Box<[u8]>,
    bios: Box<[u8]>,
    cache_control: u32,
    /// RAM pages holding compiled code, one bit per 4 KiB page.
    code_pages: [u64; RAM_PAGES / 64],
    /// Code pages written since the last drain.
    dirty: Vec<u32>,
}

impl Memory {
    /// `bios` is copied into the ROM region; a short image leaves the rest
    /// zeroed.
    pub fn new(bios: &[u8]) -> Self {
        let mut rom = vec![0u8; BIOS_SIZE].into_boxed_slice();
        let len = bios.len().min(BIOS_SIZE);
        rom[..len].copy_from_slice(&bios[..len]);
        Self {
            ram: vec![0u8; RAM_SIZE].into_boxed_slice(),
            scratchpad: vec![0u8; SCRATCHPAD_SIZE].into_boxed_slice(),
            bios: rom,
            cache_control: 0,
            code_pages: [0; RAM_PAGES / 64],
            dirty: Vec::new(),
        }
    }

    pub fn ram(&self) -> &[u8] {
        &self.ram
    }

    pub fn bios(&self) -> &[u8] {
        &self.bios
    }

    pub fn cache_control(&self) -> u32 {
        self.cache_control
    }

    /// Word at RAM offset `offset` (mirrors folded).
    pub fn ram_u32(&self, offset: u32) -> u32 {
        read_le(&self.ram, (offset as usize) & (RAM_SIZE - 1), AccessSize::Word)
    }

    /// Copy `data` into RAM at `offset`, bypassing the bus. Code compiled
    /// from the affected pages is reported dirty.
    pub fn load_ram(&mut self, offset: u32, data: &[u8]) {
        let start = (offset as usize).min(RAM_SIZE);
        let end = start.saturating_add(data.len()).min(RAM_SIZE);
        self.ram[start..end].copy_from_slice(&data[..end - start]);
        let mut page = start >> PAGE_SHIFT;
        while page << PAGE_SHIFT < end {
            self.touch_page(page);
            page += 1;
        }
    }

    /// Side-effect free instruction fetch for the translator. Only RAM and
    /// BIOS hold executable code.
    pub fn fetch(&self, addr: u32) -> Option<u32> {
        if addr & 3 != 0 {
            return None;
        }
        match decode(addr) {
            Region::Ram(off) => Some(read_le(&self.ram, off as usize, AccessSize::Word)),
            Region::Bios(off) => Some(read_le(&self.bios, off as usize, AccessSize::Word)),
            _ => None,
        }
    }

    pub fn read(&mut self, addr: u32, size: AccessSize, io: &mut dyn IoBus) -> u32 {
        match decode(addr) {
            Region::Ram(off) => read_le(&self.ram, off as usize, size),
            Region::Scratchpad(off) => read_le(&self.scratchpad, off as usize, size),
            Region::Bios(off) => read_le(&self.bios, off as usize, size),
            Region::Io(phys) => io.io_read(phys, size),
            Region::CacheControl => self.cache_control & size.mask(),
            Region::Expansion1 => size.mask(),
            Region::Unmapped => {
                log::trace!("Unmapped read at {addr:#010X}");
                0
            }
        }
    }

    /// Store through the bus. While the data cache is isolated (SR.IsC)
    /// only uncached KSEG1 stores go through.
    pub fn write(
        &mut self,
        addr: u32,
        value: u32,
        size: AccessSize,
        isolated: bool,
        io: &mut dyn IoBus,
    ) {
        if isolated && addr & 0xE000_0000 != 0xA000_0000 {
            return;
        }
        match decode(addr) {
            Region::Ram(off) => {
                write_le(&mut self.ram, off as usize, value, size);
                self.touch_page(off as usize >> PAGE_SHIFT);
            }
            Region::Scratchpad(off) => write_le(&mut self.scratchpad, off as usize, value, size),
            Region::Io(phys) => io.io_write(phys, value, size),
            Region::CacheControl => self.cache_control = value,
            Region::Bios(_) | Region::Expansion1 => {}
            Region::Unmapped => log::trace!("Unmapped write at {addr:#010X} = {value:#010X}"),
        }
    }

    /// Record that code was compiled from `[addr, addr + len)`.
    pub fn mark_code(&mut self, addr: u32, len: u32) {
        let Region::Ram(start) = decode(addr) else {
            return;
        };
        let end = (start as usize + len.max(1) as usize).min(RAM_SIZE);
        for page in (start as usize >> PAGE_SHIFT)..=((end - 1) >> PAGE_SHIFT) {
            self.code_pages[page / 64] |= 1 << (page % 64);
        }
    }

    pub fn is_code_page(&self, page: usize) -> bool {
        page < RAM_PAGES && self.code_pages[page / 64] & (1 << (page % 64)) != 0
    }

    pub fn clear_code_marks(&mut self) {
        self.code_pages = [0; RAM_PAGES / 64];
        self.dirty.clear();
    }

    fn touch_page(&mut self, page: usize) {
        let bit = 1u64 << (page % 64);
        if self.code_pages[page / 64] & bit != 0 {
            self.code_pages[page / 64] &= !bit;
            self.dirty.push(page as u32);
        }
    }

    #[inline]
    pub fn has_dirty_pages(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Drain the written code pages (RAM page indices).
    pub fn take_dirty_pages(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.dirty)
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("cache_control", &self.cache_control)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Io {
        reads: Vec<u32>,
        writes: Vec<(u32, u32, AccessSize)>,
    }

    impl IoBus for Io {
        fn io_read(&mut self, phys: u32, _size: AccessSize) -> u32 {
            self.reads.push(phys);
            0x1234_5678
        }

        fn io_write(&mut self, phys: u32, value: u32, size: AccessSize) {
            self.writes.push((phys, value, size));
        }
    }

    #[test]
    fn decode_segments_and_regions() {
        assert_eq!(decode(0x8000_1000), Region::Ram(0x1000));
        assert_eq!(decode(0xA060_1000), Region::Ram(0x1000));
        assert_eq!(decode(0x1F80_0010), Region::Scratchpad(0x10));
        assert_eq!(decode(0xBF80_1070), Region::Io(0x1F80_1070));
        assert_eq!(decode(0xBFC0_0180), Region::Bios(0x180));
        assert_eq!(decode(0xFFFE_0130), Region::CacheControl);
        assert_eq!(decode(0x1F00_0084), Region::Expansion1);
        assert_eq!(decode(0x1000_0000), Region::Unmapped);
    }

    #[test]
    fn ram_is_mirrored_and_little_endian() {
        let mut mem = Memory::new(&[]);
        let mut io = Io::default();
        mem.write(0x8000_0100, 0xAABB_CCDD, AccessSize::Word, false, &mut io);
        assert_eq!(mem.read(0x0020_0100, AccessSize::Word, &mut io), 0xAABB_CCDD);
        assert_eq!(mem.read(0xA060_0100, AccessSize::Byte, &mut io), 0xDD);
        assert_eq!(mem.read(0x8000_0102, AccessSize::Half, &mut io), 0xAABB);
        assert!(io.reads.is_empty());
    }

    #[test]
    fn bios_is_read_only_and_io_is_delegated() {
        let mut mem = Memory::new(&[0x78, 0x56, 0x34, 0x12]);
        let mut io = Io::default();
        mem.write(0xBFC0_0000, 0, AccessSize::Word, false, &mut io);
        assert_eq!(mem.read(0xBFC0_0000, AccessSize::Word, &mut io), 0x1234_5678);
        assert_eq!(mem.fetch(0xBFC0_0000), Some(0x1234_5678));

        assert_eq!(mem.read(0x1F80_1814, AccessSize::Word, &mut io), 0x1234_5678);
        mem.write(0xBF80_1810, 7, AccessSize::Half, false, &mut io);
        assert_eq!(io.reads, vec![0x1F80_1814]);
        assert_eq!(io.writes, vec![(0x1F80_1810, 7, AccessSize::Half)]);
        assert_eq!(mem.fetch(0x1F80_1810), None);
    }

    #[test]
    fn isolated_cache_drops_cached_stores() {
        let mut mem = Memory::new(&[]);
        let mut io = Io::default();
        mem.write(0x8000_0000, 0x1111, AccessSize::Word, true, &mut io);
        mem.write(0x0000_0004, 0x2222, AccessSize::Word, true, &mut io);
        assert_eq!(mem.ram_u32(0), 0);
        assert_eq!(mem.ram_u32(4), 0);
        mem.write(0xA000_0008, 0x3333, AccessSize::Word, true, &mut io);
        assert_eq!(mem.ram_u32(8), 0x3333);
    }

    #[test]
    fn cache_control_register() {
        let mut mem = Memory::new(&[]);
        let mut io = Io::default();
        mem.write(0xFFFE_0130, 0x0001_E988, AccessSize::Word, false, &mut io);
        assert_eq!(mem.cache_control(), 0x0001_E988);
        assert_eq!(mem.read(0xFFFE_0130, AccessSize::Word, &mut io), 0x0001_E988);
    }

    #[test]
    fn stores_into_code_pages_queue_them_once() {
        let mut mem = Memory::new(&[]);
        let mut io = Io::default();
        mem.mark_code(0x8000_1FF8, 16);
        assert!(mem.is_code_page(1));
        assert!(mem.is_code_page(2));
        assert!(!mem.has_dirty_pages());

        mem.write(0x8000_5000, 1, AccessSize::Word, false, &mut io);
        assert!(!mem.has_dirty_pages());

        mem.write(0x8020_1004, 1, AccessSize::Byte, false, &mut io);
        mem.write(0x8000_1008, 2, AccessSize::Byte, false, &mut io);
        assert_eq!(mem.take_dirty_pages(), vec![1]);
        assert!(!mem.is_code_page(1));
        assert!(mem.is_code_page(2));

        mem.load_ram(0x2000, &[0; 8]);
        assert_eq!(mem.take_dirty_pages(), vec![2]);
    }
}
