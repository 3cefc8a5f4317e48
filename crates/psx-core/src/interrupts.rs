//! Interrupt controller.
//!
//! Collects the eleven hardware interrupt sources into the single line that
//! reaches the CPU as COP0 CAUSE bit 10.
//! Registers at physical 0x1F80_1070 (I_STAT) and 0x1F80_1074 (I_MASK).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Irq {
    VBlank = 0,
    Gpu = 1,
    CdRom = 2,
    Dma = 3,
    Timer0 = 4,
    Timer1 = 5,
    Timer2 = 6,
    Controller = 7,
    Sio = 8,
    Spu = 9,
    Lightpen = 10,
}

pub const I_STAT: u32 = 0x1F80_1070;
pub const I_MASK: u32 = 0x1F80_1074;

const IRQ_BITS: u16 = 0x07FF;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Interrupts {
    /// I_STAT: raised sources (11 bits).
    pub stat: u16,
    /// I_MASK: enabled sources (11 bits).
    pub mask: u16,
}

impl Interrupts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise source `irq`; numbers above 10 are ignored.
    pub fn signal(&mut self, irq: u32) {
        if irq <= 10 {
            self.stat |= 1 << irq;
        }
    }

    pub fn raise(&mut self, irq: Irq) {
        self.signal(irq as u32);
    }

    /// OR a set of level-triggered lines into I_STAT.
    pub fn assert_lines(&mut self, lines: u16) {
        self.stat |= lines & IRQ_BITS;
    }

    /// True if any unmasked source is raised.
    pub fn pending(&self) -> bool {
        self.stat & self.mask & IRQ_BITS != 0
    }

    pub fn read_u32(&self, addr: u32) -> u32 {
        match addr & !3 {
            I_STAT => u32::from(self.stat),
            I_MASK => u32::from(self.mask),
            _ => 0,
        }
    }

    pub fn write_u32(&mut self, addr: u32, val: u32) {
        match addr & !3 {
            // Writing 0 to a bit acknowledges it.
            I_STAT => self.stat &= val as u16 & IRQ_BITS,
            I_MASK => self.mask = val as u16 & IRQ_BITS,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_ignores_out_of_range_sources() {
        let mut irq = Interrupts::new();
        irq.signal(11);
        irq.signal(31);
        assert_eq!(irq.stat, 0);
        irq.raise(Irq::Timer2);
        assert_eq!(irq.stat, 1 << 6);
    }

    #[test]
    fn pending_needs_mask_and_ack_clears() {
        let mut irq = Interrupts::new();
        irq.raise(Irq::VBlank);
        assert!(!irq.pending());
        irq.write_u32(I_MASK, 0xFFFF_FFFF);
        assert_eq!(irq.mask, 0x07FF);
        assert!(irq.pending());
        irq.write_u32(I_STAT, !1);
        assert!(!irq.pending());
        assert_eq!(irq.read_u32(I_STAT), 0);
    }
}
