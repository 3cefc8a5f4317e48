//! Views of the machine handed to hardware collaborators.

use crate::hw::{AccessSize, EventSink, Hardware};
use crate::interrupts::{Interrupts, I_MASK, I_STAT};
use crate::memory::IoBus;
use crate::psx::Psx;
use crate::scheduler::{EventKind, Scheduler};

/// [`EventSink`] over the machine's scheduler and interrupt controller.
pub(crate) struct HwSink<'a, H: Hardware> {
    pub scheduler: &'a mut Scheduler<Psx<H>>,
    pub interrupts: &'a mut Interrupts,
    pub now: u64,
}

fn is_video(kind: EventKind) -> bool {
    matches!(kind, EventKind::VBlank | EventKind::HBlank)
}

impl<H: Hardware> EventSink for HwSink<'_, H> {
    fn now(&self) -> u64 {
        self.now
    }

    fn schedule(&mut self, kind: EventKind, deadline: u64) {
        if is_video(kind) {
            log::warn!("Ignoring hardware request to schedule {kind:?}");
            return;
        }
        self.scheduler
            .schedule(kind, deadline, Psx::<H>::on_hardware_event);
    }

    fn cancel(&mut self, kind: EventKind) {
        if !is_video(kind) {
            self.scheduler.cancel(kind);
        }
    }

    fn signal_interrupt(&mut self, irq: u32) {
        self.interrupts.signal(irq);
    }
}

/// The I/O window: interrupt controller registers are answered here, the
/// rest goes to the [`Hardware`] collaborator.
pub(crate) struct IoPort<'a, H: Hardware> {
    pub hw: &'a mut H,
    pub sink: HwSink<'a, H>,
}

fn is_irq_register(phys: u32) -> bool {
    matches!(phys & !3, I_STAT | I_MASK)
}

impl<H: Hardware> IoBus for IoPort<'_, H> {
    fn io_read(&mut self, phys: u32, size: AccessSize) -> u32 {
        if is_irq_register(phys) {
            let word = self.sink.interrupts.read_u32(phys);
            return (word >> ((phys & 3) * 8)) & size.mask();
        }
        self.hw.read(phys, size, &mut self.sink)
    }

    fn io_write(&mut self, phys: u32, value: u32, size: AccessSize) {
        if is_irq_register(phys) {
            self.sink.interrupts.write_u32(phys, value & size.mask());
            return;
        }
        self.hw.write(phys, value, size, &mut self.sink);
    }
}
