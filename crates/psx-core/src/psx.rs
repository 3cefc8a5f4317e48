//! The machine: CPU state, memory, interrupt controller, scheduler and video
//! timing around one recompiler.

use std::path::Path;

use psx_dynarec::{CpuState, DynarecError, Recompiler, Translator};

use crate::bus::HwSink;
use crate::config::PsxConfig;
use crate::hw::{BiosHooks, BinaryLoader, Hardware, LoadError, NoBiosHooks, PsxExeLoader};
use crate::interrupts::{Interrupts, Irq};
use crate::jit;
use crate::memory::{self, Memory};
use crate::scheduler::{EventKind, Scheduled, Scheduler};
use crate::stats::{DispatchStats, PsxStats};
use crate::timing::VideoTiming;

#[derive(Debug, thiserror::Error)]
pub enum PsxError {
    #[error("dynarec: {0}")]
    Dynarec(#[from] DynarecError),
    #[error("BIOS image is {actual} bytes, expected {expected}")]
    BiosSize { expected: usize, actual: usize },
    #[error("loader: {0}")]
    Load(#[from] LoadError),
}

/// Consecutive idle passes observed at one PC.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct IdleTracker {
    pub pc: u32,
    pub passes: u32,
}

/// The emulated machine: CPU, memory, interrupt controller, scheduler and
/// recompiler, plus the hardware collaborator `H`.
pub struct Psx<H: Hardware> {
    pub cpu: CpuState,
    pub memory: Memory,
    pub interrupts: Interrupts,
    pub hw: H,
    pub(crate) scheduler: Scheduler<Psx<H>>,
    pub(crate) timing: VideoTiming,
    pub(crate) recompiler: Recompiler,
    pub(crate) hooks: Box<dyn BiosHooks>,
    pub(crate) loader: Option<Box<dyn BinaryLoader>>,
    pub(crate) config: PsxConfig,
    /// Global cycle counter; only the dispatcher advances it.
    pub(crate) cycles: u64,
    pub(crate) idle: IdleTracker,
    pub(crate) stats: DispatchStats,
    pub(crate) binary_loaded: bool,
    pub(crate) frame_done: bool,
}

impl<H: Hardware> Psx<H> {
    /// Power on with a full 512 KiB BIOS image and the Cranelift backend.
    pub fn new(bios: &[u8], hw: H, config: PsxConfig) -> Result<Self, PsxError> {
        if bios.len() != memory::BIOS_SIZE {
            return Err(PsxError::BiosSize {
                expected: memory::BIOS_SIZE,
                actual: bios.len(),
            });
        }
        let recompiler = jit::cranelift_recompiler::<H>(config.recompiler)?;
        Ok(Self::assemble(bios, hw, config, recompiler))
    }

    /// Power on with a custom translator. `bios` may be shorter than the
    /// ROM; the remainder reads as zero.
    pub fn with_translator(
        bios: &[u8],
        hw: H,
        config: PsxConfig,
        translator: Box<dyn Translator>,
    ) -> Result<Self, PsxError> {
        let recompiler = Recompiler::new(translator, config.recompiler)?;
        Ok(Self::assemble(bios, hw, config, recompiler))
    }

    fn assemble(bios: &[u8], hw: H, config: PsxConfig, recompiler: Recompiler) -> Self {
        log::info!(
            "PSX: region={:?} backend={} chain_limit={} boot_hook={:#010X}",
            config.region,
            recompiler.backend_name(),
            config.chain_limit,
            config.boot_hook_pc
        );
        let mut psx = Self {
            cpu: CpuState::new(),
            memory: Memory::new(bios),
            interrupts: Interrupts::new(),
            hw,
            scheduler: Scheduler::new(),
            timing: VideoTiming::new(config.region),
            recompiler,
            hooks: Box::new(NoBiosHooks),
            loader: None,
            config,
            cycles: 0,
            idle: IdleTracker::default(),
            stats: DispatchStats::default(),
            binary_loaded: true,
            frame_done: false,
        };
        psx.power_on();
        psx
    }

    fn power_on(&mut self) {
        let now = self.cycles;
        self.scheduler.clear();
        let hblank = self.timing.start(now);
        self.scheduler.schedule(EventKind::HBlank, hblank, Self::on_hblank);
        let vblank = self.timing.frame_blank_deadline(now);
        self.scheduler.schedule(EventKind::VBlank, vblank, Self::on_vblank);
        let (hw, mut sink) = self.split_sink(now);
        hw.reset(&mut sink);
        self.binary_loaded = self.loader.is_none();
        self.idle = IdleTracker::default();
        self.frame_done = false;
    }

    /// Reset the CPU and restart timing. RAM survives; compiled code does not.
    pub fn reset(&mut self) -> Result<(), PsxError> {
        self.cpu = CpuState::new();
        self.interrupts = Interrupts::new();
        self.flush_code_cache()?;
        self.power_on();
        log::info!("PSX: reset at cycle {}", self.cycles);
        Ok(())
    }

    pub fn set_bios_hooks(&mut self, hooks: Box<dyn BiosHooks>) {
        self.hooks = hooks;
    }

    /// Arm the boot hook: `loader` runs when the BIOS reaches the hook PC.
    pub fn set_loader(&mut self, loader: Box<dyn BinaryLoader>) {
        self.loader = Some(loader);
        self.binary_loaded = false;
    }

    pub fn load_exe(&mut self, path: &Path) -> Result<(), PsxError> {
        let loader = PsxExeLoader::from_path(path)?;
        log::info!("PSX: {} queued for boot", path.display());
        self.set_loader(Box::new(loader));
        Ok(())
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn config(&self) -> &PsxConfig {
        &self.config
    }

    pub fn timing(&self) -> &VideoTiming {
        &self.timing
    }

    pub fn scheduler(&self) -> &Scheduler<Self> {
        &self.scheduler
    }

    pub fn recompiler(&self) -> &Recompiler {
        &self.recompiler
    }

    pub fn binary_loaded(&self) -> bool {
        self.binary_loaded
    }

    pub fn stats(&self) -> PsxStats {
        PsxStats {
            cycles: self.cycles,
            dispatch: self.stats,
            recompiler: self.recompiler.stats(),
            translator: self.recompiler.translator_stats(),
            cache: self.recompiler.cache_stats(),
            linker: self.recompiler.linker_stats(),
            arena: self.recompiler.arena_stats(),
            cache_len: self.recompiler.cache_len(),
            arena_used: self.recompiler.arena().used(),
        }
    }

    pub fn reset_stats(&mut self) {
        self.stats = DispatchStats::default();
        self.recompiler.reset_stats();
    }

    /// Drop all compiled code.
    pub fn flush_code_cache(&mut self) -> Result<(), PsxError> {
        self.recompiler.flush()?;
        self.memory.clear_code_marks();
        Ok(())
    }

    /// Drop blocks compiled from physical `[phys, phys + len)`, in every RAM
    /// mirror. For writes that bypass the CPU, such as DMA.
    pub fn invalidate_code(&mut self, phys: u32, len: u32) -> usize {
        let phys = memory::physical(phys);
        if phys >= 4 * memory::RAM_SIZE as u32 {
            return self.recompiler.invalidate_range(phys, len);
        }
        let base = phys & (memory::RAM_SIZE as u32 - 1);
        (0..4)
            .map(|mirror| {
                self.recompiler
                    .invalidate_range(base + mirror * memory::RAM_SIZE as u32, len)
            })
            .sum()
    }

    pub(crate) fn split_sink(&mut self, now: u64) -> (&mut H, HwSink<'_, H>) {
        (
            &mut self.hw,
            HwSink {
                scheduler: &mut self.scheduler,
                interrupts: &mut self.interrupts,
                now,
            },
        )
    }

    pub(crate) fn on_hardware_event(psx: &mut Self, kind: EventKind, now: u64) {
        let (hw, mut sink) = psx.split_sink(now);
        hw.on_event(kind, &mut sink);
    }

    fn on_hblank(psx: &mut Self, _kind: EventKind, now: u64) {
        let batch = psx.timing.advance_batch(now);
        if batch.frame_end {
            psx.interrupts.raise(Irq::VBlank);
            let (hw, mut sink) = psx.split_sink(now);
            hw.on_frame(&mut sink);
            psx.stats.frames += 1;
            psx.frame_done = true;
            log::trace!("Frame {} ended at cycle {now}", psx.timing.frames());
        }
        psx.scheduler
            .schedule(EventKind::HBlank, batch.next_deadline, Self::on_hblank);
    }

    fn on_vblank(psx: &mut Self, _kind: EventKind, now: u64) {
        let (hw, mut sink) = psx.split_sink(now);
        hw.on_frame_blank(&mut sink);
        let next = psx.timing.frame_blank_deadline(now);
        psx.scheduler.schedule(EventKind::VBlank, next, Self::on_vblank);
    }
}

impl<H: Hardware> Scheduled for Psx<H> {
    fn scheduler_mut(&mut self) -> &mut Scheduler<Self> {
        &mut self.scheduler
    }
}
