//! The run loop: pick a deadline, run blocks up to it, fire due events.

use psx_dynarec::{BlockEntry, IdleKind, Resolved, TranslatorConfig};

use crate::cpu::{enter_exception, exception_vector, Cop0, ExceptionCode, RAM_VECTOR};
use crate::hw::Hardware;
use crate::jit::{CallbackContext, CodeSource};
use crate::memory::{self, PAGE_SHIFT, PAGE_SIZE};
use crate::psx::{IdleTracker, Psx, PsxError};
use crate::scheduler::dispatch_due;

/// Physical base of the BIOS ROM.
const BIOS_BASE: u32 = 0x1FC0_0000;

impl<H: Hardware> Psx<H> {
    /// Run until the cycle counter reaches `target`.
    pub fn run_until(&mut self, target: u64) -> Result<(), PsxError> {
        while self.cycles < target {
            self.step_limited(target)?;
        }
        Ok(())
    }

    /// Run until the scanline batch that closes the current frame has fired.
    pub fn run_frame(&mut self) -> Result<(), PsxError> {
        self.frame_done = false;
        while !self.frame_done {
            self.step_limited(u64::MAX)?;
        }
        Ok(())
    }

    /// One pass: execute up to the next deadline, then fire due events.
    pub fn step(&mut self) -> Result<(), PsxError> {
        self.step_limited(u64::MAX)
    }

    fn step_limited(&mut self, limit: u64) -> Result<(), PsxError> {
        let deadline = self
            .scheduler
            .next_deadline()
            .unwrap_or_else(|| self.cycles + self.config.lookahead_cycles.max(1))
            .min(limit);
        self.execute_until(deadline)?;
        self.dispatch_events();
        Ok(())
    }

    fn min_charge(&self) -> u64 {
        self.config.min_block_charge.max(1)
    }

    fn execute_until(&mut self, deadline: u64) -> Result<(), PsxError> {
        while self.cycles < deadline {
            let pc = self.cpu.pc;

            if !self.binary_loaded && pc == self.config.boot_hook_pc {
                self.load_binary()?;
                continue;
            }

            if self.intercept_bios(pc) {
                self.cycles += self.min_charge();
                self.sync_interrupts();
                continue;
            }

            // Only JR/JALR reach a misaligned PC; they leave their own
            // address in current_pc, which becomes EPC.
            if pc & 3 != 0 {
                self.stats.address_errors += 1;
                self.cpu.cop0.regs[Cop0::BAD_VADDR] = pc;
                enter_exception(&mut self.cpu, ExceptionCode::AddressErrorLoad);
                self.cycles += self.min_charge();
                continue;
            }

            let Some(entry) = self.resolve_block(pc)? else {
                self.cycles += self.min_charge();
                continue;
            };

            self.run_block(&entry, deadline);
            self.invalidate_dirty_code();
            self.sync_interrupts();

            if self.fast_forward_idle(&entry, deadline) {
                break;
            }
        }
        Ok(())
    }

    fn resolve_block(&mut self, pc: u32) -> Result<Option<BlockEntry>, PsxError> {
        if let Some(entry) = self.recompiler.lookup_direct(pc) {
            self.stats.fast_hits += 1;
            return Ok(Some(entry));
        }
        let mut source = CodeSource::new(&self.memory);
        match self.recompiler.resolve(pc, &mut source)? {
            Resolved::Hit(entry) => Ok(Some(entry)),
            Resolved::Compiled(entry) => {
                self.memory
                    .mark_code(entry.pc, entry.source_len.saturating_mul(4));
                Ok(Some(entry))
            }
            Resolved::Failed(err) => {
                log::debug!("No code at {pc:#010X} ({err}), raising IBE");
                self.stats.bus_errors += 1;
                self.cpu.current_pc = pc;
                enter_exception(&mut self.cpu, ExceptionCode::BusErrorInstruction);
                Ok(None)
            }
        }
    }

    fn run_block(&mut self, entry: &BlockEntry, deadline: u64) {
        let budget = (deadline - self.cycles).min(i32::MAX as u64) as i32;
        self.cpu.in_block = 1;
        self.cpu.link_budget = self.config.chain_limit;
        self.cpu.initial_cycles_left = budget;
        self.cpu.cycles_left = budget;

        let mut ctx = CallbackContext::<H> {
            memory: &mut self.memory,
            interrupts: &mut self.interrupts,
            hw: &mut self.hw,
            scheduler: &mut self.scheduler,
            now: self.cycles,
        };
        // SAFETY: the entry came out of the cache this iteration, so its code
        // is live. `ctx` only points at fields disjoint from `cpu` and outlives
        // the call.
        let left = unsafe {
            entry.code.call(
                &mut self.cpu,
                (&mut ctx as *mut CallbackContext<H>).cast(),
                budget,
            )
        };
        self.cpu.in_block = 0;
        self.stats.blocks_executed += 1;

        if let Some(resume) = self.cpu.take_abort() {
            self.cpu.pc = resume;
            self.stats.aborts += 1;
            if entry.idle.is_idle() {
                self.recompiler.refine_idle(entry.pc, IdleKind::None);
            }
        }

        let spent = i64::from(budget) - i64::from(left);
        self.cycles += if spent > 0 {
            spent as u64
        } else {
            self.stats.min_charges += 1;
            self.min_charge()
        };
    }

    fn intercept_bios(&mut self, pc: u32) -> bool {
        let phys = memory::physical(pc);
        if !TranslatorConfig::BIOS_VECTORS.contains(&phys) {
            return false;
        }
        if !self.hooks.intercept(phys, &mut self.cpu, &mut self.memory) {
            return false;
        }
        self.stats.bios_intercepts += 1;
        true
    }

    fn invalidate_dirty_code(&mut self) {
        if !self.memory.has_dirty_pages() {
            return;
        }
        for page in self.memory.take_dirty_pages() {
            let removed = self.invalidate_code(page << PAGE_SHIFT, PAGE_SIZE);
            self.stats.smc_pages += 1;
            log::debug!("Code page {page:#05X} written, dropped {removed} blocks");
        }
    }

    /// Deliver the hardware interrupt if SR lets it through.
    pub(crate) fn sync_interrupts(&mut self) {
        let lines = self.hw.poll_interrupts(self.cycles);
        self.interrupts.assert_lines(lines);
        let pending = self.interrupts.pending();
        self.cpu.cop0.set_hw_interrupt_pending(pending);
        if !pending || !self.cpu.cop0.interrupts_enabled() {
            return;
        }
        // The kernel copies its handler to 0x80 late in boot.
        if exception_vector(&self.cpu.cop0) == RAM_VECTOR && self.memory.ram_u32(0x80) == 0 {
            self.stats.interrupts_ignored += 1;
            if self.stats.interrupts_ignored == 1 {
                log::warn!("Interrupt pending with no RAM handler installed, holding it");
            } else {
                log::debug!("Interrupt held: no RAM handler");
            }
            return;
        }
        self.stats.interrupts += 1;
        self.cpu.current_pc = self.cpu.pc;
        enter_exception(&mut self.cpu, ExceptionCode::Interrupt);
    }

    fn idle_threshold(&self, entry: &BlockEntry) -> u32 {
        match entry.idle {
            IdleKind::None => u32::MAX,
            IdleKind::Strong => self.config.idle_strong_threshold,
            IdleKind::Weak if memory::physical(entry.pc) >= BIOS_BASE => {
                self.config.idle_weak_bios_threshold
            }
            IdleKind::Weak => self.config.idle_weak_ram_threshold,
        }
    }

    /// Skip to `deadline` once an idle loop has spun often enough. Runs
    /// after interrupt delivery, so a pending interrupt always wins.
    fn fast_forward_idle(&mut self, entry: &BlockEntry, deadline: u64) -> bool {
        let threshold = self.idle_threshold(entry);
        if threshold == u32::MAX || self.cpu.pc != entry.pc {
            self.idle = IdleTracker::default();
            return false;
        }
        if self.idle.pc == entry.pc && self.idle.passes > 0 {
            self.idle.passes = self.idle.passes.saturating_add(1);
        } else {
            self.idle = IdleTracker {
                pc: entry.pc,
                passes: 1,
            };
        }
        if self.idle.passes < threshold {
            return false;
        }

        let skipped = deadline.saturating_sub(self.cycles);
        self.cycles = self.cycles.max(deadline);
        self.stats.idle_skips += 1;
        self.stats.idle_cycles_skipped += skipped;
        self.idle = IdleTracker::default();
        log::debug!(
            "Idle {:?} loop at {:#010X}, skipped {skipped} cycles",
            entry.idle,
            entry.pc
        );
        true
    }

    fn dispatch_events(&mut self) {
        match self.scheduler.next_deadline() {
            Some(next) if next <= self.cycles => {}
            _ => return,
        }
        let now = self.cycles;
        let fired = dispatch_due(self, now);
        self.stats.events_dispatched += fired as u64;
        self.sync_interrupts();
    }

    fn load_binary(&mut self) -> Result<(), PsxError> {
        self.binary_loaded = true;
        let Some(loader) = self.loader.as_mut() else {
            return Ok(());
        };
        match loader.load(&mut self.cpu, &mut self.memory) {
            Ok(()) => {
                log::info!("Binary loaded, entry {:#010X}", self.cpu.pc);
                self.flush_code_cache()?;
            }
            Err(err) => log::warn!("Binary load failed, staying in BIOS: {err}"),
        }
        Ok(())
    }
}
