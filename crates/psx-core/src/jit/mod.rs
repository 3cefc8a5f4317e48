//! Glue between the machine and the recompiler.

mod helpers;

pub(crate) use helpers::CallbackContext;
pub use helpers::helper_table;

use psx_dynarec::{
    CompileError, CraneliftTranslator, InstructionSource, Recompiler, RecompilerConfig,
    TranslatorConfig,
};

use crate::hw::Hardware;
use crate::memory::Memory;
use crate::psx::PsxError;

/// Instruction fetch for the translator: RAM and BIOS only, no side effects.
pub struct CodeSource<'a> {
    memory: &'a Memory,
}

impl<'a> CodeSource<'a> {
    pub fn new(memory: &'a Memory) -> Self {
        Self { memory }
    }
}

impl InstructionSource for CodeSource<'_> {
    fn read_u32(&mut self, addr: u32) -> Result<u32, CompileError> {
        self.memory
            .fetch(addr)
            .ok_or(CompileError::MemoryRead { addr })
    }
}

/// Cranelift translator wired to the helpers for hardware `H`.
pub fn cranelift_translator<H: Hardware>() -> CraneliftTranslator {
    CraneliftTranslator::new(TranslatorConfig::new(helper_table::<H>()))
}

pub fn cranelift_recompiler<H: Hardware>(config: RecompilerConfig) -> Result<Recompiler, PsxError> {
    Ok(Recompiler::new(Box::new(cranelift_translator::<H>()), config)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_source_only_fetches_ram_and_bios() {
        let mut memory = Memory::new(&[0x0D, 0x00, 0x00, 0x00]);
        memory.load_ram(0x100, &0x2408_0001u32.to_le_bytes());
        let mut source = CodeSource::new(&memory);
        assert_eq!(source.read_u32(0x8000_0100).ok(), Some(0x2408_0001));
        assert_eq!(source.read_u32(0xBFC0_0000).ok(), Some(0x0D));
        assert!(matches!(
            source.read_u32(0x1F80_0000),
            Err(CompileError::MemoryRead { addr: 0x1F80_0000 })
        ));
        assert!(source.read_u32(0x8000_0102).is_err());
    }
}
