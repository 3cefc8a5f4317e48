//! Code arena: executable memory for trampolines and compiled blocks.
//!
//! Native code is emitted through a Cranelift JIT module and accounted
//! against a fixed byte budget with bump semantics: blocks are never freed
//! one at a time, only all together by [`CodeArena::reset`].
//!
//! The arena also owns a pre-allocated table of link words. Every patchable
//! control-flow edge in generated code loads its target from one of these
//! words, so the table must never move while code is live.

use std::mem::ManuallyDrop;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

use cranelift_codegen::ir::{types::Type, Block, Signature};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, Linkage, Module};

#[derive(Debug, thiserror::Error)]
pub enum ArenaError {
    #[error("host ISA unavailable: {0}")]
    HostIsa(String),
    #[error("code arena exhausted ({used} of {capacity} bytes used, {requested} requested)")]
    Exhausted {
        used: usize,
        capacity: usize,
        requested: usize,
    },
    #[error("link table exhausted ({capacity} sites)")]
    LinksExhausted { capacity: usize },
    #[error("link table allocation failed ({capacity} sites)")]
    LinkTableAlloc { capacity: usize },
    #[error("backend: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy)]
pub struct ArenaConfig {
    /// Native code budget in bytes.
    pub code_capacity: usize,
    /// Number of link words available for patchable edges.
    pub link_capacity: usize,
    /// Flush before compiling once fewer bytes than this remain.
    pub flush_margin: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            code_capacity: 4 * 1024 * 1024,
            link_capacity: 65536,
            flush_margin: 64 * 1024,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    pub functions_defined: u64,
    pub bytes_emitted: u64,
    pub links_allocated: u64,
    pub icache_invalidations: u64,
    pub resets: u64,
}

/// Handle to one link word in the arena's link table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkSite(u32);

impl LinkSite {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A finalized function inside the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeRegion {
    pub entry: *const u8,
    pub len: usize,
}

pub struct CodeArena {
    module: ManuallyDrop<JITModule>,
    context: cranelift_codegen::Context,
    builder_context: FunctionBuilderContext,
    config: ArenaConfig,
    used: usize,
    next_symbol_id: u64,
    links: Box<[AtomicUsize]>,
    links_used: usize,
    generation: u64,
    stats: ArenaStats,
}

fn new_module() -> Result<JITModule, ArenaError> {
    let mut flag_builder = settings::builder();
    // Favor runtime speed for hot guest paths.
    flag_builder
        .set("opt_level", "speed")
        .map_err(|e| ArenaError::HostIsa(e.to_string()))?;
    // The call bridge hands every pinned register back to its caller.
    flag_builder
        .set("enable_multi_ret_implicit_sret", "true")
        .map_err(|e| ArenaError::HostIsa(e.to_string()))?;
    let flags = settings::Flags::new(flag_builder);

    let isa_builder = cranelift_native::builder().map_err(|e| ArenaError::HostIsa(e.to_string()))?;
    let isa = isa_builder
        .finish(flags)
        .map_err(|e| ArenaError::HostIsa(e.to_string()))?;
    let jit_builder = JITBuilder::with_isa(isa, default_libcall_names());
    Ok(JITModule::new(jit_builder))
}

fn alloc_link_table(capacity: usize) -> Result<Box<[AtomicUsize]>, ArenaError> {
    let mut links = Vec::new();
    links
        .try_reserve_exact(capacity)
        .map_err(|_| ArenaError::LinkTableAlloc { capacity })?;
    links.extend((0..capacity).map(|_| AtomicUsize::new(0)));
    Ok(links.into_boxed_slice())
}

impl CodeArena {
    pub fn new(config: ArenaConfig) -> Result<Self, ArenaError> {
        let module = new_module()?;
        let context = module.make_context();
        let links = alloc_link_table(config.link_capacity)?;
        log::debug!(
            "Code arena: {} KiB code budget, {} link sites",
            config.code_capacity / 1024,
            config.link_capacity
        );
        Ok(Self {
            module: ManuallyDrop::new(module),
            context,
            builder_context: FunctionBuilderContext::new(),
            config,
            used: 0,
            next_symbol_id: 0,
            links,
            links_used: 0,
            generation: 0,
            stats: ArenaStats::default(),
        })
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    pub fn stats(&self) -> ArenaStats {
        self.stats
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn remaining(&self) -> usize {
        self.config.code_capacity.saturating_sub(self.used)
    }

    /// True when the next compile should be preceded by a flush.
    pub fn needs_flush(&self) -> bool {
        self.remaining() < self.config.flush_margin
            || self.links_used >= self.links.len()
    }

    /// Incremented on every reset; code pointers from older generations are dead.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pointer_type(&self) -> Type {
        self.module.target_config().pointer_type()
    }

    pub fn make_signature(&self) -> Signature {
        self.module.make_signature()
    }

    /// Compile one function into the arena.
    ///
    /// `emit` receives a builder already positioned in a sealed entry block
    /// whose parameters match `signature`.
    pub fn define<F>(
        &mut self,
        prefix: &str,
        signature: Signature,
        emit: F,
    ) -> Result<CodeRegion, ArenaError>
    where
        F: FnOnce(&mut FunctionBuilder<'_>, Block),
    {
        self.context.clear();
        self.context.func.signature = signature;

        {
            let mut builder =
                FunctionBuilder::new(&mut self.context.func, &mut self.builder_context);
            let entry_block = builder.create_block();
            builder.append_block_params_for_function_params(entry_block);
            builder.switch_to_block(entry_block);
            builder.seal_block(entry_block);
            emit(&mut builder, entry_block);
            builder.seal_all_blocks();
            builder.finalize();
        }

        let symbol = format!("{prefix}_{}", self.next_symbol_id);
        self.next_symbol_id += 1;

        let func_id = self
            .module
            .declare_function(&symbol, Linkage::Local, &self.context.func.signature)
            .map_err(|e| ArenaError::Backend(format!("declare_function: {e}")))?;
        self.module
            .define_function(func_id, &mut self.context)
            .map_err(|e| ArenaError::Backend(format!("define_function: {e}")))?;

        let len = self
            .context
            .compiled_code()
            .map(|code| code.code_buffer().len())
            .unwrap_or(0);
        self.module.clear_context(&mut self.context);

        if self.used + len > self.config.code_capacity {
            return Err(ArenaError::Exhausted {
                used: self.used,
                capacity: self.config.code_capacity,
                requested: len,
            });
        }

        self.module
            .finalize_definitions()
            .map_err(|e| ArenaError::Backend(format!("finalize_definitions: {e}")))?;
        let entry = self.module.get_finalized_function(func_id);

        self.used += len;
        self.stats.functions_defined += 1;
        self.stats.bytes_emitted += len as u64;
        Ok(CodeRegion { entry, len })
    }

    /// Bump-allocate a link word initialised to `target`.
    pub fn alloc_link(&mut self, target: *const u8) -> Result<LinkSite, ArenaError> {
        if self.links_used >= self.links.len() {
            return Err(ArenaError::LinksExhausted {
                capacity: self.links.len(),
            });
        }
        let index = self.links_used;
        self.links_used += 1;
        self.links[index].store(target as usize, Ordering::Release);
        self.stats.links_allocated += 1;
        Ok(LinkSite(index as u32))
    }

    pub fn links_used(&self) -> usize {
        self.links_used
    }

    /// Address of the link word, baked into generated code.
    pub fn link_address(&self, site: LinkSite) -> usize {
        &self.links[site.index()] as *const AtomicUsize as usize
    }

    /// Current target of a link word.
    pub fn link_target(&self, site: LinkSite) -> usize {
        self.links[site.index()].load(Ordering::Acquire)
    }

    /// Raw rewrite of a link word. Callers go through the linker, which pairs
    /// this with [`CodeArena::invalidate_icache`].
    pub(crate) fn write_link(&self, site: LinkSite, target: usize) {
        self.links[site.index()].store(target, Ordering::Release);
    }

    /// Make freshly written bytes visible to instruction fetch.
    ///
    /// Code emitted by [`CodeArena::define`] is made coherent by the JIT
    /// module on finalize. Link words are data loaded by generated code, so a
    /// full fence is enough to order the rewrite before the next dispatch.
    pub fn invalidate_icache(&mut self, _addr: usize, _len: usize) {
        fence(Ordering::SeqCst);
        self.stats.icache_invalidations += 1;
    }

    /// Discard every function and link word.
    ///
    /// # Safety
    ///
    /// No pointer returned by [`CodeArena::define`] may be called afterwards,
    /// and no generated code may be executing.
    pub unsafe fn reset(&mut self) -> Result<(), ArenaError> {
        let fresh = new_module()?;
        self.context = fresh.make_context();
        let old = std::mem::replace(&mut self.module, ManuallyDrop::new(fresh));
        // SAFETY: caller guarantees nothing references code from the old module.
        unsafe { ManuallyDrop::into_inner(old).free_memory() };

        for link in self.links[..self.links_used].iter() {
            link.store(0, Ordering::Relaxed);
        }
        fence(Ordering::SeqCst);
        self.links_used = 0;
        self.used = 0;
        self.generation += 1;
        self.stats.resets += 1;
        Ok(())
    }
}

impl Drop for CodeArena {
    fn drop(&mut self) {
        // SAFETY: the module is taken exactly once, here; code pointers handed
        // out by this arena die with it.
        let module = unsafe { ManuallyDrop::take(&mut self.module) };
        // SAFETY: as above, nothing can call into the arena after drop.
        unsafe { module.free_memory() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_codegen::ir::{types, AbiParam, InstBuilder};

    fn small_config() -> ArenaConfig {
        ArenaConfig {
            code_capacity: 64 * 1024,
            link_capacity: 4,
            flush_margin: 1024,
        }
    }

    fn define_const(arena: &mut CodeArena, value: i64) -> CodeRegion {
        let mut sig = arena.make_signature();
        sig.returns.push(AbiParam::new(types::I32));
        arena
            .define("test_const", sig, |builder, _| {
                let v = builder.ins().iconst(types::I32, value);
                builder.ins().return_(&[v]);
            })
            .expect("define")
    }

    #[test]
    fn defined_function_executes_and_is_accounted() {
        let mut arena = CodeArena::new(small_config()).expect("arena");
        let region = define_const(&mut arena, 42);
        assert!(region.len > 0);
        assert_eq!(arena.used(), region.len);
        assert_eq!(arena.stats().functions_defined, 1);

        let f: extern "C" fn() -> i32 = unsafe { std::mem::transmute(region.entry) };
        assert_eq!(f(), 42);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut arena = CodeArena::new(ArenaConfig {
            code_capacity: 1,
            link_capacity: 1,
            flush_margin: 0,
        })
        .expect("arena");
        let mut sig = arena.make_signature();
        sig.returns.push(AbiParam::new(types::I32));
        let err = arena
            .define("too_big", sig, |builder, _| {
                let v = builder.ins().iconst(types::I32, 1);
                builder.ins().return_(&[v]);
            })
            .unwrap_err();
        assert!(matches!(err, ArenaError::Exhausted { capacity: 1, .. }));
    }

    #[test]
    fn link_sites_are_bump_allocated_until_exhausted() {
        let mut arena = CodeArena::new(small_config()).expect("arena");
        let target = 0x1234usize as *const u8;
        let a = arena.alloc_link(target).expect("site");
        let b = arena.alloc_link(target).expect("site");
        assert_ne!(a, b);
        assert_eq!(arena.link_target(a), 0x1234);
        assert_eq!(
            arena.link_address(b) - arena.link_address(a),
            std::mem::size_of::<usize>()
        );
        arena.alloc_link(target).expect("site");
        arena.alloc_link(target).expect("site");
        assert!(arena.needs_flush());
        assert!(matches!(
            arena.alloc_link(target),
            Err(ArenaError::LinksExhausted { capacity: 4 })
        ));
    }

    #[test]
    fn reset_reclaims_everything() {
        let mut arena = CodeArena::new(small_config()).expect("arena");
        define_const(&mut arena, 1);
        let site = arena.alloc_link(0x10usize as *const u8).expect("site");
        let addr = arena.link_address(site);

        unsafe { arena.reset() }.expect("reset");
        assert_eq!(arena.used(), 0);
        assert_eq!(arena.links_used(), 0);
        assert_eq!(arena.generation(), 1);

        // Link table never moves.
        let again = arena.alloc_link(0x20usize as *const u8).expect("site");
        assert_eq!(arena.link_address(again), addr);
        let region = define_const(&mut arena, 7);
        let f: extern "C" fn() -> i32 = unsafe { std::mem::transmute(region.entry) };
        assert_eq!(f(), 7);
    }
}
