use psx_dynarec::{ArenaConfig, RecompilerConfig};

use crate::timing::Region;

/// Machine and dispatcher tuning.
#[derive(Debug, Clone, Copy)]
pub struct PsxConfig {
    pub region: Region,
    /// Cycles to run when no event is scheduled.
    pub lookahead_cycles: u64,
    /// Charge for a block that reports no cycles consumed.
    pub min_block_charge: u64,
    /// Passes of an unconditional self-loop before fast-forwarding.
    pub idle_strong_threshold: u32,
    /// Passes of a conditional self-loop in the BIOS before fast-forwarding.
    pub idle_weak_bios_threshold: u32,
    /// Same, for RAM. `u32::MAX` disables the skip.
    pub idle_weak_ram_threshold: u32,
    /// Direct links a block chain may follow per dispatch; 0 disables chaining.
    pub chain_limit: u32,
    /// PC at which the BIOS shell hands over to the binary loader.
    pub boot_hook_pc: u32,
    pub recompiler: RecompilerConfig,
}

impl Default for PsxConfig {
    fn default() -> Self {
        Self {
            region: Region::Ntsc,
            lookahead_cycles: 1024,
            min_block_charge: 8,
            idle_strong_threshold: 1,
            idle_weak_bios_threshold: 2048,
            idle_weak_ram_threshold: u32::MAX,
            chain_limit: 32,
            boot_hook_pc: 0x8003_0000,
            recompiler: RecompilerConfig::default(),
        }
    }
}

fn parse_env<T>(name: &str, default: T, parse: impl Fn(&str) -> Option<T>) -> T {
    match std::env::var(name) {
        Ok(raw) => match parse(raw.trim()) {
            Some(value) => value,
            None => {
                log::warn!("Ignoring invalid {name}={raw:?}");
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_u32(s: &str) -> Option<u32> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16).ok(),
        None => s.parse().ok(),
    }
}

fn parse_env_u32(name: &str, default: u32) -> u32 {
    parse_env(name, default, |s| parse_u32(s).filter(|v| *v > 0))
}

fn parse_env_u32_allow_zero(name: &str, default: u32) -> u32 {
    parse_env(name, default, parse_u32)
}

fn parse_env_u64(name: &str, default: u64) -> u64 {
    parse_env(name, default, |s| s.parse::<u64>().ok().filter(|v| *v > 0))
}

fn parse_env_usize(name: &str, default: usize) -> usize {
    parse_env(name, default, |s| s.parse::<usize>().ok().filter(|v| *v > 0))
}

impl PsxConfig {
    /// Defaults overridden by `PSX_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        let arena = ArenaConfig {
            code_capacity: parse_env_usize("PSX_DYNAREC_CODE_BYTES", d.recompiler.arena.code_capacity),
            link_capacity: parse_env_usize("PSX_DYNAREC_LINK_SLOTS", d.recompiler.arena.link_capacity),
            flush_margin: parse_env("PSX_DYNAREC_FLUSH_MARGIN", d.recompiler.arena.flush_margin, |s| {
                s.parse().ok()
            }),
        };
        let recompiler = RecompilerConfig {
            arena,
            cache_slots: parse_env_usize("PSX_DYNAREC_CACHE_SLOTS", d.recompiler.cache_slots),
            pool_nodes: parse_env_usize("PSX_DYNAREC_POOL_NODES", d.recompiler.pool_nodes),
            patch_sites: parse_env_usize("PSX_DYNAREC_PATCH_SITES", d.recompiler.patch_sites),
            max_block_instructions: parse_env_u32(
                "PSX_DYNAREC_MAX_BLOCK_INSNS",
                d.recompiler.max_block_instructions,
            ),
        };
        Self {
            region: parse_env("PSX_REGION", d.region, |s| s.parse().ok()),
            lookahead_cycles: parse_env_u64("PSX_LOOKAHEAD_CYCLES", d.lookahead_cycles),
            min_block_charge: parse_env_u64("PSX_MIN_BLOCK_CHARGE", d.min_block_charge),
            idle_strong_threshold: parse_env_u32("PSX_IDLE_STRONG_THRESHOLD", d.idle_strong_threshold),
            idle_weak_bios_threshold: parse_env_u32(
                "PSX_IDLE_WEAK_BIOS_THRESHOLD",
                d.idle_weak_bios_threshold,
            ),
            idle_weak_ram_threshold: parse_env_u32(
                "PSX_IDLE_WEAK_RAM_THRESHOLD",
                d.idle_weak_ram_threshold,
            ),
            chain_limit: parse_env_u32_allow_zero("PSX_DYNAREC_CHAIN_LIMIT", d.chain_limit),
            boot_hook_pc: parse_env_u32("PSX_BOOT_HOOK_PC", d.boot_hook_pc),
            recompiler,
        }
    }
}
