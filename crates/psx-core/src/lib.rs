//! PlayStation machine core around the `psx-dynarec` recompiler: memory map,
//! interrupt controller, event scheduler, video timing and the dispatcher
//! that ties them to compiled blocks.

mod bus;
pub mod config;
pub mod cpu;
mod dispatcher;
pub mod hw;
pub mod interrupts;
pub mod jit;
pub mod memory;
pub mod psx;
pub mod scheduler;
pub mod stats;
pub mod timing;

pub use config::PsxConfig;
pub use hw::{
    AccessSize, BinaryLoader, BiosHooks, EventSink, Hardware, LoadError, NoBiosHooks, NullHardware,
    PsxExeLoader,
};
pub use psx::{Psx, PsxError};
pub use scheduler::EventKind;
pub use stats::{DispatchStats, PsxStats};
pub use timing::Region;
