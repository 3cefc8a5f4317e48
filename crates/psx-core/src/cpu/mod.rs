pub mod exceptions;

pub use exceptions::{enter_exception, exception_vector, rfe, ExceptionCode, RAM_VECTOR, ROM_VECTOR};
pub use psx_dynarec::{Cop0, CpuState};
