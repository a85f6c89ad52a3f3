//! Architecture support. x86-64 is the only target; the module split keeps
//! the assembly-adjacent glue in one place.

pub mod x86_64;

pub use self::x86_64::{
    context::{self, FpuState, Registers},
    disable_interrupts, enable_interrupts, halt_loop, init,
};
