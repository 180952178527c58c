//! lattice-engine: a lazy instruction scheduler for an array-programming
//! runtime, with GPU and cluster backend engines.
//!
//! A front end builds arrays through a [`Runtime`], enqueues opcodes
//! against them, and lets the attached backend scheduler (GPU or
//! cluster) decide how and when those opcodes actually execute. See
//! `DESIGN.md` for how each module traces back to the source this was
//! generalized from.

pub mod cluster;
pub mod config;
pub mod error;
pub mod gpu;
pub mod instruction;
pub mod registry;
pub mod runtime;

pub use config::RuntimeConfig;
pub use error::{CoreError, CoreResult};
pub use instruction::{Instruction, InstructionQueue, Opcode, Operand, Scalar, Scheduler};
pub use registry::{ArrayDescriptor, ArrayId, ArrayRegistry, ElemType, Residency};
pub use runtime::{ArrayHandle, Runtime};

/// Bootstrap `env_logger` once. No-op if a logger is already installed —
/// safe to call from multiple binaries/tests in the same process, the
/// same shape as the teacher's logging bootstrap.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}
