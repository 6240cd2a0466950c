//! C source backends for lowered tensor-program IR
//!
//! Two sibling emitters walk one [`ir::PrimFunc`] statement tree in a
//! single pass: [`target::ppl`] renders calls into a TPU runtime over
//! descriptor-addressed local/global memory, [`target::rvv`] renders
//! strip-mined RISC-V Vector intrinsic loops over heap tensors. The
//! [`planner`] assigns bank-conflict-aware byte offsets to on-chip
//! buffers before emission.

/// Datatypes and target type spellings
pub mod dtype;
/// Shared emitter machinery
pub mod emit;
/// Error definitions
pub mod error;
/// IR model of the lowered program
pub mod ir;
/// Local-memory address planner
pub mod planner;

/// Target backends
pub mod target {
    /// TPU runtime backend
    pub mod ppl;
    /// RISC-V Vector backend
    pub mod rvv;
}

pub use self::dtype::DataType;
pub use self::emit::Emitter;
pub use self::error::Error;
pub use self::planner::{BankGeometry, assign_addresses, assign_addresses_with};
pub use self::target::ppl::build_tilelang_ppl;
pub use self::target::rvv::build_tilelang_rvv;
