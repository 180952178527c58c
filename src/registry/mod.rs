//! Array Registry (C1).
//!
//! Owns every array descriptor behind a monotonic, process-wide id — the
//! arena-by-id design described in spec.md §9: views never chase a raw
//! pointer back to their base, they carry the base's id and resolve through
//! this registry on every traversal.

mod descriptor;
mod registry;

pub use descriptor::{ArrayDescriptor, ArrayId, ElemType, Residency, MAX_RANK};
pub use registry::ArrayRegistry;
