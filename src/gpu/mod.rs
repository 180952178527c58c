//! GPU execution engine: resource layer (C3), data manager (C4), batch
//! builder (C5), instruction scheduler (C6).

pub mod batch;
pub mod data_manager;
pub mod resource;
pub mod scheduler;

pub use batch::{BatchRejection, BatchVerdict, GpuBatch};
pub use data_manager::GpuDataManager;
pub use resource::{
    BufferHandle, CompletionToken, ComputeBackend, DeviceLimits, GpuResourceLayer, KernelHandle,
    LocalShapes, WgpuBackend,
};
pub use scheduler::{GpuScheduler, SchedulerState};
