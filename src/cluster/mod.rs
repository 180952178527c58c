//! Cluster execution engine: process grid (C7), dispatch protocol (C8),
//! slave loop (C9). Generalizes `vem/cluster/comm.cpp` and
//! `vem/cluster/cphvb_vem_cluster_slave.cpp` off a raw MPI/socket byte
//! stream onto typed messages over channels.

pub mod dispatch;
pub mod grid;
pub mod protocol;
pub mod slave;

pub use dispatch::MasterDispatcher;
pub use grid::{ChannelProcessGrid, ProcessGrid};
pub use protocol::{DispatchMessage, DistributedArrayRecord, WireDescriptor, WireInstruction};
pub use slave::{ClusterExecutor, SlaveLoop};
