//! Cluster Slave Loop (C9) — generalizes the message dispatch loop in
//! `vem/cluster/cphvb_vem_cluster_slave.cpp`'s `main`: service one
//! message at a time, rewrite master ids to local handles, hand the
//! rewritten instructions to whatever executes them locally.

use super::grid::ProcessGrid;
use super::protocol::DispatchMessage;
use crate::error::CoreResult;
use crate::instruction::Instruction;
use crate::registry::{ArrayDescriptor, ArrayId, ArrayRegistry};
use rustc_hash::FxHashMap;

/// Whatever actually runs a rewritten instruction list locally — the GPU
/// scheduler in production, a recording fake in tests. Matches "hand the
/// rewritten list to the downstream execution component" in spec.md §4.9.
pub trait ClusterExecutor {
    fn register_ufunc(&mut self, id: i64, name: String);
    fn execute(&mut self, instructions: &[Instruction]) -> CoreResult<()>;
}

/// Services one `ProcessGrid` channel until `Shutdown`. Owns the local
/// registry this rank's share of the distributed arrays lives in — a
/// `StaticStore`-style slab keyed by the *local* id, with a side table
/// mapping master ids to it, matching the original's rebinding step.
pub struct SlaveLoop<'g, G: ProcessGrid, E: ClusterExecutor> {
    grid: &'g G,
    registry: ArrayRegistry,
    master_to_local: FxHashMap<u64, ArrayId>,
    executor: E,
}

impl<'g, G: ProcessGrid, E: ClusterExecutor> SlaveLoop<'g, G, E> {
    pub fn new(grid: &'g G, executor: E) -> Self {
        Self {
            grid,
            registry: ArrayRegistry::new(),
            master_to_local: FxHashMap::default(),
            executor,
        }
    }

    pub fn registry(&self) -> &ArrayRegistry {
        &self.registry
    }

    /// Service messages until `Shutdown` or a fatal error. Returns
    /// `Ok(())` on a clean shutdown.
    pub fn run(&mut self) -> CoreResult<()> {
        loop {
            let message = self.grid.recv()?;
            if self.handle(message)? {
                return Ok(());
            }
        }
    }

    /// Handle one message; returns `true` if the loop should stop.
    fn handle(&mut self, message: DispatchMessage) -> CoreResult<bool> {
        match message {
            DispatchMessage::Init { executor_name } => {
                log::info!("[SlaveLoop] rank {} init: {executor_name}", self.grid.rank());
                Ok(false)
            }
            DispatchMessage::Ufunc { id, name } => {
                self.executor.register_ufunc(id, name);
                Ok(false)
            }
            DispatchMessage::Exec {
                instructions,
                new_arrays,
            } => {
                for record in new_arrays {
                    let local_id = self.registry.new_id();
                    let descriptor = ArrayDescriptor::new_base(
                        local_id,
                        record.descriptor.elem_type,
                        record.descriptor.shape,
                    );
                    self.master_to_local.insert(record.descriptor.master_id, local_id);
                    self.registry.insert(descriptor);
                }

                let rewritten: Vec<Instruction> = instructions
                    .into_iter()
                    .map(|wire| {
                        let map = &self.master_to_local;
                        wire.into_instruction(|master_id| {
                            *map.get(&master_id).unwrap_or(&ArrayId(master_id))
                        })
                    })
                    .collect();

                self.executor.execute(&rewritten)?;
                Ok(false)
            }
            DispatchMessage::Shutdown => {
                for id in self.master_to_local.values().copied().collect::<Vec<_>>() {
                    self.registry.remove(id);
                }
                Ok(true)
            }
        }
    }
}
