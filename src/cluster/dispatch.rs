//! Master-side half of the cluster dispatch protocol — generalizes the
//! broadcast/scatter calls `vem/cluster/comm.cpp`'s `comm_master2slaves`
//! issues ahead of every `EXEC`.

use super::grid::ProcessGrid;
use super::protocol::{
    partition_byte_counts, partition_views, DispatchMessage, DistributedArrayRecord,
    WireDescriptor, WireInstruction,
};
use crate::error::CoreResult;
use crate::instruction::Instruction;
use crate::registry::{ArrayDescriptor, ElemType};

/// Drives one `ProcessGrid` from the master side: broadcasts control
/// messages, and pairs each new distributed base with the byte scatter
/// that actually moves its data.
pub struct MasterDispatcher<'g, G: ProcessGrid> {
    grid: &'g G,
}

impl<'g, G: ProcessGrid> MasterDispatcher<'g, G> {
    pub fn new(grid: &'g G) -> Self {
        Self { grid }
    }

    pub fn init(&self, executor_name: impl Into<String>) -> CoreResult<()> {
        self.grid.broadcast(&DispatchMessage::Init {
            executor_name: executor_name.into(),
        })
    }

    pub fn shutdown(&self) -> CoreResult<()> {
        self.grid.broadcast(&DispatchMessage::Shutdown)
    }

    pub fn ufunc(&self, id: i64, name: impl Into<String>) -> CoreResult<()> {
        self.grid.broadcast(&DispatchMessage::Ufunc {
            id,
            name: name.into(),
        })
    }

    /// Broadcast the control message for an `EXEC`, then scatter each new
    /// base's host bytes to its owning ranks. `bases` pairs a master-side
    /// descriptor (host data must already be `Some`) with the master id
    /// the slaves should rewrite from.
    pub fn exec(
        &self,
        instructions: &[Instruction],
        bases: &[(u64, &ArrayDescriptor)],
    ) -> CoreResult<()> {
        let world_size = self.grid.world_size();

        let mut new_arrays = Vec::with_capacity(bases.len());
        for (master_id, descriptor) in bases {
            let total = descriptor.nelements();
            let views = partition_views(total, world_size);
            for view in &views {
                new_arrays.push(DistributedArrayRecord {
                    descriptor: WireDescriptor {
                        master_id: *master_id,
                        elem_type: descriptor.elem_type,
                        shape: descriptor.shape.clone(),
                        is_temp: descriptor.is_temp(),
                    },
                    partition: *view,
                });
            }
        }

        let wire_instructions: Vec<WireInstruction> = instructions
            .iter()
            .map(WireInstruction::from_instruction)
            .collect();

        self.grid.broadcast(&DispatchMessage::Exec {
            instructions: wire_instructions,
            new_arrays,
        })?;

        for (_, descriptor) in bases {
            self.scatter_descriptor(descriptor)?;
        }
        Ok(())
    }

    fn scatter_descriptor(&self, descriptor: &ArrayDescriptor) -> CoreResult<()> {
        let data = match &descriptor.data {
            Some(data) => data,
            None => return Ok(()),
        };
        let counts = partition_byte_counts(
            descriptor.nelements(),
            self.grid.world_size(),
            elem_byte_size(descriptor.elem_type),
        );
        self.grid.scatter(data, &counts)?;
        Ok(())
    }
}

fn elem_byte_size(elem_type: ElemType) -> usize {
    elem_type.size_of()
}
