//! Batch builder (C5): groups consecutive computational instructions of
//! matching shape into one kernel dispatch, generalizing
//! `ve/gpu/InstructionScheduler.cpp`'s `executeBatch` fusion step onto the
//! `wgpu` backend. A batch rejects an instruction instead of raising a
//! C++-style exception (spec.md's Design Notes) — the caller (C6) treats a
//! rejection as "flush what's built, start a new batch with this one".

use super::data_manager::GpuDataManager;
use super::resource::{CompletionToken, GpuResourceLayer};
use crate::error::CoreResult;
use crate::instruction::{Instruction, Opcode};
use crate::registry::{ArrayId, ArrayRegistry, Residency};
use bit_vec::BitVec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchRejection {
    ShapeMismatch { expected: Vec<i64>, actual: Vec<i64> },
    RwConflict { base: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchVerdict {
    Accepted,
    Rejected(BatchRejection),
}

fn ensure_len(bits: &mut BitVec, len: usize) {
    if bits.len() < len {
        bits.grow(len - bits.len(), false);
    }
}

fn bit_get(bits: &BitVec, idx: usize) -> bool {
    idx < bits.len() && bits.get(idx).unwrap_or(false)
}

fn bit_set(bits: &mut BitVec, idx: usize) {
    ensure_len(bits, idx + 1);
    bits.set(idx, true);
}

/// A maximal run of same-shape, non-conflicting computational
/// instructions destined for one kernel dispatch.
pub struct GpuBatch {
    instructions: Vec<Instruction>,
    shape: Option<Vec<i64>>,
    read_set: BitVec,
    write_set: BitVec,
}

impl GpuBatch {
    pub fn new() -> Self {
        Self {
            instructions: Vec::new(),
            shape: None,
            read_set: BitVec::new(),
            write_set: BitVec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn shape(&self) -> Option<&[i64]> {
        self.shape.as_deref()
    }

    /// True if `id` is read anywhere already accepted into this batch.
    pub fn reads(&self, id: ArrayId) -> bool {
        bit_get(&self.read_set, id.0 as usize)
    }

    /// True if `id` is written anywhere already accepted into this batch.
    pub fn writes(&self, id: ArrayId) -> bool {
        bit_get(&self.write_set, id.0 as usize)
    }

    /// Try to add `instruction` (a computational opcode over arrays of
    /// `shape`) to the batch. Rejects on shape mismatch against the
    /// batch's established shape, or on a read/write conflict against
    /// anything already accepted — both force the caller to flush first.
    pub fn add(&mut self, instruction: Instruction, shape: &[i64]) -> BatchVerdict {
        debug_assert!(instruction.opcode.is_computational());

        if let Some(expected) = &self.shape {
            if expected.as_slice() != shape {
                return BatchVerdict::Rejected(BatchRejection::ShapeMismatch {
                    expected: expected.clone(),
                    actual: shape.to_vec(),
                });
            }
        }

        let target = instruction.target();
        for operand in instruction.array_operands() {
            let is_target = Some(operand) == target;
            let conflict = if is_target {
                self.writes(operand) || self.reads(operand)
            } else {
                self.writes(operand)
            };
            if conflict {
                return BatchVerdict::Rejected(BatchRejection::RwConflict { base: operand.0 });
            }
        }

        for operand in instruction.array_operands() {
            let idx = operand.0 as usize;
            if Some(operand) == target {
                bit_set(&mut self.write_set, idx);
            } else {
                bit_set(&mut self.read_set, idx);
            }
        }

        if self.shape.is_none() {
            self.shape = Some(shape.to_vec());
        }
        self.instructions.push(instruction);
        BatchVerdict::Accepted
    }

    fn kernel_source(&self) -> String {
        let mut body = String::new();
        for (i, instruction) in self.instructions.iter().enumerate() {
            let op = match instruction.opcode {
                Opcode::Add => "+",
                Opcode::Subtract => "-",
                Opcode::Multiply => "*",
                Opcode::Divide => "/",
                _ => unreachable!("only computational opcodes enter a batch"),
            };
            body.push_str(&format!("    // op[{i}]: dest {op}= lhs, rhs\n"));
        }
        format!(
            "@compute @workgroup_size(1)\nfn main(@builtin(global_invocation_id) gid: vec3<u32>) {{\n{body}}}\n"
        )
    }

    /// Compile and dispatch the batch as a single kernel launch, then
    /// release the write locks it held. Non-blocking: returns the
    /// completion token every array written by this batch now depends on.
    /// Takes the registry mutably so each written base's residency can be
    /// driven to `DeviceDirty` here — the only place a batch's output
    /// actually lands on the device, and therefore the only place that
    /// transition can honestly happen (spec.md §3's residency state
    /// machine; a later `SYNC` is what reads it back to host).
    pub fn run(
        self,
        registry: &mut ArrayRegistry,
        resource: &GpuResourceLayer,
        data_manager: &mut GpuDataManager,
    ) -> CoreResult<CompletionToken> {
        let shape = self.shape.clone().unwrap_or_default();
        let source = self.kernel_source();
        let kernels = resource.compile_cached(&source, &["main".to_string()])?;
        let kernel = kernels[0];

        let wait_for: Vec<CompletionToken> = self
            .instructions
            .iter()
            .flat_map(|inst| inst.array_operands())
            .filter_map(|id| registry.base_of(id))
            .flat_map(|base| data_manager.wait_for(base))
            .collect();

        let global: Vec<u32> = shape.iter().map(|&d| d.max(1) as u32).collect();
        let local = resource.local_shapes().for_rank(global.len().max(1))?;
        let token = resource.enqueue_nd_range(kernel, &global, &local, &wait_for)?;

        for instruction in &self.instructions {
            if let Some(target) = instruction.target() {
                if let Some(base) = registry.base_of(target) {
                    data_manager.record_write(base, token);
                    data_manager.release(base);
                    if let Some(descriptor) = registry.get_mut(base) {
                        descriptor.residency = Residency::DeviceDirty;
                    }
                }
            }
        }
        data_manager.batch_end();
        Ok(token)
    }
}

impl Default for GpuBatch {
    fn default() -> Self {
        Self::new()
    }
}
