//! Wires the four pieces a front end touches — registry, instruction
//! queue, a backend scheduler (GPU or cluster), and configuration — into
//! one value. spec.md §9's design note: no singleton, no global state; a
//! front end asks a `Runtime` for arrays and never constructs a scheduler
//! itself.

use crate::config::RuntimeConfig;
use crate::error::CoreResult;
use crate::gpu::{GpuResourceLayer, GpuScheduler, WgpuBackend};
use crate::instruction::{Instruction, InstructionQueue, Opcode, Scheduler};
use crate::registry::{ArrayDescriptor, ArrayId, ArrayRegistry, ElemType};
use parking_lot::Mutex;
use std::sync::Arc;

/// Scoped acquisition of one base array. Replaces the original
/// `multi_array`'s destructor, which enqueues `FREE`/`DISCARD` directly —
/// here, dropping the handle enqueues `FREE` on the shared queue, and
/// only an explicit `Runtime::drain`/`sync` call actually flushes it to
/// the backend, matching spec.md §4.2's "producers never block" rule.
pub struct ArrayHandle {
    id: ArrayId,
    registry: Arc<Mutex<ArrayRegistry>>,
    queue: Arc<Mutex<InstructionQueue>>,
}

impl ArrayHandle {
    pub fn id(&self) -> ArrayId {
        self.id
    }

    pub fn shape(&self) -> Vec<i64> {
        self.registry
            .lock()
            .get(self.id)
            .map(|descriptor| descriptor.shape.clone())
            .unwrap_or_default()
    }

    pub fn mark_temp(&self, is_temp: bool) {
        if let Some(descriptor) = self.registry.lock().get_mut(self.id) {
            descriptor.mark_temp(is_temp);
        }
    }
}

impl Drop for ArrayHandle {
    fn drop(&mut self) {
        self.queue.lock().enqueue(Instruction::unary(Opcode::Free, self.id));
    }
}

/// Owns the registry, the instruction queue, and whichever backend
/// scheduler the caller chose (GPU, cluster, or a test double) — spec.md
/// §2/§9.
pub struct Runtime {
    registry: Arc<Mutex<ArrayRegistry>>,
    queue: Arc<Mutex<InstructionQueue>>,
    scheduler: Box<dyn Scheduler + Send>,
    config: RuntimeConfig,
}

impl Runtime {
    pub fn new(config: RuntimeConfig, scheduler: Box<dyn Scheduler + Send>) -> Self {
        Self {
            registry: Arc::new(Mutex::new(ArrayRegistry::new())),
            queue: Arc::new(Mutex::new(InstructionQueue::new())),
            scheduler,
            config,
        }
    }

    /// Probe for a GPU (`WgpuBackend::new`, failing with `NO_GPU_PLATFORM`
    /// if no adapter qualifies) and wire up a `GpuScheduler` on top of it.
    pub fn with_gpu(config: RuntimeConfig) -> CoreResult<Self> {
        let (backend, limits, float16_supported, float64_supported) = WgpuBackend::new()?;
        let registry = Arc::new(Mutex::new(ArrayRegistry::new()));
        let resource = Arc::new(GpuResourceLayer::new(
            backend,
            limits,
            float16_supported,
            float64_supported,
        ));
        let scheduler = GpuScheduler::new(registry.clone(), resource);
        Ok(Self {
            registry,
            queue: Arc::new(Mutex::new(InstructionQueue::new())),
            scheduler: Box::new(scheduler),
            config,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<Mutex<ArrayRegistry>> {
        self.registry.clone()
    }

    /// Allocate a new base array and return a scoped handle to it.
    pub fn create_base(&self, elem_type: ElemType, shape: Vec<i64>) -> ArrayHandle {
        let id = self.registry.lock().new_id();
        self.registry
            .lock()
            .insert(ArrayDescriptor::new_base(id, elem_type, shape));
        ArrayHandle {
            id,
            registry: self.registry.clone(),
            queue: self.queue.clone(),
        }
    }

    /// Enqueue one instruction, flushing immediately if it's a flush
    /// point (explicit `SYNC`) — spec.md §4.2.
    pub fn enqueue(&mut self, instruction: Instruction) -> CoreResult<()> {
        let is_flush_point = {
            let mut queue = self.queue.lock();
            let is_flush_point = InstructionQueue::is_flush_point(&instruction);
            queue.enqueue(instruction);
            is_flush_point
        };
        if is_flush_point {
            self.drain()
        } else {
            Ok(())
        }
    }

    /// Flush whatever is pending in the queue to the backend scheduler —
    /// the iterator-begin/shutdown flush triggers in spec.md §4.2 both
    /// reduce to this.
    pub fn drain(&mut self) -> CoreResult<()> {
        let mut queue = self.queue.lock();
        queue.flush(self.scheduler.as_mut())
    }

    pub fn sync(&mut self, id: ArrayId) -> CoreResult<()> {
        self.enqueue(Instruction::unary(Opcode::Sync, id))
    }

    /// Drain the queue one last time before the runtime goes away.
    pub fn shutdown(&mut self) -> CoreResult<()> {
        self.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{Operand, Scalar};

    struct RecordingScheduler {
        batches: Vec<Vec<Instruction>>,
    }

    impl Scheduler for RecordingScheduler {
        fn schedule(&mut self, instructions: &[Instruction]) -> CoreResult<()> {
            self.batches.push(instructions.to_vec());
            Ok(())
        }
    }

    fn runtime() -> Runtime {
        Runtime::new(
            RuntimeConfig::default(),
            Box::new(RecordingScheduler { batches: vec![] }),
        )
    }

    #[test]
    fn dropping_a_handle_enqueues_a_free() {
        let mut runtime = runtime();
        {
            let handle = runtime.create_base(ElemType::Int64, vec![4]);
            assert_eq!(handle.shape(), vec![4]);
        }
        // The FREE the drop enqueued is sitting in the queue, unflushed.
        runtime.drain().unwrap();
    }

    #[test]
    fn sync_is_a_flush_point() {
        let mut runtime = runtime();
        let handle = runtime.create_base(ElemType::Int64, vec![4]);
        runtime
            .enqueue(Instruction::binary(
                Opcode::Add,
                handle.id(),
                Operand::Array(handle.id()),
                Operand::Immediate(Scalar::Int64(1)),
            ))
            .unwrap();
        runtime.sync(handle.id()).unwrap();
    }
}
