//! Scenario-level tests for the GPU backend (S1, S2, S3, S5 from the
//! testable-properties table), driven against a fake compute backend so
//! no real GPU is required.

use lattice_engine::gpu::{
    BufferHandle, CompletionToken, ComputeBackend, DeviceLimits, GpuResourceLayer, GpuScheduler,
    KernelHandle, SchedulerState,
};
use lattice_engine::instruction::{Instruction, Opcode, Operand, Scalar, Scheduler};
use lattice_engine::registry::{ArrayDescriptor, ArrayId, ArrayRegistry, ElemType, Residency};
use lattice_engine::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

struct FakeBackend {
    compile_count: AtomicUsize,
    fail_next_compile: Mutex<bool>,
    next_id: AtomicU64,
}

impl FakeBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            compile_count: AtomicUsize::new(0),
            fail_next_compile: Mutex::new(false),
            next_id: AtomicU64::new(0),
        })
    }

    fn fail_next(&self) {
        *self.fail_next_compile.lock() = true;
    }
}

impl ComputeBackend for FakeBackend {
    fn create_buffer(&self, _size: usize) -> CoreResult<BufferHandle> {
        Ok(BufferHandle(self.next_id.fetch_add(1, Ordering::Relaxed)))
    }

    fn enqueue_write(
        &self,
        _buffer: BufferHandle,
        _data: &[u8],
        _wait_for: &[CompletionToken],
    ) -> CoreResult<CompletionToken> {
        Ok(CompletionToken(0))
    }

    fn enqueue_read_blocking(
        &self,
        _buffer: BufferHandle,
        out: &mut [u8],
        _wait_for: &[CompletionToken],
    ) -> CoreResult<()> {
        out.fill(0);
        Ok(())
    }

    fn compile(&self, _source: &str, names: &[String]) -> CoreResult<Vec<KernelHandle>> {
        let mut fail = self.fail_next_compile.lock();
        if *fail {
            *fail = false;
            return Err(CoreError::KernelBuildFailed {
                log: "synthetic opcode failed to compile".to_string(),
            });
        }
        self.compile_count.fetch_add(1, Ordering::Relaxed);
        Ok(names
            .iter()
            .enumerate()
            .map(|(i, _)| KernelHandle(i as u64))
            .collect())
    }

    fn enqueue_nd_range(
        &self,
        _kernel: KernelHandle,
        _global: &[u32],
        _local: &[u32],
        _wait_for: &[CompletionToken],
    ) -> CoreResult<CompletionToken> {
        Ok(CompletionToken(1))
    }

    fn complete_event(&self) -> CompletionToken {
        CompletionToken(0)
    }
}

fn scheduler(
    registry: Arc<Mutex<ArrayRegistry>>,
    backend: Arc<FakeBackend>,
) -> GpuScheduler {
    let resource = Arc::new(GpuResourceLayer::new(
        backend,
        DeviceLimits {
            max_workgroup_size: 256,
            max_workitem_dims: 3,
            max_workitem_sizes: [256, 256, 256],
        },
        false,
        false,
    ));
    GpuScheduler::new(registry, resource)
}

fn add_one(target: ArrayId) -> Instruction {
    Instruction::binary(
        Opcode::Add,
        target,
        Operand::Array(target),
        Operand::Immediate(Scalar::Int64(1)),
    )
}

/// S1: a computational instruction followed by an explicit SYNC must
/// flush and read the result back, leaving the base device-and-host
/// clean.
#[test]
fn s1_scalar_add_then_sync_round_trips_residency() {
    let registry = Arc::new(Mutex::new(ArrayRegistry::new()));
    let a = {
        let mut reg = registry.lock();
        let id = reg.new_id();
        reg.insert(ArrayDescriptor::new_base(id, ElemType::Int64, vec![4]));
        id
    };

    let backend = FakeBackend::new();
    let mut scheduler = scheduler(registry.clone(), backend);

    scheduler
        .schedule(&[add_one(a), add_one(a), Instruction::unary(Opcode::Sync, a)])
        .unwrap();

    let reg = registry.lock();
    let descriptor = reg.get(a).unwrap();
    assert_eq!(descriptor.residency, Residency::DeviceAndHostClean);
    assert_eq!(descriptor.data.as_ref().unwrap().len(), descriptor.byte_size());
}

/// S2: `a += 1; b += 1; a += b` must split into two batches because the
/// third instruction writes `a`, which the first batch already wrote.
#[test]
fn s2_batch_break_on_conflicting_write() {
    let registry = Arc::new(Mutex::new(ArrayRegistry::new()));
    let (a, b) = {
        let mut reg = registry.lock();
        let a = reg.new_id();
        reg.insert(ArrayDescriptor::new_base(a, ElemType::Int64, vec![4]));
        let b = reg.new_id();
        reg.insert(ArrayDescriptor::new_base(b, ElemType::Int64, vec![4]));
        (a, b)
    };

    let backend = FakeBackend::new();
    let mut scheduler = scheduler(registry.clone(), backend.clone());

    let a_plus_b = Instruction::binary(Opcode::Add, a, Operand::Array(a), Operand::Array(b));
    scheduler.schedule(&[add_one(a), add_one(b), a_plus_b]).unwrap();

    // First batch {a+=1, b+=1} flushed (and compiled) when the conflict
    // was detected; the second batch {a+=b} is still sitting active.
    assert_eq!(backend.compile_count.load(Ordering::Relaxed), 1);
    assert_eq!(scheduler.state(), SchedulerState::Active);

    scheduler.force_flush().unwrap();
    assert_eq!(backend.compile_count.load(Ordering::Relaxed), 2);
    assert_eq!(scheduler.state(), SchedulerState::Idle);
}

/// S3: a write followed immediately by DISCARD must flush first, then
/// drop the device buffer — no leaked binding.
#[test]
fn s3_discard_mid_batch_flushes_then_drops_binding() {
    let registry = Arc::new(Mutex::new(ArrayRegistry::new()));
    let a = {
        let mut reg = registry.lock();
        let id = reg.new_id();
        reg.insert(ArrayDescriptor::new_base(id, ElemType::Int64, vec![4]));
        id
    };

    let backend = FakeBackend::new();
    let mut scheduler = scheduler(registry.clone(), backend.clone());

    scheduler
        .schedule(&[add_one(a), Instruction::unary(Opcode::Discard, a)])
        .unwrap();

    assert_eq!(backend.compile_count.load(Ordering::Relaxed), 1);
    assert_eq!(scheduler.state(), SchedulerState::Idle);

    let reg = registry.lock();
    assert_eq!(reg.get(a).unwrap().residency, Residency::HostOnly);
}

/// S5: a kernel that fails to compile must surface `KERNEL_BUILD_FAILED`
/// without poisoning the scheduler for unrelated later instructions.
#[test]
fn s5_kernel_build_failure_does_not_poison_later_work() {
    let registry = Arc::new(Mutex::new(ArrayRegistry::new()));
    let (a, b) = {
        let mut reg = registry.lock();
        let a = reg.new_id();
        reg.insert(ArrayDescriptor::new_base(a, ElemType::Int64, vec![4]));
        let b = reg.new_id();
        reg.insert(ArrayDescriptor::new_base(b, ElemType::Int64, vec![4]));
        (a, b)
    };

    let backend = FakeBackend::new();
    let mut scheduler = scheduler(registry.clone(), backend.clone());

    backend.fail_next();
    let err = scheduler
        .schedule(&[add_one(a), Instruction::unary(Opcode::Sync, a)])
        .unwrap_err();
    assert!(matches!(err, CoreError::KernelBuildFailed { .. }));
    assert_eq!(scheduler.state(), SchedulerState::Idle);

    // Unrelated later work against a different base still succeeds.
    scheduler
        .schedule(&[add_one(b), Instruction::unary(Opcode::Sync, b)])
        .unwrap();
    assert_eq!(scheduler.state(), SchedulerState::Idle);
}

/// spec.md §4.4 step 3: two *different views* of the same base, both
/// written, must force a batch split even though they carry different
/// array ids and so would never collide in the batch builder's own
/// raw-id write set (`GpuBatch::add`). This is the write-lock table's
/// job, not the batch builder's — if the lock were never consulted, both
/// writes would land in a single (incorrect) batch.
#[test]
fn write_conflict_across_views_of_the_same_base_forces_a_batch_split() {
    let registry = Arc::new(Mutex::new(ArrayRegistry::new()));
    let (base, view) = {
        let mut reg = registry.lock();
        let base = reg.new_id();
        reg.insert(ArrayDescriptor::new_base(base, ElemType::Int64, vec![4]));
        let view = reg.new_id();
        reg.insert(ArrayDescriptor::new_view(
            view,
            base,
            ElemType::Int64,
            vec![4],
            vec![1],
            0,
        ));
        (base, view)
    };

    let backend = FakeBackend::new();
    let mut scheduler = scheduler(registry.clone(), backend.clone());

    scheduler.schedule(&[add_one(base), add_one(view)]).unwrap();

    // The write-lock conflict on `base` forced the first instruction's
    // batch to flush (and compile) before the second could join it.
    assert_eq!(backend.compile_count.load(Ordering::Relaxed), 1);
    assert_eq!(scheduler.state(), SchedulerState::Active);

    scheduler.force_flush().unwrap();
    assert_eq!(backend.compile_count.load(Ordering::Relaxed), 2);
    assert_eq!(scheduler.state(), SchedulerState::Idle);
}
