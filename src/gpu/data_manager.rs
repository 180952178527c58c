//! Data Manager (C4) — generalizes `ve/gpu/DataManager.hpp`'s interface:
//! tracks which base array owns which device buffer, arbitrates write
//! access for the lifetime of one batch, and remembers the last
//! completion token that touched each buffer so later operands can
//! declare it as a dependency instead of relying on program order.

use super::resource::{BufferHandle, CompletionToken, GpuResourceLayer};
use crate::error::{CoreError, CoreResult};
use crate::registry::ArrayId;
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy)]
struct Binding {
    buffer: BufferHandle,
    last_write: Option<CompletionToken>,
}

/// Owns the base→buffer map and the per-batch write-lock table —
/// `DataManager::lock`/`release`/`sync`/`discard` in
/// `ve/gpu/DataManager.hpp`, generalized off raw `cphVBarray*` onto
/// `ArrayId`.
pub struct GpuDataManager {
    bindings: FxHashMap<ArrayId, Binding>,
    /// base → the view currently authorised to write it within the
    /// active batch — spec.md's Glossary "Write-lock".
    write_locked: FxHashMap<ArrayId, ArrayId>,
}

impl GpuDataManager {
    pub fn new() -> Self {
        Self {
            bindings: FxHashMap::default(),
            write_locked: FxHashMap::default(),
        }
    }

    pub fn buffer_for(&self, base: ArrayId) -> Option<BufferHandle> {
        self.bindings.get(&base).map(|b| b.buffer)
    }

    /// Allocate a device buffer for `base` if one doesn't already exist.
    pub fn ensure_buffer(
        &mut self,
        resource: &GpuResourceLayer,
        base: ArrayId,
        byte_size: usize,
    ) -> CoreResult<BufferHandle> {
        if let Some(binding) = self.bindings.get(&base) {
            return Ok(binding.buffer);
        }
        let buffer = resource.create_buffer(byte_size)?;
        self.bindings.insert(
            base,
            Binding {
                buffer,
                last_write: None,
            },
        );
        Ok(buffer)
    }

    /// Acquire the write lock `base` needs for the rest of the active
    /// batch, on behalf of `view`. This is the enforcement point spec.md
    /// §4.4 step 3 describes: if another *different* view already holds
    /// `base`'s write lock this batch, the caller gets `WRITE_CONFLICT`
    /// and is expected to flush the active batch and retry — the same
    /// view re-locking a base it's already writing is not a conflict.
    pub fn lock(&mut self, base: ArrayId, view: ArrayId) -> CoreResult<()> {
        match self.write_locked.get(&base) {
            Some(&writer) if writer != view => Err(CoreError::WriteConflict { base: base.0 }),
            _ => {
                self.write_locked.insert(base, view);
                Ok(())
            }
        }
    }

    pub fn is_locked(&self, base: ArrayId) -> bool {
        self.write_locked.contains_key(&base)
    }

    pub fn release(&mut self, base: ArrayId) {
        self.write_locked.remove(&base);
    }

    /// Release every write lock held by the batch that just completed —
    /// called once per `schedule()` call after the kernel/copy dispatch
    /// returns.
    pub fn batch_end(&mut self) {
        self.write_locked.clear();
    }

    pub fn record_write(&mut self, base: ArrayId, token: CompletionToken) {
        self.bindings
            .entry(base)
            .and_modify(|b| b.last_write = Some(token))
            .or_insert(Binding {
                buffer: BufferHandle(u64::MAX),
                last_write: Some(token),
            });
    }

    /// The dependency list a new operation on `base` must wait on: the
    /// last write, if any.
    pub fn wait_for(&self, base: ArrayId) -> Vec<CompletionToken> {
        self.bindings
            .get(&base)
            .and_then(|b| b.last_write)
            .into_iter()
            .collect()
    }

    /// Blocking host-side readback of `base`'s current buffer contents —
    /// the device half of `SYNC`. Returns the bytes read.
    pub fn sync(
        &self,
        resource: &GpuResourceLayer,
        base: ArrayId,
        byte_size: usize,
    ) -> CoreResult<Vec<u8>> {
        let buffer = self
            .bindings
            .get(&base)
            .map(|b| b.buffer)
            .ok_or(CoreError::GenericDeviceError {
                reason: format!("sync requested for base {base} with no device buffer"),
            })?;
        let wait_for = self.wait_for(base);
        let mut out = vec![0u8; byte_size];
        resource.enqueue_read_blocking(buffer, &mut out, &wait_for)?;
        Ok(out)
    }

    /// Drop the device-side binding for `base` — `DISCARD`/`FREE`. Does
    /// not touch the write-lock table; a discarded array has no further
    /// writers this batch by construction.
    pub fn discard(&mut self, base: ArrayId) -> Option<BufferHandle> {
        self.bindings.remove(&base).map(|b| b.buffer)
    }

    pub fn is_resident(&self, base: ArrayId) -> bool {
        self.bindings.contains_key(&base)
    }
}

impl Default for GpuDataManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::resource::{ComputeBackend, DeviceLimits, KernelHandle};
    use std::sync::Arc;

    struct FakeBackend;
    impl ComputeBackend for FakeBackend {
        fn create_buffer(&self, _size: usize) -> CoreResult<BufferHandle> {
            Ok(BufferHandle(1))
        }
        fn enqueue_write(
            &self,
            _buffer: BufferHandle,
            _data: &[u8],
            _wait_for: &[CompletionToken],
        ) -> CoreResult<CompletionToken> {
            Ok(CompletionToken(1))
        }
        fn enqueue_read_blocking(
            &self,
            _buffer: BufferHandle,
            out: &mut [u8],
            _wait_for: &[CompletionToken],
        ) -> CoreResult<()> {
            out.fill(7);
            Ok(())
        }
        fn compile(&self, _source: &str, _names: &[String]) -> CoreResult<Vec<KernelHandle>> {
            Ok(vec![])
        }
        fn enqueue_nd_range(
            &self,
            _kernel: KernelHandle,
            _global: &[u32],
            _local: &[u32],
            _wait_for: &[CompletionToken],
        ) -> CoreResult<CompletionToken> {
            Ok(CompletionToken(2))
        }
        fn complete_event(&self) -> CompletionToken {
            CompletionToken(0)
        }
    }

    fn layer() -> GpuResourceLayer {
        GpuResourceLayer::new(
            Arc::new(FakeBackend),
            DeviceLimits {
                max_workgroup_size: 256,
                max_workitem_dims: 3,
                max_workitem_sizes: [256, 256, 256],
            },
            false,
            false,
        )
    }

    #[test]
    fn ensure_buffer_is_idempotent() {
        let resource = layer();
        let mut dm = GpuDataManager::new();
        let a = ArrayId(1);
        let buf1 = dm.ensure_buffer(&resource, a, 64).unwrap();
        let buf2 = dm.ensure_buffer(&resource, a, 64).unwrap();
        assert_eq!(buf1, buf2);
    }

    #[test]
    fn lock_by_a_different_view_is_a_write_conflict() {
        let mut dm = GpuDataManager::new();
        let a = ArrayId(1);
        let writer = ArrayId(2);
        let other_view = ArrayId(3);
        dm.lock(a, writer).unwrap();
        assert!(matches!(
            dm.lock(a, other_view),
            Err(CoreError::WriteConflict { .. })
        ));
    }

    #[test]
    fn relocking_by_the_same_view_is_not_a_conflict() {
        let mut dm = GpuDataManager::new();
        let a = ArrayId(1);
        let writer = ArrayId(2);
        dm.lock(a, writer).unwrap();
        assert!(dm.lock(a, writer).is_ok());
    }

    #[test]
    fn batch_end_clears_locks() {
        let mut dm = GpuDataManager::new();
        let a = ArrayId(1);
        dm.lock(a, ArrayId(2)).unwrap();
        dm.batch_end();
        assert!(!dm.is_locked(a));
    }

    #[test]
    fn discard_drops_binding() {
        let resource = layer();
        let mut dm = GpuDataManager::new();
        let a = ArrayId(1);
        dm.ensure_buffer(&resource, a, 64).unwrap();
        assert!(dm.is_resident(a));
        dm.discard(a);
        assert!(!dm.is_resident(a));
    }

    #[test]
    fn sync_reads_back_bytes() {
        let resource = layer();
        let mut dm = GpuDataManager::new();
        let a = ArrayId(1);
        dm.ensure_buffer(&resource, a, 4).unwrap();
        let bytes = dm.sync(&resource, a, 4).unwrap();
        assert_eq!(bytes, vec![7, 7, 7, 7]);
    }
}
