//! Array descriptor types — spec.md §3 "Data Model".

/// Upper bound on array rank. The original cphVB source fixes this at 16;
/// we keep the same default but make it a plain constant rather than a
/// hard-coded array dimension, so `RuntimeConfig::max_rank` can be checked
/// against it without baking the number into every call site.
pub const MAX_RANK: usize = 16;

static_assertions::const_assert!(MAX_RANK > 0);
static_assertions::const_assert!(MAX_RANK <= 32);

/// Process-wide, monotonically increasing array identity.
///
/// Identities are never reused, even after the descriptor they named has
/// been freed — this is what lets the cluster slave loop (C9) and the GPU
/// data manager (C4) use bare ids as hash keys without fear of aliasing a
/// stale one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct ArrayId(pub u64);

impl std::fmt::Display for ArrayId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Primitive element types the core moves between host and device.
///
/// Grounded on `cphVBarray.cpp`'s `oclType`/`cphvb_type` mapping — the
/// distillation doesn't enumerate these, but every downstream buffer-sizing
/// and wire-encoding computation in §4.3/§4.4/§4.8 depends on knowing
/// `size_of::<T>()`, so the type set is reconstructed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ElemType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
}

impl ElemType {
    pub const fn size_of(self) -> usize {
        match self {
            ElemType::Bool | ElemType::Int8 | ElemType::Uint8 => 1,
            ElemType::Int16 | ElemType::Uint16 => 2,
            ElemType::Int32 | ElemType::Uint32 | ElemType::Float32 => 4,
            ElemType::Int64 | ElemType::Uint64 | ElemType::Float64 => 8,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, ElemType::Float32 | ElemType::Float64)
    }
}

/// GPU residency state for a base array — spec.md §3 "GPU residency state".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// No device buffer exists; the host buffer (if any) is authoritative.
    HostOnly,
    /// A device buffer exists and has been written by a batch not yet
    /// synced back to host.
    DeviceDirty,
    /// A device buffer exists, is up to date, but the host side has not
    /// been refreshed.
    DeviceClean,
    /// Device and host agree.
    DeviceAndHostClean,
    /// A batch that would have produced this base failed to build
    /// (`KERNEL_BUILD_FAILED`); the core is permitted to mark dependents
    /// this way per spec.md §7's propagation policy instead of silently
    /// resurrecting stale data.
    Poisoned,
}

impl Residency {
    /// Whether a `SYNC` on this residency state must pull fresh data from
    /// the device before the host buffer can be trusted.
    pub fn needs_readback(self) -> bool {
        matches!(self, Residency::DeviceDirty)
    }
}

/// A logical multi-dimensional array descriptor — spec.md §3.
#[derive(Debug, Clone)]
pub struct ArrayDescriptor {
    pub id: ArrayId,
    /// `None` for a base array (owns storage); `Some(base)` for a view.
    pub base: Option<ArrayId>,
    pub elem_type: ElemType,
    pub ndim: usize,
    pub shape: Vec<i64>,
    pub stride: Vec<i64>,
    pub start: i64,
    /// Host buffer contents; only ever populated on a base (`base.is_none()`).
    pub data: Option<Vec<u8>>,
    /// Set once the GPU data manager allocates device storage for this
    /// base. A view's `device_buffer` is always `None` — residency lives
    /// on the base, looked up through the registry.
    pub device_buffer: Option<crate::gpu::resource::BufferHandle>,
    pub residency: Residency,
    pub ref_count: u32,
    /// Marks this descriptor as a compiler-temporary: eligible for fusion
    /// into a caller's batch without forcing a host readback. See
    /// spec.md §9's note on the original's `setTemp` self-assignment bug —
    /// here the flag is a real, mutable field.
    is_temp: bool,
}

impl ArrayDescriptor {
    /// A base array descriptor owning its own storage.
    pub fn new_base(id: ArrayId, elem_type: ElemType, shape: Vec<i64>) -> Self {
        let ndim = shape.len();
        let stride = row_major_strides(&shape);
        Self {
            id,
            base: None,
            elem_type,
            ndim,
            shape,
            stride,
            start: 0,
            data: None,
            device_buffer: None,
            residency: Residency::HostOnly,
            ref_count: 1,
            is_temp: false,
        }
    }

    /// A view re-windowing `base`'s storage. Shape/stride are copied at
    /// creation time (never chased through `base` later), per spec.md §4.1.
    pub fn new_view(
        id: ArrayId,
        base: ArrayId,
        elem_type: ElemType,
        shape: Vec<i64>,
        stride: Vec<i64>,
        start: i64,
    ) -> Self {
        let ndim = shape.len();
        Self {
            id,
            base: Some(base),
            elem_type,
            ndim,
            shape,
            stride,
            start,
            data: None,
            device_buffer: None,
            residency: Residency::HostOnly,
            ref_count: 1,
            is_temp: false,
        }
    }

    pub fn is_base(&self) -> bool {
        self.base.is_none()
    }

    pub fn is_scalar(&self) -> bool {
        self.ndim == 0
    }

    /// Total element count: `Π shape[i]`, `1` for a scalar.
    pub fn nelements(&self) -> i64 {
        self.shape.iter().product()
    }

    pub fn byte_size(&self) -> usize {
        self.nelements() as usize * self.elem_type.size_of()
    }

    pub fn is_temp(&self) -> bool {
        self.is_temp
    }

    /// View this base's host buffer as a typed slice of `T`, the same
    /// cast the teacher's kernel layer (`world/compute/kernels.rs`) uses
    /// to move Pod structs across the host/device boundary without a
    /// copy. Returns `None` if there is no host data yet (device-only
    /// residency) or if `T`'s size doesn't evenly divide the buffer.
    pub fn host_data_as<T: bytemuck::Pod>(&self) -> Option<&[T]> {
        let bytes = self.data.as_deref()?;
        bytemuck::try_cast_slice(bytes).ok()
    }

    /// Populate this base's host buffer from a typed slice, encoding it
    /// to raw bytes via `bytemuck` instead of a manual byte-by-byte copy.
    pub fn set_host_data_from<T: bytemuck::Pod>(&mut self, data: &[T]) {
        self.data = Some(bytemuck::cast_slice(data).to_vec());
    }

    /// Mark this descriptor as a compiler-temporary. The intended
    /// semantics reconstructed from spec.md §9: an actual mutation, not
    /// the original's `is_temp = is_temp` no-op.
    pub fn mark_temp(&mut self, is_temp: bool) {
        self.is_temp = is_temp;
    }
}

/// Row-major strides for a C-contiguous array of the given shape, in
/// elements (not bytes) — matches the "Matrix-like"/"Vector-like"
/// constructors in `multi_array.hpp`.
fn row_major_strides(shape: &[i64]) -> Vec<i64> {
    let mut strides = vec![1i64; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}
