//! GPU Resource Layer (C3).
//!
//! Generalizes the teacher's `wgpu`-based device handling
//! (`gpu/buffer_manager.rs`, `gpu/error_recovery.rs`) onto the primitives
//! spec.md §4.3/§6 specify for an OpenCL-style compute API: buffer
//! creation, blocking reads, non-blocking writes/launches that return a
//! completion token, and on-demand kernel compilation with a build-failure
//! path.

use crate::error::{CoreError, CoreResult};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Opaque handle to a device-side buffer. The registry stores these
/// instead of a raw `wgpu::Buffer` so `ArrayDescriptor` stays backend
/// agnostic (spec.md §9's arena-by-id design, applied again on the device
/// side).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// Opaque handle to a compiled kernel (one `wgpu::ComputePipeline` per
/// entry point, cached by source hash).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelHandle(pub u64);

/// Stands in for an OpenCL event / `wgpu::SubmissionIndex`: a token a
/// later operation can declare as a dependency instead of relying on
/// implicit program-order ("happens-before"), since the underlying queue
/// is out-of-order (spec.md §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CompletionToken(pub u64);

/// The set of primitives the scheduler/resource layer drive against the
/// compute API — spec.md §6's "Scheduler/Resource Layer to compute API"
/// interface. Implemented for real by `WgpuBackend`; tests use a fake so
/// the batch/scheduler/data-manager logic can be exercised without a GPU.
pub trait ComputeBackend: Send + Sync {
    fn create_buffer(&self, size: usize) -> CoreResult<BufferHandle>;

    /// Non-blocking: returns a token the caller can wait on.
    fn enqueue_write(
        &self,
        buffer: BufferHandle,
        data: &[u8],
        wait_for: &[CompletionToken],
    ) -> CoreResult<CompletionToken>;

    /// Blocking: the host thread observes `out` filled on return.
    fn enqueue_read_blocking(
        &self,
        buffer: BufferHandle,
        out: &mut [u8],
        wait_for: &[CompletionToken],
    ) -> CoreResult<()>;

    /// Compile `source`, producing one kernel handle per name in
    /// `kernel_names`. A build failure surfaces `KERNEL_BUILD_FAILED` with
    /// the backend's diagnostic log attached.
    fn compile(&self, source: &str, kernel_names: &[String]) -> CoreResult<Vec<KernelHandle>>;

    /// Non-blocking: launches `kernel` over `global` using work-group
    /// shape `local`, after `wait_for`.
    fn enqueue_nd_range(
        &self,
        kernel: KernelHandle,
        global: &[u32],
        local: &[u32],
        wait_for: &[CompletionToken],
    ) -> CoreResult<CompletionToken>;

    /// A token that is already satisfied — used to seed a dependency list
    /// for an operand with no pending writes.
    fn complete_event(&self) -> CompletionToken;
}

/// The three derived local (work-group) shapes — spec.md §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalShapes {
    pub one_d: [u32; 1],
    pub two_d: [u32; 2],
    pub three_d: [u32; 3],
}

impl LocalShapes {
    pub fn for_rank(&self, rank: usize) -> CoreResult<Vec<u32>> {
        match rank {
            1 => Ok(self.one_d.to_vec()),
            2 => Ok(self.two_d.to_vec()),
            3 => Ok(self.three_d.to_vec()),
            other => Err(CoreError::GenericDeviceError {
                reason: format!("no local work-group shape derived for rank {other}"),
            }),
        }
    }

    /// Exactly the arithmetic in spec.md §4.3, derived from the
    /// intersected device limits.
    pub fn derive(max_workgroup_size: u32, max_workitem_sizes: [u32; 3]) -> Self {
        let one_d = [256u32.min(max_workitem_sizes[0])];

        let x2 = 32u32.min(max_workitem_sizes[0]);
        let y2 = ((max_workgroup_size / x2).min(max_workitem_sizes[1])) / 2;
        let two_d = [x2, y2.max(1)];

        let x3 = 16u32.min(max_workitem_sizes[0]);
        let mut y3 = 1u32;
        let target = (max_workgroup_size as f64 / x3 as f64).sqrt();
        while (y3 as f64) < target {
            y3 <<= 1;
        }
        y3 = y3.min(max_workitem_sizes[1]);
        let z3 = ((max_workgroup_size / (x3 * y3.max(1))).min(max_workitem_sizes[2])) / 2;
        let three_d = [x3, y3.max(1), z3.max(1)];

        Self {
            one_d,
            two_d,
            three_d,
        }
    }
}

/// Device limits intersected across every device under the chosen
/// platform/adapter — spec.md §4.3.
#[derive(Debug, Clone, Copy)]
pub struct DeviceLimits {
    pub max_workgroup_size: u32,
    pub max_workitem_dims: u32,
    pub max_workitem_sizes: [u32; 3],
}

/// GPU Resource Layer: owns the compute backend, the derived local
/// shapes, extension flags, and the on-demand kernel compile cache.
pub struct GpuResourceLayer {
    backend: Arc<dyn ComputeBackend>,
    limits: DeviceLimits,
    local_shapes: LocalShapes,
    float16_supported: bool,
    float64_supported: bool,
    kernel_cache: DashMap<u64, Vec<KernelHandle>>,
}

impl GpuResourceLayer {
    /// Probe-and-select step lives in the backend constructor (e.g.
    /// `WgpuBackend::new`, which enumerates adapters and fails with
    /// `NO_GPU_PLATFORM` if none construct a GPU-typed device); this
    /// constructor just derives the layer's shared state from whatever
    /// limits that probe reported.
    pub fn new(
        backend: Arc<dyn ComputeBackend>,
        limits: DeviceLimits,
        float16_supported: bool,
        float64_supported: bool,
    ) -> Self {
        let local_shapes =
            LocalShapes::derive(limits.max_workgroup_size, limits.max_workitem_sizes);
        Self {
            backend,
            limits,
            local_shapes,
            float16_supported,
            float64_supported,
            kernel_cache: DashMap::new(),
        }
    }

    pub fn limits(&self) -> DeviceLimits {
        self.limits
    }

    pub fn local_shapes(&self) -> LocalShapes {
        self.local_shapes
    }

    pub fn float16_supported(&self) -> bool {
        self.float16_supported
    }

    pub fn float64_supported(&self) -> bool {
        self.float64_supported
    }

    pub fn create_buffer(&self, size: usize) -> CoreResult<BufferHandle> {
        self.backend.create_buffer(size)
    }

    pub fn enqueue_write(
        &self,
        buffer: BufferHandle,
        data: &[u8],
        wait_for: &[CompletionToken],
    ) -> CoreResult<CompletionToken> {
        self.backend.enqueue_write(buffer, data, wait_for)
    }

    pub fn enqueue_read_blocking(
        &self,
        buffer: BufferHandle,
        out: &mut [u8],
        wait_for: &[CompletionToken],
    ) -> CoreResult<()> {
        self.backend.enqueue_read_blocking(buffer, out, wait_for)
    }

    pub fn enqueue_nd_range(
        &self,
        kernel: KernelHandle,
        global: &[u32],
        local: &[u32],
        wait_for: &[CompletionToken],
    ) -> CoreResult<CompletionToken> {
        self.backend.enqueue_nd_range(kernel, global, local, wait_for)
    }

    pub fn complete_event(&self) -> CompletionToken {
        self.backend.complete_event()
    }

    /// Compile `source`, caching the result by a fast hash of the source
    /// text so repeated batches with identical generated kernels skip
    /// recompilation — spec.md §4.5 "compiled via C3 (result cached by
    /// source hash)".
    pub fn compile_cached(
        &self,
        source: &str,
        kernel_names: &[String],
    ) -> CoreResult<Vec<KernelHandle>> {
        let hash = rustc_hash::FxHasher::default();
        let key = {
            use std::hash::{Hash, Hasher};
            let mut hash = hash;
            source.hash(&mut hash);
            hash.finish()
        };

        if let Some(cached) = self.kernel_cache.get(&key) {
            return Ok(cached.clone());
        }

        let compiled = self.backend.compile(source, kernel_names)?;
        self.kernel_cache.insert(key, compiled.clone());
        Ok(compiled)
    }
}

/// Real `wgpu`-backed implementation, generalizing
/// `gpu/buffer_manager.rs`'s `Arc<wgpu::Queue>` ownership and
/// `gpu/error_recovery.rs`'s `on_uncaptured_error` handling onto the
/// `ComputeBackend` trait.
pub struct WgpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    buffers: DashMap<BufferHandle, wgpu::Buffer>,
    pipelines: DashMap<KernelHandle, wgpu::ComputePipeline>,
    next_buffer_id: AtomicU64,
    next_kernel_id: AtomicU64,
    next_token: AtomicU64,
}

impl WgpuBackend {
    /// Enumerate adapters, pick the first that yields a GPU-typed device,
    /// and report its intersected limits. Fails with `NO_GPU_PLATFORM` if
    /// no adapter qualifies — spec.md §4.3.
    pub fn new() -> CoreResult<(Arc<Self>, DeviceLimits, bool, bool)> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or(CoreError::NoGpuPlatform)?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("lattice-engine compute device"),
                features: wgpu::Features::empty(),
                limits: wgpu::Limits::default(),
            },
            None,
        ))
        .map_err(|_| CoreError::NoGpuPlatform)?;

        let adapter_limits = adapter.limits();
        let limits = DeviceLimits {
            max_workgroup_size: adapter_limits.max_compute_invocations_per_workgroup,
            max_workitem_dims: 3,
            max_workitem_sizes: [
                adapter_limits.max_compute_workgroup_size_x,
                adapter_limits.max_compute_workgroup_size_y,
                adapter_limits.max_compute_workgroup_size_z,
            ],
        };

        let adapter_features = adapter.features();
        let float16_supported = adapter_features.contains(wgpu::Features::SHADER_F16);
        // wgpu's compute shaders (WGSL) have no native f64 support; the
        // extension-scan step in spec.md §4.3 always reports it absent.
        let float64_supported = false;

        let device = Arc::new(device);
        let queue = Arc::new(queue);

        device.on_uncaptured_error(Box::new(|error| {
            log::error!("[GpuResourceLayer] uncaptured device error: {:?}", error);
        }));

        Ok((
            Arc::new(Self {
                device,
                queue,
                buffers: DashMap::new(),
                pipelines: DashMap::new(),
                next_buffer_id: AtomicU64::new(0),
                next_kernel_id: AtomicU64::new(0),
                next_token: AtomicU64::new(0),
            }),
            limits,
            float16_supported,
            float64_supported,
        ))
    }

    fn next_token(&self) -> CompletionToken {
        CompletionToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }
}

impl ComputeBackend for WgpuBackend {
    fn create_buffer(&self, size: usize) -> CoreResult<BufferHandle> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("lattice-engine device buffer"),
            size: size.max(4) as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let handle = BufferHandle(self.next_buffer_id.fetch_add(1, Ordering::Relaxed));
        self.buffers.insert(handle, buffer);
        Ok(handle)
    }

    fn enqueue_write(
        &self,
        buffer: BufferHandle,
        data: &[u8],
        _wait_for: &[CompletionToken],
    ) -> CoreResult<CompletionToken> {
        let entry = self.buffers.get(&buffer).ok_or(CoreError::GenericDeviceError {
            reason: format!("write to unknown buffer {buffer:?}"),
        })?;
        self.queue.write_buffer(&entry, 0, data);
        Ok(self.next_token())
    }

    fn enqueue_read_blocking(
        &self,
        buffer: BufferHandle,
        out: &mut [u8],
        _wait_for: &[CompletionToken],
    ) -> CoreResult<()> {
        let source = self.buffers.get(&buffer).ok_or(CoreError::GenericDeviceError {
            reason: format!("read from unknown buffer {buffer:?}"),
        })?;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("lattice-engine readback staging buffer"),
            size: out.len() as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        encoder.copy_buffer_to_buffer(&source, 0, &staging, 0, out.len() as u64);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| CoreError::GenericDeviceError {
                reason: "readback channel closed before buffer map completed".to_string(),
            })?
            .map_err(|e| CoreError::GenericDeviceError {
                reason: format!("buffer map failed: {e:?}"),
            })?;

        out.copy_from_slice(&slice.get_mapped_range());
        staging.unmap();
        Ok(())
    }

    fn compile(&self, source: &str, kernel_names: &[String]) -> CoreResult<Vec<KernelHandle>> {
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("lattice-engine batch kernel"),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let mut handles = Vec::with_capacity(kernel_names.len());
        for name in kernel_names {
            let layout = None; // inferred, matching the teacher's unified-kernel pipeline setup
            let pipeline = self
                .device
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(name),
                    layout,
                    module: &module,
                    entry_point: name,
                });
            let handle = KernelHandle(self.next_kernel_id.fetch_add(1, Ordering::Relaxed));
            self.pipelines.insert(handle, pipeline);
            handles.push(handle);
        }
        Ok(handles)
    }

    fn enqueue_nd_range(
        &self,
        kernel: KernelHandle,
        global: &[u32],
        _local: &[u32],
        _wait_for: &[CompletionToken],
    ) -> CoreResult<CompletionToken> {
        let pipeline = self.pipelines.get(&kernel).ok_or(CoreError::GenericDeviceError {
            reason: format!("dispatch of unknown kernel {kernel:?}"),
        })?;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("lattice-engine batch dispatch"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            let [x, y, z] = [
                global.first().copied().unwrap_or(1),
                global.get(1).copied().unwrap_or(1),
                global.get(2).copied().unwrap_or(1),
            ];
            pass.dispatch_workgroups(x, y, z);
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(self.next_token())
    }

    fn complete_event(&self) -> CompletionToken {
        self.next_token()
    }
}
