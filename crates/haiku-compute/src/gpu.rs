//! wgpu compute backend
//!
//! Kernels are compiled on first resolve and cached by name. Each
//! invocation gets its bind group built once, keyed by invocation id, and
//! reused on every later dispatch until one of its buffers is released.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{Level, debug, info, span};
use wgpu::util::{BufferInitDescriptor, DeviceExt};
use wgpu::{
    AdapterInfo, Backends, BindGroup, BindGroupDescriptor, BindGroupEntry, BindGroupLayout,
    BindGroupLayoutDescriptor, BindGroupLayoutEntry, BindingType, Buffer, BufferBindingType,
    BufferDescriptor, BufferUsages, CommandEncoderDescriptor, ComputePassDescriptor,
    ComputePipeline, ComputePipelineDescriptor, Device, DeviceDescriptor, ErrorFilter, Features,
    Instance, InstanceDescriptor, Limits, Maintain, MapMode, PipelineCompilationOptions,
    PipelineLayoutDescriptor, PowerPreference, Queue, RequestAdapterOptions, ShaderModuleDescriptor,
    ShaderSource, ShaderStages, SubmissionIndex,
};

use crate::buffer::Slots;
use crate::kernels::{self, KernelSignature};
use crate::{
    shaders, BufferId, Completion, ComputeBackend, ComputeError, Invocation, KernelHandle, Result,
};

const FLOAT_SIZE: u64 = std::mem::size_of::<f32>() as u64;

/// Adapter selection settings
#[derive(Debug, Clone)]
pub struct GpuConfig {
    pub power_preference: PowerPreference,
    /// Device label shown in driver tooling
    pub label: String,
    /// Accept a software adapter if no hardware one is found
    pub allow_software_adapter: bool,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            power_preference: PowerPreference::HighPerformance,
            label: "Haiku Compute Device".to_string(),
            allow_software_adapter: false,
        }
    }
}

impl GpuConfig {
    /// Prefer an integrated adapter
    pub fn low_power() -> Self {
        Self {
            power_preference: PowerPreference::LowPower,
            ..Default::default()
        }
    }
}

/// Device and queue of an opened adapter
#[derive(Clone)]
pub struct GpuContext {
    pub device: Arc<Device>,
    pub queue: Arc<Queue>,
    info: AdapterInfo,
    limits: Limits,
}

impl GpuContext {
    /// Open a device on the best matching adapter
    pub async fn new(config: &GpuConfig) -> Result<Self> {
        let instance = Instance::new(InstanceDescriptor {
            backends: Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&RequestAdapterOptions {
                power_preference: config.power_preference,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await;

        let adapter = match adapter {
            Some(adapter) => adapter,
            None if config.allow_software_adapter => instance
                .request_adapter(&RequestAdapterOptions {
                    power_preference: config.power_preference,
                    compatible_surface: None,
                    force_fallback_adapter: true,
                })
                .await
                .ok_or(ComputeError::NoAdapter)?,
            None => return Err(ComputeError::NoAdapter),
        };

        let info = adapter.get_info();
        let limits = adapter.limits();

        let (device, queue) = adapter
            .request_device(
                &DeviceDescriptor {
                    label: Some(config.label.as_str()),
                    required_features: Features::empty(),
                    required_limits: limits.clone(),
                },
                None,
            )
            .await
            .map_err(|e| ComputeError::DeviceRequest(e.to_string()))?;

        info!(adapter = %info.name, backend = ?info.backend, "Opened GPU device");

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            info,
            limits,
        })
    }

    /// Describe every adapter visible to wgpu without opening a device
    pub fn enumerate_adapters() -> Vec<AdapterInfo> {
        let instance = Instance::new(InstanceDescriptor {
            backends: Backends::all(),
            ..Default::default()
        });
        instance
            .enumerate_adapters(Backends::all())
            .iter()
            .map(|adapter| adapter.get_info())
            .collect()
    }

    pub fn adapter_info(&self) -> &AdapterInfo {
        &self.info
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }
}

impl std::fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuContext")
            .field("adapter", &self.info.name)
            .field("backend", &self.info.backend)
            .field("device", &"<wgpu::Device>")
            .field("queue", &"<wgpu::Queue>")
            .finish()
    }
}

struct GpuBuffer {
    buffer: Buffer,
    len: usize,
}

struct CompiledKernel {
    pipeline: ComputePipeline,
    bind_group_layout: BindGroupLayout,
}

struct CachedBindGroup {
    bind_group: BindGroup,
    // Keeps the parameter uniform alive for the bind group
    _params: Buffer,
    buffers: Vec<BufferId>,
}

/// Compute backend running WGSL kernels on a wgpu device
pub struct GpuBackend {
    context: GpuContext,
    buffers: Slots<GpuBuffer>,
    kernels: HashMap<&'static str, CompiledKernel>,
    bind_groups: HashMap<u64, CachedBindGroup>,
    pending: HashMap<u64, SubmissionIndex>,
    next_submission: u64,
}

impl GpuBackend {
    pub fn new(context: GpuContext) -> Self {
        Self {
            context,
            buffers: Slots::new(),
            kernels: HashMap::new(),
            bind_groups: HashMap::new(),
            pending: HashMap::new(),
            next_submission: 1,
        }
    }

    /// Open a device and wrap it, blocking the calling thread
    pub fn request(config: &GpuConfig) -> Result<Self> {
        let context = pollster::block_on(GpuContext::new(config))?;
        Ok(Self::new(context))
    }

    pub fn context(&self) -> &GpuContext {
        &self.context
    }

    fn compile(&mut self, signature: &'static KernelSignature) -> Result<()> {
        if self.kernels.contains_key(signature.name) {
            return Ok(());
        }

        let span = span!(Level::DEBUG, "compile_kernel", kernel = signature.name);
        let _enter = span.enter();

        let device = &self.context.device;
        device.push_error_scope(ErrorFilter::Validation);

        let source = format!("{}\n{}", shaders::COMMON, signature.source);
        let module = device.create_shader_module(ShaderModuleDescriptor {
            label: Some(signature.name),
            source: ShaderSource::Wgsl(source.into()),
        });

        let mut entries = vec![BindGroupLayoutEntry {
            binding: 0,
            visibility: ShaderStages::COMPUTE,
            ty: BindingType::Buffer {
                ty: BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }];
        for (slot, access) in signature.bindings.iter().enumerate() {
            entries.push(BindGroupLayoutEntry {
                binding: slot as u32 + 1,
                visibility: ShaderStages::COMPUTE,
                ty: BindingType::Buffer {
                    ty: BufferBindingType::Storage {
                        read_only: !access.is_writable(),
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            });
        }

        let bind_group_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some(signature.name),
            entries: &entries,
        });

        let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some(signature.name),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&ComputePipelineDescriptor {
            compilation_options: PipelineCompilationOptions {
                constants: &HashMap::new(),
                zero_initialize_workgroup_memory: false,
            },
            label: Some(signature.name),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: signature.name,
        });

        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(ComputeError::ShaderCompile {
                kernel: signature.name.to_string(),
                message: error.to_string(),
            });
        }

        debug!("Compiled kernel");
        self.kernels.insert(
            signature.name,
            CompiledKernel {
                pipeline,
                bind_group_layout,
            },
        );
        Ok(())
    }

    fn prepare_bind_group(&mut self, invocation: &Invocation) -> Result<()> {
        if self.bind_groups.contains_key(&invocation.id()) {
            return Ok(());
        }

        let signature = invocation.kernel().signature();
        self.compile(signature)?;
        let kernel = self
            .kernels
            .get(signature.name)
            .ok_or_else(|| ComputeError::UnknownKernel(signature.name.to_string()))?;

        let device = &self.context.device;
        let params = device.create_buffer_init(&BufferInitDescriptor {
            label: Some("Kernel Params"),
            contents: invocation.params(),
            usage: BufferUsages::UNIFORM,
        });

        let mut entries = vec![BindGroupEntry {
            binding: 0,
            resource: params.as_entire_binding(),
        }];
        for (slot, binding) in invocation.bindings().iter().enumerate() {
            let buffer = self
                .buffers
                .get(binding.buffer)
                .ok_or(ComputeError::UnknownBuffer(binding.buffer))?;
            entries.push(BindGroupEntry {
                binding: slot as u32 + 1,
                resource: buffer.buffer.as_entire_binding(),
            });
        }

        let bind_group = device.create_bind_group(&BindGroupDescriptor {
            label: Some(invocation.kernel_name()),
            layout: &kernel.bind_group_layout,
            entries: &entries,
        });

        self.bind_groups.insert(
            invocation.id(),
            CachedBindGroup {
                bind_group,
                _params: params,
                buffers: invocation.bindings().iter().map(|b| b.buffer).collect(),
            },
        );
        Ok(())
    }
}

impl ComputeBackend for GpuBackend {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn resolve_kernel(&mut self, name: &str) -> Result<KernelHandle> {
        let signature =
            kernels::lookup(name).ok_or_else(|| ComputeError::UnknownKernel(name.to_string()))?;
        self.compile(signature)?;
        Ok(KernelHandle::new(signature))
    }

    fn allocate_buffer(&mut self, len: usize) -> Result<BufferId> {
        if len == 0 {
            return Err(ComputeError::EmptyBuffer);
        }
        // wgpu zero-initializes new buffers
        let buffer = self.context.device.create_buffer(&BufferDescriptor {
            label: Some("Layer Buffer"),
            size: len as u64 * FLOAT_SIZE,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let id = self.buffers.insert(GpuBuffer { buffer, len });
        debug!(buffer = %id, len, "Allocated GPU buffer");
        Ok(id)
    }

    fn release_buffer(&mut self, id: BufferId) {
        if let Some(entry) = self.buffers.remove(id) {
            entry.buffer.destroy();
            self.bind_groups
                .retain(|_, cached| !cached.buffers.contains(&id));
        }
    }

    fn buffer_len(&self, id: BufferId) -> Option<usize> {
        self.buffers.get(id).map(|entry| entry.len)
    }

    fn live_buffers(&self) -> usize {
        self.buffers.live()
    }

    fn write_buffer(&mut self, id: BufferId, data: &[f32]) -> Result<()> {
        let entry = self.buffers.get(id).ok_or(ComputeError::UnknownBuffer(id))?;
        if entry.len != data.len() {
            return Err(ComputeError::LengthMismatch {
                buffer: id,
                expected: entry.len,
                actual: data.len(),
            });
        }
        self.context
            .queue
            .write_buffer(&entry.buffer, 0, bytemuck::cast_slice(data));
        Ok(())
    }

    fn read_buffer(&mut self, id: BufferId) -> Result<Vec<f32>> {
        let entry = self.buffers.get(id).ok_or(ComputeError::UnknownBuffer(id))?;
        let size = entry.len as u64 * FLOAT_SIZE;
        let device = &self.context.device;

        let staging = device.create_buffer(&BufferDescriptor {
            label: Some("Readback Staging"),
            size,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&CommandEncoderDescriptor {
            label: Some("Readback Encoder"),
        });
        encoder.copy_buffer_to_buffer(&entry.buffer, 0, &staging, 0, size);
        self.context.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = flume::bounded(1);
        slice.map_async(MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        device.poll(Maintain::Wait);

        rx.recv()
            .map_err(|e| ComputeError::BufferMap(e.to_string()))?
            .map_err(|e| ComputeError::BufferMap(e.to_string()))?;

        let data = slice.get_mapped_range();
        let values: Vec<f32> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        staging.unmap();

        Ok(values)
    }

    fn max_dispatch_width(&self) -> usize {
        self.context.limits.max_compute_workgroups_per_dimension as usize
            * crate::WORKGROUP_SIZE as usize
    }

    fn dispatch(&mut self, invocations: &[&Invocation]) -> Result<Completion> {
        let span = span!(Level::DEBUG, "gpu_dispatch", count = invocations.len());
        let _enter = span.enter();

        for invocation in invocations {
            self.prepare_bind_group(invocation)?;
        }

        // Resolve everything first: nothing may return between push and pop
        let mut passes = Vec::with_capacity(invocations.len());
        for invocation in invocations {
            let name = invocation.kernel_name();
            let kernel = self
                .kernels
                .get(name)
                .ok_or_else(|| ComputeError::UnknownKernel(name.to_string()))?;
            let cached = self
                .bind_groups
                .get(&invocation.id())
                .ok_or_else(|| ComputeError::DispatchFailed(format!("no bind group for {name}")))?;
            passes.push((name, kernel, cached, invocation.workgroups()));
        }

        let device = &self.context.device;
        device.push_error_scope(ErrorFilter::Validation);

        let mut encoder = device.create_command_encoder(&CommandEncoderDescriptor {
            label: Some("Dispatch Encoder"),
        });

        for (name, kernel, cached, workgroups) in passes {
            // Separate passes keep the writes of one kernel visible to the next
            let mut pass = encoder.begin_compute_pass(&ComputePassDescriptor {
                label: Some(name),
                timestamp_writes: None,
            });
            pass.set_pipeline(&kernel.pipeline);
            pass.set_bind_group(0, &cached.bind_group, &[]);
            pass.dispatch_workgroups(workgroups, 1, 1);
        }

        let index = self.context.queue.submit(std::iter::once(encoder.finish()));

        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(ComputeError::DispatchFailed(error.to_string()));
        }

        let sequence = self.next_submission;
        self.next_submission += 1;
        self.pending.insert(sequence, index);
        Ok(Completion::new(sequence))
    }

    fn wait(&mut self, completion: Completion) -> Result<()> {
        let index = self
            .pending
            .remove(&completion.sequence())
            .ok_or(ComputeError::UnknownCompletion(completion.sequence()))?;
        self.context
            .device
            .poll(Maintain::WaitForSubmissionIndex(index));
        Ok(())
    }
}
