//! GPU (Metal/Vulkan/DX12 via wgpu) implementation of [`ComputeDevice`].
//!
//! # Architecture
//! - Every kernel is one pipeline compiled from its own WGSL file, prefixed
//!   with `shaders/common.wgsl`.
//! - Bind group 0 holds the kernel's storage bindings at `@binding(0..n)`
//!   in table order and its constant block as a uniform at `@binding(n)`.
//! - A batch becomes one command encoder with one compute pass per dispatch.
//!   Constant blocks of the whole batch are packed into a single uniform
//!   buffer at aligned offsets.
//! - wgpu tracks usage and inserts the actual memory barriers between
//!   passes itself; the recorded barriers are traced so the two can be
//!   compared in logs.
//! - The fence is signaled from `Queue::on_submitted_work_done`.

pub mod buffers;

use std::collections::HashMap;
use std::num::NonZeroU64;

use crate::batch::{Command, CommandBatch, DispatchShape, Pass};
use crate::buffer::{Access, BufferDesc, BufferId, GpuBuffer};
use crate::device::ComputeDevice;
use crate::error::{Error, Result};
use crate::fence::Fence;
use crate::kernels::{KernelDesc, KernelId, Stage};

/// Color format of the offscreen target the surface draw renders into.
pub const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
/// Edge length of the offscreen target.
pub const TARGET_SIZE: u32 = 512;

enum Pipeline {
    Compute(wgpu::ComputePipeline, wgpu::BindGroupLayout),
    Render(wgpu::RenderPipeline, wgpu::BindGroupLayout),
}

impl Pipeline {
    fn layout(&self) -> &wgpu::BindGroupLayout {
        match self {
            Pipeline::Compute(_, layout) | Pipeline::Render(_, layout) => layout,
        }
    }
}

/// wgpu-backed compute device.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    buffers: HashMap<BufferId, wgpu::Buffer>,
    pipelines: HashMap<KernelId, Pipeline>,
    next_id: u32,
    uniform_align: u64,
    storage_align: u64,
    target: wgpu::TextureView,
}

/// Check whether a GPU adapter is available.
pub fn gpu_available() -> bool {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }));
    adapter.is_some()
}

impl WgpuDevice {
    /// Acquire an adapter and a device.
    ///
    /// Returns [`Error::AdapterUnavailable`] when no adapter is found,
    /// letting callers fall back to the CPU device.
    pub fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or(Error::AdapterUnavailable)?;

        let info = adapter.get_info();
        tracing::info!("GPU adapter: {:?} ({:?})", info.name, info.backend);

        // The insert and simulation kernels bind up to ten storage buffers,
        // above the default of 8. Ask for what the adapter offers.
        let adapter_limits = adapter.limits();
        let mut required_limits = wgpu::Limits::default();
        required_limits.max_storage_buffers_per_shader_stage =
            adapter_limits.max_storage_buffers_per_shader_stage;
        required_limits.max_storage_buffer_binding_size = adapter_limits.max_storage_buffer_binding_size;
        required_limits.max_buffer_size = adapter_limits.max_buffer_size;

        tracing::info!(
            "Requesting max_storage_buffers_per_shader_stage = {}",
            required_limits.max_storage_buffers_per_shader_stage,
        );

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("bukkit_device"),
                required_features: wgpu::Features::empty(),
                required_limits,
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| Error::DeviceRequest(e.to_string()))?;

        let limits = device.limits();
        let target = device
            .create_texture(&wgpu::TextureDescriptor {
                label: Some("surface_target"),
                size: wgpu::Extent3d {
                    width: TARGET_SIZE,
                    height: TARGET_SIZE,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: TARGET_FORMAT,
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
                view_formats: &[],
            })
            .create_view(&wgpu::TextureViewDescriptor::default());

        Ok(Self {
            device,
            queue,
            adapter_name: info.name,
            buffers: HashMap::new(),
            pipelines: HashMap::new(),
            next_id: 0,
            uniform_align: limits.min_uniform_buffer_offset_alignment as u64,
            storage_align: limits.min_storage_buffer_offset_alignment as u64,
            target,
        })
    }

    fn buffer(&self, id: BufferId) -> Result<&wgpu::Buffer> {
        self.buffers.get(&id).ok_or(Error::UnknownBuffer(id))
    }

    fn build_pipeline(&self, kernel: KernelId) -> Pipeline {
        let desc = kernel.desc();
        let source = format!("{}\n{}", include_str!("shaders/common.wgsl"), shader_source(kernel));
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(desc.label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let visibility = match desc.stage {
            Stage::Compute => wgpu::ShaderStages::COMPUTE,
            Stage::Render => wgpu::ShaderStages::VERTEX,
        };
        let mut entries: Vec<wgpu::BindGroupLayoutEntry> = desc
            .bindings
            .iter()
            .enumerate()
            .map(|(i, decl)| match decl.access {
                Access::Read => bgl_storage_ro(i as u32, visibility),
                Access::ReadWrite => bgl_storage_rw(i as u32, visibility),
            })
            .collect();
        entries.push(bgl_uniform(desc.bindings.len() as u32, visibility));
        let layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(desc.label),
            entries: &entries,
        });
        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(desc.label),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        match desc.stage {
            Stage::Compute => Pipeline::Compute(
                self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(desc.label),
                    layout: Some(&pipeline_layout),
                    module: &module,
                    entry_point: Some(desc.entry_point),
                    compilation_options: Default::default(),
                    cache: None,
                }),
                layout,
            ),
            Stage::Render => Pipeline::Render(
                self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some(desc.label),
                    layout: Some(&pipeline_layout),
                    vertex: wgpu::VertexState {
                        module: &module,
                        entry_point: Some(desc.entry_point),
                        buffers: &[],
                        compilation_options: Default::default(),
                    },
                    fragment: Some(wgpu::FragmentState {
                        module: &module,
                        entry_point: Some("surface_draw_fragment"),
                        targets: &[Some(wgpu::ColorTargetState {
                            format: TARGET_FORMAT,
                            blend: None,
                            write_mask: wgpu::ColorWrites::ALL,
                        })],
                        compilation_options: Default::default(),
                    }),
                    primitive: wgpu::PrimitiveState {
                        topology: wgpu::PrimitiveTopology::PointList,
                        ..Default::default()
                    },
                    depth_stencil: None,
                    multisample: wgpu::MultisampleState::default(),
                    multiview: None,
                    cache: None,
                }),
                layout,
            ),
        }
    }

    fn bind_group(
        &self,
        pass: &Pass,
        desc: &KernelDesc,
        layout: &wgpu::BindGroupLayout,
        constants: &wgpu::Buffer,
        offset: u64,
    ) -> Result<wgpu::BindGroup> {
        let mut entries = Vec::with_capacity(pass.bindings.len() + 1);
        for (i, view) in pass.bindings.iter().enumerate() {
            if view.offset % self.storage_align != 0 {
                return Err(Error::Validation(format!(
                    "`{}` binding {i} offset {} is not {}-byte aligned",
                    desc.label, view.offset, self.storage_align
                )));
            }
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: self.buffer(view.buffer)?,
                    offset: view.offset,
                    size: NonZeroU64::new(buffers::aligned_size(view.size)),
                }),
            });
        }
        entries.push(wgpu::BindGroupEntry {
            binding: pass.bindings.len() as u32,
            resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                buffer: constants,
                offset,
                size: NonZeroU64::new(pass.constants.len() as u64),
            }),
        });
        Ok(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(desc.label),
            layout,
            entries: &entries,
        }))
    }

    fn encode(&self, batch: &CommandBatch) -> Result<wgpu::CommandBuffer> {
        let passes: Vec<&Pass> = batch
            .commands()
            .iter()
            .filter_map(|c| match c {
                Command::Dispatch(pass) => Some(pass),
                Command::Barrier(_) => None,
            })
            .collect();
        let (constants, offsets) = buffers::pack_constants(
            &self.device,
            passes.iter().map(|p| p.constants.as_slice()),
            self.uniform_align,
        );

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("batch"),
        });
        let mut next = 0;
        for command in batch.commands() {
            let pass = match command {
                Command::Barrier(barriers) => {
                    for barrier in barriers {
                        tracing::trace!("barrier {:?}", barrier);
                    }
                    continue;
                }
                Command::Dispatch(pass) => pass,
            };
            let desc = pass.kernel.desc();
            let pipeline = self.pipelines.get(&pass.kernel).ok_or_else(|| {
                Error::Validation(format!("kernel `{}` dispatched before prepare_kernel", desc.label))
            })?;
            let constants = constants
                .as_ref()
                .ok_or_else(|| Error::Validation(format!("`{}` has no constant block", desc.label)))?;
            let bind_group = self.bind_group(pass, desc, pipeline.layout(), constants, offsets[next])?;
            next += 1;

            match (pipeline, pass.shape) {
                (Pipeline::Compute(pipeline, _), DispatchShape::Direct([x, y, z])) => {
                    if x * y * z == 0 {
                        continue;
                    }
                    let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some(desc.label),
                        timestamp_writes: None,
                    });
                    cpass.set_pipeline(pipeline);
                    cpass.set_bind_group(0, &bind_group, &[]);
                    cpass.dispatch_workgroups(x, y, z);
                }
                (Pipeline::Compute(pipeline, _), DispatchShape::Indirect(args)) => {
                    let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some(desc.label),
                        timestamp_writes: None,
                    });
                    cpass.set_pipeline(pipeline);
                    cpass.set_bind_group(0, &bind_group, &[]);
                    cpass.dispatch_workgroups_indirect(self.buffer(args.buffer)?, args.offset);
                }
                (Pipeline::Render(pipeline, _), DispatchShape::DrawIndirect(args)) => {
                    let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                        label: Some(desc.label),
                        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                            view: &self.target,
                            resolve_target: None,
                            ops: wgpu::Operations {
                                load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                                store: wgpu::StoreOp::Store,
                            },
                        })],
                        depth_stencil_attachment: None,
                        timestamp_writes: None,
                        occlusion_query_set: None,
                    });
                    rpass.set_pipeline(pipeline);
                    rpass.set_bind_group(0, &bind_group, &[]);
                    rpass.draw_indirect(self.buffer(args.buffer)?, args.offset);
                }
                (_, shape) => {
                    return Err(Error::Validation(format!(
                        "`{}` cannot launch with {:?}",
                        desc.label, shape
                    )))
                }
            }
        }
        Ok(encoder.finish())
    }
}

impl ComputeDevice for WgpuDevice {
    fn name(&self) -> String {
        format!("wgpu ({})", self.adapter_name)
    }

    fn create_buffer(&mut self, desc: &BufferDesc, contents: Option<&[u8]>) -> Result<GpuBuffer> {
        if desc.stride == 0 || desc.stride % 4 != 0 {
            return Err(Error::ResourceCreation {
                label: desc.label.clone(),
                reason: format!("stride {} is not a positive multiple of 4", desc.stride),
            });
        }
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = buffers::create_storage(&self.device, desc, contents)?;
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(Error::ResourceCreation {
                label: desc.label.clone(),
                reason: err.to_string(),
            });
        }
        let id = BufferId(self.next_id);
        self.next_id += 1;
        self.buffers.insert(id, buffer);
        Ok(GpuBuffer::new(id, desc))
    }

    fn release_buffer(&mut self, buffer: &GpuBuffer) -> Result<()> {
        // wgpu keeps the allocation alive until submitted work is done with it.
        let raw = self
            .buffers
            .remove(&buffer.id())
            .ok_or(Error::UnknownBuffer(buffer.id()))?;
        raw.destroy();
        Ok(())
    }

    fn prepare_kernel(&mut self, kernel: KernelId) -> Result<()> {
        if self.pipelines.contains_key(&kernel) {
            return Ok(());
        }
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = self.build_pipeline(kernel);
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(Error::ResourceCreation {
                label: kernel.desc().label.to_string(),
                reason: err.to_string(),
            });
        }
        tracing::debug!("pipeline `{}` ready", kernel.desc().label);
        self.pipelines.insert(kernel, pipeline);
        Ok(())
    }

    fn write_buffer(&self, buffer: &GpuBuffer, byte_offset: u64, bytes: &[u8]) -> Result<()> {
        let raw = self.buffer(buffer.id())?;
        if byte_offset % 4 != 0 || bytes.len() % 4 != 0 {
            return Err(Error::Validation(format!(
                "write to `{}` is not word aligned",
                buffer.label()
            )));
        }
        if byte_offset + bytes.len() as u64 > raw.size() {
            return Err(Error::Validation(format!(
                "write of {} bytes at {byte_offset} overruns `{}`",
                bytes.len(),
                buffer.label()
            )));
        }
        self.queue.write_buffer(raw, byte_offset, bytes);
        Ok(())
    }

    fn submit(&self, batch: &CommandBatch, fence: &Fence, value: u64) -> Result<()> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let commands = self.encode(batch);
        let commands = match commands {
            Ok(commands) => commands,
            Err(err) => {
                let _ = pollster::block_on(self.device.pop_error_scope());
                return Err(err);
            }
        };
        self.queue.submit(Some(commands));
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(Error::Validation(err.to_string()));
        }
        let fence = fence.clone();
        self.queue.on_submitted_work_done(move || fence.signal(value));
        Ok(())
    }

    fn wait(&self, fence: &Fence, value: u64) -> Result<()> {
        if fence.completed_value() >= value {
            return Ok(());
        }
        self.device.poll(wgpu::Maintain::Wait);
        if fence.completed_value() < value {
            return Err(Error::DeviceLost(format!(
                "fence stuck at {} waiting for {value}",
                fence.completed_value()
            )));
        }
        Ok(())
    }

    fn read_buffer(&self, buffer: &GpuBuffer) -> Result<Vec<u8>> {
        let raw = self.buffer(buffer.id())?;
        let mut bytes = buffers::read_back(&self.device, &self.queue, raw)?;
        bytes.truncate(buffer.size_bytes() as usize);
        Ok(bytes)
    }
}

fn shader_source(kernel: KernelId) -> &'static str {
    match kernel {
        KernelId::BufferClear => include_str!("shaders/buffer_clear.wgsl"),
        KernelId::DispatchArgDivide => include_str!("shaders/dispatch_arg_divide.wgsl"),
        KernelId::BilevelGrid => include_str!("shaders/bilevel_grid.wgsl"),
        KernelId::SurfaceBlockDetection => include_str!("shaders/surface_block_detection.wgsl"),
        KernelId::SurfaceCellDetection => include_str!("shaders/surface_cell_detection.wgsl"),
        KernelId::SurfaceVertexCompaction => include_str!("shaders/surface_vertex_compaction.wgsl"),
        KernelId::SurfaceVertexDensity => include_str!("shaders/surface_vertex_density.wgsl"),
        KernelId::SurfaceVertexNormal => include_str!("shaders/surface_vertex_normal.wgsl"),
        KernelId::SurfaceDraw => include_str!("shaders/surface_draw.wgsl"),
        KernelId::SetIndirectArgs => include_str!("shaders/set_indirect_args.wgsl"),
        KernelId::BukkitCount => include_str!("shaders/bukkit_count.wgsl"),
        KernelId::BukkitAllocate => include_str!("shaders/bukkit_allocate.wgsl"),
        KernelId::BukkitInsert => include_str!("shaders/bukkit_insert.wgsl"),
        KernelId::Emission => include_str!("shaders/emission.wgsl"),
        KernelId::ParticleRelease => include_str!("shaders/particle_release.wgsl"),
        KernelId::G2P2G => include_str!("shaders/g2p2g.wgsl"),
    }
}

// ---- Bind group layout entry helpers ----

fn bgl_uniform(binding: u32, visibility: wgpu::ShaderStages) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn bgl_storage_ro(binding: u32, visibility: wgpu::ShaderStages) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: true },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn bgl_storage_rw(binding: u32, visibility: wgpu::ShaderStages) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}
