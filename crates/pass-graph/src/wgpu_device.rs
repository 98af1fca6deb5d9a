//! wgpu implementation of the compute device capability
//!
//! Images are 2D textures usable both as sampled inputs and as write-only
//! storage outputs. Uniform sets are bind groups: slot N of a shader is bind
//! group N, binding 0, of its automatically derived pipeline layout.

use crate::device::{BufferHandle, ComputeDevice, DeviceError, DeviceHandle, Extent, ImageHandle, ModuleHandle, PipelineHandle, ResourceId, UniformSetHandle};
use slotmap::SlotMap;
use wgpu::util::DeviceExt;

/// Texture usage flags of images created by the device
pub const IMAGE_USAGE: wgpu::TextureUsages = wgpu::TextureUsages::TEXTURE_BINDING
    .union(wgpu::TextureUsages::STORAGE_BINDING)
    .union(wgpu::TextureUsages::COPY_SRC)
    .union(wgpu::TextureUsages::COPY_DST);

/// Buffer usage flags of constant buffers created by the device
pub const BUFFER_USAGE: wgpu::BufferUsages = wgpu::BufferUsages::UNIFORM.union(wgpu::BufferUsages::STORAGE).union(wgpu::BufferUsages::COPY_DST);

#[derive(Debug)]
struct GpuImage {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    /// Imported textures belong to the host and are never destroyed here
    imported: bool,
}

impl GpuImage {
    fn new(texture: wgpu::Texture, imported: bool) -> Self {
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self { texture, view, imported }
    }
}

#[derive(Debug)]
struct GpuModule {
    label: String,
    module: wgpu::ShaderModule,
}

#[derive(Debug, Clone, Copy)]
enum ComputeCommand {
    BindPipeline(PipelineHandle),
    BindUniformSet(UniformSetHandle, u32),
    Dispatch(u32, u32, u32),
}

/// A [`ComputeDevice`] backed by a wgpu device and queue
#[derive(Debug)]
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    intermediate_format: wgpu::TextureFormat,
    images: SlotMap<ImageHandle, GpuImage>,
    buffers: SlotMap<BufferHandle, wgpu::Buffer>,
    modules: SlotMap<ModuleHandle, GpuModule>,
    pipelines: SlotMap<PipelineHandle, wgpu::ComputePipeline>,
    uniform_sets: SlotMap<UniformSetHandle, wgpu::BindGroup>,
    compute_list: Option<Vec<ComputeCommand>>,
}

impl WgpuDevice {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            device,
            queue,
            intermediate_format: wgpu::TextureFormat::Rgba16Float,
            images: SlotMap::with_key(),
            buffers: SlotMap::with_key(),
            modules: SlotMap::with_key(),
            pipelines: SlotMap::with_key(),
            uniform_sets: SlotMap::with_key(),
            compute_list: None,
        }
    }

    /// Requests a high-performance adapter and creates a device on it
    pub async fn request() -> Result<Self, DeviceError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|error| DeviceError::Backend(error.to_string()))?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("pass-graph"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::default(),
                trace: Default::default(),
            })
            .await
            .map_err(|error| DeviceError::Backend(error.to_string()))?;

        Ok(Self::new(device, queue))
    }

    /// Sets the texture format of images created by [`ComputeDevice::create_image`]
    ///
    /// The format must support write-only storage binding.
    pub fn with_intermediate_format(mut self, format: wgpu::TextureFormat) -> Self {
        self.intermediate_format = format;
        self
    }

    pub fn intermediate_format(&self) -> wgpu::TextureFormat {
        self.intermediate_format
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Registers a host texture so it can be bound as a graph input or output
    ///
    /// Freeing the returned handle drops the registration but never destroys the texture.
    pub fn import_texture(&mut self, texture: wgpu::Texture) -> ImageHandle {
        self.images.insert(GpuImage::new(texture, true))
    }

    pub fn texture(&self, image: ImageHandle) -> Option<&wgpu::Texture> {
        self.images.get(image).map(|image| &image.texture)
    }

    /// Runs `f` inside a validation error scope
    fn validated<T>(&self, f: impl FnOnce(&wgpu::Device) -> T) -> (T, Option<wgpu::Error>) {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        let error = pollster::block_on(self.device.pop_error_scope());
        (value, error)
    }

    fn open_list(&mut self) -> Result<&mut Vec<ComputeCommand>, DeviceError> {
        self.compute_list.as_mut().ok_or(DeviceError::NoComputeList)
    }

    fn encode(&self, encoder: &mut wgpu::CommandEncoder, commands: &[ComputeCommand]) -> Result<(), DeviceError> {
        let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("pass-graph compute list"),
            timestamp_writes: None,
        });

        for command in commands {
            match *command {
                ComputeCommand::BindPipeline(pipeline) => {
                    let pipeline = self.pipelines.get(pipeline).ok_or(DeviceError::invalid(DeviceHandle::Pipeline(pipeline)))?;
                    compute_pass.set_pipeline(pipeline);
                }
                ComputeCommand::BindUniformSet(uniform_set, slot) => {
                    let bind_group = self.uniform_sets.get(uniform_set).ok_or(DeviceError::invalid(DeviceHandle::UniformSet(uniform_set)))?;
                    compute_pass.set_bind_group(slot, bind_group, &[]);
                }
                ComputeCommand::Dispatch(x, y, z) => compute_pass.dispatch_workgroups(x, y, z),
            }
        }

        Ok(())
    }
}

impl ComputeDevice for WgpuDevice {
    fn create_image(&mut self, size: Extent) -> Result<ImageHandle, DeviceError> {
        if size.is_empty() {
            return Err(DeviceError::Backend(format!("cannot create a {size} image")));
        }

        let format = self.intermediate_format;
        let (texture, error) = self.validated(|device| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some("Intermediate Image"),
                size: wgpu::Extent3d {
                    width: size.width,
                    height: size.height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format,
                usage: IMAGE_USAGE,
                view_formats: &[],
            })
        });
        if let Some(error) = error {
            return Err(DeviceError::Backend(error.to_string()));
        }

        Ok(self.images.insert(GpuImage::new(texture, false)))
    }

    fn image_size(&self, image: ImageHandle) -> Option<Extent> {
        let texture = &self.images.get(image)?.texture;
        Some(Extent::new(texture.width(), texture.height()))
    }

    fn create_buffer(&mut self, data: &[u8]) -> Result<BufferHandle, DeviceError> {
        let (buffer, error) = self.validated(|device| {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Constant Buffer"),
                contents: data,
                usage: BUFFER_USAGE,
            })
        });
        if let Some(error) = error {
            return Err(DeviceError::Backend(error.to_string()));
        }

        Ok(self.buffers.insert(buffer))
    }

    fn update_buffer(&mut self, buffer: BufferHandle, data: &[u8]) -> Result<(), DeviceError> {
        let target = self.buffers.get(buffer).ok_or(DeviceError::invalid(DeviceHandle::Buffer(buffer)))?;
        if target.size() != data.len() as u64 {
            return Err(DeviceError::BufferSizeMismatch {
                expected: target.size() as usize,
                actual: data.len(),
            });
        }

        self.queue.write_buffer(target, 0, data);
        Ok(())
    }

    fn compile_shader(&mut self, label: &str, source: &str) -> Result<ModuleHandle, DeviceError> {
        let (module, error) = self.validated(|device| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            })
        });
        if let Some(error) = error {
            return Err(DeviceError::ShaderCompilation {
                label: label.to_string(),
                message: error.to_string(),
            });
        }

        Ok(self.modules.insert(GpuModule { label: label.to_string(), module }))
    }

    fn create_pipeline(&mut self, module: ModuleHandle) -> Result<PipelineHandle, DeviceError> {
        let GpuModule { label, module } = self.modules.get(module).ok_or(DeviceError::invalid(DeviceHandle::Module(module)))?;

        let (pipeline, error) = self.validated(|device| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: None,
                module,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            })
        });
        if let Some(error) = error {
            return Err(DeviceError::ShaderCompilation {
                label: label.clone(),
                message: error.to_string(),
            });
        }

        Ok(self.pipelines.insert(pipeline))
    }

    fn create_uniform_set(&mut self, pipeline: PipelineHandle, slot: u32, resource: ResourceId) -> Result<UniformSetHandle, DeviceError> {
        let compute_pipeline = self.pipelines.get(pipeline).ok_or(DeviceError::invalid(DeviceHandle::Pipeline(pipeline)))?;
        let binding = match resource {
            ResourceId::Image(image) => wgpu::BindingResource::TextureView(&self.images.get(image).ok_or(DeviceError::invalid(resource.into()))?.view),
            ResourceId::Buffer(buffer) => self.buffers.get(buffer).ok_or(DeviceError::invalid(resource.into()))?.as_entire_binding(),
        };

        let (bind_group, error) = self.validated(|device| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Uniform Set"),
                layout: &compute_pipeline.get_bind_group_layout(slot),
                entries: &[wgpu::BindGroupEntry { binding: 0, resource: binding }],
            })
        });
        if let Some(error) = error {
            return Err(DeviceError::Backend(error.to_string()));
        }

        Ok(self.uniform_sets.insert(bind_group))
    }

    fn is_valid(&self, handle: DeviceHandle) -> bool {
        match handle {
            DeviceHandle::Image(h) => self.images.contains_key(h),
            DeviceHandle::Buffer(h) => self.buffers.contains_key(h),
            DeviceHandle::Module(h) => self.modules.contains_key(h),
            DeviceHandle::Pipeline(h) => self.pipelines.contains_key(h),
            DeviceHandle::UniformSet(h) => self.uniform_sets.contains_key(h),
        }
    }

    fn free(&mut self, handle: DeviceHandle) {
        match handle {
            DeviceHandle::Image(h) => {
                if let Some(image) = self.images.remove(h) {
                    if !image.imported {
                        image.texture.destroy();
                    }
                }
            }
            DeviceHandle::Buffer(h) => {
                if let Some(buffer) = self.buffers.remove(h) {
                    buffer.destroy();
                }
            }
            DeviceHandle::Module(h) => {
                self.modules.remove(h);
            }
            DeviceHandle::Pipeline(h) => {
                self.pipelines.remove(h);
            }
            DeviceHandle::UniformSet(h) => {
                self.uniform_sets.remove(h);
            }
        }
    }

    fn compute_list_begin(&mut self) -> Result<(), DeviceError> {
        self.compute_list = Some(Vec::new());
        Ok(())
    }

    fn compute_list_bind_pipeline(&mut self, pipeline: PipelineHandle) -> Result<(), DeviceError> {
        if !self.pipelines.contains_key(pipeline) {
            return Err(DeviceError::invalid(DeviceHandle::Pipeline(pipeline)));
        }
        self.open_list()?.push(ComputeCommand::BindPipeline(pipeline));
        Ok(())
    }

    fn compute_list_bind_uniform_set(&mut self, uniform_set: UniformSetHandle, slot: u32) -> Result<(), DeviceError> {
        if !self.uniform_sets.contains_key(uniform_set) {
            return Err(DeviceError::invalid(DeviceHandle::UniformSet(uniform_set)));
        }
        self.open_list()?.push(ComputeCommand::BindUniformSet(uniform_set, slot));
        Ok(())
    }

    fn compute_list_dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<(), DeviceError> {
        self.open_list()?.push(ComputeCommand::Dispatch(x, y, z));
        Ok(())
    }

    /// Encodes the recorded commands into one compute pass and submits it
    fn compute_list_end(&mut self) -> Result<(), DeviceError> {
        let commands = self.compute_list.take().ok_or(DeviceError::NoComputeList)?;

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("pass-graph") });
        let encoded = self.encode(&mut encoder, &commands);
        if encoded.is_ok() {
            self.queue.submit(std::iter::once(encoder.finish()));
        }
        let error = pollster::block_on(self.device.pop_error_scope());

        encoded?;
        if let Some(error) = error {
            return Err(DeviceError::Backend(error.to_string()));
        }
        Ok(())
    }
}
