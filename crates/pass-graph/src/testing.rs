//! In-memory compute device for tests
//!
//! [`RecordingDevice`] keeps every object in slot maps and records each
//! submitted compute list, so tests can inspect allocations, bindings and
//! dispatch order without a GPU.

use crate::device::{BufferHandle, ComputeDevice, DeviceError, DeviceHandle, Extent, ImageHandle, ModuleHandle, PipelineHandle, ResourceId, UniformSetHandle};
use crate::shader_pool::ShaderPool;
use slotmap::SlotMap;

/// Shader sources containing this marker fail to compile
pub const COMPILE_ERROR_MARKER: &str = "#error";

#[derive(Debug, Clone)]
pub struct RecordedModule {
    pub label: String,
}

#[derive(Debug, Clone)]
pub struct RecordedUniformSet {
    pub pipeline: PipelineHandle,
    pub slot: u32,
    pub resource: ResourceId,
}

/// One submitted dispatch with the state bound at the time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedDispatch {
    pub pipeline: PipelineHandle,
    pub uniform_sets: Vec<(u32, UniformSetHandle)>,
    pub workgroups: (u32, u32, u32),
}

impl RecordedDispatch {
    /// Bound slot numbers in binding order
    pub fn slots(&self) -> Vec<u32> {
        self.uniform_sets.iter().map(|(slot, _)| *slot).collect()
    }
}

#[derive(Debug, Default)]
struct OpenComputeList {
    pipeline: Option<PipelineHandle>,
    uniform_sets: Vec<(u32, UniformSetHandle)>,
    dispatches: Vec<RecordedDispatch>,
}

/// A [`ComputeDevice`] that tracks objects in memory
#[derive(Debug, Default)]
pub struct RecordingDevice {
    images: SlotMap<ImageHandle, Extent>,
    buffers: SlotMap<BufferHandle, Vec<u8>>,
    modules: SlotMap<ModuleHandle, RecordedModule>,
    pipelines: SlotMap<PipelineHandle, ModuleHandle>,
    uniform_sets: SlotMap<UniformSetHandle, RecordedUniformSet>,
    open_list: Option<OpenComputeList>,
    dispatches: Vec<RecordedDispatch>,
    compiled_modules: usize,
    fail_dispatch: bool,
    /// Image and buffer allocations left before every further one fails
    allocation_budget: Option<usize>,
    fail_uniform_set: bool,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following dispatch fail with a backend error
    pub fn fail_dispatches(&mut self) {
        self.fail_dispatch = true;
    }

    /// Lets `count` more image or buffer allocations succeed, then fails every following one
    pub fn fail_allocations_after(&mut self, count: usize) {
        self.allocation_budget = Some(count);
    }

    /// Makes every following uniform set creation fail
    pub fn fail_uniform_sets(&mut self) {
        self.fail_uniform_set = true;
    }

    fn allocate(&mut self) -> Result<(), DeviceError> {
        match self.allocation_budget.as_mut() {
            Some(0) => Err(DeviceError::Backend("out of device memory".to_string())),
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn live_images(&self) -> usize {
        self.images.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_modules(&self) -> usize {
        self.modules.len()
    }

    pub fn live_pipelines(&self) -> usize {
        self.pipelines.len()
    }

    pub fn live_uniform_sets(&self) -> usize {
        self.uniform_sets.len()
    }

    /// Total number of live objects of every kind
    pub fn live_objects(&self) -> usize {
        self.live_images() + self.live_buffers() + self.live_modules() + self.live_pipelines() + self.live_uniform_sets()
    }

    /// Number of successful shader compilations so far
    pub fn compiled_modules(&self) -> usize {
        self.compiled_modules
    }

    pub fn buffer_data(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(buffer).map(Vec::as_slice)
    }

    pub fn uniform_set(&self, uniform_set: UniformSetHandle) -> Option<&RecordedUniformSet> {
        self.uniform_sets.get(uniform_set)
    }

    /// Label of the module a pipeline was created from
    pub fn pipeline_label(&self, pipeline: PipelineHandle) -> Option<&str> {
        let module = self.pipelines.get(pipeline)?;
        self.modules.get(*module).map(|module| module.label.as_str())
    }

    /// Every dispatch submitted so far, in submission order
    pub fn dispatches(&self) -> &[RecordedDispatch] {
        &self.dispatches
    }

    pub fn clear_dispatches(&mut self) {
        self.dispatches.clear();
    }

    fn open_list(&mut self) -> Result<&mut OpenComputeList, DeviceError> {
        self.open_list.as_mut().ok_or(DeviceError::NoComputeList)
    }
}

impl ComputeDevice for RecordingDevice {
    fn create_image(&mut self, size: Extent) -> Result<ImageHandle, DeviceError> {
        if size.is_empty() {
            return Err(DeviceError::Backend(format!("cannot create a {size} image")));
        }
        self.allocate()?;
        Ok(self.images.insert(size))
    }

    fn image_size(&self, image: ImageHandle) -> Option<Extent> {
        self.images.get(image).copied()
    }

    fn create_buffer(&mut self, data: &[u8]) -> Result<BufferHandle, DeviceError> {
        self.allocate()?;
        Ok(self.buffers.insert(data.to_vec()))
    }

    fn update_buffer(&mut self, buffer: BufferHandle, data: &[u8]) -> Result<(), DeviceError> {
        let contents = self.buffers.get_mut(buffer).ok_or(DeviceError::invalid(DeviceHandle::Buffer(buffer)))?;
        if contents.len() != data.len() {
            return Err(DeviceError::BufferSizeMismatch {
                expected: contents.len(),
                actual: data.len(),
            });
        }
        contents.copy_from_slice(data);
        Ok(())
    }

    fn compile_shader(&mut self, label: &str, source: &str) -> Result<ModuleHandle, DeviceError> {
        if source.contains(COMPILE_ERROR_MARKER) {
            return Err(DeviceError::ShaderCompilation {
                label: label.to_string(),
                message: "source contains a compile error marker".to_string(),
            });
        }
        self.compiled_modules += 1;
        Ok(self.modules.insert(RecordedModule { label: label.to_string() }))
    }

    fn create_pipeline(&mut self, module: ModuleHandle) -> Result<PipelineHandle, DeviceError> {
        if !self.modules.contains_key(module) {
            return Err(DeviceError::invalid(DeviceHandle::Module(module)));
        }
        Ok(self.pipelines.insert(module))
    }

    fn create_uniform_set(&mut self, pipeline: PipelineHandle, slot: u32, resource: ResourceId) -> Result<UniformSetHandle, DeviceError> {
        if !self.pipelines.contains_key(pipeline) {
            return Err(DeviceError::invalid(DeviceHandle::Pipeline(pipeline)));
        }
        if !self.is_valid(resource.into()) {
            return Err(DeviceError::invalid(resource.into()));
        }
        if self.fail_uniform_set {
            return Err(DeviceError::Backend("uniform set rejected".to_string()));
        }
        Ok(self.uniform_sets.insert(RecordedUniformSet { pipeline, slot, resource }))
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
                self.images.remove(h);
            }
            DeviceHandle::Buffer(h) => {
                self.buffers.remove(h);
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
        self.open_list = Some(OpenComputeList::default());
        Ok(())
    }

    fn compute_list_bind_pipeline(&mut self, pipeline: PipelineHandle) -> Result<(), DeviceError> {
        if !self.pipelines.contains_key(pipeline) {
            return Err(DeviceError::invalid(DeviceHandle::Pipeline(pipeline)));
        }
        self.open_list()?.pipeline = Some(pipeline);
        Ok(())
    }

    fn compute_list_bind_uniform_set(&mut self, uniform_set: UniformSetHandle, slot: u32) -> Result<(), DeviceError> {
        if !self.uniform_sets.contains_key(uniform_set) {
            return Err(DeviceError::invalid(DeviceHandle::UniformSet(uniform_set)));
        }
        let list = self.open_list()?;
        list.uniform_sets.retain(|(bound, _)| *bound != slot);
        list.uniform_sets.push((slot, uniform_set));
        Ok(())
    }

    fn compute_list_dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<(), DeviceError> {
        if self.fail_dispatch {
            return Err(DeviceError::Backend("dispatch rejected".to_string()));
        }
        let list = self.open_list()?;
        let pipeline = list.pipeline.ok_or(DeviceError::InvalidHandle { kind: "pipeline" })?;
        let dispatch = RecordedDispatch {
            pipeline,
            uniform_sets: list.uniform_sets.clone(),
            workgroups: (x, y, z),
        };
        list.dispatches.push(dispatch);
        Ok(())
    }

    fn compute_list_end(&mut self) -> Result<(), DeviceError> {
        let list = self.open_list.take().ok_or(DeviceError::NoComputeList)?;
        self.dispatches.extend(list.dispatches);
        Ok(())
    }
}

/// A pool serving placeholder sources for any path
///
/// Paths starting with `broken` resolve to source that fails to compile.
pub fn test_pool() -> ShaderPool {
    ShaderPool::new(|path: &str| {
        if path.starts_with("broken") {
            Ok(format!("{COMPILE_ERROR_MARKER} {path}"))
        } else {
            Ok(format!("// {path}"))
        }
    })
}
