//! The compute device capability
//!
//! Everything the graph needs from the GPU goes through [`ComputeDevice`]:
//! creating and destroying images and buffers, compiling shader modules,
//! creating pipelines and uniform sets, and recording compute lists.

use slotmap::new_key_type;
use std::fmt;

new_key_type! {
    /// A device-side 2D image
    pub struct ImageHandle;
    /// A device-side storage buffer
    pub struct BufferHandle;
    /// A compiled shader module
    pub struct ModuleHandle;
    /// A compute pipeline created from a module
    pub struct PipelineHandle;
    /// A uniform set binding one resource to one slot of one pipeline
    pub struct UniformSetHandle;
}

/// A 2D size in texels
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns true if either dimension is zero
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Identity of a bindable resource
///
/// Two bindings refer to the same resource exactly when their identities are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Image(ImageHandle),
    Buffer(BufferHandle),
}

/// Any handle the device can validate and free
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceHandle {
    Image(ImageHandle),
    Buffer(BufferHandle),
    Module(ModuleHandle),
    Pipeline(PipelineHandle),
    UniformSet(UniformSetHandle),
}

impl DeviceHandle {
    /// Short name of the handle kind, used in error messages and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Image(_) => "image",
            Self::Buffer(_) => "buffer",
            Self::Module(_) => "shader module",
            Self::Pipeline(_) => "pipeline",
            Self::UniformSet(_) => "uniform set",
        }
    }
}

impl From<ResourceId> for DeviceHandle {
    fn from(resource: ResourceId) -> Self {
        match resource {
            ResourceId::Image(image) => Self::Image(image),
            ResourceId::Buffer(buffer) => Self::Buffer(buffer),
        }
    }
}

/// Errors reported by a [`ComputeDevice`] or while resolving shader sources
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// A handle did not refer to a live device object
    #[error("invalid {kind} handle")]
    InvalidHandle { kind: &'static str },
    /// The shader loader could not produce source code for a path
    #[error("failed to load shader source '{path}'")]
    ShaderSource {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// The device rejected a shader module
    #[error("failed to compile shader '{label}': {message}")]
    ShaderCompilation { label: String, message: String },
    /// A buffer update did not match the allocated length
    #[error("buffer holds {expected} bytes but {actual} bytes were written")]
    BufferSizeMismatch { expected: usize, actual: usize },
    /// A compute list command was issued outside of begin/end
    #[error("no compute list is being recorded")]
    NoComputeList,
    /// Any other failure reported by the backend
    #[error("device error: {0}")]
    Backend(String),
}

impl DeviceError {
    pub(crate) fn invalid(handle: DeviceHandle) -> Self {
        Self::InvalidHandle { kind: handle.kind() }
    }
}

/// The narrow set of GPU operations the graph depends on
///
/// Uniform sets follow a one-resource-per-set convention: the resource is
/// bound at binding 0 of the set whose index equals the slot number.
pub trait ComputeDevice {
    /// Creates a storage-capable image of the given size
    fn create_image(&mut self, size: Extent) -> Result<ImageHandle, DeviceError>;

    /// Returns the size of a live image
    fn image_size(&self, image: ImageHandle) -> Option<Extent>;

    /// Creates a storage buffer initialized with `data`
    fn create_buffer(&mut self, data: &[u8]) -> Result<BufferHandle, DeviceError>;

    /// Overwrites the contents of a buffer of the same length
    fn update_buffer(&mut self, buffer: BufferHandle, data: &[u8]) -> Result<(), DeviceError>;

    /// Compiles shader source into a module
    fn compile_shader(&mut self, label: &str, source: &str) -> Result<ModuleHandle, DeviceError>;

    /// Creates a compute pipeline from a module
    fn create_pipeline(&mut self, module: ModuleHandle) -> Result<PipelineHandle, DeviceError>;

    /// Binds `resource` to set `slot` of `pipeline`
    fn create_uniform_set(&mut self, pipeline: PipelineHandle, slot: u32, resource: ResourceId) -> Result<UniformSetHandle, DeviceError>;

    /// Returns true if the handle refers to a live object
    fn is_valid(&self, handle: DeviceHandle) -> bool;

    /// Destroys a device object; unknown handles are ignored
    fn free(&mut self, handle: DeviceHandle);

    /// Starts recording a compute list
    fn compute_list_begin(&mut self) -> Result<(), DeviceError>;

    fn compute_list_bind_pipeline(&mut self, pipeline: PipelineHandle) -> Result<(), DeviceError>;

    fn compute_list_bind_uniform_set(&mut self, uniform_set: UniformSetHandle, slot: u32) -> Result<(), DeviceError>;

    fn compute_list_dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<(), DeviceError>;

    /// Finishes the compute list and submits it
    fn compute_list_end(&mut self) -> Result<(), DeviceError>;
}

/// Frees `handle` if it is still valid, then forgets it
pub(crate) fn free_if_valid(device: &mut dyn ComputeDevice, handle: &mut Option<impl Into<DeviceHandle> + Copy>) {
    if let Some(h) = handle.take() {
        let h = h.into();
        if device.is_valid(h) {
            device.free(h);
        }
    }
}

macro_rules! impl_into_device_handle {
    ($($handle:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$handle> for DeviceHandle {
                fn from(handle: $handle) -> Self {
                    Self::$variant(handle)
                }
            }
        )*
    };
}

impl_into_device_handle! {
    ImageHandle => Image,
    BufferHandle => Buffer,
    ModuleHandle => Module,
    PipelineHandle => Pipeline,
    UniformSetHandle => UniformSet,
}
