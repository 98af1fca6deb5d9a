//! Image and buffer wrappers
//!
//! Each wrapper owns at most one device handle. Assigning a new size, handle
//! or byte length allocates the replacement first and then destroys the
//! previous allocation, so a failed allocation leaves the wrapper untouched.
//! `cleanup` is safe to call any number of times.

use crate::device::{BufferHandle, ComputeDevice, DeviceError, DeviceHandle, Extent, ImageHandle, PipelineHandle, ResourceId, UniformSetHandle, free_if_valid};

/// A resource that can be bound to a shader slot
pub trait Uniformable {
    /// Identity of the underlying device resource, if one is allocated
    fn identity(&self) -> Option<ResourceId>;

    /// Creates a uniform set binding this resource to `slot` of `pipeline`
    fn create_uniform(&self, device: &mut dyn ComputeDevice, pipeline: PipelineHandle, slot: u32) -> Result<UniformSetHandle, DeviceError> {
        let resource = self.identity().ok_or(DeviceError::InvalidHandle { kind: "resource" })?;
        device.create_uniform_set(pipeline, slot, resource)
    }
}

/// A 2D image, either allocated by this wrapper or supplied by the host
#[derive(Debug, Default)]
pub struct Image {
    handle: Option<ImageHandle>,
    size: Extent,
    /// Host-supplied images are forgotten on cleanup, never destroyed
    external: bool,
}

impl Image {
    /// Allocates a new image of `size`
    pub fn new(device: &mut dyn ComputeDevice, size: Extent) -> Result<Self, DeviceError> {
        let mut image = Self::default();
        image.resize(device, size)?;
        Ok(image)
    }

    /// Wraps a host-owned image without taking ownership of it
    pub fn external(device: &mut dyn ComputeDevice, handle: ImageHandle) -> Result<Self, DeviceError> {
        let mut image = Self::default();
        image.set_handle(device, handle)?;
        Ok(image)
    }

    pub fn handle(&self) -> Option<ImageHandle> {
        self.handle
    }

    pub fn size(&self) -> Extent {
        self.size
    }

    pub fn is_external(&self) -> bool {
        self.external
    }

    /// Reallocates the image at `size`
    ///
    /// Resizing to the current size is a no-op. A host-supplied image is
    /// released and replaced by an owned allocation.
    pub fn resize(&mut self, device: &mut dyn ComputeDevice, size: Extent) -> Result<(), DeviceError> {
        if self.handle.is_some() && self.size == size {
            return Ok(());
        }

        let handle = device.create_image(size)?;
        self.cleanup(device);

        self.handle = Some(handle);
        self.size = size;
        self.external = false;
        Ok(())
    }

    /// Points this wrapper at a host-owned image, releasing the previous one
    pub fn set_handle(&mut self, device: &mut dyn ComputeDevice, handle: ImageHandle) -> Result<(), DeviceError> {
        if self.handle == Some(handle) {
            return Ok(());
        }

        let size = device.image_size(handle).ok_or_else(|| DeviceError::invalid(DeviceHandle::Image(handle)))?;

        self.cleanup(device);

        self.handle = Some(handle);
        self.size = size;
        self.external = true;
        Ok(())
    }

    pub fn cleanup(&mut self, device: &mut dyn ComputeDevice) {
        if self.external {
            self.handle = None;
        } else {
            free_if_valid(device, &mut self.handle);
        }

        self.size = Extent::default();
        self.external = false;
    }
}

impl Uniformable for Image {
    fn identity(&self) -> Option<ResourceId> {
        self.handle.map(ResourceId::Image)
    }
}

/// A storage buffer holding raw bytes
#[derive(Debug, Default)]
pub struct Buffer {
    handle: Option<BufferHandle>,
    len: usize,
}

impl Buffer {
    pub fn new(device: &mut dyn ComputeDevice, data: &[u8]) -> Result<Self, DeviceError> {
        let mut buffer = Self::default();
        buffer.write(device, data)?;
        Ok(buffer)
    }

    /// Creates a buffer holding the bytes of a plain-old-data value
    pub fn from_pod<T: bytemuck::Pod>(device: &mut dyn ComputeDevice, value: &T) -> Result<Self, DeviceError> {
        Self::new(device, bytemuck::bytes_of(value))
    }

    pub fn handle(&self) -> Option<BufferHandle> {
        self.handle
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Writes `data` into the buffer
    ///
    /// Data of the same length is uploaded in place and keeps the handle;
    /// otherwise the buffer is reallocated and the handle changes.
    pub fn write(&mut self, device: &mut dyn ComputeDevice, data: &[u8]) -> Result<(), DeviceError> {
        if let Some(handle) = self.handle {
            if self.len == data.len() && device.is_valid(DeviceHandle::Buffer(handle)) {
                return device.update_buffer(handle, data);
            }
        }

        let handle = device.create_buffer(data)?;
        self.cleanup(device);

        self.handle = Some(handle);
        self.len = data.len();
        Ok(())
    }

    pub fn cleanup(&mut self, device: &mut dyn ComputeDevice) {
        free_if_valid(device, &mut self.handle);
        self.len = 0;
    }
}

impl Uniformable for Buffer {
    fn identity(&self) -> Option<ResourceId> {
        self.handle.map(ResourceId::Buffer)
    }
}
