//! A single compute pass
//!
//! A [`Shader`] owns the compute pipeline built from a pooled module and one
//! uniform set per bound slot.

use crate::device::{ComputeDevice, DeviceError, DeviceHandle, Extent, ModuleHandle, PipelineHandle, ResourceId, UniformSetHandle, free_if_valid};
use crate::resource::Uniformable;
use crate::shader_pool::ShaderPool;
use std::collections::BTreeMap;

/// Compute shader workgroup size in X dimension
pub const COMPUTE_WORKGROUP_SIZE_X: u32 = 8;
/// Compute shader workgroup size in Y dimension
pub const COMPUTE_WORKGROUP_SIZE_Y: u32 = 8;

/// A uniform set and the resource it was created for
#[derive(Debug)]
struct Uniform {
    uniform_set: UniformSetHandle,
    resource: ResourceId,
}

impl Uniform {
    fn free(self, device: &mut dyn ComputeDevice) {
        let handle = DeviceHandle::UniformSet(self.uniform_set);
        if device.is_valid(handle) {
            device.free(handle);
        }
    }
}

/// One compute pass bound to device resources
#[derive(Debug)]
pub struct Shader {
    path: String,
    module: Option<ModuleHandle>,
    pipeline: Option<PipelineHandle>,
    uniforms: BTreeMap<u32, Uniform>,
}

impl Shader {
    /// Creates a pass for the program at `path`, holding its module in `pool`
    pub fn new(device: &mut dyn ComputeDevice, pool: &mut ShaderPool, path: impl Into<String>) -> Result<Self, DeviceError> {
        let path = path.into();
        let module = pool.hold(device, &path)?;

        let pipeline = match device.create_pipeline(module) {
            Ok(pipeline) => pipeline,
            Err(error) => {
                pool.release(device, &path);
                return Err(error);
            }
        };

        Ok(Self {
            path,
            module: Some(module),
            pipeline: Some(pipeline),
            uniforms: BTreeMap::new(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn pipeline(&self) -> Option<PipelineHandle> {
        self.pipeline
    }

    /// Returns false once the shader has been cleaned up
    pub fn is_valid(&self) -> bool {
        self.pipeline.is_some()
    }

    /// Identity of the resource bound to `slot`
    pub fn bound_resource(&self, slot: u32) -> Option<ResourceId> {
        self.uniforms.get(&slot).map(|uniform| uniform.resource)
    }

    /// Slots that currently have a uniform set
    pub fn bound_slots(&self) -> impl Iterator<Item = u32> + '_ {
        self.uniforms.keys().copied()
    }

    /// Binds `resource` to `slot`
    ///
    /// Binding the resource already bound to the slot does nothing; binding a
    /// different one frees the previous uniform set first.
    pub fn bind_uniform(&mut self, device: &mut dyn ComputeDevice, resource: &dyn Uniformable, slot: u32) -> Result<(), DeviceError> {
        let pipeline = self.pipeline.ok_or(DeviceError::InvalidHandle { kind: "pipeline" })?;
        let identity = resource.identity().ok_or(DeviceError::InvalidHandle { kind: "resource" })?;

        if let Some(previous) = self.uniforms.get(&slot) {
            if previous.resource == identity {
                return Ok(());
            }
        }

        self.unbind_uniform(device, slot);

        let uniform_set = resource.create_uniform(device, pipeline, slot)?;
        tracing::trace!(shader = %self.path, slot, "bound uniform");
        self.uniforms.insert(slot, Uniform { uniform_set, resource: identity });
        Ok(())
    }

    /// Frees the uniform set bound to `slot`, if any
    pub fn unbind_uniform(&mut self, device: &mut dyn ComputeDevice, slot: u32) {
        if let Some(uniform) = self.uniforms.remove(&slot) {
            uniform.free(device);
            tracing::trace!(shader = %self.path, slot, "unbound uniform");
        }
    }

    pub fn unbind_all(&mut self, device: &mut dyn ComputeDevice) {
        for (_, uniform) in std::mem::take(&mut self.uniforms) {
            uniform.free(device);
        }
    }

    /// Workgroup counts covering `size` with 8x8 tiles
    ///
    /// Partial tiles are truncated, so sizes that are not multiples of 8 leave
    /// their right and bottom border undispatched.
    pub fn workgroups(size: Extent) -> (u32, u32) {
        (size.width / COMPUTE_WORKGROUP_SIZE_X, size.height / COMPUTE_WORKGROUP_SIZE_Y)
    }

    /// Records and submits one dispatch over `size`
    pub fn dispatch(&self, device: &mut dyn ComputeDevice, size: Extent) -> Result<(), DeviceError> {
        let pipeline = self.pipeline.ok_or(DeviceError::InvalidHandle { kind: "pipeline" })?;
        let (x, y) = Self::workgroups(size);

        device.compute_list_begin()?;
        device.compute_list_bind_pipeline(pipeline)?;
        for (&slot, uniform) in &self.uniforms {
            device.compute_list_bind_uniform_set(uniform.uniform_set, slot)?;
        }
        device.compute_list_dispatch(x, y, 1)?;
        device.compute_list_end()?;

        tracing::trace!(shader = %self.path, x, y, "dispatched");
        Ok(())
    }

    /// Frees every uniform set and the pipeline, then releases the module
    ///
    /// Safe to call repeatedly.
    pub fn cleanup(&mut self, device: &mut dyn ComputeDevice, pool: &mut ShaderPool) {
        self.unbind_all(device);
        free_if_valid(device, &mut self.pipeline);

        if self.module.take().is_some() {
            pool.release(device, &self.path);
        }
    }
}
