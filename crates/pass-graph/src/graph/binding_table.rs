//! Physical intermediate images and the shader slots bound to them

use super::{ShaderId, SlotRef};
use crate::device::{ComputeDevice, DeviceError, Extent};
use crate::resource::Image;
use crate::shader::Shader;
use slotmap::SlotMap;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct Intermediate {
    image: Image,
    /// Every shader slot, producer or consumer, bound to this image
    bindings: Vec<SlotRef>,
}

/// Owns the intermediate images of a built graph
#[derive(Debug, Default)]
pub struct BufferBindingTable {
    intermediates: Vec<Intermediate>,
    assignments: HashMap<SlotRef, usize>,
}

impl BufferBindingTable {
    /// Allocates `count` intermediate images of `size`
    pub fn allocate(device: &mut dyn ComputeDevice, size: Extent, count: usize, assignments: HashMap<SlotRef, usize>) -> Result<Self, DeviceError> {
        let mut table = Self {
            intermediates: Vec::with_capacity(count),
            assignments,
        };

        for _ in 0..count {
            match Image::new(device, size) {
                Ok(image) => table.intermediates.push(Intermediate { image, bindings: Vec::new() }),
                Err(error) => {
                    table.free_images(device);
                    return Err(error);
                }
            }
        }

        Ok(table)
    }

    /// Image written by the producer slot `slot`
    pub fn image_for(&self, slot: SlotRef) -> Option<&Image> {
        let index = *self.assignments.get(&slot)?;
        self.intermediates.get(index).map(|intermediate| &intermediate.image)
    }

    /// Binds the image of `producer` to `target` and records the binding
    pub fn bind(&mut self, device: &mut dyn ComputeDevice, shaders: &mut SlotMap<ShaderId, Shader>, producer: SlotRef, target: SlotRef) -> Result<(), DeviceError> {
        let index = *self.assignments.get(&producer).ok_or(DeviceError::InvalidHandle { kind: "image" })?;
        let intermediate = self.intermediates.get_mut(index).ok_or(DeviceError::InvalidHandle { kind: "image" })?;
        let shader = shaders.get_mut(target.shader).ok_or(DeviceError::InvalidHandle { kind: "pipeline" })?;

        shader.bind_uniform(device, &intermediate.image, target.slot)?;
        if !intermediate.bindings.contains(&target) {
            intermediate.bindings.push(target);
        }
        Ok(())
    }

    /// Number of physical intermediate images
    pub fn len(&self) -> usize {
        self.intermediates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intermediates.is_empty()
    }

    /// Allocates one image of `size` per intermediate, without touching any binding
    ///
    /// On failure the replacements allocated so far are freed and the table is
    /// left as it was.
    pub fn allocate_replacements(&self, device: &mut dyn ComputeDevice, size: Extent) -> Result<Vec<Image>, DeviceError> {
        let mut replacements: Vec<Image> = Vec::with_capacity(self.intermediates.len());
        for _ in &self.intermediates {
            match Image::new(device, size) {
                Ok(image) => replacements.push(image),
                Err(error) => {
                    for image in &mut replacements {
                        image.cleanup(device);
                    }
                    return Err(error);
                }
            }
        }
        Ok(replacements)
    }

    /// Swaps in the images from [`allocate_replacements`](Self::allocate_replacements) and restores every binding
    ///
    /// All bindings are dropped before any old image is freed, so no uniform
    /// set ever refers to a destroyed image. A failed rebind leaves the
    /// remaining slots unbound.
    pub fn swap_images(&mut self, device: &mut dyn ComputeDevice, shaders: &mut SlotMap<ShaderId, Shader>, replacements: Vec<Image>) -> Result<(), DeviceError> {
        for intermediate in &self.intermediates {
            for binding in &intermediate.bindings {
                if let Some(shader) = shaders.get_mut(binding.shader) {
                    shader.unbind_uniform(device, binding.slot);
                }
            }
        }

        for (intermediate, replacement) in self.intermediates.iter_mut().zip(replacements) {
            let mut previous = std::mem::replace(&mut intermediate.image, replacement);
            previous.cleanup(device);
        }

        for intermediate in &self.intermediates {
            for binding in &intermediate.bindings {
                if let Some(shader) = shaders.get_mut(binding.shader) {
                    shader.bind_uniform(device, &intermediate.image, binding.slot)?;
                }
            }
        }

        Ok(())
    }

    fn free_images(&mut self, device: &mut dyn ComputeDevice) {
        for intermediate in &mut self.intermediates {
            intermediate.image.cleanup(device);
        }
    }

    /// Frees every intermediate image and forgets all bindings
    ///
    /// Shader uniforms must be unbound beforehand.
    pub fn cleanup(&mut self, device: &mut dyn ComputeDevice) {
        self.free_images(device);
        self.intermediates.clear();
        self.assignments.clear();
    }
}
