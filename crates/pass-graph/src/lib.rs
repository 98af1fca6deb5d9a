//! Multi-pass compute graph scheduling for screen-space image effects
//!
//! This crate turns a declarative set of data-flow arcs between graph inputs,
//! compute passes and graph outputs into a single ordered dispatch sequence.
//! Intermediate images are allocated once per producing slot and shared by
//! every consumer of that slot, and are recycled across slots whose lifetimes
//! do not overlap.
//!
//! The GPU itself is reached through the narrow [`ComputeDevice`] capability.
//! [`WgpuDevice`] implements it on top of wgpu.

pub mod device;
pub mod error;
pub mod graph;
pub mod manifest;
pub mod resource;
pub mod shader;
pub mod shader_pool;
mod wgpu_device;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use device::{BufferHandle, ComputeDevice, DeviceError, DeviceHandle, Extent, ImageHandle, ModuleHandle, PipelineHandle, ResourceId, UniformSetHandle};
pub use error::{CycleError, GraphError, ValidationError};
pub use graph::{ArcKind, ConstantId, Graph, GraphOptions, InputArc, OutputArc, ShaderArc, ShaderId, SlotRef};
pub use manifest::{GraphManifest, ManifestError};
pub use resource::{Buffer, Image, Uniformable};
pub use shader::{COMPUTE_WORKGROUP_SIZE_X, COMPUTE_WORKGROUP_SIZE_Y, Shader};
pub use shader_pool::{ShaderLoader, ShaderPool};
pub use wgpu_device::WgpuDevice;
