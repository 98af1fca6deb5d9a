//! Compute-pass dependency graph
//!
//! A [`Graph`] collects arcs between graph inputs, shader slots and graph
//! outputs. [`Graph::build`] freezes the topology, linearizes the shaders into
//! a single dispatch order, allocates the intermediate images and binds every
//! slot. [`Graph::run`] then dispatches the pipeline once per call.

mod arcs;
mod binding_table;
mod lifetime;
mod schedule;

pub use arcs::{ArcKind, ArcSet, InputArc, OutputArc, ShaderArc};
pub use lifetime::{SlotLifetime, assign_intermediates, collect_lifetimes};
pub use schedule::linearize;

use crate::device::{ComputeDevice, DeviceError, DeviceHandle, Extent, ImageHandle};
use crate::error::{GraphError, ValidationError};
use crate::resource::{Buffer, Image};
use crate::shader::{COMPUTE_WORKGROUP_SIZE_X, COMPUTE_WORKGROUP_SIZE_Y, Shader};
use crate::shader_pool::ShaderPool;
use binding_table::BufferBindingTable;
use slotmap::{SlotMap, new_key_type};
use std::collections::BTreeMap;

new_key_type! {
    /// Identifies a shader registered in a [`Graph`]
    pub struct ShaderId;
    /// Identifies a constant buffer registered in a [`Graph`]
    pub struct ConstantId;
}

/// A numbered slot of one shader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotRef {
    /// Shader owning the slot
    pub shader: ShaderId,
    /// Slot number, which is also the bind group index
    pub slot: u32,
}

impl SlotRef {
    pub fn new(shader: ShaderId, slot: u32) -> Self {
        Self { shader, slot }
    }
}

/// Build-time options of a [`Graph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphOptions {
    /// Share one physical image between producer slots whose lifetimes do not overlap
    pub reuse_intermediates: bool,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self { reuse_intermediates: true }
    }
}

/// A dependency graph of compute passes
#[derive(Debug, Default)]
pub struct Graph {
    options: GraphOptions,
    shaders: SlotMap<ShaderId, Shader>,
    arcs: ArcSet,
    constants: SlotMap<ConstantId, Buffer>,
    constant_bindings: BTreeMap<SlotRef, ConstantId>,
    inputs: BTreeMap<u32, Image>,
    outputs: BTreeMap<u32, Image>,
    processing_size: Option<Extent>,
    pipeline: Vec<ShaderId>,
    binding_table: BufferBindingTable,
    built: bool,
    /// Set when a failed device call left built slots unbound
    poisoned: bool,
}

impl Graph {
    /// Creates an empty graph with default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty graph
    ///
    /// # Arguments
    /// * `options` - Build-time options, applied when [`Graph::build`] allocates intermediates
    pub fn with_options(options: GraphOptions) -> Self {
        Self { options, ..Self::default() }
    }

    /// Creates a shader for the program at `path` and registers it
    pub fn create_shader(&mut self, device: &mut dyn ComputeDevice, pool: &mut ShaderPool, path: &str) -> Result<ShaderId, GraphError> {
        let shader = Shader::new(device, pool, path)?;
        Ok(self.add_shader(shader))
    }

    /// Registers a shader; the graph cleans it up in [`Graph::cleanup`]
    pub fn add_shader(&mut self, shader: Shader) -> ShaderId {
        self.shaders.insert(shader)
    }

    pub fn shader(&self, id: ShaderId) -> Option<&Shader> {
        self.shaders.get(id)
    }

    fn check_shader(&self, id: ShaderId) -> Result<(), ValidationError> {
        match self.shaders.get(id) {
            Some(shader) if shader.is_valid() => Ok(()),
            _ => Err(ValidationError::InvalidShader(id)),
        }
    }

    fn check_unbuilt(&self) -> Result<(), ValidationError> {
        if self.built {
            return Err(ValidationError::TopologyFrozen);
        }
        Ok(())
    }

    /// Fails if `slot` is already bound to a constant
    fn check_not_constant(&self, slot: SlotRef) -> Result<(), ValidationError> {
        if self.constant_bindings.contains_key(&slot) {
            return Err(ValidationError::SlotConflict { shader: slot.shader, slot: slot.slot });
        }
        Ok(())
    }

    /// Declares that graph input `input` feeds `slot` of `shader`
    pub fn add_input_arc(&mut self, input: u32, shader: ShaderId, slot: u32) -> Result<(), GraphError> {
        self.check_unbuilt()?;
        self.check_shader(shader)?;
        self.check_not_constant(SlotRef::new(shader, slot))?;

        self.arcs.add_input_arc(InputArc { input, shader, slot })?;
        tracing::trace!(input, ?shader, slot, "added input arc");
        Ok(())
    }

    /// Declares that `from_slot` of `from` feeds `to_slot` of `to`
    ///
    /// Fails with [`CycleError`](crate::CycleError) if `from` is reachable
    /// from `to`, leaving the graph unchanged.
    pub fn add_shader_arc(&mut self, from: ShaderId, from_slot: u32, to: ShaderId, to_slot: u32) -> Result<(), GraphError> {
        self.check_unbuilt()?;
        self.check_shader(from)?;
        self.check_shader(to)?;
        self.check_not_constant(SlotRef::new(from, from_slot))?;
        self.check_not_constant(SlotRef::new(to, to_slot))?;

        self.arcs.add_shader_arc(ShaderArc { from, from_slot, to, to_slot })?;
        tracing::trace!(?from, from_slot, ?to, to_slot, "added shader arc");
        Ok(())
    }

    /// Declares that `slot` of `shader` writes into graph output `output`
    pub fn add_output_arc(&mut self, shader: ShaderId, slot: u32, output: u32) -> Result<(), GraphError> {
        self.check_unbuilt()?;
        self.check_shader(shader)?;
        self.check_not_constant(SlotRef::new(shader, slot))?;

        self.arcs.add_output_arc(OutputArc { shader, slot, output })?;
        tracing::trace!(?shader, slot, output, "added output arc");
        Ok(())
    }

    pub fn arcs(&self) -> &ArcSet {
        &self.arcs
    }

    pub fn input_arcs(&self) -> impl Iterator<Item = &InputArc> {
        self.arcs.input_arcs()
    }

    pub fn shader_arcs(&self) -> impl Iterator<Item = &ShaderArc> {
        self.arcs.shader_arcs()
    }

    pub fn output_arcs(&self) -> impl Iterator<Item = &OutputArc> {
        self.arcs.output_arcs()
    }

    /// Registers a constant buffer owned by the graph
    pub fn add_constant(&mut self, buffer: Buffer) -> ConstantId {
        self.constants.insert(buffer)
    }

    pub fn constant(&self, id: ConstantId) -> Option<&Buffer> {
        self.constants.get(id)
    }

    /// Binds a registered constant to `slot` of `shader`
    ///
    /// Before build the binding is only recorded and committed by
    /// [`Graph::build`]; after build it takes effect immediately. A slot used
    /// by an arc cannot hold a constant.
    pub fn bind_constant(&mut self, device: &mut dyn ComputeDevice, shader: ShaderId, slot: u32, constant: ConstantId) -> Result<(), GraphError> {
        self.check_shader(shader)?;
        let target = SlotRef::new(shader, slot);
        if self.arcs.uses_slot(target) {
            return Err(ValidationError::SlotConflict { shader, slot }.into());
        }
        let buffer = self.constants.get(constant).ok_or(ValidationError::UnknownConstant(constant))?;

        if self.built {
            let pass = self.shaders.get_mut(shader).ok_or(ValidationError::InvalidShader(shader))?;
            pass.bind_uniform(device, buffer, slot)?;
        }

        self.constant_bindings.insert(target, constant);
        Ok(())
    }

    /// Uploads new contents into a constant
    ///
    /// Data of the same byte length is written in place. Otherwise a new buffer
    /// is allocated first; only then is every slot bound to the constant
    /// unbound, the old buffer freed and the slots rebound. A failed allocation
    /// leaves the constant and its bindings untouched.
    pub fn write_constant(&mut self, device: &mut dyn ComputeDevice, constant: ConstantId, data: &[u8]) -> Result<(), GraphError> {
        let buffer = self.constants.get_mut(constant).ok_or(ValidationError::UnknownConstant(constant))?;
        let in_place = buffer.len() == data.len() && buffer.handle().is_some_and(|handle| device.is_valid(DeviceHandle::Buffer(handle)));
        if in_place {
            buffer.write(device, data)?;
            return Ok(());
        }

        let replacement = Buffer::new(device, data)?;
        let bound: Vec<SlotRef> = self.constant_bindings.iter().filter(|&(_, bound)| *bound == constant).map(|(slot, _)| *slot).collect();

        for slot in &bound {
            if let Some(shader) = self.shaders.get_mut(slot.shader) {
                shader.unbind_uniform(device, slot.slot);
            }
        }
        let mut previous = std::mem::replace(buffer, replacement);
        previous.cleanup(device);

        if self.built {
            let buffer = &self.constants[constant];
            let rebound = bound.iter().try_for_each(|slot| match self.shaders.get_mut(slot.shader).filter(|shader| shader.is_valid()) {
                Some(shader) => shader.bind_uniform(device, buffer, slot.slot),
                None => Ok(()),
            });
            if let Err(error) = rebound {
                self.poison(&error);
                return Err(error.into());
            }
        }

        tracing::debug!(?constant, len = data.len(), "reallocated constant");
        Ok(())
    }

    /// Binds a host-owned image as graph input `index`
    ///
    /// After build, a different image rebinds only the slots fed by this input.
    pub fn bind_input(&mut self, device: &mut dyn ComputeDevice, index: u32, handle: ImageHandle) -> Result<(), GraphError> {
        let image = self.inputs.entry(index).or_default();
        if image.handle() == Some(handle) {
            return Ok(());
        }
        image.set_handle(device, handle)?;
        let size = image.size();
        self.warn_on_size_mismatch("input", index, size);

        if self.built {
            let targets: Vec<SlotRef> = self.arcs.arcs_from_input(index).iter().map(|arc| SlotRef::new(arc.shader, arc.slot)).collect();
            if let Err(error) = rebind_slots(device, &mut self.shaders, &self.inputs[&index], &targets) {
                self.poison(&error);
                return Err(error.into());
            }
            tracing::debug!(index, slots = targets.len(), "rebound input");
        }

        Ok(())
    }

    /// Binds a host-owned image as graph output `index`
    ///
    /// After build, a different image rebinds only the slots writing into this output.
    pub fn bind_output(&mut self, device: &mut dyn ComputeDevice, index: u32, handle: ImageHandle) -> Result<(), GraphError> {
        let image = self.outputs.entry(index).or_default();
        if image.handle() == Some(handle) {
            return Ok(());
        }
        image.set_handle(device, handle)?;
        let size = image.size();
        self.warn_on_size_mismatch("output", index, size);

        if self.built {
            let targets: Vec<SlotRef> = self.arcs.arcs_to_output(index).iter().map(|arc| SlotRef::new(arc.shader, arc.slot)).collect();
            if let Err(error) = rebind_slots(device, &mut self.shaders, &self.outputs[&index], &targets) {
                self.poison(&error);
                return Err(error.into());
            }
            tracing::debug!(index, slots = targets.len(), "rebound output");
        }

        Ok(())
    }

    pub fn input(&self, index: u32) -> Option<&Image> {
        self.inputs.get(&index)
    }

    pub fn output(&self, index: u32) -> Option<&Image> {
        self.outputs.get(&index)
    }

    fn warn_on_size_mismatch(&self, role: &str, index: u32, size: Extent) {
        if let Some(processing_size) = self.processing_size {
            if processing_size != size {
                tracing::warn!(role, index, %size, %processing_size, "bound image does not match the processing size");
            }
        }
    }

    /// Sets the extent every pass is dispatched over
    ///
    /// After build, every intermediate image is reallocated at the new size and
    /// rebound; the pipeline order is unchanged. All replacements are allocated
    /// before any slot is unbound, so a failed allocation leaves the graph
    /// running at the previous size.
    pub fn set_processing_size(&mut self, device: &mut dyn ComputeDevice, size: Extent) -> Result<(), GraphError> {
        if size.is_empty() {
            return Err(ValidationError::NonPositiveProcessingSize { width: size.width, height: size.height }.into());
        }
        if self.processing_size == Some(size) {
            return Ok(());
        }

        if size.width % COMPUTE_WORKGROUP_SIZE_X != 0 || size.height % COMPUTE_WORKGROUP_SIZE_Y != 0 {
            tracing::warn!(%size, "processing size is not a multiple of the workgroup size, border texels will not be dispatched");
        }

        if self.built {
            let replacements = self.binding_table.allocate_replacements(device, size)?;
            self.processing_size = Some(size);
            if let Err(error) = self.binding_table.swap_images(device, &mut self.shaders, replacements) {
                self.poison(&error);
                return Err(error.into());
            }
            tracing::debug!(%size, intermediates = self.binding_table.len(), "resized intermediates");
        }

        self.processing_size = Some(size);
        Ok(())
    }

    pub fn processing_size(&self) -> Option<Extent> {
        self.processing_size
    }

    fn checked_processing_size(&self) -> Result<Extent, ValidationError> {
        match self.processing_size {
            None => Err(ValidationError::ProcessingSizeUnset),
            Some(size) if size.is_empty() => Err(ValidationError::NonPositiveProcessingSize { width: size.width, height: size.height }),
            Some(size) => Ok(size),
        }
    }

    /// Freezes the topology, orders the shaders and binds every slot
    ///
    /// Uniform sets, including those of constants bound earlier, are only
    /// created once the dispatch order is final. On failure every uniform set
    /// and intermediate created by the attempt is released.
    pub fn build(&mut self, device: &mut dyn ComputeDevice) -> Result<(), GraphError> {
        if self.built {
            return Err(ValidationError::AlreadyBuilt.into());
        }
        let size = self.checked_processing_size()?;

        for kind in [ArcKind::Input, ArcKind::Shader, ArcKind::Output] {
            if self.arcs.is_empty(kind) {
                return Err(ValidationError::MissingArcs(kind).into());
            }
        }
        if let Some(index) = self.arcs.input_indices().find(|index| !self.inputs.contains_key(index)) {
            return Err(ValidationError::UnboundInput(index).into());
        }
        if let Some(index) = self.arcs.output_indices().find(|index| !self.outputs.contains_key(index)) {
            return Err(ValidationError::UnboundOutput(index).into());
        }
        for shader in self.arcs.shader_ids() {
            self.check_shader(shader)?;
        }

        let pipeline = linearize(&self.arcs);
        let lifetimes = collect_lifetimes(&pipeline, &self.arcs);
        let (count, assignments) = assign_intermediates(&lifetimes, self.options.reuse_intermediates);
        let mut table = BufferBindingTable::allocate(device, size, count, assignments)?;

        if let Err(error) = self.bind_pipeline(device, &mut table, &pipeline) {
            for &shader in &pipeline {
                if let Some(shader) = self.shaders.get_mut(shader) {
                    shader.unbind_all(device);
                }
            }
            table.cleanup(device);
            return Err(error);
        }

        tracing::debug!(passes = pipeline.len(), intermediates = count, reused = lifetimes.len() - count, %size, "built graph");

        self.pipeline = pipeline;
        self.binding_table = table;
        self.built = true;
        Ok(())
    }

    /// Commits the uniform sets of every shader in pipeline order
    fn bind_pipeline(&mut self, device: &mut dyn ComputeDevice, table: &mut BufferBindingTable, pipeline: &[ShaderId]) -> Result<(), GraphError> {
        let Self {
            shaders,
            arcs,
            constants,
            constant_bindings,
            inputs,
            outputs,
            ..
        } = self;

        for &id in pipeline {
            for arc in arcs.input_arcs().filter(|arc| arc.shader == id) {
                let image = inputs.get(&arc.input).ok_or(ValidationError::UnboundInput(arc.input))?;
                shaders.get_mut(id).ok_or(ValidationError::InvalidShader(id))?.bind_uniform(device, image, arc.slot)?;
            }

            for arc in arcs.shader_arcs().filter(|arc| arc.to == id) {
                table.bind(device, shaders, arc.source(), arc.target())?;
            }

            for arc in arcs.dependents(id) {
                table.bind(device, shaders, arc.source(), arc.source())?;
            }

            for arc in arcs.output_arcs().filter(|arc| arc.shader == id) {
                let image = outputs.get(&arc.output).ok_or(ValidationError::UnboundOutput(arc.output))?;
                shaders.get_mut(id).ok_or(ValidationError::InvalidShader(id))?.bind_uniform(device, image, arc.slot)?;
            }

            for (slot, constant) in constant_bindings.range(SlotRef::new(id, 0)..=SlotRef::new(id, u32::MAX)) {
                let buffer = constants.get(*constant).ok_or(ValidationError::UnknownConstant(*constant))?;
                shaders.get_mut(id).ok_or(ValidationError::InvalidShader(id))?.bind_uniform(device, buffer, slot.slot)?;
            }
        }

        Ok(())
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    /// Returns true if a failed device call left slots unbound
    ///
    /// A poisoned graph refuses to run until it is cleaned up.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn poison(&mut self, error: &DeviceError) {
        tracing::warn!(%error, "device call failed while rebinding, graph is poisoned");
        self.poisoned = true;
    }

    /// Shaders in dispatch order; empty until built
    pub fn pipeline(&self) -> &[ShaderId] {
        &self.pipeline
    }

    /// Intermediate image written by `slot` of `shader`
    pub fn intermediate_for(&self, shader: ShaderId, slot: u32) -> Option<&Image> {
        self.binding_table.image_for(SlotRef::new(shader, slot))
    }

    /// Number of physical intermediate images allocated by build
    pub fn intermediate_count(&self) -> usize {
        self.binding_table.len()
    }

    /// Dispatches every shader once, in pipeline order
    ///
    /// Device errors propagate unmodified and stop the run.
    pub fn run(&self, device: &mut dyn ComputeDevice) -> Result<(), GraphError> {
        if !self.built {
            return Err(ValidationError::NotBuilt.into());
        }
        if self.poisoned {
            return Err(ValidationError::Poisoned.into());
        }
        let size = self.checked_processing_size()?;

        for &id in &self.pipeline {
            let shader = self.shaders.get(id).ok_or(ValidationError::InvalidShader(id))?;
            shader.dispatch(device, size)?;
        }

        Ok(())
    }

    /// Releases every device resource held by the graph
    ///
    /// Uniform sets are freed first, then intermediates and constants, then
    /// pipelines and pooled modules. Host images are forgotten, not destroyed.
    /// Safe to call in any state and any number of times.
    pub fn cleanup(&mut self, device: &mut dyn ComputeDevice, pool: &mut ShaderPool) {
        for shader in self.shaders.values_mut() {
            shader.unbind_all(device);
        }

        self.binding_table.cleanup(device);
        for buffer in self.constants.values_mut() {
            buffer.cleanup(device);
        }
        for image in self.inputs.values_mut().chain(self.outputs.values_mut()) {
            image.cleanup(device);
        }

        for shader in self.shaders.values_mut() {
            shader.cleanup(device, pool);
        }

        if self.built {
            tracing::debug!(passes = self.pipeline.len(), "cleaned up graph");
        }

        self.constants.clear();
        self.constant_bindings.clear();
        self.inputs.clear();
        self.outputs.clear();
        self.pipeline.clear();
        self.binding_table = BufferBindingTable::default();
        self.built = false;
        self.poisoned = false;
    }
}

/// Unbinds every target slot, then binds `image` to all of them
fn rebind_slots(device: &mut dyn ComputeDevice, shaders: &mut SlotMap<ShaderId, Shader>, image: &Image, targets: &[SlotRef]) -> Result<(), DeviceError> {
    for target in targets {
        if let Some(shader) = shaders.get_mut(target.shader) {
            shader.unbind_uniform(device, target.slot);
        }
    }
    for target in targets {
        if let Some(shader) = shaders.get_mut(target.shader) {
            shader.bind_uniform(device, image, target.slot)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CycleError;
    use crate::resource::Uniformable;
    use crate::testing::{RecordingDevice, test_pool};
    use proptest::prelude::*;
    use std::collections::HashMap;

    struct Setup {
        device: RecordingDevice,
        pool: ShaderPool,
        graph: Graph,
        input: ImageHandle,
        output: ImageHandle,
    }

    impl Setup {
        fn new(options: GraphOptions) -> Self {
            let mut device = RecordingDevice::new();
            let input = device.create_image(Extent::new(64, 64)).unwrap();
            let output = device.create_image(Extent::new(64, 64)).unwrap();
            Self {
                device,
                pool: test_pool(),
                graph: Graph::with_options(options),
                input,
                output,
            }
        }

        fn shader(&mut self, path: &str) -> ShaderId {
            self.graph.create_shader(&mut self.device, &mut self.pool, path).unwrap()
        }

        fn bind_host_images(&mut self) {
            self.graph.bind_input(&mut self.device, 0, self.input).unwrap();
            self.graph.bind_output(&mut self.device, 0, self.output).unwrap();
        }

        /// input -> shaders[0] -> ... -> shaders[n-1] -> output, reading slot 0 and writing slot 1
        fn chain(&mut self, paths: &[&str]) -> Vec<ShaderId> {
            let ids: Vec<ShaderId> = paths.iter().map(|path| self.shader(path)).collect();
            self.graph.add_input_arc(0, ids[0], 0).unwrap();
            for pair in ids.windows(2) {
                self.graph.add_shader_arc(pair[0], 1, pair[1], 0).unwrap();
            }
            self.graph.add_output_arc(ids[ids.len() - 1], 1, 0).unwrap();
            self.bind_host_images();
            ids
        }

        fn labels(&self) -> Vec<String> {
            self.device.dispatches().iter().map(|dispatch| self.device.pipeline_label(dispatch.pipeline).unwrap().to_string()).collect()
        }
    }

    #[test]
    fn test_two_pass_chain_dispatches() {
        let mut setup = Setup::new(GraphOptions::default());
        let ids = setup.chain(&["a.wgsl", "b.wgsl"]);
        setup.graph.set_processing_size(&mut setup.device, Extent::new(64, 64)).unwrap();

        setup.graph.build(&mut setup.device).unwrap();
        assert_eq!(setup.graph.pipeline(), &ids[..]);

        setup.graph.run(&mut setup.device).unwrap();

        let dispatches = setup.device.dispatches();
        assert_eq!(dispatches.len(), 2);
        assert!(dispatches.iter().all(|dispatch| dispatch.workgroups == (8, 8, 1)));
        assert_eq!(setup.labels(), vec!["a.wgsl", "b.wgsl"]);
        assert_eq!(dispatches[0].slots(), vec![0, 1]);
    }

    #[test]
    fn test_resize_after_build() {
        let mut setup = Setup::new(GraphOptions::default());
        let ids = setup.chain(&["a.wgsl", "b.wgsl"]);
        setup.graph.set_processing_size(&mut setup.device, Extent::new(64, 64)).unwrap();
        setup.graph.build(&mut setup.device).unwrap();
        let before = setup.graph.intermediate_for(ids[0], 1).and_then(Image::handle).unwrap();
        let uniform_sets = setup.device.live_uniform_sets();

        setup.graph.set_processing_size(&mut setup.device, Extent::new(128, 64)).unwrap();

        assert_eq!(setup.graph.pipeline(), &ids[..]);
        let intermediate = setup.graph.intermediate_for(ids[0], 1).unwrap();
        assert_ne!(intermediate.handle(), Some(before));
        assert_eq!(intermediate.size(), Extent::new(128, 64));
        assert_eq!(setup.graph.shader(ids[1]).unwrap().bound_resource(0), intermediate.identity());
        assert_eq!(setup.device.live_uniform_sets(), uniform_sets);
        assert!(!setup.device.is_valid(DeviceHandle::Image(before)));

        setup.graph.run(&mut setup.device).unwrap();
        assert!(setup.device.dispatches().iter().all(|dispatch| dispatch.workgroups == (16, 8, 1)));
        assert_eq!(setup.labels(), vec!["a.wgsl", "b.wgsl"]);
    }

    #[test]
    fn test_build_requires_every_arc_kind() {
        let mut setup = Setup::new(GraphOptions::default());
        let a = setup.shader("a.wgsl");
        let b = setup.shader("b.wgsl");
        setup.graph.add_input_arc(0, a, 0).unwrap();
        setup.graph.add_shader_arc(a, 1, b, 0).unwrap();
        let buffer = Buffer::from_pod(&mut setup.device, &1u32).unwrap();
        let constant = setup.graph.add_constant(buffer);
        setup.graph.bind_constant(&mut setup.device, b, 2, constant).unwrap();
        setup.bind_host_images();
        setup.graph.set_processing_size(&mut setup.device, Extent::new(64, 64)).unwrap();

        let error = setup.graph.build(&mut setup.device).unwrap_err();
        assert!(matches!(error, GraphError::Validation(ValidationError::MissingArcs(ArcKind::Output))));
        assert!(!setup.graph.is_built());
        assert_eq!(setup.device.live_uniform_sets(), 0);
    }

    #[test]
    fn test_build_twice_fails() {
        let mut setup = Setup::new(GraphOptions::default());
        setup.chain(&["a.wgsl", "b.wgsl"]);
        setup.graph.set_processing_size(&mut setup.device, Extent::new(64, 64)).unwrap();

        setup.graph.build(&mut setup.device).unwrap();
        let error = setup.graph.build(&mut setup.device).unwrap_err();

        assert!(matches!(error, GraphError::Validation(ValidationError::AlreadyBuilt)));
        assert!(setup.graph.is_built());
    }

    #[test]
    fn test_processing_size_is_validated() {
        let mut setup = Setup::new(GraphOptions::default());
        setup.chain(&["a.wgsl", "b.wgsl"]);

        let error = setup.graph.build(&mut setup.device).unwrap_err();
        assert!(matches!(error, GraphError::Validation(ValidationError::ProcessingSizeUnset)));

        let error = setup.graph.set_processing_size(&mut setup.device, Extent::new(0, 64)).unwrap_err();
        assert!(matches!(error, GraphError::Validation(ValidationError::NonPositiveProcessingSize { width: 0, height: 64 })));
        assert_eq!(setup.graph.processing_size(), None);
    }

    #[test]
    fn test_unbound_input_fails_build() {
        let mut setup = Setup::new(GraphOptions::default());
        let a = setup.shader("a.wgsl");
        let b = setup.shader("b.wgsl");
        setup.graph.add_input_arc(3, a, 0).unwrap();
        setup.graph.add_shader_arc(a, 1, b, 0).unwrap();
        setup.graph.add_output_arc(b, 1, 0).unwrap();
        setup.bind_host_images();
        setup.graph.set_processing_size(&mut setup.device, Extent::new(64, 64)).unwrap();

        let error = setup.graph.build(&mut setup.device).unwrap_err();
        assert!(matches!(error, GraphError::Validation(ValidationError::UnboundInput(3))));
    }

    #[test]
    fn test_run_before_build_fails() {
        let mut setup = Setup::new(GraphOptions::default());
        setup.chain(&["a.wgsl", "b.wgsl"]);

        let error = setup.graph.run(&mut setup.device).unwrap_err();
        assert!(matches!(error, GraphError::Validation(ValidationError::NotBuilt)));
    }

    #[test]
    fn test_arcs_frozen_after_build() {
        let mut setup = Setup::new(GraphOptions::default());
        let ids = setup.chain(&["a.wgsl", "b.wgsl"]);
        setup.graph.set_processing_size(&mut setup.device, Extent::new(64, 64)).unwrap();
        setup.graph.build(&mut setup.device).unwrap();

        let error = setup.graph.add_output_arc(ids[0], 2, 1).unwrap_err();
        assert!(matches!(error, GraphError::Validation(ValidationError::TopologyFrozen)));
    }

    #[test]
    fn test_invalid_shader_is_rejected() {
        let mut setup = Setup::new(GraphOptions::default());
        let a = setup.shader("a.wgsl");

        let error = setup.graph.add_shader_arc(a, 1, ShaderId::default(), 0).unwrap_err();
        assert!(matches!(error, GraphError::Validation(ValidationError::InvalidShader(_))));

        let error = setup.graph.add_input_arc(0, ShaderId::default(), 0).unwrap_err();
        assert!(matches!(error, GraphError::Validation(ValidationError::InvalidShader(_))));
    }

    #[test]
    fn test_cycle_leaves_graph_unchanged() {
        let mut setup = Setup::new(GraphOptions::default());
        let ids = setup.chain(&["a.wgsl", "b.wgsl", "c.wgsl"]);
        let before = setup.graph.arcs().clone();

        let error = setup.graph.add_shader_arc(ids[2], 2, ids[0], 2).unwrap_err();

        assert!(matches!(error, GraphError::Cycle(CycleError { from, to }) if from == ids[2] && to == ids[0]));
        assert_eq!(setup.graph.arcs(), &before);
    }

    #[test]
    fn test_diamond_shares_producer_image() {
        let mut setup = Setup::new(GraphOptions::default());
        let a = setup.shader("a.wgsl");
        let b = setup.shader("b.wgsl");
        let c = setup.shader("c.wgsl");
        let d = setup.shader("d.wgsl");
        setup.graph.add_input_arc(0, a, 0).unwrap();
        setup.graph.add_shader_arc(a, 1, b, 0).unwrap();
        setup.graph.add_shader_arc(a, 1, c, 0).unwrap();
        setup.graph.add_shader_arc(b, 1, d, 0).unwrap();
        setup.graph.add_shader_arc(c, 1, d, 2).unwrap();
        setup.graph.add_output_arc(d, 1, 0).unwrap();
        setup.bind_host_images();
        setup.graph.set_processing_size(&mut setup.device, Extent::new(64, 64)).unwrap();

        setup.graph.build(&mut setup.device).unwrap();

        let produced = setup.graph.intermediate_for(a, 1).and_then(Image::identity).unwrap();
        assert_eq!(setup.graph.shader(b).unwrap().bound_resource(0), Some(produced));
        assert_eq!(setup.graph.shader(c).unwrap().bound_resource(0), Some(produced));
        assert_eq!(setup.graph.intermediate_count(), 3);
        assert_eq!(setup.graph.pipeline().first(), Some(&a));
        assert_eq!(setup.graph.pipeline().last(), Some(&d));
    }

    #[test]
    fn test_ping_pong_reuses_intermediates() {
        let mut setup = Setup::new(GraphOptions::default());
        setup.chain(&["a.wgsl", "b.wgsl", "c.wgsl", "d.wgsl", "e.wgsl"]);
        setup.graph.set_processing_size(&mut setup.device, Extent::new(64, 64)).unwrap();
        setup.graph.build(&mut setup.device).unwrap();

        assert_eq!(setup.graph.intermediate_count(), 2);
        // Two host images plus the two intermediates
        assert_eq!(setup.device.live_images(), 4);
    }

    #[test]
    fn test_reuse_can_be_disabled() {
        let mut setup = Setup::new(GraphOptions { reuse_intermediates: false });
        setup.chain(&["a.wgsl", "b.wgsl", "c.wgsl", "d.wgsl", "e.wgsl"]);
        setup.graph.set_processing_size(&mut setup.device, Extent::new(64, 64)).unwrap();
        setup.graph.build(&mut setup.device).unwrap();

        assert_eq!(setup.graph.intermediate_count(), 4);
    }

    #[test]
    fn test_rebinding_input_touches_only_its_slots() {
        let mut setup = Setup::new(GraphOptions::default());
        let ids = setup.chain(&["a.wgsl", "b.wgsl"]);
        setup.graph.set_processing_size(&mut setup.device, Extent::new(64, 64)).unwrap();
        setup.graph.build(&mut setup.device).unwrap();
        let uniform_sets = setup.device.live_uniform_sets();
        let consumer = setup.graph.shader(ids[1]).unwrap().bound_resource(0);

        let replacement = setup.device.create_image(Extent::new(64, 64)).unwrap();
        setup.graph.bind_input(&mut setup.device, 0, replacement).unwrap();

        assert_eq!(setup.graph.shader(ids[0]).unwrap().bound_resource(0), Some(crate::ResourceId::Image(replacement)));
        assert_eq!(setup.graph.shader(ids[1]).unwrap().bound_resource(0), consumer);
        assert_eq!(setup.device.live_uniform_sets(), uniform_sets);
        assert!(setup.device.is_valid(DeviceHandle::Image(setup.input)));
    }

    #[test]
    fn test_constants_follow_reallocation() {
        let mut setup = Setup::new(GraphOptions::default());
        let ids = setup.chain(&["a.wgsl", "b.wgsl"]);
        let buffer = Buffer::from_pod(&mut setup.device, &2i32).unwrap();
        let step = setup.graph.add_constant(buffer);
        setup.graph.bind_constant(&mut setup.device, ids[0], 2, step).unwrap();

        let error = setup.graph.bind_constant(&mut setup.device, ids[0], 1, step).unwrap_err();
        assert!(matches!(error, GraphError::Validation(ValidationError::SlotConflict { slot: 1, .. })));
        let error = setup.graph.add_input_arc(1, ids[0], 2).unwrap_err();
        assert!(matches!(error, GraphError::Validation(ValidationError::SlotConflict { slot: 2, .. })));

        setup.graph.set_processing_size(&mut setup.device, Extent::new(64, 64)).unwrap();
        setup.graph.build(&mut setup.device).unwrap();
        let bound = setup.graph.shader(ids[0]).unwrap().bound_resource(2);
        assert_eq!(bound, setup.graph.constant(step).and_then(Buffer::identity));

        setup.graph.write_constant(&mut setup.device, step, bytemuck::bytes_of(&4i32)).unwrap();
        assert_eq!(setup.graph.shader(ids[0]).unwrap().bound_resource(2), bound);

        setup.graph.write_constant(&mut setup.device, step, bytemuck::bytes_of(&[4i32, 0, 0, 0])).unwrap();
        let reallocated = setup.graph.constant(step).and_then(Buffer::identity);
        assert_ne!(reallocated, bound);
        assert_eq!(setup.graph.shader(ids[0]).unwrap().bound_resource(2), reallocated);

        setup.graph.run(&mut setup.device).unwrap();
        assert_eq!(setup.device.dispatches()[0].slots(), vec![0, 1, 2]);
    }

    #[test]
    fn test_cleanup_twice_releases_everything() {
        let mut setup = Setup::new(GraphOptions::default());
        let ids = setup.chain(&["a.wgsl", "b.wgsl", "a.wgsl"]);
        let buffer = Buffer::from_pod(&mut setup.device, &1u32).unwrap();
        let constant = setup.graph.add_constant(buffer);
        setup.graph.bind_constant(&mut setup.device, ids[1], 2, constant).unwrap();
        setup.graph.set_processing_size(&mut setup.device, Extent::new(64, 64)).unwrap();
        setup.graph.build(&mut setup.device).unwrap();
        setup.graph.run(&mut setup.device).unwrap();

        setup.graph.cleanup(&mut setup.device, &mut setup.pool);
        setup.graph.cleanup(&mut setup.device, &mut setup.pool);

        // Only the host images remain
        assert_eq!(setup.device.live_objects(), 2);
        assert!(setup.pool.is_empty());
        assert!(!setup.graph.is_built());
        assert!(ids.iter().all(|&id| !setup.graph.shader(id).unwrap().is_valid()));
        assert!(matches!(setup.graph.run(&mut setup.device), Err(GraphError::Validation(ValidationError::NotBuilt))));
    }

    #[test]
    fn test_cleanup_before_build() {
        let mut setup = Setup::new(GraphOptions::default());
        setup.chain(&["a.wgsl", "b.wgsl"]);

        setup.graph.cleanup(&mut setup.device, &mut setup.pool);

        assert_eq!(setup.device.live_objects(), 2);
        assert!(setup.pool.is_empty());
    }

    #[test]
    fn test_dispatch_failure_propagates() {
        let mut setup = Setup::new(GraphOptions::default());
        setup.chain(&["a.wgsl", "b.wgsl"]);
        setup.graph.set_processing_size(&mut setup.device, Extent::new(64, 64)).unwrap();
        setup.graph.build(&mut setup.device).unwrap();
        setup.device.fail_dispatches();

        let error = setup.graph.run(&mut setup.device).unwrap_err();

        assert!(matches!(error, GraphError::Device(DeviceError::Backend(_))));
        assert!(setup.device.dispatches().is_empty());
    }

    #[test]
    fn test_failed_resize_keeps_previous_size() {
        let mut setup = Setup::new(GraphOptions::default());
        let ids = setup.chain(&["a.wgsl", "b.wgsl", "c.wgsl"]);
        setup.graph.set_processing_size(&mut setup.device, Extent::new(64, 64)).unwrap();
        setup.graph.build(&mut setup.device).unwrap();
        assert_eq!(setup.graph.intermediate_count(), 2);
        let images = setup.device.live_images();
        setup.device.fail_allocations_after(1);

        let error = setup.graph.set_processing_size(&mut setup.device, Extent::new(128, 64)).unwrap_err();

        assert!(matches!(error, GraphError::Device(DeviceError::Backend(_))));
        assert_eq!(setup.graph.processing_size(), Some(Extent::new(64, 64)));
        assert_eq!(setup.device.live_images(), images);
        assert!(!setup.graph.is_poisoned());
        let produced = setup.graph.intermediate_for(ids[0], 1).and_then(Image::identity);
        assert!(produced.is_some());
        assert_eq!(setup.graph.shader(ids[1]).unwrap().bound_resource(0), produced);

        setup.graph.run(&mut setup.device).unwrap();
        assert!(setup.device.dispatches().iter().all(|dispatch| dispatch.workgroups == (8, 8, 1) && dispatch.slots() == vec![0, 1]));
    }

    #[test]
    fn test_failed_rebind_poisons_graph() {
        let mut setup = Setup::new(GraphOptions::default());
        let ids = setup.chain(&["a.wgsl", "b.wgsl"]);
        setup.graph.set_processing_size(&mut setup.device, Extent::new(64, 64)).unwrap();
        setup.graph.build(&mut setup.device).unwrap();
        setup.device.fail_uniform_sets();

        let error = setup.graph.set_processing_size(&mut setup.device, Extent::new(128, 64)).unwrap_err();

        assert!(matches!(error, GraphError::Device(DeviceError::Backend(_))));
        assert!(setup.graph.is_poisoned());
        assert_eq!(setup.graph.shader(ids[1]).unwrap().bound_slots().collect::<Vec<_>>(), vec![1]);
        let error = setup.graph.run(&mut setup.device).unwrap_err();
        assert!(matches!(error, GraphError::Validation(ValidationError::Poisoned)));
        assert!(setup.device.dispatches().is_empty());

        setup.graph.cleanup(&mut setup.device, &mut setup.pool);
        assert!(!setup.graph.is_poisoned());
        assert_eq!(setup.device.live_objects(), 2);
    }

    #[test]
    fn test_failed_input_rebind_poisons_graph() {
        let mut setup = Setup::new(GraphOptions::default());
        setup.chain(&["a.wgsl", "b.wgsl"]);
        setup.graph.set_processing_size(&mut setup.device, Extent::new(64, 64)).unwrap();
        setup.graph.build(&mut setup.device).unwrap();
        let replacement = setup.device.create_image(Extent::new(64, 64)).unwrap();
        setup.device.fail_uniform_sets();

        assert!(setup.graph.bind_input(&mut setup.device, 0, replacement).is_err());

        assert!(matches!(setup.graph.run(&mut setup.device), Err(GraphError::Validation(ValidationError::Poisoned))));
    }

    #[test]
    fn test_failed_constant_reallocation_keeps_binding() {
        let mut setup = Setup::new(GraphOptions::default());
        let ids = setup.chain(&["a.wgsl", "b.wgsl"]);
        let buffer = Buffer::from_pod(&mut setup.device, &2i32).unwrap();
        let step = setup.graph.add_constant(buffer);
        setup.graph.bind_constant(&mut setup.device, ids[0], 2, step).unwrap();
        setup.graph.set_processing_size(&mut setup.device, Extent::new(64, 64)).unwrap();
        setup.graph.build(&mut setup.device).unwrap();
        let bound = setup.graph.shader(ids[0]).unwrap().bound_resource(2);
        setup.device.fail_allocations_after(0);

        let error = setup.graph.write_constant(&mut setup.device, step, &[0u8; 16]).unwrap_err();

        assert!(matches!(error, GraphError::Device(DeviceError::Backend(_))));
        assert!(!setup.graph.is_poisoned());
        assert_eq!(setup.graph.constant(step).and_then(Buffer::identity), bound);
        assert_eq!(setup.graph.shader(ids[0]).unwrap().bound_resource(2), bound);
        setup.graph.run(&mut setup.device).unwrap();
        assert_eq!(setup.device.dispatches()[0].slots(), vec![0, 1, 2]);
    }

    #[test]
    fn test_constants_are_committed_at_build() {
        let mut setup = Setup::new(GraphOptions::default());
        let ids = setup.chain(&["a.wgsl", "b.wgsl"]);
        let buffer = Buffer::from_pod(&mut setup.device, &2i32).unwrap();
        let step = setup.graph.add_constant(buffer);

        setup.graph.bind_constant(&mut setup.device, ids[1], 2, step).unwrap();
        assert_eq!(setup.device.live_uniform_sets(), 0);
        assert_eq!(setup.graph.shader(ids[1]).unwrap().bound_resource(2), None);

        setup.graph.set_processing_size(&mut setup.device, Extent::new(64, 64)).unwrap();
        setup.graph.build(&mut setup.device).unwrap();
        assert_eq!(setup.graph.shader(ids[1]).unwrap().bound_slots().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(setup.graph.shader(ids[1]).unwrap().bound_resource(2), setup.graph.constant(step).and_then(Buffer::identity));
    }

    #[test]
    fn test_unaligned_size_truncates_workgroups() {
        let mut setup = Setup::new(GraphOptions::default());
        setup.chain(&["a.wgsl", "b.wgsl"]);
        setup.graph.set_processing_size(&mut setup.device, Extent::new(70, 15)).unwrap();
        setup.graph.build(&mut setup.device).unwrap();

        setup.graph.run(&mut setup.device).unwrap();

        assert!(setup.device.dispatches().iter().all(|dispatch| dispatch.workgroups == (8, 1, 1)));
    }

    proptest! {
        /// Every consumer reads the image last written by its own producer
        #[test]
        fn reads_never_see_overwritten_images(
            count in 2usize..10,
            edges in prop::collection::vec((0usize..10, 0usize..10), 0..30),
            reuse in any::<bool>(),
        ) {
            let mut setup = Setup::new(GraphOptions { reuse_intermediates: reuse });
            let ids: Vec<ShaderId> = (0..count).map(|i| setup.shader(&format!("pass{i}.wgsl"))).collect();
            setup.graph.add_input_arc(0, ids[0], 1000).unwrap();
            let last = count - 1;
            setup.graph.add_shader_arc(ids[0], 100 + last as u32 % 2, ids[last], 0).unwrap();
            for (a, b) in edges {
                let (a, b) = (a % count, b % count);
                if a < b {
                    setup.graph.add_shader_arc(ids[a], 100 + b as u32 % 2, ids[b], a as u32).unwrap();
                }
            }
            setup.graph.add_output_arc(ids[count - 1], 2000, 0).unwrap();
            setup.bind_host_images();
            setup.graph.set_processing_size(&mut setup.device, Extent::new(64, 64)).unwrap();

            setup.graph.build(&mut setup.device).unwrap();

            let pipeline = setup.graph.pipeline().to_vec();
            let mut last_writer = HashMap::new();
            for &id in &pipeline {
                for arc in setup.graph.shader_arcs().filter(|arc| arc.to == id) {
                    let resource = setup.graph.shader(id).unwrap().bound_resource(arc.to_slot).unwrap();
                    prop_assert_eq!(last_writer.get(&resource), Some(&arc.source()));
                }
                for arc in setup.graph.shader_arcs().filter(|arc| arc.from == id) {
                    let resource = setup.graph.shader(id).unwrap().bound_resource(arc.from_slot).unwrap();
                    last_writer.insert(resource, arc.source());
                }
            }
        }
    }
}
