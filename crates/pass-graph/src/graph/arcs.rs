//! Arc storage and insertion-time validation
//!
//! Shader-to-shader arcs are checked for cycles as they are inserted, so the
//! stored arcs always form a DAG. Every (shader, slot) pair has a single role:
//! it is either read from (one input or shader arc) or written to (any number
//! of shader arcs, or exactly one output arc).

use super::{ShaderId, SlotRef};
use crate::error::{CycleError, GraphError, ValidationError};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

/// A graph input feeding a shader slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputArc {
    /// Index of the graph input
    pub input: u32,
    /// Shader reading the input
    pub shader: ShaderId,
    /// Slot the input is bound to
    pub slot: u32,
}

/// A shader slot feeding another shader's slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderArc {
    /// Producing shader
    pub from: ShaderId,
    /// Slot the producer writes into
    pub from_slot: u32,
    /// Consuming shader
    pub to: ShaderId,
    /// Slot the consumer reads from
    pub to_slot: u32,
}

impl ShaderArc {
    /// The producer slot, which keys the intermediate image
    pub fn source(&self) -> SlotRef {
        SlotRef::new(self.from, self.from_slot)
    }

    pub fn target(&self) -> SlotRef {
        SlotRef::new(self.to, self.to_slot)
    }
}

/// A shader slot writing into a graph output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputArc {
    /// Shader writing the output
    pub shader: ShaderId,
    /// Slot the output is bound to
    pub slot: u32,
    /// Index of the graph output
    pub output: u32,
}

/// The three kinds of arcs a graph stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArcKind {
    Input,
    Shader,
    Output,
}

impl fmt::Display for ArcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Shader => write!(f, "shader"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// Arcs keyed by input index, producing shader and output index
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ArcSet {
    inputs: BTreeMap<u32, Vec<InputArc>>,
    shaders: BTreeMap<ShaderId, Vec<ShaderArc>>,
    outputs: BTreeMap<u32, Vec<OutputArc>>,
}

impl ArcSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input_arc(&mut self, arc: InputArc) -> Result<(), GraphError> {
        if self.input_arcs().any(|existing| *existing == arc) {
            return Ok(());
        }

        let target = SlotRef::new(arc.shader, arc.slot);
        if self.is_read(target) || self.is_written(target) {
            return Err(conflict(target));
        }

        self.inputs.entry(arc.input).or_default().push(arc);
        Ok(())
    }

    /// Adds a shader-to-shader arc, rejecting it if it would close a cycle
    ///
    /// A rejected arc leaves the set exactly as it was.
    pub fn add_shader_arc(&mut self, arc: ShaderArc) -> Result<(), GraphError> {
        if self.shader_arcs().any(|existing| *existing == arc) {
            return Ok(());
        }

        let (source, target) = (arc.source(), arc.target());
        if self.is_read(source) || self.has_output(source) {
            return Err(conflict(source));
        }
        if self.is_read(target) || self.is_written(target) {
            return Err(conflict(target));
        }

        // The new arc closes a cycle exactly when its source is reachable from its destination
        if self.reaches(arc.to, arc.from) {
            return Err(CycleError { from: arc.from, to: arc.to }.into());
        }

        self.shaders.entry(arc.from).or_default().push(arc);
        Ok(())
    }

    pub fn add_output_arc(&mut self, arc: OutputArc) -> Result<(), GraphError> {
        if self.output_arcs().any(|existing| *existing == arc) {
            return Ok(());
        }

        let source = SlotRef::new(arc.shader, arc.slot);
        if self.is_read(source) || self.is_written(source) {
            return Err(conflict(source));
        }

        self.outputs.entry(arc.output).or_default().push(arc);
        Ok(())
    }

    /// Depth-first search along shader arcs
    fn reaches(&self, start: ShaderId, goal: ShaderId) -> bool {
        let mut to_visit = vec![start];
        let mut visited = HashSet::new();

        while let Some(shader) = to_visit.pop() {
            if shader == goal {
                return true;
            }
            if !visited.insert(shader) {
                continue;
            }
            to_visit.extend(self.dependents(shader).iter().map(|arc| arc.to));
        }

        false
    }

    /// Returns true if an input or shader arc reads into `slot`
    pub fn is_read(&self, slot: SlotRef) -> bool {
        self.input_arcs().any(|arc| arc.shader == slot.shader && arc.slot == slot.slot) || self.shader_arcs().any(|arc| arc.target() == slot)
    }

    /// Returns true if a shader or output arc writes from `slot`
    pub fn is_written(&self, slot: SlotRef) -> bool {
        self.dependents(slot.shader).iter().any(|arc| arc.from_slot == slot.slot) || self.has_output(slot)
    }

    fn has_output(&self, slot: SlotRef) -> bool {
        self.output_arcs().any(|arc| arc.shader == slot.shader && arc.slot == slot.slot)
    }

    /// Returns true if any arc touches `slot`
    pub fn uses_slot(&self, slot: SlotRef) -> bool {
        self.is_read(slot) || self.is_written(slot)
    }

    pub fn input_arcs(&self) -> impl Iterator<Item = &InputArc> {
        self.inputs.values().flatten()
    }

    pub fn shader_arcs(&self) -> impl Iterator<Item = &ShaderArc> {
        self.shaders.values().flatten()
    }

    pub fn output_arcs(&self) -> impl Iterator<Item = &OutputArc> {
        self.outputs.values().flatten()
    }

    /// Arcs fed by graph input `input`
    pub fn arcs_from_input(&self, input: u32) -> &[InputArc] {
        self.inputs.get(&input).map_or(&[], Vec::as_slice)
    }

    /// Arcs writing into graph output `output`
    pub fn arcs_to_output(&self, output: u32) -> &[OutputArc] {
        self.outputs.get(&output).map_or(&[], Vec::as_slice)
    }

    /// Shader arcs leaving `shader`, in declaration order
    pub fn dependents(&self, shader: ShaderId) -> &[ShaderArc] {
        self.shaders.get(&shader).map_or(&[], Vec::as_slice)
    }

    /// For each shader, the distinct shaders it reads from
    pub fn dependencies(&self) -> HashMap<ShaderId, Vec<ShaderId>> {
        let mut result: HashMap<ShaderId, Vec<ShaderId>> = HashMap::new();
        for arc in self.shader_arcs() {
            let producers = result.entry(arc.to).or_default();
            if !producers.contains(&arc.from) {
                producers.push(arc.from);
            }
        }
        result
    }

    /// Graph input indices referenced by arcs
    pub fn input_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.inputs.keys().copied()
    }

    /// Graph output indices referenced by arcs
    pub fn output_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.outputs.keys().copied()
    }

    /// Every shader that takes part in at least one arc
    pub fn shader_ids(&self) -> BTreeSet<ShaderId> {
        let mut result = BTreeSet::new();
        result.extend(self.input_arcs().map(|arc| arc.shader));
        for arc in self.shader_arcs() {
            result.insert(arc.from);
            result.insert(arc.to);
        }
        result.extend(self.output_arcs().map(|arc| arc.shader));
        result
    }

    pub fn is_empty(&self, kind: ArcKind) -> bool {
        match kind {
            ArcKind::Input => self.inputs.is_empty(),
            ArcKind::Shader => self.shaders.is_empty(),
            ArcKind::Output => self.outputs.is_empty(),
        }
    }
}

fn conflict(slot: SlotRef) -> GraphError {
    ValidationError::SlotConflict { shader: slot.shader, slot: slot.slot }.into()
}
