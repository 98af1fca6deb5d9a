//! Graph Manifest Parser
//!
//! This module parses YAML manifests that describe a compute graph as a list of
//! passes, and instantiates them into a [`Graph`]. Slot sources are written as
//! `"input:N"` for graph inputs or `"<pass-id>.<slot>"` for another pass.

use crate::device::ComputeDevice;
use crate::error::GraphError;
use crate::graph::{Graph, GraphOptions, ShaderId};
use crate::resource::Buffer;
use crate::shader_pool::ShaderPool;
use serde::{Deserialize, Deserializer};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Where a pass input slot reads from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotSource {
    /// A graph input index
    Input(u32),
    /// A slot written by another pass
    Pass { pass: String, slot: u32 },
}

impl FromStr for SlotSource {
    type Err = SlotSourceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(index) = s.strip_prefix("input:") {
            let index = index.parse::<u32>().map_err(|_| SlotSourceParseError::InvalidIndex)?;
            return Ok(SlotSource::Input(index));
        }

        let (pass, slot) = s.rsplit_once('.').ok_or(SlotSourceParseError::InvalidFormat)?;
        if pass.is_empty() {
            return Err(SlotSourceParseError::InvalidFormat);
        }
        let slot = slot.parse::<u32>().map_err(|_| SlotSourceParseError::InvalidIndex)?;
        Ok(SlotSource::Pass { pass: pass.to_string(), slot })
    }
}

impl fmt::Display for SlotSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input(index) => write!(f, "input:{index}"),
            Self::Pass { pass, slot } => write!(f, "{pass}.{slot}"),
        }
    }
}

impl<'de> Deserialize<'de> for SlotSource {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Error types for slot source parsing
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlotSourceParseError {
    /// Neither `input:N` nor `<pass>.<slot>`
    #[error("slot source must be \"input:N\" or \"<pass>.<slot>\"")]
    InvalidFormat,
    #[error("slot source index is not a valid integer")]
    InvalidIndex,
}

/// Binding of a pass slot to its source
#[derive(Debug, Clone, Deserialize)]
pub struct InputBinding {
    pub slot: u32,
    pub from: SlotSource,
}

/// Binding of a pass slot to a graph output
#[derive(Debug, Clone, Deserialize)]
pub struct OutputBinding {
    pub slot: u32,
    pub output: u32,
}

/// Scalar type of constant values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstantType {
    I32,
    U32,
    F32,
}

/// A constant buffer bound to a pass slot
#[derive(Debug, Clone, Deserialize)]
pub struct ConstantSpec {
    pub slot: u32,
    #[serde(rename = "type")]
    pub ty: ConstantType,
    pub values: Vec<f64>,
}

impl ConstantSpec {
    /// Encodes the values as native-endian scalars, zero-padded to a multiple of 16 bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, &'static str> {
        if self.values.is_empty() {
            return Err("no values");
        }

        let mut bytes = Vec::with_capacity(self.values.len() * 4);
        for &value in &self.values {
            if !value.is_finite() {
                return Err("values must be finite");
            }
            match self.ty {
                ConstantType::I32 => {
                    if value.fract() != 0.0 || value < i32::MIN as f64 || value > i32::MAX as f64 {
                        return Err("value is not a valid i32");
                    }
                    bytes.extend_from_slice(bytemuck::bytes_of(&(value as i32)));
                }
                ConstantType::U32 => {
                    if value.fract() != 0.0 || value < 0.0 || value > u32::MAX as f64 {
                        return Err("value is not a valid u32");
                    }
                    bytes.extend_from_slice(bytemuck::bytes_of(&(value as u32)));
                }
                ConstantType::F32 => bytes.extend_from_slice(bytemuck::bytes_of(&(value as f32))),
            }
        }

        bytes.resize(bytes.len().next_multiple_of(16), 0);
        Ok(bytes)
    }
}

/// A single compute pass in the manifest
#[derive(Debug, Clone, Deserialize)]
pub struct PassSpec {
    /// Unique identifier for this pass
    pub id: String,
    /// Shader path resolved by the shader pool
    pub file: String,
    #[serde(default)]
    pub inputs: Vec<InputBinding>,
    #[serde(default)]
    pub outputs: Vec<OutputBinding>,
    #[serde(default)]
    pub constants: Vec<ConstantSpec>,
}

fn default_reuse_intermediates() -> bool {
    true
}

/// A compute graph as described in YAML
#[derive(Debug, Clone, Deserialize)]
pub struct GraphManifest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_reuse_intermediates")]
    pub reuse_intermediates: bool,
    pub passes: Vec<PassSpec>,
}

/// Errors raised while loading or instantiating a manifest
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse manifest")]
    Parse(#[from] serde_norway::Error),
    #[error("manifest and pass ids must not be empty")]
    EmptyId,
    #[error("pass {0:?} is declared more than once")]
    DuplicatePass(String),
    #[error("pass {pass:?} reads from unknown pass {reference:?}")]
    UnknownPass { pass: String, reference: String },
    #[error("constant at slot {slot} of pass {pass:?} is invalid: {reason}")]
    InvalidConstant { pass: String, slot: u32, reason: &'static str },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl GraphManifest {
    /// Parses a manifest from YAML content
    pub fn from_yaml(yaml_content: &str) -> Result<Self, ManifestError> {
        Ok(serde_norway::from_str(yaml_content)?)
    }

    /// Parses a manifest from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Io { path: path.to_path_buf(), source })?;
        Self::from_yaml(&content)
    }

    /// Checks ids, pass references and constant values
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.id.is_empty() {
            return Err(ManifestError::EmptyId);
        }

        let mut ids = HashSet::new();
        for pass in &self.passes {
            if pass.id.is_empty() {
                return Err(ManifestError::EmptyId);
            }
            if !ids.insert(pass.id.as_str()) {
                return Err(ManifestError::DuplicatePass(pass.id.clone()));
            }
        }

        for pass in &self.passes {
            for input in &pass.inputs {
                if let SlotSource::Pass { pass: reference, .. } = &input.from {
                    if !ids.contains(reference.as_str()) {
                        return Err(ManifestError::UnknownPass {
                            pass: pass.id.clone(),
                            reference: reference.clone(),
                        });
                    }
                }
            }

            for constant in &pass.constants {
                constant.to_bytes().map_err(|reason| ManifestError::InvalidConstant {
                    pass: pass.id.clone(),
                    slot: constant.slot,
                    reason,
                })?;
            }
        }

        Ok(())
    }

    /// Builds an unbuilt [`Graph`] with one shader per pass
    ///
    /// Returns the graph together with the shader id of every pass. On failure
    /// every resource created so far is released.
    pub fn instantiate(&self, device: &mut dyn ComputeDevice, pool: &mut ShaderPool) -> Result<(Graph, HashMap<String, ShaderId>), ManifestError> {
        self.validate()?;

        let mut graph = Graph::with_options(GraphOptions {
            reuse_intermediates: self.reuse_intermediates,
        });
        let mut ids = HashMap::new();

        match self.populate(&mut graph, &mut ids, device, pool) {
            Ok(()) => {
                tracing::debug!(manifest = %self.id, passes = ids.len(), "instantiated manifest");
                Ok((graph, ids))
            }
            Err(error) => {
                graph.cleanup(device, pool);
                Err(error)
            }
        }
    }

    fn populate(&self, graph: &mut Graph, ids: &mut HashMap<String, ShaderId>, device: &mut dyn ComputeDevice, pool: &mut ShaderPool) -> Result<(), ManifestError> {
        for pass in &self.passes {
            let shader = graph.create_shader(device, pool, &pass.file)?;
            ids.insert(pass.id.clone(), shader);
        }

        for pass in &self.passes {
            let shader = ids[&pass.id];

            for input in &pass.inputs {
                match &input.from {
                    SlotSource::Input(index) => graph.add_input_arc(*index, shader, input.slot)?,
                    SlotSource::Pass { pass: producer, slot } => {
                        let producer = ids.get(producer).copied().ok_or_else(|| ManifestError::UnknownPass {
                            pass: pass.id.clone(),
                            reference: producer.clone(),
                        })?;
                        graph.add_shader_arc(producer, *slot, shader, input.slot)?;
                    }
                }
            }

            for output in &pass.outputs {
                graph.add_output_arc(shader, output.slot, output.output)?;
            }

            for constant in &pass.constants {
                let bytes = constant.to_bytes().map_err(|reason| ManifestError::InvalidConstant {
                    pass: pass.id.clone(),
                    slot: constant.slot,
                    reason,
                })?;
                let buffer = Buffer::new(device, &bytes).map_err(GraphError::from)?;
                let id = graph.add_constant(buffer);
                graph.bind_constant(device, shader, constant.slot, id)?;
            }
        }

        Ok(())
    }
}
