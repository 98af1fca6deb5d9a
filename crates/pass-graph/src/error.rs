//! Graph error types

use crate::device::DeviceError;
use crate::graph::{ArcKind, ConstantId, ShaderId};

/// Errors returned by [`Graph`](crate::Graph) operations
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Cycle(#[from] CycleError),
    /// Propagated unmodified from the compute device
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// The graph was used in a way its topology or lifecycle does not allow
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The shader does not belong to this graph or has been cleaned up
    #[error("shader {0:?} is not a live shader of this graph")]
    InvalidShader(ShaderId),
    #[error("constant {0:?} is not registered in this graph")]
    UnknownConstant(ConstantId),
    #[error("processing size has not been set")]
    ProcessingSizeUnset,
    #[error("processing size {width}x{height} must be positive in both dimensions")]
    NonPositiveProcessingSize { width: u32, height: u32 },
    #[error("graph has already been built")]
    AlreadyBuilt,
    /// Arcs can only be declared before the graph is built
    #[error("graph topology cannot change once built")]
    TopologyFrozen,
    #[error("graph has not been built")]
    NotBuilt,
    #[error("graph needs at least one {0} arc to be built")]
    MissingArcs(ArcKind),
    #[error("graph input {0} is used by an arc but has no bound image")]
    UnboundInput(u32),
    #[error("graph output {0} is used by an arc but has no bound image")]
    UnboundOutput(u32),
    /// The slot is already read from, written to, or bound to a constant in an incompatible way
    #[error("slot {slot} of shader {shader:?} conflicts with an existing binding")]
    SlotConflict { shader: ShaderId, slot: u32 },
    /// A device call failed after slots were unbound; the graph must be cleaned up
    #[error("graph lost slot bindings to a failed device call and must be cleaned up")]
    Poisoned,
}

/// Adding the arc would have closed a cycle between shaders
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("arc from shader {from:?} to shader {to:?} would create a cycle")]
pub struct CycleError {
    pub from: ShaderId,
    pub to: ShaderId,
}
