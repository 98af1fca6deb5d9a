//! Intermediate image allocation and lifetime management
//!
//! Every producer slot that feeds other shaders needs an intermediate image.
//! Once the pipeline order is fixed, each producer slot is live from the pass
//! that writes it to the last pass that reads it, and producer slots whose
//! lifetimes do not overlap can share one physical image.

use super::{ArcSet, ShaderId, SlotRef};
use std::collections::HashMap;

/// Lifetime of one producer slot in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLifetime {
    pub slot: SlotRef,
    /// Pipeline position of the producing shader
    pub created_at: usize,
    /// Pipeline position of the last consuming shader
    pub last_used_at: usize,
}

/// Computes the lifetime of every producer slot, ordered by creation
///
/// # Arguments
/// * `pipeline` - Shaders in dispatch order
/// * `arcs` - Shader arcs between them
///
/// # Returns
/// One lifetime per producer slot that feeds at least one shader arc
pub fn collect_lifetimes(pipeline: &[ShaderId], arcs: &ArcSet) -> Vec<SlotLifetime> {
    let positions: HashMap<ShaderId, usize> = pipeline.iter().enumerate().map(|(position, &shader)| (shader, position)).collect();
    let mut lifetimes: Vec<SlotLifetime> = Vec::new();

    for (created_at, &shader) in pipeline.iter().enumerate() {
        let first = lifetimes.len();
        for arc in arcs.dependents(shader) {
            let Some(&used_at) = positions.get(&arc.to) else {
                continue;
            };

            match lifetimes[first..].iter_mut().find(|lifetime| lifetime.slot == arc.source()) {
                Some(lifetime) => lifetime.last_used_at = lifetime.last_used_at.max(used_at),
                None => lifetimes.push(SlotLifetime {
                    slot: arc.source(),
                    created_at,
                    last_used_at: used_at,
                }),
            }
        }
        lifetimes[first..].sort_by_key(|lifetime| lifetime.slot.slot);
    }

    lifetimes
}

/// Assigns physical images to producer slots
///
/// With `reuse` enabled a physical image is handed to a later producer slot
/// once every reader of its previous slot has run.
///
/// # Arguments
/// * `lifetimes` - Producer slot lifetimes, ordered by creation
/// * `reuse` - Whether an image may be handed to a later slot
///
/// # Returns
/// The number of physical images and the image index of each producer slot
pub fn assign_intermediates(lifetimes: &[SlotLifetime], reuse: bool) -> (usize, HashMap<SlotRef, usize>) {
    let mut assignments = HashMap::new();
    let mut physical_slots: Vec<SlotLifetime> = Vec::new();

    for lifetime in lifetimes {
        let reusable = reuse.then(|| physical_slots.iter().position(|existing| existing.last_used_at < lifetime.created_at)).flatten();

        let index = match reusable {
            Some(index) => {
                physical_slots[index] = *lifetime;
                index
            }
            None => {
                physical_slots.push(*lifetime);
                physical_slots.len() - 1
            }
        };

        assignments.insert(lifetime.slot, index);
    }

    (physical_slots.len(), assignments)
}
