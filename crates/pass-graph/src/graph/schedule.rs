//! Linearization of the shader DAG into a single dispatch order

use super::{ArcSet, ShaderId};
use std::collections::HashSet;

/// Orders every shader that takes part in an arc so that producers run before their consumers
///
/// Traversal starts from the shaders fed by graph inputs, followed by any other
/// shader without producers. A shader is placed once all of its producers are
/// placed, directly after the latest of them; shaders without producers are
/// appended.
///
/// # Arguments
/// * `arcs` - Arcs of an acyclic graph
///
/// # Returns
/// Every shader named by an arc, each exactly once, in dispatch order
pub fn linearize(arcs: &ArcSet) -> Vec<ShaderId> {
    let dependencies = arcs.dependencies();
    let participants = arcs.shader_ids();

    let mut seeds: Vec<ShaderId> = Vec::new();
    for shader in arcs.input_arcs().map(|arc| arc.shader).chain(participants.iter().copied().filter(|shader| !dependencies.contains_key(shader))) {
        if !seeds.contains(&shader) {
            seeds.push(shader);
        }
    }

    let mut pipeline: Vec<ShaderId> = Vec::with_capacity(participants.len());
    let mut placed = HashSet::new();
    let mut to_visit: Vec<ShaderId> = seeds.into_iter().rev().collect();

    while let Some(shader) = to_visit.pop() {
        if placed.contains(&shader) {
            continue;
        }

        let producers = dependencies.get(&shader).map_or(&[][..], Vec::as_slice);
        // Revisited when its last producer is placed
        if producers.iter().any(|producer| !placed.contains(producer)) {
            continue;
        }

        let latest = producers.iter().filter_map(|producer| pipeline.iter().position(|placed| placed == producer)).max();
        match latest {
            Some(position) => pipeline.insert(position + 1, shader),
            None => pipeline.push(shader),
        }
        placed.insert(shader);

        for arc in arcs.dependents(shader).iter().rev() {
            if !placed.contains(&arc.to) {
                to_visit.push(arc.to);
            }
        }
    }

    pipeline
}
