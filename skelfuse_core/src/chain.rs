// skelfuse_core/src/chain.rs
//
// Chain accessor: treats a contiguous ancestor run starting at a node as one
// joint Gaussian vector, gathering and scattering per-node parameter blocks
// at their offsets. All walks share the same stopping rule: a chain never
// extends past the root, matching how the required chain length is counted.

use crate::measurement::Measurement;
use crate::node::Node;
use crate::parameters::Parameters;
use crate::types::Transform3D;
use nalgebra::{DMatrix, DVector};

/// Selects which per-node field a chain gather traverses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainParameter {
    State,
    Constraints,
    ProcessNoise,
}

/// Arena indices of the chain: the start node first, then ancestors in
/// order, stopping early at the root.
pub(crate) fn chain_indices(nodes: &[Node], start: usize, chain_length: usize) -> Vec<usize> {
    let mut out = Vec::with_capacity(chain_length.max(1));
    let mut idx = start;
    out.push(idx);
    while out.len() < chain_length {
        match nodes[idx].parent {
            Some(p) => {
                out.push(p);
                idx = p;
            }
            None => break,
        }
    }
    out
}

/// Concatenates the selected per-node parameter blocks over the chain into
/// one joint Gaussian (block-diagonal covariance).
pub(crate) fn gather(
    nodes: &[Node],
    start: usize,
    chain_length: usize,
    selector: ChainParameter,
) -> Parameters {
    let indices = chain_indices(nodes, start, chain_length);
    let dimension: usize = indices.iter().map(|&i| nodes[i].dimension()).sum();
    let mut out = Parameters {
        expectation: DVector::zeros(dimension),
        variance: DMatrix::zeros(dimension, dimension),
    };
    let mut offset = 0;
    for &i in &indices {
        let block = match selector {
            ChainParameter::State => nodes[i].state(),
            ChainParameter::Constraints => nodes[i].constraints(),
            ChainParameter::ProcessNoise => nodes[i].process_noise(),
        };
        out.insert_substate(offset, &block);
        offset += block.size();
    }
    out
}

/// Distributes a fused joint state back over the chain's per-node blocks.
/// Cross-covariance between nodes is dropped; nodes store marginals only.
pub(crate) fn scatter_state(
    nodes: &mut [Node],
    start: usize,
    chain_length: usize,
    state: &Parameters,
) {
    let indices = chain_indices(nodes, start, chain_length);
    let mut offset = 0;
    for &i in &indices {
        let size = nodes[i].dimension();
        nodes[i].set_state(&state.substate(offset, size));
        offset += size;
    }
    debug_assert_eq!(offset, state.size());
}

/// Walks ancestors accumulating positional/rotational DoF until the
/// measurement's requirement is met or the root is reached. Returns the
/// node count visited (>= 1) and whether the requirement was satisfied.
///
/// The accounting is a greedy heuristic: DoF from different nodes is assumed
/// additive and decoupled, which overstates the flexibility of near-parallel
/// axes but keeps chain selection cheap and deterministic.
pub(crate) fn required_chain_length(
    nodes: &[Node],
    start: usize,
    m: &Measurement,
) -> (usize, bool) {
    let p_req = m.required_pdof();
    let r_req = m.required_rdof();

    let mut count = 1;
    let mut p_dof = 0;
    let mut r_dof = 0;
    let mut has_lever_child = false;
    let mut idx = start;
    loop {
        let node = &nodes[idx];
        p_dof += node.p_dof(has_lever_child);
        r_dof += node.r_dof();

        if !has_lever_child {
            // A non-trivial translation below this point acts as a lever,
            // converting ancestors' rotational freedom into position change.
            has_lever_child = crate::math::translation_part(&node.local_pose()).norm() > 0.01;
        }

        let satisfied = p_dof >= p_req && r_dof >= r_req;
        match (satisfied, node.parent) {
            (true, _) | (false, None) => return (count, satisfied),
            (false, Some(p)) => {
                idx = p;
                count += 1;
            }
        }
    }
}

/// Pose of `idx` in the reference frame: composition of local poses up to
/// the root. Only each node's own local pose is cached.
pub(crate) fn global_pose(nodes: &[Node], idx: usize) -> Transform3D {
    let mut pose = nodes[idx].local_pose();
    let mut current = nodes[idx].parent;
    while let Some(p) = current {
        pose = nodes[p].local_pose() * pose;
        current = nodes[p].parent;
    }
    pose
}
