// skelfuse_core/src/fusion.rs
//
// Information-form Bayesian fusion of one measurement into a parent chain.
// The chain prior, the stiffness-weighted constraint prior, and the
// measurement likelihood (linearized once through the complex-step Jacobian)
// are combined additively as information matrices:
//
//   Sigma_new^-1 = J^T Sigma_M^-1 J + (1/n)(Sigma_P^-1 + s * Sigma_C^-1)
//   x_new = Sigma_new [J^T Sigma_M^-1 wp + (1/n)(Sigma_P^-1 x_P + s * Sigma_C^-1 x_C)]
//
// One Gauss-Newton-like step per measurement, not iterated to convergence.
// Every failure here is local: a bad measurement or singular matrix skips
// the update (marking the node invalid where the state itself is at fault)
// and never poisons the rest of the pass.

use crate::chain::{self, ChainParameter};
use crate::jacobian;
use crate::math;
use crate::measurement::{Measurement, MeasurementKind};
use crate::node::Node;
use crate::parameters::Parameters;
use crate::types::Transform3D;
use nalgebra::{DMatrix, DVector, Matrix3, UnitQuaternion};
use tracing::{debug, warn};

/// Fuses one calibrated measurement into the belief of `start` and, when the
/// node alone lacks the degrees of freedom, its ancestors. `to_fusion_space`
/// maps the measurement's source system into the tree's reference system.
pub(crate) fn fuse_measurement(
    nodes: &mut [Node],
    start: usize,
    m: &Measurement,
    to_fusion_space: &Transform3D,
) {
    let calibrated = m.transformed(to_fusion_space);
    // A node-local observation is relative to the parent segment; composing
    // the parent's global pose promotes it into the reference frame, after
    // which the chain update is identical.
    let global = if calibrated.global_space {
        calibrated
    } else {
        let parent_pose = match nodes[start].parent {
            Some(p) => chain::global_pose(nodes, p),
            None => Transform3D::identity(),
        };
        let mut g = calibrated.transformed(&parent_pose);
        g.global_space = true;
        g
    };

    match global.kind {
        MeasurementKind::Scale { .. } => fuse_scale(nodes, start, &global),
        _ => fuse_chain(nodes, start, &global),
    }
}

/// Shared chain update for position, rotation and rigid measurements; the
/// kinds differ only in which rows of the 6xN pose Jacobian they observe and
/// in the residual/covariance assembled from the measurement.
fn fuse_chain(nodes: &mut [Node], start: usize, m: &Measurement) {
    let (chain_len, satisfied) = chain::required_chain_length(nodes, start, m);
    if !satisfied {
        debug!(
            node = %nodes[start].desc,
            chain = chain_len,
            "measurement under-determined even at the root; fusing with degraded confidence"
        );
    }

    let jac6 = jacobian::pose_chain_jacobian(nodes, start, chain_len);
    if jac6.ncols() == 0 {
        debug!(node = %nodes[start].desc, "chain has no free parameters; measurement dropped");
        return;
    }

    // Target vector and covariance in the observed subspace of (w, p).
    let (row_offset, rows, target, sigma_m) = match &m.kind {
        MeasurementKind::Position { position, variance } => (
            3,
            3,
            DVector::from_column_slice(position.as_slice()),
            DMatrix::from_column_slice(3, 3, variance.as_slice()),
        ),
        MeasurementKind::Rotation { rotation, variance } => (
            0,
            3,
            DVector::from_column_slice(rotation.scaled_axis().as_slice()),
            DMatrix::from_column_slice(3, 3, axis_angle_covariance(rotation, variance).as_slice()),
        ),
        MeasurementKind::Rigid {
            position,
            rotation,
            position_variance,
            rotation_variance,
        } => {
            let mut wp = DVector::zeros(6);
            wp.rows_mut(0, 3).copy_from(&rotation.scaled_axis());
            wp.rows_mut(3, 3).copy_from(position);
            let mut cov = DMatrix::zeros(6, 6);
            cov.view_mut((0, 0), (3, 3))
                .copy_from(&axis_angle_covariance(rotation, rotation_variance));
            cov.view_mut((3, 3), (3, 3)).copy_from(position_variance);
            (0, 6, wp, cov)
        }
        MeasurementKind::Scale { .. } => unreachable!("scale handled separately"),
    };
    let jac = jac6.rows(row_offset, rows).into_owned();

    let Some(mut sigma_m_inv) = math::invert_information(&sigma_m) else {
        warn!(node = %nodes[start].desc, "singular measurement covariance; measurement dropped");
        return;
    };
    sigma_m_inv *= m.confidence;

    let mut prior = chain::gather(nodes, start, chain_len, ChainParameter::State);
    inflate_with_process_noise(nodes, start, chain_len, m.timestamp, &mut prior);
    let constraints = chain::gather(nodes, start, chain_len, ChainParameter::Constraints);
    let stiffness = nodes[start].joint_stiffness;

    let Some(sigma_p_inv) = math::invert_information(&prior.variance) else {
        warn!(node = %nodes[start].desc, "singular chain prior; node marked invalid");
        nodes[start].mark_invalid();
        return;
    };
    let Some(sigma_c_inv) = math::invert_information(&constraints.variance) else {
        warn!(node = %nodes[start].desc, "singular constraint covariance; node marked invalid");
        nodes[start].mark_invalid();
        return;
    };

    // Averaging the prior/constraint information over the chain length keeps
    // repeated deep-chain fusions from double-counting shared ancestors.
    let k = 1.0 / chain_len as f64;
    let info = jac.transpose() * &sigma_m_inv * &jac + (&sigma_p_inv + &sigma_c_inv * stiffness) * k;
    let Some(mut new_variance) = math::invert_information(&info) else {
        warn!(node = %nodes[start].desc, "fused information not invertible; node marked invalid");
        nodes[start].mark_invalid();
        return;
    };
    math::symmetrize(&mut new_variance);

    let info_vector = jac.transpose() * &sigma_m_inv * &target
        + (&sigma_p_inv * &prior.expectation + stiffness * (&sigma_c_inv * &constraints.expectation))
            * k;
    let new_expectation = &new_variance * info_vector;

    let new_state = Parameters {
        expectation: new_expectation,
        variance: new_variance,
    };
    if !new_state.is_finite() {
        warn!(node = %nodes[start].desc, "fusion produced non-finite state; node marked invalid");
        nodes[start].mark_invalid();
        return;
    }

    chain::scatter_state(nodes, start, chain_len, &new_state);
    stamp_chain(nodes, start, chain_len, m.timestamp);
}

/// Scale observations target the node's own scale articulation; ancestors
/// cannot explain them, so the update is a direct information-form fusion of
/// that one parameter block (identity observation Jacobian).
fn fuse_scale(nodes: &mut [Node], start: usize, m: &Measurement) {
    let MeasurementKind::Scale { scale, variance } = &m.kind else {
        return;
    };
    let Some((art_index, offset)) = nodes[start].scale_block() else {
        debug!(node = %nodes[start].desc, "scale measurement on a node without a scale articulation");
        return;
    };

    let node = &nodes[start];
    let dt = (m.timestamp - node.local_state.last_update_time).max(0.0);
    let prior = &node.local_state.articulation[art_index];
    let constraint = &node.local_state.constraints[art_index];
    let prior_variance =
        &prior.variance + &node.local_state.process_noise[art_index].variance * dt;
    let stiffness = node.joint_stiffness;

    let z = DVector::from_column_slice(scale.as_slice());
    let sigma_m = DMatrix::from_column_slice(3, 3, variance.as_slice());
    let Some(mut sigma_m_inv) = math::invert_information(&sigma_m) else {
        warn!(node = %node.desc, "singular scale covariance; measurement dropped");
        return;
    };
    sigma_m_inv *= m.confidence;
    let (Some(sigma_p_inv), Some(sigma_c_inv)) = (
        math::invert_information(&prior_variance),
        math::invert_information(&constraint.variance),
    ) else {
        warn!(node = %node.desc, "singular scale prior; node marked invalid");
        nodes[start].mark_invalid();
        return;
    };

    let info = &sigma_m_inv + &sigma_p_inv + &sigma_c_inv * stiffness;
    let Some(mut new_variance) = math::invert_information(&info) else {
        nodes[start].mark_invalid();
        return;
    };
    math::symmetrize(&mut new_variance);
    let new_expectation = &new_variance
        * (&sigma_m_inv * z
            + &sigma_p_inv * &prior.expectation
            + stiffness * (&sigma_c_inv * &constraint.expectation));

    let mut full = nodes[start].state();
    full.insert_substate(
        offset,
        &Parameters {
            expectation: new_expectation,
            variance: new_variance,
        },
    );
    nodes[start].set_state(&full);
    nodes[start].local_state.last_update_time = m.timestamp;
}

/// Maps a quaternion covariance (w, x, y, z) into axis-angle space through
/// the quaternion-to-axis-angle Jacobian.
fn axis_angle_covariance(
    rotation: &UnitQuaternion<f64>,
    variance: &nalgebra::Matrix4<f64>,
) -> Matrix3<f64> {
    let j = math::quat_to_axis_angle_jacobian(rotation);
    j * variance * j.transpose()
}

/// Adds each chain node's per-second process noise, scaled by the time since
/// that node last updated, to its block of the chain prior covariance.
fn inflate_with_process_noise(
    nodes: &[Node],
    start: usize,
    chain_len: usize,
    timestamp: f64,
    prior: &mut Parameters,
) {
    let noise = chain::gather(nodes, start, chain_len, ChainParameter::ProcessNoise);
    let mut offset = 0;
    for i in chain::chain_indices(nodes, start, chain_len) {
        let dim = nodes[i].dimension();
        let dt = (timestamp - nodes[i].local_state.last_update_time).max(0.0);
        if dt > 0.0 && dim > 0 {
            let mut block = prior.variance.view_mut((offset, offset), (dim, dim));
            block += noise.variance.view((offset, offset), (dim, dim)) * dt;
        }
        offset += dim;
    }
}

fn stamp_chain(nodes: &mut [Node], start: usize, chain_len: usize, timestamp: f64) {
    for i in chain::chain_indices(nodes, start, chain_len) {
        nodes[i].local_state.last_update_time = timestamp;
    }
}
