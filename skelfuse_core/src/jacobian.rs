// skelfuse_core/src/jacobian.rs
//
// 6xN sensitivity of a chain's end-effector pose (angle*axis, position) to
// the chain's N parameters, by complex-step differentiation: each column is
// Im(f(x + i*h*e_j)) / h. The step can be taken far below sqrt(machine-eps)
// because no subtraction of nearby values occurs; truncation error is O(h^2).

use crate::chain;
use crate::math;
use crate::node::Node;
use crate::types::Transform3Dc;
use nalgebra::DMatrix;

/// Complex perturbation magnitude. Small enough that the imaginary channel
/// carries the pure derivative; f64 holds it without underflow.
pub(crate) const COMPLEX_STEP: f64 = 1e-20;

/// Jacobian of the chain end-effector pose in the reference frame. Columns
/// are ordered like the chain state vector: the start node's parameters
/// first, then each ancestor's in walk order.
pub(crate) fn pose_chain_jacobian(nodes: &[Node], start: usize, chain_length: usize) -> DMatrix<f64> {
    let indices = chain::chain_indices(nodes, start, chain_length);
    let input_dimension: usize = indices.iter().map(|&i| nodes[i].dimension()).sum();
    let mut jac = DMatrix::zeros(6, input_dimension);

    let h = COMPLEX_STEP;
    // Product of the locals of already-visited (descendant) chain nodes.
    let mut child_poses = Transform3Dc::identity();
    let mut column = 0;
    for &i in &indices {
        // Ancestors above the current node contribute a constant transform;
        // including the full run to the root keeps every column expressed in
        // the reference frame the measurement lives in.
        let prefix = match nodes[i].parent {
            Some(p) => math::complexify(&chain::global_pose(nodes, p)),
            None => Transform3Dc::identity(),
        };
        for j in 0..nodes[i].dimension() {
            let pose = prefix * nodes[i].local_pose_complex_step(j, h) * child_poses;
            let wp = math::to_axis_angle_pos(&pose);
            for row in 0..6 {
                jac[(row, column)] = wp[row].im / h;
            }
            column += 1;
        }
        child_poses = math::complexify(&nodes[i].local_pose()) * child_poses;
    }
    jac
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::articulation::Articulation;
    use crate::parameters::Parameters;
    use crate::types::{NodeDescriptor, Transform3D};
    use approx::assert_abs_diff_eq;
    use nalgebra::{DMatrix, DVector, Matrix4, Vector3, Vector6};

    #[test]
    fn single_axial_column_is_the_rotation_axis() {
        let axis = Vector3::new(0.0, 0.0, 1.0);
        let mut n = Node::new(NodeDescriptor::from("joint"), None);
        n.set_model(vec![Articulation::Axial { axis }]);
        for theta in [0.0, 0.3, -1.2] {
            let state =
                Parameters::new(DVector::from_row_slice(&[theta]), DMatrix::identity(1, 1)).unwrap();
            n.set_state(&state);
            let nodes = vec![n.clone()];
            let jac = pose_chain_jacobian(&nodes, 0, 1);
            assert_eq!(jac.shape(), (6, 1));
            let col = Vector6::from_column_slice(jac.column(0).as_slice());
            assert_abs_diff_eq!(col.fixed_rows::<3>(0).into_owned(), axis, epsilon = 1e-10);
            assert_abs_diff_eq!(
                col.fixed_rows::<3>(3).into_owned(),
                Vector3::zeros(),
                epsilon = 1e-10
            );
        }
    }

    /// Full-chain check against central finite differences of the same
    /// (angle*axis, position) map evaluated through real arithmetic.
    #[test]
    fn matches_finite_differences_on_a_chain() {
        // shoulder(axial z) <- elbow(axial x, with a bone lever).
        let mut shoulder = Node::new(NodeDescriptor::from("shoulder"), None);
        shoulder.set_model(vec![Articulation::Axial { axis: Vector3::z() }]);
        shoulder
            .set_state(&Parameters::new(DVector::from_row_slice(&[0.4]), DMatrix::identity(1, 1)).unwrap());

        let mut elbow = Node::new(
            NodeDescriptor::from("elbow"),
            Some(NodeDescriptor::from("shoulder")),
        );
        elbow.set_model(vec![Articulation::Axial { axis: Vector3::x() }]);
        elbow.home_pose = Matrix4::identity().append_translation(&Vector3::new(0.0, 1.0, 0.0));
        elbow.parent = Some(0);
        elbow
            .set_state(&Parameters::new(DVector::from_row_slice(&[-0.7]), DMatrix::identity(1, 1)).unwrap());

        let nodes = vec![shoulder, elbow];
        let jac = pose_chain_jacobian(&nodes, 1, 2);
        assert_eq!(jac.shape(), (6, 2));

        let eval = |thetas: [f64; 2]| -> Vector6<f64> {
            let shoulder_pose = nodes[0].local_pose_at(&DVector::from_row_slice(&[thetas[1]]));
            let elbow_pose = nodes[1].local_pose_at(&DVector::from_row_slice(&[thetas[0]]));
            let full: Transform3D = shoulder_pose * elbow_pose;
            math::to_axis_angle_pos(&full)
        };
        let x0 = [-0.7, 0.4]; // chain order: start node first
        let eps = 1e-6;
        for col in 0..2 {
            let mut plus = x0;
            let mut minus = x0;
            plus[col] += eps;
            minus[col] -= eps;
            let numeric = (eval(plus) - eval(minus)) / (2.0 * eps);
            let analytic = Vector6::from_column_slice(jac.column(col).as_slice());
            assert_abs_diff_eq!(analytic, numeric, epsilon = 1e-5);
        }
    }

    #[test]
    fn fixed_nodes_contribute_no_columns() {
        let mut anchor = Node::new(NodeDescriptor::from("anchor"), None);
        anchor.set_model(Vec::new());
        anchor.home_pose = Matrix4::identity().append_translation(&Vector3::new(0.0, 0.0, 1.0));
        let mut joint = Node::new(
            NodeDescriptor::from("joint"),
            Some(NodeDescriptor::from("anchor")),
        );
        joint.set_model(vec![Articulation::Axial { axis: Vector3::y() }]);
        joint.parent = Some(0);
        let nodes = vec![anchor, joint];
        let jac = pose_chain_jacobian(&nodes, 1, 2);
        assert_eq!(jac.shape(), (6, 1));
    }
}
