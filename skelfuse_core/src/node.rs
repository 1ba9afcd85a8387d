// skelfuse_core/src/node.rs

use crate::articulation::{quat_block_valid, Articulation};
use crate::math;
use crate::measurement::Measurement;
use crate::parameters::Parameters;
use crate::types::{NodeDescriptor, Transform3D, Transform3Dc};
use nalgebra::{Complex, DMatrix, DVector};

/// Belief state of one node: one Gaussian block per articulation, plus the
/// constraint centres the joint stiffness pulls toward and the per-second
/// process noise injected between updates.
#[derive(Debug, Clone)]
pub struct LocalState {
    pub articulation: Vec<Parameters>,
    pub constraints: Vec<Parameters>,
    pub process_noise: Vec<Parameters>,
    pub last_update_time: f64,
    /// False when the state cannot be trusted (singular covariance,
    /// degenerate quaternion). Consumers must check before using poses.
    pub valid: bool,
}

impl LocalState {
    fn empty() -> Self {
        Self {
            articulation: Vec::new(),
            constraints: Vec::new(),
            process_noise: Vec::new(),
            last_update_time: 0.0,
            valid: true,
        }
    }
}

/// One skeleton segment. The tree owns all nodes in an arena; `parent` is a
/// non-owning arena index resolved by `ArticulatedModel::enumerate_hierarchy`.
#[derive(Debug, Clone)]
pub struct Node {
    pub desc: NodeDescriptor,
    pub parent_desc: Option<NodeDescriptor>,
    pub(crate) parent: Option<usize>,

    /// Fixed articulation structure; composed in order to form the local
    /// pose. Set once during topology setup.
    pub articulations: Vec<Articulation>,
    pub local_state: LocalState,

    /// Local transform when all parameters are neutral. Identity unless the
    /// node carries a fixed offset/orientation outside its articulations.
    pub home_pose: Transform3D,

    /// 0 = unconstrained; large values snap updates to the constraint centre.
    pub joint_stiffness: f64,

    /// Pending observations awaiting the next fusion pass, ordered by
    /// timestamp before fusing.
    pub(crate) measurements: Vec<Measurement>,

    // Belief version for cache invalidation; bumped on every state mutation.
    version: u64,
    cached_pose: Option<(u64, Transform3D)>,
}

impl Node {
    pub fn new(desc: NodeDescriptor, parent_desc: Option<NodeDescriptor>) -> Self {
        Self {
            desc,
            parent_desc,
            parent: None,
            articulations: Vec::new(),
            local_state: LocalState::empty(),
            home_pose: Transform3D::identity(),
            joint_stiffness: 1.0,
            measurements: Vec::new(),
            version: 0,
            cached_pose: None,
        }
    }

    /// Assigns the articulation structure, resetting belief, constraints and
    /// process noise to the articulations' defaults.
    pub fn set_model(&mut self, articulations: Vec<Articulation>) {
        self.local_state.articulation = articulations.iter().map(|a| a.default_state()).collect();
        self.local_state.constraints =
            articulations.iter().map(|a| a.default_constraint()).collect();
        self.local_state.process_noise = articulations
            .iter()
            .map(|a| a.default_process_noise(0.0))
            .collect();
        self.local_state.valid = true;
        self.articulations = articulations;
        self.touch();
    }

    /// Total scalar parameter count across all articulations.
    pub fn dimension(&self) -> usize {
        self.articulations.iter().map(|a| a.dimension()).sum()
    }

    /// Positional DoF this node contributes toward a measurement, counting
    /// rotational flexibility only when a downstream lever converts it into
    /// effective position change.
    pub fn p_dof(&self, has_lever_child: bool) -> usize {
        self.articulations.iter().map(|a| a.p_dof(has_lever_child)).sum()
    }

    /// Rotational DoF this node contributes.
    pub fn r_dof(&self) -> usize {
        self.articulations.iter().map(|a| a.r_dof()).sum()
    }

    // --- Belief / constraint / process-noise access -------------------------

    /// Concatenated belief over all articulations, block-diagonal covariance.
    pub fn state(&self) -> Parameters {
        Self::concatenate(&self.local_state.articulation, self.dimension())
    }

    pub fn constraints(&self) -> Parameters {
        Self::concatenate(&self.local_state.constraints, self.dimension())
    }

    pub fn process_noise(&self) -> Parameters {
        Self::concatenate(&self.local_state.process_noise, self.dimension())
    }

    /// Splits a concatenated belief back into per-articulation blocks and
    /// revalidates the state.
    pub fn set_state(&mut self, state: &Parameters) {
        debug_assert_eq!(state.size(), self.dimension());
        let mut offset = 0;
        for block in &mut self.local_state.articulation {
            let size = block.size();
            *block = state.substate(offset, size);
            offset += size;
        }
        self.touch();
        self.revalidate();
    }

    pub fn set_constraints(&mut self, constraints: &Parameters) {
        debug_assert_eq!(constraints.size(), self.dimension());
        let mut offset = 0;
        for block in &mut self.local_state.constraints {
            let size = block.size();
            *block = constraints.substate(offset, size);
            offset += size;
        }
    }

    pub fn set_process_noise(&mut self, noise: &Parameters) {
        debug_assert_eq!(noise.size(), self.dimension());
        let mut offset = 0;
        for block in &mut self.local_state.process_noise {
            let size = block.size();
            *block = noise.substate(offset, size);
            offset += size;
        }
    }

    pub fn set_constraint_for_articulation(&mut self, i: usize, c: Parameters) {
        debug_assert_eq!(c.size(), self.articulations[i].dimension());
        self.local_state.constraints[i] = c;
    }

    pub fn set_process_noise_for_articulation(&mut self, i: usize, p: Parameters) {
        debug_assert_eq!(p.size(), self.articulations[i].dimension());
        self.local_state.process_noise[i] = p;
    }

    fn concatenate(blocks: &[Parameters], dimension: usize) -> Parameters {
        let mut out = Parameters {
            expectation: DVector::zeros(dimension),
            variance: DMatrix::zeros(dimension, dimension),
        };
        let mut offset = 0;
        for block in blocks {
            out.insert_substate(offset, block);
            offset += block.size();
        }
        out
    }

    // --- Pose evaluation ----------------------------------------------------

    /// Local pose at the current expectation, served from the cache when the
    /// belief has not changed since it was last computed.
    pub fn local_pose(&self) -> Transform3D {
        if let Some((version, pose)) = self.cached_pose {
            if version == self.version {
                return pose;
            }
        }
        self.local_pose_at(&self.expectation_vector())
    }

    /// Recomputes the cache when stale. Called by the model ahead of chain
    /// walks so read-only traversals hit a warm cache.
    pub(crate) fn refresh_pose_cache(&mut self) {
        let stale = !matches!(self.cached_pose, Some((v, _)) if v == self.version);
        if stale {
            self.cached_pose = Some((self.version, self.local_pose_at(&self.expectation_vector())));
        }
    }

    /// Pure speculative evaluation at an arbitrary parameter vector.
    pub fn local_pose_at(&self, theta: &DVector<f64>) -> Transform3D {
        debug_assert_eq!(theta.len(), self.dimension());
        let mut pose = self.home_pose;
        let mut offset = 0;
        for art in &self.articulations {
            let dim = art.dimension();
            let block = theta.rows(offset, dim).into_owned();
            pose *= art.transform(&block);
            offset += dim;
        }
        pose
    }

    /// Local pose with a complex perturbation i*h injected into the j-th
    /// scalar parameter (j indexes the concatenation of all articulation
    /// blocks). Numerical-differentiation primitive for the chain Jacobian.
    pub(crate) fn local_pose_complex_step(&self, j: usize, h: f64) -> Transform3Dc {
        let mut pose = math::complexify(&self.home_pose);
        let mut offset = 0;
        for (art, params) in self.articulations.iter().zip(&self.local_state.articulation) {
            let dim = art.dimension();
            let mut theta: DVector<Complex<f64>> =
                params.expectation.map(|x| Complex::new(x, 0.0));
            if j >= offset && j < offset + dim {
                theta[j - offset].im = h;
            }
            pose *= art.transform(&theta);
            offset += dim;
        }
        pose
    }

    /// Current expectation over all articulations as one vector.
    pub fn expectation_vector(&self) -> DVector<f64> {
        let mut theta = DVector::zeros(self.dimension());
        let mut offset = 0;
        for block in &self.local_state.articulation {
            theta.rows_mut(offset, block.size()).copy_from(&block.expectation);
            offset += block.size();
        }
        theta
    }

    /// Parameter offset of the scale articulation, if the node has one.
    pub(crate) fn scale_block(&self) -> Option<(usize, usize)> {
        let mut offset = 0;
        for (i, art) in self.articulations.iter().enumerate() {
            if matches!(art, Articulation::Scale) {
                return Some((i, offset));
            }
            offset += art.dimension();
        }
        None
    }

    fn touch(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    /// Flags the node invalid when the belief stops defining a usable pose.
    fn revalidate(&mut self) {
        let mut valid = self.local_state.articulation.iter().all(|p| p.is_finite());
        if valid {
            let mut offset = 0;
            let theta = self.expectation_vector();
            for art in &self.articulations {
                if matches!(art, Articulation::Bone { .. } | Articulation::Pose) {
                    valid &= quat_block_valid(&theta, offset);
                }
                offset += art.dimension();
            }
        }
        self.local_state.valid = valid;
    }

    pub(crate) fn mark_invalid(&mut self) {
        self.local_state.valid = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::Vector3;

    fn axial_node(axis: Vector3<f64>) -> Node {
        let mut n = Node::new(NodeDescriptor::from("joint"), None);
        n.set_model(vec![Articulation::Axial { axis }]);
        n
    }

    #[test]
    fn dimension_sums_articulations() {
        let mut n = Node::new(NodeDescriptor::from("root"), None);
        n.set_model(vec![
            Articulation::Pose,
            Articulation::Scale,
            Articulation::Axial { axis: Vector3::x() },
        ]);
        assert_eq!(n.dimension(), 11);
        assert_eq!(n.r_dof(), 4);
        assert_eq!(n.p_dof(false), 3);
        assert_eq!(n.p_dof(true), 4);
    }

    #[test]
    fn local_pose_matches_speculative_evaluation() {
        let mut n = axial_node(Vector3::z());
        let state = Parameters::new(
            DVector::from_row_slice(&[0.4]),
            DMatrix::identity(1, 1),
        )
        .unwrap();
        n.set_state(&state);
        assert_abs_diff_eq!(
            n.local_pose(),
            n.local_pose_at(&DVector::from_row_slice(&[0.4])),
            epsilon = 1e-12
        );
    }

    #[test]
    fn cache_tracks_state_version() {
        let mut n = axial_node(Vector3::z());
        n.refresh_pose_cache();
        let before = n.local_pose();
        let state = Parameters::new(DVector::from_row_slice(&[1.0]), DMatrix::identity(1, 1)).unwrap();
        n.set_state(&state);
        let after = n.local_pose();
        assert!((before - after).norm() > 1e-3);
    }

    #[test]
    fn complex_step_perturbs_only_target_parameter() {
        let mut n = Node::new(NodeDescriptor::from("wrist"), None);
        n.set_model(vec![
            Articulation::Axial { axis: Vector3::z() },
            Articulation::Axial { axis: Vector3::x() },
        ]);
        let h = 1e-20;
        let pose = n.local_pose_complex_step(1, h);
        // Imaginary parts must reflect sensitivity to the second parameter
        // (rotation about x): row 1/2 entries move, pure-z rows stay real.
        assert!(pose[(1, 2)].im.abs() > 0.0);
        assert_abs_diff_eq!(pose[(0, 1)].im, 0.0, epsilon = 1e-40);
    }

    #[test]
    fn degenerate_quaternion_marks_invalid() {
        let mut n = Node::new(NodeDescriptor::from("hip"), None);
        n.set_model(vec![Articulation::Pose]);
        let zeroed = Parameters::zeros(7);
        n.set_state(&zeroed);
        assert!(!n.local_state.valid);
    }
}
