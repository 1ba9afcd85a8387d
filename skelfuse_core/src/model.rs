// skelfuse_core/src/model.rs

use crate::articulation::{pose_expectation, Articulation, INITIAL_COVARIANCE};
use crate::chain;
use crate::error::ModelError;
use crate::fusion;
use crate::math;
use crate::measurement::Measurement;
use crate::node::Node;
use crate::parameters::Parameters;
use crate::types::{Calibrator, NodeDescriptor, SystemDescriptor, Transform3D};
use nalgebra::Vector3;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

/// The kinematic tree: owns every node in an arena keyed by descriptor and
/// orchestrates per-frame fusion across the whole skeleton.
///
/// Topology is set up once (`add_node` + `set_*_node`), then
/// `enumerate_hierarchy` resolves parent descriptors into arena indices;
/// fusion and global-pose queries refuse to run before that. Measurement
/// ingestion is thread-safe (a locked inbox drained at every `fuse` call);
/// the fusion pass itself requires exclusive access, since chains overlap on
/// shared ancestors.
#[derive(Debug, Default)]
pub struct ArticulatedModel {
    nodes: Vec<Node>,
    index: HashMap<NodeDescriptor, usize>,
    reference_system: SystemDescriptor,
    inbox: Mutex<Vec<Measurement>>,
    hierarchy_built: bool,
}

impl ArticulatedModel {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Topology setup -----------------------------------------------------

    pub fn set_reference_system(&mut self, s: SystemDescriptor) {
        self.reference_system = s;
    }

    pub fn reference_system(&self) -> &SystemDescriptor {
        &self.reference_system
    }

    /// Registers a node and its declared parent. Parent pointers are not
    /// resolved until `enumerate_hierarchy`.
    pub fn add_node(&mut self, node: NodeDescriptor, parent: NodeDescriptor) {
        self.insert_node(node, Some(parent));
    }

    /// Registers a free-floating node (no parent) with a generic 6-DoF pose
    /// articulation, unless it already exists.
    pub fn add_generic_node(&mut self, node: NodeDescriptor) {
        if self.index.contains_key(&node) {
            return;
        }
        let idx = self.insert_node(node, None);
        self.nodes[idx].set_model(vec![Articulation::Pose]);
    }

    fn insert_node(&mut self, desc: NodeDescriptor, parent: Option<NodeDescriptor>) -> usize {
        self.hierarchy_built = false;
        match self.index.get(&desc) {
            Some(&idx) => {
                self.nodes[idx].parent_desc = parent;
                idx
            }
            None => {
                let idx = self.nodes.len();
                self.nodes.push(Node::new(desc.clone(), parent));
                self.index.insert(desc, idx);
                idx
            }
        }
    }

    /// Resolves every declared parent descriptor into an arena index and
    /// verifies the structure is a forest. Must run after all nodes are
    /// added and before any fusion or global-pose query.
    pub fn enumerate_hierarchy(&mut self) -> Result<(), ModelError> {
        for i in 0..self.nodes.len() {
            self.nodes[i].parent = match &self.nodes[i].parent_desc {
                Some(pd) => Some(*self.index.get(pd).ok_or_else(|| {
                    ModelError::UnresolvedParent {
                        node: self.nodes[i].desc.clone(),
                        parent: pd.clone(),
                    }
                })?),
                None => None,
            };
        }
        // Cycle check: no walk may visit more nodes than exist.
        for start in 0..self.nodes.len() {
            let mut steps = 0;
            let mut current = self.nodes[start].parent;
            while let Some(p) = current {
                steps += 1;
                if steps > self.nodes.len() {
                    return Err(ModelError::CyclicHierarchy(self.nodes[start].desc.clone()));
                }
                current = self.nodes[p].parent;
            }
        }
        self.hierarchy_built = true;
        Ok(())
    }

    /// Rigid segment with no free parameters; `transform` becomes its fixed
    /// local pose.
    pub fn set_fixed_node(
        &mut self,
        node: &NodeDescriptor,
        transform: Transform3D,
    ) -> Result<(), ModelError> {
        let idx = self.index_of(node)?;
        self.nodes[idx].set_model(Vec::new());
        self.nodes[idx].home_pose = transform;
        Ok(())
    }

    /// Bone segment: fixed offset taken from `bone_transform`'s translation,
    /// free quaternion rotation. `constraints` is the 4-parameter rotation
    /// prior; `process_noise` its isotropic per-second strength.
    pub fn set_bone_for_node(
        &mut self,
        node: &NodeDescriptor,
        bone_transform: Transform3D,
        constraints: Parameters,
        process_noise: f64,
    ) -> Result<(), ModelError> {
        let idx = self.index_of(node)?;
        let art = Articulation::Bone {
            offset: math::translation_part(&bone_transform),
        };
        Self::check_dim(&constraints, art.dimension())?;
        self.nodes[idx].set_model(vec![art]);
        // Any rotation baked into the bone transform becomes the home pose.
        self.nodes[idx].home_pose =
            math::transform_from_parts(&math::rotation_part(&bone_transform), &Vector3::zeros());
        self.nodes[idx].set_constraint_for_articulation(0, constraints);
        self.nodes[idx]
            .set_process_noise_for_articulation(0, Parameters::isotropic(4, process_noise));
        Ok(())
    }

    /// Free 6-DoF segment initialized at `pose_transform`.
    pub fn set_pose_node(
        &mut self,
        node: &NodeDescriptor,
        pose_transform: Transform3D,
        constraints: Parameters,
        process_noise: f64,
    ) -> Result<(), ModelError> {
        let idx = self.index_of(node)?;
        let art = Articulation::Pose;
        Self::check_dim(&constraints, art.dimension())?;
        self.nodes[idx].set_model(vec![art]);
        self.nodes[idx].set_state(&Parameters {
            expectation: pose_expectation(&pose_transform),
            variance: nalgebra::DMatrix::identity(7, 7) * INITIAL_COVARIANCE,
        });
        self.nodes[idx].set_constraint_for_articulation(0, constraints);
        self.nodes[idx]
            .set_process_noise_for_articulation(0, Parameters::isotropic(7, process_noise));
        Ok(())
    }

    /// Free pose plus a non-uniform scale, e.g. for retargeting a skeleton to
    /// a body of unknown proportions. `constraints` spans both blocks (7+3).
    pub fn set_scale_pose_node(
        &mut self,
        node: &NodeDescriptor,
        pose_transform: Transform3D,
        scale_initial: Vector3<f64>,
        constraints: Parameters,
        process_noise: f64,
    ) -> Result<(), ModelError> {
        let idx = self.index_of(node)?;
        Self::check_dim(&constraints, 10)?;
        self.nodes[idx].set_model(vec![Articulation::Pose, Articulation::Scale]);
        let mut state = self.nodes[idx].state();
        state
            .expectation
            .rows_mut(0, 7)
            .copy_from(&pose_expectation(&pose_transform));
        state.expectation.rows_mut(7, 3).copy_from(&scale_initial);
        self.nodes[idx].set_state(&state);
        self.nodes[idx].set_constraints(&constraints);
        self.nodes[idx].set_process_noise(&Parameters::isotropic(10, process_noise));
        Ok(())
    }

    /// Arbitrary articulation stack, e.g. a wrist built from three axial
    /// hinges. `home_pose` is the fixed transform composed ahead of the
    /// articulations; constraints start at each articulation's neutral
    /// default.
    pub fn set_articulated_node(
        &mut self,
        node: &NodeDescriptor,
        home_pose: Transform3D,
        articulations: Vec<Articulation>,
        process_noise: f64,
    ) -> Result<(), ModelError> {
        let idx = self.index_of(node)?;
        self.nodes[idx].set_model(articulations);
        self.nodes[idx].home_pose = home_pose;
        let dim = self.nodes[idx].dimension();
        if dim > 0 {
            self.nodes[idx].set_process_noise(&Parameters::isotropic(dim, process_noise));
        }
        Ok(())
    }

    pub fn set_joint_stiffness(
        &mut self,
        node: &NodeDescriptor,
        stiffness: f64,
    ) -> Result<(), ModelError> {
        let idx = self.index_of(node)?;
        self.nodes[idx].joint_stiffness = stiffness.max(0.0);
        Ok(())
    }

    pub fn set_all_joint_stiffness(&mut self, stiffness: f64) {
        for node in &mut self.nodes {
            node.joint_stiffness = stiffness.max(0.0);
        }
    }

    // --- Runtime ------------------------------------------------------------

    /// Queues a measurement for the next fusion pass. Safe to call from
    /// producer threads while the consumer owns the model.
    pub fn add_measurement(&self, m: Measurement) {
        self.lock_inbox().push(m);
    }

    pub fn add_measurement_group(&self, group: Vec<Measurement>) {
        self.lock_inbox().extend(group);
    }

    /// Measurements queued or buffered but not yet fused.
    pub fn pending_measurements(&self) -> Vec<Measurement> {
        let mut out: Vec<Measurement> = self.lock_inbox().clone();
        for node in &self.nodes {
            out.extend(node.measurements.iter().cloned());
        }
        out
    }

    /// Runs one fusion pass: routes queued measurements to their target
    /// nodes, then fuses each node's buffer in timestamp order using the
    /// calibration capability, and clears all buffers.
    pub fn fuse(&mut self, calib: &dyn Calibrator) -> Result<(), ModelError> {
        if !self.hierarchy_built {
            return Err(ModelError::HierarchyNotBuilt);
        }

        let queued = std::mem::take(&mut *self.lock_inbox());
        for m in queued {
            match self.index.get(&m.target) {
                Some(&idx) => self.nodes[idx].measurements.push(m),
                None => {
                    warn!(target = %m.target, "measurement targets an unknown node; dropped")
                }
            }
        }

        for idx in 0..self.nodes.len() {
            if self.nodes[idx].measurements.is_empty() {
                continue;
            }
            for node in &mut self.nodes {
                node.refresh_pose_cache();
            }
            let mut batch = std::mem::take(&mut self.nodes[idx].measurements);
            batch.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
            debug!(node = %self.nodes[idx].desc, count = batch.len(), "fusing measurement batch");
            for m in &batch {
                let Some(to_fusion) = calib.resolve(&m.system) else {
                    warn!(system = %m.system, "no calibration for measurement system; skipped");
                    continue;
                };
                fusion::fuse_measurement(&mut self.nodes, idx, m, &to_fusion);
            }
        }
        Ok(())
    }

    // --- Queries ------------------------------------------------------------

    /// Pose of the node in the reference frame.
    pub fn node_global_pose(&self, node: &NodeDescriptor) -> Result<Transform3D, ModelError> {
        if !self.hierarchy_built {
            return Err(ModelError::HierarchyNotBuilt);
        }
        let idx = self.index_of(node)?;
        Ok(chain::global_pose(&self.nodes, idx))
    }

    /// Local pose of the node relative to its parent.
    pub fn node_local_pose(&self, node: &NodeDescriptor) -> Result<Transform3D, ModelError> {
        Ok(self.nodes[self.index_of(node)?].local_pose())
    }

    pub fn node_state(&self, node: &NodeDescriptor) -> Result<Parameters, ModelError> {
        Ok(self.nodes[self.index_of(node)?].state())
    }

    pub fn node_constraints(&self, node: &NodeDescriptor) -> Result<Parameters, ModelError> {
        Ok(self.nodes[self.index_of(node)?].constraints())
    }

    pub fn node_process_noise(&self, node: &NodeDescriptor) -> Result<Parameters, ModelError> {
        Ok(self.nodes[self.index_of(node)?].process_noise())
    }

    /// Whether the node's belief currently defines a trustworthy pose.
    pub fn node_valid(&self, node: &NodeDescriptor) -> Result<bool, ModelError> {
        Ok(self.nodes[self.index_of(node)?].local_state.valid)
    }

    fn index_of(&self, node: &NodeDescriptor) -> Result<usize, ModelError> {
        self.index
            .get(node)
            .copied()
            .ok_or_else(|| ModelError::UnknownNode(node.clone()))
    }

    fn check_dim(p: &Parameters, expected: usize) -> Result<(), ModelError> {
        if p.size() != expected {
            return Err(ModelError::DimensionMismatch {
                expected,
                actual: p.size(),
            });
        }
        Ok(())
    }

    fn lock_inbox(&self) -> std::sync::MutexGuard<'_, Vec<Measurement>> {
        // A poisoned inbox only means a producer panicked mid-push; the
        // queue contents are still plain data.
        match self.inbox.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IdentityCalibration;
    use approx::assert_abs_diff_eq;
    use nalgebra::{DMatrix, DVector, Matrix3, Matrix4, UnitQuaternion};

    fn neutral_rotation_constraint() -> Parameters {
        Parameters::new(
            DVector::from_row_slice(&[1.0, 0.0, 0.0, 0.0]),
            DMatrix::identity(4, 4),
        )
        .unwrap()
    }

    fn arm_model() -> ArticulatedModel {
        let mut model = ArticulatedModel::new();
        model.set_reference_system(SystemDescriptor::from("world"));
        model.add_generic_node(NodeDescriptor::from("root"));
        model.add_node(NodeDescriptor::from("upper"), NodeDescriptor::from("root"));
        model.add_node(NodeDescriptor::from("hand"), NodeDescriptor::from("upper"));
        model
            .set_bone_for_node(
                &NodeDescriptor::from("upper"),
                Matrix4::new_translation(&Vector3::new(0.0, 0.3, 0.0)),
                neutral_rotation_constraint(),
                0.0,
            )
            .unwrap();
        model
            .set_bone_for_node(
                &NodeDescriptor::from("hand"),
                Matrix4::new_translation(&Vector3::new(0.0, 0.25, 0.0)),
                neutral_rotation_constraint(),
                0.0,
            )
            .unwrap();
        model
    }

    #[test]
    fn unresolved_parent_fails_enumeration() {
        let mut model = ArticulatedModel::new();
        model.add_node(NodeDescriptor::from("hand"), NodeDescriptor::from("ghost"));
        assert!(matches!(
            model.enumerate_hierarchy(),
            Err(ModelError::UnresolvedParent { .. })
        ));
    }

    #[test]
    fn cyclic_hierarchy_is_rejected() {
        let mut model = ArticulatedModel::new();
        model.add_node(NodeDescriptor::from("a"), NodeDescriptor::from("b"));
        model.add_node(NodeDescriptor::from("b"), NodeDescriptor::from("a"));
        assert!(matches!(
            model.enumerate_hierarchy(),
            Err(ModelError::CyclicHierarchy(_))
        ));
    }

    #[test]
    fn fuse_requires_enumerated_hierarchy() {
        let mut model = arm_model();
        assert!(matches!(
            model.fuse(&IdentityCalibration),
            Err(ModelError::HierarchyNotBuilt)
        ));
        model.enumerate_hierarchy().unwrap();
        assert!(model.fuse(&IdentityCalibration).is_ok());
    }

    #[test]
    fn fuse_consumes_buffered_measurements() {
        let mut model = arm_model();
        model.enumerate_hierarchy().unwrap();
        model.add_measurement(Measurement::rotation(
            "hand",
            "mocap",
            UnitQuaternion::identity(),
            Matrix4::identity() * 0.01,
        ));
        assert_eq!(model.pending_measurements().len(), 1);
        model.fuse(&IdentityCalibration).unwrap();
        assert!(model.pending_measurements().is_empty());
    }

    #[test]
    fn buffered_measurements_fuse_in_timestamp_order() {
        // Queued out of order; the batch is sorted before fusion, so the
        // node's clock must end on the latest stamp rather than the last
        // one queued.
        let mut model = arm_model();
        model.enumerate_hierarchy().unwrap();
        for t in [2.0, 1.0] {
            model.add_measurement(
                Measurement::rotation(
                    "hand",
                    "mocap",
                    UnitQuaternion::identity(),
                    Matrix4::identity() * 0.01,
                )
                .at_time(t),
            );
        }
        model.fuse(&IdentityCalibration).unwrap();
        let hand = model.index[&NodeDescriptor::from("hand")];
        assert_abs_diff_eq!(model.nodes[hand].local_state.last_update_time, 2.0);
    }

    #[test]
    fn unknown_measurement_target_is_dropped_not_fatal() {
        let mut model = arm_model();
        model.enumerate_hierarchy().unwrap();
        model.add_measurement(Measurement::position(
            "tail",
            "mocap",
            Vector3::zeros(),
            Matrix3::identity(),
        ));
        assert!(model.fuse(&IdentityCalibration).is_ok());
        assert!(model.pending_measurements().is_empty());
    }

    #[test]
    fn global_pose_composes_bone_offsets() {
        let mut model = arm_model();
        model.enumerate_hierarchy().unwrap();
        let pose = model.node_global_pose(&NodeDescriptor::from("hand")).unwrap();
        assert_abs_diff_eq!(
            math::translation_part(&pose),
            Vector3::new(0.0, 0.55, 0.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn unknown_node_queries_error() {
        let model = arm_model();
        assert!(matches!(
            model.node_state(&NodeDescriptor::from("ghost")),
            Err(ModelError::UnknownNode(_))
        ));
    }
}
