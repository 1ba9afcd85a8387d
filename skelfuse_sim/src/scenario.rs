// skelfuse_sim/src/scenario.rs
//
// Builds a fusion model and a parallel scripted ground truth from a
// scenario config, then drives both: every frame the ground truth advances,
// tracked segments emit noisy rigid measurements, the model fuses them, and
// the harness scores the estimate against the truth.

use nalgebra::{DVector, Matrix3, Matrix4, UnitQuaternion, Vector3};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use skelfuse_core::articulation::{pose_expectation, Articulation};
use skelfuse_core::math;
use skelfuse_core::prelude::*;
use std::collections::HashMap;
use std::f64::consts::PI;
use tracing::{debug, info};

use crate::config::{NodeConfig, NodeKindConfig, ScenarioConfig};
use crate::error::SimError;

// Phase offset between successive hinges so a hinge stack does not sweep
// all axes in lockstep.
const HINGE_PHASE_STEP: f64 = PI / 3.0;

/// Scripted parameter trajectory for one node.
enum Motion {
    Static(DVector<f64>),
    BoneSweep {
        axis: Vector3<f64>,
        amplitude: f64,
        frequency: f64,
    },
    HingeSweep {
        count: usize,
        amplitude: f64,
        frequency: f64,
    },
}

impl Motion {
    fn parameters(&self, t: f64) -> DVector<f64> {
        match self {
            Motion::Static(theta) => theta.clone(),
            Motion::BoneSweep { axis, amplitude, frequency } => {
                let angle = amplitude * (2.0 * PI * frequency * t).sin();
                let q = UnitQuaternion::from_axis_angle(
                    &nalgebra::Unit::new_normalize(*axis),
                    angle,
                );
                DVector::from_row_slice(&[q.coords.w, q.coords.x, q.coords.y, q.coords.z])
            }
            Motion::HingeSweep { count, amplitude, frequency } => DVector::from_fn(*count, |i, _| {
                amplitude * (2.0 * PI * frequency * t + i as f64 * HINGE_PHASE_STEP).sin()
            }),
        }
    }
}

struct TruthNode {
    desc: NodeDescriptor,
    parent: Option<usize>,
    home: Transform3D,
    articulations: Vec<Articulation>,
    motion: Motion,
    tracked: bool,
}

impl TruthNode {
    fn local_pose(&self, t: f64) -> Transform3D {
        let theta = self.motion.parameters(t);
        let mut pose = self.home;
        let mut offset = 0;
        for art in &self.articulations {
            let dim = art.dimension();
            pose *= art.transform(&theta.rows(offset, dim).into_owned());
            offset += dim;
        }
        pose
    }
}

/// Per-tracked-node accumulated error over a run.
#[derive(Debug)]
pub struct NodeReport {
    pub node: NodeDescriptor,
    pub rms_position_error: f64,
    pub rms_rotation_error: f64,
}

pub struct Harness {
    model: ArticulatedModel,
    truth: Vec<TruthNode>,
    stiffness: f64,
}

impl Harness {
    pub fn from_config(config: &ScenarioConfig) -> Result<Self, SimError> {
        let mut model = ArticulatedModel::new();
        model.set_reference_system(SystemDescriptor::from("stage"));

        let mut truth = Vec::with_capacity(config.nodes.len());
        let mut indices: HashMap<String, usize> = HashMap::new();

        for node in &config.nodes {
            let desc = NodeDescriptor::from(node.name.as_str());
            match &node.parent {
                Some(parent) => model.add_node(desc.clone(), NodeDescriptor::from(parent.as_str())),
                None => model.add_generic_node(desc.clone()),
            }
            let parent = match &node.parent {
                Some(p) => Some(*indices.get(p).ok_or_else(|| {
                    SimError::Scenario(format!("node {} declared before its parent {p}", node.name))
                })?),
                None => None,
            };
            let truth_node = Self::configure_node(&mut model, &desc, parent, node)?;
            indices.insert(node.name.clone(), truth.len());
            truth.push(truth_node);
        }

        model.enumerate_hierarchy()?;
        model.set_all_joint_stiffness(config.simulation.stiffness);
        Ok(Self {
            model,
            truth,
            stiffness: config.simulation.stiffness,
        })
    }

    fn configure_node(
        model: &mut ArticulatedModel,
        desc: &NodeDescriptor,
        parent: Option<usize>,
        node: &NodeConfig,
    ) -> Result<TruthNode, SimError> {
        let truth = match &node.kind {
            NodeKindConfig::Fixed { offset } => {
                let home = Matrix4::new_translation(&Vector3::from(*offset));
                model.set_fixed_node(desc, home)?;
                TruthNode {
                    desc: desc.clone(),
                    parent,
                    home,
                    articulations: Vec::new(),
                    motion: Motion::Static(DVector::zeros(0)),
                    tracked: node.tracked,
                }
            }
            NodeKindConfig::Bone { offset, axis, amplitude, frequency } => {
                let axis = unit_axis(axis, &node.name)?.into_inner();
                let home = Matrix4::new_translation(&Vector3::from(*offset));
                model.set_bone_for_node(desc, home, neutral_rotation_constraint(), 0.01)?;
                TruthNode {
                    desc: desc.clone(),
                    parent,
                    home,
                    articulations: vec![Articulation::Bone {
                        offset: Vector3::from(*offset),
                    }],
                    motion: Motion::BoneSweep {
                        axis,
                        amplitude: *amplitude,
                        frequency: *frequency,
                    },
                    tracked: node.tracked,
                }
            }
            NodeKindConfig::Hinges { offset, axes, amplitude, frequency } => {
                let articulations = axes
                    .iter()
                    .map(|a| {
                        Ok(Articulation::Axial {
                            axis: unit_axis(a, &node.name)?.into_inner(),
                        })
                    })
                    .collect::<Result<Vec<_>, SimError>>()?;
                let home = Matrix4::new_translation(&Vector3::from(*offset));
                model.set_articulated_node(desc, home, articulations.clone(), 0.01)?;
                TruthNode {
                    desc: desc.clone(),
                    parent,
                    home,
                    articulations,
                    motion: Motion::HingeSweep {
                        count: axes.len(),
                        amplitude: *amplitude,
                        frequency: *frequency,
                    },
                    tracked: node.tracked,
                }
            }
            NodeKindConfig::Pose { position } => {
                let home = Matrix4::new_translation(&Vector3::from(*position));
                model.set_pose_node(desc, home, neutral_pose_constraint(), 0.01)?;
                TruthNode {
                    desc: desc.clone(),
                    parent,
                    // Truth carries the pose in its articulation parameters,
                    // matching how the model represents it.
                    home: Transform3D::identity(),
                    articulations: vec![Articulation::Pose],
                    motion: Motion::Static(pose_expectation(&home)),
                    tracked: node.tracked,
                }
            }
        };
        Ok(truth)
    }

    fn truth_global_pose(&self, idx: usize, t: f64) -> Transform3D {
        let mut pose = self.truth[idx].local_pose(t);
        let mut current = self.truth[idx].parent;
        while let Some(p) = current {
            pose = self.truth[p].local_pose(t) * pose;
            current = self.truth[p].parent;
        }
        pose
    }

    /// Runs `frames` fusion frames and returns the tracking error per
    /// tracked node.
    pub fn run(
        &mut self,
        frames: usize,
        dt: f64,
        position_sigma: f64,
        rotation_sigma: f64,
        rng: &mut impl Rng,
    ) -> Result<Vec<NodeReport>, SimError> {
        // Keep measurement covariances invertible even in a noiseless run.
        let position_sigma = position_sigma.max(1e-6);
        let rotation_sigma = rotation_sigma.max(1e-6);
        let position_noise = Normal::new(0.0, position_sigma)
            .map_err(|e| SimError::Scenario(format!("bad position sigma: {e}")))?;
        let rotation_noise = Normal::new(0.0, rotation_sigma)
            .map_err(|e| SimError::Scenario(format!("bad rotation sigma: {e}")))?;

        debug!(frames, dt, stiffness = self.stiffness, "starting run");

        let tracked: Vec<usize> = (0..self.truth.len())
            .filter(|&i| self.truth[i].tracked)
            .collect();
        let mut sq_position = vec![0.0f64; tracked.len()];
        let mut sq_rotation = vec![0.0f64; tracked.len()];

        for frame in 0..frames {
            let t = frame as f64 * dt;
            let mut group = Vec::with_capacity(tracked.len());
            for &idx in &tracked {
                let pose = self.truth_global_pose(idx, t);
                let position = math::translation_part(&pose)
                    + Vector3::from_fn(|_, _| position_noise.sample(rng));
                let wobble = UnitQuaternion::from_scaled_axis(Vector3::from_fn(|_, _| {
                    rotation_noise.sample(rng)
                }));
                let rotation = wobble * math::rotation_part(&pose);
                group.push(
                    Measurement::rigid(
                        self.truth[idx].desc.clone(),
                        "tracker",
                        position,
                        rotation,
                        Matrix3::identity() * position_sigma * position_sigma,
                        Matrix4::identity() * rotation_sigma * rotation_sigma,
                    )
                    .at_time(t),
                );
            }
            self.model.add_measurement_group(group);
            self.model.fuse(&IdentityCalibration)?;

            for (slot, &idx) in tracked.iter().enumerate() {
                let truth_pose = self.truth_global_pose(idx, t);
                let estimate = self.model.node_global_pose(&self.truth[idx].desc)?;
                sq_position[slot] += (math::translation_part(&estimate)
                    - math::translation_part(&truth_pose))
                .norm_squared();
                let angle = math::rotation_part(&estimate)
                    .angle_to(&math::rotation_part(&truth_pose));
                sq_rotation[slot] += angle * angle;
            }
        }

        let n = frames.max(1) as f64;
        let reports: Vec<NodeReport> = tracked
            .iter()
            .enumerate()
            .map(|(slot, &idx)| NodeReport {
                node: self.truth[idx].desc.clone(),
                rms_position_error: (sq_position[slot] / n).sqrt(),
                rms_rotation_error: (sq_rotation[slot] / n).sqrt(),
            })
            .collect();
        for report in &reports {
            info!(
                node = %report.node,
                rms_position_m = report.rms_position_error,
                rms_rotation_rad = report.rms_rotation_error,
                "tracking error"
            );
        }
        Ok(reports)
    }
}

fn unit_axis(raw: &[f64; 3], node: &str) -> Result<nalgebra::Unit<Vector3<f64>>, SimError> {
    let v = Vector3::from(*raw);
    nalgebra::Unit::try_new(v, 1e-9)
        .ok_or_else(|| SimError::Scenario(format!("node {node} has a zero articulation axis")))
}

fn neutral_rotation_constraint() -> Parameters {
    Parameters::new(
        DVector::from_row_slice(&[1.0, 0.0, 0.0, 0.0]),
        nalgebra::DMatrix::identity(4, 4),
    )
    .expect("constraint dimensions are static")
}

fn neutral_pose_constraint() -> Parameters {
    Parameters::new(
        DVector::from_row_slice(&[1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
        nalgebra::DMatrix::identity(7, 7),
    )
    .expect("constraint dimensions are static")
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn truth_poses_compose_fixed_offsets() {
        let text = r#"
            [[nodes]]
            name = "anchor"
            kind = "fixed"
            offset = [0.0, 1.0, 0.0]

            [[nodes]]
            name = "hand"
            parent = "anchor"
            kind = "fixed"
            offset = [0.0, 0.5, 0.0]
        "#;
        let config: ScenarioConfig = toml::from_str(text).unwrap();
        let harness = Harness::from_config(&config).unwrap();
        let pose = harness.truth_global_pose(1, 0.0);
        assert_abs_diff_eq!(
            math::translation_part(&pose),
            Vector3::new(0.0, 1.5, 0.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn builtin_arm_builds_and_runs() {
        let config = ScenarioConfig::builtin_arm();
        let mut harness = Harness::from_config(&config).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let reports = harness.run(30, 1.0 / 60.0, 0.002, 0.005, &mut rng).unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].rms_position_error.is_finite());
        assert!(reports[0].rms_rotation_error.is_finite());
    }

    #[test]
    fn child_declared_before_parent_is_rejected() {
        let text = r#"
            [[nodes]]
            name = "hand"
            parent = "chest"
            kind = "fixed"

            [[nodes]]
            name = "chest"
            kind = "fixed"
        "#;
        let config: ScenarioConfig = toml::from_str(text).unwrap();
        assert!(matches!(
            Harness::from_config(&config),
            Err(SimError::Scenario(_))
        ));
    }

    #[test]
    fn static_scene_with_low_noise_tracks_tightly() {
        let text = r#"
            [simulation]
            frames = 60
            dt = 0.016
            stiffness = 0.0

            [[nodes]]
            name = "anchor"
            kind = "fixed"

            [[nodes]]
            name = "puck"
            parent = "anchor"
            kind = "pose"
            position = [0.5, 1.0, 0.0]
            tracked = true
        "#;
        let config: ScenarioConfig = toml::from_str(text).unwrap();
        let mut harness = Harness::from_config(&config).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let reports = harness.run(60, 0.016, 1e-4, 1e-4, &mut rng).unwrap();
        assert!(reports[0].rms_position_error < 0.05);
    }
}
