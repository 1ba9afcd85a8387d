// skelfuse_core/src/articulation.rs

use crate::math;
use crate::parameters::Parameters;
use nalgebra::{ComplexField, DVector, Matrix4, UnitQuaternion, Vector3};

/// Default prior covariance for freshly created articulation parameters.
pub const INITIAL_COVARIANCE: f64 = 3.14;

/// A parameterized family of local transforms. Each variant carries its
/// fixed structural data (axis, offset); the per-frame parameters live in
/// the owning node's belief. Composed in order, the articulations of a node
/// map its parameter vector to the node's local pose.
#[derive(Debug, Clone)]
pub enum Articulation {
    /// Rotation about a fixed axis through the node origin. One parameter.
    Axial { axis: Vector3<f64> },
    /// Screw rotation about a fixed axis through `origin`. One parameter.
    Twist { axis: Vector3<f64>, origin: Vector3<f64> },
    /// Fixed bone offset followed by a free rotation; four quaternion
    /// parameters ordered (w, x, y, z), evaluated norm-homogeneously.
    Bone { offset: Vector3<f64> },
    /// Free 6-DoF pose: quaternion (w, x, y, z) then position (x, y, z).
    Pose,
    /// Non-uniform scale along the node axes. Three parameters.
    Scale,
}

impl Articulation {
    /// Number of scalar parameters this articulation consumes.
    pub fn dimension(&self) -> usize {
        match self {
            Articulation::Axial { .. } | Articulation::Twist { .. } => 1,
            Articulation::Bone { .. } => 4,
            Articulation::Pose => 7,
            Articulation::Scale => 3,
        }
    }

    /// Evaluates the local transform at `theta`. Generic over the scalar
    /// field so the identical kinematics serve both the production pose path
    /// and complex-step differentiation.
    pub fn transform<T>(&self, theta: &DVector<T>) -> Matrix4<T>
    where
        T: ComplexField<RealField = f64> + Copy,
    {
        debug_assert_eq!(theta.len(), self.dimension());
        match self {
            Articulation::Axial { axis } => {
                let r = math::rotation_about_axis(axis, theta[0]);
                math::homogeneous(&r, &Vector3::<f64>::zeros().map(T::from_real))
            }
            Articulation::Twist { axis, origin } => {
                let r = math::rotation_about_axis(axis, theta[0]);
                let o = origin.map(T::from_real);
                // Trans(origin) * R * Trans(-origin)
                let t = o - r * o;
                math::homogeneous(&r, &t)
            }
            Articulation::Bone { offset } => {
                let r = math::quat_rotation(theta[0], theta[1], theta[2], theta[3]);
                math::homogeneous(&r, &offset.map(T::from_real))
            }
            Articulation::Pose => {
                let r = math::quat_rotation(theta[0], theta[1], theta[2], theta[3]);
                let t = Vector3::new(theta[4], theta[5], theta[6]);
                math::homogeneous(&r, &t)
            }
            Articulation::Scale => {
                let mut m = Matrix4::identity();
                m[(0, 0)] = theta[0];
                m[(1, 1)] = theta[1];
                m[(2, 2)] = theta[2];
                m
            }
        }
    }

    /// Positional degrees of freedom this articulation can contribute.
    /// Pure rotations only move descendants through a lever arm, so their
    /// positional contribution is conditional on one existing below.
    pub fn p_dof(&self, has_lever_child: bool) -> usize {
        match self {
            Articulation::Axial { .. } | Articulation::Twist { .. } => {
                if has_lever_child {
                    1
                } else {
                    0
                }
            }
            Articulation::Bone { .. } => {
                if has_lever_child {
                    3
                } else {
                    0
                }
            }
            Articulation::Pose => 3,
            Articulation::Scale => 0,
        }
    }

    /// Rotational degrees of freedom this articulation contributes.
    pub fn r_dof(&self) -> usize {
        match self {
            Articulation::Axial { .. } | Articulation::Twist { .. } => 1,
            Articulation::Bone { .. } | Articulation::Pose => 3,
            Articulation::Scale => 0,
        }
    }

    /// The parameter vector at which this articulation is the identity
    /// transform (bone offsets aside). Quaternion blocks get w = 1 so the
    /// rest state is a valid rotation; scale rests at unity.
    pub fn neutral_expectation(&self) -> DVector<f64> {
        let mut x = DVector::zeros(self.dimension());
        match self {
            Articulation::Bone { .. } | Articulation::Pose => x[0] = 1.0,
            Articulation::Scale => x.fill(1.0),
            _ => {}
        }
        x
    }

    /// Default belief for a freshly created articulation: neutral expectation
    /// with a broad isotropic covariance.
    pub fn default_state(&self) -> Parameters {
        Parameters {
            expectation: self.neutral_expectation(),
            variance: nalgebra::DMatrix::identity(self.dimension(), self.dimension())
                * INITIAL_COVARIANCE,
        }
    }

    /// Default constraint centre: the neutral state with unit covariance.
    pub fn default_constraint(&self) -> Parameters {
        Parameters {
            expectation: self.neutral_expectation(),
            variance: nalgebra::DMatrix::identity(self.dimension(), self.dimension()),
        }
    }

    /// Isotropic per-second process noise of the given strength.
    pub fn default_process_noise(&self, strength: f64) -> Parameters {
        Parameters::isotropic(self.dimension(), strength)
    }
}

/// Builds the initial state for a `Pose` articulation from a rigid transform.
pub fn pose_expectation(transform: &crate::types::Transform3D) -> DVector<f64> {
    let q: UnitQuaternion<f64> = math::rotation_part(transform);
    let p = math::translation_part(transform);
    DVector::from_row_slice(&[q.coords.w, q.coords.x, q.coords.y, q.coords.z, p.x, p.y, p.z])
}

/// Rotation block of a `Bone`/`Pose` state as a (w, x, y, z) slice check:
/// true when the quaternion norm is healthy enough to define a rotation.
pub fn quat_block_valid(theta: &DVector<f64>, offset: usize) -> bool {
    let n2: f64 = (0..4).map(|i| theta[offset + i] * theta[offset + i]).sum();
    n2 > 1e-8
}
