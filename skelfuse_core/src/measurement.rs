// skelfuse_core/src/measurement.rs

use crate::math;
use crate::types::{NodeDescriptor, SystemDescriptor, Transform3D};
use nalgebra::{Matrix3, Matrix4, UnitQuaternion, Vector3};

/// The observed quantity of a measurement, with its Gaussian covariance.
/// Quaternion covariances are 4x4 over raw (w, x, y, z) components; they are
/// mapped to axis-angle space at fusion time.
#[derive(Debug, Clone)]
pub enum MeasurementKind {
    Position {
        position: Vector3<f64>,
        variance: Matrix3<f64>,
    },
    Rotation {
        rotation: UnitQuaternion<f64>,
        variance: Matrix4<f64>,
    },
    Rigid {
        position: Vector3<f64>,
        rotation: UnitQuaternion<f64>,
        position_variance: Matrix3<f64>,
        rotation_variance: Matrix4<f64>,
    },
    Scale {
        scale: Vector3<f64>,
        variance: Matrix3<f64>,
    },
}

/// A single sensor observation of one skeleton segment, produced externally
/// and buffered until the next fusion pass consumes it.
#[derive(Debug, Clone)]
pub struct Measurement {
    pub kind: MeasurementKind,
    /// Segment this observation is attached to.
    pub target: NodeDescriptor,
    /// Source coordinate system; resolved against the calibration capability.
    pub system: SystemDescriptor,
    /// True when expressed in the reference/world frame, false when relative
    /// to the target's parent segment.
    pub global_space: bool,
    pub timestamp: f64,
    /// Scales the measurement information in [0, 1]; 1 = fully trusted.
    pub confidence: f64,
}

impl Measurement {
    pub fn position(
        target: impl Into<NodeDescriptor>,
        system: impl Into<SystemDescriptor>,
        position: Vector3<f64>,
        variance: Matrix3<f64>,
    ) -> Self {
        Self::with_kind(target, system, MeasurementKind::Position { position, variance })
    }

    pub fn rotation(
        target: impl Into<NodeDescriptor>,
        system: impl Into<SystemDescriptor>,
        rotation: UnitQuaternion<f64>,
        variance: Matrix4<f64>,
    ) -> Self {
        Self::with_kind(target, system, MeasurementKind::Rotation { rotation, variance })
    }

    pub fn rigid(
        target: impl Into<NodeDescriptor>,
        system: impl Into<SystemDescriptor>,
        position: Vector3<f64>,
        rotation: UnitQuaternion<f64>,
        position_variance: Matrix3<f64>,
        rotation_variance: Matrix4<f64>,
    ) -> Self {
        Self::with_kind(
            target,
            system,
            MeasurementKind::Rigid {
                position,
                rotation,
                position_variance,
                rotation_variance,
            },
        )
    }

    pub fn scale(
        target: impl Into<NodeDescriptor>,
        system: impl Into<SystemDescriptor>,
        scale: Vector3<f64>,
        variance: Matrix3<f64>,
    ) -> Self {
        Self::with_kind(target, system, MeasurementKind::Scale { scale, variance })
    }

    fn with_kind(
        target: impl Into<NodeDescriptor>,
        system: impl Into<SystemDescriptor>,
        kind: MeasurementKind,
    ) -> Self {
        Self {
            kind,
            target: target.into(),
            system: system.into(),
            global_space: true,
            timestamp: 0.0,
            confidence: 1.0,
        }
    }

    pub fn at_time(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn in_local_space(mut self) -> Self {
        self.global_space = false;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Minimum positional DoF a fusing chain must supply for this
    /// measurement to be well determined.
    pub fn required_pdof(&self) -> usize {
        match self.kind {
            MeasurementKind::Position { .. } | MeasurementKind::Rigid { .. } => 3,
            MeasurementKind::Rotation { .. } | MeasurementKind::Scale { .. } => 0,
        }
    }

    /// Minimum rotational DoF a fusing chain must supply.
    pub fn required_rdof(&self) -> usize {
        match self.kind {
            MeasurementKind::Rotation { .. } | MeasurementKind::Rigid { .. } => 3,
            MeasurementKind::Position { .. } | MeasurementKind::Scale { .. } => 0,
        }
    }

    /// Re-expresses the observation under a rigid transform (calibration map
    /// or parent pose), rotating covariances along with the values. Scale
    /// observations are frame-free under rigid maps and pass through.
    pub fn transformed(&self, t: &Transform3D) -> Measurement {
        let r = math::rotation_part(t);
        let rm = r.to_rotation_matrix().into_inner();
        let mut out = self.clone();
        out.kind = match &self.kind {
            MeasurementKind::Position { position, variance } => MeasurementKind::Position {
                position: math::transform_point(t, position),
                variance: rm * variance * rm.transpose(),
            },
            MeasurementKind::Rotation { rotation, variance } => {
                let l = math::quat_left_product_matrix(&r);
                MeasurementKind::Rotation {
                    rotation: r * rotation,
                    variance: l * variance * l.transpose(),
                }
            }
            MeasurementKind::Rigid {
                position,
                rotation,
                position_variance,
                rotation_variance,
            } => {
                let l = math::quat_left_product_matrix(&r);
                MeasurementKind::Rigid {
                    position: math::transform_point(t, position),
                    rotation: r * rotation,
                    position_variance: rm * position_variance * rm.transpose(),
                    rotation_variance: l * rotation_variance * l.transpose(),
                }
            }
            MeasurementKind::Scale { .. } => self.kind.clone(),
        };
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::Vector3;

    #[test]
    fn required_dof_per_kind() {
        let m = Measurement::position("hand", "cam", Vector3::zeros(), Matrix3::identity());
        assert_eq!((m.required_pdof(), m.required_rdof()), (3, 0));
        let m = Measurement::rotation(
            "hand",
            "imu",
            UnitQuaternion::identity(),
            Matrix4::identity(),
        );
        assert_eq!((m.required_pdof(), m.required_rdof()), (0, 3));
        let m = Measurement::rigid(
            "hand",
            "mocap",
            Vector3::zeros(),
            UnitQuaternion::identity(),
            Matrix3::identity(),
            Matrix4::identity(),
        );
        assert_eq!((m.required_pdof(), m.required_rdof()), (3, 3));
        let m = Measurement::scale("hand", "depth", Vector3::new(1.0, 1.0, 1.0), Matrix3::identity());
        assert_eq!((m.required_pdof(), m.required_rdof()), (0, 0));
    }

    #[test]
    fn transformed_rotates_position_and_covariance() {
        let q = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), std::f64::consts::FRAC_PI_2);
        let t = math::transform_from_parts(&q, &Vector3::new(1.0, 0.0, 0.0));
        let mut var = Matrix3::zeros();
        var[(0, 0)] = 4.0;
        var[(1, 1)] = 1.0;
        var[(2, 2)] = 1.0;
        let m = Measurement::position("hand", "cam", Vector3::new(1.0, 0.0, 0.0), var);
        let mt = m.transformed(&t);
        match mt.kind {
            MeasurementKind::Position { position, variance } => {
                assert_abs_diff_eq!(position, Vector3::new(1.0, 1.0, 0.0), epsilon = 1e-12);
                // The x-dominant uncertainty rotates onto y.
                assert_abs_diff_eq!(variance[(1, 1)], 4.0, epsilon = 1e-9);
                assert_abs_diff_eq!(variance[(0, 0)], 1.0, epsilon = 1e-9);
            }
            _ => panic!("kind changed"),
        }
    }
}
