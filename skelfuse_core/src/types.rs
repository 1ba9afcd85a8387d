// skelfuse_core/src/types.rs

use nalgebra::{Complex, Matrix4};
use serde::{Deserialize, Serialize};
use std::fmt;

// --- Core Type Aliases ---
// Homogeneous transforms rather than Isometry3: the scale articulation
// produces non-rigid local transforms, and the complex-step Jacobian path
// needs the same transform type over Complex<f64>.
pub type Transform3D = Matrix4<f64>;
pub type Transform3Dc = Matrix4<Complex<f64>>;

// --- Core Identifiers ---

/// Names one segment (node) of the skeleton.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeDescriptor(pub String);

impl NodeDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for NodeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeDescriptor {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Names a measurement source's coordinate system (e.g. one sensor rig).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SystemDescriptor(pub String);

impl SystemDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for SystemDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SystemDescriptor {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// --- Core Trait for Calibration Lookups ---
// The calibration collaborator is external; the engine only consumes the
// resolved sensor-to-reference transforms through this capability.
pub trait Calibrator {
    /// Returns the transform mapping `system`'s coordinates into the tree's
    /// reference system, or `None` when no calibration is known yet.
    fn resolve(&self, system: &SystemDescriptor) -> Option<Transform3D>;
}

/// Trivial calibration: every source system already coincides with the
/// reference system. Useful for tests and single-sensor rigs.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCalibration;

impl Calibrator for IdentityCalibration {
    fn resolve(&self, _system: &SystemDescriptor) -> Option<Transform3D> {
        Some(Transform3D::identity())
    }
}
