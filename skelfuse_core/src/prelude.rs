// skelfuse_core/src/prelude.rs

// --- Core Abstractions (The main contracts of the library) ---
pub use crate::error::ModelError;
pub use crate::types::{Calibrator, IdentityCalibration, NodeDescriptor, SystemDescriptor};
pub use crate::types::{Transform3D, Transform3Dc};

// --- Core Data Structures (The "nouns" of the library) ---
pub use crate::articulation::Articulation;
pub use crate::measurement::{Measurement, MeasurementKind};
pub use crate::model::ArticulatedModel;
pub use crate::parameters::Parameters;
