// skelfuse_sim/src/config.rs

use serde::Deserialize;
use std::path::Path;

use crate::error::SimError;

/// Root of the data parsed from a `scenario.toml` file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)] // Fail if the TOML has fields not in our struct
pub struct ScenarioConfig {
    #[serde(default)] // Use default if the [simulation] section is missing
    pub simulation: SimulationSettings,

    #[serde(default)]
    pub noise: NoiseSettings,

    // The TOML has `[[nodes]]`, which becomes a Vec of NodeConfig structs.
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulationSettings {
    /// Optional seed for the pseudo-random number generator for determinism.
    pub seed: Option<u64>,
    /// Number of fusion frames to run.
    pub frames: usize,
    /// Simulated time between frames in seconds.
    pub dt: f64,
    /// Joint stiffness applied to every node before the run.
    pub stiffness: f64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            seed: None,
            frames: 600,
            dt: 1.0 / 60.0,
            stiffness: 0.0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoiseSettings {
    /// Standard deviation of positional measurement noise, metres.
    pub position_sigma: f64,
    /// Standard deviation of rotational measurement noise, radians
    /// (applied as an axis-angle perturbation).
    pub rotation_sigma: f64,
}

impl Default for NoiseSettings {
    fn default() -> Self {
        Self {
            position_sigma: 0.005,
            rotation_sigma: 0.01,
        }
    }
}

/// One skeleton segment in the scenario.
// No deny_unknown_fields here: serde cannot combine it with #[serde(flatten)].
#[derive(Debug, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub parent: Option<String>,
    #[serde(flatten)]
    pub kind: NodeKindConfig,
    /// Whether a virtual tracker observes this segment every frame.
    #[serde(default)]
    pub tracked: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKindConfig {
    /// Rigid segment at a fixed offset from its parent.
    Fixed {
        #[serde(default)]
        offset: [f64; 3],
    },
    /// Fixed bone offset with a free rotation, swept by a scripted sinusoid
    /// about the given axis in the ground truth.
    Bone {
        offset: [f64; 3],
        axis: [f64; 3],
        amplitude: f64,
        frequency: f64,
    },
    /// Stack of single-axis hinges behind a fixed offset; each hinge sweeps
    /// its own phase-shifted sinusoid.
    Hinges {
        offset: [f64; 3],
        axes: Vec<[f64; 3]>,
        amplitude: f64,
        frequency: f64,
    },
    /// Free 6-DoF segment holding a constant ground-truth pose.
    Pose {
        #[serde(default)]
        position: [f64; 3],
    },
}

impl ScenarioConfig {
    pub fn from_path(path: &Path) -> Result<Self, SimError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| SimError::ScenarioRead { path: path.to_path_buf(), source })?;
        Ok(toml::from_str(&text)?)
    }

    /// A small built-in arm used when no scenario file is given: a fixed
    /// chest, a swinging upper arm bone, and a tracked three-hinge wrist.
    pub fn builtin_arm() -> Self {
        Self {
            simulation: SimulationSettings::default(),
            noise: NoiseSettings::default(),
            nodes: vec![
                NodeConfig {
                    name: "chest".into(),
                    parent: None,
                    kind: NodeKindConfig::Fixed { offset: [0.0, 1.4, 0.0] },
                    tracked: false,
                },
                NodeConfig {
                    name: "upper_arm".into(),
                    parent: Some("chest".into()),
                    kind: NodeKindConfig::Bone {
                        offset: [0.2, 0.0, 0.0],
                        axis: [0.0, 0.0, 1.0],
                        amplitude: 0.6,
                        frequency: 0.25,
                    },
                    tracked: false,
                },
                NodeConfig {
                    name: "wrist".into(),
                    parent: Some("upper_arm".into()),
                    kind: NodeKindConfig::Hinges {
                        offset: [0.3, 0.0, 0.0],
                        axes: vec![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
                        amplitude: 0.4,
                        frequency: 0.4,
                    },
                    tracked: true,
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_toml_round_trips_through_serde() {
        let text = r#"
            [simulation]
            frames = 100
            dt = 0.02
            stiffness = 0.5
            seed = 7

            [noise]
            position_sigma = 0.01
            rotation_sigma = 0.02

            [[nodes]]
            name = "chest"
            kind = "fixed"

            [[nodes]]
            name = "hand"
            parent = "chest"
            kind = "bone"
            offset = [0.0, 0.3, 0.0]
            axis = [0.0, 0.0, 1.0]
            amplitude = 0.5
            frequency = 0.2
            tracked = true
        "#;
        let config: ScenarioConfig = toml::from_str(text).unwrap();
        assert_eq!(config.simulation.frames, 100);
        assert_eq!(config.simulation.seed, Some(7));
        assert_eq!(config.nodes.len(), 2);
        assert!(config.nodes[1].tracked);
        assert!(matches!(config.nodes[1].kind, NodeKindConfig::Bone { .. }));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let text = r#"
            [simulation]
            frames = 10
            dt = 0.02
            stiffness = 0.0
            warp_factor = 9
        "#;
        assert!(toml::from_str::<ScenarioConfig>(text).is_err());
    }

    #[test]
    fn builtin_arm_names_are_unique_and_parented() {
        let config = ScenarioConfig::builtin_arm();
        let names: Vec<_> = config.nodes.iter().map(|n| n.name.as_str()).collect();
        for node in &config.nodes {
            if let Some(parent) = &node.parent {
                assert!(names.contains(&parent.as_str()));
            }
        }
    }
}
