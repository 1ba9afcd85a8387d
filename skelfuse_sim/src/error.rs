// skelfuse_sim/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("failed to read scenario file {path}")]
    ScenarioRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse scenario file")]
    ScenarioParse(#[from] toml::de::Error),

    #[error("scenario error: {0}")]
    Scenario(String),

    #[error(transparent)]
    Model(#[from] skelfuse_core::error::ModelError),
}
