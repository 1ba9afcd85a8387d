// skelfuse_core/src/lib.rs

pub mod articulation;
pub(crate) mod chain;
pub mod error;
pub(crate) mod fusion;
pub(crate) mod jacobian;
pub mod math;
pub mod measurement;
pub mod model;
pub mod node;
pub mod parameters;
pub mod prelude;
pub mod types;
