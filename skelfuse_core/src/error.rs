// skelfuse_core/src/error.rs

use crate::types::NodeDescriptor;
use thiserror::Error;

/// Structural failures of the skeleton model. Numerical failures during
/// fusion never surface here; they mark the affected node invalid and the
/// pass continues (see `fusion`).
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("node '{0}' is not registered in the model")]
    UnknownNode(NodeDescriptor),

    #[error("node '{node}' declares unregistered parent '{parent}'")]
    UnresolvedParent {
        node: NodeDescriptor,
        parent: NodeDescriptor,
    },

    #[error("parent links of node '{0}' form a cycle")]
    CyclicHierarchy(NodeDescriptor),

    #[error("hierarchy has not been enumerated; call enumerate_hierarchy() after topology setup")]
    HierarchyNotBuilt,

    #[error("expectation/variance dimensions disagree: {expected} vs {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}
