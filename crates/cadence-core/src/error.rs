//! Error types for graph construction, planning, and execution.

use thiserror::Error;

use crate::graph::{NodeId, Shape};

/// Errors that can occur during graph operations.
///
/// Every fatal condition aborts the current build or run as a whole: no
/// partially valid traversal order is cached and no partial result is kept.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GraphError {
    /// A node with this name (compared case-insensitively) already exists.
    #[error("duplicate node name: {0}")]
    DuplicateName(String),

    /// No node with this name exists.
    #[error("node not found: {0}")]
    NotFound(String),

    /// The handle does not refer to a live node.
    #[error("{0} does not refer to a live node")]
    InvalidNode(NodeId),

    /// Validation found incompatible shapes along an edge.
    #[error("dimension mismatch at '{node}' input '{input}': expected {expected}, found {found}")]
    DimensionMismatch {
        /// Node whose validation failed.
        node: String,
        /// Input node feeding the incompatible value.
        input: String,
        /// Shape the node requires for that input.
        expected: Shape,
        /// Shape the input actually has.
        found: Shape,
    },

    /// A node has the wrong number of inputs for its operation.
    #[error("node '{node}' expects {expected} inputs, found {found}")]
    InputCount {
        /// Node whose validation failed.
        node: String,
        /// Number of inputs the operation requires.
        expected: usize,
        /// Number of inputs actually connected.
        found: usize,
    },

    /// Cyclic structure that cannot be executed: overlapping loops, a loop
    /// without a delay, or conflicting step directions inside one loop.
    #[error("fatal graph error: {0}")]
    FatalGraph(String),

    /// An argument was rejected before touching the graph.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested operation is not valid in the current run state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Result type for graph operations.
pub type Result<T> = core::result::Result<T, GraphError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Cols;

    #[test]
    fn duplicate_name_display() {
        let err = GraphError::DuplicateName("W0".to_string());
        assert_eq!(err.to_string(), "duplicate node name: W0");
    }

    #[test]
    fn not_found_display() {
        let err = GraphError::NotFound("missing".to_string());
        assert_eq!(err.to_string(), "node not found: missing");
    }

    #[test]
    fn dimension_mismatch_names_both_ends() {
        let err = GraphError::DimensionMismatch {
            node: "plus".to_string(),
            input: "features".to_string(),
            expected: Shape::new(3, Cols::Minibatch),
            found: Shape::new(4, Cols::Minibatch),
        };
        let msg = err.to_string();
        assert!(msg.contains("'plus'"), "got: {msg}");
        assert!(msg.contains("'features'"), "got: {msg}");
        assert!(msg.contains("3 x mb"), "got: {msg}");
        assert!(msg.contains("4 x mb"), "got: {msg}");
    }

    #[test]
    fn fatal_graph_display() {
        let err = GraphError::FatalGraph("loop 0 has no delay".to_string());
        assert_eq!(err.to_string(), "fatal graph error: loop 0 has no delay");
    }
}
