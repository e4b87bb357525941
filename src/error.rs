use thiserror::Error;

use crate::tensor::TensorDtype;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Graph integrity error: {0}")]
    GraphIntegrity(String),

    #[error("Unresolved input: placeholder '{name}' was not supplied")]
    UnresolvedInput { name: String },

    #[error("Shape mismatch in '{op}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        op: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Dtype mismatch in '{op}': expected {expected:?}, got {actual:?}")]
    DTypeMismatch {
        op: String,
        expected: TensorDtype,
        actual: TensorDtype,
    },

    #[error("Recursion error: {0}")]
    Recursion(String),

    #[error("Frame state error: {0}")]
    FrameState(String),

    #[error("Memory error: {0}")]
    Memory(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),
}

impl SessionError {
    pub(crate) fn integrity(msg: impl Into<String>) -> Self {
        SessionError::GraphIntegrity(msg.into())
    }

    pub(crate) fn shape(op: &str, expected: &[usize], actual: &[usize]) -> Self {
        SessionError::ShapeMismatch {
            op: op.to_string(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
