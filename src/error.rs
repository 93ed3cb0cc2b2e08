use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FaceForgeError>;

/// Error context for better debugging and recovery
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub stage: Option<String>,
    pub point_count: Option<usize>,
    pub operation: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_point_count(mut self, count: usize) -> Self {
        self.point_count = Some(count);
        self
    }

    pub fn with_operation(mut self, op: impl Into<String>) -> Self {
        self.operation = Some(op.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        if let Some(stage) = &self.stage {
            parts.push(format!("stage={}", stage));
        }
        if let Some(op) = &self.operation {
            parts.push(format!("operation={}", op));
        }
        if let Some(count) = self.point_count {
            parts.push(format!("points={}", count));
        }

        if parts.is_empty() {
            write!(f, "[no context]")
        } else {
            write!(f, "[{}]", parts.join(", "))
        }
    }
}

#[derive(Error, Debug)]
pub enum FaceForgeError {
    #[error("Invalid input: {0}")]
    InputInvalid(String),

    #[error("Empty input: {0}")]
    EmptyInput(&'static str),

    #[error("Point cloud too sparse: {points} usable points (minimum {minimum})")]
    PointCloudTooSparse { points: usize, minimum: usize },

    #[error("Optimizer diverged to a non-finite loss during stage '{stage}'")]
    DivergedNonFinite { stage: String },

    #[error("Degenerate geometry: {0}")]
    DegenerateGeometry(String),

    #[error("Model asset load failed: {0}")]
    AssetLoad(String),

    #[error("Job cancelled")]
    Cancelled,

    #[error("Sparse solve failed to converge: {0}")]
    SolverFailure(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FaceForgeError {
    /// True when the caller may retry with a degraded configuration instead
    /// of surfacing the failure.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FaceForgeError::DegenerateGeometry(_) | FaceForgeError::SolverFailure(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_display_formats_known_fields() {
        let ctx = ErrorContext::new()
            .with_stage("fit")
            .with_operation("adam_step")
            .with_point_count(1500);
        let rendered = ctx.to_string();
        assert!(rendered.contains("stage=fit"));
        assert!(rendered.contains("operation=adam_step"));
        assert!(rendered.contains("points=1500"));
    }

    #[test]
    fn sparse_error_carries_counts() {
        let err = FaceForgeError::PointCloudTooSparse {
            points: 120,
            minimum: 200,
        };
        assert!(err.to_string().contains("120"));
        assert!(!err.is_recoverable());
    }
}
