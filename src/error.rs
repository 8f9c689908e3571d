use thiserror::Error;

/// Errors raised by the MLMC engine.
///
/// Configuration problems are fatal and surface before any evaluation.
/// Numerical degeneracies are never reported through this type; they are
/// clamped where they occur and logged.
#[derive(Debug, Error)]
pub enum MlmcError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("scalarization matrix must be {rows} x {cols}, got {got_rows} x {got_cols}")]
    ScalarizationShape {
        rows: usize,
        cols: usize,
        got_rows: usize,
        got_cols: usize,
    },

    #[error("unsupported combination: {0}")]
    Unsupported(String),

    #[error("no samples specified: every level has a zero pilot count")]
    EmptyPilot,

    #[error("evaluation failed at level {level}: {reason}")]
    Evaluation { level: usize, reason: String },

    #[error("allocation solver failed: {0}")]
    Solver(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MlmcError>;
