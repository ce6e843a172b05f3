use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type returned by simulation entry points.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Malformed or ambiguous sweep declaration. Fatal at load time.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("unknown strategy '{0}'")]
    UnknownStrategy(String),

    #[error("missing strategy: need a 'variation' or 'strategy' entry")]
    MissingStrategy,

    #[error("ambiguous strategy: {0:?} are defined, select one by name")]
    AmbiguousStrategy(Vec<String>),

    #[error("axis '{0}' has no values")]
    EmptyAxis(String),

    #[error("{kind} requires {expected}, got {got} axes")]
    InvalidAxisCount {
        kind: &'static str,
        expected: &'static str,
        got: usize,
    },

    #[error("invalid bounds for '{key}' (low={low}, high={high}): low must be below high")]
    InvalidBounds { key: String, low: f64, high: f64 },

    #[error("invalid sample count {0}: must be positive")]
    InvalidSampleCount(i64),

    #[error("sobol sequence supports at most {max} dimensions, got {got}")]
    TooManyDimensions { max: usize, got: usize },

    #[error("duplicate task name '{0}'")]
    DuplicateTaskName(String),

    #[error("task name '{0}' must be a single path component")]
    InvalidTaskName(String),

    #[error("expected {expected} task names, got {got}")]
    NameCountMismatch { expected: usize, got: usize },

    #[error("invalid entry '{key}': {reason}")]
    InvalidEntry { key: String, reason: String },

    #[error("unsupported output format '{0}'")]
    UnsupportedFormat(String),

    #[error("contradictory output path specification")]
    ContradictoryPath,

    #[error("failed to parse declaration: {0}")]
    Parse(String),

    #[error("failed to read declaration: {0}")]
    Io(String),
}

impl ConfigurationError {
    pub(crate) fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigurationError::InvalidEntry {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Illegal artifact lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("task '{0}' is already finalized")]
    AlreadyFinalized(String),

    #[error("artifact for task '{0}' already exists (use force to override)")]
    ArtifactExists(String),
}

/// Artifact could not be written, flushed or read back.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("container error: {0}")]
    Container(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by [`crate::output::Output`] operations.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl OutputError {
    pub fn kind(&self) -> FailureKind {
        match self {
            OutputError::State(_) => FailureKind::State,
            OutputError::Persistence(_) => FailureKind::Persistence,
        }
    }
}

impl From<std::io::Error> for OutputError {
    fn from(err: std::io::Error) -> Self {
        OutputError::Persistence(err.into())
    }
}

impl From<csv::Error> for OutputError {
    fn from(err: csv::Error) -> Self {
        OutputError::Persistence(err.into())
    }
}

impl From<rusqlite::Error> for OutputError {
    fn from(err: rusqlite::Error) -> Self {
        OutputError::Persistence(err.into())
    }
}

impl From<serde_json::Error> for OutputError {
    fn from(err: serde_json::Error) -> Self {
        OutputError::Persistence(err.into())
    }
}

/// Class of a task failure, as reported in results and summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Simulation,
    State,
    Persistence,
}

/// The wrapped simulation entry point failed.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("simulation failed: {0}")]
    Failed(BoxError),

    #[error("simulation panicked: {0}")]
    Panicked(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_error_is_transparent() {
        let err: OutputError = StateError::AlreadyFinalized("case_00".into()).into();
        assert_eq!(err.to_string(), "task 'case_00' is already finalized");
    }

    #[test]
    fn test_output_error_kind() {
        let state: OutputError = StateError::ArtifactExists("case_00".into()).into();
        assert_eq!(state.kind(), FailureKind::State);
        let io: OutputError = std::io::Error::other("disk full").into();
        assert_eq!(io.kind(), FailureKind::Persistence);
    }

    #[test]
    fn test_io_error_maps_to_persistence() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: OutputError = io.into();
        assert!(matches!(
            err,
            OutputError::Persistence(PersistenceError::Io(_))
        ));
    }
}
