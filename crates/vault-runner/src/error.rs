use std::path::PathBuf;

use thiserror::Error;

/// Failures that abort a whole pipeline invocation.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("section_not_found: no line contains marker '{marker}'")]
    SectionNotFound { marker: String },
    #[error("orphan_candidate: option line has no preceding label: {line}")]
    OrphanCandidate { line: String },
    #[error("invalid_position: {position} is outside 1..={len}")]
    InvalidPosition { position: usize, len: usize },
    #[error("invalid_bounds: lines {start}..={end} do not fit a {len}-line document")]
    InvalidBounds { start: usize, end: usize, len: usize },
    #[error("invalid_position: '{raw}' is not a positive integer")]
    UnparsablePosition { raw: String },
    #[error("io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid line pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("manifest serialization failed: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("invalid config {}: {source}", .path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

impl PipelineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for failures caused by the shape of the input document.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            PipelineError::SectionNotFound { .. } | PipelineError::OrphanCandidate { .. }
        )
    }
}

/// Recoverable failure of a single simulator invocation.
#[derive(Debug, Error)]
pub enum VariantError {
    #[error("failed to spawn simulator: {0}")]
    Spawn(#[source] std::io::Error),
    #[error(
        "simulator exited with status {}",
        .code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string())
    )]
    NonZeroExit { code: Option<i32> },
    #[error("simulator timed out after {millis}ms and was killed")]
    TimedOut { millis: u64 },
    #[error("simulator was killed on cancellation")]
    Killed,
    #[error("simulator did not write {}", .path.display())]
    MissingOutput { path: PathBuf },
    #[error("malformed simulator output {}: {source}", .path.display())]
    MalformedOutput {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("simulator output has no player entry")]
    NoEntity,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
