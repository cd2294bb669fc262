use thiserror::Error;

/// Errors surfaced at the workload-driver boundary. The concurrent core
/// has none: lock conflicts restart internally and are never visible, and
/// a missing key is an ordinary `None`, not an error.
#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("failed to read workload file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("workload line {line}: unknown op token {token:?}")]
    UnknownOp { line: usize, token: String },
    #[error("workload line {line}: missing or invalid key")]
    BadKey { line: usize },
}
