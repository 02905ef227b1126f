//! Error types for localsvc.

use std::io;

use thiserror::Error;

/// Errors that can occur while managing a local container service.
#[derive(Debug, Error)]
pub enum Error {
    /// The image tool could not be spawned or exited non-zero.
    #[error("{tool} {command} failed{}: {message}", exit_suffix(.exit_code))]
    ToolInvocation {
        tool: String,
        command: String,
        exit_code: Option<i32>,
        message: String,
    },

    /// Image build failed. Nothing was created.
    #[error("image build failed: {0}")]
    Build(#[source] Box<Error>),

    /// Instance run failed after a successful build. The image was rolled back.
    #[error("failed to start instance from image {build_id}: {source}")]
    DaemonStart {
        build_id: String,
        #[source]
        source: Box<Error>,
    },

    /// Instance removal failed for a reason other than the instance being gone.
    #[error("failed to remove instance {instance_id}: {source}")]
    DaemonStop {
        instance_id: String,
        #[source]
        source: Box<Error>,
    },

    /// The readiness probe exhausted its attempts.
    #[error("service at {url} not ready after {attempts} attempts: {last_error}")]
    ReadinessTimeout {
        url: String,
        attempts: u32,
        last_error: String,
    },

    /// The readiness probe was cancelled before the service became ready.
    #[error("readiness probe for {url} cancelled after {attempts} attempts")]
    ProbeCancelled { url: String, attempts: u32 },

    /// Artifact store I/O failure.
    #[error("artifact {pointer}: {source}")]
    Artifact {
        pointer: String,
        #[source]
        source: io::Error,
    },

    /// Local state file I/O failure.
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Operation not allowed in the current lifecycle state.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Invalid configuration or service options.
    #[error("invalid configuration: {0}")]
    Config(String),
}

fn exit_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with exit code {code}"),
        None => String::new(),
    }
}

impl Error {
    /// Create an artifact error for a pointer.
    pub fn artifact(pointer: impl Into<String>, source: io::Error) -> Self {
        Error::Artifact {
            pointer: pointer.into(),
            source,
        }
    }

    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Innermost tool failure, if this error originates from one.
    pub fn tool_failure(&self) -> Option<&Error> {
        match self {
            Error::ToolInvocation { .. } => Some(self),
            Error::Build(source)
            | Error::DaemonStart { source, .. }
            | Error::DaemonStop { source, .. } => source.tool_failure(),
            _ => None,
        }
    }
}

/// Result type for localsvc operations.
pub type Result<T> = std::result::Result<T, Error>;
