//! Typed failures returned by every launch component.
//!
//! Each variant maps to one failure kind a caller may want to react to.
//! Nothing in the orchestrator retries: any `LaunchError` is terminal for the
//! machine being launched.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LaunchError {
    /// Missing or inconsistent machine or network settings.
    #[error("configuration error: {0}")]
    Config(String),

    /// A tap device was requested for a network that was never started.
    #[error("undefined network '{0}'")]
    UnknownNetwork(String),

    /// `start_networks` was called for a network that is already registered.
    #[error("network '{0}' is already started")]
    NetworksAlreadyStarted(String),

    /// No default option set exists for the architecture.
    #[error("unsupported architecture '{0}'")]
    UnsupportedArch(String),

    #[error("{context}: {path}: {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("download failed: {0}")]
    Download(String),

    /// The seed-image tool could not be started or exited non-zero.
    #[error("seed image tool failed: {0}")]
    SeedTool(String),

    #[error("`{program}` failed: {reason}")]
    Process { program: String, reason: String },

    /// The shutdown signal fired while a subprocess was running.
    #[error("`{0}` was cancelled by shutdown")]
    Cancelled(String),
}

pub type Result<T> = std::result::Result<T, LaunchError>;

impl LaunchError {
    pub(crate) fn io(context: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LaunchError::Io {
            context,
            path: path.into(),
            source,
        }
    }
}

/// Attach a context string and path to a raw `std::io::Error`.
pub(crate) trait IoContext<T> {
    fn io_context(self, context: &'static str, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context(self, context: &'static str, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| LaunchError::io(context, path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_message_names_path_and_context() {
        let err: Result<()> = Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"))
            .io_context("copy firmware vars", "/tmp/vars.fd");
        let msg = err.unwrap_err().to_string();
        assert!(msg.contains("copy firmware vars"), "got: {msg}");
        assert!(msg.contains("/tmp/vars.fd"), "got: {msg}");
        assert!(msg.contains("gone"), "got: {msg}");
    }

    #[test]
    fn unknown_network_message() {
        let err = LaunchError::UnknownNetwork("lan".to_string());
        assert_eq!(err.to_string(), "undefined network 'lan'");
    }
}
