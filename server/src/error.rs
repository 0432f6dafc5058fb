//! Error types surfaced to callers of an [`Engine`](crate::Engine).

use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// The server could not be launched.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("no server path configured and `OmniSharp` was not found in PATH")]
    NoServerPath,
    #[error("server executable not found at {}", path.display())]
    ServerNotFound { path: PathBuf },
    #[error("{name} not found in PATH")]
    HostNotFound {
        name: String,
        #[source]
        source: which::Error,
    },
    #[error("cannot start the server because {host} version >={required} is required (found {found})")]
    HostVersion {
        host: String,
        required: String,
        found: String,
    },
    #[error("failed to query {host} version")]
    HostProbe {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn {}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("server process has no {0} pipe")]
    MissingPipe(&'static str),
}

/// `start()` did not bring the server to the started state.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("server is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(
        "server load timed out after {}s. Use the `project_load_timeout` setting to override the default delay (one minute)",
        timeout.as_secs()
    )]
    Timeout { timeout: Duration },
    #[error("server exited before it finished starting")]
    Exited,
    #[error("server was stopped before it finished starting")]
    Stopped,
    #[error("server initialization failed: {0}")]
    Initialize(String),
}

/// Failure of a single request. Only the affected caller observes it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("request '{command}' was cancelled")]
    Cancelled { command: String },
    #[error("'{command}' failed: {message}")]
    Failed { command: String, message: String },
    #[error("server stopped before '{command}' completed")]
    ServerStopped { command: String },
    #[error("server is not running")]
    NotRunning,
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Tearing down the process tree failed. The engine still ends up stopped.
#[derive(Debug, thiserror::Error)]
#[error("failed to terminate server process tree rooted at pid {pid}")]
pub struct StopError {
    pub pid: u32,
    #[source]
    pub source: io::Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_setting() {
        let err = StartError::Timeout {
            timeout: Duration::from_secs(60),
        };
        let message = err.to_string();
        assert!(message.contains("project_load_timeout"));
        assert!(message.contains("60s"));
    }

    #[test]
    fn test_request_failure_carries_server_message() {
        let err = RequestError::Failed {
            command: "/codecheck".to_string(),
            message: "file not found".to_string(),
        };
        assert_eq!(err.to_string(), "'/codecheck' failed: file not found");
    }
}
