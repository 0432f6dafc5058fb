//! Public configuration and state types.
//!
//! [`ServerOptions`] is deserialized from the `[server]` table of the user
//! configuration; every field has a default so an empty table is valid.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of requests the Normal queue may have in flight.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Default seconds to wait for the server to report that it has started.
pub const DEFAULT_PROJECT_LOAD_TIMEOUT_SECS: u64 = 60;

/// Default cap on files inspected during launch target discovery.
pub const DEFAULT_MAX_PROJECT_RESULTS: usize = 250;

/// Which transport the engine uses to talk to the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Native line-delimited packets over stdio.
    #[default]
    Stdio,
    /// JSON-RPC with `Content-Length` framing (language server protocol).
    Lsp,
}

/// How the server executable is invoked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKind {
    /// Pick from the server path and platform.
    #[default]
    Auto,
    /// Run the server path as a native executable.
    Direct,
    /// Run the server assembly under `mono`.
    Mono,
    /// Run the server assembly under `dotnet`.
    Dotnet,
}

/// Configuration for launching and talking to the analysis server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    pub engine: EngineKind,
    /// Server executable or assembly. Resolved through `PATH` when relative.
    pub path: Option<String>,
    pub host: HostKind,
    /// Minimum accepted `mono` version, e.g. "6.4.0".
    pub min_mono_version: String,
    /// In-flight cap of the Normal queue. Deferred gets a quarter of it
    /// (at least 2) and Priority always gets exactly one slot.
    pub concurrency: usize,
    /// Seconds to wait for the server's `started` event.
    pub project_load_timeout: u64,
    pub max_project_results: usize,
    /// Appended after the arguments the engine always passes.
    pub extra_args: Vec<String>,
    /// Extra environment for the server process.
    pub env: HashMap<String, String>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            engine: EngineKind::default(),
            path: None,
            host: HostKind::default(),
            min_mono_version: String::from("6.4.0"),
            concurrency: DEFAULT_CONCURRENCY,
            project_load_timeout: DEFAULT_PROJECT_LOAD_TIMEOUT_SECS,
            max_project_results: DEFAULT_MAX_PROJECT_RESULTS,
            extra_args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

impl ServerOptions {
    #[must_use]
    pub fn project_load_timeout(&self) -> Duration {
        Duration::from_secs(self.project_load_timeout)
    }
}

/// Lifecycle state of the supervised server process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ServerState {
    Starting,
    Started,
    #[default]
    Stopped,
}

impl ServerState {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopped => "stopped",
        }
    }
}

/// Operating system family, which decides host selection and how a process
/// tree is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Posix,
}

impl Platform {
    #[must_use]
    pub fn current() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Posix
        }
    }
}
