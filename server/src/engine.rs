//! The transport-agnostic contract every engine implements.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{RequestError, StartError, StopError};
use crate::events::{Listener, Subscription};
use crate::launch_target::LaunchTarget;
use crate::launcher::HostResolvers;
use crate::lsp::LspEngine;
use crate::process_tree::{ProcessTree, SystemProcessTree};
use crate::sink::{EventSink, TracingSink};
use crate::stdio::StdioEngine;
use crate::types::{EngineKind, Platform, ServerOptions, ServerState};

pub type EngineFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What to launch the server on.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub cwd: PathBuf,
    /// Arguments placed before the ones the engine adds itself.
    pub args: Vec<String>,
    pub target: LaunchTarget,
}

/// Collaborators an engine is built with.
#[derive(Clone)]
pub struct EngineDeps {
    pub resolvers: HostResolvers,
    pub tree: Arc<dyn ProcessTree>,
    pub sink: Arc<dyn EventSink>,
    pub platform: Platform,
}

impl Default for EngineDeps {
    fn default() -> Self {
        Self {
            resolvers: HostResolvers::default(),
            tree: Arc::new(SystemProcessTree),
            sink: Arc::new(TracingSink),
            platform: Platform::current(),
        }
    }
}

impl fmt::Debug for EngineDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineDeps")
            .field("platform", &self.platform)
            .finish_non_exhaustive()
    }
}

/// A connection to one server process.
///
/// Callers never need to know which transport sits behind it.
pub trait Engine: Send + Sync {
    fn kind(&self) -> EngineKind;

    fn state(&self) -> ServerState;

    /// Launch the server and wait until it reports readiness.
    fn start(&self, request: StartRequest) -> EngineFut<'_, Result<(), StartError>>;

    /// Tear the server down. Calling it while stopped does nothing.
    fn stop(&self) -> EngineFut<'_, Result<(), StopError>>;

    /// Resolve once the server has worked through its startup backlog.
    fn wait_for_initialize(&self) -> EngineFut<'_, ()>;

    /// Send `command` and wait for its response body.
    ///
    /// Cancelling `token` withdraws the request if it has not been sent yet.
    /// After it was sent the request runs to completion.
    fn make_request<'a>(
        &'a self,
        command: &'a str,
        arguments: Option<Value>,
        token: Option<CancellationToken>,
    ) -> EngineFut<'a, Result<Value, RequestError>>;

    /// Register `listener` for `event`. Dropping the handle unsubscribes.
    fn subscribe(&self, event: &str, listener: Listener) -> Subscription;
}

impl dyn Engine {
    /// [`make_request`](Engine::make_request) with the body decoded into `T`.
    pub async fn request<T: DeserializeOwned>(
        &self,
        command: &str,
        arguments: Option<Value>,
        token: Option<CancellationToken>,
    ) -> Result<T, RequestError> {
        let body = self.make_request(command, arguments, token).await?;
        serde_json::from_value(body).map_err(|e| {
            RequestError::Protocol(format!("unexpected response body for '{command}': {e}"))
        })
    }
}

/// Build the engine selected by `options.engine`.
#[must_use]
pub fn create_engine(options: ServerOptions, deps: EngineDeps) -> Box<dyn Engine> {
    match options.engine {
        EngineKind::Stdio => Box::new(StdioEngine::new(options, deps)),
        EngineKind::Lsp => Box::new(LspEngine::new(options, deps)),
    }
}
