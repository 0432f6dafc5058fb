//! Engine that drives the server through its language-protocol mode.
//!
//! Framing, request ids and response matching are handled by a generic
//! JSON-RPC client. This module maps the engine contract onto it: command
//! names are moved into the server's `o#/` namespace and server
//! notifications are republished under their usual event names.

mod client;
mod codec;

use std::collections::HashMap;
use std::path::Path;
use std::process;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use url::Url;

use self::client::{CONTENT_MODIFIED, ClientError, NotificationHandler, RpcClient};
use crate::engine::{Engine, EngineDeps, EngineFut, StartRequest};
use crate::error::{LaunchError, RequestError, StartError, StopError};
use crate::events::{EventRegistry, Listener, Subscription, names};
use crate::launcher::{plan_launch, server_args, spawn};
use crate::sink::EngineEvent;
use crate::supervisor::{Lifecycle, SupervisedProcess, forward_stderr};
use crate::types::{EngineKind, ServerOptions, ServerState};
use crate::wire::LogRecord;

/// Attempts per request while the server keeps reporting modified content.
const MAX_ATTEMPTS: u32 = 5;
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

const LOG_NOTIFICATION: &str = "o#/log";
const READY_STATUS: &str = "o#/checkreadystatus";

/// Map an engine command or event name into the server's namespace.
pub(crate) fn normalize_command(command: &str) -> String {
    format!("o#/{command}").replace("//", "/").to_lowercase()
}

/// The protocol carries document text itself, so `Buffer` is never sent.
fn request_params(arguments: Option<Value>) -> Value {
    match arguments {
        Some(Value::Object(mut map)) => {
            map.remove("Buffer");
            Value::Object(map)
        }
        Some(Value::Null) | None => json!({}),
        Some(other) => other,
    }
}

fn initialize_params(root: &Path) -> Result<Value, StartError> {
    let root_uri = Url::from_directory_path(root).map_err(|()| {
        StartError::Initialize(format!("workspace root {} is not absolute", root.display()))
    })?;
    let name = root
        .file_name()
        .map_or_else(|| root.display().to_string(), |n| n.to_string_lossy().into_owned());
    Ok(json!({
        "processId": process::id(),
        "rootUri": root_uri.as_str(),
        "capabilities": {},
        "workspaceFolders": [{ "uri": root_uri.as_str(), "name": name }],
    }))
}

/// Route server notifications to the event registry and the sink.
fn notification_handler(lifecycle: Arc<Lifecycle>) -> NotificationHandler {
    let event_names: HashMap<String, &'static str> = names::SERVER_EVENTS
        .iter()
        .map(|&name| (normalize_command(name), name))
        .collect();

    Arc::new(move |method, params| {
        if method == LOG_NOTIFICATION {
            let body = params.get("Body").unwrap_or(&params);
            match LogRecord::from_body(body) {
                Some(record) => lifecycle.sink().post(EngineEvent::Log(record)),
                None => tracing::debug!("malformed log notification"),
            }
            return;
        }
        match event_names.get(method) {
            Some(name) => lifecycle.publish(name, &params),
            None => tracing::trace!("ignoring notification {method}"),
        }
    })
}

fn request_error(command: &str, err: ClientError) -> RequestError {
    let command = command.to_string();
    match err {
        ClientError::Rpc(e) => RequestError::Failed {
            command,
            message: e.message,
        },
        ClientError::Cancelled => RequestError::Cancelled { command },
        ClientError::Closed => RequestError::ServerStopped { command },
    }
}

/// Send `method`, retrying while the server answers "content modified".
async fn request_with_retry(
    client: &RpcClient,
    method: &str,
    params: &Value,
    token: Option<&CancellationToken>,
) -> Result<Value, ClientError> {
    let mut attempt = 1;
    loop {
        match client.request(method, Some(params.clone()), token).await {
            Err(ClientError::Rpc(e)) if e.code == CONTENT_MODIFIED && attempt < MAX_ATTEMPTS => {
                tracing::debug!(method, attempt, "content modified; retrying");
                attempt += 1;
            }
            result => return result,
        }
    }
}

struct Connection {
    client: Arc<RpcClient>,
    process: Option<SupervisedProcess>,
    stderr: JoinHandle<()>,
    /// Set once `initialize` succeeded; only then is `shutdown` sent.
    initialized: bool,
}

/// Engine for servers started in language-protocol mode.
pub struct LspEngine {
    options: ServerOptions,
    deps: EngineDeps,
    lifecycle: Arc<Lifecycle>,
    connection: Mutex<Option<Connection>>,
    transition: AsyncMutex<()>,
    start_abort: Mutex<Option<CancellationToken>>,
}

impl LspEngine {
    #[must_use]
    pub fn new(options: ServerOptions, deps: EngineDeps) -> Self {
        let lifecycle = Arc::new(Lifecycle::new(
            EventRegistry::new(),
            Arc::clone(&deps.sink),
        ));
        Self {
            options,
            deps,
            lifecycle,
            connection: Mutex::new(None),
            transition: AsyncMutex::new(()),
            start_abort: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn events(&self) -> &EventRegistry {
        self.lifecycle.events()
    }

    fn connection(&self) -> MutexGuard<'_, Option<Connection>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_connection(&self) -> Option<Connection> {
        self.connection().take()
    }

    fn start_abort(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.start_abort.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn client(&self) -> Option<Arc<RpcClient>> {
        self.connection()
            .as_ref()
            .map(|connection| Arc::clone(&connection.client))
    }

    async fn connect(&self, request: StartRequest) -> Result<Arc<RpcClient>, StartError> {
        let mut caller_args = vec![String::from("-lsp")];
        caller_args.extend(request.args);
        let args = server_args(
            &caller_args,
            &request.target,
            process::id(),
            &self.options,
        );
        let plan = plan_launch(&self.options, args, &self.deps.resolvers, self.deps.platform).await?;
        let mut child = spawn(&plan, &request.cwd)?;
        self.deps.sink.post(EngineEvent::Launched {
            program: plan.program.clone(),
            host_version: plan.host_version().map(str::to_owned),
            pid: child.id(),
        });

        let stdin = child.stdin.take().ok_or(LaunchError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(LaunchError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(LaunchError::MissingPipe("stderr"))?;

        let client = Arc::new(RpcClient::connect(
            stdout,
            stdin,
            notification_handler(Arc::clone(&self.lifecycle)),
        ));
        let stderr = forward_stderr(
            stderr,
            self.lifecycle.events().clone(),
            Arc::clone(self.lifecycle.sink()),
        );

        let lifecycle = Arc::clone(&self.lifecycle);
        let process = SupervisedProcess::watch(child, move |code| {
            lifecycle.sink().post(EngineEvent::UnexpectedExit { code });
            lifecycle.set_state(ServerState::Stopped);
            lifecycle.publish(names::SERVER_EXITED, &json!({ "code": code }));
        });

        *self.connection() = Some(Connection {
            client: Arc::clone(&client),
            process: Some(process),
            stderr,
            initialized: false,
        });
        Ok(client)
    }

    async fn initialize(&self, client: &RpcClient, root: &Path) -> Result<(), StartError> {
        let params = initialize_params(root)?;
        client
            .request("initialize", Some(params), None)
            .await
            .map_err(|e| StartError::Initialize(e.to_string()))?;
        client
            .notify("initialized", Some(json!({})))
            .await
            .map_err(|e| StartError::Initialize(e.to_string()))
    }

    async fn start_inner(&self, request: StartRequest) -> Result<(), StartError> {
        let _transition = self.transition.lock().await;
        if self.lifecycle.state() != ServerState::Stopped {
            return Err(StartError::AlreadyRunning);
        }
        let abort = CancellationToken::new();
        *self.start_abort() = Some(abort.clone());
        if let Some(stale) = self.take_connection() {
            let _ = self.teardown(stale).await;
        }
        let result = self.connect_until_ready(request, &abort).await;
        self.start_abort().take();
        result
    }

    async fn connect_until_ready(
        &self,
        request: StartRequest,
        abort: &CancellationToken,
    ) -> Result<(), StartError> {
        self.lifecycle.set_state(ServerState::Starting);
        let root = request.cwd.clone();
        let client = match self.connect(request).await {
            Ok(client) => client,
            Err(e) => {
                self.lifecycle.set_state(ServerState::Stopped);
                return Err(e);
            }
        };

        let timeout = self.options.project_load_timeout();
        let result = tokio::select! {
            result = time::timeout(timeout, self.initialize(&client, &root)) => {
                result.unwrap_or(Err(StartError::Timeout { timeout }))
            }
            () = abort.cancelled() => Err(StartError::Stopped),
        };
        if let Err(e) = result {
            tracing::warn!("language server failed to start: {e}");
            let _ = self.shutdown_connection().await;
            return Err(e);
        }

        if let Some(connection) = self.connection().as_mut() {
            connection.initialized = true;
        }
        self.lifecycle.set_state(ServerState::Started);
        self.lifecycle.publish(names::SERVER_START, &Value::Null);
        Ok(())
    }

    async fn teardown(&self, mut connection: Connection) -> Result<(), StopError> {
        let client = &connection.client;
        let polite = async {
            if client.request("shutdown", None, None).await.is_ok() {
                let _ = client.notify("exit", None).await;
            }
        };
        if connection.initialized && time::timeout(SHUTDOWN_TIMEOUT, polite).await.is_err() {
            tracing::debug!("language server ignored shutdown request");
        }

        let result = match connection.process.take() {
            Some(process) => {
                process
                    .shutdown(self.deps.tree.as_ref(), self.deps.platform)
                    .await
            }
            None => Ok(()),
        };
        connection.stderr.abort();
        result
    }

    async fn shutdown_connection(&self) -> Result<(), StopError> {
        let Some(connection) = self.take_connection() else {
            self.lifecycle.set_state(ServerState::Stopped);
            return Ok(());
        };
        let result = self.teardown(connection).await;
        if let Err(e) = &result {
            tracing::warn!(pid = e.pid, "failed to stop language server: {}", e.source);
        }
        self.lifecycle.set_state(ServerState::Stopped);
        self.lifecycle.publish(names::SERVER_STOP, &Value::Null);
        result
    }

    async fn stop_inner(&self) -> Result<(), StopError> {
        if let Some(abort) = self.start_abort().take() {
            abort.cancel();
        }
        let _transition = self.transition.lock().await;
        self.shutdown_connection().await
    }

    async fn wait_inner(&self) {
        let Some(client) = self.client() else {
            return;
        };
        loop {
            match client.request(READY_STATUS, None, None).await {
                Ok(Value::Bool(true)) => return,
                Ok(_) => time::sleep(READY_POLL_INTERVAL).await,
                Err(e) => {
                    tracing::debug!("ready status check failed: {e}");
                    return;
                }
            }
        }
    }

    async fn request_inner(
        &self,
        command: &str,
        arguments: Option<Value>,
        token: Option<CancellationToken>,
    ) -> Result<Value, RequestError> {
        if self.lifecycle.state() == ServerState::Stopped {
            return Err(RequestError::NotRunning);
        }
        let client = self.client().ok_or(RequestError::NotRunning)?;
        let method = normalize_command(command);
        let params = request_params(arguments);
        request_with_retry(&client, &method, &params, token.as_ref())
            .await
            .map_err(|e| request_error(command, e))
    }
}

impl Engine for LspEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Lsp
    }

    fn state(&self) -> ServerState {
        self.lifecycle.state()
    }

    fn start(&self, request: StartRequest) -> EngineFut<'_, Result<(), StartError>> {
        Box::pin(self.start_inner(request))
    }

    fn stop(&self) -> EngineFut<'_, Result<(), StopError>> {
        Box::pin(self.stop_inner())
    }

    fn wait_for_initialize(&self) -> EngineFut<'_, ()> {
        Box::pin(self.wait_inner())
    }

    fn make_request<'a>(
        &'a self,
        command: &'a str,
        arguments: Option<Value>,
        token: Option<CancellationToken>,
    ) -> EngineFut<'a, Result<Value, RequestError>> {
        Box::pin(self.request_inner(command, arguments, token))
    }

    fn subscribe(&self, event: &str, listener: Listener) -> Subscription {
        self.lifecycle.events().subscribe(event, listener)
    }
}
