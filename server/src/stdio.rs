//! Engine that speaks the line-delimited JSON protocol directly.
//!
//! One actor task owns the multiplexer and the sequence counter. The stdout
//! reader, the process monitor and callers only send it messages, so request
//! admission and response matching never race each other.

use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::engine::{Engine, EngineDeps, EngineFut, StartRequest};
use crate::error::{LaunchError, RequestError, StartError, StopError};
use crate::events::{EventRegistry, Listener, Subscription, names};
use crate::launcher::{plan_launch, server_args, spawn};
use crate::multiplexer::RequestMultiplexer;
use crate::queue::{Request, RequestId, RequestResult};
use crate::sink::{EngineEvent, EventSink};
use crate::supervisor::{Lifecycle, SupervisedProcess, forward_stderr};
use crate::types::{EngineKind, ServerOptions, ServerState};
use crate::wire::{
    EventPacket, Inbound, LineReader, LineWriter, PacketSink, ResponsePacket, WireSender,
    decode_line,
};

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

enum Message {
    Enqueue(Request),
    Cancel { command: String, id: RequestId },
    Line(String),
    ReaderClosed,
    ProcessExited(Option<i32>),
    IsIdle(oneshot::Sender<bool>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Started,
    Exited,
}

/// Writes to the server and reports each request on the event sink.
struct Outbox<'a> {
    wire: &'a mut WireSender,
    sink: &'a dyn EventSink,
}

impl PacketSink for Outbox<'_> {
    fn send(&mut self, request: &Request) -> u64 {
        let seq = self.wire.send(request);
        self.sink.post(EngineEvent::RequestSent {
            command: request.command().to_string(),
            seq,
        });
        seq
    }
}

struct Actor {
    mux: RequestMultiplexer,
    wire: WireSender,
    lifecycle: Arc<Lifecycle>,
    /// Requests stay queued until the server announced itself.
    started: bool,
    ready: Option<oneshot::Sender<Readiness>>,
}

impl Actor {
    fn new(
        concurrency: usize,
        wire: WireSender,
        lifecycle: Arc<Lifecycle>,
        ready: oneshot::Sender<Readiness>,
    ) -> Self {
        Self {
            mux: RequestMultiplexer::new(concurrency),
            wire,
            lifecycle,
            started: false,
            ready: Some(ready),
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        while let Some(message) = rx.recv().await {
            match message {
                Message::Enqueue(request) => self.enqueue(request),
                Message::Cancel { command, id } => {
                    self.mux.cancel(&command, id);
                }
                Message::Line(line) => self.handle_line(&line),
                Message::ReaderClosed => {
                    tracing::debug!("server output closed");
                    self.signal(Readiness::Exited);
                }
                Message::ProcessExited(code) => {
                    self.process_exited(code);
                    break;
                }
                Message::IsIdle(reply) => {
                    let _ = reply.send(self.mux.is_empty());
                }
                Message::Shutdown(done) => {
                    self.reject_all();
                    let _ = done.send(());
                    break;
                }
            }
        }
    }

    fn enqueue(&mut self, request: Request) {
        if !self.started {
            self.mux.push(request);
            return;
        }
        let mut outbox = Outbox {
            wire: &mut self.wire,
            sink: self.lifecycle.sink().as_ref(),
        };
        self.mux.enqueue(request, &mut outbox);
    }

    fn drain(&mut self) {
        let mut outbox = Outbox {
            wire: &mut self.wire,
            sink: self.lifecycle.sink().as_ref(),
        };
        self.mux.drain(&mut outbox);
    }

    fn handle_line(&mut self, line: &str) {
        let sink = Arc::clone(self.lifecycle.sink());
        match decode_line(line) {
            Inbound::Text(text) => {
                self.lifecycle
                    .publish(names::STDOUT, &Value::from(text.as_str()));
                sink.post(EngineEvent::ServerMessage(text));
            }
            Inbound::Response(packet) => self.complete(packet),
            Inbound::Event(event) => self.dispatch_event(&event),
            Inbound::Log(record) => sink.post(EngineEvent::Log(record)),
            Inbound::Bogus(line) => sink.post(EngineEvent::BogusPacket(line)),
            Inbound::Unknown(kind) => sink.post(EngineEvent::UnknownPacket(kind)),
        }
    }

    fn complete(&mut self, packet: ResponsePacket) {
        let sink = Arc::clone(self.lifecycle.sink());
        let seq = packet.request_seq;
        let mut outbox = Outbox {
            wire: &mut self.wire,
            sink: sink.as_ref(),
        };
        let Some(request) = self.mux.complete(&packet.command, seq, &mut outbox) else {
            sink.post(EngineEvent::UnmatchedResponse {
                command: packet.command,
                seq,
            });
            return;
        };

        sink.post(EngineEvent::ResponseReceived {
            command: packet.command.clone(),
            seq,
            success: packet.success,
            elapsed: request.round_trip(),
        });
        if packet.success {
            request.resolve(packet.body);
        } else {
            let message = packet.failure_message();
            request.reject(RequestError::Failed {
                command: packet.command,
                message,
            });
        }
    }

    fn dispatch_event(&mut self, event: &EventPacket) {
        if event.event == names::STARTED && !self.started {
            self.started = true;
            self.drain();
            self.signal(Readiness::Started);
        }
        self.lifecycle.publish(&event.event, &event.body);
    }

    fn signal(&mut self, readiness: Readiness) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(readiness);
        }
    }

    fn reject_all(&mut self) {
        for request in self.mux.take_all() {
            let command = request.command().to_string();
            request.reject(RequestError::ServerStopped { command });
        }
    }

    fn process_exited(&mut self, code: Option<i32>) {
        self.lifecycle
            .sink()
            .post(EngineEvent::UnexpectedExit { code });
        self.reject_all();
        self.signal(Readiness::Exited);
        self.lifecycle.set_state(ServerState::Stopped);
        self.lifecycle
            .publish(names::SERVER_EXITED, &json!({ "code": code }));
    }
}

async fn read_lines(stdout: ChildStdout, tx: mpsc::UnboundedSender<Message>) {
    let mut reader = LineReader::new(stdout);
    loop {
        match reader.next_line().await {
            Ok(Some(line)) => {
                if tx.send(Message::Line(line)).is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("stopped reading server output: {e:#}");
                break;
            }
        }
    }
    let _ = tx.send(Message::ReaderClosed);
}

async fn write_lines(stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<String>) {
    let mut writer = LineWriter::new(stdin);
    while let Some(line) = rx.recv().await {
        if let Err(e) = writer.write_line(&line).await {
            tracing::warn!("failed to write to server: {e:#}");
            break;
        }
    }
}

struct Session {
    tx: mpsc::UnboundedSender<Message>,
    process: Option<SupervisedProcess>,
    tasks: Vec<JoinHandle<()>>,
}

/// Engine for servers launched with the native stdio protocol.
pub struct StdioEngine {
    options: ServerOptions,
    deps: EngineDeps,
    lifecycle: Arc<Lifecycle>,
    next_request_id: AtomicU64,
    session: Mutex<Option<Session>>,
    /// Serializes `start` and `stop`.
    transition: AsyncMutex<()>,
    /// Cancelled by `stop` to cut a pending `start` short.
    start_abort: Mutex<Option<CancellationToken>>,
}

impl StdioEngine {
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
            next_request_id: AtomicU64::new(1),
            session: Mutex::new(None),
            transition: AsyncMutex::new(()),
            start_abort: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn events(&self) -> &EventRegistry {
        self.lifecycle.events()
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_session(&self) -> Option<Session> {
        self.session().take()
    }

    fn start_abort(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.start_abort.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn actor(&self) -> Option<mpsc::UnboundedSender<Message>> {
        self.session().as_ref().map(|session| session.tx.clone())
    }

    fn pid(&self) -> Option<u32> {
        self.session()
            .as_ref()
            .and_then(|session| session.process.as_ref())
            .and_then(SupervisedProcess::pid)
    }

    async fn launch(&self, request: StartRequest) -> Result<oneshot::Receiver<Readiness>, StartError> {
        let args = server_args(
            &request.args,
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

        let (tx, rx) = mpsc::unbounded_channel();
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let actor = Actor::new(
            self.options.concurrency,
            WireSender::new(line_tx),
            Arc::clone(&self.lifecycle),
            ready_tx,
        );
        let tasks = vec![
            tokio::spawn(actor.run(rx)),
            tokio::spawn(write_lines(stdin, line_rx)),
            tokio::spawn(read_lines(stdout, tx.clone())),
            forward_stderr(
                stderr,
                self.lifecycle.events().clone(),
                Arc::clone(self.lifecycle.sink()),
            ),
        ];

        let exit_tx = tx.clone();
        let process = SupervisedProcess::watch(child, move |code| {
            let _ = exit_tx.send(Message::ProcessExited(code));
        });

        *self.session() = Some(Session {
            tx,
            process: Some(process),
            tasks,
        });
        Ok(ready_rx)
    }

    async fn start_inner(&self, request: StartRequest) -> Result<(), StartError> {
        let _transition = self.transition.lock().await;
        if self.lifecycle.state() != ServerState::Stopped {
            return Err(StartError::AlreadyRunning);
        }
        let abort = CancellationToken::new();
        *self.start_abort() = Some(abort.clone());
        // Leftovers from a server that exited on its own.
        if let Some(stale) = self.take_session() {
            let _ = self.teardown(stale).await;
        }
        let result = self.launch_until_ready(request, &abort).await;
        self.start_abort().take();
        result
    }

    async fn launch_until_ready(
        &self,
        request: StartRequest,
        abort: &CancellationToken,
    ) -> Result<(), StartError> {
        self.lifecycle.set_state(ServerState::Starting);
        let ready = match self.launch(request).await {
            Ok(ready) => ready,
            Err(e) => {
                self.lifecycle.set_state(ServerState::Stopped);
                return Err(e);
            }
        };

        let timeout = self.options.project_load_timeout();
        let outcome = tokio::select! {
            outcome = time::timeout(timeout, ready) => outcome,
            () = abort.cancelled() => {
                tracing::info!("server stopped while starting");
                let _ = self.shutdown_session().await;
                return Err(StartError::Stopped);
            }
        };
        match outcome {
            Ok(Ok(Readiness::Started)) => {
                self.lifecycle.set_state(ServerState::Started);
                self.lifecycle
                    .publish(names::SERVER_START, &json!({ "pid": self.pid() }));
                Ok(())
            }
            Ok(Ok(Readiness::Exited) | Err(_)) => {
                let _ = self.shutdown_session().await;
                Err(StartError::Exited)
            }
            Err(_) => {
                tracing::warn!(timeout_secs = timeout.as_secs(), "server did not start in time");
                let _ = self.shutdown_session().await;
                Err(StartError::Timeout { timeout })
            }
        }
    }

    /// Tear down the process, then let the actor reject what is left.
    async fn teardown(&self, mut session: Session) -> Result<(), StopError> {
        let result = match session.process.take() {
            Some(process) => {
                process
                    .shutdown(self.deps.tree.as_ref(), self.deps.platform)
                    .await
            }
            None => Ok(()),
        };

        let (done_tx, done_rx) = oneshot::channel();
        if session.tx.send(Message::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
        for task in session.tasks {
            task.abort();
        }
        result
    }

    async fn shutdown_session(&self) -> Result<(), StopError> {
        let Some(session) = self.take_session() else {
            self.lifecycle.set_state(ServerState::Stopped);
            return Ok(());
        };
        let result = self.teardown(session).await;
        if let Err(e) = &result {
            tracing::warn!(pid = e.pid, "failed to stop server: {}", e.source);
        }
        self.lifecycle.set_state(ServerState::Stopped);
        self.lifecycle.publish(names::SERVER_STOP, &Value::Null);
        result
    }

    async fn stop_inner(&self) -> Result<(), StopError> {
        // A start in progress holds the transition lock until it settles.
        if let Some(abort) = self.start_abort().take() {
            abort.cancel();
        }
        let _transition = self.transition.lock().await;
        self.shutdown_session().await
    }

    async fn wait_inner(&self) {
        loop {
            let Some(actor) = self.actor() else {
                return;
            };
            let (reply_tx, reply_rx) = oneshot::channel();
            if actor.send(Message::IsIdle(reply_tx)).is_err() {
                return;
            }
            match reply_rx.await {
                Ok(false) => time::sleep(IDLE_POLL_INTERVAL).await,
                Ok(true) | Err(_) => return,
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
        let Some(actor) = self.actor() else {
            return Err(RequestError::NotRunning);
        };

        let id = RequestId::new(self.next_request_id.fetch_add(1, Ordering::Relaxed));
        let (request, mut rx) = Request::new(id, command, arguments);
        if actor.send(Message::Enqueue(request)).is_err() {
            return Err(RequestError::NotRunning);
        }

        let settle = |result: Result<RequestResult, oneshot::error::RecvError>| {
            result.unwrap_or_else(|_| {
                Err(RequestError::ServerStopped {
                    command: command.to_string(),
                })
            })
        };

        let Some(token) = token else {
            return settle(rx.await);
        };
        tokio::select! {
            result = &mut rx => return settle(result),
            () = token.cancelled() => {}
        }
        let _ = actor.send(Message::Cancel {
            command: command.to_string(),
            id,
        });
        settle(rx.await)
    }
}

impl Engine for StdioEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Stdio
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

impl Drop for StdioEngine {
    fn drop(&mut self) {
        if let Some(session) = self.take_session() {
            for task in session.tasks {
                task.abort();
            }
        }
    }
}
