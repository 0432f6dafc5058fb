//! Owning the server process once it is running.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::process::{Child, ChildStderr};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;

use crate::error::StopError;
use crate::events::{EventRegistry, names};
use crate::process_tree::{ProcessTree, terminate_tree};
use crate::sink::{EngineEvent, EventSink};
use crate::types::{Platform, ServerState};
use crate::wire::LineReader;

/// How long the process gets to exit after the tree was signalled.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Engine state plus the observers that hear about its changes.
pub(crate) struct Lifecycle {
    state: watch::Sender<ServerState>,
    events: EventRegistry,
    sink: Arc<dyn EventSink>,
}

impl Lifecycle {
    pub(crate) fn new(events: EventRegistry, sink: Arc<dyn EventSink>) -> Self {
        let (state, _) = watch::channel(ServerState::Stopped);
        Self {
            state,
            events,
            sink,
        }
    }

    pub(crate) fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    pub(crate) fn events(&self) -> &EventRegistry {
        &self.events
    }

    pub(crate) fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    /// Move to `next`, notifying observers only on an actual change.
    pub(crate) fn set_state(&self, next: ServerState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            self.sink.post(EngineEvent::StateChanged(next));
            self.events
                .publish(names::STATE_CHANGED, &Value::from(next.label()));
        }
        changed
    }

    /// Publish to subscribers without touching the state.
    pub(crate) fn publish(&self, event: &str, body: &Value) {
        self.events.publish(event, body);
    }
}

/// A spawned server whose exit is being watched.
pub(crate) struct SupervisedProcess {
    pid: Option<u32>,
    stopping: Arc<AtomicBool>,
    exited: watch::Receiver<bool>,
    kill_tx: Option<oneshot::Sender<()>>,
    monitor: JoinHandle<()>,
}

impl SupervisedProcess {
    /// Watch `child` until it exits.
    ///
    /// `on_exit` runs with the exit code only when the process ends without
    /// [`shutdown`](Self::shutdown) having been called first.
    pub(crate) fn watch<F>(mut child: Child, on_exit: F) -> Self
    where
        F: FnOnce(Option<i32>) + Send + 'static,
    {
        let pid = child.id();
        let stopping = Arc::new(AtomicBool::new(false));
        let (exited_tx, exited) = watch::channel(false);
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        let monitor_stopping = Arc::clone(&stopping);
        let monitor = tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                Ok(()) = &mut kill_rx => None,
            };
            let status = match exited {
                Some(status) => status,
                None => {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!("force kill failed: {e}");
                    }
                    child.wait().await
                }
            };
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!("failed to wait for server process: {e}");
                    None
                }
            };
            let _ = exited_tx.send(true);
            if !monitor_stopping.load(Ordering::SeqCst) {
                on_exit(code);
            }
        });

        Self {
            pid,
            stopping,
            exited,
            kill_tx: Some(kill_tx),
            monitor,
        }
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Terminate the process tree and wait for the root to exit.
    ///
    /// Resolves only after every signal was sent and the monitor finished.
    pub(crate) async fn shutdown(
        mut self,
        tree: &dyn ProcessTree,
        platform: Platform,
    ) -> Result<(), StopError> {
        self.stopping.store(true, Ordering::SeqCst);

        let already_exited = *self.exited.borrow();
        let result = match self.pid {
            Some(pid) if !already_exited => terminate_tree(tree, platform, pid)
                .await
                .map(|signalled| {
                    tracing::debug!(pid, ?signalled, "signalled server process tree");
                })
                .map_err(|source| StopError { pid, source }),
            _ => Ok(()),
        };

        let graceful = time::timeout(EXIT_GRACE, self.exited.wait_for(|exited| *exited))
            .await
            .is_ok();
        if !graceful && let Some(kill_tx) = self.kill_tx.take() {
            tracing::warn!(pid = ?self.pid, "server did not exit in time; killing");
            let _ = kill_tx.send(());
        }
        if let Err(e) = (&mut self.monitor).await {
            tracing::warn!("process monitor task failed: {e}");
        }
        result
    }
}

impl Drop for SupervisedProcess {
    fn drop(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
    }
}

/// Forward every stderr line to the sink and the `stderr` event.
pub(crate) fn forward_stderr(
    stderr: ChildStderr,
    events: EventRegistry,
    sink: Arc<dyn EventSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = LineReader::new(stderr);
        loop {
            match reader.next_line().await {
                Ok(Some(line)) => {
                    events.publish(names::STDERR, &Value::from(line.as_str()));
                    sink.post(EngineEvent::Stderr(line));
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("stderr reader stopped: {e:#}");
                    break;
                }
            }
        }
    })
}
