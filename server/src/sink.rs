//! Structured lifecycle and log events for external observers.

use std::path::PathBuf;
use std::time::Duration;

use crate::types::ServerState;
use crate::wire::{LogLevel, LogRecord};

/// Something the communication layer reports to whoever is watching it.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Launched {
        program: PathBuf,
        host_version: Option<String>,
        pid: Option<u32>,
    },
    StateChanged(ServerState),
    /// Free-form text the server printed on stdout.
    ServerMessage(String),
    Stderr(String),
    /// A `log` event unpacked from the server.
    Log(LogRecord),
    BogusPacket(String),
    UnknownPacket(String),
    RequestSent {
        command: String,
        seq: u64,
    },
    ResponseReceived {
        command: String,
        seq: u64,
        success: bool,
        elapsed: Option<Duration>,
    },
    UnmatchedResponse {
        command: String,
        seq: u64,
    },
    /// The process exited without `stop()` being called.
    UnexpectedExit {
        code: Option<i32>,
    },
}

/// Receives [`EngineEvent`]s. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn post(&self, event: EngineEvent);
}

/// Forwards every event to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn post(&self, event: EngineEvent) {
        match event {
            EngineEvent::Launched {
                program,
                host_version,
                pid,
            } => {
                tracing::info!(
                    program = %program.display(),
                    host_version = host_version.as_deref().unwrap_or("n/a"),
                    pid = ?pid,
                    "server launched"
                );
            }
            EngineEvent::StateChanged(state) => {
                tracing::info!(state = state.label(), "server state changed");
            }
            EngineEvent::ServerMessage(text) => tracing::info!(target: "omnilink::server", "{text}"),
            EngineEvent::Stderr(text) => tracing::warn!(target: "omnilink::server", "{text}"),
            EngineEvent::Log(record) => log_record(&record),
            EngineEvent::BogusPacket(line) => {
                tracing::debug!(line = %line, "dropping packet without a type");
            }
            EngineEvent::UnknownPacket(kind) => {
                tracing::debug!("Unknown packet type: {kind}");
            }
            EngineEvent::RequestSent { command, seq } => {
                tracing::debug!(command = %command, seq, "request sent");
            }
            EngineEvent::ResponseReceived {
                command,
                seq,
                success,
                elapsed,
            } => {
                tracing::debug!(
                    command = %command,
                    seq,
                    success,
                    elapsed_ms = elapsed.map_or(0, |d| d.as_millis() as u64),
                    "response received"
                );
            }
            EngineEvent::UnmatchedResponse { command, seq } => {
                tracing::debug!(
                    command = %command,
                    seq,
                    "Received response for {command} but could not find request"
                );
            }
            EngineEvent::UnexpectedExit { code } => {
                tracing::warn!(code = ?code, "server exited unexpectedly");
            }
        }
    }
}

fn log_record(record: &LogRecord) {
    let LogRecord {
        level,
        source,
        message,
    } = record;
    match level {
        LogLevel::Trace => tracing::trace!(target: "omnilink::server", source = %source, "{message}"),
        LogLevel::Debug => tracing::debug!(target: "omnilink::server", source = %source, "{message}"),
        LogLevel::Information => {
            tracing::info!(target: "omnilink::server", source = %source, "{message}");
        }
        LogLevel::Warning => tracing::warn!(target: "omnilink::server", source = %source, "{message}"),
        LogLevel::Error | LogLevel::Critical => {
            tracing::error!(target: "omnilink::server", source = %source, "{message}");
        }
    }
}
