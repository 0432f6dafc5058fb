//! Line-delimited packet codec for the stdio transport.
//!
//! Every packet is one JSON object terminated by `\n`. The server may also
//! print free-form diagnostic text on stdout; such lines are surfaced as
//! [`Inbound::Text`] instead of being treated as errors.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::queue::Request;

/// Maximum accepted line length (16 MiB). Project-wide responses can be large.
const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

const BYTE_ORDER_MARK: char = '\u{feff}';

#[derive(Debug, Serialize)]
struct RequestPacket<'a> {
    #[serde(rename = "Type")]
    kind: &'static str,
    #[serde(rename = "Seq")]
    seq: u64,
    #[serde(rename = "Command")]
    command: &'a str,
    #[serde(rename = "Arguments", skip_serializing_if = "Option::is_none")]
    arguments: Option<&'a Value>,
}

/// Serialize a request packet as a single line (without the terminator).
pub fn encode_request(
    seq: u64,
    command: &str,
    arguments: Option<&Value>,
) -> serde_json::Result<String> {
    serde_json::to_string(&RequestPacket {
        kind: "request",
        seq,
        command,
        arguments,
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponsePacket {
    #[serde(rename = "Request_seq")]
    pub request_seq: u64,
    #[serde(rename = "Command")]
    pub command: String,
    #[serde(rename = "Success", default)]
    pub success: bool,
    #[serde(rename = "Body", default)]
    pub body: Value,
    #[serde(rename = "Message", default)]
    pub message: Option<String>,
}

impl ResponsePacket {
    /// The server's explanation of a failure: `Message` if present, else the body.
    #[must_use]
    pub fn failure_message(&self) -> String {
        match (&self.message, &self.body) {
            (Some(message), _) if !message.is_empty() => message.clone(),
            (_, Value::String(body)) => body.clone(),
            (_, Value::Null) => String::from("unknown error"),
            (_, body) => body.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventPacket {
    #[serde(rename = "Event")]
    pub event: String,
    #[serde(rename = "Body", default)]
    pub body: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Information,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Parse the server's level names. Unknown names read as `Information`.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "TRACE" => Self::Trace,
            "DEBUG" => Self::Debug,
            "WARNING" | "WARN" => Self::Warning,
            "ERROR" | "FAIL" => Self::Error,
            "CRITICAL" | "CRIT" => Self::Critical,
            _ => Self::Information,
        }
    }
}

/// A `log` event unpacked into its fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    /// Component inside the server that emitted the record.
    pub source: String,
    pub message: String,
}

impl LogRecord {
    /// Unpack a `{LogLevel, Name, Message}` body.
    #[must_use]
    pub fn from_body(body: &Value) -> Option<Self> {
        let field = |name: &str| body.get(name).and_then(Value::as_str);
        Some(Self {
            level: LogLevel::parse(field("LogLevel").unwrap_or_default()),
            source: field("Name").unwrap_or_default().to_string(),
            message: field("Message")?.to_string(),
        })
    }
}

/// One decoded stdout line.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// Not a packet; diagnostic output from the server.
    Text(String),
    Response(ResponsePacket),
    Event(EventPacket),
    Log(LogRecord),
    /// JSON object without a recognizable packet shape.
    Bogus(String),
    /// Packet with a `Type` this client does not handle.
    Unknown(String),
}

/// Decode one line read from the server's stdout. Never fails.
#[must_use]
pub fn decode_line(line: &str) -> Inbound {
    let line = line.strip_prefix(BYTE_ORDER_MARK).unwrap_or(line);
    if !line.starts_with('{') {
        return Inbound::Text(line.to_string());
    }

    let Ok(value) = serde_json::from_str::<Value>(line) else {
        return Inbound::Text(line.to_string());
    };

    let Some(kind) = value.get("Type").and_then(Value::as_str) else {
        return Inbound::Bogus(line.to_string());
    };

    match kind {
        "response" => serde_json::from_value(value)
            .map_or_else(|_| Inbound::Bogus(line.to_string()), Inbound::Response),
        "event" => match serde_json::from_value::<EventPacket>(value) {
            Ok(event) if event.event == "log" => LogRecord::from_body(&event.body)
                .map_or_else(|| Inbound::Bogus(line.to_string()), Inbound::Log),
            Ok(event) => Inbound::Event(event),
            Err(_) => Inbound::Bogus(line.to_string()),
        },
        other => Inbound::Unknown(other.to_string()),
    }
}

/// Reads `\n`-terminated lines from the server's stdout.
pub struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
        }
    }

    /// Read the next line without its terminator.
    ///
    /// Returns `Ok(None)` on EOF. A final line without a trailing newline is
    /// still returned. Invalid UTF-8 is replaced rather than rejected.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        self.buf.clear();
        let limit = MAX_LINE_BYTES as u64 + 1;
        let read = (&mut self.reader)
            .take(limit)
            .read_until(b'\n', &mut self.buf)
            .await
            .context("reading server output")?;

        if read == 0 {
            return Ok(None);
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        } else if self.buf.len() > MAX_LINE_BYTES {
            bail!("server output line exceeds {MAX_LINE_BYTES} bytes");
        }

        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }
}

/// Writes packets to the server's stdin.
pub struct LineWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        self.writer
            .write_all(line.as_bytes())
            .await
            .context("writing packet")?;
        self.writer
            .write_all(b"\n")
            .await
            .context("writing packet terminator")?;
        self.writer.flush().await.context("flushing packet")?;
        Ok(())
    }
}

/// Destination for requests leaving their queue.
pub trait PacketSink {
    /// Send `request` to the server and return the sequence id it went out under.
    fn send(&mut self, request: &Request) -> u64;
}

/// Assigns sequence ids and hands encoded packets to the stdin writer task.
///
/// The counter belongs to one engine instance, so independent engines never
/// share sequence numbers.
#[derive(Debug)]
pub struct WireSender {
    next_seq: u64,
    tx: mpsc::UnboundedSender<String>,
}

impl WireSender {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { next_seq: 1, tx }
    }
}

impl PacketSink for WireSender {
    fn send(&mut self, request: &Request) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        match encode_request(seq, request.command(), request.arguments()) {
            Ok(line) => {
                tracing::debug!(command = request.command(), seq, "sending request");
                if self.tx.send(line).is_err() {
                    tracing::warn!(
                        command = request.command(),
                        seq,
                        "server input closed; request not written"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(command = request.command(), seq, "failed to encode request: {e}");
            }
        }
        seq
    }
}
