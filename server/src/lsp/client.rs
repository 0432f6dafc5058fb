//! Minimal JSON-RPC client over a framed byte stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::codec::{FrameReader, FrameWriter};

/// The document changed while the server was computing the answer.
pub(crate) const CONTENT_MODIFIED: i64 = -32801;
const METHOD_NOT_FOUND: i64 = -32601;

const WRITER_CHANNEL_CAPACITY: usize = 64;

/// An `error` member returned by the server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (code {code})")]
pub(crate) struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum ClientError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("request cancelled")]
    Cancelled,
    #[error("connection closed")]
    Closed,
}

type Outcome = Result<Value, RpcError>;

/// Requests awaiting a response. Once `closed` is set no new entries go in.
#[derive(Default)]
struct Pending {
    closed: bool,
    waiters: HashMap<u64, oneshot::Sender<Outcome>>,
}

type PendingMap = Arc<Mutex<Pending>>;

/// Called for every notification the server sends.
pub(crate) type NotificationHandler = Arc<dyn Fn(&str, Value) + Send + Sync>;

#[derive(Debug, Serialize)]
struct Outgoing<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, PartialEq)]
enum Incoming {
    Response { id: u64, outcome: Outcome },
    ServerRequest { id: Value, method: String },
    Notification { method: String, params: Value },
}

fn parse_incoming(frame: &Value) -> Option<Incoming> {
    let method = frame.get("method").and_then(Value::as_str);
    match (frame.get("id"), method) {
        (Some(id), Some(method)) => Some(Incoming::ServerRequest {
            id: id.clone(),
            method: method.to_string(),
        }),
        (None, Some(method)) => Some(Incoming::Notification {
            method: method.to_string(),
            params: frame.get("params").cloned().unwrap_or(Value::Null),
        }),
        (Some(id), None) => {
            let id = id.as_u64()?;
            let outcome = match frame.get("error") {
                Some(error) => Err(RpcError {
                    code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
                    message: error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string(),
                }),
                None => Ok(frame.get("result").cloned().unwrap_or(Value::Null)),
            };
            Some(Incoming::Response { id, outcome })
        }
        (None, None) => None,
    }
}

/// A connection to a language-protocol server.
///
/// Dropping the client (or calling [`close`](Self::close)) fails every
/// outstanding request with [`ClientError::Closed`].
pub(crate) struct RpcClient {
    writer_tx: mpsc::Sender<Value>,
    next_id: AtomicU64,
    pending: PendingMap,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RpcClient {
    pub(crate) fn connect<R, W>(reader: R, writer: W, on_notification: NotificationHandler) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending: PendingMap = Arc::new(Mutex::new(Pending::default()));
        let (writer_tx, mut writer_rx) = mpsc::channel::<Value>(WRITER_CHANNEL_CAPACITY);

        let writer = tokio::spawn(async move {
            let mut frames = FrameWriter::new(writer);
            while let Some(frame) = writer_rx.recv().await {
                if let Err(e) = frames.write_frame(&frame).await {
                    tracing::warn!("language server write error: {e:#}");
                    break;
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        let reader_tx = writer_tx.clone();
        let reader = tokio::spawn(async move {
            let mut frames = FrameReader::new(reader);
            loop {
                match frames.read_frame().await {
                    Ok(Some(frame)) => {
                        dispatch(&frame, &reader_pending, &reader_tx, &on_notification).await;
                    }
                    Ok(None) => {
                        tracing::debug!("language server closed its output");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("language server read error: {e:#}");
                        break;
                    }
                }
            }
            let mut pending = reader_pending.lock().await;
            pending.closed = true;
            pending.waiters.clear();
        });

        Self {
            writer_tx,
            next_id: AtomicU64::new(1),
            pending,
            reader,
            writer,
        }
    }

    /// Send a request and wait for its outcome.
    ///
    /// Cancelling `token` sends `$/cancelRequest` and gives up on the answer.
    pub(crate) async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        token: Option<&CancellationToken>,
    ) -> Result<Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(ClientError::Closed);
            }
            pending.waiters.insert(id, tx);
        }

        if self.send(Some(id), method, params).await.is_err() {
            self.pending.lock().await.waiters.remove(&id);
            return Err(ClientError::Closed);
        }

        let received = match token {
            Some(token) => tokio::select! {
                received = rx => received,
                () = token.cancelled() => {
                    self.pending.lock().await.waiters.remove(&id);
                    let _ = self.notify("$/cancelRequest", Some(json!({ "id": id }))).await;
                    return Err(ClientError::Cancelled);
                }
            },
            None => rx.await,
        };
        match received {
            Ok(outcome) => outcome.map_err(ClientError::Rpc),
            Err(_) => Err(ClientError::Closed),
        }
    }

    pub(crate) async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        self.send(None, method, params).await
    }

    async fn send(&self, id: Option<u64>, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        let frame = serde_json::to_value(Outgoing {
            jsonrpc: "2.0",
            id,
            method,
            params,
        })
        .map_err(|_| ClientError::Closed)?;
        self.writer_tx
            .send(frame)
            .await
            .map_err(|_| ClientError::Closed)
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn dispatch(
    frame: &Value,
    pending: &Mutex<Pending>,
    writer_tx: &mpsc::Sender<Value>,
    on_notification: &NotificationHandler,
) {
    let Some(incoming) = parse_incoming(frame) else {
        tracing::trace!("ignoring malformed JSON-RPC frame");
        return;
    };
    match incoming {
        Incoming::Response { id, outcome } => {
            let waiter = pending.lock().await.waiters.remove(&id);
            if let Some(tx) = waiter {
                let _ = tx.send(outcome);
            } else {
                tracing::debug!(id, "response for unknown request");
            }
        }
        Incoming::ServerRequest { id, method } => {
            tracing::debug!("language server sent request {method}; replying method not found");
            let reply = json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {
                    "code": METHOD_NOT_FOUND,
                    "message": format!("Method not found: {method}"),
                }
            });
            let _ = writer_tx.send(reply).await;
        }
        Incoming::Notification { method, params } => on_notification(&method, params),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf, duplex, split};

    /// The far end of a client connection, speaking raw frames.
    pub(crate) struct FakeServer {
        pub reader: FrameReader<ReadHalf<DuplexStream>>,
        pub writer: FrameWriter<WriteHalf<DuplexStream>>,
    }

    impl FakeServer {
        pub(crate) async fn next(&mut self) -> Value {
            self.reader.read_frame().await.unwrap().unwrap()
        }

        pub(crate) async fn send(&mut self, frame: Value) {
            self.writer.write_frame(&frame).await.unwrap();
        }
    }

    pub(crate) fn pair(on_notification: NotificationHandler) -> (RpcClient, FakeServer) {
        let (client_io, server_io) = duplex(64 * 1024);
        let (client_read, client_write) = split(client_io);
        let (server_read, server_write) = split(server_io);
        let client = RpcClient::connect(client_read, client_write, on_notification);
        let server = FakeServer {
            reader: FrameReader::new(server_read),
            writer: FrameWriter::new(server_write),
        };
        (client, server)
    }

    pub(crate) fn ignore_notifications() -> NotificationHandler {
        Arc::new(|_, _| {})
    }

    #[test]
    fn test_parse_incoming_shapes() {
        assert_eq!(
            parse_incoming(&json!({ "id": 3, "result": true })),
            Some(Incoming::Response {
                id: 3,
                outcome: Ok(Value::Bool(true))
            })
        );
        assert_eq!(
            parse_incoming(&json!({ "id": 4, "error": { "code": -32801, "message": "modified" } })),
            Some(Incoming::Response {
                id: 4,
                outcome: Err(RpcError {
                    code: CONTENT_MODIFIED,
                    message: "modified".to_string()
                })
            })
        );
        assert!(matches!(
            parse_incoming(&json!({ "id": "x", "method": "workspace/configuration" })),
            Some(Incoming::ServerRequest { .. })
        ));
        assert!(matches!(
            parse_incoming(&json!({ "method": "o#/log", "params": {} })),
            Some(Incoming::Notification { .. })
        ));
        assert_eq!(parse_incoming(&json!({ "jsonrpc": "2.0" })), None);
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (client, mut server) = pair(ignore_notifications());
        let call = tokio::spawn(async move {
            client
                .request("o#/typelookup", Some(json!({ "Line": 1 })), None)
                .await
        });

        let request = server.next().await;
        assert_eq!(request["method"], "o#/typelookup");
        assert_eq!(request["params"]["Line"], 1);
        server
            .send(json!({ "jsonrpc": "2.0", "id": request["id"], "result": { "Type": "int" } }))
            .await;

        assert_eq!(call.await.unwrap().unwrap(), json!({ "Type": "int" }));
    }

    #[tokio::test]
    async fn test_error_response_surfaces_code() {
        let (client, mut server) = pair(ignore_notifications());
        let call = tokio::spawn(async move { client.request("o#/x", None, None).await });
        let request = server.next().await;
        server
            .send(json!({ "jsonrpc": "2.0", "id": request["id"], "error": { "code": -32801, "message": "modified" } }))
            .await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Rpc(RpcError { code: CONTENT_MODIFIED, .. })));
    }

    #[tokio::test]
    async fn test_server_request_gets_method_not_found() {
        let (_client, mut server) = pair(ignore_notifications());
        server
            .send(json!({ "jsonrpc": "2.0", "id": 9, "method": "client/registerCapability" }))
            .await;

        let reply = server.next().await;
        assert_eq!(reply["id"], 9);
        assert_eq!(reply["error"]["code"], METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_notifications_reach_handler() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler: NotificationHandler = Arc::new(move |method, params| {
            let _ = tx.send((method.to_string(), params));
        });
        let (_client, mut server) = pair(handler);
        server
            .send(json!({ "jsonrpc": "2.0", "method": "o#/projectadded", "params": { "Name": "App" } }))
            .await;

        let (method, params) = rx.recv().await.unwrap();
        assert_eq!(method, "o#/projectadded");
        assert_eq!(params["Name"], "App");
    }

    #[tokio::test]
    async fn test_cancel_sends_cancel_request() {
        let (client, mut server) = pair(ignore_notifications());
        let token = CancellationToken::new();
        let cancel = token.clone();
        let call = tokio::spawn(async move { client.request("o#/slow", None, Some(&token)).await });

        let request = server.next().await;
        cancel.cancel();

        assert_eq!(call.await.unwrap().unwrap_err(), ClientError::Cancelled);
        let notice = server.next().await;
        assert_eq!(notice["method"], "$/cancelRequest");
        assert_eq!(notice["params"]["id"], request["id"]);
    }

    #[tokio::test]
    async fn test_closed_stream_fails_pending() {
        let (client, mut server) = pair(ignore_notifications());
        let call = tokio::spawn(async move { client.request("o#/x", None, None).await });
        server.next().await;
        drop(server);
        assert_eq!(call.await.unwrap().unwrap_err(), ClientError::Closed);
    }
}
