//! One concurrency class: a FIFO of requests waiting to be sent plus the
//! bounded set of requests the server is currently working on.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::RequestError;
use crate::prioritization::QueueClass;
use crate::wire::PacketSink;

/// Caller-side handle for a request, stable from creation to settlement.
///
/// Sequence ids only exist once a request is sent, so cancellation has to
/// refer to requests by this id instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    #[must_use]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

pub type RequestResult = Result<Value, RequestError>;

/// A caller's operation. Settling it (resolve, reject) consumes it, so a
/// request is answered at most once.
#[derive(Debug)]
pub struct Request {
    id: RequestId,
    command: String,
    arguments: Option<Value>,
    responder: oneshot::Sender<RequestResult>,
    enqueued_at: Instant,
    started_at: Option<Instant>,
    ended_at: Option<Instant>,
}

impl Request {
    pub fn new(
        id: RequestId,
        command: impl Into<String>,
        arguments: Option<Value>,
    ) -> (Self, oneshot::Receiver<RequestResult>) {
        let (responder, rx) = oneshot::channel();
        let request = Self {
            id,
            command: command.into(),
            arguments,
            responder,
            enqueued_at: Instant::now(),
            started_at: None,
            ended_at: None,
        };
        (request, rx)
    }

    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub fn arguments(&self) -> Option<&Value> {
        self.arguments.as_ref()
    }

    /// When the request was admitted (sent to the server).
    #[must_use]
    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    /// When the server's response was matched to the request.
    #[must_use]
    pub fn ended_at(&self) -> Option<Instant> {
        self.ended_at
    }

    /// Send-to-response latency, once both timestamps are known.
    #[must_use]
    pub fn round_trip(&self) -> Option<Duration> {
        Some(self.ended_at?.duration_since(self.started_at?))
    }

    pub fn resolve(self, body: Value) {
        self.settle(Ok(body));
    }

    pub fn reject(self, err: RequestError) {
        self.settle(Err(err));
    }

    fn settle(self, result: RequestResult) {
        // The caller may have stopped waiting; nothing to do then.
        let _ = self.responder.send(result);
    }
}

/// FIFO admission queue with a cap on in-flight requests.
///
/// `pending` and `in_flight` never hold the same request, and
/// `in_flight.len() <= capacity` after every operation.
#[derive(Debug)]
pub struct RequestQueue {
    class: QueueClass,
    capacity: usize,
    pending: VecDeque<Request>,
    in_flight: HashMap<u64, Request>,
}

impl RequestQueue {
    pub fn new(class: QueueClass, capacity: usize) -> Self {
        Self {
            class,
            capacity: capacity.max(1),
            pending: VecDeque::new(),
            in_flight: HashMap::new(),
        }
    }

    pub fn class(&self) -> QueueClass {
        self.class
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn enqueue(&mut self, request: Request) {
        tracing::trace!(
            queue = self.class.label(),
            command = request.command(),
            "enqueue request"
        );
        self.pending.push_back(request);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.in_flight.len() >= self.capacity
    }

    /// Move requests from the head of `pending` into flight until the cap is
    /// reached or nothing is left. Returns how many were sent.
    pub fn admit_pending(&mut self, sink: &mut impl PacketSink) -> usize {
        let mut admitted = 0;
        while !self.is_full() {
            let Some(mut request) = self.pending.pop_front() else {
                break;
            };
            request.started_at = Some(Instant::now());
            let seq = sink.send(&request);
            tracing::trace!(
                queue = self.class.label(),
                command = request.command(),
                seq,
                waited_ms = request.enqueued_at.elapsed().as_millis() as u64,
                "admit request"
            );
            if let Some(displaced) = self.in_flight.insert(seq, request) {
                tracing::warn!(
                    queue = self.class.label(),
                    command = displaced.command(),
                    seq,
                    "sequence id reused; dropping the older request"
                );
            }
            admitted += 1;
        }
        admitted
    }

    /// Remove the in-flight request sent under `seq`.
    ///
    /// `None` is expected for responses to requests that were cancelled or
    /// belong to an earlier server process.
    pub fn complete(&mut self, seq: u64) -> Option<Request> {
        let mut request = self.in_flight.remove(&seq)?;
        request.ended_at = Some(Instant::now());
        tracing::trace!(
            queue = self.class.label(),
            command = request.command(),
            seq,
            elapsed_ms = request.round_trip().map_or(0, |d| d.as_millis() as u64),
            "complete request"
        );
        Some(request)
    }

    /// Cancel a request that has not been sent yet.
    ///
    /// A pending request is removed and rejected with
    /// [`RequestError::Cancelled`]. A request already in flight is left
    /// alone: its response will still arrive and settle it. Returns whether
    /// anything was cancelled.
    pub fn cancel(&mut self, id: RequestId) -> bool {
        let Some(index) = self.pending.iter().position(|r| r.id == id) else {
            return false;
        };
        let Some(request) = self.pending.remove(index) else {
            return false;
        };
        tracing::trace!(
            queue = self.class.label(),
            command = request.command(),
            "cancel pending request"
        );
        let command = request.command.clone();
        request.reject(RequestError::Cancelled { command });
        true
    }

    /// Remove every request, pending first, then in flight by sequence id.
    pub fn take_all(&mut self) -> Vec<Request> {
        let mut in_flight: Vec<_> = self.in_flight.drain().collect();
        in_flight.sort_unstable_by_key(|(seq, _)| *seq);
        self.pending
            .drain(..)
            .chain(in_flight.into_iter().map(|(_, request)| request))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn is_in_flight(&self, id: RequestId) -> bool {
        self.in_flight.values().any(|r| r.id == id)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Records what was sent and hands out sequence ids from 1.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingSink {
        pub sent: Vec<(u64, String)>,
    }

    impl PacketSink for RecordingSink {
        fn send(&mut self, request: &Request) -> u64 {
            let seq = self.sent.len() as u64 + 1;
            self.sent.push((seq, request.command().to_string()));
            seq
        }
    }

    pub(crate) fn request(
        id: u64,
        command: &str,
    ) -> (Request, oneshot::Receiver<RequestResult>) {
        Request::new(RequestId::new(id), command, None)
    }

    #[test]
    fn test_admit_respects_capacity() {
        let mut queue = RequestQueue::new(QueueClass::Normal, 2);
        let mut sink = RecordingSink::default();
        let mut receivers = Vec::new();
        for i in 0..3 {
            let (r, rx) = request(i, "/typelookup");
            receivers.push(rx);
            queue.enqueue(r);
        }

        assert_eq!(queue.admit_pending(&mut sink), 2);
        assert!(queue.is_full());
        assert_eq!(queue.in_flight_len(), 2);
        assert_eq!(queue.pending_len(), 1);
        assert_eq!(queue.admit_pending(&mut sink), 0);
    }

    #[test]
    fn test_admission_is_fifo() {
        let mut queue = RequestQueue::new(QueueClass::Normal, 8);
        let mut sink = RecordingSink::default();
        let (a, _a) = request(1, "/first");
        let (b, _b) = request(2, "/second");
        queue.enqueue(a);
        queue.enqueue(b);
        queue.admit_pending(&mut sink);
        let commands: Vec<_> = sink.sent.iter().map(|(_, c)| c.as_str()).collect();
        assert_eq!(commands, ["/first", "/second"]);
    }

    #[test]
    fn test_admit_stamps_start_time() {
        let mut queue = RequestQueue::new(QueueClass::Normal, 1);
        let mut sink = RecordingSink::default();
        let (r, _rx) = request(1, "/typelookup");
        queue.enqueue(r);
        queue.admit_pending(&mut sink);

        let done = queue.complete(1).unwrap();
        assert!(done.started_at().is_some());
        assert!(done.ended_at().is_some());
        assert!(done.round_trip().is_some());
    }

    #[test]
    fn test_complete_unknown_seq_is_none() {
        let mut queue = RequestQueue::new(QueueClass::Normal, 1);
        assert!(queue.complete(42).is_none());
    }

    #[test]
    fn test_complete_frees_slot() {
        let mut queue = RequestQueue::new(QueueClass::Priority, 1);
        let mut sink = RecordingSink::default();
        let (a, _a) = request(1, "/updatebuffer");
        let (b, _b) = request(2, "/updatebuffer");
        queue.enqueue(a);
        queue.enqueue(b);
        queue.admit_pending(&mut sink);
        assert!(queue.is_full());

        assert!(queue.complete(1).is_some());
        assert!(!queue.is_full());
        assert_eq!(queue.admit_pending(&mut sink), 1);
        assert_eq!(sink.sent[1].0, 2);
    }

    #[tokio::test]
    async fn test_cancel_pending_rejects_and_shrinks() {
        let mut queue = RequestQueue::new(QueueClass::Normal, 1);
        let (a, _a) = request(1, "/a");
        let (b, b_rx) = request(2, "/b");
        queue.enqueue(a);
        queue.enqueue(b);

        assert!(queue.cancel(RequestId::new(2)));
        assert_eq!(queue.pending_len(), 1);
        assert_eq!(
            b_rx.await.unwrap(),
            Err(RequestError::Cancelled {
                command: "/b".to_string()
            })
        );
    }

    #[test]
    fn test_cancel_in_flight_has_no_effect() {
        let mut queue = RequestQueue::new(QueueClass::Normal, 1);
        let mut sink = RecordingSink::default();
        let (a, mut a_rx) = request(1, "/a");
        queue.enqueue(a);
        queue.admit_pending(&mut sink);

        assert!(!queue.cancel(RequestId::new(1)));
        assert_eq!(queue.in_flight_len(), 1);
        assert!(queue.is_in_flight(RequestId::new(1)));
        assert!(a_rx.try_recv().is_err(), "in-flight request must stay unsettled");
    }

    #[test]
    fn test_cancel_unknown_request_is_noop() {
        let mut queue = RequestQueue::new(QueueClass::Normal, 1);
        let (a, _a) = request(1, "/a");
        queue.enqueue(a);
        assert!(!queue.cancel(RequestId::new(99)));
        assert_eq!(queue.pending_len(), 1);
    }

    #[test]
    fn test_take_all_empties_queue() {
        let mut queue = RequestQueue::new(QueueClass::Deferred, 1);
        let mut sink = RecordingSink::default();
        let (a, _rx_a) = request(1, "/projects");
        let (b, _rx_b) = request(2, "/projects");
        queue.enqueue(a);
        queue.enqueue(b);
        queue.admit_pending(&mut sink);

        let ids: Vec<_> = queue.take_all().iter().map(Request::id).collect();
        assert_eq!(ids, [RequestId::new(2), RequestId::new(1)]);
        assert_eq!(queue.pending_len(), 0);
        assert_eq!(queue.in_flight_len(), 0);
    }
}
