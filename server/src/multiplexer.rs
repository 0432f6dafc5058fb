//! Routes requests into the Priority, Normal and Deferred queues and decides
//! which of them may send next.

use crate::prioritization::{QueueClass, classify};
use crate::queue::{Request, RequestId, RequestQueue};
use crate::wire::PacketSink;

/// Deferred gets a quarter of the Normal cap, but never fewer than two slots.
fn deferred_capacity(concurrency: usize) -> usize {
    (concurrency / 4).max(2)
}

/// Point-in-time view of one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub class: QueueClass,
    pub pending: usize,
    pub in_flight: usize,
    pub capacity: usize,
}

#[derive(Debug)]
pub struct RequestMultiplexer {
    priority: RequestQueue,
    normal: RequestQueue,
    deferred: RequestQueue,
    draining: bool,
}

impl RequestMultiplexer {
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            priority: RequestQueue::new(QueueClass::Priority, 1),
            normal: RequestQueue::new(QueueClass::Normal, concurrency),
            deferred: RequestQueue::new(QueueClass::Deferred, deferred_capacity(concurrency)),
            draining: false,
        }
    }

    fn queue_mut(&mut self, class: QueueClass) -> &mut RequestQueue {
        match class {
            QueueClass::Priority => &mut self.priority,
            QueueClass::Normal => &mut self.normal,
            QueueClass::Deferred => &mut self.deferred,
        }
    }

    pub fn queue(&self, class: QueueClass) -> &RequestQueue {
        match class {
            QueueClass::Priority => &self.priority,
            QueueClass::Normal => &self.normal,
            QueueClass::Deferred => &self.deferred,
        }
    }

    /// Queue a request without trying to send anything.
    ///
    /// Used while the server has not signalled readiness yet.
    pub fn push(&mut self, request: Request) {
        let class = classify(request.command());
        self.queue_mut(class).enqueue(request);
    }

    pub fn enqueue(&mut self, request: Request, sink: &mut impl PacketSink) {
        self.push(request);
        self.drain(sink);
    }

    /// Admit pending requests according to the preemption policy.
    ///
    /// Priority work strictly preempts: while Priority has something pending
    /// and a free slot, nothing from Normal or Deferred is admitted. Returns
    /// the number of requests sent.
    pub fn drain(&mut self, sink: &mut impl PacketSink) -> usize {
        if self.draining || self.priority.is_full() {
            return 0;
        }
        self.draining = true;

        let admitted = if self.priority.has_pending() {
            self.priority.admit_pending(sink)
        } else {
            self.normal.admit_pending(sink) + self.deferred.admit_pending(sink)
        };

        self.draining = false;
        admitted
    }

    /// Match a response to its request and backfill the freed slot.
    ///
    /// `None` means no request is in flight under `seq` for that command's
    /// queue; the caller logs and drops the response.
    pub fn complete(
        &mut self,
        command: &str,
        seq: u64,
        sink: &mut impl PacketSink,
    ) -> Option<Request> {
        let request = self.queue_mut(classify(command)).complete(seq);
        self.drain(sink);
        request
    }

    /// Cancel a request that is still pending. No effect once it was sent.
    pub fn cancel(&mut self, command: &str, id: RequestId) -> bool {
        self.queue_mut(classify(command)).cancel(id)
    }

    /// Remove every pending and in-flight request from all queues.
    pub fn take_all(&mut self) -> Vec<Request> {
        let mut all = self.priority.take_all();
        all.extend(self.normal.take_all());
        all.extend(self.deferred.take_all());
        all
    }

    /// Whether no queue has requests waiting to be sent.
    pub fn is_empty(&self) -> bool {
        !self.priority.has_pending() && !self.normal.has_pending() && !self.deferred.has_pending()
    }

    pub fn stats(&self) -> [QueueStats; 3] {
        [&self.priority, &self.normal, &self.deferred].map(|queue| QueueStats {
            class: queue.class(),
            pending: queue.pending_len(),
            in_flight: queue.in_flight_len(),
            capacity: queue.capacity(),
        })
    }
}
