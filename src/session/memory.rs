//! In-process broker simulation.
//!
//! Implements [`SessionProvider`] entirely in memory: per-flow delivery
//! channels, close/interrupt signalling, and a reconnect window during
//! which acknowledgments are silently discarded and unsettled messages are
//! later redelivered with the redelivery marker set. Used by the
//! integration tests and useful for harness-testing downstream consumers.

use crate::error::{FlowError, Result};
use crate::types::{EndpointDescriptor, FlowSettings, SettleOutcome};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::correlation::{ConfirmResult, Confirmation, CorrelationTable};
use super::provider::{FlowHandle, InboundMessage, ReceiveOutcome, SessionProvider};

enum Signal {
    Deliver(InboundMessage),
    Interrupt,
}

struct FlowSim {
    tx: Sender<Signal>,
    rx: Receiver<Signal>,
}

struct PendingDelivery {
    queue: String,
    message: InboundMessage,
}

type WindowGate = Box<dyn Fn(u32) + Send + Sync>;

/// In-memory session provider.
pub struct InMemorySession {
    flows: Mutex<HashMap<u64, FlowSim>>,
    by_queue: Mutex<HashMap<String, u64>>,
    /// Messages published with no live flow, delivered on the next bind.
    backlog: Mutex<HashMap<String, VecDeque<InboundMessage>>>,
    /// Delivered but unsettled messages, candidates for redelivery.
    pending: Mutex<HashMap<u64, PendingDelivery>>,
    settled: Mutex<Vec<(String, SettleOutcome)>>,
    correlations: CorrelationTable,
    deferred: Mutex<Vec<(u64, ConfirmResult, Confirmation)>>,
    defer_confirmations: AtomicBool,
    reconnecting: AtomicBool,
    next_flow_id: AtomicU64,
    next_delivery_id: AtomicU64,
    next_correlation_id: AtomicU64,
    next_message_id: AtomicU64,
    open_calls: AtomicU64,
    close_calls: AtomicU64,
    settle_calls: AtomicU64,
    fail_next_bind: Mutex<Option<String>>,
    window_gate: Mutex<Option<WindowGate>>,
    window_changes: Mutex<Vec<u32>>,
}

impl InMemorySession {
    pub fn new() -> Self {
        Self {
            flows: Mutex::new(HashMap::new()),
            by_queue: Mutex::new(HashMap::new()),
            backlog: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            settled: Mutex::new(Vec::new()),
            correlations: CorrelationTable::new(),
            deferred: Mutex::new(Vec::new()),
            defer_confirmations: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            next_flow_id: AtomicU64::new(0),
            next_delivery_id: AtomicU64::new(0),
            next_correlation_id: AtomicU64::new(0),
            next_message_id: AtomicU64::new(0),
            open_calls: AtomicU64::new(0),
            close_calls: AtomicU64::new(0),
            settle_calls: AtomicU64::new(0),
            fail_next_bind: Mutex::new(None),
            window_gate: Mutex::new(None),
            window_changes: Mutex::new(Vec::new()),
        }
    }

    // --- Broker-side controls ---

    /// Publish a message to a queue. Returns the broker message id.
    pub fn publish(&self, queue: &str, payload: Vec<u8>) -> String {
        let message_id = format!("msg-{}", self.next_message_id.fetch_add(1, Ordering::SeqCst));
        let message = InboundMessage::new(
            self.next_delivery_id.fetch_add(1, Ordering::SeqCst),
            message_id.clone(),
            payload,
            false,
        );
        self.deliver(queue, message);
        message_id
    }

    /// Hand a message straight to a push consumer, tracked as delivered
    /// and unsettled. Returns the delivery to feed into the consumer's
    /// callback.
    pub fn push_delivery(&self, queue: &str, payload: Vec<u8>) -> InboundMessage {
        let message_id = format!("msg-{}", self.next_message_id.fetch_add(1, Ordering::SeqCst));
        let message = InboundMessage::new(
            self.next_delivery_id.fetch_add(1, Ordering::SeqCst),
            message_id,
            payload,
            false,
        );
        self.pending.lock().insert(
            message.delivery_id(),
            PendingDelivery {
                queue: queue.to_string(),
                message: message.clone(),
            },
        );
        message
    }

    /// Wake one receive parked on the queue's flow, as a local
    /// interruption.
    pub fn interrupt(&self, queue: &str) {
        if let Some(tx) = self.flow_tx(queue) {
            let _ = tx.send(Signal::Interrupt);
        }
    }

    /// Enter a reconnect window: parked receives are woken with a
    /// reconnecting outcome and acknowledgments are silently discarded
    /// until [`end_reconnect`](Self::end_reconnect).
    pub fn begin_reconnect(&self) {
        self.reconnecting.store(true, Ordering::SeqCst);
        let flows = self.flows.lock();
        for flow in flows.values() {
            let _ = flow.tx.send(Signal::Interrupt);
        }
    }

    /// Leave the reconnect window and redeliver every unsettled message
    /// with the redelivery marker set.
    pub fn end_reconnect(&self) {
        self.reconnecting.store(false, Ordering::SeqCst);
        let drained: Vec<PendingDelivery> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, delivery)| delivery).collect()
        };
        for delivery in drained {
            let message = InboundMessage::new(
                self.next_delivery_id.fetch_add(1, Ordering::SeqCst),
                delivery.message.message_id(),
                delivery.message.payload().to_vec(),
                true,
            );
            self.deliver(&delivery.queue, message);
        }
    }

    /// Make the next `open_flow` fail with the given broker reason.
    pub fn fail_next_bind(&self, reason: impl Into<String>) {
        *self.fail_next_bind.lock() = Some(reason.into());
    }

    /// Install a hook invoked inside `set_flow_window`, after the change
    /// is applied but before the call returns. Lets tests hold a window
    /// mutation open mid-critical-section.
    pub fn set_window_gate(&self, gate: impl Fn(u32) + Send + Sync + 'static) {
        *self.window_gate.lock() = Some(Box::new(gate));
    }

    /// Hold settlement confirmations instead of completing them inline.
    pub fn set_defer_confirmations(&self, defer: bool) {
        self.defer_confirmations.store(defer, Ordering::SeqCst);
    }

    /// Complete all held confirmations in reverse submission order.
    /// Returns the waiters for inspection.
    pub fn confirm_deferred_out_of_order(&self) -> Vec<Confirmation> {
        let mut held: Vec<(u64, ConfirmResult, Confirmation)> =
            std::mem::take(&mut *self.deferred.lock());
        held.reverse();
        held.into_iter()
            .map(|(id, result, confirmation)| {
                self.correlations.complete(id, result);
                confirmation
            })
            .collect()
    }

    // --- Observation ---

    pub fn open_count(&self) -> u64 {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> u64 {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Settlement attempts, whether or not the broker accepted them.
    pub fn settle_count(&self) -> u64 {
        self.settle_calls.load(Ordering::SeqCst)
    }

    /// Every window size passed to `set_flow_window`, in order.
    pub fn window_changes(&self) -> Vec<u32> {
        self.window_changes.lock().clone()
    }

    /// Settlements the broker has recorded, as (message id, outcome).
    pub fn settled(&self) -> Vec<(String, SettleOutcome)> {
        self.settled.lock().clone()
    }

    /// Delivered-but-unsettled message count.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Settlement confirmations still awaiting the broker.
    pub fn outstanding_confirmations(&self) -> usize {
        self.correlations.outstanding()
    }

    // --- Internals ---

    fn flow_tx(&self, queue: &str) -> Option<Sender<Signal>> {
        let by_queue = self.by_queue.lock();
        let id = by_queue.get(queue)?;
        self.flows.lock().get(id).map(|flow| flow.tx.clone())
    }

    fn deliver(&self, queue: &str, message: InboundMessage) {
        match self.flow_tx(queue) {
            Some(tx) => {
                // A racing close may have dropped the consumer; fall back
                // to the backlog like a broker requeue.
                if let Err(err) = tx.send(Signal::Deliver(message)) {
                    if let Signal::Deliver(message) = err.into_inner() {
                        self.push_backlog(queue, message);
                    }
                }
            }
            None => self.push_backlog(queue, message),
        }
    }

    fn push_backlog(&self, queue: &str, message: InboundMessage) {
        self.backlog
            .lock()
            .entry(queue.to_string())
            .or_default()
            .push_back(message);
    }
}

impl Default for InMemorySession {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionProvider for InMemorySession {
    fn open_flow(
        &self,
        endpoint: &EndpointDescriptor,
        settings: &FlowSettings,
    ) -> Result<Arc<FlowHandle>> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(reason) = self.fail_next_bind.lock().take() {
            return Err(FlowError::BindFailure(reason));
        }
        if self.by_queue.lock().contains_key(&endpoint.name) {
            return Err(FlowError::BindFailure(format!(
                "queue {} is exclusively bound",
                endpoint.name
            )));
        }

        let id = self.next_flow_id.fetch_add(1, Ordering::SeqCst);
        let handle = Arc::new(FlowHandle::new(id, endpoint.clone(), settings.window_size));
        let (tx, rx) = unbounded();

        // Deliver anything published before the flow existed.
        if let Some(backlog) = self.backlog.lock().remove(&endpoint.name) {
            for message in backlog {
                let _ = tx.send(Signal::Deliver(message));
            }
        }

        self.by_queue.lock().insert(endpoint.name.clone(), id);
        self.flows.lock().insert(id, FlowSim { tx, rx });
        Ok(handle)
    }

    fn close_flow(&self, handle: &FlowHandle) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);

        let queue = handle.endpoint().name.clone();
        handle.mark_closed();
        self.by_queue.lock().remove(&queue);
        // Dropping the flow's sender resolves parked receives to Closed.
        self.flows.lock().remove(&handle.id());

        // Unsettled deliveries go back to the queue, marked redelivered.
        let requeued: Vec<InboundMessage> = {
            let mut pending = self.pending.lock();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, delivery)| delivery.queue == queue)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id))
                .map(|delivery| {
                    InboundMessage::new(
                        self.next_delivery_id.fetch_add(1, Ordering::SeqCst),
                        delivery.message.message_id(),
                        delivery.message.payload().to_vec(),
                        true,
                    )
                })
                .collect()
        };
        for message in requeued {
            self.push_backlog(&queue, message);
        }
    }

    fn set_flow_window(&self, handle: &FlowHandle, size: u32) -> Result<()> {
        if !handle.is_live() || !self.flows.lock().contains_key(&handle.id()) {
            return Err(FlowError::Session(format!(
                "flow {} is not open",
                handle.id()
            )));
        }
        handle.set_window_size(size);
        self.window_changes.lock().push(size);

        // Test gate runs inside the critical section, after the change
        // committed.
        if let Some(gate) = &*self.window_gate.lock() {
            gate(size);
        }
        Ok(())
    }

    fn receive_blocking(&self, handle: &FlowHandle, timeout: Option<Duration>) -> ReceiveOutcome {
        let rx = {
            let flows = self.flows.lock();
            match flows.get(&handle.id()) {
                Some(flow) if handle.is_live() => flow.rx.clone(),
                _ => return ReceiveOutcome::Closed,
            }
        };

        let signal = match timeout {
            None => match rx.recv() {
                Ok(signal) => signal,
                Err(_) => return ReceiveOutcome::Closed,
            },
            Some(timeout) if timeout.is_zero() => match rx.try_recv() {
                Ok(signal) => signal,
                Err(TryRecvError::Empty) => return ReceiveOutcome::Timeout,
                Err(TryRecvError::Disconnected) => return ReceiveOutcome::Closed,
            },
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(signal) => signal,
                Err(RecvTimeoutError::Timeout) => return ReceiveOutcome::Timeout,
                Err(RecvTimeoutError::Disconnected) => return ReceiveOutcome::Closed,
            },
        };

        match signal {
            Signal::Deliver(message) => {
                self.pending.lock().insert(
                    message.delivery_id(),
                    PendingDelivery {
                        queue: handle.endpoint().name.clone(),
                        message: message.clone(),
                    },
                );
                ReceiveOutcome::Message(message)
            }
            Signal::Interrupt => {
                if self.reconnecting.load(Ordering::SeqCst) {
                    ReceiveOutcome::Reconnecting
                } else {
                    ReceiveOutcome::Interrupted
                }
            }
        }
    }

    fn settle(&self, message: &InboundMessage, outcome: SettleOutcome) -> Result<()> {
        self.settle_calls.fetch_add(1, Ordering::SeqCst);

        // Acknowledgments issued inside a reconnect window are discarded
        // by the broker without an error; the message stays pending and
        // will be redelivered.
        if self.reconnecting.load(Ordering::SeqCst) && outcome == SettleOutcome::Accepted {
            return Ok(());
        }

        let delivery = self.pending.lock().remove(&message.delivery_id());
        if delivery.is_none() {
            return Err(FlowError::SettlementFailure(format!(
                "delivery {} is unknown to the broker",
                message.delivery_id()
            )));
        }

        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::SeqCst);
        let confirmation = self.correlations.register(correlation_id)?;
        self.settled
            .lock()
            .push((message.message_id().to_string(), outcome));

        if self.defer_confirmations.load(Ordering::SeqCst) {
            self.deferred
                .lock()
                .push((correlation_id, Ok(()), confirmation));
        } else {
            self.correlations.complete(correlation_id, Ok(()));
        }
        Ok(())
    }
}
