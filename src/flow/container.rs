//! Flow lifecycle manager.

use crate::error::{FlowError, Result};
use crate::meter::MeterSink;
use crate::session::{FlowHandle, ReceiveOutcome, SessionProvider};
use crate::types::{EndpointDescriptor, FlowSettings, GenerationId, SettleOutcome};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::message::MessageContainer;

/// Flow container configuration.
#[derive(Clone, Debug)]
pub struct FlowContainerConfig {
    /// Binding name used for gauges and log events.
    pub name: String,

    /// Queue the flow binds to.
    pub endpoint: EndpointDescriptor,

    /// Negotiated flow parameters.
    pub settings: FlowSettings,
}

/// A bound flow and the per-generation state shared with its messages.
struct BoundFlow {
    handle: Arc<FlowHandle>,
    generation: GenerationId,
    /// Flipped once on teardown; shared with every MessageContainer of
    /// this generation.
    stale: Arc<AtomicBool>,
    /// Received but not yet settled.
    in_flight: Arc<AtomicUsize>,
}

struct FlowState {
    bound: Option<BoundFlow>,
    /// Pause intent. Survives while unbound and is applied on the next
    /// bind; reset by unbind.
    pause_requested: bool,
}

/// Manages the lifecycle of one broker-bound receiving flow.
///
/// At most one flow handle is live at a time. Mutating operations (bind,
/// unbind, pause, resume) serialize on an internal mutation lock; blocking
/// receives run concurrently and never hold it while parked. Every
/// received message is stamped with the generation token of the physical
/// bind that produced it, and acknowledgments are validated against that
/// token.
pub struct FlowContainer {
    config: FlowContainerConfig,
    session: Arc<dyn SessionProvider>,
    meter: Option<Arc<dyn MeterSink>>,
    state: Mutex<FlowState>,
    /// Externally observable pause flag. Written only inside the mutation
    /// lock, after the broker-facing critical section commits, so readers
    /// never observe a half-applied transition.
    paused: AtomicBool,
}

impl FlowContainer {
    pub fn new(config: FlowContainerConfig, session: Arc<dyn SessionProvider>) -> Self {
        Self {
            config,
            session,
            meter: None,
            state: Mutex::new(FlowState {
                bound: None,
                pause_requested: false,
            }),
            paused: AtomicBool::new(false),
        }
    }

    /// Attach a meter sink for in-flight gauge reporting.
    pub fn with_meter(mut self, meter: Arc<dyn MeterSink>) -> Self {
        self.meter = Some(meter);
        self
    }

    // --- Lifecycle ---

    /// Bind the flow, if not already bound.
    ///
    /// Opens a flow handle against the configured endpoint and mints a new
    /// generation token. Idempotent: a bound container returns the
    /// existing token without touching the broker. Concurrent callers
    /// serialize on the mutation lock; losers observe the winner's bound
    /// state and return the same token. If the broker rejects the bind the
    /// container stays unbound and the performing caller gets the failure;
    /// concurrent waiters then perform a fresh attempt of their own.
    pub fn bind(&self) -> Result<GenerationId> {
        let mut state = self.state.lock();
        if let Some(bound) = &state.bound {
            return Ok(bound.generation);
        }

        let window_size = if state.pause_requested {
            0
        } else {
            self.config.settings.window_size
        };
        let handle = self
            .session
            .open_flow(&self.config.endpoint, &FlowSettings { window_size })
            .map_err(|e| match e {
                FlowError::BindFailure(reason) => FlowError::BindFailure(reason),
                other => FlowError::BindFailure(other.to_string()),
            })?;

        let generation = GenerationId::mint();
        debug!(
            binding = %self.config.name,
            endpoint = %self.config.endpoint,
            %generation,
            paused = state.pause_requested,
            "flow bound"
        );
        state.bound = Some(BoundFlow {
            handle,
            generation,
            stale: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        });
        Ok(generation)
    }

    /// Unbind the flow, if bound.
    ///
    /// Closes the handle (resolving any parked receive to
    /// [`FlowError::ClosedWhileReceiving`]), marks every outstanding
    /// message of the current generation stale, and resets pause
    /// persistence. Idempotent; concurrent callers all observe the same
    /// end state and only one performs the physical close.
    pub fn unbind(&self) {
        let mut state = self.state.lock();
        if let Some(bound) = state.bound.take() {
            bound.stale.store(true, Ordering::SeqCst);
            self.session.close_flow(&bound.handle);
            state.pause_requested = false;
            self.paused.store(false, Ordering::SeqCst);
            self.report_in_flight(0);
            debug!(
                binding = %self.config.name,
                generation = %bound.generation,
                "flow unbound"
            );
        }
    }

    /// Pause delivery by collapsing the flow-control window to zero.
    ///
    /// While unbound this only persists the intent, applied on the next
    /// bind. Mutually exclusive with `resume` and with itself: when both
    /// race, the observable state reflects whichever critical section
    /// committed last.
    pub fn pause(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.pause_requested = true;
        if let Some(bound) = &state.bound {
            self.session.set_flow_window(&bound.handle, 0)?;
        }
        self.paused.store(true, Ordering::SeqCst);
        debug!(binding = %self.config.name, "flow paused");
        Ok(())
    }

    /// Resume delivery by restoring the configured window size.
    ///
    /// Counterpart of [`pause`](Self::pause), with the same exclusion and
    /// last-committer-wins semantics.
    pub fn resume(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.pause_requested = false;
        if let Some(bound) = &state.bound {
            self.session
                .set_flow_window(&bound.handle, self.config.settings.window_size)?;
        }
        self.paused.store(false, Ordering::SeqCst);
        debug!(binding = %self.config.name, "flow resumed");
        Ok(())
    }

    /// The broker transparently recreated the physical flow.
    ///
    /// The generation token does not change: it is the same logical
    /// subscription. The persisted pause state is re-asserted on the
    /// rebuilt flow so a paused container stays paused across the
    /// reconnect.
    pub fn on_session_reconnect(&self) {
        let state = self.state.lock();
        if let Some(bound) = &state.bound {
            let window_size = if state.pause_requested {
                0
            } else {
                self.config.settings.window_size
            };
            if let Err(e) = self.session.set_flow_window(&bound.handle, window_size) {
                warn!(
                    binding = %self.config.name,
                    error = %e,
                    "failed to re-assert flow window after session reconnect"
                );
            } else {
                debug!(
                    binding = %self.config.name,
                    window_size,
                    "flow window re-asserted after session reconnect"
                );
            }
        }
    }

    // --- Receiving ---

    /// Block indefinitely for the next message.
    ///
    /// Returns `Ok(None)` if the waiting thread is interrupted locally,
    /// `Err(ClosedWhileReceiving)` if `unbind` races the wait, and
    /// `Err(Unbound)` if called while unbound.
    pub fn receive(&self) -> Result<Option<MessageContainer>> {
        self.receive_inner(None)
    }

    /// Block up to `timeout` for the next message.
    ///
    /// `Duration::ZERO` is an immediate poll. Elapsed timeouts and local
    /// interruption both return `Ok(None)`; a caller can tell teardown
    /// apart because that is `Err(ClosedWhileReceiving)`.
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Option<MessageContainer>> {
        self.receive_inner(Some(timeout))
    }

    fn receive_inner(&self, timeout: Option<Duration>) -> Result<Option<MessageContainer>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            // Snapshot under the lock, block outside it: unbind must be
            // able to acquire the lock and close the handle while this
            // thread is parked.
            let (handle, generation, stale, in_flight) = {
                let state = self.state.lock();
                match &state.bound {
                    None => return Err(FlowError::Unbound),
                    Some(bound) => (
                        Arc::clone(&bound.handle),
                        bound.generation,
                        Arc::clone(&bound.stale),
                        Arc::clone(&bound.in_flight),
                    ),
                }
            };

            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            match self.session.receive_blocking(&handle, remaining) {
                ReceiveOutcome::Message(message) => {
                    let count = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    self.report_in_flight(count);
                    return Ok(Some(MessageContainer::new(message, generation, stale)));
                }
                ReceiveOutcome::Timeout => return Ok(None),
                ReceiveOutcome::Interrupted => return Ok(None),
                // Same logical flow being rebuilt by the broker; retry
                // against the remaining time.
                ReceiveOutcome::Reconnecting => continue,
                ReceiveOutcome::Closed => return Err(FlowError::ClosedWhileReceiving),
            }
        }
    }

    // --- Acknowledgment ---

    /// Settle a received message with the broker.
    ///
    /// Fails with [`FlowError::StaleMessage`] — without contacting the
    /// broker — if the container belongs to a torn-down generation.
    /// Acknowledging an already-settled container is a no-op. Settlement
    /// is fire-and-forget with respect to broker-driven reconnects: an
    /// acknowledgment issued inside a reconnect window may be silently
    /// discarded, and the message is then redelivered with its redelivery
    /// marker set. The container does not retry or detect that case.
    pub fn acknowledge(&self, container: &MessageContainer) -> Result<()> {
        if container.is_settled() {
            return Ok(());
        }

        let in_flight = {
            let state = self.state.lock();
            let current = state.bound.as_ref();
            if container.is_stale()
                || current.map(|bound| bound.generation) != Some(container.generation())
            {
                return Err(FlowError::StaleMessage(container.generation()));
            }
            current.map(|bound| Arc::clone(&bound.in_flight))
        };

        self.session
            .settle(container.message(), SettleOutcome::Accepted)
            .map_err(|e| match e {
                FlowError::SettlementFailure(reason) => FlowError::SettlementFailure(reason),
                other => FlowError::SettlementFailure(other.to_string()),
            })?;
        container.mark_settled();

        if let Some(in_flight) = in_flight {
            let count = in_flight.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
            self.report_in_flight(count);
        }
        Ok(())
    }

    // --- Observation ---

    /// Whether delivery is currently paused (or pause is the persisted
    /// intent while unbound).
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Generation token of the current bind, if bound.
    pub fn generation(&self) -> Option<GenerationId> {
        self.state.lock().bound.as_ref().map(|bound| bound.generation)
    }

    pub fn is_bound(&self) -> bool {
        self.state.lock().bound.is_some()
    }

    /// Received-but-unsettled message count for the current generation.
    pub fn in_flight(&self) -> usize {
        self.state
            .lock()
            .bound
            .as_ref()
            .map(|bound| bound.in_flight.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn report_in_flight(&self, count: usize) {
        if let Some(meter) = &self.meter {
            meter.record_in_flight(&self.config.name, count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InMemorySession;

    fn container(session: &Arc<InMemorySession>) -> FlowContainer {
        FlowContainer::new(
            FlowContainerConfig {
                name: "test".to_string(),
                endpoint: EndpointDescriptor::durable("q"),
                settings: FlowSettings::default(),
            },
            Arc::clone(session) as Arc<dyn SessionProvider>,
        )
    }

    #[test]
    fn test_bind_is_idempotent() {
        let session = Arc::new(InMemorySession::new());
        let flow = container(&session);

        let first = flow.bind().unwrap();
        let second = flow.bind().unwrap();
        assert_eq!(first, second);
        assert_eq!(session.open_count(), 1);
    }

    #[test]
    fn test_rebind_mints_new_generation() {
        let session = Arc::new(InMemorySession::new());
        let flow = container(&session);

        let first = flow.bind().unwrap();
        flow.unbind();
        let second = flow.bind().unwrap();
        assert_ne!(first, second);
        assert_eq!(session.open_count(), 2);
        assert_eq!(session.close_count(), 1);
    }

    #[test]
    fn test_bind_failure_leaves_unbound() {
        let session = Arc::new(InMemorySession::new());
        let flow = container(&session);
        session.fail_next_bind("no such queue");

        assert!(matches!(flow.bind(), Err(FlowError::BindFailure(_))));
        assert!(!flow.is_bound());

        // Next attempt is fresh.
        flow.bind().unwrap();
        assert!(flow.is_bound());
    }

    #[test]
    fn test_unbind_is_idempotent() {
        let session = Arc::new(InMemorySession::new());
        let flow = container(&session);

        flow.bind().unwrap();
        flow.unbind();
        flow.unbind();
        assert_eq!(session.close_count(), 1);
        assert!(flow.generation().is_none());
    }

    #[test]
    fn test_receive_while_unbound() {
        let session = Arc::new(InMemorySession::new());
        let flow = container(&session);
        assert!(matches!(flow.receive(), Err(FlowError::Unbound)));
    }

    #[test]
    fn test_receive_stamps_current_generation() {
        let session = Arc::new(InMemorySession::new());
        let flow = container(&session);
        let generation = flow.bind().unwrap();

        session.publish("q", b"x".to_vec());
        let message = flow
            .receive_timeout(Duration::from_secs(1))
            .unwrap()
            .unwrap();
        assert_eq!(message.generation(), generation);
        assert!(!message.is_stale());
    }

    #[test]
    fn test_acknowledge_settles() {
        let session = Arc::new(InMemorySession::new());
        let flow = container(&session);
        flow.bind().unwrap();

        session.publish("q", b"x".to_vec());
        let message = flow
            .receive_timeout(Duration::from_secs(1))
            .unwrap()
            .unwrap();
        assert_eq!(flow.in_flight(), 1);

        flow.acknowledge(&message).unwrap();
        assert!(message.is_settled());
        assert_eq!(flow.in_flight(), 0);
        assert_eq!(session.settled().len(), 1);

        // Second acknowledge is a no-op.
        flow.acknowledge(&message).unwrap();
        assert_eq!(session.settled().len(), 1);
    }

    #[test]
    fn test_acknowledge_after_unbind_is_stale() {
        let session = Arc::new(InMemorySession::new());
        let flow = container(&session);
        flow.bind().unwrap();

        session.publish("q", b"x".to_vec());
        let message = flow
            .receive_timeout(Duration::from_secs(1))
            .unwrap()
            .unwrap();
        flow.unbind();

        assert!(message.is_stale());
        assert!(matches!(
            flow.acknowledge(&message),
            Err(FlowError::StaleMessage(_))
        ));
        // The broker never saw the settlement.
        assert!(session.settled().is_empty());
    }

    #[test]
    fn test_pause_while_unbound_applies_on_bind() {
        let session = Arc::new(InMemorySession::new());
        let flow = container(&session);

        flow.pause().unwrap();
        assert!(flow.is_paused());
        assert!(!flow.is_bound());

        flow.bind().unwrap();
        assert!(flow.is_paused());
        // The flow was opened with a zero window, not resized after.
        assert!(session.window_changes().is_empty());
    }

    #[test]
    fn test_unbind_resets_pause() {
        let session = Arc::new(InMemorySession::new());
        let flow = container(&session);

        flow.bind().unwrap();
        flow.pause().unwrap();
        flow.unbind();
        assert!(!flow.is_paused());

        flow.bind().unwrap();
        assert!(!flow.is_paused());
    }

    #[test]
    fn test_reconnect_reasserts_pause_window() {
        let session = Arc::new(InMemorySession::new());
        let flow = container(&session);
        flow.bind().unwrap();
        flow.pause().unwrap();

        flow.on_session_reconnect();
        assert_eq!(session.window_changes(), vec![0, 0]);
        assert!(flow.is_paused());
    }
}
