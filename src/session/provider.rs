//! Session provider trait and the types that cross it.

use crate::error::Result;
use crate::types::{EndpointDescriptor, FlowSettings, SettleOutcome};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Broker resource representing one bound subscription.
///
/// Minted by the session provider, owned exclusively by the flow container.
/// The window size and liveness flag are updated by the provider as the
/// broker applies changes.
pub struct FlowHandle {
    id: u64,
    endpoint: EndpointDescriptor,
    window: AtomicU32,
    live: AtomicBool,
}

impl FlowHandle {
    /// Create a handle for a freshly opened flow.
    pub fn new(id: u64, endpoint: EndpointDescriptor, window_size: u32) -> Self {
        Self {
            id,
            endpoint,
            window: AtomicU32::new(window_size),
            live: AtomicBool::new(true),
        }
    }

    /// Provider-assigned flow id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The endpoint this flow is bound to.
    pub fn endpoint(&self) -> &EndpointDescriptor {
        &self.endpoint
    }

    /// Currently negotiated flow-control window size.
    pub fn window_size(&self) -> u32 {
        self.window.load(Ordering::SeqCst)
    }

    /// Record a committed window change.
    pub fn set_window_size(&self, size: u32) {
        self.window.store(size, Ordering::SeqCst);
    }

    /// Whether the flow is still open against the broker.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Mark the flow closed. Called by the provider on close.
    pub fn mark_closed(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for FlowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowHandle")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint.name)
            .field("window", &self.window_size())
            .field("live", &self.is_live())
            .finish()
    }
}

/// One delivery handed out by the broker.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    delivery_id: u64,
    message_id: String,
    payload: Vec<u8>,
    redelivered: bool,
}

impl InboundMessage {
    pub fn new(
        delivery_id: u64,
        message_id: impl Into<String>,
        payload: Vec<u8>,
        redelivered: bool,
    ) -> Self {
        Self {
            delivery_id,
            message_id: message_id.into(),
            payload,
            redelivered,
        }
    }

    /// Provider-assigned id correlating this delivery to its settlement.
    pub fn delivery_id(&self) -> u64 {
        self.delivery_id
    }

    /// Broker message id.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// True if the broker re-transmitted this message because a prior
    /// delivery was never settled (e.g. an acknowledgment was lost to a
    /// reconnect).
    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }
}

/// Result of a blocking receive against a flow handle.
#[derive(Debug)]
pub enum ReceiveOutcome {
    /// A message arrived.
    Message(InboundMessage),
    /// The wait elapsed with nothing to deliver.
    Timeout,
    /// The waiting thread was interrupted locally. Recoverable; callers
    /// treat this like an elapsed timeout.
    Interrupted,
    /// The broker is transparently rebuilding the same logical flow. The
    /// caller may retry against the same handle.
    Reconnecting,
    /// The flow was closed while the receive was parked.
    Closed,
}

/// An already-connected broker session.
///
/// The single seam between the delivery core and the wire. Implementations
/// must be safe to call from multiple threads: blocking receives run
/// concurrently with flow mutations.
pub trait SessionProvider: Send + Sync {
    /// Open a flow against an endpoint. The negotiated window size comes
    /// from `settings` (0 opens the flow paused).
    fn open_flow(
        &self,
        endpoint: &EndpointDescriptor,
        settings: &FlowSettings,
    ) -> Result<Arc<FlowHandle>>;

    /// Close a flow. Any receive parked on the handle resolves to
    /// [`ReceiveOutcome::Closed`].
    fn close_flow(&self, handle: &FlowHandle);

    /// Change the flow-control window of a live flow.
    fn set_flow_window(&self, handle: &FlowHandle, size: u32) -> Result<()>;

    /// Block for up to `timeout` waiting for a delivery. `None` blocks
    /// indefinitely; `Some(Duration::ZERO)` is an immediate poll.
    fn receive_blocking(&self, handle: &FlowHandle, timeout: Option<Duration>) -> ReceiveOutcome;

    /// Settle a delivery. Fire-and-forget with respect to broker-driven
    /// reconnects: a settlement issued inside a reconnect window may be
    /// silently discarded, in which case the message is redelivered with
    /// the redelivery marker set.
    fn settle(&self, message: &InboundMessage, outcome: SettleOutcome) -> Result<()>;
}
