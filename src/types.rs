//! Core types for the delivery layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier for one physical bind of a flow.
///
/// A new token is minted every time a flow is physically opened against the
/// broker. Pause/resume and broker-driven reconnects of the same logical
/// flow do not mint a new token.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenerationId(Uuid);

impl GenerationId {
    /// Mint a fresh token.
    pub fn mint() -> Self {
        GenerationId(Uuid::new_v4())
    }
}

impl fmt::Debug for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GenerationId({})", self.0)
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether an endpoint outlives the session that created it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Durable,
    Temporary,
}

/// Identity of the queue a flow binds to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// Queue name.
    pub name: String,

    /// Durable or temporary.
    pub kind: EndpointKind,
}

impl EndpointDescriptor {
    /// A durable queue endpoint.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EndpointKind::Durable,
        }
    }

    /// A temporary queue endpoint.
    pub fn temporary(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EndpointKind::Temporary,
        }
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Default flow-control window size.
pub const DEFAULT_WINDOW_SIZE: u32 = 255;

/// Negotiated parameters for a flow.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowSettings {
    /// Flow-control window size to negotiate on bind. 0 means the flow
    /// starts paused.
    pub window_size: u32,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }
}

/// Broker-facing settlement outcome for a received message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettleOutcome {
    /// Message was processed; remove it from the broker's redelivery set.
    Accepted,
    /// Processing failed; the broker may redeliver.
    Failed,
    /// Message is unprocessable; route per broker policy.
    Rejected,
}
