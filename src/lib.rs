//! # Flowline
//!
//! The consumer-side delivery core of a message-broker client binding:
//! lifecycle management for broker-bound receiving flows, and a push-mode
//! dispatch pool with stuck-message detection.
//!
//! ## Core Concepts
//!
//! - **Flow**: a stateful, broker-negotiated subscription handle bound to
//!   one queue, supporting flow-controlled delivery
//! - **Generation**: a token minted per physical bind, distinguishing one
//!   bind of a flow from a later rebind; stale messages from a torn-down
//!   generation can no longer be acknowledged
//! - **Dispatch pool**: worker threads draining broker push deliveries,
//!   watched for handler invocations that overrun their budget
//! - **Session provider**: the injected collaborator that owns the broker
//!   session and wire protocol
//!
//! ## Example
//!
//! ```ignore
//! use flowline::{
//!     EndpointDescriptor, FlowContainer, FlowContainerConfig, FlowSettings,
//!     InMemorySession,
//! };
//! use std::sync::Arc;
//!
//! let session = Arc::new(InMemorySession::new());
//! let flow = FlowContainer::new(
//!     FlowContainerConfig {
//!         name: "orders-in".to_string(),
//!         endpoint: EndpointDescriptor::durable("orders"),
//!         settings: FlowSettings::default(),
//!     },
//!     session.clone(),
//! );
//!
//! flow.bind()?;
//! if let Some(message) = flow.receive()? {
//!     // process, then settle
//!     flow.acknowledge(&message)?;
//! }
//! flow.unbind();
//! ```

pub mod dispatch;
pub mod error;
pub mod flow;
pub mod meter;
pub mod session;
pub mod types;

// Re-exports
pub use dispatch::{DispatchPool, Ring, WatchdogStats, MIN_PROCESSING_BUDGET};
pub use error::{FlowError, Result};
pub use flow::{FlowContainer, FlowContainerConfig, MessageContainer};
pub use meter::{MeterSink, NullMeter};
pub use session::{
    ConfirmResult, Confirmation, CorrelationTable, FlowHandle, InMemorySession, InboundMessage,
    ReceiveOutcome, SessionProvider,
};
pub use types::*;
