//! Session collaborator seam.
//!
//! The delivery core never speaks the broker wire protocol itself. It
//! consumes an already-connected session through the [`SessionProvider`]
//! trait and owns only the lifecycle of the flows it opens through it.

mod correlation;
mod memory;
mod provider;

pub use correlation::{ConfirmResult, Confirmation, CorrelationTable};
pub use memory::InMemorySession;
pub use provider::{FlowHandle, InboundMessage, ReceiveOutcome, SessionProvider};
