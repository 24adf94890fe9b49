//! Flow lifecycle management.
//!
//! A [`FlowContainer`] owns at most one live flow handle and exposes
//! bind/unbind/pause/resume/receive/acknowledge under concurrent access,
//! with generation-based staleness protecting acknowledgments across
//! rebinds.

mod container;
mod message;

pub use container::{FlowContainer, FlowContainerConfig};
pub use message::MessageContainer;
