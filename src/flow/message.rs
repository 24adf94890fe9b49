//! Received-message wrapper.

use crate::session::InboundMessage;
use crate::types::GenerationId;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One received message, stamped with the generation of the flow that
/// produced it.
///
/// The staleness flag is shared by every container of one generation and
/// flips exactly once, when that generation is torn down. A stale
/// container can no longer be acknowledged.
pub struct MessageContainer {
    message: InboundMessage,
    generation: GenerationId,
    stale: Arc<AtomicBool>,
    settled: AtomicBool,
}

impl MessageContainer {
    pub(crate) fn new(
        message: InboundMessage,
        generation: GenerationId,
        stale: Arc<AtomicBool>,
    ) -> Self {
        Self {
            message,
            generation,
            stale,
            settled: AtomicBool::new(false),
        }
    }

    /// The wrapped broker delivery.
    pub fn message(&self) -> &InboundMessage {
        &self.message
    }

    /// Payload bytes of the wrapped delivery.
    pub fn payload(&self) -> &[u8] {
        self.message.payload()
    }

    /// Generation of the flow this message was received on.
    pub fn generation(&self) -> GenerationId {
        self.generation
    }

    /// True once the producing generation has been torn down.
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    /// True once the message has been settled with the broker.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_settled(&self) {
        self.settled.store(true, Ordering::SeqCst);
    }
}

impl fmt::Debug for MessageContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageContainer")
            .field("message_id", &self.message.message_id())
            .field("generation", &self.generation)
            .field("stale", &self.is_stale())
            .field("settled", &self.is_settled())
            .finish()
    }
}
