//! Correlation of broker confirmations to outstanding requests.

use crate::error::{FlowError, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Result of one confirmed operation.
pub type ConfirmResult = std::result::Result<(), String>;

/// Waiter side of one registered operation.
pub struct Confirmation {
    rx: Receiver<ConfirmResult>,
}

impl Confirmation {
    /// Block until the broker confirms the operation.
    pub fn wait(&self) -> Option<ConfirmResult> {
        self.rx.recv().ok()
    }

    /// Block up to `timeout` for the confirmation.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ConfirmResult> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Non-blocking check.
    pub fn try_result(&self) -> Option<ConfirmResult> {
        self.rx.try_recv().ok()
    }
}

/// Matches broker confirmations to outstanding requests by broker-assigned
/// correlation id.
///
/// Confirmations may arrive in any order relative to submission. An entry
/// is removed the moment it completes, so an id reused for a later
/// operation (legal only once the prior one finished) can never receive
/// the earlier operation's confirmation.
#[derive(Default)]
pub struct CorrelationTable {
    pending: Mutex<HashMap<u64, Sender<ConfirmResult>>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation under `id` and return its waiter.
    ///
    /// Fails if `id` is still outstanding: reuse before completion would
    /// make confirmations ambiguous.
    pub fn register(&self, id: u64) -> Result<Confirmation> {
        let mut pending = self.pending.lock();
        if pending.contains_key(&id) {
            return Err(FlowError::Session(format!(
                "correlation id {id} is already outstanding"
            )));
        }
        let (tx, rx) = bounded(1);
        pending.insert(id, tx);
        Ok(Confirmation { rx })
    }

    /// Deliver a confirmation. Returns false if `id` has no outstanding
    /// operation (already completed, or never registered).
    pub fn complete(&self, id: u64, result: ConfirmResult) -> bool {
        let tx = self.pending.lock().remove(&id);
        match tx {
            Some(tx) => {
                // Waiter may already be gone; the operation still counts
                // as completed.
                let _ = tx.try_send(result);
                true
            }
            None => false,
        }
    }

    /// Number of operations awaiting confirmation.
    pub fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }
}
