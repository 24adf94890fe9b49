//! Stuck-message detection.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Error escalation fires at this multiple of the processing budget.
pub(crate) const ERROR_MULTIPLIER: u32 = 10;

/// Floor for the watchdog sleep interval.
const MIN_SLEEP: Duration = Duration::from_millis(10);

/// One in-flight handler invocation.
pub(crate) struct MessageInProgress {
    pub(crate) started: Instant,
    pub(crate) worker: String,
    pub(crate) message_id: String,
    pub(crate) warned: bool,
    pub(crate) errored: bool,
}

/// One escalation produced by a sweep.
pub(crate) struct Escalation {
    pub(crate) worker: String,
    pub(crate) message_id: String,
    pub(crate) elapsed: Duration,
}

/// Result of one watchdog sweep.
pub(crate) struct Sweep {
    pub(crate) warnings: Vec<Escalation>,
    pub(crate) errors: Vec<Escalation>,
    /// How long to sleep before the next sweep.
    pub(crate) sleep: Duration,
}

/// Examine every in-flight entry, latching at most one warning and one
/// error escalation per message.
///
/// The returned sleep interval is half the processing budget, shortened to
/// land just past the earliest still-pending escalation deadline, with a
/// 10ms floor.
pub(crate) fn sweep(
    entries: &mut HashMap<u64, MessageInProgress>,
    now: Instant,
    max_processing_time: Duration,
) -> Sweep {
    let mut warnings = Vec::new();
    let mut errors = Vec::new();
    let mut sleep = max_processing_time / 2;
    let error_deadline = max_processing_time * ERROR_MULTIPLIER;

    for entry in entries.values_mut() {
        let elapsed = now.saturating_duration_since(entry.started);

        // Next deadline this entry can still hit.
        let pending_deadline = if !entry.warned {
            Some(max_processing_time)
        } else if !entry.errored {
            Some(error_deadline)
        } else {
            None
        };
        if let Some(deadline) = pending_deadline {
            let until = deadline.saturating_sub(elapsed) + Duration::from_millis(1);
            sleep = sleep.min(until.max(MIN_SLEEP));
        }

        if !entry.warned && elapsed > max_processing_time {
            entry.warned = true;
            warnings.push(Escalation {
                worker: entry.worker.clone(),
                message_id: entry.message_id.clone(),
                elapsed,
            });
        }
        if !entry.errored && elapsed > error_deadline {
            entry.errored = true;
            errors.push(Escalation {
                worker: entry.worker.clone(),
                message_id: entry.message_id.clone(),
                elapsed,
            });
        }
    }

    Sweep {
        warnings,
        errors,
        sleep,
    }
}
