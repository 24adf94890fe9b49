//! Push-mode dispatch pool.

use crate::error::{FlowError, Result};
use crate::meter::MeterSink;
use crate::session::{InboundMessage, SessionProvider};
use crate::types::SettleOutcome;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

use super::ring::Ring;
use super::watchdog::{sweep, MessageInProgress};

/// Smallest allowed processing budget.
pub const MIN_PROCESSING_BUDGET: Duration = Duration::from_millis(100);

/// How long an idle worker waits on the intake before re-checking the
/// running flag.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of the recent-message-id diagnostic ring.
const ID_RING_CAPACITY: usize = 128;

/// Enqueue retry budget. The intake is unbounded, so these can only be
/// exhausted if the channel itself is torn down.
const ENQUEUE_RETRIES: usize = 100;
const ENQUEUE_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Watchdog escalation counters.
#[derive(Default)]
pub struct WatchdogStats {
    warnings: AtomicU64,
    errors: AtomicU64,
}

impl WatchdogStats {
    /// Messages that exceeded the processing budget.
    pub fn warnings(&self) -> u64 {
        self.warnings.load(Ordering::SeqCst)
    }

    /// Messages that exceeded ten times the processing budget.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::SeqCst)
    }
}

type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Fixed-size worker pool draining an unbounded intake queue fed by broker
/// push-delivery callbacks, with a watchdog escalating stuck messages.
///
/// Workers poll the intake, invoke the caller-supplied handler, and track
/// each in-flight invocation in a shared set. The watchdog wakes on an
/// adaptive interval, logs a single warning for any message processing
/// past the configured budget and a single error past ten times the
/// budget, and reports queue depth and in-flight count to the meter sink.
pub struct DispatchPool {
    name: String,
    session: Arc<dyn SessionProvider>,
    meter: Option<Arc<dyn MeterSink>>,
    intake_tx: Sender<InboundMessage>,
    intake_rx: Receiver<InboundMessage>,
    in_flight: Arc<Mutex<HashMap<u64, MessageInProgress>>>,
    next_entry: Arc<AtomicU64>,
    recent_ids: Mutex<Ring<String>>,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<WatchdogStats>,
}

impl DispatchPool {
    pub fn new(name: impl Into<String>, session: Arc<dyn SessionProvider>) -> Self {
        let (intake_tx, intake_rx) = unbounded();
        Self {
            name: name.into(),
            session,
            meter: None,
            intake_tx,
            intake_rx,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_entry: Arc::new(AtomicU64::new(0)),
            recent_ids: Mutex::new(Ring::new(ID_RING_CAPACITY)),
            running: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
            stats: Arc::new(WatchdogStats::default()),
        }
    }

    /// Attach a meter sink for queue-depth and in-flight gauges.
    pub fn with_meter(mut self, meter: Arc<dyn MeterSink>) -> Self {
        self.meter = Some(meter);
        self
    }

    /// Spawn `workers` receiver threads plus the watchdog.
    ///
    /// Fails fast if the processing budget is under 100ms, if `workers`
    /// is zero, or if the pool is already running.
    pub fn start<F>(
        &self,
        workers: usize,
        max_processing_time: Duration,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        if max_processing_time < MIN_PROCESSING_BUDGET {
            return Err(FlowError::InvalidConfig(format!(
                "max processing time must be at least {}ms",
                MIN_PROCESSING_BUDGET.as_millis()
            )));
        }
        if workers == 0 {
            return Err(FlowError::InvalidConfig(
                "worker count must be at least 1".to_string(),
            ));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(FlowError::InvalidConfig(
                "dispatch pool is already running".to_string(),
            ));
        }

        let handler: MessageHandler = Arc::new(handler);
        let mut threads = self.threads.lock();

        for i in 0..workers {
            let worker_name = format!("{}-{}", self.name, i);
            let handle = spawn_thread(&worker_name, {
                let worker_name = worker_name.clone();
                let rx = self.intake_rx.clone();
                let running = Arc::clone(&self.running);
                let in_flight = Arc::clone(&self.in_flight);
                let next_entry = Arc::clone(&self.next_entry);
                let handler = Arc::clone(&handler);
                move || worker_loop(worker_name, rx, running, in_flight, next_entry, handler)
            })?;
            threads.push(handle);
            debug!(worker = %worker_name, "started receiver thread");
        }

        let watchdog_name = format!("{}-watchdog", self.name);
        let handle = spawn_thread(&watchdog_name, {
            let name = self.name.clone();
            let rx = self.intake_rx.clone();
            let running = Arc::clone(&self.running);
            let in_flight = Arc::clone(&self.in_flight);
            let meter = self.meter.clone();
            let stats = Arc::clone(&self.stats);
            move || watchdog_loop(name, rx, running, in_flight, meter, stats, max_processing_time)
        })?;
        threads.push(handle);
        Ok(())
    }

    /// Stop the workers and the watchdog and wait for them to exit.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            let _ = handle.join();
        }
        debug!(pool = %self.name, "dispatch pool stopped");
    }

    /// Broker push-delivery callback.
    ///
    /// Records the message id in the diagnostic ring regardless of
    /// outcome, then enqueues with a bounded number of retries. On
    /// exhaustion the message is explicitly settled as failed rather than
    /// silently dropped.
    pub fn on_message(&self, message: InboundMessage) {
        self.recent_ids
            .lock()
            .push(message.message_id().to_string());
        trace!(message_id = %message.message_id(), "message id recorded in ring");

        let mut message = message;
        for _ in 0..ENQUEUE_RETRIES {
            match self.intake_tx.send(message) {
                Ok(()) => return,
                Err(returned) => {
                    message = returned.into_inner();
                    thread::sleep(ENQUEUE_RETRY_INTERVAL);
                }
            }
        }

        warn!(message_id = %message.message_id(), "unable to enqueue message, settling as failed");
        if let Err(e) = self.session.settle(&message, SettleOutcome::Failed) {
            error!(
                message_id = %message.message_id(),
                error = %e,
                "failure settlement rejected by broker"
            );
        }
    }

    // --- Observation ---

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Messages waiting in the intake queue.
    pub fn queue_depth(&self) -> usize {
        self.intake_rx.len()
    }

    /// Messages currently inside handler invocations.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Recent message ids, oldest first.
    pub fn recent_message_ids(&self) -> Vec<String> {
        self.recent_ids.lock().recent().into_iter().cloned().collect()
    }

    pub fn watchdog_stats(&self) -> &WatchdogStats {
        &self.stats
    }

    /// Tear down the intake so every enqueue attempt fails, to exercise
    /// the failure-settlement path.
    #[cfg(test)]
    pub(crate) fn sever_intake(&mut self) {
        let (tx, rx) = unbounded::<InboundMessage>();
        drop(rx);
        self.intake_tx = tx;
    }
}

impl Drop for DispatchPool {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn spawn_thread(
    name: &str,
    body: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|e| FlowError::Session(format!("failed to spawn {name}: {e}")))
}

fn worker_loop(
    worker_name: String,
    rx: Receiver<InboundMessage>,
    running: Arc<AtomicBool>,
    in_flight: Arc<Mutex<HashMap<u64, MessageInProgress>>>,
    next_entry: Arc<AtomicU64>,
    handler: MessageHandler,
) {
    while running.load(Ordering::SeqCst) {
        let message = match rx.recv_timeout(POLL_INTERVAL) {
            Ok(message) => message,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let token = next_entry.fetch_add(1, Ordering::SeqCst);
        let message_id = message.message_id().to_string();
        in_flight.lock().insert(
            token,
            MessageInProgress {
                started: Instant::now(),
                worker: worker_name.clone(),
                message_id: message_id.clone(),
                warned: false,
                errored: false,
            },
        );

        // A panicking handler must not take the worker down with it.
        let outcome = catch_unwind(AssertUnwindSafe(|| handler(message)));
        in_flight.lock().remove(&token);
        if outcome.is_err() {
            error!(worker = %worker_name, message_id = %message_id, "message handler panicked");
        }
    }
}

fn watchdog_loop(
    name: String,
    rx: Receiver<InboundMessage>,
    running: Arc<AtomicBool>,
    in_flight: Arc<Mutex<HashMap<u64, MessageInProgress>>>,
    meter: Option<Arc<dyn MeterSink>>,
    stats: Arc<WatchdogStats>,
    max_processing_time: Duration,
) {
    while running.load(Ordering::SeqCst) {
        if let Some(meter) = &meter {
            meter.record_queue_depth(&name, rx.len());
            meter.record_in_flight(&name, in_flight.lock().len());
        }

        let result = {
            let mut entries = in_flight.lock();
            sweep(&mut entries, Instant::now(), max_processing_time)
        };
        for escalation in &result.warnings {
            stats.warnings.fetch_add(1, Ordering::SeqCst);
            warn!(
                worker = %escalation.worker,
                message_id = %escalation.message_id,
                duration_ms = escalation.elapsed.as_millis() as u64,
                "message is in progress for too long"
            );
        }
        for escalation in &result.errors {
            stats.errors.fetch_add(1, Ordering::SeqCst);
            error!(
                worker = %escalation.worker,
                message_id = %escalation.message_id,
                duration_ms = escalation.elapsed.as_millis() as u64,
                "message is in progress for too long"
            );
        }

        thread::sleep(result.sleep);
    }
}
