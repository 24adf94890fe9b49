//! Flow lifecycle tests: bind/unbind idempotency under concurrency,
//! staleness, receive cancellation paths, and pause/resume races.

use crossbeam_channel::bounded;
use flowline::{
    EndpointDescriptor, FlowContainer, FlowContainerConfig, FlowError, FlowSettings,
    InMemorySession, MeterSink, DEFAULT_WINDOW_SIZE,
};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

fn test_container(session: &Arc<InMemorySession>, queue: &str) -> Arc<FlowContainer> {
    Arc::new(FlowContainer::new(
        FlowContainerConfig {
            name: format!("{queue}-binding"),
            endpoint: EndpointDescriptor::durable(queue),
            settings: FlowSettings::default(),
        },
        Arc::clone(session) as Arc<dyn flowline::SessionProvider>,
    ))
}

fn publish_json(session: &InMemorySession, queue: &str, body: serde_json::Value) -> String {
    session.publish(queue, body.to_string().into_bytes())
}

// --- Bind / unbind ---

#[test]
fn test_concurrent_bind_single_physical_open() {
    let session = Arc::new(InMemorySession::new());
    let flow = test_container(&session, "q");

    let parties = 16;
    let barrier = Arc::new(Barrier::new(parties));
    let handles: Vec<_> = (0..parties)
        .map(|_| {
            let flow = Arc::clone(&flow);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                flow.bind()
            })
        })
        .collect();

    let tokens: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();

    assert!(tokens.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(session.open_count(), 1);
}

#[test]
fn test_bind_bound_flow_is_noop() {
    let session = Arc::new(InMemorySession::new());
    let flow = test_container(&session, "q");

    let token_a = flow.bind().unwrap();
    let token_b = flow.bind().unwrap();
    assert_eq!(token_a, token_b);
    assert_eq!(session.open_count(), 1);
}

#[test]
fn test_rebind_after_unbind_changes_generation() {
    let session = Arc::new(InMemorySession::new());
    let flow = test_container(&session, "q");

    let first = flow.bind().unwrap();
    flow.unbind();
    let second = flow.bind().unwrap();
    assert_ne!(first, second);
}

#[test]
fn test_concurrent_unbind_single_physical_close() {
    let session = Arc::new(InMemorySession::new());
    let flow = test_container(&session, "q");
    flow.bind().unwrap();

    let parties = 16;
    let barrier = Arc::new(Barrier::new(parties));
    let handles: Vec<_> = (0..parties)
        .map(|_| {
            let flow = Arc::clone(&flow);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                flow.unbind();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(session.close_count(), 1);
    assert!(!flow.is_bound());
}

#[test]
fn test_bind_failure_leaves_unbound_and_waiters_retry() {
    let session = Arc::new(InMemorySession::new());
    let flow = test_container(&session, "q");
    session.fail_next_bind("queue unavailable");

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let flow = Arc::clone(&flow);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                flow.bind()
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let failures = results.iter().filter(|r| r.is_err()).count();

    // The loser of the race observed UNBOUND after the winner's failure
    // and performed a fresh, successful attempt.
    assert_eq!(failures, 1);
    assert!(results.iter().any(|r| r.is_ok()));
    assert!(flow.is_bound());
}

// --- Staleness ---

#[test]
fn test_unbind_marks_outstanding_messages_stale() {
    let session = Arc::new(InMemorySession::new());
    let flow = test_container(&session, "q");
    flow.bind().unwrap();

    publish_json(&session, "q", serde_json::json!({"seq": 1}));
    publish_json(&session, "q", serde_json::json!({"seq": 2}));

    let first = flow
        .receive_timeout(Duration::from_secs(1))
        .unwrap()
        .unwrap();
    let second = flow
        .receive_timeout(Duration::from_secs(1))
        .unwrap()
        .unwrap();
    assert!(!first.is_stale() && !second.is_stale());

    flow.unbind();

    assert!(first.is_stale());
    assert!(second.is_stale());
    assert!(matches!(
        flow.acknowledge(&first),
        Err(FlowError::StaleMessage(_))
    ));
    assert!(matches!(
        flow.acknowledge(&second),
        Err(FlowError::StaleMessage(_))
    ));
    // Stale acknowledgments never reach the broker.
    assert_eq!(session.settle_count(), 0);
}

#[test]
fn test_message_from_previous_generation_is_stale_after_rebind() {
    let session = Arc::new(InMemorySession::new());
    let flow = test_container(&session, "q");
    flow.bind().unwrap();

    publish_json(&session, "q", serde_json::json!({"seq": 1}));
    let old = flow
        .receive_timeout(Duration::from_secs(1))
        .unwrap()
        .unwrap();

    flow.unbind();
    flow.bind().unwrap();

    assert!(matches!(
        flow.acknowledge(&old),
        Err(FlowError::StaleMessage(_))
    ));
}

// --- Receive ---

#[test]
fn test_receive_while_unbound_fails() {
    let session = Arc::new(InMemorySession::new());
    let flow = test_container(&session, "q");
    assert!(matches!(flow.receive(), Err(FlowError::Unbound)));
}

#[test]
fn test_receive_zero_timeout_returns_immediately() {
    let session = Arc::new(InMemorySession::new());
    let flow = test_container(&session, "q");
    flow.bind().unwrap();

    let start = Instant::now();
    let result = flow.receive_timeout(Duration::ZERO).unwrap();
    assert!(result.is_none());
    assert!(start.elapsed() < Duration::from_millis(100));
}

#[test]
fn test_receive_elapsed_timeout_returns_none() {
    let session = Arc::new(InMemorySession::new());
    let flow = test_container(&session, "q");
    flow.bind().unwrap();

    assert!(flow.receive_timeout(Duration::from_millis(50)).unwrap().is_none());
}

#[test]
fn test_receive_stamps_generation_and_payload() {
    let session = Arc::new(InMemorySession::new());
    let flow = test_container(&session, "q");
    let generation = flow.bind().unwrap();

    let id = publish_json(&session, "q", serde_json::json!({"text": "hello"}));
    let message = flow
        .receive_timeout(Duration::from_secs(1))
        .unwrap()
        .unwrap();

    assert_eq!(message.generation(), generation);
    assert_eq!(message.message().message_id(), id);
    let body: serde_json::Value = serde_json::from_slice(message.payload()).unwrap();
    assert_eq!(body["text"], "hello");
}

#[test]
fn test_blocked_receive_resolved_by_unbind() {
    let session = Arc::new(InMemorySession::new());
    let flow = test_container(&session, "q");
    flow.bind().unwrap();

    let receiver = {
        let flow = Arc::clone(&flow);
        thread::spawn(move || flow.receive())
    };
    // Give the receive time to actually park.
    thread::sleep(Duration::from_millis(200));
    assert!(!receiver.is_finished());

    flow.unbind();
    let result = receiver.join().unwrap();
    assert!(matches!(result, Err(FlowError::ClosedWhileReceiving)));
}

#[test]
fn test_blocked_receive_interrupt_returns_none_and_stays_bound() {
    let session = Arc::new(InMemorySession::new());
    let flow = test_container(&session, "q");
    flow.bind().unwrap();

    let receiver = {
        let flow = Arc::clone(&flow);
        thread::spawn(move || flow.receive())
    };
    thread::sleep(Duration::from_millis(200));

    session.interrupt("q");
    let result = receiver.join().unwrap();
    assert!(result.unwrap().is_none());
    assert!(flow.is_bound());
}

#[test]
fn test_blocked_receive_survives_broker_reconnect() {
    let session = Arc::new(InMemorySession::new());
    let flow = test_container(&session, "q");
    let generation = flow.bind().unwrap();

    let receiver = {
        let flow = Arc::clone(&flow);
        thread::spawn(move || flow.receive())
    };
    thread::sleep(Duration::from_millis(200));

    // The broker rebuilds the flow; the parked receive is woken but
    // retries internally instead of surfacing anything.
    session.begin_reconnect();
    thread::sleep(Duration::from_millis(200));
    assert!(!receiver.is_finished());
    session.end_reconnect();

    publish_json(&session, "q", serde_json::json!({"seq": 1}));
    let message = receiver.join().unwrap().unwrap().unwrap();
    // Same logical flow: the generation did not change.
    assert_eq!(message.generation(), generation);
}

// --- Acknowledgment across reconnects ---

#[test]
fn test_ack_in_reconnect_window_dropped_then_redelivered() {
    let session = Arc::new(InMemorySession::new());
    let flow = test_container(&session, "q");
    let generation = flow.bind().unwrap();

    publish_json(&session, "q", serde_json::json!({"seq": 1}));
    let message = flow
        .receive_timeout(Duration::from_secs(1))
        .unwrap()
        .unwrap();

    session.begin_reconnect();
    // Fire-and-forget: the broker silently discards this acknowledgment.
    flow.acknowledge(&message).unwrap();
    session.end_reconnect();

    // The broker never recorded the settlement and redelivers.
    assert!(session.settled().is_empty());
    let redelivered = flow
        .receive_timeout(Duration::from_secs(1))
        .unwrap()
        .unwrap();
    assert!(redelivered.message().is_redelivered());
    assert_eq!(
        redelivered.message().message_id(),
        message.message().message_id()
    );
    assert_eq!(redelivered.generation(), generation);

    flow.acknowledge(&redelivered).unwrap();
    assert_eq!(session.settled().len(), 1);
}

// --- Pause / resume ---

#[test]
fn test_pause_and_resume_toggle_window() {
    let session = Arc::new(InMemorySession::new());
    let flow = test_container(&session, "q");
    flow.bind().unwrap();
    assert!(!flow.is_paused());

    flow.pause().unwrap();
    assert!(flow.is_paused());
    assert_eq!(session.window_changes(), vec![0]);

    flow.resume().unwrap();
    assert!(!flow.is_paused());
    assert_eq!(session.window_changes(), vec![0, DEFAULT_WINDOW_SIZE]);
}

#[test]
fn test_pause_while_unbound_persists_to_next_bind() {
    let session = Arc::new(InMemorySession::new());
    let flow = test_container(&session, "q");

    flow.pause().unwrap();
    assert!(flow.is_paused());
    assert!(!flow.is_bound());

    flow.bind().unwrap();
    assert!(flow.is_paused());
    // Opened with window 0 directly; no post-bind resize happened.
    assert!(session.window_changes().is_empty());

    flow.resume().unwrap();
    assert!(!flow.is_paused());
    assert_eq!(session.window_changes(), vec![DEFAULT_WINDOW_SIZE]);
}

#[test]
fn test_unbind_resets_pause_persistence() {
    let session = Arc::new(InMemorySession::new());
    let flow = test_container(&session, "q");
    flow.bind().unwrap();
    flow.pause().unwrap();

    flow.unbind();
    assert!(!flow.is_paused());
    flow.bind().unwrap();
    assert!(!flow.is_paused());
}

#[test]
fn test_pause_while_resuming_last_committer_wins() {
    let session = Arc::new(InMemorySession::new());
    let flow = test_container(&session, "q");
    flow.bind().unwrap();
    flow.pause().unwrap();
    assert!(flow.is_paused());

    // Hold the resume open mid-critical-section, after its window change
    // committed at the broker.
    let (mid_tx, mid_rx) = bounded::<()>(1);
    let (finish_tx, finish_rx) = bounded::<()>(0);
    session.set_window_gate(move |size| {
        if size == DEFAULT_WINDOW_SIZE {
            let _ = mid_tx.send(());
            let _ = finish_rx.recv();
        }
    });

    let resume_handle = {
        let flow = Arc::clone(&flow);
        thread::spawn(move || flow.resume())
    };
    mid_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("resume never reached its critical section");

    let pause_handle = {
        let flow = Arc::clone(&flow);
        thread::spawn(move || flow.pause())
    };

    thread::sleep(Duration::from_millis(300));
    assert!(!resume_handle.is_finished());
    assert!(!pause_handle.is_finished());
    // Resume has not committed yet, so the observable state is unchanged.
    assert!(flow.is_paused());

    finish_tx.send(()).unwrap();
    resume_handle.join().unwrap().unwrap();
    pause_handle.join().unwrap().unwrap();

    // Pause's critical section committed last.
    assert!(flow.is_paused());
    assert_eq!(session.window_changes().last(), Some(&0));
}

#[test]
fn test_resume_while_pausing_last_committer_wins() {
    let session = Arc::new(InMemorySession::new());
    let flow = test_container(&session, "q");
    flow.bind().unwrap();
    assert!(!flow.is_paused());

    let (mid_tx, mid_rx) = bounded::<()>(1);
    let (finish_tx, finish_rx) = bounded::<()>(0);
    session.set_window_gate(move |size| {
        if size == 0 {
            let _ = mid_tx.send(());
            let _ = finish_rx.recv();
        }
    });

    let pause_handle = {
        let flow = Arc::clone(&flow);
        thread::spawn(move || flow.pause())
    };
    mid_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("pause never reached its critical section");

    let resume_handle = {
        let flow = Arc::clone(&flow);
        thread::spawn(move || flow.resume())
    };

    thread::sleep(Duration::from_millis(300));
    assert!(!pause_handle.is_finished());
    assert!(!resume_handle.is_finished());
    assert!(!flow.is_paused());

    finish_tx.send(()).unwrap();
    pause_handle.join().unwrap().unwrap();
    resume_handle.join().unwrap().unwrap();

    assert!(!flow.is_paused());
    assert_eq!(
        session.window_changes().last(),
        Some(&DEFAULT_WINDOW_SIZE)
    );
}

// --- Gauges ---

struct TestMeter {
    in_flight_reports: AtomicU64,
    last_in_flight: AtomicUsize,
}

impl MeterSink for TestMeter {
    fn record_queue_depth(&self, _name: &str, _depth: usize) {}

    fn record_in_flight(&self, _name: &str, count: usize) {
        self.in_flight_reports.fetch_add(1, Ordering::SeqCst);
        self.last_in_flight.store(count, Ordering::SeqCst);
    }
}

#[test]
fn test_in_flight_gauge_follows_receive_and_acknowledge() {
    let session = Arc::new(InMemorySession::new());
    let meter = Arc::new(TestMeter {
        in_flight_reports: AtomicU64::new(0),
        last_in_flight: AtomicUsize::new(0),
    });
    let flow = Arc::new(
        FlowContainer::new(
            FlowContainerConfig {
                name: "metered".to_string(),
                endpoint: EndpointDescriptor::durable("q"),
                settings: FlowSettings::default(),
            },
            Arc::clone(&session) as Arc<dyn flowline::SessionProvider>,
        )
        .with_meter(Arc::clone(&meter) as Arc<dyn MeterSink>),
    );
    flow.bind().unwrap();

    publish_json(&session, "q", serde_json::json!({"seq": 1}));
    let message = flow
        .receive_timeout(Duration::from_secs(1))
        .unwrap()
        .unwrap();
    assert_eq!(meter.last_in_flight.load(Ordering::SeqCst), 1);

    flow.acknowledge(&message).unwrap();
    assert_eq!(meter.last_in_flight.load(Ordering::SeqCst), 0);
    assert!(meter.in_flight_reports.load(Ordering::SeqCst) >= 2);
}
