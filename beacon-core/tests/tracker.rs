//! Integration tests for the tracker facade
//!
//! A scripted transport answers each track request with the next canned
//! result and records what it was sent.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use beacon_core::{
    ClientState, DispatchQueue, Event, ManualReachability, Reachability, Request, TrackRequest,
    TrackResponse, TrackStats, Tracker, TrackerConfig, Transport, TransportError,
};
use tokio::time::{timeout, Instant};

#[derive(Debug, Clone)]
struct SentRequest {
    visitor_id: String,
    is_retry: bool,
    retry_flags: Vec<bool>,
    events: Vec<String>,
    body: serde_json::Value,
    at: Instant,
}

struct ScriptedTransport {
    script: Mutex<VecDeque<Result<TrackResponse, TransportError>>>,
    sent: Mutex<Vec<SentRequest>>,
    /// Reports the endpoint unreachable whenever a call fails
    connectivity: Option<ManualReachability>,
}

impl ScriptedTransport {
    fn with_script(results: Vec<Result<TrackResponse, TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(results.into()),
            sent: Mutex::default(),
            connectivity: None,
        })
    }

    fn losing_connectivity(
        results: Vec<Result<TrackResponse, TransportError>>,
        reachability: ManualReachability,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(results.into()),
            sent: Mutex::default(),
            connectivity: Some(reachability),
        })
    }

    fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Transport<TrackRequest> for ScriptedTransport {
    async fn send(&self, request: &TrackRequest) -> Result<TrackResponse, TransportError> {
        let body = request.build_body()?.unwrap_or_default();
        self.sent.lock().unwrap().push(SentRequest {
            visitor_id: request.keys().visitor_id.clone(),
            is_retry: request.is_retry(),
            retry_flags: request.commands().iter().map(|c| c.is_retry).collect(),
            events: request
                .commands()
                .iter()
                .map(|c| c.event.event_name.as_str().to_string())
                .collect(),
            body: serde_json::from_slice(&body).unwrap(),
            at: Instant::now(),
        });

        let result = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(TrackResponse::default()));
        if let (Err(_), Some(reachability)) = (&result, &self.connectivity) {
            reachability.set_unreachable();
        }
        result
    }
}

fn tracker_config() -> TrackerConfig {
    TrackerConfig {
        enabled: true,
        base_url: Some("http://collect.test".to_string()),
        app_key: Some("app_key_1234".to_string()),
        max_retries: 2,
        ..Default::default()
    }
}

fn tracker_with(config: TrackerConfig, transport: Arc<ScriptedTransport>) -> Tracker {
    tracker_on(config, transport, ManualReachability::new())
}

fn tracker_on(
    config: TrackerConfig,
    transport: Arc<ScriptedTransport>,
    reachability: ManualReachability,
) -> Tracker {
    beacon_core::logging::init_test();
    let queue = DispatchQueue::new();
    queue.configure(transport, reachability);
    Tracker::with_queue(config, queue).with_visitor_id("visitor-1")
}

fn network_error() -> TransportError {
    TransportError::Network("connection refused".to_string())
}

#[tokio::test]
async fn test_track_and_wait_delivers_event() {
    let response = TrackResponse {
        success: Some(1),
        ..Default::default()
    };
    let transport = ScriptedTransport::with_script(vec![Ok(response.clone())]);
    let tracker = tracker_with(tracker_config(), transport.clone());

    let event = Event::view("home", "Home").value("referrer", "push");
    let result = tracker.track_and_wait(event).await.unwrap();
    assert_eq!(result, Some(response));

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].visitor_id, "visitor-1");
    assert_eq!(sent[0].events, vec!["view"]);
    assert!(!sent[0].is_retry);

    assert_eq!(
        tracker.stats(),
        TrackStats {
            requests_sent: 1,
            events_sent: 1,
            ..Default::default()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_is_resubmitted_as_retry() {
    let transport = ScriptedTransport::with_script(vec![
        Err(network_error()),
        Err(TransportError::Timeout),
        Ok(TrackResponse::default()),
    ]);
    let tracker = tracker_with(tracker_config(), transport.clone());

    let result = tracker.track_and_wait(Event::new("purchase")).await;
    assert!(result.unwrap().is_some());

    let sent = transport.sent();
    assert_eq!(sent.len(), 3);
    assert_eq!(
        sent.iter().map(|r| r.is_retry).collect::<Vec<_>>(),
        vec![false, true, true]
    );
    assert_eq!(sent[2].retry_flags, vec![true]);

    // Backoff: 500ms before the first resubmission, then 1s.
    assert!(sent[1].at - sent[0].at >= Duration::from_millis(500));
    assert!(sent[1].at - sent[0].at < Duration::from_millis(1000));
    assert!(sent[2].at - sent[1].at >= Duration::from_millis(1000));
    assert!(sent[2].at - sent[1].at < Duration::from_millis(2000));

    let stats = tracker.stats();
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.requests_sent, 1);
    assert_eq!(stats.request_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_retries_are_bounded() {
    let transport = ScriptedTransport::with_script(vec![
        Err(network_error()),
        Err(network_error()),
        Err(network_error()),
        Err(network_error()),
    ]);
    let tracker = tracker_with(tracker_config(), transport.clone());

    let result = tracker.track_and_wait(Event::new("purchase")).await;
    assert_eq!(result, Err(network_error()));

    // One attempt plus max_retries resubmissions.
    assert_eq!(transport.sent().len(), 3);
    let stats = tracker.stats();
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.request_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_waits_for_reachability() {
    let reachability = ManualReachability::new();
    let transport =
        ScriptedTransport::losing_connectivity(vec![Err(network_error())], reachability.clone());
    let tracker = tracker_on(tracker_config(), transport.clone(), reachability.clone());

    // The resubmission is parked while unreachable; a bounded wait gives up.
    let deadline = tracker.delivery_deadline();
    let waited = timeout(deadline, tracker.track_and_wait(Event::new("purchase"))).await;
    assert!(waited.is_err());

    assert_eq!(transport.sent().len(), 1);
    let snapshot = tracker.queue().snapshot().await.unwrap();
    assert_eq!(snapshot.reachability, Reachability::Unreachable);
    assert_eq!(snapshot.queued, 1);
    assert_eq!(snapshot.in_flight, None);
    assert_eq!(snapshot.state, ClientState::Running);

    // Back online: the parked retry goes out ahead of the next event.
    reachability.set_reachable();
    let result = timeout(deadline, tracker.track_and_wait(Event::new("after")))
        .await
        .expect("delivery after reconnect");
    assert!(result.unwrap().is_some());

    let sent = transport.sent();
    assert_eq!(sent.len(), 3);
    assert_eq!(
        sent.iter().map(|r| r.events[0].as_str()).collect::<Vec<_>>(),
        vec!["purchase", "purchase", "after"]
    );
    assert!(sent[1].is_retry);
    assert_eq!(tracker.stats().retries, 1);
    assert_eq!(tracker.stats().requests_sent, 2);
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let transport =
        ScriptedTransport::with_script(vec![Err(TransportError::Decode("bad json".to_string()))]);
    let tracker = tracker_with(tracker_config(), transport.clone());

    let result = tracker.track_and_wait(Event::new("purchase")).await;
    assert!(matches!(result, Err(TransportError::Decode(_))));
    assert_eq!(transport.sent().len(), 1);
    assert_eq!(tracker.stats().retries, 0);
    assert_eq!(tracker.stats().request_failures, 1);
}

#[tokio::test]
async fn test_opt_out_drops_events() {
    let transport = ScriptedTransport::with_script(vec![]);
    let config = TrackerConfig {
        opt_out: true,
        ..tracker_config()
    };
    let tracker = tracker_with(config, transport.clone());

    tracker.track(Event::new("ignored"));
    let result = tracker.track_and_wait(Event::new("also_ignored")).await;
    assert_eq!(result, Ok(None));

    let snapshot = tracker.queue().snapshot().await.unwrap();
    assert_eq!(snapshot.queued, 0);
    assert_eq!(snapshot.in_flight, None);
    assert!(transport.sent().is_empty());
    assert_eq!(tracker.stats().events_dropped, 2);
}

#[tokio::test]
async fn test_fire_and_forget_events_keep_order() {
    let transport = ScriptedTransport::with_script(vec![]);
    let tracker = tracker_with(tracker_config(), transport.clone());

    tracker.track(Event::new("first"));
    tracker.track(Event::new("second"));
    tracker.track_and_wait(Event::new("third")).await.unwrap();

    let events: Vec<String> = transport
        .sent()
        .into_iter()
        .flat_map(|request| request.events)
        .collect();
    assert_eq!(events, vec!["first", "second", "third"]);
    assert_eq!(tracker.stats().events_sent, 3);
}

#[tokio::test]
async fn test_request_body_carries_keys_and_events() {
    let transport = ScriptedTransport::with_script(vec![]);
    let tracker = tracker_with(tracker_config(), transport.clone());

    tracker
        .track_and_wait(Event::new("purchase").value("amount", 1200))
        .await
        .unwrap();

    let body = &transport.sent()[0].body;
    assert_eq!(body["keys"]["visitor_id"], "visitor-1");
    assert_eq!(body["keys"]["pv_id"], tracker.pv_id());
    assert_eq!(body["events"][0]["event_name"], "purchase");
    assert_eq!(body["events"][0]["values"]["amount"], 1200);
}

#[tokio::test]
async fn test_observer_sees_busy_then_idle() {
    let transport = ScriptedTransport::with_script(vec![]);
    let tracker = tracker_with(tracker_config(), transport);

    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = states.clone();
    let _subscription = tracker.add_observer(Arc::new(move |state: ClientState| {
        sink.lock().unwrap().push(state)
    }));

    tracker.track_and_wait(Event::new("purchase")).await.unwrap();
    assert_eq!(
        *states.lock().unwrap(),
        vec![ClientState::Running, ClientState::Waiting]
    );
}
