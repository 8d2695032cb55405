//! Tracker: turns events into track requests and hands them to the queue
//!
//! The tracker owns a [`DispatchQueue`] of [`TrackRequest`]s. Each tracked
//! event becomes one request. The queue never retries on its own; the
//! tracker resubmits requests that failed transiently, up to
//! `tracker.max_retries` times, marking them as retries. Resubmissions back
//! off exponentially, starting at 500ms and capped at 30s.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::TrackerConfig;
use crate::dispatch::{DispatchQueue, StateObserver, Subscription};
use crate::error::{Result, TransportError};
use crate::reachability::PollingReachability;
use crate::request::Request;
use crate::track::{AppInfo, Event, TrackRequest, TrackResponse, TrackingCommand};
use crate::transport::HttpTransport;

type Reply = oneshot::Sender<std::result::Result<TrackResponse, TransportError>>;

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Delays before each resubmission: 500ms, doubling, capped at 30s
fn retry_delays() -> impl Iterator<Item = Duration> {
    std::iter::successors(Some(INITIAL_RETRY_DELAY), |delay| {
        Some((*delay * 2).min(MAX_RETRY_DELAY))
    })
}

/// Delivery statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TrackStats {
    /// Requests that received a response
    pub requests_sent: usize,
    /// Events carried by those requests
    pub events_sent: usize,
    /// Requests that failed for good
    pub request_failures: usize,
    /// Resubmissions after transient failures
    pub retries: usize,
    /// Events dropped before reaching the queue (opt-out)
    pub events_dropped: usize,
}

/// Entry point for tracking events
pub struct Tracker {
    config: TrackerConfig,
    queue: DispatchQueue<TrackRequest>,
    app_info: AppInfo,
    visitor_id: String,
    pv_id: String,
    original_pv_id: String,
    stats: Arc<Mutex<TrackStats>>,
}

impl Tracker {
    /// Create a tracker delivering over HTTP, with reachability polling.
    ///
    /// Returns None if the tracker is disabled or in dry-run mode. Must be
    /// called inside a tokio runtime.
    pub fn new(config: &TrackerConfig) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        if config.dry_run {
            tracing::info!("Dry run enabled; tracker not created");
            return Ok(None);
        }
        config.validate()?;

        let transport = HttpTransport::new(config)?;
        let monitor = PollingReachability::new(config)?;

        let queue = DispatchQueue::new();
        queue.configure(Arc::new(transport), monitor);

        Ok(Some(Self::with_queue(config.clone(), queue)))
    }

    /// Create a tracker on an already configured queue
    pub fn with_queue(config: TrackerConfig, queue: DispatchQueue<TrackRequest>) -> Self {
        let pv_id = Uuid::new_v4().to_string();
        Self {
            app_info: AppInfo::current(config.app_version.clone()),
            config,
            queue,
            visitor_id: Uuid::new_v4().to_string(),
            original_pv_id: pv_id.clone(),
            pv_id,
            stats: Arc::new(Mutex::new(TrackStats::default())),
        }
    }

    /// Use a known visitor id instead of a generated one
    pub fn with_visitor_id(mut self, visitor_id: impl Into<String>) -> Self {
        self.visitor_id = visitor_id.into();
        self
    }

    pub fn visitor_id(&self) -> &str {
        &self.visitor_id
    }

    pub fn pv_id(&self) -> &str {
        &self.pv_id
    }

    /// The underlying queue
    pub fn queue(&self) -> &DispatchQueue<TrackRequest> {
        &self.queue
    }

    /// Track an event without waiting for delivery
    pub fn track(&self, event: Event) {
        if let Some(request) = self.build_request(event) {
            send_with_retry(
                self.queue.clone(),
                request,
                self.config.max_retries,
                INITIAL_RETRY_DELAY,
                self.stats.clone(),
                None,
            );
        }
    }

    /// Track an event and wait for the final delivery result.
    ///
    /// Returns `Ok(None)` if the event was dropped (opt-out). Retries count
    /// toward the wait. A resubmission made while the endpoint is
    /// unreachable stays queued until it is reachable again, so this may
    /// wait indefinitely; bound it with [`delivery_deadline`](Self::delivery_deadline).
    pub async fn track_and_wait(
        &self,
        event: Event,
    ) -> std::result::Result<Option<TrackResponse>, TransportError> {
        let Some(request) = self.build_request(event) else {
            return Ok(None);
        };

        let (tx, rx) = oneshot::channel();
        send_with_retry(
            self.queue.clone(),
            request,
            self.config.max_retries,
            INITIAL_RETRY_DELAY,
            self.stats.clone(),
            Some(tx),
        );

        match rx.await {
            Ok(result) => result.map(Some),
            Err(_) => Err(TransportError::Cancelled),
        }
    }

    /// Longest a delivery takes while the endpoint keeps answering: every
    /// attempt running into the request timeout, plus the backoff between
    /// attempts.
    pub fn delivery_deadline(&self) -> Duration {
        let attempts = u32::try_from(self.config.max_retries + 1).unwrap_or(u32::MAX);
        let backoff: Duration = retry_delays().take(self.config.max_retries).sum();
        self.config.timeout().saturating_mul(attempts) + backoff
    }

    /// Current delivery statistics
    pub fn stats(&self) -> TrackStats {
        lock(&self.stats).clone()
    }

    /// Observe the queue's busy/idle state
    pub fn add_observer(&self, observer: Arc<dyn StateObserver>) -> Subscription {
        self.queue.add_observer(observer)
    }

    /// Tear down the underlying queue
    pub fn teardown(&self) {
        self.queue.teardown();
    }

    fn build_request(&self, event: Event) -> Option<TrackRequest> {
        if self.config.opt_out {
            tracing::debug!(event_name = %event.event_name, "Opted out; event dropped");
            lock(&self.stats).events_dropped += 1;
            return None;
        }

        let command = TrackingCommand::new(self.visitor_id.clone(), event);
        let request = TrackRequest::new(
            &self.config,
            self.app_info.clone(),
            &self.pv_id,
            &self.original_pv_id,
            vec![command],
        );
        if request.is_none() {
            tracing::warn!("Tracker is missing base_url or app_key; event dropped");
            lock(&self.stats).events_dropped += 1;
        }
        request
    }
}

fn lock(stats: &Mutex<TrackStats>) -> MutexGuard<'_, TrackStats> {
    stats.lock().unwrap_or_else(|e| e.into_inner())
}

fn send_with_retry(
    queue: DispatchQueue<TrackRequest>,
    request: TrackRequest,
    retries_left: usize,
    delay: Duration,
    stats: Arc<Mutex<TrackStats>>,
    reply: Option<Reply>,
) {
    request.log_events();

    let events = request.commands().len();
    let next = request.clone();
    let retry_queue = queue.clone();

    queue.enqueue(request, move |result| {
        match &result {
            Ok(_) => {
                let mut stats = lock(&stats);
                stats.requests_sent += 1;
                stats.events_sent += events;
            }
            Err(e) if e.is_retryable() && retries_left > 0 => {
                tracing::warn!(
                    request_id = %next.request_id(),
                    error = %e,
                    retries_left,
                    ?delay,
                    "Transient error sending events; resubmitting"
                );
                lock(&stats).retries += 1;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    send_with_retry(
                        retry_queue,
                        next.retry(),
                        retries_left - 1,
                        (delay * 2).min(MAX_RETRY_DELAY),
                        stats,
                        reply,
                    );
                });
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to send events");
                lock(&stats).request_failures += 1;
            }
        }

        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    });
}
