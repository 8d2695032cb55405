//! Reachability monitors
//!
//! A monitor reports connectivity edges to the dispatch queue through a
//! [`ReachabilityNotifier`]. How connectivity is detected is up to the
//! monitor:
//!
//! - [`PollingReachability`] probes the collection endpoint periodically
//! - [`ManualReachability`] forwards whatever the host application reports
//!   (OS callbacks, tests)

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::TrackerConfig;
use crate::error::{Error, Result};

/// Last known connectivity to the collection endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Reachable,
    Unreachable,
}

impl Reachability {
    pub fn is_reachable(self) -> bool {
        matches!(self, Reachability::Reachable)
    }
}

impl fmt::Display for Reachability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reachability::Reachable => f.write_str("reachable"),
            Reachability::Unreachable => f.write_str("unreachable"),
        }
    }
}

/// Sink for connectivity edges, handed to a monitor on start.
///
/// Cheap to clone and safe to call from any thread. Repeating the same
/// status is harmless.
#[derive(Clone)]
pub struct ReachabilityNotifier {
    sink: Arc<dyn Fn(Reachability) + Send + Sync>,
}

impl ReachabilityNotifier {
    pub fn new(sink: impl Fn(Reachability) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    pub fn notify(&self, status: Reachability) {
        (self.sink)(status);
    }

    pub fn reachable(&self) {
        self.notify(Reachability::Reachable);
    }

    pub fn unreachable(&self) {
        self.notify(Reachability::Unreachable);
    }
}

impl fmt::Debug for ReachabilityNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReachabilityNotifier").finish_non_exhaustive()
    }
}

/// Reports connectivity edges until stopped.
pub trait ReachabilityMonitor: Send + 'static {
    /// Begin reporting edges to `notifier`
    fn start(&mut self, notifier: ReachabilityNotifier);

    /// Stop reporting; no edges are delivered afterwards
    fn stop(&mut self);
}

/// Polls the collection endpoint with `HEAD` requests.
///
/// Any HTTP response counts as reachable. Connection failures and timeouts
/// count as unreachable. Only transitions are reported; the first probe
/// always is.
pub struct PollingReachability {
    http_client: reqwest::Client,
    url: String,
    interval: Duration,
    task: Option<JoinHandle<()>>,
}

impl PollingReachability {
    /// Create a monitor probing the tracker's base URL
    pub fn new(config: &TrackerConfig) -> Result<Self> {
        let url = config
            .base_url
            .clone()
            .ok_or_else(|| Error::Config("tracker.base_url is required".to_string()))?;

        let http_client = reqwest::Client::builder()
            .timeout(config.timeout().min(config.reachability_interval()))
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self::with_client(
            http_client,
            url,
            config.reachability_interval(),
        ))
    }

    pub fn with_client(http_client: reqwest::Client, url: String, interval: Duration) -> Self {
        Self {
            http_client,
            url,
            interval,
            task: None,
        }
    }

    /// Probe the endpoint once
    pub async fn probe(&self) -> Reachability {
        probe(&self.http_client, &self.url).await
    }
}

async fn probe(http_client: &reqwest::Client, url: &str) -> Reachability {
    match http_client.head(url).send().await {
        Ok(_) => Reachability::Reachable,
        Err(e) => {
            tracing::trace!(url = %url, error = %e, "Reachability probe failed");
            Reachability::Unreachable
        }
    }
}

impl ReachabilityMonitor for PollingReachability {
    fn start(&mut self, notifier: ReachabilityNotifier) {
        self.stop();

        let http_client = self.http_client.clone();
        let url = self.url.clone();
        let interval = self.interval;

        self.task = Some(tokio::spawn(async move {
            let mut last = None;
            loop {
                let status = probe(&http_client, &url).await;
                if last != Some(status) {
                    tracing::debug!(url = %url, status = %status, "Reachability changed");
                    notifier.notify(status);
                    last = Some(status);
                }
                tokio::time::sleep(interval).await;
            }
        }));
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for PollingReachability {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Monitor driven by the host application.
///
/// Clones share state, so the host keeps one clone and hands another to the
/// dispatch queue. The last status set before `start` is replayed on start.
#[derive(Clone, Default)]
pub struct ManualReachability {
    inner: Arc<Mutex<ManualState>>,
}

#[derive(Default)]
struct ManualState {
    status: Option<Reachability>,
    notifier: Option<ReachabilityNotifier>,
}

impl ManualReachability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a connectivity status
    pub fn set(&self, status: Reachability) {
        let notifier = {
            let mut state = self.lock();
            state.status = Some(status);
            state.notifier.clone()
        };
        if let Some(notifier) = notifier {
            notifier.notify(status);
        }
    }

    pub fn set_reachable(&self) {
        self.set(Reachability::Reachable);
    }

    pub fn set_unreachable(&self) {
        self.set(Reachability::Unreachable);
    }

    /// Whether a queue is currently listening
    pub fn is_started(&self) -> bool {
        self.lock().notifier.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ReachabilityMonitor for ManualReachability {
    fn start(&mut self, notifier: ReachabilityNotifier) {
        let status = {
            let mut state = self.lock();
            state.notifier = Some(notifier.clone());
            state.status
        };
        if let Some(status) = status {
            notifier.notify(status);
        }
    }

    fn stop(&mut self) {
        self.lock().notifier = None;
    }
}
