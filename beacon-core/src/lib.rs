//! # beacon-core
//!
//! Core library for beacon - a client-side event-tracking SDK.
//!
//! This library provides:
//! - A dispatch queue that sends one request at a time, in order, and
//!   resumes when connectivity returns
//! - Request, transport and reachability capabilities with HTTP
//!   implementations
//! - Tracking events, the track request and a `Tracker` facade
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! ```text
//! Tracker::track(event)
//!     └─► TrackRequest ─► DispatchQueue ─► Transport (HTTP)
//!                              ▲
//!                 ReachabilityMonitor edges
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use beacon_core::{Config, Event, Tracker};
//!
//! # async fn run() -> beacon_core::Result<()> {
//! let config = Config::load()?;
//!
//! if let Some(tracker) = Tracker::new(&config.tracker)? {
//!     tracker.track(Event::view("home", "Home"));
//! }
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::{Config, OperationMode, TrackerConfig};
pub use dispatch::{ClientState, DispatchQueue, QueueSnapshot, StateObserver, Subscription, TaskId};
pub use error::{Error, Result, TransportError};
pub use reachability::{
    ManualReachability, PollingReachability, Reachability, ReachabilityMonitor,
    ReachabilityNotifier,
};
pub use request::Request;
pub use track::{Event, EventName, TrackRequest, TrackResponse, TrackingCommand};
pub use tracker::{TrackStats, Tracker};
pub use transport::{HttpTransport, Transport};

// Public modules
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod reachability;
pub mod request;
pub mod track;
pub mod tracker;
pub mod transport;
