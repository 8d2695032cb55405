//! Tracking events and the track request
//!
//! Events produced by the host app are wrapped in [`TrackingCommand`]s and
//! sent in a [`TrackRequest`] to the collection endpoint.
//!
//! ## Wire format
//!
//! ```json
//! {
//!   "app_info": { "version_name": "1.2.0", "sdk_version": "0.1.0", "system_info": { "os": "linux", "arch": "x86_64" } },
//!   "events": [ { "event_name": "view", "values": { "view_name": "home", "_local_event_date": 1700000000, "_retry": false } } ],
//!   "keys": { "visitor_id": "...", "pv_id": "...", "original_pv_id": "..." }
//! }
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{OperationMode, TrackerConfig};
use crate::error::TransportError;
use crate::request::Request;

/// Header carrying the application key
pub const APP_KEY_HEADER: &str = "X-Beacon-App-Key";

/// Name of a tracking event
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventName(String);

impl EventName {
    pub const VIEW: &'static str = "view";
    pub const IDENTIFY: &'static str = "identify";
    pub const ATTRIBUTE: &'static str = "attribute";
    pub const NATIVE_APP_OPEN: &'static str = "native_app_open";
    pub const NATIVE_APP_INSTALL: &'static str = "native_app_install";
    pub const NATIVE_APP_UPDATE: &'static str = "native_app_update";
    pub const MESSAGE_READY: &'static str = "message_ready";
    pub const MESSAGE_OPEN: &'static str = "message_open";
    pub const MESSAGE_CLICK: &'static str = "message_click";
    pub const MESSAGE_CLOSE: &'static str = "message_close";
    pub const MESSAGE_SUPPRESSED: &'static str = "message_suppressed";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is one of the in-app message lifecycle events
    pub fn is_message_event(&self) -> bool {
        matches!(
            self.as_str(),
            Self::MESSAGE_READY
                | Self::MESSAGE_OPEN
                | Self::MESSAGE_CLICK
                | Self::MESSAGE_CLOSE
                | Self::MESSAGE_SUPPRESSED
        )
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for EventName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// A tracking event: a name plus free-form values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_name: EventName,
    #[serde(default)]
    pub values: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    pub fn new(event_name: impl Into<EventName>) -> Self {
        Self {
            event_name: event_name.into(),
            values: serde_json::Map::new(),
        }
    }

    /// Add a value to the event
    pub fn value(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// `view` event for a screen
    pub fn view(view_name: &str, title: &str) -> Self {
        Self::new(EventName::VIEW)
            .value("view_name", view_name)
            .value("title", title)
    }

    /// String value at a dotted path (e.g., `message.campaign_id`)
    pub fn string_at(&self, path: &str) -> Option<&str> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.values.get(first)?;
        for part in parts {
            current = current.get(part)?;
        }
        current.as_str()
    }

    fn with_delivery_fields(&self, date: DateTime<Utc>, is_retry: bool) -> Self {
        let mut event = self.clone();
        event
            .values
            .insert("_local_event_date".to_string(), date.timestamp().into());
        event.values.insert("_retry".to_string(), is_retry.into());
        event
    }
}

/// One event as produced by a visitor, stamped when it was tracked
#[derive(Debug, Clone)]
pub struct TrackingCommand {
    pub identifier: Uuid,
    pub visitor_id: String,
    pub event: Event,
    pub date: DateTime<Utc>,
    pub is_retry: bool,
}

impl TrackingCommand {
    pub fn new(visitor_id: impl Into<String>, event: Event) -> Self {
        Self {
            identifier: Uuid::new_v4(),
            visitor_id: visitor_id.into(),
            event,
            date: Utc::now(),
            is_retry: false,
        }
    }

    /// Copy of this command marked as a resubmission
    pub fn retried(&self) -> Self {
        Self {
            is_retry: true,
            ..self.clone()
        }
    }
}

/// Host application and SDK description sent with every request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_name: Option<String>,
    pub sdk_version: String,
    pub system_info: SystemInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub arch: String,
}

impl AppInfo {
    pub fn current(version_name: Option<String>) -> Self {
        Self {
            version_name,
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
            system_info: SystemInfo {
                os: std::env::consts::OS.to_string(),
                arch: std::env::consts::ARCH.to_string(),
            },
        }
    }
}

/// Identifiers shared by every event in a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackKeys {
    pub visitor_id: String,
    pub pv_id: String,
    pub original_pv_id: String,
}

#[derive(Serialize)]
struct TrackBody<'a> {
    app_info: &'a AppInfo,
    events: Vec<Event>,
    keys: BodyKeys<'a>,
}

#[derive(Serialize)]
struct BodyKeys<'a> {
    visitor_id: &'a str,
    pv_id: &'a str,
    original_pv_id: &'a str,
}

/// Response of the track endpoint.
///
/// Every field is optional; an empty body decodes to the default.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TrackResponse {
    #[serde(default)]
    pub success: Option<i64>,
    #[serde(default)]
    pub status: Option<i64>,
    #[serde(default)]
    pub response: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Track API request carrying one or more commands of the same visitor
#[derive(Debug, Clone)]
pub struct TrackRequest {
    request_id: String,
    base_url: String,
    operation_mode: OperationMode,
    app_key: String,
    app_info: AppInfo,
    keys: TrackKeys,
    commands: Vec<TrackingCommand>,
    is_retry: bool,
}

impl TrackRequest {
    /// Build a request for `commands`.
    ///
    /// Returns `None` if there are no commands or the configuration lacks a
    /// base URL or app key.
    pub fn new(
        config: &TrackerConfig,
        app_info: AppInfo,
        pv_id: &str,
        original_pv_id: &str,
        commands: Vec<TrackingCommand>,
    ) -> Option<Self> {
        let first = commands.first()?;
        let base_url = config.base_url.clone()?;
        let app_key = config.app_key.clone()?;

        Some(Self {
            request_id: Uuid::new_v4().to_string(),
            base_url,
            operation_mode: config.operation_mode,
            app_key,
            app_info,
            keys: TrackKeys {
                visitor_id: first.visitor_id.clone(),
                pv_id: pv_id.to_string(),
                original_pv_id: original_pv_id.to_string(),
            },
            is_retry: first.is_retry,
            commands,
        })
    }

    /// New request for the same commands, marked as a retry
    pub fn retry(&self) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            commands: self.commands.iter().map(TrackingCommand::retried).collect(),
            is_retry: true,
            ..self.clone()
        }
    }

    pub fn keys(&self) -> &TrackKeys {
        &self.keys
    }

    pub fn commands(&self) -> &[TrackingCommand] {
        &self.commands
    }

    pub fn is_retry(&self) -> bool {
        self.is_retry
    }

    /// Whether the request includes an event named `event_name`
    pub fn contains(&self, event_name: &str) -> bool {
        self.commands
            .iter()
            .any(|command| command.event.event_name.as_str() == event_name)
    }

    /// Log each event carried by this request
    pub fn log_events(&self) {
        for command in &self.commands {
            let event = &command.event;
            tracing::trace!(
                request_id = %self.request_id,
                command_id = %command.identifier,
                visitor_id = %command.visitor_id,
                event_name = %event.event_name,
                values = %serde_json::Value::Object(event.values.clone()),
                "Event included in the request"
            );

            if event.event_name.as_str() == EventName::VIEW {
                tracing::info!(
                    request_id = %self.request_id,
                    command_id = %command.identifier,
                    visitor_id = %command.visitor_id,
                    view_name = event.string_at("view_name").unwrap_or_default(),
                    title = event.string_at("title").unwrap_or_default(),
                    "Event included in the request"
                );
            } else if event.event_name.is_message_event() {
                tracing::info!(
                    request_id = %self.request_id,
                    command_id = %command.identifier,
                    visitor_id = %command.visitor_id,
                    campaign_id = event.string_at("message.campaign_id").unwrap_or_default(),
                    shorten_id = event.string_at("message.shorten_id").unwrap_or_default(),
                    "Event included in the request"
                );
            }
        }
    }
}

impl Request for TrackRequest {
    type Response = TrackResponse;

    fn request_id(&self) -> &str {
        &self.request_id
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn path(&self) -> &str {
        self.operation_mode.track_endpoint_path()
    }

    fn method(&self) -> Method {
        Method::POST
    }

    fn header_fields(&self) -> Vec<(String, String)> {
        vec![(APP_KEY_HEADER.to_string(), self.app_key.clone())]
    }

    fn build_body(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let events = self
            .commands
            .iter()
            .map(|command| {
                command
                    .event
                    .with_delivery_fields(command.date, command.is_retry)
            })
            .collect();

        let body = TrackBody {
            app_info: &self.app_info,
            events,
            keys: BodyKeys {
                visitor_id: &self.keys.visitor_id,
                pv_id: &self.keys.pv_id,
                original_pv_id: &self.keys.original_pv_id,
            },
        };

        serde_json::to_vec(&body)
            .map(Some)
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))
    }

    fn check_status(&self, status: StatusCode) -> Result<(), TransportError> {
        let code = status.as_u16();
        if status.is_success() {
            tracing::trace!(code, "The server returned a normal response");
            Ok(())
        } else if status.is_client_error() {
            tracing::warn!(code, "The server returned an error response");
            Ok(())
        } else if status == StatusCode::SERVICE_UNAVAILABLE {
            tracing::warn!(
                code,
                "Request was received but service delivery is stopping"
            );
            Ok(())
        } else {
            tracing::error!(code, "The server returned an error response");
            Err(TransportError::Status {
                code,
                message: "server error occurred".to_string(),
            })
        }
    }

    fn parse(&self, body: &[u8], _status: StatusCode) -> Result<TrackResponse, TransportError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(TrackResponse::default());
        }
        serde_json::from_slice(body).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TrackerConfig {
        TrackerConfig {
            enabled: true,
            base_url: Some("https://collect.example.com/".to_string()),
            app_key: Some("app_key_1234".to_string()),
            ..Default::default()
        }
    }

    fn request(events: Vec<Event>) -> TrackRequest {
        let commands = events
            .into_iter()
            .map(|event| TrackingCommand::new("visitor-1", event))
            .collect();
        TrackRequest::new(
            &config(),
            AppInfo::current(Some("1.2.0".to_string())),
            "pv-1",
            "pv-0",
            commands,
        )
        .unwrap()
    }

    #[test]
    fn test_request_requires_commands_and_credentials() {
        let app_info = AppInfo::current(None);
        assert!(TrackRequest::new(&config(), app_info.clone(), "pv", "pv", vec![]).is_none());

        let command = TrackingCommand::new("visitor-1", Event::new("view"));
        let no_key = TrackerConfig {
            app_key: None,
            ..config()
        };
        assert!(TrackRequest::new(&no_key, app_info, "pv", "pv", vec![command]).is_none());
    }

    #[test]
    fn test_request_shape() {
        let request = request(vec![Event::view("home", "Home")]);

        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.url(), "https://collect.example.com/v0/native/track");
        assert_eq!(
            request.header_fields(),
            vec![(APP_KEY_HEADER.to_string(), "app_key_1234".to_string())]
        );
        assert_eq!(request.keys().visitor_id, "visitor-1");
        assert!(request.contains("view"));
        assert!(!request.contains("identify"));
    }

    #[test]
    fn test_ingest_path() {
        let config = TrackerConfig {
            operation_mode: OperationMode::Ingest,
            ..config()
        };
        let command = TrackingCommand::new("visitor-1", Event::new("view"));
        let request =
            TrackRequest::new(&config, AppInfo::current(None), "pv", "pv", vec![command]).unwrap();
        assert_eq!(request.path(), "/v0/native/ingest");
    }

    #[test]
    fn test_body_merges_delivery_fields() {
        let request = request(vec![Event::new("buy").value("price", 300)]);
        let body = request.build_body().unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

        let event = &json["events"][0];
        assert_eq!(event["event_name"], "buy");
        assert_eq!(event["values"]["price"], 300);
        assert_eq!(event["values"]["_retry"], false);
        assert!(event["values"]["_local_event_date"].is_i64());
        assert_eq!(json["keys"]["pv_id"], "pv-1");
        assert_eq!(json["keys"]["original_pv_id"], "pv-0");
        assert_eq!(json["app_info"]["version_name"], "1.2.0");
    }

    #[test]
    fn test_retry_marks_commands() {
        let request = request(vec![Event::new("view")]);
        let retry = request.retry();

        assert!(retry.is_retry());
        assert_ne!(retry.request_id(), request.request_id());
        assert!(retry.commands().iter().all(|c| c.is_retry));
        assert_eq!(
            retry.commands()[0].identifier,
            request.commands()[0].identifier
        );

        let body = retry.build_body().unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["events"][0]["values"]["_retry"], true);
    }

    #[test]
    fn test_status_semantics() {
        let request = request(vec![Event::new("view")]);
        assert!(request.check_status(StatusCode::OK).is_ok());
        assert!(request.check_status(StatusCode::BAD_REQUEST).is_ok());
        assert!(request
            .check_status(StatusCode::SERVICE_UNAVAILABLE)
            .is_ok());

        let err = request
            .check_status(StatusCode::INTERNAL_SERVER_ERROR)
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_parse_response() {
        let request = request(vec![Event::new("view")]);

        let empty = request.parse(b"", StatusCode::OK).unwrap();
        assert_eq!(empty, TrackResponse::default());

        let parsed = request
            .parse(br#"{"success":1,"status":200}"#, StatusCode::OK)
            .unwrap();
        assert_eq!(parsed.success, Some(1));
        assert_eq!(parsed.status, Some(200));

        let err = request.parse(b"not json", StatusCode::OK).unwrap_err();
        assert!(matches!(err, TransportError::Decode(_)));
    }

    #[test]
    fn test_event_helpers() {
        let event = Event::new(EventName::MESSAGE_OPEN)
            .value("message", serde_json::json!({"campaign_id": "c1"}));
        assert!(event.event_name.is_message_event());
        assert_eq!(event.string_at("message.campaign_id"), Some("c1"));
        assert_eq!(event.string_at("message.shorten_id"), None);
        assert!(!EventName::new("view").is_message_event());
    }
}
