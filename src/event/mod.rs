//! Plugin event protocol
//!
//! The agent invokes the provider binary with the event name as its argument
//! and the event as JSON on stdin; the provider answers with a single JSON
//! [`EventResponse`] on stdout. Two events are handled:
//!
//! - [`EVENT_BOOTSTRAP`] runs the [`BootstrapOrchestrator`]
//! - [`EVENT_AVAILABLE_RELEASES`] lists upgrade versions through the [`ReleaseLister`]

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::instrument::WithSubscriber;
use tracing::{debug, warn};

use crate::config::BootstrapIntent;
use crate::layout::SystemLayout;
use crate::orchestrator::{
    decide, BootstrapOrchestrator, Decision, Outcome, NOOP_MESSAGE, SETUP_FAILED,
};
use crate::releases::{RegistryTagSource, ReleaseFilter, ReleaseLister};
use crate::telemetry;

/// Bootstrap request sent once the machine configuration is available
pub const EVENT_BOOTSTRAP: &str = "agent.bootstrap";

/// Request for the releases this node can upgrade to
pub const EVENT_AVAILABLE_RELEASES: &str = "agent.available_releases";

/// An event received from the agent
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Event {
    /// Event name, when the agent includes it
    #[serde(default)]
    pub name: String,
    /// Event payload, itself usually a JSON document
    #[serde(default)]
    pub data: String,
}

/// Response written back to the agent
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct EventResponse {
    /// Human readable state
    #[serde(default)]
    pub state: String,
    /// Event-specific result
    #[serde(default)]
    pub data: String,
    /// Error message; empty on success
    #[serde(default)]
    pub error: String,
}

impl EventResponse {
    /// Response carrying only an error
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            error: msg.into(),
            ..Default::default()
        }
    }

    /// Response carrying only a state
    pub fn state(msg: impl Into<String>) -> Self {
        Self {
            state: msg.into(),
            ..Default::default()
        }
    }

    /// Response carrying only data
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    /// True when the error field is set
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

impl From<Outcome> for EventResponse {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Noop(state) => Self::state(state),
            Outcome::Success => Self::default(),
            failed => Self::error(failed.error_message().unwrap_or_default()),
        }
    }
}

/// Payload of [`EVENT_BOOTSTRAP`]
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapPayload {
    /// Full machine configuration document
    #[serde(default)]
    pub config: String,
    /// Address the overlay coordination API should listen on
    #[serde(default)]
    pub api_address: String,
    /// File receiving the bootstrap logs
    #[serde(default)]
    pub logfile: String,
}

/// Dispatch an event to its handler, wired to the machine under `layout`
pub async fn dispatch(name: &str, event: &Event, layout: &SystemLayout) -> EventResponse {
    match name {
        EVENT_BOOTSTRAP => {
            let orchestrator = BootstrapOrchestrator::local(layout.clone());
            bootstrap(event, &orchestrator).await
        }
        EVENT_AVAILABLE_RELEASES => match RegistryTagSource::from_os_release(layout) {
            Ok(source) => available_releases(event, &ReleaseLister::new(Arc::new(source))).await,
            Err(e) => EventResponse::error(e.to_string()),
        },
        other => {
            warn!(event = %other, "Unknown event");
            EventResponse::error(format!("unknown event: {}", other))
        }
    }
}

/// Handle [`EVENT_BOOTSTRAP`]
///
/// The pre-bootstrap hooks run first. Logs produced while taking the
/// bootstrap path go to the payload's log file, at the level configured in
/// the overlay block.
pub async fn bootstrap(event: &Event, orchestrator: &BootstrapOrchestrator) -> EventResponse {
    let payload: BootstrapPayload = match serde_json::from_str(&event.data) {
        Ok(payload) => payload,
        Err(e) => {
            return EventResponse::error(format!(
                "Failed reading JSON input: {} input '{}'",
                e, event.data
            ))
        }
    };

    let intent = match BootstrapIntent::from_config_str(&payload.config) {
        Ok(intent) => intent,
        Err(e) => {
            return EventResponse::error(format!(
                "Failed reading JSON input: {} input '{}'",
                e, payload.config
            ))
        }
    };

    if decide(&intent) == Decision::Noop {
        return EventResponse::state(NOOP_MESSAGE);
    }

    // Hooks run before the request logger is built
    if let Err(e) = orchestrator.run_hooks(&intent).await {
        return EventResponse::error(format!("{}: {}", SETUP_FAILED, e));
    }

    let logfile = Some(Path::new(&payload.logfile)).filter(|p| !p.as_os_str().is_empty());
    let dispatch = match telemetry::request_dispatch(logfile, intent.log_level()) {
        Ok(dispatch) => dispatch,
        Err(e) => return EventResponse::error(format!("Failed setup logger: {}", e)),
    };

    let outcome = async {
        debug!(
            api_address = %payload.api_address,
            log_level = %intent.log_level(),
            "Handling bootstrap event"
        );
        orchestrator.execute(&intent, &payload.api_address).await
    }
    .with_subscriber(dispatch)
    .await;

    outcome.into()
}

/// Handle [`EVENT_AVAILABLE_RELEASES`]
///
/// `data == "stable"` restricts the list to stable releases. The result is a
/// JSON array of tags in the response data.
pub async fn available_releases(event: &Event, lister: &ReleaseLister) -> EventResponse {
    let releases = match lister.list(ReleaseFilter::from_data(&event.data)).await {
        Ok(releases) => releases,
        Err(e) => return EventResponse::error(e.to_string()),
    };

    match serde_json::to_string(&releases) {
        Ok(data) => EventResponse::data(data),
        Err(e) => EventResponse::error(e.to_string()),
    }
}
