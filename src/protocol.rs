//! Control messages exchanged between the supervisor and its workers.
//!
//! Messages are JSON-encoded and carried in length-prefixed frames (see
//! [`crate::ipc`]). Decoding never fails: a payload that is not one of the
//! known messages comes back as [`ControlMessage::Unrecognized`] so the
//! supervisor can print it and move on.

use serde::{Deserialize, Serialize};

use crate::stats::StatsSnapshot;

/// One message of the control protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Worker → supervisor: connected and waiting for instructions.
    #[serde(rename = "ready")]
    Ready {
        /// One-time token the worker was launched with.
        token: String,
    },

    /// Supervisor → worker: start the polling loop.
    #[serde(rename = "monitor")]
    Monitor,

    /// Worker → supervisor: polling loop entered.
    #[serde(rename = "monitoring")]
    Monitoring,

    /// Worker → supervisor: the interface is administratively down.
    #[serde(rename = "link_down")]
    LinkDown,

    /// Supervisor → worker: bring the interface back up.
    #[serde(rename = "link_up")]
    LinkUp,

    /// Worker → supervisor: leaving, connection about to close.
    #[serde(rename = "done")]
    Done,

    /// Worker → supervisor: one polling cycle's counters.
    #[serde(rename = "report")]
    Report { snapshot: StatsSnapshot },

    /// Anything that did not decode as a known message. Never sent.
    #[serde(skip)]
    Unrecognized(String),
}

impl ControlMessage {
    pub fn ready(token: impl Into<String>) -> Self {
        Self::Ready {
            token: token.into(),
        }
    }

    pub fn report(snapshot: StatsSnapshot) -> Self {
        Self::Report { snapshot }
    }

    /// Protocol keyword of this message.
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::Monitor => "monitor",
            Self::Monitoring => "monitoring",
            Self::LinkDown => "link_down",
            Self::LinkUp => "link_up",
            Self::Done => "done",
            Self::Report { .. } => "report",
            Self::Unrecognized(_) => "unrecognized",
        }
    }

    /// Serialize to a frame payload.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize a frame payload, falling back to the raw text.
    pub fn decode(payload: &[u8]) -> Self {
        serde_json::from_slice(payload)
            .unwrap_or_else(|_| Self::Unrecognized(String::from_utf8_lossy(payload).into_owned()))
    }

    /// Human-readable form used when a message is surfaced verbatim.
    pub fn display_text(&self) -> String {
        match self {
            Self::Report { snapshot } => snapshot.to_string(),
            Self::Unrecognized(text) => text.clone(),
            other => other.keyword().to_string(),
        }
    }
}
