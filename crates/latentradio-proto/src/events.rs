//! The typed event frame set pushed to event-stream clients.
//!
//! Canonical shape — including nullability and lowercasing of identifiers —
//! is this module; the HTTP layer only serializes `Event` values and appends
//! the `\n\n` frame terminator, it never hand-builds JSON.

use serde::{Deserialize, Serialize};

use crate::session_types::{Fingerprint, SessionId};
use crate::track::TrackSummary;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatTrack {
    pub identifier: String,
    pub title: String,
    pub artist: String,
    /// Monotonic start time, milliseconds since the session's epoch.
    pub start_time: u64,
    pub duration_ms: u64,
}

impl HeartbeatTrack {
    pub fn with_start_time(t: &TrackSummary, start_time: u64) -> Self {
        Self { start_time, ..Self::from(t) }
    }
}

impl From<&TrackSummary> for HeartbeatTrack {
    fn from(t: &TrackSummary) -> Self {
        Self {
            identifier: t.identifier.clone(),
            title: t.title.clone(),
            artist: t.artist.clone(),
            start_time: 0,
            duration_ms: t.duration_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Timing {
    pub elapsed_ms: u64,
    pub remaining_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NextTrackInfo {
    pub track: TrackSummary,
    pub direction: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OverrideInfo {
    pub identifier: String,
    pub status: String,
    pub direction: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriftInfo {
    pub current_direction: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionCounts {
    pub id: String,
    pub audio_clients: usize,
    pub event_clients: usize,
}

/// The full typed event set. `#[serde(tag = "type")]` tags each frame by
/// "at minimum `{ type, timestamp, sessionId?, fingerprint? }` plus
/// type-specific fields".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    #[serde(rename_all = "camelCase")]
    Connected {
        timestamp: i64,
        session_id: SessionId,
        fingerprint: Fingerprint,
    },
    #[serde(rename_all = "camelCase")]
    Heartbeat {
        timestamp: i64,
        session_id: SessionId,
        fingerprint: Fingerprint,
        current_track: HeartbeatTrack,
        timing: Timing,
        next_track: Option<NextTrackInfo>,
        #[serde(rename = "override")]
        override_: Option<OverrideInfo>,
        drift: DriftInfo,
        session: SessionCounts,
    },
    #[serde(rename_all = "camelCase")]
    TrackStarted {
        timestamp: i64,
        session_id: SessionId,
        fingerprint: Fingerprint,
        track: HeartbeatTrack,
        direction: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SelectionAck {
        timestamp: i64,
        session_id: SessionId,
        fingerprint: Fingerprint,
        status: String,
        track_id: Option<String>,
        direction: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SelectionFailed {
        timestamp: i64,
        session_id: SessionId,
        fingerprint: Fingerprint,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    NextTrackPrepared {
        timestamp: i64,
        session_id: SessionId,
        fingerprint: Fingerprint,
        track: HeartbeatTrack,
        direction: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    NextTrackFailed {
        timestamp: i64,
        session_id: SessionId,
        fingerprint: Fingerprint,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    SeekSync {
        timestamp: i64,
        session_id: SessionId,
        fingerprint: Fingerprint,
        elapsed_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    BootstrapPending {
        timestamp: i64,
        session_id: SessionId,
        fingerprint: Fingerprint,
    },
    #[serde(rename_all = "camelCase")]
    Bye {
        timestamp: i64,
        session_id: SessionId,
        fingerprint: Fingerprint,
        reason: String,
    },
}

impl Event {
    /// Serializes to one JSON object followed by the `\n\n` frame terminator
    /// the event stream uses for every frame type.
    pub fn to_frame(&self) -> serde_json::Result<String> {
        let json = serde_json::to_string(self)?;
        Ok(format!("{}\n\n", json))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_is_terminated_by_blank_line() {
        let event = Event::BootstrapPending {
            timestamp: 0,
            session_id: SessionId("a".repeat(32)),
            fingerprint: Fingerprint("b".repeat(16)),
        };
        let frame = event.to_frame().unwrap();
        assert!(frame.ends_with("\n\n"));
        assert!(frame.contains("\"type\":\"bootstrap_pending\""));
    }

    #[test]
    fn heartbeat_tags_override_field_without_rust_keyword_clash() {
        let event = Event::Heartbeat {
            timestamp: 0,
            session_id: SessionId("a".repeat(32)),
            fingerprint: Fingerprint("b".repeat(16)),
            current_track: HeartbeatTrack {
                identifier: "c".repeat(32),
                title: "T".into(),
                artist: "A".into(),
                start_time: 0,
                duration_ms: 1000,
            },
            timing: Timing {
                elapsed_ms: 0,
                remaining_ms: 1000,
            },
            next_track: None,
            override_: None,
            drift: DriftInfo {
                current_direction: None,
            },
            session: SessionCounts {
                id: "a".repeat(32),
                audio_clients: 1,
                event_clients: 1,
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"override\":null"));
        assert!(!json.contains("override_"));
    }

    #[test]
    fn heartbeat_wire_shape_is_camel_case() {
        let event = Event::Heartbeat {
            timestamp: 0,
            session_id: SessionId("a".repeat(32)),
            fingerprint: Fingerprint("b".repeat(16)),
            current_track: HeartbeatTrack {
                identifier: "c".repeat(32),
                title: "T".into(),
                artist: "A".into(),
                start_time: 0,
                duration_ms: 1000,
            },
            timing: Timing {
                elapsed_ms: 500,
                remaining_ms: 1000,
            },
            next_track: None,
            override_: None,
            drift: DriftInfo {
                current_direction: None,
            },
            session: SessionCounts {
                id: "a".repeat(32),
                audio_clients: 1,
                event_clients: 1,
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"sessionId\""));
        assert!(json.contains("\"currentTrack\""));
        assert!(json.contains("\"elapsedMs\":500"));
        assert!(json.contains("\"remainingMs\":1000"));
        assert!(json.contains("\"nextTrack\":null"));
        assert!(json.contains("\"durationMs\":1000"));
        assert!(!json.contains("session_id"));
        assert!(!json.contains("elapsed_ms"));
    }
}
