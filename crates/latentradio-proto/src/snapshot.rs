use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::track::TrackSummary;

/// One direction's worth of candidates within a Snapshot. Stateless, never
/// mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DirectionEntry {
    pub sample_tracks: Vec<TrackSummary>,
    pub diversity_score: f64,
    pub track_count: usize,
    pub has_opposite: bool,
    pub opposite_direction: Option<String>,
    pub is_outlier: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NextTrackPick {
    pub direction_key: String,
    pub track: TrackSummary,
}

/// An immutable view: source track + per-direction candidate samples + a
/// recommended next. Computing one must never mutate session or index
/// state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub current_track: TrackSummary,
    pub directions: HashMap<String, DirectionEntry>,
    pub next_track: Option<NextTrackPick>,
}

impl Snapshot {
    pub fn direction(&self, key: &str) -> Option<&DirectionEntry> {
        self.directions.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_entry_wire_shape_is_camel_case() {
        let entry = DirectionEntry {
            sample_tracks: Vec::new(),
            diversity_score: 0.5,
            track_count: 3,
            has_opposite: true,
            opposite_direction: Some("slower".to_string()),
            is_outlier: false,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"sampleTracks\""));
        assert!(json.contains("\"diversityScore\":0.5"));
        assert!(json.contains("\"trackCount\":3"));
        assert!(json.contains("\"hasOpposite\":true"));
        assert!(json.contains("\"oppositeDirection\":\"slower\""));
        assert!(json.contains("\"isOutlier\":false"));
    }
}
