use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// A named acoustic/statistical/latent feature vector. Not every track
/// carries every component — callers that need a component must check for
/// its presence rather than assume a default of zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FeatureVector(HashMap<String, f64>);

impl FeatureVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: HashMap<String, f64>) -> Self {
        Self(map)
    }

    pub fn get(&self, component: &str) -> Option<f64> {
        self.0.get(component).copied()
    }

    pub fn set(&mut self, component: impl Into<String>, value: f64) {
        self.0.insert(component.into(), value);
    }

    pub fn contains(&self, component: &str) -> bool {
        self.0.contains_key(component)
    }

    /// True when every named component is present (required for queries that
    /// need the full set, e.g. a weighted radius search).
    pub fn has_all(&self, components: &[String]) -> bool {
        components.iter().all(|c| self.0.contains_key(c))
    }

    pub fn components(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }
}

/// Immutable catalog record, keyed by a 32-character lowercase hex content
/// hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub year: Option<u32>,
    pub cover_url: Option<String>,
    pub duration_secs: f64,
    pub path: PathBuf,
    pub features: FeatureVector,
}

impl Track {
    /// True when `id` is a 32-character lowercase hex string, matching the
    /// identifier format accepted over the wire.
    pub fn is_valid_id(id: &str) -> bool {
        id.len() == 32 && id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    }

    pub fn summary(&self) -> TrackSummary {
        TrackSummary {
            identifier: self.id.clone(),
            title: self.title.clone(),
            artist: self.artist.clone(),
            album: self.album.clone(),
            year: self.year,
            cover_url: self.cover_url.clone(),
            duration_ms: (self.duration_secs * 1000.0).round() as u64,
        }
    }
}

/// Heavy-field-stripped view of a Track, safe to send to clients. Never
/// carries raw feature vectors or PCA coordinates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackSummary {
    pub identifier: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub year: Option<u32>,
    pub cover_url: Option<String>,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_32_hex_identifiers() {
        assert!(Track::is_valid_id(&"a".repeat(32)));
        assert!(!Track::is_valid_id(&"A".repeat(32)));
        assert!(!Track::is_valid_id("too-short"));
        assert!(!Track::is_valid_id(&"g".repeat(32)));
    }

    #[test]
    fn summary_strips_features_and_path() {
        let mut features = FeatureVector::new();
        features.set("tonal_pc1", 0.5);
        let track = Track {
            id: "a".repeat(32),
            title: "T".into(),
            artist: "A".into(),
            album: "Al".into(),
            year: Some(2020),
            cover_url: None,
            duration_secs: 180.0,
            path: PathBuf::from("/music/t.flac"),
            features,
        };
        let summary = track.summary();
        assert_eq!(summary.duration_ms, 180_000);
        assert_eq!(summary.identifier, track.id);
    }

    #[test]
    fn feature_vector_missing_component_is_none() {
        let fv = FeatureVector::new();
        assert_eq!(fv.get("tonal_pc1"), None);
        assert!(!fv.has_all(&["tonal_pc1".to_string()]));
    }
}
