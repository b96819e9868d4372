//! In-memory catalog of tracks with radius-limited and direction-constrained
//! nearest-neighbor queries. Built once at startup; read-only
//! and freely shared afterwards.

use std::collections::HashMap;

use latentradio_proto::direction::{Direction, Polarity};
use latentradio_proto::errors::{ErrorKind, Outcome};
use latentradio_proto::track::Track;

/// Config for `direction_search`: how far along the axis a candidate must
/// sit past `origin`, and how tight the orthogonal (non-axis) spread must
/// be to still count as "in the same neighborhood".
#[derive(Debug, Clone, Copy)]
pub struct DirectionSearchConfig {
    pub min_advance: f64,
    pub orthogonal_radius: f64,
}

pub struct FeatureIndex {
    tracks: Vec<Track>,
    by_id: HashMap<String, usize>,
}

impl FeatureIndex {
    pub fn new(tracks: Vec<Track>) -> Self {
        let by_id = tracks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();
        Self { tracks, by_id }
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn get_track(&self, id: &str) -> Option<&Track> {
        self.by_id.get(id).map(|&i| &self.tracks[i])
    }

    /// Picks an arbitrary track id to seed a fresh session when no other
    /// resolution path applies. Not weighted or curated — just needs to be
    /// a valid id from the catalog.
    pub fn random_id(&self) -> Option<String> {
        if self.tracks.is_empty() {
            return None;
        }
        let i = rand::random::<usize>() % self.tracks.len();
        Some(self.tracks[i].id.clone())
    }

    fn query_components(&self, origin: &Track, weights: Option<&HashMap<String, f64>>) -> Vec<String> {
        match weights {
            Some(w) => w.keys().cloned().collect(),
            None => origin.features.components().cloned().collect(),
        }
    }

    /// Weighted Euclidean distance over `components`. Returns `None` if
    /// either track lacks any of them — callers must treat that candidate
    /// as ineligible, never substitute a default.
    fn weighted_distance(
        &self,
        origin: &Track,
        candidate: &Track,
        components: &[String],
        weights: Option<&HashMap<String, f64>>,
    ) -> Option<f64> {
        if components.is_empty() {
            return None;
        }
        let mut sum = 0.0;
        for c in components {
            let ov = origin.features.get(c)?;
            let cv = candidate.features.get(c)?;
            let w = weights.and_then(|w| w.get(c).copied()).unwrap_or(1.0);
            let d = ov - cv;
            sum += w * d * d;
        }
        Some(sum.sqrt())
    }

    /// Tracks within `radius` of `origin` in the weighted feature space,
    /// ascending by distance, self excluded.
    pub fn radius_search(
        &self,
        origin_id: &str,
        radius: f64,
        weights: Option<&HashMap<String, f64>>,
        limit: usize,
    ) -> Outcome<Vec<(String, f64)>> {
        let origin = self.get_track(origin_id).ok_or(ErrorKind::SourceNotFound)?;
        let components = self.query_components(origin, weights);

        let mut results: Vec<(String, f64)> = self
            .tracks
            .iter()
            .filter(|t| t.id != origin.id)
            .filter_map(|t| {
                self.weighted_distance(origin, t, &components, weights)
                    .map(|d| (t.id.clone(), d))
            })
            .filter(|(_, d)| *d <= radius)
            .collect();

        results.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);
        Ok(results)
    }

    /// Tracks whose projection onto `direction`'s axis is strictly further
    /// along than `origin`, within an orthogonal radius bound. Monotonic:
    /// never returns `origin` or points behind it.
    pub fn direction_search(
        &self,
        origin_id: &str,
        direction: &Direction,
        config: DirectionSearchConfig,
        limit: usize,
    ) -> Outcome<Vec<(String, f64)>> {
        let origin = self.get_track(origin_id).ok_or(ErrorKind::SourceNotFound)?;
        let axis_origin = origin.features.get(&direction.component).ok_or_else(|| {
            ErrorKind::InvalidArgument(format!(
                "origin track missing feature component {}",
                direction.component
            ))
        })?;

        let orthogonal: Vec<String> = origin
            .features
            .components()
            .filter(|c| **c != direction.component)
            .cloned()
            .collect();

        let mut results: Vec<(String, f64)> = self
            .tracks
            .iter()
            .filter(|t| t.id != origin.id)
            .filter_map(|t| {
                let axis_candidate = t.features.get(&direction.component)?;
                let advance = match direction.polarity {
                    Polarity::Positive => axis_candidate - axis_origin,
                    Polarity::Negative => axis_origin - axis_candidate,
                };
                if advance <= config.min_advance {
                    return None;
                }
                let orth_dist = self.weighted_distance(origin, t, &orthogonal, None)?;
                if orth_dist > config.orthogonal_radius {
                    return None;
                }
                Some((t.id.clone(), orth_dist))
            })
            .collect();

        results.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);
        Ok(results)
    }

    /// Radius chosen adaptively: grows the candidate pool until either
    /// `target_count` results are found or `max_radius` is hit, so each
    /// direction yields roughly the same candidate count regardless of
    /// local density around `origin`.
    pub fn calibrated_search(
        &self,
        origin_id: &str,
        target_count: usize,
        weights: Option<&HashMap<String, f64>>,
        max_radius: f64,
    ) -> Outcome<Vec<(String, f64)>> {
        let origin = self.get_track(origin_id).ok_or(ErrorKind::SourceNotFound)?;
        let components = self.query_components(origin, weights);

        let mut all: Vec<(String, f64)> = self
            .tracks
            .iter()
            .filter(|t| t.id != origin.id)
            .filter_map(|t| {
                self.weighted_distance(origin, t, &components, weights)
                    .map(|d| (t.id.clone(), d))
            })
            .filter(|(_, d)| *d <= max_radius)
            .collect();

        all.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        all.truncate(target_count);
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use latentradio_proto::track::FeatureVector;
    use std::path::PathBuf;

    fn track(id: &str, tempo: f64, brightness: f64) -> Track {
        let mut features = FeatureVector::new();
        features.set("rhythmic_tempo", tempo);
        features.set("spectral_centroid", brightness);
        Track {
            id: id.to_string(),
            title: id.to_string(),
            artist: "artist".into(),
            album: "album".into(),
            year: None,
            cover_url: None,
            duration_secs: 200.0,
            path: PathBuf::from(format!("/music/{id}.flac")),
            features,
        }
    }

    fn sample_index() -> FeatureIndex {
        FeatureIndex::new(vec![
            track(&"a".repeat(32), 100.0, 0.5),
            track(&"b".repeat(32), 110.0, 0.6),
            track(&"c".repeat(32), 200.0, 0.9),
            track(&"d".repeat(32), 50.0, 0.2),
        ])
    }

    #[test]
    fn radius_search_excludes_self_and_sorts_ascending() {
        let index = sample_index();
        let origin = "a".repeat(32);
        let results = index.radius_search(&origin, 1000.0, None, 10).unwrap();
        assert!(!results.iter().any(|(id, _)| *id == origin));
        for pair in results.windows(2) {
            assert!(pair[0].1 <= pair[1].1);
        }
    }

    #[test]
    fn radius_search_unknown_id_is_not_found() {
        let index = sample_index();
        let err = index.radius_search("deadbeef", 10.0, None, 5).unwrap_err();
        assert_eq!(err, ErrorKind::SourceNotFound);
    }

    #[test]
    fn direction_search_never_returns_points_behind_origin() {
        let index = sample_index();
        let origin = "a".repeat(32);
        let direction = Direction::new("rhythmic_tempo", Polarity::Positive);
        let config = DirectionSearchConfig {
            min_advance: 0.0,
            orthogonal_radius: 1000.0,
        };
        let results = index
            .direction_search(&origin, &direction, config, 10)
            .unwrap();
        let origin_track = index.get_track(&origin).unwrap();
        let origin_tempo = origin_track.features.get("rhythmic_tempo").unwrap();
        for (id, _) in &results {
            let candidate_tempo = index.get_track(id).unwrap().features.get("rhythmic_tempo").unwrap();
            assert!(candidate_tempo > origin_tempo);
        }
    }

    #[test]
    fn calibrated_search_caps_at_target_count() {
        let index = sample_index();
        let origin = "a".repeat(32);
        let results = index
            .calibrated_search(&origin, 2, None, 1_000_000.0)
            .unwrap();
        assert!(results.len() <= 2);
    }
}
