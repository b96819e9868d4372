//! Builds neighborhood Snapshots from a source track. Pure:
//! never mutates the Feature Index or any session state, so the same
//! inputs against an unchanged catalog always produce the same Snapshot
//! (modulo direction-key tie-breaking, which is itself stable).

use std::collections::{HashMap, HashSet};

use latentradio_proto::config::ExplorerConfig;
use latentradio_proto::direction::{Direction, Polarity};
use latentradio_proto::errors::{ErrorKind, Outcome};
use latentradio_proto::snapshot::{DirectionEntry, NextTrackPick, Snapshot};
use latentradio_proto::track::{Track, TrackSummary};

use crate::feature_index::{DirectionSearchConfig, FeatureIndex};

const SEMANTIC_COMPONENTS: &[&str] = &[
    "rhythmic_tempo",
    "spectral_centroid",
    "spectral_density",
    "tonal_warmth",
];
const OUTLIER_COMPONENT: &str = "outlier_score";

/// Identifiers to exclude outright, and artists/albums to deprioritize
/// (rank after everything else) rather than drop.
/// `exclude_families` drops whole direction families outright — the session
/// uses it to withhold `latent` once the latent subprocess is down, so a
/// snapshot taken mid-outage never offers a direction it cannot serve.
#[derive(Debug, Clone, Default)]
pub struct ExplorerFilters {
    pub exclude_ids: HashSet<String>,
    pub dampened_artists: HashSet<String>,
    pub dampened_albums: HashSet<String>,
    pub exclude_families: HashSet<String>,
}

pub struct Explorer<'a> {
    index: &'a FeatureIndex,
    config: &'a ExplorerConfig,
}

impl<'a> Explorer<'a> {
    pub fn new(index: &'a FeatureIndex, config: &'a ExplorerConfig) -> Self {
        Self { index, config }
    }

    pub fn snapshot(&self, source_id: &str, filters: &ExplorerFilters) -> Outcome<Snapshot> {
        let source = self.index.get_track(source_id).ok_or(ErrorKind::SourceNotFound)?;

        let mut directions: HashMap<String, DirectionEntry> = HashMap::new();
        for direction in self.enabled_directions(source, filters) {
            let candidates = self.search_direction(source_id, &direction);
            let (prioritized, deprioritized) = partition_candidates(candidates, filters);
            if prioritized.is_empty() && deprioritized.is_empty() {
                continue;
            }
            let mut ordered = prioritized.clone();
            ordered.extend(deprioritized);
            let sample_tracks: Vec<TrackSummary> = ordered
                .iter()
                .take(self.config.samples_per_direction)
                .map(|t| t.summary())
                .collect();

            directions.insert(
                direction.key.clone(),
                DirectionEntry {
                    diversity_score: diversity_score(&ordered),
                    track_count: ordered.len(),
                    sample_tracks,
                    has_opposite: false,
                    opposite_direction: Direction::opposite_key(&direction.key),
                    is_outlier: direction.is_outlier,
                },
            );
        }

        // Second pass: now that every direction with candidates is known,
        // tag has_opposite for entries whose opposite also resolved.
        let keys_with_candidates: HashSet<String> = directions.keys().cloned().collect();
        for entry in directions.values_mut() {
            if let Some(opposite) = &entry.opposite_direction {
                entry.has_opposite = keys_with_candidates.contains(opposite);
            }
        }

        let next_track = self.pick_next(&directions, filters);

        Ok(Snapshot {
            current_track: source.summary(),
            directions,
            next_track,
        })
    }

    fn enabled_directions(&self, source: &Track, filters: &ExplorerFilters) -> Vec<Direction> {
        let mut out = Vec::new();
        for component in source.features.components() {
            let family = classify_component(component);
            if !self.config.enabled_families.iter().any(|f| f == family) {
                continue;
            }
            if filters.exclude_families.contains(family) {
                continue;
            }
            if component == OUTLIER_COMPONENT {
                out.push(Direction::outlier(component.clone(), Polarity::Positive));
                continue;
            }
            out.push(Direction::new_aliased(component.clone(), Polarity::Positive));
            out.push(Direction::new_aliased(component.clone(), Polarity::Negative));
        }
        out
    }

    fn search_direction(&self, source_id: &str, direction: &Direction) -> Vec<Track> {
        let config = DirectionSearchConfig {
            min_advance: 1e-6,
            orthogonal_radius: f64::MAX,
        };
        let limit = self.config.samples_per_direction * 4;
        self.index
            .direction_search(source_id, direction, config, limit)
            .map(|hits| {
                hits.into_iter()
                    .filter_map(|(id, _)| self.index.get_track(&id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn pick_next(
        &self,
        directions: &HashMap<String, DirectionEntry>,
        filters: &ExplorerFilters,
    ) -> Option<NextTrackPick> {
        let mut candidates: Vec<(&String, &DirectionEntry)> = directions
            .iter()
            .filter(|(_, entry)| !entry.sample_tracks.is_empty())
            .collect();
        candidates.sort_by(|a, b| {
            b.1.diversity_score
                .partial_cmp(&a.1.diversity_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });

        for (key, entry) in candidates {
            if let Some(track) = entry
                .sample_tracks
                .iter()
                .find(|t| is_prioritized(t, filters))
            {
                return Some(NextTrackPick {
                    direction_key: key.clone(),
                    track: track.clone(),
                });
            }
        }
        None
    }
}

fn classify_component(component: &str) -> &'static str {
    if component == OUTLIER_COMPONENT {
        "outlier"
    } else if component.starts_with("latent_") {
        "latent"
    } else if component.contains("_pc") || component.starts_with("pca_") {
        "pca"
    } else if SEMANTIC_COMPONENTS.contains(&component) {
        "acoustic"
    } else {
        "acoustic"
    }
}

fn is_prioritized(track: &TrackSummary, filters: &ExplorerFilters) -> bool {
    !filters.dampened_artists.contains(&track.artist) && !filters.dampened_albums.contains(&track.album)
}

fn partition_candidates(candidates: Vec<Track>, filters: &ExplorerFilters) -> (Vec<Track>, Vec<Track>) {
    let mut prioritized = Vec::new();
    let mut deprioritized = Vec::new();
    for track in candidates {
        if filters.exclude_ids.contains(&track.id) {
            continue;
        }
        if is_prioritized(&track.summary(), filters) {
            prioritized.push(track);
        } else {
            deprioritized.push(track);
        }
    }
    (prioritized, deprioritized)
}

/// Fraction of distinct artists among the sample: `1.0` means every sample
/// is by a different artist, `0.0` means a single artist dominates.
fn diversity_score(tracks: &[Track]) -> f64 {
    if tracks.is_empty() {
        return 0.0;
    }
    let distinct: HashSet<&str> = tracks.iter().map(|t| t.artist.as_str()).collect();
    distinct.len() as f64 / tracks.len() as f64
}
