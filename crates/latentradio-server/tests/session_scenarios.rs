//! End-to-end scenarios over the Session Engine. A hand-rolled `FakeMixer` stands in for
//! `CrossfadeMixer` so these drive the engine's state machine directly
//! instead of waiting on real audio decode — the same substitution
//! `registry.rs`'s own unit tests make, just shared here across a whole
//! session lifecycle instead of one Registry call.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use latentradio_proto::config::{ExplorerConfig, LatentConfig, SessionConfig};
use latentradio_proto::errors::{ErrorKind, Outcome};
use latentradio_proto::events::Event;
use latentradio_proto::session_types::{Fingerprint, SelectionOrigin, SessionId};
use latentradio_proto::track::{FeatureVector, Track};

use latentradio_server::explorer::ExplorerFilters;
use latentradio_server::feature_index::FeatureIndex;
use latentradio_server::latent_client::LatentClient;
use latentradio_server::mixer::{Mixer, MixerEvent, MixerStatus};
use latentradio_server::registry::{Registry, ResolveParams};
use latentradio_server::session::Session;

fn track(id: &str, artist: &str, tempo: f64, latent: f64) -> Track {
    let mut features = FeatureVector::new();
    features.set("rhythmic_tempo", tempo);
    features.set("latent_0", latent);
    Track {
        id: id.to_string(),
        title: id.to_string(),
        artist: artist.to_string(),
        album: "album".into(),
        year: None,
        cover_url: None,
        duration_secs: 180.0,
        path: PathBuf::from(format!("/music/{id}.flac")),
        features,
    }
}

fn sample_tracks() -> Vec<Track> {
    vec![
        track(&"a".repeat(32), "Artist A", 100.0, 0.1),
        track(&"b".repeat(32), "Artist B", 110.0, 0.2),
        track(&"c".repeat(32), "Artist C", 120.0, 0.3),
        track(&"d".repeat(32), "Artist D", 90.0, 0.4),
        track(&"e".repeat(32), "Artist E", 130.0, 0.5),
    ]
}

fn disabled_latent() -> LatentClient {
    LatentClient::spawn(LatentConfig { enabled: false, ..LatentConfig::default() })
}

/// Controllable stand-in for `CrossfadeMixer`: records every call, lets a
/// test force `isCrossfading`, and lets a test fail `setNext` for a chosen
/// track id to simulate a decode failure.
struct FakeMixer {
    events_tx: broadcast::Sender<MixerEvent>,
    pcm_tx: broadcast::Sender<Bytes>,
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    current: Option<Track>,
    next: Option<Track>,
    crossfading: bool,
    fail_ids: HashSet<String>,
    clear_calls: u32,
    set_next_calls: u32,
}

impl FakeMixer {
    fn new() -> std::sync::Arc<Self> {
        let (events_tx, _) = broadcast::channel(64);
        let (pcm_tx, _) = broadcast::channel(16);
        std::sync::Arc::new(Self { events_tx, pcm_tx, state: Mutex::new(FakeState::default()) })
    }

    fn set_crossfading(&self, value: bool) {
        self.state.lock().unwrap().crossfading = value;
    }

    fn fail_next(&self, track_id: &str) {
        self.state.lock().unwrap().fail_ids.insert(track_id.to_string());
    }

    fn clear_calls(&self) -> u32 {
        self.state.lock().unwrap().clear_calls
    }

    fn commit(&self, track: Track) {
        self.state.lock().unwrap().crossfading = false;
        let _ = self.events_tx.send(MixerEvent::TrackCommitted(track));
    }
}

#[async_trait]
impl Mixer for FakeMixer {
    async fn start(&self, track: Track) -> Outcome<()> {
        let mut state = self.state.lock().unwrap();
        state.current = Some(track);
        state.next = None;
        state.crossfading = false;
        Ok(())
    }

    async fn set_next(&self, track: Track) -> Outcome<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_ids.remove(&track.id) {
            let id = track.id.clone();
            drop(state);
            let _ = self.events_tx.send(MixerEvent::DecodeFailed { track_id: id.clone() });
            return Err(ErrorKind::DecodeFailed(id));
        }
        state.set_next_calls += 1;
        state.next = Some(track);
        Ok(())
    }

    async fn clear_next_slot(&self) -> Outcome<()> {
        let mut state = self.state.lock().unwrap();
        state.clear_calls += 1;
        if !state.crossfading {
            state.next = None;
        }
        Ok(())
    }

    async fn trigger_transition(&self) -> Outcome<()> {
        self.state.lock().unwrap().crossfading = true;
        Ok(())
    }

    async fn status(&self) -> MixerStatus {
        let state = self.state.lock().unwrap();
        MixerStatus {
            is_crossfading: state.crossfading,
            current_track: state.current.clone(),
            next_track: state.next.clone(),
            lane_position_ms: 0,
        }
    }

    fn subscribe_events(&self) -> broadcast::Receiver<MixerEvent> {
        self.events_tx.subscribe()
    }

    fn subscribe_pcm(&self) -> broadcast::Receiver<Bytes> {
        self.pcm_tx.subscribe()
    }
}

fn spawn_session(mixer: std::sync::Arc<FakeMixer>, latent: LatentClient) -> (Session, std::sync::Arc<FeatureIndex>) {
    let feature_index = std::sync::Arc::new(FeatureIndex::new(sample_tracks()));
    let (idle_tx, _idle_rx) = mpsc::channel(8);
    let session = Session::spawn(
        SessionId::new(),
        Fingerprint::new(),
        mixer,
        feature_index.clone(),
        ExplorerConfig::default(),
        SessionConfig::default(),
        false,
        idle_tx,
        latent,
    );
    (session, feature_index)
}

async fn next_event(rx: &mut broadcast::Receiver<Event>) -> Event {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event within 2s")
        .expect("event channel open")
}

/// Scenario 1: attach one audio client and one event client;
/// the event client's replay carries the seeded track, and a later mixer
/// commit produces exactly one `track_started` for the new track.
#[tokio::test]
async fn happy_path_replays_seed_and_announces_the_next_track() {
    let mixer = FakeMixer::new();
    let (session, _index) = spawn_session(mixer.clone(), disabled_latent());
    let seed = "a".repeat(32);
    session.bootstrap(seed.clone(), None).await.unwrap();

    let _audio = session.attach_audio_client().await;
    let event_attachment = session.attach_event_client().await;
    let replay = event_attachment.replay.expect("heartbeat replay on attach");
    match replay {
        Event::Heartbeat { current_track, .. } => assert_eq!(current_track.identifier, seed),
        other => panic!("expected a heartbeat replay, got {other:?}"),
    }

    let mut events = event_attachment.event_rx;
    // Draining the `connected` event emitted on attach.
    let _ = next_event(&mut events).await;

    let next = "b".repeat(32);
    mixer.commit(track(&next, "Artist B", 110.0, 0.2));

    let started = next_event(&mut events).await;
    match started {
        Event::TrackStarted { track, .. } => assert_eq!(track.identifier, next),
        other => panic!("expected track_started, got {other:?}"),
    }
    assert_eq!(session.snapshot().current_track.unwrap().identifier, next);
}

/// Scenario 2: a commit that arrives during an active
/// crossfade is buffered, never clears the occupied next slot, and is
/// applied as soon as the crossfade's `TrackCommitted` callback fires.
#[tokio::test]
async fn override_during_crossfade_is_applied_after_the_fade_completes() {
    let mixer = FakeMixer::new();
    let (session, _index) = spawn_session(mixer.clone(), disabled_latent());
    let seed = "a".repeat(32);
    session.bootstrap(seed.clone(), None).await.unwrap();

    let event_attachment = session.attach_event_client().await;
    let mut events = event_attachment.event_rx;
    let _ = next_event(&mut events).await; // connected

    // Bootstrap's own prepare-next already occupied the next lane; force a
    // crossfade the way `/session/force-next` would.
    session.force_next().await.unwrap();
    assert!(mixer.status().await.is_crossfading);

    let override_target = "c".repeat(32);
    let result = session
        .commit_next_selection(override_target.clone(), None, SelectionOrigin::General)
        .await
        .unwrap();
    assert_eq!(result.status, "queued");
    assert_eq!(mixer.clear_calls(), 0, "clearNextSlot must be a no-op while crossfading");

    // The crossfade reaches its natural boundary: whatever was in the next
    // lane becomes current, and the buffered override gets its turn.
    let committed = mixer.status().await.next_track.expect("a next lane was prepared during bootstrap");
    mixer.commit(committed);

    let mut saw_next_override = false;
    for _ in 0..5 {
        let event = next_event(&mut events).await;
        if let Event::Heartbeat { next_track: Some(info), .. } = event {
            if info.track.identifier == override_target {
                saw_next_override = true;
                break;
            }
        }
    }
    assert!(saw_next_override, "override target never surfaced as the prepared next track");
    assert_eq!(
        session.snapshot().next_track.map(|t| t.identifier),
        Some(override_target)
    );
}

/// Steady-state override: a commit that arrives while the mixer is *not*
/// crossfading, but a next track is already auto-prepared, must clear the
/// occupied slot and re-derive from the override immediately — the next
/// heartbeat should carry it, not the one after a later natural transition.
#[tokio::test]
async fn override_with_next_already_prepared_is_applied_immediately() {
    let mixer = FakeMixer::new();
    let (session, _index) = spawn_session(mixer.clone(), disabled_latent());
    let seed = "a".repeat(32);
    session.bootstrap(seed.clone(), None).await.unwrap();

    let event_attachment = session.attach_event_client().await;
    let mut events = event_attachment.event_rx;
    let _ = next_event(&mut events).await; // connected

    assert!(!mixer.status().await.is_crossfading);
    let auto_prepared = mixer.status().await.next_track.expect("bootstrap auto-prepares a next track");

    let override_target = ["b", "c", "d", "e"]
        .iter()
        .map(|c| c.repeat(32))
        .find(|id| *id != auto_prepared.id)
        .expect("a candidate distinct from the auto-prepared next track");

    let result = session
        .commit_next_selection(override_target.clone(), None, SelectionOrigin::General)
        .await
        .unwrap();
    assert_eq!(result.status, "queued");

    let mut saw_override_as_next = false;
    for _ in 0..5 {
        let event = next_event(&mut events).await;
        if let Event::Heartbeat { next_track: Some(info), .. } = event {
            if info.track.identifier == override_target {
                saw_override_as_next = true;
                break;
            }
        }
    }
    assert!(
        saw_override_as_next,
        "override should replace the auto-prepared next track without waiting for a crossfade"
    );
    assert_eq!(
        session.snapshot().next_track.map(|t| t.identifier),
        Some(override_target)
    );
    assert!(mixer.clear_calls() >= 1, "the occupied next slot must be cleared to honor the override");
}

/// Scenario 3: committing a track that came from the most
/// recently issued Snapshot with `origin=deck` takes the fast path and acks
/// as `promoted`.
#[tokio::test]
async fn deck_promotion_acks_as_promoted_without_a_fresh_query() {
    let mixer = FakeMixer::new();
    let (session, _index) = spawn_session(mixer, disabled_latent());
    let seed = "a".repeat(32);
    session.bootstrap(seed.clone(), None).await.unwrap();

    let snapshot = session.request_snapshot(&seed, ExplorerFilters::default()).await.unwrap();
    let (direction_key, candidate) = snapshot
        .directions
        .iter()
        .find_map(|(key, entry)| entry.sample_tracks.first().map(|t| (key.clone(), t.identifier.clone())))
        .expect("snapshot has at least one candidate");

    let result = session
        .commit_next_selection(candidate, Some(direction_key), SelectionOrigin::Deck)
        .await
        .unwrap();
    assert_eq!(result.status, "promoted");
}

/// Scenario 4: `refresh_sse` on a session that still has a
/// current track rebroadcasts rather than recreating anything, and pushes a
/// fresh heartbeat to the event client.
#[tokio::test]
async fn refresh_sse_rebroadcasts_without_creating_a_new_session() {
    let mixer = FakeMixer::new();
    let (session, _index) = spawn_session(mixer, disabled_latent());
    let seed = "a".repeat(32);
    session.bootstrap(seed.clone(), None).await.unwrap();

    let event_attachment = session.attach_event_client().await;
    let mut events = event_attachment.event_rx;
    let _ = next_event(&mut events).await; // connected

    let result = session.refresh_sse().await.unwrap();
    assert_eq!(result.stage, latentradio_server::session::RefreshStageResult::Rebroadcast);
    assert_eq!(result.current_track.unwrap().identifier, seed);

    let event = next_event(&mut events).await;
    assert!(matches!(event, Event::Heartbeat { .. }), "expected a fresh heartbeat, got {event:?}");
}

/// Scenario 5: an ephemeral deep-link session with no
/// remaining clients is destroyed exactly once by the idle sweep, and its
/// fingerprint stops resolving afterward.
#[tokio::test]
async fn ephemeral_session_is_swept_once_its_clients_disconnect() {
    let index = std::sync::Arc::new(FeatureIndex::new(sample_tracks()));
    let latent = disabled_latent();
    let registry = Registry::with_mixer_factory(
        index,
        ExplorerConfig::default(),
        SessionConfig { idle_ttl_secs: 0, ..SessionConfig::default() },
        latentradio_proto::config::MixerConfig::default(),
        std::sync::Arc::new(|_| FakeMixer::new() as std::sync::Arc<dyn Mixer>),
        latent,
    );

    let session = registry
        .create_session("a".repeat(32), None, true, None)
        .await
        .unwrap();
    let fingerprint = session.fingerprint.clone();

    let attachment = session.attach_audio_client().await;
    drop(attachment);
    // The detach message is fire-and-forget; give the actor a moment to
    // process it before sweeping.
    for _ in 0..20 {
        if session.snapshot().audio_clients == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(session.snapshot().audio_clients, 0);

    let mut swept = Vec::new();
    registry.sweep(|id| swept.push(id.clone())).await;
    assert_eq!(swept.len(), 1);

    let err = registry
        .resolve(ResolveParams { fingerprint: Some(fingerprint), ..Default::default() }, false)
        .await
        .unwrap_err();
    assert_eq!(err, ErrorKind::FingerprintNotFound);
}

/// Scenario 6: with the latent subprocess unreachable,
/// `requestSnapshot` still returns a well-formed snapshot composed only of
/// non-latent directions — without the caller having to know to exclude
/// them itself.
#[tokio::test]
async fn latent_outage_excludes_latent_directions_from_snapshot() {
    let mixer = FakeMixer::new();
    // A binary that cannot possibly exist on the test host: `spawn_child`
    // fails every attempt, so `is_available()` never turns true, the same
    // steady state a killed subprocess settles into after its last pending
    // request times out.
    let latent = LatentClient::spawn(LatentConfig {
        enabled: true,
        binary_path: PathBuf::from("latentradio-nonexistent-latent-backend"),
        ..LatentConfig::default()
    });
    assert!(!latent.is_available());

    let (session, _index) = spawn_session(mixer, latent);
    let seed = "a".repeat(32);
    session.bootstrap(seed.clone(), None).await.unwrap();

    let snapshot = session.request_snapshot(&seed, ExplorerFilters::default()).await.unwrap();
    assert!(
        !snapshot.directions.keys().any(|k| k.starts_with("latent_0")),
        "latent directions must be withheld while the backend is down"
    );
    assert!(!snapshot.directions.is_empty(), "non-latent directions still resolve");
}
