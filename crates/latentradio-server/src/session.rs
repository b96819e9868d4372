//! The per-session coordinator — the hard part. One actor
//! task owns all mutable session state exclusively; every mutating
//! operation is a message sent to it, so invariants like "at most one
//! prepare-next in flight" hold without an explicit lock (same shape as
//! a single-owner event loop, narrowed to one
//! session instead of one process).
//!
//! Read-only queries (`heartbeat_sync`) skip the actor entirely and read a
//! `watch`-published snapshot instead, keeping reads lock-free and
//! allowance for operations that don't mutate state.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};
use tracing::warn;

use latentradio_proto::config::{ExplorerConfig, SessionConfig};
use latentradio_proto::direction::ExplorerResolution;
use latentradio_proto::errors::{ErrorKind, Outcome};
use latentradio_proto::events::{
    DriftInfo, Event, HeartbeatTrack, NextTrackInfo, OverrideInfo, SessionCounts, Timing,
};
use latentradio_proto::session_types::{Fingerprint, SelectionOrigin, SessionId};
use latentradio_proto::snapshot::Snapshot;
use latentradio_proto::track::{Track, TrackSummary};

use crate::explorer::{Explorer, ExplorerFilters};
use crate::feature_index::FeatureIndex;
use crate::latent_client::LatentClient;
use crate::mixer::{Mixer, MixerEvent};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const PREPARE_RETRY_LIMIT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Creating,
    Bootstrapping,
    Playing,
    Transitioning,
    Destroyed,
}

#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub current_track: Option<TrackSummary>,
    pub next_track: Option<TrackSummary>,
    pub current_direction: Option<String>,
    pub track_started_at: Option<Instant>,
    pub duration_ms: u64,
    pub audio_clients: usize,
    pub event_clients: usize,
    pub created_at: Instant,
    pub last_access_at: Instant,
    pub is_ephemeral: bool,
    pub lifecycle: Lifecycle,
}

impl Default for EngineSnapshot {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            current_track: None,
            next_track: None,
            current_direction: None,
            track_started_at: None,
            duration_ms: 0,
            audio_clients: 0,
            event_clients: 0,
            created_at: now,
            last_access_at: now,
            is_ephemeral: false,
            lifecycle: Lifecycle::Creating,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectionResult {
    pub status: &'static str,
    pub track_id: String,
    pub direction: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HeartbeatResult {
    pub current_track: Option<TrackSummary>,
    pub next_track: Option<TrackSummary>,
    pub elapsed_ms: u64,
    pub remaining_ms: u64,
    pub duration_ms: u64,
    pub drift: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStageResult {
    Restart,
    Rebroadcast,
}

#[derive(Debug, Clone)]
pub struct RefreshResult {
    pub stage: RefreshStageResult,
    pub current_track: Option<TrackSummary>,
}

/// Cached, cheaply-read bookkeeping that supporting operations need without
/// going through the actor: the last issued Explorer snapshot (for the
/// deck-promotion fast path) plus the current override lock.
#[derive(Default)]
struct ReadState {
    last_explorer_snapshot: Option<Snapshot>,
}

pub struct AudioAttachment {
    pub pcm_rx: broadcast::Receiver<Bytes>,
    client_id: u64,
    cmd_tx: mpsc::Sender<EngineCommand>,
}

impl Drop for AudioAttachment {
    fn drop(&mut self) {
        let _ = self.cmd_tx.try_send(EngineCommand::DetachAudio(self.client_id));
    }
}

pub struct EventAttachment {
    pub replay: Option<Event>,
    pub event_rx: broadcast::Receiver<Event>,
    cmd_tx: mpsc::Sender<EngineCommand>,
}

impl Drop for EventAttachment {
    fn drop(&mut self) {
        let _ = self.cmd_tx.try_send(EngineCommand::DetachEvent);
    }
}

struct AudioAttachmentInner {
    pcm_rx: broadcast::Receiver<Bytes>,
    client_id: u64,
}

struct EventAttachmentInner {
    replay: Option<Event>,
    event_rx: broadcast::Receiver<Event>,
}

enum EngineCommand {
    AttachAudio { reply: oneshot::Sender<AudioAttachmentInner> },
    DetachAudio(u64),
    AttachEvent { reply: oneshot::Sender<EventAttachmentInner> },
    DetachEvent,
    Bootstrap {
        seed_id: String,
        forced_next_id: Option<String>,
        reply: oneshot::Sender<Outcome<()>>,
    },
    RequestSnapshot {
        source_id: String,
        filters: ExplorerFilters,
        reply: oneshot::Sender<Outcome<Snapshot>>,
    },
    CommitNextSelection {
        track_id: String,
        direction: Option<String>,
        origin: SelectionOrigin,
        reply: oneshot::Sender<Outcome<SelectionResult>>,
    },
    ResetOverride {
        reply: oneshot::Sender<()>,
    },
    ForceNext {
        reply: oneshot::Sender<Outcome<()>>,
    },
    SetResolution {
        mode: String,
        reply: oneshot::Sender<()>,
    },
    RefreshSse {
        reply: oneshot::Sender<Outcome<RefreshResult>>,
    },
    Destroy {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap handle; every clone shares the same actor, event bus, and
/// read-state cache.
#[derive(Clone)]
pub struct Session {
    pub id: SessionId,
    pub fingerprint: Fingerprint,
    cmd_tx: mpsc::Sender<EngineCommand>,
    snapshot_rx: watch::Receiver<EngineSnapshot>,
    feature_index: Arc<FeatureIndex>,
    explorer_config: ExplorerConfig,
    latent: LatentClient,
    read_state: Arc<RwLock<ReadState>>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        id: SessionId,
        fingerprint: Fingerprint,
        mixer: Arc<dyn Mixer>,
        feature_index: Arc<FeatureIndex>,
        explorer_config: ExplorerConfig,
        session_config: SessionConfig,
        is_ephemeral: bool,
        idle_tx: mpsc::Sender<SessionId>,
        latent: LatentClient,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (snapshot_tx, snapshot_rx) = watch::channel(EngineSnapshot {
            is_ephemeral,
            ..EngineSnapshot::default()
        });
        let read_state = Arc::new(RwLock::new(ReadState::default()));

        let actor = EngineState::new(
            id.clone(),
            fingerprint.clone(),
            feature_index.clone(),
            explorer_config.clone(),
            mixer,
            session_config,
            is_ephemeral,
            snapshot_tx,
            read_state.clone(),
            idle_tx,
            latent.clone(),
        );
        tokio::spawn(actor.run(cmd_rx));

        Self {
            id,
            fingerprint,
            cmd_tx,
            snapshot_rx,
            feature_index,
            explorer_config,
            latent,
            read_state,
        }
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub async fn bootstrap(&self, seed_id: String, forced_next_id: Option<String>) -> Outcome<()> {
        self.call(|reply| EngineCommand::Bootstrap { seed_id, forced_next_id, reply }).await
    }

    pub async fn attach_audio_client(&self) -> AudioAttachment {
        let (tx, rx) = oneshot::channel();
        let inner = if self.cmd_tx.send(EngineCommand::AttachAudio { reply: tx }).await.is_err() {
            None
        } else {
            rx.await.ok()
        };
        let inner = inner.unwrap_or_else(|| AudioAttachmentInner {
            pcm_rx: broadcast::channel(1).1,
            client_id: 0,
        });
        AudioAttachment {
            pcm_rx: inner.pcm_rx,
            client_id: inner.client_id,
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    pub async fn attach_event_client(&self) -> EventAttachment {
        let (tx, rx) = oneshot::channel();
        let inner = if self.cmd_tx.send(EngineCommand::AttachEvent { reply: tx }).await.is_err() {
            None
        } else {
            rx.await.ok()
        };
        let inner = inner.unwrap_or_else(|| EventAttachmentInner {
            replay: None,
            event_rx: broadcast::channel(1).1,
        });
        EventAttachment {
            replay: inner.replay,
            event_rx: inner.event_rx,
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Pure query: resolves `source_id`, asks the Explorer, caches the
    /// result for the deck-promotion fast path, and returns the stripped
    /// Snapshot. Never touches the actor's authoritative state.
    pub async fn request_snapshot(&self, source_id: &str, mut filters: ExplorerFilters) -> Outcome<Snapshot> {
        if !self.latent.is_available() {
            filters.exclude_families.insert("latent".to_string());
        }
        let explorer = Explorer::new(&self.feature_index, &self.explorer_config);
        let snapshot = explorer.snapshot(source_id, &filters)?;
        let mut guard = self.read_state.write().await;
        guard.last_explorer_snapshot = Some(snapshot.clone());
        drop(guard);
        Ok(snapshot)
    }

    pub async fn commit_next_selection(
        &self,
        track_id: String,
        direction: Option<String>,
        origin: SelectionOrigin,
    ) -> Outcome<SelectionResult> {
        self.call(|reply| EngineCommand::CommitNextSelection { track_id, direction, origin, reply }).await
    }

    /// Liveness/drift check; never mutates the session.
    pub fn heartbeat_sync(&self, client_next_id: Option<&str>) -> HeartbeatResult {
        let snap = self.snapshot_rx.borrow();
        let elapsed_ms = snap
            .track_started_at
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        let remaining_ms = snap.duration_ms.saturating_sub(elapsed_ms);
        let drift = match (client_next_id, &snap.next_track) {
            (Some(expected), Some(actual)) => expected != actual.identifier,
            (Some(_), None) => true,
            (None, _) => false,
        };
        HeartbeatResult {
            current_track: snap.current_track.clone(),
            next_track: snap.next_track.clone(),
            elapsed_ms,
            remaining_ms,
            duration_ms: snap.duration_ms,
            drift,
        }
    }

    pub async fn reset_override(&self) {
        let _ = self.call_unit(|reply| EngineCommand::ResetOverride { reply }).await;
    }

    pub async fn force_next(&self) -> Outcome<()> {
        self.call(|reply| EngineCommand::ForceNext { reply }).await
    }

    pub async fn set_resolution(&self, mode: String) {
        let _ = self.call_unit(|reply| EngineCommand::SetResolution { mode, reply }).await;
    }

    pub async fn refresh_sse(&self) -> Outcome<RefreshResult> {
        self.call(|reply| EngineCommand::RefreshSse { reply }).await
    }

    pub async fn destroy(&self) {
        let _ = self.call_unit(|reply| EngineCommand::Destroy { reply }).await;
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<Outcome<T>>) -> EngineCommand) -> Outcome<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| ErrorKind::SessionUnavailable)?;
        rx.await.map_err(|_| ErrorKind::SessionUnavailable)?
    }

    async fn call_unit(&self, build: impl FnOnce(oneshot::Sender<()>) -> EngineCommand) -> Outcome<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| ErrorKind::SessionUnavailable)?;
        rx.await.map_err(|_| ErrorKind::SessionUnavailable)
    }
}

struct EngineState {
    id: SessionId,
    fingerprint: Fingerprint,
    feature_index: Arc<FeatureIndex>,
    explorer_config: ExplorerConfig,
    mixer: Arc<dyn Mixer>,
    config: SessionConfig,
    latent: LatentClient,

    current_track: Option<Track>,
    current_direction: Option<String>,
    track_started_at: Option<Instant>,
    track_started_at_ms: Option<i64>,
    next_track: Option<Track>,
    next_direction: Option<String>,
    locked_next_id: Option<String>,
    pending_override_id: Option<String>,
    pending_override_direction: Option<String>,
    history: VecDeque<String>,
    last_failed_target: Option<String>,
    resolution: ExplorerResolution,
    lifecycle: Lifecycle,
    prepare_in_flight: bool,

    audio_clients: HashSet<u64>,
    next_audio_client_id: u64,
    event_clients: usize,
    created_at: Instant,
    last_access_at: Instant,
    is_ephemeral: bool,

    event_tx: broadcast::Sender<Event>,
    last_heartbeat: Option<Event>,
    read_state: Arc<RwLock<ReadState>>,
    state_tx: watch::Sender<EngineSnapshot>,
    idle_tx: mpsc::Sender<SessionId>,
}

impl EngineState {
    #[allow(clippy::too_many_arguments)]
    fn new(
        id: SessionId,
        fingerprint: Fingerprint,
        feature_index: Arc<FeatureIndex>,
        explorer_config: ExplorerConfig,
        mixer: Arc<dyn Mixer>,
        config: SessionConfig,
        is_ephemeral: bool,
        state_tx: watch::Sender<EngineSnapshot>,
        read_state: Arc<RwLock<ReadState>>,
        idle_tx: mpsc::Sender<SessionId>,
        latent: LatentClient,
    ) -> Self {
        let resolution = ExplorerResolution::parse(&config.default_resolution);
        let now = Instant::now();
        Self {
            id,
            fingerprint,
            feature_index,
            explorer_config,
            mixer,
            config,
            latent,
            current_track: None,
            current_direction: None,
            track_started_at: None,
            track_started_at_ms: None,
            next_track: None,
            next_direction: None,
            locked_next_id: None,
            pending_override_id: None,
            pending_override_direction: None,
            history: VecDeque::new(),
            last_failed_target: None,
            resolution,
            lifecycle: Lifecycle::Creating,
            prepare_in_flight: false,
            audio_clients: HashSet::new(),
            next_audio_client_id: 1,
            event_clients: 0,
            created_at: now,
            last_access_at: now,
            is_ephemeral,
            event_tx: broadcast::channel(128).0,
            last_heartbeat: None,
            read_state,
            state_tx,
            idle_tx,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<EngineCommand>) {
        let mut mixer_events = self.mixer.subscribe_events();
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None => break,
                        Some(EngineCommand::Destroy { reply }) => {
                            self.handle_destroy().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }
                event = mixer_events.recv() => {
                    match event {
                        Ok(MixerEvent::TrackCommitted(track)) => self.on_track_committed(track).await,
                        Ok(MixerEvent::Idle) => {
                            let _ = self.idle_tx.send(self.id.clone()).await;
                        }
                        Ok(MixerEvent::DecodeFailed { track_id }) => {
                            warn!(session = %self.id, %track_id, "lane decode failed");
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => {}
                    }
                }
                _ = heartbeat.tick() => {
                    self.emit_heartbeat();
                }
            }
            self.publish_snapshot();
        }
    }

    fn touch(&mut self) {
        self.last_access_at = Instant::now();
    }

    fn publish_snapshot(&self) {
        let _ = self.state_tx.send(EngineSnapshot {
            current_track: self.current_track.as_ref().map(|t| t.summary()),
            next_track: self.next_track.as_ref().map(|t| t.summary()),
            current_direction: self.current_direction.clone(),
            track_started_at: self.track_started_at,
            duration_ms: self
                .current_track
                .as_ref()
                .map(|t| (t.duration_secs * 1000.0).round() as u64)
                .unwrap_or(0),
            audio_clients: self.audio_clients.len(),
            event_clients: self.event_clients,
            created_at: self.created_at,
            last_access_at: self.last_access_at,
            is_ephemeral: self.is_ephemeral,
            lifecycle: self.lifecycle,
        });
    }

    async fn handle_command(&mut self, cmd: EngineCommand) {
        self.touch();
        match cmd {
            EngineCommand::AttachAudio { reply } => {
                let client_id = self.next_audio_client_id;
                self.next_audio_client_id += 1;
                self.audio_clients.insert(client_id);
                let _ = reply.send(AudioAttachmentInner {
                    pcm_rx: self.mixer.subscribe_pcm(),
                    client_id,
                });
            }
            EngineCommand::DetachAudio(client_id) => {
                self.audio_clients.remove(&client_id);
            }
            EngineCommand::AttachEvent { reply } => {
                self.event_clients += 1;
                let rx = self.event_tx.subscribe();
                let replay = self.last_heartbeat.clone().or_else(|| {
                    if self.current_track.is_none() {
                        Some(self.make_event(|ts, sid, fp| Event::BootstrapPending {
                            timestamp: ts,
                            session_id: sid,
                            fingerprint: fp,
                        }))
                    } else {
                        None
                    }
                });
                let _ = reply.send(EventAttachmentInner { replay, event_rx: rx });
                let connected = self.make_event(|ts, sid, fp| Event::Connected {
                    timestamp: ts,
                    session_id: sid,
                    fingerprint: fp,
                });
                let _ = self.event_tx.send(connected);
            }
            EngineCommand::DetachEvent => {
                self.event_clients = self.event_clients.saturating_sub(1);
            }
            EngineCommand::Bootstrap { seed_id, forced_next_id, reply } => {
                let result = self.bootstrap(seed_id, forced_next_id).await;
                let _ = reply.send(result);
            }
            EngineCommand::RequestSnapshot { source_id, mut filters, reply } => {
                if !self.latent.is_available() {
                    filters.exclude_families.insert("latent".to_string());
                }
                let explorer = Explorer::new(&self.feature_index, &self.explorer_config);
                let _ = reply.send(explorer.snapshot(&source_id, &filters));
            }
            EngineCommand::CommitNextSelection { track_id, direction, origin, reply } => {
                let result = self.commit_next_selection(track_id, direction, origin).await;
                let _ = reply.send(result);
            }
            EngineCommand::ResetOverride { reply } => {
                let had_override = self.locked_next_id.take().is_some();
                self.pending_override_id = None;
                self.pending_override_direction = None;
                if had_override && !self.mixer.status().await.is_crossfading {
                    let _ = self.mixer.clear_next_slot().await;
                    self.next_track = None;
                    self.next_direction = None;
                    self.prepare_next().await;
                }
                let _ = reply.send(());
            }
            EngineCommand::ForceNext { reply } => {
                let result = self.mixer.trigger_transition().await;
                self.lifecycle = Lifecycle::Transitioning;
                let _ = reply.send(result);
            }
            EngineCommand::SetResolution { mode, reply } => {
                let resolved = ExplorerResolution::parse(&mode);
                if resolved != self.resolution {
                    self.resolution = resolved;
                    self.emit_heartbeat();
                }
                let _ = reply.send(());
            }
            EngineCommand::RefreshSse { reply } => {
                let result = self.refresh_sse().await;
                let _ = reply.send(result);
            }
            EngineCommand::Destroy { .. } => unreachable!("handled in run()"),
        }
    }

    async fn handle_destroy(&mut self) {
        let bye = self.make_event(|ts, sid, fp| Event::Bye {
            timestamp: ts,
            session_id: sid,
            fingerprint: fp,
            reason: "session destroyed".to_string(),
        });
        let _ = self.event_tx.send(bye);
        self.lifecycle = Lifecycle::Destroyed;
        self.publish_snapshot();
    }

    async fn bootstrap(&mut self, seed_id: String, forced_next_id: Option<String>) -> Outcome<()> {
        let seed = self.feature_index.get_track(&seed_id).ok_or(ErrorKind::SourceNotFound)?.clone();
        self.mixer.start(seed.clone()).await?;
        self.current_track = Some(seed.clone());
        self.track_started_at = Some(Instant::now());
        self.track_started_at_ms = Some(Utc::now().timestamp_millis());
        self.history.push_back(seed.id.clone());
        self.lifecycle = Lifecycle::Playing;

        if let Some(forced_id) = forced_next_id {
            let forced = self.feature_index.get_track(&forced_id).ok_or(ErrorKind::SourceNotFound)?.clone();
            self.locked_next_id = Some(forced.id.clone());
            if self.mixer.set_next(forced.clone()).await.is_ok() {
                self.next_track = Some(forced);
            }
        }

        self.prepare_next().await;
        self.emit_heartbeat();
        Ok(())
    }

    async fn on_track_committed(&mut self, track: Track) {
        self.history.push_back(track.id.clone());
        while self.history.len() > self.config.history_len {
            self.history.pop_front();
        }
        self.current_track = Some(track.clone());
        self.current_direction = self.next_direction.take();
        self.track_started_at = Some(Instant::now());
        self.track_started_at_ms = Some(Utc::now().timestamp_millis());
        self.next_track = None;
        if self.locked_next_id.as_deref() == Some(track.id.as_str()) {
            self.locked_next_id = None;
        }
        self.lifecycle = Lifecycle::Playing;

        let start_time = self.track_started_at_ms.unwrap_or(0).max(0) as u64;
        let event = self.make_event(|ts, sid, fp| Event::TrackStarted {
            timestamp: ts,
            session_id: sid,
            fingerprint: fp,
            track: HeartbeatTrack::with_start_time(&track.summary(), start_time),
            direction: self.current_direction.clone(),
        });
        let _ = self.event_tx.send(event);

        self.prepare_next().await;
        self.emit_heartbeat();
    }

    async fn commit_next_selection(
        &mut self,
        track_id: String,
        direction: Option<String>,
        origin: SelectionOrigin,
    ) -> Outcome<SelectionResult> {
        if !Track::is_valid_id(&track_id) {
            self.emit_selection_failed("invalid-argument");
            return Err(ErrorKind::InvalidArgument("malformed track id".to_string()));
        }

        let already_prepared = self.next_track.as_ref().map(|t| t.id.as_str()) == Some(track_id.as_str())
            || self.locked_next_id.as_deref() == Some(track_id.as_str());
        if already_prepared {
            let status = if origin == SelectionOrigin::Deck { "promoted" } else { "queued" };
            self.emit_selection_ack(status, &track_id, direction.as_deref());
            return Ok(SelectionResult { status, track_id, direction });
        }

        let Some(track) = self.feature_index.get_track(&track_id).cloned() else {
            self.emit_selection_failed("unknown track id");
            return Err(ErrorKind::InvalidArgument("unknown track id".to_string()));
        };

        let from_last_snapshot = {
            let guard = self.read_state.read().await;
            guard
                .last_explorer_snapshot
                .as_ref()
                .map(|s| {
                    s.directions
                        .values()
                        .any(|d| d.sample_tracks.iter().any(|t| t.identifier == track_id))
                })
                .unwrap_or(false)
        };

        if origin == SelectionOrigin::Deck && from_last_snapshot {
            self.locked_next_id = Some(track_id.clone());
            self.next_direction = direction.clone();
            if !self.mixer.status().await.is_crossfading && self.next_track.is_none() {
                if self.mixer.set_next(track.clone()).await.is_ok() {
                    self.next_track = Some(track);
                    self.emit_next_track_prepared();
                }
            }
            self.emit_selection_ack("promoted", &track_id, direction.as_deref());
            return Ok(SelectionResult { status: "promoted", track_id, direction });
        }

        self.pending_override_id = Some(track_id.clone());
        self.pending_override_direction = direction.clone();
        self.emit_selection_ack("queued", &track_id, direction.as_deref());
        self.prepare_next().await;
        Ok(SelectionResult { status: "queued", track_id, direction })
    }

    /// The prepare-next protocol: determines a target, resolves it, guards
    /// the mixer's next slot, and loads it, retrying with runner-up
    /// candidates on decode failure.
    async fn prepare_next(&mut self) {
        if self.prepare_in_flight {
            return;
        }
        if self.mixer.status().await.is_crossfading {
            return;
        }
        if self.next_track.is_some() {
            // An override can arrive after `next_track` is already auto-prepared.
            // Not crossfading, so the slot is free: clear it and re-derive from
            // the override instead of leaving it stuck until the next natural
            // transition.
            if self.pending_override_id.is_some() {
                if self.mixer.clear_next_slot().await.is_err() {
                    return;
                }
                self.next_track = None;
                self.next_direction = None;
            } else {
                return;
            }
        }
        self.prepare_in_flight = true;

        if let Some(pending_id) = self.pending_override_id.take() {
            self.locked_next_id = Some(pending_id);
            self.next_direction = self.pending_override_direction.take();
        }

        if let Some(locked_id) = self.locked_next_id.clone() {
            if Some(&locked_id) != self.last_failed_target.as_ref() {
                if let Some(track) = self.feature_index.get_track(&locked_id).cloned() {
                    match self.mixer.set_next(track.clone()).await {
                        Ok(()) => {
                            self.next_track = Some(track);
                            self.last_failed_target = None;
                            self.emit_next_track_prepared();
                        }
                        Err(_) => {
                            self.last_failed_target = Some(locked_id);
                            self.emit_next_track_failed("decode-failed");
                        }
                    }
                } else {
                    self.locked_next_id = None;
                }
            }
            self.prepare_in_flight = false;
            return;
        }

        let Some(current) = self.current_track.clone() else {
            self.prepare_in_flight = false;
            return;
        };

        let exclude_ids: HashSet<String> = self.history.iter().cloned().collect();
        let mut exclude_families = HashSet::new();
        if !self.latent.is_available() {
            exclude_families.insert("latent".to_string());
        }
        let explorer = Explorer::new(&self.feature_index, &self.explorer_config);
        let filters = ExplorerFilters { exclude_ids, exclude_families, ..Default::default() };
        let Ok(snapshot) = explorer.snapshot(&current.id, &filters) else {
            self.prepare_in_flight = false;
            return;
        };

        {
            let mut guard = self.read_state.write().await;
            guard.last_explorer_snapshot = Some(snapshot.clone());
        }

        let candidates = candidate_queue(&snapshot);
        for (track_id, direction_key) in candidates.into_iter().take(PREPARE_RETRY_LIMIT) {
            if Some(&track_id) == self.last_failed_target.as_ref() {
                continue;
            }
            let Some(track) = self.feature_index.get_track(&track_id).cloned() else {
                continue;
            };
            match self.mixer.set_next(track.clone()).await {
                Ok(()) => {
                    self.next_track = Some(track);
                    self.next_direction = Some(direction_key);
                    self.last_failed_target = None;
                    self.emit_next_track_prepared();
                    self.prepare_in_flight = false;
                    return;
                }
                Err(_) => {
                    self.last_failed_target = Some(track_id);
                }
            }
        }

        self.emit_next_track_failed("no viable candidate");
        self.prepare_in_flight = false;
    }

    async fn refresh_sse(&mut self) -> Outcome<RefreshResult> {
        if self.current_track.is_some() {
            self.emit_heartbeat();
            return Ok(RefreshResult {
                stage: RefreshStageResult::Rebroadcast,
                current_track: self.current_track.as_ref().map(|t| t.summary()),
            });
        }
        let Some(locked) = self.locked_next_id.clone().or_else(|| self.next_track.as_ref().map(|t| t.id.clone())) else {
            return Err(ErrorKind::SessionUnavailable);
        };
        self.bootstrap(locked, None).await?;
        Ok(RefreshResult {
            stage: RefreshStageResult::Restart,
            current_track: self.current_track.as_ref().map(|t| t.summary()),
        })
    }

    fn emit_heartbeat(&mut self) {
        let Some(current) = self.current_track.as_ref() else {
            return;
        };
        let elapsed_ms = self.track_started_at.map(|t| t.elapsed().as_millis() as u64).unwrap_or(0);
        let duration_ms = (current.duration_secs * 1000.0).round() as u64;
        let remaining_ms = duration_ms.saturating_sub(elapsed_ms);

        let override_info = self.locked_next_id.as_ref().map(|id| OverrideInfo {
            identifier: id.clone(),
            status: if self.next_track.as_ref().map(|t| &t.id) == Some(id) {
                "confirmed".to_string()
            } else {
                "pending".to_string()
            },
            direction: self.next_direction.clone(),
        });

        let start_time = self.track_started_at_ms.unwrap_or(0).max(0) as u64;
        let event = self.make_event(|ts, sid, fp| Event::Heartbeat {
            timestamp: ts,
            session_id: sid,
            fingerprint: fp,
            current_track: HeartbeatTrack::with_start_time(&current.summary(), start_time),
            timing: Timing { elapsed_ms, remaining_ms },
            next_track: self.next_track.as_ref().map(|t| NextTrackInfo {
                track: t.summary(),
                direction: self.next_direction.clone(),
            }),
            override_: override_info,
            drift: DriftInfo { current_direction: self.current_direction.clone() },
            session: SessionCounts {
                id: self.id.to_string(),
                audio_clients: self.audio_clients.len(),
                event_clients: self.event_clients,
            },
        });
        self.last_heartbeat = Some(event.clone());
        let _ = self.event_tx.send(event);
    }

    fn emit_selection_ack(&self, status: &'static str, track_id: &str, direction: Option<&str>) {
        let event = self.make_event(|ts, sid, fp| Event::SelectionAck {
            timestamp: ts,
            session_id: sid,
            fingerprint: fp,
            status: status.to_string(),
            track_id: Some(track_id.to_string()),
            direction: direction.map(|d| d.to_string()),
        });
        let _ = self.event_tx.send(event);
    }

    fn emit_selection_failed(&self, reason: &str) {
        let event = self.make_event(|ts, sid, fp| Event::SelectionFailed {
            timestamp: ts,
            session_id: sid,
            fingerprint: fp,
            reason: reason.to_string(),
        });
        let _ = self.event_tx.send(event);
    }

    fn emit_next_track_prepared(&self) {
        let Some(track) = self.next_track.as_ref() else { return };
        let event = self.make_event(|ts, sid, fp| Event::NextTrackPrepared {
            timestamp: ts,
            session_id: sid,
            fingerprint: fp,
            track: HeartbeatTrack::from(&track.summary()),
            direction: self.next_direction.clone(),
        });
        let _ = self.event_tx.send(event);
    }

    fn emit_next_track_failed(&self, reason: &str) {
        let event = self.make_event(|ts, sid, fp| Event::NextTrackFailed {
            timestamp: ts,
            session_id: sid,
            fingerprint: fp,
            reason: reason.to_string(),
        });
        let _ = self.event_tx.send(event);
    }

    fn make_event(&self, build: impl FnOnce(i64, SessionId, Fingerprint) -> Event) -> Event {
        build(Utc::now().timestamp_millis(), self.id.clone(), self.fingerprint.clone())
    }
}

/// Ranks direction entries by diversity score, takes each direction's best
/// candidate, and returns `(track_id, direction_key)` pairs in priority
/// order for the prepare-next retry loop.
fn candidate_queue(snapshot: &Snapshot) -> Vec<(String, String)> {
    let mut entries: Vec<(&String, &latentradio_proto::snapshot::DirectionEntry)> =
        snapshot.directions.iter().collect();
    entries.sort_by(|a, b| {
        b.1.diversity_score
            .partial_cmp(&a.1.diversity_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(b.0))
    });

    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter_map(|(key, entry)| {
            entry.sample_tracks.first().and_then(|t| {
                if seen.insert(t.identifier.clone()) {
                    Some((t.identifier.clone(), key.clone()))
                } else {
                    None
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use latentradio_proto::snapshot::{DirectionEntry, NextTrackPick};
    use std::collections::HashMap;

    fn summary(id: &str) -> TrackSummary {
        TrackSummary {
            identifier: id.to_string(),
            title: id.to_string(),
            artist: "artist".into(),
            album: "album".into(),
            year: None,
            cover_url: None,
            duration_ms: 180_000,
        }
    }

    #[test]
    fn candidate_queue_orders_by_diversity_then_key() {
        let mut directions = HashMap::new();
        directions.insert(
            "low".to_string(),
            DirectionEntry {
                sample_tracks: vec![summary(&"a".repeat(32))],
                diversity_score: 0.2,
                track_count: 1,
                has_opposite: false,
                opposite_direction: None,
                is_outlier: false,
            },
        );
        directions.insert(
            "high".to_string(),
            DirectionEntry {
                sample_tracks: vec![summary(&"b".repeat(32))],
                diversity_score: 0.9,
                track_count: 1,
                has_opposite: false,
                opposite_direction: None,
                is_outlier: false,
            },
        );
        let snapshot = Snapshot {
            current_track: summary(&"c".repeat(32)),
            directions,
            next_track: Some(NextTrackPick {
                direction_key: "high".into(),
                track: summary(&"b".repeat(32)),
            }),
        };
        let queue = candidate_queue(&snapshot);
        assert_eq!(queue[0].0, "b".repeat(32));
    }
}
