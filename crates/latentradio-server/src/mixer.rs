//! The two-lane decode-and-crossfade pipeline. One
//! `CrossfadeMixer` per session; all lane state lives inside a single actor
//! task so `start`/`set_next`/`clear_next_slot`/`trigger_transition` never
//! race each other (the per-session single-writer discipline
//! §5, same shape as [[session]]'s command actor).
//!
//! The duck-typed "does this mixer support x" checks in the source module
//! this is ported from become a plain trait here: every `Mixer`
//! implementation supports the full operation set, no optional methods.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, warn};

use latentradio_proto::config::MixerConfig;
use latentradio_proto::errors::{ErrorKind, Outcome};
use latentradio_proto::track::Track;

use crate::audio::{self, equal_power_gains};

const TICK_MS: u64 = 20;
const EVENT_CHANNEL_CAPACITY: usize = 64;
const PCM_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum MixerEvent {
    TrackCommitted(Track),
    DecodeFailed { track_id: String },
    Idle,
}

#[derive(Debug, Clone, Default)]
pub struct MixerStatus {
    pub is_crossfading: bool,
    pub current_track: Option<Track>,
    pub next_track: Option<Track>,
    pub lane_position_ms: u64,
}

#[async_trait]
pub trait Mixer: Send + Sync {
    async fn start(&self, track: Track) -> Outcome<()>;
    async fn set_next(&self, track: Track) -> Outcome<()>;
    async fn clear_next_slot(&self) -> Outcome<()>;
    async fn trigger_transition(&self) -> Outcome<()>;
    async fn status(&self) -> MixerStatus;
    fn subscribe_events(&self) -> broadcast::Receiver<MixerEvent>;
    fn subscribe_pcm(&self) -> broadcast::Receiver<Bytes>;
}

struct Lane {
    track: Track,
    samples: Vec<f32>,
    position_frames: usize,
}

impl Lane {
    fn frames_total(&self, channels: usize) -> usize {
        self.samples.len() / channels.max(1)
    }

    fn frames_remaining(&self, channels: usize) -> usize {
        self.frames_total(channels).saturating_sub(self.position_frames)
    }
}

struct LaneState {
    current: Option<Lane>,
    next: Option<Lane>,
    crossfading: bool,
    fade_progress_frames: usize,
    fade_len_frames: usize,
}

impl LaneState {
    fn new() -> Self {
        Self {
            current: None,
            next: None,
            crossfading: false,
            fade_progress_frames: 0,
            fade_len_frames: 0,
        }
    }

    fn status(&self, channels: usize, sample_rate: u32) -> MixerStatus {
        MixerStatus {
            is_crossfading: self.crossfading,
            current_track: self.current.as_ref().map(|l| l.track.clone()),
            next_track: self.next.as_ref().map(|l| l.track.clone()),
            lane_position_ms: self
                .current
                .as_ref()
                .map(|l| (l.position_frames as u64 * 1000) / sample_rate.max(1) as u64)
                .unwrap_or(0),
        }
    }
}

enum MixerCommand {
    Start { track: Track, reply: oneshot::Sender<Outcome<()>> },
    SetNext { track: Track, reply: oneshot::Sender<Outcome<()>> },
    ClearNextSlot { reply: oneshot::Sender<Outcome<()>> },
    TriggerTransition { reply: oneshot::Sender<Outcome<()>> },
    Status { reply: oneshot::Sender<MixerStatus> },
}

pub struct CrossfadeMixer {
    cmd_tx: mpsc::Sender<MixerCommand>,
    events_tx: broadcast::Sender<MixerEvent>,
    pcm_tx: broadcast::Sender<Bytes>,
}

impl CrossfadeMixer {
    pub fn new(config: MixerConfig) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (pcm_tx, _) = broadcast::channel(PCM_CHANNEL_CAPACITY);

        let mixer = Arc::new(Self {
            cmd_tx,
            events_tx: events_tx.clone(),
            pcm_tx: pcm_tx.clone(),
        });

        tokio::spawn(run_actor(config, cmd_rx, events_tx, pcm_tx));
        mixer
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> MixerCommand) -> Outcome<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| ErrorKind::SessionUnavailable)?;
        rx.await.map_err(|_| ErrorKind::SessionUnavailable)
    }
}

#[async_trait]
impl Mixer for CrossfadeMixer {
    async fn start(&self, track: Track) -> Outcome<()> {
        self.call(|reply| MixerCommand::Start { track, reply }).await?
    }

    async fn set_next(&self, track: Track) -> Outcome<()> {
        self.call(|reply| MixerCommand::SetNext { track, reply }).await?
    }

    async fn clear_next_slot(&self) -> Outcome<()> {
        self.call(|reply| MixerCommand::ClearNextSlot { reply }).await?
    }

    async fn trigger_transition(&self) -> Outcome<()> {
        self.call(|reply| MixerCommand::TriggerTransition { reply }).await?
    }

    async fn status(&self) -> MixerStatus {
        self.call(|reply| MixerCommand::Status { reply })
            .await
            .unwrap_or_default()
    }

    fn subscribe_events(&self) -> broadcast::Receiver<MixerEvent> {
        self.events_tx.subscribe()
    }

    fn subscribe_pcm(&self) -> broadcast::Receiver<Bytes> {
        self.pcm_tx.subscribe()
    }
}

async fn decode(track: &Track, sample_rate: u32, channels: u16) -> Outcome<Lane> {
    let path = track.path.clone();
    let track = track.clone();
    let decoded = tokio::task::spawn_blocking(move || audio::decode_track(&path, sample_rate, channels))
        .await
        .map_err(|_| ErrorKind::DecodeFailed(track.id.clone()))??;
    Ok(Lane {
        track,
        samples: decoded.samples,
        position_frames: 0,
    })
}

async fn run_actor(
    config: MixerConfig,
    mut cmd_rx: mpsc::Receiver<MixerCommand>,
    events_tx: broadcast::Sender<MixerEvent>,
    pcm_tx: broadcast::Sender<Bytes>,
) {
    let channels = config.channels as usize;
    let sample_rate = config.sample_rate;
    let chunk_frames = ((sample_rate as u64 * TICK_MS) / 1000) as usize;
    let fade_lead_frames = ((sample_rate as u64 * config.crossfade_lead_ms) / 1000) as usize;

    let mut state = LaneState::new();
    let mut ticker = tokio::time::interval(Duration::from_millis(TICK_MS));

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    None => break,
                    Some(MixerCommand::Start { track, reply }) => {
                        let result = decode(&track, sample_rate, config.channels).await;
                        let _ = reply.send(result.map(|lane| {
                            state.current = Some(lane);
                            state.next = None;
                            state.crossfading = false;
                        }));
                    }
                    Some(MixerCommand::SetNext { track, reply }) => {
                        if state.current.is_none() {
                            let _ = reply.send(Err(ErrorKind::InvalidArgument("mixer is idle".into())));
                            continue;
                        }
                        if state.next.is_some() {
                            let _ = reply.send(Err(ErrorKind::InvalidArgument("next lane occupied".into())));
                            continue;
                        }
                        match decode(&track, sample_rate, config.channels).await {
                            Ok(lane) => {
                                state.next = Some(lane);
                                let _ = reply.send(Ok(()));
                            }
                            Err(e) => {
                                let _ = events_tx.send(MixerEvent::DecodeFailed { track_id: track.id.clone() });
                                let _ = reply.send(Err(e));
                            }
                        }
                    }
                    Some(MixerCommand::ClearNextSlot { reply }) => {
                        if !state.crossfading {
                            state.next = None;
                        }
                        let _ = reply.send(Ok(()));
                    }
                    Some(MixerCommand::TriggerTransition { reply }) => {
                        let result = trigger_transition(&mut state, channels, fade_lead_frames);
                        let _ = reply.send(result);
                    }
                    Some(MixerCommand::Status { reply }) => {
                        let _ = reply.send(state.status(channels, sample_rate));
                    }
                }
            }
            _ = ticker.tick() => {
                let (samples, events) = tick(&mut state, channels, chunk_frames, fade_lead_frames);
                if !samples.is_empty() {
                    let bytes = f32_to_le_bytes(&samples);
                    let _ = pcm_tx.send(bytes);
                }
                for event in events {
                    debug!(?event, "mixer event");
                    let _ = events_tx.send(event);
                }
            }
        }
    }
}

fn trigger_transition(state: &mut LaneState, channels: usize, fade_lead_frames: usize) -> Outcome<()> {
    if state.crossfading {
        return Ok(());
    }
    let (Some(current), Some(next)) = (state.current.as_ref(), state.next.as_ref()) else {
        return Err(ErrorKind::InvalidArgument("nothing to transition to".into()));
    };
    let remaining = current.frames_remaining(channels);
    let next_len = next.frames_total(channels);
    state.fade_len_frames = fade_lead_frames.min(remaining.max(1)).min(next_len.max(1)).max(1);
    state.fade_progress_frames = 0;
    state.crossfading = true;
    Ok(())
}

/// Advances the lane state machine by one tick, returning the interleaved
/// output samples for this tick plus any events the transition produced.
fn tick(
    state: &mut LaneState,
    channels: usize,
    chunk_frames: usize,
    fade_lead_frames: usize,
) -> (Vec<f32>, Vec<MixerEvent>) {
    let mut events = Vec::new();
    let mut out = vec![0.0f32; chunk_frames * channels];

    if state.crossfading {
        let frames_left_in_fade = state.fade_len_frames.saturating_sub(state.fade_progress_frames);
        let n = {
            let current = state.current.as_ref().expect("crossfading implies current lane");
            let next = state.next.as_ref().expect("crossfading implies next lane");
            chunk_frames
                .min(frames_left_in_fade)
                .min(current.frames_remaining(channels))
                .min(next.frames_remaining(channels))
        };

        for f in 0..n {
            let t = (state.fade_progress_frames + f) as f64 / state.fade_len_frames.max(1) as f64;
            let (out_gain, in_gain) = equal_power_gains(t);
            let current = state.current.as_ref().unwrap();
            let next = state.next.as_ref().unwrap();
            for ch in 0..channels {
                let cur_idx = (current.position_frames + f) * channels + ch;
                let nxt_idx = (next.position_frames + f) * channels + ch;
                let cur_sample = current.samples.get(cur_idx).copied().unwrap_or(0.0) as f64 * out_gain;
                let nxt_sample = next.samples.get(nxt_idx).copied().unwrap_or(0.0) as f64 * in_gain;
                out[f * channels + ch] = (cur_sample + nxt_sample) as f32;
            }
        }

        if let Some(current) = state.current.as_mut() {
            current.position_frames += n;
        }
        if let Some(next) = state.next.as_mut() {
            next.position_frames += n;
        }
        state.fade_progress_frames += n;

        if state.fade_progress_frames >= state.fade_len_frames {
            let finished_next = state.next.take().expect("next present at fade end");
            let committed_track = finished_next.track.clone();
            state.current = Some(finished_next);
            state.crossfading = false;
            state.fade_progress_frames = 0;
            events.push(MixerEvent::TrackCommitted(committed_track));
        }
        return (out, events);
    }

    let should_start_fade = match (&state.current, &state.next) {
        (Some(current), Some(_)) => current.frames_remaining(channels) <= fade_lead_frames,
        _ => false,
    };

    if should_start_fade {
        let remaining = state.current.as_ref().unwrap().frames_remaining(channels);
        let next_len = state.next.as_ref().unwrap().frames_total(channels);
        state.fade_len_frames = fade_lead_frames.min(remaining.max(1)).min(next_len.max(1)).max(1);
        state.fade_progress_frames = 0;
        state.crossfading = true;
        return tick(state, channels, chunk_frames, fade_lead_frames);
    }

    if let Some(current) = state.current.as_mut() {
        let remaining = current.frames_remaining(channels);
        let n = chunk_frames.min(remaining);
        let start = current.position_frames * channels;
        out[..n * channels].copy_from_slice(&current.samples[start..start + n * channels]);
        current.position_frames += n;
        if current.frames_remaining(channels) == 0 {
            state.current = None;
        }
    } else if state.next.is_none() {
        events.push(MixerEvent::Idle);
    }

    (out, events)
}

fn f32_to_le_bytes(samples: &[f32]) -> Bytes {
    let mut bytes = Vec::with_capacity(samples.len() * 4);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    Bytes::from(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn track(id: &str) -> Track {
        Track {
            id: id.to_string(),
            title: id.to_string(),
            artist: "a".into(),
            album: "al".into(),
            year: None,
            cover_url: None,
            duration_secs: 1.0,
            path: PathBuf::from("/dev/null"),
            features: Default::default(),
        }
    }

    fn lane(id: &str, frames: usize, channels: usize) -> Lane {
        Lane {
            track: track(id),
            samples: vec![1.0; frames * channels],
            position_frames: 0,
        }
    }

    #[test]
    fn clear_next_slot_is_a_no_op_while_crossfading() {
        let mut state = LaneState::new();
        state.current = Some(lane("a".repeat(32).as_str(), 1000, 2));
        state.next = Some(lane("b".repeat(32).as_str(), 1000, 2));
        state.crossfading = true;
        let next_before = state.next.as_ref().map(|l| l.track.id.clone());
        if !state.crossfading {
            state.next = None;
        }
        assert_eq!(state.next.as_ref().map(|l| l.track.id.clone()), next_before);
    }

    #[test]
    fn natural_boundary_starts_crossfade_within_lead_window() {
        let channels = 2;
        let fade_lead_frames = 100;
        let mut state = LaneState::new();
        state.current = Some(lane(&"a".repeat(32), 50, channels));
        state.next = Some(lane(&"b".repeat(32), 1000, channels));

        let (_out, events) = tick(&mut state, channels, 10, fade_lead_frames);
        assert!(state.crossfading);
        assert!(events.is_empty());
    }

    #[test]
    fn crossfade_completion_emits_track_committed() {
        let channels = 2;
        let mut state = LaneState::new();
        state.current = Some(lane(&"a".repeat(32), 5, channels));
        state.next = Some(lane(&"b".repeat(32), 1000, channels));
        state.crossfading = true;
        state.fade_len_frames = 5;
        state.fade_progress_frames = 0;

        let (_out, events) = tick(&mut state, channels, 10, 100);
        assert!(!state.crossfading);
        assert!(matches!(events.as_slice(), [MixerEvent::TrackCommitted(t)] if t.id == "b".repeat(32)));
    }

    #[test]
    fn idle_with_no_lanes_emits_idle_event() {
        let mut state = LaneState::new();
        let (out, events) = tick(&mut state, 2, 10, 100);
        assert!(out.iter().all(|s| *s == 0.0));
        assert!(matches!(events.as_slice(), [MixerEvent::Idle]));
    }
}
