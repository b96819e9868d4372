//! Process-wide session bookkeeping: the maps that let an
//! HTTP request without an explicit session id still find (or create) the
//! right session, the pre-warmed pool, the idle sweep, and shutdown.
//!
//! One value owned by the
//! process root, everything else reaches sessions through it — but holds
//! several maps instead of one state struct, since lookups run by three
//! independent resolution paths (id, fingerprint, IP).

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use latentradio_proto::config::{ExplorerConfig, MixerConfig, SessionConfig};
use latentradio_proto::errors::{ErrorKind, Outcome};
use latentradio_proto::platform;
use latentradio_proto::session_types::{Fingerprint, SessionId};

use crate::feature_index::FeatureIndex;
use crate::latent_client::LatentClient;
use crate::mixer::{CrossfadeMixer, Mixer};
use crate::session::{Lifecycle, Session};

pub type MixerFactory = Arc<dyn Fn(&MixerConfig) -> Arc<dyn Mixer> + Send + Sync>;

#[derive(Debug, Clone)]
struct FingerprintEntry {
    session_id: SessionId,
    created_at: Instant,
    last_touched_at: Instant,
}

#[derive(Debug, Clone, Default)]
struct IpEntry {
    orphan: Option<SessionId>,
    last_healthy: Option<SessionId>,
}

#[derive(Debug, Clone, Default)]
pub struct ResolveParams {
    pub explicit_id: Option<SessionId>,
    pub fingerprint: Option<Fingerprint>,
    pub cookie_id: Option<SessionId>,
    pub client_ip: Option<IpAddr>,
}

#[derive(Debug, Clone)]
pub struct Stats {
    pub session_count: usize,
    pub audio_clients: usize,
    pub event_clients: usize,
    pub primed_count: usize,
}

pub struct Registry {
    feature_index: Arc<FeatureIndex>,
    explorer_config: ExplorerConfig,
    session_config: SessionConfig,
    mixer_config: MixerConfig,
    mixer_factory: MixerFactory,
    latent: LatentClient,

    sessions: RwLock<HashMap<SessionId, Session>>,
    fingerprints: RwLock<HashMap<Fingerprint, FingerprintEntry>>,
    by_ip: RwLock<HashMap<IpAddr, IpEntry>>,
    prewarmed: RwLock<VecDeque<SessionId>>,

    idle_tx: mpsc::Sender<SessionId>,
}

impl Registry {
    pub fn new(
        feature_index: Arc<FeatureIndex>,
        explorer_config: ExplorerConfig,
        session_config: SessionConfig,
        mixer_config: MixerConfig,
        latent: LatentClient,
    ) -> Arc<Self> {
        Self::with_mixer_factory(
            feature_index,
            explorer_config,
            session_config,
            mixer_config,
            Arc::new(|config: &MixerConfig| CrossfadeMixer::new(config.clone()) as Arc<dyn Mixer>),
            latent,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_mixer_factory(
        feature_index: Arc<FeatureIndex>,
        explorer_config: ExplorerConfig,
        session_config: SessionConfig,
        mixer_config: MixerConfig,
        mixer_factory: MixerFactory,
        latent: LatentClient,
    ) -> Arc<Self> {
        let (idle_tx, mut idle_rx) = mpsc::channel(64);
        let registry = Arc::new(Self {
            feature_index,
            explorer_config,
            session_config,
            mixer_config,
            mixer_factory,
            latent,
            sessions: RwLock::new(HashMap::new()),
            fingerprints: RwLock::new(HashMap::new()),
            by_ip: RwLock::new(HashMap::new()),
            prewarmed: RwLock::new(VecDeque::new()),
            idle_tx,
        });

        tokio::spawn(async move {
            while let Some(session_id) = idle_rx.recv().await {
                debug!(%session_id, "mixer reported idle");
            }
        });

        registry
    }

    /// Resolves an existing session through the seven-step order below, or
    /// creates a fresh one as the final fallback.
    pub async fn resolve(self: &Arc<Self>, params: ResolveParams, fallback_ephemeral: bool) -> Outcome<Session> {
        if let Some(id) = &params.explicit_id {
            if let Some(session) = self.sessions.read().await.get(id).cloned() {
                return Ok(session);
            }
        }

        if let Some(fp) = &params.fingerprint {
            let mut guard = self.fingerprints.write().await;
            match guard.get_mut(fp) {
                Some(entry) => {
                    entry.last_touched_at = Instant::now();
                    let session_id = entry.session_id.clone();
                    drop(guard);
                    if let Some(session) = self.sessions.read().await.get(&session_id).cloned() {
                        return Ok(session);
                    }
                    return Err(ErrorKind::FingerprintNotFound);
                }
                None => return Err(ErrorKind::FingerprintNotFound),
            }
        }

        if let Some(id) = &params.cookie_id {
            if let Some(session) = self.sessions.read().await.get(id).cloned() {
                return Ok(session);
            }
        }

        if let Some(ip) = params.client_ip {
            let ip_entries = self.by_ip.read().await;
            if let Some(entry) = ip_entries.get(&ip) {
                if let Some(orphan_id) = &entry.orphan {
                    if let Some(session) = self.sessions.read().await.get(orphan_id).cloned() {
                        if session.snapshot().event_clients == 0 {
                            return Ok(session);
                        }
                    }
                }
                if let Some(healthy_id) = &entry.last_healthy {
                    if let Some(session) = self.sessions.read().await.get(healthy_id).cloned() {
                        return Ok(session);
                    }
                }
            }
        }

        if let Some(session) = self.checkout_prewarmed().await {
            return Ok(session);
        }

        let seed_id = self.feature_index.random_id().ok_or(ErrorKind::SourceNotFound)?;
        self.create_session(seed_id, None, fallback_ephemeral, params.client_ip).await
    }

    pub async fn create_session(
        self: &Arc<Self>,
        seed_id: String,
        forced_next_id: Option<String>,
        is_ephemeral: bool,
        client_ip: Option<IpAddr>,
    ) -> Outcome<Session> {
        let mixer = (self.mixer_factory)(&self.mixer_config);
        let session_id = SessionId::new();
        let fingerprint = Fingerprint::new();

        let session = Session::spawn(
            session_id.clone(),
            fingerprint.clone(),
            mixer,
            self.feature_index.clone(),
            self.explorer_config.clone(),
            self.session_config.clone(),
            is_ephemeral,
            self.idle_tx.clone(),
            self.latent.clone(),
        );
        session.bootstrap(seed_id, forced_next_id).await?;

        self.sessions.write().await.insert(session_id.clone(), session.clone());
        self.fingerprints.write().await.insert(
            fingerprint,
            FingerprintEntry {
                session_id: session_id.clone(),
                created_at: Instant::now(),
                last_touched_at: Instant::now(),
            },
        );
        if let Some(ip) = client_ip {
            let mut ips = self.by_ip.write().await;
            let entry = ips.entry(ip).or_default();
            entry.last_healthy = Some(session_id.clone());
        }

        info!(%session_id, ephemeral = is_ephemeral, "session created");
        Ok(session)
    }

    async fn checkout_prewarmed(self: &Arc<Self>) -> Option<Session> {
        let session_id = self.prewarmed.write().await.pop_front()?;
        let session = self.sessions.read().await.get(&session_id).cloned();
        let registry = self.clone();
        tokio::spawn(async move {
            registry.prewarm_refill().await;
        });
        session
    }

    /// Tops the pre-warmed pool back up to its configured size. Each primed
    /// session is a fresh, non-ephemeral session with a track already
    /// decoding, ready for instant checkout.
    pub async fn prewarm_refill(self: &Arc<Self>) {
        loop {
            let deficit = {
                let pool = self.prewarmed.read().await;
                self.session_config.prewarm_pool_size.saturating_sub(pool.len())
            };
            if deficit == 0 {
                return;
            }
            let Some(seed_id) = self.feature_index.random_id() else {
                return;
            };
            match self.create_session(seed_id, None, false, None).await {
                Ok(session) => {
                    self.prewarmed.write().await.push_back(session.id.clone());
                }
                Err(e) => {
                    warn!(error = %e, "failed to prime a session");
                    return;
                }
            }
        }
    }

    /// Destroys sessions with no attached clients that have been idle past
    /// the configured TTL. `on_idle` fires exactly once per destroyed
    /// session, after it is removed from every map.
    pub async fn sweep(self: &Arc<Self>, on_idle: impl Fn(&SessionId)) {
        let ttl = Duration::from_secs(self.session_config.idle_ttl_secs);
        let candidates: Vec<(SessionId, Session)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect();

        for (id, session) in candidates {
            let snap = session.snapshot();
            let mixer_inactive = snap.lifecycle != Lifecycle::Transitioning;
            let idle = snap.audio_clients == 0
                && snap.event_clients == 0
                && mixer_inactive
                && snap.last_access_at.elapsed() > ttl;
            if !idle {
                continue;
            }
            session.destroy().await;
            self.sessions.write().await.remove(&id);
            self.fingerprints.write().await.retain(|_, e| e.session_id != id);
            let mut ips = self.by_ip.write().await;
            for entry in ips.values_mut() {
                if entry.orphan.as_ref() == Some(&id) {
                    entry.orphan = None;
                }
                if entry.last_healthy.as_ref() == Some(&id) {
                    entry.last_healthy = None;
                }
            }
            drop(ips);
            info!(session_id = %id, "session idle-swept");
            on_idle(&id);
        }

        self.fingerprints
            .write()
            .await
            .retain(|_, e| e.created_at.elapsed() < Duration::from_secs(self.session_config.fingerprint_ttl_secs));
    }

    pub async fn list_sessions(&self) -> Vec<(SessionId, crate::session::EngineSnapshot)> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(id, s)| (id.clone(), s.snapshot()))
            .collect()
    }

    pub fn feature_index(&self) -> Arc<FeatureIndex> {
        self.feature_index.clone()
    }

    pub fn explorer_config(&self) -> ExplorerConfig {
        self.explorer_config.clone()
    }

    pub fn latent_available(&self) -> bool {
        self.latent.is_available()
    }

    pub async fn stats(&self) -> Stats {
        let sessions = self.sessions.read().await;
        let mut audio_clients = 0;
        let mut event_clients = 0;
        for session in sessions.values() {
            let snap = session.snapshot();
            audio_clients += snap.audio_clients;
            event_clients += snap.event_clients;
        }
        Stats {
            session_count: sessions.len(),
            audio_clients,
            event_clients,
            primed_count: self.prewarmed.read().await.len(),
        }
    }

    /// Marks a session as an IP's orphan (has no event client) so a later
    /// request from the same address can reattach instead of creating a new
    /// session.
    pub async fn mark_orphan(&self, ip: IpAddr, session_id: SessionId) {
        let mut ips = self.by_ip.write().await;
        ips.entry(ip).or_default().orphan = Some(session_id);
    }

    pub async fn shutdown(self: &Arc<Self>) {
        info!("registry shutting down, destroying all sessions");
        let sessions: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        for session in sessions {
            session.destroy().await;
        }
        self.sessions.write().await.clear();
        self.fingerprints.write().await.clear();
        self.by_ip.write().await.clear();
        self.prewarmed.write().await.clear();
        let _ = std::fs::remove_file(platform::pid_file());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixer::MixerStatus;
    use async_trait::async_trait;
    use bytes::Bytes;
    use latentradio_proto::config::LatentConfig;
    use latentradio_proto::track::{FeatureVector, Track};
    use std::path::PathBuf;
    use tokio::sync::broadcast;

    struct FakeMixer;

    #[async_trait]
    impl Mixer for FakeMixer {
        async fn start(&self, _track: Track) -> Outcome<()> {
            Ok(())
        }
        async fn set_next(&self, _track: Track) -> Outcome<()> {
            Ok(())
        }
        async fn clear_next_slot(&self) -> Outcome<()> {
            Ok(())
        }
        async fn trigger_transition(&self) -> Outcome<()> {
            Ok(())
        }
        async fn status(&self) -> MixerStatus {
            MixerStatus::default()
        }
        fn subscribe_events(&self) -> broadcast::Receiver<crate::mixer::MixerEvent> {
            broadcast::channel(1).1
        }
        fn subscribe_pcm(&self) -> broadcast::Receiver<Bytes> {
            broadcast::channel(1).1
        }
    }

    fn track(id: &str) -> Track {
        Track {
            id: id.to_string(),
            title: id.to_string(),
            artist: "a".into(),
            album: "al".into(),
            year: None,
            cover_url: None,
            duration_secs: 180.0,
            path: PathBuf::from("/dev/null"),
            features: FeatureVector::new(),
        }
    }

    fn registry() -> Arc<Registry> {
        let index = Arc::new(FeatureIndex::new(vec![track(&"a".repeat(32)), track(&"b".repeat(32))]));
        let latent = LatentClient::spawn(LatentConfig { enabled: false, ..LatentConfig::default() });
        Registry::with_mixer_factory(
            index,
            ExplorerConfig::default(),
            SessionConfig::default(),
            MixerConfig::default(),
            Arc::new(|_| Arc::new(FakeMixer) as Arc<dyn Mixer>),
            latent,
        )
    }

    #[tokio::test]
    async fn fresh_create_when_nothing_resolves() {
        let registry = registry();
        let session = registry.resolve(ResolveParams::default(), false).await.unwrap();
        assert_eq!(registry.stats().await.session_count, 1);
        assert!(session.snapshot().current_track.is_some());
    }

    #[tokio::test]
    async fn unknown_fingerprint_fails_fast_without_fallback() {
        let registry = registry();
        let params = ResolveParams {
            fingerprint: Some(Fingerprint("deadbeefdeadbeef".to_string())),
            ..Default::default()
        };
        let err = registry.resolve(params, false).await.unwrap_err();
        assert_eq!(err, ErrorKind::FingerprintNotFound);
        assert_eq!(registry.stats().await.session_count, 0);
    }

    #[tokio::test]
    async fn sweep_destroys_only_idle_sessions() {
        let registry = registry();
        registry.resolve(ResolveParams::default(), false).await.unwrap();
        let mut swept = Vec::new();
        registry.sweep(|id| swept.push(id.clone())).await;
        assert!(swept.is_empty(), "fresh session has non-expired last_access_at");
    }
}
