use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub latent: LatentConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub mixer: MixerConfig,
    #[serde(default)]
    pub explorer: ExplorerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Rejects request bodies above this size with `payload-too-large`.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_path")]
    pub sqlite_path: PathBuf,
    /// Rows fetched per batch while building the in-memory Feature Index.
    #[serde(default = "default_build_batch_size")]
    pub build_batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatentConfig {
    #[serde(default = "default_latent_enabled")]
    pub enabled: bool,
    #[serde(default = "default_latent_binary")]
    pub binary_path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_latent_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
    #[serde(default = "default_fingerprint_ttl_secs")]
    pub fingerprint_ttl_secs: u64,
    #[serde(default = "default_history_len")]
    pub history_len: usize,
    #[serde(default = "default_prewarm_pool_size")]
    pub prewarm_pool_size: usize,
    #[serde(default = "default_resolution")]
    pub default_resolution: String,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixerConfig {
    #[serde(default = "default_crossfade_lead_ms")]
    pub crossfade_lead_ms: u64,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplorerConfig {
    #[serde(default = "default_samples_per_direction")]
    pub samples_per_direction: usize,
    #[serde(default = "default_direction_families")]
    pub enabled_families: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_catalog_path(),
            build_batch_size: default_build_batch_size(),
        }
    }
}

impl Default for LatentConfig {
    fn default() -> Self {
        Self {
            enabled: default_latent_enabled(),
            binary_path: default_latent_binary(),
            args: Vec::new(),
            request_timeout_ms: default_latent_timeout_ms(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl_secs(),
            fingerprint_ttl_secs: default_fingerprint_ttl_secs(),
            history_len: default_history_len(),
            prewarm_pool_size: default_prewarm_pool_size(),
            default_resolution: default_resolution(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            crossfade_lead_ms: default_crossfade_lead_ms(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
        }
    }
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            samples_per_direction: default_samples_per_direction(),
            enabled_families: default_direction_families(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7878
}
fn default_max_body_bytes() -> usize {
    64 * 1024
}
fn default_catalog_path() -> PathBuf {
    platform::default_catalog_path()
}
fn default_build_batch_size() -> usize {
    2048
}
fn default_latent_enabled() -> bool {
    true
}
fn default_latent_binary() -> PathBuf {
    PathBuf::from("latent-service")
}
fn default_latent_timeout_ms() -> u64 {
    2_000
}
fn default_idle_ttl_secs() -> u64 {
    3_600
}
fn default_fingerprint_ttl_secs() -> u64 {
    3_600 * 12
}
fn default_history_len() -> usize {
    50
}
fn default_prewarm_pool_size() -> usize {
    2
}
fn default_resolution() -> String {
    "adaptive".to_string()
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_crossfade_lead_ms() -> u64 {
    4_000
}
fn default_sample_rate() -> u32 {
    44_100
}
fn default_channels() -> u16 {
    2
}
fn default_samples_per_direction() -> usize {
    5
}
fn default_direction_families() -> Vec<String> {
    vec![
        "acoustic".to_string(),
        "pca".to_string(),
        "latent".to_string(),
        "outlier".to_string(),
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            catalog: CatalogConfig::default(),
            latent: LatentConfig::default(),
            session: SessionConfig::default(),
            mixer: MixerConfig::default(),
            explorer: ExplorerConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        let mut config = if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            config
        } else {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)?
        };

        if let Ok(url) = std::env::var(platform::ENV_DATABASE_URL) {
            config.apply_database_url(&url);
        }

        Ok(config)
    }

    fn apply_database_url(&mut self, url: &str) {
        self.catalog.sqlite_path = PathBuf::from(url);
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 7878);
        assert_eq!(config.server.bind_address, "127.0.0.1");
        assert!(config.latent.enabled);
        assert_eq!(config.session.default_resolution, "adaptive");
        assert_eq!(config.mixer.channels, 2);
        assert!(config.explorer.enabled_families.contains(&"pca".to_string()));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.server.port, config.server.port);
        assert_eq!(parsed.session.idle_ttl_secs, config.session.idle_ttl_secs);
    }

    /// `load()` routes `LATENTRADIO_DATABASE_URL` through this same
    /// override, regardless of whether the on-disk config was freshly
    /// defaulted. Tested against the override directly rather than through
    /// `load()`, since mutating the process-global env var isn't safe from
    /// a parallel test run.
    #[test]
    fn database_url_override_replaces_catalog_path() {
        let mut config = Config::default();
        config.apply_database_url("/tmp/latentradio-test-catalog.sqlite3");
        assert_eq!(config.catalog.sqlite_path, PathBuf::from("/tmp/latentradio-test-catalog.sqlite3"));
    }
}
