//! Filesystem locations and environment variable names.
//!
//! XDG-style paths on Unix,
//! `dirs`-provided locations elsewhere, plus a couple of env var names the
//! daemon honors at startup.

use std::path::PathBuf;

/// Overrides the tracing `EnvFilter` directive (falls back to `RUST_LOG`).
pub const ENV_LOG: &str = "LATENTRADIO_LOG";

/// Overrides the sqlite catalog connection string.
pub const ENV_DATABASE_URL: &str = "LATENTRADIO_DATABASE_URL";

pub fn data_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join("latentradio")
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("latentradio")
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("latentradio")
    }
    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("latentradio")
    }
}

pub fn cache_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".cache")
            .join("latentradio")
    }
    #[cfg(windows)]
    {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("latentradio")
    }
}

pub fn pid_file() -> PathBuf {
    data_dir().join("server.pid")
}

pub fn default_catalog_path() -> PathBuf {
    data_dir().join("catalog.sqlite3")
}

pub fn default_log_path() -> PathBuf {
    data_dir().join("server.log")
}
