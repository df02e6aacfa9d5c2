//! Load config from file and environment, plus the study-session file.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use studyshare_core::SectionVideo;

/// Daemon configuration. File: $STUDYSHARE_CONFIG, ~/.config/studyshare/config.toml
/// or /etc/studyshare/config.toml. Env overrides: STUDYSHARE_<FIELD>.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Chunk store root (default ~/.local/share/studyshare).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Name shown to nearby endpoints (default: hostname).
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// Discovery UDP port (default 45678).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Transport TCP port (default 45679).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Largest inbound payload accepted from a peer (default 512 MiB).
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: u64,
    #[serde(default = "default_max_integrity_failures")]
    pub max_integrity_failures: u32,
    /// Connect to every newly discovered endpoint (default true).
    #[serde(default = "default_auto_connect")]
    pub auto_connect: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// full, compact or json.
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Study session description (section title and videos).
    #[serde(default)]
    pub session_file: Option<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".local/share/studyshare"),
        None => PathBuf::from("/var/lib/studyshare"),
    }
}
fn default_display_name() -> String {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "studyshare".to_string())
}
fn default_discovery_port() -> u16 {
    45678
}
fn default_transport_port() -> u16 {
    45679
}
fn default_connect_timeout_secs() -> u64 {
    30
}
fn default_read_timeout_secs() -> u64 {
    60
}
fn default_max_payload_bytes() -> u64 {
    512 * 1024 * 1024
}
fn default_max_integrity_failures() -> u32 {
    studyshare_core::integrity::DEFAULT_MAX_INTEGRITY_FAILURES
}
fn default_auto_connect() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "full".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            display_name: default_display_name(),
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            max_payload_bytes: default_max_payload_bytes(),
            max_integrity_failures: default_max_integrity_failures(),
            auto_connect: default_auto_connect(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            session_file: None,
        }
    }
}

/// Load config: default, then `explicit` or the first config file found, then env vars.
/// A file that exists but does not parse is an error rather than silently ignored.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let found = match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => config_paths().into_iter().find(|p| p.exists()),
    };
    let mut c = match found {
        Some(p) => load_file(&p)?,
        None => Config::default(),
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

pub fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str::<Config>(&s).with_context(|| format!("parsing config {}", path.display()))
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = std::env::var_os("STUDYSHARE_CONFIG") {
        out.push(PathBuf::from(p));
    }
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/studyshare/config.toml"));
    }
    out.push(PathBuf::from("/etc/studyshare/config.toml"));
    out
}

/// Env overrides. Unparseable values are ignored.
fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("STUDYSHARE_DATA_DIR") {
        c.data_dir = PathBuf::from(s);
    }
    if let Some(s) = var("STUDYSHARE_DISPLAY_NAME") {
        c.display_name = s;
    }
    if let Some(p) = var("STUDYSHARE_DISCOVERY_PORT").and_then(|s| s.parse().ok()) {
        c.discovery_port = p;
    }
    if let Some(p) = var("STUDYSHARE_TRANSPORT_PORT").and_then(|s| s.parse().ok()) {
        c.transport_port = p;
    }
    if let Some(n) = var("STUDYSHARE_CONNECT_TIMEOUT_SECS").and_then(|s| s.parse().ok()) {
        c.connect_timeout_secs = n;
    }
    if let Some(n) = var("STUDYSHARE_READ_TIMEOUT_SECS").and_then(|s| s.parse().ok()) {
        c.read_timeout_secs = n;
    }
    if let Some(n) = var("STUDYSHARE_MAX_PAYLOAD_BYTES").and_then(|s| s.parse().ok()) {
        c.max_payload_bytes = n;
    }
    if let Some(n) = var("STUDYSHARE_MAX_INTEGRITY_FAILURES").and_then(|s| s.parse().ok()) {
        c.max_integrity_failures = n;
    }
    if let Some(b) = var("STUDYSHARE_AUTO_CONNECT").and_then(|s| s.parse().ok()) {
        c.auto_connect = b;
    }
    if let Some(s) = var("STUDYSHARE_LOG_LEVEL") {
        c.log_level = s;
    }
    if let Some(s) = var("STUDYSHARE_LOG_FORMAT") {
        c.log_format = s;
    }
    if let Some(s) = var("STUDYSHARE_SESSION_FILE") {
        c.session_file = Some(PathBuf::from(s));
    }
}

/// The study session: one section and its ordered videos.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SessionFile {
    pub section_title: String,
    #[serde(default)]
    pub videos: Vec<SectionVideo>,
}

pub fn load_session(path: &Path) -> anyhow::Result<SessionFile> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading session file {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing session file {}", path.display()))
}
