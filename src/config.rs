use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::forward::{ForwardConfig, DEFAULT_QUEUE_CAPACITY};
use crate::ingest::SourceOptions;

const DEFAULT_OUTPUT_ROOT: &str = "data/sessions";
const DEFAULT_SOURCE: &str = "stub://demo";
const DEFAULT_CLASSIFIER: &str = "stub";
const DEFAULT_READ_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_FORWARD_TIMEOUT_SECS: u64 = 5;
const DEFAULT_COLLECTOR_ADDR: &str = "0.0.0.0:8000";
pub const DEFAULT_EDGE_ADDR: &str = "0.0.0.0:5000";

#[derive(Debug, Deserialize, Default)]
struct MonitorConfigFile {
    output_root: Option<PathBuf>,
    respondent: Option<String>,
    session_label: Option<String>,
    classifier: Option<String>,
    video: Option<bool>,
    source: Option<SourceConfigFile>,
    forward: Option<ForwardConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    uri: Option<String>,
    read_timeout_ms: Option<u64>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ForwardConfigFile {
    url: Option<String>,
    queue_capacity: Option<usize>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CollectorConfigFile {
    addr: Option<String>,
    ws_addr: Option<String>,
    root: Option<PathBuf>,
    global_log: Option<bool>,
}

/// Settings for one monitoring run.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub output_root: PathBuf,
    pub respondent: Option<String>,
    pub session_label: Option<String>,
    pub classifier: String,
    pub video: bool,
    pub source: SourceSettings,
    pub forward: ForwardSettings,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub uri: String,
    pub read_timeout: Duration,
    pub target_fps: u32,
}

#[derive(Debug, Clone)]
pub struct ForwardSettings {
    pub url: Option<String>,
    pub queue_capacity: usize,
    pub timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from_file(MonitorConfigFile::default())
    }
}

impl MonitorConfig {
    /// Defaults, then the file named by `ENGAGEMENT_CONFIG`, then `ENGAGEMENT_*`
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let file_cfg: MonitorConfigFile = match env_value("ENGAGEMENT_CONFIG") {
            Some(path) => read_config_file(Path::new(&path))?,
            None => MonitorConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: MonitorConfigFile) -> Self {
        let source = file.source.unwrap_or_default();
        let forward = file.forward.unwrap_or_default();
        Self {
            output_root: file
                .output_root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_ROOT)),
            respondent: file.respondent,
            session_label: file.session_label,
            classifier: file
                .classifier
                .unwrap_or_else(|| DEFAULT_CLASSIFIER.to_string()),
            video: file.video.unwrap_or(false),
            source: SourceSettings {
                uri: source.uri.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
                read_timeout: Duration::from_millis(
                    source.read_timeout_ms.unwrap_or(DEFAULT_READ_TIMEOUT_MS),
                ),
                target_fps: source.target_fps.unwrap_or(0),
            },
            forward: ForwardSettings {
                url: forward.url.filter(|url| !url.trim().is_empty()),
                queue_capacity: forward.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
                timeout: Duration::from_secs(
                    forward.timeout_secs.unwrap_or(DEFAULT_FORWARD_TIMEOUT_SECS),
                ),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(root) = env_value("ENGAGEMENT_OUTPUT_ROOT") {
            self.output_root = PathBuf::from(root);
        }
        if let Some(source) = env_value("ENGAGEMENT_SOURCE") {
            self.source.uri = source;
        }
        if let Some(respondent) = env_value("ENGAGEMENT_RESPONDENT") {
            self.respondent = Some(respondent);
        }
        if let Some(url) = env_value("ENGAGEMENT_FORWARD_URL") {
            self.forward.url = Some(url);
        }
        if let Some(classifier) = env_value("ENGAGEMENT_CLASSIFIER") {
            self.classifier = classifier;
        }
        if let Some(video) = env_value("ENGAGEMENT_VIDEO") {
            self.video = parse_bool(&video)
                .ok_or_else(|| anyhow!("ENGAGEMENT_VIDEO must be true/false, got '{}'", video))?;
        }
        if let Some(queue) = env_value("ENGAGEMENT_FORWARD_QUEUE") {
            self.forward.queue_capacity = queue
                .parse()
                .map_err(|_| anyhow!("ENGAGEMENT_FORWARD_QUEUE must be a positive integer"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if let Some(respondent) = &self.respondent {
            crate::validate_identifier("respondent", respondent)?;
        }
        if let Some(label) = &self.session_label {
            crate::validate_identifier("session", label)?;
        }
        if self.source.uri.trim().is_empty() {
            return Err(anyhow!("capture source must not be empty"));
        }
        if self.source.read_timeout.is_zero() {
            return Err(anyhow!("source read timeout must be greater than zero"));
        }
        if self.forward.queue_capacity == 0 {
            return Err(anyhow!("forward queue capacity must be greater than zero"));
        }
        if self.output_root.as_os_str().is_empty() {
            return Err(anyhow!("output root must not be empty"));
        }
        Ok(())
    }

    pub fn source_options(&self) -> SourceOptions {
        SourceOptions {
            read_timeout: self.source.read_timeout,
            target_fps: self.source.target_fps,
        }
    }

    pub fn forward_config(&self) -> ForwardConfig {
        ForwardConfig {
            url: self.forward.url.clone(),
            queue_capacity: self.forward.queue_capacity,
            timeout: self.forward.timeout,
        }
    }

    /// Edge ingest settings sharing this config's output root and video flag.
    pub fn edge_config(&self, addr: &str) -> EdgeConfig {
        EdgeConfig {
            addr: addr.to_string(),
            output_root: self.output_root.clone(),
            video: self.video,
        }
    }
}

/// Settings for the edge ingest server that cameras push frames to.
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub addr: String,
    pub output_root: PathBuf,
    pub video: bool,
}

impl EdgeConfig {
    pub fn validate(&self) -> Result<()> {
        self.addr
            .parse::<SocketAddr>()
            .map_err(|_| anyhow!("invalid edge listen address '{}'", self.addr))?;
        if self.output_root.as_os_str().is_empty() {
            return Err(anyhow!("output root must not be empty"));
        }
        Ok(())
    }
}

/// Settings for the collector service.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub addr: String,
    /// Optional WebSocket listener for streaming clients.
    pub ws_addr: Option<String>,
    pub root: PathBuf,
    /// Also append every result to `<root>/logs/engagement_log.csv`.
    pub global_log: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self::from_file(CollectorConfigFile::default())
    }
}

impl CollectorConfig {
    /// Defaults, then the file named by `ENGAGEMENT_COLLECTOR_CONFIG`, then
    /// `ENGAGEMENT_COLLECTOR_*` environment overrides.
    pub fn load() -> Result<Self> {
        let file_cfg: CollectorConfigFile = match env_value("ENGAGEMENT_COLLECTOR_CONFIG") {
            Some(path) => read_config_file(Path::new(&path))?,
            None => CollectorConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CollectorConfigFile) -> Self {
        Self {
            addr: file
                .addr
                .unwrap_or_else(|| DEFAULT_COLLECTOR_ADDR.to_string()),
            ws_addr: file.ws_addr.filter(|addr| !addr.trim().is_empty()),
            root: file.root.unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_ROOT)),
            global_log: file.global_log.unwrap_or(false),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_value("ENGAGEMENT_COLLECTOR_ADDR") {
            self.addr = addr;
        }
        if let Some(addr) = env_value("ENGAGEMENT_COLLECTOR_WS_ADDR") {
            self.ws_addr = Some(addr);
        }
        if let Some(root) = env_value("ENGAGEMENT_COLLECTOR_ROOT") {
            self.root = PathBuf::from(root);
        }
        if let Some(global) = env_value("ENGAGEMENT_COLLECTOR_GLOBAL_LOG") {
            self.global_log = parse_bool(&global).ok_or_else(|| {
                anyhow!("ENGAGEMENT_COLLECTOR_GLOBAL_LOG must be true/false, got '{}'", global)
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.addr
            .parse::<SocketAddr>()
            .map_err(|_| anyhow!("invalid collector address '{}'", self.addr))?;
        if let Some(ws_addr) = &self.ws_addr {
            ws_addr
                .parse::<SocketAddr>()
                .map_err(|_| anyhow!("invalid collector websocket address '{}'", ws_addr))?;
        }
        if self.root.as_os_str().is_empty() {
            return Err(anyhow!("collector root must not be empty"));
        }
        Ok(())
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
