use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;

const DEFAULT_IMAGE: &str = "berth/automation:latest";
const DEFAULT_PORT: u16 = 5000;
const DEFAULT_TASK_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_READY_TIMEOUT_SECS: u64 = 60;
const DEFAULT_RETRIES: u32 = 2;
const DEFAULT_RETRY_INTERVAL_MS: u64 = 5000;
const DEFAULT_SETTLE_MS: u64 = 2000;
const DEFAULT_LOG_MAX_LINES: usize = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub image: String,
    pub preferred_port: u16,
    pub container_port: u16,
    pub host: String,
    pub runtime_bin: String,
    /// Extra flags (volumes, env) passed through to the runtime `run` command, split with
    /// shell quoting rules.
    pub runtime_args: Vec<String>,
    pub user: String,
    pub store_dir: PathBuf,
    pub task_ttl: Duration,
    pub ready_timeout_secs: u64,
    pub retries: u32,
    pub retry_interval: Duration,
    pub settle: Duration,
    pub health_path: String,
    pub log_dir: Option<PathBuf>,
    pub log_max_lines: usize,
    pub stop_on_exit: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            preferred_port: DEFAULT_PORT,
            container_port: DEFAULT_PORT,
            host: "127.0.0.1".to_string(),
            runtime_bin: "docker".to_string(),
            runtime_args: Vec::new(),
            user: "0".to_string(),
            store_dir: default_data_dir().join("store"),
            task_ttl: Duration::from_secs(DEFAULT_TASK_TTL_SECS),
            ready_timeout_secs: DEFAULT_READY_TIMEOUT_SECS,
            retries: DEFAULT_RETRIES,
            retry_interval: Duration::from_millis(DEFAULT_RETRY_INTERVAL_MS),
            settle: Duration::from_millis(DEFAULT_SETTLE_MS),
            health_path: "/".to_string(),
            log_dir: None,
            log_max_lines: DEFAULT_LOG_MAX_LINES,
            stop_on_exit: false,
        }
    }
}

/// Optional YAML overlay. Every key is optional; unknown keys are rejected so typos surface.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub image: Option<String>,
    pub port: Option<u16>,
    pub container_port: Option<u16>,
    pub host: Option<String>,
    pub runtime: Option<String>,
    pub runtime_args: Option<String>,
    pub user: Option<String>,
    pub store_dir: Option<PathBuf>,
    pub task_ttl_secs: Option<u64>,
    pub ready_timeout_secs: Option<u64>,
    pub retries: Option<u32>,
    pub retry_interval_ms: Option<u64>,
    pub settle_ms: Option<u64>,
    pub health_path: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub log_max_lines: Option<usize>,
    pub stop_on_exit: Option<bool>,
}

fn default_data_dir() -> PathBuf {
    std::env::var("HOME")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(|h| PathBuf::from(h).join(".berth"))
        .unwrap_or_else(|| PathBuf::from(".berth"))
}

fn non_blank(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn nonzero_port(p: u16) -> Option<u16> {
    (p != 0).then_some(p)
}

fn split_args(raw: &str) -> anyhow::Result<Vec<String>> {
    shell_words::split(raw).with_context(|| format!("parse runtime args `{raw}`"))
}

impl AgentConfig {
    /// Defaults, then the YAML file named by `BERTH_CONFIG`, then `BERTH_*` variables.
    pub fn load() -> anyhow::Result<Self> {
        let file = match non_blank(std::env::var("BERTH_CONFIG").ok()) {
            Some(path) => Some(read_file_config(Path::new(&path))?),
            None => None,
        };
        Self::from_sources(file, |k| std::env::var(k).ok())
    }

    pub fn from_sources(
        file: Option<FileConfig>,
        env: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let mut cfg = Self::default();
        if let Some(f) = file {
            cfg.apply_file(f)?;
        }
        cfg.apply_env(env)?;
        Ok(cfg)
    }

    fn apply_file(&mut self, f: FileConfig) -> anyhow::Result<()> {
        if let Some(v) = non_blank(f.image) {
            self.image = v;
        }
        if let Some(v) = f.port.and_then(nonzero_port) {
            self.preferred_port = v;
        }
        if let Some(v) = f.container_port.and_then(nonzero_port) {
            self.container_port = v;
        }
        if let Some(v) = non_blank(f.host) {
            self.host = v;
        }
        if let Some(v) = non_blank(f.runtime) {
            self.runtime_bin = v;
        }
        if let Some(v) = f.runtime_args {
            self.runtime_args = split_args(&v)?;
        }
        if let Some(v) = non_blank(f.user) {
            self.user = v;
        }
        if let Some(v) = f.store_dir {
            self.store_dir = v;
        }
        if let Some(v) = f.task_ttl_secs {
            self.task_ttl = clamp_ttl(v);
        }
        if let Some(v) = f.ready_timeout_secs {
            self.ready_timeout_secs = v.min(600);
        }
        if let Some(v) = f.retries {
            self.retries = v.min(10);
        }
        if let Some(v) = f.retry_interval_ms {
            self.retry_interval = Duration::from_millis(v.min(60_000));
        }
        if let Some(v) = f.settle_ms {
            self.settle = Duration::from_millis(v.min(60_000));
        }
        if let Some(v) = non_blank(f.health_path) {
            self.health_path = v;
        }
        if let Some(v) = f.log_dir {
            self.log_dir = Some(v);
        }
        if let Some(v) = f.log_max_lines {
            self.log_max_lines = v.clamp(100, 50_000);
        }
        if let Some(v) = f.stop_on_exit {
            self.stop_on_exit = v;
        }
        Ok(())
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        let var = |name: &str| non_blank(env(name));
        let num = |name: &str| var(name).and_then(|v| v.parse::<u64>().ok());

        if let Some(v) = var("BERTH_IMAGE") {
            self.image = v;
        }
        if let Some(v) = var("BERTH_PORT").and_then(|v| v.parse::<u16>().ok()).and_then(nonzero_port) {
            self.preferred_port = v;
        }
        if let Some(v) = var("BERTH_CONTAINER_PORT")
            .and_then(|v| v.parse::<u16>().ok())
            .and_then(nonzero_port)
        {
            self.container_port = v;
        }
        if let Some(v) = var("BERTH_HOST") {
            self.host = v;
        }
        if let Some(v) = var("BERTH_RUNTIME") {
            self.runtime_bin = v;
        }
        if let Some(v) = var("BERTH_RUNTIME_ARGS") {
            self.runtime_args = split_args(&v)?;
        }
        if let Some(v) = var("BERTH_USER") {
            self.user = v;
        }
        if let Some(v) = var("BERTH_STORE_DIR") {
            self.store_dir = PathBuf::from(v);
        }
        if let Some(v) = num("BERTH_TASK_TTL_SECS") {
            self.task_ttl = clamp_ttl(v);
        }
        if let Some(v) = num("BERTH_READY_TIMEOUT_SECS") {
            self.ready_timeout_secs = v.min(600);
        }
        if let Some(v) = num("BERTH_RETRIES") {
            self.retries = v.min(10) as u32;
        }
        if let Some(v) = num("BERTH_RETRY_INTERVAL_MS") {
            self.retry_interval = Duration::from_millis(v.min(60_000));
        }
        if let Some(v) = num("BERTH_SETTLE_MS") {
            self.settle = Duration::from_millis(v.min(60_000));
        }
        if let Some(v) = var("BERTH_HEALTH_PATH") {
            self.health_path = v;
        }
        if let Some(v) = var("BERTH_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = num("BERTH_LOG_MAX_LINES") {
            self.log_max_lines = (v as usize).clamp(100, 50_000);
        }
        if let Some(v) = var("BERTH_STOP_ON_EXIT").and_then(|v| parse_bool(&v)) {
            self.stop_on_exit = v;
        }
        Ok(())
    }
}

fn clamp_ttl(secs: u64) -> Duration {
    Duration::from_secs(secs.clamp(1, 30 * 24 * 60 * 60))
}

pub fn read_file_config(path: &Path) -> anyhow::Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parse config file {}", path.display()))
}
