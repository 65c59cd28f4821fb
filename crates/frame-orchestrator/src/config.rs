use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    pub redis_url: String,

    #[serde(default = "default_upstream_stream")]
    pub upstream_stream: String,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    #[serde(default)]
    pub consumer_id: Option<String>,
    #[serde(default = "default_dlq_stream")]
    pub dlq_stream: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,
    #[serde(default = "default_claim_idle_ms")]
    pub claim_idle_ms: u64,

    #[serde(
        default = "default_heartbeat_timeout",
        deserialize_with = "frame_helpers::de::deserialize_duration"
    )]
    pub heartbeat_timeout: Duration,
    #[serde(
        default = "default_health_tick",
        deserialize_with = "frame_helpers::de::deserialize_duration"
    )]
    pub health_tick: Duration,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(
        default = "default_circuit_cooldown",
        deserialize_with = "frame_helpers::de::deserialize_duration"
    )]
    pub circuit_cooldown: Duration,
    #[serde(
        default = "default_circuit_cooldown_cap",
        deserialize_with = "frame_helpers::de::deserialize_duration"
    )]
    pub circuit_cooldown_cap: Duration,
    #[serde(
        default = "default_eviction_grace",
        deserialize_with = "frame_helpers::de::deserialize_duration"
    )]
    pub eviction_grace: Duration,

    #[serde(default = "default_max_routing_attempts")]
    pub max_routing_attempts: u32,
    #[serde(default = "default_max_dispatch_retries")]
    pub max_dispatch_retries: u32,
    #[serde(default = "default_queue_cap_multiplier")]
    pub queue_cap_multiplier: u32,
    #[serde(default = "default_retry_park_cap")]
    pub retry_park_cap: usize,
    #[serde(
        default = "default_housekeeping_interval",
        deserialize_with = "frame_helpers::de::deserialize_duration"
    )]
    pub housekeeping_interval: Duration,
    #[serde(
        default = "default_shutdown_grace",
        deserialize_with = "frame_helpers::de::deserialize_duration"
    )]
    pub shutdown_grace: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = parse_config_path_arg(env::args().skip(1))?
            .or_else(resolve_config_path)
            .context(
                "orchestrator config path not found (FRAME_ORCHESTRATOR_CONFIG_PATH or frame-orchestrator.yaml)",
            )?;

        let mut config = load_config_yaml(&config_path)?;
        config.normalize()?;
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) -> Result<()> {
        self.listen = trim_owned(self.listen.clone());
        self.redis_url = trim_owned(self.redis_url.clone());
        self.upstream_stream = trim_owned(self.upstream_stream.clone());
        self.consumer_group = trim_owned(self.consumer_group.clone());
        self.dlq_stream = trim_owned(self.dlq_stream.clone());

        if self.listen.is_empty() {
            self.listen = default_listen();
        }
        if self.redis_url.is_empty() {
            bail!("orchestrator config missing `redis_url`");
        }
        if self.upstream_stream.is_empty() {
            self.upstream_stream = default_upstream_stream();
        }
        if self.consumer_group.is_empty() {
            self.consumer_group = default_consumer_group();
        }
        if self.dlq_stream.is_empty() {
            self.dlq_stream = default_dlq_stream();
        }

        self.batch_size = self.batch_size.max(1);
        self.max_routing_attempts = self.max_routing_attempts.max(1);
        self.max_dispatch_retries = self.max_dispatch_retries.max(1);
        self.queue_cap_multiplier = self.queue_cap_multiplier.max(1);
        self.retry_park_cap = self.retry_park_cap.max(1);
        self.failure_threshold = self.failure_threshold.max(1);

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        Ok(())
    }

    pub fn consumer_id(&self) -> String {
        self.consumer_id.clone().unwrap_or_else(|| {
            format!("frame-orchestrator-{}", uuid::Uuid::new_v4())
        })
    }
}

fn parse_config_path_arg<I>(mut args: I) -> Result<Option<PathBuf>>
where
    I: Iterator<Item = String>,
{
    let first = args.next();
    let second = args.next();

    if let Some(arg) = second {
        bail!("too many arguments: {arg} (usage: frame-orchestrator [config-path])");
    }

    if matches!(first.as_deref(), Some("-h" | "--help")) {
        bail!("usage: frame-orchestrator [config-path]");
    }

    Ok(first.map(PathBuf::from))
}

fn load_config_yaml(path: &Path) -> Result<Config> {
    let raw = std::fs::read(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_yaml::from_slice(&raw)
        .with_context(|| format!("failed to parse YAML config {}", path.display()))
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Some(path) = non_empty_env("FRAME_ORCHESTRATOR_CONFIG_PATH") {
        return Some(PathBuf::from(path));
    }

    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let cwd_yaml = cwd.join("frame-orchestrator.yaml");
    if cwd_yaml.exists() {
        return Some(cwd_yaml);
    }

    let cwd_yml = cwd.join("frame-orchestrator.yml");
    if cwd_yml.exists() {
        return Some(cwd_yml);
    }

    let legacy_path = cwd.join("Config.yaml");
    if legacy_path.exists() {
        return Some(legacy_path);
    }

    None
}

fn default_listen() -> String {
    "0.0.0.0:7700".to_string()
}

fn default_upstream_stream() -> String {
    "frames:ingest".to_string()
}

fn default_consumer_group() -> String {
    "frame-orchestrator".to_string()
}

fn default_dlq_stream() -> String {
    "frames:dlq".to_string()
}

fn default_batch_size() -> usize {
    64
}

fn default_block_ms() -> u64 {
    500
}

fn default_claim_idle_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_health_tick() -> Duration {
    Duration::from_secs(1)
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_circuit_cooldown() -> Duration {
    Duration::from_secs(30)
}

fn default_circuit_cooldown_cap() -> Duration {
    Duration::from_secs(300)
}

fn default_eviction_grace() -> Duration {
    Duration::from_secs(120)
}

fn default_max_routing_attempts() -> u32 {
    4
}

fn default_max_dispatch_retries() -> u32 {
    3
}

fn default_queue_cap_multiplier() -> u32 {
    2
}

fn default_retry_park_cap() -> usize {
    10_000
}

fn default_housekeeping_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(30)
}

fn trim_owned(value: String) -> String {
    value.trim().to_string()
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    })
}
