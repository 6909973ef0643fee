use std::{fs, path::Path, time::Duration};

use anyhow::{anyhow, Context};
use serde::Deserialize;
use tracing::warn;
use url::Url;

pub const DEFAULT_CONFIG_FILE: &str = "client.toml";

const STREAM_PATH: &str = "stream";
const MESSAGE_PATH: &str = "message";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host_url: String,
    /// Script runs a cached message may go unreferenced before eviction.
    pub max_cached_message_age: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Consecutive failed attempts tolerated before giving up for good.
    pub max_retries: u32,
    pub connect_timeout_ms: u64,
    pub fetch_timeout_ms: u64,
    pub inbound_queue_capacity: usize,
    pub event_queue_capacity: usize,
    pub max_consecutive_decode_errors: u32,
    pub max_reorder_window: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host_url: "http://127.0.0.1:8501".into(),
            max_cached_message_age: 2,
            retry_initial_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            max_retries: 10,
            connect_timeout_ms: 15_000,
            fetch_timeout_ms: 10_000,
            inbound_queue_capacity: 256,
            event_queue_capacity: 1024,
            max_consecutive_decode_errors: 5,
            max_reorder_window: 1024,
        }
    }
}

impl ClientConfig {
    pub fn retry_initial_delay(&self) -> Duration {
        Duration::from_millis(self.retry_initial_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn host_base_url(&self) -> anyhow::Result<Url> {
        let mut url = Url::parse(self.host_url.trim())
            .with_context(|| format!("invalid host_url '{}'", self.host_url))?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }

    /// WebSocket endpoint of the host's message stream.
    pub fn stream_url(&self) -> anyhow::Result<Url> {
        let mut url = self.host_base_url()?.join(STREAM_PATH)?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => return Err(anyhow!("host_url must use http or https, got '{other}'")),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot switch '{url}' to {scheme}"))?;
        Ok(url)
    }

    /// HTTP endpoint used to fetch evicted messages by hash.
    pub fn message_url(&self) -> anyhow::Result<Url> {
        Ok(self.host_base_url()?.join(MESSAGE_PATH)?)
    }
}

pub fn load_config() -> ClientConfig {
    load_config_from(Path::new(DEFAULT_CONFIG_FILE), |key| std::env::var(key).ok())
}

pub fn load_config_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> ClientConfig {
    // Keys missing from the file keep their defaults.
    let mut config = match fs::read_to_string(path) {
        Ok(raw) => toml::from_str::<ClientConfig>(&raw).unwrap_or_else(|err| {
            warn!(
                path = %path.display(),
                "config: ignoring unreadable config file: {err}"
            );
            ClientConfig::default()
        }),
        Err(_) => ClientConfig::default(),
    };

    apply_env_overrides(&mut config, env);
    config
}

fn apply_env_overrides(config: &mut ClientConfig, env: impl Fn(&str) -> Option<String>) {
    if let Some(v) = env("APP__HOST_URL") {
        config.host_url = v;
    }
    override_parsed(&env, "APP__MAX_CACHED_MESSAGE_AGE", &mut config.max_cached_message_age);
    override_parsed(&env, "APP__RETRY_INITIAL_DELAY_MS", &mut config.retry_initial_delay_ms);
    override_parsed(&env, "APP__RETRY_MAX_DELAY_MS", &mut config.retry_max_delay_ms);
    override_parsed(&env, "APP__MAX_RETRIES", &mut config.max_retries);
    override_parsed(&env, "APP__CONNECT_TIMEOUT_MS", &mut config.connect_timeout_ms);
    override_parsed(&env, "APP__FETCH_TIMEOUT_MS", &mut config.fetch_timeout_ms);
    override_parsed(&env, "APP__INBOUND_QUEUE_CAPACITY", &mut config.inbound_queue_capacity);
    override_parsed(&env, "APP__EVENT_QUEUE_CAPACITY", &mut config.event_queue_capacity);
    override_parsed(
        &env,
        "APP__MAX_CONSECUTIVE_DECODE_ERRORS",
        &mut config.max_consecutive_decode_errors,
    );
    override_parsed(&env, "APP__MAX_REORDER_WINDOW", &mut config.max_reorder_window);
}

fn override_parsed<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    let Some(raw) = env(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) => *target = parsed,
        Err(_) => warn!(key, value = %raw, "config: ignoring unparsable override"),
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
