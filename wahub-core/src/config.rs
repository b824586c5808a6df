use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct HubConfig {
    pub service: ServiceConfig,
    pub http: HttpConfig,
    pub storage: StorageConfig,
    pub webhook: WebhookConfig,
    pub media: MediaConfig,
    pub pacing: PacingConfig,
    pub retry: RetryConfig,
    pub lifecycle: LifecycleConfig,
    pub sidecar: SidecarConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    /// Process-wide secret every mutating request must carry as `apikey`.
    pub api_key: String,
    pub body_limit_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4001,
            api_key: String::new(),
            body_limit_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub configs_dir: String,
    pub sessions_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            configs_dir: "./configs".to_string(),
            sessions_dir: "./sessions".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn configs_path(&self) -> PathBuf {
        expand(&self.configs_dir)
    }

    pub fn sessions_path(&self) -> PathBuf {
        expand(&self.sessions_dir)
    }
}

fn expand(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(e) => {
            tracing::warn!(path = raw, error = %e, "Failed to expand path, using it verbatim");
            PathBuf::from(raw)
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WebhookConfig {
    pub timeout_ms: u64,
    pub user_agent: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            user_agent: "WhatsApp-Bot-Multi/2.0".to_string(),
        }
    }
}

impl WebhookConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MediaConfig {
    pub max_file_size: u64,
    pub download_timeout_ms: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            max_file_size: 50 * 1024 * 1024,
            download_timeout_ms: 30_000,
        }
    }
}

/// Human-pacing constants for outbound sends. These are heuristic tuning,
/// so every value is overridable.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PacingConfig {
    pub simulate_typing: bool,
    pub per_char_ms: u64,
    pub min_base_ms: u64,
    pub max_base_ms: u64,
    pub cap_ms: u64,
    pub media_delay_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            simulate_typing: true,
            per_char_ms: 50,
            min_base_ms: 3_000,
            max_base_ms: 7_000,
            cap_ms: 12_000,
            media_delay_ms: 3_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LifecycleConfig {
    pub reconnect_delay_ms: u64,
    pub reinit_delay_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 10_000,
            reinit_delay_ms: 5_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SidecarConfig {
    pub url: String,
    pub request_timeout_ms: u64,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9876".to_string(),
            request_timeout_ms: 60_000,
        }
    }
}

/// Flat environment variables accepted for compatibility with older deployments.
const LEGACY_ENV: &[(&str, &str)] = &[
    ("API_KEY", "http.api_key"),
    ("PORT", "http.port"),
    ("CONFIG_DIR", "storage.configs_dir"),
    ("SESSIONS_DIR", "storage.sessions_dir"),
    ("WEBHOOK_TIMEOUT", "webhook.timeout_ms"),
    ("MAX_FILE_SIZE", "media.max_file_size"),
    ("DOWNLOAD_TIMEOUT", "media.download_timeout_ms"),
];

impl HubConfig {
    /// Load from an optional TOML file, `WAHUB__`-prefixed variables and the
    /// legacy flat variables, in increasing precedence.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        Self::load_with(path, |name| std::env::var(name).ok())
    }

    pub fn load_with<F>(path: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("WAHUB")
                    .separator("__")
                    .try_parsing(true),
            );

        for (var, key) in LEGACY_ENV {
            builder = builder.set_override_option(*key, lookup(var))?;
        }

        builder.build()?.try_deserialize()
    }
}
