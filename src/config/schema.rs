use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

// ── Top-level config ──────────────────────────────────────────────

/// Top-level Versa configuration, loaded from `config.toml`.
///
/// Resolution order: `--config-dir` flag → `VERSA_CONFIG_DIR` env → `~/.versa/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Path to config.toml - computed at load time, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// HTTP gateway configuration (`[gateway]`).
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Write-behind flush and stale-key reaping (`[sessions]`).
    #[serde(default)]
    pub sessions: SessionsConfig,

    /// History windowing before every model call (`[history]`).
    #[serde(default)]
    pub history: HistoryConfig,

    /// Streaming relay batching and keep-alive (`[stream]`).
    #[serde(default)]
    pub stream: StreamConfig,

    /// Durable tier backend (`[storage]`).
    #[serde(default)]
    pub storage: StorageConfig,

    /// OpenAI-compatible model endpoint and retrieval knobs (`[provider]`).
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Bearer token verification (`[auth]`).
    #[serde(default)]
    pub auth: AuthConfig,

    /// Unauthenticated demo mode (`[demo]`).
    #[serde(default)]
    pub demo: DemoConfig,

    /// Hand-off of queued PDF ingestion tasks (`[ingestion]`).
    #[serde(default)]
    pub ingestion: IngestionConfig,
}

impl Default for Config {
    fn default() -> Self {
        let config_path = default_config_dir()
            .unwrap_or_else(|_| PathBuf::from(".versa"))
            .join("config.toml");
        Self {
            config_path,
            gateway: GatewayConfig::default(),
            sessions: SessionsConfig::default(),
            history: HistoryConfig::default(),
            stream: StreamConfig::default(),
            storage: StorageConfig::default(),
            provider: ProviderConfig::default(),
            auth: AuthConfig::default(),
            demo: DemoConfig::default(),
            ingestion: IngestionConfig::default(),
        }
    }
}

// ── Gateway ───────────────────────────────────────────────────────

/// HTTP gateway configuration (`[gateway]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GatewayConfig {
    /// Gateway port (default: 8000)
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Gateway host (default: 127.0.0.1)
    #[serde(default = "default_gateway_host")]
    pub host: String,
    /// Origins allowed by CORS. `"*"` allows any origin.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    /// Max requests per minute per client key across the chat endpoints. 0 disables limiting.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
    /// Maximum distinct client keys tracked by the rate limiter.
    #[serde(default = "default_rate_limit_max_keys")]
    pub rate_limit_max_keys: usize,
    /// Trust proxy-forwarded client IP headers (`X-Forwarded-For`, `X-Real-IP`).
    /// Disabled by default; enable only behind a trusted reverse proxy.
    #[serde(default)]
    pub trust_forwarded_headers: bool,
    /// Bearer token for `/admin/*` routes. Admin routes are disabled when unset.
    #[serde(default)]
    pub admin_token: Option<String>,
    /// Maximum request body size in bytes.
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_gateway_port() -> u16 {
    8000
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:3000".into()]
}

fn default_rate_limit() -> u32 {
    60
}

fn default_rate_limit_max_keys() -> usize {
    10_000
}

fn default_body_limit() -> usize {
    64 * 1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            host: default_gateway_host(),
            allowed_origins: default_allowed_origins(),
            rate_limit_per_minute: default_rate_limit(),
            rate_limit_max_keys: default_rate_limit_max_keys(),
            trust_forwarded_headers: false,
            admin_token: None,
            body_limit_bytes: default_body_limit(),
        }
    }
}

// ── Sessions ──────────────────────────────────────────────────────

/// Write-behind policy (`[sessions]` section).
///
/// A session in `active_sessions` is flushed when it has no durable document yet,
/// when its pending message count reaches `flush_threshold`, or when it has been
/// idle for `idle_flush_secs`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionsConfig {
    /// Seconds between flush sweeps (default: 20)
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
    /// Seconds to wait after a failed sweep before retrying (default: 10)
    #[serde(default = "default_flush_retry")]
    pub flush_retry_secs: u64,
    /// Pending message count that forces a flush (default: 6)
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: u64,
    /// Seconds of inactivity after which pending messages are flushed (default: 300)
    #[serde(default = "default_idle_flush")]
    pub idle_flush_secs: u64,
    /// Seconds between stale last-flush key sweeps (default: 21600)
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
    /// Seconds to wait after a failed reaper sweep (default: 60)
    #[serde(default = "default_reaper_retry")]
    pub reaper_retry_secs: u64,
    /// Age in seconds after which a last-flush key is reclaimed (default: 86400)
    #[serde(default = "default_last_flush_retention")]
    pub last_flush_retention_secs: u64,
}

fn default_flush_interval() -> u64 {
    20
}

fn default_flush_retry() -> u64 {
    10
}

fn default_flush_threshold() -> u64 {
    6
}

fn default_idle_flush() -> u64 {
    300
}

fn default_reaper_interval() -> u64 {
    6 * 60 * 60
}

fn default_reaper_retry() -> u64 {
    60
}

fn default_last_flush_retention() -> u64 {
    24 * 60 * 60
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: default_flush_interval(),
            flush_retry_secs: default_flush_retry(),
            flush_threshold: default_flush_threshold(),
            idle_flush_secs: default_idle_flush(),
            reaper_interval_secs: default_reaper_interval(),
            reaper_retry_secs: default_reaper_retry(),
            last_flush_retention_secs: default_last_flush_retention(),
        }
    }
}

// ── History ───────────────────────────────────────────────────────

/// History windowing (`[history]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HistoryConfig {
    /// Word budget for the prompt history window (default: 1000)
    #[serde(default = "default_max_words")]
    pub max_words: usize,
    /// Messages always kept regardless of the word budget (default: 4)
    #[serde(default = "default_min_messages")]
    pub min_messages: usize,
    /// Hard cap on messages considered, taken from the tail (default: 6)
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
}

fn default_max_words() -> usize {
    1000
}

fn default_min_messages() -> usize {
    4
}

fn default_max_messages() -> usize {
    6
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_words: default_max_words(),
            min_messages: default_min_messages(),
            max_messages: default_max_messages(),
        }
    }
}

// ── Stream ────────────────────────────────────────────────────────

/// Streaming relay (`[stream]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StreamConfig {
    /// Chunks per published batch (default: 5)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Milliseconds before a partial batch is published (default: 100)
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,
    /// Seconds of silence before the consumer emits a keep-alive (default: 15)
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Consumer poll timeout in milliseconds (default: 50)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Token substituted for line breaks in chunk events (default: `<br>`)
    #[serde(default = "default_newline_token")]
    pub newline_token: String,
}

fn default_batch_size() -> usize {
    5
}

fn default_batch_interval_ms() -> u64 {
    100
}

fn default_keep_alive() -> u64 {
    15
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_newline_token() -> String {
    "<br>".into()
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_interval_ms: default_batch_interval_ms(),
            keep_alive_secs: default_keep_alive(),
            poll_interval_ms: default_poll_interval_ms(),
            newline_token: default_newline_token(),
        }
    }
}

impl StreamConfig {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ── Storage ───────────────────────────────────────────────────────

/// Durable tier selection (`[storage]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StorageConfig {
    /// "sqlite" | "memory" (`memory` loses history on restart)
    #[serde(default = "default_durable_backend")]
    pub durable_backend: String,
    /// SQLite database path. Relative paths resolve against the config directory.
    /// Default: `sessions.db` next to `config.toml`.
    #[serde(default)]
    pub sqlite_path: Option<PathBuf>,
}

fn default_durable_backend() -> String {
    "sqlite".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            durable_backend: default_durable_backend(),
            sqlite_path: None,
        }
    }
}

// ── Provider ──────────────────────────────────────────────────────

/// OpenAI-compatible chat endpoint (`[provider]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProviderConfig {
    /// Base URL, without the `/chat/completions` suffix.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// API key. Overridden by `VERSA_API_KEY` or `OPENAI_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Model used for answers and title generation.
    #[serde(default = "default_model")]
    pub model: String,
    /// Sampling temperature (0.0–2.0). Default: `0.7`.
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Request timeout in seconds (default: 120)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Documents retrieved per question (default: 5)
    #[serde(default = "default_retrieval_k")]
    pub retrieval_k: usize,
    /// Retrieval mode passed to the vector store (default: "similarity")
    #[serde(default = "default_retrieval_mode")]
    pub retrieval_mode: String,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}

fn default_model() -> String {
    "gpt-4o-mini".into()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_request_timeout() -> u64 {
    120
}

fn default_retrieval_k() -> usize {
    5
}

fn default_retrieval_mode() -> String {
    "similarity".into()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            model: default_model(),
            temperature: default_temperature(),
            request_timeout_secs: default_request_timeout(),
            retrieval_k: default_retrieval_k(),
            retrieval_mode: default_retrieval_mode(),
        }
    }
}

// ── Auth / Demo ───────────────────────────────────────────────────

/// Bearer token verification (`[auth]` section).
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct AuthConfig {
    /// HS256 secret for user tokens. Overridden by `JWT_SECRET`.
    /// Authenticated routes reject every request while unset.
    #[serde(default)]
    pub jwt_secret: Option<String>,
}

/// Demo mode (`[demo]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DemoConfig {
    /// Shared secret required by `/demo_chat_send`. Demo routes are disabled when unset.
    #[serde(default)]
    pub secret: Option<String>,
    /// Seconds of inactivity before a demo session is evicted (default: 300)
    #[serde(default = "default_demo_timeout")]
    pub session_timeout_secs: u64,
    /// Seconds between demo eviction sweeps (default: 60)
    #[serde(default = "default_demo_sweep")]
    pub sweep_interval_secs: u64,
    /// Seconds a demo stream waits for a queued question (default: 10)
    #[serde(default = "default_demo_dequeue_timeout")]
    pub dequeue_timeout_secs: u64,
}

fn default_demo_timeout() -> u64 {
    300
}

fn default_demo_sweep() -> u64 {
    60
}

fn default_demo_dequeue_timeout() -> u64 {
    10
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            secret: None,
            session_timeout_secs: default_demo_timeout(),
            sweep_interval_secs: default_demo_sweep(),
            dequeue_timeout_secs: default_demo_dequeue_timeout(),
        }
    }
}

// ── Ingestion ─────────────────────────────────────────────────────

/// PDF ingestion hand-off (`[ingestion]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct IngestionConfig {
    /// URL that receives each queued `{pdfId, userId}` task as a JSON POST.
    /// Overridden by `VERSA_INGESTION_ENDPOINT`. `/upsert_pdf` answers 503 while unset.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Seconds between queue drains (default: 5)
    #[serde(default = "default_ingestion_interval")]
    pub poll_interval_secs: u64,
    /// Seconds to wait after a failed drain (default: 30)
    #[serde(default = "default_ingestion_retry")]
    pub retry_secs: u64,
    /// Most tasks handed off per drain (default: 16)
    #[serde(default = "default_ingestion_batch")]
    pub batch_limit: usize,
    /// Per-task request timeout in seconds (default: 30)
    #[serde(default = "default_ingestion_timeout")]
    pub request_timeout_secs: u64,
}

fn default_ingestion_interval() -> u64 {
    5
}

fn default_ingestion_retry() -> u64 {
    30
}

fn default_ingestion_batch() -> usize {
    16
}

fn default_ingestion_timeout() -> u64 {
    30
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            poll_interval_secs: default_ingestion_interval(),
            retry_secs: default_ingestion_retry(),
            batch_limit: default_ingestion_batch(),
            request_timeout_secs: default_ingestion_timeout(),
        }
    }
}

impl IngestionConfig {
    /// The configured endpoint, if it is non-empty.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref().map(str::trim).filter(|e| !e.is_empty())
    }
}

// ── Loading ───────────────────────────────────────────────────────

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".versa"))
}

fn resolve_config_dir(override_dir: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = override_dir {
        return Ok(dir.to_path_buf());
    }
    if let Ok(dir) = std::env::var("VERSA_CONFIG_DIR") {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    default_config_dir()
}

impl Config {
    /// Load `config.toml`, writing a default one first if it does not exist.
    pub async fn load_or_init(config_dir: Option<&Path>) -> Result<Self> {
        let dir = resolve_config_dir(config_dir)?;
        let config_path = dir.join("config.toml");

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let initialized = !config_path.exists();
        let mut config = if initialized {
            let mut config = Config::default();
            config.config_path = config_path.clone();
            config.save().await?;

            // Restrict permissions on newly created config file (may contain API keys)
            #[cfg(unix)]
            {
                use std::{fs::Permissions, os::unix::fs::PermissionsExt};
                let _ = fs::set_permissions(&config_path, Permissions::from_mode(0o600)).await;
            }
            config
        } else {
            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path.clone();
            config
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            path = %config.config_path.display(),
            initialized,
            "Config loaded"
        );
        Ok(config)
    }

    /// Directory holding `config.toml`.
    pub fn config_dir(&self) -> &Path {
        self.config_path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Resolved SQLite path for the durable tier.
    pub fn sqlite_path(&self) -> PathBuf {
        match &self.storage.sqlite_path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.config_dir().join(path),
            None => self.config_dir().join("sessions.db"),
        }
    }

    /// Validate configuration values that would cause runtime failures.
    pub fn validate(&self) -> Result<()> {
        if self.gateway.host.trim().is_empty() {
            anyhow::bail!("gateway.host must not be empty");
        }
        if self.gateway.body_limit_bytes == 0 {
            anyhow::bail!("gateway.body_limit_bytes must be greater than 0");
        }

        let s = &self.sessions;
        for (name, value) in [
            ("sessions.flush_interval_secs", s.flush_interval_secs),
            ("sessions.flush_retry_secs", s.flush_retry_secs),
            ("sessions.flush_threshold", s.flush_threshold),
            ("sessions.idle_flush_secs", s.idle_flush_secs),
            ("sessions.reaper_interval_secs", s.reaper_interval_secs),
            ("sessions.reaper_retry_secs", s.reaper_retry_secs),
            ("sessions.last_flush_retention_secs", s.last_flush_retention_secs),
            ("demo.sweep_interval_secs", self.demo.sweep_interval_secs),
            ("ingestion.poll_interval_secs", self.ingestion.poll_interval_secs),
            ("ingestion.retry_secs", self.ingestion.retry_secs),
        ] {
            if value == 0 {
                anyhow::bail!("{name} must be greater than 0");
            }
        }

        if self.stream.batch_size == 0 {
            anyhow::bail!("stream.batch_size must be greater than 0");
        }
        if self.stream.batch_interval_ms == 0 || self.stream.poll_interval_ms == 0 {
            anyhow::bail!("stream intervals must be greater than 0");
        }
        if self.ingestion.batch_limit == 0 {
            anyhow::bail!("ingestion.batch_limit must be greater than 0");
        }
        if self.history.max_messages == 0 {
            anyhow::bail!("history.max_messages must be greater than 0");
        }

        match self.storage.durable_backend.as_str() {
            "sqlite" | "memory" => {}
            other => anyhow::bail!(
                "storage.durable_backend must be \"sqlite\" or \"memory\", got {other:?}"
            ),
        }

        if !(0.0..=2.0).contains(&self.provider.temperature) {
            anyhow::bail!("provider.temperature must be within 0.0..=2.0");
        }

        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        // Gateway port: VERSA_GATEWAY_PORT or PORT
        if let Ok(port_str) =
            std::env::var("VERSA_GATEWAY_PORT").or_else(|_| std::env::var("PORT"))
        {
            if let Ok(port) = port_str.parse::<u16>() {
                self.gateway.port = port;
            }
        }

        // Gateway host: VERSA_GATEWAY_HOST or HOST
        if let Ok(host) = std::env::var("VERSA_GATEWAY_HOST").or_else(|_| std::env::var("HOST")) {
            if !host.is_empty() {
                self.gateway.host = host;
            }
        }

        // Comma-separated CORS origins
        if let Ok(origins) = std::env::var("ALLOWED_ORIGINS") {
            let parsed: Vec<String> = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(String::from)
                .collect();
            if !parsed.is_empty() {
                self.gateway.allowed_origins = parsed;
            }
        }

        if let Ok(secret) = std::env::var("JWT_SECRET") {
            if !secret.is_empty() {
                self.auth.jwt_secret = Some(secret);
            }
        }

        if let Ok(secret) = std::env::var("DEMO_SECRET") {
            if !secret.is_empty() {
                self.demo.secret = Some(secret);
            }
        }

        if let Ok(endpoint) = std::env::var("VERSA_INGESTION_ENDPOINT") {
            if !endpoint.is_empty() {
                self.ingestion.endpoint = Some(endpoint);
            }
        }

        // API Key: VERSA_API_KEY or OPENAI_API_KEY
        if let Ok(key) = std::env::var("VERSA_API_KEY").or_else(|_| std::env::var("OPENAI_API_KEY"))
        {
            if !key.is_empty() {
                self.provider.api_key = Some(key);
            }
        }

        if let Ok(model) = std::env::var("VERSA_MODEL") {
            if !model.is_empty() {
                self.provider.model = model;
            }
        }

        if let Ok(path) = std::env::var("VERSA_SQLITE_PATH") {
            if !path.is_empty() {
                self.storage.sqlite_path = Some(PathBuf::from(path));
            }
        }
    }

    /// Write the config atomically: temp file in the same directory, then rename.
    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;
        fs::create_dir_all(parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .await
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .await
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }
        Ok(())
    }
}
