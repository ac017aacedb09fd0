//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

/// Top-level Voxline configuration (`~/.voxline/config.json`, JSON5).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    /// Credentials and endpoints, one entry per provider id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub providers: Option<Vec<ProviderConfig>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Externally reachable base URL (e.g. "https://voice.example.com") used to
    /// build `websocket_url`. Falls back to the request's Host header.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
}

fn default_port() -> u16 {
    8000
}

/// Configuration for a single STT / LLM / TTS provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// TTS voice id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

impl ProviderConfig {
    /// An entry with only an id; keys come from the provider's conventional env var.
    pub fn named(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Default::default()
        }
    }

    /// Resolve the API key: `api_key`, then `api_key_env`, then `<ID>_API_KEY`.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env).or_else(|| {
            let conventional = format!("{}_API_KEY", self.id.to_uppercase().replace('-', "_"));
            resolve_secret_field(&None, &Some(conventional))
        })
    }

    /// Local providers that run without credentials.
    pub fn requires_api_key(&self) -> bool {
        self.id != "ollama"
    }
}

/// Language-model generation settings shared by all sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

fn default_system_prompt() -> String {
    "You are a helpful voice assistant. Keep responses concise and conversational.".into()
}

fn default_max_tokens() -> u32 {
    512
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            max_tokens: default_max_tokens(),
            temperature: None,
        }
    }
}

/// Pipeline execution tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Capacity of each stage-to-stage queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Enable barge-in handling.
    #[serde(default = "default_true")]
    pub allow_interruptions: bool,

    #[serde(default)]
    pub retry: RetryConfig,

    /// How long a draining session may flush before it is forced closed.
    #[serde(default = "default_grace_ms")]
    pub drain_grace_ms: u64,

    /// Grace period for all sessions on process shutdown.
    #[serde(default = "default_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Sample rate assumed for inbound audio that does not state one.
    #[serde(default = "default_sample_rate")]
    pub input_sample_rate: u32,

    #[serde(default)]
    pub vad: VadConfig,
}

fn default_queue_capacity() -> usize {
    32
}

fn default_true() -> bool {
    true
}

fn default_grace_ms() -> u64 {
    5_000
}

fn default_sample_rate() -> u32 {
    16_000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            allow_interruptions: true,
            retry: RetryConfig::default(),
            drain_grace_ms: default_grace_ms(),
            shutdown_grace_ms: default_grace_ms(),
            input_sample_rate: default_sample_rate(),
            vad: VadConfig::default(),
        }
    }
}

/// Bounded exponential backoff for transient provider failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_factor")]
    pub factor: u32,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_factor() -> u32 {
    2
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            factor: default_factor(),
        }
    }
}

/// Local energy-based voice activity detection for transports without VAD events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// RMS threshold on 16-bit samples.
    #[serde(default = "default_vad_threshold")]
    pub threshold: f64,

    /// Trailing silence before the user is considered done speaking.
    #[serde(default = "default_vad_stop_ms")]
    pub stop_ms: u64,
}

fn default_vad_threshold() -> f64 {
    300.0
}

fn default_vad_stop_ms() -> u64 {
    800
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_vad_threshold(),
            stop_ms: default_vad_stop_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sessions that never connect a WebSocket are dropped after this long.
    #[serde(default = "default_pending_ttl")]
    pub pending_ttl_secs: u64,
}

fn default_pending_ttl() -> u64 {
    300
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pending_ttl_secs: default_pending_ttl(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "voxline_pipeline=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

static ENV_VAR_PATTERN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("static pattern"));

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parse config text (JSON5) after env-var substitution.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let substituted = substitute_env_vars(raw);
        json5::from_str(&substituted)
            .map_err(|e| crate::error::VoxlineError::Config(e.to_string()))
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or_else(default_port)
    }

    pub fn bind_addr(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn public_url(&self) -> Option<&str> {
        self.gateway.as_ref().and_then(|g| g.public_url.as_deref())
    }

    /// Find a provider config by id.
    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers
            .as_ref()
            .and_then(|p| p.iter().find(|pc| pc.id == id))
    }

    /// Provider config by id, or a bare entry relying on the conventional env var.
    pub fn provider_or_default(&self, id: &str) -> ProviderConfig {
        self.provider(id)
            .cloned()
            .unwrap_or_else(|| ProviderConfig::named(id))
    }

    pub fn llm(&self) -> LlmConfig {
        self.llm.clone().unwrap_or_default()
    }

    pub fn pipeline(&self) -> PipelineConfig {
        self.pipeline.clone().unwrap_or_default()
    }

    pub fn pending_ttl_secs(&self) -> u64 {
        self.session
            .as_ref()
            .map(|s| s.pending_ttl_secs)
            .unwrap_or_else(default_pending_ttl)
    }

    /// Get a config value by dotted path (e.g. "gateway.port", "pipeline.retry").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Some(providers) = &self.providers {
            for p in providers {
                if p.requires_api_key() && p.resolve_api_key().is_none() {
                    warnings.push(format!("Provider '{}' has no API key configured", p.id));
                }
            }
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }

        if let Some(pipeline) = &self.pipeline {
            if pipeline.queue_capacity == 0 {
                errors.push("pipeline.queue_capacity must be at least 1".to_string());
            }
            if pipeline.retry.max_attempts == 0 {
                errors.push("pipeline.retry.max_attempts must be at least 1".to_string());
            }
            if pipeline.input_sample_rate == 0 {
                errors.push("pipeline.input_sample_rate cannot be 0".to_string());
            }
        }

        (warnings, errors)
    }
}

/// Base directory for Voxline data: `~/.voxline/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".voxline")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, variable name unique to this test
        unsafe { std::env::set_var("TEST_VX_KEY", "sk-test-123") };
        let input = r#"{"key": "${TEST_VX_KEY}", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("sk-test-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_VX_KEY") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_VX_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.gateway_port(), 8000);
        assert_eq!(config.bind_addr(), "0.0.0.0");
        let pipeline = config.pipeline();
        assert_eq!(pipeline.retry.max_attempts, 3);
        assert_eq!(pipeline.retry.base_delay_ms, 250);
        assert_eq!(pipeline.retry.factor, 2);
        assert_eq!(pipeline.shutdown_grace_ms, 5_000);
        assert!(pipeline.allow_interruptions);
        assert_eq!(config.pending_ttl_secs(), 300);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.json")).unwrap();
        assert!(config.providers.is_none());
    }

    #[test]
    fn test_load_json5_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // comments are allowed
                gateway: { port: 9100 },
                pipeline: { queue_capacity: 8, retry: { max_attempts: 5 } },
                providers: [{ id: "deepgram", api_key: "dg" }],
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.gateway_port(), 9100);
        let pipeline = config.pipeline();
        assert_eq!(pipeline.queue_capacity, 8);
        assert_eq!(pipeline.retry.max_attempts, 5);
        assert_eq!(pipeline.retry.base_delay_ms, 250);
        assert_eq!(
            config.provider("deepgram").and_then(|p| p.resolve_api_key()),
            Some("dg".into())
        );
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = Config::parse("{ gateway: ").unwrap_err();
        assert!(matches!(err, crate::error::VoxlineError::Config(_)));
    }

    #[test]
    fn test_provider_resolve_api_key() {
        // SAFETY: test-only, variable names unique to this test
        unsafe { std::env::set_var("TEST_VX_API_KEY", "from-env") };
        let provider = ProviderConfig {
            id: "test".into(),
            api_key_env: Some("TEST_VX_API_KEY".into()),
            ..Default::default()
        };
        assert_eq!(provider.resolve_api_key(), Some("from-env".into()));

        let direct = ProviderConfig {
            id: "test".into(),
            api_key: Some("direct-key".into()),
            api_key_env: Some("TEST_VX_API_KEY".into()),
            ..Default::default()
        };
        assert_eq!(direct.resolve_api_key(), Some("direct-key".into()));
        unsafe { std::env::remove_var("TEST_VX_API_KEY") };

        unsafe { std::env::set_var("VXTESTPROV_API_KEY", "conventional") };
        assert_eq!(
            ProviderConfig::named("vxtestprov").resolve_api_key(),
            Some("conventional".into())
        );
        unsafe { std::env::remove_var("VXTESTPROV_API_KEY") };
    }

    #[test]
    fn test_logging_config_defaults() {
        let config: Config = json5::from_str(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_get_path() {
        let config: Config = json5::from_str(r#"{ gateway: { port: 9000 } }"#).unwrap();
        assert_eq!(config.get_path("gateway.port"), Some(serde_json::json!(9000)));
        assert!(config.get_path("gateway.nope").is_none());
    }

    #[test]
    fn test_validate() {
        let config: Config = json5::from_str(
            r#"{
                gateway: { port: 0 },
                pipeline: { queue_capacity: 0 },
                providers: [{ id: "vx-nokey-provider" }, { id: "ollama" }],
            }"#,
        )
        .unwrap();
        let (warnings, errors) = config.validate();
        assert!(warnings.iter().any(|w| w.contains("vx-nokey-provider")));
        assert!(!warnings.iter().any(|w| w.contains("ollama")));
        assert!(errors.iter().any(|e| e.contains("port")));
        assert!(errors.iter().any(|e| e.contains("queue_capacity")));
    }
}
