//! Runtime configuration, read once at startup from the environment.

use std::net::SocketAddr;
use std::time::Duration;

/// Application-level constants
pub const APP_NAME: &str = "Clinassist";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default log filter when `RUST_LOG` is not set.
pub fn default_log_filter() -> String {
    format!("{}=info,tower_http=warn", env!("CARGO_PKG_NAME"))
}

/// Server configuration.
///
/// Every field has a working default so a local instance starts with no
/// environment at all (the LLM then fails at call time and voice starts
/// disabled).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP/WebSocket server binds to.
    pub bind_addr: SocketAddr,
    /// Object-storage bucket holding `patient_data/`.
    pub bucket: String,
    /// OAuth bearer token for the storage API. Optional: without it only
    /// publicly readable buckets work.
    pub storage_token: Option<String>,
    /// API key for the hosted generative-model API.
    pub llm_api_key: String,
    /// Model name passed to the generative-model API.
    pub llm_model: String,
    /// API key for the hosted speech APIs. Voice is disabled when absent.
    pub speech_api_key: Option<String>,
    /// Synthetic voice used for text-to-speech output.
    pub speech_voice: String,
    /// Maximum tool-call rounds per user turn.
    pub max_tool_rounds: u32,
    /// Sliding window applied to in-memory conversation history (turns).
    pub history_limit: usize,
    /// Timeout applied to each external call (storage, LLM, speech).
    pub upstream_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".parse().expect("static addr"),
            bucket: "clinic_sim".to_string(),
            storage_token: None,
            llm_api_key: String::new(),
            llm_model: "gemini-2.5-flash".to_string(),
            speech_api_key: None,
            speech_voice: "en-US-Neural2-C".to_string(),
            max_tool_rounds: 1,
            history_limit: 100,
            upstream_timeout: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Build a configuration from environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: env_parsed("CLINASSIST_BIND", defaults.bind_addr),
            bucket: env_string("CLINASSIST_BUCKET").unwrap_or(defaults.bucket),
            storage_token: env_string("STORAGE_TOKEN"),
            llm_api_key: env_string("GOOGLE_API_KEY").unwrap_or(defaults.llm_api_key),
            llm_model: env_string("CLINASSIST_MODEL").unwrap_or(defaults.llm_model),
            speech_api_key: env_string("SPEECH_API_KEY"),
            speech_voice: env_string("CLINASSIST_VOICE").unwrap_or(defaults.speech_voice),
            max_tool_rounds: env_parsed("CLINASSIST_TOOL_ROUNDS", defaults.max_tool_rounds),
            history_limit: env_parsed("CLINASSIST_HISTORY_LIMIT", defaults.history_limit),
            upstream_timeout: Duration::from_secs(env_parsed(
                "CLINASSIST_TIMEOUT_SECS",
                defaults.upstream_timeout.as_secs(),
            )),
        }
    }

    /// Whether voice transcoding can be enabled at all.
    pub fn voice_configured(&self) -> bool {
        self.speech_api_key.is_some()
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env_string(key).map(|v| v.parse::<T>()) {
        Some(Ok(parsed)) => parsed,
        Some(Err(_)) => {
            tracing::warn!(key, "Unparseable environment value, using default");
            default
        }
        None => default,
    }
}
