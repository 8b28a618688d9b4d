//! Application Configuration Module
//!
//! Loads every setting of the kiosk service from environment variables into a
//! single struct that is passed to the components at startup.

use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_path: PathBuf,
    pub face_service_url: String,
    pub stt_api_url: String,
    pub stt_api_key: Option<SecretString>,
    pub stt_model: String,
    pub ollama_url: String,
    pub chat_model: String,
    pub audio_input_device: Option<String>,
    pub prompts_dir: PathBuf,
    pub match_tolerance: f64,
    pub same_face_threshold: f64,
    pub registration_hold: Duration,
    pub listen_timeout: Duration,
    pub request_timeout: Duration,
    pub history_limit: usize,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// A `.env` file in the current directory is loaded first when present.
    ///
    /// *   `BIND_ADDRESS`: WebSocket listen address. Defaults to "0.0.0.0:5000".
    /// *   `DATABASE_PATH`: SQLite file. Defaults to "face_recognition_db.sqlite".
    /// *   `FACE_SERVICE_URL`: Face encoding sidecar. Defaults to "http://127.0.0.1:8001".
    /// *   `STT_API_URL` / `STT_API_KEY` / `STT_MODEL`: Transcription endpoint,
    ///     optional bearer key and model. Default to the OpenAI API and "whisper-1".
    /// *   `OLLAMA_URL` / `CHAT_MODEL`: Intent classifier. Default to a local
    ///     Ollama and "mistral:latest".
    /// *   `AUDIO_INPUT_DEVICE`: (Optional) Microphone name; the host default otherwise.
    /// *   `PROMPTS_DIR`: Prompt templates. Defaults to "prompts".
    /// *   `MATCH_TOLERANCE`, `SAME_FACE_THRESHOLD`: Face distance limits (0.5, 0.6).
    /// *   `REGISTRATION_HOLD_SECS`, `LISTEN_TIMEOUT_SECS`: (3, 5).
    /// *   `REQUEST_TIMEOUT_SECS`: Ceiling on each sidecar HTTP request. Defaults to 30.
    /// *   `HISTORY_LIMIT`: Log entries given to the classifier. Defaults to 20.
    /// *   `RUST_LOG`: (Optional) The logging level. Defaults to "INFO".
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let text = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        let bind_address = parse(&lookup, "BIND_ADDRESS", "0.0.0.0:5000".parse::<SocketAddr>())?;
        let match_tolerance = parse(&lookup, "MATCH_TOLERANCE", Ok(0.5_f64))?;
        let same_face_threshold = parse(&lookup, "SAME_FACE_THRESHOLD", Ok(0.6_f64))?;
        let registration_hold = parse(&lookup, "REGISTRATION_HOLD_SECS", Ok(3.0_f64))?;
        let listen_timeout = parse(&lookup, "LISTEN_TIMEOUT_SECS", Ok(5.0_f64))?;
        let request_timeout = parse(&lookup, "REQUEST_TIMEOUT_SECS", Ok(30.0_f64))?;
        let history_limit = parse(&lookup, "HISTORY_LIMIT", Ok(20usize))?;

        let log_level_str = text("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        for (name, value) in [
            ("MATCH_TOLERANCE", match_tolerance),
            ("SAME_FACE_THRESHOLD", same_face_threshold),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::InvalidValue(
                    name.to_string(),
                    format!("{} is not a non-negative number", value),
                ));
            }
        }
        let registration_hold = seconds("REGISTRATION_HOLD_SECS", registration_hold)?;
        let listen_timeout = seconds("LISTEN_TIMEOUT_SECS", listen_timeout)?;
        let request_timeout = seconds("REQUEST_TIMEOUT_SECS", request_timeout)?;

        let stt_api_key = lookup("STT_API_KEY")
            .filter(|key| !key.trim().is_empty())
            .map(SecretString::from);
        let stt_api_url = text("STT_API_URL", "https://api.openai.com/v1");

        Ok(Self {
            bind_address,
            database_path: PathBuf::from(text("DATABASE_PATH", "face_recognition_db.sqlite")),
            face_service_url: text("FACE_SERVICE_URL", "http://127.0.0.1:8001"),
            stt_api_url,
            stt_api_key,
            stt_model: text("STT_MODEL", "whisper-1"),
            ollama_url: text("OLLAMA_URL", "http://127.0.0.1:11434"),
            chat_model: text("CHAT_MODEL", "mistral:latest"),
            audio_input_device: lookup("AUDIO_INPUT_DEVICE").filter(|d| !d.trim().is_empty()),
            prompts_dir: PathBuf::from(text("PROMPTS_DIR", "prompts")),
            match_tolerance,
            same_face_threshold,
            registration_hold,
            listen_timeout,
            request_timeout,
            history_limit,
            log_level,
        })
    }

    /// Checks the settings only the server needs. The OpenAI transcription
    /// API rejects unauthenticated requests, so a key is mandatory there.
    pub fn require_transcription_key(&self) -> Result<(), ConfigError> {
        if self.stt_api_key.is_none() && self.stt_api_url.contains("api.openai.com") {
            return Err(ConfigError::MissingVar(
                "STT_API_KEY must be set when transcribing with the OpenAI API".to_string(),
            ));
        }
        Ok(())
    }
}

fn seconds(name: &str, value: f64) -> Result<Duration, ConfigError> {
    // Rejects negatives and NaN as well as values too large for a Duration.
    Duration::try_from_secs_f64(value).map_err(|e| {
        ConfigError::InvalidValue(name.to_string(), format!("{} seconds: {}", value, e))
    })
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: Result<T, T::Err>,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    let value = match lookup(name) {
        Some(raw) => raw.trim().parse::<T>(),
        None => default,
    };
    value.map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string()))
}
