//! Process configuration loaded from environment variables (§6).
//!
//! Every tunable has a typed default plus an environment override.
//! `Settings::from_env` fails fast with a `ConfigurationError` on missing
//! required variables.

use crate::errors::ConfigurationError;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Message-bus connection string. Required unless `bus_optional`.
    pub bus_url: Option<String>,
    /// Start in degraded mode with the bus disabled (local dev only).
    pub bus_optional: bool,
    /// Object-store connection string. Required for the resume parser.
    pub object_store_url: Option<String>,
    /// Vendor API key; absent or the literal placeholder selects the mock
    /// LLM adapter.
    pub llm_api_key: Option<String>,
    /// Per-process worker pool size (default varies per §5: 10 for resume
    /// parsing, 4 for the others). This is the resume-parser override;
    /// other workers use `DEFAULT_WORKER_CONCURRENCY`.
    pub worker_concurrency: u32,
    /// Redelivery ack-wait window (§4.1 default 30s).
    pub ack_wait: Duration,
    /// Redelivery attempts before DLQ routing (§4.1 default 5).
    pub max_deliveries: u32,
    /// Pairing-cache TTL for resumes awaiting a JD (§4.5 default 24h).
    pub pairing_ttl: Duration,
    /// Directory backing the sqlite-backed bus/object-store/session state.
    pub data_dir: std::path::PathBuf,
}

pub const DEFAULT_WORKER_CONCURRENCY: u32 = 4;
pub const DEFAULT_RESUME_PARSER_CONCURRENCY: u32 = 10;
pub const DEFAULT_ACK_WAIT_SECONDS: u64 = 30;
pub const DEFAULT_MAX_DELIVERIES: u32 = 5;
pub const DEFAULT_PAIRING_TTL_HOURS: u64 = 24;
pub const MAX_PAYLOAD_BYTES: u64 = 8 * 1024 * 1024;
pub const DEFAULT_MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;
pub const OBJECT_STORE_CHUNK_BYTES: usize = 1024 * 1024;
pub const DEFAULT_PUBLISH_TIMEOUT_SECONDS: u64 = 10;
pub const RESUME_PARSE_DEADLINE_SECONDS: u64 = 90;
pub const DEFAULT_HANDLER_DEADLINE_SECONDS: u64 = 30;
pub const LLM_CALL_TIMEOUT_SECONDS: u64 = 20;

fn env_u64(name: &str, default: u64) -> Result<u64, ConfigurationError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse::<u64>()
            .map_err(|_| ConfigurationError::InvalidValue(format!("{} must be a positive integer, got {:?}", name, raw))),
    }
}

fn env_u32(name: &str, default: u32) -> Result<u32, ConfigurationError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse::<u32>()
            .map_err(|_| ConfigurationError::InvalidValue(format!("{} must be a positive integer, got {:?}", name, raw))),
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Err(_) => default,
        Ok(raw) => matches!(raw.to_lowercase().as_str(), "1" | "true" | "yes"),
    }
}

impl Settings {
    /// Load settings from the process environment.
    ///
    /// `BUS_URL` is required unless `BUS_OPTIONAL=true` (local dev). All
    /// other variables fall back to the documented defaults.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        let bus_optional = env_bool("BUS_OPTIONAL", false);
        let bus_url = std::env::var("BUS_URL").ok();
        if bus_url.is_none() && !bus_optional {
            return Err(ConfigurationError::Missing("BUS_URL".to_string()));
        }

        let ack_wait_secs = env_u64("ACK_WAIT_SECONDS", DEFAULT_ACK_WAIT_SECONDS)?;
        if ack_wait_secs == 0 {
            return Err(ConfigurationError::InvalidValue(
                "ACK_WAIT_SECONDS must be greater than zero".to_string(),
            ));
        }
        let max_deliveries = env_u32("MAX_DELIVERIES", DEFAULT_MAX_DELIVERIES)?;
        if max_deliveries == 0 {
            return Err(ConfigurationError::InvalidValue(
                "MAX_DELIVERIES must be greater than zero".to_string(),
            ));
        }
        let pairing_ttl_hours = env_u64("PAIRING_TTL_HOURS", DEFAULT_PAIRING_TTL_HOURS)?;
        let worker_concurrency = env_u32("WORKER_CONCURRENCY", DEFAULT_WORKER_CONCURRENCY)?;
        if worker_concurrency == 0 {
            return Err(ConfigurationError::InvalidValue(
                "WORKER_CONCURRENCY must be greater than zero".to_string(),
            ));
        }

        let llm_api_key = std::env::var("LLM_API_KEY").ok();

        let data_dir = std::env::var("PIPELINE_DATA_DIR")
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::current_dir()
                    .unwrap_or_else(|_| std::path::PathBuf::from("."))
                    .join(".recruit-pipeline")
            });

        Ok(Settings {
            bus_url,
            bus_optional,
            object_store_url: std::env::var("OBJECT_STORE_URL").ok(),
            llm_api_key,
            worker_concurrency,
            ack_wait: Duration::from_secs(ack_wait_secs),
            max_deliveries,
            pairing_ttl: Duration::from_secs(pairing_ttl_hours * 3600),
            data_dir,
        })
    }

    /// Whether the configured `LLM_API_KEY` should select the deterministic
    /// mock adapter (§6): absent, empty, or the literal placeholder "mock".
    pub fn uses_mock_llm(&self) -> bool {
        match &self.llm_api_key {
            None => true,
            Some(key) => key.is_empty() || key.eq_ignore_ascii_case("mock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for var in [
            "BUS_URL",
            "BUS_OPTIONAL",
            "OBJECT_STORE_URL",
            "LLM_API_KEY",
            "WORKER_CONCURRENCY",
            "ACK_WAIT_SECONDS",
            "MAX_DELIVERIES",
            "PAIRING_TTL_HOURS",
            "PIPELINE_DATA_DIR",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn missing_bus_url_fails_fast() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let result = Settings::from_env();
        assert!(matches!(result, Err(ConfigurationError::Missing(_))));
    }

    #[test]
    fn bus_optional_allows_missing_bus_url() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("BUS_OPTIONAL", "true");
        let settings = Settings::from_env().expect("should not fail fast");
        assert!(settings.bus_url.is_none());
        clear_env();
    }

    #[test]
    fn mock_llm_selected_when_key_absent_or_placeholder() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("BUS_OPTIONAL", "true");
        let settings = Settings::from_env().unwrap();
        assert!(settings.uses_mock_llm());

        std::env::set_var("LLM_API_KEY", "mock");
        let settings = Settings::from_env().unwrap();
        assert!(settings.uses_mock_llm());

        std::env::set_var("LLM_API_KEY", "sk-real-key");
        let settings = Settings::from_env().unwrap();
        assert!(!settings.uses_mock_llm());
        clear_env();
    }

    #[test]
    fn invalid_numeric_override_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("BUS_OPTIONAL", "true");
        std::env::set_var("MAX_DELIVERIES", "not-a-number");
        let result = Settings::from_env();
        assert!(matches!(result, Err(ConfigurationError::InvalidValue(_))));
        clear_env();
    }
}
