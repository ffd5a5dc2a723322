use std::time::Duration;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
/// Startup fails if required variables are missing or malformed.
#[derive(Debug, Clone)]
pub struct Config {
    pub gateway_url: String,
    pub gateway_api_key: Option<String>,
    /// Default bound on every gateway call; callers may override per call.
    pub gateway_timeout: Duration,
    pub gateway_max_retries: u32,
    /// Sessions untouched for this long are discarded.
    pub session_idle_timeout: Duration,
    pub default_locale: String,
    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let gateway_url = lookup("GATEWAY_URL")
            .with_context(|| "Required environment variable 'GATEWAY_URL' is not set")?;

        let timeout_secs = lookup("GATEWAY_TIMEOUT_SECS")
            .unwrap_or_else(|| "60".to_string())
            .parse::<u64>()
            .context("GATEWAY_TIMEOUT_SECS must be a whole number of seconds")?;

        let idle_secs = lookup("SESSION_IDLE_TIMEOUT_SECS")
            .unwrap_or_else(|| "1800".to_string())
            .parse::<u64>()
            .context("SESSION_IDLE_TIMEOUT_SECS must be a whole number of seconds")?;

        Ok(Config {
            gateway_url,
            gateway_api_key: lookup("GATEWAY_API_KEY").filter(|k| !k.trim().is_empty()),
            gateway_timeout: Duration::from_secs(timeout_secs),
            gateway_max_retries: lookup("GATEWAY_MAX_RETRIES")
                .unwrap_or_else(|| "3".to_string())
                .parse::<u32>()
                .context("GATEWAY_MAX_RETRIES must be a non-negative integer")?,
            session_idle_timeout: Duration::from_secs(idle_secs),
            default_locale: lookup("DEFAULT_LOCALE").unwrap_or_else(|| "en".to_string()),
            port: lookup("PORT")
                .unwrap_or_else(|| "8080".to_string())
                .parse::<u16>()
                .context("PORT must be a valid port number")?,
            rust_log: lookup("RUST_LOG").unwrap_or_else(|| "info".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_lookup(lookup_from(&[("GATEWAY_URL", "http://gw")])).unwrap();
        assert_eq!(config.gateway_timeout, Duration::from_secs(60));
        assert_eq!(config.gateway_max_retries, 3);
        assert_eq!(config.session_idle_timeout, Duration::from_secs(1800));
        assert_eq!(config.default_locale, "en");
        assert_eq!(config.port, 8080);
        assert!(config.gateway_api_key.is_none());
    }

    #[test]
    fn test_missing_gateway_url_fails() {
        let err = Config::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(err.to_string().contains("GATEWAY_URL"));
    }

    #[test]
    fn test_invalid_timeout_fails() {
        let result = Config::from_lookup(lookup_from(&[
            ("GATEWAY_URL", "http://gw"),
            ("GATEWAY_TIMEOUT_SECS", "soon"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_blank_api_key_treated_as_absent() {
        let config = Config::from_lookup(lookup_from(&[
            ("GATEWAY_URL", "http://gw"),
            ("GATEWAY_API_KEY", "  "),
            ("DEFAULT_LOCALE", "de"),
        ]))
        .unwrap();
        assert!(config.gateway_api_key.is_none());
        assert_eq!(config.default_locale, "de");
    }
}
