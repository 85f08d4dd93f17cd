//! Environment-backed runtime configuration.

use std::{env, time::Duration};

use sync_core::{
    EntityId, FetchRetryPolicy, MAX_PAGE_LIMIT, PageRequest, ReconnectPolicy, SyncError,
    SyncErrorCategory,
};
use thiserror::Error;
use url::Url;

const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api/";
const DEFAULT_WS_BASE_URL: &str = "ws://localhost:8000/ws/";
const DEFAULT_CACHE_TTL_MS: u64 = 60_000;
const DEFAULT_CACHE_SWEEP_MS: u64 = 60_000;
const DEFAULT_FETCH_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_FETCH_BASE_DELAY_MS: u64 = 500;
const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;
const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;
const DEFAULT_RECONCILE_WINDOW_MS: u64 = 30_000;
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_PAGE_LIMIT: u16 = 20;

/// Runtime configuration shared by the fetch layer, connection manager and facades.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Base URL every REST path is joined onto.
    pub api_base_url: Url,
    /// Base URL push channel paths are joined onto.
    pub ws_base_url: Url,
    /// Sent as a bearer token on REST calls and as `?token=` on channel URLs.
    pub auth_token: Option<String>,
    /// When false, facades never open push channels and use REST only.
    pub live_channels: bool,
    pub cache_ttl_ms: u64,
    pub cache_sweep_ms: u64,
    pub fetch_max_attempts: u32,
    pub fetch_base_delay_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    /// How far apart a provisional message and its echo may be timestamped.
    pub reconcile_window_ms: u64,
    pub http_timeout_ms: u64,
    /// A push handshake still pending after this long is retried with backoff.
    pub handshake_timeout_ms: u64,
    /// Default page size for list loads, clamped to `1..=100`.
    pub page_limit: u16,
}

impl SyncConfig {
    /// Parse configuration from `SYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Parse configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let api_base_url = parse_base_url("SYNC_API_BASE_URL", DEFAULT_API_BASE_URL, &mut lookup)?;
        let ws_base_url = parse_base_url("SYNC_WS_BASE_URL", DEFAULT_WS_BASE_URL, &mut lookup)?;
        let auth_token = optional_trimmed_env("SYNC_AUTH_TOKEN", &mut lookup);
        let live_channels = parse_bool("SYNC_LIVE_CHANNELS", true, &mut lookup)?;

        let cache_ttl_ms = parse_u64("SYNC_CACHE_TTL_MS", DEFAULT_CACHE_TTL_MS, &mut lookup)?;
        let cache_sweep_ms = parse_u64("SYNC_CACHE_SWEEP_MS", DEFAULT_CACHE_SWEEP_MS, &mut lookup)?;
        let fetch_max_attempts = parse_u64(
            "SYNC_FETCH_MAX_ATTEMPTS",
            u64::from(DEFAULT_FETCH_MAX_ATTEMPTS),
            &mut lookup,
        )?;
        let fetch_base_delay_ms = parse_u64(
            "SYNC_FETCH_BASE_DELAY_MS",
            DEFAULT_FETCH_BASE_DELAY_MS,
            &mut lookup,
        )?;
        let reconnect_base_ms =
            parse_u64("SYNC_RECONNECT_BASE_MS", DEFAULT_RECONNECT_BASE_MS, &mut lookup)?;
        let reconnect_max_ms =
            parse_u64("SYNC_RECONNECT_MAX_MS", DEFAULT_RECONNECT_MAX_MS, &mut lookup)?;
        let reconcile_window_ms = parse_u64(
            "SYNC_RECONCILE_WINDOW_MS",
            DEFAULT_RECONCILE_WINDOW_MS,
            &mut lookup,
        )?;
        let http_timeout_ms =
            parse_u64("SYNC_HTTP_TIMEOUT_MS", DEFAULT_HTTP_TIMEOUT_MS, &mut lookup)?;
        let handshake_timeout_ms = parse_u64(
            "SYNC_HANDSHAKE_TIMEOUT_MS",
            DEFAULT_HANDSHAKE_TIMEOUT_MS,
            &mut lookup,
        )?;
        let page_limit = parse_u64("SYNC_PAGE_LIMIT", u64::from(DEFAULT_PAGE_LIMIT), &mut lookup)?;

        let fetch_max_attempts = match u32::try_from(fetch_max_attempts) {
            Ok(value) if value >= 1 => value,
            _ => {
                return Err(ConfigError::InvalidValue {
                    key: "SYNC_FETCH_MAX_ATTEMPTS",
                    value: fetch_max_attempts.to_string(),
                    reason: "must be between 1 and 4294967295".to_owned(),
                });
            }
        };
        if reconnect_base_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SYNC_RECONNECT_BASE_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if reconnect_max_ms < reconnect_base_ms {
            return Err(ConfigError::InvalidValue {
                key: "SYNC_RECONNECT_MAX_MS",
                value: reconnect_max_ms.to_string(),
                reason: format!("must not be below SYNC_RECONNECT_BASE_MS ({reconnect_base_ms})"),
            });
        }
        if handshake_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SYNC_HANDSHAKE_TIMEOUT_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if cache_sweep_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SYNC_CACHE_SWEEP_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        let page_limit = PageRequest::bounded_limit(
            u16::try_from(page_limit).unwrap_or(u16::MAX),
            MAX_PAGE_LIMIT,
        );

        Ok(Self {
            api_base_url,
            ws_base_url,
            auth_token,
            live_channels,
            cache_ttl_ms,
            cache_sweep_ms,
            fetch_max_attempts,
            fetch_base_delay_ms,
            reconnect_base_ms,
            reconnect_max_ms,
            reconcile_window_ms,
            http_timeout_ms,
            handshake_timeout_ms,
            page_limit,
        })
    }

    pub fn fetch_policy(&self) -> FetchRetryPolicy {
        FetchRetryPolicy::new(self.fetch_max_attempts, self.fetch_base_delay_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(self.reconnect_base_ms, self.reconnect_max_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.cache_sweep_ms)
    }

    pub fn reconcile_window(&self) -> Duration {
        Duration::from_millis(self.reconcile_window_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// First page at the configured size.
    pub fn first_page(&self) -> PageRequest {
        PageRequest::new(1, self.page_limit)
    }

    /// Push channel URL for one user's notifications.
    pub fn notifications_url(&self, user_id: &EntityId) -> Result<String, SyncError> {
        self.channel_url(&format!("notifications/{user_id}/"))
    }

    /// Push channel URL for one conversation.
    pub fn chat_url(&self, conversation_id: &EntityId) -> Result<String, SyncError> {
        self.channel_url(&format!("chat/{conversation_id}/"))
    }

    fn channel_url(&self, path: &str) -> Result<String, SyncError> {
        let mut url = self.ws_base_url.join(path).map_err(|e| {
            SyncError::new(
                SyncErrorCategory::Config,
                "invalid_channel_url",
                format!("{path}: {e}"),
            )
        })?;
        if let Some(token) = &self.auth_token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url.into())
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_u64<F>(key: &'static str, default: u64, lookup: &mut F) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value
        .parse::<u64>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_bool<F>(key: &'static str, default: bool, lookup: &mut F) -> Result<bool, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected true/false".to_owned(),
        }),
    }
}

fn parse_base_url<F>(key: &'static str, default: &str, lookup: &mut F) -> Result<Url, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let raw = optional_trimmed_env(key, lookup).unwrap_or_else(|| default.to_owned());
    let mut url = Url::parse(&raw).map_err(|err| ConfigError::InvalidValue {
        key,
        value: raw.clone(),
        reason: err.to_string(),
    })?;
    if url.cannot_be_a_base() {
        return Err(ConfigError::InvalidValue {
            key,
            value: raw,
            reason: "must be a hierarchical URL".to_owned(),
        });
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<SyncConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        SyncConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn parses_defaults_without_environment() {
        let cfg = config_from_pairs(&[]).expect("defaults should parse");
        assert_eq!(cfg.api_base_url.as_str(), DEFAULT_API_BASE_URL);
        assert!(cfg.live_channels);
        assert_eq!(cfg.fetch_policy(), FetchRetryPolicy::new(3, 500));
        assert_eq!(cfg.reconnect_policy(), ReconnectPolicy::new(1_000, 30_000));
        assert_eq!(cfg.reconcile_window(), Duration::from_secs(30));
        assert_eq!(cfg.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.page_limit, DEFAULT_PAGE_LIMIT);
        assert_eq!(cfg.first_page(), PageRequest::new(1, DEFAULT_PAGE_LIMIT));
    }

    #[test]
    fn parses_tuning_when_present() {
        let cfg = config_from_pairs(&[
            ("SYNC_API_BASE_URL", "https://api.example.com/v1"),
            ("SYNC_LIVE_CHANNELS", "off"),
            ("SYNC_FETCH_MAX_ATTEMPTS", "5"),
            ("SYNC_RECONNECT_BASE_MS", "250"),
            ("SYNC_RECONNECT_MAX_MS", "4000"),
            ("SYNC_HANDSHAKE_TIMEOUT_MS", "2500"),
            ("SYNC_PAGE_LIMIT", "500"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.api_base_url.as_str(), "https://api.example.com/v1/");
        assert!(!cfg.live_channels);
        assert_eq!(cfg.fetch_max_attempts, 5);
        assert_eq!(cfg.reconnect_policy(), ReconnectPolicy::new(250, 4_000));
        assert_eq!(cfg.handshake_timeout(), Duration::from_millis(2_500));
        assert_eq!(cfg.page_limit, 100);
    }

    #[test]
    fn rejects_invalid_numbers_and_flags() {
        let err = config_from_pairs(&[("SYNC_CACHE_TTL_MS", "soon")])
            .expect_err("ttl must be numeric");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "SYNC_CACHE_TTL_MS",
                ..
            }
        ));

        let err = config_from_pairs(&[("SYNC_LIVE_CHANNELS", "maybe")])
            .expect_err("flag must be boolean");
        assert!(err.to_string().contains("SYNC_LIVE_CHANNELS"));

        config_from_pairs(&[("SYNC_FETCH_MAX_ATTEMPTS", "0")])
            .expect_err("at least one attempt is required");
        config_from_pairs(&[("SYNC_RECONNECT_BASE_MS", "5000"), ("SYNC_RECONNECT_MAX_MS", "10")])
            .expect_err("max delay must cover base delay");
        config_from_pairs(&[("SYNC_HANDSHAKE_TIMEOUT_MS", "0")])
            .expect_err("handshake timeout must be positive");
    }

    #[test]
    fn builds_channel_urls_with_token() {
        let cfg = config_from_pairs(&[
            ("SYNC_WS_BASE_URL", "wss://push.example.com/ws"),
            ("SYNC_AUTH_TOKEN", "abc"),
        ])
        .expect("config should parse");

        assert_eq!(
            cfg.notifications_url(&EntityId::from(42))
                .expect("notifications url"),
            "wss://push.example.com/ws/notifications/42/?token=abc"
        );
        assert_eq!(
            cfg.chat_url(&EntityId::from(5)).expect("chat url"),
            "wss://push.example.com/ws/chat/5/?token=abc"
        );
    }
}
