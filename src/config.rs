use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use thiserror::Error;
use url::Url;

use crate::engine::MergePolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: invalid value {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Session credentials for the remote API. Threaded explicitly into the
/// HTTP gateway, never read from ambient state there.
#[derive(Clone, Default)]
pub struct Credentials {
    pub session_id: Option<String>,
    pub csrf_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("Credentials")
            .field("session_id", &redact(&self.session_id))
            .field("csrf_token", &redact(&self.csrf_token))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: Url,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Remote API; when unset the local store is used.
    pub api: Option<ApiConfig>,
    pub credentials: Credentials,
    /// Offset in which calendar days are read.
    pub utc_offset: FixedOffset,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
    pub policy: MergePolicy,
}

impl Config {
    pub const WAL_FILE: &'static str = "blocks.wal";

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(Self::WAL_FILE)
    }

    /// Read `BLOCKCAL_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let data_dir = get("BLOCKCAL_DATA_DIR").unwrap_or_else(|| "./data".into());

        let timeout_ms: u64 = parse_or("BLOCKCAL_API_TIMEOUT_MS", get("BLOCKCAL_API_TIMEOUT_MS"), 10_000)?;
        let api = match get("BLOCKCAL_API_URL") {
            Some(raw) => {
                let base_url = Url::parse(&raw).map_err(|e| invalid("BLOCKCAL_API_URL", &raw, e))?;
                if !matches!(base_url.scheme(), "http" | "https") {
                    return Err(invalid("BLOCKCAL_API_URL", &raw, "expected an http(s) URL"));
                }
                Some(ApiConfig {
                    base_url,
                    timeout: Duration::from_millis(timeout_ms),
                })
            }
            None => None,
        };

        let utc_offset = match get("BLOCKCAL_UTC_OFFSET") {
            Some(raw) => parse_offset(&raw).ok_or_else(|| invalid("BLOCKCAL_UTC_OFFSET", &raw, "expected ±HH:MM"))?,
            None => utc(),
        };

        let metrics_port = match get("BLOCKCAL_METRICS_PORT") {
            Some(raw) => Some(raw.parse().map_err(|e| invalid("BLOCKCAL_METRICS_PORT", &raw, e))?),
            None => None,
        };

        Ok(Self {
            data_dir: PathBuf::from(data_dir),
            api,
            credentials: Credentials {
                session_id: get("BLOCKCAL_SESSION_ID"),
                csrf_token: get("BLOCKCAL_CSRF_TOKEN"),
            },
            utc_offset,
            metrics_port,
            compact_threshold: parse_or("BLOCKCAL_COMPACT_THRESHOLD", get("BLOCKCAL_COMPACT_THRESHOLD"), 1000)?,
            policy: MergePolicy {
                combine_reasons: parse_bool("BLOCKCAL_COMBINE_REASONS", get("BLOCKCAL_COMBINE_REASONS"))?,
                reject_booking_overlap: parse_bool(
                    "BLOCKCAL_REJECT_BOOKING_OVERLAP",
                    get("BLOCKCAL_REJECT_BOOKING_OVERLAP"),
                )?,
            },
        })
    }
}

fn utc() -> FixedOffset {
    Utc.fix()
}

fn invalid(var: &'static str, value: &str, reason: impl fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_or<T>(var: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match raw {
        Some(raw) => raw.trim().parse().map_err(|e| invalid(var, &raw, e)),
        None => Ok(default),
    }
}

fn parse_bool(var: &'static str, raw: Option<String>) -> Result<bool, ConfigError> {
    let Some(raw) = raw else { return Ok(false) };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, &raw, "expected true or false")),
    }
}

/// `Z`, `+HH:MM`, `-HH:MM` or `+HHMM`.
pub fn parse_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return Some(utc());
    }
    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None if rest.len() == 4 => rest.split_at(2),
        None => (rest, "0"),
    };
    if hours.is_empty() || hours.len() > 2 || minutes.len() > 2 {
        return None;
    }
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 14 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}
