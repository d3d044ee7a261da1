//! Engine configuration.
use std::time::Duration;

use crate::error::ConfigError;

/// Output engine configuration.
///
/// Shared by every session of a server, see [`Config::from_env`] for the environment keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Pending output smaller than this is not sent unless flushed or final.
    pub postpone_output: usize,
    /// Response rate limit in bytes per second, `0` disables limiting.
    pub limit_rate: u64,
    /// Bytes sent before rate limiting starts.
    pub limit_rate_after: u64,
    /// Upper bound of bytes sent in a single writer invocation, `0` is unbounded.
    pub sendfile_max_chunk: u64,
    /// Maximum time a blocked writer waits for the peer.
    pub send_timeout: Duration,
    /// Subrequest budget of the main request.
    pub subrequests: u32,
    /// Internal redirect budget of every request.
    pub redirects: u8,
    /// Capture limit of in-memory subrequests.
    pub subrequest_output_buffer_size: usize,
    /// Memory budget of the connection pool, `0` is unbounded.
    pub pool_limit: usize,
    /// Maximum number of buffers gathered in one vectored send.
    pub max_iovecs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            postpone_output: 1460,
            limit_rate: 0,
            limit_rate_after: 0,
            sendfile_max_chunk: 2 * 1024 * 1024,
            send_timeout: Duration::from_secs(60),
            subrequests: 200,
            redirects: 10,
            subrequest_output_buffer_size: 4 * 1024,
            pool_limit: 0,
            max_iovecs: 64,
        }
    }
}

impl Config {
    /// Read configuration from `WEAVE_*` environment variables.
    ///
    /// Missing variables keep their default value.
    ///
    /// | key | value |
    /// | --- | --- |
    /// | `WEAVE_POSTPONE_OUTPUT` | size |
    /// | `WEAVE_LIMIT_RATE` | size |
    /// | `WEAVE_LIMIT_RATE_AFTER` | size |
    /// | `WEAVE_SENDFILE_MAX_CHUNK` | size |
    /// | `WEAVE_SEND_TIMEOUT` | duration |
    /// | `WEAVE_SUBREQUESTS` | number |
    /// | `WEAVE_REDIRECTS` | number |
    /// | `WEAVE_SUBREQUEST_OUTPUT_BUFFER_SIZE` | size |
    /// | `WEAVE_POOL_LIMIT` | size |
    /// | `WEAVE_MAX_IOVECS` | number |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        macro_rules! set {
            ($key:literal, $field:ident, $parse:ident) => {
                if let Some(value) = lookup($key) {
                    config.$field = $parse($key, &value)?.try_into().map_err(|_| {
                        ConfigError::InvalidNumber { key: $key, value: value.clone() }
                    })?;
                }
            };
        }

        set!("WEAVE_POSTPONE_OUTPUT", postpone_output, parse_size);
        set!("WEAVE_LIMIT_RATE", limit_rate, parse_size);
        set!("WEAVE_LIMIT_RATE_AFTER", limit_rate_after, parse_size);
        set!("WEAVE_SENDFILE_MAX_CHUNK", sendfile_max_chunk, parse_size);
        set!("WEAVE_SUBREQUESTS", subrequests, parse_number);
        set!("WEAVE_REDIRECTS", redirects, parse_number);
        set!("WEAVE_SUBREQUEST_OUTPUT_BUFFER_SIZE", subrequest_output_buffer_size, parse_size);
        set!("WEAVE_POOL_LIMIT", pool_limit, parse_size);
        set!("WEAVE_MAX_IOVECS", max_iovecs, parse_number);

        if let Some(value) = lookup("WEAVE_SEND_TIMEOUT") {
            config.send_timeout = parse_duration("WEAVE_SEND_TIMEOUT", &value)?;
        }

        if config.max_iovecs == 0 {
            return Err(ConfigError::InvalidNumber {
                key: "WEAVE_MAX_IOVECS",
                value: "0".into(),
            });
        }

        Ok(config)
    }
}

// ===== Parsing =====

/// Parse `"512"`, `"8k"` or `"1m"`.
fn parse_size(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    let err = || ConfigError::InvalidSize { key, value: value.into() };

    let value = value.trim();
    let (digits, scale) = match value.as_bytes().last() {
        Some(b'k' | b'K') => (&value[..value.len() - 1], 1024),
        Some(b'm' | b'M') => (&value[..value.len() - 1], 1024 * 1024),
        Some(_) => (value, 1),
        None => return Err(err()),
    };

    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(scale))
        .ok_or_else(err)
}

/// Parse `"250ms"`, `"30s"`, `"2m"`, bare numbers are seconds.
fn parse_duration(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let err = || ConfigError::InvalidDuration { key, value: value.into() };

    let value = value.trim();
    let (digits, millis) = if let Some(ms) = value.strip_suffix("ms") {
        (ms, 1)
    } else if let Some(s) = value.strip_suffix('s') {
        (s, 1000)
    } else if let Some(m) = value.strip_suffix('m') {
        (m, 60 * 1000)
    } else {
        (value, 1000)
    };

    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(millis))
        .map(Duration::from_millis)
        .ok_or_else(err)
}

fn parse_number(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidNumber { key, value: value.into() })
}
