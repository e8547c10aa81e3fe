use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanoutBackend {
    /// 仅在本进程内投递
    Local,
    /// 通过 Redis 发布订阅跨进程投递
    Redis,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub jwt_secret: String,
    pub access_token_expiration_secs: u64,
    pub refresh_token_expiration_secs: u64,
    pub rate_limit_window_secs: u64,
    pub rate_limit_requests: u32,
    pub server_host: String,
    pub server_port: u16,
    pub api_base_uri: String,
    pub cors_origin: String,
    pub location_flush_interval_ms: u64,
    pub fanout_backend: FanoutBackend,
    pub fanout_channel: String,
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        dotenv::dotenv().ok();

        let access_token_expiration = optional_var("JWT_ACCESS_TOKEN_EXPIRES_IN")
            .and_then(|raw| parse_duration_secs(&raw))
            .unwrap_or(15 * 60);
        let refresh_token_expiration = optional_var("JWT_REFRESH_TOKEN_EXPIRES_IN")
            .and_then(|raw| parse_duration_secs(&raw))
            .unwrap_or(30 * 24 * 3600);
        let fanout_backend = match optional_var("FANOUT_BACKEND").as_deref() {
            Some("local") => FanoutBackend::Local,
            _ => FanoutBackend::Redis,
        };

        Ok(Config {
            database_url: env::var("DATABASE_URL")?,
            redis_url: env::var("REDIS_URL")?,
            jwt_secret: env::var("JWT_SECRET")?,
            access_token_expiration_secs: access_token_expiration,
            refresh_token_expiration_secs: refresh_token_expiration,
            rate_limit_window_secs: optional_var("RATE_LIMIT_WINDOW")
                .and_then(|raw| parse_duration_secs(&raw))
                .unwrap_or(900),
            rate_limit_requests: optional_var("RATE_LIMIT_REQUESTS")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(100),
            server_host: optional_var("SERVER_HOST").unwrap_or_else(|| "::".into()),
            server_port: optional_var("SERVER_PORT")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(3000),
            api_base_uri: optional_var("API_BASE_URI").unwrap_or_else(|| "/api".into()),
            cors_origin: optional_var("CORS_ORIGIN").unwrap_or_else(|| "*".into()),
            location_flush_interval_ms: optional_var("LOCATION_FLUSH_INTERVAL_MS")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(2000),
            fanout_backend,
            fanout_channel: optional_var("FANOUT_CHANNEL")
                .unwrap_or_else(|| "travel:fanout".into()),
        })
    }

    pub fn access_token_expiration(&self) -> Duration {
        Duration::from_secs(self.access_token_expiration_secs)
    }

    pub fn refresh_token_expiration(&self) -> Duration {
        Duration::from_secs(self.refresh_token_expiration_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn location_flush_interval(&self) -> Duration {
        Duration::from_millis(self.location_flush_interval_ms)
    }
}

fn optional_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// 解析 `15m`、`30d`、`24h`、`900s` 或纯秒数
pub fn parse_duration_secs(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let (digits, unit) = match raw.char_indices().last()? {
        (idx, c) if c.is_ascii_alphabetic() => (&raw[..idx], c),
        _ => (raw, 's'),
    };
    let value: u64 = digits.trim().parse().ok()?;
    let multiplier = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        'd' => 86_400,
        _ => return None,
    };
    value.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_suffixed_durations() {
        assert_eq!(parse_duration_secs("15m"), Some(900));
        assert_eq!(parse_duration_secs("30d"), Some(2_592_000));
        assert_eq!(parse_duration_secs("24h"), Some(86_400));
        assert_eq!(parse_duration_secs("45s"), Some(45));
        assert_eq!(parse_duration_secs(" 120 "), Some(120));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_duration_secs(""), None);
        assert_eq!(parse_duration_secs("m"), None);
        assert_eq!(parse_duration_secs("10w"), None);
        assert_eq!(parse_duration_secs("abc"), None);
    }
}
