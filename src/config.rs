use crate::error::{Result, ThrottleError};
use envconfig::Envconfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Limiter and backend settings. Every numeric setting must be strictly positive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Config {
    /// Capacity of a freshly created bucket
    #[validate(range(min = 1, message = "default_limit must be positive"))]
    pub default_limit: i64,

    /// Time to mint one token in a freshly created bucket
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "positive_duration", message = "default_refill must be positive"))]
    pub default_refill: Duration,

    /// Burst allowance above the steady rate
    #[validate(range(min = 1, message = "default_burst must be positive"))]
    pub default_burst: i64,

    /// Upper bound on keys tracked by the in-memory backend
    #[validate(range(min = 1, message = "max_keys must be positive"))]
    pub max_keys: usize,

    /// Idle sweep period; keys idle for twice this long are evicted
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "positive_duration", message = "cleanup_interval must be positive"))]
    pub cleanup_interval: Duration,

    #[serde(default)]
    pub redis: RedisSettings,
}

/// Connection settings for the Redis backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedisSettings {
    pub url: String,
    pub key_prefix: String,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_limit: 100,
            default_refill: Duration::from_secs(1),
            default_burst: 10,
            max_keys: 10_000,
            cleanup_interval: Duration::from_secs(5 * 60),
            redis: RedisSettings::default(),
        }
    }
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "tollgate:".to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Environment variables read by [`Config::from_env`].
#[derive(Debug, Envconfig)]
struct EnvSettings {
    #[envconfig(from = "TOLLGATE_DEFAULT_LIMIT", default = "100")]
    default_limit: i64,

    #[envconfig(from = "TOLLGATE_DEFAULT_REFILL", default = "1s")]
    default_refill: humantime::Duration,

    #[envconfig(from = "TOLLGATE_DEFAULT_BURST", default = "10")]
    default_burst: i64,

    #[envconfig(from = "TOLLGATE_MAX_KEYS", default = "10000")]
    max_keys: usize,

    #[envconfig(from = "TOLLGATE_CLEANUP_INTERVAL", default = "5m")]
    cleanup_interval: humantime::Duration,

    #[envconfig(from = "REDIS_URL", default = "redis://127.0.0.1:6379")]
    redis_url: String,

    #[envconfig(from = "TOLLGATE_KEY_PREFIX", default = "tollgate:")]
    key_prefix: String,

    #[envconfig(from = "TOLLGATE_REDIS_CONNECT_TIMEOUT", default = "5s")]
    redis_connect_timeout: humantime::Duration,
}

impl Config {
    /// Load configuration from environment variables and validate it
    pub fn from_env() -> Result<Self> {
        let env = EnvSettings::init_from_env()?;
        let config = Config {
            default_limit: env.default_limit,
            default_refill: env.default_refill.into(),
            default_burst: env.default_burst,
            max_keys: env.max_keys,
            cleanup_interval: env.cleanup_interval.into(),
            redis: RedisSettings {
                url: env.redis_url,
                key_prefix: env.key_prefix,
                connect_timeout: env.redis_connect_timeout.into(),
            },
        };
        config.validated()
    }

    /// Checks every limit and duration is positive.
    pub fn check(&self) -> Result<()> {
        Validate::validate(self).map_err(ThrottleError::from)
    }

    /// Consumes the config, returning it only if it passes [`Config::check`].
    pub fn validated(self) -> Result<Self> {
        self.check()?;
        Ok(self)
    }

    pub fn with_limit(&self, limit: i64) -> Self {
        Self {
            default_limit: limit,
            ..self.clone()
        }
    }

    pub fn with_refill(&self, refill: Duration) -> Self {
        Self {
            default_refill: refill,
            ..self.clone()
        }
    }

    pub fn with_burst(&self, burst: i64) -> Self {
        Self {
            default_burst: burst,
            ..self.clone()
        }
    }

    pub fn with_defaults(&self, limit: i64, refill: Duration, burst: i64) -> Self {
        Self {
            default_limit: limit,
            default_refill: refill,
            default_burst: burst,
            ..self.clone()
        }
    }

    pub fn with_cleanup(&self, cleanup_interval: Duration, max_keys: usize) -> Self {
        Self {
            cleanup_interval,
            max_keys,
            ..self.clone()
        }
    }

    pub fn with_redis(&self, url: impl Into<String>) -> Self {
        let mut config = self.clone();
        config.redis.url = url.into();
        config
    }

    /// Largest token count a single request may ask for.
    pub fn max_request_tokens(&self) -> i64 {
        self.default_limit.saturating_mul(10)
    }

    /// How long a key may go without a refill before it is evicted.
    pub fn idle_ttl(&self) -> Duration {
        self.cleanup_interval.saturating_mul(2)
    }
}

fn positive_duration(value: &Duration) -> std::result::Result<(), ValidationError> {
    if value.is_zero() {
        return Err(ValidationError::new("positive"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.check().is_ok());
        assert_eq!(config.default_limit, 100);
        assert_eq!(config.default_refill, Duration::from_secs(1));
        assert_eq!(config.default_burst, 10);
        assert_eq!(config.max_keys, 10_000);
        assert_eq!(config.cleanup_interval, Duration::from_secs(300));
        assert_eq!(config.max_request_tokens(), 1_000);
        assert_eq!(config.idle_ttl(), Duration::from_secs(600));
    }

    #[test]
    fn test_non_positive_values_fail() {
        let base = Config::default();
        let cases = vec![
            ("default_limit", base.with_limit(0)),
            ("default_limit", base.with_limit(-5)),
            ("default_refill", base.with_refill(Duration::ZERO)),
            ("default_burst", base.with_burst(0)),
            ("max_keys", base.with_cleanup(Duration::from_secs(1), 0)),
            ("cleanup_interval", base.with_cleanup(Duration::ZERO, 10)),
        ];

        for (field, config) in cases {
            let err = config.check().unwrap_err();
            assert!(err.is_validation(), "{} should be a validation error", field);
            match err {
                ThrottleError::Validation { field: f, message, .. } => {
                    assert_eq!(f, field);
                    assert_eq!(message, format!("{} must be positive", field));
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn test_builders_leave_receiver_untouched() {
        let base = Config::default();
        let changed = base.with_defaults(5, Duration::from_millis(200), 2);

        assert_eq!(base.default_limit, 100);
        assert_eq!(changed.default_limit, 5);
        assert_eq!(changed.default_refill, Duration::from_millis(200));
        assert_eq!(changed.default_burst, 2);

        let redis = base.with_redis("redis://cache:6379");
        assert_eq!(redis.redis.url, "redis://cache:6379");
        assert_eq!(base.redis.url, "redis://127.0.0.1:6379");
    }

    #[test]
    fn test_serde_roundtrip_uses_humantime() {
        let config = Config::default().with_refill(Duration::from_millis(250));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["default_refill"], "250ms");
        assert_eq!(json["cleanup_interval"], "5m");

        let parsed: Config = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }
}
