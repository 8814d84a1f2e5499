use crate::{env_or_default, env_parse_or_default, ConfigError, FromEnv};

/// Redis connection configuration
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
}

impl RedisConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            db: 0,
            password: None,
        }
    }

    /// Connection URI in the form `redis://[:password@]host:port/db`
    pub fn uri(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self::new("localhost", 6379)
    }
}

impl FromEnv for RedisConfig {
    /// Reads REDIS_HOST, REDIS_PORT, REDIS_DB and REDIS_PASSWORD.
    /// Only REDIS_HOST lacks a usable cluster default.
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env_or_default("REDIS_HOST", "localhost"),
            port: env_parse_or_default("REDIS_PORT", 6379)?,
            db: env_parse_or_default("REDIS_DB", 0)?,
            password: std::env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config_uri_without_password() {
        let config = RedisConfig::new("redis-email", 6379);
        assert_eq!(config.uri(), "redis://redis-email:6379/0");
    }

    #[test]
    fn test_redis_config_uri_with_password() {
        let mut config = RedisConfig::new("redis-email", 6380);
        config.password = Some("s3cret".to_string());
        config.db = 2;
        assert_eq!(config.uri(), "redis://:s3cret@redis-email:6380/2");
    }

    #[test]
    fn test_redis_config_from_env() {
        temp_env::with_vars(
            [
                ("REDIS_HOST", Some("redis.internal")),
                ("REDIS_PORT", Some("6380")),
                ("REDIS_DB", Some("1")),
                ("REDIS_PASSWORD", None),
            ],
            || {
                let config = RedisConfig::from_env().unwrap();
                assert_eq!(config.host, "redis.internal");
                assert_eq!(config.port, 6380);
                assert_eq!(config.db, 1);
                assert!(config.password.is_none());
            },
        );
    }

    #[test]
    fn test_redis_config_from_env_defaults() {
        temp_env::with_vars(
            [
                ("REDIS_HOST", None::<&str>),
                ("REDIS_PORT", None),
                ("REDIS_DB", None),
                ("REDIS_PASSWORD", None),
            ],
            || {
                let config = RedisConfig::from_env().unwrap();
                assert_eq!(config.host, "localhost");
                assert_eq!(config.port, 6379);
                assert_eq!(config.db, 0);
            },
        );
    }

    #[test]
    fn test_redis_config_from_env_bad_port() {
        temp_env::with_var("REDIS_PORT", Some("not-a-port"), || {
            let config = RedisConfig::from_env();
            assert!(config.is_err());
        });
    }

    #[test]
    fn test_redis_config_empty_password_ignored() {
        temp_env::with_var("REDIS_PASSWORD", Some(""), || {
            let config = RedisConfig::from_env().unwrap();
            assert!(config.password.is_none());
        });
    }
}
