//! Controller configuration
//!
//! Every setting has a default and can be overridden with a `KOKEILU_*`
//! environment variable. A variable that is set but malformed is an error,
//! not a silent fallback.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got '{value}'")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Port of the health/metrics server
    pub health_port: u16,
    /// Experiments reconciled in parallel
    pub concurrency: u16,
    /// Analytics service used when an experiment names none
    pub analytics_endpoint: Option<String>,
    /// Request timeout of the analytics HTTP client
    pub analytics_timeout: Duration,
    /// Requeue delay after an analytics failure
    pub analytics_retry: Duration,
    /// Requeue delay after a reconcile error
    pub error_requeue: Duration,
    /// Upper bound on one reconcile pass
    pub pass_deadline: Duration,
    /// Restrict the controller to one namespace; all namespaces when None
    pub watch_namespace: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            health_port: 8080,
            concurrency: 4,
            analytics_endpoint: None,
            analytics_timeout: Duration::from_secs(10),
            analytics_retry: Duration::from_secs(5),
            error_requeue: Duration::from_secs(10),
            pass_deadline: Duration::from_secs(60),
            watch_namespace: None,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut config = Self::default();

        if let Some(port) = env.u16("KOKEILU_HEALTH_PORT")? {
            config.health_port = port;
        }
        if let Some(concurrency) = env.u16("KOKEILU_CONCURRENCY")? {
            config.concurrency = concurrency;
        }
        config.analytics_endpoint = env.string("KOKEILU_ANALYTICS_ENDPOINT");
        if let Some(secs) = env.seconds("KOKEILU_ANALYTICS_TIMEOUT_SECONDS")? {
            config.analytics_timeout = secs;
        }
        if let Some(secs) = env.seconds("KOKEILU_ANALYTICS_RETRY_SECONDS")? {
            config.analytics_retry = secs;
        }
        if let Some(secs) = env.seconds("KOKEILU_ERROR_REQUEUE_SECONDS")? {
            config.error_requeue = secs;
        }
        if let Some(secs) = env.seconds("KOKEILU_PASS_DEADLINE_SECONDS")? {
            config.pass_deadline = secs;
        }
        config.watch_namespace = env.string("KOKEILU_WATCH_NAMESPACE");

        Ok(config)
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn u16(&self, name: &'static str) -> Result<Option<u16>, ConfigError> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u16>().map(Some).map_err(|_| ConfigError::Invalid {
            name,
            expected: "an integer between 0 and 65535",
            value: v,
        })
    }

    /// Positive whole seconds
    fn seconds(&self, name: &'static str) -> Result<Option<Duration>, ConfigError> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        match v.parse::<u64>() {
            Ok(secs) if secs > 0 => Ok(Some(Duration::from_secs(secs))),
            _ => Err(ConfigError::Invalid {
                name,
                expected: "a positive number of seconds",
                value: v,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<ControllerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ControllerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults_without_environment() {
        assert_eq!(load(&[]).unwrap(), ControllerConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("KOKEILU_HEALTH_PORT", "9090"),
            ("KOKEILU_CONCURRENCY", "16"),
            ("KOKEILU_ANALYTICS_ENDPOINT", " http://analytics:8080 "),
            ("KOKEILU_ANALYTICS_RETRY_SECONDS", "2"),
            ("KOKEILU_WATCH_NAMESPACE", "bookinfo"),
        ])
        .unwrap();

        assert_eq!(config.health_port, 9090);
        assert_eq!(config.concurrency, 16);
        assert_eq!(
            config.analytics_endpoint.as_deref(),
            Some("http://analytics:8080")
        );
        assert_eq!(config.analytics_retry, Duration::from_secs(2));
        assert_eq!(config.watch_namespace.as_deref(), Some("bookinfo"));
        assert_eq!(config.pass_deadline, Duration::from_secs(60));
    }

    #[test]
    fn test_blank_values_are_unset() {
        let config = load(&[("KOKEILU_WATCH_NAMESPACE", "  "), ("KOKEILU_HEALTH_PORT", "")]).unwrap();
        assert_eq!(config.watch_namespace, None);
        assert_eq!(config.health_port, 8080);
    }

    #[test]
    fn test_malformed_values_are_errors() {
        let err = load(&[("KOKEILU_HEALTH_PORT", "eighty")]).unwrap_err();
        assert!(err.to_string().contains("KOKEILU_HEALTH_PORT"));

        assert!(load(&[("KOKEILU_PASS_DEADLINE_SECONDS", "0")]).is_err());
        assert!(load(&[("KOKEILU_ANALYTICS_TIMEOUT_SECONDS", "-3")]).is_err());
    }
}
