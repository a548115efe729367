use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use layers::climate::{DEFAULT_API_BASE, DEFAULT_SCENARIO, DEFAULT_YEAR, template_vars};
use resilience::health::DEFAULT_HEALTH_INTERVAL;
use resilience::{ResilienceConfig, RetryPolicy};

/// Settings read from `CLIMATE_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolsConfig {
    pub api_base: String,
    pub session_dir: PathBuf,
    pub health_interval: Duration,
    pub request_timeout: Duration,
    pub scenario: String,
    pub year: u32,
}

impl ToolsConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            api_base: env_var_string(&lookup, "CLIMATE_API_BASE", DEFAULT_API_BASE),
            session_dir: PathBuf::from(env_var_string(&lookup, "CLIMATE_SESSION_DIR", "data/session")),
            health_interval: env_var_secs(&lookup, "CLIMATE_HEALTH_INTERVAL_SECS", DEFAULT_HEALTH_INTERVAL),
            request_timeout: env_var_secs(&lookup, "CLIMATE_REQUEST_TIMEOUT_SECS", Duration::from_secs(60)),
            scenario: env_var_string(&lookup, "CLIMATE_SCENARIO", DEFAULT_SCENARIO),
            year: env_var_u32(&lookup, "CLIMATE_YEAR", DEFAULT_YEAR),
        }
    }

    pub fn template_vars(&self) -> BTreeMap<String, String> {
        template_vars(&self.api_base, &self.scenario, self.year)
    }

    pub fn resilience(&self) -> ResilienceConfig {
        ResilienceConfig::default()
            .with_retry(RetryPolicy::default().with_attempt_timeout(self.request_timeout))
            .with_health_interval(self.health_interval)
    }
}

fn env_var_string(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_var_u32(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u32) -> u32 {
    lookup(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Whole seconds; zero or unparsable values fall back to `default`.
fn env_var_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    lookup(key)
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|s| *s > 0)
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = ToolsConfig::from_lookup(lookup(&[]));
        assert_eq!(cfg.api_base, DEFAULT_API_BASE);
        assert_eq!(cfg.health_interval, Duration::from_secs(30));
        assert_eq!(cfg.year, 2050);
        assert_eq!(cfg.session_dir, PathBuf::from("data/session"));
    }

    #[test]
    fn overrides_and_bad_values() {
        let cfg = ToolsConfig::from_lookup(lookup(&[
            ("CLIMATE_API_BASE", "http://climate.internal:8080/"),
            ("CLIMATE_HEALTH_INTERVAL_SECS", "0"),
            ("CLIMATE_REQUEST_TIMEOUT_SECS", "15"),
            ("CLIMATE_YEAR", "twenty-fifty"),
            ("CLIMATE_SCENARIO", "rcp85"),
        ]));
        assert_eq!(cfg.health_interval, Duration::from_secs(30));
        assert_eq!(cfg.request_timeout, Duration::from_secs(15));
        assert_eq!(cfg.year, 2050);
        assert_eq!(cfg.template_vars()["api_base"], "http://climate.internal:8080");
        assert_eq!(cfg.template_vars()["scenario"], "rcp85");
        assert_eq!(cfg.resilience().retry.attempt_timeout, Duration::from_secs(15));
    }
}
