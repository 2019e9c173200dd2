//! Configuration for the orchestration runtime.
//!
//! Provides [`RuntimeConfig`], the process-wide overflow-threshold defaults
//! consulted by [`resolve_overflow_limits`], and the `$STEP_DEEPRESEARCH_CONFIG`
//! file lookup that populates it. Users construct or load this manually — no
//! TOML/YAML parsing dependencies are introduced.

use std::path::PathBuf;

/// Process-wide defaults for the context overflow manager's two thresholds.
///
/// Resolved once per process (or supplied directly) and consulted by
/// [`resolve_overflow_limits`] as the penultimate rung of the precedence
/// ladder: agent `extra_config.final_answer_context_{upper,lower}_limit` >
/// agent `extra_config.final_answer_context_threshold` > this struct's
/// `context_{upper,lower}_limit` > [`overflow::OverflowConfig`](crate::cloudllm::overflow::OverflowConfig)
/// defaults.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    pub context_upper_limit: Option<usize>,
    pub context_lower_limit: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            context_upper_limit: None,
            context_lower_limit: None,
        }
    }
}

/// Env var naming a config file to read.
pub const RUNTIME_CONFIG_ENV: &str = "STEP_DEEPRESEARCH_CONFIG";

/// Fallback path relative to the process's current directory, consulted
/// when `$STEP_DEEPRESEARCH_CONFIG` is unset.
pub const RUNTIME_CONFIG_DEFAULT_PATH: &str = "config.yaml";

impl RuntimeConfig {
    /// Resolve `$STEP_DEEPRESEARCH_CONFIG`, falling back to
    /// `<cwd>/config.yaml`, and parse `context_upper_limit` /
    /// `context_lower_limit` out of it.
    ///
    /// No YAML parser is introduced (none exists in the dependency stack
    /// this config layer was generalized from); the file is read as a
    /// minimal `key: value` per line format, which is valid YAML for the
    /// flat integer keys this runtime cares about. A missing or
    /// unparsable file yields [`RuntimeConfig::default()`] rather than an
    /// error — the caller falls through to built-in defaults.
    pub fn from_env() -> Self {
        let path = std::env::var(RUNTIME_CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(RUNTIME_CONFIG_DEFAULT_PATH));
        match std::fs::read_to_string(&path) {
            Ok(contents) => Self::parse_key_value(&contents),
            Err(_) => RuntimeConfig::default(),
        }
    }

    fn parse_key_value(contents: &str) -> Self {
        let mut config = RuntimeConfig::default();
        for line in contents.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            let parsed: Option<usize> = value.parse().ok();
            match key {
                "context_upper_limit" => config.context_upper_limit = parsed,
                "context_lower_limit" => config.context_lower_limit = parsed,
                _ => {}
            }
        }
        config
    }
}

/// Resolve the effective `(upper, lower)` overflow limits for one agent,
/// applying the precedence:
/// `extra_config.final_answer_context_{upper,lower}_limit` >
/// `extra_config.final_answer_context_threshold` > `RuntimeConfig` >
/// [`overflow::OverflowConfig`](crate::cloudllm::overflow::OverflowConfig)
/// defaults.
///
/// `extra_config.final_answer_context_threshold`, when present, sets the
/// upper limit directly and derives the lower limit as 90% of it, a
/// single-threshold convenience key alongside the explicit-pair keys.
pub fn resolve_overflow_limits(
    extra_config: &serde_json::Value,
    runtime: &RuntimeConfig,
    default_upper: usize,
    default_lower: usize,
) -> (usize, usize) {
    let agent_upper = extra_config
        .get("final_answer_context_upper_limit")
        .and_then(|v| v.as_u64())
        .map(|v| v as usize);
    let agent_lower = extra_config
        .get("final_answer_context_lower_limit")
        .and_then(|v| v.as_u64())
        .map(|v| v as usize);

    if let (Some(upper), Some(lower)) = (agent_upper, agent_lower) {
        return (upper, lower);
    }

    if let Some(threshold) = extra_config
        .get("final_answer_context_threshold")
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
    {
        let upper = agent_upper.unwrap_or(threshold);
        let lower = agent_lower.unwrap_or_else(|| ((threshold as f64) * 0.9) as usize);
        return (upper, lower);
    }

    let upper = agent_upper
        .or(runtime.context_upper_limit)
        .unwrap_or(default_upper);
    let lower = agent_lower
        .or(runtime.context_lower_limit)
        .unwrap_or(default_lower);
    (upper, lower)
}

#[cfg(test)]
mod runtime_config_tests {
    use super::*;

    #[test]
    fn explicit_agent_pair_wins_over_everything() {
        let extra = serde_json::json!({
            "final_answer_context_upper_limit": 500,
            "final_answer_context_lower_limit": 400,
            "final_answer_context_threshold": 999,
        });
        let runtime = RuntimeConfig { context_upper_limit: Some(10), context_lower_limit: Some(5) };
        let (upper, lower) = resolve_overflow_limits(&extra, &runtime, 100_000, 90_000);
        assert_eq!((upper, lower), (500, 400));
    }

    #[test]
    fn threshold_key_derives_lower_as_90_percent() {
        let extra = serde_json::json!({"final_answer_context_threshold": 1000});
        let runtime = RuntimeConfig::default();
        let (upper, lower) = resolve_overflow_limits(&extra, &runtime, 100_000, 90_000);
        assert_eq!(upper, 1000);
        assert_eq!(lower, 900);
    }

    #[test]
    fn runtime_config_wins_over_defaults() {
        let extra = serde_json::Value::Null;
        let runtime = RuntimeConfig { context_upper_limit: Some(2000), context_lower_limit: Some(1800) };
        let (upper, lower) = resolve_overflow_limits(&extra, &runtime, 100_000, 90_000);
        assert_eq!((upper, lower), (2000, 1800));
    }

    #[test]
    fn falls_back_to_defaults_when_nothing_configured() {
        let extra = serde_json::Value::Null;
        let runtime = RuntimeConfig::default();
        let (upper, lower) = resolve_overflow_limits(&extra, &runtime, 100_000, 90_000);
        assert_eq!((upper, lower), (100_000, 90_000));
    }

    #[test]
    fn parses_key_value_config_file_contents() {
        let config = RuntimeConfig::parse_key_value("context_upper_limit: 5000\ncontext_lower_limit: 4500\n");
        assert_eq!(config.context_upper_limit, Some(5000));
        assert_eq!(config.context_lower_limit, Some(4500));
    }
}
