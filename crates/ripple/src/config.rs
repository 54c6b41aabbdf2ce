//! Router configuration.
//!
//! Only the router reads configuration. Values the engine needs, such as the
//! local region for same-region handlers, are threaded in from here rather
//! than looked up from the process environment at match time.

use crate::error::RouterError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub const DEFAULT_DEFER_QUEUE: &str = "ripple:deferred";

/// What the router does when a handler or a record fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Keep going and report failed records so the source retries them.
    #[default]
    ReportBatchItemFailures,
    /// Stop at the first failure and return it as an error.
    FailFast,
}

impl FromStr for FailurePolicy {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "report_batch_item_failures" | "report" => Ok(FailurePolicy::ReportBatchItemFailures),
            "fail_fast" => Ok(FailurePolicy::FailFast),
            other => Err(RouterError::Config(format!("unknown failure policy `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Region this router runs in. Same-region handlers skip records written
    /// elsewhere. `None` disables the check.
    pub region: Option<String>,
    pub failure_policy: FailurePolicy,
    /// Queue used by deferred handlers whose [`crate::DeferSpec`] names none.
    pub default_defer_queue: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            region: None,
            failure_policy: FailurePolicy::default(),
            default_defer_queue: DEFAULT_DEFER_QUEUE.to_string(),
        }
    }
}

impl RouterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read configuration from the environment.
    ///
    /// - `RIPPLE_REGION`, falling back to `AWS_REGION`
    /// - `RIPPLE_FAILURE_POLICY` (`report_batch_item_failures` or `fail_fast`)
    /// - `RIPPLE_DEFER_QUEUE`
    pub fn from_env() -> Result<Self, RouterError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, RouterError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        config.region = lookup("RIPPLE_REGION")
            .or_else(|| lookup("AWS_REGION"))
            .filter(|r| !r.is_empty());
        if let Some(policy) = lookup("RIPPLE_FAILURE_POLICY") {
            config.failure_policy = policy.parse()?;
        }
        if let Some(queue) = lookup("RIPPLE_DEFER_QUEUE").filter(|q| !q.is_empty()) {
            config.default_defer_queue = queue;
        }
        Ok(config)
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_default_defer_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_defer_queue = queue.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = RouterConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, RouterConfig::default());
        assert_eq!(config.default_defer_queue, DEFAULT_DEFER_QUEUE);
    }

    #[test]
    fn region_prefers_explicit_variable() {
        let config = RouterConfig::from_lookup(lookup(&[
            ("AWS_REGION", "us-east-1"),
            ("RIPPLE_REGION", "eu-west-1"),
        ]))
        .unwrap();
        assert_eq!(config.region.as_deref(), Some("eu-west-1"));

        let config = RouterConfig::from_lookup(lookup(&[("AWS_REGION", "us-east-1")])).unwrap();
        assert_eq!(config.region.as_deref(), Some("us-east-1"));
    }

    #[test]
    fn failure_policy_parses_or_errors() {
        let config =
            RouterConfig::from_lookup(lookup(&[("RIPPLE_FAILURE_POLICY", "fail-fast")])).unwrap();
        assert_eq!(config.failure_policy, FailurePolicy::FailFast);

        let err = RouterConfig::from_lookup(lookup(&[("RIPPLE_FAILURE_POLICY", "sometimes")]));
        assert!(matches!(err, Err(RouterError::Config(_))));
    }

    #[test]
    fn deserializes_partial_config() {
        let config: RouterConfig =
            serde_json::from_value(serde_json::json!({"region": "ap-south-1"})).unwrap();
        assert_eq!(config.region.as_deref(), Some("ap-south-1"));
        assert_eq!(config.failure_policy, FailurePolicy::ReportBatchItemFailures);
    }
}
