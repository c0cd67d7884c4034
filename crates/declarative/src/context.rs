//! Apply context and observer traits
//!
//! These types allow the declarative crate to be used without depending on
//! a particular UI, credential source, or signal handler. Provider
//! configuration is an explicit value handed to every call, never global
//! state.

use crate::error::ProviderError;
use crate::types::{Action, NodeReport};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Key/value configuration shared by providers (e.g. a kubeconfig path).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderConfig {
    values: BTreeMap<String, String>,
}

impl ProviderConfig {
    /// Create an empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Set a value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Look up a value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Look up a value a provider cannot work without.
    pub fn require(&self, key: &str) -> Result<&str, ProviderError> {
        self.get(key)
            .ok_or_else(|| ProviderError::permanent(format!("missing provider config '{key}'")))
    }

    /// Iterate in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, String)> for ProviderConfig {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Cooperative cancellation flag shared between the caller, the scheduler
/// and providers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Progress notifications for a run.
///
/// Called from the coordinating thread only, in the order events happen.
pub trait RunObserver: Send + Sync {
    /// Called when the run starts with the number of nodes to schedule
    fn on_run_start(&self, _nodes: usize) {}

    /// Called when a node enters Provisioning
    fn on_node_start(&self, _name: &str, _action: Action) {}

    /// Called when a provider call failed transiently and will be retried
    fn on_node_retry(
        &self,
        _name: &str,
        _attempt: u32,
        _max_attempts: u32,
        _error: &ProviderError,
        _delay: Duration,
    ) {
    }

    /// Called when a node reaches a terminal state
    fn on_node_finish(&self, _report: &NodeReport) {}
}

/// No-op observer
pub struct NoProgress;

impl RunObserver for NoProgress {}

/// Context passed to provider operations
#[derive(Debug, Clone, Copy)]
pub struct ApplyContext<'a> {
    /// Logical name of the resource being operated on
    pub resource: &'a str,
    /// Explicit provider configuration
    pub config: &'a ProviderConfig,
    /// Cancellation flag for long-running calls
    pub cancel: &'a CancelToken,
}

impl<'a> ApplyContext<'a> {
    /// Create a new apply context
    pub fn new(resource: &'a str, config: &'a ProviderConfig, cancel: &'a CancelToken) -> Self {
        Self {
            resource,
            config,
            cancel,
        }
    }

    /// Fail fast if the run was cancelled.
    pub fn check_cancelled(&self) -> Result<(), ProviderError> {
        if self.cancel.is_cancelled() {
            Err(ProviderError::cancelled(format!(
                "operation on '{}' cancelled",
                self.resource
            )))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_config_lookup() {
        let config = ProviderConfig::new().with("kubeconfig", "/home/me/.kube/config");
        assert_eq!(config.get("kubeconfig"), Some("/home/me/.kube/config"));
        assert!(config.require("context").is_err());
        assert_eq!(config.iter().count(), 1);
    }

    #[test]
    fn test_cancel_token_shared_between_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());

        let config = ProviderConfig::new();
        let ctx = ApplyContext::new("demo", &config, &other);
        assert!(ctx.check_cancelled().unwrap_err().is_cancelled());
    }
}
