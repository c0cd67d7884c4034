//! Declaration file loading
//!
//! A declaration file names the project, tunes the run, configures
//! providers and lists resources and exports. TOML and JSON are both
//! accepted, chosen by file extension.

use anyhow::{Context, Result, bail};
use declarative::{
    Declaration, ExecuteOptions, ProviderConfig, ResourceDescriptor, RetryPolicy, Value,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Parsed declaration file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeelFile {
    /// Project name; also names the default state file
    pub name: String,
    #[serde(default)]
    pub settings: Settings,
    /// Values handed to every provider call
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSpec>,
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
    #[serde(default)]
    pub exports: BTreeMap<String, serde_json::Value>,
}

/// Run tuning.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub jobs: Option<usize>,
    #[serde(default)]
    pub rollback_on_failure: bool,
    pub prune_orphans: Option<bool>,
    #[serde(default)]
    pub retry: RetrySettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub backoff_factor: Option<f64>,
    pub max_delay_ms: Option<u64>,
}

/// One configured provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSpec {
    #[serde(flatten)]
    pub backend: Backend,
    /// Kinds routed to this provider; `prefix*` patterns allowed
    #[serde(default)]
    pub kinds: Vec<String>,
    /// Property paths whose change forces replacement
    #[serde(default)]
    pub immutable: Vec<String>,
    /// Handle kinds no other provider claims
    #[serde(default)]
    pub default: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backend {
    /// Filesystem-backed simulated remote
    Local { root: String },
    /// External program speaking JSON over stdin/stdout
    Exec {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// One declared resource.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceSpec {
    pub name: String,
    pub kind: String,
    pub provider: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl KeelFile {
    /// Load from disk, picking the format by extension.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        let file = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_toml(&content),
        }
        .with_context(|| format!("Invalid declaration in {}", path.display()))?;
        log::debug!(
            "Loaded '{}' from {}: {} resource(s), {} provider(s)",
            file.name,
            path.display(),
            file.resources.len(),
            file.providers.len()
        );
        Ok(file)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let file: Self = toml::from_str(content)?;
        file.check()?;
        Ok(file)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let file: Self = serde_json::from_str(content)?;
        file.check()?;
        Ok(file)
    }

    fn check(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("'name' must not be empty");
        }
        if self.name.contains(['/', '\\']) {
            bail!("'name' must not contain path separators: {}", self.name);
        }
        if let Some(factor) = self.settings.retry.backoff_factor
            && !(factor.is_finite() && factor >= 1.0)
        {
            bail!("'settings.retry.backoff_factor' must be a finite number >= 1.0, got {factor}");
        }
        Ok(())
    }

    /// Descriptors and exports, with `${...}` references parsed.
    pub fn declaration(&self) -> Result<Declaration> {
        let mut declaration = Declaration::new();
        for spec in &self.resources {
            let mut descriptor = ResourceDescriptor::new(&spec.name, &spec.kind);
            for (key, raw) in &spec.properties {
                let value = Value::parse(raw.clone())
                    .with_context(|| format!("Invalid property '{key}' on '{}'", spec.name))?;
                descriptor = descriptor.property(key, value);
            }
            for dependency in &spec.depends_on {
                descriptor = descriptor.depends_on(dependency);
            }
            if let Some(provider) = &spec.provider {
                descriptor = descriptor.provider(provider);
            }
            declaration = declaration.resource(descriptor);
        }
        for (name, raw) in &self.exports {
            let value = Value::parse(raw.clone())
                .with_context(|| format!("Invalid export '{name}'"))?;
            declaration = declaration.export(name, value);
        }
        Ok(declaration)
    }

    /// Run options from `[settings]`, falling back to engine defaults.
    pub fn execute_options(&self) -> ExecuteOptions {
        let defaults = ExecuteOptions::default();
        let retry = &self.settings.retry;
        let base = RetryPolicy::default();
        ExecuteOptions {
            jobs: self.settings.jobs.unwrap_or(defaults.jobs),
            retry: RetryPolicy {
                max_attempts: retry.max_attempts.unwrap_or(base.max_attempts),
                base_delay: retry
                    .base_delay_ms
                    .map_or(base.base_delay, Duration::from_millis),
                backoff_factor: retry.backoff_factor.unwrap_or(base.backoff_factor),
                max_delay: retry.max_delay_ms.map_or(base.max_delay, Duration::from_millis),
            },
            rollback_on_failure: self.settings.rollback_on_failure,
            prune_orphans: self.settings.prune_orphans.unwrap_or(defaults.prune_orphans),
        }
    }

    /// Provider configuration with `~` and environment variables expanded.
    pub fn provider_config(&self) -> ProviderConfig {
        self.config
            .iter()
            .map(|(key, value)| {
                let expanded = shellexpand::full(value)
                    .map(|v| v.into_owned())
                    .unwrap_or_else(|_| value.clone());
                (key.clone(), expanded)
            })
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
