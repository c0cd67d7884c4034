//! Built-in provider adapters and registry assembly

mod exec;
mod local;

pub use exec::ExecProvider;
pub use local::LocalProvider;

use crate::config::{Backend, KeelFile};
use crate::paths;
use anyhow::{Result, bail};
use declarative::{PropertyChange, ProviderRegistry, SharedProvider};
use std::path::Path;
use std::sync::Arc;

/// Build the registry for every `[providers.*]` entry.
///
/// Relative paths are anchored at `base_dir`, the declaration's directory.
pub fn registry(file: &KeelFile, base_dir: &Path) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    let mut default = None;

    for (name, spec) in &file.providers {
        let provider: SharedProvider = match &spec.backend {
            Backend::Local { root } => Arc::new(LocalProvider::new(
                name,
                paths::resolve(base_dir, root),
                spec.immutable.clone(),
            )),
            Backend::Exec { command, args } => {
                let command = if command.contains('/') {
                    paths::resolve(base_dir, command).to_string_lossy().into_owned()
                } else {
                    command.clone()
                };
                Arc::new(ExecProvider::new(
                    name,
                    command,
                    args.clone(),
                    spec.immutable.clone(),
                ))
            }
        };
        registry.register(provider);
        for kind in &spec.kinds {
            registry.route(kind, name);
        }
        if spec.default {
            if let Some(previous) = default.replace(name) {
                bail!("Providers '{previous}' and '{name}' are both marked default");
            }
            registry.set_default(name);
        }
    }

    log::debug!("Registered {} provider(s)", file.providers.len());
    Ok(registry)
}

/// Whether any change touches one of the immutable paths.
fn touches_immutable(immutable: &[String], changes: &[PropertyChange]) -> bool {
    changes
        .iter()
        .any(|change| immutable.iter().any(|path| change.touches(path)))
}
