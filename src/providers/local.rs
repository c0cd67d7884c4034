//! Filesystem-backed provider
//!
//! Each resource is one JSON document under `root`, named after the
//! resource. Useful for rehearsing a declaration end to end without a live
//! cluster: outputs are the declared properties plus an `id` and a `status`
//! block, so references to either resolve.

use super::touches_immutable;
use declarative::{
    ApplyContext, ApplyRequest, Attributes, Operation, PropertyChange, Provider, ProviderError,
    ResolvedResource,
};
use serde_json::json;
use std::fs;
use std::io;
use std::path::PathBuf;

pub struct LocalProvider {
    name: String,
    root: PathBuf,
    immutable: Vec<String>,
}

impl LocalProvider {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>, immutable: Vec<String>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            immutable,
        }
    }

    fn document(&self, resource: &str) -> PathBuf {
        let file: String = resource
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(format!("{file}.json"))
    }
}

fn io_error(action: &str, path: &std::path::Path, e: &io::Error) -> ProviderError {
    let message = format!("{action} {}: {e}", path.display());
    match e.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            ProviderError::transient(message)
        }
        _ => ProviderError::permanent(message),
    }
}

impl Provider for LocalProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, request: &ApplyRequest, ctx: &ApplyContext) -> Result<Attributes, ProviderError> {
        ctx.check_cancelled()?;
        let resource = &request.resource;
        let path = self.document(&resource.name);

        let generation = match &request.operation {
            Operation::Create => 1,
            Operation::Update { prior } => {
                prior
                    .outputs
                    .get("status")
                    .and_then(|s| s.get("generation"))
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or(0)
                    + 1
            }
        };

        let mut outputs = resource.properties.clone();
        outputs.insert(
            "id".into(),
            json!(format!("{}/{}", resource.kind, resource.name)),
        );
        outputs.insert(
            "status".into(),
            json!({"phase": "Ready", "generation": generation}),
        );

        fs::create_dir_all(&self.root).map_err(|e| io_error("create", &self.root, &e))?;
        let document = json!({
            "kind": resource.kind,
            "outputs": outputs,
        });
        let content = serde_json::to_string_pretty(&document)
            .map_err(|e| ProviderError::permanent(format!("serialize {}: {e}", resource.name)))?;
        fs::write(&path, content).map_err(|e| io_error("write", &path, &e))?;

        log::debug!("{}: wrote {} (generation {generation})", self.name, path.display());
        Ok(outputs)
    }

    fn delete(&self, resource: &ResolvedResource, ctx: &ApplyContext) -> Result<(), ProviderError> {
        ctx.check_cancelled()?;
        let path = self.document(&resource.name);
        match fs::remove_file(&path) {
            Ok(()) => {
                log::debug!("{}: removed {}", self.name, path.display());
                Ok(())
            }
            // Already gone counts as deleted
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("remove", &path, &e)),
        }
    }

    fn requires_replacement(&self, _kind: &str, changes: &[PropertyChange]) -> bool {
        touches_immutable(&self.immutable, changes)
    }
}
