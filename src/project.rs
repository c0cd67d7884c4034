//! The declaration file plus everything derived from it for one command.

use crate::Context;
use crate::config::KeelFile;
use crate::paths;
use crate::providers;
use anyhow::{Context as _, Result};
use declarative::{Declaration, Engine, ExecuteOptions, FileStateStore};
use std::path::{Path, PathBuf};

pub struct Project {
    pub file: KeelFile,
    pub declaration: Declaration,
    /// Directory relative provider paths are anchored at
    pub base_dir: PathBuf,
    pub state_path: PathBuf,
}

impl Project {
    /// Load the declaration named by `--file` and locate its state.
    pub fn load(ctx: &Context) -> Result<Self> {
        let file = KeelFile::load(&ctx.file)?;
        let declaration = file.declaration()?;
        let base_dir = ctx
            .file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let state_path = match &ctx.state {
            Some(path) => path.clone(),
            None => paths::state_file(&file.name)?,
        };
        log::debug!("State file: {}", state_path.display());
        Ok(Self {
            file,
            declaration,
            base_dir,
            state_path,
        })
    }

    pub fn store(&self) -> FileStateStore {
        FileStateStore::new(&self.state_path)
    }

    /// Engine wired with this project's providers, config and options.
    pub fn engine(&self, options: ExecuteOptions) -> Result<Engine> {
        let registry = providers::registry(&self.file, &self.base_dir)
            .with_context(|| format!("Invalid providers in {}", self.file.name))?;
        Ok(Engine::new(registry)
            .with_config(self.file.provider_config())
            .with_options(options))
    }
}
