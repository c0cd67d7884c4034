//! Persisted state snapshot and stores
//!
//! The snapshot remembers, per logical name, what was last applied (content
//! hash and resolved inputs) and what the provider returned. Re-applying
//! against it skips unchanged resources; resources present here but no
//! longer declared are orphans.

use crate::descriptor::{Attributes, ResolvedResource};
use crate::error::StateError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Version written by this build
pub const STATE_VERSION: u32 = 1;

// ============================================================================
// State Structures
// ============================================================================

/// Everything recorded about one applied resource
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ResourceRecord {
    /// Resource kind at the time of the apply
    pub kind: String,

    /// Provider that owns the resource
    pub provider: String,

    /// Content hash of the resolved descriptor
    pub content_hash: String,

    /// Resolved properties sent to the provider
    #[serde(default)]
    pub inputs: Attributes,

    /// Attributes the provider returned
    #[serde(default)]
    pub outputs: Attributes,

    /// Logical names this resource depended on, used for teardown order
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// When the resource was last created or updated
    pub updated_at: DateTime<Utc>,
}

impl ResourceRecord {
    /// The resource as last applied, for delete calls.
    pub fn to_resolved(&self, name: &str) -> ResolvedResource {
        ResolvedResource {
            name: name.to_string(),
            kind: self.kind.clone(),
            properties: self.inputs.clone(),
        }
    }
}

/// Snapshot of all applied resources and exported values
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StateSnapshot {
    /// Schema version
    pub version: u32,

    /// Records keyed by logical name
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceRecord>,

    /// Resolved exports from the last apply
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,

    /// Last time the state was updated
    pub last_updated: Option<DateTime<Utc>>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
            last_updated: None,
        }
    }
}

impl StateSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record for a resource
    pub fn get(&self, name: &str) -> Option<&ResourceRecord> {
        self.resources.get(name)
    }

    /// Insert or replace a record
    pub fn insert(&mut self, name: impl Into<String>, record: ResourceRecord) {
        self.resources.insert(name.into(), record);
    }

    /// Remove a record, returning it
    pub fn remove(&mut self, name: &str) -> Option<ResourceRecord> {
        self.resources.remove(name)
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Update the last_updated timestamp
    pub fn touch(&mut self) {
        self.last_updated = Some(Utc::now());
    }

    /// Recorded names not in `declared`, in teardown order.
    pub fn orphans<'a>(&self, declared: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let declared: BTreeSet<&str> = declared.into_iter().collect();
        let subset: BTreeSet<&str> = self
            .resources
            .keys()
            .map(String::as_str)
            .filter(|name| !declared.contains(name))
            .collect();
        self.teardown_order_of(&subset)
    }

    /// Every recorded name, dependents before their dependencies.
    pub fn teardown_order(&self) -> Vec<String> {
        let all: BTreeSet<&str> = self.resources.keys().map(String::as_str).collect();
        self.teardown_order_of(&all)
    }

    fn teardown_order_of(&self, subset: &BTreeSet<&str>) -> Vec<String> {
        // Count recorded dependents inside the subset
        let mut dependents: BTreeMap<&str, usize> = subset.iter().map(|n| (*n, 0)).collect();
        for name in subset {
            for dep in self.dependencies_within(name, subset) {
                if let Some(count) = dependents.get_mut(dep) {
                    *count += 1;
                }
            }
        }

        let mut ready: BTreeSet<&str> = dependents
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut order = Vec::with_capacity(subset.len());

        while let Some(name) = ready.pop_first() {
            order.push(name.to_string());
            for dep in self.dependencies_within(name, subset) {
                if let Some(count) = dependents.get_mut(dep) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dep);
                    }
                }
            }
        }

        // Corrupt state with a cycle: delete the rest by name
        if order.len() < subset.len() {
            log::warn!("State dependencies contain a cycle; deleting remaining resources by name");
            for name in subset {
                if !order.iter().any(|n| n == name) {
                    order.push((*name).to_string());
                }
            }
        }
        order
    }

    fn dependencies_within<'a>(&'a self, name: &str, subset: &BTreeSet<&'a str>) -> Vec<&'a str> {
        let mut deps: Vec<&'a str> = self
            .resources
            .get(name)
            .map(|record| {
                record
                    .dependencies
                    .iter()
                    .filter_map(|dep| subset.get(dep.as_str()).copied())
                    .collect()
            })
            .unwrap_or_default();
        deps.sort_unstable();
        deps.dedup();
        deps
    }
}

// ============================================================================
// Stores
// ============================================================================

/// Where snapshots are loaded from and saved to.
pub trait StateStore: Send + Sync {
    /// Load the snapshot, or an empty one if nothing was saved yet
    fn load(&self) -> Result<StateSnapshot, StateError>;

    /// Persist the snapshot
    fn save(&self, snapshot: &StateSnapshot) -> Result<(), StateError>;
}

/// JSON file store.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<StateSnapshot, StateError> {
        if !self.path.exists() {
            log::debug!(
                "State file {} does not exist, using empty state",
                self.path.display()
            );
            return Ok(StateSnapshot::new());
        }

        let content = fs::read_to_string(&self.path).map_err(|source| StateError::Read {
            path: self.path.clone(),
            source,
        })?;
        let snapshot: StateSnapshot =
            serde_json::from_str(&content).map_err(|source| StateError::Parse {
                path: self.path.clone(),
                source,
            })?;

        if snapshot.version != STATE_VERSION {
            return Err(StateError::Version {
                found: snapshot.version,
                expected: STATE_VERSION,
            });
        }

        log::debug!(
            "Loaded state from {} ({} resources)",
            self.path.display(),
            snapshot.resources.len()
        );
        Ok(snapshot)
    }

    fn save(&self, snapshot: &StateSnapshot) -> Result<(), StateError> {
        let write_err = |source| StateError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir).map_err(write_err)?;
        }

        let content = serde_json::to_string_pretty(snapshot).map_err(StateError::Serialize)?;

        // Write then rename so a crash never leaves a truncated file
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(write_err)?;
        fs::rename(&tmp, &self.path).map_err(write_err)?;

        log::debug!("Saved state to {}", self.path.display());
        Ok(())
    }
}

/// In-memory store, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    snapshot: Mutex<StateSnapshot>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing snapshot
    pub fn with_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }

    /// Copy of the current snapshot
    pub fn snapshot(&self) -> StateSnapshot {
        self.snapshot.lock().clone()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<StateSnapshot, StateError> {
        Ok(self.snapshot.lock().clone())
    }

    fn save(&self, snapshot: &StateSnapshot) -> Result<(), StateError> {
        *self.snapshot.lock() = snapshot.clone();
        Ok(())
    }
}
