//! Synthetic provider with controllable delays and scripted failures.

use crate::context::ApplyContext;
use crate::descriptor::{Attributes, ResolvedResource};
use crate::diff::PropertyChange;
use crate::error::ProviderError;
use crate::provider::{ApplyRequest, Operation, Provider};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Call {
    pub op: Op,
    pub resource: String,
}

/// Echoes properties back with an `id` and a `status`, keeping a "live"
/// set of resources to check deletes against.
pub(crate) struct ScriptedProvider {
    name: String,
    delays: HashMap<String, Duration>,
    interruptible: HashSet<String>,
    immutable: Vec<String>,
    failures: Mutex<HashMap<String, VecDeque<ProviderError>>>,
    always_fail: HashMap<String, ProviderError>,
    delete_fail: HashMap<String, ProviderError>,
    calls: Mutex<Vec<Call>>,
    live: Mutex<BTreeMap<String, Attributes>>,
}

impl ScriptedProvider {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            delays: HashMap::new(),
            interruptible: HashSet::new(),
            immutable: Vec::new(),
            failures: Mutex::new(HashMap::new()),
            always_fail: HashMap::new(),
            delete_fail: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            live: Mutex::new(BTreeMap::new()),
        }
    }

    /// Sleep this long in every apply of `resource`
    pub(crate) fn delay(mut self, resource: &str, delay: Duration) -> Self {
        self.delays.insert(resource.to_string(), delay);
        self
    }

    /// Check the cancel token after the delay of `resource`
    pub(crate) fn interruptible(mut self, resource: &str) -> Self {
        self.interruptible.insert(resource.to_string());
        self
    }

    /// Changes under `path` force replacement
    pub(crate) fn immutable(mut self, path: &str) -> Self {
        self.immutable.push(path.to_string());
        self
    }

    /// Fail the next `times` applies of `resource` with `error`
    pub(crate) fn fail_times(self, resource: &str, times: usize, error: ProviderError) -> Self {
        self.failures
            .lock()
            .entry(resource.to_string())
            .or_default()
            .extend(std::iter::repeat_n(error, times));
        self
    }

    /// Fail every apply of `resource`
    pub(crate) fn fail_always(mut self, resource: &str, error: ProviderError) -> Self {
        self.always_fail.insert(resource.to_string(), error);
        self
    }

    /// Fail every delete of `resource`
    pub(crate) fn fail_delete(mut self, resource: &str, error: ProviderError) -> Self {
        self.delete_fail.insert(resource.to_string(), error);
        self
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub(crate) fn calls_for(&self, resource: &str) -> Vec<Op> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.resource == resource)
            .map(|c| c.op)
            .collect()
    }

    pub(crate) fn is_live(&self, resource: &str) -> bool {
        self.live.lock().contains_key(resource)
    }
}

impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, request: &ApplyRequest, ctx: &ApplyContext) -> Result<Attributes, ProviderError> {
        let resource = &request.resource;
        let op = match request.operation {
            Operation::Create => Op::Create,
            Operation::Update { .. } => Op::Update,
        };
        self.calls.lock().push(Call {
            op,
            resource: resource.name.clone(),
        });

        if let Some(delay) = self.delays.get(&resource.name) {
            thread::sleep(*delay);
        }
        if self.interruptible.contains(&resource.name) {
            ctx.check_cancelled()?;
        }

        if let Some(error) = self
            .failures
            .lock()
            .get_mut(&resource.name)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        if let Some(error) = self.always_fail.get(&resource.name) {
            return Err(error.clone());
        }

        let mut outputs = resource.properties.clone();
        outputs.insert("id".into(), json!(resource.name));
        outputs.insert("status".into(), json!({"phase": "Ready"}));
        self.live
            .lock()
            .insert(resource.name.clone(), outputs.clone());
        Ok(outputs)
    }

    fn delete(&self, resource: &ResolvedResource, _ctx: &ApplyContext) -> Result<(), ProviderError> {
        self.calls.lock().push(Call {
            op: Op::Delete,
            resource: resource.name.clone(),
        });
        if let Some(error) = self.delete_fail.get(&resource.name) {
            return Err(error.clone());
        }
        self.live.lock().remove(&resource.name);
        Ok(())
    }

    fn requires_replacement(&self, _kind: &str, changes: &[PropertyChange]) -> bool {
        changes
            .iter()
            .any(|change| self.immutable.iter().any(|path| change.touches(path)))
    }
}
