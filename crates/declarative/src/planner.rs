//! Execution planner - what an apply would do, without calling providers
//!
//! Planning walks the graph in topological order against the saved state.
//! A node whose producers are all unchanged is resolved from their recorded
//! outputs; anything fed by a changing producer is only known after apply.

use crate::descriptor::ResolvedResource;
use crate::diff::{PropertyChange, diff_properties};
use crate::error::EngineError;
use crate::graph::{DependencyGraph, GraphWarning};
use crate::provider::ProviderRegistry;
use crate::state::StateSnapshot;
use crate::types::Action;
use crate::value::Reference;
use std::collections::HashMap;

/// Placeholder for values that depend on a producer that is about to change.
pub const UNKNOWN: &str = "(known after apply)";

/// Planned action for one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanEntry {
    /// Logical name
    pub name: String,
    /// Resource kind
    pub kind: String,
    /// Provider that would handle it
    pub provider: String,
    /// What apply would do
    pub action: Action,
    /// Property changes against the last applied inputs
    pub changes: Vec<PropertyChange>,
    /// Some inputs depend on outputs of a changing producer
    pub pending_inputs: bool,
}

/// The dry-run result.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Declared resources in topological order, then orphans to delete
    pub entries: Vec<PlanEntry>,
    /// Graph validation warnings
    pub warnings: Vec<GraphWarning>,
}

impl Plan {
    /// Entry for a resource
    pub fn entry(&self, name: &str) -> Option<&PlanEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Check if applying would change anything
    pub fn has_changes(&self) -> bool {
        self.entries.iter().any(|e| e.action.is_change())
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for entry in &self.entries {
            match entry.action {
                Action::Create => summary.create += 1,
                Action::Update => summary.update += 1,
                Action::Replace => summary.replace += 1,
                Action::Delete => summary.delete += 1,
                Action::NoOp => summary.unchanged += 1,
            }
        }
        summary
    }
}

/// Plan summary statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub replace: usize,
    pub delete: usize,
    pub unchanged: usize,
}

impl PlanSummary {
    /// Total number of changes
    pub fn total_changes(&self) -> usize {
        self.create + self.update + self.replace + self.delete
    }
}

/// Compute the plan for `graph` against `state`.
pub fn plan(
    graph: &DependencyGraph,
    registry: &ProviderRegistry,
    state: &StateSnapshot,
    prune_orphans: bool,
) -> Result<Plan, EngineError> {
    let mut entries = Vec::with_capacity(graph.len());
    // Outputs of producers that will not change, by node index
    let mut known: HashMap<usize, serde_json::Value> = HashMap::new();

    for node in graph.topological_order() {
        let descriptor = graph.descriptor(node);
        let provider = registry.resolve(descriptor)?;
        let record = state.get(descriptor.name());

        let mut pending_inputs = false;
        let resolved = descriptor.resolve(&mut |reference: &Reference| {
            let outputs = graph
                .index_of(&reference.resource)
                .and_then(|producer| known.get(&producer));
            match outputs.map(|outputs| reference.extract(outputs)) {
                Some(Ok(value)) => Ok(value),
                _ => {
                    pending_inputs = true;
                    Ok(serde_json::Value::String(UNKNOWN.to_string()))
                }
            }
        });
        let resolved: ResolvedResource = resolved.map_err(|e| {
            EngineError::Invariant(format!("planning '{}': {e}", descriptor.name()))
        })?;

        let (action, changes) = match record {
            None => (Action::Create, Vec::new()),
            Some(record)
                if !pending_inputs
                    && record.kind == resolved.kind
                    && record.content_hash == resolved.content_hash() =>
            {
                (Action::NoOp, Vec::new())
            }
            Some(record) => {
                let changes = diff_properties(&record.inputs, &resolved.properties);
                let action = if record.kind != resolved.kind
                    || provider.requires_replacement(&resolved.kind, &changes)
                {
                    Action::Replace
                } else if changes.is_empty() {
                    Action::NoOp
                } else {
                    Action::Update
                };
                (action, changes)
            }
        };

        if action == Action::NoOp
            && let Some(record) = record
        {
            known.insert(node, serde_json::Value::Object(record.outputs.clone()));
        }

        entries.push(PlanEntry {
            name: descriptor.name().to_string(),
            kind: descriptor.kind().to_string(),
            provider: provider.name().to_string(),
            action,
            changes,
            pending_inputs,
        });
    }

    if prune_orphans {
        for name in state.orphans(graph.descriptors().map(|d| d.name())) {
            if let Some(record) = state.get(&name) {
                entries.push(PlanEntry {
                    kind: record.kind.clone(),
                    provider: record.provider.clone(),
                    action: Action::Delete,
                    changes: Vec::new(),
                    pending_inputs: false,
                    name,
                });
            }
        }
    }

    let plan = Plan {
        entries,
        warnings: graph.warnings().to_vec(),
    };
    log::debug!("Planned {} change(s)", plan.summary().total_changes());
    Ok(plan)
}
