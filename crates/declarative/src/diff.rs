//! Diff computation between last-applied and desired properties

use crate::descriptor::Attributes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One changed leaf (or whole subtree) of a resource's properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyChange {
    /// Dotted path of the changed property
    pub path: String,
    /// Value last applied, `None` if the property is new
    pub before: Option<serde_json::Value>,
    /// Desired value, `None` if the property was removed
    pub after: Option<serde_json::Value>,
}

impl PropertyChange {
    /// Check if this change adds a property
    pub fn is_addition(&self) -> bool {
        self.before.is_none() && self.after.is_some()
    }

    /// Check if this change removes a property
    pub fn is_removal(&self) -> bool {
        self.before.is_some() && self.after.is_none()
    }

    /// Whether this change touches `path` or anything below or above it.
    pub fn touches(&self, path: &str) -> bool {
        self.path == path
            || is_below(&self.path, path)
            || is_below(path, &self.path)
    }
}

fn is_below(path: &str, ancestor: &str) -> bool {
    path.strip_prefix(ancestor)
        .is_some_and(|rest| rest.starts_with('.'))
}

impl fmt::Display for PropertyChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.before, &self.after) {
            (None, Some(after)) => write!(f, "{}: {after}", self.path),
            (Some(before), None) => write!(f, "{}: {before} -> (removed)", self.path),
            (Some(before), Some(after)) => write!(f, "{}: {before} -> {after}", self.path),
            (None, None) => write!(f, "{}", self.path),
        }
    }
}

/// Compute the changes from `before` to `after`.
///
/// Objects are compared key by key; arrays and scalars are compared whole.
/// Changes are sorted by path.
pub fn diff_properties(before: &Attributes, after: &Attributes) -> Vec<PropertyChange> {
    let mut changes = Vec::new();
    diff_maps("", before, after, &mut changes);
    changes.sort_by(|a, b| a.path.cmp(&b.path));
    changes
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn diff_maps(prefix: &str, before: &Attributes, after: &Attributes, changes: &mut Vec<PropertyChange>) {
    for (key, old) in before {
        let path = join(prefix, key);
        match after.get(key) {
            None => changes.push(PropertyChange {
                path,
                before: Some(old.clone()),
                after: None,
            }),
            Some(new) => diff_values(path, old, new, changes),
        }
    }
    for (key, new) in after {
        if !before.contains_key(key) {
            changes.push(PropertyChange {
                path: join(prefix, key),
                before: None,
                after: Some(new.clone()),
            });
        }
    }
}

fn diff_values(
    path: String,
    before: &serde_json::Value,
    after: &serde_json::Value,
    changes: &mut Vec<PropertyChange>,
) {
    match (before, after) {
        (serde_json::Value::Object(old), serde_json::Value::Object(new)) => {
            diff_maps(&path, old, new, changes);
        }
        _ if before == after => {}
        _ => changes.push(PropertyChange {
            path,
            before: Some(before.clone()),
            after: Some(after.clone()),
        }),
    }
}

/// Diff summary statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSummary {
    /// Properties added
    pub additions: usize,
    /// Properties removed
    pub removals: usize,
    /// Properties changed
    pub modifications: usize,
}

impl DiffSummary {
    /// Create a summary from a list of changes
    pub fn from_changes(changes: &[PropertyChange]) -> Self {
        let mut summary = Self::default();
        for change in changes {
            if change.is_addition() {
                summary.additions += 1;
            } else if change.is_removal() {
                summary.removals += 1;
            } else {
                summary.modifications += 1;
            }
        }
        summary
    }

    /// Total number of changes
    pub fn total(&self) -> usize {
        self.additions + self.removals + self.modifications
    }

    /// Check if there are any changes
    pub fn has_changes(&self) -> bool {
        self.total() > 0
    }
}
