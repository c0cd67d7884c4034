//! Core types for runs: node states, actions, reports, options

use crate::error::NodeError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Lifecycle state of one node in a run.
///
/// `Pending -> Provisioning -> {Succeeded, Failed}`, `Failed -> RolledBack`
/// when compensating deletion ran. Nodes never dispatched before a
/// cancellation end `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Pending,
    Provisioning,
    Succeeded,
    Failed,
    RolledBack,
    Cancelled,
}

impl NodeState {
    /// Whether the node will not change state again in this run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::RolledBack | Self::Cancelled
        )
    }

    /// Whether the node ended in failure
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::RolledBack)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::RolledBack => "rolled back",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a run does (or would do) to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Not in state, create it
    Create,
    /// In state with different inputs, update in place
    Update,
    /// In state, but the change forces delete-then-create
    Replace,
    /// In state with an identical content hash
    NoOp,
    /// In state but no longer declared, or being destroyed
    Delete,
}

impl Action {
    /// Whether this action changes the remote system
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::NoOp)
    }

    /// Symbol used in plan output
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace => "-/+",
            Self::NoOp => " ",
            Self::Delete => "-",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::NoOp => "no-op",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal record of one node in a run.
#[derive(Debug, Clone)]
pub struct NodeReport {
    /// Logical name
    pub name: String,
    /// Terminal state
    pub state: NodeState,
    /// What was attempted, `None` if the node was never dispatched
    pub action: Option<Action>,
    /// Provider calls made for the main operation
    pub attempts: u32,
    /// Terminal error, if the node did not succeed
    pub error: Option<NodeError>,
    /// Offset from run start when the node entered Provisioning
    pub started: Option<Duration>,
    /// Offset from run start when the node reached its terminal state
    pub finished: Option<Duration>,
}

impl NodeReport {
    /// A report for a node that has not been dispatched yet.
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: NodeState::Pending,
            action: None,
            attempts: 0,
            error: None,
            started: None,
            finished: None,
        }
    }

    /// Time spent between dispatch and completion
    pub fn duration(&self) -> Option<Duration> {
        match (self.started, self.finished) {
            (Some(start), Some(end)) => Some(end.saturating_sub(start)),
            _ => None,
        }
    }
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Every node succeeded
    Succeeded,
    /// At least one node failed
    Failed,
    /// No failures, but the run was cancelled before every node ran
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-node terminal states plus the overall status.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Overall status
    pub status: RunStatus,
    /// One report per node, in scheduling declaration order
    pub nodes: Vec<NodeReport>,
    /// Wall-clock time of the run
    pub elapsed: Duration,
}

impl RunReport {
    /// Build a report, deriving the status from the node states.
    pub fn new(nodes: Vec<NodeReport>, elapsed: Duration) -> Self {
        let status = if nodes.iter().any(|n| n.state.is_failure()) {
            RunStatus::Failed
        } else if nodes.iter().all(|n| n.state == NodeState::Succeeded) {
            RunStatus::Succeeded
        } else {
            RunStatus::Cancelled
        };
        Self {
            status,
            nodes,
            elapsed,
        }
    }

    /// Whether every node succeeded
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Report for a node by name
    pub fn node(&self, name: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Nodes whose own operation failed (root causes)
    pub fn root_failures(&self) -> impl Iterator<Item = &NodeReport> {
        self.nodes.iter().filter(|n| {
            n.state.is_failure() && n.error.as_ref().is_some_and(|e| !e.is_dependency_failure())
        })
    }

    /// Nodes that were never attempted because a dependency failed
    pub fn skipped(&self) -> impl Iterator<Item = &NodeReport> {
        self.nodes
            .iter()
            .filter(|n| n.error.as_ref().is_some_and(NodeError::is_dependency_failure))
    }

    /// Failure path from `name` back to the node where the failure started.
    ///
    /// For a chain N -> D -> S -> R where D failed, `causal_chain("R")` is
    /// `["R", "S", "D"]`. Empty if the node did not fail.
    pub fn causal_chain(&self, name: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = self.node(name);
        while let Some(node) = current {
            if !node.state.is_failure() || chain.contains(&node.name) {
                break;
            }
            chain.push(node.name.clone());
            current = match &node.error {
                Some(NodeError::DependencyFailed { dependency, .. }) => self.node(dependency),
                _ => None,
            };
        }
        chain
    }

    /// Count results by outcome.
    pub fn summary(&self) -> ExecuteSummary {
        let mut summary = ExecuteSummary::default();
        for node in &self.nodes {
            summary.add_report(node);
        }
        summary
    }
}

/// Counts of node outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteSummary {
    pub created: usize,
    pub updated: usize,
    pub replaced: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

impl ExecuteSummary {
    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.created + self.updated + self.replaced + self.deleted
    }

    /// Check if execution was fully successful (no failures)
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }

    /// Total number of nodes counted
    pub fn total(&self) -> usize {
        self.total_changes() + self.unchanged + self.failed + self.skipped + self.cancelled
    }

    /// Merge another summary into this one
    pub fn merge(&mut self, other: &ExecuteSummary) {
        self.created += other.created;
        self.updated += other.updated;
        self.replaced += other.replaced;
        self.deleted += other.deleted;
        self.unchanged += other.unchanged;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.cancelled += other.cancelled;
    }

    /// Add a node report to the summary
    pub fn add_report(&mut self, report: &NodeReport) {
        match (report.state, report.action) {
            (NodeState::Succeeded, Some(Action::Create)) => self.created += 1,
            (NodeState::Succeeded, Some(Action::Update)) => self.updated += 1,
            (NodeState::Succeeded, Some(Action::Replace)) => self.replaced += 1,
            (NodeState::Succeeded, Some(Action::Delete)) => self.deleted += 1,
            (NodeState::Succeeded, _) => self.unchanged += 1,
            (NodeState::Cancelled | NodeState::Pending | NodeState::Provisioning, _) => {
                self.cancelled += 1;
            }
            (NodeState::Failed | NodeState::RolledBack, _) => {
                if report
                    .error
                    .as_ref()
                    .is_some_and(NodeError::is_dependency_failure)
                {
                    self.skipped += 1;
                } else {
                    self.failed += 1;
                }
            }
        }
    }
}

/// Options for execution
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Worker threads for provider calls
    pub jobs: usize,
    /// Retry policy for transient provider errors
    pub retry: RetryPolicy,
    /// Delete the remains of a failed create
    pub rollback_on_failure: bool,
    /// Delete resources that are in state but no longer declared
    pub prune_orphans: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            jobs: 4,
            retry: RetryPolicy::default(),
            rollback_on_failure: false,
            prune_orphans: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;

    fn finished(name: &str, state: NodeState, action: Action, error: Option<NodeError>) -> NodeReport {
        NodeReport {
            state,
            action: Some(action),
            error,
            ..NodeReport::pending(name)
        }
    }

    fn skipped(name: &str, dependency: &str, root: &str) -> NodeReport {
        NodeReport {
            state: NodeState::Failed,
            error: Some(NodeError::DependencyFailed {
                dependency: dependency.into(),
                root: root.into(),
            }),
            ..NodeReport::pending(name)
        }
    }

    fn failed_chain() -> RunReport {
        RunReport::new(
            vec![
                finished("N", NodeState::Succeeded, Action::Create, None),
                finished(
                    "D",
                    NodeState::Failed,
                    Action::Create,
                    Some(NodeError::Provider {
                        error: ProviderError::permanent("image pull rejected"),
                        attempts: 1,
                    }),
                ),
                skipped("S", "D", "D"),
                skipped("R", "S", "D"),
            ],
            Duration::from_millis(5),
        )
    }

    #[test]
    fn test_status_derivation() {
        let report = failed_chain();
        assert_eq!(report.status, RunStatus::Failed);

        let ok = RunReport::new(
            vec![finished("N", NodeState::Succeeded, Action::NoOp, None)],
            Duration::ZERO,
        );
        assert!(ok.is_success());

        let cancelled = RunReport::new(
            vec![
                finished("N", NodeState::Succeeded, Action::Create, None),
                NodeReport {
                    state: NodeState::Cancelled,
                    ..NodeReport::pending("D")
                },
            ],
            Duration::ZERO,
        );
        assert_eq!(cancelled.status, RunStatus::Cancelled);
    }

    #[test]
    fn test_causal_chain_walks_to_root() {
        let report = failed_chain();
        assert_eq!(report.causal_chain("R"), vec!["R", "S", "D"]);
        assert_eq!(report.causal_chain("D"), vec!["D"]);
        assert!(report.causal_chain("N").is_empty());
        assert!(report.causal_chain("missing").is_empty());

        let roots: Vec<_> = report.root_failures().map(|n| n.name.as_str()).collect();
        assert_eq!(roots, vec!["D"]);
        assert_eq!(report.skipped().count(), 2);
    }

    #[test]
    fn test_summary_counts() {
        let summary = failed_chain().summary();
        assert_eq!(summary.created, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.total(), 4);
        assert!(!summary.is_success());

        let mut merged = ExecuteSummary::default();
        merged.merge(&summary);
        merged.merge(&summary);
        assert_eq!(merged.skipped, 4);
    }

    #[test]
    fn test_node_duration() {
        let report = NodeReport {
            started: Some(Duration::from_millis(10)),
            finished: Some(Duration::from_millis(35)),
            ..NodeReport::pending("x")
        };
        assert_eq!(report.duration(), Some(Duration::from_millis(25)));
        assert_eq!(NodeReport::pending("y").duration(), None);
    }
}
