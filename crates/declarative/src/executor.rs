//! Execution engine - schedules nodes over a worker pool as edges allow
//!
//! The coordinator runs on the caller's thread and is the only writer of
//! node states. Provider calls run as jobs on a rayon pool sized by
//! `jobs`; each job reports back over a channel. A node is dispatched the
//! moment its last blocker succeeds, so independent subgraphs never wait on
//! each other.
//!
//! What dispatching a node means is up to the [`Phase`]: the apply phase
//! resolves references and creates or updates, the teardown phase deletes.
//! Both share the same failure propagation and cancellation handling.

use crate::context::{CancelToken, RunObserver};
use crate::descriptor::Attributes;
use crate::error::{EngineError, NodeError, ProviderError};
use crate::graph::DependencyGraph;
use crate::retry::RetryCallback;
use crate::types::{Action, NodeReport, NodeState, RunReport};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::time::{Duration, Instant};

/// Ordering constraints for one run.
///
/// `blockers[n]` must all succeed before `n` starts; `unblocks[n]` is the
/// inverse relation.
#[derive(Debug, Clone)]
pub(crate) struct Schedule {
    names: Vec<String>,
    blockers: Vec<Vec<usize>>,
    unblocks: Vec<Vec<usize>>,
}

impl Schedule {
    /// Producers before consumers.
    pub(crate) fn forward(graph: &DependencyGraph) -> Self {
        let n = graph.len();
        Self {
            names: (0..n).map(|i| graph.name(i).to_string()).collect(),
            blockers: (0..n).map(|i| graph.dependencies(i).to_vec()).collect(),
            unblocks: (0..n).map(|i| graph.dependents(i).to_vec()).collect(),
        }
    }

    /// Consumers before producers, for teardown.
    ///
    /// `dependencies[n]` lists the nodes `n` depends on.
    pub(crate) fn reverse(names: Vec<String>, dependencies: Vec<Vec<usize>>) -> Self {
        let mut blockers = vec![Vec::new(); names.len()];
        for (node, deps) in dependencies.iter().enumerate() {
            for &dep in deps {
                blockers[dep].push(node);
            }
        }
        Self {
            names,
            blockers,
            unblocks: dependencies,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.names.len()
    }

    pub(crate) fn name(&self, node: usize) -> &str {
        &self.names[node]
    }
}

/// Result of one node's work.
#[derive(Debug)]
pub(crate) struct Completion {
    /// Outputs on success (`None` for deletes)
    pub result: Result<Option<Attributes>, NodeError>,
    /// Provider calls made for the main operation
    pub attempts: u32,
    /// Compensating deletion ran after a failed create
    pub rolled_back: bool,
    /// The resource recorded in state no longer exists remotely
    pub removed: bool,
}

impl Completion {
    pub(crate) fn succeeded(outputs: Option<Attributes>, attempts: u32) -> Self {
        Self {
            result: Ok(outputs),
            attempts,
            rolled_back: false,
            removed: false,
        }
    }

    pub(crate) fn failed(error: NodeError, attempts: u32) -> Self {
        Self {
            result: Err(error),
            attempts,
            rolled_back: false,
            removed: false,
        }
    }
}

/// Work shipped to the pool. Receives a callback for retry notifications.
pub(crate) type Job = Box<dyn FnOnce(&dyn RetryCallback) -> Completion + Send>;

/// What the phase decided for a node being dispatched.
pub(crate) enum Dispatch {
    /// Settled without a provider call
    Done(Action, Completion),
    /// Run on the pool
    Spawn(Action, Job),
}

/// Phase-specific behavior plugged into the coordinator.
///
/// All methods run on the coordinator thread.
pub(crate) trait Phase {
    /// Prepare the node's work. Called once, after every blocker succeeded.
    fn dispatch(&mut self, node: usize) -> Dispatch;

    /// The node succeeded.
    fn succeeded(
        &mut self,
        node: usize,
        action: Action,
        outputs: Option<Attributes>,
    ) -> Result<(), EngineError>;

    /// The node failed, directly or because a blocker failed.
    fn failed(&mut self, node: usize, error: &NodeError, removed: bool) -> Result<(), EngineError>;

    /// The run was cancelled before the node was dispatched.
    fn cancelled(&mut self, node: usize) -> Result<(), EngineError>;
}

enum Event {
    Retry {
        node: usize,
        attempt: u32,
        max_attempts: u32,
        error: ProviderError,
        delay: Duration,
    },
    Done {
        node: usize,
        completion: Completion,
    },
}

/// Forwards retry notifications from a worker to the coordinator.
struct RetryForwarder {
    node: usize,
    tx: Sender<Event>,
}

impl RetryCallback for RetryForwarder {
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &ProviderError, delay: Duration) {
        // The coordinator only goes away on an engine error; nothing to report to then
        let _ = self.tx.send(Event::Retry {
            node: self.node,
            attempt,
            max_attempts,
            error: error.clone(),
            delay,
        });
    }
}

/// Node state table, owned by the coordinator.
struct Coordinator<'a> {
    schedule: &'a Schedule,
    observer: &'a dyn RunObserver,
    states: Vec<NodeState>,
    reports: Vec<NodeReport>,
    waiting: Vec<usize>,
    ready: VecDeque<usize>,
    started: Instant,
}

impl<'a> Coordinator<'a> {
    fn new(schedule: &'a Schedule, observer: &'a dyn RunObserver) -> Self {
        let waiting: Vec<usize> = schedule.blockers.iter().map(Vec::len).collect();
        let ready = (0..schedule.len()).filter(|&n| waiting[n] == 0).collect();
        Self {
            schedule,
            observer,
            states: vec![NodeState::Pending; schedule.len()],
            reports: schedule
                .names
                .iter()
                .map(|name| NodeReport::pending(name.as_str()))
                .collect(),
            waiting,
            ready,
            started: Instant::now(),
        }
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn start(&mut self, node: usize, action: Action, at: Duration) {
        self.states[node] = NodeState::Provisioning;
        let report = &mut self.reports[node];
        report.state = NodeState::Provisioning;
        report.action = Some(action);
        report.started = Some(at);
        log::debug!("Dispatching {} ({action})", self.schedule.name(node));
        self.observer.on_node_start(self.schedule.name(node), action);
    }

    fn settle(&mut self, node: usize, state: NodeState, error: Option<NodeError>) {
        let now = self.elapsed();
        self.states[node] = state;
        let report = &mut self.reports[node];
        report.state = state;
        report.error = error;
        report.finished = Some(now);
        self.observer.on_node_finish(&self.reports[node]);
    }

    fn complete<P: Phase>(
        &mut self,
        phase: &mut P,
        node: usize,
        completion: Completion,
    ) -> Result<(), EngineError> {
        self.reports[node].attempts = completion.attempts;
        match completion.result {
            Ok(outputs) => {
                let action = self.reports[node].action.unwrap_or(Action::NoOp);
                phase.succeeded(node, action, outputs)?;
                self.settle(node, NodeState::Succeeded, None);

                let schedule = self.schedule;
                for &next in &schedule.unblocks[node] {
                    if self.states[next] != NodeState::Pending {
                        continue;
                    }
                    self.waiting[next] -= 1;
                    if self.waiting[next] == 0 {
                        self.ready.push_back(next);
                    }
                }
            }
            Err(error) if error.is_cancellation() && !completion.rolled_back => {
                log::warn!("{} cancelled in flight: {error}", self.schedule.name(node));
                phase.failed(node, &error, completion.removed)?;
                self.settle(node, NodeState::Cancelled, Some(error));
                self.propagate_cancellation(phase, node)?;
            }
            Err(error) => {
                log::warn!("{} failed: {error}", self.schedule.name(node));
                phase.failed(node, &error, completion.removed)?;
                let state = if completion.rolled_back {
                    NodeState::RolledBack
                } else {
                    NodeState::Failed
                };
                let root = match &error {
                    NodeError::DependencyFailed { root, .. } => root.clone(),
                    _ => self.schedule.name(node).to_string(),
                };
                self.settle(node, state, Some(error));
                self.propagate_failure(phase, node, &root)?;
            }
        }
        Ok(())
    }

    /// Cancel every transitive dependent that has not started.
    fn propagate_cancellation<P: Phase>(
        &mut self,
        phase: &mut P,
        origin: usize,
    ) -> Result<(), EngineError> {
        let schedule = self.schedule;
        let mut queue = VecDeque::from([origin]);
        while let Some(parent) = queue.pop_front() {
            for &child in &schedule.unblocks[parent] {
                if self.states[child] != NodeState::Pending {
                    continue;
                }
                phase.cancelled(child)?;
                self.settle(child, NodeState::Cancelled, None);
                queue.push_back(child);
            }
        }
        Ok(())
    }

    /// Fail every transitive dependent that has not started.
    fn propagate_failure<P: Phase>(
        &mut self,
        phase: &mut P,
        origin: usize,
        root: &str,
    ) -> Result<(), EngineError> {
        let schedule = self.schedule;
        let mut queue = VecDeque::from([origin]);
        while let Some(parent) = queue.pop_front() {
            for &child in &schedule.unblocks[parent] {
                if self.states[child] != NodeState::Pending {
                    continue;
                }
                let error = NodeError::DependencyFailed {
                    dependency: schedule.name(parent).to_string(),
                    root: root.to_string(),
                };
                log::debug!("{}: {error}", schedule.name(child));
                phase.failed(child, &error, false)?;
                self.settle(child, NodeState::Failed, Some(error));
                queue.push_back(child);
            }
        }
        Ok(())
    }
}

/// Drive `phase` over `schedule` until every node is terminal.
pub(crate) fn run<P: Phase>(
    schedule: &Schedule,
    phase: &mut P,
    jobs: usize,
    cancel: &CancelToken,
    observer: &dyn RunObserver,
) -> Result<RunReport, EngineError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs.max(1))
        .thread_name(|i| format!("declarative-worker-{i}"))
        .build()
        .map_err(|e| EngineError::Pool(e.to_string()))?;

    let (tx, rx) = mpsc::channel::<Event>();
    let mut coordinator = Coordinator::new(schedule, observer);
    let mut in_flight = 0usize;
    observer.on_run_start(schedule.len());
    log::debug!(
        "Scheduling {} node(s) on {} worker(s)",
        schedule.len(),
        jobs.max(1)
    );

    loop {
        while !cancel.is_cancelled() {
            let Some(node) = coordinator.ready.pop_front() else {
                break;
            };
            let at = coordinator.elapsed();
            match phase.dispatch(node) {
                Dispatch::Done(action, completion) => {
                    coordinator.start(node, action, at);
                    coordinator.complete(phase, node, completion)?;
                }
                Dispatch::Spawn(action, job) => {
                    coordinator.start(node, action, at);
                    in_flight += 1;
                    let tx = tx.clone();
                    pool.spawn(move || {
                        let forwarder = RetryForwarder {
                            node,
                            tx: tx.clone(),
                        };
                        let completion = panic::catch_unwind(AssertUnwindSafe(|| job(&forwarder)))
                            .unwrap_or_else(|_| {
                                Completion::failed(
                                    NodeError::Provider {
                                        error: ProviderError::permanent("provider panicked"),
                                        attempts: 1,
                                    },
                                    1,
                                )
                            });
                        let _ = tx.send(Event::Done { node, completion });
                    });
                }
            }
        }

        if in_flight == 0 {
            break;
        }

        match rx.recv() {
            Ok(Event::Done { node, completion }) => {
                in_flight -= 1;
                coordinator.complete(phase, node, completion)?;
            }
            Ok(Event::Retry {
                node,
                attempt,
                max_attempts,
                error,
                delay,
            }) => {
                log::info!(
                    "{}: attempt {attempt}/{max_attempts} failed ({error}), retrying in {delay:?}",
                    schedule.name(node)
                );
                observer.on_node_retry(schedule.name(node), attempt, max_attempts, &error, delay);
            }
            Err(_) => {
                return Err(EngineError::Invariant(
                    "worker channel closed with jobs in flight".to_string(),
                ));
            }
        }
    }

    for node in 0..schedule.len() {
        if coordinator.states[node] != NodeState::Pending {
            continue;
        }
        if !cancel.is_cancelled() {
            return Err(EngineError::Invariant(format!(
                "node '{}' was never scheduled",
                schedule.name(node)
            )));
        }
        phase.cancelled(node)?;
        coordinator.settle(node, NodeState::Cancelled, None);
    }

    if cancel.is_cancelled() {
        log::warn!("Run cancelled");
    }
    let elapsed = coordinator.elapsed();
    Ok(RunReport::new(coordinator.reports, elapsed))
}
