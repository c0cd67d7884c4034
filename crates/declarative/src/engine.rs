//! Engine facade: validate, plan, apply, destroy
//!
//! An [`Engine`] owns the provider registry, the explicit provider
//! configuration and run options. Every entry point builds and validates the
//! graph first, so build errors and missing providers surface before any
//! provider call.

use crate::cell::Outcome;
use crate::context::{ApplyContext, CancelToken, NoProgress, ProviderConfig, RunObserver};
use crate::descriptor::{Attributes, Declaration, ResolvedResource};
use crate::diff::diff_properties;
use crate::error::{CellError, EngineError, NodeError, Result};
use crate::executor::{self, Completion, Dispatch, Job, Phase, Schedule};
use crate::graph::{DependencyGraph, GraphWarning};
use crate::planner::{self, Plan};
use crate::provider::{ApplyRequest, Operation, PriorState, ProviderRegistry, SharedProvider};
use crate::retry::{RetryCallback, RetryPolicy, with_retry};
use crate::run::ApplyRun;
use crate::state::{ResourceRecord, StateSnapshot, StateStore};
use crate::types::{Action, ExecuteOptions, RunReport};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

/// Everything an apply produced.
#[derive(Debug)]
pub struct ApplyOutcome {
    /// Terminal state of every node, orphan deletions included
    pub report: RunReport,
    /// Export values, resolved or failed
    pub exports: BTreeMap<String, Outcome<serde_json::Value>>,
    /// Node outputs, for nodes whose cells settled
    pub outputs: BTreeMap<String, Outcome<serde_json::Value>>,
    /// Graph validation warnings
    pub warnings: Vec<GraphWarning>,
}

/// Declarative provisioning engine.
pub struct Engine {
    registry: ProviderRegistry,
    config: Arc<ProviderConfig>,
    options: ExecuteOptions,
    cancel: CancelToken,
    observer: Arc<dyn RunObserver>,
}

impl Engine {
    /// Create an engine with default options.
    pub fn new(registry: ProviderRegistry) -> Self {
        Self {
            registry,
            config: Arc::new(ProviderConfig::new()),
            options: ExecuteOptions::default(),
            cancel: CancelToken::new(),
            observer: Arc::new(NoProgress),
        }
    }

    pub fn with_config(mut self, config: ProviderConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn with_options(mut self, options: ExecuteOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels runs of this engine
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn options(&self) -> &ExecuteOptions {
        &self.options
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Build the graph, check exports, and check every resource has a provider.
    pub fn validate(&self, declaration: &Declaration) -> Result<DependencyGraph> {
        let graph = DependencyGraph::build(declaration.resources.clone())?;
        graph.validate_exports(&declaration.exports)?;
        for descriptor in graph.descriptors() {
            self.registry.resolve(descriptor)?;
        }
        for warning in graph.warnings() {
            log::info!("{warning}");
        }
        Ok(graph)
    }

    /// What apply would do against `state`, without calling any provider.
    pub fn plan(&self, declaration: &Declaration, state: &StateSnapshot) -> Result<Plan> {
        let graph = self.validate(declaration)?;
        planner::plan(&graph, &self.registry, state, self.options.prune_orphans)
    }

    /// Converge the remote system to `declaration`.
    ///
    /// State is saved even when nodes fail, so the next apply picks up
    /// where this one stopped.
    pub fn apply(&self, declaration: &Declaration, store: &dyn StateStore) -> Result<ApplyOutcome> {
        let started = Instant::now();
        let graph = self.validate(declaration)?;
        let providers = graph
            .descriptors()
            .map(|d| self.registry.resolve(d))
            .collect::<Result<Vec<_>>>()?;

        let mut snapshot = store.load()?;
        let orphans = if self.options.prune_orphans {
            snapshot.orphans(graph.descriptors().map(|d| d.name()))
        } else {
            Vec::new()
        };
        let orphan_providers = self.record_providers(&orphans, &snapshot)?;

        let warnings = graph.warnings().to_vec();
        let mut run = ApplyRun::new(graph, &declaration.exports);
        let schedule = Schedule::forward(run.graph());
        log::info!(
            "Applying {} resource(s), {} orphan(s) to prune",
            schedule.len(),
            orphans.len()
        );

        let result = {
            let mut phase = ApplyPhase {
                run: &run,
                registry: &self.registry,
                providers,
                snapshot: &mut snapshot,
                options: &self.options,
                config: &self.config,
                cancel: &self.cancel,
                inflight: HashMap::new(),
            };
            executor::run(
                &schedule,
                &mut phase,
                self.options.jobs,
                &self.cancel,
                self.observer.as_ref(),
            )
        };
        let report = match result {
            Ok(report) => report,
            Err(e) => {
                snapshot.touch();
                store.save(&snapshot)?;
                return Err(e);
            }
        };
        run.record(&report);

        let mut nodes = report.nodes;
        if !orphans.is_empty() && !self.cancel.is_cancelled() {
            log::info!("Pruning {} orphaned resource(s)", orphans.len());
            match self.teardown(orphans, orphan_providers, &mut snapshot) {
                Ok(pruned) => nodes.extend(pruned.nodes),
                Err(e) => {
                    snapshot.touch();
                    store.save(&snapshot)?;
                    return Err(e);
                }
            }
        }

        let exports = run.export_values();
        snapshot.outputs = exports
            .iter()
            .filter_map(|(name, value)| value.as_ref().ok().map(|v| (name.clone(), v.clone())))
            .collect();
        snapshot.touch();
        store.save(&snapshot)?;

        let report = RunReport::new(nodes, started.elapsed());
        log::info!("Apply {} in {:?}", report.status, report.elapsed);
        Ok(ApplyOutcome {
            report,
            exports,
            outputs: run.outputs(),
            warnings,
        })
    }

    /// Delete everything recorded in state, dependents first.
    pub fn destroy(&self, store: &dyn StateStore) -> Result<RunReport> {
        let mut snapshot = store.load()?;
        let names = snapshot.teardown_order();
        let providers = self.record_providers(&names, &snapshot)?;
        log::info!("Destroying {} resource(s)", names.len());

        let result = self.teardown(names, providers, &mut snapshot);
        if snapshot.is_empty() {
            snapshot.outputs.clear();
        }
        snapshot.touch();
        store.save(&snapshot)?;
        result
    }

    /// Providers owning recorded resources, checked before any deletion.
    fn record_providers(
        &self,
        names: &[String],
        snapshot: &StateSnapshot,
    ) -> Result<Vec<SharedProvider>> {
        names
            .iter()
            .map(|name| {
                let record = snapshot.get(name).ok_or_else(|| {
                    EngineError::Invariant(format!("'{name}' missing from state"))
                })?;
                self.registry
                    .get(&record.provider)
                    .cloned()
                    .ok_or_else(|| EngineError::UnknownProvider {
                        resource: name.clone(),
                        provider: record.provider.clone(),
                    })
            })
            .collect()
    }

    /// Delete `names` (in teardown order) using dependencies recorded in state.
    fn teardown(
        &self,
        names: Vec<String>,
        providers: Vec<SharedProvider>,
        snapshot: &mut StateSnapshot,
    ) -> Result<RunReport> {
        let index: HashMap<&str, usize> = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();
        let mut records = Vec::with_capacity(names.len());
        let mut dependencies = Vec::with_capacity(names.len());
        for name in &names {
            let record = snapshot
                .get(name)
                .ok_or_else(|| EngineError::Invariant(format!("'{name}' missing from state")))?;
            dependencies.push(
                record
                    .dependencies
                    .iter()
                    .filter_map(|dep| index.get(dep.as_str()).copied())
                    .collect(),
            );
            records.push(record.to_resolved(name));
        }

        let schedule = Schedule::reverse(names, dependencies);
        let mut phase = DestroyPhase {
            records,
            providers,
            snapshot,
            retry: &self.options.retry,
            config: &self.config,
            cancel: &self.cancel,
        };
        executor::run(
            &schedule,
            &mut phase,
            self.options.jobs,
            &self.cancel,
            self.observer.as_ref(),
        )
    }
}

// ============================================================================
// Apply phase
// ============================================================================

struct ApplyPhase<'a> {
    run: &'a ApplyRun,
    registry: &'a ProviderRegistry,
    providers: Vec<SharedProvider>,
    snapshot: &'a mut StateSnapshot,
    options: &'a ExecuteOptions,
    config: &'a Arc<ProviderConfig>,
    cancel: &'a CancelToken,
    /// Content hash and resolved descriptor of nodes on the pool
    inflight: HashMap<usize, (String, ResolvedResource)>,
}

impl ApplyPhase<'_> {
    fn name(&self, node: usize) -> &str {
        self.run.graph().name(node)
    }

    fn dependency_names(&self, node: usize) -> Vec<String> {
        let graph = self.run.graph();
        graph
            .dependencies(node)
            .iter()
            .map(|&dep| graph.name(dep).to_string())
            .collect()
    }
}

impl Phase for ApplyPhase<'_> {
    fn dispatch(&mut self, node: usize) -> Dispatch {
        let name = self.name(node).to_string();
        let record = self.snapshot.get(&name);

        let resolved = match self.run.resolve_node(node) {
            Ok(resolved) => resolved,
            Err(e) => {
                let action = if record.is_some() {
                    Action::Update
                } else {
                    Action::Create
                };
                return Dispatch::Done(action, Completion::failed(e.into(), 0));
            }
        };

        let hash = resolved.content_hash();
        let provider = Arc::clone(&self.providers[node]);

        let (action, operation, previous) = match record {
            None => (Action::Create, Operation::Create, None),
            Some(record) if record.kind == resolved.kind && record.content_hash == hash => {
                log::debug!("{name}: content hash unchanged, skipping");
                return Dispatch::Done(
                    Action::NoOp,
                    Completion::succeeded(Some(record.outputs.clone()), 0),
                );
            }
            Some(record) => {
                let changes = diff_properties(&record.inputs, &resolved.properties);
                if record.kind != resolved.kind
                    || provider.requires_replacement(&resolved.kind, &changes)
                {
                    let owner = self
                        .registry
                        .get(&record.provider)
                        .cloned()
                        .unwrap_or_else(|| Arc::clone(&provider));
                    (
                        Action::Replace,
                        Operation::Create,
                        Some((owner, record.to_resolved(&name))),
                    )
                } else {
                    let prior = PriorState {
                        inputs: record.inputs.clone(),
                        outputs: record.outputs.clone(),
                    };
                    (Action::Update, Operation::Update { prior }, None)
                }
            }
        };

        self.inflight.insert(node, (hash, resolved.clone()));
        let job = ApplyJob {
            name,
            provider,
            request: ApplyRequest {
                resource: resolved,
                operation,
            },
            previous,
            retry: self.options.retry.clone(),
            rollback: self.options.rollback_on_failure,
            config: Arc::clone(self.config),
            cancel: self.cancel.clone(),
        };
        Dispatch::Spawn(action, job.boxed())
    }

    fn succeeded(
        &mut self,
        node: usize,
        action: Action,
        outputs: Option<Attributes>,
    ) -> Result<(), EngineError> {
        let name = self.name(node).to_string();
        let outputs = outputs.unwrap_or_default();
        let dependencies = self.dependency_names(node);

        if action == Action::NoOp {
            if let Some(record) = self.snapshot.resources.get_mut(&name) {
                record.dependencies = dependencies;
            }
        } else {
            let (content_hash, resolved) = self.inflight.remove(&node).ok_or_else(|| {
                EngineError::Invariant(format!("no in-flight record for '{name}'"))
            })?;
            self.snapshot.insert(
                name.clone(),
                ResourceRecord {
                    kind: resolved.kind,
                    provider: self.providers[node].name().to_string(),
                    content_hash,
                    inputs: resolved.properties,
                    outputs: outputs.clone(),
                    dependencies,
                    updated_at: Utc::now(),
                },
            );
        }

        self.run
            .cell_at(node)
            .resolve(serde_json::Value::Object(outputs))?;
        Ok(())
    }

    fn failed(&mut self, node: usize, error: &NodeError, removed: bool) -> Result<(), EngineError> {
        let name = self.name(node).to_string();
        self.inflight.remove(&node);
        if removed {
            self.snapshot.remove(&name);
        }
        let origin = match error {
            NodeError::DependencyFailed { root, .. } => root.clone(),
            _ => name,
        };
        self.run
            .cell_at(node)
            .fail(CellError::new(origin, error.to_string()))?;
        Ok(())
    }

    fn cancelled(&mut self, node: usize) -> Result<(), EngineError> {
        let name = self.name(node).to_string();
        self.run
            .cell_at(node)
            .fail(CellError::new(name, "cancelled before provisioning"))?;
        Ok(())
    }
}

/// Create, update or replace one resource on a worker.
struct ApplyJob {
    name: String,
    provider: SharedProvider,
    request: ApplyRequest,
    /// Provider and last-applied resource to delete first when replacing
    previous: Option<(SharedProvider, ResolvedResource)>,
    retry: RetryPolicy,
    rollback: bool,
    config: Arc<ProviderConfig>,
    cancel: CancelToken,
}

impl ApplyJob {
    fn boxed(self) -> Job {
        Box::new(move |events: &dyn RetryCallback| self.execute(events))
    }

    fn execute(self, events: &dyn RetryCallback) -> Completion {
        let ctx = ApplyContext::new(&self.name, &self.config, &self.cancel);
        let mut removed = false;

        if let Some((owner, previous)) = &self.previous {
            log::info!("Replacing {}: deleting the current instance", self.name);
            let (result, attempts) = with_retry(&self.retry, &self.cancel, Some(events), || {
                owner.delete(previous, &ctx)
            });
            if let Err(error) = result {
                return Completion::failed(NodeError::Provider { error, attempts }, attempts);
            }
            removed = true;
        }

        let (result, attempts) = with_retry(&self.retry, &self.cancel, Some(events), || {
            self.provider.apply(&self.request, &ctx)
        });
        let error = match result {
            Ok(outputs) => return Completion::succeeded(Some(outputs), attempts),
            Err(error) => error,
        };

        let mut completion =
            Completion::failed(NodeError::Provider { error, attempts }, attempts);
        completion.removed = removed;

        // A failed update leaves the working resource alone
        if self.rollback && self.request.operation.is_create() && !self.cancel.is_cancelled() {
            log::info!("Rolling back failed create of {}", self.name);
            let (result, _) = with_retry(&self.retry, &self.cancel, Some(events), || {
                self.provider.delete(&self.request.resource, &ctx)
            });
            match result {
                Ok(()) => {
                    completion.rolled_back = true;
                    completion.removed = true;
                }
                Err(e) => log::warn!("Rollback of {} failed: {e}", self.name),
            }
        }
        completion
    }
}

// ============================================================================
// Destroy phase
// ============================================================================

struct DestroyPhase<'a> {
    records: Vec<ResolvedResource>,
    providers: Vec<SharedProvider>,
    snapshot: &'a mut StateSnapshot,
    retry: &'a RetryPolicy,
    config: &'a Arc<ProviderConfig>,
    cancel: &'a CancelToken,
}

impl Phase for DestroyPhase<'_> {
    fn dispatch(&mut self, node: usize) -> Dispatch {
        let resource = self.records[node].clone();
        let provider = Arc::clone(&self.providers[node]);
        let retry = self.retry.clone();
        let config = Arc::clone(self.config);
        let cancel = self.cancel.clone();

        Dispatch::Spawn(
            Action::Delete,
            Box::new(move |events: &dyn RetryCallback| {
                let ctx = ApplyContext::new(&resource.name, &config, &cancel);
                let (result, attempts) = with_retry(&retry, &cancel, Some(events), || {
                    provider.delete(&resource, &ctx)
                });
                match result {
                    Ok(()) => Completion::succeeded(None, attempts),
                    Err(error) => {
                        Completion::failed(NodeError::Provider { error, attempts }, attempts)
                    }
                }
            }),
        )
    }

    fn succeeded(&mut self, node: usize, _: Action, _: Option<Attributes>) -> Result<(), EngineError> {
        self.snapshot.remove(&self.records[node].name);
        Ok(())
    }

    fn failed(&mut self, _: usize, _: &NodeError, _: bool) -> Result<(), EngineError> {
        Ok(())
    }

    fn cancelled(&mut self, _: usize) -> Result<(), EngineError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ResourceDescriptor;
    use crate::error::{BuildError, ProviderError};
    use crate::state::MemoryStateStore;
    use crate::testing::{Op, ScriptedProvider};
    use crate::types::{NodeState, RunStatus};
    use crate::value::Value;
    use serde_json::json;
    use std::time::Duration;

    fn fast_options() -> ExecuteOptions {
        ExecuteOptions {
            jobs: 4,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                backoff_factor: 1.0,
                max_delay: Duration::from_millis(5),
            },
            rollback_on_failure: false,
            prune_orphans: true,
        }
    }

    fn engine(provider: &Arc<ScriptedProvider>) -> Engine {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::clone(provider) as SharedProvider);
        Engine::new(registry).with_options(fast_options())
    }

    fn parse(value: serde_json::Value) -> Value {
        Value::parse(value).unwrap()
    }

    /// Namespace N, Deployment D in N, Service S selecting D, Route R to S's port.
    fn ndsr() -> Declaration {
        Declaration::new()
            .resource(
                ResourceDescriptor::new("N", "kubernetes:core/v1:Namespace")
                    .property("metadata", parse(json!({"name": "demo"}))),
            )
            .resource(
                ResourceDescriptor::new("D", "kubernetes:apps/v1:Deployment")
                    .property("metadata", parse(json!({"name": "httpbin", "namespace": "${N.metadata.name}"})))
                    .property("spec", parse(json!({"replicas": 1}))),
            )
            .resource(
                ResourceDescriptor::new("S", "kubernetes:core/v1:Service")
                    .property(
                        "metadata",
                        parse(json!({"name": "httpbin-service", "namespace": "${N.metadata.name}"})),
                    )
                    .property("spec", parse(json!({"ports": [{"port": 8000}]})))
                    .depends_on("D"),
            )
            .resource(
                ResourceDescriptor::new("R", "gateway.networking.k8s.io/v1:HTTPRoute").property(
                    "spec",
                    parse(json!({
                        "backendRefs": [{"name": "${S.metadata.name}", "port": "${S.spec.ports[0].port}"}]
                    })),
                ),
            )
            .export("routePort", parse(json!("${R.spec.backendRefs[0].port}")))
            .export("testCommand", parse(json!("curl http://${S.metadata.name}:${S.spec.ports[0].port}/get")))
    }

    #[test]
    fn test_ndsr_scenario_orders_and_propagates_port() {
        let provider = Arc::new(ScriptedProvider::new("fake"));
        let store = MemoryStateStore::new();
        let outcome = engine(&provider).apply(&ndsr(), &store).unwrap();

        assert_eq!(outcome.report.status, RunStatus::Succeeded);
        assert_eq!(outcome.exports["routePort"], Ok(json!(8000)));
        assert_eq!(
            outcome.exports["testCommand"],
            Ok(json!("curl http://httpbin-service:8000/get"))
        );

        // Every consumer started after each of its producers finished
        let report = &outcome.report;
        for (producer, consumer) in [("N", "D"), ("N", "S"), ("D", "S"), ("S", "R")] {
            let finished = report.node(producer).unwrap().finished.unwrap();
            let started = report.node(consumer).unwrap().started.unwrap();
            assert!(finished <= started, "{producer} must finish before {consumer} starts");
        }

        let state = store.snapshot();
        assert_eq!(state.resources.len(), 4);
        assert_eq!(state.get("S").unwrap().dependencies, vec!["N", "D"]);
        assert_eq!(state.outputs["routePort"], json!(8000));
    }

    #[test]
    fn test_permanent_failure_skips_dependents() {
        let provider = Arc::new(
            ScriptedProvider::new("fake")
                .fail_always("D", ProviderError::permanent("image pull rejected")),
        );
        let declaration = ndsr().resource(ResourceDescriptor::new("X", "kubernetes:core/v1:ConfigMap"));
        let outcome = engine(&provider).apply(&declaration, &MemoryStateStore::new()).unwrap();
        let report = &outcome.report;

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.node("N").unwrap().state, NodeState::Succeeded);
        assert_eq!(report.node("X").unwrap().state, NodeState::Succeeded);
        assert_eq!(report.node("D").unwrap().state, NodeState::Failed);
        assert_eq!(report.node("D").unwrap().attempts, 1);
        for skipped in ["S", "R"] {
            assert_eq!(report.node(skipped).unwrap().state, NodeState::Failed);
            assert!(provider.calls_for(skipped).is_empty());
        }
        assert_eq!(report.causal_chain("R"), vec!["R", "S", "D"]);
        assert_eq!(
            report.node("S").unwrap().error,
            Some(NodeError::DependencyFailed {
                dependency: "D".into(),
                root: "D".into()
            })
        );

        // Exports fed by the failed branch fail with the root cause
        let err = outcome.exports["routePort"].clone().unwrap_err();
        assert_eq!(err.resource, "D");
        assert_eq!(provider.calls_for("D"), vec![Op::Create]);
    }

    #[test]
    fn test_cycle_fails_before_any_provider_call() {
        let provider = Arc::new(ScriptedProvider::new("fake"));
        let declaration = Declaration::new()
            .resource(ResourceDescriptor::new("a", "k").depends_on("b"))
            .resource(ResourceDescriptor::new("b", "k").property("x", parse(json!("${a.id}"))));

        let err = engine(&provider)
            .apply(&declaration, &MemoryStateStore::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::Build(BuildError::CycleDetected { .. })));
        assert_eq!(provider.call_count(), 0);
    }

    #[test]
    fn test_missing_provider_fails_before_any_call() {
        let provider = Arc::new(ScriptedProvider::new("fake"));
        let mut registry = ProviderRegistry::new();
        registry
            .register(Arc::clone(&provider) as SharedProvider)
            .register(Arc::new(ScriptedProvider::new("other")))
            .route("kubernetes:*", "fake");
        let declaration = ndsr().resource(ResourceDescriptor::new("bucket", "aws:s3:Bucket"));

        let err = Engine::new(registry)
            .apply(&declaration, &MemoryStateStore::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::NoProvider { .. }));
        assert_eq!(provider.call_count(), 0);
    }

    #[test]
    fn test_reapply_is_idempotent() {
        let provider = Arc::new(ScriptedProvider::new("fake"));
        let store = MemoryStateStore::new();
        let engine = engine(&provider);

        let first = engine.apply(&ndsr(), &store).unwrap();
        let calls = provider.call_count();
        assert_eq!(calls, 4);

        let second = engine.apply(&ndsr(), &store).unwrap();
        assert_eq!(provider.call_count(), calls);
        assert!(second.report.nodes.iter().all(|n| n.action == Some(Action::NoOp)));
        assert_eq!(first.outputs, second.outputs);
        assert_eq!(first.exports, second.exports);
        assert_eq!(second.report.summary().unchanged, 4);
    }

    #[test]
    fn test_changed_input_updates_in_place() {
        let provider = Arc::new(ScriptedProvider::new("fake"));
        let store = MemoryStateStore::new();
        let engine = engine(&provider);
        engine.apply(&ndsr(), &store).unwrap();

        let mut declaration = ndsr();
        declaration.resources = declaration
            .resources
            .into_iter()
            .map(|d| {
                if d.name() == "D" {
                    d.property("spec", parse(json!({"replicas": 3})))
                } else {
                    d
                }
            })
            .collect();

        let outcome = engine.apply(&declaration, &store).unwrap();
        assert!(outcome.report.is_success());
        assert_eq!(outcome.report.node("D").unwrap().action, Some(Action::Update));
        assert_eq!(outcome.report.node("N").unwrap().action, Some(Action::NoOp));
        assert_eq!(provider.calls_for("D"), vec![Op::Create, Op::Update]);
        assert_eq!(
            store.snapshot().get("D").unwrap().inputs["spec"]["replicas"],
            json!(3)
        );
    }

    #[test]
    fn test_immutable_change_replaces() {
        let provider = Arc::new(ScriptedProvider::new("fake").immutable("metadata.name"));
        let store = MemoryStateStore::new();
        let engine = engine(&provider);
        let declaration =
            Declaration::new().resource(ResourceDescriptor::new("N", "Namespace").property("metadata", parse(json!({"name": "demo"}))));
        engine.apply(&declaration, &store).unwrap();

        let renamed =
            Declaration::new().resource(ResourceDescriptor::new("N", "Namespace").property("metadata", parse(json!({"name": "demo-2"}))));
        let outcome = engine.apply(&renamed, &store).unwrap();

        assert_eq!(outcome.report.node("N").unwrap().action, Some(Action::Replace));
        assert_eq!(provider.calls_for("N"), vec![Op::Create, Op::Delete, Op::Create]);
        assert_eq!(
            store.snapshot().get("N").unwrap().outputs["metadata"]["name"],
            json!("demo-2")
        );
    }

    #[test]
    fn test_transient_errors_are_retried() {
        let provider = Arc::new(ScriptedProvider::new("fake").fail_times(
            "S",
            2,
            ProviderError::transient("429 too many requests"),
        ));
        let outcome = engine(&provider).apply(&ndsr(), &MemoryStateStore::new()).unwrap();

        assert!(outcome.report.is_success());
        assert_eq!(outcome.report.node("S").unwrap().attempts, 3);
        assert_eq!(provider.calls_for("S").len(), 3);
    }

    #[test]
    fn test_exhausted_retries_fail_node() {
        let provider = Arc::new(ScriptedProvider::new("fake").fail_times(
            "N",
            10,
            ProviderError::transient("connection refused"),
        ));
        let outcome = engine(&provider).apply(&ndsr(), &MemoryStateStore::new()).unwrap();

        let n = outcome.report.node("N").unwrap();
        assert_eq!(n.state, NodeState::Failed);
        assert_eq!(n.attempts, 3);
        assert_eq!(outcome.report.skipped().count(), 3);
        assert_eq!(provider.call_count(), 3);
    }

    #[test]
    fn test_unresolvable_reference_fails_without_provider_call() {
        let provider = Arc::new(ScriptedProvider::new("fake"));
        let declaration = Declaration::new()
            .resource(ResourceDescriptor::new("lb", "Service"))
            .resource(ResourceDescriptor::new("dns", "Record").property("ip", parse(json!("${lb.status.ip}"))));

        let outcome = engine(&provider).apply(&declaration, &MemoryStateStore::new()).unwrap();
        let dns = outcome.report.node("dns").unwrap();
        assert_eq!(dns.state, NodeState::Failed);
        assert!(matches!(dns.error, Some(NodeError::UnresolvedReference(_))));
        assert!(provider.calls_for("dns").is_empty());
    }

    #[test]
    fn test_independent_nodes_run_concurrently() {
        let provider = Arc::new(
            ScriptedProvider::new("fake")
                .delay("a", Duration::from_millis(150))
                .delay("b", Duration::from_millis(150)),
        );
        let declaration = Declaration::new()
            .resource(ResourceDescriptor::new("a", "k"))
            .resource(ResourceDescriptor::new("b", "k"));
        let outcome = engine(&provider).apply(&declaration, &MemoryStateStore::new()).unwrap();

        let a = outcome.report.node("a").unwrap();
        let b = outcome.report.node("b").unwrap();
        assert!(a.started.unwrap() < b.finished.unwrap());
        assert!(b.started.unwrap() < a.finished.unwrap());
    }

    #[test]
    fn test_rollback_after_failed_create() {
        let provider = Arc::new(
            ScriptedProvider::new("fake").fail_always("D", ProviderError::permanent("bad spec")),
        );
        let engine = engine(&provider).with_options(ExecuteOptions {
            rollback_on_failure: true,
            ..fast_options()
        });
        let outcome = engine.apply(&ndsr(), &MemoryStateStore::new()).unwrap();

        assert_eq!(outcome.report.node("D").unwrap().state, NodeState::RolledBack);
        assert_eq!(provider.calls_for("D"), vec![Op::Create, Op::Delete]);
        assert_eq!(outcome.report.status, RunStatus::Failed);
    }

    #[test]
    fn test_failed_update_is_not_rolled_back() {
        let provider = Arc::new(ScriptedProvider::new("fake"));
        let store = MemoryStateStore::new();
        let options = ExecuteOptions {
            rollback_on_failure: true,
            ..fast_options()
        };
        engine(&provider)
            .with_options(options.clone())
            .apply(&ndsr(), &store)
            .unwrap();

        let failing = Arc::new(
            ScriptedProvider::new("fake").fail_always("D", ProviderError::permanent("rejected")),
        );
        let mut declaration = ndsr();
        declaration.resources = declaration
            .resources
            .into_iter()
            .map(|d| {
                if d.name() == "D" {
                    d.property("spec", parse(json!({"replicas": 2})))
                } else {
                    d
                }
            })
            .collect();

        let outcome = engine(&failing)
            .with_options(options)
            .apply(&declaration, &store)
            .unwrap();
        assert_eq!(outcome.report.node("D").unwrap().state, NodeState::Failed);
        assert_eq!(failing.calls_for("D"), vec![Op::Update]);
        // Previous record kept
        assert_eq!(
            store.snapshot().get("D").unwrap().inputs["spec"]["replicas"],
            json!(1)
        );
    }

    #[test]
    fn test_orphans_pruned_dependents_first() {
        let provider = Arc::new(ScriptedProvider::new("fake"));
        let store = MemoryStateStore::new();
        let engine = engine(&provider);
        engine.apply(&ndsr(), &store).unwrap();

        let only_namespace = Declaration::new().resource(
            ResourceDescriptor::new("N", "kubernetes:core/v1:Namespace")
                .property("metadata", parse(json!({"name": "demo"}))),
        );
        let outcome = engine.apply(&only_namespace, &store).unwrap();
        assert!(outcome.report.is_success());

        let deletes: Vec<_> = provider
            .calls()
            .into_iter()
            .filter(|c| c.op == Op::Delete)
            .map(|c| c.resource)
            .collect();
        assert_eq!(deletes, vec!["R", "S", "D"]);
        assert_eq!(
            store.snapshot().resources.keys().collect::<Vec<_>>(),
            vec!["N"]
        );
    }

    #[test]
    fn test_destroy_reverse_order() {
        let provider = Arc::new(ScriptedProvider::new("fake"));
        let store = MemoryStateStore::new();
        let engine = engine(&provider);
        engine.apply(&ndsr(), &store).unwrap();

        let report = engine.destroy(&store).unwrap();
        assert!(report.is_success());
        assert_eq!(report.summary().deleted, 4);

        let finished = |name: &str| report.node(name).unwrap().finished.unwrap();
        let started = |name: &str| report.node(name).unwrap().started.unwrap();
        assert!(finished("R") <= started("S"));
        assert!(finished("S") <= started("D"));
        assert!(finished("S") <= started("N"));
        assert!(finished("D") <= started("N"));

        let state = store.snapshot();
        assert!(state.is_empty());
        assert!(state.outputs.is_empty());
        assert!(!provider.is_live("N"));
    }

    #[test]
    fn test_destroy_failure_keeps_dependencies() {
        let provider = Arc::new(
            ScriptedProvider::new("fake").fail_delete("S", ProviderError::permanent("finalizer stuck")),
        );
        let store = MemoryStateStore::new();
        let engine = engine(&provider);
        engine.apply(&ndsr(), &store).unwrap();

        let report = engine.destroy(&store).unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.node("R").unwrap().state, NodeState::Succeeded);
        assert_eq!(report.causal_chain("N"), vec!["N", "S"]);

        let mut remaining: Vec<_> = store.snapshot().resources.into_keys().collect();
        remaining.sort();
        assert_eq!(remaining, vec!["D", "N", "S"]);
    }

    #[test]
    fn test_cancellation_stops_dispatching() {
        struct CancelOn {
            node: &'static str,
            token: CancelToken,
        }
        impl RunObserver for CancelOn {
            fn on_node_start(&self, name: &str, _: Action) {
                if name == self.node {
                    self.token.cancel();
                }
            }
        }

        let provider = Arc::new(ScriptedProvider::new("fake").delay("N", Duration::from_millis(50)));
        let token = CancelToken::new();
        let engine = engine(&provider)
            .with_cancel_token(token.clone())
            .with_observer(Arc::new(CancelOn { node: "N", token }));

        let store = MemoryStateStore::new();
        let outcome = engine.apply(&ndsr(), &store).unwrap();

        assert_eq!(outcome.report.status, RunStatus::Cancelled);
        assert_eq!(outcome.report.node("N").unwrap().state, NodeState::Succeeded);
        for name in ["D", "S", "R"] {
            assert_eq!(outcome.report.node(name).unwrap().state, NodeState::Cancelled);
        }
        assert_eq!(provider.call_count(), 1);
        assert!(outcome.exports["routePort"].is_err());
        assert_eq!(store.snapshot().resources.len(), 1);
    }

    #[test]
    fn test_interrupted_call_is_cancelled_not_failed() {
        struct CancelOn {
            node: &'static str,
            token: CancelToken,
        }
        impl RunObserver for CancelOn {
            fn on_node_start(&self, name: &str, _: Action) {
                if name == self.node {
                    self.token.cancel();
                }
            }
        }

        let provider = Arc::new(
            ScriptedProvider::new("fake")
                .delay("D", Duration::from_millis(50))
                .interruptible("D"),
        );
        let token = CancelToken::new();
        let mut options = fast_options();
        options.rollback_on_failure = true;
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::clone(&provider) as SharedProvider);
        let engine = Engine::new(registry)
            .with_options(options)
            .with_cancel_token(token.clone())
            .with_observer(Arc::new(CancelOn { node: "D", token }));

        let store = MemoryStateStore::new();
        let outcome = engine.apply(&ndsr(), &store).unwrap();
        let report = &outcome.report;

        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.node("N").unwrap().state, NodeState::Succeeded);
        for name in ["D", "S", "R"] {
            assert_eq!(report.node(name).unwrap().state, NodeState::Cancelled);
        }
        assert_eq!(report.summary().failed, 0);
        assert_eq!(report.summary().cancelled, 3);
        assert_eq!(report.root_failures().count(), 0);
        // No rollback for a call the run interrupted
        assert_eq!(provider.calls_for("D"), vec![Op::Create]);
        assert_eq!(store.snapshot().resources.len(), 1);
    }

    #[test]
    fn test_plan_reflects_state() {
        let provider = Arc::new(ScriptedProvider::new("fake"));
        let store = MemoryStateStore::new();
        let engine = engine(&provider);

        let plan = engine.plan(&ndsr(), &store.load().unwrap()).unwrap();
        assert_eq!(plan.summary().create, 4);
        assert_eq!(provider.call_count(), 0);

        engine.apply(&ndsr(), &store).unwrap();
        let plan = engine.plan(&ndsr(), &store.load().unwrap()).unwrap();
        assert!(!plan.has_changes());
    }
}
