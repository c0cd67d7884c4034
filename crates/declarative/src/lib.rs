//! # Declarative
//!
//! A dependency-aware provisioning engine for declared infrastructure.
//!
//! Resources are declared as named descriptors whose properties may embed
//! references to other resources' outputs (`${lb.status.ip}`). The engine
//! derives a dependency graph from those references (plus explicit
//! `depends_on` edges), rejects cycles and dangling names before touching
//! anything, and provisions nodes concurrently as soon as every producer
//! they reference has resolved.
//!
//! ## Core Concepts
//!
//! - **ResourceDescriptor**: name, kind, and properties of one resource
//! - **DependencyGraph**: validated producer/consumer edges between descriptors
//! - **OutputCell**: single-assignment slot for a value produced later
//! - **Provider**: adapter performing create, update and delete remotely
//! - **StateStore**: what was last applied, used to skip unchanged resources
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{Declaration, Engine, FileStateStore, ProviderRegistry, ResourceDescriptor, Value};
//!
//! let declaration = Declaration::new()
//!     .resource(ResourceDescriptor::new("ns", "kubernetes:core/v1:Namespace")
//!         .property("metadata", Value::literal(serde_json::json!({"name": "demo"}))))
//!     .resource(ResourceDescriptor::new("app", "kubernetes:apps/v1:Deployment")
//!         .property("namespace", Value::parse_str("${ns.metadata.name}")?))
//!     .export("namespace", Value::parse_str("${ns.metadata.name}")?);
//!
//! let mut registry = ProviderRegistry::new();
//! registry.register(my_provider);
//!
//! let outcome = Engine::new(registry).apply(&declaration, &FileStateStore::new("state.json"))?;
//! println!("{:?}", outcome.exports["namespace"]);
//! ```
//!
//! ## Seams
//!
//! - [`Provider`]: performs the remote operations for some resource kinds
//! - [`StateStore`]: persists the last applied inputs and outputs
//! - [`RunObserver`]: receives progress updates
//!
//! None of them pull in a particular cloud SDK, storage backend or UI.

pub mod cell;
pub mod context;
pub mod descriptor;
pub mod diff;
pub mod engine;
pub mod error;
mod executor;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod retry;
pub mod run;
pub mod state;
pub mod types;
pub mod value;

#[cfg(test)]
mod testing;

// Re-export main types at crate root
pub use cell::{Outcome, OutputCell};
pub use context::{ApplyContext, CancelToken, NoProgress, ProviderConfig, RunObserver};
pub use descriptor::{Attributes, Declaration, DescriptorStore, ResolvedResource, ResourceDescriptor};
pub use diff::{DiffSummary, PropertyChange, diff_properties};
pub use engine::{ApplyOutcome, Engine};
pub use error::{
    BuildError, CellError, EngineError, ErrorKind, NodeError, ParseError, ProviderError,
    ResolveError, StateError,
};
pub use graph::{DependencyGraph, Edge, EdgeOrigin, GraphWarning};
pub use planner::{Plan, PlanEntry, PlanSummary};
pub use provider::{ApplyRequest, Operation, PriorState, Provider, ProviderRegistry, SharedProvider};
pub use retry::{RetryCallback, RetryPolicy, with_retry};
pub use state::{FileStateStore, MemoryStateStore, ResourceRecord, StateSnapshot, StateStore};
pub use types::{Action, ExecuteOptions, ExecuteSummary, NodeReport, NodeState, RunReport, RunStatus};
pub use value::{FieldPath, Reference, Value};
