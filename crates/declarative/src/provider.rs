//! Provider adapter trait and kind-dispatching registry
//!
//! A [`Provider`] talks to the remote system for a family of resource kinds.
//! The engine treats kinds as opaque strings; the [`ProviderRegistry`] maps
//! each descriptor to the provider that owns it.
//!
//! # Example
//!
//! ```ignore
//! use declarative::{ApplyContext, ApplyRequest, Attributes, Provider, ProviderError, ResolvedResource};
//!
//! struct Echo;
//!
//! impl Provider for Echo {
//!     fn name(&self) -> &str {
//!         "echo"
//!     }
//!
//!     fn apply(&self, request: &ApplyRequest, _ctx: &ApplyContext) -> Result<Attributes, ProviderError> {
//!         Ok(request.resource.properties.clone())
//!     }
//!
//!     fn delete(&self, _resource: &ResolvedResource, _ctx: &ApplyContext) -> Result<(), ProviderError> {
//!         Ok(())
//!     }
//! }
//! ```

use crate::context::ApplyContext;
use crate::descriptor::{Attributes, ResolvedResource, ResourceDescriptor};
use crate::diff::PropertyChange;
use crate::error::{EngineError, ProviderError};
use std::fmt;
use std::sync::Arc;

/// Inputs and outputs recorded by the last successful apply.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorState {
    /// Resolved properties last sent to the provider
    pub inputs: Attributes,
    /// Attributes the provider returned
    pub outputs: Attributes,
}

/// Whether an apply creates a resource or updates an existing one.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Nothing exists yet
    Create,
    /// Update in place; carries what was last applied
    Update { prior: PriorState },
}

impl Operation {
    pub fn is_create(&self) -> bool {
        matches!(self, Self::Create)
    }
}

/// What a provider receives for create or update.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyRequest {
    /// The descriptor with every reference substituted
    pub resource: ResolvedResource,
    /// Create or update
    pub operation: Operation,
}

/// Adapter to a remote API for one family of resource kinds.
pub trait Provider: Send + Sync {
    /// Registry name of this provider
    fn name(&self) -> &str;

    /// Create or update a resource, returning its observed attributes.
    ///
    /// Errors must be classified: transient errors are retried by the engine,
    /// permanent errors fail the node.
    fn apply(&self, request: &ApplyRequest, ctx: &ApplyContext) -> Result<Attributes, ProviderError>;

    /// Delete a resource. Deleting something that is already gone should succeed.
    fn delete(&self, resource: &ResolvedResource, ctx: &ApplyContext) -> Result<(), ProviderError>;

    /// Whether these property changes cannot be applied in place.
    fn requires_replacement(&self, _kind: &str, _changes: &[PropertyChange]) -> bool {
        false
    }
}

/// Shared handle to a provider
pub type SharedProvider = Arc<dyn Provider>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Route {
    pattern: String,
    provider: String,
}

impl Route {
    /// Exact kinds beat prefix patterns; longer prefixes beat shorter ones.
    fn specificity(&self, kind: &str) -> Option<usize> {
        match self.pattern.strip_suffix('*') {
            Some(prefix) if kind.starts_with(prefix) => Some(prefix.len()),
            Some(_) => None,
            None if self.pattern == kind => Some(usize::MAX),
            None => None,
        }
    }
}

/// Named providers plus kind routing.
///
/// Lookup order for a descriptor: its pinned provider name, then an exact
/// kind route, then the longest matching `prefix*` route, then the default.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<SharedProvider>,
    routes: Vec<Route>,
    default: Option<String>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field(
                "providers",
                &self.providers.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field("routes", &self.routes)
            .field("default", &self.default)
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider; a later provider with the same name replaces it.
    pub fn register(&mut self, provider: SharedProvider) -> &mut Self {
        self.providers.retain(|p| p.name() != provider.name());
        self.providers.push(provider);
        self
    }

    /// Route a kind (or a `prefix*` pattern) to a named provider.
    pub fn route(&mut self, pattern: impl Into<String>, provider: impl Into<String>) -> &mut Self {
        self.routes.push(Route {
            pattern: pattern.into(),
            provider: provider.into(),
        });
        self
    }

    /// Provider used when no route matches.
    pub fn set_default(&mut self, provider: impl Into<String>) -> &mut Self {
        self.default = Some(provider.into());
        self
    }

    /// Look a provider up by name
    pub fn get(&self, name: &str) -> Option<&SharedProvider> {
        self.providers.iter().find(|p| p.name() == name)
    }

    /// Registered provider names, in registration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.iter().map(|p| p.name())
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Name of the provider a kind routes to, ignoring pins.
    pub fn route_for(&self, kind: &str) -> Option<&str> {
        self.routes
            .iter()
            .filter_map(|route| route.specificity(kind).map(|score| (score, route)))
            .max_by_key(|(score, _)| *score)
            .map(|(_, route)| route.provider.as_str())
            .or(self.default.as_deref())
    }

    /// Pick the provider for a descriptor.
    pub fn resolve(&self, descriptor: &ResourceDescriptor) -> Result<SharedProvider, EngineError> {
        if let Some(pinned) = descriptor.provider_name() {
            return self
                .get(pinned)
                .cloned()
                .ok_or_else(|| EngineError::UnknownProvider {
                    resource: descriptor.name().to_string(),
                    provider: pinned.to_string(),
                });
        }

        let routed = self.route_for(descriptor.kind()).or_else(|| {
            // A lone provider owns every kind
            match self.providers.as_slice() {
                [only] => Some(only.name()),
                _ => None,
            }
        });

        match routed {
            Some(name) => self
                .get(name)
                .cloned()
                .ok_or_else(|| EngineError::UnknownProvider {
                    resource: descriptor.name().to_string(),
                    provider: name.to_string(),
                }),
            None => Err(EngineError::NoProvider {
                resource: descriptor.name().to_string(),
                kind: descriptor.kind().to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl Provider for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn apply(&self, request: &ApplyRequest, _: &ApplyContext) -> Result<Attributes, ProviderError> {
            Ok(request.resource.properties.clone())
        }

        fn delete(&self, _: &ResolvedResource, _: &ApplyContext) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    fn registry() -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry
            .register(Arc::new(Named("k8s")))
            .register(Arc::new(Named("helm")))
            .register(Arc::new(Named("crds")))
            .route("kubernetes:*", "k8s")
            .route("kubernetes:helm.sh/*", "helm")
            .route("kubernetes:yaml:ConfigFile", "crds");
        registry
    }

    fn resolve(registry: &ProviderRegistry, descriptor: &ResourceDescriptor) -> String {
        registry.resolve(descriptor).unwrap().name().to_string()
    }

    #[test]
    fn test_route_by_kind() {
        let registry = registry();
        let ns = ResourceDescriptor::new("demo", "kubernetes:core/v1:Namespace");
        let release = ResourceDescriptor::new("istiod", "kubernetes:helm.sh/v3:Release");
        let crds = ResourceDescriptor::new("gateway-api-crds", "kubernetes:yaml:ConfigFile");

        assert_eq!(resolve(&registry, &ns), "k8s");
        assert_eq!(resolve(&registry, &release), "helm");
        assert_eq!(resolve(&registry, &crds), "crds");
    }

    #[test]
    fn test_pinned_provider_wins() {
        let registry = registry();
        let ns = ResourceDescriptor::new("demo", "kubernetes:core/v1:Namespace").provider("helm");
        assert_eq!(resolve(&registry, &ns), "helm");

        let ghost = ResourceDescriptor::new("x", "kubernetes:core/v1:Namespace").provider("ghost");
        assert!(matches!(
            registry.resolve(&ghost),
            Err(EngineError::UnknownProvider { .. })
        ));
    }

    #[test]
    fn test_missing_provider() {
        let registry = registry();
        let other = ResourceDescriptor::new("bucket", "aws:s3:Bucket");
        assert!(matches!(
            registry.resolve(&other),
            Err(EngineError::NoProvider { .. })
        ));

        let mut with_default = registry;
        with_default.set_default("k8s");
        assert_eq!(resolve(&with_default, &other), "k8s");
    }

    #[test]
    fn test_single_provider_owns_everything() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(Named("local")));
        let anything = ResourceDescriptor::new("a", "whatever");
        assert_eq!(resolve(&registry, &anything), "local");
    }
}
