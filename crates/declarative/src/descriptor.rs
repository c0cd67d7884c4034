//! Resource descriptors and the descriptor store
//!
//! A [`ResourceDescriptor`] is the declared intent for one resource. The
//! engine never mutates it; provisioning works on a [`ResolvedResource`],
//! the copy with every reference substituted.

use crate::error::ResolveError;
use crate::value::{Reference, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Resolved attribute set, as sent to and returned by providers.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// Declared specification of a single resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDescriptor {
    name: String,
    kind: String,
    properties: BTreeMap<String, Value>,
    depends_on: Vec<String>,
    provider: Option<String>,
}

impl ResourceDescriptor {
    /// Declare a resource with a logical name and an opaque kind.
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            properties: BTreeMap::new(),
            depends_on: Vec::new(),
            provider: None,
        }
    }

    /// Set a top-level property.
    pub fn property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Add an explicit ordering dependency.
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    /// Pin this resource to a named provider instead of kind dispatch.
    pub fn provider(mut self, name: impl Into<String>) -> Self {
        self.provider = Some(name.into());
        self
    }

    /// Logical name, unique within a graph
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provider-defined resource kind
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Declared properties
    pub fn properties(&self) -> &BTreeMap<String, Value> {
        &self.properties
    }

    /// Explicit dependencies, in declaration order
    pub fn explicit_dependencies(&self) -> &[String] {
        &self.depends_on
    }

    /// Pinned provider name, if any
    pub fn provider_name(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    /// Every reference found anywhere in the properties.
    pub fn references(&self) -> Vec<&Reference> {
        self.properties
            .values()
            .flat_map(Value::references)
            .collect()
    }

    /// Names of resources referenced by the properties, first occurrence order.
    pub fn referenced_resources(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for reference in self.references() {
            if !names.contains(&reference.resource.as_str()) {
                names.push(&reference.resource);
            }
        }
        names
    }

    /// Substitute every reference, producing what the provider receives.
    pub fn resolve<F>(&self, lookup: &mut F) -> Result<ResolvedResource, ResolveError>
    where
        F: FnMut(&Reference) -> Result<serde_json::Value, ResolveError>,
    {
        let mut properties = Attributes::new();
        for (key, value) in &self.properties {
            properties.insert(key.clone(), value.resolve(lookup)?);
        }
        Ok(ResolvedResource {
            name: self.name.clone(),
            kind: self.kind.clone(),
            properties,
        })
    }

    /// Properties as declared, references shown as `${...}`.
    pub fn declared_properties(&self) -> Attributes {
        self.properties
            .iter()
            .map(|(key, value)| (key.clone(), value.to_declared_json()))
            .collect()
    }
}

/// A descriptor with every reference substituted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedResource {
    /// Logical name
    pub name: String,
    /// Resource kind
    pub kind: String,
    /// Fully resolved properties
    pub properties: Attributes,
}

impl ResolvedResource {
    /// BLAKE3 hash of the kind and the canonical JSON of the properties.
    ///
    /// `serde_json::Map` keeps keys sorted, so equal content always hashes equal.
    pub fn content_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.kind.as_bytes());
        hasher.update(&[0]);
        let body = serde_json::Value::Object(self.properties.clone()).to_string();
        hasher.update(body.as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// The declared set of resources, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct DescriptorStore {
    descriptors: Vec<ResourceDescriptor>,
}

impl DescriptorStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor.
    ///
    /// Duplicate names are accepted here and rejected by the graph builder.
    pub fn push(&mut self, descriptor: ResourceDescriptor) {
        self.descriptors.push(descriptor);
    }

    /// Look a descriptor up by name.
    pub fn get(&self, name: &str) -> Option<&ResourceDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    /// Iterate in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &ResourceDescriptor> {
        self.descriptors.iter()
    }

    /// Number of descriptors
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

impl FromIterator<ResourceDescriptor> for DescriptorStore {
    fn from_iter<I: IntoIterator<Item = ResourceDescriptor>>(iter: I) -> Self {
        Self {
            descriptors: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for DescriptorStore {
    type Item = ResourceDescriptor;
    type IntoIter = std::vec::IntoIter<ResourceDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.descriptors.into_iter()
    }
}

/// Everything a configuration loader hands to the engine.
#[derive(Debug, Clone, Default)]
pub struct Declaration {
    /// Declared resources
    pub resources: DescriptorStore,
    /// Named top-level values computed from resource outputs
    pub exports: BTreeMap<String, Value>,
}

impl Declaration {
    /// Create an empty declaration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resource.
    pub fn resource(mut self, descriptor: ResourceDescriptor) -> Self {
        self.resources.push(descriptor);
        self
    }

    /// Add an export.
    pub fn export(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.exports.insert(name.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn route() -> ResourceDescriptor {
        ResourceDescriptor::new("httpbin-route", "gateway.networking.k8s.io/v1:HTTPRoute")
            .property(
                "metadata",
                Value::parse(json!({"name": "httpbin", "namespace": "${demo.metadata.name}"}))
                    .unwrap(),
            )
            .property(
                "spec",
                Value::parse(json!({
                    "backendRefs": [
                        {"name": "${httpbin-service.metadata.name}", "port": "${httpbin-service.spec.ports[0].port}"}
                    ]
                }))
                .unwrap(),
            )
            .depends_on("rebellion-gateway")
    }

    #[test]
    fn test_referenced_resources_deduplicated() {
        let descriptor = route();
        assert_eq!(descriptor.references().len(), 3);
        assert_eq!(
            descriptor.referenced_resources(),
            vec!["demo", "httpbin-service"]
        );
        assert_eq!(descriptor.explicit_dependencies(), ["rebellion-gateway"]);
    }

    #[test]
    fn test_resolve_produces_plain_properties() {
        let outputs = json!({
            "demo": {"metadata": {"name": "demo"}},
            "httpbin-service": {"metadata": {"name": "httpbin"}, "spec": {"ports": [{"port": 8000}]}}
        });
        let resolved = route()
            .resolve(&mut |reference: &Reference| {
                reference.extract(&outputs[reference.resource.as_str()])
            })
            .unwrap();

        assert_eq!(resolved.properties["spec"]["backendRefs"][0]["port"], json!(8000));
        assert_eq!(resolved.properties["metadata"]["namespace"], json!("demo"));
    }

    #[test]
    fn test_content_hash_tracks_kind_and_properties() {
        let a = ResolvedResource {
            name: "ns".into(),
            kind: "Namespace".into(),
            properties: json!({"metadata": {"name": "demo"}})
                .as_object()
                .cloned()
                .unwrap(),
        };
        let mut b = a.clone();
        assert_eq!(a.content_hash(), b.content_hash());

        b.properties.insert("labels".into(), json!({"x": "y"}));
        assert_ne!(a.content_hash(), b.content_hash());

        let mut c = a.clone();
        c.kind = "Secret".into();
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn test_store_lookup() {
        let store: DescriptorStore = vec![
            ResourceDescriptor::new("a", "k"),
            ResourceDescriptor::new("b", "k"),
        ]
        .into_iter()
        .collect();
        assert_eq!(store.len(), 2);
        assert!(store.get("b").is_some());
        assert!(store.get("c").is_none());
    }
}
