//! Dependency graph builder
//!
//! Turns a [`DescriptorStore`] into a DAG. Edges come from two places:
//! references found in a descriptor's properties, and its explicit
//! `depends_on` list. Both mechanisms are merged into one edge per
//! (producer, consumer) pair. Anything odd about the explicit list that is
//! not outright wrong is reported as a [`GraphWarning`].

use crate::descriptor::{DescriptorStore, ResourceDescriptor};
use crate::error::BuildError;
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// How an edge was declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeOrigin {
    /// Only through `depends_on`
    Explicit,
    /// Only through a reference in the properties
    Reference,
    /// Through both
    Both,
}

impl EdgeOrigin {
    fn merge(self, other: Self) -> Self {
        if self == other { self } else { Self::Both }
    }

    /// Short label for display.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Reference => "reference",
            Self::Both => "explicit+reference",
        }
    }
}

/// A dependency edge: `consumer` waits for `producer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    /// Node that must succeed first
    pub producer: String,
    /// Node that waits
    pub consumer: String,
    /// How the edge was declared
    pub origin: EdgeOrigin,
}

/// Non-fatal findings about explicit dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphWarning {
    /// The same name appears twice in one `depends_on` list
    DuplicateExplicit { resource: String, dependency: String },
    /// Ordering-only dependency: declared, but no data flows along it
    ExplicitWithoutReference { resource: String, dependency: String },
    /// Declared explicitly and also inferred from a reference
    RedundantExplicit { resource: String, dependency: String },
    /// Already implied through another dependency
    TransitiveExplicit {
        resource: String,
        dependency: String,
        via: String,
    },
}

impl fmt::Display for GraphWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateExplicit {
                resource,
                dependency,
            } => write!(f, "{resource}: '{dependency}' listed more than once in depends_on"),
            Self::ExplicitWithoutReference {
                resource,
                dependency,
            } => write!(
                f,
                "{resource}: depends on '{dependency}' for ordering only (no outputs referenced)"
            ),
            Self::RedundantExplicit {
                resource,
                dependency,
            } => write!(
                f,
                "{resource}: depends_on '{dependency}' is already implied by a reference"
            ),
            Self::TransitiveExplicit {
                resource,
                dependency,
                via,
            } => write!(
                f,
                "{resource}: depends_on '{dependency}' is already implied through '{via}'"
            ),
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    descriptor: ResourceDescriptor,
    dependencies: Vec<usize>,
    dependents: Vec<usize>,
}

/// A validated DAG over resource descriptors.
///
/// Nodes are addressed by index in declaration order.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
    warnings: Vec<GraphWarning>,
}

impl DependencyGraph {
    /// Build and validate the graph.
    pub fn build(store: DescriptorStore) -> Result<Self, BuildError> {
        let descriptors: Vec<ResourceDescriptor> = store.into_iter().collect();

        let mut index = HashMap::with_capacity(descriptors.len());
        for (i, descriptor) in descriptors.iter().enumerate() {
            if index.insert(descriptor.name().to_string(), i).is_some() {
                return Err(BuildError::DuplicateName {
                    name: descriptor.name().to_string(),
                });
            }
        }

        let lookup = |from: &str, to: &str| {
            index
                .get(to)
                .copied()
                .ok_or_else(|| BuildError::DanglingReference {
                    from: from.to_string(),
                    to: to.to_string(),
                })
        };

        // Per consumer: producers in first-seen order with merged origin
        let mut incoming: Vec<Vec<(usize, EdgeOrigin)>> = vec![Vec::new(); descriptors.len()];
        let mut warnings = Vec::new();

        for (consumer, descriptor) in descriptors.iter().enumerate() {
            let mut add = |producer: usize, origin: EdgeOrigin| {
                let slot = &mut incoming[consumer];
                match slot.iter_mut().find(|(p, _)| *p == producer) {
                    Some((_, existing)) => *existing = existing.merge(origin),
                    None => slot.push((producer, origin)),
                }
            };

            for name in descriptor.referenced_resources() {
                add(lookup(descriptor.name(), name)?, EdgeOrigin::Reference);
            }

            let mut seen = BTreeSet::new();
            for name in descriptor.explicit_dependencies() {
                if !seen.insert(name.as_str()) {
                    warnings.push(GraphWarning::DuplicateExplicit {
                        resource: descriptor.name().to_string(),
                        dependency: name.clone(),
                    });
                    continue;
                }
                add(lookup(descriptor.name(), name)?, EdgeOrigin::Explicit);
            }
        }

        let mut nodes: Vec<Node> = descriptors
            .into_iter()
            .map(|descriptor| Node {
                descriptor,
                dependencies: Vec::new(),
                dependents: Vec::new(),
            })
            .collect();

        let mut edges = Vec::new();
        for (consumer, producers) in incoming.iter().enumerate() {
            for &(producer, origin) in producers {
                nodes[consumer].dependencies.push(producer);
                nodes[producer].dependents.push(consumer);
                edges.push(Edge {
                    producer: nodes[producer].descriptor.name().to_string(),
                    consumer: nodes[consumer].descriptor.name().to_string(),
                    origin,
                });
            }
        }

        if let Some(cycle) = find_cycle(&nodes) {
            return Err(BuildError::CycleDetected {
                cycle: cycle
                    .into_iter()
                    .map(|i| nodes[i].descriptor.name().to_string())
                    .collect(),
            });
        }

        let mut graph = Self {
            nodes,
            index,
            edges,
            warnings,
        };
        graph.check_explicit_edges(&incoming);

        log::debug!(
            "Built dependency graph: {} nodes, {} edges, {} warnings",
            graph.len(),
            graph.edges.len(),
            graph.warnings.len()
        );
        Ok(graph)
    }

    fn check_explicit_edges(&mut self, incoming: &[Vec<(usize, EdgeOrigin)>]) {
        for (consumer, producers) in incoming.iter().enumerate() {
            let resource = self.name(consumer).to_string();
            for &(producer, origin) in producers {
                let dependency = self.name(producer).to_string();
                let warning = match origin {
                    EdgeOrigin::Reference => continue,
                    EdgeOrigin::Both => GraphWarning::RedundantExplicit {
                        resource: resource.clone(),
                        dependency,
                    },
                    EdgeOrigin::Explicit => match self.implied_through(consumer, producer) {
                        Some(via) => GraphWarning::TransitiveExplicit {
                            resource: resource.clone(),
                            dependency,
                            via: self.name(via).to_string(),
                        },
                        None => GraphWarning::ExplicitWithoutReference {
                            resource: resource.clone(),
                            dependency,
                        },
                    },
                };
                self.warnings.push(warning);
            }
        }
    }

    /// Another direct dependency of `consumer` through which `producer` is reachable.
    fn implied_through(&self, consumer: usize, producer: usize) -> Option<usize> {
        self.nodes[consumer]
            .dependencies
            .iter()
            .copied()
            .filter(|&dep| dep != producer)
            .find(|&dep| self.ancestors(dep).contains(&producer))
    }

    fn ancestors(&self, node: usize) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut stack = self.nodes[node].dependencies.clone();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                stack.extend(self.nodes[next].dependencies.iter().copied());
            }
        }
        seen
    }

    /// Every export reference must name a declared resource.
    pub fn validate_exports(&self, exports: &BTreeMap<String, Value>) -> Result<(), BuildError> {
        for (name, value) in exports {
            for reference in value.references() {
                if !self.index.contains_key(&reference.resource) {
                    return Err(BuildError::DanglingReference {
                        from: format!("exports.{name}"),
                        to: reference.resource.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Index of the node with this name
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Whether a node with this name exists
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Descriptor of a node
    pub fn descriptor(&self, node: usize) -> &ResourceDescriptor {
        &self.nodes[node].descriptor
    }

    /// Name of a node
    pub fn name(&self, node: usize) -> &str {
        self.nodes[node].descriptor.name()
    }

    /// Blocking predecessors (in-edges)
    pub fn dependencies(&self, node: usize) -> &[usize] {
        &self.nodes[node].dependencies
    }

    /// Nodes to notify on success (out-edges)
    pub fn dependents(&self, node: usize) -> &[usize] {
        &self.nodes[node].dependents
    }

    /// All edges, grouped by consumer in declaration order
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Warnings found while building
    pub fn warnings(&self) -> &[GraphWarning] {
        &self.warnings
    }

    /// Descriptors in declaration order
    pub fn descriptors(&self) -> impl Iterator<Item = &ResourceDescriptor> {
        self.nodes.iter().map(|n| &n.descriptor)
    }

    /// Every node reachable from `node` along out-edges, excluding `node`.
    pub fn transitive_dependents(&self, node: usize) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut stack = self.nodes[node].dependents.clone();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                stack.extend(self.nodes[next].dependents.iter().copied());
            }
        }
        seen
    }

    /// Kahn's algorithm; ties are broken by declaration order.
    pub fn topological_order(&self) -> Vec<usize> {
        let mut remaining: Vec<usize> = self.nodes.iter().map(|n| n.dependencies.len()).collect();
        let mut ready: BTreeSet<usize> = (0..self.len()).filter(|&i| remaining[i] == 0).collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &dependent in &self.nodes[next].dependents {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }
        order
    }

    /// Nodes grouped into waves; every node's dependencies sit in earlier waves.
    pub fn levels(&self) -> Vec<Vec<usize>> {
        let mut depth = vec![0usize; self.len()];
        let mut levels: Vec<Vec<usize>> = Vec::new();
        for node in self.topological_order() {
            let level = self.nodes[node]
                .dependencies
                .iter()
                .map(|&dep| depth[dep] + 1)
                .max()
                .unwrap_or(0);
            depth[node] = level;
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(node);
        }
        levels
    }
}

/// Depth-first search with an explicit recursion stack.
///
/// Returns the cycle in edge direction with the first node repeated last.
fn find_cycle(nodes: &[Node]) -> Option<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Unvisited,
        OnStack,
        Done,
    }

    let mut marks = vec![Mark::Unvisited; nodes.len()];
    for start in 0..nodes.len() {
        if marks[start] != Mark::Unvisited {
            continue;
        }
        marks[start] = Mark::OnStack;
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];

        while let Some(frame) = stack.last_mut() {
            let (node, cursor) = *frame;
            match nodes[node].dependents.get(cursor) {
                Some(&next) => {
                    frame.1 += 1;
                    match marks[next] {
                        Mark::Unvisited => {
                            marks[next] = Mark::OnStack;
                            stack.push((next, 0));
                        }
                        Mark::OnStack => {
                            let from = stack.iter().position(|&(n, _)| n == next).unwrap_or(0);
                            let mut cycle: Vec<usize> = stack[from..].iter().map(|&(n, _)| n).collect();
                            cycle.push(next);
                            return Some(cycle);
                        }
                        Mark::Done => {}
                    }
                }
                None => {
                    marks[node] = Mark::Done;
                    stack.pop();
                }
            }
        }
    }
    None
}
