//! A single apply run: the built graph, one output cell per node, and the
//! export cells chained onto them.

use crate::cell::{OutputCell, Outcome};
use crate::descriptor::ResolvedResource;
use crate::error::{CellError, ResolveError};
use crate::graph::DependencyGraph;
use crate::types::{NodeState, RunReport};
use crate::value::{Reference, Value};
use std::collections::{BTreeMap, HashMap};

/// Cell type carrying a node's outputs or an export value
pub type ValueCell = OutputCell<serde_json::Value>;

/// Graph plus output cells for one run.
#[derive(Debug)]
pub struct ApplyRun {
    graph: DependencyGraph,
    cells: Vec<ValueCell>,
    exports: BTreeMap<String, ValueCell>,
    states: Vec<NodeState>,
}

impl ApplyRun {
    /// Create the node cells and chain every export onto them.
    ///
    /// Exports must already be validated against the graph.
    pub fn new(graph: DependencyGraph, exports: &BTreeMap<String, Value>) -> Self {
        let cells: Vec<ValueCell> = graph.descriptors().map(|d| OutputCell::new(d.name())).collect();
        let exports = exports
            .iter()
            .map(|(name, value)| (name.clone(), export_cell(name, value, &graph, &cells)))
            .collect();
        let states = vec![NodeState::Pending; graph.len()];
        Self {
            graph,
            cells,
            exports,
            states,
        }
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Output cell of a node by name
    pub fn cell(&self, name: &str) -> Option<&ValueCell> {
        self.graph.index_of(name).map(|i| &self.cells[i])
    }

    pub(crate) fn cell_at(&self, node: usize) -> &ValueCell {
        &self.cells[node]
    }

    /// Export cells by name
    pub fn exports(&self) -> &BTreeMap<String, ValueCell> {
        &self.exports
    }

    /// Terminal state of a node once the run finished
    pub fn state(&self, name: &str) -> Option<NodeState> {
        self.graph.index_of(name).map(|i| self.states[i])
    }

    /// Copy terminal states out of a finished run's report.
    pub(crate) fn record(&mut self, report: &RunReport) {
        for node in &report.nodes {
            if let Some(i) = self.graph.index_of(&node.name) {
                self.states[i] = node.state;
            }
        }
    }

    /// Substitute a node's references from its producers' cells.
    pub fn resolve_node(&self, node: usize) -> Result<ResolvedResource, ResolveError> {
        self.graph.descriptor(node).resolve(&mut |reference: &Reference| {
            let outputs = self
                .graph
                .index_of(&reference.resource)
                .and_then(|producer| self.cells[producer].get())
                .ok_or_else(|| ResolveError::Unavailable {
                    reference: reference.to_string(),
                })?;
            match outputs {
                Ok(outputs) => reference.extract(&outputs),
                Err(source) => Err(ResolveError::Failed {
                    reference: reference.to_string(),
                    source,
                }),
            }
        })
    }

    /// Block until every export settles.
    ///
    /// Only call after the run finished; every node cell is settled then.
    pub fn export_values(&self) -> BTreeMap<String, Outcome<serde_json::Value>> {
        self.exports
            .iter()
            .map(|(name, cell)| (name.clone(), cell.wait()))
            .collect()
    }

    /// Outcome of every settled node cell
    pub fn outputs(&self) -> BTreeMap<String, Outcome<serde_json::Value>> {
        self.graph
            .descriptors()
            .zip(&self.cells)
            .filter_map(|(d, cell)| cell.get().map(|outcome| (d.name().to_string(), outcome)))
            .collect()
    }
}

/// Join the producers an export references and evaluate it once all resolve.
fn export_cell(
    name: &str,
    value: &Value,
    graph: &DependencyGraph,
    cells: &[ValueCell],
) -> ValueCell {
    let label = format!("exports.{name}");

    let mut producers: Vec<String> = Vec::new();
    for reference in value.references() {
        if !producers.contains(&reference.resource) {
            producers.push(reference.resource.clone());
        }
    }

    let mut sources = Vec::with_capacity(producers.len());
    for producer in &producers {
        match graph.index_of(producer) {
            Some(i) => sources.push(cells[i].clone()),
            None => {
                return OutputCell::failed(
                    label,
                    CellError::new(producer.as_str(), "resource is not declared"),
                );
            }
        }
    }

    let value = value.clone();
    OutputCell::join(label.clone(), &sources).try_map(move |outputs| {
        let by_name: HashMap<&str, &serde_json::Value> = producers
            .iter()
            .map(String::as_str)
            .zip(outputs.iter())
            .collect();
        value
            .resolve(&mut |reference: &Reference| match by_name.get(reference.resource.as_str()) {
                Some(outputs) => reference.extract(outputs),
                None => Err(ResolveError::Unavailable {
                    reference: reference.to_string(),
                }),
            })
            .map_err(|e| CellError::new(label, e.to_string()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DescriptorStore, ResourceDescriptor};
    use serde_json::json;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn run() -> ApplyRun {
        let store: DescriptorStore = vec![
            ResourceDescriptor::new("lb", "Service"),
            ResourceDescriptor::new("route", "HTTPRoute")
                .property("ip", Value::parse_str("${lb.status.ip}").unwrap()),
        ]
        .into_iter()
        .collect();
        let graph = DependencyGraph::build(store).unwrap();

        let mut exports = BTreeMap::new();
        exports.insert(
            "gatewayIP".to_string(),
            Value::parse_str("${lb.status.ingress[0].ip ?? \"pending\"}").unwrap(),
        );
        exports.insert(
            "testCommand".to_string(),
            Value::parse_str("curl http://${lb.status.ip}/get").unwrap(),
        );
        exports.insert("istioVersion".to_string(), Value::literal("1.21.0"));
        ApplyRun::new(graph, &exports)
    }

    #[test]
    fn test_exports_resolve_when_producer_resolves() {
        let run = run();
        assert!(run.exports()["gatewayIP"].get().is_none());

        run.cell("lb")
            .unwrap()
            .resolve(json!({"status": {"ip": "10.0.0.7", "ingress": []}}))
            .unwrap();

        let values = run.export_values();
        assert_eq!(values["gatewayIP"], Ok(json!("pending")));
        assert_eq!(values["testCommand"], Ok(json!("curl http://10.0.0.7/get")));
        assert_eq!(values["istioVersion"], Ok(json!("1.21.0")));
    }

    #[test]
    fn test_export_fails_with_producer_error() {
        let run = run();
        run.cell("lb")
            .unwrap()
            .fail(CellError::new("lb", "quota exceeded"))
            .unwrap();
        assert_eq!(
            run.exports()["testCommand"].wait_timeout(WAIT),
            Some(Err(CellError::new("lb", "quota exceeded")))
        );
    }

    #[test]
    fn test_resolve_node_from_producer_cell() {
        let run = run();
        let route = run.graph().index_of("route").unwrap();
        assert!(matches!(
            run.resolve_node(route),
            Err(ResolveError::Unavailable { .. })
        ));

        run.cell("lb").unwrap().resolve(json!({"status": {}})).unwrap();
        assert!(matches!(
            run.resolve_node(route),
            Err(ResolveError::MissingField { .. })
        ));
    }

    #[test]
    fn test_resolve_node_reports_failed_producer() {
        let run = run();
        run.cell("lb")
            .unwrap()
            .fail(CellError::new("lb", "down"))
            .unwrap();
        let route = run.graph().index_of("route").unwrap();
        assert!(matches!(
            run.resolve_node(route),
            Err(ResolveError::Failed { .. })
        ));
    }
}
