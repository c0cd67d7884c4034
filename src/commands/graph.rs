//! `keel graph` - show provisioning levels

use crate::Context;
use crate::project::Project;
use crate::ui;
use anyhow::Result;
use colored::Colorize;
use declarative::{DependencyGraph, EdgeOrigin};

pub fn run(ctx: &Context) -> Result<()> {
    let project = Project::load(ctx)?;
    let engine = project.engine(project.file.execute_options())?;
    let graph = engine.validate(&project.declaration)?;

    ui::header(&format!("Dependency graph: {}", project.file.name));
    print_levels(&graph);

    if !graph.warnings().is_empty() {
        ui::section("Warnings");
        for warning in graph.warnings() {
            ui::warn(&warning.to_string());
        }
    }
    Ok(())
}

/// Nodes on the same level have no path between them and may run together.
fn print_levels(graph: &DependencyGraph) {
    for (depth, level) in graph.levels().iter().enumerate() {
        println!();
        println!("  {}", format!("Level {depth}").cyan().bold());
        for &node in level {
            let descriptor = graph.descriptor(node);
            println!(
                "    {} {}",
                descriptor.name().bold(),
                descriptor.kind().dimmed()
            );
            for edge in graph
                .edges()
                .iter()
                .filter(|e| e.consumer == descriptor.name())
            {
                let origin = match edge.origin {
                    EdgeOrigin::Reference => edge.origin.as_str().normal(),
                    EdgeOrigin::Explicit => edge.origin.as_str().yellow(),
                    EdgeOrigin::Both => edge.origin.as_str().dimmed(),
                };
                println!("      ← {} ({origin})", edge.producer);
            }
        }
    }
}
