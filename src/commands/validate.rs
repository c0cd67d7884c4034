//! `keel validate` - check a declaration without touching anything

use crate::Context;
use crate::project::Project;
use crate::ui;
use anyhow::Result;

pub fn run(ctx: &Context) -> Result<()> {
    let project = Project::load(ctx)?;
    let engine = project.engine(project.file.execute_options())?;
    let graph = engine.validate(&project.declaration)?;

    if !ctx.quiet {
        for warning in graph.warnings() {
            ui::warn(&warning.to_string());
        }
    }
    ui::success(&format!(
        "{}: {} resource(s), {} edge(s), {} export(s)",
        project.file.name,
        graph.len(),
        graph.edges().len(),
        project.declaration.exports.len()
    ));
    Ok(())
}
