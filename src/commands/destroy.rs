//! `keel destroy` - delete everything recorded in state

use super::apply::print_report;
use super::{cancel_on_interrupt, confirm};
use crate::Context;
use crate::cli::DestroyArgs;
use crate::progress::ConsoleProgress;
use crate::project::Project;
use crate::ui;
use anyhow::{Context as _, Result, bail};
use colored::Colorize;
use declarative::{Action, StateStore};
use std::sync::Arc;

pub fn run(ctx: &Context, args: &DestroyArgs) -> Result<()> {
    let project = Project::load(ctx)?;
    let store = project.store();
    let state = store
        .load()
        .with_context(|| format!("Could not load state from {}", project.state_path.display()))?;

    if state.is_empty() {
        ui::info(&format!("Nothing to destroy for {}", project.file.name));
        return Ok(());
    }

    let order = state.teardown_order();
    if !ctx.quiet {
        ui::header(&format!("Destroy: {}", project.file.name));
        for name in &order {
            let kind = state.get(name).map(|r| r.kind.as_str()).unwrap_or_default();
            println!(
                "  {} {:<30} {}",
                ui::action_symbol(Action::Delete),
                name,
                kind.dimmed()
            );
        }
    }

    let prompt = format!("Delete {} resource(s)?", order.len());
    if !args.yes && !confirm(&prompt, false)? {
        println!();
        println!("  {} Aborted", "✗".red());
        return Ok(());
    }

    let mut options = project.file.execute_options();
    if let Some(jobs) = args.jobs {
        options.jobs = jobs;
    }
    let engine = project
        .engine(options)?
        .with_observer(Arc::new(ConsoleProgress::new(ctx.quiet, ctx.verbose > 0)));

    cancel_on_interrupt(engine.cancel_token())?;
    let report = engine.destroy(&store)?;
    print_report(&report, "deleted");

    if !report.is_success() {
        bail!(
            "Destroy incomplete: {} resource(s) remain in {}",
            store.load()?.resources.len(),
            project.state_path.display()
        );
    }
    Ok(())
}
