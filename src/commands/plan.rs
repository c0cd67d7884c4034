//! `keel plan` - preview what apply would change

use crate::Context;
use crate::project::Project;
use crate::ui;
use anyhow::{Context as _, Result};
use colored::Colorize;
use declarative::{Action, Plan, StateStore};

pub fn run(ctx: &Context) -> Result<()> {
    let project = Project::load(ctx)?;
    let engine = project.engine(project.file.execute_options())?;
    let state = project
        .store()
        .load()
        .with_context(|| format!("Could not load state from {}", project.state_path.display()))?;

    let plan = engine.plan(&project.declaration, &state)?;
    display_plan(&plan);
    Ok(())
}

/// Print the plan in the boxed diff layout.
pub fn display_plan(plan: &Plan) {
    for warning in &plan.warnings {
        ui::warn(&warning.to_string());
    }

    if !plan.has_changes() {
        println!();
        println!("  {} No changes needed", "✓".green());
        return;
    }

    println!();
    println!(
        "┌─ {} ─────────────────────────────────────────┐",
        "Execution Plan".bold()
    );
    println!("│");

    for entry in plan.entries.iter().filter(|e| e.action.is_change()) {
        let pending = if entry.pending_inputs {
            " (inputs known after apply)".dimmed().to_string()
        } else {
            String::new()
        };
        println!(
            "│ {} {:<30} {}{}",
            ui::action_symbol(entry.action),
            entry.name,
            entry.kind.dimmed(),
            pending
        );
        if entry.action == Action::Create || entry.action == Action::Delete {
            continue;
        }
        for change in &entry.changes {
            println!("│       {}", ui::truncate(&change.to_string(), 100).dimmed());
        }
    }

    let summary = plan.summary();
    println!("│");
    println!("├─────────────────────────────────────────────────────┤");
    println!(
        "│ Plan: {} to create, {} to update, {} to replace, {} to delete ({} unchanged)",
        summary.create.to_string().green(),
        summary.update.to_string().yellow(),
        summary.replace.to_string().magenta(),
        summary.delete.to_string().red(),
        summary.unchanged
    );
    println!("└─────────────────────────────────────────────────────┘");
}
