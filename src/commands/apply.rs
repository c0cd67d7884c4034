//! `keel apply` - converge resources to the declaration

use super::plan::display_plan;
use super::{cancel_on_interrupt, confirm};
use crate::Context;
use crate::cli::ApplyArgs;
use crate::progress::ConsoleProgress;
use crate::project::Project;
use crate::ui;
use anyhow::{Context as _, Result, bail};
use colored::Colorize;
use declarative::{NodeError, Outcome, RunReport, RunStatus, StateStore};
use std::collections::BTreeMap;
use std::sync::Arc;

pub fn run(ctx: &Context, args: &ApplyArgs) -> Result<()> {
    let project = Project::load(ctx)?;

    let mut options = project.file.execute_options();
    if let Some(jobs) = args.jobs {
        options.jobs = jobs;
    }
    if let Some(max_attempts) = args.max_attempts {
        options.retry.max_attempts = max_attempts;
    }
    if args.rollback {
        options.rollback_on_failure = true;
    }
    if args.no_prune {
        options.prune_orphans = false;
    }

    let store = project.store();
    let engine = project
        .engine(options)?
        .with_observer(Arc::new(ConsoleProgress::new(ctx.quiet, ctx.verbose > 0)));

    let state = store
        .load()
        .with_context(|| format!("Could not load state from {}", project.state_path.display()))?;
    let plan = engine.plan(&project.declaration, &state)?;
    if !ctx.quiet {
        display_plan(&plan);
    }

    if plan.has_changes() && !args.yes && !confirm("Apply these changes?", true)? {
        println!();
        println!("  {} Aborted", "✗".red());
        return Ok(());
    }

    cancel_on_interrupt(engine.cancel_token())?;
    let outcome = engine.apply(&project.declaration, &store)?;

    print_report(&outcome.report, "applied");
    if !ctx.quiet {
        print_exports(&outcome.exports);
    }
    log::info!("State saved to {}", project.state_path.display());

    match outcome.report.status {
        RunStatus::Succeeded => Ok(()),
        RunStatus::Failed => bail!("Apply failed"),
        RunStatus::Cancelled => bail!("Apply cancelled"),
    }
}

/// Print the outcome summary and explain every failure.
pub fn print_report(report: &RunReport, verb: &str) {
    let summary = report.summary();
    println!();
    match report.status {
        RunStatus::Succeeded => println!(
            "  {} {} resource(s) {verb} in {}",
            "✓".green().bold(),
            summary.total_changes(),
            ui::format_duration(report.elapsed)
        ),
        RunStatus::Failed => println!("  {} Finished with errors", "⚠".yellow().bold()),
        RunStatus::Cancelled => println!("  {} Cancelled", "⊘".yellow().bold()),
    }

    let counts = [
        (summary.created, "created"),
        (summary.updated, "updated"),
        (summary.replaced, "replaced"),
        (summary.deleted, "deleted"),
        (summary.unchanged, "unchanged"),
        (summary.cancelled, "cancelled"),
    ];
    for (count, label) in counts {
        if count > 0 {
            println!("    • {count} {label}");
        }
    }
    if summary.failed > 0 {
        println!("    • {} {}", summary.failed, "failed".red());
    }
    if summary.skipped > 0 {
        println!("    • {} {}", summary.skipped, "skipped (dependency failed)".red());
    }

    let roots: Vec<_> = report.root_failures().collect();
    if roots.is_empty() {
        return;
    }
    ui::section("Failures");
    for node in roots {
        let attempts = match &node.error {
            Some(NodeError::Provider { attempts, .. }) if *attempts > 1 => {
                format!(" after {attempts} attempts")
            }
            _ => String::new(),
        };
        println!(
            "  {} {} ({}){attempts}",
            ui::state_marker(node.state),
            node.name.bold(),
            node.state
        );
        if let Some(error) = &node.error {
            ui::dim(&error.to_string());
        }
    }
    for node in report.skipped() {
        println!(
            "  {} {} {}",
            "↳".dimmed(),
            node.name,
            report.causal_chain(&node.name).join(" → ").dimmed()
        );
    }
}

fn print_exports(exports: &BTreeMap<String, Outcome<serde_json::Value>>) {
    if exports.is_empty() {
        return;
    }
    ui::section("Outputs");
    for (name, value) in exports {
        match value {
            Ok(value) => ui::kv(name, &ui::format_value(value)),
            Err(e) => ui::kv(name, &format!("unavailable ({e})").red().to_string()),
        }
    }
}
