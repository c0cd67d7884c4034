//! Console progress for apply and destroy runs.

use crate::ui;
use colored::Colorize;
use declarative::{Action, NodeReport, NodeState, ProviderError, RunObserver};
use std::time::Duration;

/// Prints one line per node start, retry and finish.
pub struct ConsoleProgress {
    quiet: bool,
    verbose: bool,
}

impl ConsoleProgress {
    pub fn new(quiet: bool, verbose: bool) -> Self {
        Self { quiet, verbose }
    }
}

impl RunObserver for ConsoleProgress {
    fn on_run_start(&self, nodes: usize) {
        if !self.quiet && nodes > 0 {
            println!();
            println!("  {} Provisioning {nodes} resource(s)...", "→".cyan());
        }
    }

    fn on_node_start(&self, name: &str, action: Action) {
        if self.quiet || (action == Action::NoOp && !self.verbose) {
            return;
        }
        println!(
            "    {} {} {}",
            ui::action_symbol(action),
            name,
            action.as_str().dimmed()
        );
    }

    fn on_node_retry(
        &self,
        name: &str,
        attempt: u32,
        max_attempts: u32,
        error: &ProviderError,
        delay: Duration,
    ) {
        if self.quiet {
            return;
        }
        println!(
            "    {} {name}: attempt {attempt}/{max_attempts} failed, retrying in {}",
            "⟳".yellow(),
            ui::format_duration(delay)
        );
        if self.verbose {
            ui::dim(&format!("      {}", error.message));
        }
    }

    fn on_node_finish(&self, report: &NodeReport) {
        if self.quiet {
            return;
        }
        if report.state == NodeState::Succeeded
            && report.action == Some(Action::NoOp)
            && !self.verbose
        {
            return;
        }
        let elapsed = report
            .duration()
            .map(|d| format!(" ({})", ui::format_duration(d)))
            .unwrap_or_default();
        match &report.error {
            Some(error) => println!(
                "    {} {} {}{}",
                ui::state_marker(report.state),
                report.name,
                ui::truncate(&error.to_string(), 100).red(),
                elapsed.dimmed()
            ),
            None => println!(
                "    {} {} {}{}",
                ui::state_marker(report.state),
                report.name,
                report.state.as_str().dimmed(),
                elapsed.dimmed()
            ),
        }
    }
}
