//! `keel outputs` - exported values from the last apply

use crate::Context;
use crate::cli::OutputsArgs;
use crate::project::Project;
use crate::ui;
use anyhow::{Context as _, Result, bail};
use chrono::Utc;
use declarative::StateStore;

pub fn run(ctx: &Context, args: &OutputsArgs) -> Result<()> {
    let project = Project::load(ctx)?;
    let state = project
        .store()
        .load()
        .with_context(|| format!("Could not load state from {}", project.state_path.display()))?;

    if let Some(name) = &args.name {
        let Some(value) = state.outputs.get(name) else {
            bail!("No export named '{name}' in {}", project.state_path.display());
        };
        if args.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{}", ui::format_value(value));
        }
        return Ok(());
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&state.outputs)?);
        return Ok(());
    }

    if state.outputs.is_empty() {
        ui::info("No outputs recorded; run `keel apply` first");
        return Ok(());
    }

    ui::header(&format!("Outputs: {}", project.file.name));
    for (name, value) in &state.outputs {
        ui::kv(name, &ui::format_value(value));
    }
    if let Some(updated) = state.last_updated {
        println!();
        let age = (Utc::now() - updated).to_std().unwrap_or_default();
        ui::dim(&format!(
            "Last applied {} ({} ago)",
            updated.format("%Y-%m-%d %H:%M:%S UTC"),
            ui::format_duration(age)
        ));
    }
    Ok(())
}
