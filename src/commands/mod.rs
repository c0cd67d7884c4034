pub mod apply;
pub mod destroy;
pub mod graph;
pub mod outputs;
pub mod plan;
pub mod validate;

use anyhow::{Context as _, Result};
use declarative::CancelToken;

/// Ask before changing anything.
fn confirm(prompt: &str, default: bool) -> Result<bool> {
    dialoguer::Confirm::new()
        .with_prompt(prompt)
        .default(default)
        .interact()
        .context("Failed to read confirmation")
}

/// First Ctrl+C stops dispatching new work; a second one exits immediately.
fn cancel_on_interrupt(token: CancelToken) -> Result<()> {
    ctrlc::set_handler(move || {
        if token.is_cancelled() {
            std::process::exit(130);
        }
        eprintln!();
        eprintln!("Interrupted: waiting for in-flight operations (Ctrl+C again to abort)");
        token.cancel();
    })
    .context("Failed to install Ctrl+C handler")
}
