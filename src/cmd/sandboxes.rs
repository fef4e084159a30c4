//! Sandbox housekeeping commands: `shipwright sandboxes`.

use std::path::Path;

use anyhow::Result;
use console::style;
use shipwright::sandbox::{delete_all, provider_from_config};

use super::super::SandboxCommands;

pub async fn cmd_sandboxes(project_dir: &Path, command: SandboxCommands) -> Result<()> {
    let (config, secrets) = super::load_settings(project_dir)?;
    let provider = provider_from_config(&config.sandbox, &secrets)?;

    match command {
        SandboxCommands::List => {
            let ids = provider.list_ids().await?;
            if ids.is_empty() {
                println!("No {} sandboxes.", provider.name());
            } else {
                println!("{} {} sandbox(es):", ids.len(), provider.name());
                for id in ids {
                    println!("  {}", id);
                }
            }
        }
        SandboxCommands::Delete { id } => {
            provider.delete(&id).await?;
            println!("{} Deleted {}", style("✓").green(), id);
        }
        SandboxCommands::Cleanup => {
            let report = delete_all(provider.as_ref()).await?;
            println!("Deleted {} sandbox(es)", report.deleted.len());
            if !report.failed.is_empty() {
                println!(
                    "{} Failed to delete: {}",
                    style("✗").red(),
                    report.failed.join(", ")
                );
            }
        }
    }

    Ok(())
}
