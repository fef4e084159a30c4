//! Configuration view and validation commands: `shipwright config`.

use std::path::Path;

use anyhow::Result;
use shipwright::config::{Secrets, ShipwrightToml, config_path};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let path = config_path(project_dir);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Shipwright Configuration");
            println!("========================");
            println!();

            if path.exists() {
                println!("Config file: {}", path.display());
            } else {
                println!("No shipwright.toml found at {}; using defaults.", path.display());
            }
            println!();

            let config = ShipwrightToml::load_or_default(project_dir)?;
            print!("{}", toml::to_string_pretty(&config)?);
            println!();

            println!("Credentials (from environment):");
            println!("  {:?}", Secrets::from_env());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let config = ShipwrightToml::load_or_default(project_dir)?;
            let mut warnings = config.validate();
            warnings.extend(Secrets::from_env().validate(&config));

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if path.exists() {
                println!("shipwright.toml already exists at {}", path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            ShipwrightToml::default().save(&path)?;

            println!("Created shipwright.toml at {}", path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] host, port, dev_mode");
            println!("  - [generation] model, token limits, temperatures");
            println!("  - [sandbox] provider, image, port, health polling");
            println!("  - [deploy] repo_prefix, branch, status polling");
            println!();
            println!("Credentials are read from the environment or a .env file.");
            println!();
        }
    }

    Ok(())
}
