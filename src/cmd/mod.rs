//! CLI command implementations.
//!
//! | Module       | Commands handled |
//! |--------------|------------------|
//! | `serve`      | `Serve`          |
//! | `build`      | `Build`          |
//! | `deploy`     | `Deploy`         |
//! | `sandboxes`  | `Sandboxes`      |
//! | `config`     | `Config`         |

pub mod build;
pub mod config;
pub mod deploy;
pub mod sandboxes;
pub mod serve;

pub use build::cmd_build;
pub use config::cmd_config;
pub use deploy::cmd_deploy;
pub use sandboxes::cmd_sandboxes;
pub use serve::cmd_serve;

use std::path::Path;

use anyhow::Result;
use shipwright::config::{Secrets, ShipwrightToml};

/// Project configuration with environment overrides, plus credentials.
fn load_settings(project_dir: &Path) -> Result<(ShipwrightToml, Secrets)> {
    let config = ShipwrightToml::load_or_default(project_dir)?;
    Ok((config, Secrets::from_env()))
}
