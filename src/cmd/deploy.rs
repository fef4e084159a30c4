//! Archive deployment command: `shipwright deploy`.

use std::path::Path;

use anyhow::{Context, Result, bail};
use console::style;
use shipwright::deploy::{DeployRequest, DeploymentState};
use shipwright::files::extract_archive;
use shipwright::server::AppState;

pub async fn cmd_deploy(
    project_dir: &Path,
    archive: &Path,
    project_name: Option<String>,
    message: Option<String>,
) -> Result<()> {
    let request = DeployRequest {
        commit_message: message,
        project_prompt: None,
        project_name: project_name.or_else(|| {
            archive
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
        }),
    };
    request.validate()?;

    let bytes = std::fs::read(archive)
        .with_context(|| format!("Failed to read archive {}", archive.display()))?;
    let files = extract_archive(&bytes)?;
    println!("Deploying {} file(s) from {}", files.len(), archive.display());

    let (config, secrets) = super::load_settings(project_dir)?;
    let state = AppState::from_config(&config, &secrets)?;
    let result = state.deployments.deploy_files(&files, &request).await?;

    if let Some(url) = &result.github_url {
        println!("  Repository: {}", style(url).cyan());
    }
    if result.success {
        if let Some(url) = &result.deployment_url {
            println!("  Deployment: {}", style(url).cyan().underlined());
        }
        if result.deployment_state == Some(DeploymentState::Pending) {
            println!(
                "  {}",
                style("Still building; the URL will serve once it finishes.").yellow()
            );
        }
        println!("{} Deployed {} file(s)", style("✅").green(), result.files_deployed);
        return Ok(());
    }

    let error = result.error.unwrap_or_else(|| "unknown error".to_string());
    if result.github_url.is_some() {
        bail!("Repository created but hosting deployment failed: {}", error);
    }
    bail!("Deployment failed: {}", error)
}
