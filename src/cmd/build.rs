//! In-process build command: `shipwright build`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use shipwright::files::build_archive;
use shipwright::server::AppState;
use shipwright::session::{EventKind, SessionId};

pub async fn cmd_build(
    project_dir: &Path,
    prompt: &str,
    session_id: Option<&str>,
    archive: Option<&Path>,
    verbose: bool,
) -> Result<()> {
    let (config, secrets) = super::load_settings(project_dir)?;
    let session = match session_id {
        Some(raw) => raw.parse::<SessionId>()?,
        None => SessionId::generate(),
    };

    let state = AppState::from_config(&config, &secrets)?;
    let mut subscription = state
        .sessions
        .subscribe(&session, 0, config.session.stream_timeout());
    let handle = state.builds.start(session.clone(), prompt.to_string())?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .expect("progress bar template is a valid static string"),
    );
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message(format!("Session {}", style(&session).dim()));

    while let Some(event) = subscription.next_event().await {
        match &event.kind {
            EventKind::Info(message) => {
                spinner.set_message(message.clone());
                if verbose {
                    spinner.println(format!("  {} {}", style("→").dim(), style(message).dim()));
                }
            }
            EventKind::Complete { .. } | EventKind::Error { .. } => break,
        }
    }
    spinner.finish_and_clear();

    let outcome = handle.await.context("Build task panicked")?;

    if let Some(path) = archive
        && let Some(files) = state.sessions.files(&session)
        && !files.is_empty()
    {
        let bytes = build_archive(&files)?;
        std::fs::write(path, bytes)
            .with_context(|| format!("Failed to write archive to {}", path.display()))?;
        println!("{} Wrote {} file(s) to {}", style("📦").dim(), files.len(), path.display());
    }

    match outcome {
        Ok(outcome) => {
            println!(
                "{} Preview ready: {}",
                style("✅").green(),
                style(&outcome.preview_url).cyan().underlined()
            );
            println!("  Sandbox: {}", outcome.sandbox.id);
            println!("  Files:   {}", outcome.files_generated);
            if !outcome.externally_reachable {
                println!(
                    "  {}",
                    style("The preview did not answer yet; it may take a little longer.").yellow()
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("{} Build failed: {}", style("❌").red(), e);
            Err(e.into())
        }
    }
}
