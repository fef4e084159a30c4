//! API server command: `shipwright serve`.

use std::path::Path;

use anyhow::Result;
use console::style;
use shipwright::server::{ServerConfig, start_server};

pub async fn cmd_serve(
    project_dir: &Path,
    host: Option<String>,
    port: Option<u16>,
    dev: bool,
    open_browser: bool,
) -> Result<()> {
    let (config, secrets) = super::load_settings(project_dir)?;
    for warning in secrets.validate(&config) {
        tracing::warn!("{}", warning);
    }

    let mut server = ServerConfig::from_config(&config);
    if let Some(host) = host {
        server.host = host;
    }
    if let Some(port) = port {
        server.port = port;
    }
    server.dev_mode |= dev;

    start_server(server, &config, &secrets, |url| {
        println!("{} Shipwright running at {}", style("▶").green().bold(), style(url).cyan());
        if open_browser && let Err(e) = open::that(url) {
            eprintln!("Failed to open browser: {}", e);
        }
    })
    .await?;

    println!("Server shut down gracefully.");
    Ok(())
}
