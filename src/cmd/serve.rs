//! Reader server command (`pagewise serve`).

use std::path::Path;

use anyhow::Result;
use pagewise::config::PagewiseConfig;

pub async fn cmd_serve(project_dir: &Path, config: &PagewiseConfig, open_browser: bool) -> Result<()> {
    for warning in config.validate() {
        eprintln!("{} {}", console::style("warning:").yellow().bold(), warning);
    }

    // No browser inside containers in dev mode
    let open_browser = open_browser && !config.server.dev_mode;

    pagewise::reader::server::start_server(config, project_dir, |addr| {
        let url = format!("http://localhost:{}", addr.port());
        println!("Pagewise running at {}", console::style(&url).cyan());
        if open_browser && let Err(e) = open::that(&url) {
            eprintln!("Failed to open browser: {}", e);
        }
    })
    .await?;

    println!("Server shut down gracefully.");
    Ok(())
}
