//! Project setup command (`pagewise init`).

use std::path::Path;

use anyhow::{Context, Result};
use pagewise::config::{CONFIG_DIR, PagewiseConfig};

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    let pagewise_dir = project_dir.join(CONFIG_DIR);
    std::fs::create_dir_all(&pagewise_dir)
        .with_context(|| format!("Failed to create {}", pagewise_dir.display()))?;

    let config_path = PagewiseConfig::path_in(project_dir);
    let config = if config_path.exists() {
        println!("Keeping existing {}", config_path.display());
        PagewiseConfig::load(&config_path)?
    } else {
        let config = PagewiseConfig::default();
        config.save(&config_path)?;
        println!("Created {}", config_path.display());
        config
    };

    let db_path = config.db_path(project_dir);
    super::open_store(project_dir, &config)?;
    println!("Library database ready at {}", db_path.display());
    println!();
    println!("Initialized pagewise project in {}", project_dir.display());
    println!();
    println!("Next steps:");
    println!("  pagewise admin grant <uid>   give a user authoring rights");
    println!("  pagewise author --as <uid>   add books and chapters");
    println!("  pagewise serve               start reading");
    Ok(())
}
