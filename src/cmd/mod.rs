//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled     |
//! |-----------|----------------------|
//! | `init`    | `Init`               |
//! | `serve`   | `Serve`              |
//! | `library` | `Library`            |
//! | `author`  | `Author`             |
//! | `admin`   | `Admin`              |
//! | `config`  | `Config`             |

pub mod admin;
pub mod author;
pub mod config;
pub mod init;
pub mod library;
pub mod serve;

pub use admin::cmd_admin;
pub use author::cmd_author;
pub use config::cmd_config;
pub use init::cmd_init;
pub use library::cmd_library;
pub use serve::cmd_serve;

use std::path::Path;

use anyhow::{Context, Result};
use pagewise::config::PagewiseConfig;
use pagewise::reader::db::{DbHandle, LibraryDb};

/// Open the library database named by the configuration.
pub(crate) fn open_store(project_dir: &Path, config: &PagewiseConfig) -> Result<DbHandle> {
    let db_path = config.db_path(project_dir);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = LibraryDb::new(&db_path)
        .with_context(|| format!("Failed to open library database at {}", db_path.display()))?;
    Ok(DbHandle::new(db))
}
