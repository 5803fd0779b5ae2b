//! Role management commands (`pagewise admin`).

use std::path::Path;

use anyhow::Result;
use pagewise::config::PagewiseConfig;
use pagewise::reader::models::Role;
use pagewise::reader::store::ContentStore;

use super::super::AdminCommands;

pub async fn cmd_admin(
    project_dir: &Path,
    config: &PagewiseConfig,
    command: AdminCommands,
) -> Result<()> {
    let store = super::open_store(project_dir, config)?;

    match command {
        AdminCommands::Grant { uid } => {
            let user = store.set_user_role(&uid, Role::Admin).await?;
            tracing::info!(uid = %user.uid, "admin role granted");
            println!("{} is now {}", user.uid, console::style(user.role).green().bold());
        }
        AdminCommands::Revoke { uid } => {
            let user = store.set_user_role(&uid, Role::User).await?;
            tracing::info!(uid = %user.uid, "admin role revoked");
            println!("{} is now {}", user.uid, user.role);
        }
        AdminCommands::Show { uid } => {
            let record = store.lock_sync()?.get_user(&uid)?;
            match record {
                Some(user) => {
                    println!("{}: {}", user.uid, user.role);
                    if let Some(email) = &user.email {
                        println!("  email:      {}", email);
                    }
                    println!("  created:    {}", user.created_at);
                    if let Some(last_login) = &user.last_login {
                        println!("  last login: {}", last_login);
                    }
                }
                None => println!("{}: {} {}", uid, Role::User, console::style("(no record)").dim()),
            }
        }
    }

    Ok(())
}
