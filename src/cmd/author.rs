//! Interactive authoring command (`pagewise author`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use dialoguer::{Confirm, Input, Select, theme::ColorfulTheme};
use pagewise::config::PagewiseConfig;
use pagewise::errors::ReaderError;
use pagewise::reader::authoring::{AuthoringFlow, AuthoringView, Notice};
use pagewise::reader::db::DbHandle;
use pagewise::reader::identity::{IdentityProvider, LocalIdentityProvider, follow_identity};
use pagewise::reader::models::UserIdentity;

pub async fn cmd_author(project_dir: &Path, config: &PagewiseConfig, uid: &str) -> Result<()> {
    let store = Arc::new(super::open_store(project_dir, config)?);

    let provider = LocalIdentityProvider::new(UserIdentity::new(uid));
    let (mut auth_rx, follower) = follow_identity(&provider, Arc::clone(&store));
    provider.sign_in().await?;
    auth_rx
        .changed()
        .await
        .context("Identity resolution stopped unexpectedly")?;
    let auth = auth_rx.borrow_and_update().clone();

    let mut flow = match AuthoringFlow::open(store, &auth).await {
        Ok(flow) => flow,
        Err(ReaderError::NotAuthorized) => {
            println!(
                "{} {} is not an admin.",
                console::style("Error:").red().bold(),
                uid
            );
            println!("Run 'pagewise admin grant {}' first.", uid);
            follower.abort();
            return Ok(());
        }
        Err(e) => {
            follower.abort();
            return Err(e.into());
        }
    };

    println!();
    println!("{}", console::style("Pagewise Authoring").bold().cyan());
    println!("Signed in as {}", auth.identity.as_ref().map(|i| i.display_name()).unwrap_or_default());

    loop {
        let keep_going = match flow.view().clone() {
            AuthoringView::Books => books_menu(&mut flow).await?,
            AuthoringView::Chapters { book } => {
                chapters_menu(&mut flow, &book.title).await?;
                true
            }
        };
        if !keep_going {
            break;
        }
    }

    provider.sign_out().await?;
    follower.abort();
    Ok(())
}

fn print_notice(notice: &Notice) {
    if notice.is_success() {
        println!("{}", console::style(notice.message()).green());
    } else {
        println!("{}", console::style(notice.message()).red());
    }
}

fn print_error(message: impl std::fmt::Display) {
    println!("{} {}", console::style("Error:").red().bold(), message);
}

fn pick(prompt: &str, items: &[String]) -> Result<Option<usize>> {
    if items.is_empty() {
        println!("Nothing to choose from.");
        return Ok(None);
    }
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(items)
        .default(0)
        .interact_opt()?;
    Ok(selection)
}

/// Returns `false` when the user quits.
async fn books_menu(flow: &mut AuthoringFlow<DbHandle>) -> Result<bool> {
    println!();
    println!("{}", console::style("Books").bold());
    if flow.books().is_empty() {
        println!("  {}", console::style("No books yet.").dim());
    }
    for book in flow.books() {
        println!("  [{}] {}", book.id, book.title);
    }
    println!();

    let options = &["Open a book", "Create a book", "Delete a book", "Quit"];
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("What next?")
        .items(options)
        .default(0)
        .interact()?;

    let titles: Vec<String> = flow.books().iter().map(|b| b.title.clone()).collect();
    match selection {
        0 => {
            if let Some(index) = pick("Open which book?", &titles)? {
                let id = flow.books()[index].id;
                if let Err(e) = flow.select_book(id).await {
                    print_error(e);
                }
            }
        }
        1 => {
            let title: String = Input::new()
                .with_prompt("Book title")
                .allow_empty(true)
                .interact_text()?;
            match flow.create_book(&title).await {
                Ok(notice) => print_notice(&notice),
                Err(e) => print_error(e),
            }
        }
        2 => {
            if let Some(index) = pick("Delete which book?", &titles)? {
                let book = flow.books()[index].clone();
                let confirm = Confirm::new()
                    .with_prompt(format!("Delete book '{}'? Its chapters are kept.", book.title))
                    .default(false)
                    .interact()
                    .unwrap_or(false);
                if confirm {
                    print_notice(&flow.delete_book(book.id).await);
                } else {
                    println!("Cancelled.");
                }
            }
        }
        _ => return Ok(false),
    }
    Ok(true)
}

async fn chapters_menu(flow: &mut AuthoringFlow<DbHandle>, book_title: &str) -> Result<()> {
    println!();
    println!("{}", console::style(book_title).bold());
    if flow.chapters().is_empty() {
        println!("  {}", console::style("No chapters yet.").dim());
    }
    for chapter in flow.chapters() {
        println!("  [{}] {}", chapter.id, chapter.title);
    }
    println!();

    let options = &["Add a chapter", "Delete a chapter", "Back to books"];
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("What next?")
        .items(options)
        .default(0)
        .interact()?;

    match selection {
        0 => {
            let title: String = Input::new()
                .with_prompt("Chapter title")
                .allow_empty(true)
                .interact_text()?;
            let file: String = Input::new()
                .with_prompt("HTML file")
                .allow_empty(true)
                .interact_text()?;
            flow.set_chapter_title(title);
            if !file.trim().is_empty() {
                let path = PathBuf::from(file.trim());
                if let Err(e) = flow.load_chapter_file(&path).await {
                    print_error(format!("{:#}", e));
                    return Ok(());
                }
                if let Some(name) = &flow.form().file_name {
                    println!("Loaded {}", console::style(name).dim());
                }
            }
            match flow.create_chapter().await {
                Ok(notice) => print_notice(&notice),
                Err(e) => print_error(e),
            }
        }
        1 => {
            let titles: Vec<String> = flow.chapters().iter().map(|c| c.title.clone()).collect();
            if let Some(index) = pick("Delete which chapter?", &titles)? {
                let chapter = flow.chapters()[index].clone();
                let confirm = Confirm::new()
                    .with_prompt(format!("Delete chapter '{}'?", chapter.title))
                    .default(false)
                    .interact()
                    .unwrap_or(false);
                if confirm {
                    match flow.delete_chapter(chapter.id).await {
                        Ok(notice) => print_notice(&notice),
                        Err(e) => print_error(e),
                    }
                } else {
                    println!("Cancelled.");
                }
            }
        }
        _ => flow.back(),
    }
    Ok(())
}
