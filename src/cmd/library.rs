//! Library outline command (`pagewise library`).

use std::path::Path;

use anyhow::Result;
use pagewise::config::PagewiseConfig;
use pagewise::reader::store::ContentStore;

pub async fn cmd_library(project_dir: &Path, config: &PagewiseConfig) -> Result<()> {
    let store = super::open_store(project_dir, config)?;
    let library = store.list_books().await?;

    println!();
    println!("{}", console::style("Library").bold().cyan());
    println!();

    if library.is_empty() {
        println!("No books yet.");
        println!();
        println!("Run 'pagewise author --as <uid>' to add one.");
        println!();
        return Ok(());
    }

    for entry in &library {
        println!("{} {}", console::style(format!("[{}]", entry.book.id)).dim(), entry.book.title);
        for chapter in &entry.children {
            let marker = if chapter.inline_content().is_some() {
                ""
            } else {
                " (no content)"
            };
            println!(
                "    {} {}{}",
                console::style(format!("[{}]", chapter.id)).dim(),
                chapter.title,
                console::style(marker).yellow()
            );
        }
    }
    println!();
    println!("{} book(s)", library.len());
    Ok(())
}
