//! Content viewer: turns the current selection into displayable HTML.
//!
//! Resolution order:
//! 1. No selection → welcome frame, no fetch.
//! 2. Selection carries inline content → use it, no fetch.
//! 3. Otherwise fetch the chapter record by id.
//! 4. Fetched record has content → use it.
//! 5. Fetched record has no content (or is gone) → "no content yet" frame.
//! 6. Fetch failed → error frame.
//!
//! Every selection bumps a generation counter. A fetch carries the generation
//! it was started under, and a completion whose ticket is no longer current is
//! dropped, so a slow fetch for an old selection can never overwrite a newer
//! one regardless of completion order.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::models::{Chapter, ChapterRef};
use super::render;
use super::store::ContentStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ViewerFrame {
    Welcome,
    Loading { chapter_id: i64, title: String },
    Content { chapter_id: i64, html: String },
    NoContent { chapter_id: i64, title: String },
    LoadFailed { chapter_id: i64 },
}

impl ViewerFrame {
    pub fn chapter_id(&self) -> Option<i64> {
        match self {
            Self::Welcome => None,
            Self::Loading { chapter_id, .. }
            | Self::Content { chapter_id, .. }
            | Self::NoContent { chapter_id, .. }
            | Self::LoadFailed { chapter_id } => Some(*chapter_id),
        }
    }

    pub fn to_html(&self) -> String {
        match self {
            Self::Welcome => render::welcome_placeholder(),
            Self::Loading { .. } => render::loading_placeholder(),
            Self::Content { html, .. } => html.clone(),
            Self::NoContent { title, .. } => render::no_content_placeholder(title),
            Self::LoadFailed { .. } => render::load_failed_placeholder(),
        }
    }
}

/// A fetch started by [`ContentViewer::begin`], to be handed back to
/// [`ContentViewer::complete`] with its outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingFetch {
    pub ticket: u64,
    pub chapter: ChapterRef,
}

impl PendingFetch {
    pub async fn fetch<S: ContentStore + ?Sized>(&self, store: &S) -> Result<Option<Chapter>> {
        store.get_chapter(self.chapter.id).await
    }
}

#[derive(Debug)]
pub struct ContentViewer {
    generation: u64,
    frame: ViewerFrame,
}

impl Default for ContentViewer {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentViewer {
    pub fn new() -> Self {
        Self {
            generation: 0,
            frame: ViewerFrame::Welcome,
        }
    }

    pub fn frame(&self) -> &ViewerFrame {
        &self.frame
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Start resolving a new selection. Steps 1 and 2 finish immediately;
    /// otherwise the viewer shows a loading frame and the caller must run the
    /// returned fetch and pass it to [`complete`](Self::complete).
    pub fn begin(&mut self, selection: Option<&ChapterRef>) -> Option<PendingFetch> {
        self.generation += 1;
        let Some(chapter) = selection else {
            self.frame = ViewerFrame::Welcome;
            return None;
        };
        if let Some(html) = chapter.inline_content() {
            self.frame = ViewerFrame::Content {
                chapter_id: chapter.id,
                html: html.to_string(),
            };
            return None;
        }
        self.frame = ViewerFrame::Loading {
            chapter_id: chapter.id,
            title: chapter.title.clone(),
        };
        Some(PendingFetch {
            ticket: self.generation,
            chapter: chapter.clone(),
        })
    }

    /// Apply a finished fetch. Returns false, leaving the frame untouched, when
    /// a newer selection has started since the fetch began.
    pub fn complete(&mut self, pending: PendingFetch, outcome: Result<Option<Chapter>>) -> bool {
        if pending.ticket != self.generation {
            tracing::debug!(
                chapter_id = pending.chapter.id,
                ticket = pending.ticket,
                current = self.generation,
                "discarding stale chapter fetch"
            );
            return false;
        }
        let chapter_id = pending.chapter.id;
        self.frame = match outcome {
            Ok(Some(chapter)) => match chapter.inline_content() {
                Some(html) => ViewerFrame::Content {
                    chapter_id,
                    html: html.to_string(),
                },
                None => ViewerFrame::NoContent {
                    chapter_id,
                    title: pending.chapter.title,
                },
            },
            Ok(None) => ViewerFrame::NoContent {
                chapter_id,
                title: pending.chapter.title,
            },
            Err(e) => {
                tracing::warn!(chapter_id, error = %e, "failed to fetch chapter");
                ViewerFrame::LoadFailed { chapter_id }
            }
        };
        true
    }

    /// Begin, fetch, and complete in one call, for callers that own the
    /// viewer exclusively for the duration.
    pub async fn resolve<S: ContentStore + ?Sized>(
        &mut self,
        store: &S,
        selection: Option<&ChapterRef>,
    ) -> &ViewerFrame {
        if let Some(pending) = self.begin(selection) {
            let outcome = pending.fetch(store).await;
            self.complete(pending, outcome);
        }
        &self.frame
    }
}
