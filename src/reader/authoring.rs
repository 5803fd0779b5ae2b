//! Admin-only authoring flow over books and chapters.
//!
//! Two views with a one-level stack: the book list, and the chapter list of
//! one selected book. Mutations never touch local lists optimistically; lists
//! are re-read from the store after a successful call and left alone on
//! failure.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::watch;

use super::identity::AuthState;
use super::models::{Book, Chapter, NewChapter};
use super::store::ContentStore;
use crate::errors::{ReaderError, ValidationError};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "view", rename_all = "snake_case")]
pub enum AuthoringView {
    Books,
    Chapters { book: Book },
}

/// Pending chapter input for the selected book.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChapterForm {
    pub title: String,
    pub html_content: String,
    pub file_name: Option<String>,
}

/// Outcome message shown after a mutation completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum Notice {
    Success(String),
    Failure(String),
}

impl Notice {
    pub fn message(&self) -> &str {
        match self {
            Self::Success(m) | Self::Failure(m) => m,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

pub struct AuthoringFlow<S: ContentStore + ?Sized> {
    store: Arc<S>,
    view: AuthoringView,
    books: Vec<Book>,
    chapters: Vec<Chapter>,
    form: ChapterForm,
    busy: watch::Sender<bool>,
    last_order: i64,
}

impl<S: ContentStore + ?Sized> AuthoringFlow<S> {
    /// Open the flow for a signed-in admin and load the book list.
    pub async fn open(store: Arc<S>, auth: &AuthState) -> Result<Self, ReaderError> {
        if auth.identity.is_none() {
            return Err(ReaderError::NotSignedIn);
        }
        if !auth.is_admin() {
            return Err(ReaderError::NotAuthorized);
        }
        let (busy, _) = watch::channel(false);
        let mut flow = Self {
            store,
            view: AuthoringView::Books,
            books: Vec::new(),
            chapters: Vec::new(),
            form: ChapterForm::default(),
            busy,
            last_order: 0,
        };
        flow.refresh_books().await.map_err(ReaderError::Database)?;
        Ok(flow)
    }

    pub fn view(&self) -> &AuthoringView {
        &self.view
    }

    pub fn books(&self) -> &[Book] {
        &self.books
    }

    pub fn chapters(&self) -> &[Chapter] {
        &self.chapters
    }

    pub fn form(&self) -> &ChapterForm {
        &self.form
    }

    pub fn selected_book(&self) -> Option<&Book> {
        match &self.view {
            AuthoringView::Chapters { book } => Some(book),
            AuthoringView::Books => None,
        }
    }

    pub fn is_busy(&self) -> bool {
        *self.busy.borrow()
    }

    pub fn watch_busy(&self) -> watch::Receiver<bool> {
        self.busy.subscribe()
    }

    /// Epoch milliseconds, bumped when needed so that each value handed out
    /// by this flow is strictly greater than the last.
    fn next_order(&mut self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        self.last_order = now.max(self.last_order + 1);
        self.last_order
    }

    pub async fn refresh_books(&mut self) -> Result<()> {
        let library = self.store.list_books().await.context("Failed to load books")?;
        self.books = library.into_iter().map(|lb| lb.book).collect();
        Ok(())
    }

    async fn refresh_chapters(&mut self) -> Result<()> {
        let Some(book_id) = self.selected_book().map(|b| b.id) else {
            return Ok(());
        };
        self.chapters = self
            .store
            .list_chapters_for_book(book_id)
            .await
            .context("Failed to load chapters")?;
        Ok(())
    }

    async fn mutate<T, F>(&mut self, success: &str, failure: &str, op: F) -> Notice
    where
        F: std::future::Future<Output = Result<T>>,
    {
        self.busy.send_replace(true);
        let outcome = op.await;
        let notice = match outcome {
            Ok(_) => Notice::Success(success.to_string()),
            Err(e) => {
                tracing::warn!(error = %e, "{}", failure);
                Notice::Failure(failure.to_string())
            }
        };
        self.busy.send_replace(false);
        notice
    }

    pub async fn create_book(&mut self, title: &str) -> Result<Notice, ValidationError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ValidationError::BlankBookTitle);
        }
        let order = self.next_order();
        let store = Arc::clone(&self.store);
        let notice = self
            .mutate(
                "Book created successfully!",
                "Failed to create book",
                async move { store.create_book(title, order).await },
            )
            .await;
        if notice.is_success() {
            self.refresh_logged(true).await;
        }
        Ok(notice)
    }

    /// Delete a book. Its chapters are left in place.
    pub async fn delete_book(&mut self, id: i64) -> Notice {
        let store = Arc::clone(&self.store);
        let notice = self
            .mutate(
                "Book deleted successfully!",
                "Failed to delete book",
                async move { store.delete_book(id).await },
            )
            .await;
        if notice.is_success() {
            self.refresh_logged(true).await;
        }
        notice
    }

    /// Push the chapter view for a book from the current list.
    pub async fn select_book(&mut self, id: i64) -> Result<(), ReaderError> {
        let book = self
            .books
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or(ReaderError::BookNotFound { id })?;
        self.view = AuthoringView::Chapters { book };
        self.chapters.clear();
        self.form = ChapterForm::default();
        self.refresh_chapters().await.map_err(ReaderError::Database)
    }

    /// Pop back to the book list, discarding chapter input.
    pub fn back(&mut self) {
        self.view = AuthoringView::Books;
        self.chapters.clear();
        self.form = ChapterForm::default();
    }

    pub fn set_chapter_title(&mut self, title: impl Into<String>) {
        self.form.title = title.into();
    }

    /// Read chapter HTML from a local file into the form.
    pub async fn load_chapter_file(&mut self, path: &Path) -> Result<()> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        self.form.html_content = content;
        self.form.file_name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        Ok(())
    }

    /// Add a chapter to the selected book from the form contents.
    pub async fn create_chapter(&mut self) -> Result<Notice, ValidationError> {
        let title = self.form.title.clone();
        let content = self.form.html_content.clone();
        self.create_chapter_with(&title, &content).await
    }

    pub async fn create_chapter_with(
        &mut self,
        title: &str,
        content: &str,
    ) -> Result<Notice, ValidationError> {
        let book_id = self
            .selected_book()
            .map(|b| b.id)
            .ok_or(ValidationError::NoBookSelected)?;
        if title.trim().is_empty() {
            return Err(ValidationError::BlankChapterTitle);
        }
        if content.trim().is_empty() {
            return Err(ValidationError::BlankChapterContent);
        }

        let chapter = NewChapter {
            book_id,
            title: title.trim().to_string(),
            content: Some(content.to_string()),
            order: self.next_order(),
        };
        let store = Arc::clone(&self.store);
        let notice = self
            .mutate(
                "Chapter added successfully!",
                "Failed to add chapter",
                async move { store.create_chapter(chapter).await },
            )
            .await;
        if notice.is_success() {
            self.form = ChapterForm::default();
            self.refresh_logged(false).await;
        }
        Ok(notice)
    }

    pub async fn delete_chapter(&mut self, id: i64) -> Result<Notice, ValidationError> {
        if self.selected_book().is_none() {
            return Err(ValidationError::NoBookSelected);
        }
        let store = Arc::clone(&self.store);
        let notice = self
            .mutate(
                "Chapter deleted successfully!",
                "Failed to delete chapter",
                async move { store.delete_chapter(id).await },
            )
            .await;
        if notice.is_success() {
            self.refresh_logged(false).await;
        }
        Ok(notice)
    }

    async fn refresh_logged(&mut self, books: bool) {
        let result = if books {
            self.refresh_books().await
        } else {
            self.refresh_chapters().await
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "mutation succeeded but refresh failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::reader::models::{Role, UserIdentity};
    use crate::reader::store::testing::RecordingStore;

    fn admin() -> AuthState {
        AuthState {
            identity: Some(UserIdentity::new("admin-1")),
            role: Role::Admin,
        }
    }

    async fn open_flow() -> (Arc<RecordingStore>, AuthoringFlow<RecordingStore>) {
        let store = Arc::new(RecordingStore::new());
        let flow = AuthoringFlow::open(store.clone(), &admin()).await.unwrap();
        (store, flow)
    }

    #[tokio::test]
    async fn test_open_requires_admin() {
        let store = Arc::new(RecordingStore::new());
        let user = AuthState {
            identity: Some(UserIdentity::new("reader")),
            role: Role::User,
        };
        let err = AuthoringFlow::open(store.clone(), &user).await.err().unwrap();
        assert!(matches!(err, ReaderError::NotAuthorized));

        let err = AuthoringFlow::open(store.clone(), &AuthState::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ReaderError::NotSignedIn));
        assert_eq!(store.call_count(), 0);
    }

    #[tokio::test]
    async fn test_create_book_blank_title_rejected_locally() {
        let (store, mut flow) = open_flow().await;
        let calls = store.call_count();
        assert_eq!(
            flow.create_book("   ").await.unwrap_err(),
            ValidationError::BlankBookTitle
        );
        assert_eq!(store.call_count(), calls);
    }

    #[tokio::test]
    async fn test_create_book_refreshes_list() {
        let (_store, mut flow) = open_flow().await;
        let notice = flow.create_book("  Rust Basics ").await.unwrap();
        assert_eq!(notice, Notice::Success("Book created successfully!".into()));
        assert_eq!(flow.books().len(), 1);
        assert_eq!(flow.books()[0].title, "Rust Basics");
        assert!(!flow.is_busy());
    }

    #[tokio::test]
    async fn test_create_book_failure_leaves_list_untouched() {
        let (store, mut flow) = open_flow().await;
        flow.create_book("First").await.unwrap();
        store.set_failing(true);

        let notice = flow.create_book("Second").await.unwrap();
        assert_eq!(notice, Notice::Failure("Failed to create book".into()));
        assert_eq!(flow.books().len(), 1);
        assert!(!flow.is_busy());
    }

    #[tokio::test]
    async fn test_orders_strictly_increase() {
        let (_store, mut flow) = open_flow().await;
        for title in ["A", "B", "C"] {
            flow.create_book(title).await.unwrap();
        }
        let orders: Vec<i64> = flow.books().iter().map(|b| b.order).collect();
        assert!(orders.windows(2).all(|w| w[0] < w[1]), "{orders:?}");
        let titles: Vec<&str> = flow.books().iter().map(|b| b.title.as_str()).collect();
        assert_eq!(titles, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_busy_flag_raised_during_mutation() {
        let (_store, mut flow) = open_flow().await;
        let mut busy = flow.watch_busy();
        flow.create_book("Busy").await.unwrap();
        assert!(busy.has_changed().unwrap());
        assert!(!*busy.borrow_and_update());
    }

    #[tokio::test]
    async fn test_delete_book_keeps_its_chapters() {
        let (store, mut flow) = open_flow().await;
        flow.create_book("Doomed").await.unwrap();
        let book_id = flow.books()[0].id;
        flow.select_book(book_id).await.unwrap();
        flow.create_chapter_with("Orphan", "<p>still here</p>")
            .await
            .unwrap();
        let chapter_id = flow.chapters()[0].id;
        flow.back();

        let notice = flow.delete_book(book_id).await;
        assert_eq!(notice, Notice::Success("Book deleted successfully!".into()));
        assert!(flow.books().is_empty());

        let orphan = store.get_chapter(chapter_id).await.unwrap().unwrap();
        assert_eq!(orphan.content.as_deref(), Some("<p>still here</p>"));
    }

    #[tokio::test]
    async fn test_create_chapter_validation_makes_no_store_call() {
        let (store, mut flow) = open_flow().await;
        assert_eq!(
            flow.create_chapter_with("Title", "<p>x</p>").await.unwrap_err(),
            ValidationError::NoBookSelected
        );

        flow.create_book("Book").await.unwrap();
        let book_id = flow.books()[0].id;
        flow.select_book(book_id).await.unwrap();
        let calls = store.call_count();

        assert_eq!(
            flow.create_chapter_with("", "<p>x</p>").await.unwrap_err(),
            ValidationError::BlankChapterTitle
        );
        assert_eq!(
            flow.create_chapter_with("Title", "  \n ").await.unwrap_err(),
            ValidationError::BlankChapterContent
        );
        assert_eq!(store.call_count(), calls);
    }

    #[tokio::test]
    async fn test_chapter_from_file_then_reset_form() {
        let (_store, mut flow) = open_flow().await;
        flow.create_book("Book").await.unwrap();
        let book_id = flow.books()[0].id;
        flow.select_book(book_id).await.unwrap();

        let mut file = tempfile::Builder::new().suffix(".html").tempfile().unwrap();
        write!(file, "<h1>Loaded</h1>").unwrap();
        flow.load_chapter_file(file.path()).await.unwrap();
        flow.set_chapter_title("From file");
        assert_eq!(flow.form().html_content, "<h1>Loaded</h1>");
        assert!(flow.form().file_name.as_deref().unwrap().ends_with(".html"));

        let notice = flow.create_chapter().await.unwrap();
        assert_eq!(notice, Notice::Success("Chapter added successfully!".into()));
        assert_eq!(flow.chapters().len(), 1);
        assert_eq!(flow.chapters()[0].title, "From file");
        assert_eq!(flow.form(), &ChapterForm::default());
    }

    #[tokio::test]
    async fn test_create_chapter_failure_keeps_form() {
        let (store, mut flow) = open_flow().await;
        flow.create_book("Book").await.unwrap();
        let book_id = flow.books()[0].id;
        flow.select_book(book_id).await.unwrap();
        flow.set_chapter_title("Kept");
        store.set_failing(true);

        let notice = flow.create_chapter_with("Kept", "<p>x</p>").await.unwrap();
        assert_eq!(notice, Notice::Failure("Failed to add chapter".into()));
        assert_eq!(flow.form().title, "Kept");
        assert!(flow.chapters().is_empty());
    }

    #[tokio::test]
    async fn test_delete_chapter_refreshes_current_book() {
        let (_store, mut flow) = open_flow().await;
        flow.create_book("Book").await.unwrap();
        let book_id = flow.books()[0].id;
        flow.select_book(book_id).await.unwrap();
        flow.create_chapter_with("One", "<p>1</p>").await.unwrap();
        flow.create_chapter_with("Two", "<p>2</p>").await.unwrap();
        let first = flow.chapters()[0].id;

        let notice = flow.delete_chapter(first).await.unwrap();
        assert!(notice.is_success());
        assert_eq!(notice.message(), "Chapter deleted successfully!");
        let titles: Vec<&str> = flow.chapters().iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, vec!["Two"]);
    }

    #[tokio::test]
    async fn test_back_discards_chapter_input() {
        let (_store, mut flow) = open_flow().await;
        flow.create_book("Book").await.unwrap();
        let book_id = flow.books()[0].id;
        flow.select_book(book_id).await.unwrap();
        flow.set_chapter_title("Unsaved");

        flow.back();
        assert_eq!(flow.view(), &AuthoringView::Books);
        assert_eq!(flow.form(), &ChapterForm::default());
        assert!(flow.chapters().is_empty());
    }

    #[tokio::test]
    async fn test_select_unknown_book() {
        let (_store, mut flow) = open_flow().await;
        let err = flow.select_book(42).await.unwrap_err();
        assert!(matches!(err, ReaderError::BookNotFound { id: 42 }));
        assert_eq!(flow.view(), &AuthoringView::Books);
    }
}
