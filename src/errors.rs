//! Typed error hierarchy for Pagewise.
//!
//! - `ValidationError`: blank or missing form input, caught before any store call
//! - `EngineError`: code execution engine initialization and run faults
//! - `ReaderError`: content store, authorization, and session failures

use thiserror::Error;

/// Local validation failures. Nothing is persisted when one of these is raised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Please enter a book title")]
    BlankBookTitle,

    #[error("Please enter a chapter title")]
    BlankChapterTitle,

    #[error("Please upload HTML content")]
    BlankChapterContent,

    #[error("No book selected")]
    NoBookSelected,
}

/// Failures from the code execution engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("Engine failed to initialize: {0}")]
    InitFailed(String),

    #[error("{0}")]
    Execution(String),

    #[error("Execution exceeded time limit ({secs}s)")]
    TimedOut { secs: u64 },
}

/// Errors from the reader subsystem (store, sessions, authorization).
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("Book {id} not found")]
    BookNotFound { id: i64 },

    #[error("Chapter {id} not found")]
    ChapterNotFound { id: i64 },

    #[error("Session {id} not found")]
    SessionNotFound { id: String },

    #[error("Admin role required")]
    NotAuthorized,

    #[error("Not signed in")]
    NotSignedIn,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
