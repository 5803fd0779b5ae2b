use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::*;

/// Async-safe handle to the library database.
///
/// Wraps `LibraryDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<LibraryDb>>,
}

impl DbHandle {
    pub fn new(db: LibraryDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&LibraryDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for CLI commands,
    /// startup initialization, and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, LibraryDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct LibraryDb {
    conn: Connection,
}

const BOOK_COLUMNS: &str = "id, title, sort_order, created_at";
const CHAPTER_COLUMNS: &str = "id, book_id, title, content, sort_order, created_at, updated_at";
const USER_COLUMNS: &str = "uid, email, name, photo_url, role, created_at, last_login";

fn book_from_row(row: &Row<'_>) -> rusqlite::Result<Book> {
    Ok(Book {
        id: row.get(0)?,
        title: row.get(1)?,
        order: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn chapter_from_row(row: &Row<'_>) -> rusqlite::Result<Chapter> {
    Ok(Chapter {
        id: row.get(0)?,
        book_id: row.get(1)?,
        title: row.get(2)?,
        content: row.get(3)?,
        order: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

struct UserRow {
    uid: String,
    email: Option<String>,
    name: Option<String>,
    photo_url: Option<String>,
    role: String,
    created_at: String,
    last_login: Option<String>,
}

impl UserRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            uid: row.get(0)?,
            email: row.get(1)?,
            name: row.get(2)?,
            photo_url: row.get(3)?,
            role: row.get(4)?,
            created_at: row.get(5)?,
            last_login: row.get(6)?,
        })
    }

    fn into_record(self) -> UserRecord {
        // Unknown role strings fall back to the least-privileged role.
        let role = Role::from_str(&self.role).unwrap_or_default();
        UserRecord {
            uid: self.uid,
            email: self.email,
            name: self.name,
            photo_url: self.photo_url,
            role,
            created_at: self.created_at,
            last_login: self.last_login,
        }
    }
}

impl LibraryDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.run_migrations().context("Failed to run migrations")?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.run_migrations().context("Failed to run migrations")?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        // chapters.book_id deliberately has no foreign key: deleting a book
        // leaves its chapters in place.
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS books (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    title TEXT NOT NULL,
                    sort_order INTEGER NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS chapters (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    book_id INTEGER NOT NULL,
                    title TEXT NOT NULL,
                    content TEXT,
                    sort_order INTEGER NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT
                );

                CREATE TABLE IF NOT EXISTS users (
                    uid TEXT PRIMARY KEY,
                    email TEXT,
                    name TEXT,
                    photo_url TEXT,
                    role TEXT NOT NULL DEFAULT 'user',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    last_login TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_books_order ON books(sort_order);
                CREATE INDEX IF NOT EXISTS idx_chapters_book ON chapters(book_id, sort_order);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Book CRUD ─────────────────────────────────────────────────────

    pub fn create_book(&self, title: &str, order: i64) -> Result<Book> {
        self.conn
            .execute(
                "INSERT INTO books (title, sort_order) VALUES (?1, ?2)",
                params![title, order],
            )
            .context("Failed to insert book")?;
        let id = self.conn.last_insert_rowid();
        self.get_book(id)?.context("Book not found after insert")
    }

    pub fn get_book(&self, id: i64) -> Result<Option<Book>> {
        self.conn
            .query_row(
                &format!("SELECT {BOOK_COLUMNS} FROM books WHERE id = ?1"),
                params![id],
                book_from_row,
            )
            .optional()
            .context("Failed to query book")
    }

    pub fn list_books(&self) -> Result<Vec<Book>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {BOOK_COLUMNS} FROM books ORDER BY sort_order, id"
            ))
            .context("Failed to prepare list_books")?;
        let rows = stmt
            .query_map([], book_from_row)
            .context("Failed to query books")?;
        let mut books = Vec::new();
        for row in rows {
            books.push(row.context("Failed to read book row")?);
        }
        Ok(books)
    }

    /// Every book with its chapters nested in ascending `order`.
    pub fn list_library(&self) -> Result<Vec<LibraryBook>> {
        let books = self.list_books()?;
        let mut library = Vec::with_capacity(books.len());
        for book in books {
            let children = self.list_chapters_for_book(book.id)?;
            library.push(LibraryBook { book, children });
        }
        Ok(library)
    }

    /// Delete a book. Returns false if no such book existed.
    pub fn delete_book(&self, id: i64) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM books WHERE id = ?1", params![id])
            .context("Failed to delete book")?;
        Ok(affected > 0)
    }

    // ── Chapter CRUD ──────────────────────────────────────────────────

    pub fn create_chapter(&self, chapter: &NewChapter) -> Result<Chapter> {
        self.conn
            .execute(
                "INSERT INTO chapters (book_id, title, content, sort_order) VALUES (?1, ?2, ?3, ?4)",
                params![
                    chapter.book_id,
                    chapter.title,
                    chapter.content,
                    chapter.order
                ],
            )
            .context("Failed to insert chapter")?;
        let id = self.conn.last_insert_rowid();
        self.get_chapter(id)?
            .context("Chapter not found after insert")
    }

    pub fn get_chapter(&self, id: i64) -> Result<Option<Chapter>> {
        self.conn
            .query_row(
                &format!("SELECT {CHAPTER_COLUMNS} FROM chapters WHERE id = ?1"),
                params![id],
                chapter_from_row,
            )
            .optional()
            .context("Failed to query chapter")
    }

    pub fn list_chapters_for_book(&self, book_id: i64) -> Result<Vec<Chapter>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {CHAPTER_COLUMNS} FROM chapters WHERE book_id = ?1 ORDER BY sort_order, id"
            ))
            .context("Failed to prepare list_chapters_for_book")?;
        let rows = stmt
            .query_map(params![book_id], chapter_from_row)
            .context("Failed to query chapters")?;
        let mut chapters = Vec::new();
        for row in rows {
            chapters.push(row.context("Failed to read chapter row")?);
        }
        Ok(chapters)
    }

    pub fn update_chapter(&self, id: i64, update: &ChapterUpdate) -> Result<Chapter> {
        let affected = self
            .conn
            .execute(
                "UPDATE chapters SET
                    title = COALESCE(?1, title),
                    content = COALESCE(?2, content),
                    sort_order = COALESCE(?3, sort_order),
                    updated_at = datetime('now')
                 WHERE id = ?4",
                params![update.title, update.content, update.order, id],
            )
            .context("Failed to update chapter")?;
        if affected == 0 {
            anyhow::bail!("Chapter {} not found", id);
        }
        self.get_chapter(id)?
            .context("Chapter not found after update")
    }

    /// Delete a chapter. Returns false if no such chapter existed.
    pub fn delete_chapter(&self, id: i64) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM chapters WHERE id = ?1", params![id])
            .context("Failed to delete chapter")?;
        Ok(affected > 0)
    }

    // ── Users ─────────────────────────────────────────────────────────

    /// Create the user with the default role, or refresh the profile fields
    /// and `last_login` of an existing user while preserving their role.
    pub fn upsert_user(&self, identity: &UserIdentity) -> Result<UserRecord> {
        self.conn
            .execute(
                "INSERT INTO users (uid, email, name, photo_url, role) VALUES (?1, ?2, ?3, ?4, 'user')
                 ON CONFLICT(uid) DO UPDATE SET
                    email = excluded.email,
                    name = excluded.name,
                    photo_url = excluded.photo_url,
                    last_login = datetime('now')",
                params![
                    identity.uid,
                    identity.email,
                    identity.name,
                    identity.photo_url
                ],
            )
            .context("Failed to upsert user")?;
        self.get_user(&identity.uid)?
            .context("User not found after upsert")
    }

    pub fn get_user(&self, uid: &str) -> Result<Option<UserRecord>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE uid = ?1"),
                params![uid],
                UserRow::from_row,
            )
            .optional()
            .context("Failed to query user")?;
        Ok(row.map(UserRow::into_record))
    }

    /// Role for a user id; unknown users are plain users.
    pub fn get_user_role(&self, uid: &str) -> Result<Role> {
        Ok(self.get_user(uid)?.map(|u| u.role).unwrap_or_default())
    }

    /// Set a user's role, creating a bare user record if none exists yet.
    pub fn set_user_role(&self, uid: &str, role: Role) -> Result<UserRecord> {
        self.conn
            .execute(
                "INSERT INTO users (uid, role) VALUES (?1, ?2)
                 ON CONFLICT(uid) DO UPDATE SET role = excluded.role",
                params![uid, role.as_str()],
            )
            .context("Failed to set user role")?;
        self.get_user(uid)?
            .context("User not found after role update")
    }
}
