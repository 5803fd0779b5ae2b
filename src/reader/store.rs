//! Content store seam.
//!
//! Views and flows depend on [`ContentStore`] rather than on SQLite directly,
//! so they can be driven by test doubles. [`DbHandle`] is the production
//! implementation.

use anyhow::Result;
use async_trait::async_trait;

use super::db::DbHandle;
use super::models::*;

/// Abstraction over the book/chapter/user document store.
/// Real implementation: `DbHandle`. Test doubles live next to their tests.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// All books with their chapters nested in ascending order.
    async fn list_books(&self) -> Result<Vec<LibraryBook>>;

    async fn get_chapter(&self, id: i64) -> Result<Option<Chapter>>;

    async fn list_chapters_for_book(&self, book_id: i64) -> Result<Vec<Chapter>>;

    async fn create_book(&self, title: &str, order: i64) -> Result<Book>;

    /// Returns false if the book did not exist. Chapters are left in place.
    async fn delete_book(&self, id: i64) -> Result<bool>;

    async fn create_chapter(&self, chapter: NewChapter) -> Result<Chapter>;

    async fn update_chapter(&self, id: i64, update: ChapterUpdate) -> Result<Chapter>;

    async fn delete_chapter(&self, id: i64) -> Result<bool>;

    async fn upsert_user(&self, identity: &UserIdentity) -> Result<UserRecord>;

    async fn get_user_role(&self, uid: &str) -> Result<Role>;

    async fn set_user_role(&self, uid: &str, role: Role) -> Result<UserRecord>;
}

#[async_trait]
impl ContentStore for DbHandle {
    async fn list_books(&self) -> Result<Vec<LibraryBook>> {
        self.call(|db| db.list_library()).await
    }

    async fn get_chapter(&self, id: i64) -> Result<Option<Chapter>> {
        self.call(move |db| db.get_chapter(id)).await
    }

    async fn list_chapters_for_book(&self, book_id: i64) -> Result<Vec<Chapter>> {
        self.call(move |db| db.list_chapters_for_book(book_id)).await
    }

    async fn create_book(&self, title: &str, order: i64) -> Result<Book> {
        let title = title.to_string();
        self.call(move |db| db.create_book(&title, order)).await
    }

    async fn delete_book(&self, id: i64) -> Result<bool> {
        self.call(move |db| db.delete_book(id)).await
    }

    async fn create_chapter(&self, chapter: NewChapter) -> Result<Chapter> {
        self.call(move |db| db.create_chapter(&chapter)).await
    }

    async fn update_chapter(&self, id: i64, update: ChapterUpdate) -> Result<Chapter> {
        self.call(move |db| db.update_chapter(id, &update)).await
    }

    async fn delete_chapter(&self, id: i64) -> Result<bool> {
        self.call(move |db| db.delete_chapter(id)).await
    }

    async fn upsert_user(&self, identity: &UserIdentity) -> Result<UserRecord> {
        let identity = identity.clone();
        self.call(move |db| db.upsert_user(&identity)).await
    }

    async fn get_user_role(&self, uid: &str) -> Result<Role> {
        let uid = uid.to_string();
        self.call(move |db| db.get_user_role(&uid)).await
    }

    async fn set_user_role(&self, uid: &str, role: Role) -> Result<UserRecord> {
        let uid = uid.to_string();
        self.call(move |db| db.set_user_role(&uid, role)).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::db::LibraryDb;

    #[tokio::test]
    async fn test_db_handle_implements_store_round_trip() -> Result<()> {
        let store = DbHandle::new(LibraryDb::new_in_memory()?);

        let book = store.create_book("Guide", 1).await?;
        let chapter = store
            .create_chapter(NewChapter {
                book_id: book.id,
                title: "One".into(),
                content: Some("<p>1</p>".into()),
                order: 1,
            })
            .await?;

        let library = store.list_books().await?;
        assert_eq!(library.len(), 1);
        assert_eq!(library[0].children, vec![chapter.clone()]);

        let fetched = ContentStore::get_chapter(&store, chapter.id).await?;
        assert_eq!(fetched, Some(chapter));
        Ok(())
    }

    #[tokio::test]
    async fn test_set_user_role_through_store() -> Result<()> {
        let store = DbHandle::new(LibraryDb::new_in_memory()?);
        store.set_user_role("u", Role::Admin).await?;
        assert_eq!(store.get_user_role("u").await?, Role::Admin);
        Ok(())
    }
}
