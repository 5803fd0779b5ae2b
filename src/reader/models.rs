use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Book {
    pub id: i64,
    pub title: String,
    pub order: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chapter {
    pub id: i64,
    pub book_id: i64,
    pub title: String,
    pub content: Option<String>,
    pub order: i64,
    pub created_at: String,
    pub updated_at: Option<String>,
}

impl Chapter {
    /// Inline content, treating whitespace-only HTML as absent.
    pub fn inline_content(&self) -> Option<&str> {
        self.content.as_deref().filter(|c| !c.trim().is_empty())
    }
}

/// A book together with its chapters, in the store's `order` sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LibraryBook {
    #[serde(flatten)]
    pub book: Book,
    pub children: Vec<Chapter>,
}

/// Fields for a chapter insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewChapter {
    pub book_id: i64,
    pub title: String,
    pub content: Option<String>,
    pub order: i64,
}

/// Partial chapter update; `None` leaves the stored value in place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChapterUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
    pub order: Option<i64>,
}

/// The chapter reference held as the current selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChapterRef {
    pub id: i64,
    pub title: String,
    pub content: Option<String>,
}

impl ChapterRef {
    /// A bare reference that always resolves through the store.
    pub fn by_id(id: i64, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            content: None,
        }
    }

    pub fn inline_content(&self) -> Option<&str> {
        self.content.as_deref().filter(|c| !c.trim().is_empty())
    }
}

impl From<&Chapter> for ChapterRef {
    fn from(chapter: &Chapter) -> Self {
        Self {
            id: chapter.id,
            title: chapter.title.clone(),
            content: chapter.content.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    #[default]
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "user" => Ok(Self::User),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

/// Identity as reported by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserIdentity {
    pub uid: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub photo_url: Option<String>,
}

impl UserIdentity {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            email: None,
            name: None,
            photo_url: None,
        }
    }

    /// Display name, falling back to the local part of the email address.
    pub fn display_name(&self) -> String {
        if let Some(name) = self.name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        match self.email.as_deref().and_then(|e| e.split('@').next()) {
            Some(local) if !local.is_empty() => local.to_string(),
            _ => self.uid.clone(),
        }
    }
}

/// Stored user document; the role survives profile refreshes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserRecord {
    pub uid: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub photo_url: Option<String>,
    pub role: Role,
    pub created_at: String,
    pub last_login: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trips_through_str() {
        assert_eq!(Role::from_str("admin").unwrap(), Role::Admin);
        assert_eq!(Role::from_str("user").unwrap(), Role::User);
        assert_eq!(Role::Admin.as_str(), "admin");
        assert!(Role::from_str("owner").is_err());
        assert_eq!(Role::default(), Role::User);
    }

    #[test]
    fn test_display_name_fallbacks() {
        let mut identity = UserIdentity::new("u-1");
        assert_eq!(identity.display_name(), "u-1");

        identity.email = Some("ada@example.com".into());
        assert_eq!(identity.display_name(), "ada");

        identity.name = Some("Ada Lovelace".into());
        assert_eq!(identity.display_name(), "Ada Lovelace");
    }

    #[test]
    fn test_blank_inline_content_counts_as_absent() {
        let chapter_ref = ChapterRef {
            id: 1,
            title: "Intro".into(),
            content: Some("   \n".into()),
        };
        assert!(chapter_ref.inline_content().is_none());
        assert!(ChapterRef::by_id(2, "x").inline_content().is_none());
    }

    #[test]
    fn test_library_book_flattens_book_fields() {
        let lb = LibraryBook {
            book: Book {
                id: 3,
                title: "Rust".into(),
                order: 10,
                created_at: "2024-01-01".into(),
            },
            children: vec![],
        };
        let json = serde_json::to_value(&lb).unwrap();
        assert_eq!(json["id"], 3);
        assert_eq!(json["title"], "Rust");
        assert!(json["children"].as_array().unwrap().is_empty());
    }
}
