//! Per-session navigation state machine.
//!
//! [`NavigationState`] is the single source of truth for what is selected and
//! visible. Every operation is one synchronous transition published through a
//! `watch` channel, so all subscribers observe each change as a whole
//! snapshot, never a half-applied one.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::models::ChapterRef;
use crate::errors::ReaderError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

impl Theme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Dark => "dark",
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            Self::Light => Self::Dark,
            Self::Dark => Self::Light,
        }
    }

    /// Class applied to the document root for this theme.
    pub fn root_class(&self) -> Option<&'static str> {
        match self {
            Self::Light => None,
            Self::Dark => Some("dark"),
        }
    }
}

impl FromStr for Theme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "light" => Ok(Self::Light),
            "dark" => Ok(Self::Dark),
            _ => Err(format!("Invalid theme: {}", s)),
        }
    }
}

/// Reading column width, derived from panel visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentWidth {
    Narrow,
    Medium,
    Wide,
}

impl ContentWidth {
    pub fn css_class(&self) -> &'static str {
        match self {
            Self::Narrow => "max-w-3xl",
            Self::Medium => "max-w-4xl",
            Self::Wide => "max-w-5xl",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationSnapshot {
    pub selected: Option<ChapterRef>,
    pub left_panel_visible: bool,
    pub right_panel_visible: bool,
    pub theme: Theme,
    pub authoring_modal_open: bool,
}

impl Default for NavigationSnapshot {
    fn default() -> Self {
        Self {
            selected: None,
            left_panel_visible: true,
            right_panel_visible: true,
            theme: Theme::Light,
            authoring_modal_open: false,
        }
    }
}

impl NavigationSnapshot {
    pub fn content_width(&self) -> ContentWidth {
        match (self.left_panel_visible, self.right_panel_visible) {
            (false, false) => ContentWidth::Wide,
            (true, true) => ContentWidth::Narrow,
            _ => ContentWidth::Medium,
        }
    }
}

pub struct NavigationState {
    tx: watch::Sender<NavigationSnapshot>,
}

impl Default for NavigationState {
    fn default() -> Self {
        Self::new()
    }
}

impl NavigationState {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(NavigationSnapshot::default());
        Self { tx }
    }

    /// Receive every transition as a complete snapshot.
    pub fn subscribe(&self) -> watch::Receiver<NavigationSnapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> NavigationSnapshot {
        self.tx.borrow().clone()
    }

    pub fn selected(&self) -> Option<ChapterRef> {
        self.tx.borrow().selected.clone()
    }

    pub fn theme(&self) -> Theme {
        self.tx.borrow().theme
    }

    pub fn toggle_left_panel(&self) -> bool {
        let mut visible = false;
        self.tx.send_modify(|s| {
            s.left_panel_visible = !s.left_panel_visible;
            visible = s.left_panel_visible;
        });
        visible
    }

    pub fn toggle_right_panel(&self) -> bool {
        let mut visible = false;
        self.tx.send_modify(|s| {
            s.right_panel_visible = !s.right_panel_visible;
            visible = s.right_panel_visible;
        });
        visible
    }

    /// Replace the current selection.
    pub fn select_chapter(&self, chapter: ChapterRef) {
        tracing::debug!(chapter_id = chapter.id, "select chapter");
        self.tx.send_modify(|s| s.selected = Some(chapter));
    }

    pub fn toggle_theme(&self) -> Theme {
        let mut theme = Theme::Light;
        self.tx.send_modify(|s| {
            s.theme = s.theme.toggled();
            theme = s.theme;
        });
        theme
    }

    pub fn set_theme(&self, theme: Theme) {
        self.tx.send_modify(|s| s.theme = theme);
    }

    /// Flip the authoring modal flag. Non-admins are rejected and the state
    /// is left untouched.
    pub fn toggle_authoring_modal(&self, is_admin: bool) -> Result<bool, ReaderError> {
        if !is_admin {
            return Err(ReaderError::NotAuthorized);
        }
        let mut open = false;
        self.tx.send_modify(|s| {
            s.authoring_modal_open = !s.authoring_modal_open;
            open = s.authoring_modal_open;
        });
        Ok(open)
    }

    /// Whether the authoring modal should render. Always false for non-admins,
    /// whatever the flag says.
    pub fn authoring_modal_visible(&self, is_admin: bool) -> bool {
        is_admin && self.tx.borrow().authoring_modal_open
    }

    pub fn content_width(&self) -> ContentWidth {
        self.tx.borrow().content_width()
    }
}
