//! Reader sessions: one navigation state, outline, viewer, and code runner
//! per browser session, mutated only through [`ReaderAction`]s.
//!
//! Transitions run to completion under the session's async mutex. Store
//! fetches and engine runs happen outside it and re-enter through the
//! ticket-checked `complete`/`drive` paths.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::engine::{EngineCell, EngineStatus};
use super::identity::{AuthState, resolve_identity};
use super::library::{LibraryTree, NodeId, OutlineNode};
use super::models::{ChapterRef, LibraryBook, Role, UserIdentity};
use super::navigation::{ContentWidth, NavigationSnapshot, NavigationState, Theme};
use super::render::{self, PageView};
use super::runner::{CodeRunState, CodeRunner};
use super::store::ContentStore;
use super::viewer::{ContentViewer, PendingFetch, ViewerFrame};
use crate::errors::ReaderError;

pub type SharedSession = Arc<tokio::sync::Mutex<ReaderSession>>;

/// Named operations on a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReaderAction {
    ToggleLeftPanel,
    ToggleRightPanel,
    ToggleTheme,
    SetTheme { theme: Theme },
    SelectChapter { chapter_id: i64 },
    ClickNode { node: NodeId },
    ToggleAuthoring,
    ReloadLibrary,
    SetSource { source: String },
    Run { source: Option<String> },
    ClearOutput,
}

impl ReaderAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ToggleLeftPanel => "toggle_left_panel",
            Self::ToggleRightPanel => "toggle_right_panel",
            Self::ToggleTheme => "toggle_theme",
            Self::SetTheme { .. } => "set_theme",
            Self::SelectChapter { .. } => "select_chapter",
            Self::ClickNode { .. } => "click_node",
            Self::ToggleAuthoring => "toggle_authoring",
            Self::ReloadLibrary => "reload_library",
            Self::SetSource { .. } => "set_source",
            Self::Run { .. } => "run",
            Self::ClearOutput => "clear_output",
        }
    }
}

/// Full session view, as returned by the API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub navigation: NavigationSnapshot,
    pub content_width: ContentWidth,
    pub authoring_modal_visible: bool,
    pub outline: Vec<OutlineNode>,
    pub viewer: ViewerFrame,
    pub run: CodeRunState,
    pub engine: EngineStatus,
    pub user: Option<UserIdentity>,
    pub role: Role,
    pub is_admin: bool,
}

pub struct ReaderSession {
    pub id: Uuid,
    pub navigation: NavigationState,
    pub tree: LibraryTree,
    pub viewer: ContentViewer,
    pub runner: CodeRunner,
    pub auth: AuthState,
}

impl ReaderSession {
    pub fn new(id: Uuid, library: &[LibraryBook], runner: CodeRunner) -> Self {
        Self {
            id,
            navigation: NavigationState::new(),
            tree: LibraryTree::new(library),
            viewer: ContentViewer::new(),
            runner,
            auth: AuthState::default(),
        }
    }

    pub fn snapshot(&self, engine: EngineStatus) -> SessionSnapshot {
        let navigation = self.navigation.snapshot();
        let is_admin = self.auth.is_admin();
        SessionSnapshot {
            id: self.id,
            content_width: navigation.content_width(),
            authoring_modal_visible: self.navigation.authoring_modal_visible(is_admin),
            navigation,
            outline: self.tree.roots().to_vec(),
            viewer: self.viewer.frame().clone(),
            run: self.runner.state(),
            engine,
            user: self.auth.identity.clone(),
            role: self.auth.role,
            is_admin,
        }
    }

    pub fn render_page(&self, engine: &EngineStatus) -> String {
        let navigation = self.navigation.snapshot();
        let selected = navigation.selected.as_ref().map(|c| c.id);
        let outline_html = self.tree.render_html(selected);
        let content_html = self.viewer.frame().to_html();
        let run = self.runner.state();
        let session_id = self.id.to_string();
        render::render_page(&PageView {
            session_id: &session_id,
            navigation: &navigation,
            outline_html: &outline_html,
            content_html: &content_html,
            run: &run,
            engine,
            user: self.auth.identity.as_ref(),
            is_admin: self.auth.is_admin(),
        })
    }

    /// Select a chapter and restart content resolution. Chapters known to
    /// the outline carry their summary; unknown ids resolve through the store.
    fn select(&mut self, chapter: ChapterRef) -> Option<PendingFetch> {
        self.navigation.select_chapter(chapter);
        let selected = self.navigation.selected();
        self.viewer.begin(selected.as_ref())
    }
}

/// What a dispatched action left running in the background.
#[derive(Debug, Default)]
pub struct Dispatched {
    pub run: Option<JoinHandle<()>>,
}

/// Apply one action to a session.
pub async fn dispatch<S>(
    session: &SharedSession,
    store: &S,
    engines: &EngineCell,
    action: ReaderAction,
) -> Result<Dispatched, ReaderError>
where
    S: ContentStore + ?Sized,
{
    tracing::debug!(action = action.name(), "dispatch");
    let mut dispatched = Dispatched::default();

    let pending_fetch = {
        let mut s = session.lock().await;
        match action {
            ReaderAction::ToggleLeftPanel => {
                s.navigation.toggle_left_panel();
                None
            }
            ReaderAction::ToggleRightPanel => {
                s.navigation.toggle_right_panel();
                None
            }
            ReaderAction::ToggleTheme => {
                s.navigation.toggle_theme();
                None
            }
            ReaderAction::SetTheme { theme } => {
                s.navigation.set_theme(theme);
                None
            }
            ReaderAction::SelectChapter { chapter_id } => {
                let chapter = s
                    .tree
                    .chapter_ref(chapter_id)
                    .unwrap_or_else(|| ChapterRef::by_id(chapter_id, format!("Chapter {}", chapter_id)));
                s.select(chapter)
            }
            ReaderAction::ClickNode { node } => {
                let outcome = s.tree.click(node).ok_or_else(|| match node {
                    NodeId::Book(id) => ReaderError::BookNotFound { id },
                    NodeId::Chapter(id) => ReaderError::ChapterNotFound { id },
                })?;
                match outcome.select {
                    Some(chapter) => s.select(chapter),
                    None => None,
                }
            }
            ReaderAction::ToggleAuthoring => {
                let is_admin = s.auth.is_admin();
                s.navigation.toggle_authoring_modal(is_admin)?;
                None
            }
            ReaderAction::ReloadLibrary => {
                drop(s);
                let library = store.list_books().await.map_err(ReaderError::Database)?;
                session.lock().await.tree = LibraryTree::new(&library);
                None
            }
            ReaderAction::SetSource { source } => {
                s.runner.set_source(source);
                None
            }
            ReaderAction::Run { source } => {
                if s.auth.identity.is_none() {
                    tracing::warn!(session_id = %s.id, "rejected code run from anonymous reader");
                    return Err(ReaderError::NotSignedIn);
                }
                if let Some(pending) = s.runner.begin_run(engines.engine(), source) {
                    let runner = s.runner.clone();
                    dispatched.run = Some(tokio::spawn(async move { runner.drive(pending).await }));
                }
                None
            }
            ReaderAction::ClearOutput => {
                s.runner.clear();
                None
            }
        }
    };

    if let Some(pending) = pending_fetch {
        let outcome = pending.fetch(store).await;
        session.lock().await.viewer.complete(pending, outcome);
    }
    Ok(dispatched)
}

/// Bring the session's auth state in line with the forwarded identity.
/// The role is only re-resolved when the signed-in user changes.
pub async fn sync_identity<S>(session: &SharedSession, store: &S, identity: Option<UserIdentity>)
where
    S: ContentStore + ?Sized,
{
    {
        let s = session.lock().await;
        let current = s.auth.uid();
        let incoming = identity.as_ref().map(|i| i.uid.as_str());
        if current == incoming {
            return;
        }
    }
    let auth = resolve_identity(store, identity).await;
    session.lock().await.auth = auth;
}

/// Capacity of each session's event channel.
pub const SESSION_EVENT_CAPACITY: usize = 64;

/// How often the reaper looks for idle sessions, at most.
const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// A live session plus the channel its own view and run events go out on.
/// Only subscribers that know the session id receive them.
#[derive(Clone)]
pub struct SessionHandle {
    pub session: SharedSession,
    pub events: broadcast::Sender<String>,
}

struct SessionEntry {
    handle: SessionHandle,
    touched: Instant,
}

/// All live sessions, keyed by id. Lookups refresh a session's idle clock.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<Uuid, SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, session: ReaderSession, events: broadcast::Sender<String>) -> SessionHandle {
        let id = session.id;
        let handle = SessionHandle {
            session: Arc::new(tokio::sync::Mutex::new(session)),
            events,
        };
        self.lock().insert(
            id,
            SessionEntry {
                handle: handle.clone(),
                touched: Instant::now(),
            },
        );
        handle
    }

    pub fn get(&self, id: &Uuid) -> Option<SessionHandle> {
        let mut sessions = self.lock();
        let entry = sessions.get_mut(id)?;
        entry.touched = Instant::now();
        Some(entry.handle.clone())
    }

    pub fn remove(&self, id: &Uuid) -> bool {
        self.lock().remove(id).is_some()
    }

    /// Drop every session not looked up within `max_idle`. Returns how many
    /// were dropped.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, entry| entry.touched.elapsed() < max_idle);
        before - sessions.len()
    }

    /// Evict idle sessions periodically until the returned task is aborted.
    pub fn spawn_reaper(&self, max_idle: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        let period = max_idle.min(REAP_INTERVAL).max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let evicted = registry.evict_idle(max_idle);
                if evicted > 0 {
                    tracing::info!(evicted, remaining = registry.len(), "evicted idle reader sessions");
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::engine::testing::CountingLoader;
    use crate::reader::models::NewChapter;
    use crate::reader::store::testing::RecordingStore;

    async fn seeded_store() -> RecordingStore {
        let store = RecordingStore::new();
        let book = store.create_book("Guide", 1).await.unwrap();
        store
            .create_chapter(NewChapter {
                book_id: book.id,
                title: "Inline".into(),
                content: Some("<p>inline</p>".into()),
                order: 1,
            })
            .await
            .unwrap();
        store
            .create_chapter(NewChapter {
                book_id: book.id,
                title: "Draft".into(),
                content: None,
                order: 2,
            })
            .await
            .unwrap();
        store
    }

    async fn new_session(store: &RecordingStore) -> SharedSession {
        let library = store.list_books().await.unwrap();
        let registry = SessionRegistry::new();
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        registry
            .insert(ReaderSession::new(Uuid::new_v4(), &library, CodeRunner::new()), events)
            .session
    }

    fn blank_session(registry: &SessionRegistry) -> Uuid {
        let id = Uuid::new_v4();
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        registry.insert(ReaderSession::new(id, &[], CodeRunner::new()), events);
        id
    }

    #[tokio::test]
    async fn test_panel_and_theme_actions() {
        let store = seeded_store().await;
        let session = new_session(&store).await;
        let engines = EngineCell::disabled();

        for action in [
            ReaderAction::ToggleLeftPanel,
            ReaderAction::ToggleTheme,
            ReaderAction::SetTheme { theme: Theme::Dark },
        ] {
            dispatch(&session, &store, &engines, action).await.unwrap();
        }
        let snap = session.lock().await.snapshot(engines.status());
        assert!(!snap.navigation.left_panel_visible);
        assert_eq!(snap.navigation.theme, Theme::Dark);
        assert_eq!(snap.content_width, ContentWidth::Medium);
        assert_eq!(snap.engine, EngineStatus::Disabled);
    }

    #[tokio::test]
    async fn test_select_known_chapter_uses_inline_content() {
        let store = seeded_store().await;
        let session = new_session(&store).await;
        let engines = EngineCell::disabled();
        let chapter_id = session.lock().await.tree.roots()[0].children[0].id;
        let NodeId::Chapter(chapter_id) = chapter_id else {
            panic!("expected chapter node");
        };

        let calls = store.call_count();
        dispatch(&session, &store, &engines, ReaderAction::SelectChapter { chapter_id })
            .await
            .unwrap();
        assert_eq!(store.call_count(), calls);
        assert_eq!(session.lock().await.viewer.frame().to_html(), "<p>inline</p>");
    }

    #[tokio::test]
    async fn test_click_draft_chapter_fetches_and_shows_placeholder() {
        let store = seeded_store().await;
        let session = new_session(&store).await;
        let engines = EngineCell::disabled();
        let (book, draft) = {
            let s = session.lock().await;
            let book = s.tree.roots()[0].id;
            (book, s.tree.roots()[0].children[1].id)
        };

        dispatch(&session, &store, &engines, ReaderAction::ClickNode { node: book })
            .await
            .unwrap();
        dispatch(&session, &store, &engines, ReaderAction::ClickNode { node: draft })
            .await
            .unwrap();

        let s = session.lock().await;
        assert!(s.tree.is_expanded(book));
        assert_eq!(s.navigation.selected().unwrap().title, "Draft");
        assert!(matches!(s.viewer.frame(), ViewerFrame::NoContent { .. }));
    }

    #[tokio::test]
    async fn test_select_unknown_id_resolves_through_store() {
        let store = seeded_store().await;
        let session = new_session(&store).await;
        let engines = EngineCell::disabled();
        let created = store
            .create_chapter(NewChapter {
                book_id: 99,
                title: "Late".into(),
                content: Some("<p>late</p>".into()),
                order: 3,
            })
            .await
            .unwrap();

        dispatch(
            &session,
            &store,
            &engines,
            ReaderAction::SelectChapter {
                chapter_id: created.id,
            },
        )
        .await
        .unwrap();
        assert_eq!(session.lock().await.viewer.frame().to_html(), "<p>late</p>");
    }

    #[tokio::test]
    async fn test_click_unknown_node_is_an_error() {
        let store = seeded_store().await;
        let session = new_session(&store).await;
        let err = dispatch(
            &session,
            &store,
            &EngineCell::disabled(),
            ReaderAction::ClickNode {
                node: NodeId::Chapter(404),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ReaderError::ChapterNotFound { id: 404 }));
    }

    #[tokio::test]
    async fn test_toggle_authoring_requires_admin() {
        let store = seeded_store().await;
        let session = new_session(&store).await;
        let engines = EngineCell::disabled();

        let err = dispatch(&session, &store, &engines, ReaderAction::ToggleAuthoring)
            .await
            .unwrap_err();
        assert!(matches!(err, ReaderError::NotAuthorized));

        store.set_user_role("ed", Role::Admin).await.unwrap();
        sync_identity(&session, &store, Some(UserIdentity::new("ed"))).await;
        dispatch(&session, &store, &engines, ReaderAction::ToggleAuthoring)
            .await
            .unwrap();
        let snap = session.lock().await.snapshot(engines.status());
        assert!(snap.is_admin);
        assert!(snap.authoring_modal_visible);
    }

    #[tokio::test]
    async fn test_sync_identity_resolves_once_per_user() {
        let store = seeded_store().await;
        let session = new_session(&store).await;

        sync_identity(&session, &store, Some(UserIdentity::new("u1"))).await;
        let calls = store.call_count();
        sync_identity(&session, &store, Some(UserIdentity::new("u1"))).await;
        assert_eq!(store.call_count(), calls);

        sync_identity(&session, &store, None).await;
        assert!(session.lock().await.auth.identity.is_none());
    }

    #[tokio::test]
    async fn test_anonymous_run_is_rejected() {
        let store = seeded_store().await;
        let session = new_session(&store).await;
        let engines = EngineCell::new(Arc::new(CountingLoader::new(false)));
        engines.initialize().await.unwrap();

        let err = dispatch(
            &session,
            &store,
            &engines,
            ReaderAction::Run {
                source: Some("print(1)".into()),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ReaderError::NotSignedIn));
        let run = session.lock().await.runner.state();
        assert!(!run.busy);
        assert!(run.output_lines.is_empty());
    }

    #[tokio::test]
    async fn test_run_without_engine_is_noop() {
        let store = seeded_store().await;
        let session = new_session(&store).await;
        sync_identity(&session, &store, Some(UserIdentity::new("reader"))).await;
        let dispatched = dispatch(
            &session,
            &store,
            &EngineCell::disabled(),
            ReaderAction::Run {
                source: Some("print(1)".into()),
            },
        )
        .await
        .unwrap();
        assert!(dispatched.run.is_none());
        assert!(session.lock().await.runner.state().output_lines.is_empty());
    }

    #[tokio::test]
    async fn test_run_with_loaded_engine() {
        let store = seeded_store().await;
        let session = new_session(&store).await;
        let engines = EngineCell::new(Arc::new(CountingLoader::new(false)));
        engines.initialize().await.unwrap();
        sync_identity(&session, &store, Some(UserIdentity::new("reader"))).await;

        let dispatched = dispatch(&session, &store, &engines, ReaderAction::Run { source: None })
            .await
            .unwrap();
        dispatched.run.unwrap().await.unwrap();

        let run = session.lock().await.runner.state();
        assert_eq!(run.output_lines, vec!["ok"]);
        assert!(!run.busy);

        dispatch(&session, &store, &engines, ReaderAction::ClearOutput)
            .await
            .unwrap();
        assert!(session.lock().await.runner.state().output_lines.is_empty());
    }

    #[tokio::test]
    async fn test_reload_library_rebuilds_outline() {
        let store = seeded_store().await;
        let session = new_session(&store).await;
        store.create_book("Appendix", 2).await.unwrap();

        dispatch(&session, &store, &EngineCell::disabled(), ReaderAction::ReloadLibrary)
            .await
            .unwrap();
        let titles: Vec<String> = session
            .lock()
            .await
            .tree
            .roots()
            .iter()
            .map(|n| n.title.clone())
            .collect();
        assert_eq!(titles, vec!["Guide", "Appendix"]);
    }

    #[tokio::test]
    async fn test_render_page_reflects_theme() {
        let store = seeded_store().await;
        let session = new_session(&store).await;
        let engines = EngineCell::disabled();
        dispatch(&session, &store, &engines, ReaderAction::ToggleTheme)
            .await
            .unwrap();
        let html = session.lock().await.render_page(&engines.status());
        assert!(html.contains("<body class=\"dark\""));
        assert!(html.contains("Guide"));
    }

    #[test]
    fn test_action_deserialization() {
        let action: ReaderAction = serde_json::from_str(
            r#"{"action": "click_node", "node": {"kind": "book", "id": 3}}"#,
        )
        .unwrap();
        assert_eq!(action, ReaderAction::ClickNode { node: NodeId::Book(3) });

        let action: ReaderAction = serde_json::from_str(r#"{"action": "run"}"#).unwrap();
        assert_eq!(action, ReaderAction::Run { source: None });
        assert_eq!(action.name(), "run");
    }

    #[test]
    fn test_registry() {
        let registry = SessionRegistry::new();
        let id = blank_session(&registry);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&id).is_some());
        assert!(registry.remove(&id));
        assert!(registry.get(&id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_evict_idle_keeps_recently_used_sessions() {
        let registry = SessionRegistry::new();
        let stale = blank_session(&registry);
        let fresh = blank_session(&registry);
        std::thread::sleep(Duration::from_millis(60));
        assert!(registry.get(&fresh).is_some());

        assert_eq!(registry.evict_idle(Duration::from_millis(30)), 1);
        assert!(registry.get(&stale).is_none());
        assert!(registry.get(&fresh).is_some());
        assert_eq!(registry.evict_idle(Duration::from_secs(60)), 0);
    }

    #[tokio::test]
    async fn test_reaper_bounds_abandoned_sessions() {
        let registry = SessionRegistry::new();
        for _ in 0..50 {
            blank_session(&registry);
        }
        assert_eq!(registry.len(), 50);

        let reaper = registry.spawn_reaper(Duration::from_millis(20));
        tokio::time::timeout(Duration::from_secs(5), async {
            while !registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        reaper.abort();
    }
}
