//! Pagewise reader: the library store, reader sessions, and the web front end.
//!
//! ## Overview
//!
//! Books and chapters live in SQLite. Each browser tab gets a reader
//! session holding its own navigation state, library outline, content
//! viewer, and code runner. Actions posted by the page are dispatched
//! against the session; the resulting state is broadcast over a WebSocket.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │ Browser  │ ───────> │  server.rs  (axum Router, build_state)           │
//! │  (page)  │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│         │                                        │
//!                       │         │ session::dispatch(action)              │
//!                       │         v                                        │
//!                       │  session.rs  (ReaderSession, SessionRegistry)    │
//!                       │    ├─ navigation.rs  (panels, theme, selection)  │
//!                       │    ├─ library.rs     (outline tree)              │
//!                       │    ├─ viewer.rs      (stale-safe content fetch)  │
//!                       │    └─ runner.rs      (code runner, run tickets)  │
//!                       │              │                                   │
//!                       │              v                                   │
//!                       │  engine.rs  (EngineCell, PythonEngine)           │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module      | Responsibility                                            |
//! |-------------|-----------------------------------------------------------|
//! | `models`    | Shared types: `Book`, `Chapter`, `LibraryBook`, `Role`    |
//! | `db`        | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)       |
//! | `store`     | `ContentStore` trait, implemented by `DbHandle`           |
//! | `identity`  | `IdentityProvider` trait, header identity, role lookup    |
//! | `authoring` | Admin-only book/chapter management flow                   |
//! | `render`    | Server-rendered page and placeholders                     |
//! | `ws`        | `WsMessage` enum + `broadcast_message()` helper           |
//!
//! ## Typical Request Flow (select a chapter)
//!
//! 1. `POST /api/sessions/{sid}/actions` with `{"action":"select_chapter"}`
//! 2. The session records the selection and the viewer takes a new
//!    generation ticket, showing inline content or a loading frame.
//! 3. Without inline content, the chapter is fetched from the store with the
//!    session lock released. The result is applied only if its ticket is
//!    still current.
//! 4. The handler broadcasts `NavigationChanged` and `ViewerUpdated`.

pub mod api;
pub mod authoring;
pub mod db;
pub mod engine;
pub mod identity;
pub mod library;
pub mod models;
pub mod navigation;
pub mod render;
pub mod runner;
pub mod server;
pub mod session;
pub mod store;
pub mod viewer;
pub mod ws;
