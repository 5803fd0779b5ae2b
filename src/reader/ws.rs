use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

use super::api::{ApiError, AppState};
use super::models::{Book, Chapter};
use super::navigation::NavigationSnapshot;
use super::runner::{RunEvent, RunListener};
use super::viewer::ViewerFrame;
use crate::errors::ReaderError;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    // Library content
    BookCreated {
        book: Book,
    },
    BookDeleted {
        book_id: i64,
    },
    ChapterCreated {
        chapter: Chapter,
    },
    ChapterUpdated {
        chapter: Chapter,
    },
    ChapterDeleted {
        chapter_id: i64,
    },

    // Per-session view state, sent on the session's own channel
    NavigationChanged {
        session_id: Uuid,
        navigation: NavigationSnapshot,
    },
    ViewerUpdated {
        session_id: Uuid,
        frame: ViewerFrame,
    },

    // Code runner
    SandboxStarted {
        session_id: Uuid,
        ticket: u64,
    },
    SandboxOutput {
        session_id: Uuid,
        ticket: u64,
        line: String,
    },
    SandboxFinished {
        session_id: Uuid,
        ticket: u64,
        failed: bool,
    },
    SandboxCleared {
        session_id: Uuid,
    },
}

impl WsMessage {
    pub fn from_run_event(session_id: Uuid, event: RunEvent) -> Self {
        match event {
            RunEvent::Started { ticket } => Self::SandboxStarted { session_id, ticket },
            RunEvent::Output { ticket, line } => Self::SandboxOutput {
                session_id,
                ticket,
                line,
            },
            RunEvent::Finished { ticket, failed } => Self::SandboxFinished {
                session_id,
                ticket,
                failed,
            },
            RunEvent::Cleared => Self::SandboxCleared { session_id },
        }
    }
}

/// Runner listener that forwards a session's run events to that session's
/// channel.
pub fn run_listener(tx: broadcast::Sender<String>, session_id: Uuid) -> RunListener {
    Arc::new(move |event: RunEvent| broadcast_message(&tx, &WsMessage::from_run_event(session_id, event)))
}

// ── WebSocket handler ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct WsParams {
    /// Also receive this session's navigation, viewer and sandbox events.
    pub session: Option<Uuid>,
}

/// Every client gets library content events. Per-session events only go to
/// clients that name the session.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<WsParams>,
) -> Result<impl IntoResponse, ApiError> {
    let session_rx = match params.session {
        Some(sid) => {
            let handle = state
                .sessions
                .get(&sid)
                .ok_or_else(|| ReaderError::SessionNotFound { id: sid.to_string() })?;
            Some(handle.events.subscribe())
        }
        None => None,
    };
    let rx = state.ws_tx.subscribe();
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, rx, session_rx)))
}

async fn handle_socket(
    socket: WebSocket,
    rx: broadcast::Receiver<String>,
    session_rx: Option<broadcast::Receiver<String>>,
) {
    let (sender, receiver) = socket.split();
    tracing::debug!(session = session_rx.is_some(), "websocket client connected");
    run_socket_loop(sender, receiver, rx, session_rx).await;
    tracing::debug!("websocket client disconnected");
}

/// Receive from the session channel, or never when there is none.
async fn recv_session(
    rx: &mut Option<broadcast::Receiver<String>>,
) -> Result<String, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Send one received broadcast to the client. Returns `false` when the loop
/// should stop.
async fn forward(
    sender: &mut SplitSink<WebSocket, Message>,
    result: Result<String, broadcast::error::RecvError>,
) -> bool {
    match result {
        Ok(msg) => sender.send(Message::Text(msg.into())).await.is_ok(),
        Err(broadcast::error::RecvError::Closed) => false,
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            tracing::warn!(skipped, "websocket client lagging, messages dropped");
            true
        }
    }
}

/// Forward broadcasts to one client, with ping/pong keepalive. The loop
/// exits when the client closes, errors, or misses a pong for longer than
/// [`PONG_TIMEOUT`], or when its session goes away.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
    mut session_rx: Option<broadcast::Receiver<String>>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // First tick is immediate
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!("websocket pong timeout");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                if !forward(&mut sender, result).await {
                    break;
                }
            }

            result = recv_session(&mut session_rx) => {
                if !forward(&mut sender, result).await {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

// ── Broadcast helper ─────────────────────────────────────────────────

/// Serialize and broadcast a WsMessage to every subscriber of `tx`.
/// Returns silently even if no clients are connected.
pub fn broadcast_message(tx: &broadcast::Sender<String>, msg: &WsMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize WsMessage");
        }
    }
}
