use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::{
    auth::{AuthConfig, AuthError, Credentials},
    hub::{Hub, Origin, Subscriber},
    protocol::{
        is_valid_room_id, ClientMessage, ClientRequest, ConnectionId, ControlRequest, DocumentId,
        ProtocolError, RoomAction, ServerMessage,
    },
    ratelimit::RateLimiter,
};

const LIMITER_IDLE: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub auth: Arc<AuthConfig>,
    pub rate_limiter: Arc<RateLimiter>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/status", get(status))
        .route("/ws", get(ws_connect))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(listen_addr: &str, state: AppState) -> Result<()> {
    let hub = state.hub.clone();
    let limiter = state.rate_limiter.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(LIMITER_IDLE);
        loop {
            ticker.tick().await;
            limiter.cleanup(LIMITER_IDLE);
        }
    });

    let app = router(state);
    info!(addr = %listen_addr, "supersync-server listening");
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    hub.save_all().await?;
    info!("documents saved, shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "failed to listen for shutdown signal");
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusPayload {
    loaded_rooms: Vec<String>,
    password_required: bool,
    /// Store key to the error its latest save failed with
    save_errors: BTreeMap<String, String>,
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusPayload {
        loaded_rooms: state.hub.loaded_rooms().await,
        password_required: state.auth.password.is_some(),
        save_errors: state.hub.save_errors(),
    })
}

async fn ws_connect(
    Query(credentials): Query<Credentials>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, AuthError> {
    let username = state.auth.authenticate(&credentials).inspect_err(|err| {
        warn!(username = %credentials.username, %err, "rejected connection");
    })?;

    Ok(ws.on_upgrade(move |socket| async move {
        if let Err(err) = handle_ws(socket, username, state).await {
            warn!(?err, "websocket session ended with error");
        }
    }))
}

#[derive(Debug, Error)]
enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Document(#[from] supersync_core::Error),
}

/// What to send back once a request has been handled.
enum Reply {
    Now(Option<Value>),
    /// Already queued by the hub, in apply order
    Sent,
}

struct Session {
    id: ConnectionId,
    username: String,
    state: AppState,
    out: mpsc::UnboundedSender<ServerMessage>,
    subscriptions: HashSet<DocumentId>,
}

impl Session {
    fn send(&self, message: ServerMessage) {
        // The receiver lives as long as the socket loop
        let _ = self.out.send(message);
    }

    fn subscriber(&self) -> Subscriber {
        Subscriber::new(self.id, self.out.clone())
    }

    async fn handle_text(&mut self, text: &str) {
        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(conn = %self.id, %err, "ignoring malformed payload");
                self.send(ServerMessage::err(0, ProtocolError::Malformed));
                return;
            }
        };

        let request_id = message.request_id;
        let document = message.document.clone();
        match self.dispatch(message).await {
            Ok(Reply::Now(result)) => self.send(ServerMessage::ok(request_id, result)),
            Ok(Reply::Sent) => {}
            Err(err) => {
                match &err {
                    SessionError::Document(doc) if !doc.is_recoverable() => {
                        error!(conn = %self.id, %document, %err, "document failure")
                    }
                    _ => warn!(conn = %self.id, user = %self.username, %document, %err, "request rejected"),
                }
                self.send(ServerMessage::err(request_id, err));
            }
        }
    }

    async fn dispatch(&mut self, message: ClientMessage) -> Result<Reply, SessionError> {
        let request = ClientRequest::parse(message.request)?;
        if request.is_mutation() {
            self.state
                .rate_limiter
                .check(&self.username)
                .map_err(|retry| ProtocolError::RateLimited {
                    retry_after_ms: u64::try_from(retry.as_millis()).unwrap_or(u64::MAX),
                })?;
        }
        let origin = Origin::new(self.subscriber(), message.request_id);

        match (message.document, request) {
            (document, ClientRequest::Control(ControlRequest::Subscribe)) => {
                self.subscribe(document, message.request_id).await?;
                Ok(Reply::Sent)
            }
            (document, ClientRequest::Control(ControlRequest::Unsubscribe)) => {
                self.unsubscribe(&document).await?;
                Ok(Reply::Now(None))
            }
            (DocumentId::Manifest, ClientRequest::Manifest(request)) => {
                self.require_subscription(&DocumentId::Manifest)?;
                self.state.hub.manifest_request(&origin, request).await?;
                Ok(Reply::Sent)
            }
            (DocumentId::Entries, ClientRequest::Tree(request)) => {
                self.require_subscription(&DocumentId::Entries)?;
                self.state.hub.entries_request(&origin, request).await?;
                Ok(Reply::Sent)
            }
            (DocumentId::Room(id), ClientRequest::Room(RoomAction::AppendMessage { text })) => {
                self.require_subscription(&DocumentId::Room(id.clone()))?;
                self.state
                    .hub
                    .append_message(&id, &origin, &self.username, &text)
                    .await?;
                Ok(Reply::Sent)
            }
            (document, _) => Err(ProtocolError::Unsupported(document).into()),
        }
    }

    fn require_subscription(&self, document: &DocumentId) -> Result<(), ProtocolError> {
        if self.subscriptions.contains(document) {
            Ok(())
        } else {
            Err(ProtocolError::NotSubscribed(document.clone()))
        }
    }

    async fn subscribe(&mut self, document: DocumentId, request_id: u64) -> Result<(), SessionError> {
        if self.subscriptions.contains(&document) {
            return Err(ProtocolError::AlreadySubscribed(document).into());
        }

        let hub = &self.state.hub;
        match &document {
            DocumentId::Manifest => hub.subscribe_manifest(self.subscriber(), request_id).await,
            DocumentId::Entries => hub.subscribe_entries(self.subscriber(), request_id).await,
            DocumentId::Room(id) => {
                if !is_valid_room_id(id) {
                    return Err(ProtocolError::InvalidRoomId(id.clone()).into());
                }
                hub.join_room(id, self.subscriber(), request_id, &self.username)
                    .await?
            }
        }
        debug!(conn = %self.id, %document, "subscribed");
        self.subscriptions.insert(document);
        Ok(())
    }

    async fn unsubscribe(&mut self, document: &DocumentId) -> Result<(), SessionError> {
        if !self.subscriptions.remove(document) {
            return Err(ProtocolError::NotSubscribed(document.clone()).into());
        }

        let hub = &self.state.hub;
        match document {
            DocumentId::Manifest => {
                hub.unsubscribe_manifest(self.id).await;
            }
            DocumentId::Entries => {
                hub.unsubscribe_entries(self.id).await;
            }
            DocumentId::Room(id) => hub.leave_room(id, self.id, &self.username).await?,
        }
        debug!(conn = %self.id, %document, "unsubscribed");
        Ok(())
    }

    async fn close(&mut self) {
        let documents: Vec<DocumentId> = self.subscriptions.iter().cloned().collect();
        for document in documents {
            if let Err(err) = self.unsubscribe(&document).await {
                warn!(conn = %self.id, %document, %err, "cleanup failed");
            }
        }
    }
}

async fn handle_ws(mut socket: WebSocket, username: String, state: AppState) -> Result<()> {
    let (out, mut outbound) = mpsc::unbounded_channel();
    let mut session = Session {
        id: ConnectionId::new(),
        username,
        state,
        out,
        subscriptions: HashSet::new(),
    };
    info!(conn = %session.id, user = %session.username, "client connected");

    session.send(ServerMessage::Welcome {
        connection_id: session.id,
        username: session.username.clone(),
    });

    let result: Result<()> = loop {
        tokio::select! {
            // Responses and broadcasts, in the order they were queued
            Some(message) = outbound.recv() => {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(err) => break Err(err.into()),
                };
                if socket.send(WsMessage::Text(text.into())).await.is_err() {
                    break Ok(());
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => session.handle_text(text.as_str()).await,
                    Some(Ok(WsMessage::Close(_))) | None => break Ok(()),
                    Some(Err(err)) => break Err(err.into()),
                    _ => {}
                }
            }
        }
    };

    session.close().await;
    info!(conn = %session.id, user = %session.username, "client disconnected");
    result
}
