use crate::snapshot::Frame;
use crate::stream::{SessionManager, SubscriberId};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header::ORIGIN, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Router};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct WsState {
    pub sessions: Arc<SessionManager>,
    pub next_id: Arc<AtomicU64>,
    pub allowed_origins: Arc<Vec<String>>,
}

pub fn router(namespace: &str, state: WsState) -> Router {
    Router::new()
        .route(namespace, get(upgrade_handler))
        .with_state(state)
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<WsState>,
) -> Response {
    if !origin_allowed(&state.allowed_origins, headers.get(ORIGIN)) {
        warn!(origin = ?headers.get(ORIGIN), "подключение отклонено: origin не разрешён");
        return (StatusCode::FORBIDDEN, "origin не разрешён").into_response();
    }

    let id = SubscriberId(state.next_id.fetch_add(1, Ordering::Relaxed));
    let sessions = state.sessions.clone();
    ws.on_upgrade(move |socket| serve_subscriber(socket, id, sessions))
}

pub fn origin_allowed(allowed: &[String], origin: Option<&HeaderValue>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let Some(origin) = origin.and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let origin = origin.trim_end_matches('/');
    allowed
        .iter()
        .any(|a| a == "*" || a.trim_end_matches('/').eq_ignore_ascii_case(origin))
}

async fn serve_subscriber(socket: WebSocket, id: SubscriberId, sessions: Arc<SessionManager>) {
    let (outbox, mut frames) = mpsc::unbounded_channel::<Frame>();
    if sessions.on_attach(id, outbox).await.is_err() {
        return;
    }

    let (mut sink, mut incoming) = socket.split();
    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                if let Err(err) = sink.send(Message::Text(frame.text.to_string())).await {
                    debug!(subscriber = %id, error = %err, "ошибка отправки в сокет");
                    break;
                }
            }
            msg = incoming.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(subscriber = %id, error = %err, "ошибка чтения из сокета");
                    break;
                }
            }
        }
    }

    drop(frames);
    sessions.on_detach(id).await;
    let _ = sink.close().await;
}
