use std::path::Path;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::{net::TcpListener, sync::mpsc};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    app_state::AppState,
    playback::PlaybackIntent,
    protocol::{ClientMessage, ServerMessage},
    room::{short, RoomDirectory},
};

pub fn router(state: AppState, static_dir: impl AsRef<Path>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/ice", get(ice_servers))
        .fallback_service(ServeDir::new(static_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(listener: TcpListener, app: Router) -> std::io::Result<()> {
    axum::serve(listener, app).await
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "rooms": state.directory.room_count().await,
        "connections": state.directory.connection_count().await,
    }))
}

async fn ice_servers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.ice)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4().to_string();

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    if let Err(err) = state.directory.register(&client_id, tx.clone()).await {
        warn!(client = %short(&client_id), error = %err, "rejecting connection");
        return;
    }
    let _ = tx.send(ServerMessage::Welcome {
        id: client_id.clone(),
    });
    // the directory owns the outbox from here on; dropping it ends the writer
    drop(tx);
    info!(client = %short(&client_id), "client connected");

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "could not encode server message");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let directory = state.directory.clone();
    let id = client_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(frame)) = receiver.next().await {
            match frame {
                Message::Text(text) => dispatch(&directory, &id, &text).await,
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.directory.disconnect(&client_id).await;
    info!(client = %short(&client_id), "client disconnected");
}

async fn dispatch(directory: &RoomDirectory, client_id: &str, text: &str) {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(err) => {
            warn!(client = %short(client_id), error = %err, "malformed client message");
            directory
                .notify_error(client_id, format!("malformed message: {err}"))
                .await;
            return;
        }
    };

    match msg {
        ClientMessage::JoinRoom {
            room_id,
            display_name,
        } => {
            if room_id.trim().is_empty() {
                directory.notify_error(client_id, "room id must not be empty").await;
                return;
            }
            directory
                .join(client_id, &room_id, display_name.as_deref())
                .await;
        }
        ClientMessage::LeaveRoom { room_id } => {
            directory.leave(client_id, &room_id).await;
        }
        ClientMessage::Signal(envelope) => {
            debug!(from = %short(client_id), to = %short(&envelope.to), kind = ?envelope.kind, "relaying signal");
            directory.relay(client_id, envelope).await;
        }
        ClientMessage::VideoPlay { room_id } => {
            playback(directory, client_id, &room_id, PlaybackIntent::Play).await
        }
        ClientMessage::VideoPause { room_id } => {
            playback(directory, client_id, &room_id, PlaybackIntent::Pause).await
        }
        ClientMessage::VideoSeek { time, room_id } => {
            playback(directory, client_id, &room_id, PlaybackIntent::Seek { time }).await
        }
    }
}

async fn playback(directory: &RoomDirectory, client_id: &str, room_id: &str, intent: PlaybackIntent) {
    if !directory.broadcast_playback(client_id, room_id, intent).await {
        directory
            .notify_error(client_id, format!("not a member of room {room_id}"))
            .await;
    }
}
