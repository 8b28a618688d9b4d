//! WebSocket transport between the robot client and the session.
//!
//! Inbound text frames are JSON envelopes `{"event": ..., "data": ...}`.
//! Camera frames are decoded and run through face detection here, then
//! offered to the coordinator. Everything the session decides is broadcast
//! to every connected client.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use kiosk_core::Command;
use kiosk_core::coordinator::CoordinatorHandle;
use kiosk_core::perception::FaceDetector;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

pub const CONNECTED_MESSAGE: &str = "Connected to server";

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("face_frame payload is malformed: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("face_frame image is empty")]
    Empty,
    #[error("face_frame image is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Events sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    SpokenResponse { text: String },
    ExecuteCommand { command: String },
    ServerResponse { message: String },
}

impl From<Command> for OutboundEvent {
    fn from(command: Command) -> Self {
        match command {
            Command::SpeakText(text) => OutboundEvent::SpokenResponse { text },
            Command::ExecuteCommand(command) => OutboundEvent::ExecuteCommand { command },
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct FaceFramePayload {
    img_base64: String,
}

/// Extracts the image bytes from a `face_frame` payload. A `data:` URL header
/// in front of the base64 text is accepted and skipped.
pub fn decode_frame(data: serde_json::Value) -> Result<Vec<u8>, FrameError> {
    let payload: FaceFramePayload = serde_json::from_value(data)?;
    let encoded = match payload.img_base64.split_once(',') {
        Some((header, body)) if header.starts_with("data:") => body,
        _ => payload.img_base64.as_str(),
    };
    let encoded = encoded.trim();
    if encoded.is_empty() {
        return Err(FrameError::Empty);
    }
    Ok(base64::engine::general_purpose::STANDARD.decode(encoded)?)
}

#[derive(Clone)]
pub struct AppState {
    pub detector: Arc<dyn FaceDetector>,
    pub coordinator: CoordinatorHandle,
    pub outbound: broadcast::Sender<OutboundEvent>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    info!("WebSocket upgrade request received");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    info!("Client connected");
    let (mut sender, mut receiver) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<OutboundEvent>(8);
    let mut outbound = state.outbound.subscribe();

    // Direct replies and broadcasts share one writer per connection.
    let writer = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                Some(event) = reply_rx.recv() => event,
                result = outbound.recv() => match result {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Client lagged, skipped {} events", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                else => break,
            };
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to serialize {:?}: {}", event, e);
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => handle_text(&state, text.as_str(), &reply_tx).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                info!("WebSocket error: {}", e);
                break;
            }
        }
    }

    writer.abort();
    info!("Client disconnected");
}

async fn handle_text(state: &AppState, text: &str, reply_tx: &mpsc::Sender<OutboundEvent>) {
    let envelope = match serde_json::from_str::<Envelope>(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::debug!("Ignoring unparseable message: {}", e);
            return;
        }
    };

    match envelope.event.as_str() {
        "face_frame" => handle_face_frame(state, envelope.data).await,
        "robot_status" => {
            info!("Robot status: {}", envelope.data);
            let reply = OutboundEvent::ServerResponse {
                message: CONNECTED_MESSAGE.to_string(),
            };
            if reply_tx.send(reply).await.is_err() {
                tracing::debug!("Connection closed before status reply");
            }
        }
        other => tracing::debug!("Ignoring unknown event {:?}", other),
    }
}

async fn handle_face_frame(state: &AppState, data: serde_json::Value) {
    // Detection is the expensive step; skip it while the session cannot
    // take the frame anyway.
    if state.coordinator.is_busy() {
        tracing::trace!("Session busy, dropping frame");
        return;
    }

    let image = match decode_frame(data) {
        Ok(image) => image,
        Err(e) => {
            tracing::warn!("Dropping frame: {}", e);
            return;
        }
    };

    match state.detector.detect(&image).await {
        Ok(embeddings) => {
            state.coordinator.submit_frame(embeddings);
        }
        Err(e) => tracing::warn!("Face detection failed: {:?}", e),
    }
}

/// Broadcasts every session command to the connected clients.
pub async fn forward_commands(
    mut command_rx: mpsc::Receiver<Command>,
    outbound: broadcast::Sender<OutboundEvent>,
) {
    while let Some(command) = command_rx.recv().await {
        match &command {
            Command::SpeakText(text) => info!("Bot: {}", text),
            Command::ExecuteCommand(command) => info!("Executing command: {}", command),
        }
        if outbound.send(OutboundEvent::from(command)).is_err() {
            tracing::debug!("No clients connected, event dropped");
        }
    }
}
