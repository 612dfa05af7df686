//! Live push channel: one task forwards broadcast events to the client,
//! a second drains incoming frames (close/ping) until either ends.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Serialize;
use tracing::info;

use super::AppState;
use crate::manager::WorkoutEvent;
use crate::source::SourceEvent;

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum LiveEvent {
    Workout(WorkoutEvent),
    Source(SourceEvent),
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let mut workout_rx = state.manager.subscribe_events();
    let mut source_rx = state.source.subscribe_events();

    info!("live websocket client connected");

    let mut send_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = workout_rx.recv() => match event {
                    Ok(event) => LiveEvent::Workout(event),
                    Err(_) => break,
                },
                event = source_rx.recv() => match event {
                    Ok(event) => LiveEvent::Source(event),
                    Err(_) => break,
                },
            };
            let Ok(msg) = serde_json::to_string(&event) else { continue };
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    info!("live websocket client disconnected");
}
