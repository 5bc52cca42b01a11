//! Per-connection websocket session.
//!
//! Each socket gets a fresh [`ConnectionId`], an outbound queue from the
//! hub, and a read loop that dispatches [`ClientEvent`]s into the engine.
//! A send that fails validation is answered with `sendFailed` on the same
//! connection; the socket stays open.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};

use parley_shared::{ClientEvent, ConnectionId, ServerEvent, UserId};

use crate::engine::ChatEngine;

pub async fn run_session(socket: WebSocket, engine: Arc<ChatEngine>) {
    let connection = ConnectionId::new();
    let mut events = engine.hub.attach(connection).await;
    let (mut sink, mut stream) = socket.split();

    tracing::debug!(%connection, "session opened");

    // Writer task: drain the hub queue into the socket.  Ends when the hub
    // detaches the connection or the socket goes away.
    let writer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let frame = match serde_json::to_string(&event) {
                Ok(json) => WsMessage::Text(json),
                Err(err) => {
                    tracing::error!(%err, "failed to encode server event");
                    continue;
                }
            };
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    // Read loop: runs on this task until the peer disconnects.
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) | Err(_) => break,
            // Pings are answered by axum; other frame types are ignored.
            Ok(_) => continue,
        };

        match serde_json::from_str::<ClientEvent>(&text) {
            Ok(event) => dispatch(&engine, connection, event).await,
            Err(err) => {
                tracing::warn!(%connection, %err, "unparseable client event");
            }
        }
    }

    engine.connection_closed(connection).await;
    writer.abort();
    tracing::debug!(%connection, "session closed");
}

/// True when the connection previously announced itself as `user`.
async fn announced_as(engine: &ChatEngine, connection: ConnectionId, user: UserId) -> bool {
    engine.presence.user_of(connection).await == Some(user)
}

/// Answer the connection with an explicit failure event; errors never pass
/// silently and never tear down the session.
async fn reject(engine: &ChatEngine, connection: ConnectionId, reason: &str) {
    engine
        .hub
        .send_to(
            connection,
            ServerEvent::SendFailed {
                reason: reason.to_string(),
            },
        )
        .await;
}

async fn dispatch(engine: &ChatEngine, connection: ConnectionId, event: ClientEvent) {
    match event {
        ClientEvent::PresenceHello { user_id } => {
            engine.presence_hello(user_id, connection).await;
        }
        ClientEvent::Subscribe { conversation_id } => {
            engine.hub.join(connection, conversation_id).await;
        }
        ClientEvent::Unsubscribe { conversation_id } => {
            engine.hub.leave(connection, conversation_id).await;
        }
        ClientEvent::Send {
            conversation_id,
            sender_id,
            body,
        } => {
            if !announced_as(engine, connection, sender_id).await {
                reject(engine, connection, "connection is not announced as the sender").await;
                return;
            }
            if let Err(err) = engine.send_message(conversation_id, sender_id, body).await {
                tracing::warn!(%connection, conversation = %conversation_id, %err, "send rejected");
                reject(engine, connection, &err.to_string()).await;
            }
        }
        ClientEvent::AckRead {
            message_id,
            conversation_id,
            reader_id,
        } => {
            if !announced_as(engine, connection, reader_id).await {
                reject(engine, connection, "connection is not announced as the reader").await;
                return;
            }
            if let Err(err) = engine.mark_read(message_id, conversation_id, reader_id).await {
                tracing::warn!(%connection, message = %message_id, %err, "read ack rejected");
                reject(engine, connection, &err.to_string()).await;
            }
        }
        ClientEvent::Typing {
            conversation_id,
            user_name,
        } => {
            engine
                .hub
                .broadcast_room_except(
                    conversation_id,
                    connection,
                    ServerEvent::PeerTyping {
                        conversation_id,
                        user_name,
                    },
                )
                .await;
        }
        ClientEvent::StopTyping {
            conversation_id,
            user_name,
        } => {
            engine
                .hub
                .broadcast_room_except(
                    conversation_id,
                    connection,
                    ServerEvent::PeerStopTyping {
                        conversation_id,
                        user_name,
                    },
                )
                .await;
        }
    }
}
