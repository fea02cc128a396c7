use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use parley_types::events::{ClientCommand, ServerEvent};

use crate::error::GatewayError;
use crate::{ConnCtx, Coordinator};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a pre-authenticated WebSocket connection. The JWT was already
/// validated at the HTTP upgrade layer, so the identity is trusted for the
/// connection's whole lifetime.
pub async fn handle_connection_authenticated(
    socket: WebSocket,
    coordinator: Coordinator,
    user_id: Uuid,
    username: String,
) {
    let (mut sender, mut receiver) = socket.split();

    info!("{} ({}) connected to gateway", username, user_id);

    let ready = ServerEvent::Ready {
        user_id,
        username: username.clone(),
    };
    if sender
        .send(Message::Text(serde_json::to_string(&ready).unwrap().into()))
        .await
        .is_err()
    {
        return;
    }

    let handle = match coordinator.connect(user_id, &username).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!("Failed to register connection for {}: {}", username, e);
            return;
        }
    };
    let conn_id = handle.conn_id;
    let mut outbound = handle.outbound;

    // Replay who is already online so this client can render the roster
    for (uid, uname) in handle.roster {
        let event = ServerEvent::PresenceUpdate {
            user_id: uid,
            username: uname,
            online: true,
        };
        if sender
            .send(Message::Text(serde_json::to_string(&event).unwrap().into()))
            .await
            .is_err()
        {
            coordinator.disconnect(conn_id).await;
            return;
        }
    }

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Writer: drain the outbound queue to the socket, with heartbeat.
    // The queue's senders live in the presence registry; when the registry
    // drops them (unregister or forced disconnect) this task ends.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = outbound.recv() => {
                    let Some(event) = result else { break };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Reader: process commands strictly in arrival order for this connection
    let ctx = ConnCtx {
        conn_id,
        user_id,
        username: username.clone(),
    };
    let coordinator_recv = coordinator.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(cmd) => dispatch(&coordinator_recv, &ctx, cmd).await,
                    Err(e) => {
                        let preview: String = text.chars().take(200).collect();
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            ctx.username, ctx.user_id, e, preview
                        );
                        coordinator_recv
                            .presence()
                            .send_to_conn(
                                ctx.conn_id,
                                ServerEvent::Error {
                                    error: "Unrecognized command.".into(),
                                },
                            )
                            .await;
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    coordinator.disconnect(conn_id).await;
    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn dispatch(coordinator: &Coordinator, ctx: &ConnCtx, cmd: ClientCommand) {
    match cmd {
        ClientCommand::SendMessage {
            recipient,
            body,
            attachment_token,
            encrypted,
        } => {
            if let Err(e) = coordinator
                .send_direct(ctx, recipient, body, attachment_token, encrypted)
                .await
            {
                report(coordinator, ctx, ServerEvent::Error { error: e.to_string() }).await;
            }
        }

        ClientCommand::SendGroupMessage {
            group_id,
            body,
            attachment_token,
            encrypted,
        } => {
            if let Err(e) = coordinator
                .send_group(ctx, group_id, body, attachment_token, encrypted)
                .await
            {
                report(coordinator, ctx, ServerEvent::Error { error: e.to_string() }).await;
            }
        }

        ClientCommand::JoinGroupRoom { group_id } => {
            if let Err(e) = coordinator.join_group_room(ctx, group_id).await {
                report(coordinator, ctx, ServerEvent::Error { error: e.to_string() }).await;
            }
        }

        ClientCommand::CallRequest {
            target,
            offer,
            mode,
        } => {
            if let Err(e) = coordinator.call_request(ctx, target, offer, mode).await {
                report_call(coordinator, ctx, e).await;
            }
        }

        ClientCommand::CallAnswer {
            session_id,
            accepted,
            answer,
        } => {
            if let Err(e) = coordinator
                .call_answer(ctx, session_id, accepted, answer)
                .await
            {
                report_call(coordinator, ctx, e).await;
            }
        }

        ClientCommand::IceCandidate {
            session_id,
            candidate,
        } => {
            coordinator
                .relay_ice_candidate(ctx, session_id, candidate)
                .await;
        }

        ClientCommand::CallHangup { session_id } => {
            coordinator.call_hangup(ctx, session_id).await;
        }

        ClientCommand::CallTranscriptionChunk {
            call_id,
            audio_chunk,
            source_language,
        } => {
            if let Err(e) = coordinator
                .relay_transcription_chunk(ctx, call_id, audio_chunk, source_language)
                .await
            {
                report(
                    coordinator,
                    ctx,
                    ServerEvent::TranslationError {
                        session_id: call_id,
                        error: e.to_string(),
                    },
                )
                .await;
            }
        }

        ClientCommand::SetTranslationPreferences {
            call_id,
            enabled,
            target_language,
            source_language,
        } => {
            if let Err(e) = coordinator
                .set_translation_preferences(ctx, call_id, enabled, target_language, source_language)
                .await
            {
                report(
                    coordinator,
                    ctx,
                    ServerEvent::TranslationError {
                        session_id: call_id,
                        error: e.to_string(),
                    },
                )
                .await;
            }
        }
    }
}

/// Errors are scoped to the connection whose command caused them.
async fn report(coordinator: &Coordinator, ctx: &ConnCtx, event: ServerEvent) {
    coordinator.presence().send_to_conn(ctx.conn_id, event).await;
}

async fn report_call(coordinator: &Coordinator, ctx: &ConnCtx, error: GatewayError) {
    report(
        coordinator,
        ctx,
        ServerEvent::CallError {
            error: error.to_string(),
        },
    )
    .await;
}
