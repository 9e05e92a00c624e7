use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use parley_types::events::{ErrorReason, GatewayCommand, GatewayEvent};
use parley_types::models::Identity;

use crate::auth::TokenVerifier;
use crate::dispatcher::Dispatcher;
use crate::error::GatewayError;
use crate::registry::ConnectionId;
use crate::relay::OutboundMessage;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// The client must identify within this window after the upgrade.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

type WsSender = SplitSink<WebSocket, Message>;
type WsReceiver = SplitStream<WebSocket>;

/// A chat send waiting for this connection's send worker.
struct PendingSend {
    draft: OutboundMessage,
    nonce: Option<String>,
}

/// Handle a single WebSocket connection: Identify handshake, then the event loop.
pub async fn handle_connection(socket: WebSocket, dispatcher: Dispatcher, verifier: TokenVerifier) {
    let (mut sender, mut receiver) = socket.split();

    // Step 1: Wait for Identify command with JWT
    let identity = match wait_for_identify(&mut receiver, &verifier).await {
        Ok(identity) => identity,
        Err(e) => {
            warn!("WebSocket client failed to identify: {}", e);
            let _ = send_event(&mut sender, &e.to_event()).await;
            let _ = sender.close().await;
            return;
        }
    };

    info!("{} ({}) connected to gateway", identity.user_id, identity.role);

    // Step 2: Send Ready event
    let ready = GatewayEvent::Ready {
        user_id: identity.user_id.clone(),
        role: identity.role,
    };
    if send_event(&mut sender, &ready).await.is_err() {
        return;
    }

    run_connection_loop(sender, receiver, dispatcher, identity).await;
}

async fn run_connection_loop(
    mut sender: WsSender,
    mut receiver: WsReceiver,
    dispatcher: Dispatcher,
    identity: Identity,
) {
    let (conn_id, mut events_rx) = dispatcher.connect(identity.clone()).await;

    // Sends run on their own task so a slow store never stalls the socket,
    // and a send that has started finishes even if the socket goes away.
    let cancel = CancellationToken::new();
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_send_worker(
        dispatcher.clone(),
        conn_id,
        outbox_rx,
        cancel.clone(),
    ));

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward targeted events -> client, with heartbeat
    let send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    if send_event(&mut sender, &event).await.is_err() {
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
                    if sender.send(Message::Ping(Default::default())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let dispatcher_recv = dispatcher.clone();
    let identity_recv = identity.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(text.as_str()) {
                    Ok(cmd) => {
                        handle_command(&dispatcher_recv, conn_id, &identity_recv, cmd, &outbox_tx)
                            .await;
                    }
                    Err(e) => {
                        warn!(
                            "{} bad command: {} -- raw: {}",
                            identity_recv.user_id,
                            e,
                            truncate(text.as_str(), 200)
                        );
                        dispatcher_recv
                            .send_to(
                                conn_id,
                                GatewayEvent::error(ErrorReason::InvalidMessage, e.to_string()),
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

    stop_when_either_exits(send_task, recv_task).await;

    // Queued sends that have not started yet are dropped
    cancel.cancel();
    dispatcher.disconnect(conn_id).await;
    info!("{} ({}) disconnected from gateway", identity.user_id, conn_id);
}

/// Wait for either task to finish, then abort the other and wait until it is
/// gone, so nothing it was doing can land after teardown starts.
async fn stop_when_either_exits(mut first: JoinHandle<()>, mut second: JoinHandle<()>) {
    let remaining = tokio::select! {
        _ = &mut first => second,
        _ = &mut second => first,
    };
    remaining.abort();
    let _ = remaining.await;
}

async fn wait_for_identify(
    receiver: &mut WsReceiver,
    verifier: &TokenVerifier,
) -> Result<Identity, GatewayError> {
    let identify = async {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    return match serde_json::from_str::<GatewayCommand>(text.as_str()) {
                        Ok(GatewayCommand::Identify { token }) => verifier.current_identity(&token),
                        _ => Err(GatewayError::Unauthenticated(
                            "first command must be Identify".into(),
                        )),
                    };
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        Err(GatewayError::Unauthenticated(
            "connection closed before Identify".into(),
        ))
    };

    tokio::time::timeout(IDENTIFY_TIMEOUT, identify)
        .await
        .map_err(|_| GatewayError::Unauthenticated("Identify timed out".into()))?
}

async fn handle_command(
    dispatcher: &Dispatcher,
    conn_id: ConnectionId,
    identity: &Identity,
    cmd: GatewayCommand,
    outbox: &mpsc::UnboundedSender<PendingSend>,
) {
    let result = match cmd {
        GatewayCommand::Identify { .. } => {
            debug!("{} sent Identify twice, ignoring", identity.user_id);
            Ok(())
        }

        GatewayCommand::JoinRoom { room_key } => {
            dispatcher.join_room(conn_id, &room_key).await.map(|_| ())
        }

        GatewayCommand::LeaveRoom { room_key } => {
            dispatcher.leave_room(conn_id, &room_key).await.map(|_| ())
        }

        GatewayCommand::ChatMessage {
            room_key,
            receiver_id,
            body,
            nonce,
        } => {
            // A UUID nonce doubles as the message id, so a resend is idempotent
            let id = nonce.as_deref().and_then(|n| Uuid::parse_str(n).ok());
            let pending = PendingSend {
                draft: OutboundMessage {
                    id,
                    room_key,
                    sender: identity.clone(),
                    receiver_id,
                    body,
                },
                nonce,
            };
            // Only fails once the worker is gone, i.e. during teardown
            if outbox.send(pending).is_err() {
                debug!("{} send worker closed, dropping message", identity.user_id);
            }
            Ok(())
        }

        GatewayCommand::SendNotification {
            recipient_id,
            excerpt,
        } => dispatcher
            .notify(identity, &recipient_id, &excerpt)
            .await
            .map(|_| ()),
    };

    if let Err(e) = result {
        warn!("{} ({}) command rejected: {}", identity.user_id, conn_id, e);
        dispatcher.send_to(conn_id, e.to_event()).await;
    }
}

/// Processes one connection's chat sends in submission order.
async fn run_send_worker(
    dispatcher: Dispatcher,
    conn_id: ConnectionId,
    mut outbox: mpsc::UnboundedReceiver<PendingSend>,
    cancel: CancellationToken,
) {
    loop {
        let pending = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = outbox.recv() => match next {
                Some(pending) => pending,
                None => break,
            },
        };

        let sender_id = pending.draft.sender.user_id.clone();
        match dispatcher.send_chat(conn_id, pending.draft).await {
            Ok(message) => {
                dispatcher
                    .send_to(
                        conn_id,
                        GatewayEvent::MessageSent {
                            nonce: pending.nonce,
                            message,
                        },
                    )
                    .await;
            }
            Err(e) => {
                match &e {
                    GatewayError::PersistenceFailure(_) => {
                        error!("{} ({}) send failed: {}", sender_id, conn_id, e)
                    }
                    _ => warn!("{} ({}) send rejected: {}", sender_id, conn_id, e),
                }
                dispatcher.send_to(conn_id, e.to_event()).await;
            }
        }
    }
}

async fn send_event(sender: &mut WsSender, event: &GatewayEvent) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to encode gateway event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
