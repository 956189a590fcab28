//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::{MatchEvent, MatchHandle, Outbound, SessionStore};
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, ServerMsg, Side};

/// Queue depth between the reader/forwarder and the socket writer
const OUTBOUND_QUEUE: usize = 128;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// The session and side this socket speaks for
struct Binding {
    handle: MatchHandle,
    side: Side,
    forwarder: JoinHandle<()>,
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4();
    info!(connection_id = %connection_id, "New WebSocket connection");

    let (ws_sink, ws_stream) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<ServerMsg>(OUTBOUND_QUEUE);

    let writer = tokio::spawn(run_writer(connection_id, ws_sink, out_rx));

    let welcome = ServerMsg::Welcome {
        connection_id,
        server_time: unix_millis(),
    };
    if out_tx.send(welcome).await.is_err() {
        error!(connection_id = %connection_id, "Failed to queue welcome");
        writer.abort();
        return;
    }

    let binding = run_session(connection_id, ws_stream, &state.sessions, &out_tx).await;

    if let Some(binding) = binding {
        release(binding).await;
    }
    drop(out_tx);
    writer.abort();

    info!(connection_id = %connection_id, "WebSocket connection closed");
}

/// Reader loop: WebSocket -> session. Returns the binding held at close.
async fn run_session(
    connection_id: Uuid,
    mut ws_stream: futures::stream::SplitStream<WebSocket>,
    sessions: &Arc<SessionStore>,
    out_tx: &mpsc::Sender<ServerMsg>,
) -> Option<Binding> {
    let rate_limiter = ConnectionRateLimiter::new();
    let mut binding: Option<Binding> = None;

    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if !rate_limiter.check_input() {
                    warn!(connection_id = %connection_id, "Rate limited client message");
                    continue;
                }

                match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(msg) => {
                        binding = handle_client_msg(connection_id, msg, binding, sessions, out_tx).await;
                    }
                    Err(e) => {
                        warn!(connection_id = %connection_id, error = %e, "Failed to parse client message");
                        let _ = out_tx
                            .send(ServerMsg::Error {
                                code: "bad_message".into(),
                                message: e.to_string(),
                            })
                            .await;
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(connection_id = %connection_id, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(connection_id = %connection_id, "Client initiated close");
                break;
            }
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    binding
}

/// Translate one client message; returns the (possibly new) binding
async fn handle_client_msg(
    connection_id: Uuid,
    msg: ClientMsg,
    binding: Option<Binding>,
    sessions: &Arc<SessionStore>,
    out_tx: &mpsc::Sender<ServerMsg>,
) -> Option<Binding> {
    let (match_id, event) = match msg {
        ClientMsg::JoinMatch {
            match_id,
            side,
            player_id,
            alias,
            settings,
        } => {
            if let Some(previous) = binding {
                release(previous).await;
            }

            let join = MatchEvent::Join {
                side,
                player_id,
                alias,
            };
            let Some((handle, rx)) = sessions.attach(&match_id, settings.as_ref(), join).await else {
                error!(connection_id = %connection_id, match_id = %match_id, "Could not reach session");
                return None;
            };

            info!(connection_id = %connection_id, match_id = %match_id, side = ?side, "Joined match");
            let forwarder = tokio::spawn(forward(connection_id, rx, side, out_tx.clone()));
            return Some(Binding {
                handle,
                side,
                forwarder,
            });
        }
        ClientMsg::Ping { t } => {
            let _ = out_tx.send(ServerMsg::Pong { t }).await;
            return binding;
        }
        ClientMsg::Input {
            match_id,
            entity_id,
            dx,
            dy,
        } => (match_id, Bound::Input { entity_id, dx, dy }),
        ClientMsg::RequestRematch { match_id, alias } => (match_id, Bound::Request { alias }),
        ClientMsg::AcceptRematch { match_id } => (match_id, Bound::Respond { accept: true }),
        ClientMsg::DeclineRematch { match_id } => (match_id, Bound::Respond { accept: false }),
        ClientMsg::ConfirmRematch {
            match_id,
            new_match_id,
        } => (match_id, Bound::Confirm { new_match_id }),
    };

    let Some(current) = binding.as_ref().filter(|b| b.handle.id == match_id) else {
        debug!(connection_id = %connection_id, match_id = %match_id, "Message for a match this socket is not in");
        return binding;
    };

    let event = event.into_event(current.side);
    if current.handle.command_tx.send(event).await.is_err() {
        debug!(connection_id = %connection_id, match_id = %match_id, "Session closed");
    }
    binding
}

/// Match-scoped client actions before the sender's side is attached
enum Bound {
    Input { entity_id: u32, dx: f32, dy: f32 },
    Request { alias: Option<String> },
    Respond { accept: bool },
    Confirm { new_match_id: String },
}

impl Bound {
    fn into_event(self, side: Side) -> MatchEvent {
        match self {
            Bound::Input { entity_id, dx, dy } => MatchEvent::Input {
                side,
                entity_id,
                dx,
                dy,
            },
            Bound::Request { alias } => MatchEvent::RequestRematch { side, alias },
            Bound::Respond { accept } => MatchEvent::RespondRematch { side, accept },
            Bound::Confirm { new_match_id } => MatchEvent::ConfirmRematch { side, new_match_id },
        }
    }
}

/// Drop a seat: stop forwarding and tell the session
async fn release(binding: Binding) {
    binding.forwarder.abort();
    let _ = binding
        .handle
        .command_tx
        .send(MatchEvent::Leave { side: binding.side })
        .await;
}

/// Session broadcast -> this socket, filtered to what `side` may see
async fn forward(
    connection_id: Uuid,
    mut rx: broadcast::Receiver<Outbound>,
    side: Side,
    out_tx: mpsc::Sender<ServerMsg>,
) {
    loop {
        match rx.recv().await {
            Ok(outbound) => {
                if !outbound.is_for(Some(side)) {
                    continue;
                }
                if out_tx.send(outbound.msg).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(connection_id = %connection_id, lagged_count = n, "Client lagged, skipping {} messages", n);
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!(connection_id = %connection_id, "Session channel closed");
                break;
            }
        }
    }
}

/// Writer task: queued messages -> WebSocket
async fn run_writer(
    connection_id: Uuid,
    mut ws_sink: futures::stream::SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<ServerMsg>,
) {
    while let Some(msg) = out_rx.recv().await {
        if let Err(e) = send_msg(&mut ws_sink, &msg).await {
            debug!(connection_id = %connection_id, error = %e, "WebSocket send failed");
            break;
        }
    }
    let _ = ws_sink.close().await;
}

/// Send a message over WebSocket
async fn send_msg(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMsg,
) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json)).await.map_err(|e| e.to_string())
}
