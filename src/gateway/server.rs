//! Session Gateway - WebSocket server and HTTP side endpoints
//!
//! # Connection lifecycle
//!
//! ```text
//!  connecting ──auth ok──► attached ──client closed / slow consumer──► closing ──► closed
//!      │
//!      └─auth failed──► policy close frame ──► closed
//! ```
//!
//! Each attached connection runs two halves:
//! - a writer task that forwards its bus subscription and direct replies to
//!   the socket;
//! - the reader loop, which rate-limits inbound frames and spawns a task per
//!   chat turn or command so it keeps reading while they run.
//!
//! Closing a connection only drops its subscription. Executions and chat
//! turns it started keep running and publish to whoever is still attached.

use std::future::Future;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::commands;
use super::protocol::{error_frame, event_frame, parse_frame, result_frame, ConnectParams, Identity, Inbound};
use super::rate_limit::RateLimiter;
use crate::error::{ErrorInfo, OrchestratorError};
use crate::events::{CloseReason, Subscription};
use crate::metrics::{gather_text, COMMANDS, CONNECTIONS_ACTIVE};
use crate::orchestrator::Orchestrator;

/// Direct replies queued per connection before the reader waits
const REPLY_BUFFER: usize = 64;

/// Where a connection is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Attached,
    Closing,
    Closed,
}

/// Build the gateway router
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(api_status))
        .route("/metrics", get(metrics))
        .route("/ws", get(websocket))
        .with_state(orchestrator)
}

/// Serve the gateway on an already-bound listener until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, orchestrator: Arc<Orchestrator>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(%addr, "gateway listening");
    axum::serve(listener, router(orchestrator))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health(State(orchestrator): State<Arc<Orchestrator>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "engine": orchestrator.registry().engine().name(),
    }))
}

async fn api_status(State(orchestrator): State<Arc<Orchestrator>>) -> impl IntoResponse {
    Json(orchestrator.service_status().await)
}

async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        gather_text(),
    )
}

async fn websocket(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(orchestrator): State<Arc<Orchestrator>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, orchestrator, params))
}

async fn handle_socket(socket: WebSocket, orchestrator: Arc<Orchestrator>, params: ConnectParams) {
    let (mut sink, mut stream) = socket.split();
    let mut state = ConnectionState::Connecting;

    let identity = match params.authenticate(orchestrator.config().auth_token.as_deref()) {
        Ok(identity) => identity,
        Err(e) => {
            warn!(user = ?params.user, session = ?params.session, error = %e, "connection rejected");
            send_fatal(&mut sink, &e).await;
            return;
        }
    };

    let span = tracing::info_span!("conn", user = %identity.user, session = %identity.session);
    async move {
        let subscription = orchestrator.attach(&identity.user, &identity.session).await;
        transition(&mut state, ConnectionState::Attached);
        CONNECTIONS_ACTIVE.inc();

        let (reply_tx, reply_rx) = mpsc::channel::<String>(REPLY_BUFFER);
        let closed = CancellationToken::new();
        let writer = tokio::spawn(write_loop(sink, subscription, reply_rx, closed.clone()).in_current_span());

        let mut limiter = RateLimiter::per_second(orchestrator.config().frames_per_second);
        loop {
            let message = tokio::select! {
                _ = closed.cancelled() => break,
                message = stream.next() => message,
            };
            let text = match message {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(error = %e, "websocket receive error");
                    break;
                }
            };

            if !limiter.try_acquire() {
                COMMANDS.with_label_values(&["frame", "rate_limited"]).inc();
                reply_error(&reply_tx, &OrchestratorError::RateLimited).await;
                continue;
            }

            match parse_frame(&text) {
                Ok(inbound) => dispatch(&orchestrator, &identity, inbound, &reply_tx),
                Err(e) => {
                    COMMANDS.with_label_values(&["unknown", "bad_request"]).inc();
                    reply_error(&reply_tx, &e).await;
                }
            }
        }

        transition(&mut state, ConnectionState::Closing);
        drop(reply_tx);
        closed.cancel();
        if let Err(e) = writer.await {
            warn!(error = %e, "writer task failed");
        }
        CONNECTIONS_ACTIVE.dec();
        transition(&mut state, ConnectionState::Closed);
    }
    .instrument(span)
    .await
}

fn transition(state: &mut ConnectionState, next: ConnectionState) {
    debug!(from = ?*state, to = ?next, "connection state");
    *state = next;
}

/// Close frame for an error that ends the connection
fn close_frame(error: &OrchestratorError) -> Option<CloseFrame<'static>> {
    if !error.closes_connection() {
        return None;
    }
    let code = match error {
        OrchestratorError::Unauthorized(_) => close_code::POLICY,
        _ => close_code::AGAIN,
    };
    Some(CloseFrame {
        code,
        reason: error.to_string().into(),
    })
}

/// Send the error frame, then close if the error ends the connection
async fn send_fatal(sink: &mut SplitSink<WebSocket, Message>, error: &OrchestratorError) {
    let _ = sink.send(Message::Text(error_frame(&ErrorInfo::from(error)))).await;
    if let Some(frame) = close_frame(error) {
        let _ = sink.send(Message::Close(Some(frame))).await;
    }
}

async fn reply_error(reply_tx: &mpsc::Sender<String>, error: &OrchestratorError) {
    let _ = reply_tx.send(error_frame(&ErrorInfo::from(error))).await;
}

/// Spawn the work for one inbound frame
fn dispatch(
    orchestrator: &Arc<Orchestrator>,
    identity: &Identity,
    inbound: Inbound,
    reply_tx: &mpsc::Sender<String>,
) {
    let orchestrator = Arc::clone(orchestrator);
    let identity = identity.clone();
    let reply_tx = reply_tx.clone();

    match inbound {
        Inbound::Chat(text) => {
            tokio::spawn(
                async move {
                    // Fragments and failures reach the client through the bus
                    let _ = orchestrator
                        .chat(&identity.user, &identity.session, &text, identity.think)
                        .await;
                }
                .in_current_span(),
            );
        }
        Inbound::Command(command) => {
            tokio::spawn(
                async move {
                    let name = command.name();
                    debug!(command = name, "command received");
                    let frame = match commands::execute(&orchestrator, &identity, command).await {
                        Ok(result) => {
                            COMMANDS.with_label_values(&[name, "ok"]).inc();
                            result_frame(name, result)
                        }
                        Err(e) => {
                            COMMANDS.with_label_values(&[name, e.kind()]).inc();
                            debug!(command = name, error = %e, "command failed");
                            error_frame(&ErrorInfo::from(&e))
                        }
                    };
                    // The connection may be gone; the work itself is done
                    let _ = reply_tx.send(frame).await;
                }
                .in_current_span(),
            );
        }
    }
}

/// Forward subscription events and direct replies to the socket
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut subscription: Subscription,
    mut replies: mpsc::Receiver<String>,
    closed: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            event = subscription.next() => match event {
                Some(event) => event_frame(&event.kind),
                None => {
                    if subscription.close_reason() == Some(CloseReason::SlowConsumer) {
                        warn!("closing slow consumer");
                        send_fatal(&mut sink, &OrchestratorError::SlowConsumer).await;
                    }
                    break;
                }
            },
            reply = replies.recv() => match reply {
                Some(frame) => frame,
                None => break,
            },
            _ = closed.cancelled() => break,
        };

        if sink.send(Message::Text(frame)).await.is_err() {
            debug!("socket send failed");
            break;
        }
    }
    closed.cancel();
    let _ = sink.close().await;
}
