//! Server side of one agent WebSocket session.
//!
//! After auth and registration the session runs a single select loop with
//! three concerns: draining the subdomain topic onto the socket, keeping the
//! peer alive with pings, and republishing inbound response frames to their
//! request-id topics. The loop owns the only writer for the socket, so
//! envelopes and pings can never interleave mid-frame.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::time::Instant;

use crate::host::subdomain_from_host;
use crate::wire::Envelope;

use super::gate;
use super::routes::AppState;

/// Interval between keepalive pings, mirrored by the agent.
pub const PING_INTERVAL: Duration = Duration::from_secs(5);
/// Grace period beyond the ping interval before the peer counts as gone.
pub const PING_WAIT: Duration = Duration::from_secs(10);

/// Header the agent uses to announce an opaque client identifier.
pub const CLIENT_ID_HEADER: &str = "reqbouncer-client-id";

/// Close reason sent to a second agent dialing an occupied subdomain.
pub const DUPLICATE_CLOSE_REASON: &str = "client already connected";

/// `GET /_websocket`: authenticated agent upgrade.
pub(crate) async fn websocket_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if host.is_empty() {
        return (StatusCode::BAD_REQUEST, "missing Host header").into_response();
    }
    let subdomain = subdomain_from_host(&host);

    match gate::authorize(&state, &headers, &host, &subdomain).await {
        Ok(identity) => debug!("agent upgrade for {subdomain} authorized as {}", identity.login),
        Err(err) => return err.into_response(),
    }

    let client_id = headers
        .get(CLIENT_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    ws.on_upgrade(move |socket| run_session(socket, state, subdomain, client_id))
}

async fn run_session(
    socket: WebSocket,
    state: AppState,
    subdomain: String,
    client_id: Option<String>,
) {
    let mut socket = socket;

    // The registry is authoritative: the duplicate loses even if it passed
    // auth, and the existing session is never replaced.
    if !state.registry.try_add(&subdomain, client_id.clone()) {
        info!("client already connected for subdomain {subdomain}");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: 1000,
                reason: DUPLICATE_CLOSE_REASON.into(),
            })))
            .await;
        return;
    }

    info!(
        "agent connected for subdomain {subdomain} (client_id: {}, connected: {})",
        client_id.as_deref().unwrap_or("-"),
        state.registry.len()
    );

    let (mut sender, mut receiver) = socket.split();
    let mut requests = state.broker.subscribe(&subdomain);
    let mut ping = tokio::time::interval(PING_INTERVAL);
    let mut read_deadline = Instant::now() + PING_INTERVAL + PING_WAIT;

    loop {
        tokio::select! {
            delivery = requests.recv() => {
                let Some(delivery) = delivery else { break };
                let frame = match delivery.envelope().encode() {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!("failed to encode envelope for {subdomain}: {err}");
                        continue;
                    }
                };
                debug!("sending request {} to agent for {subdomain}", delivery.envelope().id);
                if let Err(err) = sender.send(Message::Binary(frame.into())).await {
                    warn!("failed to write to agent for {subdomain}: {err}");
                    break;
                }
                delivery.ack();
            }
            _ = ping.tick() => {
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep_until(read_deadline) => {
                warn!("agent for {subdomain} missed the keepalive deadline");
                break;
            }
            msg = receiver.next() => {
                read_deadline = Instant::now() + PING_INTERVAL + PING_WAIT;
                match msg {
                    Some(Ok(Message::Binary(frame))) => republish_response(&state, &frame).await,
                    // Inbound pings are answered by the framework; both
                    // directions just extend the deadline.
                    Some(Ok(Message::Ping(_)) | Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Text(_))) => {
                        debug!("ignoring text frame from agent for {subdomain}");
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("agent for {subdomain} closed the socket");
                        break;
                    }
                    Some(Err(err)) => {
                        warn!("read error on agent socket for {subdomain}: {err}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    state.registry.remove(&subdomain);
    info!("agent disconnected for subdomain {subdomain}");
}

/// Treats the frame's envelope id as a topic and republishes the payload,
/// which wakes the ingress handler waiting on that id.
async fn republish_response(state: &AppState, frame: &[u8]) {
    match Envelope::decode(frame) {
        Ok(envelope) => {
            debug!("republishing response for {}", envelope.id);
            let topic = envelope.id.clone();
            state.broker.publish(&topic, envelope).await;
        }
        Err(err) => warn!("dropping malformed frame from agent: {err}"),
    }
}
