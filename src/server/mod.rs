//! Rendezvous server: accept loop, reserved routes, and agent sessions.
//!
//! Every accepted connection has its request line sniffed first. Reserved
//! routes (anything starting with `/_`) are replayed into the HTTP framework;
//! everything else stays on the raw socket and goes down the tunnel path in
//! [`ingress`], which is what allows the response bytes to be written back
//! without the framework reframing them.

mod gate;
mod ingress;
mod registry;
mod routes;
mod session;
mod stream;

pub use registry::AgentRegistry;
pub use routes::AppState;
pub use session::{CLIENT_ID_HEADER, DUPLICATE_CLOSE_REASON, PING_INTERVAL, PING_WAIT};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use axum::Router;
use bytes::BytesMut;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{debug, info};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tower::ServiceExt as _;

use crate::broker::Broker;
use crate::github::UserProvider;

/// How long the ingress waits for the agent round trip by default.
pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Advertised on `/_config` for the device-flow login.
    pub github_client_id: String,
    /// Deadline for a tunneled request's round trip.
    pub forward_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            github_client_id: String::new(),
            forward_timeout: DEFAULT_FORWARD_TIMEOUT,
        }
    }
}

/// Runs the rendezvous server until a shutdown signal arrives.
///
/// Per-connection and per-session failures are logged and never tear the
/// server down.
pub async fn run(cfg: ServerConfig, provider: Arc<dyn UserProvider>) -> Result<()> {
    let state = AppState {
        registry: Arc::new(AgentRegistry::new()),
        broker: Arc::new(Broker::new()),
        provider,
        github_client_id: cfg.github_client_id,
        forward_timeout: cfg.forward_timeout,
    };
    let router = routes::create_router(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;
    info!("listening on http://{addr}");

    // Connection tasks live in a JoinSet so they die with the server future
    // instead of keeping sockets open past shutdown.
    let mut connections = JoinSet::new();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = accepted.context("accepting connection")?;
                let state = state.clone();
                let router = router.clone();
                connections.spawn(async move {
                    if let Err(err) = handle_connection(socket, state, router).await {
                        debug!("connection from {peer} ended with error: {err:#}");
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = &mut shutdown => {
                info!("shutdown signal received");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(mut socket: TcpStream, state: AppState, router: Router) -> Result<()> {
    let mut buffered = BytesMut::with_capacity(4 * 1024);
    let Some(target) = stream::read_request_target(&mut socket, &mut buffered).await? else {
        return Ok(());
    };

    if target.starts_with("/_") {
        serve_reserved(socket, buffered, router).await
    } else {
        ingress::handle(socket, buffered, state).await
    }
}

/// Hands a reserved-route connection to the HTTP framework, replaying the
/// sniffed bytes first.
async fn serve_reserved(socket: TcpStream, buffered: BytesMut, router: Router) -> Result<()> {
    let io = TokioIo::new(stream::PrefixedStream::new(buffered.freeze(), socket));
    let service =
        service_fn(move |request: hyper::Request<Incoming>| router.clone().oneshot(request));

    http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades()
        .await
        .map_err(|err| anyhow::anyhow!("serving reserved route: {err}"))
}
