//! Forwarding agent: the client side of the tunnel.
//!
//! Keeps one outbound WebSocket to the rendezvous server, replays tunneled
//! requests against the local target, and reconnects with capped exponential
//! backoff whenever the connection drops.

mod credentials;
mod forwarder;

pub use credentials::{SECRET_TOKEN_ENV, config_file_path, read_key, write_credentials};

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::github::{self, GitHubUserProvider, UserProvider as _};
use crate::host::{HostPort, split_host_port};
use crate::server::{CLIENT_ID_HEADER, DUPLICATE_CLOSE_REASON, PING_INTERVAL, PING_WAIT};

use forwarder::{Forwarder, WsSink};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// First reconnect delay; doubles per attempt up to [`MAX_BACKOFF`] and
/// resets after every successful connect.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Dial attempts before giving up on the very first connect. Reconnects of
/// a previously live session retry forever.
const MAX_INITIAL_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// `host:port` the tunneled requests are replayed against.
    pub target: String,
    /// `host:port` of the rendezvous server.
    pub server: String,
    /// Upgrade path on the server, normally `/_websocket`.
    pub path: String,
    pub access_token: String,
    pub client_id: Option<String>,
}

/// Dial failures, split by whether another attempt can help.
#[derive(Debug, Error)]
enum DialError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("permission denied")]
    Forbidden,
    #[error("server not found: {0}")]
    UnknownSubdomain(String),
    #[error("client already connected for host: {0}")]
    AlreadyConnected(String),
    #[error("access token is not a valid header value")]
    InvalidToken,
    #[error("unexpected response: {0}")]
    UnexpectedStatus(u16),
    #[error(transparent)]
    Transient(#[from] tungstenite::Error),
}

impl DialError {
    /// Fatal errors terminate the agent; anything else retries with backoff.
    fn is_fatal(&self) -> bool {
        !matches!(self, Self::UnexpectedStatus(_) | Self::Transient(_))
    }
}

enum SessionEnd {
    /// The process should exit non-zero.
    Fatal(anyhow::Error),
    /// The connection dropped; reconnect.
    Lost,
}

pub struct Agent {
    target: HostPort,
    server: HostPort,
    path: String,
    access_token: String,
    client_id: Option<String>,
    forwarder: Forwarder,
}

impl Agent {
    pub fn new(cfg: AgentConfig) -> Result<Self> {
        if cfg.target.is_empty() {
            bail!("missing target to tunnel to");
        }
        if cfg.server.is_empty() {
            bail!("missing server to connect to");
        }
        if cfg.access_token.is_empty() {
            bail!("missing access token; run `reqbouncer login` or set {SECRET_TOKEN_ENV}");
        }

        let target = split_host_port(&cfg.target)?;
        let server = split_host_port(&cfg.server)?;

        Ok(Self {
            forwarder: Forwarder::new(target.clone()),
            target,
            server,
            path: cfg.path,
            access_token: cfg.access_token,
            client_id: cfg.client_id,
        })
    }

    /// Connects and serves until a fatal error.
    pub async fn run(self) -> Result<()> {
        info!("connecting to {}", self.server);
        if let Some(id) = &self.client_id {
            info!("using client id {id}");
        }

        let mut backoff = Backoff::new();
        let mut ws = self
            .connect_with_retries(&mut backoff, Some(MAX_INITIAL_ATTEMPTS))
            .await?;
        info!("successfully connected to {}", self.server);
        info!("forwarding all requests to {}", self.target);

        loop {
            backoff.reset();
            match self.session(ws).await {
                SessionEnd::Fatal(err) => return Err(err),
                SessionEnd::Lost => {}
            }

            info!("connection lost, trying to reconnect...");
            ws = self.connect_with_retries(&mut backoff, None).await?;
            info!("reconnected to {}", self.server);
        }
    }

    async fn connect_with_retries(
        &self,
        backoff: &mut Backoff,
        max_attempts: Option<u32>,
    ) -> Result<WsStream> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.connect().await {
                Ok(ws) => return Ok(ws),
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => {
                    if let Some(max) = max_attempts {
                        if attempts >= max {
                            return Err(anyhow::Error::from(err))
                                .with_context(|| format!("failed to dial after {max} attempts"));
                        }
                    }
                    let delay = backoff.next_delay();
                    debug!("failed to dial ({err}), retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn connect(&self) -> Result<WsStream, DialError> {
        let url = format!("{}://{}{}", self.server.ws_scheme(), self.server, self.path);
        debug!("dialing {url}");

        let mut request = url.into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.access_token))
            .map_err(|_| DialError::InvalidToken)?;
        request.headers_mut().insert("Authorization", bearer);
        if let Some(id) = &self.client_id {
            let value = HeaderValue::from_str(id).map_err(|_| DialError::InvalidToken)?;
            request.headers_mut().insert(CLIENT_ID_HEADER, value);
        }

        match connect_async(request).await {
            Ok((ws, _response)) => Ok(ws),
            Err(tungstenite::Error::Http(response)) => {
                let status = response.status().as_u16();
                Err(match status {
                    401 => {
                        let body = response
                            .body()
                            .as_deref()
                            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                            .unwrap_or_default();
                        DialError::Unauthorized(body)
                    }
                    403 => DialError::Forbidden,
                    404 => DialError::UnknownSubdomain(self.server.host.clone()),
                    409 => DialError::AlreadyConnected(self.server.host.clone()),
                    status => DialError::UnexpectedStatus(status),
                })
            }
            Err(err) => Err(DialError::Transient(err)),
        }
    }

    /// Serves one live connection until it ends.
    ///
    /// Each inbound frame is forwarded on its own task so a slow target
    /// cannot starve the keepalive; the shared sink serializes the writes.
    async fn session(&self, ws: WsStream) -> SessionEnd {
        let (sink, mut stream) = ws.split();
        let sink: WsSink = Arc::new(Mutex::new(sink));
        let mut ping = tokio::time::interval(PING_INTERVAL);
        let mut read_deadline = Instant::now() + PING_INTERVAL + PING_WAIT;

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    let mut sink = sink.lock().await;
                    if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                        return SessionEnd::Lost;
                    }
                }
                _ = tokio::time::sleep_until(read_deadline) => {
                    warn!("server missed the keepalive deadline");
                    return SessionEnd::Lost;
                }
                msg = stream.next() => {
                    read_deadline = Instant::now() + PING_INTERVAL + PING_WAIT;
                    match msg {
                        Some(Ok(Message::Binary(frame))) => {
                            let forwarder = self.forwarder.clone();
                            let sink = sink.clone();
                            tokio::spawn(async move {
                                forwarder.handle_frame(&frame, sink).await;
                            });
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let mut sink = sink.lock().await;
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(frame))) => {
                            if let Some(frame) = &frame {
                                if frame.reason.as_str().contains(DUPLICATE_CLOSE_REASON) {
                                    return SessionEnd::Fatal(anyhow::anyhow!(
                                        "client already connected for host: {}",
                                        self.server.host
                                    ));
                                }
                            }
                            info!("server closed the connection");
                            return SessionEnd::Lost;
                        }
                        Some(Ok(Message::Text(_))) => debug!("ignoring text frame"),
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!("read error: {err}");
                            return SessionEnd::Lost;
                        }
                        None => return SessionEnd::Lost,
                    }
                }
            }
        }
    }
}

struct Backoff {
    delay: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            delay: INITIAL_BACKOFF,
        }
    }

    fn reset(&mut self) {
        self.delay = INITIAL_BACKOFF;
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = (self.delay * 2).min(MAX_BACKOFF);
        delay
    }
}

#[derive(Debug, Deserialize)]
struct ServerAdvertisedConfig {
    github_client_id: String,
}

/// Logs in against `server` with the GitHub device flow and persists the
/// resulting credentials to the config file.
pub async fn login(server: &str) -> Result<()> {
    let server = split_host_port(server)?;

    let github_client_id = fetch_server_client_id(&server).await?;
    let token = github::device_flow_login(&github_client_id).await?;
    let identity = GitHubUserProvider::new().fetch_user(&token).await?;

    let server_host = format!("{}.{server}", identity.login.to_lowercase());
    let path = config_file_path()?;
    write_credentials(&path, &server_host, &token)?;

    println!("Login successful.");
    Ok(())
}

async fn fetch_server_client_id(server: &HostPort) -> Result<String> {
    let url = format!("{}://{server}/_config", server.http_scheme());
    let config: ServerAdvertisedConfig = reqwest::get(&url)
        .await
        .context("requesting server config")?
        .error_for_status()
        .context("server config request rejected")?
        .json()
        .await
        .context("decoding server config")?;

    if config.github_client_id.is_empty() {
        bail!("server did not advertise a github client id");
    }
    Ok(config.github_client_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new();
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_backoff_resets_after_success() {
        let mut backoff = Backoff::new();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), INITIAL_BACKOFF);
    }

    #[test]
    fn test_agent_config_validation() {
        let base = AgentConfig {
            target: "localhost:3000".into(),
            server: "localhost:8080".into(),
            path: "/_websocket".into(),
            access_token: "token".into(),
            client_id: None,
        };

        assert!(Agent::new(base.clone()).is_ok());
        assert!(
            Agent::new(AgentConfig {
                target: String::new(),
                ..base.clone()
            })
            .is_err()
        );
        assert!(
            Agent::new(AgentConfig {
                access_token: String::new(),
                ..base.clone()
            })
            .is_err()
        );
        assert!(
            Agent::new(AgentConfig {
                target: "noport".into(),
                ..base
            })
            .is_err()
        );
    }
}
