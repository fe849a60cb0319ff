//! Shared harness for end-to-end tunnel tests.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::routing::{get, post};
use reqbouncer::client::{Agent, AgentConfig};
use reqbouncer::github::{Identity, UserProvider};
use reqbouncer::server::{self, ServerConfig};
use tokio::task::JoinHandle;

/// Provider that accepts any bearer token and reports a fixed login, standing
/// in for the GitHub API.
pub struct StaticUserProvider(pub &'static str);

#[async_trait]
impl UserProvider for StaticUserProvider {
    async fn fetch_user(&self, _access_token: &str) -> Result<Identity> {
        Ok(Identity {
            login: self.0.to_string(),
        })
    }
}

/// Starts a rendezvous server on `port` in the background.
pub fn spawn_server(port: u16, forward_timeout: Duration) -> JoinHandle<()> {
    let cfg = ServerConfig {
        port,
        github_client_id: "test-client-id".to_string(),
        forward_timeout,
    };
    tokio::spawn(async move {
        if let Err(err) = server::run(cfg, Arc::new(StaticUserProvider("tester"))).await {
            panic!("server exited: {err:?}");
        }
    })
}

/// Starts the local target the agent forwards to.
pub fn spawn_target(port: u16) -> JoinHandle<()> {
    let app = Router::new()
        .route("/", get(|| async { "Hello, world!" }))
        .route("/echo", post(|body: Bytes| async move { body }))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "late"
            }),
        );

    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .expect("binding target listener");
        axum::serve(listener, app).await.expect("serving target");
    })
}

/// Starts a forwarding agent pointed at the local server and target.
pub fn spawn_agent(target_port: u16, server_port: u16, client_id: &str) -> JoinHandle<Result<()>> {
    let agent = Agent::new(AgentConfig {
        target: format!("localhost:{target_port}"),
        server: format!("localhost:{server_port}"),
        path: "/_websocket".to_string(),
        access_token: "test-token".to_string(),
        client_id: Some(client_id.to_string()),
    })
    .expect("agent config");
    tokio::spawn(agent.run())
}

/// Polls `/_health` until the server answers.
pub async fn wait_for_health(server_port: u16) {
    for _ in 0..50 {
        if let Ok(response) =
            reqwest::get(format!("http://localhost:{server_port}/_health")).await
        {
            if response.status() == reqwest::StatusCode::OK {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("server did not come up in time");
}

/// Polls a tunneled request until the agent answers or we give up.
pub async fn wait_for_tunnel(server_port: u16) {
    let client = reqwest::Client::new();
    for _ in 0..100 {
        if let Ok(response) = client
            .get(format!("http://localhost:{server_port}/"))
            .send()
            .await
        {
            if response.status() == reqwest::StatusCode::OK {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("tunnel did not come up in time");
}
