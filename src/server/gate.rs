//! Bearer authentication for the agent upgrade route.

use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use log::warn;
use thiserror::Error;

use crate::github::Identity;
use crate::host::is_local_host;

use super::routes::AppState;

/// Reasons an agent upgrade is refused. All of them map to HTTP 401 before
/// the WebSocket upgrade completes.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("missing Authorization header")]
    MissingHeader,
    #[error("malformed Authorization header")]
    MalformedHeader,
    #[error("invalid token")]
    InvalidToken,
    #[error("user not allowed to access this subdomain")]
    SubdomainMismatch,
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        warn!("rejecting agent upgrade: {self}");
        (StatusCode::UNAUTHORIZED, self.to_string()).into_response()
    }
}

/// Verifies the bearer token and checks the resolved identity against the
/// subdomain the agent wants to claim.
///
/// Loopback hosts skip the identity match so local development does not need
/// a real token-to-subdomain mapping; the token itself is still resolved.
pub(crate) async fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    host: &str,
    subdomain: &str,
) -> Result<Identity, GateError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(GateError::MissingHeader)?;
    let value = value.to_str().map_err(|_| GateError::MalformedHeader)?;
    let token = value
        .strip_prefix("Bearer ")
        .ok_or(GateError::MalformedHeader)?;

    let identity = state.provider.fetch_user(token).await.map_err(|err| {
        warn!("error resolving bearer token: {err:#}");
        GateError::InvalidToken
    })?;

    if !is_local_host(host) && !identity.login.eq_ignore_ascii_case(subdomain) {
        return Err(GateError::SubdomainMismatch);
    }

    Ok(identity)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::{Result, bail};
    use async_trait::async_trait;
    use axum::http::HeaderValue;

    use crate::broker::Broker;
    use crate::github::UserProvider;
    use crate::server::AgentRegistry;

    use super::*;

    struct FixedProvider {
        login: &'static str,
    }

    #[async_trait]
    impl UserProvider for FixedProvider {
        async fn fetch_user(&self, access_token: &str) -> Result<Identity> {
            if access_token == "good-token" {
                Ok(Identity {
                    login: self.login.to_string(),
                })
            } else {
                bail!("bad credentials")
            }
        }
    }

    fn test_state(login: &'static str) -> AppState {
        AppState {
            registry: Arc::new(AgentRegistry::new()),
            broker: Arc::new(Broker::new()),
            provider: Arc::new(FixedProvider { login }),
            github_client_id: String::new(),
            forward_timeout: Duration::from_secs(60),
        }
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn test_admits_matching_login() {
        let state = test_state("Alice");
        let identity = authorize(&state, &bearer("good-token"), "alice.example.com", "alice")
            .await
            .unwrap();
        assert_eq!(identity.login, "Alice");
    }

    #[tokio::test]
    async fn test_rejects_login_mismatch() {
        let state = test_state("bob");
        let err = authorize(&state, &bearer("good-token"), "alice.example.com", "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::SubdomainMismatch));
    }

    #[tokio::test]
    async fn test_loopback_bypasses_subdomain_match() {
        let state = test_state("bob");
        authorize(
            &state,
            &bearer("good-token"),
            "localhost:50001",
            "localhost:50001",
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_rejects_missing_and_malformed_headers() {
        let state = test_state("alice");
        let err = authorize(&state, &HeaderMap::new(), "alice.example.com", "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::MissingHeader));

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic xyz"));
        let err = authorize(&state, &headers, "alice.example.com", "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::MalformedHeader));
    }

    #[tokio::test]
    async fn test_rejects_invalid_token() {
        let state = test_state("alice");
        let err = authorize(&state, &bearer("stale-token"), "alice.example.com", "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::InvalidToken));
    }
}
