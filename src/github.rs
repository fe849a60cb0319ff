//! GitHub identity: bearer-token resolution and the device-flow login.

use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use tokio::time::Instant;

const USER_ENDPOINT: &str = "https://api.github.com/user";
const DEVICE_CODE_ENDPOINT: &str = "https://github.com/login/device/code";
const ACCESS_TOKEN_ENDPOINT: &str = "https://github.com/login/oauth/access_token";
const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";
const DEVICE_SCOPE: &str = "read:user";
const USER_AGENT: &str = concat!("reqbouncer/", env!("CARGO_PKG_VERSION"));

/// The part of a GitHub user the tunnel cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct Identity {
    pub login: String,
}

/// Resolves a bearer token to an identity.
///
/// Injected into the server so tests can substitute a stub for the real
/// GitHub endpoint.
#[async_trait]
pub trait UserProvider: Send + Sync {
    async fn fetch_user(&self, access_token: &str) -> Result<Identity>;
}

/// [`UserProvider`] backed by the GitHub REST API.
#[derive(Clone, Default)]
pub struct GitHubUserProvider {
    http: reqwest::Client,
}

impl GitHubUserProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserProvider for GitHubUserProvider {
    async fn fetch_user(&self, access_token: &str) -> Result<Identity> {
        let response = self
            .http
            .get(USER_ENDPOINT)
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {access_token}"))
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await
            .context("requesting github user")?;

        if !response.status().is_success() {
            bail!("failed to get github user: status {}", response.status());
        }

        response.json().await.context("decoding github user")
    }
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    interval: Option<u64>,
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AccessTokenPoll {
    access_token: Option<String>,
    error: Option<String>,
}

/// Runs the OAuth device flow and returns the access token.
///
/// Prints the verification URI and user code, then polls GitHub until the
/// user approves the device or the code expires.
pub async fn device_flow_login(github_client_id: &str) -> Result<String> {
    let http = reqwest::Client::new();

    let device: DeviceCodeResponse = http
        .post(DEVICE_CODE_ENDPOINT)
        .header(reqwest::header::ACCEPT, "application/json")
        .header(reqwest::header::USER_AGENT, USER_AGENT)
        .form(&[("client_id", github_client_id), ("scope", DEVICE_SCOPE)])
        .send()
        .await
        .context("requesting device code")?
        .error_for_status()
        .context("device code request rejected")?
        .json()
        .await
        .context("decoding device code response")?;

    println!(
        "Please visit {} and enter the following code:",
        device.verification_uri
    );
    println!("User code: {}", device.user_code);

    let mut poll_interval = Duration::from_secs(device.interval.unwrap_or(5));
    let expires = Instant::now() + Duration::from_secs(device.expires_in.unwrap_or(900));
    debug!("waiting for device authorization...");

    loop {
        if Instant::now() >= expires {
            bail!("device authorization expired before it was approved");
        }
        tokio::time::sleep(poll_interval).await;

        let poll: AccessTokenPoll = http
            .post(ACCESS_TOKEN_ENDPOINT)
            .header(reqwest::header::ACCEPT, "application/json")
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .form(&[
                ("client_id", github_client_id),
                ("device_code", device.device_code.as_str()),
                ("grant_type", DEVICE_GRANT_TYPE),
            ])
            .send()
            .await
            .context("polling for access token")?
            .json()
            .await
            .context("decoding access token response")?;

        if let Some(token) = poll.access_token {
            return Ok(token);
        }
        match poll.error.as_deref() {
            Some("authorization_pending") => continue,
            Some("slow_down") => poll_interval += Duration::from_secs(5),
            Some(other) => bail!("device authorization failed: {other}"),
            None => bail!("unexpected response while polling for access token"),
        }
    }
}
