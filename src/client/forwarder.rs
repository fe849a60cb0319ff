//! Replays tunneled requests against the local target.
//!
//! The inverse of the server's ingress: decode the envelope, parse the
//! payload as an HTTP request, point it at the configured target, execute
//! it, and dump the full response back to wire bytes under the same id.

use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use futures::SinkExt;
use futures::stream::SplitSink;
use http::Version;
use log::{debug, warn};
use reqwest::header::HeaderValue;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::host::HostPort;
use crate::wire::Envelope;

/// Shared write half of the tunnel socket. Responses finish in any order,
/// so every in-flight forward owns a handle to the same serialized sink.
pub(crate) type WsSink =
    Arc<Mutex<SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>>>;

/// Upper bound for a downstream response body, mirroring the server's cap
/// on request bodies. Bigger bodies would head-of-line block the socket.
const MAX_RESPONSE_BYTES: usize = 1024 * 1024;
const MAX_HEADERS: usize = 64;

/// Hop-by-hop and framing headers that must not be copied through; the
/// client recomputes framing itself.
const SKIPPED_HEADERS: &[&str] = &[
    "content-length",
    "transfer-encoding",
    "connection",
    "proxy-connection",
    "keep-alive",
];

#[derive(Clone)]
pub(crate) struct Forwarder {
    target: HostPort,
    http: reqwest::Client,
}

impl Forwarder {
    pub(crate) fn new(target: HostPort) -> Self {
        Self {
            target,
            http: reqwest::Client::new(),
        }
    }

    /// Handles one inbound binary frame end to end: decode, replay, reply.
    ///
    /// Local HTTP failures become a best-effort `500` envelope so the public
    /// client is not left hanging.
    pub(crate) async fn handle_frame(&self, frame: &[u8], sink: WsSink) {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("dropping malformed frame: {err}");
                return;
            }
        };
        let id = envelope.id.clone();

        let payload = match self.replay(&envelope.payload).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("failed to forward request {id}: {err:#}");
                synthesize_response(500, &format!("reqbouncer: {err:#}"))
            }
        };

        let reply = Envelope::new(id, payload);
        let frame = match reply.encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!("failed to encode response envelope: {err}");
                return;
            }
        };
        let mut sink = sink.lock().await;
        if let Err(err) = sink.send(Message::Binary(frame.into())).await {
            warn!("failed to write response frame: {err}");
        }
    }

    /// Executes the serialized request against the target and dumps the
    /// response back to HTTP/1.1 wire bytes.
    async fn replay(&self, request_bytes: &[u8]) -> Result<Vec<u8>> {
        let request = parse_request(request_bytes)?;
        debug!(
            "forwarding request to {}: {} {}",
            self.target, request.method, request.path
        );

        let method: reqwest::Method = request.method.parse().context("invalid method")?;
        let url = format!(
            "{}://{}{}",
            self.target.http_scheme(),
            self.target,
            request.path
        );

        let mut builder = self.http.request(method, &url);
        for (name, value) in &request.headers {
            if SKIPPED_HEADERS.iter().any(|skip| name.eq_ignore_ascii_case(skip)) {
                continue;
            }
            if let Ok(value) = HeaderValue::from_bytes(value) {
                builder = builder.header(name.as_str(), value);
            }
        }

        let response = builder
            .body(request.body)
            .send()
            .await
            .context("sending request to target")?;

        if response.status() == reqwest::StatusCode::SWITCHING_PROTOCOLS {
            debug!("target answered 101, refusing tunneled upgrade");
            return Ok(synthesize_response(500, "switching protocols not supported"));
        }

        dump_response(response).await
    }
}

struct ParsedRequest {
    method: String,
    path: String,
    headers: Vec<(String, Vec<u8>)>,
    body: Vec<u8>,
}

fn parse_request(bytes: &[u8]) -> Result<ParsedRequest> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(bytes).context("parsing tunneled request")? {
        httparse::Status::Complete(header_len) => Ok(ParsedRequest {
            method: request.method.unwrap_or("GET").to_string(),
            path: request.path.unwrap_or("/").to_string(),
            headers: request
                .headers
                .iter()
                .map(|header| (header.name.to_string(), header.value.to_vec()))
                .collect(),
            body: bytes[header_len..].to_vec(),
        }),
        httparse::Status::Partial => bail!("truncated request head"),
    }
}

/// Dumps status line, headers, and body to raw HTTP/1.1 bytes.
///
/// The body is read up front (no streaming), so framing is normalized to a
/// plain content-length even if the target answered chunked.
async fn dump_response(response: reqwest::Response) -> Result<Vec<u8>> {
    let status = response.status();
    let version = response.version();
    let headers = response.headers().clone();

    let mut body = Vec::new();
    let mut response = response;
    while let Some(chunk) = response.chunk().await.context("reading response body")? {
        if body.len() + chunk.len() > MAX_RESPONSE_BYTES {
            bail!("response body exceeds {MAX_RESPONSE_BYTES} bytes");
        }
        body.extend_from_slice(&chunk);
    }

    let version = match version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    };
    let mut out = Vec::with_capacity(body.len() + 256);
    out.extend_from_slice(
        format!(
            "{version} {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    for (name, value) in headers.iter() {
        if name == reqwest::header::CONTENT_LENGTH || name == reqwest::header::TRANSFER_ENCODING {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("content-length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Builds a minimal self-contained HTTP/1.1 response.
fn synthesize_response(status: u16, body: &str) -> Vec<u8> {
    let reason = http::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("");
    format!(
        "HTTP/1.1 {status} {reason}\r\ncontent-type: text/plain; charset=utf-8\r\ncontent-length: {}\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_with_body() {
        let raw = b"POST /echo HTTP/1.1\r\nHost: localhost:50001\r\nContent-Length: 13\r\n\r\nHello, world!";
        let parsed = parse_request(raw).unwrap();
        assert_eq!(parsed.method, "POST");
        assert_eq!(parsed.path, "/echo");
        assert_eq!(parsed.body, b"Hello, world!");
        assert!(
            parsed
                .headers
                .iter()
                .any(|(name, value)| name == "Host" && value == b"localhost:50001")
        );
    }

    #[test]
    fn test_parse_request_rejects_truncated_head() {
        assert!(parse_request(b"POST /echo HTTP/1.1\r\nHost: x\r\n").is_err());
    }

    #[test]
    fn test_synthesize_response_shape() {
        let bytes = synthesize_response(500, "switching protocols not supported");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(text.contains("content-length: 33\r\n"));
        assert!(text.ends_with("\r\n\r\nswitching protocols not supported"));
    }
}
