//! Public ingress: the tunneled request path.
//!
//! Connections land here before any HTTP framework sees them, which is what
//! makes the hijack trivial: the handler owns the raw socket, so the agent's
//! response bytes are written back verbatim. The payload already carries its
//! own status line, headers, and framing; re-serializing it through a server
//! framework would corrupt exactly the headers that matter. The price is
//! that the connection is never reused.

use anyhow::{Context as _, Result};
use bytes::BytesMut;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::host::subdomain_from_host;
use crate::wire::Envelope;

use super::routes::AppState;

/// Upper bound for a request header section.
pub(crate) const MAX_HEADER_BYTES: usize = 8 * 1024;
/// Upper bound for a tunneled request body.
pub(crate) const MAX_BODY_BYTES: usize = 1024 * 1024;
const MAX_HEADERS: usize = 64;

#[derive(Debug, Error)]
enum RequestError {
    /// The request was understood well enough to answer with a status.
    #[error("{reason}")]
    Reject { status: u16, reason: &'static str },
    /// The connection itself failed; nothing sensible can be written back.
    #[error(transparent)]
    Connection(#[from] anyhow::Error),
}

struct TunneledRequest {
    subdomain: String,
    method: String,
    path: String,
    /// Request line + headers + body, exactly as they will cross the tunnel.
    wire_bytes: Vec<u8>,
}

/// Drives one tunneled public connection to completion.
///
/// `buffered` holds whatever the accept loop already read while sniffing the
/// request line.
pub(crate) async fn handle<S>(stream: S, buffered: BytesMut, state: AppState) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = stream;
    let mut buffered = buffered;

    let request = match read_request(&mut stream, &mut buffered).await {
        Ok(request) => request,
        Err(RequestError::Reject { status, reason }) => {
            write_simple_response(&mut stream, status, reason).await.ok();
            return Ok(());
        }
        Err(RequestError::Connection(err)) => return Err(err),
    };

    info!(
        "forwarding {} {} for subdomain {}",
        request.method, request.path, request.subdomain
    );

    if !state.registry.has(&request.subdomain) {
        write_simple_response(&mut stream, 502, "no agent connected for subdomain").await?;
        return Ok(());
    }

    let id = format!("req/{}", Uuid::new_v4());
    // Subscribe before publishing so a fast agent cannot respond into the
    // void between the two steps.
    let mut responses = state.broker.subscribe(&id);
    let envelope = Envelope::new(id.clone(), request.wire_bytes);

    let (mut read_half, mut write_half) = tokio::io::split(stream);

    tokio::select! {
        outcome = tokio::time::timeout(state.forward_timeout, async {
            state.broker.publish(&request.subdomain, envelope).await;
            responses.recv().await
        }) => match outcome {
            Ok(Some(delivery)) => {
                let envelope = delivery.ack();
                debug!("writing {} response bytes for {id}", envelope.payload.len());
                write_half
                    .write_all(&envelope.payload)
                    .await
                    .context("writing response to public client")?;
                write_half.flush().await.ok();
                write_half.shutdown().await.ok();
            }
            Ok(None) => {
                write_simple_response(&mut write_half, 502, "response channel closed").await?;
            }
            Err(_) => {
                info!("request {id} timed out waiting for the agent");
                write_simple_response(&mut write_half, 504, "timed out waiting for agent").await?;
            }
        },
        _ = wait_for_close(&mut read_half) => {
            debug!("public client disconnected while waiting for {id}");
        }
    }

    Ok(())
}

/// Resolves when the public client goes away. Data received while a request
/// is in flight is discarded; the connection is single-use either way.
async fn wait_for_close<R: AsyncRead + Unpin>(reader: &mut R) {
    let mut scratch = [0u8; 512];
    loop {
        match reader.read(&mut scratch).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

async fn read_request<S>(stream: &mut S, buffered: &mut BytesMut) -> Result<TunneledRequest, RequestError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let head = loop {
        if let Some(head) = parse_head(buffered)? {
            break head;
        }
        if buffered.len() >= MAX_HEADER_BYTES {
            return Err(RequestError::Reject {
                status: 431,
                reason: "request header section too large",
            });
        }
        let read = stream
            .read_buf(buffered)
            .await
            .context("reading request head")?;
        if read == 0 {
            return Err(anyhow::anyhow!("connection closed mid-request").into());
        }
    };

    let Some(host) = head.host else {
        return Err(RequestError::Reject {
            status: 400,
            reason: "missing Host header",
        });
    };

    if head.chunked {
        return Err(RequestError::Reject {
            status: 411,
            reason: "chunked request bodies are not supported",
        });
    }
    let content_length = head.content_length.unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return Err(RequestError::Reject {
            status: 413,
            reason: "request body too large",
        });
    }

    if head.expect_continue {
        stream
            .write_all(b"HTTP/1.1 100 Continue\r\n\r\n")
            .await
            .context("writing 100-continue")?;
    }

    let total = head.header_len + content_length;
    while buffered.len() < total {
        let read = stream
            .read_buf(buffered)
            .await
            .context("reading request body")?;
        if read == 0 {
            return Err(anyhow::anyhow!("connection closed mid-body").into());
        }
    }

    Ok(TunneledRequest {
        subdomain: subdomain_from_host(&host),
        method: head.method,
        path: head.path,
        wire_bytes: buffered[..total].to_vec(),
    })
}

struct Head {
    header_len: usize,
    method: String,
    path: String,
    host: Option<String>,
    content_length: Option<usize>,
    chunked: bool,
    expect_continue: bool,
}

/// Parses the header section out of `buf`, returning `None` while it is
/// still incomplete.
fn parse_head(buf: &[u8]) -> Result<Option<Head>, RequestError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(buf) {
        Ok(httparse::Status::Complete(header_len)) => {
            let mut head = Head {
                header_len,
                method: request.method.unwrap_or("").to_string(),
                path: request.path.unwrap_or("").to_string(),
                host: None,
                content_length: None,
                chunked: false,
                expect_continue: false,
            };
            for header in request.headers.iter() {
                if header.name.eq_ignore_ascii_case("host") {
                    head.host = std::str::from_utf8(header.value).ok().map(str::to_string);
                } else if header.name.eq_ignore_ascii_case("content-length") {
                    head.content_length = std::str::from_utf8(header.value)
                        .ok()
                        .and_then(|value| value.trim().parse().ok());
                } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
                    head.chunked = true;
                } else if header.name.eq_ignore_ascii_case("expect") {
                    head.expect_continue = std::str::from_utf8(header.value)
                        .map(|value| value.to_ascii_lowercase().contains("100-continue"))
                        .unwrap_or(false);
                }
            }
            Ok(Some(head))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(err) => {
            warn!("malformed request on public ingress: {err}");
            Err(RequestError::Reject {
                status: 400,
                reason: "malformed HTTP request",
            })
        }
    }
}

/// Writes a minimal self-contained HTTP/1.1 response.
pub(crate) async fn write_simple_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: u16,
    body: &str,
) -> Result<()> {
    let reason = axum::http::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("");
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\ncontent-type: text/plain; charset=utf-8\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    writer
        .write_all(response.as_bytes())
        .await
        .context("writing response")?;
    writer.flush().await.context("flushing response")?;
    Ok(())
}
