//! One accepted loopback connection: parse local requests, obtain a
//! remote stream, relay the exchange, and classify the stream for
//! reuse afterward.

use super::auth::{self, Scheme};
use super::http::{self, BodyFraming, ChunkedScanner, RequestHead, ResponseHead};
use super::{GatewayError, GatewayInner};
use crate::stream::StreamSocket;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Cap on a locally buffered request body; bodies are held in memory
/// so an authentication challenge can be answered by replaying them.
const BODY_CAP: usize = 1024 * 1024;

/// A request body in the two forms the relay needs: the raw wire bytes
/// for pass-through, and the decoded bytes for a replay that cannot
/// reuse chunked framing.
#[derive(Default)]
struct BodyPayload {
    raw: Vec<u8>,
    decoded: Vec<u8>,
}

pub(crate) async fn handle(local: TcpStream, inner: Arc<GatewayInner>) {
    let mut connection = GatewayConnection {
        local,
        local_buffer: Vec::new(),
        remote: None,
        response_started: false,
        inner,
    };
    if let Err(error) = connection.run().await {
        tracing::debug!(%error, "gateway connection ended");
    }
}

struct GatewayConnection {
    local: TcpStream,
    /// Bytes read from the local socket past the current message.
    local_buffer: Vec<u8>,
    /// A remote stream kept warm for the next request, with any bytes
    /// read past the previous response.
    remote: Option<(StreamSocket, Vec<u8>)>,
    response_started: bool,
    inner: Arc<GatewayInner>,
}

impl GatewayConnection {
    async fn run(&mut self) -> Result<(), GatewayError> {
        loop {
            let head_bytes =
                match http::read_head(&mut self.local, &mut self.local_buffer).await {
                    Ok(Some(head)) => head,
                    Ok(None) => break,
                    Err(_) => break,
                };
            let Ok(request) = RequestHead::parse(&head_bytes) else {
                self.respond_simple(400, "Bad Request").await?;
                break;
            };
            let framing = http::request_framing(&request);
            let body = match self.read_request_body(framing).await {
                Ok(body) => body,
                Err(status) => {
                    self.respond_simple(status, "Bad Request").await?;
                    break;
                }
            };
            let close_requested = request.headers.connection_close();

            self.response_started = false;
            match self.service(&request, &body).await {
                Ok(keep_local_open) => {
                    if close_requested || !keep_local_open {
                        break;
                    }
                }
                Err(error) => {
                    tracing::info!(%error, target = %request.target, "request failed");
                    let _ = self.respond_gateway_error(&error).await;
                    return Err(error);
                }
            }
        }

        // A warm remote with no stray bytes goes back to the shared
        // pool for the next connection.
        if let Some((stream, buffer)) = self.remote.take() {
            if buffer.is_empty() {
                self.inner.pool_push(stream);
            }
        }
        Ok(())
    }

    async fn read_request_body(&mut self, framing: BodyFraming) -> Result<BodyPayload, u16> {
        match framing {
            BodyFraming::None => Ok(BodyPayload::default()),
            BodyFraming::ContentLength(length) => {
                if length as usize > BODY_CAP {
                    return Err(413);
                }
                let mut raw = Vec::with_capacity(length as usize);
                while raw.len() < length as usize {
                    if !self.local_buffer.is_empty() {
                        let take = self
                            .local_buffer
                            .len()
                            .min(length as usize - raw.len());
                        raw.extend(self.local_buffer.drain(..take));
                        continue;
                    }
                    let mut chunk = [0u8; 8192];
                    let n = self.local.read(&mut chunk).await.map_err(|_| 400u16)?;
                    if n == 0 {
                        return Err(400);
                    }
                    self.local_buffer.extend_from_slice(&chunk[..n]);
                }
                Ok(BodyPayload {
                    decoded: raw.clone(),
                    raw,
                })
            }
            BodyFraming::Chunked => {
                let mut scanner = ChunkedScanner::new();
                let mut raw = Vec::new();
                let mut decoded = Vec::new();
                loop {
                    if !self.local_buffer.is_empty() {
                        let consumed = scanner
                            .feed(&self.local_buffer, Some(&mut decoded))
                            .map_err(|_| 400u16)?;
                        raw.extend(self.local_buffer.drain(..consumed));
                        if scanner.is_done() {
                            return Ok(BodyPayload { raw, decoded });
                        }
                    }
                    if raw.len() > BODY_CAP {
                        return Err(413);
                    }
                    let mut chunk = [0u8; 8192];
                    let n = self.local.read(&mut chunk).await.map_err(|_| 400u16)?;
                    if n == 0 {
                        return Err(400);
                    }
                    self.local_buffer.extend_from_slice(&chunk[..n]);
                }
            }
            BodyFraming::UntilClose => Err(400),
        }
    }

    /// Relays one request/response pair. Returns whether the local
    /// connection can carry another request: a response whose body ran
    /// to connection close has no boundary the client could see, so
    /// the local side closes with it.
    async fn service(
        &mut self,
        request: &RequestHead,
        body: &BodyPayload,
    ) -> Result<bool, GatewayError> {
        let credentials = self.inner.config.credentials();
        let mut authorization: Option<String> = None;
        let mut auth_attempted = false;
        let mut fresh_attempted = false;

        loop {
            let (mut remote, mut remote_buffer, from_pool) = self.obtain_remote().await?;

            let wire = build_wire_request(request, body, authorization.as_deref());
            let head_bytes = if remote.write_all(&wire).await.is_ok() {
                match http::read_head(&mut remote, &mut remote_buffer).await {
                    Ok(Some(head)) => Some(head),
                    _ => None,
                }
            } else {
                None
            };
            let Some(head_bytes) = head_bytes else {
                // A pooled stream may have gone stale under us; one
                // fresh connection is warranted before giving up.
                if from_pool && !fresh_attempted {
                    fresh_attempted = true;
                    continue;
                }
                return Err(GatewayError::UpstreamClosed);
            };

            let response =
                ResponseHead::parse(&head_bytes).map_err(|_| GatewayError::BadResponse)?;
            let framing = http::response_framing(&request.method, &response);

            if response.status == 401 && self.inner.config.is_secure {
                match &credentials {
                    None => {
                        tracing::info!(
                            error = %GatewayError::AuthRequired,
                            "secure gateway has no credentials; relaying the challenge"
                        );
                    }
                    Some((username, password)) => {
                        if auth_attempted {
                            let _ = pipe_body(&mut remote, &mut remote_buffer, None, framing)
                                .await;
                            return Err(GatewayError::AuthExhausted);
                        }
                        let challenge = response
                            .headers
                            .get("WWW-Authenticate")
                            .and_then(auth::parse_challenge);
                        if let Some(challenge) = challenge {
                            auth_attempted = true;
                            let drained =
                                pipe_body(&mut remote, &mut remote_buffer, None, framing)
                                    .await
                                    .unwrap_or(false);
                            authorization = Some(match challenge.scheme {
                                Scheme::Basic => auth::basic_authorization(username, password),
                                Scheme::Digest => {
                                    let cnonce = format!("{:016x}", rand::random::<u64>());
                                    auth::digest_authorization(
                                        &challenge,
                                        &request.method,
                                        &request.target,
                                        username,
                                        password,
                                        &cnonce,
                                        "00000001",
                                    )
                                }
                            });
                            if drained && !response.headers.connection_close() {
                                self.remote = Some((remote, remote_buffer));
                            }
                            continue;
                        }
                        tracing::info!("401 carried no usable challenge; relaying it");
                    }
                }
            }

            // Relay the response byte-exact.
            self.response_started = true;
            self.local
                .write_all(&head_bytes)
                .await
                .map_err(GatewayError::Io)?;
            let complete =
                pipe_body(&mut remote, &mut remote_buffer, Some(&mut self.local), framing)
                    .await?;
            self.local.flush().await.map_err(GatewayError::Io)?;

            if complete && !response.headers.connection_close() {
                self.remote = Some((remote, remote_buffer));
            }
            return Ok(framing != BodyFraming::UntilClose);
        }
    }

    async fn obtain_remote(&mut self) -> Result<(StreamSocket, Vec<u8>, bool), GatewayError> {
        if let Some((stream, buffer)) = self.remote.take() {
            return Ok((stream, buffer, true));
        }
        if let Some(stream) = self.inner.pool_pop() {
            return Ok((stream, Vec::new(), true));
        }
        let stream = super::acquire_stream(&self.inner).await?;
        Ok((stream, Vec::new(), false))
    }

    async fn respond_gateway_error(&mut self, error: &GatewayError) -> Result<(), GatewayError> {
        if self.response_started {
            // The head already went out; nothing coherent can follow.
            return Ok(());
        }
        self.respond_simple(502, &error.to_string()).await
    }

    async fn respond_simple(&mut self, status: u16, message: &str) -> Result<(), GatewayError> {
        let reason = match status {
            400 => "Bad Request",
            413 => "Payload Too Large",
            _ => "Bad Gateway",
        };
        let body = format!("{message}\n");
        let response = format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        self.local
            .write_all(response.as_bytes())
            .await
            .map_err(GatewayError::Io)?;
        let _ = self.local.flush().await;
        Ok(())
    }
}

/// The request as it goes to the remote host. The first pass forwards
/// it as received; an authentication replay strips hop-by-hop headers,
/// installs the Authorization header, and re-frames the body with a
/// plain Content-Length.
fn build_wire_request(
    request: &RequestHead,
    body: &BodyPayload,
    authorization: Option<&str>,
) -> Vec<u8> {
    match authorization {
        None => {
            let mut out = request.to_bytes();
            out.extend_from_slice(&body.raw);
            out
        }
        Some(value) => {
            let mut head = request.clone();
            head.headers.strip_hop_by_hop();
            head.headers.remove("Authorization");
            head.headers.push("Authorization", value);
            head.headers.remove("Content-Length");
            if !body.decoded.is_empty() {
                head.headers
                    .push("Content-Length", body.decoded.len().to_string());
            }
            let mut out = head.to_bytes();
            out.extend_from_slice(&body.decoded);
            out
        }
    }
}

/// Forwards (or discards, when `out` is `None`) one response body
/// according to its framing. Returns whether the stream remains
/// usable for another request: bodies that run until close never are.
async fn pipe_body(
    remote: &mut StreamSocket,
    buffer: &mut Vec<u8>,
    mut out: Option<&mut TcpStream>,
    framing: BodyFraming,
) -> Result<bool, GatewayError> {
    match framing {
        BodyFraming::None => Ok(true),
        BodyFraming::ContentLength(total) => {
            let mut remaining = total as usize;
            while remaining > 0 {
                if !buffer.is_empty() {
                    let take = buffer.len().min(remaining);
                    let bytes: Vec<u8> = buffer.drain(..take).collect();
                    if let Some(out) = out.as_deref_mut() {
                        out.write_all(&bytes).await.map_err(GatewayError::Io)?;
                    }
                    remaining -= take;
                    continue;
                }
                read_some(remote, buffer).await?;
            }
            Ok(true)
        }
        BodyFraming::Chunked => {
            let mut scanner = ChunkedScanner::new();
            loop {
                if !buffer.is_empty() {
                    let consumed = scanner
                        .feed(buffer, None)
                        .map_err(|_| GatewayError::BadResponse)?;
                    let bytes: Vec<u8> = buffer.drain(..consumed).collect();
                    if let Some(out) = out.as_deref_mut() {
                        out.write_all(&bytes).await.map_err(GatewayError::Io)?;
                    }
                    if scanner.is_done() {
                        return Ok(true);
                    }
                }
                read_some(remote, buffer).await?;
            }
        }
        BodyFraming::UntilClose => {
            loop {
                if !buffer.is_empty() {
                    let bytes: Vec<u8> = buffer.drain(..).collect();
                    if let Some(out) = out.as_deref_mut() {
                        out.write_all(&bytes).await.map_err(GatewayError::Io)?;
                    }
                }
                let mut chunk = [0u8; 16 * 1024];
                match remote.read(&mut chunk).await {
                    Ok(0) => return Ok(false),
                    Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                    Err(_) => return Ok(false),
                }
            }
        }
    }
}

async fn read_some(remote: &mut StreamSocket, buffer: &mut Vec<u8>) -> Result<(), GatewayError> {
    let mut chunk = [0u8; 16 * 1024];
    let n = remote
        .read(&mut chunk)
        .await
        .map_err(|_| GatewayError::UpstreamClosed)?;
    if n == 0 {
        return Err(GatewayError::UpstreamClosed);
    }
    buffer.extend_from_slice(&chunk[..n]);
    Ok(())
}
