//! Relayed TCP through an XMPP bytestream proxy (XEP-0065 style).
//!
//! When every direct path fails, the two peers meet at a SOCKS5 proxy:
//! the responder connects first and names the proxy it used, the
//! initiator connects to the same one and asks the proxy to activate
//! the bridge. Both halves are plain TCP from then on.

use crate::context::TransportContext;
use crate::signaling::{
    SignalingError, SignalingMessage, Streamhost, TurnSignal, TurnSignalKind,
};
use crate::telemetry::{SessionKind, SessionReport, Validation};
use async_trait::async_trait;
use sha1::{Digest, Sha1};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error as ThisError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Outer bound on the whole session.
const SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// How long discovered streamhosts stay fresh.
const DIRECTORY_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, ThisError)]
pub enum TurnError {
    #[error("no proxy candidate is available")]
    NoProxyCandidate,
    #[error("the proxy refused the bytestream")]
    ProxyRefused,
    #[error("peer reported: {0}")]
    PeerError(String),
    #[error("timed out waiting for the peer")]
    SignalingTimeout,
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("the session was aborted")]
    Canceled,
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// Source of SOCKS5 proxy candidates. The application backs this with
/// its service-discovery query; tests use a static list.
#[async_trait]
pub trait StreamhostDirectory: Send + Sync {
    async fn streamhosts(&self) -> Vec<Streamhost>;
}

pub struct StaticStreamhosts(pub Vec<Streamhost>);

#[async_trait]
impl StreamhostDirectory for StaticStreamhosts {
    async fn streamhosts(&self) -> Vec<Streamhost> {
        self.0.clone()
    }
}

/// Caches another directory's answer for a bounded interval, so a
/// burst of TURN sessions does not re-run service discovery.
pub struct CachingStreamhosts {
    inner: Arc<dyn StreamhostDirectory>,
    cached: Mutex<Option<(Instant, Vec<Streamhost>)>>,
}

impl CachingStreamhosts {
    pub fn new(inner: Arc<dyn StreamhostDirectory>) -> Self {
        Self {
            inner,
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl StreamhostDirectory for CachingStreamhosts {
    async fn streamhosts(&self) -> Vec<Streamhost> {
        let mut cached = self.cached.lock().await;
        if let Some((at, hosts)) = cached.as_ref() {
            if at.elapsed() < DIRECTORY_TTL {
                return hosts.clone();
            }
        }
        let hosts = self.inner.streamhosts().await;
        if !hosts.is_empty() {
            *cached = Some((Instant::now(), hosts.clone()));
        }
        hosts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Target,
}

pub struct TurnSession {
    uuid: String,
    role: Role,
    peer_jid: String,
    start: Option<TurnSignal>,
    ctx: Arc<TransportContext>,
    messages: mpsc::Receiver<SignalingMessage>,
    cancel: CancellationToken,
}

impl TurnSession {
    pub fn initiate(peer_jid: impl Into<String>, ctx: Arc<TransportContext>) -> Self {
        let uuid = Uuid::new_v4().to_string();
        let messages = ctx.signaling.register(&uuid);
        Self {
            uuid,
            role: Role::Initiator,
            peer_jid: peer_jid.into(),
            start: None,
            ctx,
            messages,
            cancel: CancellationToken::new(),
        }
    }

    pub fn respond(start: TurnSignal, ctx: Arc<TransportContext>) -> Self {
        let messages = ctx.signaling.register(&start.uuid);
        Self {
            uuid: start.uuid.clone(),
            role: Role::Target,
            peer_jid: start.from.clone(),
            start: Some(start),
            ctx,
            messages,
            cancel: CancellationToken::new(),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn is_client(&self) -> bool {
        self.role == Role::Initiator
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The bytestream digest both halves present to the proxy:
    /// `hex(SHA1(sid ‖ initiator ‖ target))`.
    fn digest(&self) -> String {
        let (initiator, target) = match self.role {
            Role::Initiator => (self.ctx.local_jid.as_str(), self.peer_jid.as_str()),
            Role::Target => (self.peer_jid.as_str(), self.ctx.local_jid.as_str()),
        };
        let mut hasher = Sha1::new();
        hasher.update(self.uuid.as_bytes());
        hasher.update(initiator.as_bytes());
        hasher.update(target.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub async fn run(mut self) -> Result<TcpStream, TurnError> {
        let started = Instant::now();
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(TurnError::Canceled),
            outcome = timeout(SESSION_TIMEOUT, self.run_inner()) => {
                outcome.unwrap_or(Err(TurnError::SignalingTimeout))
            }
        };
        self.ctx.signaling.unregister(&self.uuid);
        self.ctx.reports.report(SessionReport {
            uuid: self.uuid.clone(),
            kind: SessionKind::Turn,
            success: result.is_ok(),
            cycle: 1,
            validation: Validation::None,
            duration: started.elapsed(),
            failure_reason: result.as_ref().err().map(|error| error.to_string()),
            port_mapping_protocol: None,
            via_server: true,
        });
        result
    }

    async fn run_inner(&mut self) -> Result<TcpStream, TurnError> {
        match self.role {
            Role::Initiator => self.run_initiator().await,
            Role::Target => self.run_target().await,
        }
    }

    async fn run_initiator(&mut self) -> Result<TcpStream, TurnError> {
        let streamhosts = self.ctx.streamhosts.streamhosts().await;
        if streamhosts.is_empty() {
            return Err(TurnError::NoProxyCandidate);
        }
        self.ctx
            .signaling
            .send(&SignalingMessage::Turn(TurnSignal {
                to: self.peer_jid.clone(),
                from: self.ctx.local_jid.clone(),
                kind: TurnSignalKind::Start,
                uuid: self.uuid.clone(),
                streamhosts: streamhosts.clone(),
                streamhost_jid: None,
                error: None,
            }))
            .await?;

        // The target connects first and names the proxy that worked.
        let used_jid = loop {
            let message = self
                .messages
                .recv()
                .await
                .ok_or(TurnError::SignalingTimeout)?;
            if let SignalingMessage::Turn(signal) = message {
                match signal.kind {
                    TurnSignalKind::StreamhostUsed => {
                        break signal
                            .streamhost_jid
                            .ok_or(TurnError::ProxyRefused)?;
                    }
                    TurnSignalKind::Error => {
                        return Err(TurnError::PeerError(
                            signal.error.unwrap_or_else(|| "unspecified".into()),
                        ));
                    }
                    _ => {}
                }
            }
        };
        let streamhost = streamhosts
            .iter()
            .find(|candidate| candidate.jid == used_jid)
            .ok_or(TurnError::ProxyRefused)?
            .clone();

        let mut stream = timeout(
            self.ctx.config.turn_per_candidate,
            connect_streamhost(&streamhost, &self.digest()),
        )
        .await
        .map_err(|_| TurnError::ProxyRefused)??;
        tracing::info!(uuid = %self.uuid, proxy = %streamhost.jid, "initiator half connected");

        // Ask the proxy to bridge the two halves.
        self.ctx
            .signaling
            .send(&SignalingMessage::Turn(TurnSignal {
                to: streamhost.jid.clone(),
                from: self.ctx.local_jid.clone(),
                kind: TurnSignalKind::Activate,
                uuid: self.uuid.clone(),
                streamhosts: Vec::new(),
                streamhost_jid: Some(self.peer_jid.clone()),
                error: None,
            }))
            .await?;

        stream.flush().await?;
        Ok(stream)
    }

    async fn run_target(&mut self) -> Result<TcpStream, TurnError> {
        let start = self.start.take().ok_or(TurnError::NoProxyCandidate)?;
        if start.streamhosts.is_empty() {
            self.send_error("no streamhosts offered").await;
            return Err(TurnError::NoProxyCandidate);
        }
        let digest = self.digest();
        let mut last_error = TurnError::NoProxyCandidate;
        for streamhost in &start.streamhosts {
            match timeout(
                self.ctx.config.turn_per_candidate,
                connect_streamhost(streamhost, &digest),
            )
            .await
            {
                Ok(Ok(stream)) => {
                    tracing::info!(
                        uuid = %self.uuid,
                        proxy = %streamhost.jid,
                        "target half connected"
                    );
                    self.ctx
                        .signaling
                        .send(&SignalingMessage::Turn(TurnSignal {
                            to: self.peer_jid.clone(),
                            from: self.ctx.local_jid.clone(),
                            kind: TurnSignalKind::StreamhostUsed,
                            uuid: self.uuid.clone(),
                            streamhosts: Vec::new(),
                            streamhost_jid: Some(streamhost.jid.clone()),
                            error: None,
                        }))
                        .await?;
                    return Ok(stream);
                }
                Ok(Err(error)) => {
                    tracing::debug!(proxy = %streamhost.jid, %error, "streamhost failed");
                    last_error = error;
                }
                Err(_) => {
                    tracing::debug!(proxy = %streamhost.jid, "streamhost timed out");
                    last_error = TurnError::ProxyRefused;
                }
            }
        }
        self.send_error("no streamhost reachable").await;
        Err(last_error)
    }

    async fn send_error(&self, message: &str) {
        let _ = self
            .ctx
            .signaling
            .send(&SignalingMessage::Turn(TurnSignal {
                to: self.peer_jid.clone(),
                from: self.ctx.local_jid.clone(),
                kind: TurnSignalKind::Error,
                uuid: self.uuid.clone(),
                streamhosts: Vec::new(),
                streamhost_jid: None,
                error: Some(message.to_string()),
            }))
            .await;
    }
}

/// Dials the proxy and runs the SOCKS5 handshake: NO-AUTH, then a
/// CONNECT whose destination is the domain-typed digest with port
/// zero.
async fn connect_streamhost(
    streamhost: &Streamhost,
    digest: &str,
) -> Result<TcpStream, TurnError> {
    let mut stream = TcpStream::connect((streamhost.host.as_str(), streamhost.port)).await?;

    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    if method != [0x05, 0x00] {
        return Err(TurnError::ProxyRefused);
    }

    let mut request = vec![0x05, 0x01, 0x00, 0x03, digest.len() as u8];
    request.extend_from_slice(digest.as_bytes());
    request.extend_from_slice(&[0x00, 0x00]);
    stream.write_all(&request).await?;

    let mut reply_head = [0u8; 4];
    stream.read_exact(&mut reply_head).await?;
    if reply_head[1] != 0x00 {
        return Err(TurnError::ProxyRefused);
    }
    let bound_len = match reply_head[3] {
        0x01 => 4 + 2,
        0x04 => 16 + 2,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        _ => return Err(TurnError::ProxyRefused),
    };
    let mut bound = vec![0u8; bound_len];
    stream.read_exact(&mut bound).await?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_shared_between_the_roles() {
        // SHA1("sid" ‖ "initiator@x" ‖ "target@y"), hex encoded: the
        // initiator and target must present the same username.
        let mut hasher = Sha1::new();
        hasher.update(b"sid");
        hasher.update(b"initiator@x");
        hasher.update(b"target@y");
        let expected = hex::encode(hasher.finalize());
        assert_eq!(expected.len(), 40);
        assert!(expected.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn socks5_handshake_against_a_fake_proxy() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let proxy = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            socket.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            socket.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 5];
            socket.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..4], &[0x05, 0x01, 0x00, 0x03]);
            let mut rest = vec![0u8; head[4] as usize + 2];
            socket.read_exact(&mut rest).await.unwrap();
            let domain = String::from_utf8(rest[..head[4] as usize].to_vec()).unwrap();
            assert_eq!(domain.len(), 40, "domain carries the hex digest");
            assert_eq!(&rest[rest.len() - 2..], &[0, 0], "DST.PORT is zero");

            // Success, bound to an IPv4 null address.
            socket
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            socket
        });

        let streamhost = Streamhost {
            jid: "proxy.example.com".into(),
            host: "127.0.0.1".into(),
            port: address.port(),
        };
        let digest = "a".repeat(40);
        let stream = connect_streamhost(&streamhost, &digest).await.unwrap();
        drop(stream);
        proxy.await.unwrap();
    }

    #[tokio::test]
    async fn refusal_is_reported() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            socket.read_exact(&mut greeting).await.unwrap();
            // No acceptable method.
            socket.write_all(&[0x05, 0xff]).await.unwrap();
        });
        let streamhost = Streamhost {
            jid: "proxy.example.com".into(),
            host: "127.0.0.1".into(),
            port: address.port(),
        };
        let result = connect_streamhost(&streamhost, &"b".repeat(40)).await;
        assert!(matches!(result, Err(TurnError::ProxyRefused)));
    }

    #[tokio::test]
    async fn caching_directory_reuses_the_first_answer() {
        struct Counting(std::sync::atomic::AtomicUsize);
        #[async_trait]
        impl StreamhostDirectory for Counting {
            async fn streamhosts(&self) -> Vec<Streamhost> {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                vec![Streamhost {
                    jid: "proxy".into(),
                    host: "192.0.2.1".into(),
                    port: 7777,
                }]
            }
        }
        let counting = Arc::new(Counting(Default::default()));
        let caching = CachingStreamhosts::new(counting.clone());
        assert_eq!(caching.streamhosts().await.len(), 1);
        assert_eq!(caching.streamhosts().await.len(), 1);
        assert_eq!(counting.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
