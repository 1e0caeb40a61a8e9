//! A reliable, in-order, flow- and congestion-controlled byte stream
//! over a single UDP socket.
//!
//! The state machine lives in [`engine`] and owns no I/O. This module
//! provides [`PseudoTcpStream`], which spawns a driver task that owns
//! the UDP socket, pumps the engine, and exposes the connection as an
//! ordinary async byte stream.

use crate::config::Config;
use crate::payload::Payload;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

pub mod packet;
pub use packet::Packet;

mod serial;

mod engine;
pub use engine::{PseudoTcp, PseudoTcpError, State, StreamEvent};

/// In-memory buffering between the driver task and the stream handle.
const PIPE_CAPACITY: usize = 256 * 1024;

/// One PseudoTcp connection, readable and writable like any socket.
///
/// Shutting down the write half drains buffered data and follows with
/// a FIN; dropping the stream does the same. [`PseudoTcpStream::abort`]
/// hard-closes the connection instead, resetting the peer if data is
/// still unacknowledged.
pub struct PseudoTcpStream {
    io: DuplexStream,
    cancel: CancellationToken,
    error: watch::Receiver<Option<PseudoTcpError>>,
}

impl PseudoTcpStream {
    /// Opens a connection to `peer` by sending a SYN from `socket`.
    /// Resolves once the handshake completes.
    pub async fn connect(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        config: &Config,
    ) -> Result<Self, PseudoTcpError> {
        socket
            .connect(peer)
            .await
            .map_err(|_| PseudoTcpError::PeerUnreachable)?;
        let engine = PseudoTcp::active_open(config, rand::random());
        Self::start(engine, socket).await
    }

    /// Waits for `peer` to open a connection through `socket` and
    /// completes the handshake.
    pub async fn accept(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        config: &Config,
    ) -> Result<Self, PseudoTcpError> {
        socket
            .connect(peer)
            .await
            .map_err(|_| PseudoTcpError::PeerUnreachable)?;
        let engine = PseudoTcp::passive_open(config, rand::random());
        Self::start(engine, socket).await
    }

    async fn start(engine: PseudoTcp, socket: Arc<UdpSocket>) -> Result<Self, PseudoTcpError> {
        let (user_io, driver_io) = tokio::io::duplex(PIPE_CAPACITY);
        let (opened_tx, opened_rx) = oneshot::channel();
        let (error_tx, error_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let driver_cancel = cancel.clone();
        tokio::spawn(async move {
            drive(engine, socket, driver_io, driver_cancel, error_tx, opened_tx).await;
        });
        match opened_rx.await {
            Ok(Ok(())) => Ok(Self {
                io: user_io,
                cancel,
                error: error_rx,
            }),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(PseudoTcpError::Canceled),
        }
    }

    /// Hard close: cancels the driver, which resets the peer if data
    /// is outstanding.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// The error that closed the connection, if it ended abnormally.
    pub fn take_error(&self) -> Option<PseudoTcpError> {
        self.error.borrow().clone()
    }
}

impl AsyncRead for PseudoTcpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for PseudoTcpStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// The reactor for one connection: owns the UDP socket, moves datagrams
/// in and out of the engine, runs its timers, and bridges application
/// bytes through the in-memory pipe.
async fn drive(
    mut engine: PseudoTcp,
    socket: Arc<UdpSocket>,
    mut io: DuplexStream,
    cancel: CancellationToken,
    error_tx: watch::Sender<Option<PseudoTcpError>>,
    opened_tx: oneshot::Sender<Result<(), PseudoTcpError>>,
) {
    let mut opened_tx = Some(opened_tx);
    let mut datagram = vec![0u8; 65_536];
    let mut app_buf = vec![0u8; 16 * 1024];
    let mut last_tick = Instant::now();
    let mut write_side_done = false;
    let mut eof_delivered = false;

    loop {
        for packet in engine.packets() {
            if let Err(error) = socket.send(&packet.encode()).await {
                tracing::trace!(%error, "dropped outgoing datagram");
            }
        }

        if engine.has_bytes_available() {
            let data = engine.receive().to_vec();
            if io.write_all(&data).await.is_err() {
                // The handle is gone; nobody will read these bytes.
                engine.abort();
            }
        }

        if engine.at_eof() && !eof_delivered {
            eof_delivered = true;
            let _ = io.shutdown().await;
        }

        while let Some(event) = engine.poll_event() {
            match event {
                StreamEvent::Opened => {
                    if let Some(tx) = opened_tx.take() {
                        let _ = tx.send(Ok(()));
                    }
                }
                StreamEvent::WillClose(error) => {
                    error_tx.send_replace(Some(error.clone()));
                    if let Some(tx) = opened_tx.take() {
                        let _ = tx.send(Err(error));
                    }
                }
                StreamEvent::DidClose => {
                    for packet in engine.packets() {
                        let _ = socket.send(&packet.encode()).await;
                    }
                    return;
                }
                StreamEvent::BytesAvailable | StreamEvent::CanAcceptBytes => {}
            }
        }

        let accept_capacity = engine.can_accept_bytes() && !write_side_done;
        let read_cap = engine.accept_capacity().min(app_buf.len());
        let wake = engine.next_wake();

        tokio::select! {
            _ = cancel.cancelled() => {
                engine.abort();
                for packet in engine.packets() {
                    let _ = socket.send(&packet.encode()).await;
                }
                return;
            }
            received = socket.recv(&mut datagram) => {
                if let Ok(n) = received {
                    match Packet::decode(&datagram[..n]) {
                        Ok(packet) => engine.packet_arrives(packet),
                        Err(error) => tracing::trace!(%error, "discarded undecodable datagram"),
                    }
                }
            }
            read = io.read(&mut app_buf[..read_cap]), if accept_capacity => {
                match read {
                    Ok(0) | Err(_) => {
                        write_side_done = true;
                        engine.close_after_writing();
                    }
                    Ok(n) => engine.send(Payload::new(&app_buf[..n])),
                }
            }
            _ = async {
                match wake {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => std::future::pending().await,
                }
            } => {}
        }

        let now = Instant::now();
        engine.advance_time(now - last_tick);
        last_tick = now;
    }
}
