//! One reliable-stream type over every transport the gateway can win a
//! connection through.

use crate::protocols::pseudo_tcp::PseudoTcpStream;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Which pool a stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// A real TCP connection, direct or hole-punched.
    Tcp,
    /// PseudoTcp over a punched UDP path.
    Udp,
    /// TCP relayed through a SOCKS5 bytestream proxy.
    Proxy,
}

/// A connected, reliable, bidirectional byte stream to a peer. The
/// variants differ only in how the bytes travel; callers read and
/// write them identically.
pub enum StreamSocket {
    Tcp(TcpStream),
    PseudoTcp(PseudoTcpStream),
    Relay(TcpStream),
}

impl StreamSocket {
    pub fn kind(&self) -> StreamKind {
        match self {
            StreamSocket::Tcp(_) => StreamKind::Tcp,
            StreamSocket::PseudoTcp(_) => StreamKind::Udp,
            StreamSocket::Relay(_) => StreamKind::Proxy,
        }
    }
}

impl AsyncRead for StreamSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            StreamSocket::Tcp(stream) | StreamSocket::Relay(stream) => {
                Pin::new(stream).poll_read(cx, buf)
            }
            StreamSocket::PseudoTcp(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for StreamSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            StreamSocket::Tcp(stream) | StreamSocket::Relay(stream) => {
                Pin::new(stream).poll_write(cx, buf)
            }
            StreamSocket::PseudoTcp(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            StreamSocket::Tcp(stream) | StreamSocket::Relay(stream) => {
                Pin::new(stream).poll_flush(cx)
            }
            StreamSocket::PseudoTcp(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            StreamSocket::Tcp(stream) | StreamSocket::Relay(stream) => {
                Pin::new(stream).poll_shutdown(cx)
            }
            StreamSocket::PseudoTcp(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
