//! PseudoTcp over real UDP sockets on loopback.

use chorus::config::Config;
use chorus::protocols::pseudo_tcp::PseudoTcpStream;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;

async fn socket_pair() -> (Arc<UdpSocket>, Arc<UdpSocket>) {
    let a = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let b = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    (a, b)
}

#[tokio::test(flavor = "multi_thread")]
#[ntest::timeout(60000)]
async fn transfers_in_both_directions() {
    let (a, b) = socket_pair().await;
    let addr_a = a.local_addr().unwrap();
    let addr_b = b.local_addr().unwrap();
    let config = Config::default();

    let upload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let download: Vec<u8> = (0..64 * 1024).map(|i| (i % 239) as u8).collect();

    let server_download = download.clone();
    let server_upload = upload.clone();
    let server_config = config.clone();
    let server = tokio::spawn(async move {
        let mut stream = PseudoTcpStream::accept(b, addr_a, &server_config)
            .await
            .unwrap();
        let mut received = vec![0u8; server_upload.len()];
        stream.read_exact(&mut received).await.unwrap();
        assert_eq!(received, server_upload);
        stream.write_all(&server_download).await.unwrap();
        stream.shutdown().await.unwrap();
    });

    let mut stream = PseudoTcpStream::connect(a, addr_b, &config).await.unwrap();
    stream.write_all(&upload).await.unwrap();
    let mut received = Vec::new();
    stream.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, download);

    server.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ntest::timeout(60000)]
async fn close_delivers_eof_after_all_bytes() {
    let (a, b) = socket_pair().await;
    let addr_a = a.local_addr().unwrap();
    let addr_b = b.local_addr().unwrap();
    let config = Config::default();

    let server = tokio::spawn({
        let config = config.clone();
        async move {
            let mut stream = PseudoTcpStream::accept(b, addr_a, &config).await.unwrap();
            stream.write_all(b"all of it").await.unwrap();
            stream.shutdown().await.unwrap();
            // Wait for the peer's close in turn.
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
        }
    });

    let mut stream = PseudoTcpStream::connect(a, addr_b, &config).await.unwrap();
    let mut received = Vec::new();
    stream.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"all of it");
    stream.shutdown().await.unwrap();
    server.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ntest::timeout(60000)]
async fn connect_without_a_listener_times_out() {
    let (a, b) = socket_pair().await;
    let addr_b = b.local_addr().unwrap();
    drop(b);
    let config = Config {
        initial_rto: std::time::Duration::from_millis(100),
        ..Config::default()
    };
    let result = PseudoTcpStream::connect(a, addr_b, &config).await;
    assert!(result.is_err());
}
