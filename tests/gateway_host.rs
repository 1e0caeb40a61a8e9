//! Gateway scenarios against a plain TCP library server: direct
//! transfer, keep-alive stream reuse, and 401 interception.

mod common;

use chorus::{GatewayConfig, GatewayServer};
use common::*;
use md5::{Digest as _, Md5};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

#[tokio::test(flavor = "multi_thread")]
#[ntest::timeout(60000)]
async fn one_mib_get_over_direct_tcp() {
    let expected: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    let (port, connections) = start_tcp_library(expected.clone()).await;

    let hub = Hub::new();
    let (router, _invites) = hub.join("local@example.com");
    let ctx = make_context("local@example.com", router, dead_stun(), Vec::new());

    let gateway = GatewayServer::open(GatewayConfig::for_host("127.0.0.1", port), ctx)
        .await
        .unwrap();

    let (head, body) = http_get(gateway.local_port(), "/library.xml").await;
    assert_eq!(status_code(&head), 200);
    assert_eq!(body, expected);

    let counters = gateway.counters();
    assert_eq!(counters.tcp_ok, 1);
    assert_eq!(counters.tcp_fail, 0);
    assert_eq!(counters.stunt_ok + counters.stun_ok + counters.turn_ok, 0);
    assert_eq!(connections.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
#[ntest::timeout(60000)]
async fn keep_alive_reuses_one_remote_stream() {
    let body_bytes = b"<plist>library</plist>".to_vec();
    let (port, connections) = start_tcp_library(body_bytes.clone()).await;

    let hub = Hub::new();
    let (router, _invites) = hub.join("local@example.com");
    let ctx = make_context("local@example.com", router, dead_stun(), Vec::new());
    let gateway = GatewayServer::open(GatewayConfig::for_host("127.0.0.1", port), ctx)
        .await
        .unwrap();

    // Two requests on one local connection: the remote stream is kept
    // because the responses are Content-Length framed and keep-alive.
    let mut stream = TcpStream::connect(("127.0.0.1", gateway.local_port()))
        .await
        .unwrap();
    let mut buffer = Vec::new();
    let (_, first) = get_on(&mut stream, &mut buffer, "/a", "").await;
    let (_, second) = get_on(&mut stream, &mut buffer, "/b", "").await;
    assert_eq!(first, body_bytes);
    assert_eq!(second, body_bytes);
    assert_eq!(
        connections.load(Ordering::SeqCst),
        1,
        "both requests used the same upstream connection"
    );
}

#[tokio::test(flavor = "multi_thread")]
#[ntest::timeout(60000)]
async fn connection_close_responses_are_not_reused() {
    // A server that answers with Connection: close and then hangs up.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buffer = Vec::new();
                if read_http_head(&mut stream, &mut buffer).await.is_some() {
                    let _ = stream
                        .write_all(
                            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
                        )
                        .await;
                }
            });
        }
    });

    let hub = Hub::new();
    let (router, _invites) = hub.join("local@example.com");
    let ctx = make_context("local@example.com", router, dead_stun(), Vec::new());
    let gateway = GatewayServer::open(GatewayConfig::for_host("127.0.0.1", port), ctx)
        .await
        .unwrap();

    let mut stream = TcpStream::connect(("127.0.0.1", gateway.local_port()))
        .await
        .unwrap();
    let mut buffer = Vec::new();
    let (_, first) = get_on(&mut stream, &mut buffer, "/a", "").await;
    let (_, second) = get_on(&mut stream, &mut buffer, "/b", "").await;
    assert_eq!(first, b"ok");
    assert_eq!(second, b"ok");
    assert_eq!(
        connections.load(Ordering::SeqCst),
        2,
        "a closed response must not return the stream to the pool"
    );
}

/// A library server that requires authentication. The first request
/// gets the challenge; a request carrying an acceptable Authorization
/// header gets the body.
async fn start_auth_library(
    challenge: &'static str,
    check: impl Fn(Option<String>) -> bool + Send + Sync + 'static,
    body: &'static [u8],
    always_reject: bool,
) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let check = Arc::new(check);
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let check = check.clone();
            tokio::spawn(async move {
                let mut buffer = Vec::new();
                while let Some(head) = read_http_head(&mut stream, &mut buffer).await {
                    let authorization = header_value(&head, "Authorization");
                    let authorized = !always_reject && check(authorization);
                    let response = if authorized {
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
                            body.len()
                        )
                        .into_bytes()
                        .into_iter()
                        .chain(body.iter().copied())
                        .collect::<Vec<u8>>()
                    } else {
                        format!(
                            "HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: {challenge}\r\nContent-Length: 0\r\n\r\n"
                        )
                        .into_bytes()
                    };
                    if stream.write_all(&response).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    port
}

#[tokio::test(flavor = "multi_thread")]
#[ntest::timeout(60000)]
async fn basic_challenge_is_answered_transparently() {
    let port = start_auth_library(
        r#"Basic realm="library""#,
        |authorization| authorization.as_deref() == Some("Basic YWxpY2U6c2VjcmV0"),
        b"the goods",
        false,
    )
    .await;

    let hub = Hub::new();
    let (router, _invites) = hub.join("local@example.com");
    let ctx = make_context("local@example.com", router, dead_stun(), Vec::new());
    let config =
        GatewayConfig::for_host("127.0.0.1", port).with_credentials("alice", "secret");
    let gateway = GatewayServer::open(config, ctx).await.unwrap();

    let (head, body) = http_get(gateway.local_port(), "/secure.xml").await;
    assert_eq!(status_code(&head), 200);
    assert_eq!(body, b"the goods");
}

#[tokio::test(flavor = "multi_thread")]
#[ntest::timeout(60000)]
async fn digest_challenge_is_answered_with_a_valid_response() {
    let port = start_auth_library(
        r#"Digest realm="r", nonce="n", qop="auth""#,
        |authorization| {
            let Some(value) = authorization else {
                return false;
            };
            let field = |name: &str| -> Option<String> {
                let start = value.find(&format!("{name}="))? + name.len() + 1;
                let rest = &value[start..];
                Some(if let Some(stripped) = rest.strip_prefix('"') {
                    stripped[..stripped.find('"')?].to_string()
                } else {
                    rest.split([',', ' ']).next()?.to_string()
                })
            };
            let (Some(username), Some(uri), Some(cnonce), Some(nc), Some(response)) = (
                field("username"),
                field("uri"),
                field("cnonce"),
                field("nc"),
                field("response"),
            ) else {
                return false;
            };
            if username != "alice" || uri != "/secure.xml" {
                return false;
            }
            let ha1 = md5_hex("alice:r:secret");
            let ha2 = md5_hex(&format!("GET:{uri}"));
            let expected = md5_hex(&format!("{ha1}:n:{nc}:{cnonce}:auth:{ha2}"));
            response == expected
        },
        b"digest body",
        false,
    )
    .await;

    let hub = Hub::new();
    let (router, _invites) = hub.join("local@example.com");
    let ctx = make_context("local@example.com", router, dead_stun(), Vec::new());
    let config =
        GatewayConfig::for_host("127.0.0.1", port).with_credentials("alice", "secret");
    let gateway = GatewayServer::open(config, ctx).await.unwrap();

    let (head, body) = http_get(gateway.local_port(), "/secure.xml").await;
    assert_eq!(status_code(&head), 200);
    assert_eq!(body, b"digest body");
}

#[tokio::test(flavor = "multi_thread")]
#[ntest::timeout(60000)]
async fn second_401_surfaces_as_a_gateway_error() {
    let port = start_auth_library(
        r#"Basic realm="library""#,
        |_| false,
        b"never",
        true,
    )
    .await;

    let hub = Hub::new();
    let (router, _invites) = hub.join("local@example.com");
    let ctx = make_context("local@example.com", router, dead_stun(), Vec::new());
    let config =
        GatewayConfig::for_host("127.0.0.1", port).with_credentials("alice", "wrong");
    let gateway = GatewayServer::open(config, ctx).await.unwrap();

    let (head, _body) = http_get(gateway.local_port(), "/secure.xml").await;
    assert_eq!(status_code(&head), 502);
}

#[tokio::test(flavor = "multi_thread")]
#[ntest::timeout(60000)]
async fn unreachable_host_is_a_gateway_error() {
    // A port that was just closed: connecting fails.
    let closed_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let hub = Hub::new();
    let (router, _invites) = hub.join("local@example.com");
    let ctx = make_context("local@example.com", router, dead_stun(), Vec::new());
    let gateway = GatewayServer::open(GatewayConfig::for_host("127.0.0.1", closed_port), ctx)
        .await
        .unwrap();

    let mut stream = TcpStream::connect(("127.0.0.1", gateway.local_port()))
        .await
        .unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let mut buffer = Vec::new();
    let head = read_http_head(&mut stream, &mut buffer).await.unwrap();
    assert_eq!(status_code(&head), 502);
    assert_eq!(gateway.counters().tcp_fail, 1);

    // The error response closes the connection.
    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest).await;
}
