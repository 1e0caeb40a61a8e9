//! Transport racing: when direct TCP cannot connect, the hole-punched
//! TCP path wins and carries the request, and the losing attempts are
//! abandoned.

mod common;

use chorus::{GatewayConfig, GatewayServer};
use common::*;

#[tokio::test(flavor = "multi_thread")]
#[ntest::timeout(60000)]
async fn stunt_wins_when_direct_tcp_stalls() {
    let hub = Hub::new();
    let (router_a, _invites_a) = hub.join("a@example.com");
    let (router_b, invites_b) = hub.join("b@example.com");
    // Dead STUN servers: the UDP path cannot characterize, so the
    // race is decided by hole-punched TCP.
    let ctx_a = make_context("a@example.com", router_a, dead_stun(), Vec::new());
    let ctx_b = make_context("b@example.com", router_b, dead_stun(), Vec::new());

    let library = b"<plist>punched</plist>".to_vec();
    spawn_responder(ctx_b, invites_b, library.clone(), true);

    // The published address is a blackhole; direct TCP never
    // completes.
    let mut config = GatewayConfig::for_peer(
        "b@example.com",
        vec!["203.0.113.1:9".parse().unwrap()],
    );
    config.remote_supports_turn = false;
    let gateway = GatewayServer::open(config, ctx_a).await.unwrap();

    let (head, body) = http_get(gateway.local_port(), "/library.xml").await;
    assert_eq!(status_code(&head), 200);
    assert_eq!(body, library);

    let counters = gateway.counters();
    assert_eq!(counters.stunt_ok, 1, "the punched connection won");
    assert_eq!(counters.tcp_ok, 0, "direct TCP never succeeded");
    assert_eq!(counters.turn_ok, 0);
}

#[tokio::test(flavor = "multi_thread")]
#[ntest::timeout(60000)]
async fn stun_pseudo_tcp_carries_requests_when_stunt_is_refused() {
    let hub = Hub::new();
    let servers = start_fake_stun().await;
    let (router_a, _invites_a) = hub.join("a@example.com");
    let (router_b, invites_b) = hub.join("b@example.com");
    let ctx_a = make_context("a@example.com", router_a, servers.clone(), Vec::new());
    let ctx_b = make_context("b@example.com", router_b, servers, Vec::new());

    let library: Vec<u8> = (0..8 * 1024).map(|i| (i % 249) as u8).collect();
    // The peer refuses hole-punched TCP, leaving the UDP path.
    spawn_responder(ctx_b, invites_b, library.clone(), false);

    let mut config = GatewayConfig::for_peer("b@example.com", Vec::new());
    config.remote_supports_turn = false;
    let gateway = GatewayServer::open(config, ctx_a).await.unwrap();

    let (head, body) = http_get(gateway.local_port(), "/library.xml").await;
    assert_eq!(status_code(&head), 200);
    assert_eq!(body, library);

    let counters = gateway.counters();
    assert_eq!(counters.stun_ok, 1);
    assert_eq!(counters.stunt_fail, 1, "the refused punch was counted");
    assert_eq!(counters.tcp_ok, 0);
}
