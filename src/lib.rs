//! The peer-to-peer transport core of the Chorus music-library
//! sharing application.
//!
//! Chorus lets two people browse each other's music libraries over
//! HTTP even when both sit behind home routers. Everything that makes
//! that possible lives here: a local loopback gateway accepts plain
//! HTTP connections and services them over whichever transport can
//! reach the peer, trying a direct TCP connection, TCP hole punching,
//! a reliable PseudoTcp stream over a punched UDP path, and finally a
//! relayed SOCKS5 bytestream.
//!
//! # Organization
//!
//! - [`gateway`] is the entry point: open a [`GatewayServer`] at a
//!   peer and point an HTTP client at its loopback port.
//! - [`protocols`] holds the transports the gateway races: PseudoTcp,
//!   STUN, STUNT, and TURN.
//! - [`signaling`] carries the session handshakes over an external
//!   chat channel the application provides.
//! - [`payload`], [`config`], [`telemetry`], and [`port_mapping`] are
//!   the supporting pieces: shared byte runs, tunables, diagnostic
//!   counters, and the router port-mapping facade.
//!
//! The core owns no UI, no library data, and no chat connection; it
//! consumes narrow interfaces for each and produces connected byte
//! streams.

pub mod payload;
pub use payload::Payload;

pub mod config;
pub use config::Config;

pub mod logging;

pub mod signaling;

pub mod telemetry;

pub mod port_mapping;

pub mod protocols;

pub mod connector;
pub use connector::SocketConnector;

pub mod stream;
pub use stream::{StreamKind, StreamSocket};

pub mod context;
pub use context::TransportContext;

pub mod gateway;
pub use gateway::{GatewayConfig, GatewayServer, GatewayTarget};

use dashmap::DashMap;
use std::hash::BuildHasherDefault;
pub type FxDashMap<K, V> = DashMap<K, V, BuildHasherDefault<rustc_hash::FxHasher>>;
