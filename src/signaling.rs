//! The signaling plane: typed STUN/STUNT/TURN messages carried as XML
//! elements over an external chat channel, and the router that
//! dispatches inbound messages to the sessions that own them.
//!
//! The transport core never talks to the chat service itself. It hands
//! outbound envelopes to a [`SignalingChannel`] and is fed inbound ones
//! through [`SignalingRouter::on_envelope`].

use crate::protocols::stun::nat::RouterType;
use crate::FxDashMap;
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use thiserror::Error as ThisError;
use tokio::sync::mpsc;

pub mod xml;
use xml::Element;

pub const STUN_NAMESPACE: &str = "http://deusty.com/protocol/stun";
pub const STUNT_NAMESPACE: &str = "http://deusty.com/protocol/stunt";
pub const BYTESTREAMS_NAMESPACE: &str = "http://jabber.org/protocol/bytestreams";

/// Protocol revision carried by every signaling message.
pub const SIGNALING_VERSION: &str = "1.0";

#[derive(Debug, ThisError)]
pub enum SignalingError {
    #[error("malformed signaling payload: {0}")]
    Malformed(String),
    #[error("the signaling channel is closed")]
    ChannelClosed,
    #[error("signaling message is not one this core understands")]
    Unrecognized,
}

/// Outbound half of the chat channel. Implementations wrap the XMPP
/// client (or a test double) and must not block.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send_envelope(&self, to: &str, xml: String) -> Result<(), SignalingError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunSignalKind {
    Invite,
    Accept,
    Error,
}

/// The STUN invite/reply payload: each side tells the other what its
/// router does and where to aim the hole punch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunSignal {
    pub to: String,
    pub from: String,
    pub kind: StunSignalKind,
    pub uuid: String,
    pub version: String,
    pub router_type: RouterType,
    pub ip: Option<IpAddr>,
    pub port: Option<u16>,
    pub port_range: Option<(u16, u16)>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuntSignalKind {
    Start,
    Ack,
    Error,
}

/// The STUNT exchange payload: external addresses and the ports each
/// side will listen on and dial from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StuntSignal {
    pub to: String,
    pub from: String,
    pub kind: StuntSignalKind,
    pub uuid: String,
    pub version: String,
    pub ip4: Option<Ipv4Addr>,
    pub ip6: Option<Ipv6Addr>,
    pub predicted_port: Option<u16>,
    pub server_port: Option<u16>,
    pub error: Option<String>,
}

/// A candidate SOCKS5 proxy named by its service identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Streamhost {
    pub jid: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnSignalKind {
    Start,
    StreamhostUsed,
    Activate,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnSignal {
    pub to: String,
    pub from: String,
    pub kind: TurnSignalKind,
    pub uuid: String,
    pub streamhosts: Vec<Streamhost>,
    pub streamhost_jid: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    Stun(StunSignal),
    Stunt(StuntSignal),
    Turn(TurnSignal),
}

impl SignalingMessage {
    pub fn uuid(&self) -> &str {
        match self {
            SignalingMessage::Stun(signal) => &signal.uuid,
            SignalingMessage::Stunt(signal) => &signal.uuid,
            SignalingMessage::Turn(signal) => &signal.uuid,
        }
    }

    pub fn from_jid(&self) -> &str {
        match self {
            SignalingMessage::Stun(signal) => &signal.from,
            SignalingMessage::Stunt(signal) => &signal.from,
            SignalingMessage::Turn(signal) => &signal.from,
        }
    }

    fn to_jid(&self) -> &str {
        match self {
            SignalingMessage::Stun(signal) => &signal.to,
            SignalingMessage::Stunt(signal) => &signal.to,
            SignalingMessage::Turn(signal) => &signal.to,
        }
    }

    /// Whether this message opens a new session on the receiving side.
    pub fn is_new_start(&self) -> bool {
        self.is_new_start_stun() || self.is_new_start_stunt() || self.is_new_start_turn()
    }

    pub fn is_new_start_stun(&self) -> bool {
        matches!(
            self,
            SignalingMessage::Stun(StunSignal {
                kind: StunSignalKind::Invite,
                ..
            })
        )
    }

    pub fn is_new_start_stunt(&self) -> bool {
        matches!(
            self,
            SignalingMessage::Stunt(StuntSignal {
                kind: StuntSignalKind::Start,
                ..
            })
        )
    }

    pub fn is_new_start_turn(&self) -> bool {
        matches!(
            self,
            SignalingMessage::Turn(TurnSignal {
                kind: TurnSignalKind::Start,
                ..
            })
        )
    }

    pub fn to_element(&self) -> Element {
        match self {
            SignalingMessage::Stun(signal) => {
                let mut element = Element::new("stun");
                element.set_attribute("xmlns", STUN_NAMESPACE);
                element.set_attribute(
                    "type",
                    match signal.kind {
                        StunSignalKind::Invite => "invite",
                        StunSignalKind::Accept => "accept",
                        StunSignalKind::Error => "error",
                    },
                );
                element.set_attribute("to", &signal.to);
                element.set_attribute("from", &signal.from);
                element.set_attribute("uuid", &signal.uuid);
                element.set_attribute("version", &signal.version);
                element.add_text_child("routerType", signal.router_type.code().to_string());
                if let Some(ip) = signal.ip {
                    element.add_text_child("ip", ip.to_string());
                }
                if let Some(port) = signal.port {
                    element.add_text_child("port", port.to_string());
                }
                if let Some((start, end)) = signal.port_range {
                    let mut range = Element::new("portRange");
                    range.set_attribute("start", start.to_string());
                    range.set_attribute("end", end.to_string());
                    element.add_child(range);
                }
                if let Some(error) = &signal.error {
                    element.add_text_child("error", error.clone());
                }
                element
            }
            SignalingMessage::Stunt(signal) => {
                let mut element = Element::new("stunt");
                element.set_attribute("xmlns", STUNT_NAMESPACE);
                element.set_attribute(
                    "type",
                    match signal.kind {
                        StuntSignalKind::Start => "start_stunt",
                        StuntSignalKind::Ack => "start_stunt_ack",
                        StuntSignalKind::Error => "error",
                    },
                );
                element.set_attribute("to", &signal.to);
                element.set_attribute("from", &signal.from);
                element.set_attribute("uuid", &signal.uuid);
                element.set_attribute("version", &signal.version);
                if let Some(ip4) = signal.ip4 {
                    element.add_text_child("ip4", ip4.to_string());
                }
                if let Some(ip6) = signal.ip6 {
                    element.add_text_child("ip6", ip6.to_string());
                }
                if let Some(port) = signal.predicted_port {
                    element.add_text_child("predictedPort", port.to_string());
                }
                if let Some(port) = signal.server_port {
                    element.add_text_child("serverPort", port.to_string());
                }
                if let Some(error) = &signal.error {
                    element.add_text_child("error", error.clone());
                }
                element
            }
            SignalingMessage::Turn(signal) => {
                let mut element = Element::new("turn");
                element.set_attribute("xmlns", BYTESTREAMS_NAMESPACE);
                element.set_attribute(
                    "type",
                    match signal.kind {
                        TurnSignalKind::Start => "start_turn",
                        TurnSignalKind::StreamhostUsed => "streamhost_used",
                        TurnSignalKind::Activate => "activate",
                        TurnSignalKind::Error => "error",
                    },
                );
                element.set_attribute("to", &signal.to);
                element.set_attribute("from", &signal.from);
                element.set_attribute("uuid", &signal.uuid);
                element.set_attribute("version", SIGNALING_VERSION);
                for streamhost in &signal.streamhosts {
                    let mut host = Element::new("streamhost");
                    host.set_attribute("jid", &streamhost.jid);
                    host.set_attribute("host", &streamhost.host);
                    host.set_attribute("port", streamhost.port.to_string());
                    element.add_child(host);
                }
                if let Some(jid) = &signal.streamhost_jid {
                    let mut used = Element::new("streamhost-used");
                    used.set_attribute("jid", jid);
                    element.add_child(used);
                }
                if let Some(error) = &signal.error {
                    element.add_text_child("error", error.clone());
                }
                element
            }
        }
    }

    pub fn from_element(from: &str, element: &Element) -> Result<Self, SignalingError> {
        let malformed = |what: &str| SignalingError::Malformed(what.to_string());
        let uuid = element
            .attribute("uuid")
            .ok_or_else(|| malformed("missing uuid"))?
            .to_string();
        let to = element.attribute("to").unwrap_or_default().to_string();
        let version = element
            .attribute("version")
            .unwrap_or(SIGNALING_VERSION)
            .to_string();
        let kind_name = element
            .attribute("type")
            .ok_or_else(|| malformed("missing type"))?;
        let error = element.child_text("error").map(str::to_string);

        match element.name.as_str() {
            "stun" => {
                let kind = match kind_name {
                    "invite" => StunSignalKind::Invite,
                    "accept" => StunSignalKind::Accept,
                    "error" => StunSignalKind::Error,
                    _ => return Err(SignalingError::Unrecognized),
                };
                let router_type = element
                    .child_text("routerType")
                    .and_then(|text| text.parse::<i8>().ok())
                    .map(RouterType::from_code)
                    .unwrap_or(RouterType::Unknown);
                let ip = element.child_text("ip").and_then(|text| text.parse().ok());
                let port = element
                    .child_text("port")
                    .and_then(|text| text.parse().ok());
                let port_range = element.child("portRange").and_then(|range| {
                    let start = range.attribute("start")?.parse().ok()?;
                    let end = range.attribute("end")?.parse().ok()?;
                    Some((start, end))
                });
                Ok(SignalingMessage::Stun(StunSignal {
                    to,
                    from: from.to_string(),
                    kind,
                    uuid,
                    version,
                    router_type,
                    ip,
                    port,
                    port_range,
                    error,
                }))
            }
            "stunt" => {
                let kind = match kind_name {
                    "start_stunt" => StuntSignalKind::Start,
                    "start_stunt_ack" => StuntSignalKind::Ack,
                    "error" => StuntSignalKind::Error,
                    _ => return Err(SignalingError::Unrecognized),
                };
                Ok(SignalingMessage::Stunt(StuntSignal {
                    to,
                    from: from.to_string(),
                    kind,
                    uuid,
                    version,
                    ip4: element.child_text("ip4").and_then(|text| text.parse().ok()),
                    ip6: element.child_text("ip6").and_then(|text| text.parse().ok()),
                    predicted_port: element
                        .child_text("predictedPort")
                        .and_then(|text| text.parse().ok()),
                    server_port: element
                        .child_text("serverPort")
                        .and_then(|text| text.parse().ok()),
                    error,
                }))
            }
            "turn" => {
                let kind = match kind_name {
                    "start_turn" => TurnSignalKind::Start,
                    "streamhost_used" => TurnSignalKind::StreamhostUsed,
                    "activate" => TurnSignalKind::Activate,
                    "error" => TurnSignalKind::Error,
                    _ => return Err(SignalingError::Unrecognized),
                };
                let streamhosts = element
                    .children_named("streamhost")
                    .filter_map(|host| {
                        Some(Streamhost {
                            jid: host.attribute("jid")?.to_string(),
                            host: host.attribute("host")?.to_string(),
                            port: host.attribute("port")?.parse().ok()?,
                        })
                    })
                    .collect();
                let streamhost_jid = element
                    .child("streamhost-used")
                    .and_then(|used| used.attribute("jid"))
                    .map(str::to_string);
                Ok(SignalingMessage::Turn(TurnSignal {
                    to,
                    from: from.to_string(),
                    kind,
                    uuid,
                    streamhosts,
                    streamhost_jid,
                    error,
                }))
            }
            _ => Err(SignalingError::Unrecognized),
        }
    }
}

/// Routes inbound signaling messages to sessions by uuid. Messages
/// that open a new session are forwarded to the invite queue so the
/// application can spawn a responder.
pub struct SignalingRouter {
    channel: Arc<dyn SignalingChannel>,
    sessions: FxDashMap<String, mpsc::Sender<SignalingMessage>>,
    invites: mpsc::Sender<SignalingMessage>,
}

impl SignalingRouter {
    pub fn new(
        channel: Arc<dyn SignalingChannel>,
    ) -> (Arc<Self>, mpsc::Receiver<SignalingMessage>) {
        let (invites, invite_rx) = mpsc::channel(16);
        (
            Arc::new(Self {
                channel,
                sessions: Default::default(),
                invites,
            }),
            invite_rx,
        )
    }

    /// Feeds one envelope from the chat channel into the core.
    pub async fn on_envelope(&self, from: &str, xml: &str) -> Result<(), SignalingError> {
        let element =
            Element::parse(xml).map_err(|error| SignalingError::Malformed(error.to_string()))?;
        let message = SignalingMessage::from_element(from, &element)?;
        let uuid = message.uuid().to_string();
        if let Some(session) = self.sessions.get(&uuid) {
            if session.send(message).await.is_err() {
                tracing::debug!(%uuid, "session receiver dropped before delivery");
            }
            return Ok(());
        }
        if message.is_new_start() {
            self.invites
                .send(message)
                .await
                .map_err(|_| SignalingError::ChannelClosed)?;
            return Ok(());
        }
        tracing::debug!(%uuid, "no session registered for signaling message");
        Ok(())
    }

    /// Claims the given session uuid; subsequent messages carrying it
    /// are delivered to the returned receiver.
    pub fn register(&self, uuid: &str) -> mpsc::Receiver<SignalingMessage> {
        let (tx, rx) = mpsc::channel(8);
        self.sessions.insert(uuid.to_string(), tx);
        rx
    }

    pub fn unregister(&self, uuid: &str) {
        self.sessions.remove(uuid);
    }

    /// Serializes and sends a message over the chat channel.
    pub async fn send(&self, message: &SignalingMessage) -> Result<(), SignalingError> {
        self.channel
            .send_envelope(message.to_jid(), message.to_element().to_xml())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stun_invite() -> SignalingMessage {
        SignalingMessage::Stun(StunSignal {
            to: "peer@example.com/mojo".into(),
            from: "me@example.com/mojo".into(),
            kind: StunSignalKind::Invite,
            uuid: "u-1".into(),
            version: SIGNALING_VERSION.into(),
            router_type: RouterType::SymmetricPortRestricted,
            ip: Some("203.0.113.7".parse().unwrap()),
            port: Some(40_009),
            port_range: Some((39_999, 40_019)),
            error: None,
        })
    }

    #[test]
    fn stun_signal_round_trips() {
        let message = stun_invite();
        let element = message.to_element();
        assert_eq!(element.attribute("xmlns"), Some(STUN_NAMESPACE));
        let parsed = SignalingMessage::from_element("me@example.com/mojo", &element).unwrap();
        assert_eq!(parsed, message);
        assert!(parsed.is_new_start_stun());
        assert!(!parsed.is_new_start_stunt());
    }

    #[test]
    fn stunt_signal_round_trips() {
        let message = SignalingMessage::Stunt(StuntSignal {
            to: "peer@example.com".into(),
            from: "me@example.com".into(),
            kind: StuntSignalKind::Start,
            uuid: "u-2".into(),
            version: SIGNALING_VERSION.into(),
            ip4: Some("198.51.100.4".parse().unwrap()),
            ip6: None,
            predicted_port: Some(40_009),
            server_port: Some(5_299),
            error: None,
        });
        let parsed =
            SignalingMessage::from_element("me@example.com", &message.to_element()).unwrap();
        assert_eq!(parsed, message);
        assert!(parsed.is_new_start_stunt());
    }

    #[test]
    fn turn_signal_round_trips() {
        let message = SignalingMessage::Turn(TurnSignal {
            to: "peer@example.com".into(),
            from: "me@example.com".into(),
            kind: TurnSignalKind::Start,
            uuid: "u-3".into(),
            streamhosts: vec![
                Streamhost {
                    jid: "proxy64.example.com".into(),
                    host: "192.0.2.8".into(),
                    port: 7777,
                },
                Streamhost {
                    jid: "proxy64.backup.example.com".into(),
                    host: "192.0.2.9".into(),
                    port: 7777,
                },
            ],
            streamhost_jid: None,
            error: None,
        });
        let parsed =
            SignalingMessage::from_element("me@example.com", &message.to_element()).unwrap();
        assert_eq!(parsed, message);
        assert!(parsed.is_new_start_turn());
    }

    #[tokio::test]
    async fn router_delivers_by_uuid_and_queues_invites() {
        struct Discard;
        #[async_trait]
        impl SignalingChannel for Discard {
            async fn send_envelope(&self, _to: &str, _xml: String) -> Result<(), SignalingError> {
                Ok(())
            }
        }

        let (router, mut invites) = SignalingRouter::new(Arc::new(Discard));
        let invite_xml = stun_invite().to_element().to_xml();

        // Unclaimed invite lands on the invite queue.
        router
            .on_envelope("me@example.com/mojo", &invite_xml)
            .await
            .unwrap();
        let queued = invites.recv().await.unwrap();
        assert_eq!(queued.uuid(), "u-1");

        // A registered session receives messages for its uuid instead.
        let mut session_rx = router.register("u-1");
        router
            .on_envelope("me@example.com/mojo", &invite_xml)
            .await
            .unwrap();
        let delivered = session_rx.recv().await.unwrap();
        assert_eq!(delivered.uuid(), "u-1");

        router.unregister("u-1");
    }
}
