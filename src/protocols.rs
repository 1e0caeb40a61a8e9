//! The transport protocols the gateway races to reach a peer:
//! PseudoTcp for reliable streams over punched UDP paths, STUN for
//! learning what the local router does to those paths, STUNT for TCP
//! simultaneous-open hole punching, and TURN for relaying through a
//! SOCKS5 bytestream proxy when nothing direct works.

pub mod pseudo_tcp;
pub mod stun;
pub mod stunt;
pub mod turn;

pub use pseudo_tcp::PseudoTcpStream;
pub use stun::{StunServers, StunSession};
pub use stunt::StuntSession;
pub use turn::TurnSession;
