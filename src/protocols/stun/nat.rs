//! Router classification and port prediction from STUN probe results.

use std::fmt::{self, Display};
use std::net::Ipv4Addr;

/// What the local router does to outbound UDP mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouterType {
    #[default]
    Unknown,
    /// No translation: the external view equals the local address.
    None,
    ConeFull,
    ConeRestricted,
    ConePortRestricted,
    SymmetricFull,
    SymmetricRestricted,
    SymmetricPortRestricted,
}

impl RouterType {
    pub fn is_symmetric(self) -> bool {
        matches!(
            self,
            RouterType::SymmetricFull
                | RouterType::SymmetricRestricted
                | RouterType::SymmetricPortRestricted
        )
    }

    /// Numeric code carried in signaling messages.
    pub fn code(self) -> i8 {
        match self {
            RouterType::Unknown => -1,
            RouterType::None => 0,
            RouterType::ConeFull => 1,
            RouterType::ConeRestricted => 2,
            RouterType::ConePortRestricted => 3,
            RouterType::SymmetricFull => 4,
            RouterType::SymmetricRestricted => 5,
            RouterType::SymmetricPortRestricted => 6,
        }
    }

    pub fn from_code(code: i8) -> Self {
        match code {
            0 => RouterType::None,
            1 => RouterType::ConeFull,
            2 => RouterType::ConeRestricted,
            3 => RouterType::ConePortRestricted,
            4 => RouterType::SymmetricFull,
            5 => RouterType::SymmetricRestricted,
            6 => RouterType::SymmetricPortRestricted,
            _ => RouterType::Unknown,
        }
    }
}

impl Display for RouterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RouterType::Unknown => "Unknown",
            RouterType::None => "None",
            RouterType::ConeFull => "Cone - Full",
            RouterType::ConeRestricted => "Cone - Restricted",
            RouterType::ConePortRestricted => "Cone - Port Restricted",
            RouterType::SymmetricFull => "Symmetric - Full",
            RouterType::SymmetricRestricted => "Symmetric - Restricted",
            RouterType::SymmetricPortRestricted => "Symmetric - Port Restricted",
        };
        write!(f, "{name}")
    }
}

/// What part of the destination influences a symmetric router's port
/// allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortAllocation {
    #[default]
    Unknown,
    /// The destination port alone selects a new mapping. Predictable.
    Port,
    /// The destination address participates as well. Not predictable.
    Address,
}

impl Display for PortAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PortAllocation::Unknown => "Unknown",
            PortAllocation::Port => "Port Sensitive",
            PortAllocation::Address => "Address Sensitive",
        };
        write!(f, "{name}")
    }
}

/// Observations from the four canonical binding probes plus the two
/// filtering probes.
#[derive(Debug, Clone)]
pub struct ProbeResults {
    pub local_address: Ipv4Addr,
    pub local_port: u16,
    /// External mappings observed against (IP_A, Port_A), (IP_A,
    /// Port_B), (IP_B, Port_A), (IP_B, Port_B), in that order.
    pub mappings: [(Ipv4Addr, u16); 4],
    /// Whether a response arrived from the alternate server address
    /// and port without having sent to it.
    pub unsolicited_received: Option<bool>,
    /// Whether a response arrived from the alternate port of the same
    /// server address.
    pub changed_port_received: Option<bool>,
}

impl ProbeResults {
    pub fn external_address(&self) -> Ipv4Addr {
        self.mappings[0].0
    }

    pub fn external_port(&self) -> u16 {
        self.mappings[0].1
    }

    fn filtering(&self, cone: bool) -> RouterType {
        match (self.unsolicited_received, self.changed_port_received) {
            (Some(true), _) => {
                if cone {
                    RouterType::ConeFull
                } else {
                    RouterType::SymmetricFull
                }
            }
            (_, Some(true)) => {
                if cone {
                    RouterType::ConeRestricted
                } else {
                    RouterType::SymmetricRestricted
                }
            }
            _ => {
                // Inconclusive probes get the conservative answer.
                if cone {
                    RouterType::ConePortRestricted
                } else {
                    RouterType::SymmetricPortRestricted
                }
            }
        }
    }

    pub fn classify(&self) -> (RouterType, PortAllocation) {
        let [p1, p2, p3, p4] = self.mappings;
        let all_equal = p1 == p2 && p2 == p3 && p3 == p4;

        if all_equal && p1.0 == self.local_address && p1.1 == self.local_port {
            return (RouterType::None, PortAllocation::Unknown);
        }
        if all_equal {
            return (self.filtering(true), PortAllocation::Unknown);
        }
        // Mappings differ per destination: symmetric. If changing only
        // the destination port already moved the mapping, the
        // allocation follows the port; otherwise the address matters.
        let allocation = if p1.1 != p2.1 {
            PortAllocation::Port
        } else {
            PortAllocation::Address
        };
        (self.filtering(false), allocation)
    }
}

/// The candidate external ports a peer should aim at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prediction {
    /// A stable mapping: one exact port.
    Exact(u16),
    /// A stride-predicted port with a tolerance range around it.
    Predicted { port: u16, range: (u16, u16) },
    /// Allocation is address-sensitive; only a range can be named.
    RangeOnly { range: (u16, u16) },
}

impl Prediction {
    pub fn port(&self) -> Option<u16> {
        match self {
            Prediction::Exact(port) => Some(*port),
            Prediction::Predicted { port, .. } => Some(*port),
            Prediction::RangeOnly { .. } => None,
        }
    }

    pub fn range(&self) -> (u16, u16) {
        match self {
            Prediction::Exact(port) => (*port, *port),
            Prediction::Predicted { range, .. } | Prediction::RangeOnly { range } => *range,
        }
    }
}

/// Half-width of the tolerance range published around a predicted
/// port.
pub const PREDICTION_SPREAD: u16 = 10;

/// Predicts the port the router will hand to the next new destination.
///
/// Symmetric routers with port-sensitive allocation move the mapping by
/// a fixed stride per destination; the stride observed between probes
/// extrapolates from the last mapping. Address-sensitive routers give
/// no point prediction, only a range around the last observation.
pub fn predict_port(results: &ProbeResults) -> Prediction {
    let (router_type, allocation) = results.classify();
    let [p1, p2, _p3, p4] = results.mappings.map(|(_, port)| port);

    if !router_type.is_symmetric() {
        return Prediction::Exact(p1);
    }
    match allocation {
        PortAllocation::Port => {
            let stride = p2.wrapping_sub(p1);
            let port = p4.wrapping_add(stride);
            Prediction::Predicted {
                port,
                range: (
                    port.saturating_sub(PREDICTION_SPREAD),
                    port.saturating_add(PREDICTION_SPREAD),
                ),
            }
        }
        _ => Prediction::RangeOnly {
            range: (
                p4.saturating_sub(PREDICTION_SPREAD),
                p4.saturating_add(PREDICTION_SPREAD),
            ),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results(mappings: [(Ipv4Addr, u16); 4]) -> ProbeResults {
        ProbeResults {
            local_address: Ipv4Addr::new(192, 168, 1, 10),
            local_port: 4321,
            mappings,
            unsolicited_received: Some(false),
            changed_port_received: Some(false),
        }
    }

    const EXTERNAL: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 4);

    #[test]
    fn no_translation() {
        let mut probe = results([(Ipv4Addr::new(192, 168, 1, 10), 4321); 4]);
        probe.local_port = 4321;
        assert_eq!(probe.classify().0, RouterType::None);
    }

    #[test]
    fn stable_mapping_is_cone() {
        let mut probe = results([(EXTERNAL, 40_001); 4]);
        probe.unsolicited_received = Some(true);
        assert_eq!(probe.classify().0, RouterType::ConeFull);

        probe.unsolicited_received = Some(false);
        probe.changed_port_received = Some(true);
        assert_eq!(probe.classify().0, RouterType::ConeRestricted);

        probe.changed_port_received = Some(false);
        assert_eq!(probe.classify().0, RouterType::ConePortRestricted);
        assert_eq!(predict_port(&probe), Prediction::Exact(40_001));
    }

    #[test]
    fn per_destination_mappings_are_symmetric_port_sensitive() {
        let probe = results([
            (EXTERNAL, 40_001),
            (EXTERNAL, 40_003),
            (EXTERNAL, 40_005),
            (EXTERNAL, 40_007),
        ]);
        let (router_type, allocation) = probe.classify();
        assert_eq!(router_type, RouterType::SymmetricPortRestricted);
        assert_eq!(allocation, PortAllocation::Port);
    }

    #[test]
    fn stride_prediction_extrapolates_from_the_last_mapping() {
        let probe = results([
            (EXTERNAL, 40_001),
            (EXTERNAL, 40_003),
            (EXTERNAL, 40_005),
            (EXTERNAL, 40_007),
        ]);
        match predict_port(&probe) {
            Prediction::Predicted { port, range } => {
                assert_eq!(port, 40_009);
                assert_eq!(range, (39_999, 40_019));
            }
            other => panic!("expected a point prediction, got {other:?}"),
        }
    }

    #[test]
    fn address_sensitive_allocation_only_names_a_range() {
        // Same port for both probes against IP_A, different against
        // IP_B: the destination address picked the mapping.
        let probe = results([
            (EXTERNAL, 40_001),
            (EXTERNAL, 40_001),
            (EXTERNAL, 40_033),
            (EXTERNAL, 40_033),
        ]);
        let (router_type, allocation) = probe.classify();
        assert!(router_type.is_symmetric());
        assert_eq!(allocation, PortAllocation::Address);
        match predict_port(&probe) {
            Prediction::RangeOnly { range } => assert_eq!(range, (40_023, 40_043)),
            other => panic!("expected a range, got {other:?}"),
        }
    }

    #[test]
    fn router_type_names() {
        assert_eq!(RouterType::ConeFull.to_string(), "Cone - Full");
        assert_eq!(
            RouterType::SymmetricPortRestricted.to_string(),
            "Symmetric - Port Restricted"
        );
        assert_eq!(RouterType::from_code(RouterType::ConeRestricted.code()), RouterType::ConeRestricted);
    }
}
