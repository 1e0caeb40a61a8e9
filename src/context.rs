//! The bundle of shared facilities a transport session runs against.

use crate::config::Config;
use crate::port_mapping::PortMapper;
use crate::protocols::stun::StunServers;
use crate::protocols::stunt::StuntRegistry;
use crate::protocols::turn::StreamhostDirectory;
use crate::signaling::SignalingRouter;
use crate::telemetry::ReportSink;
use std::sync::Arc;

/// Everything a session needs from its surroundings: configuration,
/// the signaling plane, the port-mapping helper, the STUN servers, the
/// TURN proxy directory, and the telemetry sink. One context is shared
/// by every gateway and session of a logical peer.
#[derive(Clone)]
pub struct TransportContext {
    pub config: Arc<Config>,
    /// Our own identity on the signaling channel.
    pub local_jid: String,
    pub signaling: Arc<SignalingRouter>,
    pub port_mapper: Arc<dyn PortMapper>,
    pub stun_servers: StunServers,
    pub streamhosts: Arc<dyn StreamhostDirectory>,
    pub stunt_registry: Arc<StuntRegistry>,
    pub reports: Arc<dyn ReportSink>,
}
