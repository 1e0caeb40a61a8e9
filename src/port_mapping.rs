//! Facade over the helper process that speaks NAT-PMP and UPnP to the
//! local router. The transport core only consumes the result.

use async_trait::async_trait;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum MappingError {
    #[error("the router offers no port mapping protocol")]
    Unsupported,
    #[error("the router refused the mapping: {0}")]
    Refused(String),
}

/// A port-mapping service. `add_mapping` asks the router to forward an
/// external port to `internal_port` and returns the external port it
/// granted, which need not equal the requested one.
#[async_trait]
pub trait PortMapper: Send + Sync {
    async fn add_mapping(&self, internal_port: u16) -> Result<u16, MappingError>;
    async fn remove_mapping(&self, internal_port: u16);
    /// Name of the protocol in use ("NAT-PMP", "UPnP"), for telemetry.
    fn protocol_name(&self) -> Option<&str> {
        None
    }
}

/// Mapper used when no helper is available. Every request fails with
/// [`MappingError::Unsupported`], pushing sessions onto the prediction
/// path.
#[derive(Debug, Default)]
pub struct NoPortMapper;

#[async_trait]
impl PortMapper for NoPortMapper {
    async fn add_mapping(&self, _internal_port: u16) -> Result<u16, MappingError> {
        Err(MappingError::Unsupported)
    }

    async fn remove_mapping(&self, _internal_port: u16) {}
}
