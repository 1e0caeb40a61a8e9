//! Sequential TCP connection attempts across an address list.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error as ThisError;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Time given to each address before moving to the next.
const PER_ADDRESS_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, ThisError)]
pub enum ConnectError {
    #[error("every address failed to connect")]
    AllAddressesFailed,
    #[error("the connector was aborted")]
    Canceled,
}

/// Tries a list of addresses one at a time, IPv6 first, and yields the
/// first TCP connection that completes. Aborting closes whatever
/// connection attempt is in flight.
pub struct SocketConnector {
    addresses: Vec<SocketAddr>,
    cancel: CancellationToken,
}

impl SocketConnector {
    pub fn new(mut addresses: Vec<SocketAddr>) -> Self {
        // IPv6 endpoints sort ahead of IPv4.
        addresses.sort_by_key(|address| match address {
            SocketAddr::V6(_) => 0,
            SocketAddr::V4(_) => 1,
        });
        Self {
            addresses,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub async fn run(self) -> Result<TcpStream, ConnectError> {
        for address in &self.addresses {
            tracing::debug!(%address, "trying address");
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ConnectError::Canceled),
                attempt = tokio::time::timeout(PER_ADDRESS_TIMEOUT, TcpStream::connect(address)) => {
                    match attempt {
                        Ok(Ok(stream)) => return Ok(stream),
                        Ok(Err(error)) => tracing::debug!(%address, %error, "address refused"),
                        Err(_) => tracing::debug!(%address, "address timed out"),
                    }
                }
            }
        }
        Err(ConnectError::AllAddressesFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv6_sorts_first() {
        let connector = SocketConnector::new(vec![
            "192.0.2.1:80".parse().unwrap(),
            "[2001:db8::1]:80".parse().unwrap(),
            "192.0.2.2:80".parse().unwrap(),
        ]);
        assert!(connector.addresses[0].is_ipv6());
        assert!(connector.addresses[1].is_ipv4());
    }

    #[tokio::test]
    async fn connects_to_a_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let connector = SocketConnector::new(vec![address]);
        let connect = tokio::spawn(connector.run());
        let (_accepted, _) = listener.accept().await.unwrap();
        assert!(connect.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn abort_beats_any_attempt() {
        let connector = SocketConnector::new(vec!["203.0.113.1:9".parse().unwrap()]);
        connector.abort();
        assert!(matches!(connector.run().await, Err(ConnectError::Canceled)));
    }

    #[tokio::test]
    async fn empty_list_fails() {
        let connector = SocketConnector::new(Vec::new());
        assert!(matches!(
            connector.run().await,
            Err(ConnectError::AllAddressesFailed)
        ));
    }
}
