//! Tunable options shared by the transport sessions.

use std::time::Duration;

/// Knobs for the transport core. The defaults are the values the
/// application ships with; tests tighten them to keep runs short.
#[derive(Debug, Clone)]
pub struct Config {
    /// PseudoTcp segment size.
    pub mss: u16,
    /// First retransmission timeout for a STUN binding transaction.
    pub initial_stun_rto: Duration,
    /// First retransmission timeout for a PseudoTcp connection.
    pub initial_rto: Duration,
    /// Window for hole-punch validation to complete in both directions.
    pub validation_timeout: Duration,
    /// Full-cycle retries per session.
    pub attempt_budget: u32,
    /// Idle time before a PseudoTcp keepalive probe is sent.
    pub keepalive_idle: Duration,
    /// Idle time before an established PseudoTcp connection is closed.
    pub keepalive_dead: Duration,
    /// Cap on the zero-window persist interval.
    pub persist_cap: Duration,
    /// Time given to each TURN streamhost candidate.
    pub turn_per_candidate: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mss: 1400,
            initial_stun_rto: Duration::from_millis(500),
            initial_rto: Duration::from_millis(1000),
            validation_timeout: Duration::from_secs(15),
            attempt_budget: 2,
            keepalive_idle: Duration::from_secs(30),
            keepalive_dead: Duration::from_secs(75),
            persist_cap: Duration::from_secs(60),
            turn_per_candidate: Duration::from_secs(10),
        }
    }
}
