//! Diagnostic counters and session reports.
//!
//! Every gateway keeps one [`TransportCounters`] that is bumped as
//! transport attempts finish. Sessions additionally produce a
//! [`SessionReport`] when they complete, which is handed to a
//! caller-supplied [`ReportSink`] off the reactor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Success and failure tallies per transport kind. Monotonic for the
/// lifetime of the gateway; never reset across reconnects.
#[derive(Debug, Default)]
pub struct TransportCounters {
    tcp_ok: AtomicU64,
    tcp_fail: AtomicU64,
    stunt_ok: AtomicU64,
    stunt_fail: AtomicU64,
    stun_ok: AtomicU64,
    stun_fail: AtomicU64,
    turn_ok: AtomicU64,
    turn_fail: AtomicU64,
}

/// The transports a gateway can obtain a remote stream over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Tcp,
    Stunt,
    Stun,
    Turn,
}

impl TransportCounters {
    pub fn record(&self, kind: SessionKind, success: bool) {
        let counter = match (kind, success) {
            (SessionKind::Tcp, true) => &self.tcp_ok,
            (SessionKind::Tcp, false) => &self.tcp_fail,
            (SessionKind::Stunt, true) => &self.stunt_ok,
            (SessionKind::Stunt, false) => &self.stunt_fail,
            (SessionKind::Stun, true) => &self.stun_ok,
            (SessionKind::Stun, false) => &self.stun_fail,
            (SessionKind::Turn, true) => &self.turn_ok,
            (SessionKind::Turn, false) => &self.turn_fail,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            tcp_ok: self.tcp_ok.load(Ordering::Relaxed),
            tcp_fail: self.tcp_fail.load(Ordering::Relaxed),
            stunt_ok: self.stunt_ok.load(Ordering::Relaxed),
            stunt_fail: self.stunt_fail.load(Ordering::Relaxed),
            stun_ok: self.stun_ok.load(Ordering::Relaxed),
            stun_fail: self.stun_fail.load(Ordering::Relaxed),
            turn_ok: self.turn_ok.load(Ordering::Relaxed),
            turn_fail: self.turn_fail.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub tcp_ok: u64,
    pub tcp_fail: u64,
    pub stunt_ok: u64,
    pub stunt_fail: u64,
    pub stun_ok: u64,
    pub stun_fail: u64,
    pub turn_ok: u64,
    pub turn_fail: u64,
}

/// How hole-punch validation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Validation {
    #[default]
    None,
    Success,
    /// Only one of the read and write directions validated.
    Partial,
    Failure,
}

/// Summary of one finished session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub uuid: String,
    pub kind: SessionKind,
    pub success: bool,
    /// Which attempt cycle the session finished on, counting from one.
    pub cycle: u32,
    pub validation: Validation,
    pub duration: Duration,
    pub failure_reason: Option<String>,
    /// "NAT-PMP" or "UPnP" when a router mapping was used.
    pub port_mapping_protocol: Option<String>,
    /// Whether the connection fell back to the server-assisted path.
    pub via_server: bool,
}

/// Receiver for session reports. Implementations must not block; the
/// application forwards reports to its feedback worker.
pub trait ReportSink: Send + Sync {
    fn report(&self, report: SessionReport);
}

/// Sink that drops every report.
#[derive(Debug, Default)]
pub struct NullReportSink;

impl ReportSink for NullReportSink {
    fn report(&self, _report: SessionReport) {}
}
