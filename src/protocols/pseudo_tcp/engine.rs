//! The reliable byte-stream state machine that runs over one UDP
//! socket. It follows RFC 793 for connection management, RFC 2581 and
//! RFC 3782 (NewReno) for congestion control, RFC 2988 for
//! retransmission timing, and carries a single-entry selective
//! acknowledgment in the style of RFC 2018.
//!
//! [`PseudoTcp`] holds no sockets and no timers of its own. A driver
//! feeds it received datagrams through [`PseudoTcp::packet_arrives`],
//! drains datagrams to send from [`PseudoTcp::packets`], and moves the
//! clock with [`PseudoTcp::advance_time`]. This keeps the whole state
//! machine testable as a pair of values exchanging packets in memory.

use super::packet::Packet;
use super::serial::{seq_geq, seq_gt, seq_leq, seq_lt};
use crate::config::Config;
use crate::payload::Payload;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error as ThisError;


/// How long a segment can live in the network. TIME-WAIT lasts twice
/// this.
const MSL: Duration = Duration::from_secs(30);

/// Upper bound on how long an acknowledgment may be delayed for
/// coalescing.
const ACK_DELAY: Duration = Duration::from_millis(200);

const MIN_RTO: Duration = Duration::from_secs(1);
const MAX_RTO: Duration = Duration::from_secs(60);

/// Total SYN transmissions before the open attempt is abandoned.
const SYN_BUDGET: u32 = 5;

/// Consecutive retransmission timeouts without progress before the
/// peer is declared unreachable.
const MAX_RTO_STRIKES: u32 = 10;

/// Bound on buffered out-of-order packets.
const MAX_OUT_OF_ORDER: usize = 64;

/// Initial advertised receive window and the receive buffer size.
pub const RECV_CAPACITY: u32 = 65_535;

/// Bound on bytes buffered for sending.
pub const SEND_CAPACITY: usize = 64 * 1024;

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum PseudoTcpError {
    #[error("the open handshake timed out")]
    OpenTimeout,
    #[error("nothing heard from the peer within the idle limit")]
    IdleTimeout,
    #[error("retransmissions exhausted without an acknowledgment")]
    PeerUnreachable,
    #[error("the peer reset the connection")]
    ConnectionReset,
    #[error("the connection was aborted locally")]
    Canceled,
}

/// Notifications produced by the state machine for its driver, in the
/// order they occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Opened,
    BytesAvailable,
    CanAcceptBytes,
    WillClose(PseudoTcpError),
    DidClose,
}

/// Connection states. FIN-WAIT covers the window between sending our
/// FIN and receiving the peer's, whether or not ours has been
/// acknowledged yet; `fin_acked` tracks the difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    CloseWait,
    LastAck,
    FinWait,
    Closing,
    TimeWait,
}

impl State {
    /// Whether the connection has completed its handshake and not yet
    /// fully closed.
    fn is_synchronized(self) -> bool {
        !matches!(self, State::Closed | State::Listen | State::SynSent)
    }

    /// Whether new data may still be queued and segmentized.
    fn can_send(self) -> bool {
        matches!(self, State::Established | State::CloseWait)
    }
}

/// A segment on the retransmission queue.
#[derive(Debug)]
struct InFlight {
    packet: Packet,
    /// Sequence span: payload length plus one for SYN and FIN.
    len: u32,
    first_sent: Duration,
    needs_transmit: bool,
    retransmitted: bool,
    /// Zero-window probes are exempt from congestion accounting.
    probe: bool,
    /// Named by a SACK from the peer. Advisory: skipped during fast
    /// retransmit but only removed by a cumulative acknowledgment.
    sacked: bool,
}

impl InFlight {
    fn new(packet: Packet, len: u32, now: Duration) -> Self {
        Self {
            packet,
            len,
            first_sent: now,
            needs_transmit: true,
            retransmitted: false,
            probe: false,
            sacked: false,
        }
    }
}

pub struct PseudoTcp {
    state: State,
    mss: u32,
    clock: Duration,
    events: VecDeque<StreamEvent>,

    // Send sequence space
    snd_iss: u32,
    snd_una: u32,
    snd_nxt: u32,
    snd_wnd: u32,
    send_buffer: Payload,
    fin_queued: bool,
    fin_sent: bool,
    fin_acked: bool,

    // Receive sequence space
    rcv_irs: u32,
    rcv_nxt: u32,
    recv_buffer: Payload,
    out_of_order: VecDeque<Packet>,
    peer_supports_sack: bool,

    // Acknowledgment coalescing
    ack_deadline: Option<Duration>,
    unacked_data_packets: u32,
    pending_sack: Option<u32>,
    advertised_zero_window: bool,

    // Retransmission
    rtxq: VecDeque<InFlight>,
    rtx_deadline: Option<Duration>,
    rto_strikes: u32,
    syn_transmits: u32,

    // RFC 2581 / RFC 3782
    cwnd: u32,
    ssthresh: u32,
    recover: u32,
    dup_acks: u32,
    in_recovery: bool,

    // RFC 2988
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,

    // Zero-window probing
    persist_deadline: Option<Duration>,
    persist_interval: Duration,
    persist_cap: Duration,

    // Keepalive
    keepalive_idle: Duration,
    keepalive_dead: Duration,
    last_receive_time: Duration,
    keepalive_probe_sent: bool,

    time_wait_deadline: Option<Duration>,

    /// Control packets to hand out on the next call to `packets`.
    outgoing: Vec<Packet>,
}

impl PseudoTcp {
    fn new(config: &Config, isn: u32, state: State) -> Self {
        Self {
            state,
            mss: config.mss as u32,
            clock: Duration::ZERO,
            events: VecDeque::new(),
            snd_iss: isn,
            snd_una: isn,
            snd_nxt: isn,
            snd_wnd: 0,
            send_buffer: Payload::default(),
            fin_queued: false,
            fin_sent: false,
            fin_acked: false,
            rcv_irs: 0,
            rcv_nxt: 0,
            recv_buffer: Payload::default(),
            out_of_order: VecDeque::new(),
            peer_supports_sack: false,
            ack_deadline: None,
            unacked_data_packets: 0,
            pending_sack: None,
            advertised_zero_window: false,
            rtxq: VecDeque::new(),
            rtx_deadline: None,
            rto_strikes: 0,
            syn_transmits: 0,
            cwnd: 2 * config.mss as u32,
            ssthresh: 64 * 1024,
            recover: isn,
            dup_acks: 0,
            in_recovery: false,
            srtt: None,
            rttvar: Duration::ZERO,
            rto: config.initial_rto,
            persist_deadline: None,
            persist_interval: config.initial_rto,
            persist_cap: config.persist_cap,
            keepalive_idle: config.keepalive_idle,
            keepalive_dead: config.keepalive_dead,
            last_receive_time: Duration::ZERO,
            keepalive_probe_sent: false,
            time_wait_deadline: None,
            outgoing: Vec::new(),
        }
    }

    /// Starts a connection by sending a SYN. The SACK flag on the SYN
    /// advertises that we understand selective acknowledgments.
    pub fn active_open(config: &Config, isn: u32) -> Self {
        let mut tcp = Self::new(config, isn, State::SynSent);
        let mut syn = Packet::new(isn);
        syn.set_syn(true);
        syn.set_sack(true);
        syn.window = tcp.advertised_window();
        tcp.snd_nxt = isn.wrapping_add(1);
        tcp.rtxq.push_back(InFlight::new(syn, 1, Duration::ZERO));
        tcp.syn_transmits = 1;
        tcp.rtx_deadline = Some(tcp.rto);
        tcp
    }

    /// Waits for a connection. The first SYN to arrive on the socket is
    /// answered with SYN+ACK.
    pub fn passive_open(config: &Config, isn: u32) -> Self {
        Self::new(config, isn, State::Listen)
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn poll_event(&mut self) -> Option<StreamEvent> {
        self.events.pop_front()
    }

    /// Bytes the caller may still queue for sending. Queueing is
    /// allowed from the moment the handshake starts.
    pub fn accept_capacity(&self) -> usize {
        let open_for_send =
            matches!(self.state, State::SynSent | State::SynReceived) || self.state.can_send();
        if self.fin_queued || !open_for_send {
            return 0;
        }
        SEND_CAPACITY.saturating_sub(self.send_buffer.len())
    }

    pub fn can_accept_bytes(&self) -> bool {
        self.accept_capacity() > 0
    }

    /// Queues bytes for transmission. The caller must stay within
    /// [`PseudoTcp::accept_capacity`].
    pub fn send(&mut self, data: Payload) {
        debug_assert!(data.len() <= self.accept_capacity());
        self.send_buffer.append(data);
    }

    pub fn has_bytes_available(&self) -> bool {
        !self.recv_buffer.is_empty()
    }

    /// Takes every byte received in order so far.
    pub fn receive(&mut self) -> Payload {
        let out = std::mem::take(&mut self.recv_buffer);
        // Tell the peer when draining the buffer reopens a closed window.
        if self.advertised_zero_window && !out.is_empty() && self.state.is_synchronized() {
            self.emit_ack();
        }
        out
    }

    /// Whether the peer has finished sending and every byte it sent has
    /// been taken.
    pub fn at_eof(&self) -> bool {
        self.recv_buffer.is_empty()
            && matches!(
                self.state,
                State::CloseWait | State::LastAck | State::Closing | State::TimeWait | State::Closed
            )
    }

    /// Finishes the sending side: drains the send buffer, then follows
    /// with a FIN.
    pub fn close_after_writing(&mut self) {
        match self.state {
            State::Closed | State::Listen => {
                self.state = State::Closed;
                self.events.push_back(StreamEvent::DidClose);
            }
            State::SynSent => {
                self.clear_timers();
                self.state = State::Closed;
                self.events.push_back(StreamEvent::DidClose);
            }
            _ => self.fin_queued = true,
        }
    }

    /// Hard close. Unacknowledged data provokes a reset so the peer
    /// does not linger.
    pub fn abort(&mut self) {
        if self.state == State::Closed {
            return;
        }
        if self.state.is_synchronized() && (!self.rtxq.is_empty() || !self.send_buffer.is_empty()) {
            let mut rst = Packet::new(self.snd_nxt);
            rst.set_rst(true);
            rst.set_ack(true);
            rst.ack = self.rcv_nxt;
            self.outgoing.push(rst);
        }
        self.close_with(PseudoTcpError::Canceled);
    }

    /// The earliest time at which `advance_time` has work to do,
    /// relative to now.
    pub fn next_wake(&self) -> Option<Duration> {
        let mut deadline: Option<Duration> = None;
        let mut consider = |d: Option<Duration>| {
            if let Some(d) = d {
                deadline = Some(match deadline {
                    Some(existing) => existing.min(d),
                    None => d,
                });
            }
        };
        consider(self.ack_deadline);
        consider(self.rtx_deadline);
        consider(self.persist_deadline);
        consider(self.time_wait_deadline);
        if self.state.is_synchronized() && self.state != State::TimeWait {
            if self.keepalive_probe_sent {
                consider(Some(self.last_receive_time + self.keepalive_dead));
            } else {
                consider(Some(self.last_receive_time + self.keepalive_idle));
            }
        }
        deadline.map(|d| d.saturating_sub(self.clock))
    }

    /// Moves the clock forward and fires any timers that come due.
    pub fn advance_time(&mut self, delta: Duration) {
        if self.state == State::Closed {
            return;
        }
        self.clock += delta;

        if self.rtxq.is_empty() {
            self.rtx_deadline = None;
        }

        if let Some(deadline) = self.ack_deadline {
            if self.clock >= deadline {
                self.emit_ack();
            }
        }

        if let Some(deadline) = self.rtx_deadline {
            if self.clock >= deadline && !self.rtxq.is_empty() {
                self.retransmission_timeout();
                if self.state == State::Closed {
                    return;
                }
            }
        }

        if let Some(deadline) = self.persist_deadline {
            if self.clock >= deadline {
                self.persist_timeout();
            }
        }

        if self.state.is_synchronized() && self.state != State::TimeWait {
            let idle = self.clock.saturating_sub(self.last_receive_time);
            if idle >= self.keepalive_dead {
                self.close_with(PseudoTcpError::IdleTimeout);
                return;
            }
            if idle >= self.keepalive_idle && !self.keepalive_probe_sent {
                let mut probe = Packet::new(self.snd_nxt);
                probe.set_ack(true);
                probe.ack = self.rcv_nxt;
                probe.window = self.advertised_window();
                self.outgoing.push(probe);
                self.keepalive_probe_sent = true;
            }
        }

        if let Some(deadline) = self.time_wait_deadline {
            if self.clock >= deadline {
                self.clear_timers();
                self.state = State::Closed;
                self.events.push_back(StreamEvent::DidClose);
            }
        }
    }

    /// Gets the datagrams that are ready to go out: queued control
    /// packets, fresh segments up to the congestion and receive
    /// windows, and any retransmissions that timers have flagged.
    pub fn packets(&mut self) -> Vec<Packet> {
        let mut out = std::mem::take(&mut self.outgoing);

        if self.state.can_send() {
            self.segmentize();
            self.maybe_send_fin();
        }

        let window = self.advertised_window();
        let rcv_nxt = self.rcv_nxt;
        let synchronized = self.state.is_synchronized();
        for in_flight in self.rtxq.iter_mut() {
            if in_flight.needs_transmit {
                let mut packet = in_flight.packet.clone();
                // Refresh the acknowledgment side at transmit time.
                if packet.is_ack() || (synchronized && !packet.is_syn()) {
                    packet.set_ack(true);
                    packet.ack = rcv_nxt;
                }
                packet.window = window;
                out.push(packet);
                in_flight.needs_transmit = false;
            }
        }

        if let Some(last) = out.last() {
            self.advertised_zero_window = last.window == 0;
        }

        if !self.rtxq.is_empty() && self.rtx_deadline.is_none() {
            self.rtx_deadline = Some(self.clock + self.rto);
        }

        out
    }

    /// Handles one datagram from the peer.
    pub fn packet_arrives(&mut self, packet: Packet) {
        if self.state == State::Closed {
            return;
        }
        self.last_receive_time = self.clock;
        self.keepalive_probe_sent = false;

        match self.state {
            State::Listen => self.arrives_listen(packet),
            State::SynSent => self.arrives_syn_sent(packet),
            _ => self.arrives_synchronized(packet),
        }
    }

    fn arrives_listen(&mut self, packet: Packet) {
        if packet.is_rst() {
            return;
        }
        if !packet.is_syn() {
            // Nothing to do for stray data before a connection exists.
            return;
        }
        self.rcv_irs = packet.seq;
        self.rcv_nxt = packet.seq.wrapping_add(1);
        self.peer_supports_sack = packet.is_sack();
        self.snd_wnd = packet.window as u32;
        self.snd_nxt = self.snd_iss.wrapping_add(1);

        let mut syn_ack = Packet::new(self.snd_iss);
        syn_ack.set_syn(true);
        syn_ack.set_ack(true);
        syn_ack.set_sack(true);
        syn_ack.ack = self.rcv_nxt;
        syn_ack.window = self.advertised_window();
        self.rtxq.push_back(InFlight::new(syn_ack, 1, self.clock));
        self.syn_transmits = 1;
        self.rtx_deadline = Some(self.clock + self.rto);
        self.state = State::SynReceived;
        tracing::debug!(isn = self.snd_iss, "answered SYN, entering SYN-RECEIVED");
    }

    fn arrives_syn_sent(&mut self, packet: Packet) {
        if packet.is_rst() {
            // Only a reset that acknowledges our SYN is credible.
            if packet.is_ack() && packet.ack == self.snd_nxt {
                self.close_with(PseudoTcpError::ConnectionReset);
            }
            return;
        }
        if !packet.is_syn() {
            return;
        }
        self.rcv_irs = packet.seq;
        self.rcv_nxt = packet.seq.wrapping_add(1);
        self.peer_supports_sack = packet.is_sack();
        self.snd_wnd = packet.window as u32;

        let acceptable_ack = packet.is_ack()
            && seq_gt(packet.ack, self.snd_una)
            && seq_leq(packet.ack, self.snd_nxt);
        if acceptable_ack {
            // SYN+ACK: the peer's acknowledgment covers our SYN.
            self.snd_una = packet.ack;
            self.ack_retransmission_queue();
            self.establish();
            self.emit_ack();
        } else {
            // Simultaneous open: both sides sent SYN. Convert our queued
            // SYN into a SYN+ACK.
            self.state = State::SynReceived;
            if let Some(in_flight) = self.rtxq.front_mut() {
                in_flight.packet.set_ack(true);
                in_flight.packet.ack = self.rcv_nxt;
                in_flight.needs_transmit = true;
            }
        }
    }

    fn arrives_synchronized(&mut self, packet: Packet) {
        if packet.is_rst() {
            // Guard against blind resets: the sequence number must sit
            // inside the receive window. Stray datagrams that happen to
            // parse with the RST bit set are ignored.
            if self.is_in_rcv_window(packet.seq) {
                self.close_with(PseudoTcpError::ConnectionReset);
            }
            return;
        }
        if packet.is_syn() {
            // In SYN-RECEIVED the peer's SYN+ACK from a simultaneous
            // open still carries the acknowledgment that completes the
            // handshake, so it is processed below. Any other SYN is a
            // duplicate; the challenge ACK regenerates a handshake ACK
            // the peer may have missed.
            if !(self.state == State::SynReceived && packet.is_ack()) {
                self.emit_ack();
                return;
            }
        }

        if packet.is_ack() {
            self.process_ack(&packet);
            if self.state == State::Closed {
                return;
            }
        }

        if !packet.payload.is_empty() && self.receiving_allowed() {
            self.process_data(&packet);
        }

        if packet.is_fin() {
            self.process_fin(&packet);
        }
    }

    fn establish(&mut self) {
        self.state = State::Established;
        self.events.push_back(StreamEvent::Opened);
        if self.can_accept_bytes() {
            self.events.push_back(StreamEvent::CanAcceptBytes);
        }
        tracing::debug!(
            iss = self.snd_iss,
            irs = self.rcv_irs,
            "connection established"
        );
    }

    fn process_ack(&mut self, packet: &Packet) {
        let seg_ack = packet.ack;

        if seq_gt(seg_ack, self.snd_nxt) {
            // Acknowledges something we never sent.
            self.emit_ack();
            return;
        }

        if self.state == State::SynReceived && seq_gt(seg_ack, self.snd_una) {
            self.snd_una = seg_ack;
            self.ack_retransmission_queue();
            self.establish();
        } else if seq_gt(seg_ack, self.snd_una) {
            let had_send_space = self.can_accept_bytes();
            self.snd_una = seg_ack;
            self.take_rtt_sample(seg_ack);
            self.ack_retransmission_queue();
            self.rto_strikes = 0;

            if self.in_recovery {
                if seq_geq(seg_ack, self.recover) {
                    // Full acknowledgment: recovery is over, deflate.
                    self.in_recovery = false;
                    self.dup_acks = 0;
                    self.cwnd = self.ssthresh;
                } else {
                    // Partial acknowledgment: the next hole is lost too.
                    // Retransmit it and keep the window inflated.
                    self.retransmit_first_hole();
                }
            } else {
                self.dup_acks = 0;
                if self.cwnd < self.ssthresh {
                    self.cwnd += self.mss;
                } else {
                    self.cwnd += (self.mss * self.mss / self.cwnd).max(1);
                }
            }

            self.rtx_deadline = if self.rtxq.is_empty() {
                None
            } else {
                Some(self.clock + self.rto)
            };

            if self.fin_sent && self.snd_una == self.snd_nxt {
                self.fin_acked = true;
                match self.state {
                    State::LastAck => {
                        self.clear_timers();
                        self.state = State::Closed;
                        self.events.push_back(StreamEvent::DidClose);
                        return;
                    }
                    State::Closing => {
                        self.state = State::TimeWait;
                        self.time_wait_deadline = Some(self.clock + 2 * MSL);
                    }
                    _ => {}
                }
            }

            if !had_send_space && self.can_accept_bytes() {
                self.events.push_back(StreamEvent::CanAcceptBytes);
            }
        } else if seg_ack == self.snd_una && !self.rtxq.is_empty() {
            if packet.is_sack() && self.peer_supports_sack {
                self.mark_sacked(packet.sack_seq);
            }
            if packet.payload.is_empty() {
                self.dup_acks += 1;
                if self.dup_acks == 3 && !self.in_recovery {
                    self.enter_fast_recovery();
                } else if self.in_recovery {
                    // Each further duplicate means another packet left
                    // the network.
                    self.cwnd += self.mss;
                }
            }
        }

        // Window update
        let new_wnd = packet.window as u32;
        let was_zero = self.snd_wnd == 0;
        self.snd_wnd = new_wnd;
        if new_wnd == 0 {
            if self.persist_deadline.is_none() && !self.send_buffer.is_empty() {
                self.persist_interval = self.rto;
                self.persist_deadline = Some(self.clock + self.persist_interval);
            }
        } else {
            self.persist_deadline = None;
            if was_zero {
                self.persist_interval = self.rto;
            }
        }
    }

    fn enter_fast_recovery(&mut self) {
        let flight = self.flight_size();
        self.ssthresh = (flight / 2).max(2 * self.mss);
        self.retransmit_first_hole();
        self.cwnd = self.ssthresh + 3 * self.mss;
        self.recover = self.snd_nxt;
        self.in_recovery = true;
        self.rtx_deadline = Some(self.clock + self.rto);
        tracing::debug!(
            ssthresh = self.ssthresh,
            cwnd = self.cwnd,
            "three duplicate acknowledgments, fast retransmit"
        );
    }

    /// Flags the first unacknowledged, un-SACKed segment for immediate
    /// retransmission.
    fn retransmit_first_hole(&mut self) {
        for in_flight in self.rtxq.iter_mut() {
            if !in_flight.sacked {
                in_flight.needs_transmit = true;
                in_flight.retransmitted = true;
                break;
            }
        }
    }

    fn mark_sacked(&mut self, sack_seq: u32) {
        for in_flight in self.rtxq.iter_mut() {
            if in_flight.packet.seq == sack_seq {
                in_flight.sacked = true;
                break;
            }
        }
    }

    /// Removes segments that the cumulative acknowledgment now covers
    /// entirely.
    fn ack_retransmission_queue(&mut self) {
        while let Some(front) = self.rtxq.front() {
            let end = front.packet.seq.wrapping_add(front.len);
            if seq_geq(self.snd_una, end) {
                self.rtxq.pop_front();
            } else {
                break;
            }
        }
    }

    /// Feeds the round-trip estimator from the oldest segment this
    /// acknowledgment retires. Retransmitted segments and probes are
    /// excluded so that an acknowledgment can never be matched to the
    /// wrong transmission.
    fn take_rtt_sample(&mut self, seg_ack: u32) {
        let sample = self.rtxq.iter().find_map(|in_flight| {
            let end = in_flight.packet.seq.wrapping_add(in_flight.len);
            if seq_geq(seg_ack, end) && !in_flight.retransmitted && !in_flight.probe {
                Some(self.clock.saturating_sub(in_flight.first_sent))
            } else {
                None
            }
        });
        let Some(r) = sample else { return };
        match self.srtt {
            None => {
                self.srtt = Some(r);
                self.rttvar = r / 2;
            }
            Some(srtt) => {
                let delta = if srtt > r { srtt - r } else { r - srtt };
                self.rttvar = self.rttvar.mul_f64(0.75) + delta.mul_f64(0.25);
                self.srtt = Some(srtt.mul_f64(0.875) + r.mul_f64(0.125));
            }
        }
        let srtt = self.srtt.unwrap();
        self.rto = (srtt + 4 * self.rttvar).clamp(MIN_RTO, MAX_RTO);
    }

    fn retransmission_timeout(&mut self) {
        if matches!(self.state, State::SynSent | State::SynReceived) {
            if self.syn_transmits >= SYN_BUDGET {
                self.close_with(PseudoTcpError::OpenTimeout);
                return;
            }
            self.syn_transmits += 1;
        }

        let is_probe = self.rtxq.front().map(|f| f.probe).unwrap_or(false);
        if let Some(front) = self.rtxq.front_mut() {
            front.needs_transmit = true;
            front.retransmitted = true;
        }

        if !matches!(self.state, State::SynSent | State::SynReceived) && !is_probe {
            self.ssthresh = (self.flight_size() / 2).max(2 * self.mss);
            self.cwnd = self.mss;
            self.in_recovery = false;
            self.dup_acks = 0;
            self.rto_strikes += 1;
            tracing::debug!(
                strikes = self.rto_strikes,
                rto_ms = self.rto.as_millis() as u64,
                "retransmission timeout"
            );
            if self.rto_strikes >= MAX_RTO_STRIKES {
                self.close_with(PseudoTcpError::PeerUnreachable);
                return;
            }
        }

        self.rto = (self.rto * 2).min(MAX_RTO);
        self.rtx_deadline = Some(self.clock + self.rto);
    }

    fn persist_timeout(&mut self) {
        if self.snd_wnd == 0 && !self.send_buffer.is_empty() && self.state.can_send() {
            // Send one byte past the closed window to provoke a fresh
            // window advertisement.
            let payload = self.send_buffer.split_off_front(1);
            let mut probe = Packet::new(self.snd_nxt);
            probe.set_ack(true);
            probe.ack = self.rcv_nxt;
            probe.payload = payload;
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            let mut in_flight = InFlight::new(probe, 1, self.clock);
            in_flight.probe = true;
            self.rtxq.push_back(in_flight);
            if self.rtx_deadline.is_none() {
                self.rtx_deadline = Some(self.clock + self.rto);
            }
            self.persist_interval = (self.persist_interval * 2).min(self.persist_cap);
            self.persist_deadline = Some(self.clock + self.persist_interval);
        } else {
            self.persist_deadline = None;
        }
    }

    fn segmentize(&mut self) {
        let window = self.cwnd.min(self.snd_wnd);
        loop {
            let flight = self.flight_size();
            let usable = window.saturating_sub(flight);
            let take = self
                .mss
                .min(usable)
                .min(self.send_buffer.len() as u32) as usize;
            if take == 0 {
                break;
            }
            let payload = self.send_buffer.split_off_front(take);
            let mut packet = Packet::new(self.snd_nxt);
            packet.set_ack(true);
            packet.ack = self.rcv_nxt;
            packet.payload = payload;
            self.snd_nxt = self.snd_nxt.wrapping_add(take as u32);
            self.rtxq
                .push_back(InFlight::new(packet, take as u32, self.clock));
            // Data segments carry the acknowledgment, so a delayed ACK
            // is no longer owed.
            self.clear_ack_state();
        }
        if self.snd_wnd == 0 && !self.send_buffer.is_empty() && self.persist_deadline.is_none() {
            self.persist_interval = self.rto;
            self.persist_deadline = Some(self.clock + self.persist_interval);
        }
    }

    fn maybe_send_fin(&mut self) {
        if !self.fin_queued || self.fin_sent || !self.send_buffer.is_empty() {
            return;
        }
        let mut fin = Packet::new(self.snd_nxt);
        fin.set_fin(true);
        fin.set_ack(true);
        fin.ack = self.rcv_nxt;
        self.snd_nxt = self.snd_nxt.wrapping_add(1);
        self.rtxq.push_back(InFlight::new(fin, 1, self.clock));
        self.fin_sent = true;
        self.state = match self.state {
            State::CloseWait => State::LastAck,
            _ => State::FinWait,
        };
        tracing::debug!(state = ?self.state, "sent FIN");
    }

    fn process_data(&mut self, packet: &Packet) {
        let seq = packet.seq;
        let len = packet.payload.len() as u32;

        if seq == self.rcv_nxt {
            self.append_in_order(packet.payload.clone());
            let stashed_before = self.out_of_order.len();
            self.drain_out_of_order();
            if stashed_before > self.out_of_order.len() {
                // The arrival filled a hole; the sender is waiting to
                // hear about it.
                self.emit_ack();
            } else {
                self.unacked_data_packets += 1;
                if self.unacked_data_packets >= 2 {
                    self.emit_ack();
                } else if self.ack_deadline.is_none() {
                    self.ack_deadline = Some(self.clock + ACK_DELAY);
                }
            }
            if self.has_bytes_available() {
                self.events.push_back(StreamEvent::BytesAvailable);
            }
        } else if seq_gt(seq, self.rcv_nxt) {
            // Out of order: hold it, and tell the sender exactly which
            // packet arrived so it can retransmit just the hole.
            self.stash_out_of_order(packet.clone());
            self.pending_sack = Some(seq);
            self.emit_ack();
        } else {
            // Below the window: discard, but the acknowledgment may
            // have been lost, so answer anyway.
            let _ = len;
            self.emit_ack();
        }
    }

    fn receiving_allowed(&self) -> bool {
        matches!(
            self.state,
            State::SynReceived | State::Established | State::FinWait | State::Closing
        )
    }

    fn append_in_order(&mut self, mut payload: Payload) {
        let space = RECV_CAPACITY.saturating_sub(self.recv_buffer.len() as u32);
        let accept = (payload.len() as u32).min(space);
        payload.truncate(accept as usize);
        self.rcv_nxt = self.rcv_nxt.wrapping_add(accept);
        self.recv_buffer.append(payload);
    }

    fn stash_out_of_order(&mut self, packet: Packet) {
        if self.out_of_order.len() >= MAX_OUT_OF_ORDER {
            return;
        }
        let seq = packet.seq;
        if self.out_of_order.iter().any(|p| p.seq == seq) {
            return;
        }
        let pos = self
            .out_of_order
            .iter()
            .position(|p| seq_gt(p.seq, seq))
            .unwrap_or(self.out_of_order.len());
        self.out_of_order.insert(pos, packet);
    }

    fn drain_out_of_order(&mut self) {
        while let Some(front) = self.out_of_order.front() {
            if seq_lt(front.seq, self.rcv_nxt) {
                self.out_of_order.pop_front();
            } else if front.seq == self.rcv_nxt {
                let packet = self.out_of_order.pop_front().unwrap();
                self.append_in_order(packet.payload);
            } else {
                break;
            }
        }
    }

    fn process_fin(&mut self, packet: &Packet) {
        let fin_seq = packet.seq.wrapping_add(packet.payload.len() as u32);
        if seq_lt(fin_seq, self.rcv_nxt) {
            // A FIN we already acknowledged.
            self.emit_ack();
            if self.state == State::TimeWait {
                self.time_wait_deadline = Some(self.clock + 2 * MSL);
            }
            return;
        }
        if fin_seq != self.rcv_nxt {
            // The FIN sits past a hole; the retransmission will carry it
            // again once the hole fills.
            return;
        }
        self.rcv_nxt = fin_seq.wrapping_add(1);
        self.emit_ack();

        match self.state {
            State::SynReceived | State::Established => {
                self.state = State::CloseWait;
                self.events.push_back(StreamEvent::BytesAvailable);
            }
            State::FinWait => {
                if self.fin_acked {
                    self.state = State::TimeWait;
                    self.time_wait_deadline = Some(self.clock + 2 * MSL);
                } else {
                    self.state = State::Closing;
                }
            }
            State::TimeWait => {
                self.time_wait_deadline = Some(self.clock + 2 * MSL);
            }
            _ => {}
        }
        tracing::debug!(state = ?self.state, "peer sent FIN");
    }

    fn emit_ack(&mut self) {
        let mut ack = Packet::new(self.snd_nxt);
        ack.set_ack(true);
        ack.ack = self.rcv_nxt;
        ack.window = self.advertised_window();
        if let Some(sack_seq) = self.pending_sack {
            ack.set_sack(true);
            ack.sack_seq = sack_seq;
        }
        self.outgoing.push(ack);
        self.clear_ack_state();
    }

    fn clear_ack_state(&mut self) {
        self.ack_deadline = None;
        self.unacked_data_packets = 0;
        self.pending_sack = None;
    }

    fn is_in_rcv_window(&self, seq: u32) -> bool {
        seq_geq(seq, self.rcv_nxt) && seq_lt(seq, self.rcv_nxt.wrapping_add(RECV_CAPACITY))
    }

    fn advertised_window(&self) -> u16 {
        RECV_CAPACITY
            .saturating_sub(self.recv_buffer.len() as u32)
            .min(u16::MAX as u32) as u16
    }

    /// Bytes in flight, excluding segments the peer has selectively
    /// acknowledged.
    fn flight_size(&self) -> u32 {
        self.rtxq
            .iter()
            .filter(|in_flight| !in_flight.sacked)
            .map(|in_flight| in_flight.packet.payload.len() as u32)
            .sum()
    }

    fn clear_timers(&mut self) {
        self.ack_deadline = None;
        self.rtx_deadline = None;
        self.persist_deadline = None;
        self.time_wait_deadline = None;
    }

    fn close_with(&mut self, error: PseudoTcpError) {
        self.clear_timers();
        self.state = State::Closed;
        tracing::debug!(%error, "connection closed");
        self.events.push_back(StreamEvent::WillClose(error));
        self.events.push_back(StreamEvent::DidClose);
    }
}
