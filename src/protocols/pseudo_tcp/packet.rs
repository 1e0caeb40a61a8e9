//! Wire encoding of one PseudoTcp datagram.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Acknowledgment Number                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |               |   |S|A| |R|S|F|                               |
//! |    Control    |   |A|C| |S|Y|I|            Window             |
//! |               |   |K|K| |T|N|N|                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                [SACK Sequence, when SA is set]                |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             data                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! All numbers are in network order. The control byte is reserved.

use crate::payload::Payload;
use thiserror::Error as ThisError;

/// The size of the PseudoTcp header, which is also the minimum size of
/// a valid datagram.
pub const HEADER_SIZE: usize = 12;

const FIN: u8 = 0x01;
const SYN: u8 = 0x02;
const RST: u8 = 0x04;
const ACK: u8 = 0x10;
const SACK: u8 = 0x20;

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum PacketError {
    #[error("datagram shorter than the header")]
    TooShort,
    #[error("SACK flag set but no SACK sequence present")]
    MissingSack,
}

/// One PseudoTcp datagram: the header fields plus the payload.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    pub seq: u32,
    pub ack: u32,
    /// Reserved byte, carried but not interpreted.
    pub control: u8,
    flags: u8,
    pub window: u16,
    /// Sequence number of a received but not cumulatively acknowledged
    /// packet. Present on the wire only when the SACK flag is set.
    pub sack_seq: u32,
    pub payload: Payload,
}

impl Packet {
    pub fn new(seq: u32) -> Self {
        Self {
            seq,
            ..Default::default()
        }
    }

    pub fn is_syn(&self) -> bool {
        self.flags & SYN != 0
    }

    pub fn set_syn(&mut self, flag: bool) {
        self.set(SYN, flag);
    }

    pub fn is_ack(&self) -> bool {
        self.flags & ACK != 0
    }

    pub fn set_ack(&mut self, flag: bool) {
        self.set(ACK, flag);
    }

    pub fn is_rst(&self) -> bool {
        self.flags & RST != 0
    }

    pub fn set_rst(&mut self, flag: bool) {
        self.set(RST, flag);
    }

    pub fn is_fin(&self) -> bool {
        self.flags & FIN != 0
    }

    pub fn set_fin(&mut self, flag: bool) {
        self.set(FIN, flag);
    }

    pub fn is_sack(&self) -> bool {
        self.flags & SACK != 0
    }

    pub fn set_sack(&mut self, flag: bool) {
        self.set(SACK, flag);
    }

    fn set(&mut self, bit: u8, flag: bool) {
        if flag {
            self.flags |= bit;
        } else {
            self.flags &= !bit;
        }
    }

    /// Serializes the packet into one UDP datagram.
    pub fn encode(&self) -> Vec<u8> {
        let sack_len = if self.is_sack() { 4 } else { 0 };
        let mut out = Vec::with_capacity(HEADER_SIZE + sack_len + self.payload.len());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.ack.to_be_bytes());
        out.push(self.control);
        out.push(self.flags);
        out.extend_from_slice(&self.window.to_be_bytes());
        if self.is_sack() {
            out.extend_from_slice(&self.sack_seq.to_be_bytes());
        }
        out.extend(self.payload.bytes());
        out
    }

    /// Parses one received UDP datagram.
    pub fn decode(datagram: &[u8]) -> Result<Self, PacketError> {
        if datagram.len() < HEADER_SIZE {
            return Err(PacketError::TooShort);
        }
        let seq = u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
        let ack = u32::from_be_bytes([datagram[4], datagram[5], datagram[6], datagram[7]]);
        let control = datagram[8];
        let flags = datagram[9];
        let window = u16::from_be_bytes([datagram[10], datagram[11]]);
        let mut rest = &datagram[HEADER_SIZE..];
        let mut sack_seq = 0;
        if flags & SACK != 0 {
            if rest.len() < 4 {
                return Err(PacketError::MissingSack);
            }
            sack_seq = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
            rest = &rest[4..];
        }
        Ok(Self {
            seq,
            ack,
            control,
            flags,
            window,
            sack_seq,
            payload: Payload::new(rest),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_to_known_bytes() {
        let mut packet = Packet::new(0x01020304);
        packet.ack = 0x0a0b0c0d;
        packet.window = 0xbeef;
        packet.set_syn(true);
        packet.set_ack(true);
        let encoded = packet.encode();
        assert_eq!(
            encoded,
            vec![1, 2, 3, 4, 0x0a, 0x0b, 0x0c, 0x0d, 0, 0x12, 0xbe, 0xef]
        );
    }

    #[test]
    fn round_trips_with_payload() {
        let mut packet = Packet::new(500);
        packet.ack = 42;
        packet.window = 1024;
        packet.set_ack(true);
        packet.payload = Payload::new(b"some bytes");
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded.seq, 500);
        assert_eq!(decoded.ack, 42);
        assert_eq!(decoded.window, 1024);
        assert!(decoded.is_ack());
        assert!(!decoded.is_syn());
        assert_eq!(decoded.payload.to_vec(), b"some bytes");
    }

    #[test]
    fn sack_sequence_follows_header() {
        let mut packet = Packet::new(7);
        packet.set_ack(true);
        packet.set_sack(true);
        packet.sack_seq = 0x11223344;
        let encoded = packet.encode();
        assert_eq!(encoded.len(), HEADER_SIZE + 4);
        assert_eq!(&encoded[HEADER_SIZE..], &[0x11, 0x22, 0x33, 0x44]);
        let decoded = Packet::decode(&encoded).unwrap();
        assert!(decoded.is_sack());
        assert_eq!(decoded.sack_seq, 0x11223344);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn rejects_short_datagrams() {
        assert_eq!(Packet::decode(&[0; 11]).unwrap_err(), PacketError::TooShort);
        let mut truncated_sack = Packet::new(1);
        truncated_sack.set_sack(true);
        let mut encoded = truncated_sack.encode();
        encoded.truncate(HEADER_SIZE + 2);
        assert_eq!(Packet::decode(&encoded).unwrap_err(), PacketError::MissingSack);
    }
}
