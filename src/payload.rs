//! Shared byte runs for the PseudoTcp buffers.
//!
//! The stream machinery moves the same bytes through several hands: an
//! application write lands in the send buffer, is carved into
//! MSS-sized segment payloads, and each payload then lives on the
//! retransmission queue until it is acknowledged while clones of it go
//! out on the wire. [`Payload`] makes all of that cheap: it is a queue
//! of reference-counted spans, so carving a segment off the front or
//! cloning a queued packet never copies the bytes themselves.

use std::collections::VecDeque;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

/// A window into one reference-counted allocation. Splitting a span
/// clones the `Arc`, not the bytes.
#[derive(Debug, Clone)]
struct Span {
    bytes: Arc<[u8]>,
    range: Range<usize>,
}

impl Span {
    fn as_slice(&self) -> &[u8] {
        &self.bytes[self.range.clone()]
    }

    fn len(&self) -> usize {
        self.range.len()
    }

    /// Divides the span after `mid` bytes, sharing the allocation
    /// between the halves.
    fn divide(self, mid: usize) -> (Span, Span) {
        let boundary = self.range.start + mid;
        let head = Span {
            bytes: self.bytes.clone(),
            range: self.range.start..boundary,
        };
        let tail = Span {
            bytes: self.bytes,
            range: boundary..self.range.end,
        };
        (head, tail)
    }
}

/// An ordered run of bytes assembled from shared spans.
///
/// Used for the PseudoTcp send and receive buffers and for segment
/// payloads. The operations are the ones the stream machinery needs:
/// [`Payload::append`] when the application writes or an in-order
/// segment arrives, [`Payload::split_off_front`] when the sender
/// carves the next segment (or a one-byte window probe), and
/// [`Payload::truncate`] when an arriving segment overruns the
/// advertised receive window and must be clipped.
#[derive(Debug, Clone, Default)]
pub struct Payload {
    spans: VecDeque<Span>,
    total: usize,
}

impl Payload {
    /// Copies the given bytes into a fresh single-span payload.
    pub fn new(bytes: impl AsRef<[u8]>) -> Self {
        let bytes: Arc<[u8]> = Arc::from(bytes.as_ref());
        if bytes.is_empty() {
            return Self::default();
        }
        let total = bytes.len();
        let mut spans = VecDeque::with_capacity(1);
        spans.push_back(Span {
            range: 0..total,
            bytes,
        });
        Self { spans, total }
    }

    /// Moves every byte of `tail` to the end of this payload.
    pub fn append(&mut self, mut tail: Payload) {
        self.total += tail.total;
        self.spans.append(&mut tail.spans);
    }

    /// Detaches the oldest `count` bytes into their own payload,
    /// sharing storage with whatever remains. This is segmentation:
    /// the returned run becomes one packet's payload.
    pub fn split_off_front(&mut self, count: usize) -> Payload {
        assert!(count <= self.total, "split past the end of the payload");
        let mut front = Payload::default();
        while front.total < count {
            let span = self.spans.pop_front().expect("span accounting broke");
            let wanted = count - front.total;
            if span.len() <= wanted {
                front.total += span.len();
                front.spans.push_back(span);
            } else {
                let (head, tail) = span.divide(wanted);
                front.total += head.len();
                front.spans.push_back(head);
                self.spans.push_front(tail);
            }
        }
        self.total -= count;
        front
    }

    /// Keeps only the first `count` bytes, dropping the rest. A
    /// request to keep more than is present keeps everything.
    pub fn truncate(&mut self, count: usize) {
        if count >= self.total {
            return;
        }
        let mut remaining = count;
        let mut kept = 0;
        for span in self.spans.iter_mut() {
            if remaining == 0 {
                break;
            }
            if span.len() > remaining {
                span.range.end = span.range.start + remaining;
            }
            remaining -= span.len().min(remaining);
            kept += 1;
        }
        self.spans.truncate(kept);
        self.total = count;
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Iterates over every byte, span by span.
    pub fn bytes(&self) -> impl Iterator<Item = u8> + '_ {
        self.spans
            .iter()
            .flat_map(|span| span.as_slice().iter().copied())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total);
        for span in &self.spans {
            out.extend_from_slice(span.as_slice());
        }
        out
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.total == other.total && self.bytes().eq(other.bytes())
    }
}

impl Eq for Payload {}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes in {} spans", self.total, self.spans.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_queue_in_order() {
        let mut buffer = Payload::new(b"GET /library.xml");
        buffer.append(Payload::new(b" HTTP/1.1"));
        assert_eq!(buffer.len(), 25);
        assert_eq!(buffer.to_vec(), b"GET /library.xml HTTP/1.1");
    }

    #[test]
    fn segmentation_carves_the_front() {
        // Two application writes, carved into 4-byte "segments" the
        // way the sender carves at the MSS.
        let mut send_buffer = Payload::new(b"abcdef");
        send_buffer.append(Payload::new(b"ghij"));

        let first = send_buffer.split_off_front(4);
        let second = send_buffer.split_off_front(4);
        assert_eq!(first.to_vec(), b"abcd");
        assert_eq!(second.to_vec(), b"efgh", "a segment may straddle writes");
        assert_eq!(send_buffer.to_vec(), b"ij");
        assert_eq!(send_buffer.len(), 2);
    }

    #[test]
    fn one_byte_probe_leaves_the_rest() {
        let mut send_buffer = Payload::new(b"0123456789");
        let probe = send_buffer.split_off_front(1);
        assert_eq!(probe.to_vec(), b"0");
        assert_eq!(send_buffer.len(), 9);
        assert_eq!(send_buffer.to_vec(), b"123456789");
    }

    #[test]
    fn splitting_everything_empties_the_buffer() {
        let mut buffer = Payload::new(b"whole");
        let all = buffer.split_off_front(5);
        assert_eq!(all.to_vec(), b"whole");
        assert!(buffer.is_empty());
        assert!(buffer.split_off_front(0).is_empty());
    }

    #[test]
    fn truncate_clips_to_the_window() {
        // An arriving segment larger than the advertised window is
        // clipped; only the in-window prefix is kept.
        let mut arriving = Payload::new(b"fits");
        arriving.append(Payload::new(b"-overflow"));
        arriving.truncate(4);
        assert_eq!(arriving.to_vec(), b"fits");

        arriving.truncate(100);
        assert_eq!(arriving.len(), 4, "over-long truncate keeps everything");

        arriving.truncate(0);
        assert!(arriving.is_empty());
    }

    #[test]
    fn truncate_mid_span() {
        let mut buffer = Payload::new(b"ab");
        buffer.append(Payload::new(b"cdef"));
        buffer.truncate(3);
        assert_eq!(buffer.to_vec(), b"abc");
    }

    #[test]
    fn clones_share_bytes_until_dropped() {
        // A queued packet's payload and the wire copy are clones; both
        // must read the same bytes independently.
        let mut send_buffer = Payload::new(b"retransmit me");
        let queued = send_buffer.split_off_front(10);
        let wire_copy = queued.clone();
        drop(send_buffer);
        assert_eq!(queued.to_vec(), b"retransmit");
        assert_eq!(wire_copy.to_vec(), b"retransmit");
    }

    #[test]
    fn equality_ignores_span_boundaries() {
        let mut stitched = Payload::new(b"lib");
        stitched.append(Payload::new(b"rary"));
        let whole = Payload::new(b"library");
        assert_eq!(stitched, whole);
        assert_ne!(stitched, Payload::new(b"librarx"));
        assert_ne!(stitched, Payload::new(b"librar"));
    }

    #[test]
    fn empty_payload_behaves() {
        let empty = Payload::new(b"");
        assert!(empty.is_empty());
        assert_eq!(empty.len(), 0);
        assert_eq!(empty.bytes().count(), 0);
        assert_eq!(empty.to_vec(), Vec::<u8>::new());
    }
}
