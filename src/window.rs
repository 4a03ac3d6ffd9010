//! Sliding-window fragment buffer
//!
//! One buffer per user per direction. IP datagrams are split into fragments
//! of at most `max_fragment` bytes; fragments travel with an 8-bit sequence
//! id, `start`/`end` datagram boundary flags, and an optional piggybacked
//! ACK for the opposite direction. The live window is kept well under half
//! the sequence space so wraparound is never ambiguous.

use std::time::{Duration, Instant};

/// Default interval before an unacked, sent fragment becomes eligible for
/// retransmission.
const DEFAULT_RETRANSMIT: Duration = Duration::from_millis(1000);

/// One fragment of an IP datagram.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub seq: u8,
    pub data: Vec<u8>,
    pub compressed: bool,
    pub start: bool,
    pub end: bool,
    /// ACK for the opposite direction, stamped when the fragment is picked
    /// for sending.
    pub ack_other: Option<u8>,
}

impl Fragment {
    pub fn new(seq: u8, data: Vec<u8>, compressed: bool, start: bool, end: bool) -> Self {
        Fragment {
            seq,
            data,
            compressed,
            start,
            end,
            ack_other: None,
        }
    }
}

#[derive(Debug)]
struct Slot {
    fragment: Fragment,
    acked: bool,
    retries: u32,
    last_sent: Option<Instant>,
}

/// Per-direction window of in-flight fragments.
#[derive(Debug)]
pub struct WindowBuffer {
    slots: Vec<Option<Slot>>,
    /// Ring index holding the fragment with sequence id `start_seq`.
    head: usize,
    /// Sequence id at the base of the window. Only ever advances.
    start_seq: u8,
    /// Next sequence id to assign to an outgoing fragment.
    next_seq: u8,
    occupied: usize,
    windowsize: usize,
    max_fragment: usize,
    retransmit: Duration,
}

impl WindowBuffer {
    /// `length` is the ring capacity, `windowsize` bounds concurrently
    /// unacked fragments, `max_fragment` bounds fragment payload size.
    ///
    /// Panics if the ring reaches half the 8-bit sequence space; sequence
    /// wrap is only unambiguous while the live window stays shorter.
    pub fn new(length: usize, windowsize: usize, max_fragment: usize) -> Self {
        assert!(length > 0 && length < 128, "window ring must be 1..128 slots");
        assert!(windowsize > 0 && windowsize <= length);
        let mut slots = Vec::with_capacity(length);
        slots.resize_with(length, || None);
        WindowBuffer {
            slots,
            head: 0,
            start_seq: 0,
            next_seq: 0,
            occupied: 0,
            windowsize,
            max_fragment,
            retransmit: DEFAULT_RETRANSMIT,
        }
    }

    pub fn with_retransmit_timeout(mut self, interval: Duration) -> Self {
        self.retransmit = interval;
        self
    }

    /// Drop all buffered fragments and rewind sequence state.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.head = 0;
        self.start_seq = 0;
        self.next_seq = 0;
        self.occupied = 0;
    }

    pub fn windowsize(&self) -> usize {
        self.windowsize
    }

    pub fn start_seq(&self) -> u8 {
        self.start_seq
    }

    pub fn max_fragment(&self) -> usize {
        self.max_fragment
    }

    /// Downstream fragment size is renegotiated by the fragsize commands.
    pub fn set_max_fragment(&mut self, max_fragment: usize) {
        self.max_fragment = max_fragment.max(1);
    }

    pub fn available(&self) -> usize {
        self.slots.len() - self.occupied
    }

    fn seq_offset(&self, seq: u8) -> usize {
        seq.wrapping_sub(self.start_seq) as usize
    }

    fn ring_index(&self, offset: usize) -> usize {
        (self.head + offset) % self.slots.len()
    }

    /// Split a datagram into fragments queued for sending. Returns `false`
    /// without queueing anything when free capacity is insufficient; the
    /// caller must drop the datagram rather than retry blindly.
    pub fn add_outgoing(&mut self, data: &[u8], compressed: bool) -> bool {
        if data.is_empty() {
            return false;
        }
        let nfrags = data.len().div_ceil(self.max_fragment);
        if nfrags > self.available() {
            log::debug!(
                "window full: {} fragments needed, {} slots free",
                nfrags,
                self.available()
            );
            return false;
        }
        let last = nfrags - 1;
        for (i, chunk) in data.chunks(self.max_fragment).enumerate() {
            let seq = self.next_seq;
            self.next_seq = self.next_seq.wrapping_add(1);
            let offset = self.seq_offset(seq);
            let idx = self.ring_index(offset);
            self.slots[idx] = Some(Slot {
                fragment: Fragment::new(seq, chunk.to_vec(), compressed, i == 0, i == last),
                acked: false,
                retries: 0,
                last_sent: None,
            });
            self.occupied += 1;
        }
        log::debug!(
            "queued {} bytes as {} fragments, seq {}..{}",
            data.len(),
            nfrags,
            self.next_seq.wrapping_sub(nfrags as u8),
            self.next_seq.wrapping_sub(1)
        );
        true
    }

    /// Fragments currently eligible to send: inside the window, unacked,
    /// and either never sent or past the retransmit interval.
    pub fn sending(&self) -> usize {
        let now = Instant::now();
        (0..self.windowsize.min(self.slots.len()))
            .filter_map(|offset| self.slots[self.ring_index(offset)].as_ref())
            .filter(|slot| !slot.acked && Self::needs_send(slot, now, self.retransmit))
            .count()
    }

    fn needs_send(slot: &Slot, now: Instant, retransmit: Duration) -> bool {
        match slot.last_sent {
            None => true,
            Some(at) => now.duration_since(at) >= retransmit,
        }
    }

    /// Pick the oldest sendable fragment inside the window, consuming
    /// `pending_ack` as its piggyback. Returns a snapshot for the wire.
    pub fn next_sending_fragment(&mut self, pending_ack: &mut Option<u8>) -> Option<Fragment> {
        let now = Instant::now();
        for offset in 0..self.windowsize.min(self.slots.len()) {
            let idx = self.ring_index(offset);
            let Some(slot) = self.slots[idx].as_mut() else {
                continue;
            };
            if slot.acked || !Self::needs_send(slot, now, self.retransmit) {
                continue;
            }
            if slot.retries > 0 {
                log::debug!("retransmit seq {} (retry {})", slot.fragment.seq, slot.retries);
            }
            slot.fragment.ack_other = pending_ack.take();
            slot.retries += 1;
            slot.last_sent = Some(now);
            return Some(slot.fragment.clone());
        }
        None
    }

    /// Place a received fragment into the window. Duplicates and
    /// out-of-window fragments change nothing; the returned sequence id is
    /// ACKed either way so the peer stops retransmitting.
    pub fn process_incoming_fragment(&mut self, frag: Fragment) -> u8 {
        let seq = frag.seq;
        let offset = self.seq_offset(seq);
        if offset >= self.slots.len() {
            log::debug!(
                "fragment seq {} outside window (start {}), dropped",
                seq,
                self.start_seq
            );
            return seq;
        }
        let idx = self.ring_index(offset);
        if self.slots[idx].is_none() {
            self.slots[idx] = Some(Slot {
                fragment: frag,
                acked: false,
                retries: 0,
                last_sent: None,
            });
            self.occupied += 1;
        }
        seq
    }

    /// Reassemble the datagram at the window head, if its full
    /// `start..=end` run is present. Frees the run and advances the base so
    /// the same datagram can never be delivered twice.
    pub fn reassemble(&mut self) -> Option<(Vec<u8>, bool)> {
        // a head fragment without a start flag is a stray from a
        // half-evicted datagram; discard so the window cannot stall
        while let Some(slot) = self.slots[self.head].as_ref() {
            if slot.fragment.start {
                break;
            }
            log::debug!("dropping stray head fragment seq {}", slot.fragment.seq);
            self.slots[self.head] = None;
            self.occupied -= 1;
            self.advance_head(1);
        }

        let mut run = 0usize;
        let mut complete = false;
        while run < self.slots.len() {
            match self.slots[self.ring_index(run)].as_ref() {
                Some(slot) => {
                    let end = slot.fragment.end;
                    run += 1;
                    if end {
                        complete = true;
                        break;
                    }
                }
                None => break,
            }
        }
        if !complete {
            return None;
        }

        let mut data = Vec::new();
        let mut compressed = false;
        for i in 0..run {
            let idx = self.ring_index(i);
            let slot = self.slots[idx].take().expect("run verified contiguous");
            if i == 0 {
                compressed = slot.fragment.compressed;
            }
            data.extend_from_slice(&slot.fragment.data);
        }
        self.occupied -= run;
        self.advance_head(run);
        log::debug!("reassembled {} bytes from {} fragments", data.len(), run);
        Some((data, compressed))
    }

    fn advance_head(&mut self, by: usize) {
        self.head = (self.head + by) % self.slots.len();
        self.start_seq = self.start_seq.wrapping_add(by as u8);
    }

    /// Mark a fragment acknowledged; when the head is acked the window base
    /// slides over every newly contiguous acked fragment.
    pub fn ack(&mut self, seq: u8) {
        let offset = self.seq_offset(seq);
        if offset >= self.slots.len() {
            return; // stale ACK from before the window advanced
        }
        let idx = self.ring_index(offset);
        if let Some(slot) = self.slots[idx].as_mut() {
            slot.acked = true;
        }
        self.tick();
    }

    /// Slide the window base over acked fragments at the head.
    pub fn tick(&mut self) {
        while let Some(slot) = self.slots[self.head].as_ref() {
            if !slot.acked {
                break;
            }
            self.slots[self.head] = None;
            self.occupied -= 1;
            self.advance_head(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> WindowBuffer {
        WindowBuffer::new(64, 8, 10)
    }

    #[test]
    #[should_panic]
    fn ring_must_stay_under_half_seq_space() {
        WindowBuffer::new(128, 8, 10);
    }

    #[test]
    fn split_sets_boundary_flags() {
        let mut w = buffer();
        assert!(w.add_outgoing(&[7u8; 25], false));
        let mut none = None;
        let f0 = w.next_sending_fragment(&mut none).unwrap();
        assert!(f0.start && !f0.end);
        assert_eq!(f0.data.len(), 10);
        let f1 = w.next_sending_fragment(&mut none).unwrap();
        assert!(!f1.start && !f1.end);
        let f2 = w.next_sending_fragment(&mut none).unwrap();
        assert!(!f2.start && f2.end);
        assert_eq!(f2.data.len(), 5);
        assert!(w.next_sending_fragment(&mut none).is_none());
    }

    #[test]
    fn rejects_when_capacity_insufficient() {
        let mut w = WindowBuffer::new(4, 4, 10);
        assert!(w.add_outgoing(&[1u8; 30], false)); // 3 fragments
        assert!(!w.add_outgoing(&[2u8; 20], false)); // needs 2, only 1 free
        assert_eq!(w.available(), 1);
    }

    #[test]
    fn piggyback_ack_is_consumed_once() {
        let mut w = buffer();
        w.add_outgoing(&[1u8; 15], false);
        let mut pending = Some(42u8);
        let f0 = w.next_sending_fragment(&mut pending).unwrap();
        assert_eq!(f0.ack_other, Some(42));
        assert_eq!(pending, None);
        let f1 = w.next_sending_fragment(&mut pending).unwrap();
        assert_eq!(f1.ack_other, None);
    }

    #[test]
    fn fragment_round_trip_any_order_with_duplicates() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(137).collect();
        let mut tx = buffer();
        assert!(tx.add_outgoing(&payload, true));

        let mut fragments = Vec::new();
        let mut none = None;
        while let Some(f) = tx.next_sending_fragment(&mut none) {
            fragments.push(f);
        }

        // worst-case arrival: reversed, then everything again as duplicates
        let mut rx = buffer();
        let replay = fragments.clone();
        for f in fragments.into_iter().rev().chain(replay) {
            let ack = rx.process_incoming_fragment(f.clone());
            assert_eq!(ack, f.seq);
        }
        let (data, compressed) = rx.reassemble().unwrap();
        assert_eq!(data, payload);
        assert!(compressed);
        // a datagram is delivered exactly once
        assert!(rx.reassemble().is_none());
        assert_eq!(rx.available(), 64);
    }

    #[test]
    fn partial_run_does_not_reassemble() {
        let mut tx = buffer();
        tx.add_outgoing(&[9u8; 30], false);
        let mut none = None;
        let f0 = tx.next_sending_fragment(&mut none).unwrap();
        let _f1 = tx.next_sending_fragment(&mut none).unwrap();
        let f2 = tx.next_sending_fragment(&mut none).unwrap();

        let mut rx = buffer();
        rx.process_incoming_fragment(f0);
        rx.process_incoming_fragment(f2);
        assert!(rx.reassemble().is_none());
    }

    #[test]
    fn ack_advances_base_over_contiguous_run() {
        let mut w = buffer();
        w.add_outgoing(&[1u8; 30], false); // seqs 0,1,2
        let mut none = None;
        while w.next_sending_fragment(&mut none).is_some() {}

        w.ack(1); // out of order: base must not move yet
        assert_eq!(w.start_seq(), 0);
        w.ack(0);
        assert_eq!(w.start_seq(), 2);
        w.ack(2);
        assert_eq!(w.start_seq(), 3);
        assert_eq!(w.available(), 64);
    }

    #[test]
    fn stale_ack_is_ignored() {
        let mut w = buffer();
        w.add_outgoing(&[1u8; 5], false);
        let mut none = None;
        w.next_sending_fragment(&mut none);
        w.ack(0);
        let base = w.start_seq();
        w.ack(200); // far outside the live window
        assert_eq!(w.start_seq(), base);
    }

    #[test]
    fn retransmit_after_timeout() {
        let mut w = WindowBuffer::new(8, 4, 10).with_retransmit_timeout(Duration::ZERO);
        w.add_outgoing(&[3u8; 5], false);
        let mut none = None;
        let first = w.next_sending_fragment(&mut none).unwrap();
        let again = w.next_sending_fragment(&mut none).unwrap();
        assert_eq!(first.seq, again.seq);
        w.ack(first.seq);
        assert!(w.next_sending_fragment(&mut none).is_none());
    }

    #[test]
    fn windowsize_bounds_outstanding_fragments() {
        let mut w = WindowBuffer::new(16, 2, 10);
        w.add_outgoing(&[5u8; 60], false); // 6 fragments queued
        let mut none = None;
        assert!(w.next_sending_fragment(&mut none).is_some());
        assert!(w.next_sending_fragment(&mut none).is_some());
        // third is outside the send window until the base advances
        assert!(w.next_sending_fragment(&mut none).is_none());
        w.ack(0);
        assert!(w.next_sending_fragment(&mut none).is_some());
    }

    #[test]
    fn sequence_wrap_round_trip() {
        let mut tx = buffer();
        let mut rx = buffer();
        // push both windows close to the 8-bit wrap point
        for _ in 0..50 {
            tx.add_outgoing(&[0xAB; 50], false); // 5 fragments each
            let mut none = None;
            while let Some(f) = tx.next_sending_fragment(&mut none) {
                let seq = rx.process_incoming_fragment(f);
                tx.ack(seq);
            }
            let (data, _) = rx.reassemble().unwrap();
            assert_eq!(data.len(), 50);
        }
        assert_eq!(tx.start_seq(), rx.start_seq());
        assert_eq!(tx.start_seq(), 250); // 50 datagrams x 5 fragments, mod 256
    }
}
