use std::collections::BTreeSet;

use tracing::{debug, trace};

use crate::seq_number::{SeqNumber, SequenceSpace};
use crate::wire::Packet;

/// Receiver-side gap detection and cumulative acknowledgment.
///
/// `expected_seq` is the next-arrival pointer: it advances past forward jumps
/// (registering every skipped id as missing) and never regresses. A missing
/// entry is satisfied only by its own exact-match arrival - a later
/// retransmission of precisely that id.
///
/// The cumulative acknowledgment value is the earliest sequence number not
/// yet accounted for: the oldest open gap while one exists, `expected_seq`
/// otherwise. Everything circularly before that value has been received.
pub struct ReceiveTracker {
    space: SequenceSpace,
    expected_seq: SeqNumber,
    missing: BTreeSet<SeqNumber>,
    unique_count: u64,
    total_count: u64,
    wrap_count: u64,
}

impl ReceiveTracker {
    pub fn new(space: SequenceSpace) -> ReceiveTracker {
        ReceiveTracker {
            space,
            expected_seq: SeqNumber::ZERO,
            missing: BTreeSet::new(),
            unique_count: 0,
            total_count: 0,
            wrap_count: 0,
        }
    }

    /// Consumes one decoded packet and returns the cumulative acknowledgment
    /// value to send back.
    pub fn ingest(&mut self, packet: &Packet) -> SeqNumber {
        self.total_count += 1;
        let seq = packet.seq;

        if seq == self.expected_seq {
            self.unique_count += 1;
            let next = self.space.advance(seq).0;
            self.advance_expected_to(next);
        } else if self.space.is_before(self.expected_seq, seq) {
            // forward jump: everything in [expected_seq, seq) was skipped
            let mut cursor = self.expected_seq;
            while cursor != seq {
                self.missing.insert(cursor);
                cursor = self.space.advance(cursor).0;
            }
            debug!(
                "gap of {} ahead of #{} - frontier jumps to #{}",
                self.space.distance(self.expected_seq, seq),
                self.expected_seq,
                seq
            );
            self.unique_count += 1;
            let next = self.space.advance(seq).0;
            self.advance_expected_to(next);
        } else if self.missing.remove(&seq) {
            trace!("late arrival filled gap #{}", seq);
            self.unique_count += 1;
        } else {
            trace!("duplicate or stale packet #{} - ignoring", seq);
        }

        self.ack_value()
    }

    /// The earliest sequence number not yet accounted for.
    pub fn ack_value(&self) -> SeqNumber {
        // all missing entries are circularly behind the frontier, so the
        // oldest is the one farthest from it
        self.missing
            .iter()
            .max_by_key(|&&m| self.space.distance(m, self.expected_seq))
            .copied()
            .unwrap_or(self.expected_seq)
    }

    /// Ratio of uniquely-delivered packets to total transmission attempts
    /// seen, in `[0, 1]`.
    pub fn goodput(&self) -> f64 {
        if self.total_count == 0 {
            return 0.0;
        }
        self.unique_count as f64 / self.total_count as f64
    }

    pub fn expected_seq(&self) -> SeqNumber {
        self.expected_seq
    }

    pub fn missing_count(&self) -> u64 {
        self.missing.len() as u64
    }

    pub fn is_missing(&self, seq: SeqNumber) -> bool {
        self.missing.contains(&seq)
    }

    pub fn unique_count(&self) -> u64 {
        self.unique_count
    }

    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    pub fn wrap_count(&self) -> u64 {
        self.wrap_count
    }

    fn advance_expected_to(&mut self, next: SeqNumber) {
        // the frontier only moves forward by less than half the modulus, so
        // a smaller raw value means the advance crossed the wrap point
        if next.to_raw() < self.expected_seq.to_raw() {
            self.wrap_count += 1;
        }
        self.expected_seq = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    fn tracker() -> ReceiveTracker {
        ReceiveTracker::new(SequenceSpace::new(65536))
    }

    fn packet(seq: u32) -> Packet {
        Packet {
            seq: SeqNumber::from_raw(seq),
            window_hint: 4,
            retransmit_count: 0,
        }
    }

    fn ingest_all(tracker: &mut ReceiveTracker, seqs: &[u32]) -> SeqNumber {
        let mut ack = tracker.ack_value();
        for &seq in seqs {
            ack = tracker.ingest(&packet(seq));
        }
        ack
    }

    #[rstest]
    fn test_in_order_delivery() {
        let mut tracker = tracker();
        let ack = ingest_all(&mut tracker, &[0, 1, 2, 3]);

        assert_eq!(ack, SeqNumber::from_raw(4));
        assert_eq!(tracker.unique_count(), 4);
        assert_eq!(tracker.missing_count(), 0);
        assert_eq!(tracker.goodput(), 1.0);
    }

    #[rstest]
    fn test_gap_pins_ack_until_filled() {
        let mut tracker = tracker();

        // seq 3 skipped: ack is pinned at the gap
        let ack = ingest_all(&mut tracker, &[0, 1, 2, 4, 5]);
        assert_eq!(ack, SeqNumber::from_raw(3));
        assert!(tracker.is_missing(SeqNumber::from_raw(3)));
        assert_eq!(tracker.unique_count(), 4);
        assert_eq!(tracker.expected_seq(), SeqNumber::from_raw(6));

        // the exact-match arrival of 3 clears the gap and releases the ack
        let ack = tracker.ingest(&packet(3));
        assert_eq!(ack, SeqNumber::from_raw(6));
        assert_eq!(tracker.missing_count(), 0);
        assert_eq!(tracker.unique_count(), 5);
    }

    #[rstest]
    fn test_ack_pinned_at_oldest_of_several_gaps() {
        let mut tracker = tracker();
        let ack = ingest_all(&mut tracker, &[0, 2, 5]);

        assert_eq!(ack, SeqNumber::from_raw(1));
        assert!(tracker.is_missing(SeqNumber::from_raw(1)));
        assert!(tracker.is_missing(SeqNumber::from_raw(3)));
        assert!(tracker.is_missing(SeqNumber::from_raw(4)));

        // filling the oldest gap moves the ack to the next one
        let ack = tracker.ingest(&packet(1));
        assert_eq!(ack, SeqNumber::from_raw(3));
    }

    #[rstest]
    fn test_loss_injected_scenario() {
        // seq 2 never arrives: receiver sees 0,1,3
        let mut tracker = tracker();
        let ack = ingest_all(&mut tracker, &[0, 1, 3]);

        assert_eq!(ack, SeqNumber::from_raw(2));
        assert!(tracker.is_missing(SeqNumber::from_raw(2)));
        assert_eq!(tracker.unique_count(), 3);
        assert_eq!(tracker.total_count(), 3);
    }

    #[rstest]
    fn test_duplicates_count_toward_total_only() {
        let mut tracker = tracker();
        ingest_all(&mut tracker, &[0, 1, 1, 0]);

        assert_eq!(tracker.unique_count(), 2);
        assert_eq!(tracker.total_count(), 4);
        assert_eq!(tracker.goodput(), 0.5);
        assert_eq!(tracker.missing_count(), 0);
    }

    #[rstest]
    fn test_stale_packet_ignored() {
        let mut tracker = tracker();
        ingest_all(&mut tracker, &[0, 1, 2]);

        // 1 was already accounted for; nothing changes except the total
        let ack = tracker.ingest(&packet(1));
        assert_eq!(ack, SeqNumber::from_raw(3));
        assert_eq!(tracker.unique_count(), 3);
        assert_eq!(tracker.total_count(), 4);
    }

    #[rstest]
    fn test_goodput_zero_before_any_packet() {
        assert_eq!(tracker().goodput(), 0.0);
    }

    #[rstest]
    fn test_goodput_stays_in_unit_interval() {
        let mut tracker = tracker();
        ingest_all(&mut tracker, &[0, 5, 5, 5, 2, 9]);
        let goodput = tracker.goodput();
        assert!((0.0..=1.0).contains(&goodput));
    }

    #[rstest]
    fn test_wraparound_gap() {
        let space = SequenceSpace::new(8);
        let mut tracker = ReceiveTracker::new(space);

        ingest_all(&mut tracker, &[0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(tracker.wrap_count(), 0);

        // 7 is skipped; 1 (second lap) arrives - the gap crosses the wrap
        let ack = tracker.ingest(&packet(1));
        assert_eq!(ack, SeqNumber::from_raw(7));
        assert!(tracker.is_missing(SeqNumber::from_raw(7)));
        assert!(tracker.is_missing(SeqNumber::from_raw(0)));
        assert_eq!(tracker.expected_seq(), SeqNumber::from_raw(2));
        assert_eq!(tracker.wrap_count(), 1);

        // the old-lap 7 arrives late and clears the oldest gap
        let ack = tracker.ingest(&packet(7));
        assert_eq!(ack, SeqNumber::from_raw(0));
    }

    #[rstest]
    fn test_frontier_never_regresses() {
        let mut tracker = tracker();
        ingest_all(&mut tracker, &[0, 1, 2, 10]);
        let frontier = tracker.expected_seq();

        // stale and duplicate traffic must not move the frontier backwards
        ingest_all(&mut tracker, &[1, 2, 0]);
        assert_eq!(tracker.expected_seq(), frontier);
    }
}
