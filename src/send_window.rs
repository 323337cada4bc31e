use std::cmp::min;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::time::Instant;

use tracing::{debug, trace};

use crate::fault::FaultInjector;
use crate::seq_number::{SeqNumber, SequenceSpace};
use crate::wire::Packet;

#[derive(Clone)]
pub struct SendWindowConfig {
    /// Hard lower bound for the adaptive window. Never below 1.
    pub window_min: u32,
    pub window_initial: u32,
    pub window_max: u32,
    /// Fixed reduced ceiling applied to the window after a lossy cycle.
    pub window_loss_ceiling: u32,
    /// Retransmission attempts per packet before permanent abandonment.
    pub max_retries: u32,
    /// A retransmit/adaptation cycle becomes due every this many newly
    /// admitted packets. Counter-driven rather than timer-driven, so runs
    /// are deterministic under replay.
    pub retransmit_cadence: u32,
}

impl Default for SendWindowConfig {
    fn default() -> Self {
        SendWindowConfig {
            window_min: 1,
            window_initial: 4,
            window_max: 1024,
            window_loss_ceiling: 512,
            max_retries: 5,
            retransmit_cadence: 100,
        }
    }
}

/// Admission refused: the window is fully occupied by unacknowledged packets.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct WindowFull;

impl Display for WindowFull {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "send window is full")
    }
}

impl std::error::Error for WindowFull {}

/// Outcome of admitting one packet.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Admission {
    /// The caller must put this packet on the wire.
    Send(Packet),
    /// The simulated channel ate the packet; nothing goes on the wire and
    /// the entry waits in the dropped set for the next retransmit cycle.
    Lost(Packet),
}

/// Outcome of one retransmit cycle.
#[derive(Debug, Default)]
pub struct CycleOutcome {
    /// Packets that passed the fault injector; the caller transmits them.
    pub resend: Vec<Packet>,
    /// Sequence numbers permanently abandoned this cycle, with their final
    /// retransmit count for the histogram.
    pub abandoned: Vec<(SeqNumber, u32)>,
}

struct OutstandingEntry {
    retransmit_count: u32,
    #[allow(dead_code)]
    sent_at: Instant,
}

struct DroppedEntry {
    retransmit_count: u32,
}

/// Sender-side sliding window: admission, cumulative ack processing,
/// cadence-driven retransmission, and AIMD window adaptation.
///
/// Per-sequence state machine:
/// `NEW -> OUTSTANDING -> { ACKED (entry deleted) | DROPPED }`;
/// `DROPPED -> OUTSTANDING` on a successful retransmit, or `ABANDONED`
/// (entry deleted, counted) once the retry ceiling is reached.
///
/// A sequence number is never in both the outstanding and the dropped set.
pub struct SendWindow {
    config: SendWindowConfig,
    space: SequenceSpace,
    fault: Box<dyn FaultInjector>,

    next_seq: SeqNumber,
    outstanding: BTreeMap<SeqNumber, OutstandingEntry>,
    dropped: BTreeMap<SeqNumber, DroppedEntry>,
    window_size: u32,

    admitted_count: u64,
    admitted_since_cycle: u32,
    loss_signals_this_cycle: u32,

    transmit_attempts: u64,
    confirmed_delivered: u64,
    abandoned_count: u64,
    /// Oldest abandoned sequence number; the cumulative ack can never move
    /// past it.
    abandoned_floor: Option<SeqNumber>,
    wrap_count: u64,
}

impl SendWindow {
    pub fn new(
        config: SendWindowConfig,
        space: SequenceSpace,
        fault: Box<dyn FaultInjector>,
    ) -> SendWindow {
        assert!(config.window_min >= 1, "window_min must be at least 1");
        assert!(
            config.window_min <= config.window_max,
            "window_min must not exceed window_max"
        );
        let window_size = config
            .window_initial
            .clamp(config.window_min, config.window_max);

        SendWindow {
            config,
            space,
            fault,
            next_seq: SeqNumber::ZERO,
            outstanding: BTreeMap::new(),
            dropped: BTreeMap::new(),
            window_size,
            admitted_count: 0,
            admitted_since_cycle: 0,
            loss_signals_this_cycle: 0,
            transmit_attempts: 0,
            confirmed_delivered: 0,
            abandoned_count: 0,
            abandoned_floor: None,
            wrap_count: 0,
        }
    }

    /// Admits the next sequence number into the window, consulting the fault
    /// injector for the transmit attempt.
    pub fn admit(&mut self, now: Instant) -> Result<Admission, WindowFull> {
        if self.outstanding.len() as u32 >= self.window_size {
            return Err(WindowFull);
        }

        let seq = self.next_seq;
        let (next, wrapped) = self.space.advance(seq);
        self.next_seq = next;
        if wrapped {
            self.wrap_count += 1;
            debug!("sequence numbers wrapped (lap {})", self.wrap_count);
        }

        self.admitted_count += 1;
        self.admitted_since_cycle += 1;
        self.transmit_attempts += 1;

        let packet = Packet {
            seq,
            window_hint: self.window_size,
            retransmit_count: 0,
        };
        self.outstanding.insert(
            seq,
            OutstandingEntry {
                retransmit_count: 0,
                sent_at: now,
            },
        );

        if self.fault.should_drop() {
            self.on_loss_signal(seq);
            trace!("packet #{} lost in the simulated channel", seq);
            Ok(Admission::Lost(packet))
        } else {
            Ok(Admission::Send(packet))
        }
    }

    /// Applies a cumulative acknowledgment: every outstanding entry
    /// circularly before `ack` is confirmed delivered and removed.
    ///
    /// Returns the removed entries' `(seq, retransmit_count)` pairs so the
    /// caller can feed the retransmission histogram. Out-of-order or stale
    /// acks are harmless - an older ack simply confirms nothing.
    pub fn on_ack(&mut self, ack: SeqNumber) -> Vec<(SeqNumber, u32)> {
        let acked: Vec<SeqNumber> = self
            .outstanding
            .keys()
            .filter(|&&seq| self.space.is_before(seq, ack))
            .copied()
            .collect();

        let mut removed = Vec::with_capacity(acked.len());
        for seq in acked {
            let entry = self.outstanding.remove(&seq).expect("key collected above");
            removed.push((seq, entry.retransmit_count));
        }

        if !removed.is_empty() {
            trace!("ack #{} confirmed {} packets", ack, removed.len());
            self.confirmed_delivered += removed.len() as u64;
        }
        removed
    }

    /// Signals that an outstanding packet never reached the receiver. The
    /// entry moves to the dropped set, retransmit count preserved, and the
    /// loss feeds the current adaptation cycle.
    pub fn on_loss_signal(&mut self, seq: SeqNumber) {
        if let Some(entry) = self.outstanding.remove(&seq) {
            self.dropped.insert(
                seq,
                DroppedEntry {
                    retransmit_count: entry.retransmit_count,
                },
            );
            self.loss_signals_this_cycle += 1;
        }
    }

    /// Transport-level send failure: the packet never made it onto the wire.
    /// The entry moves to the dropped set with its attempt count unchanged
    /// and is retried on the next cycle. Not a congestion signal, so it does
    /// not feed window adaptation.
    pub fn on_send_failed(&mut self, seq: SeqNumber) {
        if let Some(entry) = self.outstanding.remove(&seq) {
            debug!("send of packet #{} failed - queued for retransmission", seq);
            self.dropped.insert(
                seq,
                DroppedEntry {
                    retransmit_count: entry.retransmit_count,
                },
            );
        }
    }

    /// True once enough packets have been admitted since the last cycle.
    pub fn cycle_due(&self) -> bool {
        self.admitted_since_cycle >= self.config.retransmit_cadence
    }

    /// Runs one retransmit cycle over the dropped set.
    ///
    /// Entries still under the retry ceiling get one more attempt through the
    /// fault injector: success moves them back to outstanding (the caller
    /// transmits the returned packets), failure leaves them dropped with the
    /// incremented count. Entries already at the ceiling are permanently
    /// abandoned.
    pub fn retransmit_cycle(&mut self, now: Instant) -> CycleOutcome {
        self.admitted_since_cycle = 0;
        let mut outcome = CycleOutcome::default();

        let pending: Vec<SeqNumber> = self.dropped.keys().copied().collect();
        for seq in pending {
            let current = self
                .dropped
                .get(&seq)
                .map(|e| e.retransmit_count)
                .expect("key collected above");

            if current >= self.config.max_retries {
                self.dropped.remove(&seq);
                debug!(
                    "packet #{} abandoned after {} retransmissions",
                    seq, current
                );
                self.abandoned_count += 1;
                self.note_abandoned(seq);
                outcome.abandoned.push((seq, current));
                continue;
            }

            let attempt = current + 1;
            self.transmit_attempts += 1;

            if self.fault.should_drop() {
                self.dropped
                    .get_mut(&seq)
                    .expect("key collected above")
                    .retransmit_count = attempt;
                self.loss_signals_this_cycle += 1;
                trace!("retransmission {} of packet #{} lost again", attempt, seq);
            } else {
                self.dropped.remove(&seq);
                self.outstanding.insert(
                    seq,
                    OutstandingEntry {
                        retransmit_count: attempt,
                        sent_at: now,
                    },
                );
                outcome.resend.push(Packet {
                    seq,
                    window_hint: self.window_size,
                    retransmit_count: attempt,
                });
            }
        }
        outcome
    }

    /// AIMD adaptation over the cycle that just ended: a clean cycle doubles
    /// the window up to the maximum, a lossy cycle caps it at the fixed
    /// reduced ceiling. The result always stays within `[min, max]`.
    pub fn adjust_window_size(&mut self) {
        let before = self.window_size;
        if self.loss_signals_this_cycle == 0 {
            self.window_size = min(self.window_size.saturating_mul(2), self.config.window_max);
        } else {
            self.window_size = min(self.window_size, self.config.window_loss_ceiling);
        }
        self.window_size = self
            .window_size
            .clamp(self.config.window_min, self.config.window_max);

        if self.window_size != before {
            debug!(
                "window size {} -> {} ({} loss signals this cycle)",
                before, self.window_size, self.loss_signals_this_cycle
            );
        }
        self.loss_signals_this_cycle = 0;
    }

    /// Releases outstanding entries that can never be cumulatively
    /// acknowledged because an abandoned gap precedes them, returning the
    /// released sequence numbers. They reached the wire of a reliable
    /// transport, so they count as delivered.
    pub fn release_unackable(&mut self) -> Vec<SeqNumber> {
        let Some(floor) = self.abandoned_floor else {
            return Vec::new();
        };

        let releasable: Vec<SeqNumber> = self
            .outstanding
            .keys()
            .filter(|&&seq| !self.space.is_before(seq, floor))
            .copied()
            .collect();
        for seq in &releasable {
            self.outstanding.remove(seq);
        }
        self.confirmed_delivered += releasable.len() as u64;
        releasable
    }

    fn note_abandoned(&mut self, seq: SeqNumber) {
        self.abandoned_floor = Some(match self.abandoned_floor {
            Some(floor) if self.space.is_before(floor, seq) => floor,
            _ => seq,
        });
    }

    pub fn window_size(&self) -> u32 {
        self.window_size
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn dropped_len(&self) -> usize {
        self.dropped.len()
    }

    /// Total packets admitted, whether they reached the wire or not.
    pub fn admitted_count(&self) -> u64 {
        self.admitted_count
    }

    /// Total transmit attempts: admissions plus every retransmission attempt.
    pub fn transmit_attempts(&self) -> u64 {
        self.transmit_attempts
    }

    pub fn confirmed_delivered(&self) -> u64 {
        self.confirmed_delivered
    }

    pub fn abandoned_count(&self) -> u64 {
        self.abandoned_count
    }

    pub fn wrap_count(&self) -> u64 {
        self.wrap_count
    }

    /// True when no packet is tracked any more - everything admitted was
    /// acknowledged, released, or abandoned.
    pub fn is_drained(&self) -> bool {
        self.outstanding.is_empty() && self.dropped.is_empty()
    }
}
