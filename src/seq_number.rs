use std::fmt::{Display, Formatter};

/// A packet's position in the fixed-modulus send order.
///
/// The raw value is always in `[0, modulus)`. There is no globally meaningful
/// ordering between two sequence numbers - only the wraparound-relative
/// ordering defined by [`SequenceSpace::is_before`]. The derived `Ord` exists
/// solely so sequence numbers can live in ordered collections; circular
/// comparisons must go through the [`SequenceSpace`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SeqNumber(u32);

impl Display for SeqNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNumber {
    pub const ZERO: SeqNumber = SeqNumber(0);

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }
}

/// Wraparound-aware comparison and distance arithmetic over a fixed modulus.
///
/// Sequence numbers cycle back to zero after `modulus - 1`, so "is `a` ahead
/// of `b`" cannot be answered by comparing raw values. The standard
/// disambiguation is the half-modulus rule: `a` precedes `b` iff the forward
/// distance from `a` to `b` is non-zero and less than `modulus / 2`. Anything
/// at or beyond the half-way point is treated as `b` having wrapped behind
/// `a`.
#[derive(Copy, Clone, Debug)]
pub struct SequenceSpace {
    modulus: u32,
}

impl SequenceSpace {
    pub fn new(modulus: u32) -> SequenceSpace {
        assert!(modulus >= 4, "sequence space modulus must be at least 4");
        SequenceSpace { modulus }
    }

    pub fn modulus(&self) -> u32 {
        self.modulus
    }

    /// True iff `a` precedes `b` in circular order: `0 < ((b - a) mod m) < m/2`.
    ///
    /// Strict - `is_before(a, a)` is `false` for every `a`.
    pub fn is_before(&self, a: SeqNumber, b: SeqNumber) -> bool {
        let d = self.distance(a, b);
        d > 0 && d < self.modulus / 2
    }

    /// Forward distance `(b - a) mod m`.
    ///
    /// NB: callers sizing a gap must additionally check the result against
    /// `modulus / 2` - a wrapped value looks like a forward gap of nearly the
    /// whole modulus otherwise. [`Self::is_before`] performs that check.
    pub fn distance(&self, a: SeqNumber, b: SeqNumber) -> u32 {
        ((b.0 as u64 + self.modulus as u64 - a.0 as u64) % self.modulus as u64) as u32
    }

    /// The successor of `a`, and whether the increment crossed
    /// `modulus-1 -> 0` so callers can keep a wrap counter.
    pub fn advance(&self, a: SeqNumber) -> (SeqNumber, bool) {
        let next = (a.0 + 1) % self.modulus;
        (SeqNumber(next), next == 0)
    }
}
