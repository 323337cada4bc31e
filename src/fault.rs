use std::collections::VecDeque;

#[cfg(test)]
use mockall::automock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// The simulated fault source consulted before every transmit attempt.
///
/// Loss injection is a test-harness concern, not protocol logic - production
/// use supplies [`NoFaults`]. The trait is the narrow seam through which the
/// sender interacts with the fault model.
#[cfg_attr(test, automock)]
pub trait FaultInjector: Send + 'static {
    /// True iff the current transmit attempt should be treated as lost.
    fn should_drop(&mut self) -> bool;
}

/// Pass-through injector: nothing is ever dropped.
pub struct NoFaults;

impl FaultInjector for NoFaults {
    fn should_drop(&mut self) -> bool {
        false
    }
}

/// Drops each transmit attempt independently with a fixed probability.
pub struct RandomLoss {
    probability: f64,
    rng: StdRng,
}

impl RandomLoss {
    pub fn new(probability: f64) -> RandomLoss {
        Self::with_rng(probability, StdRng::from_entropy())
    }

    /// Seeded variant so harness runs are reproducible.
    pub fn seeded(probability: f64, seed: u64) -> RandomLoss {
        Self::with_rng(probability, StdRng::seed_from_u64(seed))
    }

    fn with_rng(probability: f64, rng: StdRng) -> RandomLoss {
        assert!(
            (0.0..=1.0).contains(&probability),
            "drop probability must be in [0, 1]"
        );
        RandomLoss { probability, rng }
    }
}

impl FaultInjector for RandomLoss {
    fn should_drop(&mut self) -> bool {
        self.rng.gen::<f64>() < self.probability
    }
}

/// Replays a fixed script of drop decisions, then passes everything through.
///
/// Deterministic by construction, which makes window state transitions exactly
/// reproducible in tests.
pub struct ScriptedFaults {
    script: VecDeque<bool>,
}

impl ScriptedFaults {
    pub fn new(script: impl IntoIterator<Item = bool>) -> ScriptedFaults {
        ScriptedFaults {
            script: script.into_iter().collect(),
        }
    }
}

impl FaultInjector for ScriptedFaults {
    fn should_drop(&mut self) -> bool {
        self.script.pop_front().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    fn test_no_faults_never_drops() {
        let mut injector = NoFaults;
        assert!((0..1000).all(|_| !injector.should_drop()));
    }

    #[rstest]
    #[case::always(1.0, 1000)]
    #[case::never(0.0, 0)]
    fn test_random_loss_extremes(#[case] probability: f64, #[case] expected_drops: usize) {
        let mut injector = RandomLoss::seeded(probability, 42);
        let drops = (0..1000).filter(|_| injector.should_drop()).count();
        assert_eq!(drops, expected_drops);
    }

    #[rstest]
    fn test_random_loss_seeded_is_reproducible() {
        let mut a = RandomLoss::seeded(0.5, 7);
        let mut b = RandomLoss::seeded(0.5, 7);
        let decisions_a: Vec<bool> = (0..100).map(|_| a.should_drop()).collect();
        let decisions_b: Vec<bool> = (0..100).map(|_| b.should_drop()).collect();
        assert_eq!(decisions_a, decisions_b);
    }

    #[rstest]
    fn test_scripted_faults_replays_then_passes_through() {
        let mut injector = ScriptedFaults::new([true, false, true]);
        assert!(injector.should_drop());
        assert!(!injector.should_drop());
        assert!(injector.should_drop());
        assert!(!injector.should_drop());
        assert!(!injector.should_drop());
    }
}
