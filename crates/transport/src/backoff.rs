use std::time::Duration;

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};

const JITTER: f64 = 0.25;

/// Exponential backoff with +/-25% jitter from an injectable RNG.
pub struct Backoff {
    initial: Duration,
    max: Duration,
    rng: Mutex<StdRng>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self { Self::with_rng(initial, max, StdRng::from_entropy()) }

    pub fn with_rng(initial: Duration, max: Duration, rng: StdRng) -> Self { Self { initial, max, rng: Mutex::new(rng) } }

    /// Delay before retry number `attempt` (1-based): `initial * 2^(attempt-1)`, jittered, capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let base = self.initial.saturating_mul(1u32 << exp).min(self.max);
        let factor = self.rng.lock().gen_range((1.0 - JITTER)..=(1.0 + JITTER));
        base.mul_f64(factor).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> Backoff {
        Backoff::with_rng(Duration::from_secs(1), Duration::from_secs(30), StdRng::seed_from_u64(7))
    }

    #[test]
    fn grows_exponentially_within_jitter_bounds() {
        let b = seeded();
        for (attempt, base) in [(1u32, 1.0f64), (2, 2.0), (3, 4.0), (4, 8.0), (5, 16.0)] {
            let d = b.delay(attempt).as_secs_f64();
            assert!(d >= base * 0.75 - 1e-9 && d <= base * 1.25 + 1e-9, "attempt {attempt}: {d}");
        }
    }

    #[test]
    fn capped_at_max() {
        let b = seeded();
        for attempt in [6u32, 10, 40, u32::MAX] {
            assert!(b.delay(attempt) <= Duration::from_secs(30));
        }
    }

    #[test]
    fn same_seed_same_sequence() {
        let a = seeded();
        let b = seeded();
        let sa: Vec<_> = (1..6).map(|n| a.delay(n)).collect();
        let sb: Vec<_> = (1..6).map(|n| b.delay(n)).collect();
        assert_eq!(sa, sb);
    }
}
