//! Jitter applied on top of computed retry delays.
//!
//! Jitter here only ever *adds* time. The retry engine guarantees a lower bound on every wait
//! (a rate-limit retry never sleeps less than the server's `Retry-After`), so strategies that
//! shrink the delay (full/equal jitter) are not offered.
//!
//! RNG: `rand`'s thread-local RNG by default; deterministic RNGs can be injected through
//! [`Jitter::apply_with_rng`].

use rand::{rng, Rng};
use std::time::Duration;

/// Jitter strategy for randomizing retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Jitter {
    /// Use the exact computed delay.
    #[default]
    None,
    /// Add a uniform random extra in `[0, delay · fraction]`.
    Proportional(f64),
}

impl Jitter {
    /// Proportional jitter; `fraction` is clamped into `[0, 1]`.
    pub fn proportional(fraction: f64) -> Self {
        let fraction = if fraction.is_finite() { fraction.clamp(0.0, 1.0) } else { 0.0 };
        Jitter::Proportional(fraction)
    }

    /// Apply jitter to a delay duration.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rng())
    }

    /// Apply jitter with a custom RNG (for testing).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match *self {
            Jitter::None => delay,
            Jitter::Proportional(fraction) => {
                let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                let spread = (millis as f64 * fraction) as u64;
                if spread == 0 {
                    return delay;
                }
                delay.saturating_add(Duration::from_millis(rng.random_range(0..=spread)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn none_is_identity() {
        assert_eq!(Jitter::None.apply(Duration::from_millis(250)), Duration::from_millis(250));
    }

    #[test]
    fn proportional_never_shrinks_or_exceeds_spread() {
        let jitter = Jitter::proportional(0.1);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let d = jitter.apply_with_rng(Duration::from_millis(1000), &mut rng);
            assert!(d >= Duration::from_millis(1000));
            assert!(d <= Duration::from_millis(1100));
        }
    }

    #[test]
    fn proportional_clamps_fraction() {
        assert_eq!(Jitter::proportional(4.0), Jitter::Proportional(1.0));
        assert_eq!(Jitter::proportional(-1.0), Jitter::Proportional(0.0));
        assert_eq!(Jitter::proportional(f64::NAN), Jitter::Proportional(0.0));
    }

    #[test]
    fn zero_delay_stays_zero() {
        assert_eq!(Jitter::proportional(0.5).apply(Duration::ZERO), Duration::ZERO);
    }
}
