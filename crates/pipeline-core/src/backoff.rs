//! Exponential delay sequence shared by every retrying component.

use std::time::Duration;

/// Produces `first, first * factor, first * factor^2, ...`.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    factor: u32,
}

impl Backoff {
    pub fn new(first: Duration) -> Self {
        Self::with_factor(first, 2)
    }

    pub fn with_factor(first: Duration, factor: u32) -> Self {
        Self {
            next: first,
            factor: factor.max(1),
        }
    }

    /// Returns the delay to wait now and advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(self.factor);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double() {
        let mut backoff = Backoff::new(Duration::from_secs(1));
        let delays: Vec<_> = (0..4).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8]);
    }

    #[test]
    fn delays_saturate() {
        let mut backoff = Backoff::with_factor(Duration::MAX, 3);
        backoff.next_delay();
        assert_eq!(backoff.next_delay(), Duration::MAX);
    }
}
