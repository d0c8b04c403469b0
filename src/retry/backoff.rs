use std::time::Duration;

/// Doubling backoff capped at `max`.
///
/// Yields `initial, 2*initial, 4*initial, ...` until the cap, then stays there.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial.min(max),
            max,
        }
    }

    /// Interval to sleep now; advances the sequence
    pub fn next_interval(&mut self) -> Duration {
        let interval = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        interval
    }

    /// Interval the next call to [`Backoff::next_interval`] will return
    pub fn peek(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_until_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(64));
        let seq: Vec<u64> = (0..9).map(|_| backoff.next_interval().as_secs()).collect();
        assert_eq!(seq, vec![2, 4, 8, 16, 32, 64, 64, 64, 64]);
    }

    #[test]
    fn test_cap_not_a_power_of_two_multiple() {
        let mut backoff = Backoff::new(Duration::from_secs(3), Duration::from_secs(10));
        let seq: Vec<u64> = (0..5).map(|_| backoff.next_interval().as_secs()).collect();
        assert_eq!(seq, vec![3, 6, 10, 10, 10]);
    }

    #[test]
    fn test_initial_above_max_is_clamped() {
        let mut backoff = Backoff::new(Duration::from_secs(100), Duration::from_secs(5));
        assert_eq!(backoff.peek(), Duration::from_secs(5));
        assert_eq!(backoff.next_interval(), Duration::from_secs(5));
    }
}
