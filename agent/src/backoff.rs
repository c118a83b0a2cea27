//! Reconnect backoff, matching `cmd/local/main.go`'s use of
//! `github.com/jpillora/backoff`: doubling delay capped at 2 minutes,
//! reset to the initial delay only after a successful handshake.

use std::time::Duration;

const INITIAL_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(120);

pub struct Backoff {
    current: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self { current: INITIAL_DELAY }
    }

    /// Returns the next delay to sleep for and doubles the internal
    /// counter, capped at [`MAX_DELAY`].
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_DELAY);
        delay
    }

    /// Resets the backoff to its initial delay. Called only after a
    /// reconnect attempt completes a successful handshake, per §4.7.
    pub fn reset(&mut self) {
        self.current = INITIAL_DELAY;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_and_caps_at_two_minutes() {
        let mut backoff = Backoff::new();
        let mut delays = Vec::new();
        for _ in 0..12 {
            delays.push(backoff.next_delay());
        }
        assert_eq!(delays[0], INITIAL_DELAY);
        assert_eq!(delays[1], INITIAL_DELAY * 2);
        assert!(delays.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(*delays.last().unwrap(), MAX_DELAY);
    }

    #[test]
    fn reset_returns_to_the_initial_delay() {
        let mut backoff = Backoff::new();
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.next_delay(), INITIAL_DELAY);
    }
}
