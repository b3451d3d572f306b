use std::time::Duration;

/// Deterministic exponential backoff: the interval starts at `initial`,
/// doubles after every failure, caps at `max`, and snaps back to `initial`
/// on success.
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Returns the interval to wait after this failure.
    pub fn fail(&mut self) -> Duration {
        let interval = self.next;
        self.next = (interval * 2).min(self.max);
        interval
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}
