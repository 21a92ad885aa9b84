//! Wall-clock deadlines for blocking socket calls

use std::time::{Duration, Instant};

/// A deadline that can be re-armed
///
/// An infinite timeout never expires. A zero timeout is already expired,
/// which gives "try once, don't wait" semantics to buffered reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    duration: Option<Duration>,
    deadline: Option<Instant>,
}

impl Timeout {
    /// A timeout that never expires
    pub fn infinite() -> Self {
        Timeout {
            duration: None,
            deadline: None,
        }
    }

    /// A timeout expiring `duration` from now
    pub fn new(duration: Duration) -> Self {
        Timeout {
            duration: Some(duration),
            deadline: Some(Instant::now() + duration),
        }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    /// Restart the window from now
    pub fn reset(&mut self) {
        if let Some(duration) = self.duration {
            self.deadline = Some(Instant::now() + duration);
        }
    }

    pub fn is_infinite(&self) -> bool {
        self.duration.is_none()
    }

    /// Time left before the deadline, `None` if infinite
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.remaining(), Some(d) if d.is_zero())
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Timeout::infinite()
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Timeout::new(duration)
    }
}
