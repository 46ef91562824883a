//! Small timing primitives shared by the pipeline stages: rate-limited
//! diagnostics and idle detection.

use std::time::{Duration, Instant};

/// Gates an action to at most once per interval.
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// True when the interval has elapsed since the last permitted action
    /// (always true on first call).
    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Fires once when a loop has been continuously idle past a threshold.
pub struct IdleAlarm {
    threshold: Duration,
    idle_since: Option<Instant>,
    fired: bool,
}

impl IdleAlarm {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            idle_since: None,
            fired: false,
        }
    }

    /// Record that work happened; the next idle period starts fresh.
    pub fn busy(&mut self) {
        self.idle_since = None;
        self.fired = false;
    }

    /// Record an idle poll; true exactly once per idle period, when the
    /// threshold is first crossed.
    pub fn idle(&mut self) -> bool {
        let since = *self.idle_since.get_or_insert_with(Instant::now);
        if !self.fired && since.elapsed() >= self.threshold {
            self.fired = true;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_allows_first_and_spaces_the_rest() {
        let mut throttle = Throttle::new(Duration::from_secs(60));
        assert!(throttle.ready());
        assert!(!throttle.ready());
        assert!(!throttle.ready());
    }

    #[test]
    fn throttle_reopens_after_interval() {
        let mut throttle = Throttle::new(Duration::from_millis(0));
        assert!(throttle.ready());
        assert!(throttle.ready());
    }

    #[test]
    fn idle_alarm_fires_once_per_idle_period() {
        let mut alarm = IdleAlarm::new(Duration::from_millis(0));
        assert!(alarm.idle());
        assert!(!alarm.idle());
        alarm.busy();
        assert!(alarm.idle());
    }

    #[test]
    fn idle_alarm_waits_for_threshold() {
        let mut alarm = IdleAlarm::new(Duration::from_secs(60));
        assert!(!alarm.idle());
        assert!(!alarm.idle());
    }
}
