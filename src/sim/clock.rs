use std::time::{Duration, Instant};

/// Simulated time in whole milliseconds. The core connection works with `Instant`s, so the
/// clock also maps its millisecond count onto a fixed base instant taken at creation.
#[derive(Debug, Clone)]
pub struct Clock {
    base: Instant,
    current_time: u64,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            base: Instant::now(),
            current_time: 0,
        }
    }

    pub fn current_time(&self) -> u64 {
        self.current_time
    }

    /// Time never goes backwards; setting an earlier time is ignored.
    pub fn set(&mut self, time: u64) {
        self.current_time = self.current_time.max(time);
    }

    pub fn instant(&self) -> Instant {
        self.base + Duration::from_millis(self.current_time)
    }

    /// First simulated millisecond at or after `instant`.
    pub fn millis_at(&self, instant: Instant) -> u64 {
        let micros = instant.saturating_duration_since(self.base).as_micros();
        ((micros + 999) / 1000) as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instants_round_up_to_the_next_millisecond() {
        let mut clock = Clock::new();
        clock.set(5);
        let now = clock.instant();
        assert_eq!(clock.millis_at(now), 5);
        assert_eq!(clock.millis_at(now + Duration::from_micros(1)), 6);
        clock.set(3);
        assert_eq!(clock.current_time(), 5);
    }
}
