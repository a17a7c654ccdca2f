use std::time::Instant;
use tracing::debug;

/// Loss-based additive-increase/multiplicative-decrease window.
///
/// The window grows by the acknowledged byte count while below the slow start threshold and by
/// roughly one datagram per window's worth of acknowledgements after that. A loss multiplies the
/// window by `decrease_factor` (never below the minimum) and starts a recovery period: packets
/// sent before the period began neither grow the window nor shrink it again.
#[derive(Debug, Clone)]
pub struct CongestionController {
    cwnd: u64,
    ssthresh: u64,
    bytes_in_flight: u64,
    recovery_start: Option<Instant>,
    max_datagram_size: u64,
    minimum_window: u64,
    maximum_window: u64,
    decrease_factor: f64,
    // Acknowledged bytes not yet turned into window growth during congestion avoidance.
    acked_accumulator: u64,
}

impl CongestionController {
    pub fn new(
        max_datagram_size: u64,
        initial_window: u64,
        minimum_window: u64,
        maximum_window: u64,
        decrease_factor: f64,
    ) -> Self {
        CongestionController {
            cwnd: initial_window,
            ssthresh: u64::MAX,
            bytes_in_flight: 0,
            recovery_start: None,
            max_datagram_size,
            minimum_window,
            maximum_window,
            decrease_factor,
            acked_accumulator: 0,
        }
    }

    pub fn window(&self) -> u64 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u64 {
        self.ssthresh
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    pub fn in_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }

    /// Bytes that may still be put in flight.
    pub fn available_budget(&self) -> u64 {
        self.cwnd.saturating_sub(self.bytes_in_flight)
    }

    pub fn on_packet_sent(&mut self, bytes: u64) {
        self.bytes_in_flight += bytes;
    }

    fn in_recovery(&self, sent_time: Instant) -> bool {
        self.recovery_start.map_or(false, |start| sent_time <= start)
    }

    pub fn on_packet_acked(&mut self, bytes: u64, sent_time: Instant) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);

        if self.in_recovery(sent_time) {
            return;
        }
        self.recovery_start = None;

        if self.in_slow_start() {
            self.cwnd += bytes;
        }
        else {
            self.acked_accumulator += bytes;
            if self.acked_accumulator >= self.cwnd {
                self.acked_accumulator -= self.cwnd;
                self.cwnd += self.max_datagram_size;
            }
        }
        self.cwnd = self.cwnd.min(self.maximum_window);
    }

    pub fn on_packets_lost(&mut self, bytes: u64, largest_lost_sent_time: Instant, now: Instant) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);

        if self.in_recovery(largest_lost_sent_time) {
            return;
        }

        let reduced = (self.cwnd as f64 * self.decrease_factor) as u64;
        self.ssthresh = reduced.max(self.minimum_window);
        self.cwnd = self.ssthresh;
        self.acked_accumulator = 0;
        self.recovery_start = Some(now);
        debug!(cwnd = self.cwnd, "congestion event, window reduced");
    }

    /// Removes bytes from flight without a congestion signal, for packets whose contents were
    /// abandoned rather than acknowledged or lost.
    pub fn discard(&mut self, bytes: u64) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
    }
}
