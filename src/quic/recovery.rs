use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::trace;
use super::protocol::{AckFrame, Direction, StreamId};

const TIME_THRESHOLD_NUM: u32 = 9;
const TIME_THRESHOLD_DEN: u32 = 8;
const GRANULARITY: Duration = Duration::from_millis(1);
const MAX_PTO_BACKOFF: u32 = 16;

/// What a sent packet carried, kept so acknowledgement and loss can be routed back to the
/// state that produced each frame. Payload bytes are not kept here; the send stream still
/// holds them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentFrame {
    Stream { stream_id: StreamId, offset: u64, len: u64, fin: bool },
    ResetStream { stream_id: StreamId },
    MaxData,
    MaxStreamData { stream_id: StreamId },
    MaxStreams { direction: Direction },
    Ping,
}

#[derive(Debug, Clone)]
pub struct SentPacket {
    pub packet_number: u64,
    pub time_sent: Instant,
    /// Datagram length, counted against the congestion window.
    pub size: u64,
    pub frames: Vec<SentFrame>,
}

/// Smoothed round-trip time, variance, and minimum, updated from acknowledgements.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    latest: Duration,
    smoothed: Option<Duration>,
    var: Duration,
    min: Duration,
    initial: Duration,
}

impl RttEstimator {
    pub fn new(initial: Duration) -> Self {
        RttEstimator {
            latest: Duration::ZERO,
            smoothed: None,
            var: initial / 2,
            min: Duration::MAX,
            initial,
        }
    }

    pub fn update(&mut self, latest: Duration, ack_delay: Duration) {
        self.latest = latest;
        self.min = self.min.min(latest);
        match self.smoothed {
            None => {
                self.smoothed = Some(latest);
                self.var = latest / 2;
            }
            Some(smoothed) => {
                let adjusted = if latest > self.min + ack_delay {
                    latest - ack_delay
                }
                else {
                    latest
                };
                let sample_var = if smoothed > adjusted { smoothed - adjusted } else { adjusted - smoothed };
                self.var = (self.var * 3 + sample_var) / 4;
                self.smoothed = Some((smoothed * 7 + adjusted) / 8);
            }
        }
    }

    pub fn smoothed(&self) -> Duration {
        self.smoothed.unwrap_or(self.initial)
    }

    pub fn latest(&self) -> Duration {
        self.latest
    }

    pub fn min(&self) -> Option<Duration> {
        self.smoothed.map(|_| self.min)
    }

    /// How long after a packet was sent, with later packets acknowledged, it is presumed lost.
    pub fn loss_delay(&self) -> Duration {
        let base = self.smoothed().max(self.latest);
        (base * TIME_THRESHOLD_NUM / TIME_THRESHOLD_DEN).max(GRANULARITY)
    }

    pub fn pto_base(&self) -> Duration {
        self.smoothed() + (self.var * 4).max(GRANULARITY)
    }
}

/// What the loss detection timer asks for when it fires.
#[derive(Debug)]
pub enum TimeoutAction {
    /// Packets declared lost by the time threshold.
    Lost(Vec<SentPacket>),
    /// No ACK arrived within the probe timeout; an ack-eliciting probe should be sent.
    Probe,
    None,
}

/// Tracks packets in flight and decides which of them are lost.
///
/// A packet is lost once a packet sent after it has been acknowledged and either
/// `packet_threshold` later packets have been acknowledged or it is older than the time
/// threshold. If nothing is acknowledged at all, the probe timeout fires instead.
#[derive(Debug)]
pub struct Recovery {
    sent: BTreeMap<u64, SentPacket>,
    largest_acked: Option<u64>,
    rtt: RttEstimator,
    packet_threshold: u64,
    loss_time: Option<Instant>,
    pto_count: u32,
    time_of_last_sent: Option<Instant>,
}

impl Recovery {
    pub fn new(initial_rtt: Duration, packet_threshold: u64) -> Self {
        Recovery {
            sent: BTreeMap::new(),
            largest_acked: None,
            rtt: RttEstimator::new(initial_rtt),
            packet_threshold,
            loss_time: None,
            pto_count: 0,
            time_of_last_sent: None,
        }
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn in_flight(&self) -> usize {
        self.sent.len()
    }

    pub fn largest_acked(&self) -> Option<u64> {
        self.largest_acked
    }

    pub fn on_packet_sent(&mut self, packet: SentPacket) {
        self.time_of_last_sent = Some(packet.time_sent);
        self.sent.insert(packet.packet_number, packet);
    }

    /// Removes and returns every tracked packet the ACK covers. Acknowledgements for packets
    /// never sent or already handled are ignored.
    pub fn on_ack_received(&mut self, ack: &AckFrame, now: Instant) -> Vec<SentPacket> {
        let largest = ack.largest();
        let mut acked = Vec::new();
        for range in ack.ranges() {
            let numbers: Vec<u64> = self.sent.range(range.clone()).map(|(&pn, _)| pn).collect();
            for pn in numbers {
                if let Some(packet) = self.sent.remove(&pn) {
                    acked.push(packet);
                }
            }
        }
        if acked.is_empty() {
            return acked;
        }

        if self.largest_acked.map_or(true, |prev| largest > prev) {
            self.largest_acked = Some(largest);
        }
        if let Some(newest) = acked.iter().find(|p| p.packet_number == largest) {
            let sample = now.saturating_duration_since(newest.time_sent);
            self.rtt.update(sample, Duration::from_micros(ack.ack_delay_us));
            trace!(rtt = ?sample, srtt = ?self.rtt.smoothed(), "rtt sample");
        }
        self.pto_count = 0;
        acked.sort_by_key(|p| p.packet_number);
        acked
    }

    /// Removes and returns packets that are now considered lost.
    pub fn detect_lost(&mut self, now: Instant) -> Vec<SentPacket> {
        self.loss_time = None;
        let largest_acked = match self.largest_acked {
            Some(largest_acked) => largest_acked,
            None => return Vec::new(),
        };

        let loss_delay = self.rtt.loss_delay();
        let lost_send_time = now.checked_sub(loss_delay);

        let mut lost_numbers = Vec::new();
        for (&pn, packet) in self.sent.range(..largest_acked) {
            let by_time = lost_send_time.map_or(false, |t| packet.time_sent <= t);
            let by_count = largest_acked >= pn + self.packet_threshold;
            if by_time || by_count {
                lost_numbers.push(pn);
            }
            else {
                let when = packet.time_sent + loss_delay;
                self.loss_time = Some(self.loss_time.map_or(when, |t| t.min(when)));
            }
        }

        lost_numbers.into_iter()
            .filter_map(|pn| self.sent.remove(&pn))
            .collect()
    }

    /// When the loss detection timer next fires, if anything is in flight.
    pub fn timeout(&self) -> Option<Instant> {
        if self.loss_time.is_some() {
            return self.loss_time;
        }
        if self.sent.is_empty() {
            return None;
        }
        let backoff = 1u32 << self.pto_count.min(MAX_PTO_BACKOFF);
        self.time_of_last_sent.map(|t| t + self.rtt.pto_base() * backoff)
    }

    pub fn on_timeout(&mut self, now: Instant) -> TimeoutAction {
        match self.timeout() {
            Some(deadline) if deadline <= now => {}
            _ => return TimeoutAction::None,
        }
        if self.loss_time.is_some() {
            return TimeoutAction::Lost(self.detect_lost(now));
        }
        self.pto_count += 1;
        TimeoutAction::Probe
    }

    pub fn pto_count(&self) -> u32 {
        self.pto_count
    }

    /// Strips frames belonging to `stream_id` from tracked packets. Packets left carrying
    /// nothing are dropped; their total size is returned so it can leave the window.
    pub fn discard_stream(&mut self, stream_id: StreamId) -> u64 {
        let mut released = 0;
        self.sent.retain(|_, packet| {
            packet.frames.retain(|frame| !matches!(frame,
                SentFrame::Stream { stream_id: id, .. } if *id == stream_id));
            if packet.frames.is_empty() {
                released += packet.size;
                false
            }
            else {
                true
            }
        });
        released
    }

    /// Forgets every tracked packet, returning them.
    pub fn drain(&mut self) -> Vec<SentPacket> {
        self.loss_time = None;
        std::mem::take(&mut self.sent).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RTT: Duration = Duration::from_millis(100);

    fn packet(pn: u64, time_sent: Instant) -> SentPacket {
        SentPacket { packet_number: pn, time_sent, size: 100, frames: vec![SentFrame::Ping] }
    }

    fn ack(ranges: Vec<std::ops::RangeInclusive<u64>>) -> AckFrame {
        AckFrame::new(0, ranges).unwrap()
    }

    #[test]
    fn first_sample_sets_smoothed_rtt() {
        let mut rtt = RttEstimator::new(Duration::from_millis(333));
        assert_eq!(rtt.smoothed(), Duration::from_millis(333));
        rtt.update(RTT, Duration::ZERO);
        assert_eq!(rtt.smoothed(), RTT);
        assert_eq!(rtt.loss_delay(), Duration::from_micros(112_500));
        rtt.update(Duration::from_millis(180), Duration::from_millis(40));
        assert_eq!(rtt.smoothed(), Duration::from_millis(105));
    }

    #[test]
    fn packet_threshold_loss() {
        let t0 = Instant::now();
        let mut r = Recovery::new(RTT, 3);
        for pn in 0..5 {
            r.on_packet_sent(packet(pn, t0));
        }
        let acked = r.on_ack_received(&ack(vec![3..=3]), t0 + RTT);
        assert_eq!(acked.len(), 1);
        let lost: Vec<u64> = r.detect_lost(t0 + RTT).iter().map(|p| p.packet_number).collect();
        assert_eq!(lost, vec![0]);
        // 1 and 2 wait for the time threshold
        assert!(r.timeout().is_some());
    }

    #[test]
    fn time_threshold_loss() {
        let t0 = Instant::now();
        let mut r = Recovery::new(RTT, 3);
        r.on_packet_sent(packet(0, t0));
        r.on_packet_sent(packet(1, t0 + Duration::from_millis(1)));
        r.on_ack_received(&ack(vec![1..=1]), t0 + Duration::from_millis(101));
        assert!(r.detect_lost(t0 + Duration::from_millis(101)).is_empty());

        let deadline = r.timeout().unwrap();
        assert_eq!(deadline, t0 + Duration::from_micros(112_500));
        match r.on_timeout(deadline) {
            TimeoutAction::Lost(lost) => assert_eq!(lost[0].packet_number, 0),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(r.in_flight(), 0);
    }

    #[test]
    fn probe_timeout_backs_off() {
        let t0 = Instant::now();
        let mut r = Recovery::new(RTT, 3);
        r.on_packet_sent(packet(0, t0));
        let first = r.timeout().unwrap();
        assert_eq!(first, t0 + RTT + RTT * 2);
        assert!(matches!(r.on_timeout(first), TimeoutAction::Probe));
        assert_eq!(r.timeout().unwrap(), t0 + (RTT * 3) * 2);
    }

    #[test]
    fn duplicate_ack_ignored() {
        let t0 = Instant::now();
        let mut r = Recovery::new(RTT, 3);
        r.on_packet_sent(packet(0, t0));
        assert_eq!(r.on_ack_received(&ack(vec![0..=0]), t0 + RTT).len(), 1);
        assert!(r.on_ack_received(&ack(vec![0..=0]), t0 + RTT).is_empty());
        assert!(r.on_ack_received(&ack(vec![7..=9]), t0 + RTT).is_empty());
    }

    #[test]
    fn discard_stream_releases_empty_packets() {
        let t0 = Instant::now();
        let mut r = Recovery::new(RTT, 3);
        let frame = |id| SentFrame::Stream { stream_id: StreamId(id), offset: 0, len: 10, fin: false };
        r.on_packet_sent(SentPacket { packet_number: 0, time_sent: t0, size: 50, frames: vec![frame(0)] });
        r.on_packet_sent(SentPacket { packet_number: 1, time_sent: t0, size: 60, frames: vec![frame(0), frame(4)] });
        assert_eq!(r.discard_stream(StreamId(0)), 50);
        assert_eq!(r.in_flight(), 1);
    }
}
