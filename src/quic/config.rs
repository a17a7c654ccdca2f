use std::time::Duration;

/// Transport parameters. Both endpoints are assumed to use the same values: the initial
/// flow control and stream limits we grant the peer are also the ones we assume it granted us.
#[derive(Debug, Clone)]
pub struct Config {
    pub max_datagram_size: usize,
    pub initial_window: u64,
    pub minimum_window: u64,
    pub maximum_window: u64,
    pub decrease_factor: f64,
    pub packet_threshold: u64,
    pub initial_rtt: Duration,
    pub stream_receive_window: u64,
    pub connection_receive_window: u64,
    pub send_buffer_size: usize,
    pub max_concurrent_streams: u64,
    pub idle_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let mds = 1200;
        Config {
            max_datagram_size: mds,
            initial_window: 10 * mds as u64,
            minimum_window: 2 * mds as u64,
            maximum_window: 16 * 1024 * 1024,
            decrease_factor: 0.5,
            packet_threshold: 3,
            initial_rtt: Duration::from_millis(333),
            stream_receive_window: 256 * 1024,
            connection_receive_window: 1024 * 1024,
            send_buffer_size: 256 * 1024,
            max_concurrent_streams: 100,
            idle_timeout: Duration::from_secs(30),
        }
    }
}
