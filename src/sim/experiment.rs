//! Bulk transfer benchmark: the client sends a fixed number of bytes on each of several
//! streams and the server reads them all back, checking every byte.

use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};
use crate::quic::{ConnectionStats, Direction, Error, ReadOutcome, StreamId};
use super::network::ChannelStats;
use super::pair::SimPair;

const WRITE_CHUNK: usize = 16 * 1024;
const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct Experiment {
    pub streams: usize,
    pub bytes_per_stream: usize,
    /// Give up after this many simulated milliseconds.
    pub time_limit: u64,
}

#[derive(Debug, Clone)]
pub struct StreamReport {
    pub id: StreamId,
    pub bytes_received: u64,
    /// Simulated millisecond at which the receiver reached the FIN.
    pub completed_at: Option<u64>,
    pub corrupted: bool,
}

#[derive(Debug, Clone)]
pub struct Report {
    pub streams: Vec<StreamReport>,
    pub elapsed_ms: u64,
    pub completed: bool,
    pub client: ConnectionStats,
    pub client_to_server: ChannelStats,
    pub server_to_client: ChannelStats,
}

impl Report {
    pub fn total_bytes_received(&self) -> u64 {
        self.streams.iter().map(|s| s.bytes_received).sum()
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms.max(1))
    }

    pub fn data_rate_mb_per_sec(&self) -> f64 {
        self.total_bytes_received() as f64 / (1024.0 * 1024.0) / self.elapsed().as_secs_f64()
    }

    pub fn packet_rate(&self) -> f64 {
        self.client.datagrams_sent as f64 / self.elapsed().as_secs_f64()
    }
}

/// Byte at `offset` of stream number `index`; lets the receiver check content without keeping
/// a copy of what was sent.
fn pattern_byte(index: u64, offset: u64) -> u8 {
    (offset.wrapping_mul(31).wrapping_add(index * 7) % 251) as u8
}

fn pattern(index: u64, offset: u64, len: usize) -> Vec<u8> {
    (0..len as u64).map(|i| pattern_byte(index, offset + i)).collect()
}

struct Sender {
    id: StreamId,
    written: usize,
    finished: bool,
}

struct Receiver {
    report: StreamReport,
}

pub fn run(pair: &mut SimPair, experiment: &Experiment) -> Result<Report, Error> {
    let start = pair.current_time();
    let mut senders = Vec::with_capacity(experiment.streams);
    for _ in 0..experiment.streams {
        let id = pair.client.open_stream(Direction::Unidirectional)?;
        senders.push(Sender { id, written: 0, finished: false });
    }
    let mut receivers: BTreeMap<StreamId, Receiver> = senders.iter()
        .map(|s| (s.id, Receiver {
            report: StreamReport { id: s.id, bytes_received: 0, completed_at: None, corrupted: false },
        }))
        .collect();

    let total = experiment.bytes_per_stream;
    let mut failure: Option<Error> = None;
    let completed = pair.run_until(start + experiment.time_limit, |pair| {
        let now = pair.current_time();
        for sender in senders.iter_mut().filter(|s| !s.finished) {
            while sender.written < total {
                let len = (total - sender.written).min(WRITE_CHUNK);
                let chunk = pattern(sender.id.index(), sender.written as u64, len);
                match pair.client.write(sender.id, &chunk) {
                    Ok(0) => break,
                    Ok(n) => sender.written += n,
                    Err(e) => {
                        failure = Some(e);
                        return true;
                    }
                }
            }
            if sender.written == total {
                if let Err(e) = pair.client.finish(sender.id) {
                    failure = Some(e);
                    return true;
                }
                sender.finished = true;
            }
        }

        while pair.server.accept_stream().is_some() {}
        for receiver in receivers.values_mut().filter(|r| r.report.completed_at.is_none()) {
            let report = &mut receiver.report;
            loop {
                match pair.server.read(report.id, READ_CHUNK) {
                    Ok(ReadOutcome::Data(data)) => {
                        let offset = report.bytes_received;
                        if data.iter().enumerate().any(|(i, b)| *b != pattern_byte(report.id.index(), offset + i as u64)) {
                            report.corrupted = true;
                        }
                        report.bytes_received += data.len() as u64;
                    }
                    Ok(ReadOutcome::Finished) => {
                        debug!(stream = %report.id, at = now, "stream complete");
                        report.completed_at = Some(now);
                        break;
                    }
                    Ok(ReadOutcome::Blocked) | Err(Error::UnknownStream(_)) => break,
                    Err(e) => {
                        failure = Some(e);
                        return true;
                    }
                }
            }
        }
        receivers.values().all(|r| r.report.completed_at.is_some())
    });
    if let Some(e) = failure {
        return Err(e);
    }

    let elapsed_ms = pair.current_time() - start;
    let (client_to_server, server_to_client) = pair.channel_stats();
    let report = Report {
        streams: receivers.into_values().map(|r| r.report).collect(),
        elapsed_ms,
        completed,
        client: pair.client.stats(),
        client_to_server,
        server_to_client,
    };
    info!(
        streams = experiment.streams,
        bytes = report.total_bytes_received(),
        elapsed_ms,
        completed,
        "experiment finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quic::Config;
    use crate::sim::{ChannelParameters, Simulation};

    #[test]
    fn three_streams_complete_without_loss() {
        let sim = Simulation::seeded(11);
        let mut pair = SimPair::new(&sim, &ChannelParameters::default(), Config::default());
        let experiment = Experiment { streams: 3, bytes_per_stream: 50_000, time_limit: 60_000 };
        let report = run(&mut pair, &experiment).unwrap();
        assert!(report.completed);
        assert_eq!(report.total_bytes_received(), 150_000);
        assert!(report.streams.iter().all(|s| !s.corrupted));
        assert_eq!(report.client.packets_lost, 0);
    }

    #[test]
    fn too_many_streams_is_refused() {
        let sim = Simulation::seeded(11);
        let config = Config { max_concurrent_streams: 2, ..Config::default() };
        let mut pair = SimPair::new(&sim, &ChannelParameters::default(), config);
        let experiment = Experiment { streams: 3, bytes_per_stream: 10, time_limit: 1_000 };
        assert!(matches!(run(&mut pair, &experiment), Err(Error::TooManyStreams)));
    }
}
