use std::process::ExitCode;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use quicmux::quic::Config;
use quicmux::sim::experiment::{self, Experiment};
use quicmux::sim::{ChannelParameters, SimPair, Simulation};

/// Sends bulk data over several streams of one connection through a simulated lossy link and
/// reports throughput.
#[derive(Parser, Clone, Debug)]
#[command(name = "mux_sim")]
struct Opt {
    /// Number of concurrent streams
    #[arg(long, default_value_t = 4)]
    streams: usize,

    /// Bytes sent on each stream
    #[arg(long, default_value_t = 1024 * 1024)]
    bytes: usize,

    /// Probability that a datagram is lost
    #[arg(long, default_value_t = 0.01)]
    loss: f64,

    /// Probability that a datagram is duplicated
    #[arg(long, default_value_t = 0.0)]
    dup: f64,

    /// Minimum one-way latency in ms
    #[arg(long, default_value_t = 20)]
    latency_min: u64,

    /// Maximum one-way latency in ms
    #[arg(long, default_value_t = 40)]
    latency_max: u64,

    /// Milliseconds between datagrams on the link; 0 for unlimited bandwidth
    #[arg(long, default_value_t = 0)]
    inv_bandwidth: u64,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Simulated seconds before giving up
    #[arg(long, default_value_t = 600)]
    time_limit: u64,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let opt = Opt::parse();

    let parameters = ChannelParameters {
        latency_min: opt.latency_min,
        latency_max: opt.latency_max,
        inv_bandwidth: opt.inv_bandwidth,
        dup_probability: opt.dup,
        loss_probability: opt.loss,
    };
    let sim = Simulation::seeded(opt.seed);
    let mut pair = SimPair::new(&sim, &parameters, Config::default());
    let experiment = Experiment {
        streams: opt.streams,
        bytes_per_stream: opt.bytes,
        time_limit: opt.time_limit * 1000,
    };

    let report = match experiment::run(&mut pair, &experiment) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    println!("{:<8} {:>12} {:>12} {:>10}", "stream", "received", "done (ms)", "corrupted");
    for s in report.streams.iter() {
        let done = s.completed_at.map_or_else(|| String::from("-"), |t| t.to_string());
        println!("{:<8} {:>12} {:>12} {:>10}", s.id.0, s.bytes_received, done, s.corrupted);
    }
    let total = report.total_bytes_received();
    println!();
    println!("Number of Streams: {}", report.streams.len());
    println!("Total Data Received: {} bytes ({:.2} MB)", total, total as f64 / (1024.0 * 1024.0));
    println!("Elapsed: {:.3} s", report.elapsed().as_secs_f64());
    println!("Data Rate: {:.3} MB/sec", report.data_rate_mb_per_sec());
    println!("Packet Rate: {:.1} packets/sec", report.packet_rate());
    println!("Datagrams Sent: {}", report.client.datagrams_sent);
    println!("Datagrams Dropped by Link: {}", report.client_to_server.dropped);
    println!("Packets Declared Lost: {}", report.client.packets_lost);
    println!("Bytes Retransmitted: {}", report.client.bytes_retransmitted);
    println!("Final Congestion Window: {} bytes", report.client.cwnd);
    println!("Smoothed RTT: {:?}", report.client.smoothed_rtt);

    if report.completed && report.streams.iter().all(|s| !s.corrupted) {
        ExitCode::SUCCESS
    }
    else {
        ExitCode::FAILURE
    }
}
