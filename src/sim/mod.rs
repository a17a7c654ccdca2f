//! Deterministic network simulation: a millisecond clock, lossy one-way channels, a harness that
//! runs two core connections against each other, and an async link for the tokio API.

mod network;
pub mod clock;
pub mod experiment;
pub mod link;
mod pair;
mod simulation;

pub use simulation::Simulation;
pub use network::{ChannelMessage, ChannelParameters, ChannelStats, Endpoint};
pub use pair::SimPair;

pub fn opt_min<T : Ord + Copy>(opt_values: &[Option<T>]) -> Option<T> {
    opt_values.iter().flatten().copied().min()
}
