use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rand::distributions::{Distribution, Standard};
use tracing::trace;
use super::clock::Clock;

struct SimulationImpl {
    clock: Clock,
    rng: Box<dyn RngCore + Send>,
}

/// Shared simulated clock and random source. Every channel in one simulation draws from the
/// same generator, so a run is fully determined by its seed.
#[derive(Clone)]
pub struct Simulation {
    imp: Arc<Mutex<SimulationImpl>>,
}

impl Simulation {
    pub fn new(rng: Box<dyn RngCore + Send>) -> Self {
        Simulation {
            imp: Arc::new(Mutex::new(SimulationImpl {
                clock: Clock::new(),
                rng,
            }))
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self::new(Box::new(StdRng::seed_from_u64(seed)))
    }

    fn lock(&self) -> MutexGuard<'_, SimulationImpl> {
        self.imp.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current_time(&self) -> u64 {
        self.lock().clock.current_time()
    }

    pub fn set_time(&mut self, time: u64) {
        self.lock().clock.set(time);
    }

    /// The current simulated time as an `Instant`.
    pub fn instant(&self) -> Instant {
        self.lock().clock.instant()
    }

    pub fn millis_at(&self, instant: Instant) -> u64 {
        self.lock().clock.millis_at(instant)
    }

    pub fn gen_random<T>(&mut self) -> T where Standard: Distribution<T> {
        self.lock().rng.gen::<T>()
    }

    pub fn trace(&self, component: &str, msg: &str) {
        let time = self.current_time();
        trace!(target: "quicmux::sim", "{:05}.{:03} {:<12} {}", time / 1000, time % 1000, component, msg);
    }

    pub fn trace_channel_send(&self, channel_name: &str, message_no: u64, message_desc: &str) {
        self.trace(channel_name, &format!("send {}: {}", message_no, message_desc))
    }

    pub fn trace_channel_recv(&self, channel_name: &str, message_no: u64, message_desc: &str) {
        self.trace(channel_name, &format!("recv {}: {}", message_no, message_desc))
    }

    pub fn trace_channel_drop(&self, channel_name: &str, message_no: u64, message_desc: &str) {
        self.trace(channel_name, &format!("drop {}: {}", message_no, message_desc))
    }
}
