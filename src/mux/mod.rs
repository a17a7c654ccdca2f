//! Async application API over the sans-IO core in [`crate::quic`].
//!
//! Each connection's core lives behind a mutex shared by the application handles and a driver
//! task. Handles lock, mutate, record their waker and notify the driver; the driver does all of
//! the datagram I/O and timer handling.

mod connection;
mod driver;
mod listener;
mod shared;
mod stream;

pub use connection::{connect, Accept, Connection, Incoming};
pub use listener::{listen, Listener};
pub use stream::{Chunks, Stream};
