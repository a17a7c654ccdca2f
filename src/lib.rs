//! Multiplexed, flow-controlled byte streams over an unreliable datagram channel.
//!
//! [`quic`] holds the transport itself: framing, stream state machines, loss recovery,
//! congestion and flow control, all driven explicitly by the caller. [`mux`] runs it under tokio
//! behind `connect`/`listen` and `AsyncRead`/`AsyncWrite` streams. [`sim`] is a deterministic
//! network simulator for exercising the transport under loss.

pub mod binary;
pub mod io;
pub mod mux;
pub mod quic;
pub mod sim;
pub mod varint;

pub use mux::{connect, listen, Connection, Listener, Stream};
