//! The transport core: wire format, per-stream state machines, flow and congestion control,
//! loss recovery, and the connection that ties them together. Nothing here performs I/O or
//! reads the clock.

pub mod config;
pub mod congestion;
pub mod connection;
pub mod flow_control;
pub mod protocol;
pub mod ranges;
pub mod recovery;
pub mod stream;

pub use config::Config;
pub use connection::{Connection, ConnectionStats};
pub use protocol::{ConnectionError, ConnectionId, Direction, Error, Side, StreamId, TransportError};
pub use stream::{ReadOutcome, RecvState, SendState, StreamStats};
