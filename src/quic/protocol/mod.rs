pub mod error;
pub mod frame;
pub mod ids;
pub mod packet;

pub use error::{ConnectionError, Error, FlowScope, TransportError};
pub use frame::{AckFrame, FlowTarget, Frame, StreamFrame};
pub use ids::{ConnectionId, Direction, Side, StreamId};
pub use packet::Packet;
