use std::fmt;

/// Identifies a connection on the shared datagram channel. Negotiating it is the job of whatever
/// sets up the channel; the transport only copies it into every datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Stream identifier. The two low bits carry the stream type: bit 0 is the initiator (0 =
/// client, 1 = server) and bit 1 the directionality (0 = bidirectional, 1 = unidirectional).
/// Successive streams of one type are numbered 4 apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl StreamId {
    pub fn new(initiator: Side, direction: Direction, index: u64) -> StreamId {
        let mut raw = index << 2;
        if initiator == Side::Server {
            raw |= 0x01;
        }
        if direction == Direction::Unidirectional {
            raw |= 0x02;
        }
        StreamId(raw)
    }

    pub fn initiator(&self) -> Side {
        if self.0 & 0x01 == 0 {
            Side::Client
        }
        else {
            Side::Server
        }
    }

    pub fn direction(&self) -> Direction {
        if self.0 & 0x02 == 0 {
            Direction::Bidirectional
        }
        else {
            Direction::Unidirectional
        }
    }

    /// Position of this stream among the streams of the same type.
    pub fn index(&self) -> u64 {
        self.0 >> 2
    }

    pub fn is_local(&self, side: Side) -> bool {
        self.initiator() == side
    }

    /// Whether `side` may send data on this stream.
    pub fn can_send(&self, side: Side) -> bool {
        self.direction() == Direction::Bidirectional || self.is_local(side)
    }

    /// Whether `side` may receive data on this stream.
    pub fn can_recv(&self, side: Side) -> bool {
        self.direction() == Direction::Bidirectional || !self.is_local(side)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn peer(&self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Bidirectional,
    Unidirectional,
}
