use super::protocol::{FlowScope, TransportError};

/// The limit we advertise to the peer, for one stream or for the connection as a whole.
///
/// `received` is the highest offset (or, at connection level, the sum of per-stream highest
/// offsets) the peer has used; `consumed` is how much of that the application has read. The
/// limit is raised back to `consumed + window` once less than half the window remains.
#[derive(Debug, Clone)]
pub struct ReceiveWindow {
    scope: FlowScope,
    window: u64,
    max_data: u64,
    received: u64,
    consumed: u64,
}

impl ReceiveWindow {
    pub fn new(scope: FlowScope, window: u64) -> Self {
        ReceiveWindow { scope, window, max_data: window, received: 0, consumed: 0 }
    }

    /// The limit currently advertised.
    pub fn limit(&self) -> u64 {
        self.max_data
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Records that the peer has used data up to `end`. Offsets past the advertised limit are a
    /// protocol violation.
    pub fn on_received(&mut self, end: u64) -> Result<(), TransportError> {
        if end > self.max_data {
            return Err(TransportError::FlowControlViolation {
                scope: self.scope,
                offset: end,
                limit: self.max_data,
            });
        }
        self.received = self.received.max(end);
        Ok(())
    }

    /// Like `on_received`, for callers that only know how far the total advanced.
    pub fn on_received_more(&mut self, increase: u64) -> Result<(), TransportError> {
        self.on_received(self.received.saturating_add(increase))
    }

    pub fn on_consumed(&mut self, n: u64) {
        self.consumed += n;
    }

    /// Raises the limit if less than half the window remains, returning the new value to
    /// advertise.
    pub fn poll_update(&mut self) -> Option<u64> {
        if self.max_data.saturating_sub(self.consumed) >= self.window / 2 {
            return None;
        }
        let next = self.consumed + self.window;
        if next > self.max_data {
            self.max_data = next;
            Some(next)
        }
        else {
            None
        }
    }
}

/// The limit the peer has granted us at connection level.
#[derive(Debug, Clone)]
pub struct SendCredit {
    max_data: u64,
    used: u64,
}

impl SendCredit {
    pub fn new(max_data: u64) -> Self {
        SendCredit { max_data, used: 0 }
    }

    pub fn available(&self) -> u64 {
        self.max_data.saturating_sub(self.used)
    }

    pub fn consume(&mut self, n: u64) {
        self.used += n;
    }

    pub fn limit(&self) -> u64 {
        self.max_data
    }

    /// Applies a MAX_DATA from the peer. Smaller values than the current limit are stale
    /// reorderings and are ignored.
    pub fn raise(&mut self, limit: u64) -> bool {
        if limit > self.max_data {
            self.max_data = limit;
            true
        }
        else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receive_window_rejects_overrun() {
        let mut w = ReceiveWindow::new(FlowScope::Connection, 100);
        w.on_received(100).unwrap();
        let err = w.on_received(101).unwrap_err();
        assert_eq!(err, TransportError::FlowControlViolation {
            scope: FlowScope::Connection,
            offset: 101,
            limit: 100,
        });
    }

    #[test]
    fn receive_window_update_after_half_consumed() {
        let mut w = ReceiveWindow::new(FlowScope::Connection, 100);
        w.on_received(60).unwrap();
        w.on_consumed(50);
        assert_eq!(w.poll_update(), None);
        w.on_consumed(1);
        assert_eq!(w.poll_update(), Some(151));
        assert_eq!(w.limit(), 151);
        assert_eq!(w.poll_update(), None);
        w.on_received_more(91).unwrap();
        assert_eq!(w.received(), 151);
    }

    #[test]
    fn send_credit() {
        let mut c = SendCredit::new(10);
        c.consume(10);
        assert_eq!(c.available(), 0);
        assert!(!c.raise(5));
        assert!(c.raise(20));
        assert_eq!(c.available(), 10);
    }
}
