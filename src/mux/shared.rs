use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::Waker;
use tokio::sync::Notify;
use crate::quic::{self, StreamId};

/// State shared between a connection's driver task and the application handles.
pub(crate) struct Shared {
    pub(crate) conn: quic::Connection,
    accept_waker: Option<Waker>,
    read_wakers: HashMap<StreamId, Waker>,
    write_wakers: HashMap<StreamId, Waker>,
}

impl Shared {
    pub(crate) fn set_accept_waker(&mut self, waker: &Waker) {
        self.accept_waker = Some(waker.clone());
    }

    pub(crate) fn set_read_waker(&mut self, id: StreamId, waker: &Waker) {
        self.read_wakers.insert(id, waker.clone());
    }

    pub(crate) fn set_write_waker(&mut self, id: StreamId, waker: &Waker) {
        self.write_wakers.insert(id, waker.clone());
    }

    pub(crate) fn forget_stream(&mut self, id: StreamId) {
        self.read_wakers.remove(&id);
        self.write_wakers.remove(&id);
    }

    /// Wakes every task that might now make progress. Spurious wakeups only cost a poll.
    pub(crate) fn wake_all(&mut self) {
        if let Some(waker) = self.accept_waker.take() {
            waker.wake();
        }
        for (_, waker) in self.read_wakers.drain() {
            waker.wake();
        }
        for (_, waker) in self.write_wakers.drain() {
            waker.wake();
        }
    }
}

pub(crate) struct Inner {
    state: Mutex<Shared>,
    /// Tells the driver the application changed something that may need sending.
    pub(crate) notify: Notify,
}

impl Inner {
    pub(crate) fn new(conn: quic::Connection) -> Self {
        Inner {
            state: Mutex::new(Shared {
                conn,
                accept_waker: None,
                read_wakers: HashMap::new(),
                write_wakers: HashMap::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Never held across an await point. A panic while holding the lock leaves the connection
    /// state as it was; it is still safe to use.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Shared> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn notify_driver(&self) {
        self.notify.notify_one();
    }
}
