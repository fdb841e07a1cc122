//! Per-user connection registry
//!
//! Maps a user identity to the bounded queue its connection pump drains.
//! At most one queue is live per user: registering again replaces the
//! previous entry and closes its queue, which makes the old pump's write
//! loop wind down.
//!
//! `unregister` is the arbiter for closing a connection. Each connection
//! gets exactly one `true` from it, whether it is still the live entry or
//! was displaced by a newer registration.

use parking_lot::Mutex;
use relay_common::{Delivery, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};

/// Identifies one registration (one physical connection)
pub type ConnectionId = u64;

/// Receiving end of a user's delivery queue
pub type Sink = mpsc::Receiver<Delivery>;

/// Returned by [`ConnectionRegistry::register`]
pub struct Registration {
    pub connection: ConnectionId,
    pub sink: Sink,
}

struct Slot {
    connection: ConnectionId,
    tx: mpsc::Sender<Delivery>,
}

#[derive(Default)]
struct Inner {
    sinks: HashMap<UserId, Slot>,
    /// Connections displaced by a newer registration that have not torn down yet
    orphaned: HashSet<ConnectionId>,
}

pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    capacity: usize,
}

impl ConnectionRegistry {
    /// `capacity` bounds each user's queue; deliveries beyond it are dropped.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    /// Create the sink for `user_id`, replacing any existing one.
    pub fn register(&self, user_id: UserId) -> Registration {
        let connection = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, sink) = mpsc::channel(self.capacity);

        let mut inner = self.inner.lock();
        let previous = inner
            .sinks
            .insert(user_id.clone(), Slot { connection, tx });

        if let Some(previous) = previous {
            // The old sender is dropped here, closing the old sink
            inner.orphaned.insert(previous.connection);
            debug!(
                "Connection {} for {} replaced by {}",
                previous.connection, user_id, connection
            );
        }

        trace!("Registered connection {} for {}", connection, user_id);
        Registration { connection, sink }
    }

    /// Remove `connection` for `user_id` and close its sink.
    ///
    /// Returns `true` exactly once per connection. A newer registration for
    /// the same user is never removed by a stale connection.
    pub fn unregister(&self, user_id: &UserId, connection: ConnectionId) -> bool {
        let mut inner = self.inner.lock();

        let is_current = inner
            .sinks
            .get(user_id)
            .is_some_and(|slot| slot.connection == connection);

        if is_current {
            inner.sinks.remove(user_id);
            return true;
        }

        inner.orphaned.remove(&connection)
    }

    /// Best-effort enqueue to the user's live sink.
    ///
    /// Never blocks. Returns `false` when the user is offline or the queue
    /// is full, in which case the delivery is dropped.
    pub fn deliver(&self, user_id: &UserId, delivery: Delivery) -> bool {
        let inner = self.inner.lock();
        let Some(slot) = inner.sinks.get(user_id) else {
            trace!("{} is offline, dropping delivery", user_id);
            return false;
        };

        match slot.tx.try_send(delivery) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Delivery queue for {} is full, dropping delivery", user_id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                trace!("Sink for {} already closed", user_id);
                false
            }
        }
    }

    pub fn is_connected(&self, user_id: &UserId) -> bool {
        self.inner.lock().sinks.contains_key(user_id)
    }

    /// Number of users with a live sink
    pub fn len(&self) -> usize {
        self.inner.lock().sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
