use crate::model::{Session, SessionKey};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

struct Entry {
    session: Arc<Session>,
    inserted: Instant,
    generation: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<SessionKey, Entry>,
    /// Insertion order for capacity eviction; stale generations are skipped.
    order: VecDeque<(SessionKey, u64)>,
    next_generation: u64,
}

/// Scan results keyed by the inbound message that carried the link.
///
/// Bounded by both a TTL and a capacity; the oldest entry goes first when
/// the store is full. The lock is never held across an `.await`.
///
/// # Example
/// ```
/// use grabbot::model::SessionKey;
/// use grabbot::SessionStore;
/// use std::time::Duration;
///
/// let store = SessionStore::new(Duration::from_secs(60), 16);
/// assert!(store.get(&SessionKey::new(1, 2)).is_none());
/// ```
pub struct SessionStore {
    inner: Mutex<Inner>,
    ttl: Duration,
    capacity: usize,
}

impl SessionStore {
    /// Creates an empty store
    ///
    /// # Arguments
    /// * `ttl` - How long a session stays retrievable after `put`
    /// * `capacity` - Maximum live sessions, at least one
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Stores a session, replacing any previous one under the same key.
    ///
    /// # Details
    /// A replaced key moves to the back of the eviction order. When the store
    /// is over capacity the oldest live entry is dropped.
    pub fn put(&self, key: SessionKey, session: Session) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let generation = inner.next_generation;
        inner.next_generation += 1;

        inner.entries.insert(
            key,
            Entry {
                session: Arc::new(session),
                inserted: Instant::now(),
                generation,
            },
        );
        inner.order.push_back((key, generation));

        while inner.entries.len() > self.capacity {
            let Some((oldest, oldest_generation)) = inner.order.pop_front() else {
                break;
            };
            let current = inner.entries.get(&oldest).map(|e| e.generation);
            if current == Some(oldest_generation) {
                inner.entries.remove(&oldest);
                debug!(key = %oldest, "evicted session at capacity");
            }
        }
        // Keep the order queue from growing with overwritten keys.
        if inner.order.len() > self.capacity * 2 {
            let Inner { entries, order, .. } = &mut *inner;
            order.retain(|(k, g)| entries.get(k).is_some_and(|e| e.generation == *g));
        }
    }

    /// Returns the live session for `key`, dropping it if its TTL elapsed.
    ///
    /// # Returns
    /// * `Some(session)` - Stored and younger than the TTL
    /// * `None` - Never stored, evicted or expired
    pub fn get(&self, key: &SessionKey) -> Option<Arc<Session>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let expired = match inner.entries.get(key) {
            Some(entry) if entry.inserted.elapsed() < self.ttl => {
                return Some(Arc::clone(&entry.session));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.entries.remove(key);
            debug!(key = %key, "session expired");
        }
        None
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
