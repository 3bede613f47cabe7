//! Auto-off timer registry: at most one pending "turn zone off at T"
//! action per zone.
//!
//! Semantics:
//! - arming a zone that already has a timer replaces it (last wins)
//! - the expire action runs at most once, then the entry is gone
//! - cancel is idempotent; cancelling a fired or unknown timer is a
//!   no-op
//! - `cancel_all` leaves the registry empty and no previously armed
//!   timer fires afterward

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

struct Entry {
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct TimerRegistry {
    inner: Arc<Mutex<HashMap<i64, Entry>>>,
    next_generation: AtomicU64,
}

impl TimerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        })
    }

    /// Arm an auto-off timer for `zone_id`. Any previously armed timer
    /// for the same zone is cancelled first.
    pub fn arm<F>(&self, zone_id: i64, after: Duration, on_expire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;

        // The deadline is fixed here, at arm time; the spawned task may
        // be polled for the first time much later.
        let deadline = Instant::now() + after;
        let slots = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            // Deregister before running the action so a concurrent
            // cancel cannot abort a half-finished turn-off. If a newer
            // timer replaced this one we were already aborted.
            {
                let mut map = slots.lock().unwrap();
                match map.get(&zone_id) {
                    Some(e) if e.generation == generation => {
                        map.remove(&zone_id);
                    }
                    _ => return,
                }
            }
            on_expire.await;
        });

        let mut map = self.inner.lock().unwrap();
        if let Some(old) = map.insert(zone_id, Entry { generation, handle }) {
            old.handle.abort();
        }
    }

    /// Cancel a pending timer. No-op when none is armed.
    pub fn cancel(&self, zone_id: i64) {
        if let Some(entry) = self.inner.lock().unwrap().remove(&zone_id) {
            entry.handle.abort();
        }
    }

    /// Cancel every pending timer (shutdown, stop-all).
    pub fn cancel_all(&self) {
        let mut map = self.inner.lock().unwrap();
        for (_, entry) in map.drain() {
            entry.handle.abort();
        }
    }

    pub fn is_armed(&self, zone_id: i64) -> bool {
        self.inner.lock().unwrap().contains_key(&zone_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
