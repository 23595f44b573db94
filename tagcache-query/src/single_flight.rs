//! Per-key refresh coordination.
//!
//! Holding a [`FlightGuard`] for a key means no other caller holding a guard
//! for the same key is mid-refresh. Entries are dropped from the map as soon
//! as nobody holds or waits on them, so the map only grows with the number of
//! keys being refreshed concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tagcache_core::CacheKey;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type FlightMap = HashMap<CacheKey, Arc<AsyncMutex<()>>>;

/// Registry of per-key async mutexes.
#[derive(Debug, Clone, Default)]
pub struct SingleFlight {
    flights: Arc<Mutex<FlightMap>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other guard for `key` is held, then hold one.
    pub async fn acquire(&self, key: &CacheKey) -> FlightGuard {
        let slot = {
            let mut flights = self
                .flights
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(flights.entry(key.clone()).or_default())
        };

        let guard = slot.lock_owned().await;
        FlightGuard {
            guard: Some(guard),
            key: key.clone(),
            flights: Arc::clone(&self.flights),
        }
    }

    /// Keys with a holder or waiter right now.
    pub fn in_flight(&self) -> usize {
        self.flights
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// Exclusive hold on one key. Released on drop.
#[derive(Debug)]
pub struct FlightGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: CacheKey,
    flights: Arc<Mutex<FlightMap>>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        // Release the key before deciding whether the slot is still needed.
        drop(self.guard.take());

        let mut flights = self
            .flights
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let unused = flights
            .get(&self.key)
            .map(|slot| Arc::strong_count(slot) == 1)
            .unwrap_or(false);
        if unused {
            flights.remove(&self.key);
        }
    }
}
