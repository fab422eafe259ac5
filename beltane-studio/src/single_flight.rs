//! Per-key single-flight registry backing the studio caches.
//!
//! [`SingleFlight::claim`] either returns the cached value (a hit) or
//! hands the caller an exclusive [`FlightGuard`] for that key; every other
//! thread claiming the same key blocks until the guard settles and then
//! re-checks. "At most one allocation per key" is therefore a structural
//! property of the registry, not a lock-discipline convention.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex};

struct Flight {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Flight {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            done: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    fn wait(&self) {
        let mut done = self.done.lock().unwrap();
        while !*done {
            done = self.cv.wait(done).unwrap();
        }
    }

    fn settle(&self) {
        *self.done.lock().unwrap() = true;
        self.cv.notify_all();
    }
}

enum Entry<V> {
    Ready(V),
    Pending(Arc<Flight>),
}

/// Keyed registry of cached values and in-flight computations.
pub struct SingleFlight<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
}

/// Outcome of [`SingleFlight::claim`].
pub enum Claimed<'a, K: Eq + Hash + Clone, V> {
    /// The cached value satisfied the request.
    Hit(V),
    /// The caller holds the flight for this key and must `install` or
    /// `abort` the guard.
    Miss(FlightGuard<'a, K, V>),
}

impl<K: Eq + Hash + Clone, V: Clone> SingleFlight<K, V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a settled entry. Pending flights are invisible here.
    pub fn get(&self, key: &K) -> Option<V> {
        match self.entries.lock().unwrap().get(key) {
            Some(Entry::Ready(v)) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        matches!(
            self.entries.lock().unwrap().get(key),
            Some(Entry::Ready(_))
        )
    }

    /// Keys of every settled entry.
    pub fn ready_keys(&self) -> Vec<K> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(k, e)| match e {
                Entry::Ready(_) => Some(k.clone()),
                Entry::Pending(_) => None,
            })
            .collect()
    }

    /// Return the cached value when `fresh` accepts it, otherwise take the
    /// flight for `key`. Callers that find another flight in progress wait
    /// it out and re-check, so concurrent first access computes once.
    pub fn claim<F>(&self, key: &K, fresh: F) -> Claimed<'_, K, V>
    where
        F: Fn(&V) -> bool,
    {
        enum Action<V> {
            Hit(V),
            Wait(Arc<Flight>),
            Take,
        }

        let mut entries = self.entries.lock().unwrap();
        loop {
            let action = match entries.get(key) {
                Some(Entry::Ready(v)) if fresh(v) => Action::Hit(v.clone()),
                Some(Entry::Pending(flight)) => Action::Wait(Arc::clone(flight)),
                _ => Action::Take,
            };
            match action {
                Action::Hit(v) => return Claimed::Hit(v),
                Action::Wait(flight) => {
                    drop(entries);
                    flight.wait();
                    entries = self.entries.lock().unwrap();
                }
                Action::Take => {
                    let prev = match entries.remove(key) {
                        Some(Entry::Ready(v)) => Some(v),
                        _ => None,
                    };
                    let flight = Flight::new();
                    entries.insert(key.clone(), Entry::Pending(Arc::clone(&flight)));
                    return Claimed::Miss(FlightGuard {
                        owner: self,
                        key: key.clone(),
                        prev,
                        flight,
                        settled: false,
                    });
                }
            }
        }
    }

    /// Remove and return the entry for `key`, waiting out any in-flight
    /// claim first.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().unwrap();
        loop {
            let pending = match entries.get(key) {
                None => return None,
                Some(Entry::Pending(flight)) => Some(Arc::clone(flight)),
                Some(Entry::Ready(_)) => None,
            };
            match pending {
                Some(flight) => {
                    drop(entries);
                    flight.wait();
                    entries = self.entries.lock().unwrap();
                }
                None => {
                    return match entries.remove(key) {
                        Some(Entry::Ready(v)) => Some(v),
                        _ => None,
                    };
                }
            }
        }
    }

    /// Remove and return every entry, waiting out in-flight claims first.
    pub fn drain(&self) -> Vec<(K, V)> {
        let mut entries = self.entries.lock().unwrap();
        loop {
            let pending = entries.values().find_map(|e| match e {
                Entry::Pending(flight) => Some(Arc::clone(flight)),
                Entry::Ready(_) => None,
            });
            match pending {
                Some(flight) => {
                    drop(entries);
                    flight.wait();
                    entries = self.entries.lock().unwrap();
                }
                None => {
                    return entries
                        .drain()
                        .map(|(k, e)| match e {
                            Entry::Ready(v) => (k, v),
                            Entry::Pending(_) => unreachable!("drained while pending"),
                        })
                        .collect();
                }
            }
        }
    }

    /// Drop every settled entry without yielding the values. In-flight
    /// claims are left alone; their guards settle independently.
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap()
            .retain(|_, e| matches!(e, Entry::Pending(_)));
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive right to compute the value for one key.
///
/// Dropping the guard without installing restores whatever was cached
/// before the claim and wakes the waiters.
pub struct FlightGuard<'a, K: Eq + Hash + Clone, V> {
    owner: &'a SingleFlight<K, V>,
    key: K,
    prev: Option<V>,
    flight: Arc<Flight>,
    settled: bool,
}

impl<K: Eq + Hash + Clone, V> FlightGuard<'_, K, V> {
    /// The value displaced by this claim, if any.
    pub fn previous(&self) -> Option<&V> {
        self.prev.as_ref()
    }

    /// Install the computed value and wake the waiters. Returns the
    /// displaced value so the caller can release it only after the
    /// replacement is visible.
    pub fn install(mut self, value: V) -> Option<V> {
        self.owner
            .entries
            .lock()
            .unwrap()
            .insert(self.key.clone(), Entry::Ready(value));
        self.flight.settle();
        self.settled = true;
        self.prev.take()
    }

    /// Abandon the flight, restoring whatever was cached before.
    pub fn abort(mut self) {
        self.restore();
    }

    fn restore(&mut self) {
        let mut entries = self.owner.entries.lock().unwrap();
        match self.prev.take() {
            Some(v) => {
                entries.insert(self.key.clone(), Entry::Ready(v));
            }
            None => {
                entries.remove(&self.key);
            }
        }
        drop(entries);
        self.flight.settle();
        self.settled = true;
    }
}

impl<K: Eq + Hash + Clone, V> Drop for FlightGuard<'_, K, V> {
    fn drop(&mut self) {
        if !self.settled {
            self.restore();
        }
    }
}
