// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::Slice;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

/// How long a failed block load is cached negatively
const NEGATIVE_TTL: Duration = Duration::from_millis(100);

/// Upper bound on waiting for another reader's in-flight decompression
const FLIGHT_TIMEOUT: Duration = Duration::from_secs(30);

/// Identity of a cached block: segment id and block offset
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct CacheKey(pub u64, pub u64);

#[derive(Copy, Clone, Debug)]
enum LoadFail {
    Corrupted(&'static str),
    Io,
}

impl LoadFail {
    fn to_error(self) -> crate::Error {
        match self {
            Self::Corrupted(reason) => crate::Error::CorruptedBlock(reason),
            Self::Io => crate::Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "cached block read failure",
            )),
        }
    }

    fn from_error(e: &crate::Error) -> Self {
        match e {
            crate::Error::Io(_) => Self::Io,
            crate::Error::CorruptedBlock(reason) => Self::Corrupted(reason),
            crate::Error::Decompress(_) => Self::Corrupted("decompression failed"),
            crate::Error::Decode(_) => Self::Corrupted("block decode failed"),
            _ => Self::Corrupted("block load failed"),
        }
    }
}

struct Flight {
    result: Mutex<Option<Result<Slice, LoadFail>>>,
    ready: Condvar,
}

struct Slot {
    data: Slice,
    weight: u64,
    last_access: Instant,
    tick: u64,
}

#[derive(Default)]
struct Inner {
    slots: FxHashMap<CacheKey, Slot>,
    by_tick: BTreeMap<u64, CacheKey>,
    flights: FxHashMap<CacheKey, Arc<Flight>>,
    negative: FxHashMap<CacheKey, (Instant, LoadFail)>,
    used: u64,
    tick: u64,
}

impl Inner {
    fn touch(&mut self, key: CacheKey) -> Option<Slice> {
        self.tick += 1;
        let tick = self.tick;

        let slot = self.slots.get_mut(&key)?;
        self.by_tick.remove(&slot.tick);
        slot.tick = tick;
        slot.last_access = Instant::now();
        self.by_tick.insert(tick, key);

        Some(slot.data.clone())
    }

    fn remove(&mut self, key: &CacheKey) {
        if let Some(slot) = self.slots.remove(key) {
            self.by_tick.remove(&slot.tick);
            self.used -= slot.weight;
        }
    }

    fn insert(&mut self, key: CacheKey, data: Slice, budget: u64) {
        let weight = data.len() as u64;

        // Degrade to an uncached read instead of evicting everything
        if weight > budget {
            log::debug!("block of {weight} B exceeds cache budget, not caching");
            return;
        }

        self.remove(&key);

        while self.used + weight > budget {
            let Some((_, lru)) = self.by_tick.pop_first() else {
                break;
            };
            if let Some(slot) = self.slots.remove(&lru) {
                self.used -= slot.weight;
            }
        }

        self.tick += 1;
        self.used += weight;
        self.by_tick.insert(self.tick, key);
        self.slots.insert(
            key,
            Slot {
                data,
                weight,
                last_access: Instant::now(),
                tick: self.tick,
            },
        );
    }

    fn sweep(&mut self, ttl: Duration) {
        let now = Instant::now();

        let expired: Vec<CacheKey> = self
            .slots
            .iter()
            .filter(|(_, slot)| now.duration_since(slot.last_access) >= ttl)
            .map(|(key, _)| *key)
            .collect();

        for key in expired {
            log::trace!("evicting expired block {key:?}");
            self.remove(&key);
        }

        self.negative.retain(|_, (until, _)| *until > now);
    }
}

/// Process-wide cache of decompressed block payloads
///
/// Entries are bounded by a byte budget (least-recently-used eviction) and
/// a time-to-live (swept by a janitor thread). Concurrent requests for the
/// same block perform a single decompression; failures are cached
/// negatively for a short period.
pub struct BlockCache {
    inner: Mutex<Inner>,
    budget: u64,
    ttl: Duration,
}

impl BlockCache {
    /// Creates a cache with the given byte budget and entry time-to-live.
    #[must_use]
    pub fn new(budget: u64, ttl: Duration) -> Arc<Self> {
        let cache = Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            budget,
            ttl,
        });

        let weak: Weak<Self> = Arc::downgrade(&cache);
        let sweep_interval = (ttl / 4).clamp(Duration::from_millis(50), Duration::from_millis(500));

        // The janitor dies with the last cache handle
        let _ = std::thread::Builder::new()
            .name("lsm-cache-janitor".into())
            .spawn(move || loop {
                std::thread::sleep(sweep_interval);

                let Some(cache) = weak.upgrade() else {
                    return;
                };
                cache.sweep();
            });

        cache
    }

    /// Looks up a cached block, refreshing its recency.
    #[must_use]
    pub fn get(&self, key: CacheKey) -> Option<Slice> {
        self.inner.lock().expect("lock is poisoned").touch(key)
    }

    /// Returns the block, loading it through `loader` on a miss.
    ///
    /// At most one caller runs the loader per block; concurrent callers
    /// wait for its completion.
    pub fn get_or_load(
        &self,
        key: CacheKey,
        loader: impl FnOnce() -> crate::Result<Slice>,
    ) -> crate::Result<Slice> {
        let flight = {
            let mut inner = self.inner.lock().expect("lock is poisoned");

            if let Some(data) = inner.touch(key) {
                return Ok(data);
            }

            if let Some((until, fail)) = inner.negative.get(&key).copied() {
                if until > Instant::now() {
                    return Err(fail.to_error());
                }
                inner.negative.remove(&key);
            }

            if let Some(flight) = inner.flights.get(&key) {
                FlightRole::Waiter(flight.clone())
            } else {
                let flight = Arc::new(Flight {
                    result: Mutex::new(None),
                    ready: Condvar::new(),
                });
                inner.flights.insert(key, flight.clone());
                FlightRole::Loader(flight)
            }
        };

        match flight {
            FlightRole::Waiter(flight) => {
                let mut result = flight.result.lock().expect("lock is poisoned");
                let deadline = Instant::now() + FLIGHT_TIMEOUT;

                while result.is_none() {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    if timeout.is_zero() {
                        return Err(crate::Error::CorruptedBlock(
                            "timed out waiting for block load",
                        ));
                    }

                    let (guard, _) = flight
                        .ready
                        .wait_timeout(result, timeout)
                        .expect("lock is poisoned");
                    result = guard;
                }

                match result.as_ref() {
                    Some(Ok(data)) => Ok(data.clone()),
                    Some(Err(fail)) => Err(fail.to_error()),
                    None => unreachable!(),
                }
            }
            FlightRole::Loader(flight) => {
                let loaded = loader();

                {
                    let mut inner = self.inner.lock().expect("lock is poisoned");
                    inner.flights.remove(&key);

                    match &loaded {
                        Ok(data) => inner.insert(key, data.clone(), self.budget),
                        Err(e) => {
                            let fail = LoadFail::from_error(e);
                            inner
                                .negative
                                .insert(key, (Instant::now() + NEGATIVE_TTL, fail));
                        }
                    }
                }

                {
                    let mut result = flight.result.lock().expect("lock is poisoned");
                    *result = Some(match &loaded {
                        Ok(data) => Ok(data.clone()),
                        Err(e) => Err(LoadFail::from_error(e)),
                    });
                    flight.ready.notify_all();
                }

                loaded
            }
        }
    }

    /// Drops every cached block of a segment, e.g. after it was removed.
    pub fn invalidate_segment(&self, segment_id: u64) {
        let mut inner = self.inner.lock().expect("lock is poisoned");

        let keys: Vec<CacheKey> = inner
            .slots
            .keys()
            .filter(|key| key.0 == segment_id)
            .copied()
            .collect();

        for key in keys {
            inner.remove(&key);
        }
    }

    fn sweep(&self) {
        self.inner.lock().expect("lock is poisoned").sweep(self.ttl);
    }

    /// Returns the cached bytes.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.inner.lock().expect("lock is poisoned").used
    }

    /// Returns the number of cached blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock is poisoned").slots.len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the configured byte budget.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.budget
    }
}

enum FlightRole {
    Loader(Arc<Flight>),
    Waiter(Arc<Flight>),
}
