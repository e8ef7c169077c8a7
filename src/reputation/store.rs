use crate::config::ReputationConfig;
use crate::core::endpoint::Endpoint;
use crate::error::{ProtocolError, Result};
use crate::reputation::persistence;
use crate::reputation::record::{PeerEvent, ReputationPolicy, ReputationRecord};
use crate::utils::metrics::Metrics;
use crate::utils::time::{Clock, SystemClock};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, instrument, warn};

/// Result of [`ReputationStore::notify`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// First time the endpoint was seen
    New,
    Updated,
    Unchanged,
}

/// Shared per-endpoint connection history.
///
/// Records are immutable and replaced with compare-and-swap semantics: an
/// update reads the current record, derives its successor, and installs it
/// only if the map still holds the record it started from, retrying
/// otherwise. Concurrent notifications never lose an update.
pub struct ReputationStore {
    records: DashMap<Endpoint, Arc<ReputationRecord>>,
    policy: ReputationPolicy,
    scan_passes: u32,
    max_records: usize,
    clock: Arc<dyn Clock>,
    scan: Mutex<()>,
    path: Option<PathBuf>,
    save_pending: AtomicBool,
    save_lock: Mutex<()>,
    saves: AtomicU64,
    metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ReputationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReputationStore")
            .field("records", &self.records.len())
            .field("policy", &self.policy)
            .field("path", &self.path)
            .finish()
    }
}

impl ReputationStore {
    /// In-memory store using the wall clock
    pub fn new(config: &ReputationConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &ReputationConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            policy: config.policy(),
            scan_passes: config.scan_passes.max(1),
            max_records: config.max_records,
            clock,
            scan: Mutex::new(()),
            path: None,
            save_pending: AtomicBool::new(false),
            save_lock: Mutex::new(()),
            saves: AtomicU64::new(0),
            metrics: None,
        }
    }

    /// Store backed by the snapshot at `path`, loading it if present.
    ///
    /// An unreadable or corrupt snapshot is logged and the store starts
    /// empty; the next save replaces the file.
    pub fn open<P: AsRef<Path>>(path: P, config: &ReputationConfig, clock: Arc<dyn Clock>) -> Self {
        let mut store = Self::with_clock(config, clock);
        let path = path.as_ref().to_path_buf();
        match persistence::read(&path) {
            Ok(loaded) => {
                let count = loaded.len();
                for record in loaded {
                    store.records.insert(record.endpoint, Arc::new(record));
                }
                info!(path = %path.display(), records = count, "Loaded reputation snapshot");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable reputation snapshot, starting empty");
            }
        }
        store.path = Some(path);
        store
    }

    /// Count snapshot writes in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn policy(&self) -> &ReputationPolicy {
        &self.policy
    }

    pub fn now(&self) -> u32 {
        self.clock.now_secs()
    }

    /// Apply `event` to the record for `endpoint`, creating it if needed
    pub fn notify(&self, endpoint: Endpoint, event: PeerEvent) -> NotifyOutcome {
        loop {
            let now = self.clock.now_secs();
            let current = self.records.get(&endpoint).map(|r| Arc::clone(r.value()));
            match current {
                None => {
                    let fresh = ReputationRecord::new(endpoint);
                    let next = fresh.apply(event, now, &self.policy).unwrap_or(fresh);
                    match self.records.entry(endpoint) {
                        Entry::Vacant(slot) => {
                            slot.insert(Arc::new(next));
                            return NotifyOutcome::New;
                        }
                        Entry::Occupied(_) => continue,
                    }
                }
                Some(old) => {
                    let Some(next) = old.apply(event, now, &self.policy) else {
                        return NotifyOutcome::Unchanged;
                    };
                    if let Some(mut slot) = self.records.get_mut(&endpoint) {
                        if Arc::ptr_eq(slot.value(), &old) {
                            *slot.value_mut() = Arc::new(next);
                            return NotifyOutcome::Updated;
                        }
                    }
                }
            }
        }
    }

    pub fn get(&self, endpoint: &Endpoint) -> Option<ReputationRecord> {
        self.records.get(endpoint).map(|r| **r.value())
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.records.contains_key(endpoint)
    }

    pub fn remove(&self, endpoint: &Endpoint) -> bool {
        self.records.remove(endpoint).is_some()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Copy of every record
    pub fn records(&self) -> Vec<ReputationRecord> {
        self.records.iter().map(|r| **r.value()).collect()
    }

    /// Up to `limit` records, best first
    pub fn best(&self, limit: usize) -> Vec<ReputationRecord> {
        let mut records = self.records();
        persistence::rank(&mut records, limit, self.policy.fail_timeout);
        records
    }

    /// Pick up to `limit` endpoints to connect to and stamp each as attempted.
    ///
    /// Skips connected endpoints and endpoints inside a cool-down window, and
    /// prefers the most recently seen-good records. Records are spread over
    /// `limit` slots and the scan stops after a fixed number of passes over
    /// them, so fewer than `limit` endpoints may come back even when more
    /// are eligible.
    #[instrument(level = "debug", skip(self, connected))]
    pub fn select_candidates(&self, connected: &HashSet<Endpoint>, limit: usize) -> Vec<Endpoint> {
        if limit == 0 {
            return Vec::new();
        }
        let _scan = self.scan.lock();
        let now = self.clock.now_secs();
        let mut slots: Vec<Option<(Endpoint, u32)>> = vec![None; limit];
        let mut slot = 0;
        let mut passes = self.scan_passes;

        for entry in self.records.iter() {
            if passes == 0 {
                break;
            }
            let record = entry.value();
            if connected.contains(entry.key()) || record.cooling_down(now, &self.policy) {
                continue;
            }
            let seen = record.last_seen_good();
            let best = slots[slot].map_or(0, |(_, ts)| ts);
            if seen > best {
                slots[slot] = Some((record.endpoint, seen));
            }
            slot += 1;
            if slot == limit {
                slot = 0;
                passes -= 1;
            }
        }

        let chosen: Vec<Endpoint> = slots.into_iter().flatten().map(|(ep, _)| ep).collect();
        // The iterator above holds shard locks; stamp only after it is gone.
        for endpoint in &chosen {
            self.notify(*endpoint, PeerEvent::ConnectAttempt);
        }
        debug!(chosen = chosen.len(), "Selected reconnection candidates");
        chosen
    }

    /// Write the best records to the snapshot file now
    pub fn save_now(&self) -> Result<usize> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| ProtocolError::Persistence("Store has no snapshot path".into()))?;
        let _guard = self.save_lock.lock();
        let mut records = self.records();
        persistence::rank(&mut records, self.max_records, self.policy.fail_timeout);
        persistence::write(path, &records)?;
        self.saves.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.reputation_saved();
        }
        Ok(records.len())
    }

    /// Schedule a save on `runtime`'s blocking pool; requests made while one
    /// is pending collapse into it
    pub fn request_save(self: &Arc<Self>, runtime: &Handle) {
        if self.path.is_none() {
            return;
        }
        if self
            .save_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let store = Arc::clone(self);
        runtime.spawn_blocking(move || {
            if let Err(e) = store.save_now() {
                warn!(error = %e, "Reputation save failed; will retry on next trigger");
            }
            store.save_pending.store(false, Ordering::Release);
        });
    }

    pub fn save_pending(&self) -> bool {
        self.save_pending.load(Ordering::Acquire)
    }

    /// Number of snapshots written
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::time::ManualClock;
    use std::sync::atomic::AtomicU32;

    const START: u32 = 1_000_000;

    fn store() -> (ReputationStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        let config = ReputationConfig::default();
        (ReputationStore::with_clock(&config, clock.clone()), clock)
    }

    fn ep(n: u8) -> Endpoint {
        Endpoint::from_socket_addr(([10, 0, 0, n], 8333).into())
    }

    #[test]
    fn test_notify_outcomes() {
        let (store, _) = store();
        assert_eq!(store.notify(ep(1), PeerEvent::ConnectAttempt), NotifyOutcome::New);
        assert_eq!(store.notify(ep(1), PeerEvent::ConnectAttempt), NotifyOutcome::Unchanged);
        assert_eq!(store.notify(ep(1), PeerEvent::ConnectSuccess), NotifyOutcome::Updated);
        let r = store.get(&ep(1)).unwrap();
        assert_eq!(r.last_attempt, START);
        assert_eq!(r.last_success, START);
    }

    #[test]
    fn test_concurrent_notify_never_lowers_network_time() {
        let (store, _) = store();
        let store = Arc::new(store);
        let penalty = store.policy().network_penalty;
        let top = START - penalty;
        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..200u32 {
                        let claimed = top - (i * 8 + t);
                        store.notify(ep(1), PeerEvent::PeerNotify { claimed });
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.get(&ep(1)).unwrap().last_network, top);
    }

    /// Clock that moves forward one second on every read
    #[derive(Debug)]
    struct TickingClock(AtomicU32);

    impl Clock for TickingClock {
        fn now_secs(&self) -> u32 {
            self.0.fetch_add(1, Ordering::SeqCst) + 1
        }
    }

    #[test]
    fn test_concurrent_mixed_events_lose_nothing() {
        let clock = Arc::new(TickingClock(AtomicU32::new(START)));
        let store = Arc::new(ReputationStore::with_clock(&ReputationConfig::default(), clock));
        store.notify(ep(1), PeerEvent::ConnectAttempt);

        fn field(record: &ReputationRecord, event: PeerEvent) -> u32 {
            match event {
                PeerEvent::ConnectSuccess => record.last_success,
                PeerEvent::ConnectFail => record.last_fail,
                _ => record.last_attempt,
            }
        }

        let events = [
            PeerEvent::ConnectSuccess,
            PeerEvent::ConnectFail,
            PeerEvent::ConnectAttempt,
        ];
        let handles: Vec<_> = events
            .into_iter()
            .map(|event| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..500 {
                        assert_eq!(store.notify(ep(1), event), NotifyOutcome::Updated);
                        // Only this thread writes this field, so it must have moved forward.
                        let seen = field(&store.get(&ep(1)).unwrap(), event);
                        assert!(seen > last, "{event:?} went from {last} to {seen}");
                        last = seen;
                    }
                    (event, last)
                })
            })
            .collect();
        let finals: Vec<(PeerEvent, u32)> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let record = store.get(&ep(1)).unwrap();
        for (event, last) in finals {
            assert_eq!(field(&record, event), last, "{event:?} update was lost");
        }
    }

    #[test]
    fn test_candidates_skip_connected_and_cooling() {
        let (store, clock) = store();
        for n in 1..=4 {
            store.notify(ep(n), PeerEvent::PeerNotify { claimed: START });
        }
        store.notify(ep(2), PeerEvent::ConnectFail);
        store.notify(ep(3), PeerEvent::ConnectAttempt);
        clock.advance(1);

        let connected: HashSet<Endpoint> = [ep(4)].into_iter().collect();
        let chosen = store.select_candidates(&connected, 4);
        assert_eq!(chosen, vec![ep(1)]);

        // Just selected: now in its attempt cool-down
        assert!(store.select_candidates(&HashSet::new(), 4).iter().all(|e| *e != ep(1)));
        assert!(store.get(&ep(1)).unwrap().last_attempt > 0);
    }

    #[test]
    fn test_candidates_require_seen_good() {
        let (store, _) = store();
        store.notify(ep(1), PeerEvent::PeerNotify { claimed: 0 });
        assert!(store.select_candidates(&HashSet::new(), 2).is_empty());
    }

    #[test]
    fn test_candidates_eligible_after_cool_down() {
        let (store, clock) = store();
        store.notify(ep(1), PeerEvent::PeerNotify { claimed: START });
        assert_eq!(store.select_candidates(&HashSet::new(), 1), vec![ep(1)]);
        assert!(store.select_candidates(&HashSet::new(), 1).is_empty());
        clock.advance(store.policy().attempt_timeout);
        assert_eq!(store.select_candidates(&HashSet::new(), 1), vec![ep(1)]);
    }

    #[test]
    fn test_save_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.dat");
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(START));
        let config = ReputationConfig::default();
        let store = ReputationStore::open(&path, &config, clock.clone());
        store.notify(ep(1), PeerEvent::ConnectSuccess);
        store.notify(ep(2), PeerEvent::ConnectFail);
        assert_eq!(store.save_now().unwrap(), 2);

        let reopened = ReputationStore::open(&path, &config, clock);
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get(&ep(1)).unwrap().last_success, START);
    }

    #[test]
    fn test_corrupt_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.dat");
        std::fs::write(&path, [0x07u8, 1, 2, 3]).unwrap();
        let config = ReputationConfig::default();

        let store = ReputationStore::open(&path, &config, Arc::new(ManualClock::new(START)));
        assert!(store.is_empty());
        store.notify(ep(1), PeerEvent::ConnectSuccess);
        assert_eq!(store.save_now().unwrap(), 1);
        let reopened = ReputationStore::open(&path, &config, Arc::new(ManualClock::new(START)));
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn test_request_save_coalesces() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .build()
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let config = ReputationConfig::default();
        let metrics = Arc::new(Metrics::new());
        let store = Arc::new(
            ReputationStore::open(dir.path().join("peers.dat"), &config, Arc::new(SystemClock))
                .with_metrics(Arc::clone(&metrics)),
        );
        store.notify(ep(1), PeerEvent::ConnectSuccess);
        for _ in 0..10 {
            store.request_save(runtime.handle());
        }
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while store.save_pending() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(!store.save_pending());
        assert!(store.save_count() >= 1 && store.save_count() <= 10);
        assert_eq!(metrics.snapshot().reputation_saves, store.save_count());
        assert!(dir.path().join("peers.dat").exists());
    }
}
