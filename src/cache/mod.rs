use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::models::{Opportunity, RefreshEvent, Tier};

/// One cycle's entire read model: every tier's entitled list, produced
/// together and swapped in together so readers never observe a mix of
/// cycles.
pub struct CycleSnapshot {
    pub cycle_id: u64,
    pub produced_at_unix: i64,
    pub total_before_filter: usize,
    tiers: HashMap<Tier, Arc<Vec<Opportunity>>>,
}

impl CycleSnapshot {
    pub fn for_tier(&self, tier: Tier) -> Arc<Vec<Opportunity>> {
        self.tiers
            .get(&tier)
            .cloned()
            .unwrap_or_else(|| Arc::new(Vec::new()))
    }
}

/// Singleton refresh bookkeeping, shared by the scheduler tick and the
/// manual-refresh endpoint. Guarded by one mutex; the loser of a concurrent
/// trigger coalesces onto the running task.
#[derive(Debug, Default)]
struct RefreshState {
    cycle_running: bool,
    last_task_id: Option<String>,
}

/// The in-process hot store: the lock-free cycle snapshot, the viewer
/// activity map and the refresh state. Reads never block the writer; a swap
/// publishes a whole new snapshot while readers keep their Arc to the old
/// one.
pub struct HotCache {
    snapshot: ArcSwapOption<CycleSnapshot>,
    sessions: DashMap<String, Instant>,
    session_ttl: Duration,
    last_refresh_unix: AtomicU64,
    next_cycle_id: AtomicU64,
    refresh: Mutex<RefreshState>,
    events_tx: broadcast::Sender<RefreshEvent>,
}

impl HotCache {
    pub fn new(session_ttl: Duration) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            snapshot: ArcSwapOption::const_empty(),
            sessions: DashMap::new(),
            session_ttl,
            last_refresh_unix: AtomicU64::new(0),
            next_cycle_id: AtomicU64::new(1),
            refresh: Mutex::new(RefreshState::default()),
            events_tx,
        }
    }

    // ── Opportunity snapshot ─────────────────────────────────────────────────

    /// The latest completed cycle, or None while warming up.
    pub fn current(&self) -> Option<Arc<CycleSnapshot>> {
        self.snapshot.load_full()
    }

    /// Atomically replace every tier key with one new cycle, stamp the
    /// refresh time and notify SSE subscribers. Returns the cycle id.
    pub fn swap(
        &self,
        tiers: HashMap<Tier, Vec<Opportunity>>,
        total_before_filter: usize,
        produced_at_unix: i64,
    ) -> u64 {
        let cycle_id = self.next_cycle_id.fetch_add(1, Ordering::SeqCst);
        let snapshot = CycleSnapshot {
            cycle_id,
            produced_at_unix,
            total_before_filter,
            tiers: tiers.into_iter().map(|(t, v)| (t, Arc::new(v))).collect(),
        };
        self.snapshot.store(Some(Arc::new(snapshot)));
        self.last_refresh_unix
            .store(produced_at_unix.max(0) as u64, Ordering::SeqCst);

        // Nobody listening is fine; subscribers that lag simply miss events.
        let _ = self
            .events_tx
            .send(RefreshEvent::new(cycle_id, produced_at_unix));
        cycle_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RefreshEvent> {
        self.events_tx.subscribe()
    }

    // ── Activity tracking ────────────────────────────────────────────────────

    /// Record a viewer heartbeat. Expired entries are swept on the way
    /// through so the map tracks live viewers, not history.
    pub fn record_access(&self, session_id: String, now: Instant) {
        let ttl = self.session_ttl;
        self.sessions
            .retain(|_, last_seen| now.duration_since(*last_seen) < ttl);
        self.sessions.insert(session_id, now);
    }

    /// True iff at least one session heartbeat is unexpired. A heartbeat
    /// exactly TTL old counts as expired.
    pub fn has_active_viewers(&self, now: Instant) -> bool {
        self.sessions
            .iter()
            .any(|entry| now.duration_since(*entry.value()) < self.session_ttl)
    }

    pub fn active_viewer_count(&self, now: Instant) -> usize {
        self.sessions
            .iter()
            .filter(|entry| now.duration_since(*entry.value()) < self.session_ttl)
            .count()
    }

    // ── Refresh bookkeeping ──────────────────────────────────────────────────

    pub fn last_refresh_unix(&self) -> Option<i64> {
        match self.last_refresh_unix.load(Ordering::SeqCst) {
            0 => None,
            ts => Some(ts as i64),
        }
    }

    /// Seconds since the last successful cycle; None means never refreshed
    /// (treated as infinitely stale by callers).
    pub fn time_since_last_refresh(&self, now_unix: i64) -> Option<i64> {
        self.last_refresh_unix()
            .map(|last| (now_unix - last).max(0))
    }

    /// Claim the single fetch-cycle slot. Returns false when a cycle is
    /// already in flight; the caller should coalesce onto `running_task_id`.
    pub fn try_begin_cycle(&self, task_id: &str) -> bool {
        let mut state = self.refresh.lock().unwrap_or_else(|e| e.into_inner());
        if state.cycle_running {
            return false;
        }
        state.cycle_running = true;
        state.last_task_id = Some(task_id.to_string());
        true
    }

    pub fn finish_cycle(&self) {
        let mut state = self.refresh.lock().unwrap_or_else(|e| e.into_inner());
        state.cycle_running = false;
    }

    pub fn cycle_running(&self) -> bool {
        self.refresh
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cycle_running
    }

    pub fn running_task_id(&self) -> Option<String> {
        self.refresh
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_task_id
            .clone()
    }
}
