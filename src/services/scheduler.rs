use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;

use crate::cache::HotCache;
use crate::config::Config;
use crate::models::{Opportunity, Tier};
use crate::services::assembler::build_opportunities;
use crate::services::entitlement::filter_for_tier;
use crate::services::ev::EvScorer;
use crate::services::odds_client::OddsClient;
use crate::services::persistence::PersistenceWriter;

/// Lifecycle of one refresh task, readable through the task-handle endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase", tag = "state")]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Failed { error: String },
}

/// Decides when to refresh and owns the single fetch-cycle executor.
///
/// The tick loop runs every REFRESH_INTERVAL; a cycle actually fires only
/// when somebody is watching or the cache has gone stale, so an idle deploy
/// stops burning upstream quota. Manual triggers bypass the activity check.
pub struct RefreshScheduler {
    config: Config,
    client: OddsClient,
    scorer: EvScorer,
    cache: Arc<HotCache>,
    writer: Arc<PersistenceWriter>,
    tasks: DashMap<String, TaskState>,
    shutdown: watch::Receiver<bool>,
}

impl RefreshScheduler {
    pub fn new(
        config: Config,
        client: OddsClient,
        cache: Arc<HotCache>,
        writer: Arc<PersistenceWriter>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let scorer = EvScorer::new(config.exchange_fee(), config.exchange_books.clone());
        Self {
            config,
            client,
            scorer,
            cache,
            writer,
            tasks: DashMap::new(),
            shutdown,
        }
    }

    /// The smart-refresh policy, kept pure so the table in the tests reads
    /// like the one in the design discussion.
    pub fn decide(
        manual_override: bool,
        has_active_viewers: bool,
        since_refresh: Option<Duration>,
        auto_interval: Duration,
        stale_threshold: Duration,
    ) -> bool {
        if manual_override {
            return true;
        }
        // None = never refreshed, i.e. infinitely stale
        let fresh_enough = since_refresh.map_or(false, |since| since < stale_threshold);
        if !has_active_viewers && fresh_enough {
            return false;
        }
        since_refresh.map_or(true, |since| since >= auto_interval)
    }

    /// The recurring tick. Exits when shutdown is signalled; an in-flight
    /// cycle finishes its swap before the process leaves main.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut interval = tokio::time::interval(self.config.refresh_interval);
        // The constructor tick fires immediately; skip it so startup decides
        // on the first real period boundary like every later one.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    tracing::info!("Scheduler stopping");
                    return;
                }
            }

            let now = Utc::now().timestamp();
            let since = self
                .cache
                .time_since_last_refresh(now)
                .map(|s| Duration::from_secs(s as u64));
            let viewers = self.cache.active_viewer_count(Instant::now());

            if Self::decide(
                false,
                viewers > 0,
                since,
                self.config.refresh_interval,
                self.config.stale_threshold,
            ) {
                let task_id = self.trigger();
                tracing::info!("Scheduled refresh running as task {}", task_id);
            } else {
                tracing::debug!(
                    "Skipping refresh: {} active viewers, since_refresh={:?}",
                    viewers,
                    since
                );
            }
        }
    }

    /// Called on every read. When the cache is past the stale threshold the
    /// scheduler kicks off a background cycle; the read itself still serves
    /// the previous cycle.
    pub fn maybe_trigger_on_read(self: &Arc<Self>) {
        let now = Utc::now().timestamp();
        let stale = match self.cache.time_since_last_refresh(now) {
            Some(since) => Duration::from_secs(since as u64) >= self.config.stale_threshold,
            None => true,
        };
        if stale && !self.cache.cycle_running() {
            let task_id = self.trigger();
            tracing::info!("Stale read triggered refresh task {}", task_id);
        }
    }

    /// Start a fetch cycle, or coalesce onto the one already running.
    /// Returns the task handle either way.
    pub fn trigger(self: &Arc<Self>) -> String {
        let task_id = uuid::Uuid::new_v4().to_string();
        if !self.cache.try_begin_cycle(&task_id) {
            if let Some(running) = self.cache.running_task_id() {
                return running;
            }
            return task_id;
        }

        self.tasks.insert(task_id.clone(), TaskState::Pending);
        let scheduler = self.clone();
        let id = task_id.clone();
        tokio::spawn(async move {
            scheduler.run_cycle(id).await;
        });
        task_id
    }

    pub fn task_state(&self, task_id: &str) -> Option<TaskState> {
        self.tasks.get(task_id).map(|s| s.clone())
    }

    /// One complete cycle: fetch, de-vig, score, assemble, swap, then hand
    /// the ranked list to the persistence writer. Any failure leaves the
    /// previous cycle's cache in place.
    async fn run_cycle(self: Arc<Self>, task_id: String) {
        self.tasks.insert(task_id.clone(), TaskState::Running);
        let started = Instant::now();
        let mut shutdown = self.shutdown.clone();

        let market_kinds = crate::models::MarketKind::all();
        let snapshot = tokio::select! {
            result = self
                .client
                .fetch_snapshot(&self.config.sport_keys, &market_kinds) => {
                match result {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        tracing::error!("Fetch cycle failed: {}", e);
                        self.tasks
                            .insert(task_id, TaskState::Failed { error: e.to_string() });
                        self.cache.finish_cycle();
                        return;
                    }
                }
            }
            _ = shutdown.changed() => {
                tracing::info!("Cycle {} cancelled during fetch, discarding", task_id);
                self.tasks
                    .insert(task_id, TaskState::Failed { error: "cancelled".into() });
                self.cache.finish_cycle();
                return;
            }
        };

        if snapshot.events.is_empty() {
            tracing::info!("no_data: upstream returned no events, cache unchanged");
            self.tasks.insert(task_id, TaskState::Done);
            self.cache.finish_cycle();
            return;
        }

        let ranked = build_opportunities(&snapshot, &self.scorer);
        let total = ranked.len();
        let tiers: HashMap<Tier, Vec<Opportunity>> = Tier::all()
            .into_iter()
            .map(|tier| (tier, filter_for_tier(tier, &ranked)))
            .collect();

        let cycle_id = self.cache.swap(tiers, total, snapshot.fetched_at_unix);
        tracing::info!(
            "Cycle {} complete: {} events, {} opportunities in {:?}",
            cycle_id,
            snapshot.events.len(),
            total,
            started.elapsed()
        );

        // Durable writes happen after the swap so reads never wait on them.
        let writer = self.writer.clone();
        tokio::spawn(async move {
            writer.persist_cycle(&ranked).await;
        });

        self.tasks.insert(task_id, TaskState::Done);
        self.cache.finish_cycle();
    }
}
