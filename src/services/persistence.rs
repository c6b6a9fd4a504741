use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use sqlx::SqlitePool;
use tokio::sync::Semaphore;

use crate::db;
use crate::models::Opportunity;
use crate::utils::canonical_parameter;

const BATCH_SIZE: usize = 200;
const WORKER_POOL_SIZE: usize = 4;

#[derive(Debug, Default, Clone, Copy)]
pub struct PersistStats {
    pub bets: usize,
    pub offers: usize,
    pub failed: usize,
}

impl PersistStats {
    fn absorb(&mut self, other: PersistStats) {
        self.bets += other.bets;
        self.offers += other.offers;
        self.failed += other.failed;
    }
}

/// Appends each cycle's observations to durable storage: one Event per
/// contest, one Bet row per dedup tuple (reused across cycles), one Offer
/// row per observed (book, price). Runs after the cache swap and never
/// fails the read path. Batches of 200 run as independent transactions
/// through a worker pool bounded at 4, each retried once.
pub struct PersistenceWriter {
    pool: SqlitePool,
    workers: Arc<Semaphore>,
}

impl PersistenceWriter {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            workers: Arc::new(Semaphore::new(WORKER_POOL_SIZE)),
        }
    }

    pub async fn persist_cycle(&self, opportunities: &[Opportunity]) -> PersistStats {
        let batch_results = join_all(opportunities.chunks(BATCH_SIZE).map(|batch| async move {
            // The semaphore is the pool bound: at most 4 batches in flight
            let _permit = self.workers.acquire().await.ok();
            self.persist_batch_with_retry(batch).await
        }))
        .await;

        let mut stats = PersistStats::default();
        for batch_stats in batch_results {
            stats.absorb(batch_stats);
        }

        tracing::info!(
            "Persisted cycle: {} bets touched, {} offers appended, {} failed",
            stats.bets,
            stats.offers,
            stats.failed
        );
        stats
    }

    async fn persist_batch_with_retry(&self, batch: &[Opportunity]) -> PersistStats {
        match self.persist_batch(batch).await {
            Ok(stats) => stats,
            Err(first) => {
                tracing::warn!("Persistence batch failed: {}. Retrying once", first);
                match self.persist_batch(batch).await {
                    Ok(stats) => stats,
                    Err(second) => {
                        tracing::error!(
                            "Persistence batch dropped after retry ({} opportunities): {}",
                            batch.len(),
                            second
                        );
                        PersistStats {
                            failed: batch.len(),
                            ..PersistStats::default()
                        }
                    }
                }
            }
        }
    }

    /// One transaction per batch. Individual opportunities fail
    /// independently; only a transaction-level error bubbles up for retry.
    async fn persist_batch(&self, batch: &[Opportunity]) -> Result<PersistStats> {
        let mut stats = PersistStats::default();
        let now_unix = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let mut seen_events: HashSet<&str> = HashSet::new();

        for opportunity in batch {
            if seen_events.insert(opportunity.event_sha.as_str()) {
                db::upsert_event(
                    &mut tx,
                    &opportunity.event_sha,
                    &opportunity.sport,
                    &opportunity.league,
                    opportunity.event_start_unix,
                    &opportunity.home_team,
                    &opportunity.away_team,
                    now_unix,
                )
                .await?;
            }

            match self.persist_opportunity(&mut tx, opportunity, now_unix).await {
                Ok(offers) => {
                    stats.bets += 1;
                    stats.offers += offers;
                }
                Err(e) => {
                    tracing::warn!(
                        "Skipping persistence for {} ({}): {}",
                        opportunity.bet_description,
                        opportunity.event,
                        e
                    );
                    stats.failed += 1;
                }
            }
        }

        tx.commit().await?;
        Ok(stats)
    }

    async fn persist_opportunity(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        opportunity: &Opportunity,
        now_unix: i64,
    ) -> Result<usize> {
        let bet_id = db::find_or_create_bet(
            tx,
            &opportunity.id,
            &opportunity.event_sha,
            opportunity.bet_type.as_str(),
            &opportunity.outcome_key,
            &canonical_parameter(opportunity.parameter),
            opportunity.player.as_deref().unwrap_or(""),
            now_unix,
        )
        .await?;

        let mut appended = 0;
        for offer in &opportunity.all_offers {
            db::insert_offer(tx, &bet_id, &offer.book, offer.price, opportunity.ts).await?;
            appended += 1;
        }
        Ok(appended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BookOffer, EvClass, MarketKind};

    fn opportunity(offers: Vec<(&str, i32)>, ts: i64) -> Opportunity {
        let all_offers: Vec<BookOffer> = offers
            .into_iter()
            .map(|(book, price)| BookOffer {
                book: book.into(),
                price,
            })
            .collect();
        let best = all_offers[0].clone();
        Opportunity {
            id: "betkey-m".into(),
            event: "Celtics vs Lakers".into(),
            bet_description: "Celtics ML".into(),
            bet_type: MarketKind::Moneyline,
            ev_pct: 1.0,
            ev_class: EvClass::Neutral,
            best_odds: best.price,
            best_book: best.book,
            fair_odds: 100,
            all_offers,
            sport: "basketball_nba".into(),
            ts,
            event_start_unix: 1_767_225_600,
            fair_probability: 0.5,
            event_sha: "sha-1".into(),
            home_team: "Celtics".into(),
            away_team: "Lakers".into(),
            league: "NBA".into(),
            outcome_key: "Celtics".into(),
            parameter: None,
            player: None,
        }
    }

    #[tokio::test]
    async fn test_second_cycle_reuses_bet_and_appends_offers() {
        // S4: cycle 1 sees books {X:+100, Y:+105}; cycle 2 adds Z and moves Y.
        let pool = db::test_pool().await;
        let writer = PersistenceWriter::new(pool.clone());

        let first = writer
            .persist_cycle(&[opportunity(vec![("bookx", 100), ("booky", 105)], 10)])
            .await;
        assert_eq!(first.offers, 2);
        assert_eq!(db::count_bets(&pool).await.unwrap(), 1);
        assert_eq!(db::count_offers(&pool).await.unwrap(), 2);
        let bet = db::get_bet_by_key(&pool, "betkey-m").await.unwrap().unwrap();

        let second = writer
            .persist_cycle(&[opportunity(
                vec![("bookx", 100), ("booky", 110), ("bookz", -95)],
                20,
            )])
            .await;
        assert_eq!(second.offers, 3);
        assert_eq!(db::count_bets(&pool).await.unwrap(), 1);
        assert_eq!(db::count_offers(&pool).await.unwrap(), 5);

        let bet_after = db::get_bet_by_key(&pool, "betkey-m").await.unwrap().unwrap();
        assert_eq!(bet.id, bet_after.id);

        // Snapshot timestamps make the ordering recoverable from data
        let offers = db::get_offers_for_bet(&pool, &bet.id).await.unwrap();
        assert_eq!(offers.len(), 5);
        assert_eq!(offers[0].observed_at, 20);
        assert_eq!(offers[4].observed_at, 10);
    }

    #[tokio::test]
    async fn test_identical_snapshot_rerun_adds_one_row_per_book() {
        let pool = db::test_pool().await;
        let writer = PersistenceWriter::new(pool.clone());
        let opp = opportunity(vec![("bookx", 100), ("booky", 105)], 10);

        writer.persist_cycle(std::slice::from_ref(&opp)).await;
        writer.persist_cycle(std::slice::from_ref(&opp)).await;

        assert_eq!(db::count_bets(&pool).await.unwrap(), 1);
        // Two runs x two books: snapshot rows accumulate, identity does not
        assert_eq!(db::count_offers(&pool).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_distinct_outcomes_create_distinct_bets() {
        let pool = db::test_pool().await;
        let writer = PersistenceWriter::new(pool.clone());

        let a = opportunity(vec![("bookx", 100)], 10);
        let mut b = opportunity(vec![("bookx", -120)], 10);
        b.id = "betkey-other".into();
        b.outcome_key = "Lakers".into();

        writer.persist_cycle(&[a, b]).await;
        assert_eq!(db::count_bets(&pool).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_multi_batch_cycle_persists_everything() {
        // 450 opportunities span three batches running through the pool
        let pool = db::test_pool().await;
        let writer = PersistenceWriter::new(pool.clone());

        let cycle: Vec<Opportunity> = (0..450)
            .map(|i| {
                let mut o = opportunity(vec![("bookx", 100)], 10);
                o.id = format!("betkey-{i}");
                o.outcome_key = format!("outcome-{i}");
                o
            })
            .collect();

        let stats = writer.persist_cycle(&cycle).await;
        assert_eq!(stats.bets, 450);
        assert_eq!(stats.failed, 0);
        assert_eq!(db::count_bets(&pool).await.unwrap(), 450);
        assert_eq!(db::count_offers(&pool).await.unwrap(), 450);
    }
}
