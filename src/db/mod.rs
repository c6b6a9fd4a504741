use anyhow::Result;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::path::PathBuf;
use std::str::FromStr;

use crate::models::{BetRow, OfferRow};

/// Open (creating if missing) the database behind a sqlite url. SQLite will
/// create a missing file on its own but not a missing directory, so the
/// file's directory is ensured first.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    if let Some(file) = sqlite_file_path(database_url) {
        if let Some(dir) = file.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    Ok(SqlitePool::connect_with(options).await?)
}

/// The file a sqlite url points at, or None for in-memory databases.
fn sqlite_file_path(database_url: &str) -> Option<PathBuf> {
    let path = database_url
        .strip_prefix("sqlite:")
        .unwrap_or(database_url)
        .trim_start_matches("//");
    if path.is_empty() || path.starts_with(":memory:") {
        return None;
    }
    Some(PathBuf::from(path))
}

pub async fn init_database_with_pool(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            sha TEXT PRIMARY KEY,
            sport_key TEXT NOT NULL,
            league TEXT NOT NULL,
            commence_unix INTEGER NOT NULL,
            home_team TEXT NOT NULL,
            away_team TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS bets (
            id TEXT PRIMARY KEY,
            bet_key TEXT NOT NULL UNIQUE,
            event_sha TEXT NOT NULL,
            market_kind TEXT NOT NULL,
            outcome_key TEXT NOT NULL,
            parameter TEXT NOT NULL DEFAULT '',
            player TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL,
            FOREIGN KEY (event_sha) REFERENCES events (sha)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // The dedup tuple itself is UNIQUE; bet_key is its hash for fast lookups.
    sqlx::query(
        r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_bets_dedup
           ON bets(event_sha, market_kind, outcome_key, parameter, player)"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS offers (
            id TEXT PRIMARY KEY,
            bet_id TEXT NOT NULL,
            book TEXT NOT NULL,
            price INTEGER NOT NULL,
            observed_at INTEGER NOT NULL,
            FOREIGN KEY (bet_id) REFERENCES bets (id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_offers_bet_observed ON offers(bet_id, observed_at DESC)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database initialized successfully");
    Ok(())
}

/// Cheap connectivity probe for the health endpoint.
pub async fn ping(pool: &SqlitePool) -> bool {
    sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(pool)
        .await
        .is_ok()
}

// ── Event operations ─────────────────────────────────────────────────────────

/// Insert the event on first observation; on conflict only correct a drifted
/// start time. History is never destroyed.
pub async fn upsert_event(
    conn: &mut SqliteConnection,
    sha: &str,
    sport_key: &str,
    league: &str,
    commence_unix: i64,
    home_team: &str,
    away_team: &str,
    now_unix: i64,
) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO events (sha, sport_key, league, commence_unix, home_team, away_team, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(sha) DO UPDATE SET
               commence_unix = excluded.commence_unix,
               updated_at    = excluded.updated_at"#,
    )
    .bind(sha)
    .bind(sport_key)
    .bind(league)
    .bind(commence_unix)
    .bind(home_team)
    .bind(away_team)
    .bind(now_unix)
    .bind(now_unix)
    .execute(conn)
    .await?;
    Ok(())
}

// ── Bet operations ───────────────────────────────────────────────────────────

/// Find or create the dedup anchor for one market outcome. The tuple is
/// UNIQUE, so concurrent observers converge on one row.
pub async fn find_or_create_bet(
    conn: &mut SqliteConnection,
    bet_key: &str,
    event_sha: &str,
    market_kind: &str,
    outcome_key: &str,
    parameter: &str,
    player: &str,
    now_unix: i64,
) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        r#"INSERT OR IGNORE INTO bets
           (id, bet_key, event_sha, market_kind, outcome_key, parameter, player, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&id)
    .bind(bet_key)
    .bind(event_sha)
    .bind(market_kind)
    .bind(outcome_key)
    .bind(parameter)
    .bind(player)
    .bind(now_unix)
    .execute(&mut *conn)
    .await?;

    let row = sqlx::query("SELECT id FROM bets WHERE bet_key = ?")
        .bind(bet_key)
        .fetch_one(conn)
        .await?;
    Ok(row.get("id"))
}

pub async fn get_bet_by_key(pool: &SqlitePool, bet_key: &str) -> Result<Option<BetRow>> {
    let row = sqlx::query_as::<_, BetRow>("SELECT * FROM bets WHERE bet_key = ?")
        .bind(bet_key)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

// ── Offer operations ─────────────────────────────────────────────────────────

/// Offers are append-only; every observation lands as a new row stamped with
/// the snapshot time.
pub async fn insert_offer(
    conn: &mut SqliteConnection,
    bet_id: &str,
    book: &str,
    price: i32,
    observed_at: i64,
) -> Result<()> {
    let id = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO offers (id, bet_id, book, price, observed_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(bet_id)
    .bind(book)
    .bind(price)
    .bind(observed_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// The observed time series for one bet, newest first.
pub async fn get_offers_for_bet(pool: &SqlitePool, bet_id: &str) -> Result<Vec<OfferRow>> {
    let rows = sqlx::query_as::<_, OfferRow>(
        "SELECT * FROM offers WHERE bet_id = ? ORDER BY observed_at DESC",
    )
    .bind(bet_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn count_bets(pool: &SqlitePool) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM bets")
        .fetch_one(pool)
        .await?)
}

pub async fn count_offers(pool: &SqlitePool) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM offers")
        .fetch_one(pool)
        .await?)
}

pub async fn count_offers_for_bet(pool: &SqlitePool, bet_id: &str) -> Result<i64> {
    Ok(
        sqlx::query_scalar("SELECT COUNT(*) FROM offers WHERE bet_id = ?")
            .bind(bet_id)
            .fetch_one(pool)
            .await?,
    )
}

#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    use sqlx::sqlite::SqlitePoolOptions;
    // One connection so the in-memory database is shared across uses
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    init_database_with_pool(&pool).await.unwrap();
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_file_path_forms() {
        assert_eq!(
            sqlite_file_path("sqlite:data/app.db"),
            Some(PathBuf::from("data/app.db"))
        );
        assert_eq!(
            sqlite_file_path("sqlite://data/app.db"),
            Some(PathBuf::from("data/app.db"))
        );
        assert_eq!(
            sqlite_file_path("sqlite:///var/lib/app.db"),
            Some(PathBuf::from("/var/lib/app.db"))
        );
        assert_eq!(sqlite_file_path("sqlite::memory:"), None);
    }

    #[tokio::test]
    async fn test_create_pool_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("nested/data/fairline.db");
        let url = format!("sqlite://{}", file.display());

        let pool = create_pool(&url).await.unwrap();
        init_database_with_pool(&pool).await.unwrap();
        assert!(ping(&pool).await);
        assert!(file.exists());
        pool.close().await;
    }

    #[tokio::test]
    async fn test_bet_tuple_is_unique() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();

        upsert_event(&mut conn, "sha1", "basketball_nba", "NBA", 100, "Celtics", "Lakers", 1)
            .await
            .unwrap();

        let first =
            find_or_create_bet(&mut conn, "key1", "sha1", "moneyline", "Celtics", "", "", 1)
                .await
                .unwrap();
        let second =
            find_or_create_bet(&mut conn, "key1", "sha1", "moneyline", "Celtics", "", "", 2)
                .await
                .unwrap();
        assert_eq!(first, second);
        drop(conn);
        assert_eq!(count_bets(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_offers_append_only() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();

        upsert_event(&mut conn, "sha1", "basketball_nba", "NBA", 100, "Celtics", "Lakers", 1)
            .await
            .unwrap();
        let bet = find_or_create_bet(&mut conn, "key1", "sha1", "moneyline", "Celtics", "", "", 1)
            .await
            .unwrap();

        insert_offer(&mut conn, &bet, "draftkings", -110, 10).await.unwrap();
        insert_offer(&mut conn, &bet, "draftkings", -110, 20).await.unwrap();
        drop(conn);
        assert_eq!(count_offers_for_bet(&pool, &bet).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_event_time_drift_correction() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();

        upsert_event(&mut conn, "sha1", "basketball_nba", "NBA", 100, "Celtics", "Lakers", 1)
            .await
            .unwrap();
        upsert_event(&mut conn, "sha1", "basketball_nba", "NBA", 160, "Celtics", "Lakers", 2)
            .await
            .unwrap();

        drop(conn);
        let (commence, created): (i64, i64) = sqlx::query_as(
            "SELECT commence_unix, created_at FROM events WHERE sha = 'sha1'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(commence, 160);
        assert_eq!(created, 1);
    }
}
