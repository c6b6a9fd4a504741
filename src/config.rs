use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::env;
use std::time::Duration;

/// Runtime configuration, collected once at startup. Every recognised option
/// is listed here; an unrecognised FAIRLINE_* variable aborts startup so a
/// typo never silently falls back to a default.
#[derive(Debug, Clone)]
pub struct Config {
    pub odds_api_key: String,
    pub odds_api_base_url: String,
    pub database_url: String,
    pub refresh_interval: Duration,
    pub stale_threshold: Duration,
    pub session_ttl: Duration,
    pub upstream_timeout: Duration,
    pub exchange_fee_bps: u32,
    pub exchange_books: HashSet<String>,
    pub sport_keys: Vec<String>,
}

const RECOGNISED_KEYS: &[&str] = &[
    "FAIRLINE_REFRESH_INTERVAL_SECS",
    "FAIRLINE_STALE_THRESHOLD_SECS",
    "FAIRLINE_SESSION_TTL_SECS",
    "FAIRLINE_UPSTREAM_TIMEOUT_SECS",
    "FAIRLINE_EXCHANGE_FEE_BPS",
    "FAIRLINE_EXCHANGE_BOOKS",
    "FAIRLINE_SPORT_KEYS",
];

impl Config {
    pub fn from_env() -> Result<Self> {
        // Reject unknown FAIRLINE_* keys before reading anything else.
        for (key, _) in env::vars() {
            if key.starts_with("FAIRLINE_") && !RECOGNISED_KEYS.contains(&key.as_str()) {
                bail!("unrecognised configuration variable: {}", key);
            }
        }

        let odds_api_key = env::var("ODDS_API_KEY")
            .context("ODDS_API_KEY must be set")?;
        let database_url = env::var("DATABASE_URL")
            .context("DATABASE_URL must be set")?;
        let odds_api_base_url = env::var("ODDS_API_BASE_URL")
            .unwrap_or_else(|_| "https://api.the-odds-api.com".to_string());

        let refresh_interval = secs_var("FAIRLINE_REFRESH_INTERVAL_SECS", 900)?;
        let stale_threshold = secs_var("FAIRLINE_STALE_THRESHOLD_SECS", 1800)?;
        let session_ttl = secs_var("FAIRLINE_SESSION_TTL_SECS", 300)?;
        let upstream_timeout = secs_var("FAIRLINE_UPSTREAM_TIMEOUT_SECS", 30)?;

        let exchange_fee_bps = match env::var("FAIRLINE_EXCHANGE_FEE_BPS") {
            Ok(raw) => raw
                .parse::<u32>()
                .with_context(|| format!("invalid FAIRLINE_EXCHANGE_FEE_BPS: {}", raw))?,
            Err(_) => 200,
        };
        if exchange_fee_bps >= 10_000 {
            bail!("FAIRLINE_EXCHANGE_FEE_BPS must be below 10000");
        }

        let exchange_books = csv_var("FAIRLINE_EXCHANGE_BOOKS", "prophetx")
            .into_iter()
            .collect();

        let sport_keys = csv_var(
            "FAIRLINE_SPORT_KEYS",
            "basketball_nba,americanfootball_nfl,baseball_mlb",
        );
        if sport_keys.is_empty() {
            bail!("FAIRLINE_SPORT_KEYS must name at least one sport");
        }

        Ok(Self {
            odds_api_key,
            odds_api_base_url,
            database_url,
            refresh_interval,
            stale_threshold,
            session_ttl,
            upstream_timeout,
            exchange_fee_bps,
            exchange_books,
            sport_keys,
        })
    }

    /// Exchange commission as a fraction (200 bps -> 0.02).
    pub fn exchange_fee(&self) -> f64 {
        self.exchange_fee_bps as f64 / 10_000.0
    }
}

fn secs_var(key: &str, default: u64) -> Result<Duration> {
    match env::var(key) {
        Ok(raw) => {
            let secs = raw
                .parse::<u64>()
                .with_context(|| format!("invalid {}: {}", key, raw))?;
            if secs == 0 {
                bail!("{} must be positive", key);
            }
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

fn csv_var(key: &str, default: &str) -> Vec<String> {
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
