use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

use crate::config::Config;
use crate::models::{BookOffer, EventOdds, MarketKind, MarketOdds, OutcomeOdds, Snapshot};
use crate::utils::{is_valid_american, parse_event_time};

/// Upstream failure taxonomy. Retryable kinds abort the cycle only after
/// backoff retries are exhausted; a bad response body is fatal for the cycle.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("rate limited by upstream")]
    RateLimited,
    #[error("bad upstream response: {0}")]
    BadResponse(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::UpstreamUnavailable(_) | FetchError::RateLimited
        )
    }
}

const MAX_ATTEMPTS: u32 = 3;

// ── Upstream response types ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ApiEvent {
    pub id: String,
    pub sport_key: String,
    #[serde(default)]
    pub sport_title: String,
    pub commence_time: serde_json::Value,
    pub home_team: String,
    pub away_team: String,
    #[serde(default)]
    pub bookmakers: Vec<ApiBookmaker>,
}

#[derive(Debug, Deserialize)]
pub struct ApiBookmaker {
    pub key: String,
    #[serde(default)]
    pub markets: Vec<ApiMarket>,
}

#[derive(Debug, Deserialize)]
pub struct ApiMarket {
    pub key: String,
    #[serde(default)]
    pub outcomes: Vec<ApiOutcome>,
}

#[derive(Debug, Deserialize)]
pub struct ApiOutcome {
    pub name: String,
    pub price: f64,
    pub point: Option<f64>,
    /// Player name on prop markets.
    pub description: Option<String>,
}

// ── Client ───────────────────────────────────────────────────────────────────

/// Pulls raw market snapshots from the upstream provider and folds them into
/// the typed event / market / outcome tree the pipeline consumes.
pub struct OddsClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OddsClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.upstream_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.odds_api_base_url.clone(),
            api_key: config.odds_api_key.clone(),
        })
    }

    /// One GET per sport key; retryable failures back off exponentially
    /// before the whole cycle is abandoned.
    pub async fn fetch_snapshot(
        &self,
        sport_keys: &[String],
        market_kinds: &[MarketKind],
    ) -> Result<Snapshot, FetchError> {
        let markets_param = market_kinds
            .iter()
            .map(|k| k.upstream_key())
            .collect::<Vec<_>>()
            .join(",");

        let mut events = Vec::new();
        for sport in sport_keys {
            let raw = self.fetch_sport_with_retry(sport, &markets_param).await?;
            events.extend(fold_events(raw));
        }

        Ok(Snapshot {
            fetched_at_unix: Utc::now().timestamp(),
            events,
        })
    }

    async fn fetch_sport_with_retry(
        &self,
        sport: &str,
        markets_param: &str,
    ) -> Result<Vec<ApiEvent>, FetchError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.fetch_sport(sport, markets_param).await {
                Ok(events) => return Ok(events),
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    let wait = Duration::from_secs(1 << (attempt - 1));
                    tracing::warn!(
                        "Upstream fetch failed for {} (attempt {}/{}): {}. Retrying in {:?}",
                        sport,
                        attempt,
                        MAX_ATTEMPTS,
                        e,
                        wait
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_sport(
        &self,
        sport: &str,
        markets_param: &str,
    ) -> Result<Vec<ApiEvent>, FetchError> {
        let url = format!(
            "{}/v4/sports/{}/odds/?apiKey={}&regions=us&markets={}&oddsFormat=american",
            self.base_url, sport, self.api_key, markets_param
        );

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                FetchError::UpstreamUnavailable(e.to_string())
            } else {
                FetchError::BadResponse(e.to_string())
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(FetchError::RateLimited);
        }
        if status.is_server_error() {
            return Err(FetchError::UpstreamUnavailable(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::BadResponse(format!("HTTP {}: {}", status, body)));
        }

        if let Some(remaining) = response
            .headers()
            .get("x-requests-remaining")
            .and_then(|v| v.to_str().ok())
        {
            tracing::debug!("Upstream quota remaining for {}: {}", sport, remaining);
        }

        response
            .json::<Vec<ApiEvent>>()
            .await
            .map_err(|e| FetchError::BadResponse(e.to_string()))
    }
}

// ── Folding raw events into the snapshot tree ────────────────────────────────

/// Group every book's quotes into per-market outcome sets. Malformed events
/// (unparsable start time, empty participant names) and unquotable prices are
/// dropped here so the rest of the cycle runs on the remainder.
pub fn fold_events(raw: Vec<ApiEvent>) -> Vec<EventOdds> {
    let mut events = Vec::new();

    for api_event in raw {
        let Some(commence_unix) = normalise_commence(&api_event.commence_time) else {
            tracing::warn!(
                "Discarding event {}: unparsable commence_time {:?}",
                api_event.id,
                api_event.commence_time
            );
            continue;
        };
        if api_event.home_team.trim().is_empty() || api_event.away_team.trim().is_empty() {
            tracing::warn!("Discarding event {}: empty participant name", api_event.id);
            continue;
        }

        // (kind, player, grouped line) -> (outcome name, signed point) -> offers
        type OutcomeMap = BTreeMap<(String, Option<i64>), Vec<BookOffer>>;
        let mut markets: BTreeMap<(MarketKind, String, Option<i64>), OutcomeMap> =
            BTreeMap::new();

        for bookmaker in &api_event.bookmakers {
            for market in &bookmaker.markets {
                let Some(kind) = MarketKind::from_upstream_key(&market.key) else {
                    continue;
                };
                for outcome in &market.outcomes {
                    let price = outcome.price.round() as i32;
                    if (outcome.price - price as f64).abs() > 1e-9 || !is_valid_american(price) {
                        tracing::debug!(
                            "Dropping offer {} {} at {}: not a valid american price",
                            bookmaker.key,
                            outcome.name,
                            outcome.price
                        );
                        continue;
                    }
                    if outcome.name.trim().is_empty() {
                        continue;
                    }

                    let player = outcome.description.clone().unwrap_or_default();
                    let market_key = (kind, player, group_line(kind, outcome.point));
                    let outcome_key = (outcome.name.clone(), line_key(outcome.point));
                    markets
                        .entry(market_key)
                        .or_default()
                        .entry(outcome_key)
                        .or_default()
                        .push(BookOffer {
                            book: bookmaker.key.clone(),
                            price,
                        });
                }
            }
        }

        let folded: Vec<MarketOdds> = markets
            .into_iter()
            .map(|((kind, player, grouped), outcomes)| MarketOdds {
                kind,
                parameter: grouped.map(|l| l as f64 / 10.0),
                player: (!player.is_empty()).then_some(player),
                outcomes: outcomes
                    .into_iter()
                    .map(|((name, point), offers)| OutcomeOdds {
                        outcome: name,
                        point: point.map(|p| p as f64 / 10.0),
                        offers,
                    })
                    .collect(),
            })
            .collect();

        events.push(EventOdds {
            upstream_id: api_event.id,
            sport_key: api_event.sport_key,
            league: api_event.sport_title,
            commence_unix,
            home_team: api_event.home_team,
            away_team: api_event.away_team,
            markets: folded,
        });
    }

    events
}

/// Lines in tenths so f64 points can key a map. Half-point markets are the
/// finest granularity upstream quotes.
fn line_key(point: Option<f64>) -> Option<i64> {
    point.map(|p| (p * 10.0).round() as i64)
}

/// The line that identifies a market across books. Spread sides carry
/// opposite signs, so both group under the absolute line; totals and props
/// share the quoted number.
fn group_line(kind: MarketKind, point: Option<f64>) -> Option<i64> {
    match kind {
        MarketKind::Spread => line_key(point.map(f64::abs)),
        _ => line_key(point),
    }
}

fn normalise_commence(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::String(s) => parse_event_time(s),
        serde_json::Value::Number(n) => {
            let raw = n.to_string();
            parse_event_time(&raw)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event_json() -> serde_json::Value {
        serde_json::json!({
            "id": "abc123",
            "sport_key": "basketball_nba",
            "sport_title": "NBA",
            "commence_time": "2026-01-01T00:00:00Z",
            "home_team": "Celtics",
            "away_team": "Lakers",
            "bookmakers": [
                {
                    "key": "draftkings",
                    "markets": [
                        { "key": "h2h", "outcomes": [
                            { "name": "Celtics", "price": -110.0 },
                            { "name": "Lakers", "price": -110.0 }
                        ]},
                        { "key": "spreads", "outcomes": [
                            { "name": "Celtics", "price": -110.0, "point": -3.5 },
                            { "name": "Lakers", "price": -110.0, "point": 3.5 }
                        ]}
                    ]
                },
                {
                    "key": "fanduel",
                    "markets": [
                        { "key": "h2h", "outcomes": [
                            { "name": "Celtics", "price": 105.0 },
                            { "name": "Lakers", "price": -115.0 }
                        ]}
                    ]
                }
            ]
        })
    }

    fn parse(value: serde_json::Value) -> Vec<ApiEvent> {
        serde_json::from_value(serde_json::Value::Array(vec![value])).unwrap()
    }

    #[test]
    fn test_fold_groups_books_per_market() {
        let events = fold_events(parse(sample_event_json()));
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.commence_unix, 1767225600);
        assert_eq!(event.markets.len(), 2);

        let ml = event
            .markets
            .iter()
            .find(|m| m.kind == MarketKind::Moneyline)
            .unwrap();
        assert_eq!(ml.outcomes.len(), 2);
        let celtics = ml.outcomes.iter().find(|o| o.outcome == "Celtics").unwrap();
        assert_eq!(celtics.offers.len(), 2);

        // Both spread sides grouped under one market keyed by |3.5|
        let spread = event
            .markets
            .iter()
            .find(|m| m.kind == MarketKind::Spread)
            .unwrap();
        assert_eq!(spread.parameter, Some(3.5));
        assert_eq!(spread.outcomes.len(), 2);
        let lakers = spread.outcomes.iter().find(|o| o.outcome == "Lakers").unwrap();
        assert_eq!(lakers.point, Some(3.5));
    }

    #[test]
    fn test_invalid_price_dropped() {
        let mut value = sample_event_json();
        value["bookmakers"][1]["markets"][0]["outcomes"][0]["price"] =
            serde_json::json!(-99.0);
        let events = fold_events(parse(value));
        let ml = events[0]
            .markets
            .iter()
            .find(|m| m.kind == MarketKind::Moneyline)
            .unwrap();
        let celtics = ml.outcomes.iter().find(|o| o.outcome == "Celtics").unwrap();
        assert_eq!(celtics.offers.len(), 1);
        assert_eq!(celtics.offers[0].book, "draftkings");
    }

    #[test]
    fn test_unparsable_commence_time_discards_event() {
        let mut value = sample_event_json();
        value["commence_time"] = serde_json::json!("tomorrow-ish");
        assert!(fold_events(parse(value)).is_empty());
    }

    #[test]
    fn test_unix_seconds_commence_time_accepted() {
        let mut value = sample_event_json();
        value["commence_time"] = serde_json::json!(1767225600_i64);
        let events = fold_events(parse(value));
        assert_eq!(events[0].commence_unix, 1767225600);
    }

    #[test]
    fn test_empty_team_name_discards_event() {
        let mut value = sample_event_json();
        value["home_team"] = serde_json::json!("");
        assert!(fold_events(parse(value)).is_empty());
    }

    #[test]
    fn test_unknown_market_key_ignored() {
        let mut value = sample_event_json();
        value["bookmakers"][0]["markets"][0]["key"] = serde_json::json!("alternate_spreads");
        let events = fold_events(parse(value));
        // The h2h quotes from fanduel remain; the renamed market is dropped
        let ml = events[0]
            .markets
            .iter()
            .find(|m| m.kind == MarketKind::Moneyline)
            .unwrap();
        assert!(ml.outcomes.iter().all(|o| o.offers.len() == 1));
    }

    #[test]
    fn test_player_prop_folding() {
        let value = serde_json::json!({
            "id": "prop1",
            "sport_key": "basketball_nba",
            "sport_title": "NBA",
            "commence_time": "2026-01-01T00:00:00Z",
            "home_team": "Celtics",
            "away_team": "Lakers",
            "bookmakers": [{
                "key": "draftkings",
                "markets": [{ "key": "player_points", "outcomes": [
                    { "name": "Over", "price": -115.0, "point": 25.5, "description": "LeBron James" },
                    { "name": "Under", "price": -105.0, "point": 25.5, "description": "LeBron James" }
                ]}]
            }]
        });
        let events = fold_events(parse(value));
        let market = &events[0].markets[0];
        assert_eq!(market.kind, MarketKind::PlayerPoints);
        assert_eq!(market.player.as_deref(), Some("LeBron James"));
        assert_eq!(market.parameter, Some(25.5));
        assert_eq!(market.outcomes.len(), 2);
    }
}
