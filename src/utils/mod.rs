use chrono::DateTime;
use sha2::{Digest, Sha256};

/// Convert american odds to the implied probability.
/// Positive odds: 100/(o+100). Negative odds: |o|/(|o|+100).
pub fn american_to_probability(odds: i32) -> f64 {
    if odds > 0 {
        100.0 / (odds as f64 + 100.0)
    } else {
        let o = odds.abs() as f64;
        o / (o + 100.0)
    }
}

/// Convert american odds to decimal odds (1 + profit/stake).
pub fn american_to_decimal(odds: i32) -> f64 {
    if odds > 0 {
        1.0 + odds as f64 / 100.0
    } else {
        1.0 + 100.0 / odds.abs() as f64
    }
}

/// Convert decimal odds back to the nearest american integer price.
pub fn decimal_to_american(decimal: f64) -> i32 {
    if decimal >= 2.0 {
        ((decimal - 1.0) * 100.0).round() as i32
    } else {
        (-100.0 / (decimal - 1.0)).round() as i32
    }
}

/// Express a fair probability as american odds for display.
/// Probabilities outside the open interval (0, 1) have no finite price.
pub fn probability_to_american(probability: f64) -> Option<i32> {
    if probability <= 0.0 || probability >= 1.0 || !probability.is_finite() {
        return None;
    }
    Some(decimal_to_american(1.0 / probability))
}

/// True when the integer is a quotable american price (|odds| >= 100).
pub fn is_valid_american(odds: i32) -> bool {
    odds >= 100 || odds <= -100
}

/// Stable event identity: sha256 over name, start time and sport key.
/// Reused across cycles so drifting upstream ids never split an event.
pub fn event_sha(event_name: &str, event_time_unix: i64, sport_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event_name.as_bytes());
    hasher.update(b"|");
    hasher.update(event_time_unix.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(sport_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Stable dedup key for one market outcome: sha256 over the canonical
/// (event_sha, market_kind, outcome_key, parameter, player) tuple.
pub fn bet_key(
    event_sha: &str,
    market_kind: &str,
    outcome_key: &str,
    parameter: &str,
    player: &str,
) -> String {
    let mut hasher = Sha256::new();
    for part in [event_sha, market_kind, outcome_key, parameter, player] {
        hasher.update(part.as_bytes());
        hasher.update(b"|");
    }
    hex::encode(hasher.finalize())
}

/// Session identity derived from the caller so repeat requests coalesce.
pub fn session_id(user_id: &str, client_ip: &str, user_agent: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(b"|");
    hasher.update(client_ip.as_bytes());
    hasher.update(b"|");
    hasher.update(user_agent.as_bytes());
    hex::encode(hasher.finalize())
}

/// Canonical text form of a market line parameter, '' when absent.
/// One decimal place keeps -3.5 and -3.50 from splitting a bet identity.
pub fn canonical_parameter(parameter: Option<f64>) -> String {
    match parameter {
        Some(p) => format!("{:.1}", p),
        None => String::new(),
    }
}

/// Normalise an upstream event time to unix seconds (UTC).
/// Accepts unix seconds (10 digits), unix milliseconds (13 digits) and
/// ISO-8601; anything else is rejected.
pub fn parse_event_time(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
        return match trimmed.len() {
            10 => trimmed.parse::<i64>().ok(),
            13 => trimmed.parse::<i64>().ok().map(|ms| ms / 1000),
            _ => None, // 11- or 12-digit values are ambiguous
        };
    }
    DateTime::parse_from_rfc3339(trimmed)
        .ok()
        .map(|dt| dt.timestamp())
}
