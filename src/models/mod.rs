use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// The closed set of priced questions we analyse. The parameter / player
/// fields on a market are dictated by the kind: spreads and totals carry a
/// line, player props carry a line and a player name, moneylines carry
/// neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MarketKind {
    #[serde(rename = "moneyline")]
    Moneyline,
    #[serde(rename = "spread")]
    Spread,
    #[serde(rename = "total")]
    Total,
    #[serde(rename = "player_points")]
    PlayerPoints,
    #[serde(rename = "player_rebounds")]
    PlayerRebounds,
    #[serde(rename = "player_assists")]
    PlayerAssists,
}

impl MarketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketKind::Moneyline => "moneyline",
            MarketKind::Spread => "spread",
            MarketKind::Total => "total",
            MarketKind::PlayerPoints => "player_points",
            MarketKind::PlayerRebounds => "player_rebounds",
            MarketKind::PlayerAssists => "player_assists",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "moneyline" => Some(MarketKind::Moneyline),
            "spread" => Some(MarketKind::Spread),
            "total" => Some(MarketKind::Total),
            "player_points" => Some(MarketKind::PlayerPoints),
            "player_rebounds" => Some(MarketKind::PlayerRebounds),
            "player_assists" => Some(MarketKind::PlayerAssists),
            _ => None,
        }
    }

    /// Map an upstream market key to our kind.
    pub fn from_upstream_key(key: &str) -> Option<Self> {
        match key {
            "h2h" => Some(MarketKind::Moneyline),
            "spreads" => Some(MarketKind::Spread),
            "totals" => Some(MarketKind::Total),
            "player_points" => Some(MarketKind::PlayerPoints),
            "player_rebounds" => Some(MarketKind::PlayerRebounds),
            "player_assists" => Some(MarketKind::PlayerAssists),
            _ => None,
        }
    }

    /// The upstream query key for this kind.
    pub fn upstream_key(&self) -> &'static str {
        match self {
            MarketKind::Moneyline => "h2h",
            MarketKind::Spread => "spreads",
            MarketKind::Total => "totals",
            MarketKind::PlayerPoints => "player_points",
            MarketKind::PlayerRebounds => "player_rebounds",
            MarketKind::PlayerAssists => "player_assists",
        }
    }

    /// Main lines are moneyline, spread and total; everything else is a prop.
    pub fn is_main_line(&self) -> bool {
        matches!(
            self,
            MarketKind::Moneyline | MarketKind::Spread | MarketKind::Total
        )
    }

    pub fn all() -> [MarketKind; 6] {
        [
            MarketKind::Moneyline,
            MarketKind::Spread,
            MarketKind::Total,
            MarketKind::PlayerPoints,
            MarketKind::PlayerRebounds,
            MarketKind::PlayerAssists,
        ]
    }
}

/// Expected-value classification bands, inclusive-lower / exclusive-upper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvClass {
    #[serde(rename = "positive-strong")]
    PositiveStrong,
    #[serde(rename = "positive-marginal")]
    PositiveMarginal,
    #[serde(rename = "neutral")]
    Neutral,
    #[serde(rename = "negative-marginal")]
    NegativeMarginal,
    #[serde(rename = "negative-strong")]
    NegativeStrong,
}

impl EvClass {
    /// Band ordering for ranking ties: strong > marginal > neutral.
    pub fn rank(&self) -> u8 {
        match self {
            EvClass::PositiveStrong => 0,
            EvClass::PositiveMarginal => 1,
            EvClass::Neutral => 2,
            EvClass::NegativeMarginal => 3,
            EvClass::NegativeStrong => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EvClass::PositiveStrong => "positive-strong",
            EvClass::PositiveMarginal => "positive-marginal",
            EvClass::Neutral => "neutral",
            EvClass::NegativeMarginal => "negative-marginal",
            EvClass::NegativeStrong => "negative-strong",
        }
    }
}

/// Caller tiers for entitlement filtering. Anonymous callers are served as
/// Free; an inactive subscription downgrades paid roles to Free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    #[serde(rename = "free")]
    Free,
    #[serde(rename = "basic")]
    Basic,
    #[serde(rename = "premium")]
    Premium,
    #[serde(rename = "admin")]
    Admin,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Premium => "premium",
            Tier::Admin => "admin",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "free" => Some(Tier::Free),
            "basic" => Some(Tier::Basic),
            "premium" => Some(Tier::Premium),
            "admin" => Some(Tier::Admin),
            _ => None,
        }
    }

    pub fn all() -> [Tier; 4] {
        [Tier::Free, Tier::Basic, Tier::Premium, Tier::Admin]
    }
}

/// Verified identity tuple handed to us by the gateway. This crate never
/// validates tokens; absent headers mean an anonymous caller.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub role: Tier,
    pub subscription_active: bool,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        Self {
            user_id: None,
            email: None,
            role: Tier::Free,
            subscription_active: false,
        }
    }

    /// The tier used for filtering: paid roles require an active subscription.
    pub fn effective_tier(&self) -> Tier {
        match self.role {
            Tier::Basic | Tier::Premium if !self.subscription_active => Tier::Free,
            role => role,
        }
    }
}

// ── Upstream snapshot tree (odds client output) ──────────────────────────────

/// One sportsbook's price on one outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookOffer {
    pub book: String,
    pub price: i32,
}

/// All quoted prices for one outcome of one market. Spread outcomes carry
/// opposite signed points; totals and props share the market line.
#[derive(Debug, Clone)]
pub struct OutcomeOdds {
    pub outcome: String,
    pub point: Option<f64>,
    pub offers: Vec<BookOffer>,
}

/// One priced question on one event.
#[derive(Debug, Clone)]
pub struct MarketOdds {
    pub kind: MarketKind,
    pub parameter: Option<f64>,
    pub player: Option<String>,
    pub outcomes: Vec<OutcomeOdds>,
}

/// One contest and everything currently priced on it.
#[derive(Debug, Clone)]
pub struct EventOdds {
    pub upstream_id: String,
    pub sport_key: String,
    pub league: String,
    pub commence_unix: i64,
    pub home_team: String,
    pub away_team: String,
    pub markets: Vec<MarketOdds>,
}

impl EventOdds {
    pub fn display_name(&self) -> String {
        format!("{} vs {}", self.home_team, self.away_team)
    }
}

/// A full upstream pull across the configured sports.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub fetched_at_unix: i64,
    pub events: Vec<EventOdds>,
}

// ── Cache-resident derived record ────────────────────────────────────────────

/// The record a reader consumes: one market outcome, its fair price, the best
/// available offer and the EV of taking it. Recomputed every cycle, never
/// persisted (only its source offers are).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    /// Stable id: the bet dedup key.
    pub id: String,
    pub event: String,
    pub bet_description: String,
    pub bet_type: MarketKind,
    pub ev_pct: f64,
    pub ev_class: EvClass,
    pub best_odds: i32,
    pub best_book: String,
    pub fair_odds: i32,
    pub all_offers: Vec<BookOffer>,
    pub sport: String,
    pub ts: i64,
    #[serde(skip)]
    pub event_start_unix: i64,
    #[serde(skip)]
    pub fair_probability: f64,
    #[serde(skip)]
    pub event_sha: String,
    #[serde(skip)]
    pub home_team: String,
    #[serde(skip)]
    pub away_team: String,
    #[serde(skip)]
    pub league: String,
    #[serde(skip)]
    pub outcome_key: String,
    #[serde(skip)]
    pub parameter: Option<f64>,
    #[serde(skip)]
    pub player: Option<String>,
}

// ── Persistence rows ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, FromRow)]
pub struct BetRow {
    pub id: String,
    pub bet_key: String,
    pub event_sha: String,
    pub market_kind: String,
    pub outcome_key: String,
    pub parameter: String,
    pub player: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct OfferRow {
    pub id: String,
    pub bet_id: String,
    pub book: String,
    pub price: i32,
    pub observed_at: i64,
}

// ── API response shapes ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct OpportunitiesResponse {
    pub opportunities: Vec<Opportunity>,
    pub total_before_filter: usize,
    pub total_after_filter: usize,
    pub user_role: Tier,
    pub filtered: bool,
    pub last_refresh_ts: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub services: HealthServices,
}

#[derive(Debug, Serialize)]
pub struct HealthServices {
    pub cache: &'static str,
    pub persistence: &'static str,
    pub upstream: &'static str,
}

#[derive(Debug, Serialize)]
pub struct RefreshAccepted {
    pub task_id: String,
}

/// Payload published on the SSE stream after every cache swap.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshEvent {
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub cycle_id: u64,
    pub ts: i64,
}

impl RefreshEvent {
    pub fn new(cycle_id: u64, ts: i64) -> Self {
        Self {
            event_type: "refresh",
            cycle_id,
            ts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_market_kind_serialization() {
        let kind = MarketKind::Moneyline;
        let json = serde_json::to_string(&kind).unwrap();
        assert_eq!(json, r#""moneyline""#);

        let prop: MarketKind = serde_json::from_str(r#""player_points""#).unwrap();
        assert_eq!(prop, MarketKind::PlayerPoints);
    }

    #[test]
    fn test_main_line_set() {
        assert!(MarketKind::Moneyline.is_main_line());
        assert!(MarketKind::Spread.is_main_line());
        assert!(MarketKind::Total.is_main_line());
        assert!(!MarketKind::PlayerPoints.is_main_line());
        assert!(!MarketKind::PlayerRebounds.is_main_line());
        assert!(!MarketKind::PlayerAssists.is_main_line());
    }

    #[test]
    fn test_upstream_key_round_trip() {
        for kind in MarketKind::all() {
            assert_eq!(MarketKind::from_upstream_key(kind.upstream_key()), Some(kind));
            assert_eq!(MarketKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(MarketKind::from_upstream_key("alternate_spreads"), None);
    }

    #[test]
    fn test_tier_string_conversion() {
        assert_eq!(Tier::from_str("admin"), Some(Tier::Admin));
        assert_eq!(Tier::from_str("PREMIUM"), Some(Tier::Premium));
        assert_eq!(Tier::from_str("guest"), None);
        assert_eq!(Tier::Basic.as_str(), "basic");
    }

    #[test]
    fn test_inactive_subscription_downgrades() {
        let ctx = AuthContext {
            user_id: Some("u1".into()),
            email: None,
            role: Tier::Premium,
            subscription_active: false,
        };
        assert_eq!(ctx.effective_tier(), Tier::Free);

        let active = AuthContext {
            subscription_active: true,
            ..ctx.clone()
        };
        assert_eq!(active.effective_tier(), Tier::Premium);

        // Admin never needs a subscription
        let admin = AuthContext {
            role: Tier::Admin,
            subscription_active: false,
            ..ctx
        };
        assert_eq!(admin.effective_tier(), Tier::Admin);
    }

    #[test]
    fn test_ev_class_rank_ordering() {
        assert!(EvClass::PositiveStrong.rank() < EvClass::PositiveMarginal.rank());
        assert!(EvClass::PositiveMarginal.rank() < EvClass::Neutral.rank());
        assert!(EvClass::Neutral.rank() < EvClass::NegativeMarginal.rank());
        assert!(EvClass::NegativeMarginal.rank() < EvClass::NegativeStrong.rank());
    }

    #[test]
    fn test_refresh_event_wire_shape() {
        let ev = RefreshEvent::new(7, 1767225600);
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "refresh");
        assert_eq!(json["cycle_id"], 7);
        assert_eq!(json["ts"], 1767225600);
    }
}
