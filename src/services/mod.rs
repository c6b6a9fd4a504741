pub mod assembler;
pub mod entitlement;
pub mod ev;
pub mod fair_odds;
pub mod odds_client;
pub mod persistence;
pub mod scheduler;

pub use assembler::build_opportunities;
pub use entitlement::{filter_for_tier, tier_cap};
pub use ev::EvScorer;
pub use odds_client::OddsClient;
pub use persistence::PersistenceWriter;
pub use scheduler::{RefreshScheduler, TaskState};
