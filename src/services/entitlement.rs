use crate::models::{Opportunity, Tier};

/// Free-tier teaser length.
const FREE_CAP: usize = 10;

/// Hard size cap for a tier, if any. Query-string limits may shrink a
/// response but never grow it past this.
pub fn tier_cap(tier: Tier) -> Option<usize> {
    match tier {
        Tier::Free => Some(FREE_CAP),
        Tier::Basic | Tier::Premium | Tier::Admin => None,
    }
}

/// True when the tier may see player props and other non-main markets.
pub fn sees_all_markets(tier: Tier) -> bool {
    matches!(tier, Tier::Premium | Tier::Admin)
}

/// Entitlement filter: a pure function from (tier, ranked list) to the list
/// that tier is allowed to see.
///
/// Free callers get a teaser of the worst offers: main lines at EV <= -2.0,
/// most negative first, at most ten. Basic sees every main line; premium and
/// admin see everything. The input ranking (EV descending) is preserved for
/// paying tiers.
pub fn filter_for_tier(tier: Tier, full: &[Opportunity]) -> Vec<Opportunity> {
    match tier {
        Tier::Free => {
            let mut teaser: Vec<Opportunity> = full
                .iter()
                .filter(|o| o.bet_type.is_main_line() && o.ev_pct <= -2.0)
                .cloned()
                .collect();
            teaser.sort_by(|a, b| {
                a.ev_pct
                    .partial_cmp(&b.ev_pct)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            teaser.truncate(FREE_CAP);
            teaser
        }
        Tier::Basic => full
            .iter()
            .filter(|o| o.bet_type.is_main_line())
            .cloned()
            .collect(),
        Tier::Premium | Tier::Admin => full.to_vec(),
    }
}
