use crate::models::{EventOdds, MarketKind, MarketOdds, Opportunity, OutcomeOdds, Snapshot};
use crate::services::ev::{classify, EvScorer};
use crate::services::fair_odds::{consensus_price, fair_probabilities};
use crate::utils::{bet_key, canonical_parameter, event_sha, probability_to_american};

/// Join raw offers, fair probabilities and EV scores into the ranked
/// opportunity list one cycle serves. Markets that fail de-vig and outcomes
/// with no offers are dropped; everything else becomes exactly one record.
pub fn build_opportunities(snapshot: &Snapshot, scorer: &EvScorer) -> Vec<Opportunity> {
    let mut opportunities = Vec::new();

    for event in &snapshot.events {
        let sha = event_sha(&event.display_name(), event.commence_unix, &event.sport_key);
        for market in &event.markets {
            assemble_market(snapshot, event, &sha, market, scorer, &mut opportunities);
        }
    }

    rank(&mut opportunities);
    opportunities
}

fn assemble_market(
    snapshot: &Snapshot,
    event: &EventOdds,
    sha: &str,
    market: &MarketOdds,
    scorer: &EvScorer,
    out: &mut Vec<Opportunity>,
) {
    // De-vig off the per-outcome consensus price, not any single book.
    let consensus: Vec<i32> = market
        .outcomes
        .iter()
        .filter_map(|o| consensus_price(&o.offers.iter().map(|b| b.price).collect::<Vec<_>>()))
        .collect();
    if consensus.len() != market.outcomes.len() {
        return; // an outcome with no offers means the set is incomplete
    }

    let Some(fair) = fair_probabilities(&consensus) else {
        return;
    };

    for (outcome, fair_probability) in market.outcomes.iter().zip(fair) {
        let Some(best) = scorer.best_offer(&outcome.offers) else {
            continue;
        };
        let Some(fair_odds) = probability_to_american(fair_probability) else {
            continue;
        };

        let ev_pct = scorer.ev_pct(fair_probability, &best.book, best.price);
        let parameter = outcome.point.or(market.parameter);
        let player = market.player.clone().unwrap_or_default();
        let id = bet_key(
            sha,
            market.kind.as_str(),
            &outcome.outcome,
            &canonical_parameter(parameter),
            &player,
        );

        out.push(Opportunity {
            id,
            event: event.display_name(),
            bet_description: describe_bet(market.kind, outcome, market.player.as_deref()),
            bet_type: market.kind,
            ev_pct,
            ev_class: classify(ev_pct),
            best_odds: best.price,
            best_book: best.book.clone(),
            fair_odds,
            all_offers: outcome.offers.clone(),
            sport: event.sport_key.clone(),
            ts: snapshot.fetched_at_unix,
            event_start_unix: event.commence_unix,
            fair_probability,
            event_sha: sha.to_string(),
            home_team: event.home_team.clone(),
            away_team: event.away_team.clone(),
            league: event.league.clone(),
            outcome_key: outcome.outcome.clone(),
            parameter,
            player: market.player.clone(),
        });
    }
}

/// Human-readable bet label, e.g. "Lakers -3.5" or "LeBron James Over 25.5 Points".
fn describe_bet(kind: MarketKind, outcome: &OutcomeOdds, player: Option<&str>) -> String {
    match kind {
        MarketKind::Moneyline => format!("{} ML", outcome.outcome),
        MarketKind::Spread => match outcome.point {
            Some(point) => format!("{} {:+.1}", outcome.outcome, point),
            None => outcome.outcome.clone(),
        },
        MarketKind::Total => match outcome.point {
            Some(point) => format!("{} {:.1}", outcome.outcome, point),
            None => outcome.outcome.clone(),
        },
        MarketKind::PlayerPoints | MarketKind::PlayerRebounds | MarketKind::PlayerAssists => {
            let stat = match kind {
                MarketKind::PlayerPoints => "Points",
                MarketKind::PlayerRebounds => "Rebounds",
                _ => "Assists",
            };
            let line = outcome
                .point
                .map(|p| format!(" {:.1}", p))
                .unwrap_or_default();
            format!(
                "{} {}{} {}",
                player.unwrap_or("Unknown"),
                outcome.outcome,
                line,
                stat
            )
        }
    }
}

/// EV% descending, band order on exact EV ties, then earliest start time.
fn rank(opportunities: &mut [Opportunity]) {
    opportunities.sort_by(|a, b| {
        b.ev_pct
            .partial_cmp(&a.ev_pct)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.ev_class.rank().cmp(&b.ev_class.rank()))
            .then(a.event_start_unix.cmp(&b.event_start_unix))
    });
}
