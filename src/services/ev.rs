use std::collections::HashSet;

use crate::models::{BookOffer, EvClass};
use crate::utils::american_to_decimal;

/// Scores individual offers against a fair probability. Commission exchanges
/// quote gross prices, so their decimal odds are haircut by the configured
/// fee before any comparison or EV computation.
pub struct EvScorer {
    fee: f64,
    exchange_books: HashSet<String>,
}

impl EvScorer {
    pub fn new(fee: f64, exchange_books: HashSet<String>) -> Self {
        Self {
            fee,
            exchange_books,
        }
    }

    /// Decimal odds net of exchange commission where applicable.
    pub fn adjusted_decimal(&self, book: &str, price: i32) -> f64 {
        let decimal = american_to_decimal(price);
        if self.exchange_books.contains(book) {
            1.0 + (decimal - 1.0) * (1.0 - self.fee)
        } else {
            decimal
        }
    }

    /// Signed expected value of a unit stake, as a percent.
    pub fn ev_pct(&self, fair_probability: f64, book: &str, price: i32) -> f64 {
        let decimal = self.adjusted_decimal(book, price);
        (fair_probability * decimal - 1.0) * 100.0
    }

    /// The offer a bettor should take: highest net decimal price, with exact
    /// ties broken by the lexicographically smallest book key.
    pub fn best_offer<'a>(&self, offers: &'a [BookOffer]) -> Option<&'a BookOffer> {
        offers.iter().reduce(|best, candidate| {
            let best_d = self.adjusted_decimal(&best.book, best.price);
            let cand_d = self.adjusted_decimal(&candidate.book, candidate.price);
            if cand_d > best_d || (cand_d == best_d && candidate.book < best.book) {
                candidate
            } else {
                best
            }
        })
    }
}

/// Classification bands in EV percent, inclusive-lower / exclusive-upper.
pub fn classify(ev_pct: f64) -> EvClass {
    if ev_pct >= 4.5 {
        EvClass::PositiveStrong
    } else if ev_pct >= 2.0 {
        EvClass::PositiveMarginal
    } else if ev_pct > -2.0 {
        EvClass::Neutral
    } else if ev_pct > -4.5 {
        EvClass::NegativeMarginal
    } else {
        EvClass::NegativeStrong
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_scorer() -> EvScorer {
        EvScorer::new(0.02, HashSet::new())
    }

    fn exchange_scorer() -> EvScorer {
        EvScorer::new(0.02, HashSet::from(["prophetx".to_string()]))
    }

    #[test]
    fn test_ev_at_plus_105_on_coin_flip() {
        // S1: fair 0.5, +105 -> 0.5 * 2.05 - 1 = +2.5%
        let ev = plain_scorer().ev_pct(0.5, "draftkings", 105);
        assert!((ev - 2.5).abs() < 1e-6);
        assert_eq!(classify(ev), EvClass::PositiveMarginal);
    }

    #[test]
    fn test_exchange_fee_haircut() {
        let scorer = exchange_scorer();
        // 2% commission on +105: 1 + 1.05 * 0.98 = 2.029
        assert!((scorer.adjusted_decimal("prophetx", 105) - 2.029).abs() < 1e-9);
        // Non-exchange book is untouched
        assert!((scorer.adjusted_decimal("draftkings", 105) - 2.05).abs() < 1e-9);

        let ev = scorer.ev_pct(0.5, "prophetx", 105);
        assert!((ev - 1.45).abs() < 1e-6);
        assert_eq!(classify(ev), EvClass::Neutral);
    }

    #[test]
    fn test_classification_boundaries() {
        assert_eq!(classify(4.5), EvClass::PositiveStrong);
        assert_eq!(classify(4.499), EvClass::PositiveMarginal);
        assert_eq!(classify(2.0), EvClass::PositiveMarginal);
        assert_eq!(classify(1.999), EvClass::Neutral);
        assert_eq!(classify(0.0), EvClass::Neutral);
        assert_eq!(classify(-1.999), EvClass::Neutral);
        assert_eq!(classify(-2.0), EvClass::NegativeMarginal);
        assert_eq!(classify(-4.499), EvClass::NegativeMarginal);
        assert_eq!(classify(-4.5), EvClass::NegativeStrong);
        assert_eq!(classify(-20.0), EvClass::NegativeStrong);
    }

    #[test]
    fn test_best_offer_prefers_highest_decimal() {
        let offers = vec![
            BookOffer { book: "draftkings".into(), price: 100 },
            BookOffer { book: "fanduel".into(), price: 110 },
            BookOffer { book: "betmgm".into(), price: -105 },
        ];
        let best = plain_scorer().best_offer(&offers).unwrap();
        assert_eq!(best.book, "fanduel");
        assert_eq!(best.price, 110);
    }

    #[test]
    fn test_best_offer_tie_breaks_on_book_key() {
        let offers = vec![
            BookOffer { book: "fanduel".into(), price: 105 },
            BookOffer { book: "betmgm".into(), price: 105 },
            BookOffer { book: "draftkings".into(), price: 105 },
        ];
        let best = plain_scorer().best_offer(&offers).unwrap();
        assert_eq!(best.book, "betmgm");
    }

    #[test]
    fn test_best_offer_accounts_for_commission() {
        // Gross +110 on the exchange nets 2.058, below +108 at a book (2.08).
        let offers = vec![
            BookOffer { book: "prophetx".into(), price: 110 },
            BookOffer { book: "draftkings".into(), price: 108 },
        ];
        let best = exchange_scorer().best_offer(&offers).unwrap();
        assert_eq!(best.book, "draftkings");
    }

    #[test]
    fn test_best_offer_empty() {
        assert!(plain_scorer().best_offer(&[]).is_none());
    }
}
