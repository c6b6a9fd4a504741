use crate::utils::american_to_probability;

/// Bounds on the summed implied probability of a market. A book whose
/// overround falls outside this window is quoting something other than the
/// outcome set we think it is.
const SUM_LOWER: f64 = 0.5;
const SUM_UPPER: f64 = 2.0;

/// Remove the bookmaker margin from one market's outcome prices.
///
/// Proportional de-vig: each american price becomes its implied probability,
/// then every probability is divided by the sum, so the result sums to 1 by
/// construction. Returns None when the market should be skipped: fewer than
/// two outcomes, a degenerate implied probability, or an implausible sum.
pub fn fair_probabilities(prices: &[i32]) -> Option<Vec<f64>> {
    if prices.len() < 2 {
        return None;
    }

    let implied: Vec<f64> = prices.iter().map(|&p| american_to_probability(p)).collect();
    if implied.iter().any(|p| !p.is_finite() || *p <= 0.0) {
        return None;
    }

    let sum: f64 = implied.iter().sum();
    if sum <= SUM_LOWER || sum >= SUM_UPPER {
        tracing::warn!(
            "Skipping untrustworthy market: implied sum {:.4} from prices {:?}",
            sum,
            prices
        );
        return None;
    }

    Some(implied.iter().map(|p| p / sum).collect())
}

/// Per-outcome consensus price across the books quoting a market: the median
/// american price. Robust to one stale or promotional quote in a way the
/// best-price maximum is not.
pub fn consensus_price(prices: &[i32]) -> Option<i32> {
    if prices.is_empty() {
        return None;
    }
    let mut sorted = prices.to_vec();
    sorted.sort_unstable();
    Some(sorted[sorted.len() / 2])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_way_even_vig() {
        // S1: -110 / -110 de-vigs to exactly one half each.
        let fair = fair_probabilities(&[-110, -110]).unwrap();
        assert_eq!(fair, vec![0.5, 0.5]);
    }

    #[test]
    fn test_three_way_soccer() {
        // S2: +150 / +230 / +180
        let fair = fair_probabilities(&[150, 230, 180]).unwrap();
        let sum: f64 = fair.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert!((fair[0] - 0.3772).abs() < 1e-3);
        assert!((fair[1] - 0.2859).abs() < 1e-3);
        assert!((fair[2] - 0.3369).abs() < 1e-3);
    }

    #[test]
    fn test_fair_sum_is_one_across_shapes() {
        for prices in [
            vec![-110, -110],
            vec![100, -120],
            vec![150, 230, 180],
            vec![-200, 120, 450, 900],
        ] {
            let fair = fair_probabilities(&prices).unwrap();
            let sum: f64 = fair.iter().sum();
            assert!((sum - 1.0).abs() < 1e-9, "prices {:?} summed to {}", prices, sum);
        }
    }

    #[test]
    fn test_single_outcome_skipped() {
        assert!(fair_probabilities(&[-110]).is_none());
        assert!(fair_probabilities(&[]).is_none());
    }

    #[test]
    fn test_implausible_sum_skipped() {
        // Two huge longshots: implied sum well under 0.5
        assert!(fair_probabilities(&[2000, 2000]).is_none());
        // Three heavy favourites: implied sum at 2.0 or above
        assert!(fair_probabilities(&[-10000, -10000, -10000]).is_none());
    }

    #[test]
    fn test_consensus_price_is_median() {
        assert_eq!(consensus_price(&[-110, -105, -115]), Some(-110));
        assert_eq!(consensus_price(&[100, 105]), Some(105));
        assert_eq!(consensus_price(&[102]), Some(102));
        assert_eq!(consensus_price(&[]), None);
    }
}
