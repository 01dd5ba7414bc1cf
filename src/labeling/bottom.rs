//! Bottom-event labeling rule: a forward-looking drawdown-then-rebound
//! binary label.
//!
//! Grounded on spec §4.9's bottom-event definition. A candidate bar is
//! labeled positive if price later draws down by at least `drawdown` from
//! the bar's own close, then rebounds by at least `rebound` from that low,
//! all within `lookahead` bars.

/// `closes` is ascending by time; `start_idx` is the bar the prediction was
/// made against. Returns `None` if there isn't yet `lookahead` bars of
/// future data to evaluate (the candidate isn't ripe).
pub fn label_for_created_ts(closes: &[f64], start_idx: usize, lookahead: usize, drawdown: f64, rebound: f64) -> Option<i32> {
    if start_idx >= closes.len() || start_idx + lookahead >= closes.len() {
        return None;
    }
    let base = closes[start_idx];
    if base <= 0.0 {
        return Some(0);
    }
    let future = &closes[start_idx + 1..=start_idx + lookahead];

    let (min_idx, &min_price) = future
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.partial_cmp(b.1).unwrap())
        .unwrap();

    let draw = (base - min_price) / base;
    if draw < drawdown {
        return Some(0);
    }

    let after_min = &future[min_idx + 1..];
    if after_min.is_empty() || min_price <= 0.0 {
        return Some(0);
    }
    let max_after = after_min.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let reb = (max_after - min_price) / min_price;
    Some(if reb >= rebound { 1 } else { 0 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_ripe_returns_none() {
        let closes = vec![100.0, 99.0, 98.0];
        assert_eq!(label_for_created_ts(&closes, 1, 5, 0.01, 0.01), None);
    }

    #[test]
    fn shallow_drawdown_labels_negative() {
        let mut closes = vec![100.0];
        for _ in 0..10 {
            closes.push(*closes.last().unwrap() - 0.01);
        }
        assert_eq!(label_for_created_ts(&closes, 0, 10, 0.5, 0.01), Some(0));
    }

    #[test]
    fn drawdown_then_rebound_labels_positive() {
        // base=100, drops to 90 (10% drawdown), rebounds to 99 (10% rebound from low)
        let closes = vec![100.0, 95.0, 90.0, 93.0, 99.0];
        assert_eq!(label_for_created_ts(&closes, 0, 4, 0.05, 0.05), Some(1));
    }

    #[test]
    fn drawdown_without_rebound_labels_negative() {
        let closes = vec![100.0, 95.0, 90.0, 91.0, 91.5];
        assert_eq!(label_for_created_ts(&closes, 0, 4, 0.05, 0.05), Some(0));
    }
}
