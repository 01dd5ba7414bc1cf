//! Evaluation metrics for probabilistic binary classifiers: AUC (rank-based,
//! robust to degenerate label sets), Brier score, and a 10-bin reliability
//! decomposition for ECE/MCE.
//!
//! Grounded on spec §4.7's metric definitions; the robustness rules
//! (single-class AUC -> 0.5, empty input -> null) are called out explicitly
//! there rather than left to whatever `sklearn.metrics.roc_auc_score` would
//! raise.

#[derive(Debug, Clone, Copy, Default)]
pub struct ReliabilityBin {
    pub count: usize,
    pub avg_confidence: f64,
    pub avg_accuracy: f64,
}

/// Mann-Whitney U statistic normalized into AUC, with tie-averaged ranks.
/// Returns `None` for empty input, `Some(0.5)` when every label is the same
/// class (AUC is undefined there, not zero).
pub fn auc(probs: &[f64], labels: &[i32]) -> Option<f64> {
    if probs.is_empty() || probs.len() != labels.len() {
        return None;
    }
    let pos = labels.iter().filter(|&&l| l == 1).count();
    let neg = labels.len() - pos;
    if pos == 0 || neg == 0 {
        return Some(0.5);
    }

    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[a].partial_cmp(&probs[b]).unwrap());

    let mut ranks = vec![0.0; probs.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && probs[order[j + 1]] == probs[order[i]] {
            j += 1;
        }
        let avg_rank = ((i + 1) + (j + 1)) as f64 / 2.0;
        for k in i..=j {
            ranks[order[k]] = avg_rank;
        }
        i = j + 1;
    }

    let rank_sum_pos: f64 = (0..probs.len()).filter(|&k| labels[k] == 1).map(|k| ranks[k]).sum();
    let u = rank_sum_pos - (pos as f64 * (pos as f64 + 1.0)) / 2.0;
    Some(u / (pos as f64 * neg as f64))
}

pub fn brier_score(probs: &[f64], labels: &[i32]) -> Option<f64> {
    if probs.is_empty() || probs.len() != labels.len() {
        return None;
    }
    let sum: f64 = probs.iter().zip(labels).map(|(p, &l)| (p - l as f64).powi(2)).sum();
    Some(sum / probs.len() as f64)
}

/// Splits `[0, 1]` into `n_bins` equal-width buckets by predicted
/// probability and reports each bucket's mean confidence and mean realized
/// accuracy (fraction of positives).
pub fn reliability_bins(probs: &[f64], labels: &[i32], n_bins: usize) -> Vec<ReliabilityBin> {
    let mut sums = vec![(0.0, 0.0, 0usize); n_bins]; // (confidence_sum, accuracy_sum, count)
    for (&p, &l) in probs.iter().zip(labels) {
        let idx = ((p * n_bins as f64) as usize).min(n_bins - 1);
        sums[idx].0 += p;
        sums[idx].1 += l as f64;
        sums[idx].2 += 1;
    }
    sums.into_iter()
        .map(|(conf_sum, acc_sum, count)| {
            if count == 0 {
                ReliabilityBin::default()
            } else {
                ReliabilityBin {
                    count,
                    avg_confidence: conf_sum / count as f64,
                    avg_accuracy: acc_sum / count as f64,
                }
            }
        })
        .collect()
}

/// Expected and maximum calibration error over a 10-bin reliability
/// decomposition. `None` for empty input.
pub fn calibration_error(probs: &[f64], labels: &[i32]) -> (Option<f64>, Option<f64>) {
    if probs.is_empty() || probs.len() != labels.len() {
        return (None, None);
    }
    let bins = reliability_bins(probs, labels, 10);
    let n = probs.len() as f64;
    let mut ece = 0.0;
    let mut mce = 0.0_f64;
    for bin in &bins {
        if bin.count == 0 {
            continue;
        }
        let gap = (bin.avg_confidence - bin.avg_accuracy).abs();
        ece += (bin.count as f64 / n) * gap;
        mce = mce.max(gap);
    }
    (Some(ece), Some(mce))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auc_is_one_for_perfect_separation() {
        let probs = vec![0.1, 0.2, 0.8, 0.9];
        let labels = vec![0, 0, 1, 1];
        assert_eq!(auc(&probs, &labels), Some(1.0));
    }

    #[test]
    fn auc_is_half_for_single_class() {
        let probs = vec![0.1, 0.5, 0.9];
        let labels = vec![1, 1, 1];
        assert_eq!(auc(&probs, &labels), Some(0.5));
    }

    #[test]
    fn auc_is_none_for_empty_input() {
        assert_eq!(auc(&[], &[]), None);
    }

    #[test]
    fn brier_score_zero_for_perfect_predictions() {
        assert_eq!(brier_score(&[0.0, 1.0], &[0, 1]), Some(0.0));
    }

    #[test]
    fn calibration_error_zero_when_perfectly_calibrated() {
        let probs = vec![0.0, 0.0, 1.0, 1.0];
        let labels = vec![0, 0, 1, 1];
        let (ece, mce) = calibration_error(&probs, &labels);
        assert_eq!(ece, Some(0.0));
        assert_eq!(mce, Some(0.0));
    }
}
