//! Time-ordered cross-validation: every fold trains on a contiguous past
//! prefix and validates on the next block, never on data from before the
//! training window (no shuffling, no k-fold mixing of future into past).
//!
//! Grounded on spec §4.7's CV contract.

#[derive(Debug, Clone)]
pub struct Fold {
    pub train_idx: Vec<usize>,
    pub val_idx: Vec<usize>,
}

/// Expanding-window folds: with `k` folds over `n` samples, fold `i` trains
/// on the first `i` blocks and validates on block `i+1`.
pub fn time_ordered_folds(n: usize, k: usize) -> Vec<Fold> {
    if k == 0 || n == 0 {
        return Vec::new();
    }
    let block = n / (k + 1);
    if block == 0 {
        return Vec::new();
    }
    (1..=k)
        .filter_map(|i| {
            let train_end = i * block;
            let val_end = if i == k { n } else { ((i + 1) * block).min(n) };
            if train_end >= val_end {
                None
            } else {
                Some(Fold {
                    train_idx: (0..train_end).collect(),
                    val_idx: (train_end..val_end).collect(),
                })
            }
        })
        .collect()
}

/// A final chronological holdout: the last `val_frac` of samples become the
/// validation set, everything before it is training data.
pub fn holdout_split(n: usize, val_frac: f64) -> (Vec<usize>, Vec<usize>) {
    let val_n = ((n as f64) * val_frac).round() as usize;
    let val_n = val_n.min(n.saturating_sub(1)).max(if n > 0 { 1 } else { 0 });
    let train_n = n - val_n;
    ((0..train_n).collect(), (train_n..n).collect())
}
