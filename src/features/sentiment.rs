//! Sentiment time-series math.
//!
//! Grounded on `original_source/backend/apps/sentiment/service.py`, with the
//! bucket join wired to the canonical spec's bucket-then-EMA contract rather
//! than the original's raw-tick EMA: ticks are grouped into fixed-width
//! buckets first, and every downstream series (EMA, `d1`/`d5`, `vol_30`)
//! runs over the bucket-mean series, not the raw ticks. `compute_ema` still
//! seeds its recursion with the *first* series value rather than an all-zero
//! start, matching `compute_ema`'s own behavior.

use std::collections::BTreeMap;

pub fn alpha(window: f64) -> f64 {
    2.0 / (window + 1.0)
}

/// Exponential moving average seeded with `values[0]` (not zero), matching
/// `compute_ema`.
pub fn compute_ema(values: &[f64], window: f64) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    let Some(&first) = values.first() else {
        return out;
    };
    let a = alpha(window);
    let mut prev = first;
    out.push(prev);
    for &v in &values[1..] {
        prev = a * v + (1.0 - a) * prev;
        out.push(prev);
    }
    out
}

/// Trailing population standard deviation (divide by n) over a window of the
/// last `window` values, one output per input index (`None` until the
/// window fills).
pub fn rolling_std_population(values: &[f64], window: usize) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(values.len());
    for i in 0..values.len() {
        if window < 1 || i + 1 < window {
            out.push(None);
            continue;
        }
        let slice = &values[i + 1 - window..=i];
        let mean = slice.iter().sum::<f64>() / slice.len() as f64;
        let variance = slice.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / slice.len() as f64;
        out.push(Some(variance.sqrt()));
    }
    out
}

/// `k`-step backward difference: `deltas[i] = values[i] - values[i-k]`.
pub fn deltas(values: &[f64], k: usize) -> Vec<Option<f64>> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| if i >= k { Some(v - values[i - k]) } else { None })
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct Bucket {
    pub mean: f64,
    pub count: usize,
    pub positive_ratio: f64,
}

/// Groups `(timestamp_ms, value)` ticks into fixed-width `bucket_ms` buckets
/// keyed by the bucket's floor timestamp, with per-bucket mean, count, and
/// the share of ticks above `pos_threshold`.
pub fn bucketize(ticks: &[(i64, f64)], bucket_ms: i64, pos_threshold: f64) -> BTreeMap<i64, Bucket> {
    let mut grouped: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
    for &(ts, v) in ticks {
        let bucket_key = (ts.div_euclid(bucket_ms)) * bucket_ms;
        grouped.entry(bucket_key).or_default().push(v);
    }
    grouped
        .into_iter()
        .map(|(k, values)| {
            let count = values.len();
            let mean = values.iter().sum::<f64>() / count as f64;
            let positive = values.iter().filter(|&&v| v > pos_threshold).count();
            (
                k,
                Bucket {
                    mean,
                    count,
                    positive_ratio: positive as f64 / count as f64,
                },
            )
        })
        .collect()
}

/// Joins a bucketed sentiment series into the bar-level feature map,
/// evaluated at the most recent bucket: the attached bucket's own
/// mean/count/positive-ratio (`sent_score`/`sent_cnt`/`sent_pos_ratio`),
/// one EMA per configured window over the bucket-mean series, lag-1/lag-5
/// absolute differences (`d1`/`d5`), and a population std over the last 30
/// buckets (`vol_30`). Returns an empty map when there are no buckets.
pub fn join_sentiment(buckets: &BTreeMap<i64, Bucket>, ema_windows: &[i64]) -> BTreeMap<String, Option<f64>> {
    let mut out = BTreeMap::new();
    let Some((_, last)) = buckets.iter().next_back() else {
        return out;
    };
    out.insert("sent_score".to_string(), Some(last.mean));
    out.insert("sent_cnt".to_string(), Some(last.count as f64));
    out.insert("sent_pos_ratio".to_string(), Some(last.positive_ratio));

    let means: Vec<f64> = buckets.values().map(|b| b.mean).collect();
    for &w in ema_windows {
        let ema = compute_ema(&means, w as f64);
        out.insert(format!("ema_{w}"), ema.last().copied());
    }
    out.insert("d1".to_string(), deltas(&means, 1).last().copied().flatten().map(f64::abs));
    out.insert("d5".to_string(), deltas(&means, 5).last().copied().flatten().map(f64::abs));
    out.insert("vol_30".to_string(), rolling_std_population(&means, 30).last().copied().flatten());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_seeds_with_first_value() {
        let ema = compute_ema(&[1.0, 1.0, 1.0], 5.0);
        assert_eq!(ema[0], 1.0);
    }

    #[test]
    fn rolling_std_uses_population_variance() {
        let values = vec![1.0, 2.0, 3.0, 4.0];
        let out = rolling_std_population(&values, 4);
        // population variance of [1,2,3,4]: mean=2.5, sum_sq_dev=5, /4=1.25
        let v = out[3].unwrap();
        assert!((v - 1.25_f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn bucketize_groups_by_floor() {
        let ticks = vec![(0, 1.0), (30_000, -1.0), (60_000, 1.0)];
        let buckets = bucketize(&ticks, 60_000, 0.0);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[&0].count, 2);
        assert_eq!(buckets[&0].positive_ratio, 0.5);
    }

    #[test]
    fn deltas_are_none_before_k_steps() {
        let d = deltas(&[1.0, 2.0, 4.0], 2);
        assert_eq!(d[0], None);
        assert_eq!(d[2], Some(3.0));
    }

    #[test]
    fn join_sentiment_attaches_last_bucket_and_ema() {
        let ticks = vec![(0, 1.0), (60_000, 1.0), (120_000, 3.0)];
        let buckets = bucketize(&ticks, 60_000, 0.0);
        let joined = join_sentiment(&buckets, &[5]);
        assert_eq!(joined.get("sent_score").copied().flatten(), Some(3.0));
        assert_eq!(joined.get("sent_cnt").copied().flatten(), Some(1.0));
        assert!(joined.contains_key("ema_5"));
        assert_eq!(joined.get("d1").copied().flatten(), Some(2.0));
    }
}
