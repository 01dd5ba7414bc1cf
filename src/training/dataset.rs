//! Assembles a training dataset by joining realized-labeled inference
//! records back onto their long-format feature snapshots.
//!
//! Grounded on spec §4.7's dataset assembly step and the long-format schema
//! from [`crate::store::feature_store`].

use crate::error::PipelineResult;
use crate::store::FeatureStore;
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct Sample {
    pub close_time: i64,
    pub features: Vec<f64>,
    pub label: i32,
}

#[derive(Debug, Clone)]
pub struct Dataset {
    pub feature_names: Vec<String>,
    pub samples: Vec<Sample>,
}

/// `labeled_points` is `(close_time, realized_label)`, already filtered to
/// rows with a non-null label. Samples whose snapshot is missing are
/// dropped silently (the labeler and the feature engine can race — a
/// candidate may mature before its snapshot is written).
pub fn build_dataset(feature_store: &FeatureStore, symbol: &str, interval: &str, labeled_points: &[(i64, i32)]) -> PipelineResult<Dataset> {
    let mut feature_names: BTreeSet<String> = BTreeSet::new();
    let mut rows = Vec::with_capacity(labeled_points.len());
    for &(close_time, label) in labeled_points {
        if let Some(snapshot) = feature_store.read_snapshot(symbol, interval, close_time)? {
            feature_names.extend(snapshot.keys().cloned());
            rows.push((close_time, snapshot, label));
        }
    }
    let names: Vec<String> = feature_names.into_iter().collect();
    let samples = rows
        .into_iter()
        .map(|(close_time, snapshot, label)| {
            let features = names.iter().map(|n| snapshot.get(n).copied().flatten().unwrap_or(f64::NAN)).collect();
            Sample { close_time, features, label }
        })
        .collect();
    Ok(Dataset { feature_names: names, samples })
}

impl Dataset {
    pub fn feature_rows(&self) -> Vec<Vec<f64>> {
        self.samples.iter().map(|s| s.features.clone()).collect()
    }

    pub fn labels(&self) -> Vec<i32> {
        self.samples.iter().map(|s| s.label).collect()
    }

    pub fn subset(&self, idx: &[usize]) -> Dataset {
        Dataset {
            feature_names: self.feature_names.clone(),
            samples: idx.iter().map(|&i| self.samples[i].clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn missing_snapshots_are_dropped_not_errored() {
        let mut store = FeatureStore::in_memory().unwrap();
        let mut vals = BTreeMap::new();
        vals.insert("rsi_14".to_string(), Some(55.0));
        store.write_snapshot("BTCUSDT", "1m", 60_000, 0, &vals).unwrap();

        let points = vec![(60_000, 1), (120_000, 0)];
        let dataset = build_dataset(&store, "BTCUSDT", "1m", &points).unwrap();
        assert_eq!(dataset.samples.len(), 1);
        assert_eq!(dataset.feature_names, vec!["rsi_14".to_string()]);
    }
}
