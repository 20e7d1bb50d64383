//! Deterministic window builders: daily bars → feature slice.

use chrono::NaiveDate;
use pmx_schemas::PriceBar;

use crate::EncoderError;

/// A validated price window ending at `as_of_date`.
///
/// Bars must be ascending by date and all valid; the builder enforces both so
/// the encoder never sees contaminated input.
#[derive(Clone, Debug)]
pub struct PriceWindow {
    pub instrument_id: String,
    pub as_of_date: NaiveDate,
    closes: Vec<f64>,
    volumes: Vec<f64>,
}

impl PriceWindow {
    /// Build from the last `window_days` valid bars at or before `as_of_date`.
    ///
    /// Returns `None` (not an error) when fewer than `window_days` valid bars
    /// exist — the caller decides whether that is a degraded output
    /// (regime UNKNOWN) or a skip.
    pub fn build(
        instrument_id: &str,
        bars: &[PriceBar],
        as_of_date: NaiveDate,
        window_days: usize,
    ) -> Option<Self> {
        let mut usable: Vec<&PriceBar> = bars
            .iter()
            .filter(|b| b.instrument_id == instrument_id && b.date <= as_of_date && b.is_valid())
            .collect();
        usable.sort_by_key(|b| b.date);

        if usable.len() < window_days {
            return None;
        }
        let tail = &usable[usable.len() - window_days..];

        Some(Self {
            instrument_id: instrument_id.to_string(),
            as_of_date,
            closes: tail.iter().map(|b| b.adj_close).collect(),
            volumes: tail.iter().map(|b| b.volume as f64).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.closes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.closes.is_empty()
    }

    /// Deterministic feature slice: daily log returns, then summary moments
    /// (mean return, vol, max drawdown, last/first ratio, mean volume ratio).
    ///
    /// Feature count is `window_days + 4`, fixed for a fixed window length.
    pub fn features(&self) -> Result<Vec<f64>, EncoderError> {
        if self.closes.len() < 2 {
            return Err(EncoderError::EmptyWindow);
        }

        let mut rets = Vec::with_capacity(self.closes.len() - 1);
        for w in self.closes.windows(2) {
            rets.push((w[1] / w[0]).ln());
        }

        let n = rets.len() as f64;
        let mean = rets.iter().sum::<f64>() / n;
        let var = rets.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / n;
        let vol = var.sqrt();

        let mut peak = self.closes[0];
        let mut max_dd = 0.0f64;
        for c in &self.closes {
            if *c > peak {
                peak = *c;
            }
            let dd = (peak - c) / peak;
            if dd > max_dd {
                max_dd = dd;
            }
        }

        let total = self.closes[self.closes.len() - 1] / self.closes[0] - 1.0;
        let mean_volume = self.volumes.iter().sum::<f64>() / self.volumes.len() as f64;
        let last_volume_ratio = if mean_volume > 0.0 {
            self.volumes[self.volumes.len() - 1] / mean_volume
        } else {
            0.0
        };

        let mut out = rets;
        out.push(mean);
        out.push(vol);
        out.push(max_dd);
        out.push(total);
        out.push(last_volume_ratio);

        for (i, x) in out.iter().enumerate() {
            if !x.is_finite() {
                return Err(EncoderError::NonFinite {
                    model_id: "window".to_string(),
                    index: i,
                });
            }
        }
        Ok(out)
    }

    /// Trailing simple return and volatility over the full window.
    pub fn trailing_return_and_vol(&self) -> (f64, f64) {
        let total = self.closes[self.closes.len() - 1] / self.closes[0] - 1.0;
        let mut rets = Vec::with_capacity(self.closes.len() - 1);
        for w in self.closes.windows(2) {
            rets.push(w[1] / w[0] - 1.0);
        }
        let n = rets.len().max(1) as f64;
        let mean = rets.iter().sum::<f64>() / n;
        let var = rets.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / n;
        (total, var.sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bars(closes: &[f64]) -> Vec<PriceBar> {
        let start: NaiveDate = "2025-03-03".parse().unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| PriceBar {
                instrument_id: "A".into(),
                date: start + chrono::Duration::days(i as i64),
                open: *c,
                high: *c * 1.01,
                low: *c * 0.99,
                close: *c,
                adj_close: *c,
                volume: 1_000,
            })
            .collect()
    }

    #[test]
    fn build_requires_full_window() {
        let b = bars(&[100.0, 101.0, 102.0]);
        let as_of: NaiveDate = "2025-03-05".parse().unwrap();
        assert!(PriceWindow::build("A", &b, as_of, 3).is_some());
        assert!(PriceWindow::build("A", &b, as_of, 4).is_none());
        assert!(PriceWindow::build("B", &b, as_of, 1).is_none());
    }

    #[test]
    fn build_excludes_bars_after_as_of() {
        // No input data past the as-of date may be read.
        let b = bars(&[100.0, 101.0, 102.0, 103.0]);
        let as_of: NaiveDate = "2025-03-04".parse().unwrap();
        let w = PriceWindow::build("A", &b, as_of, 2).unwrap();
        assert_eq!(w.len(), 2);
        let (total, _) = w.trailing_return_and_vol();
        assert!((total - 0.01).abs() < 1e-9);
    }

    #[test]
    fn feature_count_is_stable() {
        let b = bars(&[100.0, 101.0, 99.0, 102.0, 103.0]);
        let as_of: NaiveDate = "2025-03-07".parse().unwrap();
        let w = PriceWindow::build("A", &b, as_of, 5).unwrap();
        // window_days - 1 returns + 5 summary features.
        assert_eq!(w.features().unwrap().len(), 4 + 5);
    }

    #[test]
    fn invalid_bars_are_excluded() {
        let mut b = bars(&[100.0, 101.0, 102.0]);
        b[1].close = f64::NAN;
        b[1].adj_close = f64::NAN;
        let as_of: NaiveDate = "2025-03-05".parse().unwrap();
        assert!(PriceWindow::build("A", &b, as_of, 3).is_none());
        assert!(PriceWindow::build("A", &b, as_of, 2).is_some());
    }
}
