//! Time-in-range classification against one or more target bands

use serde::{Deserialize, Serialize};

use crate::model::GlucoseReading;

/// A target band in mmol/L; `low` and `high` are both in range
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub low: f64,
    pub high: f64,
}

impl Thresholds {
    pub fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    /// Internationally recognised 3.9-10.0 mmol/L range
    pub fn clinical() -> Self {
        Self::new(3.9, 10.0)
    }

    /// Tight personal range used by default for the second table
    pub fn personal() -> Self {
        Self::new(3.8, 5.5)
    }

    pub fn classify(&self, mmol: f64) -> GlucoseRange {
        if mmol < self.low {
            GlucoseRange::Below
        } else if mmol <= self.high {
            GlucoseRange::InRange
        } else {
            GlucoseRange::Above
        }
    }

    pub fn format_range(&self) -> String {
        format!("{:.1}-{:.1} mmol/L", self.low, self.high)
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::clinical()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlucoseRange {
    Below,
    InRange,
    Above,
}

impl GlucoseRange {
    pub fn label(self) -> &'static str {
        match self {
            GlucoseRange::Below => "Time Below Range",
            GlucoseRange::InRange => "Time in Range",
            GlucoseRange::Above => "Time Above Range",
        }
    }
}

/// TBR / TIR / TAR for one threshold pair
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeInRange {
    pub thresholds: Thresholds,
    pub total: usize,
    pub below: usize,
    pub in_range: usize,
    pub above: usize,
    pub below_pct: f64,
    pub in_pct: f64,
    pub above_pct: f64,
}

impl TimeInRange {
    fn from_counts(thresholds: Thresholds, below: usize, in_range: usize, above: usize) -> Self {
        let total = below + in_range + above;
        let pct = |count: usize| {
            if total == 0 {
                0.0
            } else {
                count as f64 / total as f64 * 100.0
            }
        };
        Self {
            thresholds,
            total,
            below,
            in_range,
            above,
            below_pct: pct(below),
            in_pct: pct(in_range),
            above_pct: pct(above),
        }
    }

    pub fn percentage(&self, range: GlucoseRange) -> f64 {
        match range {
            GlucoseRange::Below => self.below_pct,
            GlucoseRange::InRange => self.in_pct,
            GlucoseRange::Above => self.above_pct,
        }
    }
}

/// Classify every valid reading against `thresholds`
pub fn compute_time_in_range(readings: &[GlucoseReading], thresholds: Thresholds) -> TimeInRange {
    let (mut below, mut in_range, mut above) = (0, 0, 0);
    for reading in readings.iter().filter(|r| r.is_valid()) {
        match thresholds.classify(reading.mmol()) {
            GlucoseRange::Below => below += 1,
            GlucoseRange::InRange => in_range += 1,
            GlucoseRange::Above => above += 1,
        }
    }
    TimeInRange::from_counts(thresholds, below, in_range, above)
}

/// One result per threshold pair, in the order given
pub fn compute_time_in_range_multi(readings: &[GlucoseReading], thresholds: &[Thresholds]) -> Vec<TimeInRange> {
    thresholds
        .iter()
        .map(|t| compute_time_in_range(readings, *t))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;

    fn readings(values_mgdl: &[f64]) -> Vec<GlucoseReading> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        values_mgdl
            .iter()
            .enumerate()
            .map(|(i, &v)| GlucoseReading::new(v, start + Duration::minutes(5 * i as i64)))
            .collect()
    }

    #[test]
    fn test_classification_boundaries() {
        let t = Thresholds::clinical();
        assert_eq!(t.classify(3.89), GlucoseRange::Below);
        assert_eq!(t.classify(3.9), GlucoseRange::InRange);
        assert_eq!(t.classify(10.0), GlucoseRange::InRange);
        assert_eq!(t.classify(10.01), GlucoseRange::Above);
    }

    #[test]
    fn test_time_in_range() {
        // 3.0, 5.0, 7.0, 9.0, 12.0 mmol/L
        let tir = compute_time_in_range(&readings(&[54.0, 90.0, 126.0, 162.0, 216.0]), Thresholds::clinical());
        assert_eq!(tir.total, 5);
        assert_eq!((tir.below, tir.in_range, tir.above), (1, 3, 1));
        assert!((tir.in_pct - 60.0).abs() < 1e-9);
        assert!((tir.percentage(GlucoseRange::Below) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_readings() {
        for t in [Thresholds::clinical(), Thresholds::personal(), Thresholds::new(0.0, 0.0)] {
            let tir = compute_time_in_range(&[], t);
            assert_eq!((tir.below_pct, tir.in_pct, tir.above_pct), (0.0, 0.0, 0.0));
        }
    }

    #[test]
    fn test_multiple_threshold_sets() {
        let data = readings(&[90.0, 108.0, 126.0]); // 5, 6, 7 mmol/L
        let results = compute_time_in_range_multi(&data, &[Thresholds::clinical(), Thresholds::personal()]);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].in_range, 3);
        assert_eq!(results[1].in_range, 1);
        assert_eq!(results[1].above, 2);
    }

    #[test]
    fn test_invalid_readings_excluded() {
        let tir = compute_time_in_range(&readings(&[0.0, -1.0, f64::NAN, 100.0]), Thresholds::clinical());
        assert_eq!(tir.total, 1);
        assert_eq!(tir.in_pct, 100.0);
    }

    proptest! {
        #[test]
        fn prop_percentages_sum_to_100(values in prop::collection::vec(1.0f64..600.0, 1..200),
                                       low in 2.0f64..6.0, width in 0.0f64..10.0) {
            let tir = compute_time_in_range(&readings(&values), Thresholds::new(low, low + width));
            let sum = tir.below_pct + tir.in_pct + tir.above_pct;
            prop_assert!((sum - 100.0).abs() < 1e-9);
        }
    }
}
