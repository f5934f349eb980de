//! Descriptive statistics and the estimated HbA1c card
//!
//! Everything here works in mmol/L over valid readings only.

use std::collections::BTreeMap;

use chrono::{FixedOffset, NaiveDate};
use serde::Serialize;

use crate::model::GlucoseReading;
use crate::tir::{Thresholds, TimeInRange, compute_time_in_range};
use crate::units::{mean_glucose_to_a1c_percent, mmol_to_mgdl, percent_to_mmol_mol, round_to, GlucoseUnit};

/// Summary statistics for a set of mmol/L values
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlucoseStats {
    pub count: usize,
    pub mean: f64,
    pub std_dev: f64,
    /// Coefficient of variation, percent
    pub cv: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
    pub q1: f64,
    pub q3: f64,
}

impl GlucoseStats {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let std_dev = calculate_std_dev(values, mean);

        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        Some(Self {
            count,
            mean,
            std_dev,
            cv: if mean > 0.0 { std_dev / mean * 100.0 } else { 0.0 },
            min: sorted[0],
            max: sorted[count - 1],
            median: percentile(&sorted, 50.0),
            q1: percentile(&sorted, 25.0),
            q3: percentile(&sorted, 75.0),
        })
    }

    pub fn from_readings(readings: &[GlucoseReading]) -> Option<Self> {
        Self::from_values(&valid_mmol(readings))
    }

    /// Calculate 95% confidence interval for the mean
    pub fn confidence_interval_95(&self) -> (f64, f64) {
        if self.count < 2 {
            return (self.mean, self.mean);
        }
        let se = self.std_dev / (self.count as f64).sqrt();
        (self.mean - 1.96 * se, self.mean + 1.96 * se)
    }

    /// Under 36% is the usual target for glycemic variability
    pub fn is_stable(&self) -> bool {
        self.cv < 36.0
    }

    pub fn format_mean(&self, unit: GlucoseUnit) -> String {
        unit.format(mmol_to_mgdl(self.mean))
    }
}

/// Mean glucose and the HbA1c it implies (Nathan/ADAG regression)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlucoseManagement {
    pub reading_count: usize,
    pub mean_mmol: f64,
    pub mean_mgdl: f64,
    pub a1c_percent: f64,
    pub a1c_mmol_mol: f64,
}

impl GlucoseManagement {
    /// `None` when there is no valid reading
    pub fn from_readings(readings: &[GlucoseReading]) -> Option<Self> {
        let values = valid_mmol(readings);
        if values.is_empty() {
            return None;
        }
        let mean_mmol = values.iter().sum::<f64>() / values.len() as f64;
        let mean_mgdl = mmol_to_mgdl(mean_mmol);
        let a1c_percent = mean_glucose_to_a1c_percent(mean_mgdl);

        Some(Self {
            reading_count: values.len(),
            mean_mmol,
            mean_mgdl,
            a1c_percent: round_to(a1c_percent, 1),
            a1c_mmol_mol: round_to(percent_to_mmol_mol(a1c_percent), 1),
        })
    }
}

/// One local calendar day of readings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub stats: GlucoseStats,
    pub tir: TimeInRange,
}

/// Per-day statistics, oldest day first; days without readings are absent
pub fn daily_stats(readings: &[GlucoseReading], offset: &FixedOffset, thresholds: Thresholds) -> Vec<DailyStats> {
    let mut days: BTreeMap<NaiveDate, Vec<GlucoseReading>> = BTreeMap::new();
    for reading in readings.iter().filter(|r| r.is_valid()) {
        let date = reading.timestamp.with_timezone(offset).date_naive();
        days.entry(date).or_default().push(reading.clone());
    }

    days.into_iter()
        .filter_map(|(date, day)| {
            Some(DailyStats {
                date,
                stats: GlucoseStats::from_readings(&day)?,
                tir: compute_time_in_range(&day, thresholds),
            })
        })
        .collect()
}

fn valid_mmol(readings: &[GlucoseReading]) -> Vec<f64> {
    readings.iter().filter(|r| r.is_valid()).map(GlucoseReading::mmol).collect()
}

/// Calculate percentile from sorted values
fn percentile(sorted_values: &[f64], pct: f64) -> f64 {
    if sorted_values.is_empty() {
        return 0.0;
    }
    let idx = ((sorted_values.len() as f64 - 1.0) * pct / 100.0).round() as usize;
    sorted_values[idx.min(sorted_values.len() - 1)]
}

/// Sample standard deviation
fn calculate_std_dev(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let variance: f64 = values.iter()
        .map(|&v| (v - mean).powi(2))
        .sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn readings(values_mgdl: &[f64]) -> Vec<GlucoseReading> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 22, 0, 0).unwrap();
        values_mgdl
            .iter()
            .enumerate()
            .map(|(i, &v)| GlucoseReading::new(v, start + Duration::hours(i as i64)))
            .collect()
    }

    #[test]
    fn test_basic_stats() {
        let stats = GlucoseStats::from_values(&[5.0, 6.0, 7.0, 8.0, 9.0]).unwrap();
        assert_eq!(stats.count, 5);
        assert!((stats.mean - 7.0).abs() < 1e-9);
        assert_eq!(stats.min, 5.0);
        assert_eq!(stats.max, 9.0);
        assert_eq!(stats.median, 7.0);
        assert_eq!(stats.q1, 6.0);
        assert_eq!(stats.q3, 8.0);
        // sqrt(10 / 4)
        assert!((stats.std_dev - 1.5811).abs() < 1e-4);
        assert!((stats.cv - 22.587).abs() < 1e-3);
        assert!(stats.is_stable());
        assert_eq!(stats.format_mean(GlucoseUnit::MmolL), "7.0 mmol/L");
    }

    #[test]
    fn test_stats_skip_invalid_readings() {
        let stats = GlucoseStats::from_readings(&readings(&[0.0, 90.0, f64::NAN, 126.0])).unwrap();
        assert_eq!(stats.count, 2);
        assert!((stats.mean - 6.0).abs() < 1e-9);
        assert!(GlucoseStats::from_readings(&[]).is_none());
    }

    #[test]
    fn test_single_value_interval() {
        let stats = GlucoseStats::from_values(&[6.5]).unwrap();
        assert_eq!(stats.std_dev, 0.0);
        assert_eq!(stats.confidence_interval_95(), (6.5, 6.5));
    }

    #[test]
    fn test_glucose_management() {
        // Mean of 154 mg/dL is the textbook 7.0 % A1c
        let gmi = GlucoseManagement::from_readings(&readings(&[144.0, 164.0])).unwrap();
        assert_eq!(gmi.reading_count, 2);
        assert!((gmi.mean_mgdl - 154.0).abs() < 1e-9);
        assert_eq!(gmi.a1c_percent, 7.0);
        assert_eq!(gmi.a1c_mmol_mol, 52.9);
        assert!(GlucoseManagement::from_readings(&readings(&[0.0])).is_none());
    }

    #[test]
    fn test_daily_stats_split_on_local_midnight() {
        // 22:00, 23:00, 00:00, 01:00 UTC
        let data = readings(&[90.0, 108.0, 126.0, 144.0]);
        let utc = FixedOffset::east_opt(0).unwrap();
        let days = daily_stats(&data, &utc, Thresholds::clinical());
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].date, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(days[0].stats.count, 2);
        assert_eq!(days[1].tir.total, 2);

        let plus_three = FixedOffset::east_opt(3 * 3600).unwrap();
        assert_eq!(daily_stats(&data, &plus_three, Thresholds::clinical()).len(), 1);
    }
}
