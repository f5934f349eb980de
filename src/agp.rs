//! Ambulatory Glucose Profile: percentile bands by time of day
//!
//! Readings from every day in the range are folded onto a single 24 h axis
//! in 5-minute buckets. Each populated bucket yields the 10th/25th/75th/90th
//! order statistics (in mmol/L) and a median taken as the midpoint of the
//! interquartile band. Empty buckets are omitted, not zero-filled.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, Timelike, Utc};
use serde::Serialize;

use crate::model::GlucoseReading;

pub const BUCKET_MINUTES: u32 = 5;
pub const BUCKETS_PER_DAY: usize = (24 * 60 / BUCKET_MINUTES) as usize;

/// Percentile curves, one entry per populated bucket
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgpProfile {
    pub labels: Vec<String>,
    pub p10: Vec<Option<f64>>,
    pub p25: Vec<Option<f64>>,
    pub median: Vec<Option<f64>>,
    pub p75: Vec<Option<f64>>,
    pub p90: Vec<Option<f64>>,
}

/// Time-of-day bucket key ("HH:MM") for a timestamp in the given zone
pub fn bucket_key(timestamp: DateTime<Utc>, offset: &FixedOffset) -> String {
    let local = timestamp.with_timezone(offset);
    let minute = local.minute() / BUCKET_MINUTES * BUCKET_MINUTES;
    format!("{:02}:{:02}", local.hour(), minute)
}

/// Order statistic at `index = floor(len * p)`; `None` past the end
fn order_statistic(sorted: &[f64], p: f64) -> Option<f64> {
    let idx = (sorted.len() as f64 * p).floor() as usize;
    sorted.get(idx).copied()
}

/// Build the AGP from readings over any number of days
pub fn compute_agp(readings: &[GlucoseReading], offset: &FixedOffset) -> AgpProfile {
    // BTreeMap keeps zero-padded keys in time-of-day order
    let mut buckets: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for reading in readings.iter().filter(|r| r.is_valid()) {
        buckets
            .entry(bucket_key(reading.timestamp, offset))
            .or_default()
            .push(reading.mmol());
    }

    let mut profile = AgpProfile::default();
    for (label, mut values) in buckets {
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let p25 = order_statistic(&values, 0.25);
        let p75 = order_statistic(&values, 0.75);
        let median = match (p25, p75) {
            (Some(lo), Some(hi)) => Some((lo + hi) / 2.0),
            _ => None,
        };

        profile.labels.push(label);
        profile.p10.push(order_statistic(&values, 0.10));
        profile.p25.push(p25);
        profile.median.push(median);
        profile.p75.push(p75);
        profile.p90.push(order_statistic(&values, 0.90));
    }
    profile
}

fn label_to_index(label: &str) -> Option<usize> {
    let (h, m) = label.split_once(':')?;
    let minutes = h.parse::<usize>().ok()? * 60 + m.parse::<usize>().ok()?;
    Some(minutes / BUCKET_MINUTES as usize)
}

fn index_to_label(index: usize) -> String {
    let minutes = index * BUCKET_MINUTES as usize;
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

impl AgpProfile {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Smoothed copy on the full 288-bucket grid. Gaps are filled by linear
    /// interpolation between the nearest populated buckets, wrapping at
    /// midnight.
    pub fn resampled(&self) -> AgpProfile {
        let mut known: Vec<(usize, usize)> = self
            .labels
            .iter()
            .enumerate()
            .filter_map(|(i, label)| label_to_index(label).map(|grid| (grid, i)))
            .collect();
        known.sort_unstable();
        if known.is_empty() {
            return AgpProfile::default();
        }

        let series = [&self.p10, &self.p25, &self.median, &self.p75, &self.p90];
        let mut out: [Vec<Option<f64>>; 5] = Default::default();
        let mut labels = Vec::with_capacity(BUCKETS_PER_DAY);

        for grid in 0..BUCKETS_PER_DAY {
            labels.push(index_to_label(grid));

            // Next populated bucket at or after `grid`, and the one before it
            let pos = known.partition_point(|&(g, _)| g < grid);
            let (next_grid, next_i) = known[pos % known.len()];
            let (prev_grid, prev_i) = known[(pos + known.len() - 1) % known.len()];

            if next_grid == grid {
                for (dst, src) in out.iter_mut().zip(series.iter()) {
                    dst.push(src[next_i]);
                }
                continue;
            }

            let span = (next_grid + BUCKETS_PER_DAY - prev_grid) % BUCKETS_PER_DAY;
            let offset = (grid + BUCKETS_PER_DAY - prev_grid) % BUCKETS_PER_DAY;
            let weight = if span == 0 { 0.0 } else { offset as f64 / span as f64 };

            for (dst, src) in out.iter_mut().zip(series.iter()) {
                let value = match (src[prev_i], src[next_i]) {
                    (Some(a), Some(b)) => Some(a + (b - a) * weight),
                    _ => None,
                };
                dst.push(value);
            }
        }

        let [p10, p25, median, p75, p90] = out;
        AgpProfile { labels, p10, p25, median, p75, p90 }
    }
}

/// Percentiles for one hour of the day
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyPercentiles {
    pub label: String,
    pub hour: u32,
    pub p10: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
}

/// Nearest-rank percentile: `sorted[ceil(p/100 * n) - 1]`
fn nearest_rank(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

/// Coarser hourly percentile report; populated hours only
pub fn hourly_percentiles(readings: &[GlucoseReading], offset: &FixedOffset) -> Vec<HourlyPercentiles> {
    let mut hours: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
    for reading in readings.iter().filter(|r| r.is_valid()) {
        let hour = reading.timestamp.with_timezone(offset).hour();
        hours.entry(hour).or_default().push(reading.mmol());
    }

    hours
        .into_iter()
        .map(|(hour, mut values)| {
            values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            HourlyPercentiles {
                label: format!("{}:00", hour),
                hour,
                p10: nearest_rank(&values, 10.0),
                p25: nearest_rank(&values, 25.0),
                p50: nearest_rank(&values, 50.0),
                p75: nearest_rank(&values, 75.0),
                p90: nearest_rank(&values, 90.0),
            }
        })
        .collect()
}
