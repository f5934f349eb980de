//! Basal insulin reconciliation
//!
//! Merges the scheduled basal profile with temp-basal overrides into the
//! insulin actually delivered over a window. Delivery is sampled once per
//! minute starting at the window start; each sample delivers `rate / 60` U.
//! `basal_total_stepped` walks the samples one by one and is the reference;
//! `basal_total` integrates whole constant-rate segments and counts the
//! same samples exactly, so both round to the same total.

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, TimeZone, Timelike, Utc};
use log::{debug, warn};
use serde::Serialize;

use crate::model::{BasalProfileSegment, TreatmentEvent, TreatmentKind};
use crate::units::round_to;

const SAMPLE_MS: i64 = 60_000;

/// Longest temp basal pumps accept; longer upstream durations are clamped
const MAX_TEMP_BASAL_MINUTES: f64 = 24.0 * 60.0;

/// Daily basal schedule, sorted by start time
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BasalProfile {
    segments: Vec<BasalProfileSegment>,
}

impl BasalProfile {
    pub fn new(mut segments: Vec<BasalProfileSegment>) -> Self {
        segments.sort_by_key(|s| s.start_minute);
        Self { segments }
    }

    pub fn segments(&self) -> &[BasalProfileSegment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Rate of the last segment starting at or before `minute_of_day`.
    /// Before the first start the schedule wraps to the previous day's last
    /// segment; an empty profile delivers nothing.
    pub fn rate_at_minute(&self, minute_of_day: u32) -> f64 {
        self.segments
            .iter()
            .rev()
            .find(|s| s.start_minute <= minute_of_day)
            .or_else(|| self.segments.last())
            .map(|s| s.rate_per_hour)
            .unwrap_or(0.0)
    }

    pub fn rate_at(&self, t: DateTime<Utc>, offset: &FixedOffset) -> f64 {
        let local = t.with_timezone(offset);
        self.rate_at_minute(local.hour() * 60 + local.minute())
    }

    /// Total of one full day of the schedule, in units
    pub fn daily_total(&self) -> f64 {
        if self.segments.is_empty() {
            return 0.0;
        }
        let mut total = 0.0;
        for (i, seg) in self.segments.iter().enumerate() {
            let end = self.segments.get(i + 1).map(|n| n.start_minute).unwrap_or(24 * 60);
            total += seg.rate_per_hour * f64::from(end - seg.start_minute) / 60.0;
        }
        // Time before the first segment runs at the last rate
        let lead = self.segments[0].start_minute;
        total += self.rate_at_minute(0) * f64::from(lead) / 60.0;
        total
    }
}

/// A temp basal after overlap truncation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TempBasal {
    pub id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// U/h
    pub rate: f64,
}

impl TempBasal {
    pub fn covers(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }
}

/// Extract temp basals, sorted by start, each ending no later than the next
/// one starts. Unusable records are skipped with a warning.
pub fn resolve_temp_basals(treatments: &[TreatmentEvent]) -> Vec<TempBasal> {
    let mut temps: Vec<TempBasal> = treatments
        .iter()
        .filter(|t| t.kind() == TreatmentKind::TempBasal)
        .filter_map(|t| {
            let Some(start) = t.created_at else {
                warn!("Skipping temp basal '{}': missing created_at", t.id);
                return None;
            };
            let duration = t.duration_minutes.unwrap_or(0.0);
            if duration.is_nan() || duration <= 0.0 {
                warn!("Skipping temp basal '{}': duration {} min", t.id, duration);
                return None;
            }
            let Some(rate) = t.basal_rate() else {
                warn!("Skipping temp basal '{}': no usable rate", t.id);
                return None;
            };
            if duration > MAX_TEMP_BASAL_MINUTES {
                warn!("Temp basal '{}': clamping duration {} min to {} min", t.id, duration, MAX_TEMP_BASAL_MINUTES);
            }
            let nominal_ms = (duration.min(MAX_TEMP_BASAL_MINUTES) * SAMPLE_MS as f64).round() as i64;
            let Some(end) = start.checked_add_signed(Duration::milliseconds(nominal_ms)) else {
                warn!("Skipping temp basal '{}': end time out of range", t.id);
                return None;
            };
            Some(TempBasal {
                id: t.id.clone(),
                start,
                end,
                rate,
            })
        })
        .collect();

    temps.sort_by_key(|t| t.start);

    for i in 1..temps.len() {
        let next_start = temps[i].start;
        let prev = &mut temps[i - 1];
        if next_start < prev.end {
            debug!(
                "Temp basal '{}' truncated at {} by the next temp basal",
                prev.id, next_start
            );
            prev.end = next_start;
        }
    }
    temps
}

fn effective_rate(temps: &[TempBasal], profile: &BasalProfile, t: DateTime<Utc>, offset: &FixedOffset) -> (f64, RateSource) {
    // Temps are sorted and non-overlapping, so the covering one (if any) is
    // the last starting at or before t
    let idx = temps.partition_point(|temp| temp.start <= t);
    match idx.checked_sub(1).map(|i| &temps[i]) {
        Some(temp) if temp.covers(t) => (temp.rate, RateSource::Temp),
        _ => (profile.rate_at(t, offset), RateSource::Profile),
    }
}

/// Reference minute-stepping integration, rounded to 2 dp
#[cfg(test)]
pub fn basal_total_stepped(
    treatments: &[TreatmentEvent],
    profile: &BasalProfile,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    offset: &FixedOffset,
) -> f64 {
    let temps = resolve_temp_basals(treatments);
    let mut total = 0.0;
    let mut t = start;
    while t < end {
        total += effective_rate(&temps, profile, t, offset).0 / 60.0;
        t += Duration::milliseconds(SAMPLE_MS);
    }
    round_to(total, 2)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RateSource {
    Profile,
    Temp,
}

/// A stretch of constant delivery rate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BasalSegment {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// U/h
    pub rate: f64,
    pub source: RateSource,
    /// Minute samples falling inside the segment
    pub minutes: i64,
}

impl BasalSegment {
    pub fn units(&self) -> f64 {
        self.rate * self.minutes as f64 / 60.0
    }
}

/// Number of minute samples `start + k min` that fall before `t`
fn samples_before(start: DateTime<Utc>, t: DateTime<Utc>) -> i64 {
    let ms = (t - start).num_milliseconds().max(0);
    (ms + SAMPLE_MS - 1) / SAMPLE_MS
}

/// Profile segment boundaries, as instants, strictly inside (start, end)
fn profile_boundaries(profile: &BasalProfile, start: DateTime<Utc>, end: DateTime<Utc>, offset: &FixedOffset) -> Vec<DateTime<Utc>> {
    let mut out = Vec::new();
    if profile.is_empty() {
        return out;
    }
    let first_day = start.with_timezone(offset).date_naive();
    let last_day = end.with_timezone(offset).date_naive();

    for day in first_day.iter_days().take_while(|d| *d <= last_day) {
        for seg in profile.segments() {
            let Some(time) = NaiveTime::from_hms_opt(seg.start_minute / 60, seg.start_minute % 60, 0) else {
                continue;
            };
            if let Some(local) = offset.from_local_datetime(&day.and_time(time)).single() {
                let instant = local.with_timezone(&Utc);
                if start < instant && instant < end {
                    out.push(instant);
                }
            }
        }
    }
    out
}

/// Resolve the window into constant-rate segments
pub fn basal_timeline(
    treatments: &[TreatmentEvent],
    profile: &BasalProfile,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    offset: &FixedOffset,
) -> Vec<BasalSegment> {
    if end <= start {
        return Vec::new();
    }
    let temps = resolve_temp_basals(treatments);

    let mut breakpoints = vec![start, end];
    for temp in &temps {
        for t in [temp.start, temp.end] {
            if start < t && t < end {
                breakpoints.push(t);
            }
        }
    }
    breakpoints.extend(profile_boundaries(profile, start, end, offset));
    breakpoints.sort();
    breakpoints.dedup();

    let mut segments: Vec<BasalSegment> = Vec::new();
    for pair in breakpoints.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let (rate, source) = effective_rate(&temps, profile, a, offset);
        let minutes = samples_before(start, b) - samples_before(start, a);

        // Merge with the previous segment when nothing changes
        if let Some(last) = segments.last_mut() {
            if last.rate == rate && last.source == source && last.end == a {
                last.end = b;
                last.minutes += minutes;
                continue;
            }
        }
        segments.push(BasalSegment { start: a, end: b, rate, source, minutes });
    }
    segments
}

/// Basal insulin delivered in `[start, end)`, rounded to 2 dp
pub fn basal_total(
    treatments: &[TreatmentEvent],
    profile: &BasalProfile,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    offset: &FixedOffset,
) -> f64 {
    let total: f64 = basal_timeline(treatments, profile, start, end, offset)
        .iter()
        .map(BasalSegment::units)
        .sum();
    round_to(total, 2)
}
