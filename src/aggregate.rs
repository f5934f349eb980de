//! Period roll-ups: carbs, insulin and per-day averages

use std::str::FromStr;

use chrono::{DateTime, Duration, FixedOffset, Months, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use serde::Serialize;

use crate::basal::{basal_total, BasalProfile};
use crate::error::GlucoDashError;
use crate::model::{TreatmentEvent, TreatmentKind};
use crate::units::round_to;

/// Carb entries below this are ignored in the genuine-carbs total
pub const MIN_GENUINE_CARBS: f64 = 1.9;

/// Window in which an identical later entry marks the earlier one as
/// protein/fat-derived
const PROTEIN_MATCH_WINDOW_MINUTES: i64 = 10;

/// Named report range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DateRange {
    Today,
    Yesterday,
    Week,
    Month,
    ThreeMonths,
}

impl FromStr for DateRange {
    type Err = GlucoDashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "today" => Ok(DateRange::Today),
            "yesterday" => Ok(DateRange::Yesterday),
            "1w" => Ok(DateRange::Week),
            "1m" => Ok(DateRange::Month),
            "3m" => Ok(DateRange::ThreeMonths),
            other => Err(GlucoDashError::InvalidRange(other.to_string())),
        }
    }
}

impl DateRange {
    pub fn key(self) -> &'static str {
        match self {
            DateRange::Today => "today",
            DateRange::Yesterday => "yesterday",
            DateRange::Week => "1w",
            DateRange::Month => "1m",
            DateRange::ThreeMonths => "3m",
        }
    }

    /// Nominal day count used for per-day averages
    pub fn days(self) -> u32 {
        match self {
            DateRange::Today | DateRange::Yesterday => 1,
            DateRange::Week => 7,
            DateRange::Month => 30,
            DateRange::ThreeMonths => 90,
        }
    }

    /// Whether per-day averages are meaningful for this range
    pub fn shows_averages(self) -> bool {
        matches!(self, DateRange::Week | DateRange::Month | DateRange::ThreeMonths)
    }

    /// `(start, end)` of the range relative to `now`. Single-day ranges
    /// cover the whole local day, the others end at `now`.
    pub fn window(self, now: DateTime<Utc>, offset: &FixedOffset) -> (DateTime<Utc>, DateTime<Utc>) {
        let local_now = now.with_timezone(offset);
        match self {
            DateRange::Today => day_window(local_now.date_naive(), offset),
            DateRange::Yesterday => {
                let day = local_now.date_naive().pred_opt().unwrap_or(local_now.date_naive());
                day_window(day, offset)
            }
            DateRange::Week => (now - Duration::days(7), now),
            DateRange::Month => (months_before(now, 1), now),
            DateRange::ThreeMonths => (months_before(now, 3), now),
        }
    }
}

fn months_before(now: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    now.checked_sub_months(Months::new(months))
        .unwrap_or(now - Duration::days(30 * i64::from(months)))
}

/// Local midnight to 23:59:59.999 of `day`, as UTC instants
pub fn day_window(day: NaiveDate, offset: &FixedOffset) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = offset
        .from_local_datetime(&day.and_time(NaiveTime::MIN))
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| day.and_time(NaiveTime::MIN).and_utc());
    let end = start + Duration::days(1) - Duration::milliseconds(1);
    (start, end)
}

fn in_window(t: &TreatmentEvent, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    t.created_at.is_some_and(|at| start <= at && at < end)
}

/// `total / days`, zero when there are no days
pub fn per_day(total: f64, days: u32) -> f64 {
    if days == 0 {
        0.0
    } else {
        total / f64::from(days)
    }
}

/// Carb corrections split into genuinely eaten carbs and the
/// protein/fat-derived ("gluconeogenic") load
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CarbSplit {
    pub genuine: f64,
    pub protein: f64,
}

impl CarbSplit {
    pub fn total_load(&self) -> f64 {
        self.genuine + self.protein
    }
}

/// A carb correction is protein/fat-derived when any treatment with the
/// same carb value follows it within 10 minutes. Only the earlier entry of
/// such a pair is reclassified.
pub fn is_protein_carb(entry: &TreatmentEvent, all: &[TreatmentEvent]) -> bool {
    if entry.kind() != TreatmentKind::CarbCorrection {
        return false;
    }
    let (Some(at), Some(carbs)) = (entry.created_at, entry.carbs) else {
        return false;
    };
    let limit = at + Duration::minutes(PROTEIN_MATCH_WINDOW_MINUTES);
    all.iter().any(|other| {
        other.carbs == Some(carbs)
            && other.created_at.is_some_and(|other_at| other_at > at && other_at <= limit)
    })
}

pub fn split_carbs(treatments: &[TreatmentEvent]) -> CarbSplit {
    let mut split = CarbSplit::default();
    for entry in treatments.iter().filter(|t| t.created_at.is_some()) {
        if entry.kind() != TreatmentKind::CarbCorrection {
            continue;
        }
        let carbs = entry.carbs.unwrap_or(0.0);
        if is_protein_carb(entry, treatments) {
            split.protein += carbs;
        } else if carbs > MIN_GENUINE_CARBS {
            split.genuine += carbs;
        }
    }
    split
}

/// Sum of bolus insulin (meal, correction, SMB, ...), rounded to 2 dp
pub fn bolus_total(treatments: &[TreatmentEvent]) -> f64 {
    let total: f64 = treatments
        .iter()
        .filter(|t| t.created_at.is_some() && t.kind() == TreatmentKind::Bolus)
        .filter_map(|t| t.insulin)
        .filter(|u| u.is_finite())
        .sum();
    round_to(total, 2)
}

/// Totals and per-day averages for a named range
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodSummary {
    pub range: DateRange,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub days: u32,
    pub total_carbs: f64,
    pub protein_carbs: f64,
    pub total_carb_load: f64,
    pub total_basal: f64,
    pub total_bolus: f64,
    pub total_insulin: f64,
    pub avg_carbs_per_day: f64,
    pub avg_carb_load_per_day: f64,
    pub avg_daily_insulin: f64,
}

impl PeriodSummary {
    pub fn has_carb_data(&self) -> bool {
        self.total_carbs > 0.0 || self.protein_carbs > 0.0
    }

    pub fn has_insulin_data(&self) -> bool {
        self.total_basal > 0.0 || self.total_bolus > 0.0
    }
}

/// Roll up carbs and insulin for `range`. Carbs and boluses count when
/// logged inside the window; basal is integrated up to `now` at the latest.
pub fn aggregate_period(
    treatments: &[TreatmentEvent],
    profile: &BasalProfile,
    range: DateRange,
    now: DateTime<Utc>,
    offset: &FixedOffset,
) -> PeriodSummary {
    let (start, end) = range.window(now, offset);
    let in_range: Vec<TreatmentEvent> = treatments
        .iter()
        .filter(|t| in_window(t, start, end))
        .cloned()
        .collect();

    let carbs = split_carbs(&in_range);
    let total_bolus = bolus_total(&in_range);
    let total_basal = basal_total(treatments, profile, start, end.min(now), offset);
    let total_insulin = total_basal + total_bolus;
    let days = range.days();

    PeriodSummary {
        range,
        start,
        end,
        days,
        total_carbs: carbs.genuine,
        protein_carbs: carbs.protein,
        total_carb_load: carbs.total_load(),
        total_basal,
        total_bolus,
        total_insulin,
        avg_carbs_per_day: per_day(carbs.genuine, days),
        avg_carb_load_per_day: per_day(carbs.total_load(), days),
        avg_daily_insulin: per_day(total_insulin, days),
    }
}

/// Carbs and insulin logged in one local hour
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyTreatments {
    pub hour: u32,
    pub label: String,
    pub carbs: f64,
    pub insulin: f64,
}

/// 24 hourly rows for the local calendar day `day`
pub fn hourly_breakdown(treatments: &[TreatmentEvent], day: NaiveDate, offset: &FixedOffset) -> Vec<HourlyTreatments> {
    let mut hours: Vec<HourlyTreatments> = (0..24)
        .map(|hour| HourlyTreatments {
            hour,
            label: format!("{}:00", hour),
            carbs: 0.0,
            insulin: 0.0,
        })
        .collect();

    for t in treatments {
        let Some(at) = t.created_at else { continue };
        let local = at.with_timezone(offset);
        if local.date_naive() != day {
            continue;
        }
        let row = &mut hours[local.hour() as usize];
        row.carbs += t.carbs.filter(|c| c.is_finite()).unwrap_or(0.0);
        row.insulin += t.insulin.filter(|u| u.is_finite()).unwrap_or(0.0);
    }
    hours
}

/// Total daily dose and carbs for one local day
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DayTotals {
    pub total_insulin: f64,
    pub total_carbs: f64,
}

pub fn day_totals(treatments: &[TreatmentEvent], day: NaiveDate, offset: &FixedOffset) -> DayTotals {
    let hours = hourly_breakdown(treatments, day, offset);
    DayTotals {
        total_insulin: hours.iter().map(|h| h.insulin).sum(),
        total_carbs: hours.iter().map(|h| h.carbs).sum(),
    }
}

/// A carb or insulin entry as listed under the day's chart
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreatmentLine {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub hour: u32,
    pub carbs: Option<f64>,
    pub insulin: Option<f64>,
    /// Pump metadata as an object when `notes` holds JSON, else the text
    pub notes: Option<serde_json::Value>,
}

/// Entries with carbs or insulin on local day `day`, newest first
pub fn day_treatments(treatments: &[TreatmentEvent], day: NaiveDate, offset: &FixedOffset) -> Vec<TreatmentLine> {
    let mut lines: Vec<TreatmentLine> = treatments
        .iter()
        .filter(|t| t.carbs.is_some_and(|c| c != 0.0) || t.insulin.is_some_and(|u| u != 0.0))
        .filter_map(|t| {
            let at = t.created_at?;
            let local = at.with_timezone(offset);
            if local.date_naive() != day {
                return None;
            }
            let notes = match t.notes_json() {
                Some(map) if !map.is_empty() => Some(serde_json::Value::Object(map)),
                _ => t
                    .notes
                    .as_deref()
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(|n| serde_json::Value::String(n.to_string())),
            };
            Some(TreatmentLine {
                id: t.id.clone(),
                created_at: at,
                hour: local.hour(),
                carbs: t.carbs,
                insulin: t.insulin,
                notes,
            })
        })
        .collect();
    lines.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    lines
}

/// A hypo treatment logged by hand
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HypoTreatment {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub carbs: f64,
    pub glucose: Option<f64>,
    pub notes: Option<String>,
}

/// Manually logged hypo treatments, newest first
pub fn manual_hypo_treatments(treatments: &[TreatmentEvent]) -> Vec<HypoTreatment> {
    let mut hypos: Vec<HypoTreatment> = treatments
        .iter()
        .filter(|t| t.is_manual_hypo())
        .filter_map(|t| {
            Some(HypoTreatment {
                id: t.id.clone(),
                created_at: t.created_at?,
                carbs: t.carbs.unwrap_or(0.0),
                glucose: t.glucose,
                notes: t.notes.clone(),
            })
        })
        .collect();
    hypos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    hypos
}
