//! Assembles every metric for one date range

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use log::info;
use serde::Serialize;

use crate::agp::{compute_agp, hourly_percentiles, AgpProfile, HourlyPercentiles};
use crate::aggregate::{
    aggregate_period, day_totals, day_treatments, day_window, hourly_breakdown, manual_hypo_treatments,
    DateRange, DayTotals, HourlyTreatments, HypoTreatment, PeriodSummary, TreatmentLine,
};
use crate::basal::{basal_timeline, BasalProfile, BasalSegment};
use crate::config::Config;
use crate::decay::{carb_burndown, compute_cob, compute_iob, BurndownPoint};
use crate::error::GlucoDashError;
use crate::model::{GlucoseReading, TreatmentEvent};
use crate::nightscout::DataSource;
use crate::stats::{daily_stats, DailyStats, GlucoseManagement, GlucoseStats};
use crate::tir::{compute_time_in_range_multi, Thresholds, TimeInRange};
use crate::units::round_to;

/// Treatments are fetched this far before a window so temp basals and
/// boluses started earlier still count at its start
const TREATMENT_LOOKBACK_HOURS: i64 = 24;

/// Model parameters taken from the configuration
#[derive(Debug, Clone, Copy)]
pub struct ReportSettings {
    pub offset: FixedOffset,
    pub dia_hours: f64,
    pub carb_absorption_minutes: f64,
    pub personal: Thresholds,
}

impl ReportSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            offset: config.utc_offset(),
            dia_hours: config.dia_hours,
            carb_absorption_minutes: config.carb_absorption_minutes,
            personal: config.personal_thresholds(),
        }
    }

    pub fn thresholds(&self) -> [Thresholds; 2] {
        [Thresholds::clinical(), self.personal]
    }
}

/// Raw inputs for one range
#[derive(Debug, Clone, Default)]
pub struct RangeData {
    pub readings: Vec<GlucoseReading>,
    pub treatments: Vec<TreatmentEvent>,
    pub profile: BasalProfile,
}

impl RangeData {
    /// Fetch everything needed for `[start, end]`
    pub fn fetch(source: &dyn DataSource, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, GlucoDashError> {
        let readings = source.entries(start, end)?;
        let treatments = source.treatments(start - Duration::hours(TREATMENT_LOOKBACK_HOURS), end)?;
        let profile = source.basal_profile()?;
        info!(
            "Loaded {} readings, {} treatments, {} basal segments",
            readings.len(),
            treatments.len(),
            profile.segments().len()
        );
        Ok(Self { readings, treatments, profile })
    }
}

/// Every dashboard metric for one range
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub range: DateRange,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub glucose: Option<GlucoseStats>,
    pub gmi: Option<GlucoseManagement>,
    pub time_in_range: Vec<TimeInRange>,
    pub agp: AgpProfile,
    pub hourly: Vec<HourlyPercentiles>,
    pub daily: Vec<DailyStats>,
    /// Instant IOB and COB are evaluated at: `now`, or the range end if earlier
    pub as_of: DateTime<Utc>,
    pub iob: f64,
    pub cob: f64,
    pub period: PeriodSummary,
    pub hypo_treatments: Vec<HypoTreatment>,
}

impl Report {
    pub fn generate(
        source: &dyn DataSource,
        settings: &ReportSettings,
        range: DateRange,
        now: DateTime<Utc>,
    ) -> Result<Self, GlucoDashError> {
        let (start, end) = range.window(now, &settings.offset);
        let data = RangeData::fetch(source, start, end)?;
        Ok(Self::from_data(&data, settings, range, now))
    }

    /// Build the report from already-fetched data
    pub fn from_data(data: &RangeData, settings: &ReportSettings, range: DateRange, now: DateTime<Utc>) -> Self {
        let offset = &settings.offset;
        let (start, end) = range.window(now, offset);
        let readings: Vec<GlucoseReading> = data
            .readings
            .iter()
            .filter(|r| start <= r.timestamp && r.timestamp <= end)
            .cloned()
            .collect();
        let in_window: Vec<TreatmentEvent> = data
            .treatments
            .iter()
            .filter(|t| t.created_at.is_some_and(|at| start <= at && at < end))
            .cloned()
            .collect();
        let as_of = now.min(end);

        Self {
            range,
            start,
            end,
            generated_at: now,
            glucose: GlucoseStats::from_readings(&readings),
            gmi: GlucoseManagement::from_readings(&readings),
            time_in_range: compute_time_in_range_multi(&readings, &settings.thresholds()),
            agp: compute_agp(&readings, offset),
            hourly: hourly_percentiles(&readings, offset),
            daily: daily_stats(&readings, offset, Thresholds::clinical()),
            as_of,
            iob: compute_iob(&data.treatments, as_of, settings.dia_hours),
            cob: compute_cob(&data.treatments, as_of, settings.carb_absorption_minutes),
            period: aggregate_period(&data.treatments, &data.profile, range, now, offset),
            hypo_treatments: manual_hypo_treatments(&in_window),
        }
    }
}

/// Basal delivery over a range, segment by segment
#[derive(Debug, Clone, Serialize)]
pub struct BasalReport {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub scheduled_daily_total: f64,
    pub total: f64,
    pub segments: Vec<BasalSegment>,
}

impl BasalReport {
    /// Delivery in `[start, end)`, stopping at `now` for windows that reach
    /// into the future
    pub fn from_data(data: &RangeData, start: DateTime<Utc>, end: DateTime<Utc>, now: DateTime<Utc>, offset: &FixedOffset) -> Self {
        let end = end.min(now);
        let segments = basal_timeline(&data.treatments, &data.profile, start, end, offset);
        let total = round_to(segments.iter().map(BasalSegment::units).sum(), 2);
        Self {
            start,
            end,
            scheduled_daily_total: data.profile.daily_total(),
            total,
            segments,
        }
    }
}

/// One local day: hourly carbs and insulin, totals, IOB/COB and the carb curve
#[derive(Debug, Clone, Serialize)]
pub struct DayReport {
    pub date: NaiveDate,
    pub hours: Vec<HourlyTreatments>,
    pub totals: DayTotals,
    pub treatments: Vec<TreatmentLine>,
    pub as_of: DateTime<Utc>,
    pub iob: f64,
    pub cob: f64,
    pub carb_burndown: Vec<BurndownPoint>,
}

impl DayReport {
    pub fn generate(
        source: &dyn DataSource,
        settings: &ReportSettings,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Self, GlucoDashError> {
        let (start, end) = day_window(date, &settings.offset);
        let treatments = source.treatments(start - Duration::hours(TREATMENT_LOOKBACK_HOURS), end)?;
        Ok(Self::from_treatments(&treatments, settings, date, now))
    }

    pub fn from_treatments(treatments: &[TreatmentEvent], settings: &ReportSettings, date: NaiveDate, now: DateTime<Utc>) -> Self {
        let (start, end) = day_window(date, &settings.offset);
        let as_of = now.clamp(start, end);
        Self {
            date,
            hours: hourly_breakdown(treatments, date, &settings.offset),
            totals: day_totals(treatments, date, &settings.offset),
            treatments: day_treatments(treatments, date, &settings.offset),
            as_of,
            iob: compute_iob(treatments, as_of, settings.dia_hours),
            cob: compute_cob(treatments, as_of, settings.carb_absorption_minutes),
            carb_burndown: carb_burndown(treatments, start),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BasalProfileSegment;
    use chrono::TimeZone;

    fn settings() -> ReportSettings {
        ReportSettings::from_config(&Config::default())
    }

    fn at(day: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, day, h, m, 0).unwrap()
    }

    fn event(kind: &str, time: DateTime<Utc>) -> TreatmentEvent {
        TreatmentEvent {
            created_at: Some(time),
            event_type: kind.to_string(),
            ..Default::default()
        }
    }

    fn sample_data() -> RangeData {
        let readings = (0..12)
            .map(|i| GlucoseReading::new(90.0 + 9.0 * i as f64, at(10, 6, 0) + Duration::minutes(5 * i)))
            .collect();
        let treatments = vec![
            TreatmentEvent { insulin: Some(4.0), ..event("Meal Bolus", at(10, 7, 0)) },
            TreatmentEvent { carbs: Some(40.0), ..event("Carb Correction", at(10, 7, 0)) },
            TreatmentEvent {
                rate: Some(0.0),
                duration_minutes: Some(60.0),
                ..event("Temp Basal", at(10, 2, 0))
            },
        ];
        let profile = BasalProfile::new(vec![BasalProfileSegment::parse("00:00", 1.0).unwrap()]);
        RangeData { readings, treatments, profile }
    }

    #[test]
    fn test_report_from_data() {
        let now = at(10, 8, 0);
        let report = Report::from_data(&sample_data(), &settings(), DateRange::Today, now);

        assert_eq!(report.start, at(10, 0, 0));
        assert_eq!(report.as_of, now);
        assert_eq!(report.glucose.as_ref().map(|g| g.count), Some(12));
        assert!(report.gmi.is_some());
        assert_eq!(report.time_in_range.len(), 2);
        assert_eq!(report.time_in_range[0].total, 12);
        assert_eq!(report.agp.labels.len(), 12);
        assert_eq!(report.daily.len(), 1);

        // One hour after the bolus: 4 U * 0.875
        assert!((report.iob - 3.5).abs() < 1e-9);
        assert!((report.cob - 20.0).abs() < 1e-9);

        // Eight hours of 1 U/h with one suspended hour
        assert_eq!(report.period.total_basal, 7.0);
        assert_eq!(report.period.total_bolus, 4.0);
        assert_eq!(report.period.total_carbs, 40.0);
        assert!(report.hypo_treatments.is_empty());
    }

    #[test]
    fn test_report_without_data() {
        let report = Report::from_data(&RangeData::default(), &settings(), DateRange::Week, at(10, 8, 0));
        assert!(report.glucose.is_none());
        assert!(report.gmi.is_none());
        assert!(report.agp.is_empty());
        assert_eq!(report.time_in_range[0].in_pct, 0.0);
        assert_eq!(report.iob, 0.0);
        assert_eq!(report.period.total_insulin, 0.0);
    }

    #[test]
    fn test_basal_report_stops_at_now() {
        let data = sample_data();
        let report = BasalReport::from_data(&data, at(10, 0, 0), at(11, 0, 0), at(10, 6, 0), &FixedOffset::east_opt(0).unwrap());
        assert_eq!(report.end, at(10, 6, 0));
        assert_eq!(report.total, 5.0);
        assert_eq!(report.scheduled_daily_total, 24.0);
        assert_eq!(report.segments.len(), 3);
    }

    #[test]
    fn test_day_report() {
        let data = sample_data();
        let date = NaiveDate::from_ymd_opt(2024, 9, 10).unwrap();
        let report = DayReport::from_treatments(&data.treatments, &settings(), date, at(12, 0, 0));

        // A past day is evaluated at its last instant
        assert_eq!(report.as_of, at(11, 0, 0) - Duration::milliseconds(1));
        assert_eq!(report.iob, 0.0);
        assert_eq!(report.totals.total_carbs, 40.0);
        assert_eq!(report.totals.total_insulin, 4.0);
        assert_eq!(report.hours[7].carbs, 40.0);
        assert_eq!(report.treatments.len(), 2);
        assert_eq!(report.carb_burndown.len(), 288);
        assert_eq!(report.carb_burndown[84].carbs, 40.0);
    }
}
