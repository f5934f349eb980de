//! Insulin-on-board and carbs-on-board
//!
//! IOB uses the Walsh-style piecewise quadratic activity curve, COB a linear
//! absorption over a fixed window. Events may arrive in any order and may
//! overlap; each contributes independently and the sum is clamped at zero.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::model::{TreatmentEvent, TreatmentKind};
use crate::units::round_to;

pub const DEFAULT_DIA_HOURS: f64 = 4.0;
pub const DEFAULT_CARB_ABSORPTION_MINUTES: f64 = 120.0;

/// Carb burndown sampling step and horizon
const BURNDOWN_STEP_MINUTES: i64 = 5;
const BURNDOWN_HORIZON_MINUTES: i64 = 6 * 60;

fn minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 60_000.0
}

/// Fraction of a bolus still active `minutes_ago` after delivery.
///
/// Two quadratic halves meeting at 0.5 when `t = dia/2`, so the curve is
/// continuous and never increases.
pub fn iob_fraction_walsh(minutes_ago: f64, dia_hours: f64) -> f64 {
    let t = minutes_ago / 60.0;
    let tau = dia_hours;
    if t < 0.0 {
        1.0
    } else if t >= tau {
        0.0
    } else if t <= tau / 2.0 {
        let r = t / tau;
        1.0 - 2.0 * r * r
    } else {
        let r = 1.0 - t / tau;
        2.0 * r * r
    }
}

/// Insulin on board at `now` from every dose in `treatments`
pub fn compute_iob(treatments: &[TreatmentEvent], now: DateTime<Utc>, dia_hours: f64) -> f64 {
    let window = dia_hours * 60.0;
    let iob: f64 = treatments
        .iter()
        .filter_map(|t| Some((t.created_at?, t.insulin?)))
        .filter(|(_, dose)| dose.is_finite())
        .map(|(at, dose)| (minutes_between(at, now), dose))
        .filter(|(mins, _)| *mins < window)
        .map(|(mins, dose)| dose * iob_fraction_walsh(mins, dia_hours))
        .sum();
    iob.max(0.0)
}

/// Carbs on board at `now`, linear absorption over `absorption_minutes`
pub fn compute_cob(treatments: &[TreatmentEvent], now: DateTime<Utc>, absorption_minutes: f64) -> f64 {
    if absorption_minutes <= 0.0 {
        return 0.0;
    }
    let cob: f64 = treatments
        .iter()
        .filter_map(|t| Some((t.created_at?, t.carbs?)))
        .filter(|(_, carbs)| carbs.is_finite())
        .map(|(at, carbs)| (minutes_between(at, now), carbs))
        .filter(|(mins, _)| *mins < absorption_minutes)
        .map(|(mins, carbs)| carbs * (1.0 - mins / absorption_minutes).clamp(0.0, 1.0))
        .sum();
    cob.max(0.0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BurndownPoint {
    pub time: DateTime<Utc>,
    pub carbs: f64,
}

/// Remaining carbs over the 24 h starting at `day_start`, in 5-minute slots.
///
/// Carb corrections are grouped into 5-minute slots; each group decays
/// exponentially with a 6 h half-life and is sampled for 6 h.
pub fn carb_burndown(treatments: &[TreatmentEvent], day_start: DateTime<Utc>) -> Vec<BurndownPoint> {
    let step_ms = BURNDOWN_STEP_MINUTES * 60_000;
    let slot_of = |t: DateTime<Utc>| t.timestamp_millis().div_euclid(step_ms);

    // Grouped carb entries, keyed by slot, in first-seen order
    let mut groups: Vec<(i64, f64)> = Vec::new();
    for t in treatments.iter().filter(|t| t.kind() == TreatmentKind::CarbCorrection) {
        let Some(at) = t.created_at else { continue };
        let slot = slot_of(at);
        let carbs = t.carbs.unwrap_or(0.0);
        match groups.iter_mut().find(|(s, _)| *s == slot) {
            Some((_, total)) => *total += carbs,
            None => groups.push((slot, carbs)),
        }
    }

    let decay = BURNDOWN_HORIZON_MINUTES as f64 / std::f64::consts::LN_2;
    let first_slot = slot_of(day_start);
    let slots_per_day = 24 * 60 / BURNDOWN_STEP_MINUTES;
    let mut timeline = vec![0.0; slots_per_day as usize];

    for (slot, carbs) in groups {
        for i in (0..=BURNDOWN_HORIZON_MINUTES).step_by(BURNDOWN_STEP_MINUTES as usize) {
            let index = slot + i / BURNDOWN_STEP_MINUTES - first_slot;
            if (0..slots_per_day).contains(&index) {
                timeline[index as usize] += round_to(carbs * (-(i as f64) / decay).exp(), 2);
            }
        }
    }

    let origin = DateTime::<Utc>::from_timestamp_millis(first_slot * step_ms).unwrap_or(day_start);
    timeline
        .into_iter()
        .enumerate()
        .map(|(i, carbs)| BurndownPoint {
            time: origin + Duration::minutes(i as i64 * BURNDOWN_STEP_MINUTES),
            carbs,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn bolus(at: DateTime<Utc>, units: f64) -> TreatmentEvent {
        TreatmentEvent {
            created_at: Some(at),
            event_type: "Meal Bolus".to_string(),
            insulin: Some(units),
            ..Default::default()
        }
    }

    fn carbs(at: DateTime<Utc>, grams: f64) -> TreatmentEvent {
        TreatmentEvent {
            created_at: Some(at),
            event_type: "Carb Correction".to_string(),
            carbs: Some(grams),
            ..Default::default()
        }
    }

    #[test]
    fn test_walsh_fraction_shape() {
        assert_eq!(iob_fraction_walsh(-10.0, 4.0), 1.0);
        assert_eq!(iob_fraction_walsh(0.0, 4.0), 1.0);
        assert!((iob_fraction_walsh(60.0, 4.0) - 0.875).abs() < 1e-12);
        // Both branches meet at t = tau/2
        assert!((iob_fraction_walsh(120.0, 4.0) - 0.5).abs() < 1e-12);
        assert!((iob_fraction_walsh(120.001, 4.0) - 0.5).abs() < 1e-4);
        assert!((iob_fraction_walsh(180.0, 4.0) - 0.125).abs() < 1e-12);
        assert_eq!(iob_fraction_walsh(240.0, 4.0), 0.0);
    }

    #[test]
    fn test_iob_sums_overlapping_doses() {
        let now = t0();
        let treatments = vec![
            bolus(now - Duration::minutes(60), 4.0),
            bolus(now - Duration::minutes(180), 2.0),
            bolus(now - Duration::minutes(300), 10.0), // outside window
            TreatmentEvent { created_at: None, insulin: Some(5.0), ..Default::default() },
        ];
        let iob = compute_iob(&treatments, now, 4.0);
        assert!((iob - (4.0 * 0.875 + 2.0 * 0.125)).abs() < 1e-9);
    }

    #[test]
    fn test_iob_reaches_zero_at_end_of_action() {
        let dose_at = t0();
        let treatments = vec![bolus(dose_at - Duration::minutes(30), 1.0), bolus(dose_at, 3.0)];
        assert_eq!(compute_iob(&treatments, dose_at + Duration::minutes(240), 4.0), 0.0);
        assert_eq!(compute_iob(&treatments, dose_at + Duration::minutes(500), 4.0), 0.0);
        assert_eq!(compute_iob(&[], dose_at, 4.0), 0.0);
    }

    #[test]
    fn test_cob_linear_decay() {
        let entry = t0();
        let treatments = vec![carbs(entry, 40.0)];
        let cob = compute_cob(&treatments, entry + Duration::minutes(60), 120.0);
        assert!((cob - 20.0).abs() < 0.01);
        assert_eq!(compute_cob(&treatments, entry + Duration::minutes(120), 120.0), 0.0);
        assert_eq!(compute_cob(&treatments, entry, 120.0), 40.0);
        // Future entries count in full
        assert_eq!(compute_cob(&treatments, entry - Duration::minutes(30), 120.0), 40.0);
        assert_eq!(compute_cob(&[], entry, 120.0), 0.0);
    }

    #[test]
    fn test_carb_burndown() {
        let day = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let treatments = vec![
            carbs(day + Duration::minutes(61), 10.0),
            carbs(day + Duration::minutes(63), 10.0), // same 5-minute slot
            bolus(day + Duration::minutes(60), 3.0),
        ];
        let points = carb_burndown(&treatments, day);
        assert_eq!(points.len(), 288);
        assert_eq!(points[0].time, day);
        assert_eq!(points[11].carbs, 0.0);
        assert_eq!(points[12].carbs, 20.0);
        // Half-life of six hours
        assert!((points[12 + 72].carbs - 10.0).abs() < 0.01);
        assert_eq!(points[12 + 73].carbs, 0.0);
    }

    proptest! {
        #[test]
        fn prop_iob_never_increases(doses in prop::collection::vec((0i64..600, 0.1f64..10.0), 1..20),
                                    step in 1i64..30) {
            let start = t0();
            let treatments: Vec<TreatmentEvent> = doses
                .iter()
                .map(|(offset, units)| bolus(start - Duration::minutes(*offset), *units))
                .collect();
            let mut previous = compute_iob(&treatments, start, 4.0);
            for k in 1..=(300 / step) {
                let current = compute_iob(&treatments, start + Duration::minutes(k * step), 4.0);
                prop_assert!(current <= previous + 1e-12);
                previous = current;
            }
            prop_assert_eq!(compute_iob(&treatments, start + Duration::minutes(240), 4.0), 0.0);
        }
    }
}
