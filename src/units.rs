//! Glucose and HbA1c unit conversions
//!
//! Nightscout stores sensor glucose in mg/dL; everything shown to the user is
//! in mmol/L. Conversions here are unrounded; use the `*_display` helpers
//! only at the presentation boundary.

use serde::{Deserialize, Serialize};

/// mg/dL per mmol/L of glucose
pub const MGDL_PER_MMOL: f64 = 18.0;

/// Slope of the IFCC/NGSP master equation (mmol/mol per percentage point)
const IFCC_SLOPE: f64 = 10.929;
const IFCC_INTERCEPT: f64 = 2.15;

/// Glucose value in mg/dL (milligrams per deciliter)
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct MgDl(pub f64);

/// Glucose value in mmol/L (millimoles per liter)
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct MmolL(pub f64);

impl MgDl {
    pub fn to_mmol(self) -> MmolL {
        MmolL(mgdl_to_mmol(self.0))
    }

    /// Format the value with unit suffix
    pub fn format(self) -> String {
        format!("{:.0} mg/dL", self.0)
    }
}

impl MmolL {
    /// Format the value with unit suffix
    pub fn format(self) -> String {
        format!("{:.1} mmol/L", self.0)
    }
}

/// User's preferred display unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GlucoseUnit {
    #[serde(rename = "mg/dL")]
    MgDl,
    #[serde(rename = "mmol/L")]
    #[default]
    MmolL,
}

impl GlucoseUnit {
    /// Format a raw mg/dL value in this unit
    pub fn format(self, mgdl: f64) -> String {
        match self {
            GlucoseUnit::MgDl => MgDl(mgdl).format(),
            GlucoseUnit::MmolL => MgDl(mgdl).to_mmol().format(),
        }
    }

    /// Get the unit label
    pub fn label(self) -> &'static str {
        match self {
            GlucoseUnit::MgDl => "mg/dL",
            GlucoseUnit::MmolL => "mmol/L",
        }
    }
}

pub fn mgdl_to_mmol(mgdl: f64) -> f64 {
    mgdl / MGDL_PER_MMOL
}

pub fn mmol_to_mgdl(mmol: f64) -> f64 {
    mmol * MGDL_PER_MMOL
}

/// mg/dL to mmol/L rounded to one decimal place, for display only
pub fn mgdl_to_mmol_display(mgdl: f64) -> f64 {
    round_to(mgdl_to_mmol(mgdl), 1)
}

/// HbA1c in NGSP percent to IFCC mmol/mol
pub fn percent_to_mmol_mol(percent: f64) -> f64 {
    IFCC_SLOPE * (percent - IFCC_INTERCEPT)
}

/// HbA1c in IFCC mmol/mol to NGSP percent
pub fn mmol_mol_to_percent(mmol_mol: f64) -> f64 {
    mmol_mol / IFCC_SLOPE + IFCC_INTERCEPT
}

/// Estimated HbA1c (%) from mean glucose, Nathan/ADAG regression
pub fn mean_glucose_to_a1c_percent(mean_mgdl: f64) -> f64 {
    (mean_mgdl + 46.7) / 28.7
}

/// Average glucose in mmol/L implied by an HbA1c percentage
pub fn a1c_percent_to_average_glucose(percent: f64) -> f64 {
    percent * 1.59 - 2.59
}

/// Carbs in `weight_g` grams of a food labelled with `carbs_per_100g`
pub fn carbs_for_weight(carbs_per_100g: f64, weight_g: f64) -> f64 {
    carbs_per_100g * weight_g / 100.0
}

/// Carbs in a `fraction` (0..=1) of an item holding `item_carbs`
pub fn carbs_for_portion(item_carbs: f64, fraction: f64) -> f64 {
    item_carbs * fraction
}

/// Parse a portion as a decimal ("0.25") or a ratio ("1/3"), in (0, 1]
pub fn parse_fraction(s: &str) -> Option<f64> {
    let value = match s.trim().split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            num / den
        }
        None => s.trim().parse().ok()?,
    };
    (value.is_finite() && value > 0.0 && value <= 1.0).then_some(value)
}

/// Round half away from zero to `places` decimals
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mgdl_to_mmol() {
        assert!((mgdl_to_mmol(180.0) - 10.0).abs() < 1e-12);
        assert!((mgdl_to_mmol(100.0) - 5.5555).abs() < 1e-3);
        assert_eq!(mgdl_to_mmol_display(100.0), 5.6);
        assert_eq!(mmol_to_mgdl(5.0), 90.0);
    }

    #[test]
    fn test_unit_formatting() {
        assert_eq!(MgDl(180.0).format(), "180 mg/dL");
        assert_eq!(MmolL(10.0).format(), "10.0 mmol/L");
        assert_eq!(GlucoseUnit::MmolL.format(99.0), "5.5 mmol/L");
        assert_eq!(GlucoseUnit::MgDl.label(), "mg/dL");
    }

    #[test]
    fn test_a1c_round_trip() {
        for x in [-3.0, 0.0, 2.15, 5.7, 6.5, 7.0, 12.3, 1000.0] {
            let back = mmol_mol_to_percent(percent_to_mmol_mol(x));
            assert!((back - x).abs() < 1e-9, "{} -> {}", x, back);
        }
    }

    #[test]
    fn test_known_a1c_values() {
        // 6.5% is the diagnostic threshold, 48 mmol/mol
        assert!((percent_to_mmol_mol(6.5) - 47.54).abs() < 0.01);
        // Mean of 154 mg/dL corresponds to roughly 7%
        assert!((mean_glucose_to_a1c_percent(154.0) - 7.0).abs() < 0.01);
        assert!((a1c_percent_to_average_glucose(7.0) - 8.54).abs() < 1e-9);
    }

    #[test]
    fn test_carb_calculator() {
        assert_eq!(round_to(carbs_for_weight(62.0, 45.0), 1), 27.9);
        assert_eq!(carbs_for_weight(0.0, 500.0), 0.0);
        assert_eq!(round_to(carbs_for_portion(40.0, 1.0 / 3.0), 1), 13.3);
        assert_eq!(carbs_for_portion(30.0, 0.5), 15.0);
    }

    #[test]
    fn test_parse_fraction() {
        assert_eq!(parse_fraction("0.25"), Some(0.25));
        assert_eq!(parse_fraction(" 1/2 "), Some(0.5));
        assert!((parse_fraction("1/3").unwrap() - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(parse_fraction("1"), Some(1.0));
        assert_eq!(parse_fraction("0"), None);
        assert_eq!(parse_fraction("3/2"), None);
        assert_eq!(parse_fraction("1/0"), None);
        assert_eq!(parse_fraction("half"), None);
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(1.005 * 100.0, 0), 100.0);
        assert_eq!(round_to(2.345, 1), 2.3);
        assert_eq!(round_to(0.125, 2), 0.13);
    }
}
