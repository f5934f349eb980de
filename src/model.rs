//! Nightscout record types
//!
//! Field names follow the upstream JSON (`sgv`, `dateString`, `eventType`,
//! `created_at`, ...). Records are immutable once fetched.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::units::mgdl_to_mmol;

/// `enteredBy` marker written when a hypo treatment is logged by hand
pub const MANUAL_HYPO_MARKER: &str = "hba1c-converter";

/// CGM trend arrow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum TrendDirection {
    DoubleUp,
    SingleUp,
    FortyFiveUp,
    Flat,
    FortyFiveDown,
    SingleDown,
    DoubleDown,
    #[default]
    None,
}

impl TrendDirection {
    /// Parse the upstream `direction` string; anything unrecognized
    /// ("NOT COMPUTABLE", "RATE OUT OF RANGE", ...) is `None`
    pub fn from_nightscout(s: &str) -> Self {
        match s {
            "DoubleUp" => TrendDirection::DoubleUp,
            "SingleUp" => TrendDirection::SingleUp,
            "FortyFiveUp" => TrendDirection::FortyFiveUp,
            "Flat" => TrendDirection::Flat,
            "FortyFiveDown" => TrendDirection::FortyFiveDown,
            "SingleDown" => TrendDirection::SingleDown,
            "DoubleDown" => TrendDirection::DoubleDown,
            _ => TrendDirection::None,
        }
    }

    pub fn arrow(self) -> &'static str {
        match self {
            TrendDirection::DoubleUp => "⬆⬆",
            TrendDirection::SingleUp => "⬆",
            TrendDirection::FortyFiveUp => "↗",
            TrendDirection::Flat => "→",
            TrendDirection::FortyFiveDown => "↘",
            TrendDirection::SingleDown => "⬇",
            TrendDirection::DoubleDown => "⬇⬇",
            TrendDirection::None => "",
        }
    }
}

impl<'de> Deserialize<'de> for TrendDirection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        Ok(raw.as_deref().map(TrendDirection::from_nightscout).unwrap_or_default())
    }
}

/// A sensor glucose value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlucoseReading {
    pub value_mgdl: f64,
    pub timestamp: DateTime<Utc>,
    pub direction: TrendDirection,
}

impl GlucoseReading {
    pub fn new(value_mgdl: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            value_mgdl,
            timestamp,
            direction: TrendDirection::None,
        }
    }

    pub fn mmol(&self) -> f64 {
        mgdl_to_mmol(self.value_mgdl)
    }

    /// False for NaN, infinite, zero or negative values
    pub fn is_valid(&self) -> bool {
        self.value_mgdl.is_finite() && self.value_mgdl > 0.0
    }
}

/// Wire shape of an `entries.json` element
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEntry {
    #[serde(default, deserialize_with = "lenient_number")]
    sgv: Option<f64>,
    date: Option<i64>,
    date_string: Option<String>,
    #[serde(default)]
    direction: TrendDirection,
}

impl GlucoseReading {
    /// Convert upstream entries, dropping records without a value or time
    pub fn from_entries_json(json: &str) -> Result<Vec<GlucoseReading>, serde_json::Error> {
        let raw: Vec<serde_json::Value> = serde_json::from_str(json)?;
        let total = raw.len();
        let readings: Vec<GlucoseReading> = raw
            .iter()
            .filter_map(|value| RawEntry::deserialize(value).ok())
            .filter_map(|e| {
                let timestamp = e
                    .date
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                    .or_else(|| e.date_string.as_deref().and_then(parse_timestamp))?;
                Some(GlucoseReading {
                    value_mgdl: e.sgv?,
                    timestamp,
                    direction: e.direction,
                })
            })
            .collect();

        if readings.len() < total {
            log::warn!("Dropped {} malformed entries or entries without sgv or timestamp", total - readings.len());
        }
        Ok(readings)
    }
}

/// Category of a treatment, from the `eventType` string
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TreatmentKind {
    Bolus,
    TempBasal,
    TempBasalEnd,
    CarbCorrection,
    BgCheck,
    Note,
    DeviceChange,
    ProfileSwitch,
    Exercise,
    TemporaryTarget,
    Unknown(String),
}

/// Known upstream `eventType` values. Matched case-insensitively on the
/// trimmed string; no substring matching.
const EVENT_TYPE_TABLE: &[(&str, TreatmentKind)] = &[
    ("meal bolus", TreatmentKind::Bolus),
    ("correction bolus", TreatmentKind::Bolus),
    ("snack bolus", TreatmentKind::Bolus),
    ("combo bolus", TreatmentKind::Bolus),
    ("bolus", TreatmentKind::Bolus),
    ("smb", TreatmentKind::Bolus),
    ("bolus wizard", TreatmentKind::Bolus),
    ("temp basal", TreatmentKind::TempBasal),
    ("temp basal start", TreatmentKind::TempBasal),
    ("temp basal end", TreatmentKind::TempBasalEnd),
    ("carb correction", TreatmentKind::CarbCorrection),
    ("bg check", TreatmentKind::BgCheck),
    ("note", TreatmentKind::Note),
    ("announcement", TreatmentKind::Note),
    ("question", TreatmentKind::Note),
    ("site change", TreatmentKind::DeviceChange),
    ("sensor start", TreatmentKind::DeviceChange),
    ("sensor change", TreatmentKind::DeviceChange),
    ("insulin change", TreatmentKind::DeviceChange),
    ("pump battery change", TreatmentKind::DeviceChange),
    ("profile switch", TreatmentKind::ProfileSwitch),
    ("exercise", TreatmentKind::Exercise),
    ("temporary target", TreatmentKind::TemporaryTarget),
    ("temporary target cancel", TreatmentKind::TemporaryTarget),
];

impl TreatmentKind {
    pub fn from_event_type(event_type: &str) -> Self {
        let normalized = event_type.trim().to_lowercase();
        EVENT_TYPE_TABLE
            .iter()
            .find(|(name, _)| *name == normalized)
            .map(|(_, kind)| kind.clone())
            .unwrap_or_else(|| TreatmentKind::Unknown(event_type.to_string()))
    }
}

/// A treatment record (bolus, carbs, temp basal, note, ...)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TreatmentEvent {
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(rename = "eventType", default)]
    pub event_type: String,
    #[serde(rename = "enteredBy", default)]
    pub entered_by: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub carbs: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub insulin: Option<f64>,
    /// Temp basal rate in U/h
    #[serde(default, deserialize_with = "lenient_number")]
    pub rate: Option<f64>,
    /// Absolute temp basal rate in U/h, sent by some uploaders instead of `rate`
    #[serde(default, deserialize_with = "lenient_number")]
    pub absolute: Option<f64>,
    #[serde(rename = "duration", default, deserialize_with = "lenient_number")]
    pub duration_minutes: Option<f64>,
    /// Blood glucose recorded with the treatment
    #[serde(default, deserialize_with = "lenient_number")]
    pub glucose: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl TreatmentEvent {
    pub fn kind(&self) -> TreatmentKind {
        TreatmentKind::from_event_type(&self.event_type)
    }

    /// Temp basal rate, preferring `rate` over `absolute`
    pub fn basal_rate(&self) -> Option<f64> {
        self.rate.or(self.absolute).filter(|r| r.is_finite() && *r >= 0.0)
    }

    /// Pump metadata some uploaders JSON-encode into `notes`
    pub fn notes_json(&self) -> Option<serde_json::Map<String, serde_json::Value>> {
        let notes = self.notes.as_deref()?;
        match serde_json::from_str::<serde_json::Value>(notes) {
            Ok(serde_json::Value::Object(map)) => Some(map),
            _ => None,
        }
    }

    /// Hypo treatment logged by hand rather than synced from a device
    pub fn is_manual_hypo(&self) -> bool {
        self.kind() == TreatmentKind::CarbCorrection
            && self.entered_by.as_deref() == Some(MANUAL_HYPO_MARKER)
    }

    /// Decode a treatments array record by record; records that still do
    /// not fit the schema are skipped with a warning
    pub fn from_treatments_json(json: &str) -> Result<Vec<TreatmentEvent>, serde_json::Error> {
        let raw: Vec<serde_json::Value> = serde_json::from_str(json)?;
        let treatments = raw
            .into_iter()
            .filter_map(|value| {
                let id = value.get("_id").and_then(|v| v.as_str()).unwrap_or("?").to_string();
                match serde_json::from_value::<TreatmentEvent>(value) {
                    Ok(t) => Some(t),
                    Err(e) => {
                        log::warn!("Skipping treatment '{}': {}", id, e);
                        None
                    }
                }
            })
            .collect();
        Ok(treatments)
    }
}

/// Parse an upstream timestamp, RFC 3339 or `YYYY-MM-DDTHH:MM:SS(.fff)` UTC
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Uploaders disagree on whether numbers are JSON numbers or strings
#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(f64),
    Text(String),
}

/// Accept `2.5` or `"2.5"`; unparseable text reads as absent
fn lenient_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let raw: Option<NumberOrText> = Option::deserialize(deserializer)?;
    Ok(match raw {
        Some(NumberOrText::Number(v)) => Some(v),
        Some(NumberOrText::Text(s)) => s.trim().parse().ok(),
        None => None,
    })
}

fn lenient_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error> {
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_timestamp))
}

/// One entry of a basal schedule
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BasalProfileSegment {
    /// Minutes after local midnight
    pub start_minute: u32,
    /// U/h
    pub rate_per_hour: f64,
}

impl BasalProfileSegment {
    /// Parse "HH:MM" into a segment
    pub fn parse(start: &str, rate_per_hour: f64) -> Option<Self> {
        let (h, m) = start.trim().split_once(':')?;
        let hours: u32 = h.parse().ok()?;
        let minutes: u32 = m.parse().ok()?;
        if hours >= 24 || minutes >= 60 {
            return None;
        }
        Some(Self {
            start_minute: hours * 60 + minutes,
            rate_per_hour,
        })
    }

    pub fn start_label(&self) -> String {
        format!("{:02}:{:02}", self.start_minute / 60, self.start_minute % 60)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawProfileDoc {
    default_profile: Option<String>,
    #[serde(default)]
    store: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct RawBasalEntry {
    #[serde(default)]
    time: String,
    #[serde(alias = "rate", default, deserialize_with = "lenient_number")]
    value: Option<f64>,
}

/// Extract the basal schedule from `profile.json`: the default profile of the
/// first document, or the first store entry when no default is named
pub fn basal_segments_from_profile_json(json: &str) -> Result<Vec<BasalProfileSegment>, serde_json::Error> {
    let docs: Vec<RawProfileDoc> = serde_json::from_str(json)?;
    let Some(doc) = docs.into_iter().next() else {
        return Ok(Vec::new());
    };

    let profile = doc
        .default_profile
        .as_deref()
        .and_then(|name| doc.store.get(name))
        .or_else(|| doc.store.values().next());

    let Some(basal) = profile.and_then(|p| p.get("basal")) else {
        return Ok(Vec::new());
    };

    let Some(entries) = basal.as_array() else {
        log::warn!("Profile basal schedule is not an array");
        return Ok(Vec::new());
    };
    let segments = entries
        .iter()
        .filter_map(|value| {
            let entry = match RawBasalEntry::deserialize(value) {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("Skipping basal segment {}: {}", value, e);
                    return None;
                }
            };
            let Some(rate) = entry.value.filter(|r| r.is_finite() && *r >= 0.0) else {
                log::warn!("Skipping basal segment at '{}': no usable rate", entry.time);
                return None;
            };
            let segment = BasalProfileSegment::parse(&entry.time, rate);
            if segment.is_none() {
                log::warn!("Skipping basal segment with bad start time '{}'", entry.time);
            }
            segment
        })
        .collect();
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_json() {
        let json = r#"[
            {"sgv": 120, "date": 1700000000000, "direction": "Flat"},
            {"sgv": 95, "dateString": "2023-11-14T22:18:20.000Z", "direction": "NOT COMPUTABLE"},
            {"date": 1700000300000},
            {"sgv": 100},
            {"sgv": "130", "date": 1700000600000},
            {"sgv": 140, "date": "yesterday"}
        ]"#;
        let readings = GlucoseReading::from_entries_json(json).unwrap();
        assert_eq!(readings.len(), 3);
        assert_eq!(readings[2].value_mgdl, 130.0);
        assert_eq!(readings[0].direction, TrendDirection::Flat);
        assert_eq!(readings[0].timestamp.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(readings[1].direction, TrendDirection::None);
        assert_eq!(readings[1].value_mgdl, 95.0);
    }

    #[test]
    fn test_reading_validity() {
        let t = Utc::now();
        assert!(GlucoseReading::new(100.0, t).is_valid());
        assert!(!GlucoseReading::new(0.0, t).is_valid());
        assert!(!GlucoseReading::new(-5.0, t).is_valid());
        assert!(!GlucoseReading::new(f64::NAN, t).is_valid());
    }

    #[test]
    fn test_treatment_kind_table() {
        assert_eq!(TreatmentKind::from_event_type("Meal Bolus"), TreatmentKind::Bolus);
        assert_eq!(TreatmentKind::from_event_type("  correction bolus "), TreatmentKind::Bolus);
        assert_eq!(TreatmentKind::from_event_type("SMB"), TreatmentKind::Bolus);
        assert_eq!(TreatmentKind::from_event_type("Temp Basal"), TreatmentKind::TempBasal);
        assert_eq!(TreatmentKind::from_event_type("Carb Correction"), TreatmentKind::CarbCorrection);
        assert_eq!(
            TreatmentKind::from_event_type("Bolus-ish thing"),
            TreatmentKind::Unknown("Bolus-ish thing".to_string())
        );
    }

    #[test]
    fn test_treatments_json() {
        let json = r#"[
            {"_id": "a", "created_at": "2024-03-01T10:00:00.000Z", "eventType": "Temp Basal",
             "absolute": 0.8, "duration": 30},
            {"_id": "b", "created_at": "not a date", "eventType": "Meal Bolus", "insulin": 2.5},
            {"_id": "c", "created_at": "2024-03-01T10:05:00Z", "eventType": "Carb Correction",
             "carbs": 4, "enteredBy": "hba1c-converter", "notes": "{\"pump\":\"x\"}"}
        ]"#;
        let treatments = TreatmentEvent::from_treatments_json(json).unwrap();
        assert_eq!(treatments.len(), 3);
        assert_eq!(treatments[0].basal_rate(), Some(0.8));
        assert_eq!(treatments[0].duration_minutes, Some(30.0));
        assert!(treatments[1].created_at.is_none());
        assert!(treatments[2].is_manual_hypo());
        assert_eq!(
            treatments[2].notes_json().and_then(|m| m.get("pump").cloned()),
            Some(serde_json::json!("x"))
        );
    }

    #[test]
    fn test_treatments_with_text_numbers() {
        let json = r#"[
            {"_id": "bolus", "created_at": "2024-03-01T10:00:00Z", "eventType": "Meal Bolus", "insulin": 3},
            {"_id": "bg", "created_at": "2024-03-01T10:05:00Z", "eventType": "BG Check",
             "glucose": "5.4", "carbs": "12", "duration": " 30 "},
            {"_id": "odd", "created_at": "2024-03-01T10:10:00Z", "eventType": "Note", "insulin": "lots"}
        ]"#;
        let treatments = TreatmentEvent::from_treatments_json(json).unwrap();
        assert_eq!(treatments.len(), 3);
        assert_eq!(treatments[0].insulin, Some(3.0));
        assert_eq!(treatments[1].glucose, Some(5.4));
        assert_eq!(treatments[1].carbs, Some(12.0));
        assert_eq!(treatments[1].duration_minutes, Some(30.0));
        assert_eq!(treatments[2].insulin, None);
    }

    #[test]
    fn test_malformed_treatment_is_skipped() {
        let json = r#"[
            {"_id": "bolus", "created_at": "2024-03-01T10:00:00Z", "eventType": "Meal Bolus", "insulin": 3},
            {"_id": "broken", "eventType": "Meal Bolus", "insulin": {"units": 2}},
            "not even an object"
        ]"#;
        let treatments = TreatmentEvent::from_treatments_json(json).unwrap();
        assert_eq!(treatments.len(), 1);
        assert_eq!(treatments[0].id, "bolus");
        assert!(TreatmentEvent::from_treatments_json("{}").is_err());
    }

    #[test]
    fn test_plain_notes_are_not_json() {
        let t = TreatmentEvent {
            notes: Some("ate a banana".to_string()),
            ..Default::default()
        };
        assert!(t.notes_json().is_none());
    }

    #[test]
    fn test_profile_json() {
        let json = r#"[{
            "defaultProfile": "Weekday",
            "store": {
                "Weekend": {"basal": [{"time": "00:00", "value": 9.0}]},
                "Weekday": {"basal": [
                    {"time": "00:00", "value": 0.5},
                    {"time": "06:30", "value": 0.9},
                    {"time": "bogus", "value": 1.0}
                ]}
            }
        }]"#;
        let segments = basal_segments_from_profile_json(json).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].start_minute, 390);
        assert_eq!(segments[1].start_label(), "06:30");
        assert!(basal_segments_from_profile_json("[]").unwrap().is_empty());
    }

    #[test]
    fn test_profile_rates_as_text() {
        let json = r#"[{"store": {"Default": {"basal": [
            {"time": "00:00", "value": "0.8", "timeAsSeconds": "0"},
            {"time": "08:00", "value": "n/a"},
            {"time": "12:00", "rate": 1.1},
            {"time": "18:00", "value": [1]}
        ]}}}]"#;
        let segments = basal_segments_from_profile_json(json).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].rate_per_hour, 0.8);
        assert_eq!(segments[1].start_minute, 720);
        assert_eq!(segments[1].rate_per_hour, 1.1);
    }
}
