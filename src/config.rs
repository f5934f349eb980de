//! Configuration file parsing and data locations

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{FixedOffset, Offset, Utc};
use log::warn;

use crate::decay::{DEFAULT_CARB_ABSORPTION_MINUTES, DEFAULT_DIA_HOURS};
use crate::error::GlucoDashError;
use crate::tir::Thresholds;
use crate::units::GlucoseUnit;

const APP_DIR_NAME: &str = "glucodash";

/// Configuration loaded from config.txt
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the Nightscout site, e.g. https://example.herokuapp.com
    pub nightscout_url: Option<String>,
    /// Already-hashed API secret sent as the API-SECRET header
    pub api_secret: Option<String>,
    /// Directory holding entries.json / treatments.json / profile.json
    /// (used instead of Nightscout when set)
    pub data_dir: Option<String>,
    pub database_path: Option<String>,
    pub cache_ttl_minutes: i64,
    pub http_timeout_secs: u64,
    pub utc_offset_minutes: i32,
    /// Duration of insulin action in hours
    pub dia_hours: f64,
    pub carb_absorption_minutes: f64,
    pub personal_low: f64,
    pub personal_high: f64,
    /// Unit for the human-readable summaries
    pub display_unit: GlucoseUnit,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nightscout_url: None,
            api_secret: None,
            data_dir: None,
            database_path: None,
            cache_ttl_minutes: 5,
            http_timeout_secs: 30,
            utc_offset_minutes: 0,
            dia_hours: DEFAULT_DIA_HOURS,
            carb_absorption_minutes: DEFAULT_CARB_ABSORPTION_MINUTES,
            personal_low: Thresholds::personal().low,
            personal_high: Thresholds::personal().high,
            display_unit: GlucoseUnit::MmolL,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, GlucoDashError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut config = Config::default();

        for line in reader.lines() {
            let line = line?;

            // Skip empty lines and comments
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, rest)) = Self::parse_line(line) {
                // Extract value before any comment
                let value = rest.split('#').next().unwrap_or("").trim();
                if !value.is_empty() {
                    config.apply(key, value);
                }
            }
        }

        Ok(config)
    }

    /// Parse a single config line, returning (key, value)
    fn parse_line(line: &str) -> Option<(&str, &str)> {
        // Find first whitespace to separate key from value
        let mut parts = line.splitn(2, |c: char| c.is_whitespace());
        let key = parts.next()?.trim();
        let value = parts.next()?.trim();

        if key.is_empty() || value.is_empty() {
            return None;
        }

        Some((key, value))
    }

    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "nightscout_url" => self.nightscout_url = Some(value.trim_end_matches('/').to_string()),
            "api_secret" => self.api_secret = Some(value.to_string()),
            "data_dir" => self.data_dir = Some(value.to_string()),
            "database_path" => self.database_path = Some(value.to_string()),
            "cache_ttl_minutes" => set_parsed(key, value, &mut self.cache_ttl_minutes),
            "http_timeout_secs" => set_parsed(key, value, &mut self.http_timeout_secs),
            "utc_offset_minutes" => set_parsed(key, value, &mut self.utc_offset_minutes),
            "dia_hours" => set_parsed(key, value, &mut self.dia_hours),
            "carb_absorption_minutes" => set_parsed(key, value, &mut self.carb_absorption_minutes),
            "personal_low" => set_parsed(key, value, &mut self.personal_low),
            "personal_high" => set_parsed(key, value, &mut self.personal_high),
            "display_unit" => match value.to_lowercase().as_str() {
                "mmol" | "mmol/l" => self.display_unit = GlucoseUnit::MmolL,
                "mgdl" | "mg/dl" => self.display_unit = GlucoseUnit::MgDl,
                _ => warn!("Invalid value '{}' for config key '{}', keeping default", value, key),
            },
            other => warn!("Ignoring unknown config key '{}'", other),
        }
    }

    /// Local time zone used for time-of-day bucketing
    pub fn utc_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| {
            warn!("utc_offset_minutes {} out of range, using UTC", self.utc_offset_minutes);
            Utc.fix()
        })
    }

    /// The user's personal target range
    pub fn personal_thresholds(&self) -> Thresholds {
        Thresholds::new(self.personal_low, self.personal_high)
    }

    /// Write a commented default configuration file
    pub fn create_default<P: AsRef<Path>>(path: P) -> Result<(), GlucoDashError> {
        let mut file = File::create(path)?;
        file.write_all(DEFAULT_CONFIG.as_bytes())?;
        Ok(())
    }
}

fn set_parsed<T: FromStr>(key: &str, value: &str, slot: &mut T) {
    match value.parse::<T>() {
        Ok(v) => *slot = v,
        Err(_) => warn!("Invalid value '{}' for config key '{}', keeping default", value, key),
    }
}

const DEFAULT_CONFIG: &str = "\
# glucodash configuration
# Format: key value   (anything after # is ignored)

# nightscout_url https://your-site.example.com
# api_secret     <sha1 hex of your API secret>

# Read entries.json / treatments.json / profile.json from a directory instead
# data_dir /path/to/export

cache_ttl_minutes        5
http_timeout_secs        30
utc_offset_minutes       0

dia_hours                4
carb_absorption_minutes  120

# Personal target range in mmol/L
personal_low             3.8
personal_high            5.5

# mmol or mgdl, for the summaries printed to stderr
display_unit             mmol
";

/// OS-specific data directory for glucodash
pub fn get_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

/// Create the data directory if needed
pub fn ensure_data_dir() -> std::io::Result<PathBuf> {
    let dir = get_data_dir();
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

pub fn config_file_path() -> PathBuf {
    get_data_dir().join("config.txt")
}

pub fn default_database_path() -> PathBuf {
    get_data_dir().join("cache.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.txt");
        fs::write(
            &path,
            "# comment\n\
             nightscout_url https://ns.example.com/   # trailing slash\n\
             dia_hours 5\n\
             utc_offset_minutes 60\n\
             personal_high notanumber\n\
             display_unit mg/dL\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.nightscout_url.as_deref(), Some("https://ns.example.com"));
        assert_eq!(config.dia_hours, 5.0);
        assert_eq!(config.utc_offset().local_minus_utc(), 3600);
        // Bad value keeps the default
        assert_eq!(config.personal_high, 5.5);
        assert_eq!(config.display_unit, GlucoseUnit::MgDl);
    }

    #[test]
    fn test_default_template_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.txt");
        Config::create_default(&path).unwrap();

        let config = Config::load(&path).unwrap();
        assert!(config.nightscout_url.is_none());
        assert_eq!(config.carb_absorption_minutes, 120.0);
        assert_eq!(config.cache_ttl_minutes, 5);
    }
}
