//! glucodash: diabetes dashboard metrics from Nightscout data
//!
//! Fetches CGM entries, treatments and the basal profile from a Nightscout
//! site (or an exported JSON directory) and prints the derived metrics as
//! JSON on stdout.
//!
//! Usage:
//!   glucodash current               - Latest sensor reading
//!   glucodash report [range]        - Full report (today, yesterday, 1w, 1m, 3m)
//!   glucodash convert percent 7.0   - HbA1c / glucose unit conversion
//!   glucodash convert weight 62 45  - Carbs in 45 g of a 62 g/100 g food
//!   glucodash --help                - Show help
//!   GLUCODASH_DBG=1 glucodash report - Enable debug output

mod agp;
mod aggregate;
mod basal;
mod config;
mod decay;
mod error;
mod model;
mod nightscout;
mod report;
mod stats;
mod storage;
mod tir;
mod units;

use std::env;

use chrono::{Duration, NaiveDate, Utc};
use log::{info, warn};
use serde::Serialize;
use serde_json::json;

use crate::aggregate::{manual_hypo_treatments, DateRange};
use crate::agp::{compute_agp, hourly_percentiles};
use crate::config::{config_file_path, default_database_path, ensure_data_dir, get_data_dir, Config};
use crate::decay::{compute_cob, compute_iob};
use crate::error::GlucoDashError;
use crate::nightscout::{CachedSource, DataSource, JsonDirSource, NightscoutClient};
use crate::report::{BasalReport, DayReport, RangeData, Report, ReportSettings};
use crate::storage::Storage;
use crate::tir::{compute_time_in_range_multi, GlucoseRange};
use crate::units::{
    a1c_percent_to_average_glucose, carbs_for_portion, carbs_for_weight, mgdl_to_mmol_display,
    mmol_mol_to_percent, mmol_to_mgdl, parse_fraction, percent_to_mmol_mol, round_to,
};

/// How far back `iob` and `cob` look for treatments
const RECENT_TREATMENT_HOURS: i64 = 24;

/// How far back `current` looks for a sensor reading
const CURRENT_READING_HOURS: i64 = 3;

fn main() -> Result<(), GlucoDashError> {
    let args: Vec<String> = env::args().collect();

    // Check for debug mode
    let debug_mode = env::var("GLUCODASH_DBG").is_ok();

    // Initialize logger
    if debug_mode {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp(None)
            .init();
    }

    // Ensure data directory exists
    if let Err(e) = ensure_data_dir() {
        eprintln!("Warning: Could not create data directory: {}", e);
    }

    // Create default config if it doesn't exist
    let cfg_path = config_file_path();
    if !cfg_path.exists() {
        if let Err(e) = Config::create_default(&cfg_path) {
            warn!("Could not create default config: {}", e);
        }
    }

    // Try loading config from data directory first, then current directory
    let config = Config::load(config_file_path())
        .or_else(|_| Config::load("config.txt"))
        .unwrap_or_else(|e| {
            warn!("Could not load config: {}. Using defaults.", e);
            Config::default()
        });

    let command = args.get(1).map(|s| s.as_str());
    let arg = args.get(2).map(|s| s.as_str());

    match command {
        Some("current") => cmd_current(&config)?,
        Some("report") => cmd_report(&config, parse_range(arg)?)?,
        Some("agp") => cmd_agp(&config, parse_range(arg)?)?,
        Some("tir") => cmd_tir(&config, parse_range(arg)?)?,
        Some("iob") => cmd_iob(&config)?,
        Some("cob") => cmd_cob(&config)?,
        Some("basal") => cmd_basal(&config, parse_range(arg)?)?,
        Some("day") => cmd_day(&config, arg)?,
        Some("hypos") => cmd_hypos(&config, parse_range(arg)?)?,
        Some("convert") => cmd_convert(arg, &args[args.len().min(3)..])?,
        Some("path") | Some("paths") => cmd_show_paths(&config),
        Some("--version") | Some("-V") => {
            println!("glucodash {}", env!("CARGO_PKG_VERSION"));
        }
        Some("--help") | Some("-h") | Some("help") | None => print_help(),
        Some(other) => {
            print_help();
            return Err(GlucoDashError::InvalidArgument(format!("unknown command '{}'", other)));
        }
    }

    Ok(())
}

fn parse_range(arg: Option<&str>) -> Result<DateRange, GlucoDashError> {
    arg.unwrap_or("today").parse()
}

/// Offline directory if configured, otherwise the cached Nightscout site
fn open_source(config: &Config) -> Result<Box<dyn DataSource>, GlucoDashError> {
    if let Some(dir) = &config.data_dir {
        info!("Reading data from {}", dir);
        return Ok(Box::new(JsonDirSource::new(dir)));
    }

    let Some(url) = &config.nightscout_url else {
        return Err(GlucoDashError::Config(format!(
            "set nightscout_url or data_dir in {}",
            config_file_path().display()
        )));
    };

    let client = NightscoutClient::new(url, config.api_secret.clone(), config.http_timeout_secs)?;
    let db_path = config
        .database_path
        .clone()
        .unwrap_or_else(|| default_database_path().to_string_lossy().to_string());

    match Storage::new(&db_path) {
        Ok(storage) => Ok(Box::new(CachedSource::new(
            client,
            storage,
            Duration::minutes(config.cache_ttl_minutes),
        ))),
        Err(e) => {
            warn!("Cache unavailable ({}), fetching directly", e);
            Ok(Box::new(client))
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), GlucoDashError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_current(config: &Config) -> Result<(), GlucoDashError> {
    let source = open_source(config)?;
    let now = Utc::now();
    let readings = source.entries(now - Duration::hours(CURRENT_READING_HOURS), now)?;
    let Some(latest) = readings.iter().rev().find(|r| r.is_valid()) else {
        eprintln!("No sensor reading in the last {} hours", CURRENT_READING_HOURS);
        return print_json(&serde_json::Value::Null);
    };

    let minutes_ago = (now - latest.timestamp).num_minutes();
    let unit = config.display_unit;
    eprintln!("{} {} ({} min ago)", unit.format(latest.value_mgdl), latest.direction.arrow(), minutes_ago);
    print_json(&json!({
        "timestamp": latest.timestamp,
        "mgdl": latest.value_mgdl,
        "mmol": mgdl_to_mmol_display(latest.value_mgdl),
        "direction": latest.direction,
        "arrow": latest.direction.arrow(),
        "minutes_ago": minutes_ago,
        "display": unit.format(latest.value_mgdl),
        "unit": unit.label(),
    }))
}

fn cmd_report(config: &Config, range: DateRange) -> Result<(), GlucoDashError> {
    let source = open_source(config)?;
    let settings = ReportSettings::from_config(config);
    let report = Report::generate(source.as_ref(), &settings, range, Utc::now())?;

    let unit = config.display_unit;
    eprintln!("Report for {} ({} to {})", range.key(), report.start, report.end);
    match (&report.glucose, &report.gmi) {
        (Some(stats), Some(gmi)) => {
            let (lo, hi) = stats.confidence_interval_95();
            eprintln!(
                "  Mean glucose:    {} (95% CI {:.1}-{:.1} mmol/L), {} readings",
                stats.format_mean(unit),
                lo,
                hi,
                stats.count
            );
            eprintln!(
                "  Variability:     CV {:.0}% ({})",
                stats.cv,
                if stats.is_stable() { "stable" } else { "unstable" }
            );
            eprintln!("  Est. HbA1c:      {:.1}% / {:.1} mmol/mol", gmi.a1c_percent, gmi.a1c_mmol_mol);
        }
        _ => eprintln!("  Mean glucose:    no data"),
    }
    for tir in &report.time_in_range {
        eprintln!(
            "  {:<16} {:.0}% in range, {:.0}% below, {:.0}% above",
            tir.thresholds.format_range(),
            tir.in_pct,
            tir.below_pct,
            tir.above_pct
        );
    }
    eprintln!("  IOB / COB:       {:.2} U / {:.0} g", report.iob, report.cob);
    if report.period.has_insulin_data() {
        eprintln!(
            "  Insulin:         {:.2} U basal + {:.2} U bolus",
            report.period.total_basal, report.period.total_bolus
        );
    }
    if report.period.has_carb_data() {
        eprintln!(
            "  Carbs:           {:.0} g (+{:.0} g protein/fat)",
            report.period.total_carbs, report.period.protein_carbs
        );
    }
    if range.shows_averages() {
        eprintln!(
            "  Per day:         {:.0} g carbs, {:.1} U insulin",
            report.period.avg_carbs_per_day, report.period.avg_daily_insulin
        );
    }

    print_json(&report)
}

fn cmd_agp(config: &Config, range: DateRange) -> Result<(), GlucoDashError> {
    let source = open_source(config)?;
    let offset = config.utc_offset();
    let (start, end) = range.window(Utc::now(), &offset);
    let readings = source.entries(start, end)?;

    let agp = compute_agp(&readings, &offset);
    eprintln!("AGP from {} readings in {} buckets", readings.len(), agp.labels.len());
    print_json(&json!({
        "range": range.key(),
        "agp": agp,
        "smoothed": agp.resampled(),
        "hourly": hourly_percentiles(&readings, &offset),
    }))
}

fn cmd_tir(config: &Config, range: DateRange) -> Result<(), GlucoDashError> {
    let source = open_source(config)?;
    let settings = ReportSettings::from_config(config);
    let (start, end) = range.window(Utc::now(), &settings.offset);
    let readings = source.entries(start, end)?;

    let results = compute_time_in_range_multi(&readings, &settings.thresholds());
    for tir in &results {
        eprintln!("{} ({} readings)", tir.thresholds.format_range(), tir.total);
        for band in [GlucoseRange::Below, GlucoseRange::InRange, GlucoseRange::Above] {
            eprintln!("  {:<18} {:>5.1}%", band.label(), tir.percentage(band));
        }
    }
    print_json(&results)
}

fn cmd_iob(config: &Config) -> Result<(), GlucoDashError> {
    let source = open_source(config)?;
    let now = Utc::now();
    let treatments = source.treatments(now - Duration::hours(RECENT_TREATMENT_HOURS), now)?;
    let iob = compute_iob(&treatments, now, config.dia_hours);

    eprintln!("Insulin on board: {:.2} U", iob);
    print_json(&json!({ "as_of": now, "dia_hours": config.dia_hours, "iob": round_to(iob, 2) }))
}

fn cmd_cob(config: &Config) -> Result<(), GlucoDashError> {
    let source = open_source(config)?;
    let now = Utc::now();
    let treatments = source.treatments(now - Duration::hours(RECENT_TREATMENT_HOURS), now)?;
    let cob = compute_cob(&treatments, now, config.carb_absorption_minutes);

    eprintln!("Carbs on board: {:.0} g", cob);
    print_json(&json!({
        "as_of": now,
        "absorption_minutes": config.carb_absorption_minutes,
        "cob": round_to(cob, 1),
    }))
}

fn cmd_basal(config: &Config, range: DateRange) -> Result<(), GlucoDashError> {
    let source = open_source(config)?;
    let offset = config.utc_offset();
    let now = Utc::now();
    let (start, end) = range.window(now, &offset);
    let data = RangeData::fetch(source.as_ref(), start, end)?;

    let report = BasalReport::from_data(&data, start, end, now, &offset);
    for segment in data.profile.segments() {
        eprintln!("  {}  {:.2} U/h", segment.start_label(), segment.rate_per_hour);
    }
    eprintln!(
        "Basal delivered: {:.2} U in {} segments (schedule {:.2} U/day)",
        report.total,
        report.segments.len(),
        report.scheduled_daily_total
    );
    print_json(&report)
}

fn cmd_day(config: &Config, date: Option<&str>) -> Result<(), GlucoDashError> {
    let settings = ReportSettings::from_config(config);
    let now = Utc::now();
    let date = match date {
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|e| GlucoDashError::InvalidArgument(format!("date '{}': {}", s, e)))?,
        None => now.with_timezone(&settings.offset).date_naive(),
    };

    let source = open_source(config)?;
    let report = DayReport::generate(source.as_ref(), &settings, date, now)?;
    eprintln!(
        "{}: {:.1} U insulin, {:.0} g carbs",
        date, report.totals.total_insulin, report.totals.total_carbs
    );
    print_json(&report)
}

fn cmd_hypos(config: &Config, range: DateRange) -> Result<(), GlucoDashError> {
    let source = open_source(config)?;
    let (start, end) = range.window(Utc::now(), &config.utc_offset());
    let hypos = manual_hypo_treatments(&source.treatments(start, end)?);

    eprintln!("{} manually logged hypo treatments", hypos.len());
    print_json(&hypos)
}

fn parse_number(raw: Option<&String>) -> Result<f64, GlucoDashError> {
    let raw = raw.ok_or_else(|| GlucoDashError::InvalidArgument("convert needs a value".to_string()))?;
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(GlucoDashError::InvalidArgument(format!("'{}' is not a number", raw))),
    }
}

fn cmd_convert(kind: Option<&str>, values: &[String]) -> Result<(), GlucoDashError> {
    let value = parse_number(values.first())?;

    let result = match kind {
        Some("percent") => json!({
            "percent": value,
            "mmol_mol": round_to(percent_to_mmol_mol(value), 1),
            "average_glucose_mmol": round_to(a1c_percent_to_average_glucose(value), 1),
        }),
        Some("mmolmol") => json!({
            "mmol_mol": value,
            "percent": round_to(mmol_mol_to_percent(value), 1),
        }),
        Some("mgdl") => json!({ "mgdl": value, "mmol": mgdl_to_mmol_display(value) }),
        Some("mmol") => json!({ "mmol": value, "mgdl": round_to(mmol_to_mgdl(value), 0) }),
        Some("weight") => {
            let grams = parse_number(values.get(1))?;
            if value < 0.0 || grams < 0.0 {
                return Err(GlucoDashError::InvalidArgument("carbs and weight must not be negative".to_string()));
            }
            json!({
                "carbs_per_100g": value,
                "weight_g": grams,
                "carbs": round_to(carbs_for_weight(value, grams), 1),
            })
        }
        Some("portion") => {
            let raw = values.get(1).map(|s| s.as_str()).unwrap_or("1/2");
            let fraction = parse_fraction(raw).ok_or_else(|| {
                GlucoDashError::InvalidArgument(format!("'{}' is not a fraction between 0 and 1", raw))
            })?;
            if value < 0.0 {
                return Err(GlucoDashError::InvalidArgument("carbs must not be negative".to_string()));
            }
            json!({
                "item_carbs": value,
                "fraction": fraction,
                "carbs": round_to(carbs_for_portion(value, fraction), 1),
            })
        }
        other => {
            return Err(GlucoDashError::InvalidArgument(format!(
                "unknown conversion '{}', expected percent, mmolmol, mgdl, mmol, weight or portion",
                other.unwrap_or("")
            )))
        }
    };
    print_json(&result)
}

/// Show data paths
fn cmd_show_paths(config: &Config) {
    println!("glucodash data paths:");
    println!("  Data directory:  {}", get_data_dir().display());
    println!("  Cache database:  {}", default_database_path().display());
    println!("  Config file:     {}", config_file_path().display());

    let db_path = config
        .database_path
        .clone()
        .unwrap_or_else(|| default_database_path().to_string_lossy().to_string());
    if let Ok(count) = Storage::new(&db_path).and_then(|s| s.count()) {
        println!("  Cached fetches:  {}", count);
    }
}

fn print_help() {
    eprintln!("glucodash v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("  glucodash current              Latest sensor reading");
    eprintln!("  glucodash report [range]       Every metric for a range");
    eprintln!("  glucodash agp [range]          Ambulatory glucose profile");
    eprintln!("  glucodash tir [range]          Time in range (clinical and personal)");
    eprintln!("  glucodash iob                  Insulin on board now");
    eprintln!("  glucodash cob                  Carbs on board now");
    eprintln!("  glucodash basal [range]        Basal delivery timeline");
    eprintln!("  glucodash day [YYYY-MM-DD]     Hourly carbs and insulin for a day");
    eprintln!("  glucodash hypos [range]        Manually logged hypo treatments");
    eprintln!("  glucodash convert <unit> <v>   Convert percent, mmolmol, mgdl or mmol");
    eprintln!("  glucodash convert weight <c> <g>    Carbs in g grams at c per 100 g");
    eprintln!("  glucodash convert portion <c> [f]   Carbs in a fraction (0.5, 1/3) of an item");
    eprintln!("  glucodash path                 Show data file locations");
    eprintln!("  glucodash help                 Show this help");
    eprintln!();
    eprintln!("RANGES:");
    eprintln!("  today (default), yesterday, 1w, 1m, 3m");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("  GLUCODASH_DBG=1                Enable debug output");
    eprintln!();
    eprintln!("DATA LOCATIONS:");
    eprintln!("  Cache:   {}", default_database_path().display());
    eprintln!("  Config:  {}", config_file_path().display());
}
