//! Data sources: the Nightscout REST API, an offline JSON directory, and a
//! caching wrapper over either

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use log::{debug, info, warn};

use crate::basal::BasalProfile;
use crate::error::GlucoDashError;
use crate::model::{basal_segments_from_profile_json, GlucoseReading, TreatmentEvent};
use crate::storage::{CacheKey, Storage};

/// Upper bound on records per request; three months of 5-minute CGM data
/// is about 26k entries
const MAX_RECORDS: u32 = 100_000;

/// Time window of a fetch, inclusive start
pub type Window = (DateTime<Utc>, DateTime<Utc>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    Entries,
    Treatments,
    Profile,
}

impl FetchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FetchKind::Entries => "entries",
            FetchKind::Treatments => "treatments",
            FetchKind::Profile => "profile",
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            FetchKind::Entries => "entries.json",
            FetchKind::Treatments => "treatments.json",
            FetchKind::Profile => "profile.json",
        }
    }
}

/// Somewhere glucose entries, treatments and the basal profile can be read
/// from. Implementors only provide raw payloads; decoding and window
/// filtering are shared.
pub trait DataSource {
    /// Stable name, used to key cached fetches
    fn identity(&self) -> String;

    /// Raw upstream JSON for `kind`. `window` is `None` for the profile.
    fn fetch(&self, kind: FetchKind, window: Option<Window>) -> Result<String, GlucoDashError>;

    /// Sensor readings in `[start, end]`, oldest first
    fn entries(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<GlucoseReading>, GlucoDashError> {
        let payload = self.fetch(FetchKind::Entries, Some((start, end)))?;
        let mut readings = GlucoseReading::from_entries_json(&payload)?;
        readings.retain(|r| start <= r.timestamp && r.timestamp <= end);
        readings.sort_by_key(|r| r.timestamp);
        Ok(readings)
    }

    /// Treatments created in `[start, end)`, oldest first
    fn treatments(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<TreatmentEvent>, GlucoDashError> {
        let payload = self.fetch(FetchKind::Treatments, Some((start, end)))?;
        let mut treatments = TreatmentEvent::from_treatments_json(&payload)?;
        let total = treatments.len();
        treatments.retain(|t| t.created_at.is_some_and(|at| start <= at && at < end));
        if treatments.len() < total {
            debug!("{} treatments outside window or without created_at", total - treatments.len());
        }
        treatments.sort_by_key(|t| t.created_at);
        Ok(treatments)
    }

    fn basal_profile(&self) -> Result<BasalProfile, GlucoDashError> {
        let payload = self.fetch(FetchKind::Profile, None)?;
        Ok(BasalProfile::new(basal_segments_from_profile_json(&payload)?))
    }
}

fn iso(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Blocking client for a Nightscout site
pub struct NightscoutClient {
    base_url: String,
    api_secret: Option<String>,
    client: reqwest::blocking::Client,
}

impl NightscoutClient {
    /// `api_secret` is sent as-is in the `API-SECRET` header, so it must
    /// already be the hashed token
    pub fn new(base_url: &str, api_secret: Option<String>, timeout_secs: u64) -> Result<Self, GlucoDashError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_secret,
            client,
        })
    }

    fn endpoint(&self, kind: FetchKind) -> String {
        format!("{}/api/v1/{}", self.base_url, kind.file_name())
    }

    /// Query parameters for a fetch
    fn query(kind: FetchKind, window: Option<Window>) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some((start, end)) = window {
            match kind {
                FetchKind::Entries => {
                    params.push(("find[dateString][$gte]".to_string(), iso(start)));
                    params.push(("find[dateString][$lte]".to_string(), iso(end)));
                }
                FetchKind::Treatments => {
                    params.push(("find[created_at][$gte]".to_string(), iso(start)));
                    params.push(("find[created_at][$lt]".to_string(), iso(end)));
                }
                FetchKind::Profile => {}
            }
        }
        if kind != FetchKind::Profile {
            params.push(("count".to_string(), MAX_RECORDS.to_string()));
        }
        params
    }
}

impl DataSource for NightscoutClient {
    fn identity(&self) -> String {
        self.base_url.clone()
    }

    fn fetch(&self, kind: FetchKind, window: Option<Window>) -> Result<String, GlucoDashError> {
        let url = self.endpoint(kind);
        debug!("GET {} ({:?})", url, window);

        let mut request = self.client.get(&url).query(&Self::query(kind, window));
        if let Some(secret) = &self.api_secret {
            request = request.header("API-SECRET", secret);
        }

        let response = request.send().map_err(|e| {
            if e.is_timeout() {
                warn!("Request to {} timed out", url);
            }
            GlucoDashError::Http(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(GlucoDashError::Nightscout {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.text()?)
    }
}

/// Reads `entries.json`, `treatments.json` and `profile.json` exported from
/// a Nightscout site. A missing file reads as an empty list.
pub struct JsonDirSource {
    dir: PathBuf,
}

impl JsonDirSource {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self { dir: dir.as_ref().to_path_buf() }
    }
}

impl DataSource for JsonDirSource {
    fn identity(&self) -> String {
        format!("dir:{}", self.dir.display())
    }

    fn fetch(&self, kind: FetchKind, _window: Option<Window>) -> Result<String, GlucoDashError> {
        let path = self.dir.join(kind.file_name());
        match std::fs::read_to_string(&path) {
            Ok(payload) => Ok(payload),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("{} not found, treating as empty", path.display());
                Ok("[]".to_string())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Widen `window` outward to multiples of `step` so rolling windows that
/// end at "now" share a cache key until the next boundary
fn quantize(window: Window, step: Duration) -> Window {
    let step_ms = step.num_milliseconds().max(60_000);
    let (start, end) = window;
    let floor = start.timestamp_millis().div_euclid(step_ms) * step_ms;
    let ceil = end
        .timestamp_millis()
        .checked_add(step_ms - 1)
        .map(|ms| ms.div_euclid(step_ms) * step_ms);
    match (
        DateTime::<Utc>::from_timestamp_millis(floor),
        ceil.and_then(DateTime::<Utc>::from_timestamp_millis),
    ) {
        (Some(start), Some(end)) => (start, end),
        _ => window,
    }
}

/// Memoizes another source's payloads in SQLite for `ttl`. Windows are
/// widened to `ttl` boundaries before fetching; the typed accessors still
/// trim results to the requested window.
pub struct CachedSource<S> {
    inner: S,
    storage: Storage,
    ttl: Duration,
}

impl<S: DataSource> CachedSource<S> {
    pub fn new(inner: S, storage: Storage, ttl: Duration) -> Self {
        match storage.purge_older_than(Utc::now() - ttl) {
            Ok(0) => {}
            Ok(n) => debug!("Purged {} stale cache entries", n),
            Err(e) => warn!("Could not purge cache: {}", e),
        }
        Self { inner, storage, ttl }
    }
}

impl<S: DataSource> DataSource for CachedSource<S> {
    fn identity(&self) -> String {
        self.inner.identity()
    }

    fn fetch(&self, kind: FetchKind, window: Option<Window>) -> Result<String, GlucoDashError> {
        let source = self.inner.identity();
        let window = window.map(|w| quantize(w, self.ttl));
        let (start_ms, end_ms) = window
            .map(|(s, e)| (s.timestamp_millis(), e.timestamp_millis()))
            .unwrap_or((0, 0));
        let key = CacheKey {
            source: &source,
            kind: kind.as_str(),
            start_ms,
            end_ms,
        };

        let now = Utc::now();
        if let Some(payload) = self.storage.get(&key, now - self.ttl)? {
            debug!("Cache hit for {} {}", source, kind.as_str());
            return Ok(payload);
        }

        let payload = self.inner.fetch(kind, window)?;
        self.storage.put(&key, &payload, now)?;
        info!("Fetched {} from {} ({} bytes)", kind.as_str(), source, payload.len());
        Ok(payload)
    }
}
