//! # NOAA Weather Data and Rain Caching
//!
//! This module is the scheduler's window onto the weather. It fetches two
//! kinds of data from the National Weather Service API (`api.weather.gov`):
//!
//! - **Observations**: what actually fell at a reporting station, summed over
//!   a lookback window
//! - **Forecast**: gridded precipitation and temperature for a coordinate,
//!   summarised over the next hours
//!
//! ## Data Processing Pipeline
//! 1. **Resolve**: `/points/{lat},{long}` names the forecast grid for a coordinate
//! 2. **Fetch**: the grid document holds time-windowed value series
//! 3. **Window**: each `validTime` (`2024-06-15T10:00:00+00:00/PT1H`) becomes a start/end pair
//! 4. **Summarise**: rain is summed and temperature maxed over the windows touching the horizon
//!
//! ## Caching Strategy
//! Observations are cached per (station, lookback) for ten minutes in
//! [`RainCache`]. The cache lock is held across the network call so
//! concurrent callers wait for one fetch instead of issuing several.
//!
//! ## Offline Sentinel
//! The coordinate pair [`RAIN_MAGIC`]/[`RAIN_MAGIC`] never reaches the
//! network and always reports the same reading, which keeps tests and bench
//! setups deterministic.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use thiserror::Error;

/// NWS API root.
pub const NOAA_API: &str = "https://api.weather.gov";

/// Coordinate value that bypasses the provider when used for both lat and long.
pub const RAIN_MAGIC: &str = "rainMagic";

/// Rain reported for the sentinel coordinate, in millimetres.
pub const MAGIC_RAIN_MM: f64 = 5.0;

/// Maximum temperature reported for the sentinel coordinate, in °C.
pub const MAGIC_MAX_TEMP_C: f64 = 30.0;

/// How long a cached observation total stays valid.
pub const RAIN_CACHE_TTL: std::time::Duration = std::time::Duration::from_secs(10 * 60);

/// NWS rejects requests without an identifying agent.
const USER_AGENT: &str = concat!("sprinkler/", env!("CARGO_PKG_VERSION"));

/// Per-request timeout for the HTTP client.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Errors that can occur while fetching or interpreting weather data.
#[derive(Error, Debug)]
pub enum WeatherError {
    /// HTTP request failed (network, server, or protocol error)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Series is reported in a unit we do not convert
    #[error("unexpected unit {unit} for {series}")]
    Unit { series: &'static str, unit: String },

    /// A `validTime` interval could not be parsed
    #[error("invalid time window [{0}]")]
    TimeWindow(String),

    /// The forecast holds no values for the requested horizon
    #[error("forecast has no {0} data")]
    MissingData(&'static str),

    /// Provider-specific failure
    #[error("weather provider: {0}")]
    Provider(String),
}

/// One station observation.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    /// Precipitation during the hour before `timestamp`, when reported
    pub precipitation_last_hour_mm: Option<f64>,
}

/// A value that holds over a time window.
#[derive(Clone, Debug, PartialEq)]
pub struct TimedValue {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub value: f64,
}

/// Gridded forecast series for one coordinate.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Forecast {
    /// Precipitation amount per window, millimetres
    pub precipitation_mm: Vec<TimedValue>,
    /// Temperature per window, °C
    pub temperature_c: Vec<TimedValue>,
}

impl Forecast {
    fn within(
        series: &[TimedValue],
        now: DateTime<Utc>,
        hours: i64,
    ) -> impl Iterator<Item = &TimedValue> {
        let horizon = now + Duration::hours(hours);
        series
            .iter()
            .filter(move |v| v.start < horizon && v.end > now)
    }

    /// Total precipitation in windows overlapping `[now, now + hours)`.
    pub fn rain_within(&self, now: DateTime<Utc>, hours: i64) -> f64 {
        Self::within(&self.precipitation_mm, now, hours)
            .map(|v| v.value)
            .sum()
    }

    /// Highest temperature in windows overlapping `[now, now + hours)`.
    pub fn max_temperature_within(&self, now: DateTime<Utc>, hours: i64) -> Option<f64> {
        Self::within(&self.temperature_c, now, hours)
            .map(|v| v.value)
            .fold(None, |max, t| Some(max.map_or(t, |m: f64| m.max(t))))
    }
}

/// The two numbers the weather adjustment needs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ForecastSummary {
    pub rain_mm: f64,
    pub max_temp_c: f64,
}

/// Source of weather observations and forecasts.
pub trait WeatherProvider: Send + Sync {
    /// Recent observations reported by `station`.
    fn observations(&self, station: &str) -> Result<Vec<Observation>, WeatherError>;

    /// Forecast series for a coordinate.
    fn forecast(&self, lat: &str, long: &str) -> Result<Forecast, WeatherError>;
}

/// Summarise the next `hours` of forecast for a coordinate.
///
/// The [`RAIN_MAGIC`] pair returns a fixed reading without calling `provider`.
pub fn forecast_summary(
    provider: &dyn WeatherProvider,
    lat: &str,
    long: &str,
    now: DateTime<Utc>,
    hours: i64,
) -> Result<ForecastSummary, WeatherError> {
    if lat == RAIN_MAGIC && long == RAIN_MAGIC {
        return Ok(ForecastSummary {
            rain_mm: MAGIC_RAIN_MM,
            max_temp_c: MAGIC_MAX_TEMP_C,
        });
    }

    let forecast = provider.forecast(lat, long)?;
    let max_temp_c = forecast
        .max_temperature_within(now, hours)
        .ok_or(WeatherError::MissingData("temperature"))?;
    Ok(ForecastSummary {
        rain_mm: forecast.rain_within(now, hours),
        max_temp_c,
    })
}

/// Precipitation observed within the last `hours` before `now`.
pub fn total_rain(observations: &[Observation], now: DateTime<Utc>, hours: u32) -> f64 {
    let since = now - Duration::hours(hours as i64);
    observations
        .iter()
        .filter(|o| o.timestamp >= since)
        .filter_map(|o| o.precipitation_last_hour_mm)
        .sum()
}

// -- NOAA client --

/// Weather provider backed by the NWS API.
///
/// Uses a blocking client; call it from a blocking context.
pub struct NoaaClient {
    http: reqwest::blocking::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ObservationCollection {
    features: Vec<ObservationFeature>,
}

#[derive(Deserialize)]
struct ObservationFeature {
    properties: ObservationProperties,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObservationProperties {
    timestamp: DateTime<Utc>,
    precipitation_last_hour: Option<QuantitativeValue>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuantitativeValue {
    #[serde(default)]
    unit_code: Option<String>,
    value: Option<f64>,
}

#[derive(Deserialize)]
struct PointResponse {
    properties: PointProperties,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PointProperties {
    forecast_grid_data: String,
}

#[derive(Deserialize)]
struct GridResponse {
    properties: GridProperties,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GridProperties {
    temperature: GridSeries,
    quantitative_precipitation: GridSeries,
}

#[derive(Deserialize)]
struct GridSeries {
    uom: String,
    values: Vec<GridValue>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GridValue {
    valid_time: String,
    value: Option<f64>,
}

impl NoaaClient {
    /// Client for the public NWS API.
    pub fn new() -> Result<Self, WeatherError> {
        Self::with_base_url(NOAA_API)
    }

    /// Client for an NWS-compatible API at `base_url`.
    pub fn with_base_url(base_url: &str) -> Result<Self, WeatherError> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(NoaaClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, WeatherError> {
        tracing::debug!(url, "fetching weather data");
        Ok(self
            .http
            .get(url)
            .header(reqwest::header::ACCEPT, "application/geo+json")
            .send()?
            .error_for_status()?
            .json()?)
    }
}

impl WeatherProvider for NoaaClient {
    fn observations(&self, station: &str) -> Result<Vec<Observation>, WeatherError> {
        let url = format!("{}/stations/{}/observations", self.base_url, station);
        let resp: ObservationCollection = self.get_json(&url)?;

        resp.features
            .into_iter()
            .map(|f| {
                let precip = f.properties.precipitation_last_hour;
                if let Some(unit) = precip.as_ref().and_then(|p| p.unit_code.as_deref()) {
                    if unit != "wmoUnit:mm" {
                        return Err(WeatherError::Unit {
                            series: "precipitationLastHour",
                            unit: unit.to_string(),
                        });
                    }
                }
                Ok(Observation {
                    timestamp: f.properties.timestamp,
                    precipitation_last_hour_mm: precip.and_then(|p| p.value),
                })
            })
            .collect()
    }

    fn forecast(&self, lat: &str, long: &str) -> Result<Forecast, WeatherError> {
        let point: PointResponse =
            self.get_json(&format!("{}/points/{},{}", self.base_url, lat, long))?;
        let grid: GridResponse = self.get_json(&point.properties.forecast_grid_data)?;
        grid_to_forecast(grid.properties)
    }
}

fn grid_to_forecast(grid: GridProperties) -> Result<Forecast, WeatherError> {
    if grid.quantitative_precipitation.uom != "wmoUnit:mm" {
        return Err(WeatherError::Unit {
            series: "quantitativePrecipitation",
            unit: grid.quantitative_precipitation.uom,
        });
    }
    let to_celsius: fn(f64) -> f64 = match grid.temperature.uom.as_str() {
        "wmoUnit:degC" => |c| c,
        "wmoUnit:degF" => |f| (f - 32.0) / 1.8,
        _ => {
            return Err(WeatherError::Unit {
                series: "temperature",
                unit: grid.temperature.uom.clone(),
            })
        }
    };

    Ok(Forecast {
        precipitation_mm: series_values(&grid.quantitative_precipitation.values, |v| v)?,
        temperature_c: series_values(&grid.temperature.values, to_celsius)?,
    })
}

fn series_values(
    values: &[GridValue],
    convert: impl Fn(f64) -> f64,
) -> Result<Vec<TimedValue>, WeatherError> {
    values
        .iter()
        .filter_map(|v| v.value.map(|value| (v, value)))
        .map(|(v, value)| {
            let (start, end) = parse_valid_time(&v.valid_time)
                .ok_or_else(|| WeatherError::TimeWindow(v.valid_time.clone()))?;
            Ok(TimedValue {
                start,
                end,
                value: convert(value),
            })
        })
        .collect()
}

/// Parse an ISO-8601 `start/duration` interval such as `2024-06-15T10:00:00+00:00/PT1H`.
pub fn parse_valid_time(raw: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let (start, duration) = raw.split_once('/')?;
    let start = DateTime::parse_from_rfc3339(start).ok()?.with_timezone(&Utc);
    Some((start, start + parse_iso_duration(duration)?))
}

/// Parse the `PnWnDTnHnMnS` subset of ISO-8601 durations used by NWS.
pub fn parse_iso_duration(raw: &str) -> Option<Duration> {
    let rest = raw.strip_prefix('P')?;
    let (date, time) = rest.split_once('T').unwrap_or((rest, ""));
    const DATE_UNITS: &[(char, i64)] = &[('W', 7 * 86_400), ('D', 86_400)];
    const TIME_UNITS: &[(char, i64)] = &[('H', 3_600), ('M', 60), ('S', 1)];

    let mut total = Duration::zero();
    let mut any = false;
    for (part, units) in [(date, DATE_UNITS), (time, TIME_UNITS)] {
        let mut digits = String::new();
        for c in part.chars() {
            if c.is_ascii_digit() {
                digits.push(c);
                continue;
            }
            let secs = units.iter().find(|(u, _)| *u == c)?.1;
            let n: i64 = digits.parse().ok()?;
            digits.clear();
            total += Duration::seconds(n * secs);
            any = true;
        }
        if !digits.is_empty() {
            return None;
        }
    }
    any.then_some(total)
}

// -- Rain cache --

struct CacheEntry {
    total_mm: f64,
    fetched: Instant,
}

/// Ten-minute memo of observed rain per (station, lookback hours).
///
/// All access, including the fetch itself, is serialized by one lock.
pub struct RainCache {
    provider: Arc<dyn WeatherProvider>,
    ttl: std::time::Duration,
    entries: Mutex<HashMap<(String, u32), CacheEntry>>,
}

impl RainCache {
    pub fn new(provider: Arc<dyn WeatherProvider>) -> Self {
        Self::with_ttl(provider, RAIN_CACHE_TTL)
    }

    pub fn with_ttl(provider: Arc<dyn WeatherProvider>, ttl: std::time::Duration) -> Self {
        RainCache {
            provider,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Observed rain at `station` over the last `hours`, in millimetres.
    pub fn rain(&self, station: &str, hours: u32) -> Result<f64, WeatherError> {
        self.rain_at(station, hours, Instant::now())
    }

    /// As [`RainCache::rain`], judging freshness against `now`.
    pub fn rain_at(&self, station: &str, hours: u32, now: Instant) -> Result<f64, WeatherError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (station.to_string(), hours);

        if let Some(entry) = entries.get(&key) {
            if now.saturating_duration_since(entry.fetched) < self.ttl {
                return Ok(entry.total_mm);
            }
        }

        let observations = self.provider.observations(station)?;
        let total_mm = total_rain(&observations, Utc::now(), hours);
        tracing::info!(station, hours, total_mm, "observed rain");

        entries.insert(
            key,
            CacheEntry {
                total_mm,
                fetched: now,
            },
        );
        Ok(total_mm)
    }

    /// Number of cached (station, lookback) entries.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// -- Static provider --

/// Provider that serves fixed data and counts calls.
#[derive(Default)]
pub struct StaticWeather {
    pub forecast: Forecast,
    pub observations: Vec<Observation>,
    /// Fail every call with this message
    pub failure: Option<String>,
    /// Sleep before answering
    pub delay: Option<std::time::Duration>,
    forecast_calls: AtomicUsize,
    observation_calls: AtomicUsize,
}

impl StaticWeather {
    /// Provider whose forecast is constant rain and temperature for the next day.
    pub fn steady(rain_mm: f64, temp_c: f64, now: DateTime<Utc>) -> Self {
        let window = |value| TimedValue {
            start: now,
            end: now + Duration::hours(24),
            value,
        };
        StaticWeather {
            forecast: Forecast {
                precipitation_mm: vec![window(rain_mm)],
                temperature_c: vec![window(temp_c)],
            },
            ..Default::default()
        }
    }

    /// Provider that fails every call.
    pub fn failing(message: &str) -> Self {
        StaticWeather {
            failure: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn forecast_calls(&self) -> usize {
        self.forecast_calls.load(Ordering::SeqCst)
    }

    pub fn observation_calls(&self) -> usize {
        self.observation_calls.load(Ordering::SeqCst)
    }

    fn answer<T: Clone>(&self, value: &T) -> Result<T, WeatherError> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        match &self.failure {
            Some(msg) => Err(WeatherError::Provider(msg.clone())),
            None => Ok(value.clone()),
        }
    }
}

impl WeatherProvider for StaticWeather {
    fn observations(&self, _station: &str) -> Result<Vec<Observation>, WeatherError> {
        self.observation_calls.fetch_add(1, Ordering::SeqCst);
        self.answer(&self.observations)
    }

    fn forecast(&self, _lat: &str, _long: &str) -> Result<Forecast, WeatherError> {
        self.forecast_calls.fetch_add(1, Ordering::SeqCst);
        self.answer(&self.forecast)
    }
}
