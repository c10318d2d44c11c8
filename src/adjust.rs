//! # Weather Adjustment
//!
//! Once per day the forecast nudges the ledger instead of the targets:
//!
//! - **Rain** credits each zone `target * rain_mm / 10` minutes, as if it had
//!   already watered (10 mm of rain covers a full day's target)
//! - **Heat** debits `heat_adjustment(max_temp) * target` minutes, so a hot
//!   day asks for up to twice the usual watering
//! - **Cold** does the opposite and credits time
//!
//! Whether today's adjustment already happened is recorded in the ledger
//! itself under the [`RAIN_SENSOR`] bucket, so a restart does not apply it
//! twice. Attempts are rate-limited to one per ten minutes regardless of
//! outcome, which keeps a failing provider from being hit every tick.

use crate::config::SchedulerConfig;
use crate::ledger::{from_minutes, Ledger, LedgerError};
use crate::weather::{forecast_summary, WeatherError, WeatherProvider};
use crate::RAIN_SENSOR;
use chrono::{DateTime, Duration, Local, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minimum spacing between adjustment attempts.
pub const ATTEMPT_INTERVAL_MINUTES: i64 = 10;

/// Forecast horizon used for the daily adjustment.
pub const FORECAST_HOURS: i64 = 24;

#[derive(Error, Debug)]
pub enum AdjustError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("forecast unavailable: {0}")]
    Weather(#[from] WeatherError),
}

/// Outcome of one adjustment attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Adjustment {
    /// Previous attempt was less than ten minutes ago
    TooSoon,
    /// The rain-sensor bucket already holds today's token
    AlreadyAppliedToday,
    /// Latitude or longitude is not set
    NotConfigured,
    /// Ledger was adjusted for every zone
    Applied,
}

/// Multiplier applied to a zone's target for a given maximum temperature.
///
/// Flat at the comfortable point, linear and capped above it, quadratic and
/// capped below it.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HeatCurve {
    /// Temperature with no adjustment, °C
    pub flat_celsius: f64,
    /// Degrees above `flat_celsius` per unit of extra watering
    pub hot_span: f64,
    /// Largest extra watering factor
    pub max_boost: f64,
    /// Degrees below `flat_celsius` that produce a unit cut
    pub cold_span: f64,
    /// Largest watering reduction factor
    pub max_cut: f64,
}

impl Default for HeatCurve {
    fn default() -> Self {
        HeatCurve {
            flat_celsius: 21.0,
            hot_span: 6.0,
            max_boost: 2.0,
            cold_span: 10.0,
            max_cut: 2.0,
        }
    }
}

impl HeatCurve {
    pub fn adjustment(&self, celsius: f64) -> f64 {
        if celsius >= self.flat_celsius {
            ((celsius - self.flat_celsius) / self.hot_span).min(self.max_boost)
        } else {
            let x = (self.flat_celsius - celsius) / self.cold_span;
            -(x * x).min(self.max_cut)
        }
    }
}

/// [`HeatCurve::adjustment`] with the default curve.
pub fn heat_adjustment(celsius: f64) -> f64 {
    HeatCurve::default().adjustment(celsius)
}

/// Rate-limited, once-per-day forecast adjustment of the ledger.
#[derive(Debug, Default)]
pub struct WeatherAdjuster {
    last_attempt: Option<DateTime<Local>>,
}

impl WeatherAdjuster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_attempt(&self) -> Option<DateTime<Local>> {
        self.last_attempt
    }

    pub fn apply(
        &mut self,
        config: &SchedulerConfig,
        ledger: &mut dyn Ledger,
        weather: &dyn WeatherProvider,
        now: DateTime<Local>,
    ) -> Result<Adjustment, AdjustError> {
        if let Some(last) = self.last_attempt {
            if now - last < Duration::minutes(ATTEMPT_INTERVAL_MINUTES) {
                return Ok(Adjustment::TooSoon);
            }
        }
        self.last_attempt = Some(now);

        let today = now.date_naive();
        if ledger.amount_watered(RAIN_SENSOR, today)? != Duration::zero() {
            return Ok(Adjustment::AlreadyAppliedToday);
        }

        let Some((lat, long)) = config.weather_location() else {
            return Ok(Adjustment::NotConfigured);
        };

        let forecast = forecast_summary(
            weather,
            lat,
            long,
            now.with_timezone(&Utc),
            FORECAST_HOURS,
        )?;
        let heat = config.heat.adjustment(forecast.max_temp_c);

        for zone in config.zone_order() {
            let target = config.zones[&zone].minutes as f64;
            let rain_delta = target * forecast.rain_mm / 10.0;
            let heat_delta = heat * target;
            let total = ledger.add_watered(&zone, today, from_minutes(rain_delta - heat_delta))?;
            tracing::debug!(zone = %zone, rain_delta, heat_delta, total = ?total, "adjusted zone");
        }

        let token = Duration::seconds(1) + from_minutes(forecast.rain_mm.max(0.0));
        ledger.add_watered(RAIN_SENSOR, today, token)?;
        tracing::info!(
            rain_mm = forecast.rain_mm,
            max_temp_c = forecast.max_temp_c,
            heat,
            "applied weather adjustment"
        );
        Ok(Adjustment::Applied)
    }
}
