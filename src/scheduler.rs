//! # Tick-Driven Zone Scheduler
//!
//! [`Scheduler::tick`] is the whole control loop in one synchronous call.
//! Each tick, in order:
//!
//! 1. **Accrue**: the zone that was running since the previous tick is
//!    credited with the elapsed time, whatever the reason it ran
//! 2. **Weather**: the [`WeatherAdjuster`] gets a chance to run; failures are
//!    logged and the tick carries on
//! 3. **Forced**: an active forced run wins over everything else
//! 4. **Paused**: an active pause runs nothing
//! 5. **Window**: nothing runs before 01:00 or before the configured start hour
//! 6. **Normal**: the first zone in order still below today's target
//! 7. **Actuate**: only when the selection changed (or the last pass failed)
//!
//! Runtime state and the ledger live behind one mutex that commands and
//! queries share with the tick. Pins are driven after the lock is released,
//! so a slow valve never blocks a readings query.

use crate::adjust::{Adjustment, WeatherAdjuster};
use crate::board::{Board, BoardError, Pin};
use crate::command::{checked_minutes, Command, CommandError, CommandResponse};
use crate::config::SchedulerConfig;
use crate::ledger::{minutes, Ledger, LedgerError};
use crate::weather::{RainCache, WeatherError, WeatherProvider};
use crate::{Readings, ZoneReading, RAIN_SENSOR};
use chrono::{DateTime, Duration, Local, NaiveDate, Timelike};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Lookback window of the observed-rain reading.
pub const OBSERVED_RAIN_HOURS: u32 = 24;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Board(#[from] BoardError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Weather(#[from] WeatherError),
}

struct State {
    running: Option<String>,
    last_tick: Option<DateTime<Local>>,
    pause_until: Option<DateTime<Local>>,
    force_zone: Option<String>,
    force_until: Option<DateTime<Local>>,
    /// Set until an actuation pass completes; starts set so the first tick
    /// drives every pin to a known level
    needs_actuation: bool,
    adjuster: WeatherAdjuster,
    ledger: Box<dyn Ledger>,
}

impl State {
    fn forced_zone(&self, now: DateTime<Local>) -> Option<&str> {
        match (self.force_zone.as_deref(), self.force_until) {
            (Some(zone), Some(until)) if now < until => Some(zone),
            _ => None,
        }
    }

    fn paused_until(&self, now: DateTime<Local>) -> Option<DateTime<Local>> {
        self.pause_until.filter(|until| now < *until)
    }
}

pub struct Scheduler {
    config: Arc<SchedulerConfig>,
    pins: BTreeMap<String, Arc<dyn Pin>>,
    weather: Arc<dyn WeatherProvider>,
    rain_cache: RainCache,
    state: Mutex<State>,
}

impl Scheduler {
    /// Build a scheduler, resolving every zone's pin on `board`.
    pub fn new(
        config: SchedulerConfig,
        board: &dyn Board,
        ledger: Box<dyn Ledger>,
        weather: Arc<dyn WeatherProvider>,
    ) -> Result<Self, SchedulerError> {
        let mut pins = BTreeMap::new();
        for (name, zone) in &config.zones {
            pins.insert(name.clone(), board.pin_by_name(&zone.pin)?);
        }

        Ok(Scheduler {
            config: Arc::new(config),
            pins,
            rain_cache: RainCache::new(weather.clone()),
            weather,
            state: Mutex::new(State {
                running: None,
                last_tick: None,
                pause_until: None,
                force_zone: None,
                force_until: None,
                needs_actuation: true,
                adjuster: WeatherAdjuster::new(),
                ledger,
            }),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Zone commanded on by the most recent tick.
    pub fn running(&self) -> Option<String> {
        self.lock().running.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one scheduling step at `now` and return the selected zone.
    ///
    /// Calls must not overlap; the runner serializes them.
    pub fn tick(&self, now: DateTime<Local>) -> Result<Option<String>, SchedulerError> {
        let today = now.date_naive();
        let mut state = self.lock();

        if let (Some(zone), Some(last)) = (state.running.clone(), state.last_tick) {
            let elapsed = now - last;
            if elapsed > Duration::zero() {
                state.ledger.add_watered(&zone, today, elapsed)?;
            }
        }
        state.last_tick = Some(now);

        let State {
            adjuster, ledger, ..
        } = &mut *state;
        match adjuster.apply(&self.config, ledger.as_mut(), self.weather.as_ref(), now) {
            Ok(Adjustment::TooSoon) => {}
            Ok(outcome) => tracing::debug!(?outcome, "weather step"),
            Err(e) => tracing::warn!(error = %e, "cannot apply weather adjustment"),
        }

        let selected = if let Some(zone) = state.forced_zone(now) {
            Some(zone.to_string())
        } else if state.paused_until(now).is_some() {
            None
        } else if now.hour() < 1 || now.hour() < self.config.start_hour {
            None
        } else {
            next_zone(&self.config, state.ledger.as_ref(), today)?
        };

        let previous = std::mem::replace(&mut state.running, selected.clone());
        let actuate = previous != selected || state.needs_actuation;
        state.needs_actuation = actuate;
        drop(state);

        if actuate {
            tracing::info!(from = ?previous, to = ?selected, "switching zones");
            self.stop_all_except(selected.as_deref())?;
            self.lock().needs_actuation = false;
        }
        Ok(selected)
    }

    /// Drive every zone off except `keep`, which is driven on last.
    fn stop_all_except(&self, keep: Option<&str>) -> Result<(), BoardError> {
        for (name, pin) in &self.pins {
            if Some(name.as_str()) != keep {
                set_level(pin.as_ref(), false)?;
            }
        }
        if let Some(pin) = keep.and_then(|zone| self.pins.get(zone)) {
            set_level(pin.as_ref(), true)?;
        }
        Ok(())
    }

    pub fn order(&self) -> Vec<String> {
        self.config.zone_order()
    }

    /// Run nothing until `now + minutes`; a forced run still takes precedence.
    pub fn pause(
        &self,
        minutes: f64,
        now: DateTime<Local>,
    ) -> Result<DateTime<Local>, SchedulerError> {
        let until = deadline(now, minutes)?;
        self.lock().pause_until = Some(until);
        tracing::info!(until = %until, "paused");
        Ok(until)
    }

    /// Run `zone` until `now + minutes`, regardless of pause, window or quota.
    pub fn run(
        &self,
        zone: &str,
        minutes: f64,
        now: DateTime<Local>,
    ) -> Result<DateTime<Local>, SchedulerError> {
        self.check_zone(zone)?;
        let until = deadline(now, minutes)?;
        let mut state = self.lock();
        state.force_zone = Some(zone.to_string());
        state.force_until = Some(until);
        tracing::info!(zone, until = %until, "forcing zone");
        Ok(until)
    }

    /// Add `minutes` (possibly negative) to today's ledger entry for `zone`.
    pub fn mark_zone_time(
        &self,
        zone: &str,
        minutes: f64,
        now: DateTime<Local>,
    ) -> Result<Duration, SchedulerError> {
        self.check_zone(zone)?;
        let delta = checked_minutes(minutes, true)?;
        let total = self
            .lock()
            .ledger
            .add_watered(zone, now.date_naive(), delta)?;
        tracing::info!(zone, minutes, "marked zone time");
        Ok(total)
    }

    fn check_zone(&self, zone: &str) -> Result<(), CommandError> {
        if self.config.zones.contains_key(zone) {
            Ok(())
        } else {
            Err(CommandError::InvalidArgument(format!("unknown zone [{zone}]")))
        }
    }

    /// Execute a parsed command at the current time.
    pub fn handle(&self, command: &Command) -> Result<CommandResponse, SchedulerError> {
        self.handle_at(command, Local::now())
    }

    pub fn handle_at(
        &self,
        command: &Command,
        now: DateTime<Local>,
    ) -> Result<CommandResponse, SchedulerError> {
        Ok(match command {
            Command::Order => CommandResponse::Order {
                order: self.order(),
            },
            Command::Pause { minutes } => CommandResponse::till(self.pause(*minutes, now)?),
            Command::Run { zone, minutes } => {
                CommandResponse::till(self.run(zone, *minutes, now)?)
            }
            Command::MarkZoneTime { zone, minutes } => {
                self.mark_zone_time(zone, *minutes, now)?;
                CommandResponse::Empty {}
            }
        })
    }

    /// Snapshot of today's progress at the current time.
    pub fn readings(&self) -> Result<Readings, SchedulerError> {
        let mut readings = self.readings_at(Local::now())?;
        readings.observed_rain_mm = self.observed_rain();
        Ok(readings)
    }

    /// Ledger and runtime snapshot at `now`, without the observed-rain fetch.
    pub fn readings_at(&self, now: DateTime<Local>) -> Result<Readings, SchedulerError> {
        let today = now.date_naive();
        let state = self.lock();

        let mut zones = Vec::with_capacity(self.config.zones.len());
        for name in self.config.zone_order() {
            let watered = state.ledger.amount_watered(&name, today)?;
            zones.push(ZoneReading {
                configured_minutes: self.config.zones[&name].minutes,
                minutes_watered: minutes(watered),
                name,
            });
        }

        let forced = state.forced_zone(now).map(str::to_string);
        Ok(Readings {
            zones,
            running: state.running.clone(),
            pause_till: state.paused_until(now),
            force_till: forced.as_ref().and(state.force_until),
            force_zone: forced,
            rain_minutes: minutes(state.ledger.amount_watered(RAIN_SENSOR, today)?),
            observed_rain_mm: None,
        })
    }

    /// Observed rain at the configured station; `None` when unset or unavailable.
    ///
    /// Never called with the state lock held: the cache may block on the network.
    pub fn observed_rain(&self) -> Option<f64> {
        let station = self.config.station.as_deref()?;
        match self.rain_cache.rain(station, OBSERVED_RAIN_HOURS) {
            Ok(mm) => Some(mm),
            Err(e) => {
                tracing::warn!(station, error = %e, "cannot fetch observed rain");
                None
            }
        }
    }
}

/// First zone in order whose watered time today is below its target.
fn next_zone(
    config: &SchedulerConfig,
    ledger: &dyn Ledger,
    day: NaiveDate,
) -> Result<Option<String>, LedgerError> {
    for name in config.zone_order() {
        let target = Duration::minutes(config.zones[&name].minutes as i64);
        if ledger.amount_watered(&name, day)? < target {
            return Ok(Some(name));
        }
    }
    Ok(None)
}

/// `now + minutes`, rejected when the instant is not representable.
fn deadline(now: DateTime<Local>, minutes: f64) -> Result<DateTime<Local>, CommandError> {
    now.checked_add_signed(checked_minutes(minutes, false)?)
        .ok_or_else(|| CommandError::InvalidArgument(format!("minutes out of range: {minutes}")))
}

/// Write `high` to `pin` unless it already reads that level.
fn set_level(pin: &dyn Pin, high: bool) -> Result<(), BoardError> {
    if pin.get()? != high {
        pin.set(high)?;
    }
    Ok(())
}
