//! Scenario tests that drive the scheduler through whole days.
//!
//! Every scenario runs against a real [`FileLedger`] in a temporary directory,
//! a [`FakeBoard`] and a [`StaticWeather`] provider, with explicit local
//! timestamps so nothing depends on the wall clock.


use crate::board::FakeBoard;
use crate::config::{SchedulerConfig, ZoneConfig};
use crate::ledger::{minutes, FileLedger, Ledger};
use crate::scheduler::Scheduler;
use crate::weather::StaticWeather;
use chrono::{DateTime, Local, TimeZone};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

/// Scheduler wired to in-memory valves and a throwaway ledger directory.
pub(crate) struct Fixture {
    pub scheduler: Scheduler,
    pub board: FakeBoard,
    pub weather: Arc<StaticWeather>,
    pub config: SchedulerConfig,
    dir: TempDir,
}

impl Fixture {
    /// Zones as (name, minutes, priority); pins are numbered from 1 in name order.
    pub fn new(zones: &[(&str, u32, i32)], tweak: impl FnOnce(&mut SchedulerConfig)) -> Self {
        let mut config = SchedulerConfig::new("fake", zone_table(zones));
        tweak(&mut config);
        let dir = TempDir::new().unwrap();
        let board = FakeBoard::new();
        let weather = Arc::new(StaticWeather::default());
        let scheduler = build(&config, &dir, &board, &weather);
        Fixture {
            scheduler,
            board,
            weather,
            config,
            dir,
        }
    }

    /// The a/b/c configuration used by most scenarios.
    pub fn simple() -> Self {
        Self::new(&[("a", 10, 0), ("b", 20, 0), ("c", 5, 0)], |_| {})
    }

    /// Replace the scheduler with a fresh one over the same ledger, as after a restart.
    pub fn restart(&mut self) {
        self.scheduler = build(&self.config, &self.dir, &self.board, &self.weather);
    }

    /// Minutes recorded for `zone` on the day of `at`.
    pub fn watered(&self, zone: &str, at: DateTime<Local>) -> f64 {
        let ledger = FileLedger::open(self.dir.path()).unwrap();
        minutes(ledger.amount_watered(zone, at.date_naive()).unwrap())
    }

    /// Number of day files written so far.
    pub fn day_files(&self) -> usize {
        std::fs::read_dir(self.dir.path()).unwrap().count()
    }

    /// Pin identifier of `zone`.
    pub fn pin(&self, zone: &str) -> String {
        self.config.zones[zone].pin.clone()
    }
}

fn build(
    config: &SchedulerConfig,
    dir: &TempDir,
    board: &FakeBoard,
    weather: &Arc<StaticWeather>,
) -> Scheduler {
    Scheduler::new(
        config.clone(),
        board,
        Box::new(FileLedger::open(dir.path()).unwrap()),
        weather.clone(),
    )
    .unwrap()
}

pub(crate) fn zone_table(zones: &[(&str, u32, i32)]) -> BTreeMap<String, ZoneConfig> {
    let mut names: Vec<_> = zones.to_vec();
    names.sort_by_key(|(name, _, _)| *name);
    names
        .into_iter()
        .enumerate()
        .map(|(i, (name, minutes, priority))| {
            (
                name.to_string(),
                ZoneConfig {
                    pin: (i + 1).to_string(),
                    minutes,
                    priority,
                },
            )
        })
        .collect()
}

/// 2024-06-15 at `h:m:s` local time.
pub(crate) fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
    Local.with_ymd_and_hms(2024, 6, 15, h, m, s).unwrap()
}
