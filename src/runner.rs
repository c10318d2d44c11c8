//! Background tick loop.
//!
//! One task drives [`Scheduler::tick`] every `tick_seconds`. The tick itself
//! does blocking file and network I/O, so it runs on the blocking pool and is
//! awaited before the next wait; ticks never overlap. Shutdown is observed
//! between ticks, so a tick in progress always completes.

use crate::scheduler::Scheduler;
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info};

/// Running tick loop.
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// Start ticking `scheduler` at its configured interval.
pub fn spawn(scheduler: Arc<Scheduler>) -> SchedulerHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let interval = Duration::from_secs(scheduler.config().tick_seconds);
    let join = tokio::spawn(run(scheduler, interval, shutdown_rx));
    SchedulerHandle { shutdown_tx, join }
}

/// Tick until `shutdown_rx` turns true or its sender goes away.
pub async fn run(
    scheduler: Arc<Scheduler>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "scheduler loop starting");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let s = scheduler.clone();
        match tokio::task::spawn_blocking(move || s.tick(Local::now())).await {
            Ok(Ok(running)) => debug!(?running, "tick"),
            Ok(Err(e)) => error!(error = %e, "error doing scheduler tick"),
            Err(e) => error!(error = %e, "scheduler tick panicked"),
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = sleep(interval) => {}
        }
    }

    info!("scheduler loop stopped");
}

impl SchedulerHandle {
    /// Signal the loop and wait for the current tick to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "scheduler loop ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::FakeBoard;
    use crate::config::{SchedulerConfig, ZoneConfig};
    use crate::ledger::FileLedger;
    use crate::weather::StaticWeather;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_loop_ticks_and_shuts_down() {
        let mut zones = BTreeMap::new();
        zones.insert(
            "b".to_string(),
            ZoneConfig {
                pin: "2".to_string(),
                minutes: 20,
                priority: 0,
            },
        );
        let dir = TempDir::new().unwrap();
        let board = FakeBoard::new();
        let scheduler = Arc::new(
            Scheduler::new(
                SchedulerConfig::new("fake", zones),
                &board,
                Box::new(FileLedger::open(dir.path()).unwrap()),
                Arc::new(StaticWeather::default()),
            )
            .unwrap(),
        );
        // Forced so the outcome does not depend on the wall-clock hour
        scheduler.run("b", 60.0, Local::now()).unwrap();

        let handle = spawn(scheduler.clone());
        for _ in 0..100 {
            if board.pin("2").level() {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(scheduler.running().as_deref(), Some("b"));
        assert!(board.pin("2").level());

        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("loop did not stop");
    }
}
