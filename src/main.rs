//! # Sprinkler Application Entry Point
//!
//! Loads `sprinkler.toml`, resolves the valve board, and then either runs the
//! scheduler (tick loop plus JSON command endpoint) until Ctrl-C, or answers a
//! one-shot query.
//!
//! ```text
//! sprinkler                      # same as `sprinkler run`
//! sprinkler --dry-run run        # in-memory valves, real ledger and weather
//! sprinkler order                # print zone order and total minutes
//! sprinkler rain --station KJFK  # observed rain over the last 24h
//! ```
//!
//! Logging goes through `tracing`; set `RUST_LOG` to change the filter.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use sprinkler_lib::board::{Board, FakeBoard, FAKE_BOARD};
use sprinkler_lib::config::{SchedulerConfig, DEFAULT_CONFIG_PATH};
use sprinkler_lib::ledger::FileLedger;
use sprinkler_lib::scheduler::Scheduler;
use sprinkler_lib::weather::{NoaaClient, RainCache};
use sprinkler_lib::{http, runner};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Weather-aware sprinkler scheduler.
#[derive(Parser, Debug)]
#[command(name = "sprinkler", version, about)]
struct Cli {
    /// Configuration file.
    #[arg(long, short, env = "SPRINKLER_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Drive in-memory valves instead of GPIO.
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Cmd {
    /// Run the scheduler and command endpoint until Ctrl-C.
    Run,
    /// Print the zone order and the total daily minutes.
    Order,
    /// Print observed rain at a weather station.
    Rain {
        /// Station identifier; defaults to `station` from the config.
        #[arg(long)]
        station: Option<String>,

        /// Lookback window in hours.
        #[arg(long, default_value_t = 24)]
        hours: u32,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sprinkler=info,sprinkler_lib=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = SchedulerConfig::load_from_path(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command.unwrap_or(Cmd::Run) {
        Cmd::Run => run(config, cli.dry_run),
        Cmd::Order => {
            for (i, zone) in config.zone_order().iter().enumerate() {
                let z = &config.zones[zone];
                println!("{:>2}. {} ({} min, priority {})", i + 1, zone, z.minutes, z.priority);
            }
            println!("total: {} min", config.total_minutes());
            Ok(())
        }
        Cmd::Rain { station, hours } => {
            let Some(station) = station.or(config.station) else {
                bail!("no station given and none configured");
            };
            let cache = RainCache::new(Arc::new(NoaaClient::new()?));
            let mm = cache
                .rain(&station, hours)
                .with_context(|| format!("fetching observations for {station}"))?;
            println!("{station}: {mm:.2} mm in the last {hours}h");
            Ok(())
        }
    }
}

fn run(config: SchedulerConfig, dry_run: bool) -> anyhow::Result<()> {
    let board = open_board(&config.board, dry_run)?;
    let ledger = FileLedger::open(&config.data_dir)
        .with_context(|| format!("opening ledger in {}", config.data_dir.display()))?;
    // Built outside the runtime: the blocking client must not be created or
    // dropped on an async worker.
    let weather = Arc::new(NoaaClient::new()?);
    let bind = config.http.bind.clone();
    let scheduler = Arc::new(
        Scheduler::new(config, board.as_ref(), Box::new(ledger), weather)
            .context("resolving zone pins")?,
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let handle = runner::spawn(scheduler.clone());

        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "cannot listen for Ctrl-C");
            }
        };
        http::serve(scheduler.clone(), &bind, shutdown)
            .await
            .with_context(|| format!("command endpoint on {bind}"))?;

        info!("shutting down");
        handle.shutdown().await;
        Ok::<_, anyhow::Error>(())
    })
}

fn open_board(reference: &str, dry_run: bool) -> anyhow::Result<Box<dyn Board>> {
    if dry_run || reference == FAKE_BOARD {
        info!(board = reference, "using in-memory board");
        return Ok(Box::new(FakeBoard::new()));
    }

    #[cfg(all(target_os = "linux", feature = "hardware"))]
    {
        let board = sprinkler_lib::gpio::CdevBoard::open(reference)
            .with_context(|| format!("opening GPIO chip {reference}"))?;
        Ok(Box::new(board))
    }

    #[cfg(not(all(target_os = "linux", feature = "hardware")))]
    {
        bail!(
            "board {reference} needs the `hardware` feature on Linux; \
             use --dry-run or board = \"fake\""
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_defaults_to_run() {
        let cli = Cli::try_parse_from(["sprinkler", "--dry-run"]).unwrap();
        assert!(cli.dry_run);
        assert_eq!(cli.command, None);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));

        let cli = Cli::try_parse_from(["sprinkler", "rain", "--station", "KJFK"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Cmd::Rain {
                station: Some("KJFK".to_string()),
                hours: 24
            })
        );
    }

    #[test]
    fn test_fake_board_reference() {
        assert!(open_board(FAKE_BOARD, false).is_ok());
        assert!(open_board("/dev/gpiochip0", true).is_ok());
    }
}
