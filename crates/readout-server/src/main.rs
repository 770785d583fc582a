//! `readout`: run the pipeline on software cards.
//!
//! Reads a TOML configuration (or uses a two-card default), attaches a
//! mock card per equipment, runs for the requested duration and prints the
//! end-of-run reports.
//!
//! ```bash
//! readout --duration 10
//! readout --config readout.toml --verbose
//! ```

use anyhow::Result;
use clap::Parser;
use readout_card::{CardParams, MockCard};
use readout_server::{Pipeline, ReadoutConfig, StatsConsumer};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "readout")]
#[command(about = "Detector readout pipeline on software cards", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// How long to take data, in seconds.
    #[arg(short, long, default_value_t = 5)]
    duration: u64,

    /// Verbose logging (debug level).
    #[arg(short, long)]
    verbose: bool,
}

const DEFAULT_CONFIG: &str = r#"
[[equipment]]
cardId = "mock:0"
rdhUseFirstInPageEnabled = true
rdhCheckEnabled = true
memoryPoolNumberOfPages = 64
memoryPoolPageSize = 131072

[[equipment]]
cardId = "mock:1"
rdhUseFirstInPageEnabled = true
memoryPoolNumberOfPages = 64
memoryPoolPageSize = 131072

[aggregator]
sliceTimeout = 1.0

[consumer]
monitoringEnabled = true
monitoringUpdatePeriod = 2.0
"#;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = match &cli.config {
        Some(path) => ReadoutConfig::from_path(path)?,
        None => ReadoutConfig::from_str(DEFAULT_CONFIG)?,
    };

    let consumer = StatsConsumer::new(config.consumer.clone());
    let factory = |eq: &readout_server::EquipmentConfig,
                   pool: &std::sync::Arc<readout_pool::MemoryPool>|
     -> Result<Box<dyn readout_card::CardChannel>> {
        let card = MockCard::builder()
            .cru_id((eq.channel_number + 1) as u16)
            .links(vec![0, 1, 2])
            .pages_per_fill(4)
            .build(CardParams {
                card_id: eq.card_id.clone(),
                channel_number: eq.channel_number,
                data_source: eq.data_source.clone(),
                reset_level: eq.reset_level.clone(),
                firmware_check_enabled: eq.firmware_check_enabled,
                base_address: pool.base_address(),
                region_size: pool.base_size(),
            });
        Ok(Box::new(card) as Box<dyn readout_card::CardChannel>)
    };

    let mut pipeline = Pipeline::build(&config, &factory, Box::new(consumer))?;
    pipeline.start()?;
    info!(duration_s = cli.duration, "taking data");
    std::thread::sleep(Duration::from_secs(cli.duration));
    pipeline.stop();

    for equipment in pipeline.equipments() {
        info!(
            equipment = equipment.name(),
            pages = equipment.stats().pages(),
            timeframes = equipment.stats().timeframes(),
            "totals"
        );
    }
    Ok(())
}
