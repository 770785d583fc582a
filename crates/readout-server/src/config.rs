//! Pipeline configuration.
//!
//! Loaded from TOML; key names are camelCase, matching the option names the
//! readout system has always exposed to operators:
//!
//! ```toml
//! [[equipment]]
//! cardId = "mock:0"
//! rdhUseFirstInPageEnabled = true
//! TFperiod = 256
//!
//! [aggregator]
//! sliceTimeout = 1.0
//!
//! [consumer]
//! monitoringEnabled = true
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

fn default_true() -> bool {
    true
}

fn default_data_source() -> String {
    "Internal".to_owned()
}

fn default_reset_level() -> String {
    "INTERNAL".to_owned()
}

fn default_tf_period() -> u32 {
    readout_core::DEFAULT_TIMEFRAME_PERIOD_ORBITS
}

fn default_pool_pages() -> usize {
    128
}

fn default_page_size() -> usize {
    1024 * 1024
}

fn default_fifo_size() -> usize {
    256
}

fn default_audit_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_monitoring_period() -> f64 {
    10.0
}

/// Per-card readout options.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquipmentConfig {
    /// Board id, typically a PCI bus device id. Opaque driver parameter.
    pub card_id: String,

    /// Channel number on the board. Opaque driver parameter.
    #[serde(default)]
    pub channel_number: i32,

    /// Data source selected in the card. Opaque driver parameter.
    #[serde(default = "default_data_source")]
    pub data_source: String,

    /// Reset level applied when opening the channel. Opaque driver
    /// parameter.
    #[serde(default = "default_reset_level")]
    pub reset_level: String,

    /// Let the driver check firmware compatibility.
    #[serde(default = "default_true")]
    pub firmware_check_enabled: bool,

    /// Parse every RDH in each page and check structural invariants.
    #[serde(default)]
    pub rdh_check_enabled: bool,

    /// Log RDH summaries. A negative value counts up to zero and then
    /// silences the dump, limiting the number of pages dumped.
    #[serde(default)]
    pub rdh_dump_enabled: i32,

    /// Log each RDH validation failure.
    #[serde(default = "default_true")]
    pub rdh_dump_error_enabled: bool,

    /// Use the first RDH in each page to populate block headers and drive
    /// timeframe ids; otherwise a software clock generates them.
    #[serde(default)]
    pub rdh_use_first_in_page_enabled: bool,

    /// Zero each page before giving it to the card. Slow, but tolerates
    /// partial writes when the driver does not report exact byte counts.
    #[serde(default)]
    pub clean_page_before_use: bool,

    /// Collect occupancy histograms of the card queues, dumped at stop.
    #[serde(default)]
    pub debug_stats_enabled: bool,

    /// Timeframe length in LHC orbits.
    #[serde(rename = "TFperiod", default = "default_tf_period")]
    pub tf_period: u32,

    /// Raise the equipment error flag when the card drops packets.
    #[serde(default)]
    pub stop_on_error: bool,

    /// Pages in this equipment's memory pool.
    #[serde(default = "default_pool_pages")]
    pub memory_pool_number_of_pages: usize,

    /// Page size in bytes (multiple of 4 KiB).
    #[serde(default = "default_page_size")]
    pub memory_pool_page_size: usize,

    /// Capacity of the equipment -> aggregator queue.
    #[serde(default = "default_fifo_size")]
    pub output_fifo_size: usize,

    /// Cadence of the dropped-packet audit. Not an operator option;
    /// shortened by tests.
    #[serde(skip, default = "default_audit_interval")]
    pub dropped_packet_audit_interval: Duration,
}

impl EquipmentConfig {
    /// Minimal config for a named card, defaults everywhere else.
    #[must_use]
    pub fn for_card(card_id: &str) -> Self {
        toml::from_str(&format!("cardId = \"{card_id}\"")).expect("static config")
    }

    pub fn validate(&self) -> Result<()> {
        if self.card_id.is_empty() {
            bail!("cardId must not be empty");
        }
        if self.tf_period == 0 {
            bail!("TFperiod must be at least 1 orbit");
        }
        if self.memory_pool_number_of_pages == 0 {
            bail!("memoryPoolNumberOfPages must be greater than 0");
        }
        if self.memory_pool_page_size == 0 || self.memory_pool_page_size % 4096 != 0 {
            bail!(
                "memoryPoolPageSize {} must be a non-zero multiple of 4096",
                self.memory_pool_page_size
            );
        }
        if self.output_fifo_size == 0 {
            bail!("outputFifoSize must be greater than 0");
        }
        Ok(())
    }
}

/// Aggregator options.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatorConfig {
    /// Close partial slices untouched for this many seconds; 0 disables
    /// the timeout.
    #[serde(default)]
    pub slice_timeout: f64,

    /// Pass blocks through one by one instead of grouping by timeframe.
    #[serde(default)]
    pub disable_slicing: bool,

    /// Capacity of the aggregator -> consumer queue.
    #[serde(default = "default_fifo_size")]
    pub output_fifo_size: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            slice_timeout: 0.0,
            disable_slicing: false,
            output_fifo_size: default_fifo_size(),
        }
    }
}

impl AggregatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.slice_timeout < 0.0 {
            bail!("sliceTimeout must not be negative");
        }
        if self.output_fifo_size == 0 {
            bail!("aggregator outputFifoSize must be greater than 0");
        }
        Ok(())
    }
}

/// Statistics consumer options.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsConsumerConfig {
    /// Publish counters periodically while running.
    #[serde(default)]
    pub monitoring_enabled: bool,

    /// Seconds between monitoring updates.
    #[serde(default = "default_monitoring_period")]
    pub monitoring_update_period: f64,

    /// Backend configuration string, passed through to the monitoring
    /// sink.
    #[serde(default)]
    pub monitoring_config: String,
}

impl Default for StatsConsumerConfig {
    fn default() -> Self {
        Self {
            monitoring_enabled: false,
            monitoring_update_period: default_monitoring_period(),
            monitoring_config: String::new(),
        }
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReadoutConfig {
    #[serde(default)]
    pub equipment: Vec<EquipmentConfig>,

    #[serde(default)]
    pub aggregator: AggregatorConfig,

    #[serde(default)]
    pub consumer: StatsConsumerConfig,
}

impl ReadoutConfig {
    pub fn from_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;
        Self::from_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.equipment.is_empty() {
            bail!("at least one [[equipment]] section is required");
        }
        for (i, eq) in self.equipment.iter().enumerate() {
            eq.validate()
                .with_context(|| format!("equipment #{i} ({})", eq.card_id))?;
        }
        self.aggregator.validate()?;
        if self.consumer.monitoring_update_period <= 0.0 {
            bail!("monitoringUpdatePeriod must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let cfg = ReadoutConfig::from_str(
            r#"
            [[equipment]]
            cardId = "mock:0"
            "#,
        )
        .unwrap();
        let eq = &cfg.equipment[0];
        assert_eq!(eq.card_id, "mock:0");
        assert_eq!(eq.tf_period, 256);
        assert!(eq.rdh_dump_error_enabled);
        assert!(!eq.rdh_check_enabled);
        assert_eq!(eq.data_source, "Internal");
        assert_eq!(cfg.aggregator.slice_timeout, 0.0);
        assert!(!cfg.consumer.monitoring_enabled);
    }

    #[test]
    fn test_camel_case_keys_recognized() {
        let cfg = ReadoutConfig::from_str(
            r#"
            [[equipment]]
            cardId = "mock:1"
            channelNumber = 2
            rdhCheckEnabled = true
            rdhUseFirstInPageEnabled = true
            cleanPageBeforeUse = true
            debugStatsEnabled = true
            TFperiod = 32
            stopOnError = true
            memoryPoolNumberOfPages = 16
            memoryPoolPageSize = 65536
            outputFifoSize = 8

            [aggregator]
            sliceTimeout = 0.5
            disableSlicing = true

            [consumer]
            monitoringEnabled = true
            monitoringUpdatePeriod = 2.0
            monitoringConfig = "influxdb-udp://localhost:1234"
            "#,
        )
        .unwrap();
        let eq = &cfg.equipment[0];
        assert_eq!(eq.channel_number, 2);
        assert!(eq.rdh_check_enabled);
        assert!(eq.rdh_use_first_in_page_enabled);
        assert!(eq.clean_page_before_use);
        assert!(eq.debug_stats_enabled);
        assert_eq!(eq.tf_period, 32);
        assert!(eq.stop_on_error);
        assert_eq!(eq.memory_pool_number_of_pages, 16);
        assert_eq!(eq.memory_pool_page_size, 65536);
        assert_eq!(eq.output_fifo_size, 8);
        assert!(cfg.aggregator.disable_slicing);
        assert!(cfg.consumer.monitoring_enabled);
        assert_eq!(cfg.consumer.monitoring_update_period, 2.0);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(ReadoutConfig::from_str("").is_err());
        assert!(ReadoutConfig::from_str(
            r#"
            [[equipment]]
            cardId = "x"
            TFperiod = 0
            "#,
        )
        .is_err());
        assert!(ReadoutConfig::from_str(
            r#"
            [[equipment]]
            cardId = "x"
            memoryPoolPageSize = 1000
            "#,
        )
        .is_err());
    }
}
