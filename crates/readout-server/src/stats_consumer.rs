//! Statistics consumer.
//!
//! Counts blocks and bytes flowing out of the pipeline, optionally
//! publishes the counters periodically while running (`monitoringEnabled`),
//! and logs an end-of-run report with average block size, block rate and
//! throughput.

use crate::config::StatsConsumerConfig;
use readout_core::consumer::{Consumer, ConsumerError};
use readout_core::timer::PeriodicTimer;
use readout_core::util::{format_bytes, format_scaled};
use readout_core::DataBlock;
use std::time::{Duration, Instant};
use tracing::info;

pub struct StatsConsumer {
    name: String,
    config: StatsConsumerConfig,
    blocks: u64,
    bytes_total: u64,
    bytes_header: u64,
    bytes_interval: u64,
    running_since: Option<Instant>,
    elapsed: f64,
    monitoring_timer: Option<PeriodicTimer>,
}

impl StatsConsumer {
    #[must_use]
    pub fn new(config: StatsConsumerConfig) -> Self {
        if config.monitoring_enabled {
            info!(
                period_s = config.monitoring_update_period,
                config = %config.monitoring_config,
                "monitoring enabled"
            );
        }
        Self {
            name: "stats".to_owned(),
            config,
            blocks: 0,
            bytes_total: 0,
            bytes_header: 0,
            bytes_interval: 0,
            running_since: None,
            elapsed: 0.0,
            monitoring_timer: None,
        }
    }

    fn publish(&mut self) {
        info!(
            readout.blocks = self.blocks,
            readout.bytes_total = self.bytes_total,
            readout.bytes_interval = self.bytes_interval,
            "monitoring update"
        );
        self.bytes_interval = 0;
    }

    /// End-of-run report; also called from `stopping`.
    fn report(&self) {
        if self.bytes_total == 0 {
            info!(consumer = %self.name, "no data received");
            return;
        }
        let elapsed = if self.elapsed > 0.0 {
            self.elapsed
        } else {
            self.running_since.map_or(0.0, |t| t.elapsed().as_secs_f64())
        };
        let header_overhead = self.bytes_header as f64 * 100.0 / self.bytes_total as f64;
        info!(
            consumer = %self.name,
            blocks = self.blocks,
            total = %format_bytes(self.bytes_total as f64, "B"),
            header_overhead = format!("{header_overhead:.2}%"),
            average_block_size = self.bytes_total / self.blocks.max(1),
            block_rate = %format_scaled(self.blocks as f64 / elapsed.max(f64::EPSILON), "Hz", 1000),
            throughput = %format_bytes(self.bytes_total as f64 / elapsed.max(f64::EPSILON), "B/s"),
            elapsed_s = format!("{elapsed:.5}"),
            "run statistics"
        );
    }

    #[must_use]
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    #[must_use]
    pub fn bytes_total(&self) -> u64 {
        self.bytes_total
    }
}

impl Consumer for StatsConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    fn starting(&mut self) -> Result<(), ConsumerError> {
        info!(consumer = %self.name, "starting stats clock");
        self.blocks = 0;
        self.bytes_total = 0;
        self.bytes_header = 0;
        self.bytes_interval = 0;
        self.elapsed = 0.0;
        self.running_since = Some(Instant::now());
        self.monitoring_timer = self.config.monitoring_enabled.then(|| {
            PeriodicTimer::new(Duration::from_secs_f64(
                self.config.monitoring_update_period,
            ))
        });
        Ok(())
    }

    fn stopping(&mut self) -> Result<(), ConsumerError> {
        info!(consumer = %self.name, "stopping stats clock");
        self.elapsed = self
            .running_since
            .map_or(0.0, |t| t.elapsed().as_secs_f64());
        self.report();
        Ok(())
    }

    fn push_block(&mut self, block: &DataBlock) -> Result<(), ConsumerError> {
        let header = block.header();
        self.blocks += 1;
        self.bytes_total += u64::from(header.payload_size);
        self.bytes_interval += u64::from(header.payload_size);
        self.bytes_header += u64::from(header.header_size);

        if let Some(timer) = &mut self.monitoring_timer {
            if timer.is_timeout() {
                timer.increment();
                self.publish();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use readout_core::block::BLOCK_HEADER_RESERVED;
    use readout_core::DataSet;
    use readout_pool::MemoryPool;
    use std::sync::Arc;

    fn block(pool: &Arc<MemoryPool>, payload: u32) -> DataBlock {
        let b = DataBlock::new(pool.wrap(pool.acquire().unwrap()));
        b.set_payload_size(payload);
        b
    }

    #[test]
    fn test_counts_blocks_and_bytes() {
        let pool = MemoryPool::new(4, 4096, BLOCK_HEADER_RESERVED).unwrap();
        let mut consumer = StatsConsumer::new(StatsConsumerConfig::default());
        consumer.starting().unwrap();

        let mut set = DataSet::new();
        set.push(block(&pool, 100));
        set.push(block(&pool, 200));
        consumer.push_data_set(&set).unwrap();
        consumer.push_block(&block(&pool, 50)).unwrap();

        assert_eq!(consumer.blocks(), 3);
        assert_eq!(consumer.bytes_total(), 350);
        consumer.stopping().unwrap();
    }

    #[test]
    fn test_starting_resets_counters() {
        let pool = MemoryPool::new(1, 4096, BLOCK_HEADER_RESERVED).unwrap();
        let mut consumer = StatsConsumer::new(StatsConsumerConfig::default());
        consumer.starting().unwrap();
        consumer.push_block(&block(&pool, 10)).unwrap();
        consumer.stopping().unwrap();
        consumer.starting().unwrap();
        assert_eq!(consumer.blocks(), 0);
        assert_eq!(consumer.bytes_total(), 0);
    }
}
