//! Pipeline composition and lifecycle.
//!
//! Builds one memory pool and one [`ReadoutEquipment`] per configured card,
//! the [`Aggregator`] over all equipment outputs, and a consumer worker
//! popping aggregated sets. `start` spawns every worker; `stop` winds the
//! stages down in data order (equipments, flush, aggregator, consumer) and
//! drains all queues so every page is back in its pool when it returns.

use crate::aggregator::Aggregator;
use crate::config::{EquipmentConfig, ReadoutConfig};
use crate::equipment::ReadoutEquipment;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use readout_card::CardChannel;
use readout_core::block::BLOCK_HEADER_RESERVED;
use readout_core::consumer::Consumer;
use readout_core::{DataBlock, DataSet, Fifo, StepOutcome, WorkerThread};
use readout_pool::MemoryPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// How long `stop` waits for the aggregator flush and the consumer drain.
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds card channels for the pipeline; the real factory opens hardware,
/// tests and the demo binary hand out mock cards.
pub trait ChannelFactory {
    fn open(
        &self,
        config: &EquipmentConfig,
        pool: &Arc<MemoryPool>,
    ) -> Result<Box<dyn CardChannel>>;
}

impl<F> ChannelFactory for F
where
    F: Fn(&EquipmentConfig, &Arc<MemoryPool>) -> Result<Box<dyn CardChannel>>,
{
    fn open(
        &self,
        config: &EquipmentConfig,
        pool: &Arc<MemoryPool>,
    ) -> Result<Box<dyn CardChannel>> {
        self(config, pool)
    }
}

pub struct Pipeline {
    pools: Vec<Arc<MemoryPool>>,
    equipments: Vec<Arc<ReadoutEquipment>>,
    aggregator: Arc<Aggregator>,
    output: Arc<Fifo<DataSet>>,
    consumer: Arc<Mutex<Box<dyn Consumer>>>,
    workers: Vec<WorkerThread>,
    running: bool,
}

impl Pipeline {
    /// Wire up pools, equipments, aggregator and consumer from the
    /// configuration. Nothing runs until [`start`](Self::start).
    pub fn build(
        config: &ReadoutConfig,
        channels: &dyn ChannelFactory,
        consumer: Box<dyn Consumer>,
    ) -> Result<Self> {
        config.validate()?;

        let mut pools = Vec::new();
        let mut equipments = Vec::new();
        let mut inputs: Vec<Arc<Fifo<DataBlock>>> = Vec::new();

        for (index, eq_config) in config.equipment.iter().enumerate() {
            let pool = MemoryPool::new(
                eq_config.memory_pool_number_of_pages,
                eq_config.memory_pool_page_size,
                BLOCK_HEADER_RESERVED,
            )
            .with_context(|| format!("memory pool for {}", eq_config.card_id))?;
            let channel = channels
                .open(eq_config, &pool)
                .with_context(|| format!("opening card {}", eq_config.card_id))?;
            let output = Arc::new(Fifo::new(eq_config.output_fifo_size));
            let equipment = ReadoutEquipment::new(
                &format!("equipment-{index}"),
                eq_config.clone(),
                channel,
                Arc::clone(&pool),
                Arc::clone(&output),
            )?;
            pools.push(pool);
            inputs.push(output);
            equipments.push(Arc::new(equipment));
        }

        let output = Arc::new(Fifo::new(config.aggregator.output_fifo_size));
        let aggregator = Arc::new(Aggregator::new(
            inputs,
            Arc::clone(&output),
            &config.aggregator,
        ));

        Ok(Self {
            pools,
            equipments,
            aggregator,
            output,
            consumer: Arc::new(Mutex::new(consumer)),
            workers: Vec::new(),
            running: false,
        })
    }

    /// Start data taking: consumer hook, DMA on, one worker per stage.
    pub fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        self.consumer
            .lock()
            .starting()
            .context("consumer refused to start")?;

        for equipment in &self.equipments {
            equipment.set_data_on()?;
        }

        for equipment in &self.equipments {
            let name = equipment.name().to_owned();
            let eq = Arc::clone(equipment);
            self.workers
                .push(WorkerThread::spawn(&name, move || eq.step()));
        }
        {
            let aggregator = Arc::clone(&self.aggregator);
            self.workers
                .push(WorkerThread::spawn("aggregator", move || aggregator.step()));
        }
        {
            let output = Arc::clone(&self.output);
            let consumer = Arc::clone(&self.consumer);
            self.workers
                .push(WorkerThread::spawn("consumer", move || match output.pop() {
                    Some(set) => {
                        if consumer.lock().push_data_set(&set).is_err() {
                            StepOutcome::Error
                        } else {
                            StepOutcome::Ok
                        }
                    }
                    None => StepOutcome::Idle,
                }));
        }

        info!(
            equipments = self.equipments.len(),
            "pipeline started"
        );
        self.running = true;
        Ok(())
    }

    /// Stop data taking and drain the pipeline. When this returns every
    /// page is back in its pool.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;

        // Stop submission first; in-flight pages come back to the pools.
        for equipment in &self.equipments {
            if let Err(e) = equipment.set_data_off() {
                warn!(equipment = equipment.name(), error = %e, "data off failed");
            }
        }

        // Equipment workers have nothing productive left.
        let mut workers = std::mem::take(&mut self.workers);
        for worker in workers.iter().take(self.equipments.len()) {
            worker.stop();
        }
        for worker in workers.iter_mut().take(self.equipments.len()) {
            worker.join();
        }

        // Let the aggregator surrender open partials and the consumer eat
        // what is left.
        self.aggregator.flush();
        let deadline = Instant::now() + STOP_DRAIN_TIMEOUT;
        while self.aggregator.is_flushing() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        while !self.output.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }

        for worker in &workers {
            worker.stop();
        }
        for worker in &mut workers {
            worker.join();
        }

        self.aggregator.drain_queues();

        if let Err(e) = self.consumer.lock().stopping() {
            warn!(error = %e, "consumer stop hook failed");
        }
        for equipment in &self.equipments {
            equipment.final_counters();
        }

        for (i, pool) in self.pools.iter().enumerate() {
            if pool.available() != pool.page_count() {
                warn!(
                    pool = i,
                    available = pool.available(),
                    pages = pool.page_count(),
                    "pages still outstanding after stop"
                );
            }
        }
        info!("pipeline stopped");
    }

    #[must_use]
    pub fn equipments(&self) -> &[Arc<ReadoutEquipment>] {
        &self.equipments
    }

    #[must_use]
    pub fn pools(&self) -> &[Arc<MemoryPool>] {
        &self.pools
    }

    #[must_use]
    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    /// True while every worker is alive and none has failed.
    #[must_use]
    pub fn healthy(&self) -> bool {
        self.running && self.workers.iter().all(|w| !w.has_failed())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
