//! # Readout Server
//!
//! The pipeline itself: per-card readout equipment, the timeframe
//! aggregator, the statistics consumer and the wiring between them.
//!
//! Data path: each [`equipment::ReadoutEquipment`] keeps its card's DMA
//! queues primed with free pool pages, harvests completed superpages,
//! annotates the in-band block headers (equipment/link/timeframe ids) and
//! emits blocks into its bounded output queue. The
//! [`aggregator::Aggregator`] slices the N equipment streams into
//! per-source, per-timeframe [`DataSet`](readout_core::DataSet)s and hands
//! them to the consumer. All stages are cooperative workers on dedicated
//! threads; every queue is bounded and non-blocking, so backpressure
//! propagates as `Idle` steps instead of blocked threads.

pub mod aggregator;
pub mod config;
pub mod equipment;
pub mod pipeline;
pub mod slicer;
pub mod stats;
pub mod stats_consumer;

pub use aggregator::Aggregator;
pub use config::{AggregatorConfig, EquipmentConfig, ReadoutConfig, StatsConsumerConfig};
pub use equipment::ReadoutEquipment;
pub use pipeline::Pipeline;
pub use slicer::DataBlockSlicer;
pub use stats_consumer::StatsConsumer;
