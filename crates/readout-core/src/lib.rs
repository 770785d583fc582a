//! # Readout Core Library
//!
//! Shared building blocks of the readout pipeline. Every stage (equipment
//! loops, aggregator, consumers) is built from the pieces defined here:
//!
//! - **`block`**: the in-band [`DataBlockHeader`](block::DataBlockHeader)
//!   written into each DMA page's reserved prefix, and [`DataBlock`](block::DataBlock),
//!   the typed view over a pool page.
//! - **`dataset`**: ordered batches of blocks, the unit handed downstream.
//! - **`fifo`**: the bounded, non-blocking FIFO used for every inter-stage
//!   queue.
//! - **`worker`**: the cooperative worker runtime (`Ok`/`Idle`/`Error` step
//!   functions on dedicated threads).
//! - **`timer`**: drift-free periodic timers (software timeframe clock,
//!   audit cadences).
//! - **`rdh`**: the Raw Data Header wire format the card prepends to each
//!   sub-block, with validation and a writer for test data.
//! - **`consumer`**: the contract downstream consumers implement.
//! - **`util`**: small formatting helpers for human-readable reports.

pub mod block;
pub mod consumer;
pub mod dataset;
pub mod fifo;
pub mod rdh;
pub mod timer;
pub mod util;
pub mod worker;

pub use block::{DataBlock, DataBlockHeader};
pub use dataset::DataSet;
pub use fifo::Fifo;
pub use worker::{StepOutcome, WorkerThread};

/// LHC orbit rate in Hz (299792458 / 26659).
pub const LHC_ORBIT_RATE: u32 = 11_246;

/// Number of bunches in the LHC.
pub const LHC_BUNCHES: u32 = 3_564;

/// Default timeframe length, in orbits.
pub const DEFAULT_TIMEFRAME_PERIOD_ORBITS: u32 = 256;
