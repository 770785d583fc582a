//! N-input timeframe aggregator.
//!
//! Subscribes to every equipment's output queue, runs one
//! [`DataBlockSlicer`] per input, and publishes completed slices into a
//! single bounded output queue. Inputs are visited in round-robin order
//! starting where the previous step left off, which bounds starvation
//! without imposing any cross-source ordering.
//!
//! The aggregator is a cooperative worker like the equipment: a full output
//! queue makes the step return `Idle` immediately, and at most
//! [`MAX_BATCH`] blocks are drained per input per step so one busy input
//! cannot monopolize the thread.

use crate::config::AggregatorConfig;
use crate::slicer::DataBlockSlicer;
use parking_lot::Mutex;
use readout_core::{DataBlock, DataSet, Fifo, StepOutcome};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Upper bound on blocks drained (and slices published) per input per step.
pub const MAX_BATCH: usize = 1024;

struct AggregatorInner {
    slicers: Vec<DataBlockSlicer>,
    next_index: usize,
    total_blocks_in: u64,
}

pub struct Aggregator {
    inputs: Vec<Arc<Fifo<DataBlock>>>,
    output: Arc<Fifo<DataSet>>,
    slice_timeout: f64,
    disable_slicing: bool,
    do_flush: AtomicBool,
    epoch: Instant,
    inner: Mutex<AggregatorInner>,
}

impl Aggregator {
    #[must_use]
    pub fn new(
        inputs: Vec<Arc<Fifo<DataBlock>>>,
        output: Arc<Fifo<DataSet>>,
        config: &AggregatorConfig,
    ) -> Self {
        let slicers = inputs.iter().map(|_| DataBlockSlicer::new()).collect();
        Self {
            inputs,
            output,
            slice_timeout: config.slice_timeout,
            disable_slicing: config.disable_slicing,
            do_flush: AtomicBool::new(false),
            epoch: Instant::now(),
            inner: Mutex::new(AggregatorInner {
                slicers,
                next_index: 0,
                total_blocks_in: 0,
            }),
        }
    }

    /// Ask the aggregator to surrender still-open partial slices once the
    /// inputs run dry. The flag clears itself on the first fully idle step
    /// after everything drained.
    pub fn flush(&self) {
        self.do_flush.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_flushing(&self) -> bool {
        self.do_flush.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn total_blocks_in(&self) -> u64 {
        self.inner.lock().total_blocks_in
    }

    /// One cooperative step over all inputs.
    pub fn step(&self) -> StepOutcome {
        if self.output.is_full() {
            return StepOutcome::Idle;
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let now = self.epoch.elapsed().as_secs_f64();
        let n_inputs = self.inputs.len();
        let mut blocks_in = 0usize;
        let mut slices_out = 0usize;
        let start = inner.next_index;

        for ix in 0..n_inputs {
            let i = (ix + start) % n_inputs;
            let input = &self.inputs[i];

            if self.disable_slicing {
                // Pass-through: one block becomes one single-entry set,
                // preserving page identity with no grouping.
                if self.output.is_full() {
                    return StepOutcome::Idle;
                }
                let Some(block) = input.pop() else { continue };
                blocks_in += 1;
                inner.total_blocks_in += 1;
                let mut set = DataSet::new();
                set.push(block);
                self.output
                    .push(set)
                    .expect("aggregator is the sole output producer");
                slices_out += 1;
                continue;
            }

            // Feed the slicer.
            for _ in 0..MAX_BATCH {
                let Some(block) = input.pop() else { break };
                blocks_in += 1;
                inner.total_blocks_in += 1;
                if inner.slicers[i].append(block, now).is_err() {
                    return StepOutcome::Error;
                }
            }

            // Close partials idle for longer than the slice timeout.
            if self.slice_timeout > 0.0 {
                inner.slicers[i].complete_on_timeout(now - self.slice_timeout);
            }

            // Publish completed slices; on flush, also surrender open
            // partials once this input is drained.
            for _ in 0..MAX_BATCH {
                if self.output.is_full() {
                    return StepOutcome::Idle;
                }
                let include_incomplete =
                    self.do_flush.load(Ordering::Acquire) && input.is_empty();
                let Some(slice) = inner.slicers[i].pop_slice(include_incomplete) else {
                    break;
                };
                if let Err(slice) = self.output.push(slice) {
                    inner.slicers[i].requeue_front(slice);
                    return StepOutcome::Idle;
                }
                slices_out += 1;
                inner.next_index = i + 1;
            }
        }

        if blocks_in == 0 && slices_out == 0 {
            // Flushing is complete once we are fully idle.
            if self.do_flush.load(Ordering::Acquire) {
                self.do_flush.store(false, Ordering::Release);
            }
            return StepOutcome::Idle;
        }
        StepOutcome::Ok
    }

    /// Drop everything still queued or held by the slicers, returning the
    /// pages to their pools. Called after the worker thread has joined.
    pub fn drain_queues(&self) {
        let mut inner = self.inner.lock();
        info!(
            blocks = inner.total_blocks_in,
            "aggregator processed blocks"
        );
        for (i, input) in self.inputs.iter().enumerate() {
            let n = input.drain();
            if n > 0 {
                debug!(input = i, blocks = n, "cleared aggregator input queue");
            }
        }
        for slicer in &mut inner.slicers {
            while slicer.pop_slice(true).is_some() {}
        }
        let n = self.output.drain();
        if n > 0 {
            debug!(slices = n, "cleared aggregator output queue");
        }
    }
}
