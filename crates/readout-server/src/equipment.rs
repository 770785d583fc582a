//! Per-card readout equipment.
//!
//! One `ReadoutEquipment` instance drives one card channel: it keeps the
//! card's transfer queue primed with free pool pages, harvests completed
//! superpages from the ready queue, annotates each page's in-band header
//! (payload size, equipment/link ids, timeframe id) and emits the blocks
//! into a bounded output queue read by the aggregator.
//!
//! The equipment is a cooperative worker: [`ReadoutEquipment::step`] never
//! blocks. A full output queue or an exhausted pool makes the step return
//! `Idle`; pages already submitted keep accumulating on the card side,
//! which is the intended backpressure.
//!
//! # Timeframe identification
//!
//! Two modes, selected by `rdhUseFirstInPageEnabled`:
//!
//! - **RDH-driven**: the first RDH's heartbeat orbit is bucketed into fixed
//!   windows of `TFperiod` orbits aligned to the very first orbit seen; the
//!   timeframe id is the 1-based window index. A non-contiguous jump is
//!   logged and adopted.
//! - **Software clock**: a periodic timer at `LHC_ORBIT_RATE / TFperiod` Hz
//!   increments the id.

use crate::config::EquipmentConfig;
use crate::stats::{EquipmentStats, OccupancyHistogram};
use parking_lot::Mutex;
use readout_card::{CardChannel, CardError, Superpage};
use readout_core::block::{DataBlock, UNDEFINED_EQUIPMENT_ID, UNDEFINED_LINK_ID};
use readout_core::rdh::{validate_rdh, Rdh, MAX_LINK_ID};
use readout_core::timer::PeriodicTimer;
use readout_core::{Fifo, StepOutcome, LHC_ORBIT_RATE};
use readout_pool::MemoryPool;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Card pages must be sized in this granularity.
const SUPERPAGE_GRANULARITY: usize = 32 * 1024;

#[derive(Error, Debug)]
pub enum EquipmentError {
    #[error("superpage must be at least 32 KiB (page size {page_size}, reserved {reserved})")]
    PageTooSmall { page_size: usize, reserved: usize },

    #[error("pool reserves {reserved} bytes, block header needs {needed}")]
    ReservedPrefixTooSmall { reserved: usize, needed: usize },

    #[error(transparent)]
    Card(#[from] CardError),
}

/// Equipment lifecycle. Construction is initialization; a fatal card fault
/// latches `Faulted` until the equipment is rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EquipmentState {
    Stopped,
    Running,
    Faulted,
}

struct Inner {
    channel: Box<dyn CardChannel>,
    state: EquipmentState,
    /// Raised on data loss when `stopOnError` is set; the loop keeps
    /// running so accounting stays coherent.
    error_flag: bool,
    waiting_first_loop: bool,
    card_fifo_size: usize,
    last_packet_dropped: i32,
    packet_dropped_timer: PeriodicTimer,
    /// Some in software-clock mode.
    software_clock: Option<PeriodicTimer>,
    current_timeframe: u64,
    current_tf_orbit_begin: u32,
    first_tf_orbit_begin: u32,
    rdh_last_packet_counter: [u8; MAX_LINK_ID as usize + 1],
    /// Evolving copy of `rdhDumpEnabled`: negative values count up to zero
    /// and stop the dump.
    rdh_dump_remaining: i32,
    free_histogram: Option<OccupancyHistogram>,
    ready_histogram: Option<OccupancyHistogram>,
}

pub struct ReadoutEquipment {
    name: String,
    config: EquipmentConfig,
    pool: Arc<MemoryPool>,
    output: Arc<Fifo<DataBlock>>,
    stats: Arc<EquipmentStats>,
    usable_page_size: usize,
    inner: Mutex<Inner>,
}

impl ReadoutEquipment {
    pub fn new(
        name: &str,
        config: EquipmentConfig,
        channel: Box<dyn CardChannel>,
        pool: Arc<MemoryPool>,
        output: Arc<Fifo<DataBlock>>,
    ) -> Result<Self, EquipmentError> {
        let needed = std::mem::size_of::<readout_core::DataBlockHeader>();
        if pool.reserved_prefix() < needed {
            return Err(EquipmentError::ReservedPrefixTooSmall {
                reserved: pool.reserved_prefix(),
                needed,
            });
        }

        // Keep space at the page start for the block header; the card needs
        // the remainder in 32 KiB granularity.
        let mut usable_page_size = pool.page_size() - pool.reserved_prefix();
        usable_page_size -= usable_page_size % SUPERPAGE_GRANULARITY;
        if usable_page_size == 0 {
            return Err(EquipmentError::PageTooSmall {
                page_size: pool.page_size(),
                reserved: pool.reserved_prefix(),
            });
        }

        if config.clean_page_before_use {
            info!(
                equipment = name,
                "superpages will be cleaned before each DMA - this may be slow"
            );
        }
        if !config.firmware_check_enabled {
            warn!(
                equipment = name,
                "bypassing card firmware compatibility check"
            );
        }

        let software_clock = if config.rdh_use_first_in_page_enabled {
            info!(
                equipment = name,
                tf_period = config.tf_period,
                "timeframe ids generated from RDH trigger counters"
            );
            None
        } else {
            let rate = f64::from(LHC_ORBIT_RATE) / f64::from(config.tf_period);
            info!(
                equipment = name,
                tf_period = config.tf_period,
                rate_hz = format!("{rate:.2}"),
                "timeframe ids generated by software clock"
            );
            Some(PeriodicTimer::new(Duration::from_secs_f64(1.0 / rate)))
        };

        info!(
            equipment = name,
            card_id = %config.card_id,
            channel = config.channel_number,
            usable_page_size,
            "equipment initialized"
        );

        let audit = config.dropped_packet_audit_interval;
        Ok(Self {
            name: name.to_owned(),
            config,
            pool,
            output,
            stats: Arc::new(EquipmentStats::new()),
            usable_page_size,
            inner: Mutex::new(Inner {
                channel,
                state: EquipmentState::Stopped,
                error_flag: false,
                waiting_first_loop: true,
                card_fifo_size: 0,
                last_packet_dropped: 0,
                packet_dropped_timer: PeriodicTimer::new(audit),
                software_clock,
                current_timeframe: 0,
                current_tf_orbit_begin: 0,
                first_tf_orbit_begin: 0,
                rdh_last_packet_counter: [0; MAX_LINK_ID as usize + 1],
                rdh_dump_remaining: 0,
                free_histogram: None,
                ready_histogram: None,
            }),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<EquipmentStats> {
        &self.stats
    }

    #[must_use]
    pub fn state(&self) -> EquipmentState {
        self.inner.lock().state
    }

    /// True once data loss was flagged under `stopOnError`.
    #[must_use]
    pub fn error_flag(&self) -> bool {
        self.inner.lock().error_flag
    }

    /// Start DMA and enter `Running`. Counters are reset so a
    /// stop/start cycle behaves like a fresh run.
    pub fn set_data_on(&self) -> Result<(), EquipmentError> {
        let mut inner = self.inner.lock();
        self.reset_counters(&mut inner);

        info!(equipment = %self.name, "starting DMA");
        if let Err(e) = inner.channel.start_dma() {
            error!(equipment = %self.name, error = %e, "DMA start failed");
            inner.state = EquipmentState::Faulted;
            return Err(e.into());
        }

        // The transfer queue is empty right after start; its free-slot
        // count is the card queue depth.
        inner.card_fifo_size = inner.channel.transfer_queue_available().max(1);
        info!(
            equipment = %self.name,
            queue_depth = inner.card_fifo_size,
            "card input queue sized"
        );

        if self.config.debug_stats_enabled {
            let depth = inner.card_fifo_size as u64;
            inner.free_histogram = Some(OccupancyHistogram::new("transfer queue", 12, depth));
            inner.ready_histogram = Some(OccupancyHistogram::new("ready queue", 12, depth));
        }

        inner.state = EquipmentState::Running;
        Ok(())
    }

    /// Stop submission, stop DMA and return undelivered in-flight pages to
    /// the pool.
    pub fn set_data_off(&self) -> Result<(), EquipmentError> {
        let mut inner = self.inner.lock();
        if inner.state == EquipmentState::Running {
            inner.state = EquipmentState::Stopped;
        }

        info!(equipment = %self.name, "stopping DMA");
        let stop_result = inner.channel.stop_dma();
        if let Err(e) = &stop_result {
            error!(equipment = %self.name, error = %e, "DMA stop failed");
            inner.state = EquipmentState::Faulted;
        }

        let reclaimed = inner.channel.reclaim_superpages();
        if !reclaimed.is_empty() {
            debug!(
                equipment = %self.name,
                pages = reclaimed.len(),
                "returning undelivered pages to pool"
            );
            for superpage in reclaimed {
                self.pool.release_ptr(superpage.user_data as *mut u8);
            }
        }

        stop_result.map_err(Into::into)
    }

    fn reset_counters(&self, inner: &mut Inner) {
        self.stats.reset();
        inner.error_flag = false;
        inner.waiting_first_loop = true;
        inner.card_fifo_size = 0;
        inner.last_packet_dropped = 0;
        inner.current_timeframe = 0;
        inner.current_tf_orbit_begin = 0;
        inner.first_tf_orbit_begin = 0;
        inner.rdh_last_packet_counter = [0; MAX_LINK_ID as usize + 1];
        inner.rdh_dump_remaining = self.config.rdh_dump_enabled;
        if let Some(clock) = &mut inner.software_clock {
            let interval = clock.interval();
            clock.reset(interval);
        }
    }

    /// End-of-run report.
    pub fn final_counters(&self) {
        let inner = self.inner.lock();
        if self.config.rdh_check_enabled {
            info!(
                equipment = %self.name,
                timeframes = self.stats.timeframes(),
                pages = self.stats.pages(),
                pages_lost = self.stats.pages_lost(),
                pages_empty = self.stats.pages_empty(),
                rdh_ok = self.stats.rdh_check_ok(),
                rdh_errors = self.stats.rdh_check_err(),
                stream_inconsistencies = self.stats.rdh_stream_err(),
                packets_dropped_by_card = inner.last_packet_dropped,
                "equipment summary"
            );
        } else {
            info!(
                equipment = %self.name,
                pages = self.stats.pages(),
                pages_lost = self.stats.pages_lost(),
                pages_empty = self.stats.pages_empty(),
                "equipment summary"
            );
        }
        if let Some(h) = &inner.free_histogram {
            h.dump();
        }
        if let Some(h) = &inner.ready_histogram {
            h.dump();
        }
    }

    /// One cooperative step: audit the card, refill its transfer queue, run
    /// driver maintenance, harvest and emit completed pages.
    pub fn step(&self) -> StepOutcome {
        let mut inner = self.inner.lock();
        match inner.state {
            EquipmentState::Faulted => return StepOutcome::Error,
            EquipmentState::Stopped => return StepOutcome::Idle,
            EquipmentState::Running => {}
        }

        // Downstream full: leave completions on the card, push nothing.
        if self.output.is_full() {
            return StepOutcome::Idle;
        }

        self.audit_dropped_packets(&mut inner);

        // Track a completely empty transfer queue (we did not refill fast
        // enough). Normal on the very first loop.
        if inner.waiting_first_loop {
            inner.waiting_first_loop = false;
        } else {
            let free = inner.channel.transfer_queue_available();
            if free == inner.card_fifo_size {
                self.stats.inc_fifo_up_empty(1);
            }
            self.stats.set_fifo_occupancy_free(free as u64);
            if let Some(h) = &inner.free_histogram {
                h.record(free as u64);
            }
        }

        let fill_active = self.fill_transfer_queue(&mut inner);

        let ready = inner.channel.ready_queue_size();
        self.stats.set_fifo_occupancy_ready(ready as u64);
        if ready == inner.card_fifo_size {
            self.stats.inc_fifo_ready_full(1);
        }
        if let Some(h) = &inner.ready_histogram {
            h.record(ready as u64);
        }

        // Driver-internal housekeeping, called once per step.
        inner.channel.fill_superpages();

        let harvested = self.harvest(&mut inner);

        if fill_active || harvested > 0 {
            StepOutcome::Ok
        } else {
            StepOutcome::Idle
        }
    }

    /// Once per second (and on the first step), compare the card's
    /// cumulative dropped-packet counter against the last audit.
    fn audit_dropped_packets(&self, inner: &mut Inner) {
        if !inner.waiting_first_loop && !inner.packet_dropped_timer.is_timeout() {
            return;
        }
        let current = inner.channel.dropped_packets();
        if current != inner.last_packet_dropped && !inner.waiting_first_loop {
            let delta = current - inner.last_packet_dropped;
            if delta > 0 {
                warn!(
                    equipment = %self.name,
                    delta,
                    total = current,
                    "card has dropped packets"
                );
                if self.config.stop_on_error {
                    error!(equipment = %self.name, "some data has been lost");
                    inner.error_flag = true;
                }
            }
        }
        inner.last_packet_dropped = current;
        if inner.waiting_first_loop {
            let interval = self.config.dropped_packet_audit_interval;
            inner.packet_dropped_timer.reset(interval);
        } else {
            inner.packet_dropped_timer.increment();
        }
    }

    /// Give free pages to the card while it has submission slots. Returns
    /// whether the step counts as active (at least a quarter of the queue
    /// depth was pushed).
    fn fill_transfer_queue(&self, inner: &mut Inner) -> bool {
        let mut pushed = 0usize;
        let mut active = false;
        while inner.channel.transfer_queue_available() != 0 {
            let Some(page) = self.pool.acquire() else {
                self.stats.inc_memory_low(1);
                active = false;
                break;
            };
            if self.config.clean_page_before_use {
                // SAFETY: the page was just acquired, so this equipment is
                // its only holder; the range is exactly one pool page.
                unsafe {
                    std::ptr::write_bytes(page.ptr(), 0, self.pool.page_size());
                }
            }
            let offset = page.ptr() as usize - self.pool.base_address() as usize
                + self.pool.reserved_prefix();
            let superpage = Superpage::new(offset, self.usable_page_size, page.ptr() as usize);
            if inner.channel.push_superpage(superpage) {
                pushed += 1;
                active = true;
            } else {
                // Push refused (typically DMA stopped meanwhile): the page
                // stays ours, give it back.
                self.pool.release(page);
                active = false;
                break;
            }
        }
        self.stats.add_pushed_up(pushed as u64);

        // Under a quarter of the queue depth pushed: not enough work to
        // justify an immediate re-invoke.
        if pushed < inner.card_fifo_size / 4 {
            active = false;
        }
        active
    }

    /// Pop completed superpages, annotate and emit them. Returns the number
    /// of superpages taken off the card.
    fn harvest(&self, inner: &mut Inner) -> usize {
        let mut harvested = 0usize;
        while inner.channel.ready_queue_size() > 0 && !self.output.is_full() {
            let Some(superpage) = inner.channel.pop_superpage() else {
                break;
            };
            harvested += 1;
            let page_ptr = superpage.user_data as *mut u8;

            if !superpage.is_ready() {
                // Leftover page handed back unfilled.
                self.stats.inc_pages_empty(1);
                self.pool.release_ptr(page_ptr);
                continue;
            }
            let Some(page) = self.pool.wrap_ptr(page_ptr) else {
                warn!(equipment = %self.name, ptr = ?page_ptr, "got an invalid page from card");
                self.pool.release_ptr(page_ptr);
                continue;
            };

            let block = DataBlock::new(page);
            self.stats.inc_pages(1);

            // Software clock mode: advance the timeframe id on each tick.
            if let Some(clock) = &mut inner.software_clock {
                if clock.is_timeout() {
                    inner.current_timeframe += 1;
                    self.stats.inc_timeframes(1);
                    clock.increment();
                }
            }

            block.set_payload_size(superpage.received);
            self.annotate(inner, &block);

            if inner.rdh_dump_remaining != 0 {
                self.dump_rdh(inner, &block);
            }
            if self.config.rdh_check_enabled {
                self.deep_check(inner, &block);
            }

            if let Err(block) = self.output.push(block) {
                // Ready superpage we cannot keep.
                self.stats.inc_pages_lost(1);
                drop(block);
            }
        }
        harvested
    }

    /// Parse the first RDH (when configured) and write the block's
    /// equipment id, link id and timeframe id.
    fn annotate(&self, inner: &mut Inner, block: &DataBlock) {
        let mut equipment_id = UNDEFINED_EQUIPMENT_ID;
        let mut link_id = UNDEFINED_LINK_ID;

        if self.config.rdh_use_first_in_page_enabled || self.config.rdh_check_enabled {
            match validate_rdh(block.payload()) {
                Err(description) => {
                    warn!(
                        equipment = %self.name,
                        %description,
                        "first RDH in page is wrong"
                    );
                }
                Ok(rdh) => {
                    // CRU id zero is the card default, not a real id.
                    equipment_id = if rdh.cru_id == 0 {
                        UNDEFINED_EQUIPMENT_ID
                    } else {
                        i32::from(rdh.cru_id)
                    };
                    link_id = i32::from(rdh.link_id);
                    if self.config.rdh_use_first_in_page_enabled {
                        self.update_timeframe_from_orbit(inner, rdh.hb_orbit);
                    }
                }
            }
        }

        block.set_equipment_id(equipment_id);
        block.set_link_id(link_id);
        block.set_timeframe_id(inner.current_timeframe);
    }

    /// Bucket an RDH heartbeat orbit into the fixed timeframe windows
    /// aligned to the first orbit seen.
    fn update_timeframe_from_orbit(&self, inner: &mut Inner, hb_orbit: u32) {
        let period = self.config.tf_period;
        let first_page = self.stats.pages() == 1;
        let window_end = u64::from(inner.current_tf_orbit_begin) + u64::from(period);
        if !first_page && u64::from(hb_orbit) < window_end {
            return;
        }
        if first_page {
            inner.first_tf_orbit_begin = hb_orbit;
        }
        self.stats.inc_timeframes(1);
        // Keep the window start periodic and aligned to the first timeframe.
        // Orbit counters are modular, hence the wrapping arithmetic.
        inner.current_tf_orbit_begin =
            hb_orbit.wrapping_sub(hb_orbit.wrapping_sub(inner.first_tf_orbit_begin) % period);
        let new_timeframe = 1 + u64::from(
            inner
                .current_tf_orbit_begin
                .wrapping_sub(inner.first_tf_orbit_begin)
                / period,
        );
        if new_timeframe != inner.current_timeframe + 1 && self.config.rdh_dump_error_enabled {
            warn!(
                equipment = %self.name,
                previous = inner.current_timeframe,
                new = new_timeframe,
                "non-contiguous timeframe ids"
            );
        }
        inner.current_timeframe = new_timeframe;
    }

    /// Log packet summaries for this page (`rdhDumpEnabled`).
    fn dump_rdh(&self, inner: &mut Inner, block: &DataBlock) {
        let payload = block.payload();
        let mut offset = 0usize;
        let mut failed = false;
        while offset < payload.len() {
            match validate_rdh(&payload[offset..]) {
                Err(description) => {
                    warn!(equipment = %self.name, offset, %description, "RDH dump");
                    failed = true;
                    break;
                }
                Ok(rdh) => {
                    info!(equipment = %self.name, offset, rdh = %rdh.describe(), "RDH dump");
                    if rdh.offset_next_packet == 0 {
                        break;
                    }
                    offset += rdh.offset_next_packet as usize;
                }
            }
        }
        if failed {
            info!(equipment = %self.name, "errors detected, suspending RDH dump");
            inner.rdh_dump_remaining = 0;
        } else {
            // Negative values climb toward zero and stop the dump there;
            // positive values keep it enabled.
            inner.rdh_dump_remaining += 1;
        }
    }

    /// Walk every RDH in the page and check structural and stream
    /// invariants (`rdhCheckEnabled`).
    fn deep_check(&self, inner: &mut Inner, block: &DataBlock) {
        let payload = block.payload();
        let first_link = block.header().link_id;
        let period = self.config.tf_period;
        let window_end = u64::from(inner.current_tf_orbit_begin) + u64::from(period);
        let dump_errors =
            self.config.rdh_dump_error_enabled || self.config.rdh_dump_enabled != 0;
        let mut offset = 0usize;
        let mut index = 0usize;

        while offset < payload.len() {
            index += 1;
            let rdh: Rdh = match validate_rdh(&payload[offset..]) {
                Err(description) => {
                    if dump_errors {
                        warn!(
                            equipment = %self.name,
                            rdh_index = index,
                            offset,
                            %description,
                            "RDH check failed"
                        );
                    }
                    self.stats.inc_rdh_check_err(1);
                    break;
                }
                Ok(rdh) => rdh,
            };
            self.stats.inc_rdh_check_ok(1);

            // The link id must be the same everywhere in the page.
            if first_link != i32::from(rdh.link_id) {
                if dump_errors {
                    warn!(
                        equipment = %self.name,
                        rdh_index = index,
                        offset,
                        expected = first_link,
                        found = rdh.link_id,
                        "inconsistent link ids in page"
                    );
                }
                self.stats.inc_rdh_stream_err(1);
                break;
            }

            // No timeframe boundary may be crossed inside one page.
            if self.config.rdh_use_first_in_page_enabled
                && u64::from(rdh.hb_orbit) >= window_end
            {
                if dump_errors {
                    warn!(
                        equipment = %self.name,
                        rdh_index = index,
                        offset,
                        hb_orbit = rdh.hb_orbit,
                        window_begin = inner.current_tf_orbit_begin,
                        tf_period = period,
                        "timeframe id change inside page not allowed"
                    );
                }
                self.stats.inc_rdh_stream_err(1);
                break;
            }

            // Per link, the packet counter repeats (duplicate) or
            // increments mod 256; a jump is reported and adopted.
            let slot = rdh.link_id as usize;
            let previous = inner.rdh_last_packet_counter[slot];
            if rdh.packet_counter != previous {
                if rdh.packet_counter != previous.wrapping_add(1) {
                    warn!(
                        equipment = %self.name,
                        rdh_index = index,
                        link = rdh.link_id,
                        from = previous,
                        to = rdh.packet_counter,
                        "possible packets dropped, packet counter jump"
                    );
                }
                inner.rdh_last_packet_counter[slot] = rdh.packet_counter;
            }

            if rdh.offset_next_packet == 0 {
                break;
            }
            offset += rdh.offset_next_packet as usize;
        }
    }
}
