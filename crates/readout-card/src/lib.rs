//! Readout card driver seam.
//!
//! [`CardChannel`] is the narrow interface the readout equipment drives: a
//! DMA channel with a transfer (submission) queue of free pages and a ready
//! (completion) queue of filled superpages, plus a cumulative dropped-packet
//! counter maintained by the card firmware.
//!
//! A *superpage* is the driver's unit of transfer: one memory-pool page.
//! The caller submits `{offset, size, user_data}`; the card fills the bytes
//! at `offset` inside the registered DMA region and hands the superpage back
//! through the ready queue with `received` set. `user_data` round-trips
//! untouched and carries the original page address.
//!
//! Hardware-facing implementations live behind this trait; [`mock::MockCard`]
//! is the software card used by tests and the demo binary.

pub mod mock;

pub use mock::{MockCard, MockCardBuilder, MockCardHandle, PageScript};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CardError {
    #[error("card {card_id}: failed to start DMA: {reason}")]
    StartDma { card_id: String, reason: String },

    #[error("card {card_id}: failed to stop DMA: {reason}")]
    StopDma { card_id: String, reason: String },
}

/// One DMA transfer unit: a memory-pool page in flight through the card.
#[derive(Debug, Clone, Copy)]
pub struct Superpage {
    /// Byte offset of the payload area inside the registered DMA region.
    pub offset: usize,
    /// Usable payload size in bytes.
    pub size: usize,
    /// Opaque caller data; the equipment stores the page start address.
    pub user_data: usize,
    /// Bytes actually transferred; valid once the superpage is ready.
    pub received: u32,
    /// True when the transfer completed; false for leftover pages handed
    /// back unfilled.
    pub ready: bool,
}

impl Superpage {
    #[must_use]
    pub fn new(offset: usize, size: usize, user_data: usize) -> Self {
        Self {
            offset,
            size,
            user_data,
            received: 0,
            ready: false,
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready
    }
}

/// Opaque driver parameters passed through from configuration, plus the DMA
/// region registration.
#[derive(Debug, Clone)]
pub struct CardParams {
    pub card_id: String,
    pub channel_number: i32,
    pub data_source: String,
    pub reset_level: String,
    pub firmware_check_enabled: bool,
    /// Base address of the DMA region registered with the card.
    pub base_address: *mut u8,
    /// Size of the registered region in bytes.
    pub region_size: usize,
}

// SAFETY: the base address is a registration token for a region owned by
// the memory pool, which outlives the channel; the params struct itself
// holds no exclusive access.
unsafe impl Send for CardParams {}

/// DMA channel of one card, as driven by the readout equipment.
///
/// All queue operations are non-blocking; the equipment polls and backs off
/// with `Idle` when nothing moves.
pub trait CardChannel: Send {
    fn card_id(&self) -> &str;

    /// Start the DMA engine. The transfer queue reports its full depth
    /// afterwards.
    fn start_dma(&mut self) -> Result<(), CardError>;

    /// Stop the DMA engine; subsequent pushes fail.
    fn stop_dma(&mut self) -> Result<(), CardError>;

    /// Free slots in the transfer queue (0 when DMA is stopped).
    fn transfer_queue_available(&self) -> usize;

    /// Submit a free page. Returns false when the submission was refused
    /// (queue full or DMA stopped); the caller keeps page ownership then.
    fn push_superpage(&mut self, superpage: Superpage) -> bool;

    /// Per-step driver maintenance: progresses submitted pages toward the
    /// ready queue.
    fn fill_superpages(&mut self);

    /// Number of completed superpages waiting in the ready queue.
    fn ready_queue_size(&self) -> usize;

    /// Pop the oldest completed superpage.
    fn pop_superpage(&mut self) -> Option<Superpage>;

    /// Cumulative dropped-packet counter reported by the card.
    fn dropped_packets(&self) -> i32;

    /// Drain both card queues after `stop_dma`, handing page ownership back
    /// to the caller so undelivered pages can be returned to the pool.
    fn reclaim_superpages(&mut self) -> Vec<Superpage>;
}
