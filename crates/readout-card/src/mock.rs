//! Software card for tests and bench runs without hardware.
//!
//! `MockCard` implements [`CardChannel`] against the registered DMA region:
//! submitted superpages move from the transfer queue to the ready queue on
//! `fill_superpages`, with a synthetic RDH packet chain written into the
//! page payload on the way.
//!
//! Two modes:
//! - **generator** (default): pages are synthesized continuously, cycling
//!   through the configured links with the heartbeat orbit advancing by
//!   `orbit_step` per page. Used by the demo binary.
//! - **scripted**: each ready page consumes one [`PageScript`] pushed via
//!   [`MockCardHandle`]; with an empty script the card sits idle. Used by
//!   tests that need exact orbits, corrupt headers or empty pages.
//!
//! Fault injection mirrors what real hardware misbehavior looks like from
//! the equipment's side: a cumulative dropped-packet counter, a failing
//! `start_dma`, and non-ready leftover superpages.

use crate::{CardChannel, CardError, CardParams, Superpage};
use parking_lot::Mutex;
use readout_core::rdh::{Rdh, RDH_HEADER_SIZE, RDH_VERSION};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Description of one page the scripted mock should produce.
#[derive(Debug, Clone)]
pub struct PageScript {
    pub link_id: u8,
    pub hb_orbit: u32,
    pub cru_id: u16,
    /// Number of RDH packets chained in the page (>= 1).
    pub packets: u16,
    /// Write an invalid first RDH (version 0).
    pub corrupt_first_rdh: bool,
    /// Link id for packets after the first (stream-error injection).
    pub second_link_id: Option<u8>,
    /// Orbit for packets after the first (timeframe-overlap injection).
    pub second_hb_orbit: Option<u32>,
    /// Force the per-link packet counter before writing this page.
    pub packet_counter_start: Option<u8>,
    /// Report this many received bytes instead of the written length.
    pub received_override: Option<u32>,
    /// Hand the superpage back without the ready flag (leftover page).
    pub not_ready: bool,
}

impl Default for PageScript {
    fn default() -> Self {
        Self {
            link_id: 0,
            hb_orbit: 0,
            cru_id: 1,
            packets: 1,
            corrupt_first_rdh: false,
            second_link_id: None,
            second_hb_orbit: None,
            packet_counter_start: None,
            received_override: None,
            not_ready: false,
        }
    }
}

struct MockState {
    started: bool,
    transfer: VecDeque<Superpage>,
    ready: VecDeque<Superpage>,
    script: VecDeque<PageScript>,
    next_orbit: u32,
    link_cursor: usize,
    /// Per-link packet counters, indexed by the raw link id byte.
    packet_counters: [u8; 256],
}

struct MockShared {
    state: Mutex<MockState>,
    dropped: AtomicI32,
}

/// Test-side handle for injecting behavior into a [`MockCard`] that the
/// equipment owns.
#[derive(Clone)]
pub struct MockCardHandle {
    shared: Arc<MockShared>,
}

impl MockCardHandle {
    pub fn push_script(&self, script: PageScript) {
        self.shared.state.lock().script.push_back(script);
    }

    /// Bump the cumulative dropped-packet counter, as firmware would.
    pub fn inject_dropped_packets(&self, delta: i32) {
        self.shared.dropped.fetch_add(delta, Ordering::Relaxed);
    }

    #[must_use]
    pub fn pending_scripts(&self) -> usize {
        self.shared.state.lock().script.len()
    }
}

pub struct MockCardBuilder {
    queue_depth: usize,
    links: Vec<u8>,
    cru_id: u16,
    packets_per_page: u16,
    packet_stride: u16,
    orbit_step: u32,
    first_orbit: u32,
    pages_per_fill: usize,
    generator: bool,
    fail_start_dma: bool,
}

impl Default for MockCardBuilder {
    fn default() -> Self {
        Self {
            queue_depth: 32,
            links: vec![0],
            cru_id: 1,
            packets_per_page: 4,
            packet_stride: 1024,
            orbit_step: 1,
            first_orbit: 0,
            pages_per_fill: 1,
            generator: true,
            fail_start_dma: false,
        }
    }
}

impl MockCardBuilder {
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    pub fn links(mut self, links: Vec<u8>) -> Self {
        assert!(!links.is_empty(), "at least one link required");
        self.links = links;
        self
    }

    pub fn cru_id(mut self, cru_id: u16) -> Self {
        self.cru_id = cru_id;
        self
    }

    pub fn packets_per_page(mut self, packets: u16) -> Self {
        self.packets_per_page = packets.max(1);
        self
    }

    pub fn packet_stride(mut self, stride: u16) -> Self {
        assert!(
            stride as usize >= RDH_HEADER_SIZE,
            "stride must hold at least one RDH"
        );
        self.packet_stride = stride;
        self
    }

    pub fn orbit_step(mut self, step: u32) -> Self {
        self.orbit_step = step;
        self
    }

    pub fn first_orbit(mut self, orbit: u32) -> Self {
        self.first_orbit = orbit;
        self
    }

    /// Pages moved to the ready queue per `fill_superpages` call.
    pub fn pages_per_fill(mut self, pages: usize) -> Self {
        self.pages_per_fill = pages.max(1);
        self
    }

    /// Scripted mode: pages are produced only from pushed [`PageScript`]s.
    pub fn scripted(mut self) -> Self {
        self.generator = false;
        self
    }

    /// Make `start_dma` fail, for fault-path tests.
    pub fn fail_start_dma(mut self) -> Self {
        self.fail_start_dma = true;
        self
    }

    #[must_use]
    pub fn build(self, params: CardParams) -> MockCard {
        info!(
            card_id = %params.card_id,
            channel = params.channel_number,
            queue_depth = self.queue_depth,
            region_size = params.region_size,
            "mock card attached to DMA region"
        );
        MockCard {
            params,
            queue_depth: self.queue_depth,
            links: self.links,
            cru_id: self.cru_id,
            packets_per_page: self.packets_per_page,
            packet_stride: self.packet_stride,
            orbit_step: self.orbit_step,
            pages_per_fill: self.pages_per_fill,
            generator: self.generator,
            fail_start_dma: self.fail_start_dma,
            shared: Arc::new(MockShared {
                state: Mutex::new(MockState {
                    started: false,
                    transfer: VecDeque::new(),
                    ready: VecDeque::new(),
                    script: VecDeque::new(),
                    next_orbit: self.first_orbit,
                    link_cursor: 0,
                    packet_counters: [0; 256],
                }),
                dropped: AtomicI32::new(0),
            }),
        }
    }
}

pub struct MockCard {
    params: CardParams,
    queue_depth: usize,
    links: Vec<u8>,
    cru_id: u16,
    packets_per_page: u16,
    packet_stride: u16,
    orbit_step: u32,
    pages_per_fill: usize,
    generator: bool,
    fail_start_dma: bool,
    shared: Arc<MockShared>,
}

impl MockCard {
    #[must_use]
    pub fn builder() -> MockCardBuilder {
        MockCardBuilder::default()
    }

    /// Injection handle; keep it before boxing the card for the equipment.
    #[must_use]
    pub fn handle(&self) -> MockCardHandle {
        MockCardHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Write the scripted packet chain into the superpage's payload area
    /// and mark it completed.
    fn complete_superpage(
        &self,
        superpage: &mut Superpage,
        script: &PageScript,
        counters: &mut [u8; 256],
    ) {
        let stride = self.packet_stride as usize;
        let max_packets = (superpage.size / stride).max(1) as u16;
        let packets = script.packets.clamp(1, max_packets);

        debug_assert!(superpage.offset + superpage.size <= self.params.region_size);
        // SAFETY: the superpage's payload window was carved from the
        // registered region by the equipment; the page is owned by the card
        // until it leaves the ready queue, so nobody else touches the bytes.
        let payload = unsafe {
            std::slice::from_raw_parts_mut(
                self.params.base_address.add(superpage.offset),
                superpage.size,
            )
        };

        if let Some(start) = script.packet_counter_start {
            counters[script.link_id as usize] = start;
        }

        let mut written = 0usize;
        for i in 0..packets {
            let link_id = if i == 0 {
                script.link_id
            } else {
                script.second_link_id.unwrap_or(script.link_id)
            };
            let hb_orbit = if i == 0 {
                script.hb_orbit
            } else {
                script.second_hb_orbit.unwrap_or(script.hb_orbit)
            };
            let counter = counters[link_id as usize];
            counters[link_id as usize] = counter.wrapping_add(1);

            let rdh = Rdh {
                version: if i == 0 && script.corrupt_first_rdh {
                    0
                } else {
                    RDH_VERSION
                },
                header_size: RDH_HEADER_SIZE as u8,
                offset_next_packet: if i + 1 == packets {
                    0
                } else {
                    self.packet_stride
                },
                memory_size: self.packet_stride,
                link_id,
                packet_counter: counter,
                cru_id: script.cru_id,
                hb_bc: 0,
                hb_orbit,
            };
            rdh.write(&mut payload[i as usize * stride..]);
            written += stride;
        }

        superpage.received = script.received_override.unwrap_or(written as u32);
        superpage.ready = !script.not_ready;
    }
}

impl CardChannel for MockCard {
    fn card_id(&self) -> &str {
        &self.params.card_id
    }

    fn start_dma(&mut self) -> Result<(), CardError> {
        if self.fail_start_dma {
            return Err(CardError::StartDma {
                card_id: self.params.card_id.clone(),
                reason: "firmware compatibility check failed".into(),
            });
        }
        self.shared.state.lock().started = true;
        debug!(card_id = %self.params.card_id, "mock DMA started");
        Ok(())
    }

    fn stop_dma(&mut self) -> Result<(), CardError> {
        self.shared.state.lock().started = false;
        debug!(card_id = %self.params.card_id, "mock DMA stopped");
        Ok(())
    }

    fn transfer_queue_available(&self) -> usize {
        let state = self.shared.state.lock();
        if !state.started {
            return 0;
        }
        self.queue_depth - state.transfer.len()
    }

    fn push_superpage(&mut self, superpage: Superpage) -> bool {
        let mut state = self.shared.state.lock();
        if !state.started || state.transfer.len() >= self.queue_depth {
            return false;
        }
        state.transfer.push_back(superpage);
        true
    }

    fn fill_superpages(&mut self) {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if !state.started {
            return;
        }
        for _ in 0..self.pages_per_fill {
            if state.transfer.is_empty() {
                break;
            }
            let script = if self.generator {
                let link_id = self.links[state.link_cursor % self.links.len()];
                state.link_cursor += 1;
                let hb_orbit = state.next_orbit;
                state.next_orbit = state.next_orbit.wrapping_add(self.orbit_step);
                PageScript {
                    link_id,
                    hb_orbit,
                    cru_id: self.cru_id,
                    packets: self.packets_per_page,
                    ..PageScript::default()
                }
            } else {
                match state.script.pop_front() {
                    Some(s) => s,
                    None => break,
                }
            };
            let mut superpage = state.transfer.pop_front().expect("checked non-empty");
            self.complete_superpage(&mut superpage, &script, &mut state.packet_counters);
            state.ready.push_back(superpage);
        }
    }

    fn ready_queue_size(&self) -> usize {
        self.shared.state.lock().ready.len()
    }

    fn pop_superpage(&mut self) -> Option<Superpage> {
        self.shared.state.lock().ready.pop_front()
    }

    fn dropped_packets(&self) -> i32 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    fn reclaim_superpages(&mut self) -> Vec<Superpage> {
        let mut state = self.shared.state.lock();
        let mut reclaimed: Vec<Superpage> = state.transfer.drain(..).collect();
        reclaimed.extend(state.ready.drain(..));
        reclaimed
    }
}
