//! End-to-end pipeline runs on mock cards.

use anyhow::Result;
use parking_lot::Mutex;
use readout_card::{CardChannel, CardParams, MockCard, MockCardHandle, PageScript};
use readout_core::consumer::{Consumer, ConsumerError};
use readout_core::{DataBlock, DataSet};
use readout_pool::MemoryPool;
use readout_server::{EquipmentConfig, Pipeline, ReadoutConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct SetSummary {
    equipment_id: i32,
    link_id: i32,
    timeframe_id: u64,
    len: usize,
    homogeneous: bool,
}

/// Consumer recording one summary per received set.
struct CollectingConsumer {
    sets: Arc<Mutex<Vec<SetSummary>>>,
}

impl Consumer for CollectingConsumer {
    fn name(&self) -> &str {
        "collector"
    }

    fn push_block(&mut self, block: &DataBlock) -> Result<(), ConsumerError> {
        let h = block.header();
        self.sets.lock().push(SetSummary {
            equipment_id: h.equipment_id,
            link_id: h.link_id,
            timeframe_id: h.timeframe_id,
            len: 1,
            homogeneous: true,
        });
        Ok(())
    }

    fn push_data_set(&mut self, set: &DataSet) -> Result<(), ConsumerError> {
        let first = set.blocks().first().map(|b| b.header());
        let Some(first) = first else {
            return Err(ConsumerError::Rejected("empty data set".into()));
        };
        let homogeneous = set.iter().all(|b| {
            let h = b.header();
            h.equipment_id == first.equipment_id
                && h.link_id == first.link_id
                && h.timeframe_id == first.timeframe_id
        });
        self.sets.lock().push(SetSummary {
            equipment_id: first.equipment_id,
            link_id: first.link_id,
            timeframe_id: first.timeframe_id,
            len: set.len(),
            homogeneous,
        });
        Ok(())
    }
}

fn generator_factory(
    links: Vec<u8>,
) -> impl Fn(&EquipmentConfig, &Arc<MemoryPool>) -> Result<Box<dyn CardChannel>> {
    move |eq: &EquipmentConfig, pool: &Arc<MemoryPool>| {
        let card = MockCard::builder()
            .cru_id((eq.channel_number + 1) as u16)
            .links(links.clone())
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
        Ok(Box::new(card) as Box<dyn CardChannel>)
    }
}

fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) {
    let until = Instant::now() + deadline;
    while !done() && Instant::now() < until {
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_generator_run_is_leak_free_and_homogeneous() {
    let config = ReadoutConfig::from_str(
        r#"
        [[equipment]]
        cardId = "mock:0"
        channelNumber = 0
        rdhUseFirstInPageEnabled = true
        rdhCheckEnabled = true
        TFperiod = 8
        memoryPoolNumberOfPages = 16
        memoryPoolPageSize = 65536
        outputFifoSize = 32

        [[equipment]]
        cardId = "mock:1"
        channelNumber = 1
        rdhUseFirstInPageEnabled = true
        TFperiod = 8
        memoryPoolNumberOfPages = 16
        memoryPoolPageSize = 65536
        outputFifoSize = 32

        [aggregator]
        sliceTimeout = 0.1
        "#,
    )
    .unwrap();

    let sets = Arc::new(Mutex::new(Vec::new()));
    let consumer = CollectingConsumer {
        sets: Arc::clone(&sets),
    };
    let factory = generator_factory(vec![0, 1]);
    let mut pipeline = Pipeline::build(&config, &factory, Box::new(consumer)).unwrap();
    pipeline.start().unwrap();
    wait_for(Duration::from_secs(5), || sets.lock().len() >= 20);
    pipeline.stop();

    for pool in pipeline.pools() {
        assert_eq!(
            pool.available(),
            pool.page_count(),
            "every page must be back in its pool"
        );
        assert_eq!(pool.double_release_count(), 0);
    }

    let sets = sets.lock();
    assert!(sets.len() >= 20, "only {} sets collected", sets.len());
    assert!(sets.iter().all(|s| s.homogeneous));
    assert!(sets.iter().all(|s| s.len >= 1));

    // per-source FIFO: timeframe ids never go backwards for one
    // (equipment, link) source
    let mut last_tf: HashMap<(i32, i32), u64> = HashMap::new();
    for s in sets.iter() {
        let key = (s.equipment_id, s.link_id);
        if let Some(prev) = last_tf.get(&key) {
            assert!(
                s.timeframe_id >= *prev,
                "timeframe went backwards for source {key:?}: {} -> {}",
                prev,
                s.timeframe_id
            );
        }
        last_tf.insert(key, s.timeframe_id);
    }

    for equipment in pipeline.equipments() {
        assert!(equipment.stats().pages() > 0);
        assert_eq!(equipment.stats().rdh_stream_err(), 0);
    }
}

#[test]
fn test_scripted_timeframe_batching_end_to_end() {
    // One link, TFperiod 4, orbits {100, 101, 104, 108, 112}:
    // data sets (in order) of sizes {2, 1, 1, 1}, the last closed by the
    // stop-time flush.
    let config = ReadoutConfig::from_str(
        r#"
        [[equipment]]
        cardId = "mock:0"
        rdhUseFirstInPageEnabled = true
        TFperiod = 4
        memoryPoolNumberOfPages = 16
        memoryPoolPageSize = 65536
        "#,
    )
    .unwrap();

    let stash: Mutex<Option<MockCardHandle>> = Mutex::new(None);
    let factory = |eq: &EquipmentConfig,
                   pool: &Arc<MemoryPool>|
     -> Result<Box<dyn CardChannel>> {
        let card = MockCard::builder()
            .scripted()
            .queue_depth(8)
            .pages_per_fill(8)
            .build(CardParams {
                card_id: eq.card_id.clone(),
                channel_number: eq.channel_number,
                data_source: eq.data_source.clone(),
                reset_level: eq.reset_level.clone(),
                firmware_check_enabled: eq.firmware_check_enabled,
                base_address: pool.base_address(),
                region_size: pool.base_size(),
            });
        *stash.lock() = Some(card.handle());
        Ok(Box::new(card) as Box<dyn CardChannel>)
    };

    let sets = Arc::new(Mutex::new(Vec::new()));
    let consumer = CollectingConsumer {
        sets: Arc::clone(&sets),
    };
    let mut pipeline = Pipeline::build(&config, &factory, Box::new(consumer)).unwrap();
    let handle = stash.lock().take().unwrap();
    for orbit in [100u32, 101, 104, 108, 112] {
        handle.push_script(PageScript {
            link_id: 3,
            hb_orbit: orbit,
            cru_id: 7,
            ..PageScript::default()
        });
    }

    pipeline.start().unwrap();
    wait_for(Duration::from_secs(5), || sets.lock().len() >= 3);
    pipeline.stop();

    let sets = sets.lock();
    let sizes: Vec<usize> = sets.iter().map(|s| s.len).collect();
    let timeframes: Vec<u64> = sets.iter().map(|s| s.timeframe_id).collect();
    assert_eq!(sizes, vec![2, 1, 1, 1]);
    assert_eq!(timeframes, vec![1, 2, 3, 4]);
    assert!(sets.iter().all(|s| s.homogeneous));
    assert!(sets.iter().all(|s| s.equipment_id == 7 && s.link_id == 3));

    for pool in pipeline.pools() {
        assert_eq!(pool.available(), pool.page_count());
    }
}

#[test]
fn test_pass_through_mode_end_to_end() {
    let config = ReadoutConfig::from_str(
        r#"
        [[equipment]]
        cardId = "mock:0"
        rdhUseFirstInPageEnabled = true
        memoryPoolNumberOfPages = 16
        memoryPoolPageSize = 65536

        [aggregator]
        disableSlicing = true
        "#,
    )
    .unwrap();

    let sets = Arc::new(Mutex::new(Vec::new()));
    let consumer = CollectingConsumer {
        sets: Arc::clone(&sets),
    };
    let factory = generator_factory(vec![0]);
    let mut pipeline = Pipeline::build(&config, &factory, Box::new(consumer)).unwrap();
    pipeline.start().unwrap();
    wait_for(Duration::from_secs(5), || sets.lock().len() >= 10);
    pipeline.stop();

    let sets = sets.lock();
    assert!(sets.len() >= 10);
    assert!(
        sets.iter().all(|s| s.len == 1),
        "pass-through must emit singleton sets"
    );
    for pool in pipeline.pools() {
        assert_eq!(pool.available(), pool.page_count());
    }
}
