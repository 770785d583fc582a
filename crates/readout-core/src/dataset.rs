//! Ordered batches of data blocks.

use crate::block::DataBlock;

/// An ordered sequence of data blocks sharing one source and one timeframe.
///
/// Blocks appear in the order they were harvested from the card. A set is
/// append-only while the slicer owns it; publishing moves it into the output
/// queue, which freezes it by ownership.
#[derive(Default)]
pub struct DataSet {
    blocks: Vec<DataBlock>,
}

impl DataSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, block: DataBlock) {
        self.blocks.push(block);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    #[must_use]
    pub fn blocks(&self) -> &[DataBlock] {
        &self.blocks
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DataBlock> {
        self.blocks.iter()
    }

    /// Sum of the payload sizes of all blocks in the set.
    #[must_use]
    pub fn total_payload_bytes(&self) -> u64 {
        self.blocks
            .iter()
            .map(|b| u64::from(b.header().payload_size))
            .sum()
    }
}

impl std::fmt::Debug for DataSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSet")
            .field("blocks", &self.blocks.len())
            .field("payload_bytes", &self.total_payload_bytes())
            .finish()
    }
}

impl<'a> IntoIterator for &'a DataSet {
    type Item = &'a DataBlock;
    type IntoIter = std::slice::Iter<'a, DataBlock>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.iter()
    }
}
