//! Contract implemented by downstream data consumers.

use crate::block::DataBlock;
use crate::dataset::DataSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsumerError {
    /// The consumer could not accept the data (downstream full, closed...).
    #[error("consumer rejected data: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A downstream consumer of readout data.
///
/// Consumers receive either whole [`DataSet`]s from the aggregator or
/// individual [`DataBlock`]s (e.g. a statistics consumer tapping the stream
/// before grouping). `Ok(())` means the data was accepted; the caller keeps
/// no copy afterwards.
pub trait Consumer: Send {
    fn name(&self) -> &str;

    /// Called when the run starts, before any data is pushed.
    fn starting(&mut self) -> Result<(), ConsumerError> {
        Ok(())
    }

    /// Called when the run stops, after the last push.
    fn stopping(&mut self) -> Result<(), ConsumerError> {
        Ok(())
    }

    fn push_block(&mut self, block: &DataBlock) -> Result<(), ConsumerError>;

    fn push_data_set(&mut self, set: &DataSet) -> Result<(), ConsumerError> {
        for block in set {
            self.push_block(block)?;
        }
        Ok(())
    }
}
