//! Bus driver seam
//!
//! The scheduler hands one transaction at a time to a [`BusDriver`]. A
//! driver either finishes it on the spot, fails it, or accepts it for
//! asynchronous completion and later reports back through
//! [`TxnScheduler::txn_done`](crate::TxnScheduler::txn_done).

use serde::{Deserialize, Serialize};

use crate::error::BusError;
use crate::txn::Transaction;

/// Result of handing a transaction to the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusStatus {
    /// Finished synchronously
    Complete,
    /// Accepted; completion arrives later via `txn_done`
    Pending,
    /// Failed synchronously
    Error,
}

/// Physical bus settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Line rate in baud
    pub baud_rate: u32,
    /// Hardware flow control
    pub flow_control: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            flow_control: true,
        }
    }
}

/// A driver for the shared physical bus
///
/// `transact` runs while the scheduler's lock is held. A driver returning
/// [`BusStatus::Pending`] must report completion from another context and
/// never from inside `transact`.
pub trait BusDriver: Send {
    /// Start a transaction
    fn transact(&mut self, txn: &mut Transaction) -> BusStatus;

    /// Bring the bus up
    fn connect(&mut self, _config: &BusConfig) -> Result<(), BusError> {
        Ok(())
    }

    /// Take the bus down
    fn disconnect(&mut self) -> Result<(), BusError> {
        Ok(())
    }

    /// Re-initialize at a new line rate
    fn reset(&mut self, _baud_rate: u32) -> Result<(), BusError> {
        Ok(())
    }
}
