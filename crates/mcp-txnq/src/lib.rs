//! Shared-bus transaction queue
//!
//! This crate arbitrates a single physical bus between several client
//! functions (Bluetooth, FM, GPS, ...) that each submit transactions at one
//! or more priority levels.
//!
//! # Architecture
//!
//! - [`TxnScheduler`] owns per-function priority queues and the one
//!   transaction currently on the bus
//! - A [`BusDriver`] performs the I/O, completing synchronously or
//!   reporting back later through [`TxnScheduler::txn_done`]
//! - Completed transactions return to their function through the
//!   callback registered with [`TxnScheduler::open`]
//!
//! [`BoundedQueue`] and [`NodePool`] are the fixed-capacity containers the
//! scheduler and the HCI layer build on.
//!
//! # Example
//!
//! ```rust,no_run
//! use mcp_txnq::{BusDriver, BusStatus, FunctionId, Priority, Transaction, TxnScheduler};
//!
//! struct Loopback;
//!
//! impl BusDriver for Loopback {
//!     fn transact(&mut self, _txn: &mut Transaction) -> BusStatus {
//!         BusStatus::Complete
//!     }
//! }
//!
//! let sched = TxnScheduler::new(Box::new(Loopback));
//! sched.open(FunctionId::BT, 2, |txn, _ctx| {
//!     println!("{} done: {:?}", txn.id(), txn.status());
//! })?;
//!
//! let txn = Transaction::new(FunctionId::BT, Priority::HIGH, vec![0x01, 0x03, 0x0C, 0x00]);
//! sched.transact(txn)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod bus;
pub mod error;
pub mod pool;
pub mod queue;
pub mod scheduler;
pub mod txn;

pub use bus::{BusConfig, BusDriver, BusStatus};
pub use error::{BusError, Rejected, SchedulerError};
pub use pool::{NodeId, NodePool};
pub use queue::BoundedQueue;
pub use scheduler::{
    CompletionContext, DoneCallback, FunctionState, RestartStatus, SchedulerConfig, Transacted, TxnScheduler,
};
pub use txn::{FunctionId, Priority, Transaction, TxnDoneHook, TxnId, TxnParams, TxnStatus};
