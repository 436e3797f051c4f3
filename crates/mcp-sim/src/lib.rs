//! Transport Simulation Library
//!
//! This crate provides a simulation layer for exercising the transaction
//! scheduler and the HCI adapter without a physical chip. It includes:
//!
//! - **VirtualBus**: A scripted [`BusDriver`](mcp_txnq::BusDriver) that
//!   records everything put on the bus
//! - **VirtualChip**: An HCI controller that answers commands with
//!   Command Complete / Command Status events
//! - **Completion task**: A tokio task that completes pending transactions
//!   from outside the caller's context
//!
//! # Example
//!
//! ```rust
//! use mcp_sim::{VirtualBus, VirtualChip};
//! use mcp_txnq::{FunctionId, Priority, Transaction, TxnScheduler};
//!
//! let (bus, probe) = VirtualBus::with_chip(VirtualChip::new());
//! let sched = TxnScheduler::new(Box::new(bus));
//! sched.open(FunctionId::BT, 1, |_, _| {}).unwrap();
//!
//! // HCI_Reset
//! let txn = Transaction::new(FunctionId::BT, Priority::HIGH, vec![0x01, 0x03, 0x0C, 0x00]);
//! sched.transact(txn).unwrap();
//!
//! // Command Complete for 0x0C03
//! assert_eq!(probe.take_rx(), Some(vec![0x04, 0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00]));
//! ```

pub mod bus;
pub mod chip;
pub mod completion;

pub use bus::{BusProbe, SentTxn, VirtualBus};
pub use chip::{event_packet, ChipError, Reply, VirtualChip};
pub use completion::{run_completion_task, spawn_completion_task, CompletionCommand};
