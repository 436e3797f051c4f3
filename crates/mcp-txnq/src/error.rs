//! Error types for the transaction scheduler

use thiserror::Error;

use crate::txn::{FunctionId, Priority, Transaction};

/// Errors that can occur in the scheduler
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Function id beyond the configured table
    #[error("function {function} out of range (max {max})")]
    FunctionOutOfRange {
        /// Requested function
        function: FunctionId,
        /// Configured number of functions
        max: usize,
    },

    /// More priority levels requested than configured
    #[error("{requested} priorities requested, at most {max} supported")]
    TooManyPriorities {
        /// Requested levels
        requested: usize,
        /// Configured maximum
        max: usize,
    },

    /// Function already registered
    #[error("function {0} already open")]
    AlreadyOpen(FunctionId),

    /// Function not registered
    #[error("function {0} not open")]
    NotOpen(FunctionId),

    /// Priority outside the function's registered levels
    #[error("priority {priority} invalid for function {function}")]
    InvalidPriority {
        /// Owning function
        function: FunctionId,
        /// Requested level
        priority: Priority,
    },

    /// Priority queue at capacity
    #[error("queue full (function {function}, priority {priority})")]
    QueueFull {
        /// Owning function
        function: FunctionId,
        /// Queue level
        priority: Priority,
    },

    /// Bus driver failed the caller's transaction synchronously
    #[error("bus driver rejected the transaction")]
    BusRejected,

    /// Bus driver control error
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// Configuration failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration failed to parse
    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

/// Errors reported by a bus driver's control operations
#[derive(Debug, Error)]
pub enum BusError {
    /// Bus not connected
    #[error("bus not connected")]
    NotConnected,

    /// Unsupported baud rate
    #[error("unsupported baud rate: {0}")]
    BadBaudRate(u32),

    /// Driver-specific failure
    #[error("driver failure: {0}")]
    Driver(String),
}

/// A transaction the scheduler refused or the bus failed, handed back to the caller
#[derive(Debug, Error)]
#[error("transaction {} rejected: {}", .txn.id(), .kind)]
pub struct Rejected {
    /// Why the transaction was refused
    pub kind: SchedulerError,
    txn: Box<Transaction>,
}

impl Rejected {
    pub(crate) fn new(kind: SchedulerError, txn: Transaction) -> Self {
        Self {
            kind,
            txn: Box::new(txn),
        }
    }

    /// The returned transaction
    pub fn transaction(&self) -> &Transaction {
        &self.txn
    }

    /// Take back ownership of the transaction
    pub fn into_transaction(self) -> Transaction {
        *self.txn
    }
}
