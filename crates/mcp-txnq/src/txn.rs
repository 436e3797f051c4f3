//! Transaction model
//!
//! A [`Transaction`] is one atomic unit of bus I/O. The caller builds it,
//! the scheduler owns it while it is queued or on the bus, and ownership
//! returns to the caller through a completion callback (or directly from
//! [`TxnScheduler::transact`](crate::TxnScheduler::transact) when it
//! completes synchronously).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a client function sharing the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId(pub u8);

impl FunctionId {
    /// Bus control function (owned by the transport layer)
    pub const CTRL: FunctionId = FunctionId(0);
    /// Bluetooth
    pub const BT: FunctionId = FunctionId(1);
    /// FM radio
    pub const FM: FunctionId = FunctionId(2);
    /// GPS / navigation controller
    pub const NAVC: FunctionId = FunctionId(3);

    /// Get the raw id as a table index
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Queue priority; 0 is the most urgent level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Priority(pub u8);

impl Priority {
    /// Highest priority level
    pub const HIGH: Priority = Priority(0);
    /// Lowest priority level of a two-level function
    pub const LOW: Priority = Priority(1);

    /// Get the raw level as a queue index
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduler-assigned transaction id (0 until submitted)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Completion status carried by a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TxnStatus {
    /// Not yet completed
    #[default]
    New,
    /// Completed on the bus
    Complete,
    /// The bus driver failed the transaction
    Error,
    /// Drained by a function restart without reaching the bus
    Recovery,
}

impl TxnStatus {
    /// Whether this status is final
    pub fn is_final(&self) -> bool {
        !matches!(self, TxnStatus::New)
    }
}

/// Routing attributes of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnParams {
    /// Owning function
    pub function: FunctionId,
    /// Queue priority within the function
    pub priority: Priority,
    /// Out-of-band transaction that bypasses the priority queues
    pub single_step: bool,
    /// Transport channel (HCI packet type) this transaction belongs to
    pub channel: u8,
}

/// Hook run by the transport layer when its transaction completes
pub type TxnDoneHook = Box<dyn FnOnce(Transaction) + Send>;

/// One unit of bus I/O
pub struct Transaction {
    id: TxnId,
    params: TxnParams,
    status: TxnStatus,
    data: Vec<u8>,
    on_done: Option<TxnDoneHook>,
}

impl Transaction {
    /// Create a normal (queued) transaction
    pub fn new(function: FunctionId, priority: Priority, data: Vec<u8>) -> Self {
        Self {
            id: TxnId::default(),
            params: TxnParams {
                function,
                priority,
                single_step: false,
                channel: 0,
            },
            status: TxnStatus::New,
            data,
            on_done: None,
        }
    }

    /// Mark as single-step
    pub fn single_step(mut self) -> Self {
        self.params.single_step = true;
        self
    }

    /// Tag with a transport channel
    pub fn with_channel(mut self, channel: u8) -> Self {
        self.params.channel = channel;
        self
    }

    /// Attach a per-transaction completion hook
    pub fn on_done(mut self, hook: impl FnOnce(Transaction) + Send + 'static) -> Self {
        self.on_done = Some(Box::new(hook));
        self
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn params(&self) -> &TxnParams {
        &self.params
    }

    pub fn function(&self) -> FunctionId {
        self.params.function
    }

    pub fn priority(&self) -> Priority {
        self.params.priority
    }

    pub fn is_single_step(&self) -> bool {
        self.params.single_step
    }

    pub fn channel(&self) -> u8 {
        self.params.channel
    }

    pub fn status(&self) -> TxnStatus {
        self.status
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable buffer access for drivers that read into the transaction
    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// Consume the transaction, keeping its buffer
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Take the completion hook, leaving none behind
    pub fn take_done_hook(&mut self) -> Option<TxnDoneHook> {
        self.on_done.take()
    }

    pub(crate) fn assign_id(&mut self, id: TxnId) {
        self.id = id;
    }

    pub(crate) fn set_status(&mut self, status: TxnStatus) {
        self.status = status;
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("params", &self.params)
            .field("status", &self.status)
            .field("len", &self.data.len())
            .field("on_done", &self.on_done.is_some())
            .finish()
    }
}
