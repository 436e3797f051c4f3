//! Transaction scheduler
//!
//! Arbitrates one shared bus between prioritized client functions. Each
//! function owns one bounded queue per priority level plus a single-step
//! slot. Only one transaction is ever on the bus; the next one is chosen
//! when the bus goes idle:
//!
//! 1. Any pending single-step transaction, lowest function id first
//!    (regardless of the function's run state)
//! 2. Otherwise the head of the highest-priority non-empty queue across
//!    running functions, lowest function id first within a level
//!
//! State changes happen under one lock. Completion callbacks are collected
//! while it is held and invoked after it is released, so callbacks may
//! re-enter the scheduler.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::bus::{BusConfig, BusDriver, BusStatus};
use crate::error::{Rejected, SchedulerError};
use crate::queue::BoundedQueue;
use crate::txn::{FunctionId, Priority, Transaction, TxnId, TxnStatus};

/// Scheduler limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Size of the function table
    pub max_functions: usize,
    /// Maximum priority levels per function
    pub max_priorities: usize,
    /// Capacity of each priority queue
    pub queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_functions: 4,
            max_priorities: 2,
            queue_capacity: 64,
        }
    }
}

impl SchedulerConfig {
    /// Parse from JSON, filling missing fields with defaults
    pub fn from_json(json: &str) -> Result<Self, SchedulerError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.max_functions == 0 || self.max_functions > u8::MAX as usize + 1 {
            return Err(SchedulerError::InvalidConfig(format!(
                "max_functions must be in 1..=256, got {}",
                self.max_functions
            )));
        }
        if self.max_priorities == 0 || self.max_priorities > u8::MAX as usize + 1 {
            return Err(SchedulerError::InvalidConfig(format!(
                "max_priorities must be in 1..=256, got {}",
                self.max_priorities
            )));
        }
        if self.queue_capacity == 0 {
            return Err(SchedulerError::InvalidConfig(
                "queue_capacity must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Run state of a registered function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunctionState {
    /// Not registered
    None,
    /// Queued transactions are eligible for the bus
    Running,
    /// Queued transactions are held (single-step still runs)
    Stopped,
    /// Waiting for the in-flight transaction before draining the queues
    Restart,
}

/// Where a completion callback is being invoked from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionContext {
    /// Inside a client call (`transact`, `run`, `restart`)
    Caller,
    /// From the bus driver's completion path
    External,
}

impl CompletionContext {
    pub fn is_external(&self) -> bool {
        matches!(self, CompletionContext::External)
    }
}

/// Outcome of a successful [`TxnScheduler::transact`]
#[derive(Debug)]
pub enum Transacted {
    /// Finished synchronously; ownership returns to the caller
    Complete(Transaction),
    /// Queued or in flight; it will arrive through the done callback
    Pending,
}

/// Outcome of [`TxnScheduler::restart`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartStatus {
    /// Queues drained immediately
    Complete,
    /// Drain deferred until the in-flight transaction completes
    Pending,
}

/// Per-function completion callback
pub type DoneCallback = Arc<dyn Fn(Transaction, CompletionContext) + Send + Sync>;

struct FunctionEntry {
    state: FunctionState,
    queues: Vec<BoundedQueue<Transaction>>,
    single_step: Option<Transaction>,
    done_cb: DoneCallback,
}

/// A completion collected under the lock, delivered after release
struct Delivery {
    callback: DoneCallback,
    txn: Transaction,
    context: CompletionContext,
}

/// What happened to the transaction that triggered a scheduler pass
enum InputOutcome {
    Waiting,
    Complete(Transaction),
    Failed(Transaction),
}

struct Inner {
    config: SchedulerConfig,
    functions: Vec<Option<FunctionEntry>>,
    in_flight: Option<Transaction>,
    bus: Box<dyn BusDriver>,
    next_id: u64,
}

/// Shared-bus transaction scheduler
pub struct TxnScheduler {
    inner: Mutex<Inner>,
}

impl TxnScheduler {
    /// Create a scheduler with default limits
    pub fn new(bus: Box<dyn BusDriver>) -> Self {
        Self::build(SchedulerConfig::default(), bus)
    }

    /// Create a scheduler with explicit limits
    pub fn with_config(config: SchedulerConfig, bus: Box<dyn BusDriver>) -> Result<Self, SchedulerError> {
        config.validate()?;
        Ok(Self::build(config, bus))
    }

    fn build(config: SchedulerConfig, bus: Box<dyn BusDriver>) -> Self {
        let functions = (0..config.max_functions).map(|_| None).collect();
        Self {
            inner: Mutex::new(Inner {
                config,
                functions,
                in_flight: None,
                bus,
                next_id: 1,
            }),
        }
    }

    /// Register a function with `num_priorities` queues
    ///
    /// The function starts in [`FunctionState::Running`].
    pub fn open<F>(&self, function: FunctionId, num_priorities: usize, done_cb: F) -> Result<(), SchedulerError>
    where
        F: Fn(Transaction, CompletionContext) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        let max_functions = inner.config.max_functions;
        let max_priorities = inner.config.max_priorities;
        let capacity = inner.config.queue_capacity;

        let slot = inner
            .functions
            .get_mut(function.index())
            .ok_or(SchedulerError::FunctionOutOfRange {
                function,
                max: max_functions,
            })?;
        if num_priorities > max_priorities {
            return Err(SchedulerError::TooManyPriorities {
                requested: num_priorities,
                max: max_priorities,
            });
        }
        if slot.is_some() {
            return Err(SchedulerError::AlreadyOpen(function));
        }

        *slot = Some(FunctionEntry {
            state: FunctionState::Running,
            queues: (0..num_priorities).map(|_| BoundedQueue::new(capacity)).collect(),
            single_step: None,
            done_cb: Arc::new(done_cb),
        });
        info!("Opened function {} ({} priorities)", function, num_priorities);
        Ok(())
    }

    /// Unregister a function, discarding anything still queued for it
    ///
    /// An in-flight transaction owned by the function stays with the bus;
    /// its completion is dropped when it arrives.
    pub fn close(&self, function: FunctionId) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .functions
            .get_mut(function.index())
            .and_then(Option::take)
            .ok_or(SchedulerError::NotOpen(function))?;

        let discarded: usize =
            entry.queues.iter().map(BoundedQueue::len).sum::<usize>() + entry.single_step.is_some() as usize;
        if discarded > 0 {
            warn!("Closing function {} discards {} queued transactions", function, discarded);
        }
        if inner.in_flight.as_ref().is_some_and(|t| t.function() == function) {
            warn!("Closing function {} with a transaction on the bus", function);
        }
        info!("Closed function {}", function);
        Ok(())
    }

    /// Submit a transaction
    ///
    /// Single-step transactions go to the function's single-step slot,
    /// replacing any that has not yet reached the bus. Others are appended
    /// to their priority queue. A scheduler pass follows; other
    /// transactions it completes are delivered to their callbacks before
    /// this returns.
    pub fn transact(&self, mut txn: Transaction) -> Result<Transacted, Rejected> {
        let mut deliveries = Vec::new();

        let outcome = {
            let mut inner = self.inner.lock();
            let function = txn.function();
            let priority = txn.priority();

            let id = TxnId(inner.next_id);
            let Some(entry) = inner.functions.get_mut(function.index()).and_then(Option::as_mut) else {
                return Err(Rejected::new(SchedulerError::NotOpen(function), txn));
            };

            txn.assign_id(id);
            txn.set_status(TxnStatus::New);

            if txn.is_single_step() {
                if let Some(replaced) = entry.single_step.replace(txn) {
                    warn!(
                        "Single-step {} for function {} replaced before reaching the bus",
                        replaced.id(),
                        function
                    );
                }
            } else {
                let Some(queue) = entry.queues.get_mut(priority.index()) else {
                    return Err(Rejected::new(SchedulerError::InvalidPriority { function, priority }, txn));
                };
                if let Err(txn) = queue.enqueue(txn) {
                    warn!("Queue full for function {} priority {}", function, priority);
                    return Err(Rejected::new(SchedulerError::QueueFull { function, priority }, txn));
                }
            }
            inner.next_id += 1;
            trace!("Queued {} for function {}", id, function);

            inner.run_pass(Some(id), CompletionContext::Caller, &mut deliveries)
        };

        deliver(deliveries);

        match outcome {
            InputOutcome::Waiting => Ok(Transacted::Pending),
            InputOutcome::Complete(txn) => Ok(Transacted::Complete(txn)),
            InputOutcome::Failed(txn) => Err(Rejected::new(SchedulerError::BusRejected, txn)),
        }
    }

    /// Report completion of the in-flight transaction
    ///
    /// Called by the bus driver from its own context. `status` is the bus
    /// outcome (`Complete` or `Error`); a function awaiting restart gets
    /// the transaction back as `Recovery` instead, followed by its drained
    /// queues.
    pub fn txn_done(&self, id: TxnId, status: TxnStatus) {
        let mut deliveries = Vec::new();

        {
            let mut inner = self.inner.lock();
            let Some(mut txn) = inner.in_flight.take() else {
                warn!("Completion for {} with nothing in flight", id);
                return;
            };
            if txn.id() != id {
                warn!("Completion for {} but {} is in flight", id, txn.id());
                inner.in_flight = Some(txn);
                return;
            }

            let function = txn.function();
            match inner.functions.get_mut(function.index()).and_then(Option::as_mut) {
                None => {
                    warn!("Dropping completion of {} for closed function {}", id, function);
                }
                Some(entry) if entry.state == FunctionState::Restart => {
                    txn.set_status(TxnStatus::Recovery);
                    deliveries.push(Delivery {
                        callback: Arc::clone(&entry.done_cb),
                        txn,
                        context: CompletionContext::External,
                    });
                    drain_function(entry, CompletionContext::External, &mut deliveries);
                    entry.state = FunctionState::Running;
                    info!("Function {} restarted", function);
                }
                Some(entry) => {
                    txn.set_status(match status {
                        TxnStatus::Error => TxnStatus::Error,
                        _ => TxnStatus::Complete,
                    });
                    deliveries.push(Delivery {
                        callback: Arc::clone(&entry.done_cb),
                        txn,
                        context: CompletionContext::External,
                    });
                }
            }

            inner.run_pass(None, CompletionContext::External, &mut deliveries);
        }

        deliver(deliveries);
    }

    /// Mark a function running and kick the scheduler
    ///
    /// A pending restart is left in place.
    pub fn run(&self, function: FunctionId) -> Result<(), SchedulerError> {
        let mut deliveries = Vec::new();

        {
            let mut inner = self.inner.lock();
            let entry = inner.entry_mut(function)?;
            match entry.state {
                FunctionState::Restart => debug!("Function {} run while restart pending", function),
                _ => entry.state = FunctionState::Running,
            }
            inner.run_pass(None, CompletionContext::Caller, &mut deliveries);
        }

        deliver(deliveries);
        Ok(())
    }

    /// Hold a function's queued transactions
    ///
    /// Queues are kept; single-step transactions still run. A pending
    /// restart is left in place.
    pub fn stop(&self, function: FunctionId) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock();
        let entry = inner.entry_mut(function)?;
        match entry.state {
            FunctionState::Restart => debug!("Function {} stopped while restart pending", function),
            _ => entry.state = FunctionState::Stopped,
        }
        Ok(())
    }

    /// Drain a function's queues, completing everything as `Recovery`
    ///
    /// When the function owns the in-flight transaction the drain waits for
    /// its completion.
    pub fn restart(&self, function: FunctionId) -> Result<RestartStatus, SchedulerError> {
        let mut deliveries = Vec::new();

        let status = {
            let mut inner = self.inner.lock();
            let busy = inner.in_flight.as_ref().is_some_and(|t| t.function() == function);
            let entry = inner.entry_mut(function)?;

            if busy {
                entry.state = FunctionState::Restart;
                debug!("Function {} restart deferred until bus completion", function);
                RestartStatus::Pending
            } else {
                drain_function(entry, CompletionContext::Caller, &mut deliveries);
                info!("Function {} restarted", function);
                RestartStatus::Complete
            }
        };

        deliver(deliveries);
        Ok(status)
    }

    /// Whether a function has nothing queued at any priority
    pub fn is_queue_empty(&self, function: FunctionId) -> bool {
        let inner = self.inner.lock();
        inner
            .entry(function)
            .map(|e| e.queues.iter().all(BoundedQueue::is_empty))
            .unwrap_or(true)
    }

    /// Number of transactions queued at one priority
    pub fn queue_len(&self, function: FunctionId, priority: Priority) -> usize {
        let inner = self.inner.lock();
        inner
            .entry(function)
            .and_then(|e| e.queues.get(priority.index()))
            .map(BoundedQueue::len)
            .unwrap_or(0)
    }

    /// Whether a single-step transaction is waiting for the bus
    pub fn has_single_step(&self, function: FunctionId) -> bool {
        let inner = self.inner.lock();
        inner.entry(function).is_some_and(|e| e.single_step.is_some())
    }

    pub fn function_state(&self, function: FunctionId) -> FunctionState {
        let inner = self.inner.lock();
        inner.entry(function).map(|e| e.state).unwrap_or(FunctionState::None)
    }

    /// The transaction currently owned by the bus driver
    pub fn in_flight(&self) -> Option<(FunctionId, TxnId)> {
        let inner = self.inner.lock();
        inner.in_flight.as_ref().map(|t| (t.function(), t.id()))
    }

    pub fn config(&self) -> SchedulerConfig {
        self.inner.lock().config.clone()
    }

    /// Bring the bus up
    pub fn connect_bus(&self, config: &BusConfig) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock();
        inner.bus.connect(config)?;
        info!("Bus connected at {} baud", config.baud_rate);
        Ok(())
    }

    /// Take the bus down
    pub fn disconnect_bus(&self) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock();
        inner.bus.disconnect()?;
        info!("Bus disconnected");
        Ok(())
    }

    /// Re-initialize the bus at a new line rate
    pub fn reset_bus(&self, baud_rate: u32) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock();
        inner.bus.reset(baud_rate)?;
        info!("Bus reset to {} baud", baud_rate);
        Ok(())
    }
}

impl Inner {
    fn entry(&self, function: FunctionId) -> Option<&FunctionEntry> {
        self.functions.get(function.index()).and_then(Option::as_ref)
    }

    fn entry_mut(&mut self, function: FunctionId) -> Result<&mut FunctionEntry, SchedulerError> {
        self.functions
            .get_mut(function.index())
            .and_then(Option::as_mut)
            .ok_or(SchedulerError::NotOpen(function))
    }

    /// Pick the next transaction for the bus
    fn select(&mut self) -> Option<Transaction> {
        for entry in self.functions.iter_mut().flatten() {
            if let Some(txn) = entry.single_step.take() {
                return Some(txn);
            }
        }

        for prio in 0..self.config.max_priorities {
            for entry in self.functions.iter_mut().flatten() {
                if entry.state != FunctionState::Running {
                    continue;
                }
                if let Some(txn) = entry.queues.get_mut(prio).and_then(BoundedQueue::dequeue) {
                    return Some(txn);
                }
            }
        }
        None
    }

    /// Feed the bus until it goes busy, fails, or runs out of work
    ///
    /// Completions other than `input` are pushed to `deliveries`.
    fn run_pass(
        &mut self,
        input: Option<TxnId>,
        context: CompletionContext,
        deliveries: &mut Vec<Delivery>,
    ) -> InputOutcome {
        if self.in_flight.is_some() {
            return InputOutcome::Waiting;
        }

        let mut outcome = InputOutcome::Waiting;
        while let Some(mut txn) = self.select() {
            let is_input = input == Some(txn.id());
            let status = self.bus.transact(&mut txn);
            trace!("Bus returned {:?} for {}", status, txn.id());

            match status {
                BusStatus::Complete => {
                    txn.set_status(TxnStatus::Complete);
                    if is_input {
                        outcome = InputOutcome::Complete(txn);
                    } else {
                        self.push_delivery(txn, context, deliveries);
                    }
                }
                BusStatus::Pending => {
                    self.in_flight = Some(txn);
                    break;
                }
                BusStatus::Error => {
                    warn!("Bus failed {} for function {}", txn.id(), txn.function());
                    txn.set_status(TxnStatus::Error);
                    if is_input {
                        outcome = InputOutcome::Failed(txn);
                    } else {
                        self.push_delivery(txn, context, deliveries);
                    }
                    break;
                }
            }
        }
        outcome
    }

    fn push_delivery(&self, txn: Transaction, context: CompletionContext, deliveries: &mut Vec<Delivery>) {
        match self.entry(txn.function()) {
            Some(entry) => deliveries.push(Delivery {
                callback: Arc::clone(&entry.done_cb),
                txn,
                context,
            }),
            None => warn!("Dropping completion of {} for closed function {}", txn.id(), txn.function()),
        }
    }
}

/// Complete a function's single-step slot and every queue as `Recovery`
fn drain_function(entry: &mut FunctionEntry, context: CompletionContext, deliveries: &mut Vec<Delivery>) {
    let single = entry.single_step.take();
    let queued = entry.queues.iter_mut().flat_map(|q| q.drain().collect::<Vec<_>>());
    for mut txn in single.into_iter().chain(queued) {
        txn.set_status(TxnStatus::Recovery);
        deliveries.push(Delivery {
            callback: Arc::clone(&entry.done_cb),
            txn,
            context,
        });
    }
}

fn deliver(deliveries: Vec<Delivery>) {
    for Delivery { callback, txn, context } in deliveries {
        callback(txn, context);
    }
}
