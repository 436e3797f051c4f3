//! Channel transport over the shared scheduler
//!
//! The transport owns the [`TxnScheduler`] and registers the control
//! function on it. Outbound packets become control-function transactions
//! tagged with their channel (the HCI packet type). Inbound packets are
//! routed to whichever handler is open on their channel.

use std::sync::Arc;

use mcp_txnq::{
    BusConfig, BusDriver, FunctionId, Priority, SchedulerConfig, Transacted, Transaction, TxnDoneHook, TxnScheduler,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::HciError;
use crate::packet::Packet;

/// Handler for packets received on one channel
pub type RxHandler = Arc<dyn Fn(Packet) + Send + Sync>;

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Size of the channel table
    pub max_channels: usize,
    /// Priority queues opened for the control function
    pub max_priorities: usize,
    /// Scheduler limits
    pub scheduler: SchedulerConfig,
    /// Bus connection parameters
    pub bus: BusConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_channels: 40,
            max_priorities: 2,
            scheduler: SchedulerConfig::default(),
            bus: BusConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Parse from JSON, filling missing fields with defaults
    pub fn from_json(json: &str) -> Result<Self, HciError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), HciError> {
        self.scheduler.validate()?;
        if self.max_channels == 0 || self.max_channels > u8::MAX as usize + 1 {
            return Err(HciError::InvalidConfig(format!(
                "max_channels must be in 1..=256, got {}",
                self.max_channels
            )));
        }
        if self.max_priorities == 0 || self.max_priorities > self.scheduler.max_priorities {
            return Err(HciError::InvalidConfig(format!(
                "max_priorities must be in 1..={}, got {}",
                self.scheduler.max_priorities, self.max_priorities
            )));
        }
        Ok(())
    }
}

/// Transport counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    /// Packets accepted for transmission
    pub tx: u64,
    /// Transmissions completed
    pub tx_complete: u64,
    /// Packets received
    pub rx_indications: u64,
    /// Transmit rejections and undeliverable receptions
    pub errors: u64,
}

/// Channel layer over the transaction scheduler
pub struct Transport {
    config: TransportConfig,
    scheduler: Arc<TxnScheduler>,
    channels: Mutex<Vec<Option<RxHandler>>>,
    stats: Arc<Mutex<TransportStats>>,
}

impl Transport {
    /// Create a transport over `bus` and open the control function
    pub fn new(config: TransportConfig, bus: Box<dyn BusDriver>) -> Result<Arc<Self>, HciError> {
        config.validate()?;
        let scheduler = Arc::new(TxnScheduler::with_config(config.scheduler.clone(), bus)?);
        let stats = Arc::new(Mutex::new(TransportStats::default()));

        let counters = Arc::clone(&stats);
        scheduler.open(FunctionId::CTRL, config.max_priorities, move |mut txn, _ctx| {
            counters.lock().tx_complete += 1;
            if let Some(hook) = txn.take_done_hook() {
                hook(txn);
            }
        })?;

        info!(
            "Transport created ({} channels, {} priorities)",
            config.max_channels, config.max_priorities
        );
        Ok(Arc::new(Self {
            channels: Mutex::new(vec![None; config.max_channels]),
            config,
            scheduler,
            stats,
        }))
    }

    /// The shared scheduler, for other functions using the same bus
    pub fn scheduler(&self) -> &Arc<TxnScheduler> {
        &self.scheduler
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Install the receive handler for a channel
    pub fn ch_open(&self, channel: u8, handler: RxHandler) -> Result<(), HciError> {
        let mut channels = self.channels.lock();
        let max = channels.len();
        let slot = channels
            .get_mut(channel as usize)
            .ok_or(HciError::InvalidChannel { channel, max })?;
        if slot.is_some() {
            warn!("Channel {} already open, replacing handler", channel);
        }
        *slot = Some(handler);
        debug!("Channel {} opened", channel);
        Ok(())
    }

    /// Remove the receive handler for a channel
    pub fn ch_close(&self, channel: u8) -> Result<(), HciError> {
        let mut channels = self.channels.lock();
        let max = channels.len();
        let slot = channels
            .get_mut(channel as usize)
            .ok_or(HciError::InvalidChannel { channel, max })?;
        *slot = None;
        debug!("Channel {} closed", channel);
        Ok(())
    }

    pub fn is_channel_open(&self, channel: u8) -> bool {
        self.channels
            .lock()
            .get(channel as usize)
            .is_some_and(Option::is_some)
    }

    /// Transmit a packet at high priority
    pub fn tx_data(&self, packet: Packet) -> Result<(), HciError> {
        self.submit(packet, None)
    }

    /// Transmit a packet, running `on_done` once it leaves the bus
    pub fn tx_data_with(
        &self,
        packet: Packet,
        on_done: impl FnOnce(Transaction) + Send + 'static,
    ) -> Result<(), HciError> {
        self.submit(packet, Some(Box::new(on_done)))
    }

    fn submit(&self, packet: Packet, on_done: Option<TxnDoneHook>) -> Result<(), HciError> {
        let channel = packet.kind().channel();
        let mut txn = Transaction::new(FunctionId::CTRL, Priority::HIGH, packet.into_bytes()).with_channel(channel);
        if let Some(hook) = on_done {
            txn = txn.on_done(hook);
        }

        match self.scheduler.transact(txn) {
            Ok(Transacted::Pending) => {
                self.stats.lock().tx += 1;
                Ok(())
            }
            Ok(Transacted::Complete(mut txn)) => {
                {
                    let mut stats = self.stats.lock();
                    stats.tx += 1;
                    stats.tx_complete += 1;
                }
                if let Some(hook) = txn.take_done_hook() {
                    hook(txn);
                }
                Ok(())
            }
            Err(rejected) => {
                self.stats.lock().errors += 1;
                error!("Transmit on channel {} failed: {}", channel, rejected.kind);
                Err(HciError::Transmit(rejected))
            }
        }
    }

    /// Route a received packet to its channel handler
    pub fn rx_indication(&self, packet: Packet) -> Result<(), HciError> {
        let channel = packet.kind().channel();
        let handler = {
            let channels = self.channels.lock();
            let max = channels.len();
            self.stats.lock().rx_indications += 1;
            match channels.get(channel as usize) {
                Some(Some(handler)) => Arc::clone(handler),
                Some(None) => {
                    self.stats.lock().errors += 1;
                    error!("Received {:?} on closed channel {}", packet, channel);
                    return Err(HciError::ChannelClosed(channel));
                }
                None => {
                    self.stats.lock().errors += 1;
                    error!("Received packet on invalid channel {}", channel);
                    return Err(HciError::InvalidChannel { channel, max });
                }
            }
        };
        handler(packet);
        Ok(())
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> TransportStats {
        self.stats.lock().clone()
    }

    /// Bring the bus up with the configured parameters
    pub fn connect(&self) -> Result<(), HciError> {
        self.scheduler.connect_bus(&self.config.bus)?;
        Ok(())
    }

    pub fn disconnect(&self) -> Result<(), HciError> {
        self.scheduler.disconnect_bus()?;
        Ok(())
    }

    pub fn reset(&self, baud_rate: u32) -> Result<(), HciError> {
        self.scheduler.reset_bus(baud_rate)?;
        Ok(())
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Err(e) = self.scheduler.close(FunctionId::CTRL) {
            debug!("Control function already closed: {}", e);
        }
    }
}
