//! Scripted bus driver
//!
//! [`VirtualBus`] implements [`BusDriver`] without hardware. The matching
//! [`BusProbe`] stays with the test: it scripts the status each transaction
//! gets, records everything put on the bus, and collects the events an
//! attached [`VirtualChip`] produces in reply.

use std::collections::VecDeque;
use std::sync::Arc;

use mcp_txnq::{BusConfig, BusDriver, BusError, BusStatus, FunctionId, Priority, Transaction, TxnId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::chip::VirtualChip;

/// A transaction as it appeared on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentTxn {
    pub id: TxnId,
    pub function: FunctionId,
    pub priority: Priority,
    pub single_step: bool,
    pub channel: u8,
    pub data: Vec<u8>,
}

impl SentTxn {
    fn capture(txn: &Transaction) -> Self {
        Self {
            id: txn.id(),
            function: txn.function(),
            priority: txn.priority(),
            single_step: txn.is_single_step(),
            channel: txn.channel(),
            data: txn.data().to_vec(),
        }
    }
}

#[derive(Debug)]
struct ProbeState {
    default_status: BusStatus,
    script: VecDeque<BusStatus>,
    sent: Vec<SentTxn>,
    connected: bool,
    baud_rate: u32,
    chip: Option<VirtualChip>,
    rx: VecDeque<Vec<u8>>,
    completions: Option<mpsc::UnboundedSender<TxnId>>,
}

/// Test-side handle to a [`VirtualBus`]
#[derive(Debug, Clone)]
pub struct BusProbe {
    state: Arc<Mutex<ProbeState>>,
}

/// Simulated bus driver
#[derive(Debug)]
pub struct VirtualBus {
    state: Arc<Mutex<ProbeState>>,
}

impl VirtualBus {
    /// Create a bus that completes everything synchronously
    pub fn new() -> (Self, BusProbe) {
        let state = Arc::new(Mutex::new(ProbeState {
            default_status: BusStatus::Complete,
            script: VecDeque::new(),
            sent: Vec::new(),
            connected: false,
            baud_rate: 0,
            chip: None,
            rx: VecDeque::new(),
            completions: None,
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            BusProbe { state },
        )
    }

    /// Create a bus with a chip attached behind it
    pub fn with_chip(chip: VirtualChip) -> (Self, BusProbe) {
        let (bus, probe) = Self::new();
        probe.state.lock().chip = Some(chip);
        (bus, probe)
    }
}

impl BusDriver for VirtualBus {
    fn transact(&mut self, txn: &mut Transaction) -> BusStatus {
        let mut state = self.state.lock();
        let status = state.script.pop_front().unwrap_or(state.default_status);
        state.sent.push(SentTxn::capture(txn));
        debug!(
            "Virtual bus {:?} for {} (function {}, {} bytes)",
            status,
            txn.id(),
            txn.function(),
            txn.data().len()
        );

        if status != BusStatus::Error {
            let reply = match state.chip.as_mut() {
                Some(chip) => chip.process(txn.data()),
                None => Ok(None),
            };
            match reply {
                Ok(Some(event)) => state.rx.push_back(event),
                Ok(None) => {}
                Err(e) => warn!("Virtual chip rejected {}: {}", txn.id(), e),
            }
        }

        if status == BusStatus::Pending {
            if let Some(tx) = &state.completions {
                if tx.send(txn.id()).is_err() {
                    warn!("Completion task gone; {} will never complete", txn.id());
                }
            }
        }
        status
    }

    fn connect(&mut self, config: &BusConfig) -> Result<(), BusError> {
        let mut state = self.state.lock();
        state.connected = true;
        state.baud_rate = config.baud_rate;
        info!("Virtual bus connected at {} baud", config.baud_rate);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), BusError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(BusError::NotConnected);
        }
        state.connected = false;
        Ok(())
    }

    fn reset(&mut self, baud_rate: u32) -> Result<(), BusError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(BusError::NotConnected);
        }
        if baud_rate == 0 {
            return Err(BusError::BadBaudRate(baud_rate));
        }
        state.baud_rate = baud_rate;
        Ok(())
    }
}

impl BusProbe {
    /// Status returned once the script runs out
    pub fn set_default_status(&self, status: BusStatus) {
        self.state.lock().default_status = status;
    }

    /// Queue one-shot statuses for the next transactions
    pub fn script(&self, statuses: impl IntoIterator<Item = BusStatus>) {
        self.state.lock().script.extend(statuses);
    }

    /// Everything put on the bus so far
    pub fn sent(&self) -> Vec<SentTxn> {
        self.state.lock().sent.clone()
    }

    /// Payloads put on the bus so far
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        self.state.lock().sent.iter().map(|t| t.data.clone()).collect()
    }

    pub fn sent_count(&self) -> usize {
        self.state.lock().sent.len()
    }

    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }

    /// Take the oldest event the chip produced
    pub fn take_rx(&self) -> Option<Vec<u8>> {
        self.state.lock().rx.pop_front()
    }

    /// Run `f` against the attached chip
    pub fn with_chip<R>(&self, f: impl FnOnce(&mut VirtualChip) -> R) -> Option<R> {
        self.state.lock().chip.as_mut().map(f)
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn baud_rate(&self) -> u32 {
        self.state.lock().baud_rate
    }

    /// Stream the ids of transactions accepted as pending
    ///
    /// Replaces any earlier receiver.
    pub fn completions(&self) -> mpsc::UnboundedReceiver<TxnId> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().completions = Some(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(data: Vec<u8>) -> Transaction {
        Transaction::new(FunctionId::BT, Priority::HIGH, data)
    }

    #[test]
    fn test_script_then_default() {
        let (mut bus, probe) = VirtualBus::new();
        probe.script([BusStatus::Pending, BusStatus::Error]);

        assert_eq!(bus.transact(&mut txn(vec![1])), BusStatus::Pending);
        assert_eq!(bus.transact(&mut txn(vec![2])), BusStatus::Error);
        assert_eq!(bus.transact(&mut txn(vec![3])), BusStatus::Complete);
        assert_eq!(probe.sent_data(), vec![vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn test_chip_reply_collected() {
        let (mut bus, probe) = VirtualBus::with_chip(VirtualChip::new());

        bus.transact(&mut txn(vec![0x01, 0x03, 0x0C, 0x00]));

        assert_eq!(probe.take_rx(), Some(vec![0x04, 0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00]));
        assert_eq!(probe.take_rx(), None);
        assert_eq!(probe.with_chip(|c| c.received_commands().to_vec()), Some(vec![0x0C03]));
    }

    #[test]
    fn test_failed_transaction_not_seen_by_chip() {
        let (mut bus, probe) = VirtualBus::with_chip(VirtualChip::new());
        probe.set_default_status(BusStatus::Error);

        bus.transact(&mut txn(vec![0x01, 0x03, 0x0C, 0x00]));

        assert_eq!(probe.take_rx(), None);
        assert_eq!(probe.sent_count(), 1);
    }

    #[test]
    fn test_connect_reset_disconnect() {
        let (mut bus, probe) = VirtualBus::new();

        assert!(matches!(bus.reset(921_600), Err(BusError::NotConnected)));
        bus.connect(&BusConfig::default()).unwrap();
        assert!(probe.is_connected());
        assert_eq!(probe.baud_rate(), 115_200);

        bus.reset(921_600).unwrap();
        assert_eq!(probe.baud_rate(), 921_600);

        bus.disconnect().unwrap();
        assert!(!probe.is_connected());
        assert!(matches!(bus.disconnect(), Err(BusError::NotConnected)));
    }

    #[test]
    fn test_pending_ids_streamed() {
        let (mut bus, probe) = VirtualBus::new();
        let mut rx = probe.completions();
        probe.set_default_status(BusStatus::Pending);

        let mut t = txn(vec![9]);
        bus.transact(&mut t);

        assert_eq!(rx.try_recv().unwrap(), t.id());
    }
}
