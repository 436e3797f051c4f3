//! Inbound packet subscriptions
//!
//! Clients subscribe to a packet type and either one opcode or every
//! opcode of that type. Exact subscriptions are always matched before
//! wildcards. The transport channel for a type is opened on its first
//! subscription and closed when the last one goes away, except for the
//! event channel, which command flow control needs permanently.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::HciError;
use crate::packet::{Packet, PacketType};
use crate::transport::{RxHandler, Transport};

/// Raw opcode value meaning "any opcode"
pub const ANY_OPCODE: u16 = 0;

/// Which opcodes of a packet type a subscription receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpcodeFilter {
    /// Every opcode
    Any,
    /// One opcode
    Exact(u16),
}

impl OpcodeFilter {
    pub fn matches(&self, opcode: u16) -> bool {
        match *self {
            OpcodeFilter::Any => true,
            OpcodeFilter::Exact(op) => op == opcode,
        }
    }

    /// Raw opcode value, [`ANY_OPCODE`] for the wildcard
    pub fn raw(&self) -> u16 {
        match *self {
            OpcodeFilter::Any => ANY_OPCODE,
            OpcodeFilter::Exact(op) => op,
        }
    }
}

impl From<u16> for OpcodeFilter {
    fn from(opcode: u16) -> Self {
        match opcode {
            ANY_OPCODE => OpcodeFilter::Any,
            op => OpcodeFilter::Exact(op),
        }
    }
}

/// Callback receiving packets that match a subscription
pub type ClientCallback = Arc<dyn Fn(Packet) + Send + Sync>;

struct Subscription {
    filter: OpcodeFilter,
    callback: ClientCallback,
}

/// Subscription table keyed by packet type
pub struct PacketRegistry {
    transport: Arc<Transport>,
    rx_handler: RxHandler,
    type_min: u8,
    type_max: u8,
    lists: Mutex<Vec<Vec<Subscription>>>,
}

impl PacketRegistry {
    /// Create a registry for types `type_min..=type_max`
    ///
    /// `rx_handler` is installed on a type's channel when it is opened.
    pub fn new(transport: Arc<Transport>, rx_handler: RxHandler, type_min: u8, type_max: u8) -> Self {
        let types = type_max.saturating_sub(type_min) as usize + 1;
        Self {
            transport,
            rx_handler,
            type_min,
            type_max,
            lists: Mutex::new((0..types).map(|_| Vec::new()).collect()),
        }
    }

    fn index(&self, kind: PacketType) -> Result<usize, HciError> {
        if kind.0 < self.type_min || kind.0 > self.type_max {
            return Err(HciError::InvalidPacketType(kind.0));
        }
        Ok((kind.0 - self.type_min) as usize)
    }

    /// Subscribe to packets of `kind` matching `filter`
    pub fn register(&self, kind: PacketType, filter: OpcodeFilter, callback: ClientCallback) -> Result<(), HciError> {
        let idx = self.index(kind)?;
        let mut lists = self.lists.lock();
        let list = &mut lists[idx];

        // The event channel is held open by the adapter for completions
        let pinned = kind == PacketType::EVENT && self.transport.is_channel_open(kind.channel());
        if list.is_empty() && !pinned {
            self.transport.ch_open(kind.channel(), Arc::clone(&self.rx_handler))?;
        }

        let sub = Subscription { filter, callback };
        match filter {
            OpcodeFilter::Exact(_) => list.insert(0, sub),
            OpcodeFilter::Any => list.push(sub),
        }
        info!("Registered client for {} opcode 0x{:04X}", kind, filter.raw());
        Ok(())
    }

    /// Remove the first subscription with exactly this filter
    pub fn unregister(&self, kind: PacketType, filter: OpcodeFilter) -> Result<(), HciError> {
        let idx = self.index(kind)?;
        let mut lists = self.lists.lock();
        let list = &mut lists[idx];

        let pos = list
            .iter()
            .position(|s| s.filter == filter)
            .ok_or(HciError::NotRegistered {
                kind: kind.0,
                opcode: filter.raw(),
            })?;
        list.remove(pos);

        if list.is_empty() && kind != PacketType::EVENT {
            self.transport.ch_close(kind.channel())?;
        }
        info!("Unregistered client for {} opcode 0x{:04X}", kind, filter.raw());
        Ok(())
    }

    /// Deliver a packet to the best-matching subscriber
    pub fn dispatch(&self, kind: PacketType, opcode: u16, packet: Packet) -> Result<(), HciError> {
        let idx = self.index(kind)?;
        let callback = {
            let lists = self.lists.lock();
            let list = &lists[idx];
            list.iter()
                .find(|s| s.filter == OpcodeFilter::Exact(opcode))
                .or_else(|| list.iter().find(|s| s.filter == OpcodeFilter::Any))
                .map(|s| Arc::clone(&s.callback))
        };

        match callback {
            Some(callback) => {
                callback(packet);
                Ok(())
            }
            None => {
                warn!("No client for {} opcode 0x{:04X}, dropping", kind, opcode);
                Err(HciError::NoSubscriber { kind: kind.0, opcode })
            }
        }
    }

    /// Open a type's channel with the registry's handler, independent of subscriptions
    pub fn open_channel(&self, kind: PacketType) -> Result<(), HciError> {
        self.index(kind)?;
        self.transport.ch_open(kind.channel(), Arc::clone(&self.rx_handler))
    }

    /// Number of subscriptions for a type
    pub fn subscriber_count(&self, kind: PacketType) -> usize {
        match self.index(kind) {
            Ok(idx) => self.lists.lock()[idx].len(),
            Err(_) => 0,
        }
    }

    pub fn type_range(&self) -> (u8, u8) {
        (self.type_min, self.type_max)
    }

    /// Drop every subscription
    pub fn clear(&self) {
        let mut lists = self.lists.lock();
        for list in lists.iter_mut() {
            list.clear();
        }
        debug!("Registry cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportConfig;
    use mcp_txnq::{BusDriver, BusStatus, Transaction};

    struct NullBus;

    impl BusDriver for NullBus {
        fn transact(&mut self, _txn: &mut Transaction) -> BusStatus {
            BusStatus::Complete
        }
    }

    fn registry() -> (PacketRegistry, Arc<Transport>) {
        let transport = Transport::new(TransportConfig::default(), Box::new(NullBus)).unwrap();
        let handler: RxHandler = Arc::new(|_: Packet| {});
        (PacketRegistry::new(Arc::clone(&transport), handler, 0x01, 0x09), transport)
    }

    fn recorder(tag: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> ClientCallback {
        let log = Arc::clone(log);
        Arc::new(move |_: Packet| log.lock().push(tag))
    }

    fn acl(handle: u16) -> Packet {
        let [lo, hi] = handle.to_le_bytes();
        Packet::from_bytes(vec![0x02, lo, hi, 0x00, 0x00]).unwrap()
    }

    #[test]
    fn test_exact_before_wildcard() {
        let (reg, _t) = registry();
        let log = Arc::new(Mutex::new(Vec::new()));

        reg.register(PacketType::ACL, OpcodeFilter::Any, recorder("any", &log)).unwrap();
        reg.register(PacketType::ACL, OpcodeFilter::Exact(0x0001), recorder("exact", &log))
            .unwrap();

        reg.dispatch(PacketType::ACL, 0x0001, acl(0x0001)).unwrap();
        reg.dispatch(PacketType::ACL, 0x0002, acl(0x0002)).unwrap();

        assert_eq!(*log.lock(), vec!["exact", "any"]);
    }

    #[test]
    fn test_dispatch_miss() {
        let (reg, _t) = registry();
        let log = Arc::new(Mutex::new(Vec::new()));
        reg.register(PacketType::ACL, OpcodeFilter::Exact(0x0001), recorder("exact", &log))
            .unwrap();

        assert!(matches!(
            reg.dispatch(PacketType::ACL, 0x0005, acl(0x0005)),
            Err(HciError::NoSubscriber { kind: 0x02, opcode: 0x0005 })
        ));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_channel_follows_subscriptions() {
        let (reg, t) = registry();
        let log = Arc::new(Mutex::new(Vec::new()));

        assert!(!t.is_channel_open(0x02));
        reg.register(PacketType::ACL, OpcodeFilter::Exact(1), recorder("a", &log)).unwrap();
        reg.register(PacketType::ACL, OpcodeFilter::Exact(2), recorder("b", &log)).unwrap();
        assert!(t.is_channel_open(0x02));

        reg.unregister(PacketType::ACL, OpcodeFilter::Exact(1)).unwrap();
        assert!(t.is_channel_open(0x02));
        reg.unregister(PacketType::ACL, OpcodeFilter::Exact(2)).unwrap();
        assert!(!t.is_channel_open(0x02));
    }

    #[test]
    fn test_event_channel_stays_open() {
        let (reg, t) = registry();
        let log = Arc::new(Mutex::new(Vec::new()));

        reg.register(PacketType::EVENT, OpcodeFilter::Exact(0x3E), recorder("le", &log))
            .unwrap();
        reg.unregister(PacketType::EVENT, OpcodeFilter::Exact(0x3E)).unwrap();

        assert!(t.is_channel_open(0x04));
    }

    #[test]
    fn test_failed_open_leaves_no_subscription() {
        let transport = Transport::new(TransportConfig::default(), Box::new(NullBus)).unwrap();
        let handler: RxHandler = Arc::new(|_: Packet| {});
        let reg = PacketRegistry::new(Arc::clone(&transport), handler, 0x01, 0x40);
        let log = Arc::new(Mutex::new(Vec::new()));

        assert!(matches!(
            reg.register(PacketType(0x30), OpcodeFilter::Any, recorder("any", &log)),
            Err(HciError::InvalidChannel { channel: 0x30, max: 40 })
        ));
        assert_eq!(reg.subscriber_count(PacketType(0x30)), 0);

        // A retry must attempt the open again rather than report success
        assert!(matches!(
            reg.register(PacketType(0x30), OpcodeFilter::Exact(1), recorder("exact", &log)),
            Err(HciError::InvalidChannel { .. })
        ));
        assert_eq!(reg.subscriber_count(PacketType(0x30)), 0);
    }

    #[test]
    fn test_open_event_channel_not_reopened() {
        let (reg, t) = registry();
        let log = Arc::new(Mutex::new(Vec::new()));
        let pinned = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&pinned);
        t.ch_open(0x04, Arc::new(move |_: Packet| sink.lock().push("pinned")))
            .unwrap();

        reg.register(PacketType::EVENT, OpcodeFilter::Exact(0x3E), recorder("le", &log))
            .unwrap();
        t.rx_indication(Packet::from_bytes(vec![0x04, 0x3E, 0x00]).unwrap())
            .unwrap();

        // The existing handler still owns the channel
        assert_eq!(*pinned.lock(), vec!["pinned"]);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_type_range_enforced() {
        let (reg, _t) = registry();

        assert!(matches!(
            reg.register(PacketType(0x0A), OpcodeFilter::Any, Arc::new(|_: Packet| {})),
            Err(HciError::InvalidPacketType(0x0A))
        ));
        assert!(matches!(
            reg.register(PacketType(0x00), OpcodeFilter::Any, Arc::new(|_: Packet| {})),
            Err(HciError::InvalidPacketType(0x00))
        ));
        assert!(matches!(
            reg.unregister(PacketType::SCO, OpcodeFilter::Any),
            Err(HciError::NotRegistered { kind: 0x03, opcode: 0 })
        ));
    }

    #[test]
    fn test_opcode_filter_from_raw() {
        assert_eq!(OpcodeFilter::from(0), OpcodeFilter::Any);
        assert_eq!(OpcodeFilter::from(0x0C03), OpcodeFilter::Exact(0x0C03));
        assert!(OpcodeFilter::Any.matches(0x1234));
        assert!(!OpcodeFilter::Exact(1).matches(2));
    }
}
