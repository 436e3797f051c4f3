//! HCI Adapter
//!
//! This crate sits between HCI clients and the shared transaction
//! scheduler. It serializes commands, limits how many are outstanding at
//! the controller, correlates completion events with the commands that
//! caused them, and routes everything else the controller sends to
//! subscribed clients.
//!
//! # Architecture
//!
//! - [`Transport`] owns the [`TxnScheduler`](mcp_txnq::TxnScheduler) and
//!   maps packet types onto receive channels
//! - [`CommandFlowController`] holds back commands beyond the outstanding
//!   window and pairs each Command Complete / Command Status event with the
//!   oldest sent command
//! - [`PacketRegistry`] delivers received packets to clients subscribed by
//!   packet type and opcode
//! - [`HciAdapter`] wires the three together
//!
//! # Example
//!
//! ```rust
//! use mcp_hcia::{HciAdapter, HciConfig, OpcodeFilter, Packet, PacketType, Transport, TransportConfig};
//! use mcp_sim::{VirtualBus, VirtualChip};
//!
//! let (bus, probe) = VirtualBus::with_chip(VirtualChip::new());
//! let transport = Transport::new(TransportConfig::default(), Box::new(bus))?;
//! let adapter = HciAdapter::new(transport, HciConfig::default())?;
//!
//! // LE Meta events go to a subscriber
//! adapter.register_client(PacketType::EVENT, OpcodeFilter::Exact(0x3E), |pkt| {
//!     println!("LE meta: {:?}", pkt);
//! })?;
//!
//! // HCI_Reset
//! adapter.send_command(0x0C03, &[], |evt| {
//!     println!("reset status {:?}", evt.status());
//! })?;
//!
//! // Feed the controller's answer back in
//! while let Some(bytes) = probe.take_rx() {
//!     adapter.rx_indication(Packet::from_bytes(bytes)?)?;
//! }
//! assert_eq!(adapter.outstanding(), 0);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod adapter;
pub mod error;
pub mod flow;
pub mod packet;
pub mod registry;
pub mod transport;

pub use adapter::{HciAdapter, HciConfig};
pub use error::HciError;
pub use flow::{CommandCallback, CommandFlowController, Completion, SendStatus};
pub use packet::{CommandEvent, Packet, PacketType, EVT_COMMAND_COMPLETE, EVT_COMMAND_STATUS};
pub use registry::{ClientCallback, OpcodeFilter, PacketRegistry, ANY_OPCODE};
pub use transport::{RxHandler, Transport, TransportConfig, TransportStats};
