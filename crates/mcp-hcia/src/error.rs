//! Error types for the HCI adapter

use mcp_txnq::{Rejected, SchedulerError};
use thiserror::Error;

/// Errors that can occur in the HCI layer
#[derive(Debug, Error)]
pub enum HciError {
    /// Packet shorter than its header
    #[error("packet too short: {len} bytes, need {need}")]
    Truncated {
        /// Bytes present
        len: usize,
        /// Bytes required
        need: usize,
    },

    /// Command parameters exceed the one-byte length field
    #[error("command parameters too long: {0} bytes (max 255)")]
    ParamsTooLong(usize),

    /// Packet type outside the configured range
    #[error("invalid packet type: 0x{0:02X}")]
    InvalidPacketType(u8),

    /// Channel number beyond the channel table
    #[error("invalid channel {channel} (max {max})")]
    InvalidChannel {
        /// Requested channel
        channel: u8,
        /// Size of the channel table
        max: usize,
    },

    /// Receive on a channel nobody opened
    #[error("channel {0} not open")]
    ChannelClosed(u8),

    /// Unregister of a subscription that does not exist
    #[error("no registration for type 0x{kind:02X} opcode 0x{opcode:04X}")]
    NotRegistered {
        /// Packet type
        kind: u8,
        /// Opcode (0 for wildcard)
        opcode: u16,
    },

    /// Inbound packet matched no subscriber
    #[error("no subscriber for type 0x{kind:02X} opcode 0x{opcode:04X}")]
    NoSubscriber {
        /// Packet type
        kind: u8,
        /// Opcode extracted from the packet
        opcode: u16,
    },

    /// Command completion with no command awaiting it
    #[error("completion event with no command awaiting it")]
    Unmatched,

    /// Command node pool exhausted
    #[error("command pool exhausted")]
    PoolExhausted,

    /// Command queue at capacity
    #[error("command queue full")]
    QueueFull,

    /// Scheduler refused the packet or the bus failed it
    #[error("transmit failed: {0}")]
    Transmit(#[from] Rejected),

    /// Scheduler error
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Configuration failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration failed to parse
    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
}
