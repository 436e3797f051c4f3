//! Virtual HCI controller
//!
//! Answers HCI command packets the way a combo chip does: each command
//! produces one Command Complete event (or Command Status, if configured
//! for that opcode). Non-command traffic is recorded and otherwise ignored.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, trace};

/// UART packet indicator for HCI commands
pub const HCI_COMMAND_PKT: u8 = 0x01;
/// UART packet indicator for HCI events
pub const HCI_EVENT_PKT: u8 = 0x04;
/// Command Complete event code
pub const EVT_COMMAND_COMPLETE: u8 = 0x0E;
/// Command Status event code
pub const EVT_COMMAND_STATUS: u8 = 0x0F;

/// Malformed traffic seen by the chip
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChipError {
    /// Packet shorter than its header
    #[error("truncated packet ({0} bytes)")]
    Truncated(usize),

    /// Event parameters exceed the one-byte length field
    #[error("event parameters too long: {0} bytes (max 255)")]
    ParamsTooLong(usize),

    /// Parameter length disagrees with the packet size
    #[error("length mismatch: header says {declared}, got {actual}")]
    LengthMismatch {
        /// Length byte from the header
        declared: usize,
        /// Bytes actually present
        actual: usize,
    },
}

/// How the chip answers one opcode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Command Complete with a status byte and return parameters
    Complete { status: u8, params: Vec<u8> },
    /// Command Status only
    Status(u8),
    /// No answer at all
    Silent,
}

impl Default for Reply {
    fn default() -> Self {
        Reply::Complete {
            status: 0x00,
            params: Vec::new(),
        }
    }
}

/// A simulated controller
#[derive(Debug, Default)]
pub struct VirtualChip {
    replies: HashMap<u16, Reply>,
    received_commands: Vec<u16>,
    received_other: Vec<Vec<u8>>,
    num_cmd_packets: u8,
}

impl VirtualChip {
    pub fn new() -> Self {
        Self {
            num_cmd_packets: 1,
            ..Default::default()
        }
    }

    /// Configure the answer for one opcode
    pub fn set_reply(&mut self, opcode: u16, reply: Reply) {
        self.replies.insert(opcode, reply);
    }

    /// Credit advertised in generated events
    pub fn set_num_cmd_packets(&mut self, n: u8) {
        self.num_cmd_packets = n;
    }

    /// Process one outbound packet, returning the event it provokes
    pub fn process(&mut self, packet: &[u8]) -> Result<Option<Vec<u8>>, ChipError> {
        match packet.first() {
            Some(&HCI_COMMAND_PKT) => self.process_command(packet),
            Some(_) => {
                trace!("Chip ignoring non-command packet: {:02X?}", packet);
                self.received_other.push(packet.to_vec());
                Ok(None)
            }
            None => Err(ChipError::Truncated(0)),
        }
    }

    fn process_command(&mut self, packet: &[u8]) -> Result<Option<Vec<u8>>, ChipError> {
        if packet.len() < 4 {
            return Err(ChipError::Truncated(packet.len()));
        }
        let declared = packet[3] as usize;
        let actual = packet.len() - 4;
        if declared != actual {
            return Err(ChipError::LengthMismatch { declared, actual });
        }

        let opcode = u16::from_le_bytes([packet[1], packet[2]]);
        self.received_commands.push(opcode);
        debug!("Chip received command 0x{:04X}", opcode);

        let [op_lo, op_hi] = opcode.to_le_bytes();
        let event = match self.replies.get(&opcode).cloned().unwrap_or_default() {
            Reply::Complete { status, params } => {
                let mut body = vec![self.num_cmd_packets, op_lo, op_hi, status];
                body.extend_from_slice(&params);
                event_packet(EVT_COMMAND_COMPLETE, &body)?
            }
            Reply::Status(status) => {
                event_packet(EVT_COMMAND_STATUS, &[status, self.num_cmd_packets, op_lo, op_hi])?
            }
            Reply::Silent => return Ok(None),
        };
        Ok(Some(event))
    }

    /// Opcodes received, in order
    pub fn received_commands(&self) -> &[u16] {
        &self.received_commands
    }

    /// Non-command packets received, in order
    pub fn received_other(&self) -> &[Vec<u8>] {
        &self.received_other
    }

    pub fn clear_received(&mut self) {
        self.received_commands.clear();
        self.received_other.clear();
    }
}

/// Build a UART-framed HCI event packet
pub fn event_packet(event_code: u8, params: &[u8]) -> Result<Vec<u8>, ChipError> {
    let len = u8::try_from(params.len()).map_err(|_| ChipError::ParamsTooLong(params.len()))?;
    let mut pkt = Vec::with_capacity(3 + params.len());
    pkt.extend_from_slice(&[HCI_EVENT_PKT, event_code, len]);
    pkt.extend_from_slice(params);
    Ok(pkt)
}
