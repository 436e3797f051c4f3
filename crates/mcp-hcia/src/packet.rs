//! HCI wire format
//!
//! Packets are UART-framed: byte 0 is the packet type indicator.
//!
//! ```text
//! command: [0x01][opcode lo][opcode hi][param len][params...]
//! event:   [0x04][event code][param len][params...]
//! acl/sco: [type][handle lo][handle hi]...
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::HciError;

/// HCI packet type indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PacketType(pub u8);

impl PacketType {
    pub const COMMAND: PacketType = PacketType(0x01);
    pub const ACL: PacketType = PacketType(0x02);
    pub const SCO: PacketType = PacketType(0x03);
    pub const EVENT: PacketType = PacketType(0x04);
    /// TI navigation controller channel
    pub const NAVC: PacketType = PacketType(0x09);

    /// Channel number this type is carried on
    pub fn channel(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            PacketType::COMMAND => write!(f, "command"),
            PacketType::ACL => write!(f, "acl"),
            PacketType::SCO => write!(f, "sco"),
            PacketType::EVENT => write!(f, "event"),
            PacketType::NAVC => write!(f, "navc"),
            PacketType(other) => write!(f, "0x{:02X}", other),
        }
    }
}

/// Command Complete event code
pub const EVT_COMMAND_COMPLETE: u8 = 0x0E;
/// Command Status event code
pub const EVT_COMMAND_STATUS: u8 = 0x0F;

/// One framed HCI packet
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    bytes: Vec<u8>,
}

impl Packet {
    /// Wrap raw bytes; at least the type byte must be present
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, HciError> {
        if bytes.is_empty() {
            return Err(HciError::Truncated { len: 0, need: 1 });
        }
        Ok(Self { bytes })
    }

    /// Serialize a command packet
    pub fn command(opcode: u16, params: &[u8]) -> Result<Self, HciError> {
        let len = u8::try_from(params.len()).map_err(|_| HciError::ParamsTooLong(params.len()))?;
        let [lo, hi] = opcode.to_le_bytes();
        let mut bytes = Vec::with_capacity(4 + params.len());
        bytes.extend_from_slice(&[PacketType::COMMAND.0, lo, hi, len]);
        bytes.extend_from_slice(params);
        Ok(Self { bytes })
    }

    pub fn kind(&self) -> PacketType {
        PacketType(self.bytes[0])
    }

    /// Opcode used for routing
    ///
    /// Events route on their one-byte event code; every other type on the
    /// little-endian 16-bit field after the type byte.
    pub fn opcode(&self) -> Result<u16, HciError> {
        if self.kind() == PacketType::EVENT {
            return self
                .bytes
                .get(1)
                .map(|&code| code as u16)
                .ok_or(HciError::Truncated {
                    len: self.bytes.len(),
                    need: 2,
                });
        }
        match self.bytes.get(1..3) {
            Some(&[lo, hi]) => Ok(u16::from_le_bytes([lo, hi])),
            _ => Err(HciError::Truncated {
                len: self.bytes.len(),
                need: 3,
            }),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet({}, {:02X?})", self.kind(), self.bytes)
    }
}

/// A Command Complete or Command Status event delivered to a command's caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEvent {
    /// Event code (0x0E or 0x0F)
    pub event_code: u8,
    /// Event parameters
    pub params: Vec<u8>,
}

impl CommandEvent {
    pub fn new(event_code: u8, params: Vec<u8>) -> Self {
        Self { event_code, params }
    }

    /// Parse a received event packet
    pub fn from_packet(packet: &Packet) -> Result<Self, HciError> {
        let bytes = packet.as_bytes();
        if packet.kind() != PacketType::EVENT {
            return Err(HciError::InvalidPacketType(packet.kind().0));
        }
        let (&code, &len) = match (bytes.get(1), bytes.get(2)) {
            (Some(code), Some(len)) => (code, len),
            _ => {
                return Err(HciError::Truncated {
                    len: bytes.len(),
                    need: 3,
                })
            }
        };
        let need = 3 + len as usize;
        let params = bytes.get(3..need).ok_or(HciError::Truncated { len: bytes.len(), need })?;
        Ok(Self::new(code, params.to_vec()))
    }

    pub fn is_command_complete(&self) -> bool {
        self.event_code == EVT_COMMAND_COMPLETE
    }

    pub fn is_command_status(&self) -> bool {
        self.event_code == EVT_COMMAND_STATUS
    }

    /// Opcode of the command this event reports on, if the payload carries one
    pub fn command_opcode(&self) -> Option<u16> {
        let at = match self.event_code {
            EVT_COMMAND_COMPLETE => 1,
            EVT_COMMAND_STATUS => 2,
            _ => return None,
        };
        match self.params.get(at..at + 2) {
            Some(&[lo, hi]) => Some(u16::from_le_bytes([lo, hi])),
            _ => None,
        }
    }

    /// Command credits the controller advertises
    pub fn num_cmd_packets(&self) -> Option<u8> {
        match self.event_code {
            EVT_COMMAND_COMPLETE => self.params.first().copied(),
            EVT_COMMAND_STATUS => self.params.get(1).copied(),
            _ => None,
        }
    }

    /// HCI status byte
    pub fn status(&self) -> Option<u8> {
        match self.event_code {
            EVT_COMMAND_COMPLETE => self.params.get(3).copied(),
            EVT_COMMAND_STATUS => self.params.first().copied(),
            _ => None,
        }
    }

    /// Return parameters of a Command Complete after the status byte
    pub fn return_params(&self) -> &[u8] {
        match self.event_code {
            EVT_COMMAND_COMPLETE => self.params.get(4..).unwrap_or(&[]),
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_encoding() {
        let pkt = Packet::command(0x0C03, &[]).unwrap();
        assert_eq!(pkt.as_bytes(), &[0x01, 0x03, 0x0C, 0x00]);
        assert_eq!(pkt.kind(), PacketType::COMMAND);
        assert_eq!(pkt.opcode().unwrap(), 0x0C03);

        let pkt = Packet::command(0xFD1C, &[0xAA, 0xBB]).unwrap();
        assert_eq!(pkt.as_bytes(), &[0x01, 0x1C, 0xFD, 0x02, 0xAA, 0xBB]);
    }

    #[test]
    fn test_command_params_too_long() {
        let params = vec![0u8; 256];
        assert!(matches!(
            Packet::command(0x0C03, &params),
            Err(HciError::ParamsTooLong(256))
        ));
        assert!(Packet::command(0x0C03, &params[..255]).is_ok());
    }

    #[test]
    fn test_routing_opcodes() {
        let evt = Packet::from_bytes(vec![0x04, 0x3E, 0x01, 0x02]).unwrap();
        assert_eq!(evt.opcode().unwrap(), 0x3E);

        let acl = Packet::from_bytes(vec![0x02, 0x01, 0x20, 0x00, 0x00]).unwrap();
        assert_eq!(acl.opcode().unwrap(), 0x2001);

        let short = Packet::from_bytes(vec![0x02, 0x01]).unwrap();
        assert!(matches!(short.opcode(), Err(HciError::Truncated { need: 3, .. })));

        assert!(matches!(
            Packet::from_bytes(Vec::new()),
            Err(HciError::Truncated { len: 0, need: 1 })
        ));
    }

    #[test]
    fn test_command_complete_accessors() {
        let pkt = Packet::from_bytes(vec![0x04, 0x0E, 0x07, 0x01, 0x01, 0x10, 0x00, 0x06, 0x00, 0x10]).unwrap();
        let evt = CommandEvent::from_packet(&pkt).unwrap();

        assert!(evt.is_command_complete());
        assert_eq!(evt.command_opcode(), Some(0x1001));
        assert_eq!(evt.num_cmd_packets(), Some(1));
        assert_eq!(evt.status(), Some(0x00));
        assert_eq!(evt.return_params(), &[0x06, 0x00, 0x10]);
    }

    #[test]
    fn test_command_status_accessors() {
        let evt = CommandEvent::new(EVT_COMMAND_STATUS, vec![0x0C, 0x01, 0x05, 0x04]);

        assert!(evt.is_command_status());
        assert_eq!(evt.status(), Some(0x0C));
        assert_eq!(evt.num_cmd_packets(), Some(1));
        assert_eq!(evt.command_opcode(), Some(0x0405));
        assert!(evt.return_params().is_empty());
    }

    #[test]
    fn test_event_length_checked() {
        let pkt = Packet::from_bytes(vec![0x04, 0x0E, 0x04, 0x01]).unwrap();
        assert!(matches!(
            CommandEvent::from_packet(&pkt),
            Err(HciError::Truncated { len: 4, need: 7 })
        ));

        let acl = Packet::from_bytes(vec![0x02, 0x00, 0x00]).unwrap();
        assert!(matches!(
            CommandEvent::from_packet(&acl),
            Err(HciError::InvalidPacketType(0x02))
        ));
    }
}
