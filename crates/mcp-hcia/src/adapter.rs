//! HCI adapter
//!
//! Front door for HCI clients. Commands go through flow control, other
//! packets straight to the transport. Received Command Complete and
//! Command Status events complete the oldest sent command; everything
//! else is offered to the packet registry.

use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::HciError;
use crate::flow::{CommandFlowController, Completion, SendStatus};
use crate::packet::{CommandEvent, Packet, PacketType, EVT_COMMAND_COMPLETE, EVT_COMMAND_STATUS};
use crate::registry::{ClientCallback, OpcodeFilter, PacketRegistry};
use crate::transport::{RxHandler, Transport};

/// Adapter configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HciConfig {
    /// Command nodes available (queued plus sent)
    pub max_commands: usize,
    /// Commands allowed on the wire without a completion
    pub max_outstanding: usize,
    /// Lowest packet type clients may subscribe to
    pub type_min: u8,
    /// Highest packet type clients may subscribe to
    pub type_max: u8,
}

impl Default for HciConfig {
    fn default() -> Self {
        Self {
            max_commands: 20,
            max_outstanding: 1,
            type_min: PacketType::COMMAND.0,
            type_max: PacketType::NAVC.0,
        }
    }
}

impl HciConfig {
    /// Parse from JSON, filling missing fields with defaults
    pub fn from_json(json: &str) -> Result<Self, HciError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), HciError> {
        if self.max_commands == 0 {
            return Err(HciError::InvalidConfig("max_commands must be non-zero".into()));
        }
        if self.max_outstanding == 0 || self.max_outstanding > self.max_commands {
            return Err(HciError::InvalidConfig(format!(
                "max_outstanding must be in 1..={}, got {}",
                self.max_commands, self.max_outstanding
            )));
        }
        if self.type_min > self.type_max {
            return Err(HciError::InvalidConfig(format!(
                "type range 0x{:02X}..=0x{:02X} is empty",
                self.type_min, self.type_max
            )));
        }
        if !(self.type_min..=self.type_max).contains(&PacketType::EVENT.0) {
            return Err(HciError::InvalidConfig("type range must include the event type".into()));
        }
        Ok(())
    }
}

/// HCI command and packet routing over one transport
pub struct HciAdapter {
    transport: Arc<Transport>,
    flow: CommandFlowController,
    registry: PacketRegistry,
}

impl HciAdapter {
    /// Create an adapter and open the event channel
    pub fn new(transport: Arc<Transport>, config: HciConfig) -> Result<Arc<Self>, HciError> {
        config.validate()?;
        let max_channels = transport.config().max_channels;
        if config.type_max as usize >= max_channels {
            return Err(HciError::InvalidConfig(format!(
                "type_max 0x{:02X} outside the transport's {} channels",
                config.type_max, max_channels
            )));
        }

        let adapter = Arc::new_cyclic(|weak: &Weak<HciAdapter>| {
            let weak = weak.clone();
            let rx_handler: RxHandler = Arc::new(move |packet: Packet| {
                if let Some(adapter) = weak.upgrade() {
                    if let Err(e) = adapter.rx_indication(packet) {
                        debug!("Received packet not delivered: {}", e);
                    }
                }
            });
            Self {
                flow: CommandFlowController::new(Arc::clone(&transport), config.max_commands, config.max_outstanding),
                registry: PacketRegistry::new(Arc::clone(&transport), rx_handler, config.type_min, config.type_max),
                transport,
            }
        });

        adapter.registry.open_channel(PacketType::EVENT)?;
        info!(
            "HCI adapter created (window {}, {} command slots)",
            config.max_outstanding, config.max_commands
        );
        Ok(adapter)
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Send a command; `callback` receives its completion event
    pub fn send_command(
        &self,
        opcode: u16,
        params: &[u8],
        callback: impl FnOnce(CommandEvent) + Send + 'static,
    ) -> Result<SendStatus, HciError> {
        let packet = Packet::command(opcode, params)?;
        self.flow.send(opcode, packet, Some(Box::new(callback)))
    }

    /// Send a pre-built packet
    ///
    /// Command packets still pass through flow control, with no callback;
    /// their completion event goes to registry subscribers. Everything
    /// else bypasses flow control.
    pub fn send_data(&self, packet: Packet) -> Result<(), HciError> {
        if packet.kind() == PacketType::COMMAND {
            let opcode = packet.opcode()?;
            self.flow.send(opcode, packet, None)?;
            return Ok(());
        }
        self.transport.tx_data(packet)
    }

    /// Abandon every queued and sent command; no callbacks fire
    pub fn cmd_queue_flush(&self) {
        self.flow.flush();
    }

    /// Complete the oldest sent command with a caller-supplied event
    ///
    /// For commands the controller never acknowledges. The event is not
    /// offered to subscribers.
    pub fn cmd_queue_remove(&self, event: CommandEvent) -> Completion {
        self.flow.handle_completion(event)
    }

    /// Subscribe to received packets of `kind` matching `filter`
    pub fn register_client(
        &self,
        kind: PacketType,
        filter: OpcodeFilter,
        callback: impl Fn(Packet) + Send + Sync + 'static,
    ) -> Result<(), HciError> {
        let callback: ClientCallback = Arc::new(callback);
        self.registry.register(kind, filter, callback)
    }

    pub fn unregister_client(&self, kind: PacketType, filter: OpcodeFilter) -> Result<(), HciError> {
        self.registry.unregister(kind, filter)
    }

    /// Take over a packet type's channel directly, skipping the registry
    pub fn register_bypass(
        &self,
        kind: PacketType,
        handler: impl Fn(Packet) + Send + Sync + 'static,
    ) -> Result<(), HciError> {
        self.transport.ch_open(kind.channel(), Arc::new(handler))
    }

    pub fn unregister_bypass(&self, kind: PacketType) -> Result<(), HciError> {
        self.transport.ch_close(kind.channel())
    }

    /// Process one received packet
    pub fn rx_indication(&self, packet: Packet) -> Result<(), HciError> {
        let kind = packet.kind();
        let opcode = packet.opcode()?;

        if kind == PacketType::EVENT {
            let code = opcode as u8;
            if code == EVT_COMMAND_COMPLETE || code == EVT_COMMAND_STATUS {
                let event = match CommandEvent::from_packet(&packet) {
                    Ok(event) => event,
                    Err(HciError::Truncated { len, need }) => {
                        // The oldest command still completes or the window never reopens
                        warn!(
                            "Event 0x{:02X} declares {} bytes, packet has {}; completing with what arrived",
                            code, need, len
                        );
                        CommandEvent::new(code, packet.as_bytes().get(3..).unwrap_or(&[]).to_vec())
                    }
                    Err(e) => return Err(e),
                };
                return match self.flow.handle_completion(event) {
                    Completion::Delivered => Ok(()),
                    Completion::NoCallback(_) => self.registry.dispatch(kind, opcode, packet),
                    Completion::Unmatched(_) => Err(HciError::Unmatched),
                };
            }
        }

        self.registry.dispatch(kind, opcode, packet)
    }

    /// Commands counted against the window
    pub fn outstanding(&self) -> usize {
        self.flow.outstanding()
    }

    /// Commands deferred by the window
    pub fn outgoing_len(&self) -> usize {
        self.flow.outgoing_len()
    }

    /// Commands awaiting completion
    pub fn sent_len(&self) -> usize {
        self.flow.sent_len()
    }
}

impl Drop for HciAdapter {
    fn drop(&mut self) {
        self.flow.flush();
        self.registry.clear();
        if let Err(e) = self.transport.ch_close(PacketType::EVENT.channel()) {
            warn!("Failed to close event channel: {}", e);
        }
        info!("HCI adapter destroyed");
    }
}
