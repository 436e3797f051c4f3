//! HCI command flow control
//!
//! Limits the number of commands sent but not yet acknowledged and
//! correlates each Command Complete / Command Status event with the oldest
//! unacknowledged command. The controller is assumed to answer in order,
//! so correlation is strict FIFO and never looks at the opcode in the event.
//!
//! Commands move through two queues:
//!
//! - **Outgoing**: held back by the window, not yet transmitted
//! - **Sent**: transmitted, waiting for their completion event
//!
//! Commands enter Sent in the same order they reach the transport. The
//! transmit section that guarantees this is re-entrant, so a completion
//! callback may send the next command from the same thread.

use std::sync::Arc;

use mcp_txnq::{BoundedQueue, NodeId, NodePool};
use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, error, warn};

use crate::error::HciError;
use crate::packet::{CommandEvent, Packet};
use crate::transport::Transport;

/// Callback invoked with the completion event of one command
pub type CommandCallback = Box<dyn FnOnce(CommandEvent) + Send>;

/// What became of a completion event
#[derive(Debug, PartialEq, Eq)]
pub enum Completion {
    /// The oldest command's callback consumed the event
    Delivered,
    /// The oldest command was fire-and-forget; the event is left for subscribers
    NoCallback(CommandEvent),
    /// No command was awaiting completion
    Unmatched(CommandEvent),
}

/// Result of submitting a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Transmitted and awaiting completion
    Sent,
    /// Held in Outgoing by the window
    Deferred,
}

struct CommandNode {
    opcode: u16,
    packet: Option<Packet>,
    callback: Option<CommandCallback>,
}

struct FlowState {
    pool: NodePool<CommandNode>,
    outgoing: BoundedQueue<NodeId>,
    sent: BoundedQueue<NodeId>,
    outstanding: usize,
    max_outstanding: usize,
}

impl FlowState {
    /// Detach a node's packet for transmission
    fn take_packet(&mut self, id: NodeId) -> Option<(u16, Packet)> {
        let node = self.pool.get_mut(id)?;
        Some((node.opcode, node.packet.take()?))
    }

    /// Drop a node whose transmission failed
    fn discard(&mut self, id: NodeId) -> Option<CommandNode> {
        self.sent.remove_first(|&n| n == id);
        self.pool.free(id)
    }
}

/// Outstanding-command window and completion correlation
///
/// # Locking
///
/// The transmit section is held while a command is handed to the
/// transport. A synchronous bus completes that transaction, and any the
/// scheduler releases behind it, on the calling thread before the section
/// is dropped, so done callbacks of every function sharing the scheduler
/// can run inside it. Such a callback may send commands from the same
/// thread. It must not block on another thread that is itself sending a
/// command or completing one through this controller, which would
/// deadlock.
pub struct CommandFlowController {
    transport: Arc<Transport>,
    tx_section: ReentrantMutex<()>,
    state: Mutex<FlowState>,
}

impl CommandFlowController {
    /// Create a controller with `max_commands` node slots and a window of `max_outstanding`
    pub fn new(transport: Arc<Transport>, max_commands: usize, max_outstanding: usize) -> Self {
        Self {
            transport,
            tx_section: ReentrantMutex::new(()),
            state: Mutex::new(FlowState {
                pool: NodePool::with_capacity(max_commands),
                outgoing: BoundedQueue::new(max_commands),
                // One extra slot for an enqueue racing a completion
                sent: BoundedQueue::new(max_outstanding + 1),
                outstanding: 0,
                max_outstanding,
            }),
        }
    }

    /// Submit a serialized command
    ///
    /// Transmits immediately if the window allows, otherwise defers it to
    /// Outgoing. A command with no callback is fire-and-forget: its
    /// completion event is offered to subscribers instead.
    pub fn send(&self, opcode: u16, packet: Packet, callback: Option<CommandCallback>) -> Result<SendStatus, HciError> {
        let _tx = self.tx_section.lock();

        let id = {
            let mut state = self.state.lock();
            let id = state
                .pool
                .alloc(CommandNode {
                    opcode,
                    packet: Some(packet),
                    callback,
                })
                .map_err(|_| {
                    warn!("Command 0x{:04X} rejected: pool exhausted", opcode);
                    HciError::PoolExhausted
                })?;

            if state.outstanding >= state.max_outstanding {
                warn!(
                    "Command 0x{:04X} deferred: {} of {} outstanding",
                    opcode, state.outstanding, state.max_outstanding
                );
                if let Err(id) = state.outgoing.enqueue(id) {
                    state.pool.free(id);
                    return Err(HciError::QueueFull);
                }
                return Ok(SendStatus::Deferred);
            }

            if let Err(id) = state.sent.enqueue(id) {
                error!("Sent queue full, dropping command 0x{:04X}", opcode);
                state.pool.free(id);
                return Err(HciError::QueueFull);
            }
            state.outstanding += 1;
            id
        };

        self.transmit(id)?;
        Ok(SendStatus::Sent)
    }

    /// Consume one completion event
    ///
    /// Releases the next deferred command (or shrinks the outstanding
    /// count when none is waiting), then hands the event to the oldest
    /// sent command.
    pub fn handle_completion(&self, event: CommandEvent) -> Completion {
        let head = {
            let _tx = self.tx_section.lock();

            let next = {
                let mut state = self.state.lock();
                match state.outgoing.dequeue() {
                    Some(id) => {
                        if let Err(id) = state.sent.enqueue(id) {
                            error!("Sent queue full, dropping deferred command");
                            state.pool.free(id);
                            None
                        } else {
                            Some(id)
                        }
                    }
                    None => {
                        if state.outstanding > 0 {
                            state.outstanding -= 1;
                        } else {
                            error!("Completion with zero outstanding commands");
                        }
                        None
                    }
                }
            };

            if let Some(id) = next {
                // Failure already logged; the window slot stays counted
                let _ = self.transmit(id);
            }

            let mut state = self.state.lock();
            state.sent.dequeue().and_then(|id| state.pool.free(id))
        };

        let Some(node) = head else {
            error!("Sent queue unexpectedly empty on event 0x{:02X}", event.event_code);
            return Completion::Unmatched(event);
        };

        if let Some(opcode) = event.command_opcode() {
            if opcode != node.opcode {
                debug!(
                    "Event reports opcode 0x{:04X}, oldest command is 0x{:04X}",
                    opcode, node.opcode
                );
            }
        }

        match node.callback {
            Some(callback) => {
                callback(event);
                Completion::Delivered
            }
            None => Completion::NoCallback(event),
        }
    }

    /// Abandon every queued and sent command without completing them
    pub fn flush(&self) {
        let _tx = self.tx_section.lock();
        let dropped = {
            let mut state = self.state.lock();
            let dropped = state.outgoing.len() + state.sent.len();
            state.outgoing.drain().for_each(drop);
            state.sent.drain().for_each(drop);
            state.pool.clear();
            state.outstanding = 0;
            dropped
        };
        if dropped > 0 {
            debug!("Flushed {} commands", dropped);
        }
    }

    /// Commands counted against the window
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    /// Commands deferred by the window
    pub fn outgoing_len(&self) -> usize {
        self.state.lock().outgoing.len()
    }

    /// Commands transmitted and awaiting completion
    pub fn sent_len(&self) -> usize {
        self.state.lock().sent.len()
    }

    pub fn max_outstanding(&self) -> usize {
        self.state.lock().max_outstanding
    }

    /// Hand a reserved node's packet to the transport
    ///
    /// On failure the node is freed without invoking its callback and the
    /// outstanding count is left as is.
    fn transmit(&self, id: NodeId) -> Result<(), HciError> {
        let Some((opcode, packet)) = self.state.lock().take_packet(id) else {
            error!("Command node vanished before transmission");
            return Err(HciError::Unmatched);
        };

        match self.transport.tx_data(packet) {
            Ok(()) => {
                debug!("Command 0x{:04X} sent", opcode);
                Ok(())
            }
            Err(e) => {
                error!("Command 0x{:04X} send error: {}", opcode, e);
                self.state.lock().discard(id);
                Err(e)
            }
        }
    }
}

impl Drop for CommandFlowController {
    fn drop(&mut self) {
        self.flush();
    }
}
