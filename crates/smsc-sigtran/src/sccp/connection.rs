//! SCCP connection-oriented table (protocol class 2)

use bytes::Bytes;
use std::collections::HashMap;
use tracing::{debug, info};

use super::address::SccpAddress;
use super::messages::SccpMessage;
use crate::errors::SccpError;
use crate::types::ProtocolClass;

/// Release cause "end user originated"
pub const RELEASE_END_USER: u8 = 0x00;
/// Refusal cause "unqualified"
pub const REFUSAL_UNQUALIFIED: u8 = 0x0F;

const MAX_REFERENCE: u32 = 0x00FF_FFFF;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    ConnectionPending,
    Active,
    DisconnectPending,
}

/// One connection section
#[derive(Debug, Clone)]
pub struct SccpConnection {
    pub local_ref: u32,
    pub remote_ref: Option<u32>,
    pub state: ConnectionState,
}

/// Outcome of feeding a connection-oriented message to the table
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ConnectionOutput {
    pub reply: Option<SccpMessage>,
    /// Payload received on a connection, tagged with our local reference
    pub data: Option<(u32, Bytes)>,
}

/// Tracks connection sections by local reference
#[derive(Debug)]
pub struct ConnectionTable {
    next_ref: u32,
    connections: HashMap<u32, SccpConnection>,
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            next_ref: 1,
            connections: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn get(&self, local_ref: u32) -> Option<&SccpConnection> {
        self.connections.get(&local_ref)
    }

    fn allocate(&mut self) -> u32 {
        loop {
            let candidate = self.next_ref;
            self.next_ref = if self.next_ref >= MAX_REFERENCE {
                1
            } else {
                self.next_ref + 1
            };
            if !self.connections.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Open an outgoing connection
    pub fn connect(&mut self, called_party: SccpAddress, data: Option<Bytes>) -> SccpMessage {
        let local_ref = self.allocate();
        self.connections.insert(
            local_ref,
            SccpConnection {
                local_ref,
                remote_ref: None,
                state: ConnectionState::ConnectionPending,
            },
        );
        SccpMessage::Cr {
            source_local_reference: local_ref,
            protocol_class: ProtocolClass::CLASS_2,
            called_party,
            credit: None,
            calling_party: None,
            data,
        }
    }

    /// Data on an active connection
    pub fn data(&self, local_ref: u32, data: Bytes) -> Result<SccpMessage, SccpError> {
        let conn = self.active(local_ref)?;
        let remote_ref = conn
            .remote_ref
            .ok_or(SccpError::UnknownReference(local_ref))?;
        Ok(SccpMessage::Dt1 {
            destination_local_reference: remote_ref,
            segmenting: false,
            data,
        })
    }

    /// Start releasing a connection we own
    pub fn release(&mut self, local_ref: u32, cause: u8) -> Result<SccpMessage, SccpError> {
        let conn = self
            .connections
            .get_mut(&local_ref)
            .ok_or(SccpError::UnknownReference(local_ref))?;
        let remote_ref = conn
            .remote_ref
            .ok_or(SccpError::UnknownReference(local_ref))?;
        conn.state = ConnectionState::DisconnectPending;
        Ok(SccpMessage::Rlsd {
            destination_local_reference: remote_ref,
            source_local_reference: local_ref,
            release_cause: cause,
            data: None,
        })
    }

    fn active(&self, local_ref: u32) -> Result<&SccpConnection, SccpError> {
        self.connections
            .get(&local_ref)
            .filter(|c| c.state == ConnectionState::Active)
            .ok_or(SccpError::UnknownReference(local_ref))
    }

    /// Handle an inbound connection-oriented message
    pub fn on_message(&mut self, message: SccpMessage) -> Result<ConnectionOutput, SccpError> {
        let mut output = ConnectionOutput::default();
        match message {
            SccpMessage::Cr {
                source_local_reference,
                protocol_class,
                data,
                ..
            } => {
                if protocol_class.class != 2 {
                    output.reply = Some(SccpMessage::Cref {
                        destination_local_reference: source_local_reference,
                        refusal_cause: REFUSAL_UNQUALIFIED,
                    });
                    return Ok(output);
                }
                let local_ref = self.allocate();
                self.connections.insert(
                    local_ref,
                    SccpConnection {
                        local_ref,
                        remote_ref: Some(source_local_reference),
                        state: ConnectionState::Active,
                    },
                );
                info!(local_ref, remote_ref = source_local_reference, "SCCP connection accepted");
                output.reply = Some(SccpMessage::Cc {
                    destination_local_reference: source_local_reference,
                    source_local_reference: local_ref,
                    protocol_class,
                    credit: None,
                    called_party: None,
                    data: None,
                });
                output.data = data.map(|d| (local_ref, d));
            }
            SccpMessage::Cc {
                destination_local_reference,
                source_local_reference,
                data,
                ..
            } => {
                let conn = self
                    .connections
                    .get_mut(&destination_local_reference)
                    .filter(|c| c.state == ConnectionState::ConnectionPending)
                    .ok_or(SccpError::UnknownReference(destination_local_reference))?;
                conn.remote_ref = Some(source_local_reference);
                conn.state = ConnectionState::Active;
                output.data = data.map(|d| (destination_local_reference, d));
            }
            SccpMessage::Cref {
                destination_local_reference,
                refusal_cause,
            } => {
                debug!(local_ref = destination_local_reference, refusal_cause, "Connection refused");
                self.connections.remove(&destination_local_reference);
            }
            SccpMessage::Dt1 {
                destination_local_reference,
                data,
                ..
            } => {
                self.active(destination_local_reference)?;
                output.data = Some((destination_local_reference, data));
            }
            SccpMessage::Rlsd {
                destination_local_reference,
                source_local_reference,
                ..
            } => {
                if self.connections.remove(&destination_local_reference).is_some() {
                    info!(local_ref = destination_local_reference, "SCCP connection released");
                }
                output.reply = Some(SccpMessage::Rlc {
                    destination_local_reference: source_local_reference,
                    source_local_reference: destination_local_reference,
                });
            }
            SccpMessage::Rlc {
                destination_local_reference,
                ..
            } => {
                self.connections.remove(&destination_local_reference);
            }
            other => {
                return Err(SccpError::InvalidMessage(format!(
                    "{:?} is not connection-oriented",
                    other.message_type()
                )))
            }
        }
        Ok(output)
    }
}
