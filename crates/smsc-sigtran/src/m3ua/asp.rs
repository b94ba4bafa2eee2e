//! M3UA ASP (Application Server Process) State Machine
//!
//! The same machine serves both ends of an association. As [`AspRole::Client`]
//! it drives ASPUP and ASPAC towards the peer; as [`AspRole::Server`] it
//! acknowledges them.

use tracing::{debug, info, warn};

use super::error_code;
use super::messages::{M3uaMessage, ProtocolData};
use crate::errors::M3uaError;
use crate::types::TrafficModeType;

/// ASP State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspState {
    Down,
    Inactive,
    Active,
}

/// Which side of the ASP procedures we run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspRole {
    Client,
    Server,
}

/// Result of feeding one message into the ASP
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AspOutput {
    /// Messages to send back to the peer
    pub replies: Vec<M3uaMessage>,
    /// User data to hand to SCCP
    pub data: Option<ProtocolData>,
    /// New state, when it changed
    pub transition: Option<AspState>,
    /// Code from an ERR the peer sent; informational, the state is untouched
    pub peer_error: Option<u32>,
}

impl AspOutput {
    fn reply(message: M3uaMessage) -> Self {
        Self {
            replies: vec![message],
            ..Default::default()
        }
    }
}

/// ASP state for one association
#[derive(Debug)]
pub struct Asp {
    role: AspRole,
    state: AspState,
    routing_context: Option<u32>,
    network_appearance: Option<u32>,
    info_string: Option<String>,
}

impl Asp {
    pub fn new(role: AspRole, routing_context: Option<u32>, network_appearance: Option<u32>) -> Self {
        Self {
            role,
            state: AspState::Down,
            routing_context,
            network_appearance,
            info_string: None,
        }
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info_string = Some(info.into());
        self
    }

    pub fn state(&self) -> AspState {
        self.state
    }

    pub fn role(&self) -> AspRole {
        self.role
    }

    pub fn is_active(&self) -> bool {
        self.state == AspState::Active
    }

    fn routing_contexts(&self) -> Vec<u32> {
        self.routing_context.into_iter().collect()
    }

    fn set_state(&mut self, state: AspState, output: &mut AspOutput) {
        if self.state != state {
            info!(from = ?self.state, to = ?state, role = ?self.role, "ASP state change");
            self.state = state;
            output.transition = Some(state);
        }
    }

    fn unexpected(&self, message: &M3uaMessage) -> AspOutput {
        warn!(message = message.name(), state = ?self.state, "Unexpected M3UA message");
        AspOutput::reply(M3uaMessage::Error {
            error_code: error_code::UNEXPECTED_MESSAGE,
            routing_context: self.routing_contexts(),
            diagnostic_info: None,
        })
    }

    /// First message of the client-side bring-up
    pub fn start(&mut self) -> Result<M3uaMessage, M3uaError> {
        if self.role != AspRole::Client || self.state != AspState::Down {
            return Err(M3uaError::AspStateError(format!(
                "Cannot ASP UP as {:?} from state {:?}",
                self.role, self.state
            )));
        }
        info!("Sending ASP UP");
        Ok(M3uaMessage::AspUp {
            asp_identifier: None,
            info_string: self.info_string.clone(),
        })
    }

    /// Message announcing we are going away; the state drops to `Down`
    /// without waiting for the acknowledgement
    pub fn stop(&mut self) -> Option<M3uaMessage> {
        if self.state == AspState::Down {
            return None;
        }
        let mut ignored = AspOutput::default();
        self.set_state(AspState::Down, &mut ignored);
        Some(M3uaMessage::AspDown { info_string: None })
    }

    /// Force `Down` after the association is lost
    pub fn reset(&mut self) -> Option<AspState> {
        let mut output = AspOutput::default();
        self.set_state(AspState::Down, &mut output);
        output.transition
    }

    /// Wrap user data for transfer; only legal while `Active`
    pub fn wrap_data(&self, protocol_data: ProtocolData) -> Result<M3uaMessage, M3uaError> {
        if self.state != AspState::Active {
            return Err(M3uaError::AspStateError(format!(
                "Cannot send data in state {:?}",
                self.state
            )));
        }
        Ok(M3uaMessage::Data {
            network_appearance: self.network_appearance,
            routing_context: self.routing_context,
            protocol_data,
            correlation_id: None,
        })
    }

    pub fn on_message(&mut self, message: M3uaMessage) -> Result<AspOutput, M3uaError> {
        use AspState::*;

        let mut output = AspOutput::default();
        match (self.role, self.state, message) {
            (_, _, M3uaMessage::Heartbeat { data }) => {
                return Ok(AspOutput::reply(M3uaMessage::HeartbeatAck { data }));
            }
            (_, _, M3uaMessage::HeartbeatAck { .. }) => {}
            (_, Active, M3uaMessage::Data { protocol_data, .. }) => {
                debug!(
                    opc = protocol_data.opc,
                    dpc = protocol_data.dpc,
                    si = protocol_data.si,
                    len = protocol_data.data.len(),
                    "Received data"
                );
                output.data = Some(protocol_data);
            }
            // Never answered, so two ASPs cannot bounce ERRs between them
            (_, _, M3uaMessage::Error { error_code, .. }) => {
                output.peer_error = Some(error_code);
            }
            (_, _, M3uaMessage::Notify {
                status_type,
                status_info,
                ..
            }) => {
                debug!(status_type, status_info, "Received NOTIFY");
            }
            (_, _, message @ (M3uaMessage::Duna { .. } | M3uaMessage::Dava { .. })) => {
                debug!(message = message.name(), "Ignoring SSNM message");
            }

            // Client side
            (AspRole::Client, Down, M3uaMessage::AspUpAck { .. }) => {
                self.set_state(Inactive, &mut output);
                info!("Sending ASP ACTIVE");
                output.replies.push(M3uaMessage::AspActive {
                    traffic_mode_type: Some(TrafficModeType::Override),
                    routing_context: self.routing_contexts(),
                    info_string: None,
                });
            }
            (AspRole::Client, Inactive, M3uaMessage::AspActiveAck { .. }) => {
                self.set_state(Active, &mut output);
            }
            (AspRole::Client, _, M3uaMessage::AspInactiveAck { .. }) => {
                self.set_state(Inactive, &mut output);
            }
            (AspRole::Client, _, M3uaMessage::AspDownAck { .. }) => {
                self.set_state(Down, &mut output);
            }

            // Server side
            (AspRole::Server, Down, M3uaMessage::AspUp { .. }) => {
                self.set_state(Inactive, &mut output);
                output.replies.push(M3uaMessage::AspUpAck {
                    info_string: self.info_string.clone(),
                });
            }
            (AspRole::Server, Inactive | Active, M3uaMessage::AspActive {
                traffic_mode_type,
                routing_context,
                ..
            }) => {
                self.set_state(Active, &mut output);
                output.replies.push(M3uaMessage::AspActiveAck {
                    traffic_mode_type,
                    routing_context,
                    info_string: None,
                });
            }
            (AspRole::Server, Inactive | Active, M3uaMessage::AspInactive { routing_context, .. }) => {
                self.set_state(Inactive, &mut output);
                output.replies.push(M3uaMessage::AspInactiveAck {
                    routing_context,
                    info_string: None,
                });
            }
            (AspRole::Server, _, M3uaMessage::AspDown { .. }) => {
                self.set_state(Down, &mut output);
                output
                    .replies
                    .push(M3uaMessage::AspDownAck { info_string: None });
            }

            (_, _, message) => return Ok(self.unexpected(&message)),
        }
        Ok(output)
    }
}
