//! MAP (Mobile Application Part) Layer
//!
//! 3GPP TS 29.002 short message relay: MO-ForwardSM and MT-ForwardSM
//! carried in TCAP components.

pub mod encoding;
pub mod sms;
pub mod tpdu;

pub use sms::{inbound_message, mo_forward_sm, mt_forward_sm, ForwardSmArg};
pub use tpdu::{SmsDeliver, SmsSubmit, UserData, ValidityPeriod};

use bytes::Bytes;

use crate::errors::MapError;
use crate::tcap::{Component, Problem};

/// MAP Operation Codes
pub mod operation {
    pub const MT_FORWARD_SHORT_MESSAGE: i32 = 44;
    pub const MO_FORWARD_SHORT_MESSAGE: i32 = 46;
}

/// MAP Application Contexts
pub mod application_context {
    /// shortMsgMT-RelayContext-v3
    pub const SHORT_MSG_MT_RELAY_V3: &[u32] = &[0, 4, 0, 0, 1, 0, 25, 3];
    /// shortMsgMO-RelayContext-v3
    pub const SHORT_MSG_MO_RELAY_V3: &[u32] = &[0, 4, 0, 0, 1, 0, 21, 3];
}

/// MAP error codes returned in ReturnError
pub mod error_code {
    pub const UNKNOWN_SUBSCRIBER: i32 = 1;
    pub const ABSENT_SUBSCRIBER_SM: i32 = 6;
    pub const FACILITY_NOT_SUPPORTED: i32 = 21;
    pub const SM_DELIVERY_FAILURE: i32 = 32;
    pub const SYSTEM_FAILURE: i32 = 34;
    pub const DATA_MISSING: i32 = 35;
    pub const UNEXPECTED_DATA_VALUE: i32 = 36;
}

/// The two relay operations this gateway speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmsOperation {
    MoForwardSm,
    MtForwardSm,
}

impl SmsOperation {
    pub fn from_code(code: i32) -> Result<Self, MapError> {
        match code {
            operation::MO_FORWARD_SHORT_MESSAGE => Ok(Self::MoForwardSm),
            operation::MT_FORWARD_SHORT_MESSAGE => Ok(Self::MtForwardSm),
            other => Err(MapError::UnsupportedOperation(other)),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::MoForwardSm => operation::MO_FORWARD_SHORT_MESSAGE,
            Self::MtForwardSm => operation::MT_FORWARD_SHORT_MESSAGE,
        }
    }

    pub fn application_context(self) -> &'static [u32] {
        match self {
            Self::MoForwardSm => application_context::SHORT_MSG_MO_RELAY_V3,
            Self::MtForwardSm => application_context::SHORT_MSG_MT_RELAY_V3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::MoForwardSm => "MO-ForwardSM",
            Self::MtForwardSm => "MT-ForwardSM",
        }
    }
}

/// Invoke component for a ForwardSM operation
pub fn invoke(operation: SmsOperation, invoke_id: i32, argument: Bytes) -> Component {
    Component::Invoke {
        invoke_id,
        linked_id: None,
        operation_code: operation.code(),
        parameter: Some(argument),
    }
}

/// Acknowledge an invoke (ForwardSM results carry no parameter we need)
pub fn result(invoke_id: i32) -> Component {
    Component::ReturnResultLast {
        invoke_id,
        operation_code: None,
        parameter: None,
    }
}

pub fn error(invoke_id: i32, code: i32) -> Component {
    Component::ReturnError {
        invoke_id,
        error_code: code,
        parameter: None,
    }
}

/// Interpret the components answering `invoke_id`
///
/// A result acknowledges delivery, an error or reject fails it. Answers with
/// no component for the invoke are treated as an implicit success.
pub fn outcome(components: &[Component], invoke_id: i32) -> Result<(), MapError> {
    for component in components {
        let answers = component.invoke_id() == Some(invoke_id)
            || matches!(component, Component::Reject { invoke_id: None, .. });
        if !answers {
            continue;
        }
        match component {
            Component::ReturnResultLast { .. } | Component::ReturnResultNotLast { .. } => {
                return Ok(())
            }
            Component::ReturnError { error_code, .. } => {
                return Err(MapError::OperationError { code: *error_code })
            }
            Component::Reject { problem, .. } => {
                let code = match problem {
                    Problem::General(c)
                    | Problem::Invoke(c)
                    | Problem::ReturnResult(c)
                    | Problem::ReturnError(c) => *c,
                };
                return Err(MapError::Rejected(code));
            }
            Component::Invoke { .. } => {}
        }
    }
    Ok(())
}

/// MAP error code reported back for a failed inbound operation
pub fn error_code_for(err: &MapError) -> i32 {
    match err {
        MapError::OperationError { code } => *code,
        MapError::UnsupportedOperation(_) => error_code::FACILITY_NOT_SUPPORTED,
        MapError::Malformed(_) | MapError::Encoding(_) | MapError::Tcap(_) => {
            error_code::UNEXPECTED_DATA_VALUE
        }
        MapError::Rejected(_) => error_code::SYSTEM_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_codes() {
        assert_eq!(SmsOperation::from_code(44).unwrap(), SmsOperation::MtForwardSm);
        assert_eq!(SmsOperation::from_code(46).unwrap(), SmsOperation::MoForwardSm);
        assert!(matches!(
            SmsOperation::from_code(59),
            Err(MapError::UnsupportedOperation(59))
        ));
        assert_eq!(
            SmsOperation::MtForwardSm.application_context(),
            &[0, 4, 0, 0, 1, 0, 25, 3]
        );
    }

    #[test]
    fn test_outcome() {
        assert!(outcome(&[result(1)], 1).is_ok());
        assert!(outcome(&[], 1).is_ok());
        assert!(matches!(
            outcome(&[error(1, error_code::ABSENT_SUBSCRIBER_SM)], 1),
            Err(MapError::OperationError { code: 6 })
        ));
        assert!(matches!(
            outcome(
                &[Component::Reject {
                    invoke_id: None,
                    problem: Problem::MISTYPED_COMPONENT
                }],
                1
            ),
            Err(MapError::Rejected(1))
        ));
        // Components for other invokes are ignored
        assert!(outcome(&[error(2, 34)], 1).is_ok());
    }

    #[test]
    fn test_error_code_for() {
        assert_eq!(
            error_code_for(&MapError::Malformed("x".to_string())),
            error_code::UNEXPECTED_DATA_VALUE
        );
        assert_eq!(
            error_code_for(&MapError::UnsupportedOperation(59)),
            error_code::FACILITY_NOT_SUPPORTED
        );
    }
}
