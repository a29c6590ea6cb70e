//! Payment gateway callback acknowledgements.
//!
//! The gateway keeps redelivering a callback until it receives a 2xx, so outcomes that redelivery
//! cannot change are acknowledged with 200 and a [`CallbackCode::Rejected`] code.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallbackCode {
    Success,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackAck {
    pub code: CallbackCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CallbackAck {
    pub fn success() -> Self {
        Self {
            code: CallbackCode::Success,
            message: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            code: CallbackCode::Rejected,
            message: Some(message.into()),
        }
    }
}
