//! Uniform response envelope for mutating HTTP calls

use serde::{Deserialize, Serialize};

/// `{id, status, message}` body returned by every mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Request id assigned by the answering instance
    pub id: u64,
    /// Whether the request succeeded
    pub status: bool,
    /// Human readable outcome or error
    pub message: String,
}

impl Envelope {
    /// Successful outcome.
    pub fn ok(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            status: true,
            message: message.into(),
        }
    }

    /// Failed outcome.
    pub fn failed(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            status: false,
            message: message.into(),
        }
    }
}
