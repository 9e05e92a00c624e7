use parley_types::events::{ErrorReason, GatewayEvent};
use parley_types::models::RoomKeyError;
use thiserror::Error;

use crate::store::StoreError;

/// Every failure is scoped to the operation that triggered it.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("not a participant of room {0}")]
    Forbidden(String),

    #[error("persistence failure: {0}")]
    PersistenceFailure(#[from] StoreError),
}

impl GatewayError {
    pub fn reason(&self) -> ErrorReason {
        match self {
            Self::Unauthenticated(_) => ErrorReason::Unauthenticated,
            Self::InvalidMessage(_) => ErrorReason::InvalidMessage,
            Self::Forbidden(_) => ErrorReason::Forbidden,
            Self::PersistenceFailure(_) => ErrorReason::PersistenceFailure,
        }
    }

    /// The `Error` event reported back to the originating client.
    pub fn to_event(&self) -> GatewayEvent {
        GatewayEvent::error(self.reason(), self.to_string())
    }
}

impl From<RoomKeyError> for GatewayError {
    fn from(err: RoomKeyError) -> Self {
        Self::InvalidMessage(err.to_string())
    }
}
