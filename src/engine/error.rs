use ulid::Ulid;

use crate::model::{format_timestamp, InvalidEntity, Ms};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Ulid },

    #[error("already exists: {0}")]
    AlreadyExists(Ulid),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("time slot at {} has already started", format_timestamp(*.0))]
    PastTime(Ms),

    #[error("not enough available slots: requested {requested}, available {available}")]
    Capacity { requested: u32, available: u32 },

    #[error("time slot conflicts with existing bookings: {0}")]
    Conflict(String),

    #[error("booking {booking} does not belong to user {user}")]
    Unauthorized { booking: Ulid, user: Ulid },

    #[error("concurrent modification, retry: {0}")]
    StateConflict(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: Ulid) -> Self {
        EngineError::NotFound { entity, id }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::Validation(_) => "validation",
            EngineError::PastTime(_) => "past_time",
            EngineError::Capacity { .. } => "capacity",
            EngineError::Conflict(_) => "conflict",
            EngineError::Unauthorized { .. } => "unauthorized",
            EngineError::StateConflict(_) => "state_conflict",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal",
        }
    }
}

impl From<InvalidEntity> for EngineError {
    fn from(e: InvalidEntity) -> Self {
        EngineError::Validation(e.0)
    }
}
