use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug)]
pub enum EngineError {
    Validation(&'static str),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Capacity exhausted for the requested window. Carries the free
    /// count at decision time so the caller can word a retry message.
    Conflict { remaining: u32 },
    /// Actor is not allowed to mutate the resource.
    Unauthorized(Ulid),
    /// Booking past its end, or pending past its payment deadline.
    Expired(Ulid),
    /// Entry attempted before the booking window or before payment.
    NotYetActive(Ulid),
    /// Unknown, malformed, or wrong-spot gate code.
    InvalidCode,
    InvalidTransition {
        from: BookingStatus,
    },
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "validation: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict { remaining } => {
                write!(
                    f,
                    "this time slot is no longer available, {remaining} slot(s) remain"
                )
            }
            EngineError::Unauthorized(actor) => {
                write!(f, "actor {actor} is not the owner of this resource")
            }
            EngineError::Expired(id) => write!(f, "booking {id} has expired"),
            EngineError::NotYetActive(id) => write!(f, "booking {id} is not active yet"),
            EngineError::InvalidCode => write!(f, "invalid or expired code"),
            EngineError::InvalidTransition { from } => {
                write!(f, "invalid transition from status {}", from.as_str())
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
