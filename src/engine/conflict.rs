use crate::model::*;

use super::availability::free_capacity_clamped;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Reject malformed windows before any lookup or mutation.
pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(EngineError::Validation("window start must be before end"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Free capacity for the window, or Conflict when nothing remains.
/// Callers hold the spot's write lock, so the check and the commit
/// that follows are indivisible per spot.
pub(crate) fn check_capacity(spot: &SpotState, span: &Span) -> Result<u32, EngineError> {
    let free = free_capacity_clamped(spot, span);
    if free == 0 {
        return Err(EngineError::Conflict { remaining: 0 });
    }
    Ok(free)
}

/// A PIN collides when another capacity-holding booking on the same
/// spot overlaps the window — an attendant could validate the wrong
/// vehicle otherwise.
pub(crate) fn pin_in_use(spot: &SpotState, span: &Span, pin: u16) -> bool {
    spot.overlapping(span).any(|claim| {
        claim
            .as_booking()
            .is_some_and(|b| b.status.holds_capacity() && b.pin == pin)
    })
}
