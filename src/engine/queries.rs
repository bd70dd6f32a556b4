use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{collect_loads, free_windows, peak_load};
use super::conflict::validate_span;
use super::{Engine, EngineError};

impl Engine {
    /// How many slots are free for the whole window — the booking page's
    /// headline number. Never negative: a negative intermediate is a
    /// bookkeeping signal that gets logged inside the resolver and
    /// clamped here.
    pub async fn check_availability(
        &self,
        spot_id: Ulid,
        query_start: Ms,
        query_end: Ms,
    ) -> Result<AvailabilityInfo, EngineError> {
        let query = self.validate_query(query_start, query_end)?;
        let spot = self.get_spot(&spot_id).ok_or(EngineError::NotFound(spot_id))?;
        let guard = spot.read().await;

        let loads = collect_loads(&guard, &query);
        let occupied = peak_load(&loads);
        let free = if occupied > guard.total_slots {
            tracing::error!(
                spot_id = %spot_id,
                occupied,
                total_slots = guard.total_slots,
                "negative free capacity — committed load exceeds total_slots"
            );
            0
        } else {
            guard.total_slots - occupied
        };

        Ok(AvailabilityInfo {
            spot_id,
            total_slots: guard.total_slots,
            occupied,
            free,
        })
    }

    /// Sub-windows where at least `min_slots` slots are free — the
    /// "soonest next available" query.
    pub async fn compute_free_windows(
        &self,
        spot_id: Ulid,
        query_start: Ms,
        query_end: Ms,
        min_slots: u32,
        min_duration_ms: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        let query = self.validate_query(query_start, query_end)?;
        let spot = self.get_spot(&spot_id).ok_or(EngineError::NotFound(spot_id))?;
        let guard = spot.read().await;

        let mut free = free_windows(&guard, &query, min_slots);
        if let Some(min_dur) = min_duration_ms {
            free.retain(|span| span.duration_ms() >= min_dur);
        }
        Ok(free)
    }

    fn validate_query(&self, start: Ms, end: Ms) -> Result<Span, EngineError> {
        if start >= end {
            return Err(EngineError::Validation("window start must be before end"));
        }
        if end - start > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        Ok(Span::new(start, end))
    }

    pub fn list_spots(&self) -> Vec<SpotInfo> {
        self.state
            .iter()
            .map(|entry| {
                let spot = entry.value().clone();
                let guard = spot.try_read().expect("list_spots: uncontended read");
                SpotInfo {
                    id: guard.id,
                    owner_id: guard.owner_id,
                    name: guard.name.clone(),
                    total_slots: guard.total_slots,
                    price_cents_per_hour: guard.price_cents_per_hour,
                    lat: guard.lat,
                    lon: guard.lon,
                    active: guard.active,
                }
            })
            .collect()
    }

    pub async fn get_blocks(&self, spot_id: Ulid) -> Result<Vec<BlockInfo>, EngineError> {
        let spot = self.get_spot(&spot_id).ok_or(EngineError::NotFound(spot_id))?;
        let guard = spot.read().await;
        Ok(guard
            .claims
            .iter()
            .filter_map(|c| match &c.kind {
                ClaimKind::Block { status, slots_open, reason } => Some(BlockInfo {
                    id: c.id,
                    spot_id,
                    start: c.span.start,
                    end: c.span.end,
                    status: *status,
                    slots_open: *slots_open,
                    reason: reason.clone(),
                }),
                _ => None,
            })
            .collect())
    }

    pub async fn get_bookings(&self, spot_id: Ulid) -> Result<Vec<BookingInfo>, EngineError> {
        let spot = self.get_spot(&spot_id).ok_or(EngineError::NotFound(spot_id))?;
        let guard = spot.read().await;
        Ok(guard
            .claims
            .iter()
            .filter_map(|c| BookingInfo::from_claim(spot_id, c))
            .collect())
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<BookingInfo, EngineError> {
        let spot_id = self
            .get_spot_for_claim(&id)
            .ok_or(EngineError::NotFound(id))?;
        let spot = self.get_spot(&spot_id).ok_or(EngineError::NotFound(spot_id))?;
        let guard = spot.read().await;
        guard
            .find_claim(id)
            .and_then(|c| BookingInfo::from_claim(spot_id, c))
            .ok_or(EngineError::NotFound(id))
    }

    /// Check a span the way `reserve` would, without mutating — used by
    /// callers that want to pre-flight a request.
    pub async fn probe_reserve(&self, spot_id: Ulid, span: Span) -> Result<u32, EngineError> {
        validate_span(&span)?;
        let spot = self.get_spot(&spot_id).ok_or(EngineError::NotFound(spot_id))?;
        let guard = spot.read().await;
        super::conflict::check_capacity(&guard, &span)
    }
}
