use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;
use uuid::Uuid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_capacity, now_ms, pin_in_use, validate_span};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    // ── Spots ────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn create_spot(
        &self,
        id: Ulid,
        owner_id: Ulid,
        name: Option<String>,
        total_slots: u32,
        price_cents_per_hour: i64,
        lat: f64,
        lon: f64,
    ) -> Result<(), EngineError> {
        if total_slots == 0 {
            return Err(EngineError::Validation("total_slots must be at least 1"));
        }
        if price_cents_per_hour < 0 {
            return Err(EngineError::Validation("price must not be negative"));
        }
        if self.state.len() >= MAX_SPOTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many spots"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("spot name too long"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::SpotCreated {
            id,
            owner_id,
            name: name.clone(),
            total_slots,
            price_cents_per_hour,
            lat,
            lon,
        };
        self.wal_append(&event).await?;
        let spot = SpotState::new(id, owner_id, name, total_slots, price_cents_per_hour, lat, lon);
        self.state.insert(id, Arc::new(RwLock::new(spot)));
        self.notify.send(id, &event);
        Ok(())
    }

    /// Partial update: `None` fields keep their current value. The event
    /// carries the resulting full values.
    pub async fn update_spot(
        &self,
        id: Ulid,
        actor: Ulid,
        name: Option<String>,
        total_slots: Option<u32>,
        price_cents_per_hour: Option<i64>,
        active: Option<bool>,
    ) -> Result<(), EngineError> {
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("spot name too long"));
        }
        if total_slots == Some(0) {
            return Err(EngineError::Validation("total_slots must be at least 1"));
        }
        if let Some(p) = price_cents_per_hour
            && p < 0
        {
            return Err(EngineError::Validation("price must not be negative"));
        }
        let spot = self.get_spot(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = spot.write().await;
        if guard.owner_id != actor {
            return Err(EngineError::Unauthorized(actor));
        }

        let event = Event::SpotUpdated {
            id,
            name: name.or_else(|| guard.name.clone()),
            total_slots: total_slots.unwrap_or(guard.total_slots),
            price_cents_per_hour: price_cents_per_hour.unwrap_or(guard.price_cents_per_hour),
            active: active.unwrap_or(guard.active),
        };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    /// Soft deactivation. Spots are never hard-deleted: booking history
    /// is a financial record. Idempotent.
    pub async fn deactivate_spot(&self, id: Ulid, actor: Ulid) -> Result<(), EngineError> {
        let spot = self.get_spot(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = spot.write().await;
        if guard.owner_id != actor {
            return Err(EngineError::Unauthorized(actor));
        }
        if !guard.active {
            return Ok(());
        }

        let event = Event::SpotDeactivated { id };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    // ── Blocks ───────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn add_block(
        &self,
        id: Ulid,
        spot_id: Ulid,
        actor: Ulid,
        span: Span,
        status: BlockStatus,
        slots_open: u32,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        validate_span(&span)?;
        if let Some(ref r) = reason
            && r.len() > MAX_REASON_LEN
        {
            return Err(EngineError::LimitExceeded("block reason too long"));
        }
        let spot = self.get_spot(&spot_id).ok_or(EngineError::NotFound(spot_id))?;
        let mut guard = spot.write().await;
        if guard.owner_id != actor {
            return Err(EngineError::Unauthorized(actor));
        }
        if slots_open > guard.total_slots {
            return Err(EngineError::Validation("slots_open exceeds total_slots"));
        }
        if guard.claims.len() >= MAX_CLAIMS_PER_SPOT {
            return Err(EngineError::LimitExceeded("too many claims on spot"));
        }
        if self.claim_to_spot.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::BlockAdded { id, spot_id, span, status, slots_open, reason };
        self.persist_and_apply(spot_id, &mut guard, &event).await
    }

    pub async fn update_block(
        &self,
        id: Ulid,
        actor: Ulid,
        span: Span,
        status: BlockStatus,
        slots_open: u32,
        reason: Option<String>,
    ) -> Result<Ulid, EngineError> {
        validate_span(&span)?;
        if let Some(ref r) = reason
            && r.len() > MAX_REASON_LEN
        {
            return Err(EngineError::LimitExceeded("block reason too long"));
        }
        let (spot_id, mut guard) = self.resolve_claim_write(&id).await?;
        if guard.owner_id != actor {
            return Err(EngineError::Unauthorized(actor));
        }
        if !guard.find_claim(id).is_some_and(Claim::is_block) {
            return Err(EngineError::NotFound(id));
        }
        if slots_open > guard.total_slots {
            return Err(EngineError::Validation("slots_open exceeds total_slots"));
        }

        let event = Event::BlockUpdated { id, spot_id, span, status, slots_open, reason };
        self.persist_and_apply(spot_id, &mut guard, &event).await?;
        Ok(spot_id)
    }

    /// Removing a block never checks dependent bookings: blocks are
    /// additive reductions, so the resolver just recomputes.
    pub async fn remove_block(&self, id: Ulid, actor: Ulid) -> Result<Ulid, EngineError> {
        let (spot_id, mut guard) = self.resolve_claim_write(&id).await?;
        if guard.owner_id != actor {
            return Err(EngineError::Unauthorized(actor));
        }
        if !guard.find_claim(id).is_some_and(Claim::is_block) {
            return Err(EngineError::NotFound(id));
        }

        let event = Event::BlockRemoved { id, spot_id };
        self.persist_and_apply(spot_id, &mut guard, &event).await?;
        Ok(spot_id)
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Reserve one slot for `[span.start, span.end)`. The availability
    /// re-check and the commit run under the spot's write lock, so two
    /// racing reserves for the last slot serialize: one wins, the other
    /// gets Conflict. Different spots proceed in parallel.
    pub async fn reserve(
        &self,
        id: Ulid,
        spot_id: Ulid,
        guest_id: Ulid,
        vehicle_id: Ulid,
        span: Span,
    ) -> Result<BookingInfo, EngineError> {
        validate_span(&span)?;
        let spot = self.get_spot(&spot_id).ok_or(EngineError::NotFound(spot_id))?;
        let mut guard = spot.write().await;
        if !guard.active {
            return Err(EngineError::Validation("spot is deactivated"));
        }
        if guard.claims.len() >= MAX_CLAIMS_PER_SPOT {
            return Err(EngineError::LimitExceeded("too many claims on spot"));
        }
        if self.claim_to_spot.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        check_capacity(&guard, &span).inspect_err(|_| {
            metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
        })?;

        let total_cost_cents = guard.cost_cents(&span);
        let qr_code = self.issue_qr_token();
        let pin = issue_pin(&guard, &span)?;
        let pay_deadline = now_ms() + self.payment_timeout_ms;

        let event = Event::BookingReserved {
            id,
            spot_id,
            guest_id,
            vehicle_id,
            span,
            total_cost_cents,
            qr_code: qr_code.clone(),
            pin,
            pay_deadline,
        };
        self.persist_and_apply(spot_id, &mut guard, &event).await?;
        metrics::counter!(crate::observability::RESERVATIONS_TOTAL).increment(1);

        Ok(BookingInfo {
            id,
            spot_id,
            guest_id,
            vehicle_id,
            start: span.start,
            end: span.end,
            total_cost_cents,
            status: BookingStatus::Pending,
            payment: PaymentStatus::Pending,
            qr_code,
            pin,
            pay_deadline,
        })
    }

    /// pending → confirmed. Idempotent for already-verified bookings so
    /// payment-provider webhook retries don't error.
    pub async fn verify_payment(&self, id: Ulid, actor: Ulid) -> Result<(), EngineError> {
        let (spot_id, mut guard) = self.resolve_claim_write(&id).await?;
        if guard.owner_id != actor {
            return Err(EngineError::Unauthorized(actor));
        }
        let status = booking_status(&guard, id)?;
        match status {
            BookingStatus::Pending => {
                let event = Event::PaymentVerified { id, spot_id };
                self.persist_and_apply(spot_id, &mut guard, &event).await
            }
            BookingStatus::Confirmed | BookingStatus::Active => Ok(()),
            from => Err(EngineError::InvalidTransition { from }),
        }
    }

    /// pending → cancelled, payment marked rejected.
    pub async fn reject_payment(&self, id: Ulid, actor: Ulid) -> Result<(), EngineError> {
        let (spot_id, mut guard) = self.resolve_claim_write(&id).await?;
        if guard.owner_id != actor {
            return Err(EngineError::Unauthorized(actor));
        }
        let status = booking_status(&guard, id)?;
        match status {
            BookingStatus::Pending => {
                let event = Event::PaymentRejected { id, spot_id };
                self.persist_and_apply(spot_id, &mut guard, &event).await
            }
            BookingStatus::Cancelled => Ok(()),
            from => Err(EngineError::InvalidTransition { from }),
        }
    }

    /// Validate a gate code against one spot's bookings and transition
    /// confirmed → active on success. A code that is malformed, unknown,
    /// or belongs to another spot is the same error: InvalidCode.
    pub async fn validate_entry(
        &self,
        spot_id: Ulid,
        code: &EntryCode,
        now: Ms,
    ) -> Result<BookingInfo, EngineError> {
        let spot = self.get_spot(&spot_id).ok_or(EngineError::NotFound(spot_id))?;
        let mut guard = spot.write().await;

        let claim_id = match code {
            EntryCode::Qr(token) => {
                let id = self
                    .qr_index
                    .get(token)
                    .map(|e| *e.value())
                    .ok_or(EngineError::InvalidCode)?;
                // The token must resolve to a booking on THIS spot.
                if guard.find_claim(id).is_none() {
                    return Err(EngineError::InvalidCode);
                }
                id
            }
            EntryCode::Pin(pin) => find_booking_by_pin(&guard, *pin, now)?,
        };

        let claim = guard.find_claim(claim_id).ok_or(EngineError::InvalidCode)?;
        let booking = claim.as_booking().ok_or(EngineError::InvalidCode)?;
        let span = claim.span;

        match booking.status {
            // Payment not verified yet
            BookingStatus::Pending => Err(EngineError::NotYetActive(claim_id)),
            // Re-scan of an already validated booking
            BookingStatus::Active => {
                Ok(BookingInfo::from_claim(spot_id, claim).ok_or(EngineError::InvalidCode)?)
            }
            BookingStatus::Confirmed => {
                if now < span.start {
                    return Err(EngineError::NotYetActive(claim_id));
                }
                if now >= span.end {
                    return Err(EngineError::Expired(claim_id));
                }
                let event = Event::EntryValidated { id: claim_id, spot_id };
                self.persist_and_apply(spot_id, &mut guard, &event).await?;
                metrics::counter!(crate::observability::ENTRIES_VALIDATED_TOTAL).increment(1);
                let claim = guard.find_claim(claim_id).ok_or(EngineError::InvalidCode)?;
                Ok(BookingInfo::from_claim(spot_id, claim).ok_or(EngineError::InvalidCode)?)
            }
            BookingStatus::Completed | BookingStatus::Cancelled => Err(EngineError::InvalidCode),
        }
    }

    /// active|confirmed → completed (exit, or end_time elapsed).
    /// Idempotent for already-completed bookings.
    pub async fn complete_booking(&self, id: Ulid) -> Result<(), EngineError> {
        let (spot_id, mut guard) = self.resolve_claim_write(&id).await?;
        let status = booking_status(&guard, id)?;
        match status {
            BookingStatus::Active | BookingStatus::Confirmed => {
                let event = Event::BookingCompleted { id, spot_id };
                self.persist_and_apply(spot_id, &mut guard, &event).await
            }
            BookingStatus::Completed => Ok(()),
            from => Err(EngineError::InvalidTransition { from }),
        }
    }

    /// Cancel from pending/confirmed, releasing the capacity claim.
    /// Cancelling a terminal booking is a no-op that returns the current
    /// state (idempotent). An active booking must complete instead.
    /// `actor` None is the expiry sweep; otherwise the actor must be the
    /// guest or the spot owner.
    pub async fn cancel_booking(
        &self,
        id: Ulid,
        actor: Option<Ulid>,
    ) -> Result<BookingStatus, EngineError> {
        let (spot_id, mut guard) = self.resolve_claim_write(&id).await?;
        let claim = guard.find_claim(id).ok_or(EngineError::NotFound(id))?;
        let booking = claim.as_booking().ok_or(EngineError::NotFound(id))?;
        if let Some(actor) = actor
            && actor != booking.guest_id
            && actor != guard.owner_id
        {
            return Err(EngineError::Unauthorized(actor));
        }

        match booking.status {
            BookingStatus::Pending | BookingStatus::Confirmed => {
                let event = Event::BookingCancelled { id, spot_id };
                self.persist_and_apply(spot_id, &mut guard, &event).await?;
                Ok(BookingStatus::Cancelled)
            }
            terminal @ (BookingStatus::Cancelled | BookingStatus::Completed) => Ok(terminal),
            from @ BookingStatus::Active => Err(EngineError::InvalidTransition { from }),
        }
    }

    // ── Expiry sweep support ─────────────────────────────────

    /// Pending bookings whose payment deadline has passed.
    pub fn collect_expired_pending(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut expired = Vec::new();
        for entry in self.state.iter() {
            let spot = entry.value().clone();
            if let Ok(guard) = spot.try_read() {
                for claim in &guard.claims {
                    if let Some(b) = claim.as_booking()
                        && b.status == BookingStatus::Pending
                        && b.pay_deadline <= now
                    {
                        expired.push((claim.id, guard.id));
                    }
                }
            }
        }
        expired
    }

    /// Confirmed/active bookings whose window has fully elapsed.
    pub fn collect_overdue(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut overdue = Vec::new();
        for entry in self.state.iter() {
            let spot = entry.value().clone();
            if let Ok(guard) = spot.try_read() {
                for claim in &guard.claims {
                    if let Some(b) = claim.as_booking()
                        && matches!(b.status, BookingStatus::Confirmed | BookingStatus::Active)
                        && claim.span.end <= now
                    {
                        overdue.push((claim.id, guard.id));
                    }
                }
            }
        }
        overdue
    }

    /// Sweep transition pending → cancelled, re-checked under the lock:
    /// a payment verified between collect and sweep wins.
    pub async fn expire_pending(&self, id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let (spot_id, mut guard) = self.resolve_claim_write(&id).await?;
        let claim = guard.find_claim(id).ok_or(EngineError::NotFound(id))?;
        let still_pending = claim
            .as_booking()
            .is_some_and(|b| b.status == BookingStatus::Pending && b.pay_deadline <= now);
        if !still_pending {
            return Ok(false);
        }
        let event = Event::BookingCancelled { id, spot_id };
        self.persist_and_apply(spot_id, &mut guard, &event).await?;
        metrics::counter!(crate::observability::BOOKINGS_EXPIRED_TOTAL).increment(1);
        Ok(true)
    }

    // ── WAL compaction ───────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state. Terminal bookings past the retention
    /// horizon are dropped from the rewrite.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let now = now_ms();
        let mut events = Vec::new();

        let spot_ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        for id in spot_ids {
            let entry = match self.state.get(&id) {
                Some(e) => e,
                None => continue,
            };
            let spot = entry.value().clone();
            let guard = spot.try_read().expect("compact: uncontended read");

            events.push(Event::SpotCreated {
                id: guard.id,
                owner_id: guard.owner_id,
                name: guard.name.clone(),
                total_slots: guard.total_slots,
                price_cents_per_hour: guard.price_cents_per_hour,
                lat: guard.lat,
                lon: guard.lon,
            });
            if !guard.active {
                events.push(Event::SpotDeactivated { id: guard.id });
            }

            for claim in &guard.claims {
                match &claim.kind {
                    ClaimKind::Block { status, slots_open, reason } => {
                        events.push(Event::BlockAdded {
                            id: claim.id,
                            spot_id: guard.id,
                            span: claim.span,
                            status: *status,
                            slots_open: *slots_open,
                            reason: reason.clone(),
                        });
                    }
                    ClaimKind::Booking(b) => {
                        if b.status.is_terminal()
                            && claim.span.end + crate::limits::TERMINAL_RETENTION_MS < now
                        {
                            continue;
                        }
                        events.push(Event::BookingReserved {
                            id: claim.id,
                            spot_id: guard.id,
                            guest_id: b.guest_id,
                            vehicle_id: b.vehicle_id,
                            span: claim.span,
                            total_cost_cents: b.total_cost_cents,
                            qr_code: b.qr_code.clone(),
                            pin: b.pin,
                            pay_deadline: b.pay_deadline,
                        });
                        events.extend(status_replay_events(claim.id, guard.id, b));
                    }
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    // ── Token issuance ───────────────────────────────────────

    /// High-entropy token, collision-checked against all live tokens.
    fn issue_qr_token(&self) -> String {
        loop {
            let token = Uuid::new_v4().simple().to_string();
            if !self.qr_index.contains_key(&token) {
                return token;
            }
        }
    }
}

/// Status follow-up events that rebuild a booking's lifecycle position
/// on replay of a compacted WAL.
fn status_replay_events(id: Ulid, spot_id: Ulid, b: &BookingDetail) -> Vec<Event> {
    match b.status {
        BookingStatus::Pending => vec![],
        BookingStatus::Confirmed => vec![Event::PaymentVerified { id, spot_id }],
        BookingStatus::Active => vec![
            Event::PaymentVerified { id, spot_id },
            Event::EntryValidated { id, spot_id },
        ],
        BookingStatus::Completed => vec![
            Event::PaymentVerified { id, spot_id },
            Event::EntryValidated { id, spot_id },
            Event::BookingCompleted { id, spot_id },
        ],
        BookingStatus::Cancelled => {
            if b.payment == PaymentStatus::Rejected {
                vec![Event::PaymentRejected { id, spot_id }]
            } else if b.payment == PaymentStatus::Verified {
                vec![
                    Event::PaymentVerified { id, spot_id },
                    Event::BookingCancelled { id, spot_id },
                ]
            } else {
                vec![Event::BookingCancelled { id, spot_id }]
            }
        }
    }
}

fn booking_status(spot: &SpotState, id: Ulid) -> Result<BookingStatus, EngineError> {
    spot.find_claim(id)
        .and_then(|c| c.as_booking())
        .map(|b| b.status)
        .ok_or(EngineError::NotFound(id))
}

/// Draw a 4-digit pin that no overlapping live booking on this spot uses.
fn issue_pin(spot: &SpotState, span: &Span) -> Result<u16, EngineError> {
    for _ in 0..MAX_PIN_ATTEMPTS {
        let pin = (Uuid::new_v4().as_u128() % PIN_SPACE as u128) as u16;
        if !pin_in_use(spot, span, pin) {
            return Ok(pin);
        }
    }
    Err(EngineError::LimitExceeded("no free gate pin for this window"))
}

/// PIN lookup is scoped to this spot's capacity-holding bookings: prefer
/// one whose window covers `now`, else the soonest upcoming one. A pin
/// that only matches another spot's booking never resolves here.
fn find_booking_by_pin(spot: &SpotState, pin: u16, now: Ms) -> Result<Ulid, EngineError> {
    let mut upcoming: Option<(Ms, Ulid)> = None;
    let mut past: Option<(Ms, Ulid)> = None;

    for claim in &spot.claims {
        let Some(b) = claim.as_booking() else { continue };
        if !b.status.holds_capacity() || b.pin != pin {
            continue;
        }
        if claim.span.contains_instant(now) {
            return Ok(claim.id);
        }
        if claim.span.start > now {
            if upcoming.is_none_or(|(s, _)| claim.span.start < s) {
                upcoming = Some((claim.span.start, claim.id));
            }
        } else if past.is_none_or(|(e, _)| claim.span.end > e) {
            past = Some((claim.span.end, claim.id));
        }
    }

    upcoming
        .or(past)
        .map(|(_, id)| id)
        .ok_or(EngineError::InvalidCode)
}
