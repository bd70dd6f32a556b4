mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{
    free_capacity, free_capacity_clamped, free_windows, merge_overlapping, peak_load,
    saturated_spans, subtract_spans,
};
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedSpotState = Arc<RwLock<SpotState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedSpotState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: claim (block/booking) id → spot id
    pub(super) claim_to_spot: DashMap<Ulid, Ulid>,
    /// QR token → booking claim id. Entries drop when a booking turns terminal.
    pub(super) qr_index: DashMap<String, Ulid>,
    /// Unpaid pending bookings are swept to cancelled this long after reserve.
    pub(super) payment_timeout_ms: Ms,
}

/// Apply an event directly to a SpotState (no locking — caller holds the lock).
fn apply_to_spot(
    spot: &mut SpotState,
    event: &Event,
    claim_map: &DashMap<Ulid, Ulid>,
    qr_index: &DashMap<String, Ulid>,
) {
    match event {
        Event::SpotUpdated {
            name,
            total_slots,
            price_cents_per_hour,
            active,
            ..
        } => {
            spot.name = name.clone();
            spot.total_slots = *total_slots;
            spot.price_cents_per_hour = *price_cents_per_hour;
            spot.active = *active;
        }
        Event::SpotDeactivated { .. } => {
            spot.active = false;
        }
        Event::BlockAdded {
            id,
            spot_id,
            span,
            status,
            slots_open,
            reason,
        } => {
            spot.insert_claim(Claim {
                id: *id,
                span: *span,
                kind: ClaimKind::Block {
                    status: *status,
                    slots_open: *slots_open,
                    reason: reason.clone(),
                },
            });
            claim_map.insert(*id, *spot_id);
        }
        Event::BlockUpdated {
            id,
            spot_id,
            span,
            status,
            slots_open,
            reason,
        } => {
            spot.remove_claim(*id);
            spot.insert_claim(Claim {
                id: *id,
                span: *span,
                kind: ClaimKind::Block {
                    status: *status,
                    slots_open: *slots_open,
                    reason: reason.clone(),
                },
            });
            claim_map.insert(*id, *spot_id);
        }
        Event::BlockRemoved { id, .. } => {
            spot.remove_claim(*id);
            claim_map.remove(id);
        }
        Event::BookingReserved {
            id,
            spot_id,
            guest_id,
            vehicle_id,
            span,
            total_cost_cents,
            qr_code,
            pin,
            pay_deadline,
        } => {
            spot.insert_claim(Claim {
                id: *id,
                span: *span,
                kind: ClaimKind::Booking(BookingDetail {
                    guest_id: *guest_id,
                    vehicle_id: *vehicle_id,
                    total_cost_cents: *total_cost_cents,
                    status: BookingStatus::Pending,
                    payment: PaymentStatus::Pending,
                    qr_code: qr_code.clone(),
                    pin: *pin,
                    pay_deadline: *pay_deadline,
                }),
            });
            claim_map.insert(*id, *spot_id);
            qr_index.insert(qr_code.clone(), *id);
        }
        Event::PaymentVerified { id, .. } => {
            if let Some(claim) = spot.find_claim_mut(*id)
                && let Some(b) = claim.as_booking_mut()
            {
                b.status = BookingStatus::Confirmed;
                b.payment = PaymentStatus::Verified;
            }
        }
        Event::PaymentRejected { id, .. } => {
            if let Some(claim) = spot.find_claim_mut(*id)
                && let Some(b) = claim.as_booking_mut()
            {
                b.status = BookingStatus::Cancelled;
                b.payment = PaymentStatus::Rejected;
                qr_index.remove(&b.qr_code);
            }
        }
        Event::EntryValidated { id, .. } => {
            if let Some(claim) = spot.find_claim_mut(*id)
                && let Some(b) = claim.as_booking_mut()
            {
                b.status = BookingStatus::Active;
            }
        }
        Event::BookingCompleted { id, .. } => {
            if let Some(claim) = spot.find_claim_mut(*id)
                && let Some(b) = claim.as_booking_mut()
            {
                b.status = BookingStatus::Completed;
                qr_index.remove(&b.qr_code);
            }
        }
        Event::BookingCancelled { id, .. } => {
            if let Some(claim) = spot.find_claim_mut(*id)
                && let Some(b) = claim.as_booking_mut()
            {
                b.status = BookingStatus::Cancelled;
                qr_index.remove(&b.qr_code);
            }
        }
        // SpotCreated is handled at the DashMap level, not here
        Event::SpotCreated { .. } => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        payment_timeout_ms: Ms,
    ) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            claim_to_spot: DashMap::new(),
            qr_index: DashMap::new(),
            payment_timeout_ms,
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this may run inside an async context (e.g. lazy tenant
        // creation).
        for event in &events {
            match event {
                Event::SpotCreated {
                    id,
                    owner_id,
                    name,
                    total_slots,
                    price_cents_per_hour,
                    lat,
                    lon,
                } => {
                    let spot = SpotState::new(
                        *id,
                        *owner_id,
                        name.clone(),
                        *total_slots,
                        *price_cents_per_hour,
                        *lat,
                        *lon,
                    );
                    engine.state.insert(*id, Arc::new(RwLock::new(spot)));
                }
                other => {
                    if let Some(spot_id) = event_spot_id(other)
                        && let Some(entry) = engine.state.get(&spot_id)
                    {
                        let spot_arc = entry.clone();
                        let mut guard = spot_arc.try_write().expect("replay: uncontended write");
                        apply_to_spot(&mut guard, other, &engine.claim_to_spot, &engine.qr_index);
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_spot(&self, id: &Ulid) -> Option<SharedSpotState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_spot_for_claim(&self, claim_id: &Ulid) -> Option<Ulid> {
        self.claim_to_spot.get(claim_id).map(|e| *e.value())
    }

    pub fn payment_timeout_ms(&self) -> Ms {
        self.payment_timeout_ms
    }

    /// WAL-append + apply + notify in one call. Eliminates the repeated
    /// 3-line pattern. Notification is fire-and-forget: a full or absent
    /// channel never fails the mutation.
    pub(super) async fn persist_and_apply(
        &self,
        spot_id: Ulid,
        spot: &mut SpotState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_spot(spot, event, &self.claim_to_spot, &self.qr_index);
        self.notify.send(spot_id, event);
        Ok(())
    }

    /// Lookup claim → spot, get spot, acquire write lock.
    pub(super) async fn resolve_claim_write(
        &self,
        claim_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<SpotState>), EngineError> {
        let spot_id = self
            .get_spot_for_claim(claim_id)
            .ok_or(EngineError::NotFound(*claim_id))?;
        let spot = self
            .get_spot(&spot_id)
            .ok_or(EngineError::NotFound(spot_id))?;
        let guard = spot.write_owned().await;
        Ok((spot_id, guard))
    }
}

/// Extract the spot_id from an event (for non-Create events).
fn event_spot_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BlockAdded { spot_id, .. }
        | Event::BlockUpdated { spot_id, .. }
        | Event::BlockRemoved { spot_id, .. }
        | Event::BookingReserved { spot_id, .. }
        | Event::PaymentVerified { spot_id, .. }
        | Event::PaymentRejected { spot_id, .. }
        | Event::EntryValidated { spot_id, .. }
        | Event::BookingCompleted { spot_id, .. }
        | Event::BookingCancelled { spot_id, .. } => Some(*spot_id),
        Event::SpotUpdated { id, .. } | Event::SpotDeactivated { id } => Some(*id),
        Event::SpotCreated { .. } => None,
    }
}
