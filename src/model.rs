use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type. Bookings and blocks carry
/// absolute instants, never (date, time-of-day) pairs, so windows that
/// cross midnight compare like any other window.
pub type Ms = i64;

/// Milliseconds per hour, used for pricing.
pub const HOUR_MS: Ms = 3_600_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Clamp `self` to the boundaries of `window`.
    pub fn clamped_to(&self, window: &Span) -> Span {
        Span::new(self.start.max(window.start), self.end.min(window.end))
    }
}

/// Owner-declared disposition of a block window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStatus {
    /// Advertised-open marker. No capacity effect.
    Available,
    /// Slots withheld from guests for this window.
    Blocked,
    /// Slots withheld for maintenance work.
    Maintenance,
}

impl BlockStatus {
    pub fn reduces_capacity(&self) -> bool {
        matches!(self, BlockStatus::Blocked | BlockStatus::Maintenance)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockStatus::Available => "available",
            BlockStatus::Blocked => "blocked",
            BlockStatus::Maintenance => "maintenance",
        }
    }
}

/// Booking lifecycle. Transitions are monotonic:
/// pending → confirmed → active → completed, with cancellation allowed
/// only from pending/confirmed. Terminal states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Active,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }

    /// Whether a booking in this state counts against the spot's capacity.
    pub fn holds_capacity(&self) -> bool {
        matches!(
            self,
            BookingStatus::Pending | BookingStatus::Confirmed | BookingStatus::Active
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Active => "active",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Verified,
    Rejected,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Verified => "verified",
            PaymentStatus::Rejected => "rejected",
        }
    }
}

/// Mutable booking payload carried by a booking claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingDetail {
    pub guest_id: Ulid,
    pub vehicle_id: Ulid,
    pub total_cost_cents: i64,
    pub status: BookingStatus,
    pub payment: PaymentStatus,
    /// Server-issued high-entropy token, globally unique per tenant.
    pub qr_code: String,
    /// 4-digit gate code, unique among this spot's overlapping live bookings.
    pub pin: u16,
    /// Instant after which an unpaid pending booking is swept to cancelled.
    pub pay_deadline: Ms,
}

/// What a claim against a spot's timeline represents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimKind {
    /// Owner-declared capacity adjustment for a window.
    Block {
        status: BlockStatus,
        /// Slots left open to guests during the window (≤ total_slots).
        slots_open: u32,
        reason: Option<String>,
    },
    /// A guest reservation. Never removed, only transitioned.
    Booking(BookingDetail),
}

/// A single claim on a spot's timeline — blocks and bookings are both
/// just claims with a span and a weight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub id: Ulid,
    pub span: Span,
    pub kind: ClaimKind,
}

impl Claim {
    pub fn is_block(&self) -> bool {
        matches!(self.kind, ClaimKind::Block { .. })
    }

    pub fn as_booking(&self) -> Option<&BookingDetail> {
        match &self.kind {
            ClaimKind::Booking(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_booking_mut(&mut self) -> Option<&mut BookingDetail> {
        match &mut self.kind {
            ClaimKind::Booking(b) => Some(b),
            _ => None,
        }
    }

    /// How many slots this claim consumes while its span is in effect.
    pub fn load(&self, total_slots: u32) -> u32 {
        match &self.kind {
            ClaimKind::Block { status, slots_open, .. } if status.reduces_capacity() => {
                total_slots.saturating_sub(*slots_open)
            }
            ClaimKind::Block { .. } => 0,
            ClaimKind::Booking(b) if b.status.holds_capacity() => 1,
            ClaimKind::Booking(_) => 0,
        }
    }
}

/// A code presented at the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryCode {
    Qr(String),
    Pin(u16),
}

#[derive(Debug, Clone)]
pub struct SpotState {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub name: Option<String>,
    /// Physical capacity (≥ 1).
    pub total_slots: u32,
    pub price_cents_per_hour: i64,
    pub lat: f64,
    pub lon: f64,
    /// Deactivated spots keep their history but take no new bookings.
    pub active: bool,
    /// All claims (blocks + bookings), sorted by `span.start`.
    pub claims: Vec<Claim>,
}

impl SpotState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Ulid,
        owner_id: Ulid,
        name: Option<String>,
        total_slots: u32,
        price_cents_per_hour: i64,
        lat: f64,
        lon: f64,
    ) -> Self {
        Self {
            id,
            owner_id,
            name,
            total_slots,
            price_cents_per_hour,
            lat,
            lon,
            active: true,
            claims: Vec::new(),
        }
    }

    /// Insert claim maintaining sort order by span.start.
    pub fn insert_claim(&mut self, claim: Claim) {
        let pos = self
            .claims
            .binary_search_by_key(&claim.span.start, |c| c.span.start)
            .unwrap_or_else(|e| e);
        self.claims.insert(pos, claim);
    }

    /// Remove claim by id. Only blocks are ever removed; bookings are
    /// transitioned instead.
    pub fn remove_claim(&mut self, id: Ulid) -> Option<Claim> {
        if let Some(pos) = self.claims.iter().position(|c| c.id == id) {
            Some(self.claims.remove(pos))
        } else {
            None
        }
    }

    pub fn find_claim(&self, id: Ulid) -> Option<&Claim> {
        self.claims.iter().find(|c| c.id == id)
    }

    pub fn find_claim_mut(&mut self, id: Ulid) -> Option<&mut Claim> {
        self.claims.iter_mut().find(|c| c.id == id)
    }

    /// Return only claims whose span overlaps the query window.
    /// Uses binary search to skip claims starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Claim> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self.claims.partition_point(|c| c.span.start < query.end);
        self.claims[..right_bound]
            .iter()
            .filter(move |c| c.span.end > query.start)
    }

    /// Cost of parking `span` at this spot's hourly rate, rounded up to
    /// the next cent.
    pub fn cost_cents(&self, span: &Span) -> i64 {
        let d = span.duration_ms();
        (d * self.price_cents_per_hour + HOUR_MS - 1) / HOUR_MS
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    SpotCreated {
        id: Ulid,
        owner_id: Ulid,
        name: Option<String>,
        total_slots: u32,
        price_cents_per_hour: i64,
        lat: f64,
        lon: f64,
    },
    /// Carries the resulting full values so replay needs no merge logic.
    SpotUpdated {
        id: Ulid,
        name: Option<String>,
        total_slots: u32,
        price_cents_per_hour: i64,
        active: bool,
    },
    SpotDeactivated {
        id: Ulid,
    },
    BlockAdded {
        id: Ulid,
        spot_id: Ulid,
        span: Span,
        status: BlockStatus,
        slots_open: u32,
        reason: Option<String>,
    },
    BlockUpdated {
        id: Ulid,
        spot_id: Ulid,
        span: Span,
        status: BlockStatus,
        slots_open: u32,
        reason: Option<String>,
    },
    BlockRemoved {
        id: Ulid,
        spot_id: Ulid,
    },
    BookingReserved {
        id: Ulid,
        spot_id: Ulid,
        guest_id: Ulid,
        vehicle_id: Ulid,
        span: Span,
        total_cost_cents: i64,
        qr_code: String,
        pin: u16,
        pay_deadline: Ms,
    },
    PaymentVerified {
        id: Ulid,
        spot_id: Ulid,
    },
    PaymentRejected {
        id: Ulid,
        spot_id: Ulid,
    },
    EntryValidated {
        id: Ulid,
        spot_id: Ulid,
    },
    BookingCompleted {
        id: Ulid,
        spot_id: Ulid,
    },
    BookingCancelled {
        id: Ulid,
        spot_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SpotInfo {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub name: Option<String>,
    pub total_slots: u32,
    pub price_cents_per_hour: i64,
    pub lat: f64,
    pub lon: f64,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub id: Ulid,
    pub spot_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub status: BlockStatus,
    pub slots_open: u32,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Ulid,
    pub spot_id: Ulid,
    pub guest_id: Ulid,
    pub vehicle_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub total_cost_cents: i64,
    pub status: BookingStatus,
    pub payment: PaymentStatus,
    pub qr_code: String,
    pub pin: u16,
    pub pay_deadline: Ms,
}

impl BookingInfo {
    pub fn from_claim(spot_id: Ulid, claim: &Claim) -> Option<Self> {
        let b = claim.as_booking()?;
        Some(Self {
            id: claim.id,
            spot_id,
            guest_id: b.guest_id,
            vehicle_id: b.vehicle_id,
            start: claim.span.start,
            end: claim.span.end,
            total_cost_cents: b.total_cost_cents,
            status: b.status,
            payment: b.payment,
            qr_code: b.qr_code.clone(),
            pin: b.pin,
            pay_deadline: b.pay_deadline,
        })
    }
}

/// Free-capacity summary for a queried window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityInfo {
    pub spot_id: Ulid,
    pub total_slots: u32,
    /// Peak concurrent load (bookings + blocked reductions) in the window.
    pub occupied: u32,
    /// total_slots − occupied, clamped at 0.
    pub free: u32,
}
