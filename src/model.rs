use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// The overlap test every conflict path uses.
///
/// Written as the three-clause disjunction rather than `a.start < b.end && b.start < a.end`
/// so boundary behavior is explicit: touching intervals do not overlap, containment does,
/// and identical intervals overlap.
pub fn overlaps(a_start: Ms, a_end: Ms, b_start: Ms, b_end: Ms) -> bool {
    (b_start <= a_start && b_end > a_start)
        || (b_start < a_end && b_end >= a_end)
        || (b_start >= a_start && b_end <= a_end)
}

/// Half-open interval `[start, end)`. Validity (`start < end`) is checked by the engine
/// before any span reaches resource state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    pub fn duration_ms(&self) -> Ms {
        self.end.saturating_sub(self.start)
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }
}

// ── Enumerations ─────────────────────────────────────────────────

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            /// Case-insensitive parse of the wire spelling.
            pub fn parse(s: &str) -> Option<Self> {
                $(if s.eq_ignore_ascii_case($text) {
                    return Some($name::$variant);
                })+
                None
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum!(Purpose {
    Training => "TRAINING",
    Lesson => "LESSON",
    Other => "OTHER",
});

string_enum!(ReservationStatus {
    Confirmed => "CONFIRMED",
    Cancelled => "CANCELLED",
    Impacted => "IMPACTED",
});

string_enum!(Role {
    User => "USER",
    Organizer => "ORGANIZER",
    Admin => "ADMIN",
});

string_enum!(UserStatus {
    Active => "ACTIVE",
    Disabled => "DISABLED",
});

string_enum!(AuditAction {
    Create => "CREATE",
    Update => "UPDATE",
    Delete => "DELETE",
    Cancel => "CANCEL",
    Disable => "DISABLE",
    Enable => "ENABLE",
    Impact => "IMPACT",
    Restore => "RESTORE",
});

string_enum!(EntityType {
    Resource => "RESOURCE",
    User => "USER",
    Reservation => "RESERVATION",
    Block => "BLOCK",
});

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub user_id: Ulid,
    pub span: Span,
    pub purpose: Purpose,
    pub notes: Option<String>,
    pub status: ReservationStatus,
    pub created_at: Ms,
    pub cancelled_at: Option<Ms>,
    pub cancel_reason: Option<String>,
    /// Block that moved this reservation to IMPACTED. Cleared on any other status.
    pub impacted_by: Option<Ulid>,
}

impl Reservation {
    pub fn is_confirmed(&self) -> bool {
        self.status == ReservationStatus::Confirmed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub reason: String,
    pub span: Span,
    pub is_recurring: bool,
    /// Stored verbatim, never expanded.
    pub recurrence_rule: Option<String>,
    pub created_by: Ulid,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub status: UserStatus,
    pub created_at: Ms,
}

impl User {
    pub fn is_active(&self) -> bool {
        self.status == UserStatus::Active
    }
}

/// One field of a structured before/after diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub before: Option<String>,
    pub after: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Ulid,
    /// Actor. Nil for system actions.
    pub user_id: Ulid,
    pub action: AuditAction,
    pub entity_type: EntityType,
    pub entity_id: Ulid,
    pub changes: Vec<FieldChange>,
    pub timestamp: Ms,
}

/// The authenticated caller, supplied by the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: Ulid, role: Role) -> Self {
        Self { user_id, role }
    }

    /// Bootstrap actor used before any admin exists.
    pub fn system() -> Self {
        Self {
            user_id: Ulid::nil(),
            role: Role::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

// ── Per-resource state ───────────────────────────────────────────

trait Spanned {
    fn id(&self) -> Ulid;
    fn span(&self) -> Span;
}

impl Spanned for Reservation {
    fn id(&self) -> Ulid {
        self.id
    }
    fn span(&self) -> Span {
        self.span
    }
}

impl Spanned for Block {
    fn id(&self) -> Ulid {
        self.id
    }
    fn span(&self) -> Span {
        self.span
    }
}

/// Insert maintaining sort order by span.start.
fn insert_sorted<T: Spanned>(items: &mut Vec<T>, item: T) {
    let start = item.span().start;
    let pos = items
        .binary_search_by_key(&start, |i| i.span().start)
        .unwrap_or_else(|e| e);
    items.insert(pos, item);
}

fn remove_by_id<T: Spanned>(items: &mut Vec<T>, id: Ulid) -> Option<T> {
    let pos = items.iter().position(|i| i.id() == id)?;
    Some(items.remove(pos))
}

/// Items whose span overlaps the query window.
/// Binary search skips everything starting at or after `query.end`, which cannot overlap.
fn overlapping_in<'a, T: Spanned>(items: &'a [T], query: &Span) -> impl Iterator<Item = &'a T> {
    let right_bound = items.partition_point(|i| i.span().start < query.end);
    let query = *query;
    items[..right_bound]
        .iter()
        .filter(move |i| query.overlaps(&i.span()))
}

/// A bookable resource and everything booked or blocked on it.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: String,
    pub active: bool,
    /// All reservations regardless of status, sorted by `span.start`.
    pub reservations: Vec<Reservation>,
    /// All blocks, sorted by `span.start`.
    pub blocks: Vec<Block>,
}

impl ResourceState {
    pub fn new(id: Ulid, name: String) -> Self {
        Self {
            id,
            name,
            active: true,
            reservations: Vec::new(),
            blocks: Vec::new(),
        }
    }

    pub fn insert_reservation(&mut self, reservation: Reservation) {
        insert_sorted(&mut self.reservations, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        remove_by_id(&mut self.reservations, id)
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    pub fn overlapping_reservations(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        overlapping_in(&self.reservations, query)
    }

    pub fn insert_block(&mut self, block: Block) {
        insert_sorted(&mut self.blocks, block);
    }

    pub fn remove_block(&mut self, id: Ulid) -> Option<Block> {
        remove_by_id(&mut self.blocks, id)
    }

    pub fn block(&self, id: Ulid) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn overlapping_blocks(&self, query: &Span) -> impl Iterator<Item = &Block> {
        overlapping_in(&self.blocks, query)
    }

    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id,
            name: self.name.clone(),
            active: self.active,
        }
    }
}

// ── WAL records ──────────────────────────────────────────────────

/// State changes: flat, each carries the full post-change value so replay is
/// deterministic without a clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        name: String,
    },
    ResourceUpdated {
        id: Ulid,
        name: String,
        active: bool,
    },
    UserCreated {
        user: User,
    },
    UserStatusChanged {
        id: Ulid,
        status: UserStatus,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    /// Full replacement; `from_resource` differs from `reservation.resource_id` on a move.
    ReservationUpdated {
        from_resource: Ulid,
        reservation: Reservation,
    },
    ReservationStatusChanged {
        id: Ulid,
        resource_id: Ulid,
        status: ReservationStatus,
        cancelled_at: Option<Ms>,
        cancel_reason: Option<String>,
        impacted_by: Option<Ulid>,
    },
    BlockCreated {
        block: Block,
    },
    BlockUpdated {
        from_resource: Ulid,
        block: Block,
    },
    BlockDeleted {
        id: Ulid,
        resource_id: Ulid,
    },
}

impl Event {
    /// Resources whose state this event touches (not counting creation).
    pub fn resource_ids(&self) -> Vec<Ulid> {
        match self {
            Event::ResourceUpdated { id, .. } => vec![*id],
            Event::ReservationCreated { reservation } => vec![reservation.resource_id],
            Event::ReservationUpdated {
                from_resource,
                reservation,
            } => vec![*from_resource, reservation.resource_id],
            Event::ReservationStatusChanged { resource_id, .. } => vec![*resource_id],
            Event::BlockCreated { block } => vec![block.resource_id],
            Event::BlockUpdated {
                from_resource,
                block,
            } => vec![*from_resource, block.resource_id],
            Event::BlockDeleted { resource_id, .. } => vec![*resource_id],
            Event::ResourceCreated { .. }
            | Event::UserCreated { .. }
            | Event::UserStatusChanged { .. } => vec![],
        }
    }
}

/// The WAL record: all state changes and audit rows of one operation.
/// A record is written whole or discarded on replay, which makes it the unit of atomicity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub events: Vec<Event>,
    pub audit: Vec<AuditLogEntry>,
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            audit: Vec::new(),
        }
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: String,
    pub active: bool,
}

/// A block reported back to a caller whose request it rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub reason: String,
    pub start: Ms,
    pub end: Ms,
}

impl From<&Block> for BlockInfo {
    fn from(b: &Block) -> Self {
        Self {
            id: b.id,
            resource_id: b.resource_id,
            reason: b.reason.clone(),
            start: b.span.start,
            end: b.span.end,
        }
    }
}

/// A CONFIRMED reservation that overlaps a requested window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInfo {
    pub id: Ulid,
    pub user_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub purpose: Purpose,
}

impl From<&Reservation> for ConflictInfo {
    fn from(r: &Reservation) -> Self {
        Self {
            id: r.id,
            user_id: r.user_id,
            start: r.span.start,
            end: r.span.end,
            purpose: r.purpose,
        }
    }
}

/// Both detector answers for one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictReport {
    pub block: Option<BlockInfo>,
    pub overlaps: Vec<ConflictInfo>,
}

/// Calendar projection of a reservation. `notes` is only present for the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEntry {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub user_id: Ulid,
    pub user_name: Option<String>,
    pub start: Ms,
    pub end: Ms,
    pub purpose: Purpose,
    pub status: ReservationStatus,
    pub notes: Option<String>,
}
