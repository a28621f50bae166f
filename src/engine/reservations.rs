use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{Notification, NotificationKind};
use crate::observability::{CONFLICTS_TOTAL, RESERVATIONS_CANCELLED_TOTAL, RESERVATIONS_CREATED_TOTAL};

use super::audit::Diff;
use super::conflict::{check_len, check_span, find_blocking, find_overlapping, now_ms};
use super::{Engine, EngineError};

const CANCELLED_BY_USER: &str = "Cancelled by user";
const CANCELLED_BY_ADMIN: &str = "Cancelled by administrator";

#[derive(Debug, Clone)]
pub struct NewReservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub span: Span,
    pub purpose: Purpose,
    pub notes: Option<String>,
}

/// Fields left as `None` keep their current value. `notes: Some(None)` clears the notes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationPatch {
    pub resource_id: Option<Ulid>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub purpose: Option<Purpose>,
    pub notes: Option<Option<String>>,
}

/// Result of a create or update. An overlap is a question for the caller, not an error:
/// nothing was written and the same request with the acknowledgement will commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationOutcome {
    Committed(Reservation),
    OverlapExists(Vec<ConflictInfo>),
}

impl Engine {
    pub async fn create_reservation(
        &self,
        actor: &Actor,
        req: NewReservation,
        acknowledge_overlap: bool,
    ) -> Result<ReservationOutcome, EngineError> {
        let mut errors = Vec::new();
        check_span(&req.span, MAX_RESERVATION_DURATION_MS, &mut errors);
        check_len("notes", req.notes.as_deref(), MAX_NOTES_LEN, &mut errors);
        if !errors.is_empty() {
            return Err(EngineError::Validation(errors));
        }

        let mut locked = self.lock_resources(&[req.resource_id]).await?;
        let Some(rs) = locked.get(req.resource_id) else {
            return Err(EngineError::NotFound(req.resource_id));
        };

        // Checked under the resource lock: a concurrent disable either sees this
        // reservation and cancels it, or is already visible here.
        match self.users.get(&actor.user_id) {
            Some(user) if user.is_active() => {}
            _ => return Err(EngineError::PermissionDenied(actor.user_id)),
        }
        if self.entity_to_resource.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        if !rs.active {
            return Err(EngineError::invalid("resource_id", "resource is not active"));
        }
        if rs.reservations.len() >= MAX_RESERVATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many reservations on resource"));
        }

        if let Some(block) = find_blocking(rs, &req.span) {
            metrics::counter!(CONFLICTS_TOTAL, "kind" => "time_blocked").increment(1);
            return Err(EngineError::TimeBlocked(block));
        }
        let overlaps = find_overlapping(rs, &req.span, None);
        if !overlaps.is_empty() && !acknowledge_overlap {
            metrics::counter!(CONFLICTS_TOTAL, "kind" => "overlap_exists").increment(1);
            debug!(resource = %req.resource_id, count = overlaps.len(), "reservation overlaps existing bookings");
            return Ok(ReservationOutcome::OverlapExists(overlaps));
        }

        let now = now_ms();
        let reservation = Reservation {
            id: req.id,
            resource_id: req.resource_id,
            user_id: actor.user_id,
            span: req.span,
            purpose: req.purpose,
            notes: req.notes,
            status: ReservationStatus::Confirmed,
            created_at: now,
            cancelled_at: None,
            cancel_reason: None,
            impacted_by: None,
        };

        let mut diff = Diff::new()
            .set("resource_id", reservation.resource_id)
            .set("start", reservation.span.start)
            .set("end", reservation.span.end)
            .set("purpose", reservation.purpose)
            .set("status", reservation.status);
        if !overlaps.is_empty() {
            diff = diff.set("acknowledged_overlaps", overlaps.len());
        }
        let txn = Transaction {
            events: vec![Event::ReservationCreated {
                reservation: reservation.clone(),
            }],
            audit: vec![diff.entry(actor, AuditAction::Create, EntityType::Reservation, reservation.id, now)],
        };
        self.commit(&mut locked, txn).await?;
        drop(locked);

        metrics::counter!(RESERVATIONS_CREATED_TOTAL).increment(1);
        info!(id = %reservation.id, resource = %reservation.resource_id, "reservation confirmed");

        self.dispatch(vec![Notification::single(
            NotificationKind::ReservationConfirmed,
            &reservation,
            None,
        )])
        .await;

        Ok(ReservationOutcome::Committed(reservation))
    }

    pub async fn update_reservation(
        &self,
        actor: &Actor,
        id: Ulid,
        patch: ReservationPatch,
        acknowledge_overlap: bool,
    ) -> Result<ReservationOutcome, EngineError> {
        let mut errors = Vec::new();
        if let Some(notes) = &patch.notes {
            check_len("notes", notes.as_deref(), MAX_NOTES_LEN, &mut errors);
        }
        if !errors.is_empty() {
            return Err(EngineError::Validation(errors));
        }
        self.check_actor(actor)?;

        let (current_rid, mut locked) = self.lock_entity(&id, patch.resource_id).await?;
        let existing = locked
            .get(current_rid)
            .and_then(|rs| rs.reservation(id))
            .cloned()
            .ok_or(EngineError::NotFound(id))?;

        if !actor.is_admin() && existing.user_id != actor.user_id {
            return Err(EngineError::PermissionDenied(id));
        }
        if existing.status == ReservationStatus::Cancelled {
            return Err(EngineError::InvalidState(format!("reservation {id} is cancelled")));
        }

        let target_rid = patch.resource_id.unwrap_or(current_rid);
        let span = Span::new(
            patch.start.unwrap_or(existing.span.start),
            patch.end.unwrap_or(existing.span.end),
        );
        check_span(&span, MAX_RESERVATION_DURATION_MS, &mut errors);
        if !errors.is_empty() {
            return Err(EngineError::Validation(errors));
        }

        let Some(target) = locked.get(target_rid) else {
            return Err(EngineError::NotFound(target_rid));
        };
        let moved = target_rid != current_rid;
        if moved && !target.active {
            return Err(EngineError::invalid("resource_id", "resource is not active"));
        }
        if moved && target.reservations.len() >= MAX_RESERVATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many reservations on resource"));
        }

        // Only a changed window is re-checked against the detector.
        let window_changed = moved || span != existing.span;
        if window_changed {
            if let Some(block) = find_blocking(target, &span) {
                metrics::counter!(CONFLICTS_TOTAL, "kind" => "time_blocked").increment(1);
                return Err(EngineError::TimeBlocked(block));
            }
            let overlaps = find_overlapping(target, &span, Some(id));
            if !overlaps.is_empty() && !acknowledge_overlap {
                metrics::counter!(CONFLICTS_TOTAL, "kind" => "overlap_exists").increment(1);
                return Ok(ReservationOutcome::OverlapExists(overlaps));
            }
        }

        let mut updated = existing.clone();
        updated.resource_id = target_rid;
        updated.span = span;
        if let Some(purpose) = patch.purpose {
            updated.purpose = purpose;
        }
        if let Some(notes) = patch.notes {
            updated.notes = notes;
        }
        // A block-free new window lifts the impact.
        if window_changed && updated.status == ReservationStatus::Impacted {
            updated.status = ReservationStatus::Confirmed;
            updated.impacted_by = None;
        }

        let now = now_ms();
        let diff = Diff::new()
            .field("start", existing.span.start, updated.span.start)
            .field("end", existing.span.end, updated.span.end)
            .field("purpose", existing.purpose, updated.purpose)
            .changed("resource_id", existing.resource_id, updated.resource_id)
            .optional("notes", existing.notes.as_deref(), updated.notes.as_deref())
            .changed("status", existing.status, updated.status);
        let txn = Transaction {
            events: vec![Event::ReservationUpdated {
                from_resource: current_rid,
                reservation: updated.clone(),
            }],
            audit: vec![diff.entry(actor, AuditAction::Update, EntityType::Reservation, id, now)],
        };
        self.commit(&mut locked, txn).await?;
        drop(locked);

        info!(%id, "reservation updated");
        Ok(ReservationOutcome::Committed(updated))
    }

    pub async fn cancel_reservation(
        &self,
        actor: &Actor,
        id: Ulid,
        reason: Option<String>,
    ) -> Result<Reservation, EngineError> {
        let mut errors = Vec::new();
        check_len("reason", reason.as_deref(), MAX_REASON_LEN, &mut errors);
        if !errors.is_empty() {
            return Err(EngineError::Validation(errors));
        }
        self.check_actor(actor)?;

        let (resource_id, mut locked) = self.lock_entity(&id, None).await?;
        let existing = locked
            .get(resource_id)
            .and_then(|rs| rs.reservation(id))
            .cloned()
            .ok_or(EngineError::NotFound(id))?;

        let own = existing.user_id == actor.user_id;
        if !own && !actor.is_admin() {
            return Err(EngineError::PermissionDenied(id));
        }
        if existing.status == ReservationStatus::Cancelled {
            return Err(EngineError::InvalidState(format!("reservation {id} is already cancelled")));
        }

        let default_reason = if own { CANCELLED_BY_USER } else { CANCELLED_BY_ADMIN };
        let reason = reason.unwrap_or_else(|| default_reason.to_string());
        let now = now_ms();
        let mut cancelled = existing.clone();
        cancelled.status = ReservationStatus::Cancelled;
        cancelled.cancelled_at = Some(now);
        cancelled.cancel_reason = Some(reason.clone());
        cancelled.impacted_by = None;

        let txn = Transaction {
            events: vec![Event::ReservationStatusChanged {
                id,
                resource_id,
                status: cancelled.status,
                cancelled_at: cancelled.cancelled_at,
                cancel_reason: cancelled.cancel_reason.clone(),
                impacted_by: None,
            }],
            audit: vec![
                Diff::new()
                    .field("status", existing.status, cancelled.status)
                    .set("reason", &reason)
                    .entry(actor, AuditAction::Cancel, EntityType::Reservation, id, now),
            ],
        };
        self.commit(&mut locked, txn).await?;
        drop(locked);

        metrics::counter!(RESERVATIONS_CANCELLED_TOTAL, "cause" => "request").increment(1);
        info!(%id, "reservation cancelled");

        self.dispatch(vec![Notification::single(
            NotificationKind::ReservationCancelled,
            &cancelled,
            Some(reason),
        )])
        .await;

        Ok(cancelled)
    }
}
