use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{Notification, NotificationKind};
use crate::observability::{BLOCKS_TOTAL, CONFLICTS_TOTAL, RESERVATIONS_IMPACTED_TOTAL, RESERVATIONS_RESTORED_TOTAL};

use super::audit::Diff;
use super::conflict::{check_len, check_span, find_overlapping, now_ms};
use super::error::FieldError;
use super::{Engine, EngineError};

#[derive(Debug, Clone)]
pub struct NewBlock {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub reason: String,
    pub span: Span,
    pub is_recurring: bool,
    pub recurrence_rule: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockPatch {
    pub resource_id: Option<Ulid>,
    pub reason: Option<String>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub is_recurring: Option<bool>,
    pub recurrence_rule: Option<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// `impacted` CONFIRMED reservations were moved to IMPACTED in the same commit.
    Created { block: Block, impacted: usize },
    /// Unconfirmed request over live bookings; nothing was written.
    ConflictsExist(Vec<ConflictInfo>),
}

fn check_reason(reason: &str, errors: &mut Vec<FieldError>) {
    if reason.trim().is_empty() {
        errors.push(FieldError::new("reason", "must not be empty"));
    } else {
        check_len("reason", Some(reason), MAX_REASON_LEN, errors);
    }
}

fn require_admin(actor: &Actor, entity: Ulid) -> Result<(), EngineError> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(EngineError::PermissionDenied(entity))
    }
}

impl Engine {
    /// Close a window on a resource. Over live bookings this needs `confirm_conflicts`;
    /// with it, every overlapping CONFIRMED reservation becomes IMPACTED atomically with
    /// the block insert and each affected owner is told once.
    pub async fn create_block(
        &self,
        actor: &Actor,
        req: NewBlock,
        confirm_conflicts: bool,
    ) -> Result<BlockOutcome, EngineError> {
        require_admin(actor, req.resource_id)?;
        self.check_actor(actor)?;

        let mut errors = Vec::new();
        check_reason(&req.reason, &mut errors);
        check_span(&req.span, MAX_BLOCK_DURATION_MS, &mut errors);
        check_len("recurrence_rule", req.recurrence_rule.as_deref(), MAX_RECURRENCE_RULE_LEN, &mut errors);
        if !errors.is_empty() {
            return Err(EngineError::Validation(errors));
        }

        let mut locked = self.lock_resources(&[req.resource_id]).await?;
        let Some(rs) = locked.get(req.resource_id) else {
            return Err(EngineError::NotFound(req.resource_id));
        };
        if self.entity_to_resource.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        if rs.blocks.len() >= MAX_BLOCKS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many blocks on resource"));
        }

        let conflicts = find_overlapping(rs, &req.span, None);
        if !conflicts.is_empty() && !confirm_conflicts {
            metrics::counter!(CONFLICTS_TOTAL, "kind" => "conflicts_exist").increment(1);
            debug!(resource = %req.resource_id, count = conflicts.len(), "block over live reservations needs confirmation");
            return Ok(BlockOutcome::ConflictsExist(conflicts));
        }
        let impacted: Vec<Reservation> = conflicts
            .iter()
            .filter_map(|c| rs.reservation(c.id).cloned())
            .collect();

        let now = now_ms();
        let block = Block {
            id: req.id,
            resource_id: req.resource_id,
            reason: req.reason,
            span: req.span,
            is_recurring: req.is_recurring,
            recurrence_rule: req.recurrence_rule,
            created_by: actor.user_id,
            created_at: now,
        };

        let mut txn = Transaction::new();
        for r in &impacted {
            txn.events.push(Event::ReservationStatusChanged {
                id: r.id,
                resource_id: r.resource_id,
                status: ReservationStatus::Impacted,
                cancelled_at: None,
                cancel_reason: None,
                impacted_by: Some(block.id),
            });
            txn.audit.push(
                Diff::new()
                    .field("status", r.status, ReservationStatus::Impacted)
                    .set("block_id", block.id)
                    .set("block_reason", &block.reason)
                    .entry(actor, AuditAction::Impact, EntityType::Reservation, r.id, now),
            );
        }
        txn.events.push(Event::BlockCreated { block: block.clone() });
        txn.audit.push(
            Diff::new()
                .set("reason", &block.reason)
                .set("start", block.span.start)
                .set("end", block.span.end)
                .set("impacted_reservations", impacted.len())
                .entry(actor, AuditAction::Create, EntityType::Block, block.id, now),
        );
        self.commit(&mut locked, txn).await?;
        drop(locked);

        metrics::counter!(BLOCKS_TOTAL, "op" => "create").increment(1);
        metrics::counter!(RESERVATIONS_IMPACTED_TOTAL).increment(impacted.len() as u64);
        info!(id = %block.id, resource = %block.resource_id, impacted = impacted.len(), "block created");

        self.dispatch(Notification::per_recipient(
            NotificationKind::ReservationsImpacted,
            block.resource_id,
            Some(&block.reason),
            &impacted,
        ))
        .await;

        Ok(BlockOutcome::Created {
            impacted: impacted.len(),
            block,
        })
    }

    /// Edit a block in place. Reservations are not re-examined.
    pub async fn update_block(&self, actor: &Actor, id: Ulid, patch: BlockPatch) -> Result<Block, EngineError> {
        require_admin(actor, id)?;
        self.check_actor(actor)?;

        let mut errors = Vec::new();
        if let Some(reason) = &patch.reason {
            check_reason(reason, &mut errors);
        }
        if let Some(rule) = &patch.recurrence_rule {
            check_len("recurrence_rule", rule.as_deref(), MAX_RECURRENCE_RULE_LEN, &mut errors);
        }
        if !errors.is_empty() {
            return Err(EngineError::Validation(errors));
        }

        let (current_rid, mut locked) = self.lock_entity(&id, patch.resource_id).await?;
        let existing = locked
            .get(current_rid)
            .and_then(|rs| rs.block(id))
            .cloned()
            .ok_or(EngineError::NotFound(id))?;

        let mut updated = existing.clone();
        updated.span = Span::new(
            patch.start.unwrap_or(existing.span.start),
            patch.end.unwrap_or(existing.span.end),
        );
        check_span(&updated.span, MAX_BLOCK_DURATION_MS, &mut errors);
        if !errors.is_empty() {
            return Err(EngineError::Validation(errors));
        }
        if let Some(rid) = patch.resource_id {
            updated.resource_id = rid;
        }
        if let Some(reason) = patch.reason {
            updated.reason = reason;
        }
        if let Some(recurring) = patch.is_recurring {
            updated.is_recurring = recurring;
        }
        if let Some(rule) = patch.recurrence_rule {
            updated.recurrence_rule = rule;
        }
        if updated.resource_id != current_rid
            && locked
                .get(updated.resource_id)
                .is_some_and(|rs| rs.blocks.len() >= MAX_BLOCKS_PER_RESOURCE)
        {
            return Err(EngineError::LimitExceeded("too many blocks on resource"));
        }

        let now = now_ms();
        let diff = Diff::new()
            .field("reason", &existing.reason, &updated.reason)
            .field("start", existing.span.start, updated.span.start)
            .field("end", existing.span.end, updated.span.end)
            .changed("resource_id", existing.resource_id, updated.resource_id)
            .changed("is_recurring", existing.is_recurring, updated.is_recurring)
            .optional(
                "recurrence_rule",
                existing.recurrence_rule.as_deref(),
                updated.recurrence_rule.as_deref(),
            );
        let txn = Transaction {
            events: vec![Event::BlockUpdated {
                from_resource: current_rid,
                block: updated.clone(),
            }],
            audit: vec![diff.entry(actor, AuditAction::Update, EntityType::Block, id, now)],
        };
        self.commit(&mut locked, txn).await?;
        drop(locked);

        metrics::counter!(BLOCKS_TOTAL, "op" => "update").increment(1);
        info!(%id, "block updated");
        Ok(updated)
    }

    /// Remove a block and restore the reservations it impacted. A reservation still
    /// intersecting another block stays IMPACTED and is attributed to that block.
    /// Returns the deleted block and the number of restored reservations.
    pub async fn delete_block(&self, actor: &Actor, id: Ulid) -> Result<(Block, usize), EngineError> {
        require_admin(actor, id)?;
        self.check_actor(actor)?;

        let (resource_id, mut locked) = self.lock_entity(&id, None).await?;
        let Some(rs) = locked.get(resource_id) else {
            return Err(EngineError::NotFound(resource_id));
        };
        let block = rs.block(id).cloned().ok_or(EngineError::NotFound(id))?;

        let now = now_ms();
        let mut txn = Transaction::new();
        let mut restored = Vec::new();
        for r in rs.reservations.iter().filter(|r| {
            r.status == ReservationStatus::Impacted
                && (r.impacted_by == Some(id) || r.span.overlaps(&block.span))
        }) {
            let other = rs
                .blocks
                .iter()
                .find(|b| b.id != id && b.span.overlaps(&r.span));
            match other {
                Some(other) => {
                    if r.impacted_by == Some(id) {
                        txn.events.push(Event::ReservationStatusChanged {
                            id: r.id,
                            resource_id,
                            status: ReservationStatus::Impacted,
                            cancelled_at: None,
                            cancel_reason: None,
                            impacted_by: Some(other.id),
                        });
                    }
                }
                None => {
                    txn.events.push(Event::ReservationStatusChanged {
                        id: r.id,
                        resource_id,
                        status: ReservationStatus::Confirmed,
                        cancelled_at: None,
                        cancel_reason: None,
                        impacted_by: None,
                    });
                    txn.audit.push(
                        Diff::new()
                            .field("status", r.status, ReservationStatus::Confirmed)
                            .set("block_id", id)
                            .entry(actor, AuditAction::Restore, EntityType::Reservation, r.id, now),
                    );
                    let mut r = r.clone();
                    r.status = ReservationStatus::Confirmed;
                    r.impacted_by = None;
                    restored.push(r);
                }
            }
        }
        txn.events.push(Event::BlockDeleted { id, resource_id });
        txn.audit.push(
            Diff::new()
                .removed("reason", &block.reason)
                .removed("start", block.span.start)
                .removed("end", block.span.end)
                .set("restored_reservations", restored.len())
                .entry(actor, AuditAction::Delete, EntityType::Block, id, now),
        );
        self.commit(&mut locked, txn).await?;
        drop(locked);

        metrics::counter!(BLOCKS_TOTAL, "op" => "delete").increment(1);
        metrics::counter!(RESERVATIONS_RESTORED_TOTAL).increment(restored.len() as u64);
        info!(%id, restored = restored.len(), "block deleted");

        self.dispatch(Notification::per_recipient(
            NotificationKind::ReservationsRestored,
            resource_id,
            Some(&block.reason),
            &restored,
        ))
        .await;

        Ok((block, restored.len()))
    }
}
