use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_span, conflict_report, now_ms};
use super::{Engine, EngineError};

impl Engine {
    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let handles: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(handles.len());
        for rs in handles {
            out.push(rs.read().await.info());
        }
        out.sort_by_key(|r| r.id);
        out
    }

    pub async fn get_reservation(&self, id: &Ulid) -> Option<Reservation> {
        let rs = self.get_resource(&self.get_resource_for_entity(id)?)?;
        let guard = rs.read().await;
        guard.reservation(*id).cloned()
    }

    pub async fn get_block(&self, id: &Ulid) -> Option<Block> {
        let rs = self.get_resource(&self.get_resource_for_entity(id)?)?;
        let guard = rs.read().await;
        guard.block(*id).cloned()
    }

    /// Reservations on one resource intersecting `window`, CANCELLED excluded.
    /// Notes are shown to their owner only.
    pub async fn reservations_for_calendar(
        &self,
        viewer: &Actor,
        resource_id: Ulid,
        window: Span,
    ) -> Result<Vec<CalendarEntry>, EngineError> {
        let mut errors = Vec::new();
        check_span(&window, MAX_QUERY_WINDOW_MS, &mut errors);
        if !errors.is_empty() {
            return Err(EngineError::Validation(errors));
        }
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;

        Ok(guard
            .overlapping_reservations(&window)
            .filter(|r| r.status != ReservationStatus::Cancelled)
            .map(|r| CalendarEntry {
                id: r.id,
                resource_id: r.resource_id,
                user_id: r.user_id,
                user_name: self.users.get(&r.user_id).map(|u| u.name.clone()),
                start: r.span.start,
                end: r.span.end,
                purpose: r.purpose,
                status: r.status,
                notes: if r.user_id == viewer.user_id { r.notes.clone() } else { None },
            })
            .collect())
    }

    /// Every reservation a user owns across all resources, ordered by start.
    pub async fn user_reservations(&self, actor: &Actor, user_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        if !actor.is_admin() && actor.user_id != user_id {
            return Err(EngineError::PermissionDenied(user_id));
        }
        if !self.users.contains_key(&user_id) {
            return Err(EngineError::NotFound(user_id));
        }
        let handles: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for rs in handles {
            let guard = rs.read().await;
            out.extend(guard.reservations.iter().filter(|r| r.user_id == user_id).cloned());
        }
        out.sort_by_key(|r| (r.span.start, r.id));
        Ok(out)
    }

    /// Blocks on one resource or all of them, ordered by start. Blocks that ended
    /// before now are skipped unless `include_expired`.
    pub async fn get_blocks(&self, resource_id: Option<Ulid>, include_expired: bool) -> Result<Vec<Block>, EngineError> {
        let handles = match resource_id {
            Some(id) => vec![self.get_resource(&id).ok_or(EngineError::NotFound(id))?],
            None => self.state.iter().map(|e| e.value().clone()).collect(),
        };
        let now = now_ms();
        let mut out = Vec::new();
        for rs in handles {
            let guard = rs.read().await;
            out.extend(
                guard
                    .blocks
                    .iter()
                    .filter(|b| include_expired || b.span.end > now)
                    .cloned(),
            );
        }
        out.sort_by_key(|b| (b.span.start, b.id));
        Ok(out)
    }

    /// Pre-flight a window without writing anything.
    pub async fn check_conflicts(
        &self,
        resource_id: Ulid,
        window: Span,
        exclude: Option<Ulid>,
    ) -> Result<ConflictReport, EngineError> {
        let mut errors = Vec::new();
        check_span(&window, MAX_QUERY_WINDOW_MS, &mut errors);
        if !errors.is_empty() {
            return Err(EngineError::Validation(errors));
        }
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(conflict_report(&guard, &window, exclude))
    }

    /// Admin only.
    pub fn audit_log(&self, actor: &Actor, entity_id: Option<Ulid>) -> Result<Vec<AuditLogEntry>, EngineError> {
        if !actor.is_admin() {
            return Err(EngineError::PermissionDenied(actor.user_id));
        }
        Ok(self.audit.entries(entity_id))
    }
}
