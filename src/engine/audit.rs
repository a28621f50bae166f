use std::sync::RwLock;

use ulid::Ulid;

use crate::model::*;

/// Append-only, commit-ordered audit log. Rows only ever arrive through a committed
/// transaction, so the log never contains a change that did not happen.
#[derive(Default)]
pub struct AuditTrail {
    entries: RwLock<Vec<AuditLogEntry>>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub(super) fn extend(&self, rows: Vec<AuditLogEntry>) {
        if rows.is_empty() {
            return;
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.extend(rows);
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All rows, or only those for `entity_id`, in commit order.
    pub fn entries(&self, entity_id: Option<Ulid>) -> Vec<AuditLogEntry> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        match entity_id {
            Some(id) => entries.iter().filter(|e| e.entity_id == id).cloned().collect(),
            None => entries.clone(),
        }
    }
}

/// Builds the structured `changes` payload of one audit row.
#[derive(Default)]
pub(crate) struct Diff {
    changes: Vec<FieldChange>,
}

impl Diff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: &str, before: impl ToString, after: impl ToString) -> Self {
        self.changes.push(FieldChange {
            field: name.to_string(),
            before: Some(before.to_string()),
            after: Some(after.to_string()),
        });
        self
    }

    /// Like [`Diff::field`], skipped when nothing changed.
    pub fn changed<T: ToString + PartialEq>(self, name: &str, before: T, after: T) -> Self {
        if before == after {
            return self;
        }
        self.field(name, before, after)
    }

    pub fn optional(mut self, name: &str, before: Option<&str>, after: Option<&str>) -> Self {
        if before != after {
            self.changes.push(FieldChange {
                field: name.to_string(),
                before: before.map(str::to_string),
                after: after.map(str::to_string),
            });
        }
        self
    }

    pub fn set(mut self, name: &str, value: impl ToString) -> Self {
        self.changes.push(FieldChange {
            field: name.to_string(),
            before: None,
            after: Some(value.to_string()),
        });
        self
    }

    pub fn removed(mut self, name: &str, before: impl ToString) -> Self {
        self.changes.push(FieldChange {
            field: name.to_string(),
            before: Some(before.to_string()),
            after: None,
        });
        self
    }

    pub fn entry(
        self,
        actor: &Actor,
        action: AuditAction,
        entity_type: EntityType,
        entity_id: Ulid,
        at: Ms,
    ) -> AuditLogEntry {
        AuditLogEntry {
            id: Ulid::new(),
            user_id: actor.user_id,
            action,
            entity_type,
            entity_id,
            changes: self.changes,
            timestamp: at,
        }
    }
}
