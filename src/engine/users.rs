use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{DISABLE_CASCADE_SIZE, RESERVATIONS_CANCELLED_TOTAL, USERS_DISABLED_TOTAL};

use super::audit::Diff;
use super::conflict::{check_len, now_ms};
use super::error::FieldError;
use super::{Engine, EngineError, Locked};

const DISABLED_REASON: &str = "User account disabled";

fn check_name(field: &'static str, name: &str, errors: &mut Vec<FieldError>) {
    if name.trim().is_empty() {
        errors.push(FieldError::new(field, "must not be empty"));
    } else {
        check_len(field, Some(name), MAX_NAME_LEN, errors);
    }
}

fn require_admin(actor: &Actor) -> Result<(), EngineError> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(EngineError::PermissionDenied(actor.user_id))
    }
}

impl Engine {
    // ── Resources ────────────────────────────────────────────

    pub async fn create_resource(&self, actor: &Actor, id: Ulid, name: String) -> Result<ResourceInfo, EngineError> {
        require_admin(actor)?;
        self.check_actor(actor)?;
        let mut errors = Vec::new();
        check_name("name", &name, &mut errors);
        if !errors.is_empty() {
            return Err(EngineError::Validation(errors));
        }

        let _catalog = self.catalog.lock().await;
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.state.len() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }

        let now = now_ms();
        let txn = Transaction {
            events: vec![Event::ResourceCreated { id, name: name.clone() }],
            audit: vec![
                Diff::new()
                    .set("name", &name)
                    .entry(actor, AuditAction::Create, EntityType::Resource, id, now),
            ],
        };
        self.commit(&mut Locked::empty(), txn).await?;
        info!(%id, "resource created");
        Ok(ResourceInfo { id, name, active: true })
    }

    /// Rename or (de)activate. Inactive resources keep their bookings but accept no new ones.
    pub async fn update_resource(
        &self,
        actor: &Actor,
        id: Ulid,
        name: Option<String>,
        active: Option<bool>,
    ) -> Result<ResourceInfo, EngineError> {
        require_admin(actor)?;
        self.check_actor(actor)?;
        let mut errors = Vec::new();
        if let Some(n) = &name {
            check_name("name", n, &mut errors);
        }
        if !errors.is_empty() {
            return Err(EngineError::Validation(errors));
        }

        let mut locked = self.lock_resources(&[id]).await?;
        let current = locked.get(id).map(|rs| rs.info()).ok_or(EngineError::NotFound(id))?;
        let updated = ResourceInfo {
            id,
            name: name.unwrap_or_else(|| current.name.clone()),
            active: active.unwrap_or(current.active),
        };

        let txn = Transaction {
            events: vec![Event::ResourceUpdated {
                id,
                name: updated.name.clone(),
                active: updated.active,
            }],
            audit: vec![
                Diff::new()
                    .changed("name", current.name.as_str(), updated.name.as_str())
                    .changed("active", current.active, updated.active)
                    .entry(actor, AuditAction::Update, EntityType::Resource, id, now_ms()),
            ],
        };
        self.commit(&mut locked, txn).await?;
        Ok(updated)
    }

    // ── Users ────────────────────────────────────────────────

    pub async fn create_user(
        &self,
        actor: &Actor,
        id: Ulid,
        email: String,
        name: String,
        role: Role,
    ) -> Result<User, EngineError> {
        require_admin(actor)?;
        self.check_actor(actor)?;

        let mut errors = Vec::new();
        let email = email.trim().to_string();
        if !email.contains('@') {
            errors.push(FieldError::new("email", "must be an email address"));
        }
        check_len("email", Some(&email), MAX_EMAIL_LEN, &mut errors);
        check_name("name", &name, &mut errors);
        if !errors.is_empty() {
            return Err(EngineError::Validation(errors));
        }

        let _catalog = self.catalog.lock().await;
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if let Some(existing) = self.emails.get(&email.to_lowercase()) {
            return Err(EngineError::AlreadyExists(*existing));
        }
        if self.users.len() >= MAX_USERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many users"));
        }

        let now = now_ms();
        let user = User {
            id,
            email,
            name,
            role,
            status: UserStatus::Active,
            created_at: now,
        };
        let txn = Transaction {
            events: vec![Event::UserCreated { user: user.clone() }],
            audit: vec![
                Diff::new()
                    .set("email", &user.email)
                    .set("name", &user.name)
                    .set("role", user.role)
                    .entry(actor, AuditAction::Create, EntityType::User, id, now),
            ],
        };
        self.commit(&mut Locked::empty(), txn).await?;
        info!(%id, role = %user.role, "user created");
        Ok(user)
    }

    /// Disable an account and cancel its future CONFIRMED reservations in one commit.
    /// Past, IMPACTED and already-CANCELLED reservations are left alone; no notifications
    /// are sent. Returns the updated user and the number of cancelled reservations.
    pub async fn disable_user(
        &self,
        actor: &Actor,
        user_id: Ulid,
        reason: Option<String>,
    ) -> Result<(User, usize), EngineError> {
        require_admin(actor)?;
        self.check_actor(actor)?;
        let mut errors = Vec::new();
        check_len("reason", reason.as_deref(), MAX_REASON_LEN, &mut errors);
        if !errors.is_empty() {
            return Err(EngineError::Validation(errors));
        }

        let _catalog = self.catalog.lock().await;
        let user = self
            .users
            .get(&user_id)
            .map(|u| u.clone())
            .ok_or(EngineError::NotFound(user_id))?;
        if user.status == UserStatus::Disabled {
            return Err(EngineError::InvalidState(format!("user {user_id} is already disabled")));
        }

        // Every resource: reservations for this user can live anywhere, and no new
        // booking may slip in between the scan and the status flip.
        let mut locked = self.lock_all_resources().await;
        let reason = reason.unwrap_or_else(|| DISABLED_REASON.to_string());
        let now = now_ms();

        let mut cancellations = Vec::new();
        let mut cancel_audit = Vec::new();
        for rs in locked.iter() {
            for r in rs
                .reservations
                .iter()
                .filter(|r| r.user_id == user_id && r.is_confirmed() && r.span.start > now)
            {
                cancellations.push(Event::ReservationStatusChanged {
                    id: r.id,
                    resource_id: rs.id,
                    status: ReservationStatus::Cancelled,
                    cancelled_at: Some(now),
                    cancel_reason: Some(reason.clone()),
                    impacted_by: None,
                });
                cancel_audit.push(
                    Diff::new()
                        .field("status", r.status, ReservationStatus::Cancelled)
                        .set("reason", &reason)
                        .entry(actor, AuditAction::Cancel, EntityType::Reservation, r.id, now),
                );
            }
        }
        let cancelled = cancellations.len();

        let mut txn = Transaction::new();
        txn.events.push(Event::UserStatusChanged {
            id: user_id,
            status: UserStatus::Disabled,
        });
        txn.events.extend(cancellations);
        txn.audit.push(
            Diff::new()
                .field("status", user.status, UserStatus::Disabled)
                .set("reason", &reason)
                .set("cancelled_reservations", cancelled)
                .entry(actor, AuditAction::Disable, EntityType::User, user_id, now),
        );
        txn.audit.extend(cancel_audit);
        self.commit(&mut locked, txn).await?;
        drop(locked);

        metrics::counter!(USERS_DISABLED_TOTAL).increment(1);
        metrics::counter!(RESERVATIONS_CANCELLED_TOTAL, "cause" => "user_disabled").increment(cancelled as u64);
        metrics::histogram!(DISABLE_CASCADE_SIZE).record(cancelled as f64);
        info!(%user_id, cancelled, "user disabled");

        let mut user = user;
        user.status = UserStatus::Disabled;
        Ok((user, cancelled))
    }

    /// Reactivate an account. Cancelled reservations stay cancelled.
    pub async fn enable_user(&self, actor: &Actor, user_id: Ulid) -> Result<User, EngineError> {
        require_admin(actor)?;
        self.check_actor(actor)?;

        let _catalog = self.catalog.lock().await;
        let mut user = self
            .users
            .get(&user_id)
            .map(|u| u.clone())
            .ok_or(EngineError::NotFound(user_id))?;
        if user.is_active() {
            return Err(EngineError::InvalidState(format!("user {user_id} is already active")));
        }

        let now = now_ms();
        let txn = Transaction {
            events: vec![Event::UserStatusChanged {
                id: user_id,
                status: UserStatus::Active,
            }],
            audit: vec![
                Diff::new()
                    .field("status", user.status, UserStatus::Active)
                    .entry(actor, AuditAction::Enable, EntityType::User, user_id, now),
            ],
        };
        self.commit(&mut Locked::empty(), txn).await?;
        info!(%user_id, "user enabled");

        user.status = UserStatus::Active;
        Ok(user)
    }

    pub fn get_user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|u| u.clone())
    }

    /// Case-insensitive lookup.
    pub fn find_user_by_email(&self, email: &str) -> Option<User> {
        let id = *self.emails.get(&email.trim().to_lowercase())?;
        self.get_user(&id)
    }

    /// Sorted by email.
    pub fn list_users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.iter().map(|u| u.value().clone()).collect();
        users.sort_by(|a, b| a.email.cmp(&b.email));
        users
    }
}
