mod audit;
mod blocks;
mod conflict;
mod error;
mod queries;
mod reservations;
mod users;

pub use audit::AuditTrail;
pub use blocks::{BlockOutcome, BlockPatch, NewBlock};
pub use conflict::{conflict_report, find_blocking, find_overlapping};
pub use error::{EngineError, FieldError};
pub use reservations::{NewReservation, ReservationOutcome, ReservationPatch};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::model::*;
use crate::notify::{Notification, Notifier};
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

/// Audit rows per record when compacting.
const COMPACT_AUDIT_CHUNK: usize = 10_000;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        txn: Transaction,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<Transaction>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Transaction, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { txn, response } => {
                let mut batch = vec![(txn, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { txn, response }) => batch.push((txn, response)),
                        Ok(other) => {
                            // flush what we have before compacting or reporting
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (txn, _) in batch {
        if let Err(e) = wal.append_buffered(txn) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: Vec<Pending>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = Wal::write_compact_file(wal.path(), &records)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { txn, response } => {
            let result = wal.append_buffered(&txn).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

// ── Locked resource sets ─────────────────────────────────

/// Write guards over a set of resources, always acquired in ascending id order.
pub(super) struct Locked {
    guards: Vec<OwnedRwLockWriteGuard<ResourceState>>,
}

impl Locked {
    fn empty() -> Self {
        Self { guards: Vec::new() }
    }

    pub(super) fn get(&self, id: Ulid) -> Option<&ResourceState> {
        self.guards.iter().find(|g| g.id == id).map(|g| &**g)
    }

    pub(super) fn get_mut(&mut self, id: Ulid) -> Option<&mut ResourceState> {
        self.guards.iter_mut().find(|g| g.id == id).map(|g| &mut **g)
    }

    pub(super) fn iter(&self) -> impl Iterator<Item = &ResourceState> {
        self.guards.iter().map(|g| &**g)
    }
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedResourceState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<dyn Notifier>,
    /// Reverse lookup: reservation/block id → resource id
    pub(super) entity_to_resource: DashMap<Ulid, Ulid>,
    pub(super) users: DashMap<Ulid, User>,
    /// Lower-cased email → user id
    pub(super) emails: DashMap<String, Ulid>,
    pub(super) audit: AuditTrail,
    /// Serializes user and resource creation and user status changes.
    /// Always taken before any resource lock.
    pub(super) catalog: Mutex<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<dyn Notifier>) -> io::Result<Self> {
        let records = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            entity_to_resource: DashMap::new(),
            users: DashMap::new(),
            emails: DashMap::new(),
            audit: AuditTrail::new(),
            catalog: Mutex::new(()),
        };

        // Sole owner of every lock here, so try_write_owned always succeeds. Never block:
        // this may run inside an async context (lazy tenant creation).
        for txn in records {
            for event in &txn.events {
                let mut locked = engine.try_lock_resources(&event.resource_ids());
                engine.apply_event(&mut locked, event);
            }
            engine.audit.extend(txn.audit);
        }

        Ok(engine)
    }

    /// Write a transaction to the WAL via the background group-commit writer.
    async fn wal_append(&self, txn: &Transaction) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                txn: txn.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_resource.get(entity_id).map(|e| *e.value())
    }

    pub fn audit_len(&self) -> usize {
        self.audit.len()
    }

    /// WAL-append, then apply every event, then publish the audit rows.
    /// The caller holds write locks on every resource the events touch.
    pub(super) async fn commit(&self, locked: &mut Locked, txn: Transaction) -> Result<(), EngineError> {
        self.wal_append(&txn).await?;
        for event in &txn.events {
            self.apply_event(locked, event);
        }
        self.audit.extend(txn.audit);
        Ok(())
    }

    fn apply_event(&self, locked: &mut Locked, event: &Event) {
        match event {
            Event::ResourceCreated { id, name } => {
                self.state
                    .entry(*id)
                    .or_insert_with(|| Arc::new(RwLock::new(ResourceState::new(*id, name.clone()))));
            }
            Event::ResourceUpdated { id, name, active } => {
                if let Some(rs) = locked.get_mut(*id) {
                    rs.name = name.clone();
                    rs.active = *active;
                }
            }
            Event::UserCreated { user } => {
                self.emails.insert(user.email.to_lowercase(), user.id);
                self.users.insert(user.id, user.clone());
            }
            Event::UserStatusChanged { id, status } => {
                if let Some(mut user) = self.users.get_mut(id) {
                    user.status = *status;
                }
            }
            Event::ReservationCreated { reservation } => {
                if let Some(rs) = locked.get_mut(reservation.resource_id) {
                    rs.insert_reservation(reservation.clone());
                    self.entity_to_resource.insert(reservation.id, reservation.resource_id);
                }
            }
            Event::ReservationUpdated {
                from_resource,
                reservation,
            } => {
                if let Some(rs) = locked.get_mut(*from_resource) {
                    rs.remove_reservation(reservation.id);
                }
                if let Some(rs) = locked.get_mut(reservation.resource_id) {
                    rs.insert_reservation(reservation.clone());
                    self.entity_to_resource.insert(reservation.id, reservation.resource_id);
                }
            }
            Event::ReservationStatusChanged {
                id,
                resource_id,
                status,
                cancelled_at,
                cancel_reason,
                impacted_by,
            } => {
                if let Some(r) = locked.get_mut(*resource_id).and_then(|rs| rs.reservation_mut(*id)) {
                    r.status = *status;
                    r.cancelled_at = *cancelled_at;
                    r.cancel_reason = cancel_reason.clone();
                    r.impacted_by = *impacted_by;
                }
            }
            Event::BlockCreated { block } => {
                if let Some(rs) = locked.get_mut(block.resource_id) {
                    rs.insert_block(block.clone());
                    self.entity_to_resource.insert(block.id, block.resource_id);
                }
            }
            Event::BlockUpdated { from_resource, block } => {
                if let Some(rs) = locked.get_mut(*from_resource) {
                    rs.remove_block(block.id);
                }
                if let Some(rs) = locked.get_mut(block.resource_id) {
                    rs.insert_block(block.clone());
                    self.entity_to_resource.insert(block.id, block.resource_id);
                }
            }
            Event::BlockDeleted { id, resource_id } => {
                if let Some(rs) = locked.get_mut(*resource_id) {
                    rs.remove_block(*id);
                }
                self.entity_to_resource.remove(id);
            }
        }
    }

    /// Acquire write locks on `ids` in sorted order to prevent deadlocks.
    pub(super) async fn lock_resources(&self, ids: &[Ulid]) -> Result<Locked, EngineError> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
            guards.push(rs.write_owned().await);
        }
        Ok(Locked { guards })
    }

    /// Every resource in the tenant. Resources are never deleted, so none can vanish.
    pub(super) async fn lock_all_resources(&self) -> Locked {
        let mut ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(rs) = self.get_resource(&id) {
                guards.push(rs.write_owned().await);
            }
        }
        Locked { guards }
    }

    fn try_lock_resources(&self, ids: &[Ulid]) -> Locked {
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            if guards.iter().any(|g: &OwnedRwLockWriteGuard<ResourceState>| g.id == *id) {
                continue;
            }
            if let Some(rs) = self.get_resource(id)
                && let Ok(guard) = rs.try_write_owned()
            {
                guards.push(guard);
            }
        }
        Locked { guards }
    }

    /// Lock the resource holding `entity_id`, plus `extra` if given.
    /// Retries if the entity moved to another resource while we waited.
    pub(super) async fn lock_entity(
        &self,
        entity_id: &Ulid,
        extra: Option<Ulid>,
    ) -> Result<(Ulid, Locked), EngineError> {
        loop {
            let resource_id = self
                .get_resource_for_entity(entity_id)
                .ok_or(EngineError::NotFound(*entity_id))?;
            let mut ids = vec![resource_id];
            ids.extend(extra);
            let locked = self.lock_resources(&ids).await?;
            if self.get_resource_for_entity(entity_id) == Some(resource_id) {
                return Ok((resource_id, locked));
            }
        }
    }

    /// The actor must be the bootstrap system actor or an ACTIVE user.
    pub(super) fn check_actor(&self, actor: &Actor) -> Result<(), EngineError> {
        if actor.user_id.is_nil() && actor.is_admin() {
            return Ok(());
        }
        match self.users.get(&actor.user_id) {
            Some(user) if user.is_active() => Ok(()),
            _ => Err(EngineError::PermissionDenied(actor.user_id)),
        }
    }

    /// Hand notifications to the collaborator. Failures are logged and never roll back
    /// or fail the operation that produced them.
    pub(super) async fn dispatch(&self, notifications: Vec<Notification>) {
        for n in notifications {
            match self.notify.send(&n).await {
                Ok(()) => {
                    metrics::counter!(crate::observability::NOTIFICATIONS_DISPATCHED_TOTAL, "kind" => format!("{:?}", n.kind))
                        .increment(1);
                }
                Err(e) => {
                    metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL).increment(1);
                    warn!(recipient = %n.recipient, kind = ?n.kind, "notification failed: {e}");
                }
            }
        }
    }

    /// Compact the WAL by rewriting it with only the records needed to recreate the
    /// current state and audit trail. Stops all writers while the snapshot is taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;
        let locked = self.lock_all_resources().await;

        let mut records = Vec::new();

        let mut users = Transaction::new();
        for entry in self.users.iter() {
            users.events.push(Event::UserCreated {
                user: entry.value().clone(),
            });
        }
        records.push(users);

        for rs in locked.iter() {
            let mut txn = Transaction::new();
            txn.events.push(Event::ResourceCreated {
                id: rs.id,
                name: rs.name.clone(),
            });
            if !rs.active {
                txn.events.push(Event::ResourceUpdated {
                    id: rs.id,
                    name: rs.name.clone(),
                    active: false,
                });
            }
            for block in &rs.blocks {
                txn.events.push(Event::BlockCreated { block: block.clone() });
            }
            for reservation in &rs.reservations {
                txn.events.push(Event::ReservationCreated {
                    reservation: reservation.clone(),
                });
            }
            records.push(txn);
        }

        for chunk in self.audit.entries(None).chunks(COMPACT_AUDIT_CHUNK) {
            records.push(Transaction {
                events: Vec::new(),
                audit: chunk.to_vec(),
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { records, response: tx })
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
}
