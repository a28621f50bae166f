use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::{Ms, Reservation};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NotificationKind {
    ReservationConfirmed,
    ReservationCancelled,
    ReservationsImpacted,
    ReservationsRestored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AffectedInterval {
    pub reservation_id: Ulid,
    pub start: Ms,
    pub end: Ms,
}

/// A fully formed message for one recipient. Rendering and transport belong to the
/// collaborator behind [`Notifier`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub recipient: Ulid,
    pub kind: NotificationKind,
    pub resource_id: Ulid,
    pub reason: Option<String>,
    pub intervals: Vec<AffectedInterval>,
}

impl Notification {
    pub fn single(kind: NotificationKind, reservation: &Reservation, reason: Option<String>) -> Self {
        Self {
            recipient: reservation.user_id,
            kind,
            resource_id: reservation.resource_id,
            reason,
            intervals: vec![AffectedInterval {
                reservation_id: reservation.id,
                start: reservation.span.start,
                end: reservation.span.end,
            }],
        }
    }

    /// One notification per distinct owner, each listing all of that owner's reservations.
    pub fn per_recipient(
        kind: NotificationKind,
        resource_id: Ulid,
        reason: Option<&str>,
        reservations: &[Reservation],
    ) -> Vec<Self> {
        let mut grouped: BTreeMap<Ulid, Vec<AffectedInterval>> = BTreeMap::new();
        for r in reservations {
            grouped.entry(r.user_id).or_default().push(AffectedInterval {
                reservation_id: r.id,
                start: r.span.start,
                end: r.span.end,
            });
        }
        grouped
            .into_iter()
            .map(|(recipient, intervals)| Self {
                recipient,
                kind,
                resource_id,
                reason: reason.map(str::to_string),
                intervals,
            })
            .collect()
    }
}

#[derive(Debug)]
pub enum NotifyError {
    Closed,
    Rejected(String),
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyError::Closed => write!(f, "notification channel closed"),
            NotifyError::Rejected(msg) => write!(f, "notification rejected: {msg}"),
        }
    }
}

impl std::error::Error for NotifyError {}

/// Outbound message sink. Failures are reported to the caller, which logs them and moves on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// In-process broadcast hub. The mail-out worker is its usual subscriber.
pub struct NotifyHub {
    tx: broadcast::Sender<Notification>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            tx: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Notifier for NotifyHub {
    /// No-op if nobody is listening.
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let _ = self.tx.send(notification.clone());
        Ok(())
    }
}

/// Drains the hub and hands each message to the mail transport, which here is the log.
pub async fn run_mailer(tenant: String, mut rx: broadcast::Receiver<Notification>) {
    loop {
        match rx.recv().await {
            Ok(n) => {
                let payload = serde_json::to_string(&n).unwrap_or_default();
                info!(tenant = %tenant, recipient = %n.recipient, kind = ?n.kind, "mail out: {payload}");
                metrics::counter!(crate::observability::NOTIFICATIONS_SENT_TOTAL).increment(1);
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("mailer for {tenant} lagged, {skipped} notifications dropped");
                metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL).increment(skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
