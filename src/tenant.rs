use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};
use ulid::Ulid;

use crate::compactor;
use crate::engine::{Engine, EngineError};
use crate::limits::*;
use crate::model::{Actor, Role};
use crate::notify::{self, NotifyHub};

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL + mailer + compactor.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    admin_email: Option<String>,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, admin_email: Option<String>) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            admin_email,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub async fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        // The entry keeps a concurrent first connection from opening the same WAL twice.
        let engine = {
            let entry = self
                .engines
                .entry(tenant.to_string())
                .or_try_insert_with(|| self.open(tenant, &safe_name))?;
            entry.value().clone()
        };
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);

        if let Some(email) = &self.admin_email {
            seed_admin(&engine, tenant, email).await;
        }
        Ok(engine)
    }

    fn open(&self, tenant: &str, safe_name: &str) -> std::io::Result<Arc<Engine>> {
        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let hub = Arc::new(NotifyHub::new());
        let mailbox = hub.subscribe();
        let engine = Arc::new(Engine::new(wal_path, hub)?);

        tokio::spawn(notify::run_mailer(tenant.to_string(), mailbox));
        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        info!(tenant, "tenant opened");
        Ok(engine)
    }
}

/// Make sure the configured administrator exists so the tenant is reachable.
async fn seed_admin(engine: &Engine, tenant: &str, email: &str) {
    if engine.find_user_by_email(email).is_some() {
        return;
    }
    match engine
        .create_user(&Actor::system(), Ulid::new(), email.to_string(), "Administrator".into(), Role::Admin)
        .await
    {
        Ok(user) => info!(tenant, id = %user.id, "bootstrap admin created"),
        // Lost a race with another connection seeding the same tenant.
        Err(EngineError::AlreadyExists(_)) => {}
        Err(e) => warn!(tenant, "could not seed admin {email}: {e}"),
    }
}
