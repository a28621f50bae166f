use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;
use ulid::Ulid;

use crate::auth::PaddockAuthSource;
use crate::engine::{
    BlockOutcome, Engine, EngineError, NewBlock, NewReservation, ReservationOutcome,
};
use crate::model::*;
use crate::observability::{self, AUTH_FAILURES_TOTAL, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct PaddockHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<PaddockQueryParser>,
}

/// The tenant engine and the caller acting on it.
struct Session {
    engine: Arc<Engine>,
    actor: Actor,
}

impl PaddockHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(PaddockQueryParser),
        }
    }

    async fn resolve_session<C: ClientInfo>(&self, client: &C) -> PgWireResult<Session> {
        let metadata = client.metadata();
        let db = metadata
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        let login = metadata.get("user").cloned().unwrap_or_default();

        let engine = self.tenant_manager.get_or_create(&db).await.map_err(|e| {
            user_error("08006", format!("tenant error: {e}"))
        })?;
        let user = engine.find_user_by_email(&login).ok_or_else(|| {
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            user_error("28000", format!("no user with email {login:?} in {db}"))
        })?;
        Ok(Session {
            actor: Actor::new(user.id, user.role),
            engine,
        })
    }

    async fn run(&self, session: &Session, sql_text: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql_text).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = execute_command(&session.engine, &session.actor, cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        if let Err(e) = &result {
            debug!(command = label, "query failed: {e}");
        }
        result.map_err(engine_err)
    }
}

async fn execute_command(engine: &Engine, actor: &Actor, cmd: Command) -> Result<Response, EngineError> {
    match cmd {
        Command::InsertResource { id, name } => {
            let info = engine.create_resource(actor, id, name).await?;
            resource_rows(Some("CREATED"), &[info])
        }
        Command::UpdateResource { id, name, active } => {
            let info = engine.update_resource(actor, id, name, active).await?;
            resource_rows(Some("UPDATED"), &[info])
        }
        Command::InsertUser { id, email, name, role } => {
            let user = engine.create_user(actor, id, email, name, role).await?;
            user_rows(Some("CREATED"), &[(user, None)])
        }
        Command::SetUserStatus {
            user_id,
            status: UserStatus::Disabled,
            reason,
        } => {
            let (user, cancelled) = engine.disable_user(actor, user_id, reason).await?;
            user_rows(Some("DISABLED"), &[(user, Some(cancelled))])
        }
        Command::SetUserStatus {
            user_id,
            status: UserStatus::Active,
            ..
        } => {
            let user = engine.enable_user(actor, user_id).await?;
            user_rows(Some("ENABLED"), &[(user, None)])
        }
        Command::InsertReservation {
            id,
            resource_id,
            start,
            end,
            purpose,
            notes,
            acknowledge_overlap,
        } => {
            let req = NewReservation {
                id,
                resource_id,
                span: Span::new(start, end),
                purpose,
                notes,
            };
            let outcome = engine.create_reservation(actor, req, acknowledge_overlap).await?;
            reservation_outcome_rows(engine, "CREATED", resource_id, outcome)
        }
        Command::UpdateReservation {
            id,
            patch,
            acknowledge_overlap,
        } => {
            let target = patch.resource_id;
            let outcome = engine.update_reservation(actor, id, patch, acknowledge_overlap).await?;
            let resource_id = match (&outcome, target) {
                (ReservationOutcome::Committed(r), _) => r.resource_id,
                (_, Some(rid)) => rid,
                _ => engine.get_resource_for_entity(&id).unwrap_or_default(),
            };
            reservation_outcome_rows(engine, "UPDATED", resource_id, outcome)
        }
        Command::CancelReservation { id, reason } => {
            let r = engine.cancel_reservation(actor, id, reason).await?;
            let cells = ReservationCells::from_reservation(engine, &r);
            reservation_rows(Some("CANCELLED"), vec![cells])
        }
        Command::InsertBlock {
            id,
            resource_id,
            reason,
            start,
            end,
            is_recurring,
            recurrence_rule,
            confirm_conflicts,
        } => {
            let req = NewBlock {
                id,
                resource_id,
                reason,
                span: Span::new(start, end),
                is_recurring,
                recurrence_rule,
            };
            match engine.create_block(actor, req, confirm_conflicts).await? {
                BlockOutcome::Created { block, impacted } => {
                    block_rows(vec![BlockCells::from_block(Some("CREATED"), &block, Some(impacted))])
                }
                BlockOutcome::ConflictsExist(conflicts) => block_rows(
                    conflicts
                        .iter()
                        .map(|c| BlockCells::from_conflict(resource_id, c))
                        .collect(),
                ),
            }
        }
        Command::UpdateBlock { id, patch } => {
            let block = engine.update_block(actor, id, patch).await?;
            block_rows(vec![BlockCells::from_block(Some("UPDATED"), &block, None)])
        }
        Command::DeleteBlock { id } => {
            let (block, restored) = engine.delete_block(actor, id).await?;
            block_rows(vec![BlockCells::from_block(Some("DELETED"), &block, Some(restored))])
        }
        Command::SelectCalendar {
            resource_id,
            start,
            end,
        } => {
            let entries = engine
                .reservations_for_calendar(actor, resource_id, Span::new(start, end))
                .await?;
            reservation_rows(None, entries.into_iter().map(ReservationCells::from_calendar).collect())
        }
        Command::SelectUserReservations { user_id } => {
            let reservations = engine.user_reservations(actor, user_id).await?;
            reservation_rows(
                None,
                reservations
                    .iter()
                    .map(|r| ReservationCells::from_reservation(engine, r))
                    .collect(),
            )
        }
        Command::SelectBlocks {
            resource_id,
            include_expired,
        } => {
            let blocks = engine.get_blocks(resource_id, include_expired).await?;
            block_rows(blocks.iter().map(|b| BlockCells::from_block(None, b, None)).collect())
        }
        Command::SelectConflicts {
            resource_id,
            start,
            end,
            exclude,
        } => {
            let report = engine
                .check_conflicts(resource_id, Span::new(start, end), exclude)
                .await?;
            conflict_rows(&report)
        }
        Command::SelectAuditLog { entity_id } => {
            let entries = engine.audit_log(actor, entity_id)?;
            audit_rows(&entries)
        }
        Command::SelectResources => resource_rows(None, &engine.list_resources().await),
        Command::SelectUsers => {
            if !actor.is_admin() {
                return Err(EngineError::PermissionDenied(actor.user_id));
            }
            let users: Vec<_> = engine.list_users().into_iter().map(|u| (u, None)).collect();
            user_rows(None, &users)
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn boolean(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::BOOL, FieldFormat::Text)
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text("outcome"),
        text("id"),
        text("resource_id"),
        text("user_id"),
        text("user_name"),
        int8("start"),
        int8("end"),
        text("purpose"),
        text("status"),
        text("notes"),
        text("cancel_reason"),
    ]
}

fn block_schema() -> Vec<FieldInfo> {
    vec![
        text("outcome"),
        text("id"),
        text("resource_id"),
        text("user_id"),
        int8("start"),
        int8("end"),
        text("reason"),
        boolean("is_recurring"),
        text("recurrence_rule"),
        int8("affected"),
    ]
}

fn user_schema() -> Vec<FieldInfo> {
    vec![
        text("outcome"),
        text("id"),
        text("email"),
        text("name"),
        text("role"),
        text("status"),
        int8("cancelled_reservations"),
    ]
}

fn resource_schema() -> Vec<FieldInfo> {
    vec![text("outcome"), text("id"), text("name"), boolean("active")]
}

fn conflict_schema() -> Vec<FieldInfo> {
    vec![
        text("kind"),
        text("id"),
        text("user_id"),
        int8("start"),
        int8("end"),
        text("detail"),
    ]
}

fn audit_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        int8("timestamp"),
        text("user_id"),
        text("action"),
        text("entity_type"),
        text("entity_id"),
        text("changes"),
    ]
}

/// Result columns for a statement, keyed on the table it addresses. Used to
/// describe prepared statements before their parameters are bound.
fn schema_for_sql(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let mut words = lower.split(|c: char| c.is_whitespace() || c == '(' || c == ';');
    let mut table = None;
    while let Some(word) = words.next() {
        if word == "into" || word == "from" {
            table = words.find(|w| !w.is_empty());
            break;
        }
    }
    match table.map(|t| t.trim_matches('"')) {
        Some("reservations" | "reservation_updates" | "cancellations") => reservation_schema(),
        Some("blocks" | "block_updates") => block_schema(),
        Some("users" | "user_status") => user_schema(),
        Some("resources" | "resource_updates") => resource_schema(),
        Some("conflicts") => conflict_schema(),
        Some("audit_log") => audit_schema(),
        _ => vec![],
    }
}

// ── Row encoding ─────────────────────────────────────────────────

fn rows_response(schema: Vec<FieldInfo>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(Arc::new(schema), stream::iter(rows)))
}

struct ReservationCells {
    outcome: Option<&'static str>,
    id: Ulid,
    resource_id: Ulid,
    user_id: Ulid,
    user_name: Option<String>,
    start: Ms,
    end: Ms,
    purpose: Purpose,
    status: ReservationStatus,
    notes: Option<String>,
    cancel_reason: Option<String>,
}

impl ReservationCells {
    fn from_reservation(engine: &Engine, r: &Reservation) -> Self {
        Self {
            outcome: None,
            id: r.id,
            resource_id: r.resource_id,
            user_id: r.user_id,
            user_name: engine.get_user(&r.user_id).map(|u| u.name),
            start: r.span.start,
            end: r.span.end,
            purpose: r.purpose,
            status: r.status,
            notes: r.notes.clone(),
            cancel_reason: r.cancel_reason.clone(),
        }
    }

    fn from_calendar(e: CalendarEntry) -> Self {
        Self {
            outcome: None,
            id: e.id,
            resource_id: e.resource_id,
            user_id: e.user_id,
            user_name: e.user_name,
            start: e.start,
            end: e.end,
            purpose: e.purpose,
            status: e.status,
            notes: e.notes,
            cancel_reason: None,
        }
    }

    /// A live booking standing in the way; notes are never exposed here.
    fn from_conflict(engine: &Engine, resource_id: Ulid, c: &ConflictInfo) -> Self {
        Self {
            outcome: Some("OVERLAP_EXISTS"),
            id: c.id,
            resource_id,
            user_id: c.user_id,
            user_name: engine.get_user(&c.user_id).map(|u| u.name),
            start: c.start,
            end: c.end,
            purpose: c.purpose,
            status: ReservationStatus::Confirmed,
            notes: None,
            cancel_reason: None,
        }
    }
}

fn reservation_rows(outcome: Option<&'static str>, cells: Vec<ReservationCells>) -> Result<Response, EngineError> {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<DataRow>> = cells
        .into_iter()
        .map(|c| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&outcome.or(c.outcome))?;
            encoder.encode_field(&c.id.to_string())?;
            encoder.encode_field(&c.resource_id.to_string())?;
            encoder.encode_field(&c.user_id.to_string())?;
            encoder.encode_field(&c.user_name)?;
            encoder.encode_field(&c.start)?;
            encoder.encode_field(&c.end)?;
            encoder.encode_field(&c.purpose.as_str())?;
            encoder.encode_field(&c.status.as_str())?;
            encoder.encode_field(&c.notes)?;
            encoder.encode_field(&c.cancel_reason)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(rows_response(reservation_schema(), rows))
}

fn reservation_outcome_rows(
    engine: &Engine,
    success: &'static str,
    resource_id: Ulid,
    outcome: ReservationOutcome,
) -> Result<Response, EngineError> {
    match outcome {
        ReservationOutcome::Committed(r) => {
            reservation_rows(Some(success), vec![ReservationCells::from_reservation(engine, &r)])
        }
        ReservationOutcome::OverlapExists(conflicts) => reservation_rows(
            None,
            conflicts
                .iter()
                .map(|c| ReservationCells::from_conflict(engine, resource_id, c))
                .collect(),
        ),
    }
}

struct BlockCells {
    outcome: Option<&'static str>,
    id: Ulid,
    resource_id: Ulid,
    user_id: Ulid,
    start: Ms,
    end: Ms,
    reason: Option<String>,
    is_recurring: Option<bool>,
    recurrence_rule: Option<String>,
    affected: Option<i64>,
}

impl BlockCells {
    /// `user_id` is the creating admin.
    fn from_block(outcome: Option<&'static str>, b: &Block, affected: Option<usize>) -> Self {
        Self {
            outcome,
            id: b.id,
            resource_id: b.resource_id,
            user_id: b.created_by,
            start: b.span.start,
            end: b.span.end,
            reason: Some(b.reason.clone()),
            is_recurring: Some(b.is_recurring),
            recurrence_rule: b.recurrence_rule.clone(),
            affected: affected.map(|n| n as i64),
        }
    }

    /// One CONFIRMED reservation the unconfirmed block would impact.
    fn from_conflict(resource_id: Ulid, c: &ConflictInfo) -> Self {
        Self {
            outcome: Some("CONFLICTS_EXIST"),
            id: c.id,
            resource_id,
            user_id: c.user_id,
            start: c.start,
            end: c.end,
            reason: None,
            is_recurring: None,
            recurrence_rule: None,
            affected: None,
        }
    }
}

fn block_rows(cells: Vec<BlockCells>) -> Result<Response, EngineError> {
    let schema = Arc::new(block_schema());
    let rows: Vec<PgWireResult<DataRow>> = cells
        .into_iter()
        .map(|c| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&c.outcome)?;
            encoder.encode_field(&c.id.to_string())?;
            encoder.encode_field(&c.resource_id.to_string())?;
            encoder.encode_field(&c.user_id.to_string())?;
            encoder.encode_field(&c.start)?;
            encoder.encode_field(&c.end)?;
            encoder.encode_field(&c.reason)?;
            encoder.encode_field(&c.is_recurring)?;
            encoder.encode_field(&c.recurrence_rule)?;
            encoder.encode_field(&c.affected)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(rows_response(block_schema(), rows))
}

fn user_rows(outcome: Option<&'static str>, users: &[(User, Option<usize>)]) -> Result<Response, EngineError> {
    let schema = Arc::new(user_schema());
    let rows: Vec<PgWireResult<DataRow>> = users
        .iter()
        .map(|(u, cancelled)| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&outcome)?;
            encoder.encode_field(&u.id.to_string())?;
            encoder.encode_field(&u.email)?;
            encoder.encode_field(&u.name)?;
            encoder.encode_field(&u.role.as_str())?;
            encoder.encode_field(&u.status.as_str())?;
            encoder.encode_field(&cancelled.map(|n| n as i64))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(rows_response(user_schema(), rows))
}

fn resource_rows(outcome: Option<&'static str>, resources: &[ResourceInfo]) -> Result<Response, EngineError> {
    let schema = Arc::new(resource_schema());
    let rows: Vec<PgWireResult<DataRow>> = resources
        .iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&outcome)?;
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.name)?;
            encoder.encode_field(&r.active)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(rows_response(resource_schema(), rows))
}

/// The blocking block first (if any), then every overlapping CONFIRMED reservation.
fn conflict_rows(report: &ConflictReport) -> Result<Response, EngineError> {
    let schema = Arc::new(conflict_schema());
    let encode = |kind: &str, id: Ulid, user_id: Option<Ulid>, start: Ms, end: Ms, detail: &str| -> PgWireResult<DataRow> {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&kind)?;
        encoder.encode_field(&id.to_string())?;
        encoder.encode_field(&user_id.map(|u| u.to_string()))?;
        encoder.encode_field(&start)?;
        encoder.encode_field(&end)?;
        encoder.encode_field(&detail)?;
        Ok(encoder.take_row())
    };

    let mut rows = Vec::with_capacity(report.overlaps.len() + 1);
    if let Some(b) = &report.block {
        rows.push(encode("BLOCK", b.id, None, b.start, b.end, &b.reason));
    }
    for c in &report.overlaps {
        rows.push(encode("OVERLAP", c.id, Some(c.user_id), c.start, c.end, c.purpose.as_str()));
    }
    Ok(rows_response(conflict_schema(), rows))
}

fn audit_rows(entries: &[AuditLogEntry]) -> Result<Response, EngineError> {
    let schema = Arc::new(audit_schema());
    let rows: Vec<PgWireResult<DataRow>> = entries
        .iter()
        .map(|e| {
            let changes = serde_json::to_string(&e.changes)
                .map_err(|err| PgWireError::ApiError(Box::new(err)))?;
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&e.id.to_string())?;
            encoder.encode_field(&e.timestamp)?;
            encoder.encode_field(&e.user_id.to_string())?;
            encoder.encode_field(&e.action.as_str())?;
            encoder.encode_field(&e.entity_type.as_str())?;
            encoder.encode_field(&e.entity_id.to_string())?;
            encoder.encode_field(&changes)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(rows_response(audit_schema(), rows))
}

#[async_trait]
impl SimpleQueryHandler for PaddockHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let session = self.resolve_session(client).await?;
        Ok(vec![self.run(&session, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct PaddockQueryParser;

#[async_trait]
impl QueryParser for PaddockQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for_sql(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for PaddockHandler {
    type Statement = String;
    type QueryParser = PaddockQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let session = self.resolve_session(client).await?;
        let sql = substitute_params(portal);
        self.run(&session, &sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            schema_for_sql(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema_for_sql(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    max = max.max(n);
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let values: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    bind_params(&portal.statement.statement, &values)
}

/// One pass over the statement: each `$N` token is replaced where it stands, and
/// inserted values are never scanned again. Unbound indexes are left as written.
fn bind_params(sql: &str, values: &[Option<String>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let bound = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| values.get(i));
        match bound {
            Some(value) => result.push_str(&param_literal(value.as_deref())),
            None => result.push_str(&rest[pos..pos + 1 + digits]),
        }
        rest = &after[digits..];
    }
    result.push_str(rest);
    result
}

fn param_literal(value: Option<&str>) -> String {
    match value {
        // Booleans and numbers stay bare so flag and time columns parse.
        Some(text @ ("true" | "false")) => text.to_string(),
        Some(text) if text.parse::<i64>().is_ok() => text.to_string(),
        Some(text) => format!("'{}'", text.replace('\'', "''")),
        None => "NULL".to_string(),
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct PaddockFactory {
    handler: Arc<PaddockHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<PaddockAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl PaddockFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = PaddockAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(PaddockHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for PaddockFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls_acceptor: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = PaddockFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls_acceptor, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for each engine error class.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::TimeBlocked(_) => "23P01",
        EngineError::Validation(_) | EngineError::InvalidState(_) => "22023",
        EngineError::PermissionDenied(_) => "42501",
        EngineError::NotFound(_) => "02000",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BlockInfo;

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM users"), 0);
        assert_eq!(count_params("INSERT INTO resources (id, name) VALUES ($1, $2)"), 2);
        assert_eq!(count_params("SELECT * FROM conflicts WHERE resource_id = $3 AND start >= $1"), 3);
        assert_eq!(count_params("VALUES ($10)"), 10);
    }

    #[test]
    fn bind_params_quotes_text_and_keeps_numbers() {
        let sql = "INSERT INTO cancellations (reservation_id, reason) VALUES ($1, $2)";
        let bound = bind_params(sql, &[Some("01ARZ3NDEKTSV4RRFFQ69G5FAV".into()), Some("it's lame".into())]);
        assert_eq!(
            bound,
            "INSERT INTO cancellations (reservation_id, reason) VALUES ('01ARZ3NDEKTSV4RRFFQ69G5FAV', 'it''s lame')"
        );

        let bound = bind_params("VALUES ($1, $2, $3)", &[Some("-5".into()), Some("true".into()), None]);
        assert_eq!(bound, "VALUES (-5, true, NULL)");
    }

    #[test]
    fn bind_params_double_digit_placeholders() {
        let values: Vec<Option<String>> = (1..=10).map(|i| Some(i.to_string())).collect();
        assert_eq!(bind_params("$1 $10", &values), "1 10");
    }

    #[test]
    fn bound_text_is_not_rescanned() {
        let sql = "INSERT INTO cancellations (reservation_id, reason) VALUES ($1, $2)";
        let bound = bind_params(sql, &[Some("01ARZ3NDEKTSV4RRFFQ69G5FAV".into()), Some("refund $1 please".into())]);
        assert_eq!(
            bound,
            "INSERT INTO cancellations (reservation_id, reason) VALUES ('01ARZ3NDEKTSV4RRFFQ69G5FAV', 'refund $1 please')"
        );
        match crate::sql::parse_sql(&bound).unwrap() {
            Command::CancelReservation { reason, .. } => assert_eq!(reason.as_deref(), Some("refund $1 please")),
            other => panic!("expected cancellation, got {other:?}"),
        }

        assert_eq!(bind_params("VALUES ($1, $3, $)", &[Some("7".into())]), "VALUES (7, $3, $)");
    }

    #[test]
    fn schema_follows_table() {
        let names = |sql: &str| -> Vec<String> {
            schema_for_sql(sql).iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(names(r#"INSERT INTO reservations (id) VALUES ($1)"#)[0], "outcome");
        assert!(names("INSERT INTO cancellations(reservation_id) VALUES ($1)").contains(&"cancel_reason".to_string()));
        assert!(names("DELETE FROM blocks WHERE id = $1").contains(&"affected".to_string()));
        assert!(names("SELECT * FROM audit_log").contains(&"changes".to_string()));
        assert_eq!(names("select * from conflicts where resource_id = $1")[0], "kind");
        assert!(names("INSERT INTO user_status (user_id, status) VALUES ($1, $2)").contains(&"cancelled_reservations".to_string()));
        assert!(names("SHOW server_version").is_empty());
    }

    #[test]
    fn engine_errors_map_to_sqlstate() {
        let id = Ulid::nil();
        let block = BlockInfo {
            id,
            resource_id: id,
            reason: "Farrier".into(),
            start: 0,
            end: 1,
        };
        assert_eq!(sqlstate(&EngineError::TimeBlocked(block)), "23P01");
        assert_eq!(sqlstate(&EngineError::invalid("start", "bad")), "22023");
        assert_eq!(sqlstate(&EngineError::InvalidState("cancelled".into())), "22023");
        assert_eq!(sqlstate(&EngineError::PermissionDenied(id)), "42501");
        assert_eq!(sqlstate(&EngineError::NotFound(id)), "02000");
        assert_eq!(sqlstate(&EngineError::AlreadyExists(id)), "23505");
        assert_eq!(sqlstate(&EngineError::LimitExceeded("too many")), "54000");
        assert_eq!(sqlstate(&EngineError::WalError("disk".into())), "58030");
    }
}
