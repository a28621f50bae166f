use std::collections::HashMap;

use sqlparser::ast::{self, Expr, FromTable, Ident, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{BlockPatch, ReservationPatch};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        id: Ulid,
        name: String,
    },
    UpdateResource {
        id: Ulid,
        name: Option<String>,
        active: Option<bool>,
    },
    InsertUser {
        id: Ulid,
        email: String,
        name: String,
        role: Role,
    },
    SetUserStatus {
        user_id: Ulid,
        status: UserStatus,
        reason: Option<String>,
    },
    InsertReservation {
        id: Ulid,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        purpose: Purpose,
        notes: Option<String>,
        acknowledge_overlap: bool,
    },
    UpdateReservation {
        id: Ulid,
        patch: ReservationPatch,
        acknowledge_overlap: bool,
    },
    CancelReservation {
        id: Ulid,
        reason: Option<String>,
    },
    InsertBlock {
        id: Ulid,
        resource_id: Ulid,
        reason: String,
        start: Ms,
        end: Ms,
        is_recurring: bool,
        recurrence_rule: Option<String>,
        confirm_conflicts: bool,
    },
    UpdateBlock {
        id: Ulid,
        patch: BlockPatch,
    },
    DeleteBlock {
        id: Ulid,
    },
    /// `start >= X AND "end" <= Y` bound the viewing window; every non-cancelled
    /// reservation intersecting it is returned, not only those contained in it.
    SelectCalendar {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectUserReservations {
        user_id: Ulid,
    },
    SelectBlocks {
        resource_id: Option<Ulid>,
        include_expired: bool,
    },
    SelectConflicts {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    },
    SelectAuditLog {
        entity_id: Option<Ulid>,
    },
    SelectResources,
    SelectUsers,
}

const RESOURCE_COLUMNS: &[&str] = &["id", "name"];
const RESOURCE_UPDATE_COLUMNS: &[&str] = &["id", "name", "active"];
const USER_COLUMNS: &[&str] = &["id", "email", "name", "role"];
const USER_STATUS_COLUMNS: &[&str] = &["user_id", "status", "reason"];
const RESERVATION_COLUMNS: &[&str] = &[
    "id",
    "resource_id",
    "start",
    "end",
    "purpose",
    "notes",
    "acknowledge_overlap",
];
const RESERVATION_UPDATE_COLUMNS: &[&str] = RESERVATION_COLUMNS;
const CANCELLATION_COLUMNS: &[&str] = &["reservation_id", "reason"];
const BLOCK_COLUMNS: &[&str] = &[
    "id",
    "resource_id",
    "reason",
    "start",
    "end",
    "is_recurring",
    "recurrence_rule",
    "confirm_conflicts",
];
const BLOCK_UPDATE_COLUMNS: &[&str] = &[
    "id",
    "resource_id",
    "reason",
    "start",
    "end",
    "is_recurring",
    "recurrence_rule",
];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "resources" => {
            let row = Row::new("resources", RESOURCE_COLUMNS, &insert.columns, &values)?;
            Ok(Command::InsertResource {
                id: row.ulid("id")?,
                name: row.string("name")?,
            })
        }
        "resource_updates" => {
            let row = Row::new("resource_updates", RESOURCE_UPDATE_COLUMNS, &insert.columns, &values)?;
            Ok(Command::UpdateResource {
                id: row.ulid("id")?,
                name: row.opt_string("name")?,
                active: row.opt_bool("active")?,
            })
        }
        "users" => {
            let row = Row::new("users", USER_COLUMNS, &insert.columns, &values)?;
            let role = match row.opt_string("role")? {
                Some(s) => Role::parse(&s).ok_or(SqlError::InvalidValue("role", s))?,
                None => Role::User,
            };
            Ok(Command::InsertUser {
                id: row.ulid("id")?,
                email: row.string("email")?,
                name: row.string("name")?,
                role,
            })
        }
        "user_status" => {
            let row = Row::new("user_status", USER_STATUS_COLUMNS, &insert.columns, &values)?;
            let status = row.string("status")?;
            Ok(Command::SetUserStatus {
                user_id: row.ulid("user_id")?,
                status: UserStatus::parse(&status).ok_or(SqlError::InvalidValue("status", status))?,
                reason: row.opt_string("reason")?,
            })
        }
        "reservations" => {
            let row = Row::new("reservations", RESERVATION_COLUMNS, &insert.columns, &values)?;
            Ok(Command::InsertReservation {
                id: row.ulid("id")?,
                resource_id: row.ulid("resource_id")?,
                start: row.i64("start")?,
                end: row.i64("end")?,
                purpose: row.purpose()?.ok_or(SqlError::MissingColumn("purpose"))?,
                notes: row.opt_string("notes")?,
                acknowledge_overlap: row.opt_bool("acknowledge_overlap")?.unwrap_or(false),
            })
        }
        "reservation_updates" => {
            let row = Row::new("reservation_updates", RESERVATION_UPDATE_COLUMNS, &insert.columns, &values)?;
            Ok(Command::UpdateReservation {
                id: row.ulid("id")?,
                patch: ReservationPatch {
                    resource_id: row.opt_ulid("resource_id")?,
                    start: row.opt_i64("start")?,
                    end: row.opt_i64("end")?,
                    purpose: row.purpose()?,
                    notes: row.nullable_string("notes")?,
                },
                acknowledge_overlap: row.opt_bool("acknowledge_overlap")?.unwrap_or(false),
            })
        }
        "cancellations" => {
            let row = Row::new("cancellations", CANCELLATION_COLUMNS, &insert.columns, &values)?;
            Ok(Command::CancelReservation {
                id: row.ulid("reservation_id")?,
                reason: row.opt_string("reason")?,
            })
        }
        "blocks" => {
            let row = Row::new("blocks", BLOCK_COLUMNS, &insert.columns, &values)?;
            Ok(Command::InsertBlock {
                id: row.ulid("id")?,
                resource_id: row.ulid("resource_id")?,
                reason: row.string("reason")?,
                start: row.i64("start")?,
                end: row.i64("end")?,
                is_recurring: row.opt_bool("is_recurring")?.unwrap_or(false),
                recurrence_rule: row.opt_string("recurrence_rule")?,
                confirm_conflicts: row.opt_bool("confirm_conflicts")?.unwrap_or(false),
            })
        }
        "block_updates" => {
            let row = Row::new("block_updates", BLOCK_UPDATE_COLUMNS, &insert.columns, &values)?;
            Ok(Command::UpdateBlock {
                id: row.ulid("id")?,
                patch: BlockPatch {
                    resource_id: row.opt_ulid("resource_id")?,
                    reason: row.opt_string("reason")?,
                    start: row.opt_i64("start")?,
                    end: row.opt_i64("end")?,
                    is_recurring: row.opt_bool("is_recurring")?,
                    recurrence_rule: row.nullable_string("recurrence_rule")?,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "reservations" => Ok(Command::CancelReservation { id, reason: None }),
        "blocks" => Ok(Command::DeleteBlock { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        filters.collect(selection)?;
    }

    match table.as_str() {
        "reservations" => {
            if let Some(user_id) = filters.eq_ulid("user_id")? {
                return Ok(Command::SelectUserReservations { user_id });
            }
            Ok(Command::SelectCalendar {
                resource_id: filters.eq_ulid("resource_id")?.ok_or(SqlError::MissingFilter("resource_id"))?,
                start: filters.lower("start")?.ok_or(SqlError::MissingFilter("start"))?,
                end: filters.upper("end")?.ok_or(SqlError::MissingFilter("end"))?,
            })
        }
        "conflicts" => Ok(Command::SelectConflicts {
            resource_id: filters.eq_ulid("resource_id")?.ok_or(SqlError::MissingFilter("resource_id"))?,
            start: filters.lower("start")?.ok_or(SqlError::MissingFilter("start"))?,
            end: filters.upper("end")?.ok_or(SqlError::MissingFilter("end"))?,
            exclude: filters.eq_ulid("exclude")?,
        }),
        "blocks" => Ok(Command::SelectBlocks {
            resource_id: filters.eq_ulid("resource_id")?,
            include_expired: filters.eq_bool("include_expired")?.unwrap_or(false),
        }),
        "audit_log" => Ok(Command::SelectAuditLog {
            entity_id: filters.eq_ulid("entity_id")?,
        }),
        "resources" => Ok(Command::SelectResources),
        "users" => Ok(Command::SelectUsers),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Column mapping ────────────────────────────────────────────

/// One VALUES row keyed by column name. Without an explicit column list the
/// values are taken positionally in the table's canonical order.
struct Row<'a> {
    values: HashMap<String, &'a Expr>,
}

impl<'a> Row<'a> {
    fn new(
        table: &'static str,
        canonical: &[&str],
        columns: &[Ident],
        values: &'a [Expr],
    ) -> Result<Self, SqlError> {
        let names: Vec<String> = if columns.is_empty() {
            if values.len() > canonical.len() {
                return Err(SqlError::WrongArity(table, canonical.len(), values.len()));
            }
            canonical.iter().map(|c| c.to_string()).collect()
        } else {
            if columns.len() != values.len() {
                return Err(SqlError::WrongArity(table, columns.len(), values.len()));
            }
            columns.iter().map(|c| c.value.to_lowercase()).collect()
        };

        let mut map = HashMap::with_capacity(names.len());
        for (name, value) in names.into_iter().zip(values) {
            if !canonical.contains(&name.as_str()) {
                return Err(SqlError::UnknownColumn(table, name));
            }
            map.insert(name, value);
        }
        Ok(Self { values: map })
    }

    /// Present and not NULL.
    fn get(&self, col: &str) -> Option<&'a Expr> {
        self.values
            .get(col)
            .copied()
            .filter(|e| !matches!(extract_value(e), Some(Value::Null)))
    }

    fn required(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(col))
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.required(col)?)
    }

    fn opt_ulid(&self, col: &str) -> Result<Option<Ulid>, SqlError> {
        self.get(col).map(parse_ulid_expr).transpose()
    }

    fn i64(&self, col: &'static str) -> Result<i64, SqlError> {
        parse_i64_expr(self.required(col)?)
    }

    fn opt_i64(&self, col: &str) -> Result<Option<i64>, SqlError> {
        self.get(col).map(parse_i64_expr).transpose()
    }

    fn string(&self, col: &'static str) -> Result<String, SqlError> {
        parse_string_expr(self.required(col)?)
    }

    fn opt_string(&self, col: &str) -> Result<Option<String>, SqlError> {
        self.get(col).map(parse_string_expr).transpose()
    }

    /// Absent → `None` (keep); NULL → `Some(None)` (clear).
    fn nullable_string(&self, col: &str) -> Result<Option<Option<String>>, SqlError> {
        if !self.values.contains_key(col) {
            return Ok(None);
        }
        Ok(Some(self.opt_string(col)?))
    }

    fn opt_bool(&self, col: &str) -> Result<Option<bool>, SqlError> {
        self.get(col).map(parse_bool).transpose()
    }

    fn purpose(&self) -> Result<Option<Purpose>, SqlError> {
        match self.opt_string("purpose")? {
            Some(s) => Purpose::parse(&s).map(Some).ok_or(SqlError::InvalidValue("purpose", s)),
            None => Ok(None),
        }
    }
}

// ── WHERE filters ─────────────────────────────────────────────

/// Conjunction of `col = v`, `col >= v` and `col <= v` terms.
#[derive(Default)]
struct Filters<'a> {
    eq: HashMap<String, &'a Expr>,
    gte: HashMap<String, &'a Expr>,
    lte: HashMap<String, &'a Expr>,
}

impl<'a> Filters<'a> {
    fn collect(&mut self, expr: &'a Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp { left, op, right } => {
                let target = match op {
                    ast::BinaryOperator::And => {
                        self.collect(left)?;
                        return self.collect(right);
                    }
                    ast::BinaryOperator::Eq => &mut self.eq,
                    ast::BinaryOperator::GtEq => &mut self.gte,
                    ast::BinaryOperator::LtEq => &mut self.lte,
                    other => return Err(SqlError::Unsupported(format!("operator {other}"))),
                };
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
                target.insert(col, right.as_ref());
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    fn eq_ulid(&self, col: &str) -> Result<Option<Ulid>, SqlError> {
        self.eq.get(col).map(|e| parse_ulid_expr(e)).transpose()
    }

    fn eq_bool(&self, col: &str) -> Result<Option<bool>, SqlError> {
        self.eq.get(col).map(|e| parse_bool(e)).transpose()
    }

    fn lower(&self, col: &str) -> Result<Option<Ms>, SqlError> {
        self.gte.get(col).map(|e| parse_i64_expr(e)).transpose()
    }

    fn upper(&self, col: &str) -> Result<Option<Ms>, SqlError> {
        self.lte.get(col).map(|e| parse_i64_expr(e)).transpose()
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

/// First VALUES row. Each statement addresses exactly one record.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.len() {
            0 => Err(SqlError::Parse("empty VALUES".into())),
            1 => Ok(values.rows[0].clone()),
            n => Err(SqlError::Unsupported(format!("{n} VALUES rows; insert one record per statement"))),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
    InvalidValue(&'static str, String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::InvalidValue(col, v) => write!(f, "invalid {col}: {v}"),
        }
    }
}

impl std::error::Error for SqlError {}
