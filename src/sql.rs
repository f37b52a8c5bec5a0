use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, LimitClause, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{BookingFilter, DEFAULT_RECENT_BOOKINGS};
use crate::model::*;

/// One row of `INSERT INTO rules`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRule {
    pub id: Ulid,
    pub day_of_week: DayOfWeek,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub is_blocked: bool,
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertService {
        id: Ulid,
        name: String,
        duration_minutes: u32,
        price_cents: u64,
        description: Option<String>,
    },
    UpdateService {
        id: Ulid,
        patch: ServicePatch,
    },
    /// Soft delete.
    DeleteService {
        id: Ulid,
    },
    InsertRules {
        rules: Vec<NewRule>,
    },
    DeleteRule {
        id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        user_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
        start: TimeOfDay,
    },
    UpdateBookingStatus {
        id: Ulid,
        status: BookingStatus,
    },
    /// `date: None` keeps the booking on its current date.
    RescheduleBooking {
        id: Ulid,
        date: Option<NaiveDate>,
        start: TimeOfDay,
    },
    /// Cancels; the row is kept.
    DeleteBooking {
        id: Ulid,
    },
    SelectServices {
        id: Option<Ulid>,
        active_only: bool,
    },
    SelectRules {
        day_of_week: Option<DayOfWeek>,
    },
    SelectBookings {
        id: Option<Ulid>,
        filter: BookingFilter,
    },
    SelectAvailability {
        service_id: Ulid,
        date: NaiveDate,
    },
    SelectStats,
    SelectRevenue,
    /// Newest bookings first, joined with their service.
    SelectRecentBookings {
        limit: usize,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported(format!(
            "{} statements in one query; send them separately",
            stmts.len()
        )));
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Default column order when an INSERT omits its column list.
fn default_columns(table: &str) -> &'static [&'static str] {
    match table {
        "services" => &["id", "name", "duration_minutes", "price_cents", "description"],
        "rules" => &["id", "day_of_week", "start_time", "end_time", "is_blocked"],
        "bookings" => &["id", "user_id", "service_id", "booking_date", "start_time"],
        _ => &[],
    }
}

/// Column name → value for one VALUES row.
struct Row<'a> {
    table: &'static str,
    cells: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn get(&self, col: &str) -> Option<&'a Expr> {
        self.cells
            .iter()
            .find(|(name, _)| name == col)
            .map(|(_, expr)| *expr)
    }

    fn require(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(self.table, col))
    }
}

fn insert_rows<'a>(
    insert: &'a ast::Insert,
    table: &'static str,
) -> Result<Vec<Row<'a>>, SqlError> {
    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns(table).iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };

    let mut rows = Vec::new();
    for values in extract_all_insert_rows(insert)? {
        if values.len() > columns.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        rows.push(Row {
            table,
            cells: columns.iter().cloned().zip(values.iter()).collect(),
        });
    }
    Ok(rows)
}

fn single_row<'a>(insert: &'a ast::Insert, table: &'static str) -> Result<Row<'a>, SqlError> {
    let mut rows = insert_rows(insert, table)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported(format!(
            "multi-row INSERT into {table}"
        )));
    }
    Ok(rows.remove(0))
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "services" => {
            let row = single_row(insert, "services")?;
            Ok(Command::InsertService {
                id: parse_ulid_expr(row.require("id")?)?,
                name: parse_string_expr(row.require("name")?)?,
                duration_minutes: parse_u32(row.require("duration_minutes")?)?,
                price_cents: match row.get("price_cents") {
                    Some(expr) => parse_u64(expr)?,
                    None => 0,
                },
                description: match row.get("description") {
                    Some(expr) => parse_string_or_null(expr)?,
                    None => None,
                },
            })
        }
        "rules" => {
            let mut rules = Vec::new();
            for (i, row) in insert_rows(insert, "rules")?.iter().enumerate() {
                let rule = parse_rule_row(row)
                    .map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
                rules.push(rule);
            }
            Ok(Command::InsertRules { rules })
        }
        "bookings" => {
            let row = single_row(insert, "bookings")?;
            Ok(Command::InsertBooking {
                id: parse_ulid_expr(row.require("id")?)?,
                user_id: parse_ulid_expr(row.require("user_id")?)?,
                service_id: parse_ulid_expr(row.require("service_id")?)?,
                date: parse_date_expr(row.require("booking_date")?)?,
                start: parse_time_expr(row.require("start_time")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_rule_row(row: &Row<'_>) -> Result<NewRule, SqlError> {
    let day = parse_i64_expr(row.require("day_of_week")?)?;
    Ok(NewRule {
        id: parse_ulid_expr(row.require("id")?)?,
        // Out-of-range weekdays are left for the engine to reject.
        day_of_week: u8::try_from(day).unwrap_or(u8::MAX),
        start: parse_time_expr(row.require("start_time")?)?,
        end: parse_time_expr(row.require("end_time")?)?,
        is_blocked: match row.get("is_blocked") {
            Some(expr) => parse_bool(expr)?,
            None => false,
        },
    })
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;

    let mut sets: Vec<(String, &Expr)> = Vec::with_capacity(assignments.len());
    for a in assignments {
        let col = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        sets.push((col, &a.value));
    }

    match table.as_str() {
        "services" => {
            let mut patch = ServicePatch::default();
            for (col, value) in sets {
                match col.as_str() {
                    "name" => patch.name = Some(parse_string_expr(value)?),
                    "description" => patch.description = parse_string_or_null(value)?,
                    "duration_minutes" => patch.duration_minutes = Some(parse_u32(value)?),
                    "price_cents" => patch.price_cents = Some(parse_u64(value)?),
                    "is_active" => patch.is_active = Some(parse_bool(value)?),
                    _ => return Err(SqlError::UnknownColumn("services", col)),
                }
            }
            if patch.is_empty() {
                return Err(SqlError::Parse("UPDATE services sets nothing".into()));
            }
            Ok(Command::UpdateService { id, patch })
        }
        "bookings" => {
            let (mut status, mut date, mut start) = (None, None, None);
            for (col, value) in sets {
                match col.as_str() {
                    "status" => {
                        let s = parse_string_expr(value)?;
                        status = Some(s.parse::<BookingStatus>().map_err(SqlError::Parse)?);
                    }
                    "booking_date" => date = Some(parse_date_expr(value)?),
                    "start_time" => start = Some(parse_time_expr(value)?),
                    _ => return Err(SqlError::UnknownColumn("bookings", col)),
                }
            }
            match (status, start) {
                (Some(status), None) if date.is_none() => {
                    Ok(Command::UpdateBookingStatus { id, status })
                }
                (None, Some(start)) => Ok(Command::RescheduleBooking { id, date, start }),
                (None, None) if date.is_some() => Err(SqlError::MissingColumn("bookings", "start_time")),
                _ => Err(SqlError::Unsupported(
                    "UPDATE bookings sets either status or booking_date/start_time".into(),
                )),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "services" => Ok(Command::DeleteService { id }),
        "rules" => Ok(Command::DeleteRule { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let limit = parse_limit(query)?;
    if limit.is_some()
        && matches!(
            table.as_str(),
            "services" | "rules" | "bookings" | "availability" | "stats" | "revenue"
        )
    {
        return Err(SqlError::Unsupported(format!("LIMIT on {table}")));
    }

    match table.as_str() {
        "services" => {
            let mut cmd_id = None;
            let mut active_only = false;
            for (col, value) in filters {
                match col.as_str() {
                    "id" => cmd_id = Some(parse_ulid_expr(value)?),
                    "is_active" => active_only = parse_bool(value)?,
                    _ => return Err(SqlError::UnknownColumn("services", col)),
                }
            }
            Ok(Command::SelectServices {
                id: cmd_id,
                active_only,
            })
        }
        "rules" => {
            let mut day_of_week = None;
            for (col, value) in filters {
                match col.as_str() {
                    "day_of_week" => {
                        let d = parse_i64_expr(value)?;
                        day_of_week = Some(u8::try_from(d).unwrap_or(u8::MAX));
                    }
                    _ => return Err(SqlError::UnknownColumn("rules", col)),
                }
            }
            Ok(Command::SelectRules { day_of_week })
        }
        "bookings" => {
            let mut id = None;
            let mut filter = BookingFilter::default();
            for (col, value) in filters {
                match col.as_str() {
                    "id" => id = Some(parse_ulid_expr(value)?),
                    "user_id" => filter.user_id = Some(parse_ulid_expr(value)?),
                    "service_id" => filter.service_id = Some(parse_ulid_expr(value)?),
                    "booking_date" => filter.date = Some(parse_date_expr(value)?),
                    _ => return Err(SqlError::UnknownColumn("bookings", col)),
                }
            }
            Ok(Command::SelectBookings { id, filter })
        }
        "availability" => {
            let (mut service_id, mut date) = (None, None);
            for (col, value) in filters {
                match col.as_str() {
                    "service_id" => service_id = Some(parse_ulid_expr(value)?),
                    "date" | "booking_date" => date = Some(parse_date_expr(value)?),
                    _ => return Err(SqlError::UnknownColumn("availability", col)),
                }
            }
            Ok(Command::SelectAvailability {
                service_id: service_id.ok_or(SqlError::MissingFilter("service_id"))?,
                date: date.ok_or(SqlError::MissingFilter("date"))?,
            })
        }
        "stats" => {
            reject_filters("stats", filters)?;
            Ok(Command::SelectStats)
        }
        "revenue" => {
            reject_filters("revenue", filters)?;
            Ok(Command::SelectRevenue)
        }
        "recent_bookings" => {
            reject_filters("recent_bookings", filters)?;
            Ok(Command::SelectRecentBookings {
                limit: limit.unwrap_or(DEFAULT_RECENT_BOOKINGS),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Report tables take no WHERE clause.
fn reject_filters(table: &'static str, filters: Vec<(String, &Expr)>) -> Result<(), SqlError> {
    match filters.into_iter().next() {
        Some((col, _)) => Err(SqlError::UnknownColumn(table, col)),
        None => Ok(()),
    }
}

/// `LIMIT n`. The parser drops a bare `LIMIT ALL`. OFFSET is not supported.
fn parse_limit(query: &ast::Query) -> Result<Option<usize>, SqlError> {
    match &query.limit_clause {
        None => Ok(None),
        Some(LimitClause::LimitOffset {
            limit,
            offset: None,
            limit_by,
        }) if limit_by.is_empty() => match limit {
            Some(expr) => Ok(Some(parse_u32(expr)? as usize)),
            None => Ok(None),
        },
        Some(other) => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Flatten `a = 1 AND b = 2 ...` into column/value pairs.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(&values.rows)
        }
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

/// Literal value, looking through `'...'::type` casts.
fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        Expr::Cast { expr, .. } | Expr::Nested(expr) => extract_value(expr),
        _ => None,
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string_expr(expr).map(Some),
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

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string_expr(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date '{s}': {e}")))
}

fn parse_time_expr(expr: &Expr) -> Result<TimeOfDay, SqlError> {
    let s = parse_string_expr(expr)?;
    s.parse()
        .map_err(|e| SqlError::Parse(format!("bad time '{s}': {e}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
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

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let v = parse_i64_expr(expr)?;
    u64::try_from(v).map_err(|_| SqlError::Parse(format!("{v} must not be negative")))
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
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl SqlError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::Parse(_) | SqlError::Empty => "42601",
            SqlError::Unsupported(_) => "0A000",
            SqlError::UnknownTable(_) => "42P01",
            SqlError::UnknownColumn(..) => "42703",
            SqlError::WrongArity(..) | SqlError::MissingColumn(..) | SqlError::MissingFilter(_) => {
                "42601"
            }
        }
    }
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
                write!(f, "{t}: expected at most {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing value for {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
