use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SharedPasswordAuthSource;
use crate::engine::{Engine, EngineError};
use crate::limits::MAX_QUERY_PARAMS;
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct SlotwiseHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotwiseQueryParser>,
}

impl SlotwiseHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotwiseQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, engine: &Engine, sql_text: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql_text).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertService {
                id,
                name,
                duration_minutes,
                price_cents,
                description,
            } => {
                engine
                    .create_service(id, name, description, duration_minutes, price_cents)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateService { id, patch } => {
                engine.update_service(id, patch).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteService { id } => {
                engine.deactivate_service(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertRules { rules } => {
                let count = rules.len();
                // Rows are applied one by one; a failing row leaves earlier rows in place.
                for r in rules {
                    engine
                        .add_rule(r.id, r.day_of_week, r.start, r.end, r.is_blocked)
                        .await
                        .map_err(engine_err)?;
                }
                Ok(Response::Execution(Tag::new("INSERT").with_rows(count)))
            }
            Command::DeleteRule { id } => {
                engine.remove_rule(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertBooking {
                id,
                user_id,
                service_id,
                date,
                start,
            } => {
                engine
                    .admit_booking(id, user_id, service_id, date, start, engine.now())
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateBookingStatus { id, status } => {
                engine
                    .set_booking_status(id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::RescheduleBooking { id, date, start } => {
                let date = match date {
                    Some(d) => d,
                    None => {
                        engine
                            .get_booking(&id)
                            .await
                            .ok_or(EngineError::NotFound(id))
                            .map_err(engine_err)?
                            .date
                    }
                };
                engine
                    .reschedule_booking(id, date, start, engine.now())
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteBooking { id } => {
                engine.cancel_booking(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectServices { id, active_only } => {
                let services: Vec<Service> = match id {
                    Some(id) => engine.get_service(&id).await.into_iter().collect(),
                    None => engine.list_services(active_only).await,
                };
                let services = services
                    .into_iter()
                    .filter(|s| !active_only || s.is_active);
                query_response(services_schema(), services, encode_service)
            }
            Command::SelectRules { day_of_week } => {
                let rules = engine
                    .list_rules()
                    .await
                    .into_iter()
                    .filter(|r| day_of_week.is_none_or(|d| r.day_of_week == d));
                query_response(rules_schema(), rules, encode_rule)
            }
            Command::SelectBookings { id, filter } => {
                let bookings: Vec<Booking> = match id {
                    Some(id) => engine.get_booking(&id).await.into_iter().collect(),
                    None => engine.list_bookings(&filter).await,
                };
                query_response(bookings_schema(), bookings, encode_booking)
            }
            Command::SelectAvailability { service_id, date } => {
                let slots = engine
                    .available_slots(service_id, date, engine.now())
                    .await
                    .map_err(engine_err)?;
                let weekday = day_of_week(date);
                query_response(availability_schema(), slots, |enc, slot| {
                    enc.encode_field(&date.to_string())?;
                    enc.encode_field(&i16::from(weekday))?;
                    enc.encode_field(&slot.start_time.to_string())?;
                    enc.encode_field(&slot.end_time.to_string())
                })
            }
            Command::SelectStats => {
                let stats = engine.booking_stats(engine.now()).await;
                query_response(stats_schema(), [stats], encode_stats)
            }
            Command::SelectRevenue => {
                let report = engine.revenue_by_service().await;
                query_response(revenue_schema(), report, encode_revenue)
            }
            Command::SelectRecentBookings { limit } => {
                let recent = engine.recent_bookings(limit).await;
                query_response(recent_bookings_schema(), recent, |enc, d| {
                    let (service_name, price_cents) = (d.service_name, d.price_cents);
                    encode_booking(enc, d.booking)?;
                    enc.encode_field(&service_name)?;
                    enc.encode_field(&(price_cents as i64))
                })
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn services_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("description", Type::VARCHAR),
        text_field("duration_minutes", Type::INT4),
        text_field("price_cents", Type::INT8),
        text_field("is_active", Type::BOOL),
    ]
}

fn rules_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("day_of_week", Type::INT2),
        text_field("start_time", Type::VARCHAR),
        text_field("end_time", Type::VARCHAR),
        text_field("is_blocked", Type::BOOL),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("user_id", Type::VARCHAR),
        text_field("service_id", Type::VARCHAR),
        text_field("booking_date", Type::VARCHAR),
        text_field("start_time", Type::VARCHAR),
        text_field("end_time", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("created_at", Type::VARCHAR),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("date", Type::VARCHAR),
        text_field("day_of_week", Type::INT2),
        text_field("start_time", Type::VARCHAR),
        text_field("end_time", Type::VARCHAR),
    ]
}

fn stats_schema() -> Vec<FieldInfo> {
    [
        "total_services",
        "total_bookings",
        "pending_bookings",
        "confirmed_bookings",
        "cancelled_bookings",
        "total_revenue_cents",
        "bookings_this_month",
        "revenue_this_month_cents",
    ]
    .into_iter()
    .map(|name| text_field(name, Type::INT8))
    .collect()
}

fn revenue_schema() -> Vec<FieldInfo> {
    vec![
        text_field("service_id", Type::VARCHAR),
        text_field("service_name", Type::VARCHAR),
        text_field("confirmed_bookings", Type::INT8),
        text_field("revenue_cents", Type::INT8),
    ]
}

fn recent_bookings_schema() -> Vec<FieldInfo> {
    let mut schema = bookings_schema();
    schema.push(text_field("service_name", Type::VARCHAR));
    schema.push(text_field("price_cents", Type::INT8));
    schema
}

fn encode_service(enc: &mut DataRowEncoder, s: Service) -> PgWireResult<()> {
    enc.encode_field(&s.id.to_string())?;
    enc.encode_field(&s.name)?;
    enc.encode_field(&s.description)?;
    enc.encode_field(&(s.duration_minutes as i32))?;
    enc.encode_field(&(s.price_cents as i64))?;
    enc.encode_field(&s.is_active)
}

fn encode_rule(enc: &mut DataRowEncoder, r: AvailabilityRule) -> PgWireResult<()> {
    enc.encode_field(&r.id.to_string())?;
    enc.encode_field(&i16::from(r.day_of_week))?;
    enc.encode_field(&r.span.start.to_string())?;
    enc.encode_field(&r.span.end.to_string())?;
    enc.encode_field(&r.is_blocked)
}

fn encode_booking(enc: &mut DataRowEncoder, b: Booking) -> PgWireResult<()> {
    enc.encode_field(&b.id.to_string())?;
    enc.encode_field(&b.user_id.to_string())?;
    enc.encode_field(&b.service_id.to_string())?;
    enc.encode_field(&b.date.to_string())?;
    enc.encode_field(&b.span.start.to_string())?;
    enc.encode_field(&b.span.end.to_string())?;
    enc.encode_field(&b.status.to_string())?;
    enc.encode_field(&b.created_at.format("%Y-%m-%d %H:%M:%S").to_string())
}

fn encode_stats(enc: &mut DataRowEncoder, s: BookingStats) -> PgWireResult<()> {
    for n in [
        s.total_services,
        s.total_bookings,
        s.pending_bookings,
        s.confirmed_bookings,
        s.cancelled_bookings,
        s.total_revenue_cents,
        s.bookings_this_month,
        s.revenue_this_month_cents,
    ] {
        enc.encode_field(&(n as i64))?;
    }
    Ok(())
}

fn encode_revenue(enc: &mut DataRowEncoder, r: ServiceRevenue) -> PgWireResult<()> {
    enc.encode_field(&r.service_id.to_string())?;
    enc.encode_field(&r.service_name)?;
    enc.encode_field(&(r.confirmed_bookings as i64))?;
    enc.encode_field(&(r.revenue_cents as i64))
}

fn query_response<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<DataRow>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Result columns for a statement, from its target table. Placeholders make
/// full parsing impossible before binding.
fn schema_for_sql(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.trim_start().starts_with("SELECT") {
        return vec![];
    }
    let Some(from) = upper.find(" FROM ") else {
        return vec![];
    };
    let table = upper[from + 6..]
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_matches(|c| c == '"' || c == ';');
    match table {
        "AVAILABILITY" => availability_schema(),
        "SERVICES" => services_schema(),
        "RULES" => rules_schema(),
        "BOOKINGS" => bookings_schema(),
        "STATS" => stats_schema(),
        "REVENUE" => revenue_schema(),
        "RECENT_BOOKINGS" => recent_bookings_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotwiseHandler {
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
        let engine = self.resolve_engine(client)?;
        Ok(vec![self.run(&engine, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotwiseQueryParser;

#[async_trait]
impl QueryParser for SlotwiseQueryParser {
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
        param_types(stmt)
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
impl ExtendedQueryHandler for SlotwiseHandler {
    type Statement = String;
    type QueryParser = SlotwiseQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        self.run(&engine, &sql).await
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
        Ok(DescribeStatementResponse::new(
            param_types(&target.statement)?,
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

/// `$n` placeholders outside quoted literals, with their byte ranges. `n` saturates.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled '' closes and reopens, which leaves us inside the literal.
            Some(q) => {
                if b == q {
                    quote = None;
                }
                i += 1;
            }
            None if b == b'\'' || b == b'"' => {
                quote = Some(b);
                i += 1;
            }
            None if b == b'$' => {
                let start = i;
                i += 1;
                let digits = i;
                let mut n = 0usize;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    n = n.saturating_mul(10).saturating_add(usize::from(bytes[i] - b'0'));
                    i += 1;
                }
                if i > digits {
                    found.push((start..i, n));
                }
            }
            None => i += 1,
        }
    }
    found
}

/// Highest `$n` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

fn param_types(sql: &str) -> PgWireResult<Vec<Type>> {
    let n = count_params(sql);
    if n > MAX_QUERY_PARAMS {
        return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "54023".into(),
            format!("placeholder ${n} exceeds the limit of {MAX_QUERY_PARAMS} parameters"),
        ))));
    }
    Ok(vec![Type::VARCHAR; n])
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute_text(&portal.statement.statement, &params)
}

/// Single pass over the statement; inserted values are never rescanned.
fn substitute_text(sql: &str, params: &[Option<String>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        out.push_str(&sql[copied..range.start]);
        match param {
            Some(text) => {
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = range.end;
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotwiseFactory {
    handler: Arc<SlotwiseHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SharedPasswordAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotwiseFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SharedPasswordAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotwiseHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotwiseFactory {
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
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = SlotwiseFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}
