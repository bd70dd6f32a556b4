use std::fmt::Debug;
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
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::ParkdAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

/// Serve one client connection over the Postgres wire protocol.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> Result<(), std::io::Error> {
    let factory = ParkdFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

pub struct ParkdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<ParkdQueryParser>,
}

impl ParkdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(ParkdQueryParser),
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

    async fn dispatch(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
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

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertSpot {
                id,
                owner_id,
                name,
                total_slots,
                price_cents,
                lat,
                lon,
            } => {
                engine
                    .create_spot(id, owner_id, name, total_slots, price_cents, lat, lon)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateSpot {
                id,
                owner_id,
                name,
                total_slots,
                price_cents,
                active,
            } => {
                engine
                    .update_spot(id, owner_id, name, total_slots, price_cents, active)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeactivateSpot { id, owner_id } => {
                engine.deactivate_spot(id, owner_id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertBlock {
                id,
                spot_id,
                owner_id,
                start,
                end,
                status,
                slots_open,
                reason,
            } => {
                engine
                    .add_block(id, spot_id, owner_id, Span { start, end }, status, slots_open, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateBlock {
                id,
                owner_id,
                start,
                end,
                status,
                slots_open,
                reason,
            } => {
                engine
                    .update_block(id, owner_id, Span { start, end }, status, slots_open, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteBlock { id, owner_id } => {
                engine.remove_block(id, owner_id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertBooking {
                id,
                spot_id,
                guest_id,
                vehicle_id,
                start,
                end,
                returning,
            } => {
                let booking = engine
                    .reserve(id, spot_id, guest_id, vehicle_id, Span { start, end })
                    .await
                    .map_err(engine_err)?;
                if returning {
                    let schema = Arc::new(booking_issued_schema());
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&booking.id.to_string())?;
                    encoder.encode_field(&booking.qr_code)?;
                    encoder.encode_field(&format!("{:04}", booking.pin))?;
                    encoder.encode_field(&booking.total_cost_cents)?;
                    encoder.encode_field(&booking.pay_deadline)?;
                    let rows = vec![Ok(encoder.take_row())];
                    Ok(vec![Response::Query(QueryResponse::new(
                        schema,
                        stream::iter(rows),
                    ))])
                } else {
                    Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
                }
            }
            Command::SetPaymentStatus { id, owner_id, verified } => {
                if verified {
                    engine.verify_payment(id, owner_id).await.map_err(engine_err)?;
                } else {
                    engine.reject_payment(id, owner_id).await.map_err(engine_err)?;
                }
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::CompleteBooking { id } => {
                engine.complete_booking(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::CancelBooking { id, actor } => {
                engine.cancel_booking(id, actor).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectSpots => {
                let schema = Arc::new(spots_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_spots()
                    .into_iter()
                    .map(|spot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&spot.id.to_string())?;
                        encoder.encode_field(&spot.owner_id.to_string())?;
                        encoder.encode_field(&spot.name)?;
                        encoder.encode_field(&(spot.total_slots as i64))?;
                        encoder.encode_field(&spot.price_cents_per_hour)?;
                        encoder.encode_field(&spot.lat)?;
                        encoder.encode_field(&spot.lon)?;
                        encoder.encode_field(&spot.active)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectBlocks { spot_id } => {
                let blocks = engine.get_blocks(spot_id).await.map_err(engine_err)?;
                let schema = Arc::new(blocks_schema());
                let rows: Vec<PgWireResult<_>> = blocks
                    .into_iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.spot_id.to_string())?;
                        encoder.encode_field(&b.start)?;
                        encoder.encode_field(&b.end)?;
                        encoder.encode_field(&b.status.as_str())?;
                        encoder.encode_field(&(b.slots_open as i64))?;
                        encoder.encode_field(&b.reason)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectBookings { spot_id } => {
                let bookings = engine.get_bookings(spot_id).await.map_err(engine_err)?;
                let schema = Arc::new(bookings_schema());
                let rows: Vec<PgWireResult<_>> = bookings
                    .into_iter()
                    .map(|b| encode_booking_row(&schema, &b))
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectAvailability { spot_id, start, end } => {
                let info = engine
                    .check_availability(spot_id, start, end)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&info.spot_id.to_string())?;
                encoder.encode_field(&(info.total_slots as i64))?;
                encoder.encode_field(&(info.occupied as i64))?;
                encoder.encode_field(&(info.free as i64))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectWindows {
                spot_id,
                start,
                end,
                min_slots,
                min_duration,
            } => {
                let windows = engine
                    .compute_free_windows(spot_id, start, end, min_slots.unwrap_or(1), min_duration)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(windows_schema());
                let sid = spot_id.to_string();
                let rows: Vec<PgWireResult<_>> = windows
                    .into_iter()
                    .map(|w| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&sid)?;
                        encoder.encode_field(&w.start)?;
                        encoder.encode_field(&w.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectEntry { spot_id, code } => {
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap()
                    .as_millis() as Ms;
                let booking = engine
                    .validate_entry(spot_id, &code, now)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(bookings_schema());
                let rows = vec![encode_booking_row(&schema, &booking)];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
        }
    }
}

// ── Row schemas ──────────────────────────────────────────────────

fn varchar(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn float8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::FLOAT8, FieldFormat::Text)
}

fn boolean(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::BOOL, FieldFormat::Text)
}

fn spots_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        varchar("owner_id"),
        varchar("name"),
        int8("total_slots"),
        int8("price_cents"),
        float8("lat"),
        float8("lon"),
        boolean("active"),
    ]
}

fn blocks_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        varchar("spot_id"),
        int8("start"),
        int8("end"),
        varchar("status"),
        int8("slots_open"),
        varchar("reason"),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        varchar("spot_id"),
        varchar("guest_id"),
        varchar("vehicle_id"),
        int8("start"),
        int8("end"),
        int8("total_cost_cents"),
        varchar("status"),
        varchar("payment_status"),
        varchar("qr_code"),
        varchar("pin"),
        int8("pay_deadline"),
    ]
}

fn booking_issued_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        varchar("qr_code"),
        varchar("pin"),
        int8("total_cost_cents"),
        int8("pay_deadline"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        varchar("spot_id"),
        int8("total_slots"),
        int8("occupied"),
        int8("free"),
    ]
}

fn windows_schema() -> Vec<FieldInfo> {
    vec![varchar("spot_id"), int8("start"), int8("end")]
}

fn encode_booking_row(
    schema: &Arc<Vec<FieldInfo>>,
    b: &BookingInfo,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.spot_id.to_string())?;
    encoder.encode_field(&b.guest_id.to_string())?;
    encoder.encode_field(&b.vehicle_id.to_string())?;
    encoder.encode_field(&b.start)?;
    encoder.encode_field(&b.end)?;
    encoder.encode_field(&b.total_cost_cents)?;
    encoder.encode_field(&b.status.as_str())?;
    encoder.encode_field(&b.payment.as_str())?;
    encoder.encode_field(&b.qr_code)?;
    encoder.encode_field(&format!("{:04}", b.pin))?;
    encoder.encode_field(&b.pay_deadline)?;
    Ok(encoder.take_row())
}

/// Result schema inferred from the raw statement text, for Describe.
fn schema_for_statement(sql_upper: &str) -> Vec<FieldInfo> {
    if sql_upper.contains("FROM AVAILABILITY") {
        availability_schema()
    } else if sql_upper.contains("FROM WINDOWS") {
        windows_schema()
    } else if sql_upper.contains("FROM ENTRY") {
        bookings_schema()
    } else if sql_upper.contains("FROM SPOTS") {
        spots_schema()
    } else if sql_upper.contains("FROM BLOCKS") {
        blocks_schema()
    } else if sql_upper.contains("FROM BOOKINGS") {
        bookings_schema()
    } else if sql_upper.contains("INTO BOOKINGS") && sql_upper.contains("RETURNING") {
        booking_issued_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for ParkdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.dispatch(&engine, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ParkdQueryParser;

#[async_trait]
impl QueryParser for ParkdQueryParser {
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
        Ok(schema_for_statement(&stmt.to_uppercase()))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ParkdHandler {
    type Statement = String;
    type QueryParser = ParkdQueryParser;

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
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.dispatch(&engine, cmd).await?;
        Ok(responses.remove(0))
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
        let schema = schema_for_statement(&target.statement.to_uppercase());
        Ok(DescribeStatementResponse::new(param_types, schema))
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
        let schema = schema_for_statement(&target.statement.statement.to_uppercase());
        Ok(DescribePortalResponse::new(schema))
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
                    if n > max {
                        max = n;
                    }
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
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }

    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ParkdFactory {
    handler: Arc<ParkdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<ParkdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ParkdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = ParkdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ParkdHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ParkdFactory {
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

// ── Error mapping ────────────────────────────────────────────────

fn engine_err(e: EngineError) -> PgWireError {
    let (code, message) = match &e {
        EngineError::Validation(_) | EngineError::LimitExceeded(_) => {
            ("22023".to_string(), e.to_string())
        }
        EngineError::NotFound(_) => ("P0002".to_string(), e.to_string()),
        // Retry wording shown on the booking page.
        EngineError::Conflict { .. } => ("40001".to_string(), format!("{e}, please adjust")),
        EngineError::Unauthorized(_) => ("42501".to_string(), e.to_string()),
        // A malformed code and another spot's code read identically:
        // never leak whether a booking exists.
        EngineError::InvalidCode => ("P0001".to_string(), "invalid or expired code".to_string()),
        _ => ("P0001".to_string(), e.to_string()),
    };
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code, message)))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
