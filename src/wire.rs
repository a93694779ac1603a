use std::fmt::Debug;
use std::io;
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
use ulid::Ulid;

use crate::auth::RoomdAuthSource;
use crate::engine::EngineError;
use crate::lifecycle::{BookingRequest, BookingService};
use crate::model::*;
use crate::observability::{self, command_label};
use crate::sql::{self, Command, SqlError};

pub struct RoomdHandler {
    service: Arc<BookingService>,
    query_parser: Arc<RoomdQueryParser>,
}

impl RoomdHandler {
    pub fn new(service: Arc<BookingService>) -> Self {
        Self {
            service,
            query_parser: Arc::new(RoomdQueryParser),
        }
    }

    async fn execute(&self, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();

        let result = self.execute_command(cmd).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::debug!(command = label, error = %e, "query failed");
        }

        result.map_err(engine_err)
    }

    async fn execute_command(&self, cmd: Command) -> Result<Response, EngineError> {
        let service = &self.service;
        match cmd {
            Command::InsertBooking {
                id,
                location_id,
                user_id,
                start,
                end,
                purpose,
                attendees,
                contact,
            } => {
                let request = BookingRequest {
                    id: id.unwrap_or_else(Ulid::new),
                    location_id,
                    user_id,
                    starts_at: start,
                    ends_at: end,
                    purpose,
                    attendees: attendees.unwrap_or(DEFAULT_ATTENDEES),
                    contact,
                };
                service.create_booking(request).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::ApproveBooking { booking_id, admin_id } => {
                service.approve_booking(booking_id, admin_id).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::RejectBooking {
                booking_id,
                admin_id,
                reason,
            } => {
                service.reject_booking(booking_id, admin_id, reason).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::CancelBooking { booking_id, user_id } => {
                service.cancel_booking(booking_id, user_id).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectAvailability {
                location_id,
                start,
                end,
            } => {
                let result = service.check_availability(location_id, start, end).await?;
                Ok(slot_rows(location_id, &result.available_slots))
            }
            Command::SelectConflicts {
                location_id,
                start,
                end,
            } => {
                let result = service.check_availability(location_id, start, end).await?;
                let schema = Arc::new(conflicts_schema());
                let rows = result
                    .conflicting_bookings
                    .iter()
                    .map(|c| encode_conflict(&schema, c))
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectBookings {
                location_id,
                start,
                end,
            } => {
                let bookings = service
                    .list_bookings_for_location(location_id, start, end)
                    .await?;
                Ok(booking_rows(&bookings))
            }
            Command::SelectBooking { id } => {
                let booking = service.get_booking(id).await?;
                Ok(booking_rows(std::slice::from_ref(&booking)))
            }
            Command::SelectBookingsByStatus { status } => {
                Ok(booking_rows(&service.bookings_by_status(status).await))
            }
            Command::SelectUserBookings { user_id } => {
                Ok(booking_rows(&service.bookings_for_user(user_id).await))
            }
            Command::SelectDaySlots { location_id, day } => {
                let slots = service.day_slots(location_id, day).await?;
                Ok(slot_rows(location_id, &slots))
            }
            Command::SelectResourceTypes { user_id } => {
                let schema = Arc::new(resource_types_schema());
                let rows = service
                    .available_resource_types(user_id)
                    .into_iter()
                    .map(|rt| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&rt.as_str().to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
        }
    }
}

// ── Row shapes ───────────────────────────────────────────────────

fn varchar(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![varchar("location_id"), int8("start"), int8("end")]
}

fn conflicts_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        int8("start"),
        int8("end"),
        varchar("status"),
        varchar("purpose"),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        varchar("location_id"),
        varchar("user_id"),
        int8("start"),
        int8("end"),
        varchar("purpose"),
        int8("attendees"),
        varchar("contact"),
        varchar("status"),
        int8("created_at"),
        varchar("resolved_by"),
        int8("resolved_at"),
        varchar("rejection_reason"),
        varchar("cancelled_by"),
        int8("cancelled_at"),
    ]
}

fn resource_types_schema() -> Vec<FieldInfo> {
    vec![varchar("resource_type")]
}

/// Row shape of a SELECT against one of the virtual tables.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    match sql::select_table(sql).as_deref() {
        Some("availability" | "slots") => slots_schema(),
        Some("conflicts") => conflicts_schema(),
        Some("bookings") => bookings_schema(),
        Some("resource_types") => resource_types_schema(),
        _ => vec![],
    }
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn slot_rows(location_id: Ulid, slots: &[Span]) -> Response {
    let schema = Arc::new(slots_schema());
    let lid = location_id.to_string();
    let rows = slots
        .iter()
        .map(|slot| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&lid)?;
            encoder.encode_field(&slot.start)?;
            encoder.encode_field(&slot.end)?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(schema, rows)
}

fn encode_conflict(schema: &Arc<Vec<FieldInfo>>, c: &ConflictingBooking) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&c.id.to_string())?;
    encoder.encode_field(&c.span.start)?;
    encoder.encode_field(&c.span.end)?;
    encoder.encode_field(&c.status.as_str().to_string())?;
    encoder.encode_field(&c.purpose)?;
    Ok(encoder.take_row())
}

fn booking_rows(bookings: &[Booking]) -> Response {
    let schema = Arc::new(bookings_schema());
    let rows = bookings
        .iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.location_id.to_string())?;
            encoder.encode_field(&b.created_by.to_string())?;
            encoder.encode_field(&b.span.start)?;
            encoder.encode_field(&b.span.end)?;
            encoder.encode_field(&b.purpose)?;
            encoder.encode_field(&i64::from(b.attendees))?;
            encoder.encode_field(&b.contact)?;
            encoder.encode_field(&b.status.as_str().to_string())?;
            encoder.encode_field(&b.created_at)?;
            encoder.encode_field(&b.resolved_by.map(|u| u.to_string()))?;
            encoder.encode_field(&b.resolved_at)?;
            encoder.encode_field(&b.rejection_reason)?;
            encoder.encode_field(&b.cancelled_by.map(|u| u.to_string()))?;
            encoder.encode_field(&b.cancelled_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(schema, rows)
}

#[async_trait]
impl SimpleQueryHandler for RoomdHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.execute(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoomdQueryParser;

#[async_trait]
impl QueryParser for RoomdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for RoomdHandler {
    type Statement = String;
    type QueryParser = RoomdQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.execute(&sql).await
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
        Ok(DescribeStatementResponse::new(param_types, schema_for(&target.statement)))
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
        Ok(DescribePortalResponse::new(schema_for(&target.statement.statement)))
    }
}

/// `$N` placeholders outside string literals, as (byte range, N).
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            // A doubled quote inside a literal toggles twice and stays inside.
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start..i, n));
                }
            }
            _ => i += 1,
        }
    }
    found
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Replace `$1`, `$2`, ... with bound text parameters as quoted literals.
/// One pass over the original text: substituted values are never rescanned.
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        result.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = range.end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RoomdFactory {
    handler: Arc<RoomdHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<RoomdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RoomdFactory {
    pub fn new(service: Arc<BookingService>, password: String) -> Self {
        let auth_source = RoomdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RoomdHandler::new(service)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoomdFactory {
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

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    service: Arc<BookingService>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(RoomdFactory::new(service, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::Forbidden(_) => "42501",
        EngineError::Conflict(_) => "23P01",
        EngineError::NotFound(..) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::AlreadyResolved { .. } => "55000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Busy(_) => "40001",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM bookings WHERE id = $1"), 1);
        assert_eq!(count_params("INSERT INTO rejections VALUES ($2, $1, $3)"), 3);
        assert_eq!(count_params("SELECT * FROM bookings WHERE status = 'pending'"), 0);
    }

    #[test]
    fn substitutes_text_params() {
        let sql = "INSERT INTO rejections VALUES ($1, $2, $3)";
        let params = vec![
            Some("a".as_bytes()),
            Some("it's full".as_bytes()),
            None,
        ];
        assert_eq!(
            substitute_params(sql, &params),
            "INSERT INTO rejections VALUES ('a', 'it''s full', NULL)"
        );
    }

    #[test]
    fn tenth_placeholder_not_clobbered() {
        let sql = "$1 $10";
        let params: Vec<_> = (1..=10)
            .map(|i| Some(i.to_string().into_bytes()))
            .collect();
        assert_eq!(substitute_params(sql, &params), "'1' '10'");
    }

    #[test]
    fn substituted_values_are_not_rescanned() {
        let sql = "INSERT INTO bookings (location_id, purpose) VALUES ($1, $2)";
        let params = vec![Some("LOC".as_bytes()), Some("pay $1 fee 'now'".as_bytes())];
        assert_eq!(
            substitute_params(sql, &params),
            "INSERT INTO bookings (location_id, purpose) VALUES ('LOC', 'pay $1 fee ''now''')"
        );

        // A value that looks like a later placeholder stays literal too.
        let params = vec![Some("$2".as_bytes()), Some("x') OR ('1'='1".as_bytes())];
        assert_eq!(
            substitute_params("SELECT $1, $2", &params),
            "SELECT '$2', 'x'') OR (''1''=''1'"
        );
    }

    #[test]
    fn placeholders_inside_literals_are_text() {
        let sql = "SELECT * FROM bookings WHERE purpose = 'costs $1' AND id = $1";
        assert_eq!(count_params(sql), 1);
        assert_eq!(
            substitute_params(sql, &[Some("B".as_bytes())]),
            "SELECT * FROM bookings WHERE purpose = 'costs $1' AND id = 'B'"
        );
        assert_eq!(count_params("SELECT 'it''s $3', $2"), 2);
    }

    #[test]
    fn unbound_placeholder_left_alone() {
        assert_eq!(substitute_params("SELECT $1, $2", &[Some("a".as_bytes())]), "SELECT 'a', $2");
        assert_eq!(substitute_params::<&[u8]>("SELECT $0, $", &[]), "SELECT $0, $");
    }

    #[test]
    fn every_error_has_its_own_sqlstate() {
        let id = Ulid::nil();
        let errors = [
            EngineError::Validation("x".into()),
            EngineError::Forbidden("x".into()),
            EngineError::Conflict(vec![]),
            EngineError::NotFound("booking", id),
            EngineError::AlreadyExists(id),
            EngineError::AlreadyResolved { id, status: BookingStatus::Approved },
            EngineError::LimitExceeded("x"),
            EngineError::Busy(id),
            EngineError::WalError("x".into()),
        ];
        let codes: std::collections::HashSet<_> = errors.iter().map(sqlstate).collect();
        assert_eq!(codes.len(), errors.len());
        assert_eq!(sqlstate(&EngineError::Conflict(vec![])), "23P01");
    }

    #[test]
    fn schema_follows_table() {
        let names = |sql: &str| -> Vec<String> {
            schema_for(sql).iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(names("SELECT * FROM slots WHERE location_id = $1 AND day = $2"), ["location_id", "start", "end"]);
        assert_eq!(names("SELECT * FROM conflicts")[0], "id");
        assert_eq!(names("SELECT * FROM bookings WHERE id = $1").len(), 15);
        assert_eq!(names("SELECT * FROM bookings WHERE status = $1")[6..8], ["attendees", "contact"]);
        assert!(names("INSERT INTO approvals VALUES ($1, $2)").is_empty());
    }
}
