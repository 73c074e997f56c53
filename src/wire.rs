use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, warn};

use crate::auth::TabletimeAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::notify::{Notification, NotifyHub};
use crate::observability;
use crate::sql::{self, Command};

/// Query handler for one client connection. Owns that connection's LISTEN
/// subscriptions.
pub struct TabletimeHandler {
    engine: Arc<Engine>,
    hub: Arc<NotifyHub>,
    query_parser: Arc<TabletimeQueryParser>,
    subscriptions: Mutex<HashMap<String, broadcast::Receiver<Notification>>>,
}

impl TabletimeHandler {
    pub fn new(engine: Arc<Engine>, hub: Arc<NotifyHub>) -> Self {
        Self {
            engine,
            hub,
            query_parser: Arc::new(TabletimeQueryParser),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    fn with_subscriptions<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, broadcast::Receiver<Notification>>) -> R,
    ) -> R {
        let mut subs = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut subs)
    }

    /// Everything published on this connection's channels since the last call.
    fn take_pending(&self) -> Vec<Notification> {
        self.with_subscriptions(|subs| {
            let mut pending = Vec::new();
            for (channel, rx) in subs.iter_mut() {
                loop {
                    match rx.try_recv() {
                        Ok(n) => pending.push(n),
                        Err(TryRecvError::Lagged(skipped)) => {
                            warn!(%channel, skipped, "listener lagged, notifications dropped");
                        }
                        Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                    }
                }
            }
            pending
        })
    }

    async fn deliver_pending<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        for n in self.take_pending() {
            client
                .feed(PgWireBackendMessage::NotificationResponse(
                    NotificationResponse::new(0, n.channel, n.payload),
                ))
                .await?;
        }
        Ok(())
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = std::time::Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertRoom {
                id,
                name,
                room_type,
                capacity,
            } => {
                engine
                    .create_room(id, name, room_type, capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::InsertCampaign { spec } => {
                engine.create_campaign(spec).await.map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::InsertCampaignRoom {
                campaign_id,
                room_id,
            } => {
                engine
                    .assign_room(campaign_id, room_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::InsertFacilitator { id, name } => {
                engine
                    .create_facilitator(id, name)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::InsertCampaignFacilitator {
                campaign_id,
                facilitator_id,
            } => {
                engine
                    .assign_facilitator(facilitator_id, campaign_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::InsertUser { id, name } => {
                engine.register_user(id, name).await.map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::DeleteCampaign { id } => {
                engine.deactivate_campaign(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertBooking {
                id,
                user_id,
                campaign_id,
                start,
                players_count,
            } => {
                engine
                    .create_booking(id, user_id, campaign_id, start, players_count)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::DeleteBooking { id, user_id } => {
                engine.cancel_booking(id, user_id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectAvailableTimes {
                campaign_id,
                date,
                room_type,
            } => {
                let room_type = match room_type {
                    Some(t) => t,
                    None => self.default_room_type(&campaign_id)?,
                };
                let times = engine
                    .list_available_times(&campaign_id, date, room_type)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(available_times_schema());
                let rows: Vec<PgWireResult<_>> = times
                    .into_iter()
                    .map(|t| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&format_timestamp(t.start))?;
                        encoder.encode_field(&format_timestamp(t.end))?;
                        encoder.encode_field(&(t.current_players as i32))?;
                        encoder.encode_field(&(t.available_seats as i32))?;
                        encoder.encode_field(&t.available)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectUserBookings { user_id } => {
                let bookings = engine
                    .list_user_bookings(&user_id)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(bookings_schema());
                let rows: Vec<PgWireResult<_>> = bookings
                    .into_iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.user_id.to_string())?;
                        encoder.encode_field(&b.campaign_id.to_string())?;
                        encoder.encode_field(&b.campaign_title)?;
                        encoder.encode_field(&b.slot_id.to_string())?;
                        encoder.encode_field(&format_timestamp(b.start))?;
                        encoder.encode_field(&format_timestamp(b.end))?;
                        encoder.encode_field(&(b.players_count as i32))?;
                        encoder.encode_field(&format_timestamp(b.created_at))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectSlots { campaign_id } => {
                let slots = engine.list_slots(&campaign_id).await.map_err(engine_err)?;

                let schema = Arc::new(slots_schema());
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.campaign_id.to_string())?;
                        encoder.encode_field(&format_timestamp(s.start))?;
                        encoder.encode_field(&format_timestamp(s.end))?;
                        encoder.encode_field(&(s.current_players as i32))?;
                        encoder.encode_field(&(s.available_seats as i32))?;
                        encoder.encode_field(&(s.booking_count as i32))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectCampaigns => {
                let campaigns = engine.list_campaigns();

                let schema = Arc::new(campaigns_schema());
                let rows: Vec<PgWireResult<_>> = campaigns
                    .into_iter()
                    .map(|c| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&c.id.to_string())?;
                        encoder.encode_field(&c.title)?;
                        encoder.encode_field(&c.description)?;
                        encoder.encode_field(&(c.level as i32))?;
                        encoder.encode_field(&(c.max_players as i32))?;
                        encoder.encode_field(&c.duration_hours)?;
                        encoder.encode_field(&c.working_hours_start.format("%H:%M").to_string())?;
                        encoder.encode_field(&c.working_hours_end.format("%H:%M").to_string())?;
                        encoder.encode_field(&(c.price_cents as i64))?;
                        encoder.encode_field(&c.is_active)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectRooms => {
                let rooms = engine.list_rooms();

                let schema = Arc::new(rooms_schema());
                let rows: Vec<PgWireResult<_>> = rooms
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.name)?;
                        encoder.encode_field(&r.room_type.as_str().to_string())?;
                        encoder.encode_field(&r.capacity.map(|c| c as i32))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::Listen { channel } => {
                let rx = self.hub.subscribe(&channel);
                debug!(%channel, "listening");
                self.with_subscriptions(|subs| subs.insert(channel, rx));
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                self.with_subscriptions(|subs| subs.remove(&channel));
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::UnlistenAll => {
                self.with_subscriptions(|subs| subs.clear());
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }

    /// Room type of the campaign's first room, physical if it has none.
    fn default_room_type(&self, campaign_id: &ulid::Ulid) -> PgWireResult<RoomType> {
        let campaign = self.engine.get_campaign(campaign_id).map_err(engine_err)?;
        Ok(campaign
            .room_ids
            .iter()
            .find_map(|id| self.engine.get_room(id).ok())
            .map_or(RoomType::Physical, |room| room.room_type))
    }
}

fn insert_tag(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn available_times_schema() -> Vec<FieldInfo> {
    vec![
        text_field("start_time", Type::VARCHAR),
        text_field("end_time", Type::VARCHAR),
        text_field("current_players", Type::INT4),
        text_field("available_seats", Type::INT4),
        text_field("available", Type::BOOL),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("user_id", Type::VARCHAR),
        text_field("campaign_id", Type::VARCHAR),
        text_field("campaign_title", Type::VARCHAR),
        text_field("slot_id", Type::VARCHAR),
        text_field("start_time", Type::VARCHAR),
        text_field("end_time", Type::VARCHAR),
        text_field("players_count", Type::INT4),
        text_field("created_at", Type::VARCHAR),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("campaign_id", Type::VARCHAR),
        text_field("start_time", Type::VARCHAR),
        text_field("end_time", Type::VARCHAR),
        text_field("current_players", Type::INT4),
        text_field("available_seats", Type::INT4),
        text_field("booking_count", Type::INT4),
    ]
}

fn campaigns_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("title", Type::VARCHAR),
        text_field("description", Type::VARCHAR),
        text_field("level", Type::INT4),
        text_field("max_players", Type::INT4),
        text_field("duration_hours", Type::FLOAT8),
        text_field("working_hours_start", Type::VARCHAR),
        text_field("working_hours_end", Type::VARCHAR),
        text_field("price_cents", Type::INT8),
        text_field("is_active", Type::BOOL),
    ]
}

fn rooms_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("type", Type::VARCHAR),
        text_field("capacity", Type::INT4),
    ]
}

/// Result columns for a statement, decided from its text so Describe works
/// before parameters are bound.
fn result_schema(stmt: &str) -> Vec<FieldInfo> {
    let upper = stmt.to_uppercase();
    if !upper.trim_start().starts_with("SELECT") {
        return vec![];
    }
    if upper.contains("AVAILABLE_TIMES") {
        available_times_schema()
    } else if upper.contains("BOOKINGS") {
        bookings_schema()
    } else if upper.contains("SLOTS") {
        slots_schema()
    } else if upper.contains("CAMPAIGNS") {
        campaigns_schema()
    } else if upper.contains("ROOMS") {
        rooms_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for TabletimeHandler {
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
        self.deliver_pending(client).await?;
        let statements = sql::split_statements(query);
        if statements.is_empty() {
            return Ok(vec![Response::EmptyQuery]);
        }
        let mut responses = Vec::with_capacity(statements.len());
        for statement in statements {
            responses.extend(self.run(statement).await?);
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct TabletimeQueryParser;

#[async_trait]
impl QueryParser for TabletimeQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for TabletimeHandler {
    type Statement = String;
    type QueryParser = TabletimeQueryParser;

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
        self.deliver_pending(client).await?;
        let sql = substitute_params(portal);
        let mut responses = self.run(&sql).await?;
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
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text-format parameters as quoted literals. Substitutes from
/// the highest index down so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct TabletimeFactory {
    handler: Arc<TabletimeHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<TabletimeAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl TabletimeFactory {
    pub fn new(engine: Arc<Engine>, hub: Arc<NotifyHub>, password: String) -> Self {
        let auth_source = TabletimeAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(TabletimeHandler::new(engine, hub)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for TabletimeFactory {
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

/// Serve one client socket until it disconnects. Each connection gets its own
/// handler so LISTEN state is never shared.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    hub: Arc<NotifyHub>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = TabletimeFactory::new(engine, hub, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound { .. } => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Validation(_) | EngineError::PastTime(_) => "22023",
        EngineError::Capacity { .. } => "53400",
        EngineError::Conflict(_) => "23P01",
        EngineError::Unauthorized { .. } => "42501",
        EngineError::StateConflict(_) => "40001",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn count_params_finds_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM campaigns"), 0);
        assert_eq!(count_params("INSERT INTO users VALUES ($1, $2)"), 2);
        assert_eq!(count_params("DELETE FROM bookings WHERE user_id = $2 AND id = $1"), 2);
        assert_eq!(count_params("SELECT $ FROM x WHERE a = $12"), 12);
    }

    #[test]
    fn result_schema_by_table() {
        let names = |s: &str| -> usize { result_schema(s).len() };
        assert_eq!(names("SELECT * FROM available_times WHERE campaign_id = $1"), 5);
        assert_eq!(names("select * from bookings where user_id = $1"), 9);
        assert_eq!(names("SELECT * FROM slots WHERE campaign_id = $1"), 7);
        assert_eq!(names("SELECT * FROM campaigns"), 10);
        assert_eq!(names("SELECT * FROM rooms"), 4);
        assert_eq!(names("INSERT INTO bookings VALUES ($1, $2, $3, $4, $5)"), 0);
    }

    #[test]
    fn engine_errors_map_to_sqlstate() {
        let id = Ulid::new();
        assert_eq!(sqlstate(&EngineError::not_found("booking", id)), "P0002");
        assert_eq!(sqlstate(&EngineError::AlreadyExists(id)), "23505");
        assert_eq!(sqlstate(&EngineError::Validation("x".into())), "22023");
        assert_eq!(sqlstate(&EngineError::PastTime(0)), "22023");
        assert_eq!(
            sqlstate(&EngineError::Capacity {
                requested: 3,
                available: 1
            }),
            "53400"
        );
        assert_eq!(sqlstate(&EngineError::Conflict("x".into())), "23P01");
        assert_eq!(
            sqlstate(&EngineError::Unauthorized {
                booking: id,
                user: id
            }),
            "42501"
        );
        assert_eq!(sqlstate(&EngineError::StateConflict("x".into())), "40001");
        assert_eq!(sqlstate(&EngineError::LimitExceeded("x")), "54000");
    }
}
