use std::collections::HashMap;

use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;
use crate::notify::BOOKINGS_CHANNEL;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRoom {
        id: Ulid,
        name: String,
        room_type: RoomType,
        capacity: Option<u32>,
    },
    InsertCampaign {
        spec: CampaignSpec,
    },
    InsertCampaignRoom {
        campaign_id: Ulid,
        room_id: Ulid,
    },
    InsertFacilitator {
        id: Ulid,
        name: String,
    },
    InsertCampaignFacilitator {
        campaign_id: Ulid,
        facilitator_id: Ulid,
    },
    InsertUser {
        id: Ulid,
        name: String,
    },
    DeleteCampaign {
        id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        user_id: Ulid,
        campaign_id: Ulid,
        start: Ms,
        players_count: u32,
    },
    DeleteBooking {
        id: Ulid,
        user_id: Ulid,
    },
    SelectAvailableTimes {
        campaign_id: Ulid,
        date: NaiveDate,
        room_type: Option<RoomType>,
    },
    SelectUserBookings {
        user_id: Ulid,
    },
    SelectSlots {
        campaign_id: Ulid,
    },
    SelectCampaigns,
    SelectRooms,
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

// Column order used when an INSERT omits its column list.
const ROOM_COLUMNS: &[&str] = &["id", "name", "type", "capacity"];
const CAMPAIGN_COLUMNS: &[&str] = &[
    "id",
    "title",
    "level",
    "max_players",
    "duration_hours",
    "working_hours_start",
    "working_hours_end",
    "description",
    "price_cents",
];
const CAMPAIGN_ROOM_COLUMNS: &[&str] = &["campaign_id", "room_id"];
const FACILITATOR_COLUMNS: &[&str] = &["id", "name"];
const CAMPAIGN_FACILITATOR_COLUMNS: &[&str] = &["campaign_id", "facilitator_id"];
const USER_COLUMNS: &[&str] = &["id", "name"];
const BOOKING_COLUMNS: &[&str] = &["id", "user_id", "campaign_id", "start_time", "players_count"];

/// Split a simple-query string into statements on `;` outside quotes.
/// Blank statements are dropped.
pub fn split_statements(sql: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut quote: Option<u8> = None;
    let mut start = 0;
    for (i, b) in sql.bytes().enumerate() {
        match (quote, b) {
            (None, b'\'' | b'"') => quote = Some(b),
            (Some(q), _) if q == b => quote = None,
            (None, b';') => {
                out.push(&sql[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&sql[start..]);
    out.retain(|s| !s.trim().is_empty());
    out
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if let Some(rest) = strip_keyword(trimmed, "LISTEN ") {
        let channel = channel_name(rest);
        validate_channel(&channel)?;
        return Ok(Command::Listen { channel });
    }
    if let Some(rest) = strip_keyword(trimmed, "UNLISTEN ") {
        let channel = channel_name(rest);
        if channel == "*" {
            return Ok(Command::UnlistenAll);
        }
        return Ok(Command::Unlisten { channel });
    }

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

fn strip_keyword<'a>(sql: &'a str, keyword: &str) -> Option<&'a str> {
    let head = sql.get(..keyword.len())?;
    head.eq_ignore_ascii_case(keyword).then(|| &sql[keyword.len()..])
}

fn channel_name(rest: &str) -> String {
    rest.trim().trim_end_matches(';').trim().trim_matches('"').to_string()
}

fn validate_channel(channel: &str) -> Result<(), SqlError> {
    if channel == BOOKINGS_CHANNEL {
        return Ok(());
    }
    let id = channel.strip_prefix("campaign_").ok_or_else(|| {
        SqlError::Parse(format!(
            "invalid channel: {channel} (expected {BOOKINGS_CHANNEL} or campaign_{{id}})"
        ))
    })?;
    Ulid::from_string(id).map_err(|e| SqlError::Parse(format!("bad ULID in channel: {e}")))?;
    Ok(())
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "rooms" => {
            let row = insert_row(insert, "rooms", ROOM_COLUMNS)?;
            let type_expr = row.optional("type").or(row.optional("room_type"));
            let room_type = match type_expr {
                Some(expr) => parse_string(expr)?
                    .parse::<RoomType>()
                    .map_err(|e| SqlError::Parse(e.to_string()))?,
                None => return Err(SqlError::MissingColumn("rooms", "type")),
            };
            Ok(Command::InsertRoom {
                id: parse_ulid(row.required("id")?)?,
                name: parse_string(row.required("name")?)?,
                room_type,
                capacity: row.optional("capacity").map(parse_u32).transpose()?,
            })
        }
        "campaigns" => {
            let row = insert_row(insert, "campaigns", CAMPAIGN_COLUMNS)?;
            let level = parse_u32(row.required("level")?)?;
            let spec = CampaignSpec {
                id: parse_ulid(row.required("id")?)?,
                title: parse_string(row.required("title")?)?,
                description: row.optional("description").map(parse_string).transpose()?,
                price_cents: row.optional("price_cents").map(parse_u32).transpose()?.unwrap_or(0),
                level: u8::try_from(level).map_err(|_| SqlError::Parse(format!("level {level} out of range")))?,
                max_players: parse_u32(row.required("max_players")?)?,
                duration_hours: row.optional("duration_hours").map(parse_f64).transpose()?,
                working_hours_start: parse_time(row.required("working_hours_start")?)?,
                working_hours_end: parse_time(row.required("working_hours_end")?)?,
                room_ids: Vec::new(),
            };
            Ok(Command::InsertCampaign { spec })
        }
        "campaign_rooms" => {
            let row = insert_row(insert, "campaign_rooms", CAMPAIGN_ROOM_COLUMNS)?;
            Ok(Command::InsertCampaignRoom {
                campaign_id: parse_ulid(row.required("campaign_id")?)?,
                room_id: parse_ulid(row.required("room_id")?)?,
            })
        }
        "facilitators" => {
            let row = insert_row(insert, "facilitators", FACILITATOR_COLUMNS)?;
            Ok(Command::InsertFacilitator {
                id: parse_ulid(row.required("id")?)?,
                name: parse_string(row.required("name")?)?,
            })
        }
        "campaign_facilitators" => {
            let row = insert_row(insert, "campaign_facilitators", CAMPAIGN_FACILITATOR_COLUMNS)?;
            Ok(Command::InsertCampaignFacilitator {
                campaign_id: parse_ulid(row.required("campaign_id")?)?,
                facilitator_id: parse_ulid(row.required("facilitator_id")?)?,
            })
        }
        "users" => {
            let row = insert_row(insert, "users", USER_COLUMNS)?;
            Ok(Command::InsertUser {
                id: parse_ulid(row.required("id")?)?,
                name: parse_string(row.required("name")?)?,
            })
        }
        "bookings" => {
            let row = insert_row(insert, "bookings", BOOKING_COLUMNS)?;
            let start = row
                .optional("start_time")
                .or(row.optional("start"))
                .ok_or(SqlError::MissingColumn("bookings", "start_time"))?;
            Ok(Command::InsertBooking {
                id: parse_ulid(row.required("id")?)?,
                user_id: parse_ulid(row.required("user_id")?)?,
                campaign_id: parse_ulid(row.required("campaign_id")?)?,
                start: parse_instant(start)?,
                players_count: parse_u32(row.required("players_count")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_filters(delete.selection.as_ref())?;

    match table.as_str() {
        "campaigns" => Ok(Command::DeleteCampaign {
            id: parse_ulid(filter(&filters, "id")?)?,
        }),
        "bookings" => Ok(Command::DeleteBooking {
            id: parse_ulid(filter(&filters, "id")?)?,
            user_id: parse_ulid(filter(&filters, "user_id")?)?,
        }),
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
    let filters = where_filters(select.selection.as_ref())?;

    match table.as_str() {
        "available_times" => {
            let room_type = filters
                .get("room_type")
                .map(|e| {
                    parse_string(e)?
                        .parse::<RoomType>()
                        .map_err(|e| SqlError::Parse(e.to_string()))
                })
                .transpose()?;
            let date = filters
                .get("date")
                .or(filters.get("day"))
                .ok_or(SqlError::MissingFilter("date"))?;
            Ok(Command::SelectAvailableTimes {
                campaign_id: parse_ulid(filter(&filters, "campaign_id")?)?,
                date: parse_date_expr(date)?,
                room_type,
            })
        }
        "bookings" => Ok(Command::SelectUserBookings {
            user_id: parse_ulid(filter(&filters, "user_id")?)?,
        }),
        "slots" => Ok(Command::SelectSlots {
            campaign_id: parse_ulid(filter(&filters, "campaign_id")?)?,
        }),
        "campaigns" => Ok(Command::SelectCampaigns),
        "rooms" => Ok(Command::SelectRooms),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten an AND-chain of `column = value` comparisons.
fn where_filters(selection: Option<&Expr>) -> Result<HashMap<String, Expr>, SqlError> {
    let mut filters = HashMap::new();
    if let Some(expr) = selection {
        collect_eq_filters(expr, &mut filters)?;
    }
    Ok(filters)
}

fn collect_eq_filters(expr: &Expr, out: &mut HashMap<String, Expr>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, out)?;
                collect_eq_filters(right, out)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.insert(col, right.as_ref().clone());
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
        },
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

fn filter<'a>(filters: &'a HashMap<String, Expr>, col: &'static str) -> Result<&'a Expr, SqlError> {
    filters.get(col).ok_or(SqlError::MissingFilter(col))
}

// ── Rows ──────────────────────────────────────────────────────

/// One VALUES row keyed by column name.
struct Row {
    table: &'static str,
    values: HashMap<String, Expr>,
}

impl Row {
    fn required(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.optional(col).ok_or(SqlError::MissingColumn(self.table, col))
    }

    /// `None` for an absent column or an explicit NULL.
    fn optional(&self, col: &str) -> Option<&Expr> {
        self.values
            .get(col)
            .filter(|e| !matches!(extract_value(e), Some(Value::Null)))
    }
}

/// Columns are matched by name when the INSERT lists them, by position otherwise.
fn insert_row(
    insert: &ast::Insert,
    table: &'static str,
    default_columns: &[&str],
) -> Result<Row, SqlError> {
    let values = extract_single_row(insert)?;
    let names: Vec<String> = if insert.columns.is_empty() {
        if values.len() > default_columns.len() {
            return Err(SqlError::WrongArity(table, default_columns.len(), values.len()));
        }
        default_columns.iter().map(|c| c.to_string()).collect()
    } else {
        if insert.columns.len() != values.len() {
            return Err(SqlError::WrongArity(table, insert.columns.len(), values.len()));
        }
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    Ok(Row {
        table,
        values: names.into_iter().zip(values).collect(),
    })
}

fn extract_single_row(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_f64(expr: &Expr) -> Result<f64, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad number {s}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

/// ISO-8601 string (zone-less means UTC) or Unix milliseconds.
fn parse_instant(expr: &Expr) -> Result<Ms, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            parse_timestamp(s).map_err(|e| SqlError::Parse(e.to_string()))
        }
        _ => parse_i64(expr),
    }
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    parse_time_of_day(&parse_string(expr)?).map_err(|e| SqlError::Parse(e.to_string()))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    parse_date(&parse_string(expr)?).map_err(|e| SqlError::Parse(e.to_string()))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
