use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertSpot {
        id: Ulid,
        owner_id: Ulid,
        name: Option<String>,
        total_slots: u32,
        price_cents: i64,
        lat: f64,
        lon: f64,
    },
    UpdateSpot {
        id: Ulid,
        owner_id: Ulid,
        name: Option<String>,
        total_slots: Option<u32>,
        price_cents: Option<i64>,
        active: Option<bool>,
    },
    /// DELETE FROM spots — soft deactivation, history stays.
    DeactivateSpot {
        id: Ulid,
        owner_id: Ulid,
    },
    InsertBlock {
        id: Ulid,
        spot_id: Ulid,
        owner_id: Ulid,
        start: Ms,
        end: Ms,
        status: BlockStatus,
        slots_open: u32,
        reason: Option<String>,
    },
    UpdateBlock {
        id: Ulid,
        owner_id: Ulid,
        start: Ms,
        end: Ms,
        status: BlockStatus,
        slots_open: u32,
        reason: Option<String>,
    },
    DeleteBlock {
        id: Ulid,
        owner_id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        spot_id: Ulid,
        guest_id: Ulid,
        vehicle_id: Ulid,
        start: Ms,
        end: Ms,
        /// RETURNING asked — respond with the issued qr/pin/cost row.
        returning: bool,
    },
    SetPaymentStatus {
        id: Ulid,
        owner_id: Ulid,
        verified: bool,
    },
    CompleteBooking {
        id: Ulid,
    },
    CancelBooking {
        id: Ulid,
        actor: Option<Ulid>,
    },
    SelectSpots,
    SelectBlocks {
        spot_id: Ulid,
    },
    SelectBookings {
        spot_id: Ulid,
    },
    SelectAvailability {
        spot_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectWindows {
        spot_id: Ulid,
        start: Ms,
        end: Ms,
        min_slots: Option<u32>,
        min_duration: Option<Ms>,
    },
    SelectEntry {
        spot_id: Ulid,
        code: EntryCode,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "spots" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("spots", 2, values.len()));
            }
            Ok(Command::InsertSpot {
                id: parse_ulid(&values[0])?,
                owner_id: parse_ulid(&values[1])?,
                name: if values.len() >= 3 {
                    parse_string_or_null(&values[2])?
                } else {
                    None
                },
                total_slots: if values.len() >= 4 { parse_u32(&values[3])? } else { 1 },
                price_cents: if values.len() >= 5 { parse_i64(&values[4])? } else { 0 },
                lat: if values.len() >= 6 { parse_f64(&values[5])? } else { 0.0 },
                lon: if values.len() >= 7 { parse_f64(&values[6])? } else { 0.0 },
            })
        }
        "blocks" => {
            if values.len() < 6 {
                return Err(SqlError::WrongArity("blocks", 6, values.len()));
            }
            Ok(Command::InsertBlock {
                id: parse_ulid(&values[0])?,
                spot_id: parse_ulid(&values[1])?,
                owner_id: parse_ulid(&values[2])?,
                start: parse_i64(&values[3])?,
                end: parse_i64(&values[4])?,
                status: parse_block_status(&values[5])?,
                slots_open: if values.len() >= 7 { parse_u32(&values[6])? } else { 0 },
                reason: if values.len() >= 8 {
                    parse_string_or_null(&values[7])?
                } else {
                    None
                },
            })
        }
        "bookings" => {
            if values.len() < 6 {
                return Err(SqlError::WrongArity("bookings", 6, values.len()));
            }
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                spot_id: parse_ulid(&values[1])?,
                guest_id: parse_ulid(&values[2])?,
                vehicle_id: parse_ulid(&values[3])?,
                start: parse_i64(&values[4])?,
                end: parse_i64(&values[5])?,
                returning: insert.returning.is_some(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let filters = Filters::from_selection(selection)?;
    let id = filters.id.ok_or(SqlError::MissingFilter("id"))?;

    match table.as_str() {
        "spots" => {
            let owner_id = filters.owner_id.ok_or(SqlError::MissingFilter("owner_id"))?;
            let mut name = None;
            let mut total_slots = None;
            let mut price_cents = None;
            let mut active = None;
            for a in assignments {
                match assignment_column(a)?.as_str() {
                    "name" => name = parse_string_or_null(&a.value)?,
                    "total_slots" => total_slots = Some(parse_u32(&a.value)?),
                    "price_cents" => price_cents = Some(parse_i64(&a.value)?),
                    "active" => active = Some(parse_bool(&a.value)?),
                    col => return Err(SqlError::Unsupported(format!("spots column {col}"))),
                }
            }
            Ok(Command::UpdateSpot { id, owner_id, name, total_slots, price_cents, active })
        }
        "blocks" => {
            let owner_id = filters.owner_id.ok_or(SqlError::MissingFilter("owner_id"))?;
            let mut start = None;
            let mut end = None;
            let mut status = None;
            let mut slots_open = 0;
            let mut reason = None;
            for a in assignments {
                match assignment_column(a)?.as_str() {
                    "start" => start = Some(parse_i64(&a.value)?),
                    "end" => end = Some(parse_i64(&a.value)?),
                    "status" => status = Some(parse_block_status(&a.value)?),
                    "slots_open" => slots_open = parse_u32(&a.value)?,
                    "reason" => reason = parse_string_or_null(&a.value)?,
                    col => return Err(SqlError::Unsupported(format!("blocks column {col}"))),
                }
            }
            Ok(Command::UpdateBlock {
                id,
                owner_id,
                start: start.ok_or(SqlError::MissingFilter("start"))?,
                end: end.ok_or(SqlError::MissingFilter("end"))?,
                status: status.ok_or(SqlError::MissingFilter("status"))?,
                slots_open,
                reason,
            })
        }
        "bookings" => {
            if assignments.len() != 1 {
                return Err(SqlError::Unsupported(
                    "bookings UPDATE takes exactly one assignment".into(),
                ));
            }
            let a = &assignments[0];
            match assignment_column(a)?.as_str() {
                "payment_status" => {
                    let owner_id =
                        filters.owner_id.ok_or(SqlError::MissingFilter("owner_id"))?;
                    match parse_string(&a.value)?.as_str() {
                        "verified" => Ok(Command::SetPaymentStatus { id, owner_id, verified: true }),
                        "rejected" => {
                            Ok(Command::SetPaymentStatus { id, owner_id, verified: false })
                        }
                        other => Err(SqlError::Parse(format!("bad payment_status: {other}"))),
                    }
                }
                "status" => match parse_string(&a.value)?.as_str() {
                    "completed" => Ok(Command::CompleteBooking { id }),
                    "cancelled" => Ok(Command::CancelBooking { id, actor: filters.actor }),
                    other => Err(SqlError::Parse(format!("bad status: {other}"))),
                },
                col => Err(SqlError::Unsupported(format!("bookings column {col}"))),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(&delete.selection)?;
    let id = filters.id.ok_or(SqlError::MissingFilter("id"))?;

    match table.as_str() {
        "spots" => Ok(Command::DeactivateSpot {
            id,
            owner_id: filters.owner_id.ok_or(SqlError::MissingFilter("owner_id"))?,
        }),
        "blocks" => Ok(Command::DeleteBlock {
            id,
            owner_id: filters.owner_id.ok_or(SqlError::MissingFilter("owner_id"))?,
        }),
        "bookings" => Ok(Command::CancelBooking { id, actor: filters.actor }),
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
    let filters = Filters::from_selection(&select.selection)?;

    match table.as_str() {
        "spots" => Ok(Command::SelectSpots),
        "blocks" => Ok(Command::SelectBlocks {
            spot_id: filters.spot_id.ok_or(SqlError::MissingFilter("spot_id"))?,
        }),
        "bookings" => Ok(Command::SelectBookings {
            spot_id: filters.spot_id.ok_or(SqlError::MissingFilter("spot_id"))?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            spot_id: filters.spot_id.ok_or(SqlError::MissingFilter("spot_id"))?,
            start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
            end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
        }),
        "windows" => Ok(Command::SelectWindows {
            spot_id: filters.spot_id.ok_or(SqlError::MissingFilter("spot_id"))?,
            start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
            end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
            min_slots: filters.min_slots,
            min_duration: filters.min_duration,
        }),
        "entry" => {
            let spot_id = filters.spot_id.ok_or(SqlError::MissingFilter("spot_id"))?;
            let code = match (filters.qr_code, filters.pin) {
                (Some(token), None) => EntryCode::Qr(token),
                (None, Some(pin)) => EntryCode::Pin(pin),
                _ => return Err(SqlError::MissingFilter("qr_code or pin")),
            };
            Ok(Command::SelectEntry { spot_id, code })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clause filters ──────────────────────────────────────

/// AND-ed equality/range filters collected from a WHERE clause.
#[derive(Default)]
struct Filters {
    id: Option<Ulid>,
    owner_id: Option<Ulid>,
    actor: Option<Ulid>,
    spot_id: Option<Ulid>,
    start: Option<Ms>,
    end: Option<Ms>,
    min_slots: Option<u32>,
    min_duration: Option<Ms>,
    qr_code: Option<String>,
    pin: Option<u16>,
}

impl Filters {
    fn from_selection(selection: &Option<Expr>) -> Result<Self, SqlError> {
        let mut filters = Self::default();
        if let Some(expr) = selection {
            filters.collect(expr)?;
        }
        Ok(filters)
    }

    fn collect(&mut self, expr: &Expr) -> Result<(), SqlError> {
        if let Expr::BinaryOp { left, op, right } = expr {
            match op {
                ast::BinaryOperator::And => {
                    self.collect(left)?;
                    self.collect(right)?;
                }
                ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                    Some("id") => self.id = Some(parse_ulid(right)?),
                    Some("owner_id") => self.owner_id = Some(parse_ulid(right)?),
                    Some("actor") => self.actor = Some(parse_ulid(right)?),
                    Some("spot_id") => self.spot_id = Some(parse_ulid(right)?),
                    Some("min_slots") => self.min_slots = Some(parse_u32(right)?),
                    Some("min_duration") => self.min_duration = Some(parse_i64(right)?),
                    Some("qr_code") => self.qr_code = Some(parse_string(right)?),
                    Some("pin") => self.pin = Some(parse_pin(right)?),
                    _ => {}
                },
                ast::BinaryOperator::GtEq => {
                    if expr_column_name(left).as_deref() == Some("start") {
                        self.start = Some(parse_i64(right)?);
                    }
                }
                ast::BinaryOperator::LtEq => {
                    if expr_column_name(left).as_deref() == Some("end") {
                        self.end = Some(parse_i64(right)?);
                    }
                }
                _ => {}
            }
        }
        Ok(())
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            if values.rows.len() > 1 {
                return Err(SqlError::Unsupported("multi-row INSERT".into()));
            }
            Ok(values.rows[0].clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn assignment_column(a: &ast::Assignment) -> Result<String, SqlError> {
    match &a.target {
        AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        _ => Err(SqlError::Parse("unsupported assignment target".into())),
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

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
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
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_f64(expr: &Expr) -> Result<f64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad f64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad f64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_f64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

/// PINs arrive as '0042' (leading zeros preserved) or bare numbers.
fn parse_pin(expr: &Expr) -> Result<u16, SqlError> {
    let v = parse_i64(expr)?;
    if !(0..10_000).contains(&v) {
        return Err(SqlError::Parse(format!("pin {v} out of 4-digit range")));
    }
    Ok(v as u16)
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) => Ok(Some(s.clone())),
            _ => Err(SqlError::Parse(format!(
                "expected string or NULL, got {value:?}"
            ))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
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

fn parse_block_status(expr: &Expr) -> Result<BlockStatus, SqlError> {
    match parse_string(expr)?.to_lowercase().as_str() {
        "available" => Ok(BlockStatus::Available),
        "blocked" => Ok(BlockStatus::Blocked),
        "maintenance" => Ok(BlockStatus::Maintenance),
        other => Err(SqlError::Parse(format!("bad block status: {other}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
