use std::collections::HashMap;

use sqlparser::ast::{self, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertBooking {
        /// Generated server-side when the client leaves it out.
        id: Option<Ulid>,
        location_id: Ulid,
        user_id: Ulid,
        start: Ms,
        end: Ms,
        purpose: String,
        /// Defaults to one person when absent.
        attendees: Option<u32>,
        contact: Option<String>,
    },
    ApproveBooking {
        booking_id: Ulid,
        admin_id: Ulid,
    },
    RejectBooking {
        booking_id: Ulid,
        admin_id: Ulid,
        reason: Option<String>,
    },
    CancelBooking {
        booking_id: Ulid,
        user_id: Ulid,
    },
    SelectAvailability {
        location_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectConflicts {
        location_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectBookings {
        location_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectBooking {
        id: Ulid,
    },
    SelectBookingsByStatus {
        status: BookingStatus,
    },
    SelectUserBookings {
        user_id: Ulid,
    },
    SelectDaySlots {
        location_id: Ulid,
        day: Ms,
    },
    SelectResourceTypes {
        user_id: Ulid,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table a SELECT reads from, without binding any values. Prepared
/// statements still carry `$n` placeholders when their row shape is
/// described, so this only looks at the FROM clause.
pub fn select_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let Statement::Query(query) = stmts.first()? else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor_name(&select.from.first()?.relation).ok()
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row addressed by column name. Without a column list the
/// table's canonical column order applies.
struct Row<'a> {
    table: &'static str,
    values: HashMap<&'static str, &'a Expr>,
}

impl<'a> Row<'a> {
    fn bind(insert: &'a ast::Insert, table: &'static str, columns: &[&'static str]) -> Result<Self, SqlError> {
        let rows = extract_insert_rows(insert)?;
        if rows.len() != 1 {
            return Err(SqlError::Unsupported(format!(
                "{table}: multi-row INSERT ({} rows)",
                rows.len()
            )));
        }
        let exprs = &rows[0];

        let names: Vec<&'static str> = if insert.columns.is_empty() {
            columns.to_vec()
        } else {
            insert
                .columns
                .iter()
                .map(|ident| {
                    let name = ident.value.to_lowercase();
                    columns
                        .iter()
                        .copied()
                        .find(|c| *c == name)
                        .ok_or(SqlError::UnknownColumn(table, name))
                })
                .collect::<Result<_, _>>()?
        };
        if exprs.len() != names.len() && !(insert.columns.is_empty() && exprs.len() < names.len()) {
            return Err(SqlError::WrongArity(table, names.len(), exprs.len()));
        }

        Ok(Self {
            table,
            values: names.into_iter().zip(exprs.iter()).collect(),
        })
    }

    fn get(&self, column: &'static str) -> Option<&'a Expr> {
        self.values.get(column).copied().filter(|e| !is_null(e))
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.require(column)?)
    }

    fn i64(&self, column: &'static str) -> Result<i64, SqlError> {
        parse_i64_expr(self.require(column)?)
    }

    fn string(&self, column: &'static str) -> Result<String, SqlError> {
        parse_string_expr(self.require(column)?)
    }

    fn optional_string(&self, column: &'static str) -> Result<Option<String>, SqlError> {
        self.get(column).map(parse_string_expr).transpose()
    }

    fn optional_u32(&self, column: &'static str) -> Result<Option<u32>, SqlError> {
        self.get(column)
            .map(|e| {
                let n = parse_i64_expr(e)?;
                u32::try_from(n).map_err(|_| SqlError::Parse(format!("{column} out of range: {n}")))
            })
            .transpose()
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "bookings" => {
            let row = Row::bind(
                insert,
                "bookings",
                &["id", "location_id", "user_id", "start", "end", "purpose", "attendees", "contact"],
            )?;
            Ok(Command::InsertBooking {
                id: row.get("id").map(parse_ulid_expr).transpose()?,
                location_id: row.ulid("location_id")?,
                user_id: row.ulid("user_id")?,
                start: row.i64("start")?,
                end: row.i64("end")?,
                purpose: row.string("purpose")?,
                attendees: row.optional_u32("attendees")?,
                contact: row.optional_string("contact")?,
            })
        }
        "approvals" => {
            let row = Row::bind(insert, "approvals", &["booking_id", "admin_id"])?;
            Ok(Command::ApproveBooking {
                booking_id: row.ulid("booking_id")?,
                admin_id: row.ulid("admin_id")?,
            })
        }
        "rejections" => {
            let row = Row::bind(insert, "rejections", &["booking_id", "admin_id", "reason"])?;
            Ok(Command::RejectBooking {
                booking_id: row.ulid("booking_id")?,
                admin_id: row.ulid("admin_id")?,
                reason: row.optional_string("reason")?,
            })
        }
        "cancellations" => {
            let row = Row::bind(insert, "cancellations", &["booking_id", "user_id"])?;
            Ok(Command::CancelBooking {
                booking_id: row.ulid("booking_id")?,
                user_id: row.ulid("user_id")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

/// Conjunctive WHERE clause flattened into `column op value` triples.
#[derive(Default)]
struct Filters<'a> {
    eq: HashMap<String, &'a Expr>,
    gte: HashMap<String, &'a Expr>,
    lte: HashMap<String, &'a Expr>,
}

impl<'a> Filters<'a> {
    fn collect(expr: &'a Expr, out: &mut Self) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => Self::collect(inner, out),
            Expr::BinaryOp { left, op, right } => {
                let target = match op {
                    ast::BinaryOperator::And => {
                        Self::collect(left, out)?;
                        return Self::collect(right, out);
                    }
                    ast::BinaryOperator::Eq => &mut out.eq,
                    ast::BinaryOperator::GtEq => &mut out.gte,
                    ast::BinaryOperator::LtEq => &mut out.lte,
                    other => return Err(SqlError::Unsupported(format!("operator {other}"))),
                };
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                target.insert(col, right.as_ref());
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.eq.get(column).ok_or(SqlError::MissingFilter(column))?)
    }

    fn window(&self) -> Result<(Ms, Ms), SqlError> {
        let start = self.gte.get("start").ok_or(SqlError::MissingFilter("start"))?;
        let end = self.lte.get("end").ok_or(SqlError::MissingFilter("end"))?;
        Ok((parse_i64_expr(start)?, parse_i64_expr(end)?))
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        Filters::collect(selection, &mut filters)?;
    }

    match table.as_str() {
        "availability" => {
            let (start, end) = filters.window()?;
            Ok(Command::SelectAvailability { location_id: filters.ulid("location_id")?, start, end })
        }
        "conflicts" => {
            let (start, end) = filters.window()?;
            Ok(Command::SelectConflicts { location_id: filters.ulid("location_id")?, start, end })
        }
        "bookings" => parse_select_bookings(&filters),
        "slots" => {
            let day = filters.eq.get("day").ok_or(SqlError::MissingFilter("day"))?;
            Ok(Command::SelectDaySlots {
                location_id: filters.ulid("location_id")?,
                day: parse_i64_expr(day)?,
            })
        }
        "resource_types" => Ok(Command::SelectResourceTypes { user_id: filters.ulid("user_id")? }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select_bookings(filters: &Filters<'_>) -> Result<Command, SqlError> {
    if filters.eq.contains_key("id") {
        return Ok(Command::SelectBooking { id: filters.ulid("id")? });
    }
    if let Some(status) = filters.eq.get("status") {
        let status: BookingStatus = parse_string_expr(status)?
            .parse()
            .map_err(SqlError::Parse)?;
        return Ok(Command::SelectBookingsByStatus { status });
    }
    if filters.eq.contains_key("user_id") {
        return Ok(Command::SelectUserBookings { user_id: filters.ulid("user_id")? });
    }
    let (start, end) = filters.window()?;
    Ok(Command::SelectBookings { location_id: filters.ulid("location_id")?, start, end })
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

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(&values.rows),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
        _ => Err(SqlError::Parse("expected VALUES".into())),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID '{s}': {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer '{s}': {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(
            Value::SingleQuotedString(s)
            | Value::EscapedStringLiteral(s)
            | Value::DoubleQuotedString(s),
        ) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: unknown column {1}")]
    UnknownColumn(&'static str, String),
    #[error("{0}: missing value for {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
