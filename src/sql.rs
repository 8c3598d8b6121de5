use sqlparser::ast::{
    self, Assignment, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, TableWithJoins, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        id: Ulid,
        name: Option<String>,
        kind: ResourceKind,
        total_quantity: u32,
        organization_id: Option<Ulid>,
    },
    UpdateResource {
        id: Ulid,
        name: Option<String>,
        total_quantity: Option<u32>,
        max_concurrent: Option<u32>,
    },
    DeleteResource {
        id: Ulid,
    },
    InsertEvent {
        event: EventRecord,
    },
    UpdateEvent {
        id: Ulid,
        title: Option<Option<String>>,
        status: Option<EventStatus>,
    },
    DeleteEvent {
        id: Ulid,
    },
    InsertAllocation {
        id: Ulid,
        resource_id: Ulid,
        event_id: Ulid,
        quantity: u32,
    },
    UpdateAllocation {
        id: Ulid,
        quantity: Option<u32>,
        resource_id: Option<Ulid>,
    },
    DeleteAllocation {
        id: Ulid,
    },
    InsertAttendance {
        id: Ulid,
        event_id: Ulid,
        user_id: Option<Ulid>,
        checked_in_at: Option<Ms>,
    },
    DeleteAttendance {
        id: Ulid,
    },
    InsertStockEntry {
        id: Ulid,
        resource_id: Ulid,
        at: Ms,
        delta: i64,
        note: Option<String>,
    },
    /// Multi-row INSERT into `event_bookings`: the first row's event columns
    /// define the event, every row's (resource_id, quantity) adds an
    /// allocation request. All-or-nothing.
    BookEvent {
        event: EventRecord,
        requests: Vec<(Ulid, u32)>,
    },
    SelectAvailability {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        quantity: u32,
        exclude_event_id: Option<Ulid>,
    },
    SelectConflicts {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        exclude_event_id: Option<Ulid>,
    },
    SelectResources,
    SelectEvents,
    SelectAllocations {
        resource_id: Option<Ulid>,
        event_id: Option<Ulid>,
    },
    SelectAttendances {
        event_id: Option<Ulid>,
    },
    SelectStockEntries {
        resource_id: Ulid,
    },
    SelectDoubleBookedUsers,
    SelectViolatedConstraints,
    SelectHierarchyViolations,
    SelectUtilization {
        organization_id: Option<Ulid>,
        threshold_hours: Option<f64>,
    },
    SelectExternalAttendees {
        threshold: u64,
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
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "resources" => {
            let values = extract_insert_values(insert)?;
            if values.len() < 4 {
                return Err(SqlError::WrongArity("resources", 4, values.len()));
            }
            let id = parse_ulid(&values[0])?;
            let name = parse_string_or_null(&values[1])?;
            let kind_label = parse_string(&values[2])?;
            let total_quantity = parse_u32(&values[3])?;
            let max_concurrent = if values.len() >= 5 {
                parse_u32_or_null(&values[4])?
            } else {
                None
            };
            let organization_id = if values.len() >= 6 {
                parse_ulid_or_null(&values[5])?
            } else {
                None
            };
            let kind = resource_kind(&kind_label, max_concurrent)?;
            Ok(Command::InsertResource {
                id,
                name,
                kind,
                total_quantity,
                organization_id,
            })
        }
        "events" => {
            let values = extract_insert_values(insert)?;
            Ok(Command::InsertEvent {
                event: event_from_values(&values)?,
            })
        }
        "allocations" => {
            let values = extract_insert_values(insert)?;
            if values.len() < 4 {
                return Err(SqlError::WrongArity("allocations", 4, values.len()));
            }
            Ok(Command::InsertAllocation {
                id: parse_ulid(&values[0])?,
                resource_id: parse_ulid(&values[1])?,
                event_id: parse_ulid(&values[2])?,
                quantity: parse_u32(&values[3])?,
            })
        }
        "attendances" => {
            let values = extract_insert_values(insert)?;
            if values.len() < 2 {
                return Err(SqlError::WrongArity("attendances", 2, values.len()));
            }
            let user_id = if values.len() >= 3 {
                parse_ulid_or_null(&values[2])?
            } else {
                None
            };
            let checked_in_at = if values.len() >= 4 {
                parse_i64_or_null(&values[3])?
            } else {
                None
            };
            Ok(Command::InsertAttendance {
                id: parse_ulid(&values[0])?,
                event_id: parse_ulid(&values[1])?,
                user_id,
                checked_in_at,
            })
        }
        "stock_entries" => {
            let values = extract_insert_values(insert)?;
            if values.len() < 4 {
                return Err(SqlError::WrongArity("stock_entries", 4, values.len()));
            }
            let note = if values.len() >= 5 {
                parse_string_or_null(&values[4])?
            } else {
                None
            };
            Ok(Command::InsertStockEntry {
                id: parse_ulid(&values[0])?,
                resource_id: parse_ulid(&values[1])?,
                at: parse_i64(&values[2])?,
                delta: parse_i64(&values[3])?,
                note,
            })
        }
        "event_bookings" => {
            let rows = extract_all_insert_rows(insert)?;
            let first = &rows[0];
            if first.len() < 8 {
                return Err(SqlError::WrongArity("event_bookings", 8, first.len()));
            }
            let event = EventRecord {
                id: parse_ulid(&first[0])?,
                title: parse_string_or_null(&first[1])?,
                span: Span {
                    start: parse_i64(&first[2])?,
                    end: parse_i64(&first[3])?,
                },
                status: EventStatus::Scheduled,
                organization_id: parse_ulid_or_null(&first[4])?,
                parent_event_id: parse_ulid_or_null(&first[5])?,
            };
            let mut requests = Vec::new();
            for (i, row) in rows.iter().enumerate() {
                if row.len() < 8 {
                    return Err(SqlError::WrongArity("event_bookings row", 8, row.len()));
                }
                let resource_id = parse_ulid_or_null(&row[6])
                    .map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
                if let Some(resource_id) = resource_id {
                    let quantity = parse_u32(&row[7])
                        .map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
                    requests.push((resource_id, quantity));
                }
            }
            Ok(Command::BookEvent { event, requests })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// (id, title, start, "end" [, status [, organization_id [, parent_event_id]]])
fn event_from_values(values: &[Expr]) -> Result<EventRecord, SqlError> {
    if values.len() < 4 {
        return Err(SqlError::WrongArity("events", 4, values.len()));
    }
    let status = if values.len() >= 5 {
        match parse_string_or_null(&values[4])? {
            Some(s) => event_status(&s)?,
            None => EventStatus::Scheduled,
        }
    } else {
        EventStatus::Scheduled
    };
    Ok(EventRecord {
        id: parse_ulid(&values[0])?,
        title: parse_string_or_null(&values[1])?,
        span: Span {
            start: parse_i64(&values[2])?,
            end: parse_i64(&values[3])?,
        },
        status,
        organization_id: if values.len() >= 6 {
            parse_ulid_or_null(&values[5])?
        } else {
            None
        },
        parent_event_id: if values.len() >= 7 {
            parse_ulid_or_null(&values[6])?
        } else {
            None
        },
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "resources" => Ok(Command::DeleteResource { id }),
        "events" => Ok(Command::DeleteEvent { id }),
        "allocations" => Ok(Command::DeleteAllocation { id }),
        "attendances" => Ok(Command::DeleteAttendance { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &TableWithJoins,
    assignments: &[Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    match table.as_str() {
        "allocations" => {
            let mut quantity = None;
            let mut resource_id = None;
            for (col, value) in assignment_pairs(assignments)? {
                match col.as_str() {
                    "quantity" => quantity = Some(parse_u32(value)?),
                    "resource_id" => resource_id = Some(parse_ulid(value)?),
                    other => return Err(SqlError::UnknownColumn(other.to_string())),
                }
            }
            Ok(Command::UpdateAllocation {
                id,
                quantity,
                resource_id,
            })
        }
        "resources" => {
            let mut name = None;
            let mut total_quantity = None;
            let mut max_concurrent = None;
            for (col, value) in assignment_pairs(assignments)? {
                match col.as_str() {
                    "name" => name = Some(parse_string(value)?),
                    "total_quantity" => total_quantity = Some(parse_u32(value)?),
                    "max_concurrent_usage" => max_concurrent = Some(parse_u32(value)?),
                    other => return Err(SqlError::UnknownColumn(other.to_string())),
                }
            }
            Ok(Command::UpdateResource {
                id,
                name,
                total_quantity,
                max_concurrent,
            })
        }
        "events" => {
            let mut title = None;
            let mut status = None;
            for (col, value) in assignment_pairs(assignments)? {
                match col.as_str() {
                    "title" => title = Some(parse_string_or_null(value)?),
                    "status" => status = Some(event_status(&parse_string(value)?)?),
                    other => return Err(SqlError::UnknownColumn(other.to_string())),
                }
            }
            Ok(Command::UpdateEvent { id, title, status })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(SqlError::Unsupported("non-SELECT query".into()));
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "availability" => {
            let window = window_filters(&filters)?;
            Ok(Command::SelectAvailability {
                resource_id: eq_ulid(&filters, "resource_id")?
                    .ok_or(SqlError::MissingFilter("resource_id"))?,
                start: window.0,
                end: window.1,
                quantity: eq_u32(&filters, "quantity")?.unwrap_or(1),
                exclude_event_id: eq_ulid(&filters, "exclude_event_id")?,
            })
        }
        "conflicts" => {
            let window = window_filters(&filters)?;
            Ok(Command::SelectConflicts {
                resource_id: eq_ulid(&filters, "resource_id")?
                    .ok_or(SqlError::MissingFilter("resource_id"))?,
                start: window.0,
                end: window.1,
                exclude_event_id: eq_ulid(&filters, "exclude_event_id")?,
            })
        }
        "resources" => Ok(Command::SelectResources),
        "events" => Ok(Command::SelectEvents),
        "allocations" => Ok(Command::SelectAllocations {
            resource_id: eq_ulid(&filters, "resource_id")?,
            event_id: eq_ulid(&filters, "event_id")?,
        }),
        "attendances" => Ok(Command::SelectAttendances {
            event_id: eq_ulid(&filters, "event_id")?,
        }),
        "stock_entries" => Ok(Command::SelectStockEntries {
            resource_id: eq_ulid(&filters, "resource_id")?
                .ok_or(SqlError::MissingFilter("resource_id"))?,
        }),
        "double_booked_users" => Ok(Command::SelectDoubleBookedUsers),
        "violated_constraints" => Ok(Command::SelectViolatedConstraints),
        "hierarchy_violations" => Ok(Command::SelectHierarchyViolations),
        "resource_utilization" => Ok(Command::SelectUtilization {
            organization_id: eq_ulid(&filters, "organization_id")?,
            threshold_hours: eq_f64(&filters, "threshold_hours")?,
        }),
        "external_attendees" => Ok(Command::SelectExternalAttendees {
            threshold: eq_u64(&filters, "threshold")?
                .ok_or(SqlError::MissingFilter("threshold"))?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE-clause filters ──────────────────────────────────────

type Filter<'a> = (String, ast::BinaryOperator, &'a Expr);

/// Flatten an AND-tree of `col <op> value` comparisons.
fn collect_filters<'a>(expr: &'a Expr, out: &mut Vec<Filter<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_filters(left, out)?;
                collect_filters(right, out)?;
            }
            ast::BinaryOperator::Eq | ast::BinaryOperator::GtEq | ast::BinaryOperator::LtEq => {
                if let Some(col) = expr_column_name(left) {
                    out.push((col, op.clone(), right));
                }
            }
            _ => {}
        },
        Expr::Nested(inner) => collect_filters(inner, out)?,
        _ => {}
    }
    Ok(())
}

/// `start >= X AND "end" <= Y` — the query window.
fn window_filters(filters: &[Filter]) -> Result<(Ms, Ms), SqlError> {
    let mut start = None;
    let mut end = None;
    for (col, op, value) in filters {
        match (col.as_str(), op) {
            ("start", ast::BinaryOperator::GtEq) => start = Some(parse_i64(value)?),
            ("end", ast::BinaryOperator::LtEq) => end = Some(parse_i64(value)?),
            _ => {}
        }
    }
    Ok((
        start.ok_or(SqlError::MissingFilter("start"))?,
        end.ok_or(SqlError::MissingFilter("end"))?,
    ))
}

fn eq_value<'a>(filters: &'a [Filter], col: &str) -> Option<&'a Expr> {
    filters
        .iter()
        .find(|(c, op, _)| c == col && *op == ast::BinaryOperator::Eq)
        .map(|(_, _, v)| *v)
}

fn eq_ulid(filters: &[Filter], col: &str) -> Result<Option<Ulid>, SqlError> {
    eq_value(filters, col).map(parse_ulid).transpose()
}

fn eq_u32(filters: &[Filter], col: &str) -> Result<Option<u32>, SqlError> {
    eq_value(filters, col).map(parse_u32).transpose()
}

fn eq_u64(filters: &[Filter], col: &str) -> Result<Option<u64>, SqlError> {
    eq_value(filters, col).map(parse_u64).transpose()
}

fn eq_f64(filters: &[Filter], col: &str) -> Result<Option<f64>, SqlError> {
    eq_value(filters, col).map(parse_f64).transpose()
}

// ── Domain literals ───────────────────────────────────────────

fn resource_kind(label: &str, max_concurrent: Option<u32>) -> Result<ResourceKind, SqlError> {
    match (label, max_concurrent) {
        ("exclusive", None) => Ok(ResourceKind::Exclusive),
        ("consumable", None) => Ok(ResourceKind::Consumable),
        ("shareable", Some(mc)) => Ok(ResourceKind::Shareable { max_concurrent: mc }),
        ("shareable", None) => Err(SqlError::Parse(
            "shareable resources require max_concurrent_usage".into(),
        )),
        ("exclusive" | "consumable", Some(_)) => Err(SqlError::Parse(format!(
            "max_concurrent_usage is not valid for {label} resources"
        ))),
        _ => Err(SqlError::Parse(format!("unknown resource kind: {label}"))),
    }
}

fn event_status(label: &str) -> Result<EventStatus, SqlError> {
    match label {
        "scheduled" => Ok(EventStatus::Scheduled),
        "cancelled" => Ok(EventStatus::Cancelled),
        _ => Err(SqlError::Parse(format!("unknown event status: {label}"))),
    }
}

// ── AST helpers ───────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    match name.0.last()? {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    }
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    let TableObject::TableName(name) = &insert.table else {
        return Err(SqlError::Parse("unsupported table object in INSERT".into()));
    };
    object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let (FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables)) = &delete.from;
    match tables.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    let TableFactor::Table { name, .. } = tf else {
        return Err(SqlError::Parse("complex table expression".into()));
    };
    object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let mut rows = extract_all_insert_rows(insert)?;
    if rows.len() > 1 {
        return Err(SqlError::Unsupported("multi-row INSERT for this table".into()));
    }
    Ok(rows.remove(0))
}

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let source = insert
        .source
        .as_ref()
        .ok_or_else(|| SqlError::Parse("no VALUES".into()))?;
    let SetExpr::Values(values) = source.body.as_ref() else {
        return Err(SqlError::Parse("expected VALUES".into()));
    };
    if values.rows.is_empty() {
        return Err(SqlError::Parse("empty VALUES".into()));
    }
    Ok(values.rows.clone())
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    if let Some(Expr::BinaryOp {
        left,
        op: ast::BinaryOperator::Eq,
        right,
    }) = selection
        && expr_column_name(left).as_deref() == Some("id")
    {
        return parse_ulid(right);
    }
    Err(SqlError::MissingFilter("id"))
}

fn assignment_pairs(assignments: &[Assignment]) -> Result<Vec<(String, &Expr)>, SqlError> {
    assignments
        .iter()
        .map(|a| {
            let AssignmentTarget::ColumnName(name) = &a.target else {
                return Err(SqlError::Parse("unsupported SET target".into()));
            };
            let col = object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column in SET".into()))?;
            Ok((col, &a.value))
        })
        .collect()
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

// ── Literal values ────────────────────────────────────────────

fn literal(expr: &Expr) -> Result<&Value, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Ok(value),
        _ => Err(SqlError::Parse(format!("expected literal, got {expr:?}"))),
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(literal(expr), Ok(Value::Null))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match literal(expr)? {
        Value::SingleQuotedString(s) | Value::Number(s, _) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        other => Err(SqlError::Parse(format!("expected string, got {other:?}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid(expr).map(Some)
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match literal(expr)? {
        Value::SingleQuotedString(s) => Ok(s.clone()),
        other => Err(SqlError::Parse(format!("expected string, got {other:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    // Negative literals arrive as unary minus around a number.
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr: inner,
    } = expr
    {
        return Ok(-parse_i64(inner)?);
    }
    match literal(expr)? {
        Value::Number(s, _) | Value::SingleQuotedString(s) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
        other => Err(SqlError::Parse(format!("expected number, got {other:?}"))),
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_i64(expr).map(Some)
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_u32(expr).map(Some)
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let v = parse_i64(expr)?;
    u64::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u64 range")))
}

fn parse_f64(expr: &Expr) -> Result<f64, SqlError> {
    match literal(expr)? {
        Value::Number(s, _) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad f64: {e}"))),
        other => Err(SqlError::Parse(format!("expected number, got {other:?}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
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
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const ID2: &str = "01BX5ZZKBKACTAV9WEVGEMMVRY";

    #[test]
    fn parse_insert_exclusive_resource() {
        let sql = format!(
            "INSERT INTO resources (id, name, kind, total_quantity) VALUES ('{ID}', 'Room A', 'exclusive', 1)"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertResource {
                id,
                name,
                kind,
                total_quantity,
                organization_id,
            } => {
                assert_eq!(id.to_string(), ID);
                assert_eq!(name.as_deref(), Some("Room A"));
                assert_eq!(kind, ResourceKind::Exclusive);
                assert_eq!(total_quantity, 1);
                assert_eq!(organization_id, None);
            }
            _ => panic!("expected InsertResource, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_shareable_resource() {
        let sql = format!(
            "INSERT INTO resources (id, name, kind, total_quantity, max_concurrent_usage, organization_id) VALUES ('{ID}', NULL, 'shareable', 10, 2, '{ID2}')"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertResource {
                kind,
                organization_id,
                ..
            } => {
                assert_eq!(kind, ResourceKind::Shareable { max_concurrent: 2 });
                assert_eq!(organization_id.unwrap().to_string(), ID2);
            }
            _ => panic!("expected InsertResource, got {cmd:?}"),
        }
    }

    #[test]
    fn shareable_without_cap_rejected() {
        let sql = format!(
            "INSERT INTO resources (id, name, kind, total_quantity) VALUES ('{ID}', NULL, 'shareable', 10)"
        );
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn cap_on_consumable_rejected() {
        let sql = format!(
            "INSERT INTO resources (id, name, kind, total_quantity, max_concurrent_usage) VALUES ('{ID}', NULL, 'consumable', 10, 2)"
        );
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn parse_insert_event_with_defaults() {
        let sql = format!(
            r#"INSERT INTO events (id, title, start, "end") VALUES ('{ID}', 'Standup', 1000, 2000)"#
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertEvent { event } => {
                assert_eq!(event.title.as_deref(), Some("Standup"));
                assert_eq!(event.span.start, 1000);
                assert_eq!(event.span.end, 2000);
                assert_eq!(event.status, EventStatus::Scheduled);
                assert_eq!(event.parent_event_id, None);
            }
            _ => panic!("expected InsertEvent, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_event_full() {
        let sql = format!(
            r#"INSERT INTO events (id, title, start, "end", status, organization_id, parent_event_id) VALUES ('{ID}', NULL, 1000, 2000, 'cancelled', NULL, '{ID2}')"#
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertEvent { event } => {
                assert_eq!(event.status, EventStatus::Cancelled);
                assert_eq!(event.parent_event_id.unwrap().to_string(), ID2);
            }
            _ => panic!("expected InsertEvent, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_allocation() {
        let sql = format!(
            "INSERT INTO allocations (id, resource_id, event_id, quantity) VALUES ('{ID}', '{ID}', '{ID2}', 3)"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertAllocation { quantity, .. } => assert_eq!(quantity, 3),
            _ => panic!("expected InsertAllocation, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_attendance_with_nulls() {
        let sql = format!(
            "INSERT INTO attendances (id, event_id, user_id, checked_in_at) VALUES ('{ID}', '{ID2}', NULL, NULL)"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertAttendance {
                user_id,
                checked_in_at,
                ..
            } => {
                assert_eq!(user_id, None);
                assert_eq!(checked_in_at, None);
            }
            _ => panic!("expected InsertAttendance, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_stock_entry_negative_delta() {
        let sql = format!(
            "INSERT INTO stock_entries (id, resource_id, at, delta, note) VALUES ('{ID}', '{ID2}', 5000, -4, 'spoilage')"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertStockEntry { delta, note, .. } => {
                assert_eq!(delta, -4);
                assert_eq!(note.as_deref(), Some("spoilage"));
            }
            _ => panic!("expected InsertStockEntry, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_book_event_multi_row() {
        let sql = format!(
            r#"INSERT INTO event_bookings (event_id, title, start, "end", organization_id, parent_event_id, resource_id, quantity) VALUES ('{ID}', 'Offsite', 1000, 2000, NULL, NULL, '{ID2}', 1), ('{ID}', 'Offsite', 1000, 2000, NULL, NULL, '{ID2}', 2)"#
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::BookEvent { event, requests } => {
                assert_eq!(event.title.as_deref(), Some("Offsite"));
                assert_eq!(requests.len(), 2);
                assert_eq!(requests[1].1, 2);
            }
            _ => panic!("expected BookEvent, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_book_event_without_allocations() {
        let sql = format!(
            r#"INSERT INTO event_bookings (event_id, title, start, "end", organization_id, parent_event_id, resource_id, quantity) VALUES ('{ID}', NULL, 1000, 2000, NULL, NULL, NULL, 0)"#
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::BookEvent { requests, .. } => assert!(requests.is_empty()),
            _ => panic!("expected BookEvent, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_update_allocation() {
        let sql = format!("UPDATE allocations SET quantity = 2, resource_id = '{ID2}' WHERE id = '{ID}'");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::UpdateAllocation {
                id,
                quantity,
                resource_id,
            } => {
                assert_eq!(id.to_string(), ID);
                assert_eq!(quantity, Some(2));
                assert_eq!(resource_id.unwrap().to_string(), ID2);
            }
            _ => panic!("expected UpdateAllocation, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_update_resource_partial() {
        let sql = format!("UPDATE resources SET total_quantity = 5 WHERE id = '{ID}'");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::UpdateResource {
                name,
                total_quantity,
                max_concurrent,
                ..
            } => {
                assert_eq!(name, None);
                assert_eq!(total_quantity, Some(5));
                assert_eq!(max_concurrent, None);
            }
            _ => panic!("expected UpdateResource, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_update_event_status() {
        let sql = format!("UPDATE events SET status = 'cancelled' WHERE id = '{ID}'");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::UpdateEvent { status, title, .. } => {
                assert_eq!(status, Some(EventStatus::Cancelled));
                assert_eq!(title, None);
            }
            _ => panic!("expected UpdateEvent, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_deletes() {
        for (table, expect_alloc) in [
            ("resources", false),
            ("events", false),
            ("allocations", true),
            ("attendances", false),
        ] {
            let sql = format!("DELETE FROM {table} WHERE id = '{ID}'");
            let cmd = parse_sql(&sql).unwrap();
            if expect_alloc {
                assert!(matches!(cmd, Command::DeleteAllocation { .. }));
            }
        }
    }

    #[test]
    fn parse_select_availability() {
        let sql = format!(
            "SELECT * FROM availability WHERE resource_id = '{ID}' AND start >= 1000 AND \"end\" <= 2000"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::SelectAvailability {
                resource_id,
                start,
                end,
                quantity,
                exclude_event_id,
            } => {
                assert_eq!(resource_id.to_string(), ID);
                assert_eq!((start, end), (1000, 2000));
                assert_eq!(quantity, 1); // default
                assert_eq!(exclude_event_id, None);
            }
            _ => panic!("expected SelectAvailability, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_availability_with_quantity_and_exclusion() {
        let sql = format!(
            "SELECT * FROM availability WHERE resource_id = '{ID}' AND start >= 1000 AND \"end\" <= 2000 AND quantity = 4 AND exclude_event_id = '{ID2}'"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::SelectAvailability {
                quantity,
                exclude_event_id,
                ..
            } => {
                assert_eq!(quantity, 4);
                assert_eq!(exclude_event_id.unwrap().to_string(), ID2);
            }
            _ => panic!("expected SelectAvailability, got {cmd:?}"),
        }
    }

    #[test]
    fn availability_without_window_rejected() {
        let sql = format!("SELECT * FROM availability WHERE resource_id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter(_))));
    }

    #[test]
    fn parse_select_conflicts() {
        let sql = format!(
            "SELECT * FROM conflicts WHERE resource_id = '{ID}' AND start >= 0 AND \"end\" <= 100"
        );
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::SelectConflicts { .. }
        ));
    }

    #[test]
    fn parse_select_allocations_filters() {
        let sql = format!("SELECT * FROM allocations WHERE event_id = '{ID}'");
        match parse_sql(&sql).unwrap() {
            Command::SelectAllocations {
                resource_id,
                event_id,
            } => {
                assert!(resource_id.is_none());
                assert_eq!(event_id.unwrap().to_string(), ID);
            }
            other => panic!("expected SelectAllocations, got {other:?}"),
        }
    }

    #[test]
    fn parse_select_attendances() {
        assert!(matches!(
            parse_sql("SELECT * FROM attendances").unwrap(),
            Command::SelectAttendances { event_id: None }
        ));
        let sql = format!("SELECT * FROM attendances WHERE event_id = '{ID}'");
        match parse_sql(&sql).unwrap() {
            Command::SelectAttendances { event_id } => {
                assert_eq!(event_id.unwrap().to_string(), ID);
            }
            other => panic!("expected SelectAttendances, got {other:?}"),
        }
    }

    #[test]
    fn parse_report_selects() {
        assert!(matches!(
            parse_sql("SELECT * FROM double_booked_users").unwrap(),
            Command::SelectDoubleBookedUsers
        ));
        assert!(matches!(
            parse_sql("SELECT * FROM violated_constraints").unwrap(),
            Command::SelectViolatedConstraints
        ));
        assert!(matches!(
            parse_sql("SELECT * FROM hierarchy_violations").unwrap(),
            Command::SelectHierarchyViolations
        ));
    }

    #[test]
    fn parse_utilization_with_threshold() {
        let sql = format!(
            "SELECT * FROM resource_utilization WHERE organization_id = '{ID}' AND threshold_hours = 2.5"
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectUtilization {
                organization_id,
                threshold_hours,
            } => {
                assert_eq!(organization_id.unwrap().to_string(), ID);
                assert_eq!(threshold_hours, Some(2.5));
            }
            other => panic!("expected SelectUtilization, got {other:?}"),
        }
    }

    #[test]
    fn parse_external_attendees_requires_threshold() {
        assert!(matches!(
            parse_sql("SELECT * FROM external_attendees WHERE threshold = 5").unwrap(),
            Command::SelectExternalAttendees { threshold: 5 }
        ));
        assert!(parse_sql("SELECT * FROM external_attendees").is_err());
    }

    #[test]
    fn unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn unknown_update_column_errors() {
        let sql = format!("UPDATE allocations SET colour = 'red' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn(_))));
    }

    #[test]
    fn multi_row_allocation_insert_unsupported() {
        let sql = format!(
            "INSERT INTO allocations (id, resource_id, event_id, quantity) VALUES ('{ID}', '{ID}', '{ID}', 1), ('{ID2}', '{ID}', '{ID}', 1)"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(parse_sql("").is_err());
    }
}
