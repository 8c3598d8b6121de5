use std::fmt::Debug;
use std::io;
use std::sync::Arc;

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

use crate::auth::AllotAuthSource;
use crate::engine::{Engine, EngineError};
use crate::observability;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

pub struct AllotHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<AllotQueryParser>,
}

impl AllotHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(AllotQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let tenant = match client.metadata().get("database") {
            Some(db) => db.clone(),
            None => "default".to_string(),
        };
        self.tenant_manager.get_or_create(&tenant).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    async fn run_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let start = std::time::Instant::now();
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
            Command::InsertResource {
                id,
                name,
                kind,
                total_quantity,
                organization_id,
            } => {
                engine
                    .create_resource(id, name, kind, total_quantity, organization_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateResource {
                id,
                name,
                total_quantity,
                max_concurrent,
            } => {
                engine
                    .update_resource(id, name, total_quantity, max_concurrent)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteResource { id } => {
                engine.delete_resource(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertEvent { event } => {
                engine.upsert_event(event).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateEvent { id, title, status } => {
                let mut event = engine
                    .get_event(&id)
                    .ok_or_else(|| engine_err(EngineError::NotFound(id)))?;
                if let Some(title) = title {
                    event.title = title;
                }
                if let Some(status) = status {
                    event.status = status;
                }
                engine.upsert_event(event).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteEvent { id } => {
                engine.delete_event(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertAllocation {
                id,
                resource_id,
                event_id,
                quantity,
            } => {
                engine
                    .create_allocation(id, resource_id, event_id, quantity)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateAllocation {
                id,
                quantity,
                resource_id,
            } => {
                engine
                    .update_allocation(id, quantity, resource_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteAllocation { id } => {
                engine.delete_allocation(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertAttendance {
                id,
                event_id,
                user_id,
                checked_in_at,
            } => {
                engine
                    .record_attendance(id, event_id, user_id, checked_in_at)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteAttendance { id } => {
                engine.remove_attendance(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertStockEntry {
                id,
                resource_id,
                at,
                delta,
                note,
            } => {
                engine
                    .adjust_stock(id, resource_id, at, delta, note)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::BookEvent { event, requests } => {
                let created = engine
                    .book_event(event, requests)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(
                    Tag::new("INSERT").with_rows(created.len() + 1),
                )])
            }
            Command::SelectAvailability {
                resource_id,
                start,
                end,
                quantity,
                exclude_event_id,
            } => {
                let outcome = engine
                    .check_availability(resource_id, start, end, quantity, exclude_event_id)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(availability_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&outcome.available)?;
                encoder.encode_field(&outcome.available_quantity)?;
                encoder.encode_field(&outcome.details.total_quantity)?;
                encoder.encode_field(&outcome.details.allocated_quantity)?;
                encoder.encode_field(&outcome.details.remaining_quantity)?;
                encoder.encode_field(&outcome.details.max_concurrent.map(|v| v as i64))?;
                encoder.encode_field(&(outcome.details.current_concurrent as i64))?;
                encoder.encode_field(&outcome.details.remaining_concurrent)?;
                let rows = vec![Ok(encoder.take_row())];

                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectConflicts {
                resource_id,
                start,
                end,
                exclude_event_id,
            } => {
                let outcome = engine
                    .check_availability(resource_id, start, end, 1, exclude_event_id)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(conflicts_schema());
                let rows: Vec<PgWireResult<_>> = outcome
                    .conflicts
                    .into_iter()
                    .map(|c| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&c.event_id.to_string())?;
                        encoder.encode_field(&c.event_title)?;
                        encoder.encode_field(&c.start)?;
                        encoder.encode_field(&c.end)?;
                        encoder.encode_field(&(c.quantity as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectResources => {
                let schema = Arc::new(resources_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_resources()
                    .await
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.name)?;
                        encoder.encode_field(&r.kind.label())?;
                        encoder.encode_field(&(r.total_quantity as i64))?;
                        encoder.encode_field(&r.kind.max_concurrent().map(|v| v as i64))?;
                        encoder.encode_field(&r.organization_id.map(|o| o.to_string()))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectEvents => {
                let schema = Arc::new(events_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_events()
                    .into_iter()
                    .map(|e| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&e.id.to_string())?;
                        encoder.encode_field(&e.title)?;
                        encoder.encode_field(&e.span.start)?;
                        encoder.encode_field(&e.span.end)?;
                        encoder.encode_field(&e.status.label())?;
                        encoder.encode_field(&e.organization_id.map(|o| o.to_string()))?;
                        encoder.encode_field(&e.parent_event_id.map(|p| p.to_string()))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectAllocations {
                resource_id,
                event_id,
            } => {
                let allocations = engine
                    .list_allocations(resource_id, event_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(allocations_schema());
                let rows: Vec<PgWireResult<_>> = allocations
                    .into_iter()
                    .map(|a| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&a.id.to_string())?;
                        encoder.encode_field(&a.resource_id.to_string())?;
                        encoder.encode_field(&a.event_id.to_string())?;
                        encoder.encode_field(&(a.quantity as i64))?;
                        encoder.encode_field(&a.start)?;
                        encoder.encode_field(&a.end)?;
                        encoder.encode_field(&a.active)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectAttendances { event_id } => {
                let schema = Arc::new(attendances_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_attendances(event_id)
                    .into_iter()
                    .map(|a| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&a.id.to_string())?;
                        encoder.encode_field(&a.event_id.to_string())?;
                        encoder.encode_field(&a.user_id.map(|u| u.to_string()))?;
                        encoder.encode_field(&a.checked_in_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectStockEntries { resource_id } => {
                let entries = engine
                    .list_stock_entries(resource_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(stock_entries_schema());
                let rows: Vec<PgWireResult<_>> = entries
                    .into_iter()
                    .map(|e| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&e.id.to_string())?;
                        encoder.encode_field(&e.resource_id.to_string())?;
                        encoder.encode_field(&e.at)?;
                        encoder.encode_field(&e.delta)?;
                        encoder.encode_field(&e.note)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectDoubleBookedUsers => {
                let schema = Arc::new(double_booked_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .report_double_booked_users()
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.user_id.to_string())?;
                        encoder.encode_field(&r.first_event_id.to_string())?;
                        encoder.encode_field(&r.first_event_title)?;
                        encoder.encode_field(&r.first_start)?;
                        encoder.encode_field(&r.second_event_id.to_string())?;
                        encoder.encode_field(&r.second_event_title)?;
                        encoder.encode_field(&r.second_start)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectViolatedConstraints => {
                let schema = Arc::new(violated_constraints_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .report_violated_constraints()
                    .await
                    .into_iter()
                    .map(|r| {
                        let event_ids: Vec<String> =
                            r.event_ids.iter().map(|id| id.to_string()).collect();
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.resource_id.to_string())?;
                        encoder.encode_field(&r.resource_name)?;
                        encoder.encode_field(&r.kind.as_str())?;
                        encoder.encode_field(&r.observed)?;
                        encoder.encode_field(&r.allowed)?;
                        encoder.encode_field(
                            &serde_json::to_string(&event_ids).unwrap_or_default(),
                        )?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectHierarchyViolations => {
                let schema = Arc::new(hierarchy_violations_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .report_hierarchy_violations()
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.event_id.to_string())?;
                        encoder.encode_field(&r.event_title)?;
                        encoder.encode_field(&r.parent_event_id.to_string())?;
                        encoder.encode_field(&r.kind.as_str())?;
                        encoder.encode_field(&r.event_start)?;
                        encoder.encode_field(&r.event_end)?;
                        encoder.encode_field(&r.parent_start)?;
                        encoder.encode_field(&r.parent_end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectUtilization {
                organization_id,
                threshold_hours,
            } => {
                let rows_data = engine
                    .report_resource_utilization(organization_id, threshold_hours.unwrap_or(1.0))
                    .await;
                let schema = Arc::new(utilization_schema());
                let rows: Vec<PgWireResult<_>> = rows_data
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.organization_id.map(|o| o.to_string()))?;
                        encoder.encode_field(&r.resource_id.to_string())?;
                        encoder.encode_field(&r.resource_name)?;
                        encoder.encode_field(&(r.booked_ms as f64 / 3_600_000.0))?;
                        encoder.encode_field(&(r.peak_concurrent as i64))?;
                        encoder.encode_field(&r.underutilized)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectExternalAttendees { threshold } => {
                let schema = Arc::new(external_attendees_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .report_external_attendees(threshold)
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.event_id.to_string())?;
                        encoder.encode_field(&r.event_title)?;
                        encoder.encode_field(&(r.external_count as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn bool_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::BOOL, FieldFormat::Text)
}

fn float8_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::FLOAT8, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        bool_field("available"),
        int8_field("available_quantity"),
        int8_field("total_quantity"),
        int8_field("allocated_quantity"),
        int8_field("remaining_quantity"),
        int8_field("max_concurrent_usage"),
        int8_field("current_concurrent_usage"),
        int8_field("remaining_concurrent_capacity"),
    ]
}

fn conflicts_schema() -> Vec<FieldInfo> {
    vec![
        text_field("event_id"),
        text_field("event_title"),
        int8_field("start"),
        int8_field("end"),
        int8_field("allocated_quantity"),
    ]
}

fn resources_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        text_field("kind"),
        int8_field("total_quantity"),
        int8_field("max_concurrent_usage"),
        text_field("organization_id"),
    ]
}

fn events_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("title"),
        int8_field("start"),
        int8_field("end"),
        text_field("status"),
        text_field("organization_id"),
        text_field("parent_event_id"),
    ]
}

fn allocations_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("resource_id"),
        text_field("event_id"),
        int8_field("quantity"),
        int8_field("start"),
        int8_field("end"),
        bool_field("active"),
    ]
}

fn attendances_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("event_id"),
        text_field("user_id"),
        int8_field("checked_in_at"),
    ]
}

fn stock_entries_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("resource_id"),
        int8_field("at"),
        int8_field("delta"),
        text_field("note"),
    ]
}

fn double_booked_schema() -> Vec<FieldInfo> {
    vec![
        text_field("user_id"),
        text_field("first_event_id"),
        text_field("first_event_title"),
        int8_field("first_start"),
        text_field("second_event_id"),
        text_field("second_event_title"),
        int8_field("second_start"),
    ]
}

fn violated_constraints_schema() -> Vec<FieldInfo> {
    vec![
        text_field("resource_id"),
        text_field("resource_name"),
        text_field("kind"),
        int8_field("observed"),
        int8_field("allowed"),
        text_field("event_ids"),
    ]
}

fn hierarchy_violations_schema() -> Vec<FieldInfo> {
    vec![
        text_field("event_id"),
        text_field("event_title"),
        text_field("parent_event_id"),
        text_field("kind"),
        int8_field("event_start"),
        int8_field("event_end"),
        int8_field("parent_start"),
        int8_field("parent_end"),
    ]
}

fn utilization_schema() -> Vec<FieldInfo> {
    vec![
        text_field("organization_id"),
        text_field("resource_id"),
        text_field("resource_name"),
        float8_field("booked_hours"),
        int8_field("peak_concurrent_usage"),
        bool_field("underutilized"),
    ]
}

fn external_attendees_schema() -> Vec<FieldInfo> {
    vec![
        text_field("event_id"),
        text_field("event_title"),
        int8_field("external_count"),
    ]
}

/// Pick the result schema for a statement by the table it reads.
fn schema_for_statement(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.contains("SELECT") {
        return vec![];
    }
    if upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("CONFLICTS") {
        conflicts_schema()
    } else if upper.contains("DOUBLE_BOOKED_USERS") {
        double_booked_schema()
    } else if upper.contains("VIOLATED_CONSTRAINTS") {
        violated_constraints_schema()
    } else if upper.contains("HIERARCHY_VIOLATIONS") {
        hierarchy_violations_schema()
    } else if upper.contains("RESOURCE_UTILIZATION") {
        utilization_schema()
    } else if upper.contains("EXTERNAL_ATTENDEES") {
        external_attendees_schema()
    } else if upper.contains("STOCK_ENTRIES") {
        stock_entries_schema()
    } else if upper.contains("ATTENDANCES") {
        attendances_schema()
    } else if upper.contains("ALLOCATIONS") {
        allocations_schema()
    } else if upper.contains("RESOURCES") {
        resources_schema()
    } else if upper.contains("EVENTS") {
        events_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for AllotHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.run_command(&engine, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct AllotQueryParser;

#[async_trait]
impl QueryParser for AllotQueryParser {
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
        Ok(schema_for_statement(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for AllotHandler {
    type Statement = String;
    type QueryParser = AllotQueryParser;

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
        let mut responses = self.run_command(&engine, cmd).await?;
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
            schema_for_statement(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for_statement(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder present in the statement text.
fn count_params(sql: &str) -> usize {
    sql.match_indices('$')
        .filter_map(|(i, _)| {
            let digits: &str = &sql[i + 1..];
            let end = digits
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(digits.len());
            digits[..end].parse::<usize>().ok()
        })
        .max()
        .unwrap_or(0)
}

/// Inline text-format parameter bindings into the statement. Highest
/// placeholder first, so `$1` never matches inside `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let literal = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &literal);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct AllotFactory {
    handler: Arc<AllotHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<AllotAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl AllotFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = AllotAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(AllotHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for AllotFactory {
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

/// Serve one pgwire connection to completion.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> Result<(), io::Error> {
    let factory = AllotFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    let code = match &e {
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "42710",
        EngineError::ValidationFailed { .. } => "P0001",
        EngineError::Contended(_) => "40001",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58000",
    };
    // Rejections carry the capacity arithmetic inline so the caller can
    // explain "why" without a second round trip.
    let message = match &e {
        EngineError::ValidationFailed {
            reason,
            details: Some(d),
        } => match serde_json::to_string(d) {
            Ok(json) => format!("validation failed: {reason}; availability={json}"),
            Err(_) => e.to_string(),
        },
        _ => e.to_string(),
    };
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
