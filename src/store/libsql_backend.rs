//! libSQL backend: async `Database` and `StoreTransaction` implementation.
//!
//! One connection, guarded by an async mutex. A transaction owns the guard
//! from `BEGIN` until `COMMIT`/`ROLLBACK`, so statements from concurrent
//! requests can never interleave inside someone else's transaction. Write
//! transactions start with `BEGIN IMMEDIATE` and hold the write lock from
//! their first read.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::params::IntoParams;
use libsql::{Connection, Database as LibSqlDatabase, Row, params};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::onboarding::model::{
    InstanceStatus, InstanceSummary, OnboardingInstance, TaskInstance, TaskStatus,
};
use crate::store::migrations;
use crate::store::traits::{Database, StoreTransaction, TemplateReferences, TxMode};
use crate::templates::model::{OnboardingTemplate, TaskConfig, TaskTemplate, TemplateTask};
use crate::users::model::{UserProfile, UserRole};

struct Slot {
    conn: Connection,
    /// A transaction was begun and not yet finished.
    open_tx: bool,
}

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    slot: Arc<Mutex<Slot>>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::open(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::open(db).await
    }

    async fn open(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable foreign keys: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            slot: Arc::new(Mutex::new(Slot {
                conn,
                open_tx: false,
            })),
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Take the connection. A transaction abandoned by a cancelled caller is
    /// rolled back first. SQLite may already have rolled it back on its own
    /// (`RAISE(ROLLBACK)`, a full disk), in which case there is nothing to undo.
    async fn acquire(&self) -> Result<OwnedMutexGuard<Slot>, DatabaseError> {
        let mut slot = self.slot.clone().lock_owned().await;
        if slot.open_tx {
            slot.open_tx = false;
            if !slot.conn.is_autocommit() {
                warn!("Rolling back a transaction that was never finished");
                slot.conn
                    .execute("ROLLBACK", ())
                    .await
                    .map_err(|e| DatabaseError::Query(format!("stale rollback: {e}")))?;
            }
        }
        Ok(slot)
    }

    /// Raw SQL for tests that need to poke at the schema (triggers, faults).
    #[cfg(test)]
    pub(crate) async fn execute_batch(&self, sql: &str) -> Result<(), DatabaseError> {
        let slot = self.acquire().await?;
        slot.conn
            .execute_batch(sql)
            .await
            .map_err(|e| DatabaseError::Query(format!("execute_batch: {e}")))?;
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: fixed-width, so text order is time order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.filter(|s| !s.is_empty()).map(|s| parse_datetime(&s))
}

fn get_string(row: &Row, idx: i32, field: &str) -> Result<String, DatabaseError> {
    row.get(idx)
        .map_err(|e| DatabaseError::Query(format!("{field}: {e}")))
}

fn get_uuid(row: &Row, idx: i32, field: &str) -> Result<Uuid, DatabaseError> {
    let raw = get_string(row, idx, field)?;
    Uuid::parse_str(&raw).map_err(|e| DatabaseError::Serialization(format!("{field} parse: {e}")))
}

fn get_json(row: &Row, idx: i32, field: &str) -> Result<Option<serde_json::Value>, DatabaseError> {
    row.get::<String>(idx)
        .ok()
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| DatabaseError::Serialization(format!("{field}: {e}")))
}

fn to_json(value: &serde_json::Value) -> String {
    value.to_string()
}

/// Map a libsql write error, keeping constraint violations distinguishable.
fn write_error(op: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("constraint failed") {
        DatabaseError::Constraint(format!("{op}: {msg}"))
    } else {
        DatabaseError::Query(format!("{op}: {msg}"))
    }
}

async fn query_all<T>(
    conn: &Connection,
    op: &str,
    sql: &str,
    params: impl IntoParams,
    map: fn(&Row) -> Result<T, DatabaseError>,
) -> Result<Vec<T>, DatabaseError> {
    let mut rows = conn
        .query(sql, params)
        .await
        .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
    let mut out = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("{op} row: {e}")))?
    {
        out.push(map(&row)?);
    }
    Ok(out)
}

async fn query_opt<T>(
    conn: &Connection,
    op: &str,
    sql: &str,
    params: impl IntoParams,
    map: fn(&Row) -> Result<T, DatabaseError>,
) -> Result<Option<T>, DatabaseError> {
    let mut rows = conn
        .query(sql, params)
        .await
        .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
    match rows.next().await {
        Ok(Some(row)) => Ok(Some(map(&row)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("{op} row: {e}"))),
    }
}

async fn count(
    conn: &Connection,
    op: &str,
    sql: &str,
    params: impl IntoParams,
) -> Result<i64, DatabaseError> {
    Ok(query_opt(conn, op, sql, params, |row| {
        row.get::<i64>(0)
            .map_err(|e| DatabaseError::Query(format!("count: {e}")))
    })
    .await?
    .unwrap_or(0))
}

async fn execute(
    conn: &Connection,
    op: &str,
    sql: &str,
    params: impl IntoParams,
) -> Result<u64, DatabaseError> {
    conn.execute(sql, params).await.map_err(|e| write_error(op, e))
}

// ── Row mapping ─────────────────────────────────────────────────────

const INSTANCE_COLUMNS: &str =
    "i.id, i.user_id, i.assigned_by, i.onboarding_template_id, i.status, i.created_at, i.updated_at";

fn row_to_instance(row: &Row) -> Result<OnboardingInstance, DatabaseError> {
    let status_str = get_string(row, 4, "instance.status")?;
    Ok(OnboardingInstance {
        id: get_uuid(row, 0, "instance.id")?,
        user_id: get_string(row, 1, "instance.user_id")?,
        assigned_by: get_string(row, 2, "instance.assigned_by")?,
        onboarding_template_id: get_uuid(row, 3, "instance.onboarding_template_id")?,
        status: InstanceStatus::parse(&status_str).ok_or_else(|| {
            DatabaseError::Serialization(format!("unknown instance status {status_str}"))
        })?,
        created_at: parse_datetime(&get_string(row, 5, "instance.created_at")?),
        updated_at: parse_datetime(&get_string(row, 6, "instance.updated_at")?),
    })
}

const TASK_COLUMNS: &str = "ti.id, ti.onboarding_instance_id, ti.task_template_id, ti.status, \
     ti.ticket_info, ti.issue_key, ti.task_started_at, ti.task_completed_at, \
     ti.ticket_created_at, ti.ticket_closed_at, ti.created_at, ti.updated_at";

fn row_to_task(row: &Row) -> Result<TaskInstance, DatabaseError> {
    let status_str = get_string(row, 3, "task.status")?;
    Ok(TaskInstance {
        id: get_uuid(row, 0, "task.id")?,
        onboarding_instance_id: get_uuid(row, 1, "task.onboarding_instance_id")?,
        task_template_id: get_uuid(row, 2, "task.task_template_id")?,
        status: TaskStatus::parse(&status_str).ok_or_else(|| {
            DatabaseError::Serialization(format!("unknown task status {status_str}"))
        })?,
        ticket_info: get_json(row, 4, "task.ticket_info")?,
        issue_key: row.get::<String>(5).ok(),
        task_started_at: parse_optional_datetime(row.get(6).ok()),
        task_completed_at: parse_optional_datetime(row.get(7).ok()),
        ticket_created_at: parse_optional_datetime(row.get(8).ok()),
        ticket_closed_at: parse_optional_datetime(row.get(9).ok()),
        created_at: parse_datetime(&get_string(row, 10, "task.created_at")?),
        updated_at: parse_datetime(&get_string(row, 11, "task.updated_at")?),
    })
}

const TEMPLATE_COLUMNS: &str =
    "tt.id, tt.name, tt.description, tt.config, tt.created_by, tt.created_at, tt.updated_at";

/// Dependencies are attached separately by `attach_dependencies`.
fn row_to_task_template(row: &Row) -> Result<TaskTemplate, DatabaseError> {
    let config_str = get_string(row, 3, "task_template.config")?;
    let config: TaskConfig = serde_json::from_str(&config_str)
        .map_err(|e| DatabaseError::Serialization(format!("task_template.config: {e}")))?;
    Ok(TaskTemplate {
        id: get_uuid(row, 0, "task_template.id")?,
        name: get_string(row, 1, "task_template.name")?,
        description: row.get::<String>(2).unwrap_or_default(),
        config,
        depends_on: Vec::new(),
        created_by: row.get::<String>(4).ok(),
        created_at: parse_datetime(&get_string(row, 5, "task_template.created_at")?),
        updated_at: parse_datetime(&get_string(row, 6, "task_template.updated_at")?),
    })
}

const ONBOARDING_TEMPLATE_COLUMNS: &str =
    "ot.id, ot.name, ot.description, ot.created_by, ot.created_at, ot.updated_at";

/// Task order is attached separately by `attach_template_tasks`.
fn row_to_onboarding_template(row: &Row) -> Result<OnboardingTemplate, DatabaseError> {
    Ok(OnboardingTemplate {
        id: get_uuid(row, 0, "onboarding_template.id")?,
        name: get_string(row, 1, "onboarding_template.name")?,
        description: row.get::<String>(2).unwrap_or_default(),
        created_by: row.get::<String>(3).ok(),
        tasks: Vec::new(),
        created_at: parse_datetime(&get_string(row, 4, "onboarding_template.created_at")?),
        updated_at: parse_datetime(&get_string(row, 5, "onboarding_template.updated_at")?),
    })
}

const USER_COLUMNS: &str = "id, email, name, role, attributes, created_at, updated_at";

fn row_to_user(row: &Row) -> Result<UserProfile, DatabaseError> {
    let role = match get_string(row, 3, "user.role")?.as_str() {
        "admin" => UserRole::Admin,
        _ => UserRole::User,
    };
    let attributes = match get_json(row, 4, "user.attributes")? {
        Some(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    Ok(UserProfile {
        id: get_string(row, 0, "user.id")?,
        email: get_string(row, 1, "user.email")?,
        name: get_string(row, 2, "user.name")?,
        role,
        attributes,
        created_at: parse_datetime(&get_string(row, 5, "user.created_at")?),
        updated_at: parse_datetime(&get_string(row, 6, "user.updated_at")?),
    })
}

fn row_to_summary(row: &Row) -> Result<InstanceSummary, DatabaseError> {
    let status_str = get_string(row, 1, "summary.status")?;
    Ok(InstanceSummary {
        id: get_uuid(row, 0, "summary.id")?,
        status: InstanceStatus::parse(&status_str).ok_or_else(|| {
            DatabaseError::Serialization(format!("unknown instance status {status_str}"))
        })?,
        created_at: parse_datetime(&get_string(row, 2, "summary.created_at")?),
        user_id: get_string(row, 3, "summary.user_id")?,
        user_name: row.get::<String>(4).ok(),
        assigned_by: get_string(row, 5, "summary.assigned_by")?,
        admin_name: row.get::<String>(6).ok(),
        onboarding_template_id: get_uuid(row, 7, "summary.onboarding_template_id")?,
        template_name: row.get::<String>(8).ok(),
    })
}

fn row_to_uuid_pair(row: &Row) -> Result<(Uuid, Uuid), DatabaseError> {
    Ok((get_uuid(row, 0, "pair.0")?, get_uuid(row, 1, "pair.1")?))
}

fn row_to_template_task(row: &Row) -> Result<(Uuid, TemplateTask), DatabaseError> {
    Ok((
        get_uuid(row, 0, "template_task.onboarding_template_id")?,
        TemplateTask {
            task_template_id: get_uuid(row, 1, "template_task.task_template_id")?,
            order: row.get::<i64>(2).unwrap_or(0),
        },
    ))
}

// ── Shared queries ──────────────────────────────────────────────────

async fn attach_dependencies(
    conn: &Connection,
    templates: &mut [TaskTemplate],
) -> Result<(), DatabaseError> {
    if templates.is_empty() {
        return Ok(());
    }
    let pairs = query_all(
        conn,
        "attach_dependencies",
        "SELECT task_template_id, depends_on_id FROM task_template_dependencies \
         ORDER BY task_template_id, position",
        (),
        row_to_uuid_pair,
    )
    .await?;
    let mut by_template: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for (template, dep) in pairs {
        by_template.entry(template).or_default().push(dep);
    }
    for template in templates.iter_mut() {
        template.depends_on = by_template.remove(&template.id).unwrap_or_default();
    }
    Ok(())
}

async fn attach_template_tasks(
    conn: &Connection,
    templates: &mut [OnboardingTemplate],
) -> Result<(), DatabaseError> {
    if templates.is_empty() {
        return Ok(());
    }
    let rows = query_all(
        conn,
        "attach_template_tasks",
        "SELECT onboarding_template_id, task_template_id, task_order \
         FROM onboarding_template_tasks ORDER BY onboarding_template_id, task_order",
        (),
        row_to_template_task,
    )
    .await?;
    let mut by_template: HashMap<Uuid, Vec<TemplateTask>> = HashMap::new();
    for (template, task) in rows {
        by_template.entry(template).or_default().push(task);
    }
    for template in templates.iter_mut() {
        template.tasks = by_template.remove(&template.id).unwrap_or_default();
    }
    Ok(())
}

// ── Transactions ────────────────────────────────────────────────────

/// An open transaction holding the connection guard.
pub struct LibSqlTransaction {
    slot: OwnedMutexGuard<Slot>,
}

impl LibSqlTransaction {
    fn conn(&self) -> &Connection {
        &self.slot.conn
    }

    async fn finish(mut self: Box<Self>, statement: &str) -> Result<(), DatabaseError> {
        let result = self.slot.conn.execute(statement, ()).await;
        // A failed COMMIT can leave the transaction open (SQLITE_BUSY); the
        // next acquire rolls it back. Anything else has already ended it.
        self.slot.open_tx = !self.slot.conn.is_autocommit();
        if let Err(e) = result {
            if statement == "ROLLBACK" && !self.slot.open_tx {
                debug!(error = %e, "Transaction was already rolled back by SQLite");
                return Ok(());
            }
            return Err(DatabaseError::Query(format!("{statement}: {e}")));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for LibSqlTransaction {
    // ── Onboarding instances ────────────────────────────────────────

    async fn get_onboarding_instance(
        &mut self,
        id: Uuid,
    ) -> Result<Option<OnboardingInstance>, DatabaseError> {
        query_opt(
            self.conn(),
            "get_onboarding_instance",
            &format!("SELECT {INSTANCE_COLUMNS} FROM onboarding_instances i WHERE i.id = ?1"),
            params![id.to_string()],
            row_to_instance,
        )
        .await
    }

    async fn insert_onboarding_instance(
        &mut self,
        instance: &OnboardingInstance,
    ) -> Result<(), DatabaseError> {
        execute(
            self.conn(),
            "insert_onboarding_instance",
            "INSERT INTO onboarding_instances \
             (id, user_id, assigned_by, onboarding_template_id, status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                instance.id.to_string(),
                instance.user_id.as_str(),
                instance.assigned_by.as_str(),
                instance.onboarding_template_id.to_string(),
                instance.status.as_str(),
                ts(&instance.created_at),
                ts(&instance.updated_at),
            ],
        )
        .await?;
        debug!(instance_id = %instance.id, "Inserted onboarding instance");
        Ok(())
    }

    async fn update_instance_status(
        &mut self,
        id: Uuid,
        status: InstanceStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = execute(
            self.conn(),
            "update_instance_status",
            "UPDATE onboarding_instances SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), status.as_str(), ts(&now)],
        )
        .await?;
        Ok(changed > 0)
    }

    async fn delete_onboarding_instance(&mut self, id: Uuid) -> Result<bool, DatabaseError> {
        let deleted = execute(
            self.conn(),
            "delete_onboarding_instance",
            "DELETE FROM onboarding_instances WHERE id = ?1",
            params![id.to_string()],
        )
        .await?;
        Ok(deleted > 0)
    }

    // ── Task instances ──────────────────────────────────────────────

    async fn get_task_instance(&mut self, id: Uuid) -> Result<Option<TaskInstance>, DatabaseError> {
        query_opt(
            self.conn(),
            "get_task_instance",
            &format!("SELECT {TASK_COLUMNS} FROM task_instances ti WHERE ti.id = ?1"),
            params![id.to_string()],
            row_to_task,
        )
        .await
    }

    async fn list_instance_tasks(
        &mut self,
        instance_id: Uuid,
    ) -> Result<Vec<TaskInstance>, DatabaseError> {
        query_all(
            self.conn(),
            "list_instance_tasks",
            &format!(
                "SELECT {TASK_COLUMNS} FROM task_instances ti \
                 JOIN onboarding_instances i ON i.id = ti.onboarding_instance_id \
                 LEFT JOIN onboarding_template_tasks ott \
                   ON ott.onboarding_template_id = i.onboarding_template_id \
                  AND ott.task_template_id = ti.task_template_id \
                 WHERE ti.onboarding_instance_id = ?1 \
                 ORDER BY COALESCE(ott.task_order, 9223372036854775807), ti.created_at, ti.id"
            ),
            params![instance_id.to_string()],
            row_to_task,
        )
        .await
    }

    async fn insert_task_instance(&mut self, task: &TaskInstance) -> Result<(), DatabaseError> {
        execute(
            self.conn(),
            "insert_task_instance",
            "INSERT INTO task_instances \
             (id, onboarding_instance_id, task_template_id, status, ticket_info, issue_key, \
              task_started_at, task_completed_at, ticket_created_at, ticket_closed_at, \
              created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                task.id.to_string(),
                task.onboarding_instance_id.to_string(),
                task.task_template_id.to_string(),
                task.status.as_str(),
                task.ticket_info.as_ref().map(to_json),
                task.issue_key.clone(),
                task.task_started_at.as_ref().map(ts),
                task.task_completed_at.as_ref().map(ts),
                task.ticket_created_at.as_ref().map(ts),
                task.ticket_closed_at.as_ref().map(ts),
                ts(&task.created_at),
                ts(&task.updated_at),
            ],
        )
        .await?;
        Ok(())
    }

    async fn update_task_instance(&mut self, task: &TaskInstance) -> Result<(), DatabaseError> {
        let changed = execute(
            self.conn(),
            "update_task_instance",
            "UPDATE task_instances SET status = ?2, ticket_info = ?3, issue_key = ?4, \
             task_started_at = ?5, task_completed_at = ?6, ticket_created_at = ?7, \
             ticket_closed_at = ?8, updated_at = ?9 WHERE id = ?1",
            params![
                task.id.to_string(),
                task.status.as_str(),
                task.ticket_info.as_ref().map(to_json),
                task.issue_key.clone(),
                task.task_started_at.as_ref().map(ts),
                task.task_completed_at.as_ref().map(ts),
                task.ticket_created_at.as_ref().map(ts),
                task.ticket_closed_at.as_ref().map(ts),
                ts(&task.updated_at),
            ],
        )
        .await?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "task".into(),
                id: task.id.to_string(),
            });
        }
        debug!(task_id = %task.id, status = %task.status, "Updated task instance");
        Ok(())
    }

    // ── Task templates ──────────────────────────────────────────────

    async fn get_task_template(&mut self, id: Uuid) -> Result<Option<TaskTemplate>, DatabaseError> {
        let found = query_opt(
            self.conn(),
            "get_task_template",
            &format!("SELECT {TEMPLATE_COLUMNS} FROM task_templates tt WHERE tt.id = ?1"),
            params![id.to_string()],
            row_to_task_template,
        )
        .await?;
        match found {
            Some(template) => {
                let mut one = [template];
                attach_dependencies(self.conn(), &mut one).await?;
                let [template] = one;
                Ok(Some(template))
            }
            None => Ok(None),
        }
    }

    async fn list_task_templates(&mut self) -> Result<Vec<TaskTemplate>, DatabaseError> {
        let mut templates = query_all(
            self.conn(),
            "list_task_templates",
            &format!("SELECT {TEMPLATE_COLUMNS} FROM task_templates tt ORDER BY tt.name, tt.id"),
            (),
            row_to_task_template,
        )
        .await?;
        attach_dependencies(self.conn(), &mut templates).await?;
        Ok(templates)
    }

    async fn instance_task_templates(
        &mut self,
        instance_id: Uuid,
    ) -> Result<Vec<TaskTemplate>, DatabaseError> {
        let mut templates = query_all(
            self.conn(),
            "instance_task_templates",
            &format!(
                "SELECT {TEMPLATE_COLUMNS} FROM task_templates tt WHERE tt.id IN \
                 (SELECT task_template_id FROM task_instances WHERE onboarding_instance_id = ?1)"
            ),
            params![instance_id.to_string()],
            row_to_task_template,
        )
        .await?;
        attach_dependencies(self.conn(), &mut templates).await?;
        Ok(templates)
    }

    async fn save_task_template(&mut self, template: &TaskTemplate) -> Result<(), DatabaseError> {
        let config = serde_json::to_string(&template.config)
            .map_err(|e| DatabaseError::Serialization(format!("task_template.config: {e}")))?;
        execute(
            self.conn(),
            "save_task_template",
            "INSERT INTO task_templates \
             (id, name, description, task_type, config, created_by, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, \
             description = excluded.description, task_type = excluded.task_type, \
             config = excluded.config, updated_at = excluded.updated_at",
            params![
                template.id.to_string(),
                template.name.as_str(),
                template.description.as_str(),
                template.task_type().as_str(),
                config,
                template.created_by.clone(),
                ts(&template.created_at),
                ts(&template.updated_at),
            ],
        )
        .await?;
        execute(
            self.conn(),
            "save_task_template deps",
            "DELETE FROM task_template_dependencies WHERE task_template_id = ?1",
            params![template.id.to_string()],
        )
        .await?;
        for (position, dep) in template.depends_on.iter().enumerate() {
            execute(
                self.conn(),
                "save_task_template dep",
                "INSERT INTO task_template_dependencies (task_template_id, depends_on_id, position) \
                 VALUES (?1, ?2, ?3)",
                params![template.id.to_string(), dep.to_string(), position as i64],
            )
            .await?;
        }
        debug!(template_id = %template.id, deps = template.depends_on.len(), "Saved task template");
        Ok(())
    }

    async fn delete_task_template(&mut self, id: Uuid) -> Result<bool, DatabaseError> {
        let deleted = execute(
            self.conn(),
            "delete_task_template",
            "DELETE FROM task_templates WHERE id = ?1",
            params![id.to_string()],
        )
        .await?;
        Ok(deleted > 0)
    }

    async fn task_template_references(
        &mut self,
        id: Uuid,
    ) -> Result<TemplateReferences, DatabaseError> {
        let id = id.to_string();
        Ok(TemplateReferences {
            onboarding_templates: count(
                self.conn(),
                "references onboarding_templates",
                "SELECT COUNT(*) FROM onboarding_template_tasks WHERE task_template_id = ?1",
                params![id.as_str()],
            )
            .await?,
            task_instances: count(
                self.conn(),
                "references task_instances",
                "SELECT COUNT(*) FROM task_instances WHERE task_template_id = ?1",
                params![id.as_str()],
            )
            .await?,
            dependents: count(
                self.conn(),
                "references dependents",
                "SELECT COUNT(*) FROM task_template_dependencies WHERE depends_on_id = ?1",
                params![id.as_str()],
            )
            .await?,
        })
    }

    // ── Onboarding templates ────────────────────────────────────────

    async fn get_onboarding_template(
        &mut self,
        id: Uuid,
    ) -> Result<Option<OnboardingTemplate>, DatabaseError> {
        let found = query_opt(
            self.conn(),
            "get_onboarding_template",
            &format!(
                "SELECT {ONBOARDING_TEMPLATE_COLUMNS} FROM onboarding_templates ot WHERE ot.id = ?1"
            ),
            params![id.to_string()],
            row_to_onboarding_template,
        )
        .await?;
        let Some(mut template) = found else {
            return Ok(None);
        };
        template.tasks = query_all(
            self.conn(),
            "get_onboarding_template tasks",
            "SELECT onboarding_template_id, task_template_id, task_order \
             FROM onboarding_template_tasks WHERE onboarding_template_id = ?1 ORDER BY task_order",
            params![id.to_string()],
            row_to_template_task,
        )
        .await?
        .into_iter()
        .map(|(_, task)| task)
        .collect();
        Ok(Some(template))
    }

    async fn list_onboarding_templates(&mut self) -> Result<Vec<OnboardingTemplate>, DatabaseError> {
        let mut templates = query_all(
            self.conn(),
            "list_onboarding_templates",
            &format!(
                "SELECT {ONBOARDING_TEMPLATE_COLUMNS} FROM onboarding_templates ot \
                 ORDER BY ot.created_at DESC, ot.id"
            ),
            (),
            row_to_onboarding_template,
        )
        .await?;
        attach_template_tasks(self.conn(), &mut templates).await?;
        Ok(templates)
    }

    async fn onboarding_template_tasks(
        &mut self,
        template_id: Uuid,
    ) -> Result<Option<Vec<TaskTemplate>>, DatabaseError> {
        let exists = count(
            self.conn(),
            "onboarding_template_tasks exists",
            "SELECT COUNT(*) FROM onboarding_templates WHERE id = ?1",
            params![template_id.to_string()],
        )
        .await?;
        if exists == 0 {
            return Ok(None);
        }
        let mut templates = query_all(
            self.conn(),
            "onboarding_template_tasks",
            &format!(
                "SELECT {TEMPLATE_COLUMNS} FROM onboarding_template_tasks ott \
                 JOIN task_templates tt ON tt.id = ott.task_template_id \
                 WHERE ott.onboarding_template_id = ?1 ORDER BY ott.task_order"
            ),
            params![template_id.to_string()],
            row_to_task_template,
        )
        .await?;
        attach_dependencies(self.conn(), &mut templates).await?;
        Ok(Some(templates))
    }

    async fn save_onboarding_template(
        &mut self,
        template: &OnboardingTemplate,
    ) -> Result<(), DatabaseError> {
        execute(
            self.conn(),
            "save_onboarding_template",
            "INSERT INTO onboarding_templates \
             (id, name, description, created_by, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, \
             description = excluded.description, updated_at = excluded.updated_at",
            params![
                template.id.to_string(),
                template.name.as_str(),
                template.description.as_str(),
                template.created_by.clone(),
                ts(&template.created_at),
                ts(&template.updated_at),
            ],
        )
        .await?;
        execute(
            self.conn(),
            "save_onboarding_template tasks",
            "DELETE FROM onboarding_template_tasks WHERE onboarding_template_id = ?1",
            params![template.id.to_string()],
        )
        .await?;
        for task in &template.tasks {
            execute(
                self.conn(),
                "save_onboarding_template task",
                "INSERT INTO onboarding_template_tasks \
                 (onboarding_template_id, task_template_id, task_order) VALUES (?1, ?2, ?3)",
                params![
                    template.id.to_string(),
                    task.task_template_id.to_string(),
                    task.order
                ],
            )
            .await?;
        }
        debug!(template_id = %template.id, tasks = template.tasks.len(), "Saved onboarding template");
        Ok(())
    }

    async fn delete_onboarding_template(&mut self, id: Uuid) -> Result<bool, DatabaseError> {
        let deleted = execute(
            self.conn(),
            "delete_onboarding_template",
            "DELETE FROM onboarding_templates WHERE id = ?1",
            params![id.to_string()],
        )
        .await?;
        Ok(deleted > 0)
    }

    async fn count_template_instances(&mut self, id: Uuid) -> Result<i64, DatabaseError> {
        count(
            self.conn(),
            "count_template_instances",
            "SELECT COUNT(*) FROM onboarding_instances WHERE onboarding_template_id = ?1",
            params![id.to_string()],
        )
        .await
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
        self.finish("ROLLBACK").await
    }
}

// ── Database trait implementation ───────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        let slot = self.acquire().await?;
        migrations::run_migrations(&slot.conn).await
    }

    async fn begin(&self, mode: TxMode) -> Result<Box<dyn StoreTransaction>, DatabaseError> {
        let mut slot = self.acquire().await?;
        let statement = match mode {
            TxMode::Read => "BEGIN DEFERRED",
            TxMode::Write => "BEGIN IMMEDIATE",
        };
        slot.conn
            .execute(statement, ())
            .await
            .map_err(|e| DatabaseError::Query(format!("{statement}: {e}")))?;
        slot.open_tx = true;
        Ok(Box::new(LibSqlTransaction { slot }))
    }

    // ── Users ───────────────────────────────────────────────────────

    async fn insert_user(&self, user: &UserProfile) -> Result<(), DatabaseError> {
        let slot = self.acquire().await?;
        execute(
            &slot.conn,
            "insert_user",
            "INSERT INTO users (id, email, name, role, attributes, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                user.id.as_str(),
                user.email.as_str(),
                user.name.as_str(),
                user.role.as_str(),
                serde_json::Value::Object(user.attributes.clone()).to_string(),
                ts(&user.created_at),
                ts(&user.updated_at),
            ],
        )
        .await?;
        debug!(user_id = %user.id, "Inserted user");
        Ok(())
    }

    async fn get_user(&self, id: &str) -> Result<Option<UserProfile>, DatabaseError> {
        let slot = self.acquire().await?;
        query_opt(
            &slot.conn,
            "get_user",
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            params![id],
            row_to_user,
        )
        .await
    }

    async fn list_users(&self) -> Result<Vec<UserProfile>, DatabaseError> {
        let slot = self.acquire().await?;
        query_all(
            &slot.conn,
            "list_users",
            &format!("SELECT {USER_COLUMNS} FROM users ORDER BY name, id"),
            (),
            row_to_user,
        )
        .await
    }

    // ── Instance listings ───────────────────────────────────────────

    async fn list_instance_summaries(&self) -> Result<Vec<InstanceSummary>, DatabaseError> {
        let slot = self.acquire().await?;
        query_all(
            &slot.conn,
            "list_instance_summaries",
            "SELECT i.id, i.status, i.created_at, i.user_id, u.name, i.assigned_by, a.name, \
                    i.onboarding_template_id, ot.name \
             FROM onboarding_instances i \
             LEFT JOIN users u ON u.id = i.user_id \
             LEFT JOIN users a ON a.id = i.assigned_by \
             LEFT JOIN onboarding_templates ot ON ot.id = i.onboarding_template_id \
             ORDER BY i.created_at DESC, i.id",
            (),
            row_to_summary,
        )
        .await
    }

    async fn list_user_instances(
        &self,
        user_id: &str,
    ) -> Result<Vec<OnboardingInstance>, DatabaseError> {
        let slot = self.acquire().await?;
        query_all(
            &slot.conn,
            "list_user_instances",
            &format!(
                "SELECT {INSTANCE_COLUMNS} FROM onboarding_instances i \
                 WHERE i.user_id = ?1 AND i.status != 'completed' \
                 ORDER BY i.created_at, i.id"
            ),
            params![user_id],
            row_to_instance,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::model::TaskConfig;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    /// Two task templates (B depends on A) bundled into one onboarding template.
    async fn seed(db: &LibSqlBackend) -> (TaskTemplate, TaskTemplate, OnboardingTemplate) {
        let a = TaskTemplate::new("Badge", TaskConfig::Manual);
        let b = TaskTemplate::new("Laptop", TaskConfig::Manual).depending_on([a.id]);
        let onboarding = OnboardingTemplate::new("Engineering", [a.id, b.id]);

        let mut tx = db.begin(TxMode::Write).await.unwrap();
        tx.save_task_template(&a).await.unwrap();
        tx.save_task_template(&b).await.unwrap();
        tx.save_onboarding_template(&onboarding).await.unwrap();
        tx.commit().await.unwrap();
        (a, b, onboarding)
    }

    #[tokio::test]
    async fn task_template_round_trip_keeps_dependency_order() {
        let db = test_db().await;
        let a = TaskTemplate::new("A", TaskConfig::Manual);
        let b = TaskTemplate::new("B", TaskConfig::Manual);
        let c = TaskTemplate::new("C", TaskConfig::Manual).depending_on([b.id, a.id]);

        let mut tx = db.begin(TxMode::Write).await.unwrap();
        for t in [&a, &b, &c] {
            tx.save_task_template(t).await.unwrap();
        }
        let fetched = tx.get_task_template(c.id).await.unwrap().unwrap();
        tx.commit().await.unwrap();

        assert_eq!(fetched.depends_on, vec![b.id, a.id]);
        assert_eq!(fetched.config, TaskConfig::Manual);
        assert_eq!(fetched.created_at, c.created_at);
    }

    #[tokio::test]
    async fn onboarding_template_tasks_follow_order() {
        let db = test_db().await;
        let (a, b, onboarding) = seed(&db).await;

        let mut tx = db.begin(TxMode::Read).await.unwrap();
        let tasks = tx
            .onboarding_template_tasks(onboarding.id)
            .await
            .unwrap()
            .unwrap();
        let missing = tx.onboarding_template_tasks(Uuid::new_v4()).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(
            tasks.iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![a.id, b.id]
        );
        assert_eq!(tasks[1].depends_on, vec![a.id]);
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let db = test_db().await;
        let (_, _, onboarding) = seed(&db).await;
        let instance = OnboardingInstance::new("u-1", onboarding.id, "admin");

        let mut tx = db.begin(TxMode::Write).await.unwrap();
        tx.insert_onboarding_instance(&instance).await.unwrap();
        tx.rollback().await.unwrap();

        let mut tx = db.begin(TxMode::Read).await.unwrap();
        assert!(tx.get_onboarding_instance(instance.id).await.unwrap().is_none());
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_transaction_is_rolled_back_on_next_use() {
        let db = test_db().await;
        let (_, _, onboarding) = seed(&db).await;
        let instance = OnboardingInstance::new("u-1", onboarding.id, "admin");

        {
            let mut tx = db.begin(TxMode::Write).await.unwrap();
            tx.insert_onboarding_instance(&instance).await.unwrap();
        }

        let mut tx = db.begin(TxMode::Read).await.unwrap();
        assert!(tx.get_onboarding_instance(instance.id).await.unwrap().is_none());
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn connection_survives_sqlite_rolling_back_on_its_own() {
        let db = test_db().await;
        let (a, _, onboarding) = seed(&db).await;
        db.execute_batch(
            "CREATE TRIGGER abort_status BEFORE UPDATE OF status ON task_instances \
             BEGIN SELECT RAISE(ROLLBACK, 'sqlite rolled back'); END;",
        )
        .await
        .unwrap();

        let instance = OnboardingInstance::new("u-1", onboarding.id, "admin");
        let mut task = TaskInstance::new(instance.id, a.id, TaskStatus::NotStarted);
        let mut tx = db.begin(TxMode::Write).await.unwrap();
        tx.insert_onboarding_instance(&instance).await.unwrap();
        tx.insert_task_instance(&task).await.unwrap();
        task.status = TaskStatus::Completed;
        let err = tx.update_task_instance(&task).await.unwrap_err();
        assert!(err.to_string().contains("sqlite rolled back"), "{err}");
        tx.rollback().await.unwrap();

        // A second auto-rolled-back transaction abandoned without finishing.
        {
            let mut tx = db.begin(TxMode::Write).await.unwrap();
            tx.insert_onboarding_instance(&instance).await.unwrap();
            tx.insert_task_instance(&task).await.unwrap();
            tx.update_task_instance(&task).await.unwrap_err();
        }

        db.execute_batch("DROP TRIGGER abort_status;").await.unwrap();
        let mut tx = db.begin(TxMode::Read).await.unwrap();
        assert!(tx.get_onboarding_instance(instance.id).await.unwrap().is_none());
        tx.commit().await.unwrap();
        assert!(db.list_instance_summaries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn task_instance_round_trip() {
        let db = test_db().await;
        let (a, _, onboarding) = seed(&db).await;
        let instance = OnboardingInstance::new("u-1", onboarding.id, "admin");
        let mut task = TaskInstance::new(instance.id, a.id, TaskStatus::NotStarted);

        let mut tx = db.begin(TxMode::Write).await.unwrap();
        tx.insert_onboarding_instance(&instance).await.unwrap();
        tx.insert_task_instance(&task).await.unwrap();

        task.status = TaskStatus::InProgress;
        task.ticket_info = Some(serde_json::json!({"issueKey": "IT-4", "fields": [1, 2]}));
        task.issue_key = Some("IT-4".into());
        task.task_started_at = Some(Utc::now());
        tx.update_task_instance(&task).await.unwrap();

        let fetched = tx.get_task_instance(task.id).await.unwrap().unwrap();
        tx.commit().await.unwrap();
        assert_eq!(fetched, task);
    }

    #[tokio::test]
    async fn duplicate_task_instance_violates_constraint() {
        let db = test_db().await;
        let (a, _, onboarding) = seed(&db).await;
        let instance = OnboardingInstance::new("u-1", onboarding.id, "admin");

        let mut tx = db.begin(TxMode::Write).await.unwrap();
        tx.insert_onboarding_instance(&instance).await.unwrap();
        tx.insert_task_instance(&TaskInstance::new(instance.id, a.id, TaskStatus::NotStarted))
            .await
            .unwrap();
        let err = tx
            .insert_task_instance(&TaskInstance::new(instance.id, a.id, TaskStatus::NotStarted))
            .await
            .unwrap_err();
        tx.rollback().await.unwrap();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn deleting_instance_cascades_to_tasks() {
        let db = test_db().await;
        let (a, _, onboarding) = seed(&db).await;
        let instance = OnboardingInstance::new("u-1", onboarding.id, "admin");
        let task = TaskInstance::new(instance.id, a.id, TaskStatus::NotStarted);

        let mut tx = db.begin(TxMode::Write).await.unwrap();
        tx.insert_onboarding_instance(&instance).await.unwrap();
        tx.insert_task_instance(&task).await.unwrap();
        assert!(tx.delete_onboarding_instance(instance.id).await.unwrap());
        assert!(tx.get_task_instance(task.id).await.unwrap().is_none());
        assert!(!tx.delete_onboarding_instance(instance.id).await.unwrap());
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn template_references_are_counted() {
        let db = test_db().await;
        let (a, b, _) = seed(&db).await;

        let mut tx = db.begin(TxMode::Read).await.unwrap();
        let refs_a = tx.task_template_references(a.id).await.unwrap();
        let refs_b = tx.task_template_references(b.id).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(refs_a.onboarding_templates, 1);
        assert_eq!(refs_a.dependents, 1);
        assert_eq!(refs_b.dependents, 0);
        assert!(refs_b.is_referenced());
    }

    #[tokio::test]
    async fn users_and_summaries() {
        let db = test_db().await;
        let (_, _, onboarding) = seed(&db).await;
        let admin = UserProfile::new("admin@example.com", "Grace", UserRole::Admin);
        let user = UserProfile::new("ada@example.com", "Ada", UserRole::User)
            .with_attribute("department", serde_json::json!("Platform"));
        db.insert_user(&admin).await.unwrap();
        db.insert_user(&user).await.unwrap();

        let dup = UserProfile::new("ada@example.com", "Ada 2", UserRole::User);
        assert!(matches!(
            db.insert_user(&dup).await,
            Err(DatabaseError::Constraint(_))
        ));

        let fetched = db.get_user(&user.id).await.unwrap().unwrap();
        assert_eq!(fetched.field("department"), Some(serde_json::json!("Platform")));
        assert_eq!(db.list_users().await.unwrap().len(), 2);

        let instance = OnboardingInstance::new(user.id.clone(), onboarding.id, admin.id.clone());
        let mut tx = db.begin(TxMode::Write).await.unwrap();
        tx.insert_onboarding_instance(&instance).await.unwrap();
        tx.commit().await.unwrap();

        let summaries = db.list_instance_summaries().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].user_name.as_deref(), Some("Ada"));
        assert_eq!(summaries[0].admin_name.as_deref(), Some("Grace"));
        assert_eq!(summaries[0].template_name.as_deref(), Some("Engineering"));

        assert_eq!(db.list_user_instances(&user.id).await.unwrap().len(), 1);
        let mut tx = db.begin(TxMode::Write).await.unwrap();
        tx.update_instance_status(instance.id, InstanceStatus::Completed, Utc::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert!(db.list_user_instances(&user.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn new_local_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("onboarding.db");
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        seed(&db).await;
        assert!(path.exists());
    }
}
