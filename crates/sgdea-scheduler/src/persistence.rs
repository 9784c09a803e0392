//! SQLite-backed persistence for users, records, notifications and workflows.
//! One connection per job run; each job runs to completion on it.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use std::path::Path;
use std::str::FromStr;

use sgdea_core::error::{Result, SgdeaError};
use sgdea_core::traits::{
    AuditLog, NotificationStore, PurgeRule, TriggerSource, UserDirectory, WorkflowStore,
};
use sgdea_core::types::{
    AuditEntry, Certificado, EntityKind, EntityRef, Expediente, LifecycleStage, NewAuditEntry,
    NewNotification, NewUser, Notification, NotificationStatus, Prestamo, Priority, User, UserId,
    WorkflowInstance, WorkflowState, WorkflowTask,
};

/// SQLite store implementing every repository trait.
pub struct SgdeaDb {
    conn: Connection,
}

/// Fixed-width UTC timestamp; lexical order of the column equals time order.
pub fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn get_ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn get_opt_ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| conversion_err(idx, e))
    })
    .transpose()
}

fn get_enum<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = SgdeaError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_err(idx, e))
}

fn db_err(context: &'static str) -> impl Fn(rusqlite::Error) -> SgdeaError {
    move |e| SgdeaError::Database(format!("{context}: {e}"))
}

const NOTIFICATION_SELECT: &str = "SELECT id,user_id,type,title,message,priority,status,is_automatic,entity_kind,entity_id,created_at,read_at,archived_at FROM notifications";

fn row_to_notification(row: &rusqlite::Row) -> rusqlite::Result<Notification> {
    let entity_kind: Option<String> = row.get(8)?;
    let entity_id: Option<i64> = row.get(9)?;
    let entity = match (entity_kind, entity_id) {
        (Some(kind), Some(id)) => {
            let kind: EntityKind = kind.parse().map_err(|e| conversion_err(8, e))?;
            Some(EntityRef::new(kind, id))
        }
        _ => None,
    };
    Ok(Notification {
        id: row.get(0)?,
        user_id: row.get(1)?,
        notification_type: row.get(2)?,
        title: row.get(3)?,
        message: row.get(4)?,
        priority: get_enum(row, 5)?,
        status: get_enum(row, 6)?,
        is_automatic: row.get::<_, i32>(7)? != 0,
        entity,
        created_at: get_ts(row, 10)?,
        read_at: get_opt_ts(row, 11)?,
        archived_at: get_opt_ts(row, 12)?,
    })
}

const USER_SELECT: &str = "SELECT id,name,email,phone,role,supervisor_id,active FROM users";

fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        phone: row.get(3)?,
        role: row.get(4)?,
        supervisor_id: row.get(5)?,
        active: row.get::<_, i32>(6)? != 0,
    })
}

const EXPEDIENTE_SELECT: &str = "SELECT id,code,title,responsible_id,lifecycle_stage,opened_at,closed_at FROM expedientes";

fn row_to_expediente(row: &rusqlite::Row) -> rusqlite::Result<Expediente> {
    Ok(Expediente {
        id: row.get(0)?,
        code: row.get(1)?,
        title: row.get(2)?,
        responsible_id: row.get(3)?,
        lifecycle_stage: get_enum(row, 4)?,
        opened_at: get_ts(row, 5)?,
        closed_at: get_opt_ts(row, 6)?,
    })
}

const LOAN_SELECT: &str = "SELECT id,expediente_id,borrower_id,status,loaned_at,due_at,returned_at FROM prestamos";

fn row_to_loan(row: &rusqlite::Row) -> rusqlite::Result<Prestamo> {
    Ok(Prestamo {
        id: row.get(0)?,
        expediente_id: row.get(1)?,
        borrower_id: row.get(2)?,
        status: get_enum(row, 3)?,
        loaned_at: get_ts(row, 4)?,
        due_at: get_ts(row, 5)?,
        returned_at: get_opt_ts(row, 6)?,
    })
}

const CERTIFICATE_SELECT: &str = "SELECT id,serial,issuer,subject,owner_id,valid_from,valid_to,state FROM certificados";

fn row_to_certificate(row: &rusqlite::Row) -> rusqlite::Result<Certificado> {
    Ok(Certificado {
        id: row.get(0)?,
        serial: row.get(1)?,
        issuer: row.get(2)?,
        subject: row.get(3)?,
        owner_id: row.get(4)?,
        valid_from: get_ts(row, 5)?,
        valid_to: get_ts(row, 6)?,
        state: get_enum(row, 7)?,
    })
}

const INSTANCE_SELECT: &str = "SELECT id,name,state,started_at,completed_at,archived,archived_at FROM workflow_instances";

fn row_to_instance(row: &rusqlite::Row) -> rusqlite::Result<WorkflowInstance> {
    Ok(WorkflowInstance {
        id: row.get(0)?,
        name: row.get(1)?,
        state: get_enum(row, 2)?,
        started_at: get_ts(row, 3)?,
        completed_at: get_opt_ts(row, 4)?,
        archived: row.get::<_, i32>(5)? != 0,
        archived_at: get_opt_ts(row, 6)?,
    })
}

const TASK_SELECT: &str = "SELECT id,instance_id,name,status,assignee_id,escalation_target_id,deadline,escalation_level,escalated_at FROM workflow_tasks";

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<WorkflowTask> {
    Ok(WorkflowTask {
        id: row.get(0)?,
        instance_id: row.get(1)?,
        name: row.get(2)?,
        status: get_enum(row, 3)?,
        assignee_id: row.get(4)?,
        escalation_target_id: row.get(5)?,
        deadline: get_ts(row, 6)?,
        escalation_level: row.get(7)?,
        escalated_at: get_opt_ts(row, 8)?,
    })
}

fn row_to_audit(row: &rusqlite::Row) -> rusqlite::Result<AuditEntry> {
    Ok(AuditEntry {
        id: row.get(0)?,
        event_type: row.get(1)?,
        actor: row.get(2)?,
        subject: row.get(3)?,
        details: row.get(4)?,
        created_at: get_ts(row, 5)?,
    })
}

fn opt_text(dt: Option<DateTime<Utc>>) -> Value {
    dt.map_or(Value::Null, |d| Value::Text(ts(d)))
}

impl SgdeaDb {
    /// Open or create the database and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err("DB open"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(db_err("DB pragma"))?;

        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// In-memory database, used by tests and dry runs against fixtures.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("DB open"))?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Run schema migrations.
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                email TEXT,
                phone TEXT,
                role TEXT NOT NULL DEFAULT 'user',
                supervisor_id INTEGER,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_users_role ON users(role, active);

            CREATE TABLE IF NOT EXISTS notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                type TEXT NOT NULL,
                title TEXT NOT NULL,
                message TEXT NOT NULL,
                priority TEXT NOT NULL DEFAULT 'medium',  -- low, medium, high, critical
                status TEXT NOT NULL DEFAULT 'pending',   -- pending, read, archived
                is_automatic INTEGER NOT NULL DEFAULT 0,
                entity_kind TEXT,
                entity_id INTEGER,
                created_at TEXT NOT NULL,
                read_at TEXT,
                archived_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_notifications_dedupe
                ON notifications(type, user_id, entity_kind, entity_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_notifications_status
                ON notifications(status, created_at);

            CREATE TABLE IF NOT EXISTS expedientes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                code TEXT UNIQUE NOT NULL,
                title TEXT NOT NULL,
                responsible_id INTEGER,
                lifecycle_stage TEXT NOT NULL DEFAULT 'gestion',
                opened_at TEXT NOT NULL,
                closed_at TEXT,
                deleted_at TEXT
            );

            CREATE TABLE IF NOT EXISTS prestamos (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                expediente_id INTEGER NOT NULL,
                borrower_id INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                loaned_at TEXT NOT NULL,
                due_at TEXT NOT NULL,
                returned_at TEXT
            );

            CREATE TABLE IF NOT EXISTS certificados (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                serial TEXT UNIQUE NOT NULL,
                issuer TEXT NOT NULL,
                subject TEXT NOT NULL,
                owner_id INTEGER,
                valid_from TEXT NOT NULL,
                valid_to TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'valid'
            );

            CREATE TABLE IF NOT EXISTS workflow_instances (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'draft',
                started_at TEXT NOT NULL,
                completed_at TEXT,
                archived INTEGER NOT NULL DEFAULT 0,
                archived_at TEXT
            );

            CREATE TABLE IF NOT EXISTS workflow_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                assignee_id INTEGER NOT NULL,
                escalation_target_id INTEGER,
                deadline TEXT NOT NULL,
                escalation_level INTEGER NOT NULL DEFAULT 0,
                escalated_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_workflow_tasks_deadline
                ON workflow_tasks(status, deadline);

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                actor TEXT NOT NULL,
                subject TEXT NOT NULL,
                details TEXT,
                created_at TEXT NOT NULL
            );
         ",
            )
            .map_err(db_err("Migration"))?;
        Ok(())
    }

    // ─── Users ──────────────────────────────────────────────

    /// Register a user.
    pub fn create_user(&self, user: &NewUser, now: DateTime<Utc>) -> Result<UserId> {
        self.conn
            .execute(
                "INSERT INTO users (name, email, phone, role, supervisor_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![user.name, user.email, user.phone, user.role, user.supervisor_id, ts(now)],
            )
            .map_err(db_err("Create user"))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Activate or deactivate a user.
    pub fn set_user_active(&self, id: UserId, active: bool) -> Result<()> {
        self.conn
            .execute("UPDATE users SET active = ?1 WHERE id = ?2", params![active as i32, id])
            .map_err(db_err("Update user"))?;
        Ok(())
    }

    /// All users, active or not.
    pub fn list_users(&self) -> Result<Vec<User>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{USER_SELECT} ORDER BY id"))
            .map_err(db_err("List users"))?;
        let rows = stmt.query_map([], row_to_user).map_err(db_err("List users"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("List users"))
    }

    // ─── Records ────────────────────────────────────────────

    /// Insert a case file; `id` is ignored and the assigned id returned.
    pub fn insert_expediente(&self, e: &Expediente) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO expedientes (code, title, responsible_id, lifecycle_stage, opened_at, closed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    e.code,
                    e.title,
                    e.responsible_id,
                    e.lifecycle_stage.as_str(),
                    ts(e.opened_at),
                    e.closed_at.map(ts),
                ],
            )
            .map_err(db_err("Insert expediente"))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Move a case file to another lifecycle stage.
    pub fn set_expediente_stage(&self, id: i64, stage: LifecycleStage) -> Result<()> {
        self.conn
            .execute(
                "UPDATE expedientes SET lifecycle_stage = ?1 WHERE id = ?2",
                params![stage.as_str(), id],
            )
            .map_err(db_err("Update expediente"))?;
        Ok(())
    }

    /// Soft-delete a case file.
    pub fn soft_delete_expediente(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE expedientes SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
                params![ts(now), id],
            )
            .map_err(db_err("Delete expediente"))?;
        Ok(())
    }

    /// Insert a loan; `id` is ignored and the assigned id returned.
    pub fn insert_loan(&self, p: &Prestamo) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO prestamos (expediente_id, borrower_id, status, loaned_at, due_at, returned_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    p.expediente_id,
                    p.borrower_id,
                    p.status.as_str(),
                    ts(p.loaned_at),
                    ts(p.due_at),
                    p.returned_at.map(ts),
                ],
            )
            .map_err(db_err("Insert prestamo"))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Close an active loan.
    pub fn return_loan(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE prestamos SET status = 'returned', returned_at = ?1 WHERE id = ?2 AND status = 'active'",
                params![ts(now), id],
            )
            .map_err(db_err("Return prestamo"))?;
        Ok(changed == 1)
    }

    /// Insert a certificate; `id` is ignored and the assigned id returned.
    pub fn insert_certificate(&self, c: &Certificado) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO certificados (serial, issuer, subject, owner_id, valid_from, valid_to, state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    c.serial,
                    c.issuer,
                    c.subject,
                    c.owner_id,
                    ts(c.valid_from),
                    ts(c.valid_to),
                    c.state.as_str(),
                ],
            )
            .map_err(db_err("Insert certificado"))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Look up a certificate by serial.
    pub fn certificate_by_serial(&self, serial: &str) -> Result<Option<Certificado>> {
        self.conn
            .query_row(
                &format!("{CERTIFICATE_SELECT} WHERE serial = ?1"),
                [serial],
                row_to_certificate,
            )
            .optional()
            .map_err(db_err("Get certificado"))
    }

    // ─── Workflows ──────────────────────────────────────────

    /// Insert a workflow instance; `id` is ignored and the assigned id returned.
    pub fn insert_instance(&self, w: &WorkflowInstance) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO workflow_instances (name, state, started_at, completed_at, archived, archived_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    w.name,
                    w.state.as_str(),
                    ts(w.started_at),
                    w.completed_at.map(ts),
                    w.archived as i32,
                    w.archived_at.map(ts),
                ],
            )
            .map_err(db_err("Insert workflow instance"))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Get a workflow instance by id.
    pub fn instance(&self, id: i64) -> Result<WorkflowInstance> {
        self.conn
            .query_row(&format!("{INSTANCE_SELECT} WHERE id = ?1"), [id], row_to_instance)
            .optional()
            .map_err(db_err("Get workflow instance"))?
            .ok_or_else(|| SgdeaError::NotFound(format!("workflow instance {id}")))
    }

    /// Insert a workflow task; `id` is ignored and the assigned id returned.
    pub fn insert_task(&self, t: &WorkflowTask) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO workflow_tasks
                 (instance_id, name, status, assignee_id, escalation_target_id, deadline, escalation_level, escalated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    t.instance_id,
                    t.name,
                    t.status.as_str(),
                    t.assignee_id,
                    t.escalation_target_id,
                    ts(t.deadline),
                    t.escalation_level,
                    t.escalated_at.map(ts),
                ],
            )
            .map_err(db_err("Insert workflow task"))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Get a workflow task by id.
    pub fn task(&self, id: i64) -> Result<WorkflowTask> {
        self.conn
            .query_row(&format!("{TASK_SELECT} WHERE id = ?1"), [id], row_to_task)
            .optional()
            .map_err(db_err("Get workflow task"))?
            .ok_or_else(|| SgdeaError::NotFound(format!("workflow task {id}")))
    }

    /// Get a notification by id.
    pub fn notification(&self, id: i64) -> Result<Notification> {
        self.conn
            .query_row(
                &format!("{NOTIFICATION_SELECT} WHERE id = ?1"),
                [id],
                row_to_notification,
            )
            .optional()
            .map_err(db_err("Get notification"))?
            .ok_or_else(|| SgdeaError::NotFound(format!("notification {id}")))
    }

    /// Insert a notification with an explicit creation time, bypassing dedupe.
    pub fn insert_notification_at(
        &self,
        new: &NewNotification,
        created_at: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO notifications
                 (user_id, type, title, message, priority, status, is_automatic, entity_kind, entity_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?8, ?9)",
                params![
                    new.user_id,
                    new.notification_type,
                    new.title,
                    new.message,
                    new.priority.as_str(),
                    new.is_automatic as i32,
                    new.entity.map(|e| e.kind.as_str()),
                    new.entity.map(|e| e.id),
                    ts(created_at),
                ],
            )
            .map_err(db_err("Insert notification"))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Count notifications of `notification_type` about `entity`.
    pub fn count_notifications(&self, notification_type: &str, entity: EntityRef) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM notifications WHERE type = ?1 AND entity_kind = ?2 AND entity_id = ?3",
                params![notification_type, entity.kind.as_str(), entity.id],
                |row| row.get(0),
            )
            .map_err(db_err("Count notifications"))?;
        Ok(count as usize)
    }

    fn query_vec<T, F>(
        &self,
        context: &'static str,
        sql: &str,
        values: Vec<Value>,
        map: F,
    ) -> Result<Vec<T>>
    where
        F: FnMut(&rusqlite::Row) -> rusqlite::Result<T>,
    {
        let mut stmt = self.conn.prepare(sql).map_err(db_err(context))?;
        let rows = stmt
            .query_map(params_from_iter(values), map)
            .map_err(db_err(context))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err(context))
    }
}

/// `?,?,?` for `n` parameters.
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

// ─── Trait implementations ──────────────────────────────────

impl UserDirectory for SgdeaDb {
    fn user(&self, id: UserId) -> Result<Option<User>> {
        self.conn
            .query_row(&format!("{USER_SELECT} WHERE id = ?1"), [id], row_to_user)
            .optional()
            .map_err(db_err("Get user"))
    }

    fn users_with_role(&self, role: &str) -> Result<Vec<User>> {
        self.query_vec(
            "Users by role",
            &format!("{USER_SELECT} WHERE role = ? AND active = 1 ORDER BY id"),
            vec![Value::Text(role.to_string())],
            row_to_user,
        )
    }
}

impl NotificationStore for SgdeaDb {
    fn insert_unless_recent(
        &self,
        new: &NewNotification,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        // Check and insert in one statement so concurrent runs cannot both insert.
        let inserted = self
            .conn
            .execute(
                "INSERT INTO notifications
                 (user_id, type, title, message, priority, status, is_automatic, entity_kind, entity_id, created_at)
                 SELECT ?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?8, ?9
                 WHERE NOT EXISTS (
                     SELECT 1 FROM notifications
                     WHERE type = ?2 AND user_id = ?1
                       AND entity_kind IS ?7 AND entity_id IS ?8
                       AND created_at >= ?10
                 )",
                params![
                    new.user_id,
                    new.notification_type,
                    new.title,
                    new.message,
                    new.priority.as_str(),
                    new.is_automatic as i32,
                    new.entity.map(|e| e.kind.as_str()),
                    new.entity.map(|e| e.id),
                    ts(now),
                    ts(window_start),
                ],
            )
            .map_err(db_err("Insert notification"))?;
        Ok((inserted == 1).then(|| self.conn.last_insert_rowid()))
    }

    fn has_recent(&self, new: &NewNotification, window_start: DateTime<Utc>) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT EXISTS (
                     SELECT 1 FROM notifications
                     WHERE type = ?1 AND user_id = ?2
                       AND entity_kind IS ?3 AND entity_id IS ?4
                       AND created_at >= ?5
                 )",
                params![
                    new.notification_type,
                    new.user_id,
                    new.entity.map(|e| e.kind.as_str()),
                    new.entity.map(|e| e.id),
                    ts(window_start),
                ],
                |row| row.get::<_, i32>(0),
            )
            .map(|found| found != 0)
            .map_err(db_err("Check recent notification"))
    }

    fn dispatch_candidates(
        &self,
        priorities: &[Priority],
        since: DateTime<Utc>,
    ) -> Result<Vec<Notification>> {
        if priorities.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "{NOTIFICATION_SELECT} WHERE status = 'pending' AND created_at > ? AND priority IN ({}) ORDER BY id",
            placeholders(priorities.len())
        );
        let mut values = vec![Value::Text(ts(since))];
        values.extend(priorities.iter().map(|p| Value::Text(p.as_str().to_string())));
        self.query_vec("Dispatch candidates", &sql, values, row_to_notification)
    }

    fn list_for_user(
        &self,
        user_id: UserId,
        status: Option<NotificationStatus>,
    ) -> Result<Vec<Notification>> {
        let sql = format!(
            "{NOTIFICATION_SELECT} WHERE user_id = ? AND (? IS NULL OR status = ?) ORDER BY created_at DESC, id DESC"
        );
        let status = status.map_or(Value::Null, |s| Value::Text(s.as_str().to_string()));
        self.query_vec(
            "List notifications",
            &sql,
            vec![Value::Integer(user_id), status.clone(), status],
            row_to_notification,
        )
    }

    fn mark_read(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE notifications SET status = 'read', read_at = ?1 WHERE id = ?2 AND status = 'pending'",
                params![ts(now), id],
            )
            .map_err(db_err("Mark read"))?;
        Ok(changed == 1)
    }

    fn archive(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE notifications SET status = 'archived', archived_at = ?1
                 WHERE id = ?2 AND status IN ('pending', 'read')",
                params![ts(now), id],
            )
            .map_err(db_err("Archive notification"))?;
        Ok(changed == 1)
    }

    fn purge(&self, rule: PurgeRule, cutoff: DateTime<Utc>, dry_run: bool) -> Result<usize> {
        let filter = match rule {
            PurgeRule::Archived => "status = 'archived'",
            PurgeRule::Read => "status = 'read'",
            PurgeRule::NonCritical => "priority <> 'critical'",
        };
        if dry_run {
            let count: i64 = self
                .conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM notifications WHERE {filter} AND created_at < ?1"),
                    [ts(cutoff)],
                    |row| row.get(0),
                )
                .map_err(db_err("Count purge"))?;
            return Ok(count as usize);
        }
        self.conn
            .execute(
                &format!("DELETE FROM notifications WHERE {filter} AND created_at < ?1"),
                [ts(cutoff)],
            )
            .map_err(db_err("Purge notifications"))
    }
}

impl TriggerSource for SgdeaDb {
    fn expedientes_opened_between(
        &self,
        stage: LifecycleStage,
        after: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Expediente>> {
        let after = opt_text(after);
        self.query_vec(
            "Scan expedientes",
            &format!(
                "{EXPEDIENTE_SELECT} WHERE deleted_at IS NULL AND lifecycle_stage = ?
                 AND opened_at <= ? AND (? IS NULL OR opened_at > ?) ORDER BY id"
            ),
            vec![
                Value::Text(stage.as_str().to_string()),
                Value::Text(ts(until)),
                after.clone(),
                after,
            ],
            row_to_expediente,
        )
    }

    fn active_loans_due_between(
        &self,
        from: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Prestamo>> {
        let from = opt_text(from);
        self.query_vec(
            "Scan prestamos",
            &format!(
                "{LOAN_SELECT} WHERE status = 'active' AND due_at < ? AND (? IS NULL OR due_at >= ?) ORDER BY id"
            ),
            vec![Value::Text(ts(until)), from.clone(), from],
            row_to_loan,
        )
    }

    fn valid_certificates_expiring_between(
        &self,
        from: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Certificado>> {
        let from = opt_text(from);
        self.query_vec(
            "Scan certificados",
            &format!(
                "{CERTIFICATE_SELECT} WHERE state = 'valid' AND valid_to < ? AND (? IS NULL OR valid_to >= ?) ORDER BY id"
            ),
            vec![Value::Text(ts(until)), from.clone(), from],
            row_to_certificate,
        )
    }

    fn tasks_due_between(
        &self,
        statuses: &[WorkflowState],
        from: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
    ) -> Result<Vec<WorkflowTask>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let from = opt_text(from);
        let sql = format!(
            "{TASK_SELECT} WHERE status IN ({}) AND deadline < ? AND (? IS NULL OR deadline >= ?) ORDER BY deadline, id",
            placeholders(statuses.len())
        );
        let mut values: Vec<Value> = statuses
            .iter()
            .map(|s| Value::Text(s.as_str().to_string()))
            .collect();
        values.extend([Value::Text(ts(until)), from.clone(), from]);
        self.query_vec("Scan workflow tasks", &sql, values, row_to_task)
    }
}

impl WorkflowStore for SgdeaDb {
    fn overdue_tasks(&self, now: DateTime<Utc>) -> Result<Vec<WorkflowTask>> {
        self.tasks_due_between(&WorkflowState::ESCALATABLE, None, now)
    }

    fn apply_escalation(
        &self,
        task: &WorkflowTask,
        audit: &NewAuditEntry,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(db_err("Begin escalation"))?;
        let changed = tx
            .execute(
                "UPDATE workflow_tasks
                 SET status = ?1, assignee_id = ?2, deadline = ?3, escalation_level = ?4, escalated_at = ?5
                 WHERE id = ?6",
                params![
                    task.status.as_str(),
                    task.assignee_id,
                    ts(task.deadline),
                    task.escalation_level,
                    task.escalated_at.map(ts),
                    task.id,
                ],
            )
            .map_err(db_err("Update workflow task"))?;
        if changed == 0 {
            return Err(SgdeaError::NotFound(format!("workflow task {}", task.id)));
        }
        tx.execute(
            "INSERT INTO audit_log (event_type, actor, subject, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![audit.event_type, audit.actor, audit.subject, audit.details, ts(now)],
        )
        .map_err(db_err("Insert audit entry"))?;
        tx.commit().map_err(db_err("Commit escalation"))
    }

    fn archive_completed_instances(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<usize> {
        let filter = "state = 'completed' AND archived = 0 AND completed_at IS NOT NULL AND completed_at < ?1";
        if dry_run {
            let count: i64 = self
                .conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM workflow_instances WHERE {filter}"),
                    [ts(cutoff)],
                    |row| row.get(0),
                )
                .map_err(db_err("Count workflow archive"))?;
            return Ok(count as usize);
        }
        self.conn
            .execute(
                &format!("UPDATE workflow_instances SET archived = 1, archived_at = ?2 WHERE {filter}"),
                params![ts(cutoff), ts(now)],
            )
            .map_err(db_err("Archive workflow instances"))
    }
}

impl AuditLog for SgdeaDb {
    fn log_event(&self, entry: &NewAuditEntry, now: DateTime<Utc>) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO audit_log (event_type, actor, subject, details, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![entry.event_type, entry.actor, entry.subject, entry.details, ts(now)],
            )
            .map_err(db_err("Insert audit entry"))?;
        Ok(self.conn.last_insert_rowid())
    }

    fn recent_events(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        self.query_vec(
            "Recent audit entries",
            "SELECT id, event_type, actor, subject, details, created_at FROM audit_log ORDER BY id DESC LIMIT ?",
            vec![Value::Integer(limit as i64)],
            row_to_audit,
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use sgdea_core::types::{CertificateState, LoanStatus};

    pub(crate) fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap()
    }

    pub(crate) fn temp_db() -> SgdeaDb {
        SgdeaDb::open_in_memory().unwrap()
    }

    pub(crate) fn add_user(db: &SgdeaDb, name: &str, role: &str) -> UserId {
        db.create_user(
            &NewUser {
                name: name.into(),
                email: Some(format!("{name}@archivo.example")),
                phone: None,
                role: role.into(),
                supervisor_id: None,
            },
            now(),
        )
        .unwrap()
    }

    pub(crate) fn notification(user_id: UserId, priority: Priority) -> NewNotification {
        NewNotification {
            user_id,
            notification_type: "expediente_vencido".into(),
            title: "Expediente vencido".into(),
            message: "EXP-1 lleva más de dos años en gestión".into(),
            priority,
            is_automatic: true,
            entity: Some(EntityRef::new(EntityKind::Expediente, 1)),
        }
    }

    #[test]
    fn test_open_and_migrate() {
        let dir = std::env::temp_dir().join("sgdea-db-test-open");
        std::fs::create_dir_all(&dir).ok();
        let path = dir.join("test.db");
        {
            let db = SgdeaDb::open(&path).unwrap();
            assert!(db.list_users().unwrap().is_empty());
        }
        // Migrations are idempotent.
        let db = SgdeaDb::open(&path).unwrap();
        assert!(db.recent_events(10).unwrap().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_users_by_role_skips_inactive() {
        let db = temp_db();
        let a = add_user(&db, "ana", "admin");
        let b = add_user(&db, "beto", "admin");
        add_user(&db, "carla", "user");
        db.set_user_active(b, false).unwrap();

        let admins = db.users_with_role("admin").unwrap();
        assert_eq!(admins.len(), 1);
        assert_eq!(admins[0].id, a);
        assert_eq!(db.user(b).unwrap().map(|u| u.active), Some(false));
        assert!(db.user(999).unwrap().is_none());
    }

    #[test]
    fn test_insert_unless_recent() {
        let db = temp_db();
        let user = add_user(&db, "ana", "admin");
        let n = notification(user, Priority::Critical);
        let window_start = now() - Duration::days(3);

        let first = db.insert_unless_recent(&n, window_start, now()).unwrap();
        assert!(first.is_some());
        let second = db
            .insert_unless_recent(&n, window_start, now() + Duration::hours(1))
            .unwrap();
        assert!(second.is_none());
        assert!(db.has_recent(&n, window_start).unwrap());
        assert!(!db.has_recent(&n, now() + Duration::seconds(1)).unwrap());

        // Another entity is not a duplicate.
        let mut other = n.clone();
        other.entity = Some(EntityRef::new(EntityKind::Expediente, 2));
        assert!(db.insert_unless_recent(&other, window_start, now()).unwrap().is_some());

        // Once the earlier row falls out of the window a new one is created.
        let later = now() + Duration::days(4);
        assert!(
            db.insert_unless_recent(&n, later - Duration::days(3), later)
                .unwrap()
                .is_some()
        );

        let stored = db.notification(first.unwrap()).unwrap();
        assert_eq!(stored.status, NotificationStatus::Pending);
        assert!(stored.is_automatic);
        assert_eq!(stored.created_at, now());
    }

    #[test]
    fn test_dispatch_candidates_filter() {
        let db = temp_db();
        let user = add_user(&db, "ana", "admin");
        let fresh = db.insert_notification_at(&notification(user, Priority::High), now()).unwrap();
        db.insert_notification_at(&notification(user, Priority::Low), now()).unwrap();
        db.insert_notification_at(
            &notification(user, Priority::Critical),
            now() - Duration::minutes(30),
        )
        .unwrap();
        let read = db.insert_notification_at(&notification(user, Priority::Critical), now()).unwrap();
        db.mark_read(read, now()).unwrap();

        let found = db
            .dispatch_candidates(&[Priority::Critical, Priority::High], now() - Duration::minutes(10))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, fresh);

        // The window's lower bound is exclusive.
        let at_boundary = db
            .dispatch_candidates(&[Priority::Critical, Priority::High], now())
            .unwrap();
        assert!(at_boundary.is_empty());
    }

    #[test]
    fn test_read_and_archive_transitions() {
        let db = temp_db();
        let user = add_user(&db, "ana", "admin");
        let id = db.insert_notification_at(&notification(user, Priority::High), now()).unwrap();

        assert!(db.mark_read(id, now()).unwrap());
        assert!(!db.mark_read(id, now()).unwrap());
        assert!(db.archive(id, now()).unwrap());
        assert!(!db.archive(id, now()).unwrap());
        assert!(!db.mark_read(id, now()).unwrap());

        let stored = db.notification(id).unwrap();
        assert_eq!(stored.status, NotificationStatus::Archived);
        assert!(stored.read_at.is_some());
        assert!(stored.archived_at.is_some());

        let archived = db.list_for_user(user, Some(NotificationStatus::Archived)).unwrap();
        assert_eq!(archived.len(), 1);
        assert!(db.list_for_user(user, Some(NotificationStatus::Pending)).unwrap().is_empty());
        assert_eq!(db.list_for_user(user, None).unwrap().len(), 1);
    }

    #[test]
    fn test_purge_dry_run_counts_only() {
        let db = temp_db();
        let user = add_user(&db, "ana", "admin");
        db.insert_notification_at(&notification(user, Priority::Low), now() - Duration::days(400))
            .unwrap();

        let cutoff = now() - Duration::days(365);
        assert_eq!(db.purge(PurgeRule::NonCritical, cutoff, true).unwrap(), 1);
        assert_eq!(db.list_for_user(user, None).unwrap().len(), 1);
        assert_eq!(db.purge(PurgeRule::NonCritical, cutoff, false).unwrap(), 1);
        assert!(db.list_for_user(user, None).unwrap().is_empty());
    }

    #[test]
    fn test_trigger_queries() {
        let db = temp_db();
        let user = add_user(&db, "ana", "archivist");
        let exp = Expediente {
            id: 0,
            code: "EXP-2024-001".into(),
            title: "Contratos".into(),
            responsible_id: Some(user),
            lifecycle_stage: LifecycleStage::Gestion,
            opened_at: now() - Duration::days(800),
            closed_at: None,
        };
        let exp_id = db.insert_expediente(&exp).unwrap();
        let deleted = db
            .insert_expediente(&Expediente { code: "EXP-2024-002".into(), ..exp.clone() })
            .unwrap();
        db.soft_delete_expediente(deleted, now()).unwrap();

        let found = db
            .expedientes_opened_between(LifecycleStage::Gestion, None, now() - Duration::days(730))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, exp_id);
        assert!(
            db.expedientes_opened_between(LifecycleStage::Central, None, now())
                .unwrap()
                .is_empty()
        );

        let loan = db
            .insert_loan(&Prestamo {
                id: 0,
                expediente_id: exp_id,
                borrower_id: user,
                status: LoanStatus::Active,
                loaned_at: now() - Duration::days(20),
                due_at: now() - Duration::days(1),
                returned_at: None,
            })
            .unwrap();
        assert_eq!(db.active_loans_due_between(None, now()).unwrap().len(), 1);
        assert!(db.return_loan(loan, now()).unwrap());
        assert!(db.active_loans_due_between(None, now()).unwrap().is_empty());

        db.insert_certificate(&Certificado {
            id: 0,
            serial: "5A:01".into(),
            issuer: "CN=CA".into(),
            subject: "CN=Ana".into(),
            owner_id: Some(user),
            valid_from: now() - Duration::days(300),
            valid_to: now() + Duration::days(10),
            state: CertificateState::Valid,
        })
        .unwrap();
        let expiring = db
            .valid_certificates_expiring_between(Some(now()), now() + Duration::days(30))
            .unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(db.certificate_by_serial("5A:01").unwrap().map(|c| c.id), Some(expiring[0].id));
    }

    #[test]
    fn test_apply_escalation_writes_audit() {
        let db = temp_db();
        let boss = add_user(&db, "jefe", "admin");
        let clerk = add_user(&db, "clerk", "user");
        let instance = db
            .insert_instance(&WorkflowInstance {
                id: 0,
                name: "Aprobación TRD".into(),
                state: WorkflowState::Pending,
                started_at: now() - Duration::days(5),
                completed_at: None,
                archived: false,
                archived_at: None,
            })
            .unwrap();
        let task_id = db
            .insert_task(&WorkflowTask {
                id: 0,
                instance_id: instance,
                name: "Firma".into(),
                status: WorkflowState::Pending,
                assignee_id: clerk,
                escalation_target_id: None,
                deadline: now() - Duration::days(1),
                escalation_level: 0,
                escalated_at: None,
            })
            .unwrap();

        let mut task = db.task(task_id).unwrap();
        assert_eq!(db.overdue_tasks(now()).unwrap().len(), 1);
        task.assignee_id = boss;
        task.status = WorkflowState::Escalated;
        task.escalation_level = 1;
        task.escalated_at = Some(now());
        task.deadline = now() + Duration::hours(48);
        db.apply_escalation(
            &task,
            &NewAuditEntry {
                event_type: "task_escalated".into(),
                actor: "system".into(),
                subject: format!("workflow_task:{task_id}"),
                details: None,
            },
            now(),
        )
        .unwrap();

        assert!(db.overdue_tasks(now()).unwrap().is_empty());
        assert_eq!(db.task(task_id).unwrap().assignee_id, boss);
        let events = db.recent_events(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "task_escalated");

        task.id = 9999;
        assert!(matches!(
            db.apply_escalation(
                &task,
                &NewAuditEntry {
                    event_type: "task_escalated".into(),
                    actor: "system".into(),
                    subject: "workflow_task:9999".into(),
                    details: None,
                },
                now(),
            ),
            Err(SgdeaError::NotFound(_))
        ));
        // The failed transaction left no audit entry behind.
        assert_eq!(db.recent_events(10).unwrap().len(), 1);
    }

    #[test]
    fn test_audit_log_order() {
        let db = temp_db();
        for kind in ["scan_completed", "dispatch_completed"] {
            db.log_event(
                &NewAuditEntry {
                    event_type: kind.into(),
                    actor: "system".into(),
                    subject: "job".into(),
                    details: Some("ok".into()),
                },
                now(),
            )
            .unwrap();
        }
        let events = db.recent_events(10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "dispatch_completed"); // most recent first
    }
}
