//! SQLite-based store implementation

use chrono::{DateTime, Utc};
use labhub_api::{Server, ServerPolicy, ServerStatus};
use labhub_util::{SubscriptionId, UserPrincipalId, UserPrincipalName, format_timestamp};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::traits::activity_advances;
use crate::{AuditEvent, ServerStore, StoreError, StoreResult};

const SERVER_COLUMNS: &str = "user_principal_name, subscription_id, user_principal_id, status, \
     last_user_activity_time, destroyed_at_time, auto_destroy, inactivity_duration_in_minutes";

/// SQLite-based store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned".into()))
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            -- One record per owner
            CREATE TABLE IF NOT EXISTS servers (
                user_principal_name TEXT PRIMARY KEY,
                subscription_id TEXT NOT NULL,
                user_principal_id TEXT NOT NULL,
                status TEXT NOT NULL,
                last_user_activity_time TEXT NOT NULL,
                destroyed_at_time TEXT,
                auto_destroy INTEGER NOT NULL DEFAULT 0,
                inactivity_duration_in_minutes INTEGER NOT NULL DEFAULT 0
            );

            -- Audit log (append-only)
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_servers_status ON servers(status);
            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
            "#,
        )?;

        debug!("Store schema initialized");
        Ok(())
    }
}

/// Raw column values; converted outside the rusqlite closure so that a bad
/// status tag surfaces as a `StoreError`.
struct ServerRow {
    user_principal_name: String,
    subscription_id: String,
    user_principal_id: String,
    status: String,
    last_user_activity_time: String,
    destroyed_at_time: Option<String>,
    auto_destroy: bool,
    inactivity_duration_in_minutes: u32,
}

impl ServerRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            user_principal_name: row.get(0)?,
            subscription_id: row.get(1)?,
            user_principal_id: row.get(2)?,
            status: row.get(3)?,
            last_user_activity_time: row.get(4)?,
            destroyed_at_time: row.get(5)?,
            auto_destroy: row.get(6)?,
            inactivity_duration_in_minutes: row.get(7)?,
        })
    }

    fn into_server(self) -> StoreResult<Server> {
        let status = ServerStatus::parse(&self.status).ok_or_else(|| {
            StoreError::Serialization(format!(
                "unknown status '{}' for {}",
                self.status, self.user_principal_name
            ))
        })?;

        let destroyed_at_time = self.destroyed_at_time.and_then(|s| {
            match DateTime::parse_from_rfc3339(&s) {
                Ok(dt) => Some(dt.with_timezone(&Utc)),
                Err(e) => {
                    warn!(
                        user_principal_name = %self.user_principal_name,
                        value = %s,
                        error = %e,
                        "Ignoring unparseable destroyed_at_time"
                    );
                    None
                }
            }
        });

        Ok(Server {
            subscription_id: SubscriptionId::new(self.subscription_id),
            user_principal_name: UserPrincipalName::new(self.user_principal_name),
            user_principal_id: UserPrincipalId::new(self.user_principal_id),
            status,
            last_user_activity_time: self.last_user_activity_time,
            destroyed_at_time,
            auto_destroy: self.auto_destroy,
            inactivity_duration_in_minutes: self.inactivity_duration_in_minutes,
        })
    }
}

impl ServerStore for SqliteStore {
    fn get_all_servers(&self) -> StoreResult<Vec<Server>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(&format!("SELECT {SERVER_COLUMNS} FROM servers"))?;
        let rows = stmt
            .query_map([], ServerRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(ServerRow::into_server).collect()
    }

    fn get_server(&self, user_principal_name: &UserPrincipalName) -> StoreResult<Option<Server>> {
        let conn = self.conn()?;

        let row = conn
            .query_row(
                &format!("SELECT {SERVER_COLUMNS} FROM servers WHERE user_principal_name = ?"),
                [user_principal_name.as_str()],
                ServerRow::from_row,
            )
            .optional()?;

        row.map(ServerRow::into_server).transpose()
    }

    fn upsert_server(&self, server: &Server) -> StoreResult<()> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO servers (
                user_principal_name, subscription_id, user_principal_id, status,
                last_user_activity_time, destroyed_at_time, auto_destroy,
                inactivity_duration_in_minutes
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_principal_name)
            DO UPDATE SET
                subscription_id = excluded.subscription_id,
                user_principal_id = excluded.user_principal_id,
                status = excluded.status,
                last_user_activity_time = excluded.last_user_activity_time,
                destroyed_at_time = excluded.destroyed_at_time,
                auto_destroy = excluded.auto_destroy,
                inactivity_duration_in_minutes = excluded.inactivity_duration_in_minutes
            "#,
            params![
                server.user_principal_name.as_str(),
                server.subscription_id.as_str(),
                server.user_principal_id.as_str(),
                server.status.as_str(),
                server.last_user_activity_time,
                server.destroyed_at_time.as_ref().map(format_timestamp),
                server.auto_destroy,
                server.inactivity_duration_in_minutes,
            ],
        )?;

        debug!(
            user_principal_name = %server.user_principal_name,
            status = %server.status,
            "Server upserted"
        );
        Ok(())
    }

    fn update_policy(
        &self,
        user_principal_name: &UserPrincipalName,
        policy: ServerPolicy,
    ) -> StoreResult<Option<Server>> {
        let conn = self.conn()?;

        let changed = conn.execute(
            "UPDATE servers SET auto_destroy = ?, inactivity_duration_in_minutes = ? \
             WHERE user_principal_name = ?",
            params![
                policy.auto_destroy,
                policy.inactivity_duration_in_minutes,
                user_principal_name.as_str()
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }

        let row = conn.query_row(
            &format!("SELECT {SERVER_COLUMNS} FROM servers WHERE user_principal_name = ?"),
            [user_principal_name.as_str()],
            ServerRow::from_row,
        )?;

        debug!(
            user_principal_name = %user_principal_name,
            auto_destroy = policy.auto_destroy,
            inactivity_duration_in_minutes = policy.inactivity_duration_in_minutes,
            "Server policy updated"
        );
        row.into_server().map(Some)
    }

    fn record_activity(
        &self,
        user_principal_name: &UserPrincipalName,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let conn = self.conn()?;

        let stored: Option<String> = conn
            .query_row(
                "SELECT last_user_activity_time FROM servers WHERE user_principal_name = ?",
                [user_principal_name.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        let Some(stored) = stored else {
            return Ok(false);
        };

        if activity_advances(&stored, at) {
            conn.execute(
                "UPDATE servers SET last_user_activity_time = ? WHERE user_principal_name = ?",
                params![format_timestamp(&at), user_principal_name.as_str()],
            )?;
            debug!(user_principal_name = %user_principal_name, at = %at, "Activity recorded");
        }

        Ok(true)
    }

    fn append_audit(&self, mut event: AuditEvent) -> StoreResult<()> {
        let conn = self.conn()?;
        let event_json = serde_json::to_string(&event.event)?;

        conn.execute(
            "INSERT INTO audit_log (timestamp, event_json) VALUES (?, ?)",
            params![format_timestamp(&event.timestamp), event_json],
        )?;

        event.id = conn.last_insert_rowid();
        debug!(event_id = event.id, "Audit event appended");

        Ok(())
    }

    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            "SELECT id, timestamp, event_json FROM audit_log ORDER BY id DESC LIMIT ?",
        )?;

        let rows = stmt.query_map([limit as i64], |row| {
            let id: i64 = row.get(0)?;
            let timestamp_str: String = row.get(1)?;
            let event_json: String = row.get(2)?;
            Ok((id, timestamp_str, event_json))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, timestamp_str, event_json) = row?;
            let timestamp = DateTime::parse_from_rfc3339(&timestamp_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| labhub_util::now());
            let event: crate::AuditEventType = serde_json::from_str(&event_json)?;

            events.push(AuditEvent {
                id,
                timestamp,
                event,
            });
        }

        Ok(events)
    }

    fn is_healthy(&self) -> bool {
        match self.conn.lock() {
            Ok(conn) => conn.query_row("SELECT 1", [], |_| Ok(())).is_ok(),
            Err(_) => {
                warn!("Store lock poisoned");
                false
            }
        }
    }
}
