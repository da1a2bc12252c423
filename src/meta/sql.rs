//! SQLite backend.
//!
//! The conflict tuple is a UNIQUE constraint; a violation surfaces as a
//! constraint error and is mapped to `Conflict`. Fan-out is one
//! `INSERT ... SELECT` over the registrations table, so the set of
//! registrations it sees is fixed at statement time.

use super::{dedup_ids, new_change_id, validate_input, Meta};
use crate::error::{ChangeError, Result};
use crate::types::{sort_changes, Change, ChangeInput, ChangeSearch, Timestamp};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row, Transaction};
use std::path::Path;

const CHANGE_COLUMNS: &str = "id, when_changed, changed_by, data_id, data_service_name, \
                              data_type, data_action, data_version";

/// Ids bound per `id IN (...)` query, well under SQLite's variable limit.
const MAX_IDS_PER_QUERY: usize = 500;

/// SQLite-based implementation of [`Meta`].
pub struct SqlMeta {
    conn: Mutex<Connection>,
}

impl SqlMeta {
    /// Open (or create) a database file.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())?;
        tracing::info!("Opened change database at {:?}", db_path.as_ref());
        Self::with_connection(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let meta = Self {
            conn: Mutex::new(conn),
        };
        meta.init_schema()?;
        Ok(meta)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS changes (
                id TEXT PRIMARY KEY,
                when_changed INTEGER NOT NULL,
                changed_by TEXT NOT NULL,
                data_id TEXT NOT NULL,
                data_service_name TEXT NOT NULL,
                data_type TEXT NOT NULL,
                data_action TEXT NOT NULL,
                data_version INTEGER NOT NULL,
                UNIQUE (data_id, data_service_name, data_type, data_action, data_version)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS registrations (
                id TEXT PRIMARY KEY
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS registration_changes (
                registration_id TEXT NOT NULL,
                change_id TEXT NOT NULL,
                PRIMARY KEY (registration_id, change_id)
            )",
            [],
        )?;

        // Reference checks look up by change id
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_registration_changes_change
             ON registration_changes(change_id)",
            [],
        )?;

        Ok(())
    }

    fn registration_exists(tx: &Transaction<'_>, id: &str) -> Result<bool> {
        Ok(tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM registrations WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?)
    }

    fn is_referenced(tx: &Transaction<'_>, change_id: &str) -> Result<bool> {
        Ok(tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM registration_changes WHERE change_id = ?1)",
            params![change_id],
            |row| row.get(0),
        )?)
    }
}

fn change_from_row(row: &Row<'_>) -> rusqlite::Result<Change> {
    Ok(Change {
        id: row.get(0)?,
        when_changed: Timestamp(row.get(1)?),
        changed_by: row.get(2)?,
        data_id: row.get(3)?,
        data_service_name: row.get(4)?,
        data_type: row.get(5)?,
        data_action: row.get(6)?,
        data_version: row.get(7)?,
    })
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation)
}

/// Run one filtered select, with `ids` standing in for `search.ids`.
fn select_changes(conn: &Connection, search: &ChangeSearch, ids: &[String]) -> Result<Vec<Change>> {
    let mut clauses = Vec::new();
    let mut values = Vec::new();

    push_in_clause(&mut clauses, &mut values, "id", ids);
    push_in_clause(&mut clauses, &mut values, "data_id", &search.data_ids);
    push_in_clause(&mut clauses, &mut values, "data_type", &search.types);
    push_in_clause(&mut clauses, &mut values, "data_action", &search.actions);
    push_in_clause(&mut clauses, &mut values, "data_service_name", &search.service_names);
    if let Some(since) = search.since {
        clauses.push("when_changed >= ?".to_string());
        values.push(Value::Integer(since.0));
    }

    let mut sql = format!("SELECT {} FROM changes", CHANGE_COLUMNS);
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY when_changed, id");

    let mut stmt = conn.prepare(&sql)?;
    let changes = stmt
        .query_map(params_from_iter(values.iter()), change_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(changes)
}

/// Append `column IN (?, ...)` when the value list is non-empty.
fn push_in_clause(clauses: &mut Vec<String>, values: &mut Vec<Value>, column: &str, list: &[String]) {
    if list.is_empty() {
        return;
    }
    let placeholders = vec!["?"; list.len()].join(", ");
    clauses.push(format!("{} IN ({})", column, placeholders));
    values.extend(list.iter().cloned().map(Value::Text));
}

impl Meta for SqlMeta {
    fn change_create(&self, input: ChangeInput) -> Result<Change> {
        validate_input(&input)?;
        let change = input.into_change(new_change_id());

        let conn = self.conn.lock();
        let result = conn.execute(
            &format!(
                "INSERT INTO changes ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                CHANGE_COLUMNS
            ),
            params![
                &change.id,
                change.when_changed.0,
                &change.changed_by,
                &change.data_id,
                &change.data_service_name,
                &change.data_type,
                &change.data_action,
                change.data_version,
            ],
        );

        match result {
            Ok(0) => Err(ChangeError::NotWritten(format!("change {} not inserted", change.id))),
            Ok(_) => Ok(change),
            Err(e) if is_constraint_violation(&e) => Err(ChangeError::Conflict(change.conflict_key())),
            Err(e) => Err(e.into()),
        }
    }

    fn change_read(&self, id: &str) -> Result<Change> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM changes WHERE id = ?1", CHANGE_COLUMNS),
            params![id],
            change_from_row,
        )
        .optional()?
        .ok_or_else(|| ChangeError::ChangeNotFound(id.to_string()))
    }

    fn changes_read(&self, search: &ChangeSearch) -> Result<Vec<Change>> {
        let conn = self.conn.lock();

        if search.ids.is_empty() {
            return select_changes(&conn, search, &[]);
        }

        // Pending sets can outgrow SQLite's bound-variable limit
        let mut found = Vec::new();
        for chunk in dedup_ids(&search.ids).chunks(MAX_IDS_PER_QUERY) {
            found.extend(select_changes(&conn, search, chunk)?);
        }
        sort_changes(&mut found);
        Ok(found)
    }

    fn changes_delete(&self, ids: &[String]) -> Result<()> {
        let ids = dedup_ids(ids);

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        for id in &ids {
            if Self::is_referenced(&tx, id)? {
                return Err(ChangeError::ChangeReferenced(id.clone()));
            }
        }
        for id in &ids {
            tx.execute("DELETE FROM changes WHERE id = ?1", params![id])?;
        }

        tx.commit()?;
        Ok(())
    }

    fn registration_upsert(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO registrations (id) VALUES (?1)",
            params![id],
        )?;
        Ok(())
    }

    fn registration_delete(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let deleted = tx.execute("DELETE FROM registrations WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(ChangeError::RegistrationNotFound(id.to_string()));
        }
        tx.execute(
            "DELETE FROM registration_changes WHERE registration_id = ?1",
            params![id],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn registrations_read(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM registrations ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    fn registration_change_upsert(&self, change_id: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM changes WHERE id = ?1)",
            params![change_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(ChangeError::ChangeNotFound(change_id.to_string()));
        }

        tx.execute(
            "INSERT OR IGNORE INTO registration_changes (registration_id, change_id)
             SELECT id, ?1 FROM registrations",
            params![change_id],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn registration_changes_read(&self, registration_id: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if !Self::registration_exists(&tx, registration_id)? {
            return Err(ChangeError::RegistrationNotFound(registration_id.to_string()));
        }

        let ids = {
            let mut stmt = tx.prepare(
                "SELECT change_id FROM registration_changes
                 WHERE registration_id = ?1 ORDER BY change_id",
            )?;
            let ids = stmt
                .query_map(params![registration_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            ids
        };

        tx.commit()?;
        Ok(ids)
    }

    fn registration_change_acknowledge(
        &self,
        registration_id: &str,
        change_ids: &[String],
    ) -> Result<Vec<String>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if !Self::registration_exists(&tx, registration_id)? {
            return Err(ChangeError::RegistrationNotFound(registration_id.to_string()));
        }

        let mut prunable = Vec::new();
        for id in dedup_ids(change_ids) {
            let removed = tx.execute(
                "DELETE FROM registration_changes WHERE registration_id = ?1 AND change_id = ?2",
                params![registration_id, &id],
            )?;
            if removed > 0 && !Self::is_referenced(&tx, &id)? {
                prunable.push(id);
            }
        }

        tx.commit()?;
        Ok(prunable)
    }
}
