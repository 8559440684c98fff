use std::fmt::Display;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use subtickets_core::{EdgeStore, RelationError, TicketId, TicketSnapshot, TicketStore};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS tickets (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  kind TEXT NOT NULL,
  owner TEXT NOT NULL DEFAULT '',
  status TEXT NOT NULL DEFAULT 'new',
  summary TEXT NOT NULL,
  parents TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS ticket_comments (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  ticket_id INTEGER NOT NULL,
  author TEXT NOT NULL,
  body TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (ticket_id) REFERENCES tickets(id)
);

CREATE TABLE IF NOT EXISTS subtickets (
  parent INTEGER NOT NULL,
  child INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_subtickets_parent ON subtickets(parent);
CREATE INDEX IF NOT EXISTS idx_subtickets_child ON subtickets(child);
CREATE INDEX IF NOT EXISTS idx_ticket_comments_ticket ON ticket_comments(ticket_id);
";

/// SQLite-backed edge table plus the host-surrogate ticket tables.
pub struct SqliteRelationStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommentRow {
    pub ticket_id: TicketId,
    pub author: String,
    pub body: String,
    pub created_at: String,
}

impl SqliteRelationStore {
    /// Open a SQLite-backed relation store and configure runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or a migration step
    /// fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version == 0 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = 1;
            tracing::info!(version, "applied subtickets schema migration");
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Insert a surrogate ticket row and return its assigned id.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_ticket(
        &mut self,
        kind: &str,
        owner: &str,
        status: &str,
        summary: &str,
        parents: &str,
    ) -> Result<TicketId> {
        self.conn
            .execute(
                "INSERT INTO tickets(kind, owner, status, summary, parents)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![kind, owner, status, summary, parents],
            )
            .context("failed to insert ticket")?;
        Ok(TicketId(self.conn.last_insert_rowid()))
    }

    /// Persist every mutable field of a ticket snapshot.
    ///
    /// # Errors
    /// Returns an error when the update fails or the ticket is missing.
    pub fn save_ticket(&mut self, ticket: &TicketSnapshot) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE tickets SET kind = ?2, owner = ?3, status = ?4, summary = ?5, parents = ?6
                 WHERE id = ?1",
                params![
                    ticket.id.0,
                    ticket.kind,
                    ticket.owner,
                    ticket.status,
                    ticket.summary,
                    ticket.parents
                ],
            )
            .context("failed to update ticket")?;
        if updated == 0 {
            return Err(anyhow!("ticket #{} does not exist", ticket.id));
        }
        Ok(())
    }

    /// Delete a surrogate ticket row. Edge cleanup is the engine's job.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_ticket(&mut self, id: TicketId) -> Result<()> {
        self.conn
            .execute("DELETE FROM tickets WHERE id = ?1", params![id.0])
            .context("failed to delete ticket")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_tickets(&self) -> Result<Vec<TicketSnapshot>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, kind, owner, status, summary, parents FROM tickets ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(TicketSnapshot {
                id: TicketId(row.get(0)?),
                kind: row.get(1)?,
                owner: row.get(2)?,
                status: row.get(3)?,
                summary: row.get(4)?,
                parents: row.get(5)?,
            })
        })?;

        let mut tickets = Vec::new();
        for row in rows {
            tickets.push(row?);
        }
        Ok(tickets)
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn comments_for(&self, id: TicketId) -> Result<Vec<CommentRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT ticket_id, author, body, created_at FROM ticket_comments
             WHERE ticket_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![id.0], |row| {
            Ok(CommentRow {
                ticket_id: TicketId(row.get(0)?),
                author: row.get(1)?,
                body: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;

        let mut comments = Vec::new();
        for row in rows {
            comments.push(row?);
        }
        Ok(comments)
    }

    fn ticket_ids_matching(&self, sql: &str, bound: TicketId) -> Result<Vec<TicketId>, RelationError> {
        let mut stmt = self.conn.prepare(sql).map_err(store_err)?;
        let rows = stmt
            .query_map(params![bound.0], |row| Ok(TicketId(row.get(0)?)))
            .map_err(store_err)?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.map_err(store_err)?);
        }
        Ok(ids)
    }
}

impl TicketStore for SqliteRelationStore {
    fn exists(&self, id: TicketId) -> Result<bool, RelationError> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM tickets WHERE id = ?1)",
                params![id.0],
                |row| row.get::<_, i64>(0),
            )
            .map(|found| found == 1)
            .map_err(store_err)
    }

    fn get(&self, id: TicketId) -> Result<Option<TicketSnapshot>, RelationError> {
        self.conn
            .query_row(
                "SELECT id, kind, owner, status, summary, parents FROM tickets WHERE id = ?1",
                params![id.0],
                |row| {
                    Ok(TicketSnapshot {
                        id: TicketId(row.get(0)?),
                        kind: row.get(1)?,
                        owner: row.get(2)?,
                        status: row.get(3)?,
                        summary: row.get(4)?,
                        parents: row.get(5)?,
                    })
                },
            )
            .optional()
            .map_err(store_err)
    }

    fn append_comment(
        &mut self,
        id: TicketId,
        author: &str,
        body: &str,
    ) -> Result<(), RelationError> {
        let created_at = now_rfc3339()?;
        self.conn
            .execute(
                "INSERT INTO ticket_comments(ticket_id, author, body, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id.0, author, body, created_at],
            )
            .map_err(store_err)?;
        Ok(())
    }
}

impl EdgeStore for SqliteRelationStore {
    fn add_edge(&mut self, parent: TicketId, child: TicketId) -> Result<(), RelationError> {
        self.conn
            .execute(
                "INSERT INTO subtickets(parent, child) VALUES (?1, ?2)",
                params![parent.0, child.0],
            )
            .map_err(store_err)?;
        Ok(())
    }

    fn remove_edge(&mut self, parent: TicketId, child: TicketId) -> Result<(), RelationError> {
        self.conn
            .execute(
                "DELETE FROM subtickets WHERE parent = ?1 AND child = ?2",
                params![parent.0, child.0],
            )
            .map_err(store_err)?;
        Ok(())
    }

    fn remove_edges_for_child(&mut self, child: TicketId) -> Result<(), RelationError> {
        self.conn
            .execute("DELETE FROM subtickets WHERE child = ?1", params![child.0])
            .map_err(store_err)?;
        Ok(())
    }

    fn children_of(
        &self,
        parent: TicketId,
    ) -> Result<std::collections::BTreeSet<TicketId>, RelationError> {
        self.ticket_ids_matching("SELECT child FROM subtickets WHERE parent = ?1", parent)
            .map(|ids| ids.into_iter().collect())
    }

    fn parents_of(
        &self,
        child: TicketId,
    ) -> Result<std::collections::BTreeSet<TicketId>, RelationError> {
        self.ticket_ids_matching("SELECT parent FROM subtickets WHERE child = ?1", child)
            .map(|ids| ids.into_iter().collect())
    }

    // One lifecycle event maps to one transaction; the engine drives these
    // boundaries and never nests them.
    fn begin(&mut self) -> Result<(), RelationError> {
        self.conn.execute_batch("BEGIN IMMEDIATE").map_err(store_err)
    }

    fn commit(&mut self) -> Result<(), RelationError> {
        self.conn.execute_batch("COMMIT").map_err(store_err)
    }

    fn rollback(&mut self) -> Result<(), RelationError> {
        self.conn.execute_batch("ROLLBACK").map_err(store_err)
    }
}

fn store_err(err: impl Display) -> RelationError {
    RelationError::Store(err.to_string())
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String, RelationError> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(store_err)
}
