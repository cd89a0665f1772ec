//! SQLite-backed evolution store
//!
//! Records are stored as JSON bodies next to the few columns used for
//! filtering. Timestamps are fixed-width RFC 3339 strings so range filters
//! compare lexicographically.

use super::{Ack, AuditEntry, Commit, EntityKey, EvolutionStore, OwnedEntity, Versioned};
use crate::audit::CommitRecord;
use crate::error::{EvolutionError, Result};
use crate::types::{AgentLog, MemoryFact, MemoryOperation, Pattern, Scope};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS facts (
    id TEXT PRIMARY KEY,
    scope TEXT NOT NULL,
    created_at TEXT NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_facts_scope_created ON facts(scope, created_at);

CREATE TABLE IF NOT EXISTS memory_operations (
    id TEXT PRIMARY KEY,
    scope TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    target TEXT,
    version INTEGER,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_operations_scope_ts ON memory_operations(scope, timestamp);

CREATE TABLE IF NOT EXISTS agent_logs (
    id TEXT PRIMARY KEY,
    scope TEXT NOT NULL,
    created_at TEXT NOT NULL,
    target TEXT,
    version INTEGER,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_agent_logs_scope_created ON agent_logs(scope, created_at);

CREATE TABLE IF NOT EXISTS patterns (
    scope TEXT NOT NULL,
    key TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    body TEXT NOT NULL,
    PRIMARY KEY (scope, key)
);

CREATE TABLE IF NOT EXISTS entity_versions (
    scope TEXT NOT NULL,
    target TEXT NOT NULL,
    version INTEGER NOT NULL,
    committed_at TEXT NOT NULL,
    body TEXT NOT NULL,
    PRIMARY KEY (scope, target, version)
);
"#;

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| EvolutionError::Storage(format!("Invalid timestamp '{}': {}", s, e)))
}

fn decode<T: DeserializeOwned>(bodies: Vec<String>) -> Result<Vec<T>> {
    bodies
        .iter()
        .map(|b| serde_json::from_str(b).map_err(EvolutionError::from))
        .collect()
}

/// SQLite evolution store
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        info!("Opening evolution store at {}", path.display());
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| EvolutionError::Storage(format!("Failed to lock connection: {}", e)))?;
        f(&mut conn)
    }

    /// Oldest-first window over one table, keeping the newest `limit` rows
    fn read_window<T: DeserializeOwned>(
        &self,
        table: &str,
        ts_column: &str,
        scope: &Scope,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<T>> {
        let sql = format!(
            "SELECT body FROM (
                SELECT body, {ts} AS ts FROM {table}
                WHERE scope = ?1 AND {ts} >= ?2
                ORDER BY {ts} DESC LIMIT ?3
             ) ORDER BY ts ASC",
            ts = ts_column,
            table = table
        );
        let bodies = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![scope.to_string(), ts(&since), limit as i64], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        decode(bodies)
    }

    fn insert_operation(conn: &Connection, op: &MemoryOperation) -> Result<()> {
        conn.execute(
            "INSERT INTO memory_operations (id, scope, timestamp, target, version, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                op.id.to_string(),
                op.scope.to_string(),
                ts(&op.timestamp),
                op.commit.as_ref().map(|c| c.target.to_string()),
                op.commit.as_ref().map(|c| c.version as i64),
                serde_json::to_string(op)?,
            ],
        )?;

        for fact_id in &op.fact_ids {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM facts WHERE id = ?1 AND scope = ?2",
                    params![fact_id.to_string(), op.scope.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(body) = body else {
                debug!("Operation {} references unknown fact {}", op.id, fact_id);
                continue;
            };
            let mut fact: MemoryFact = serde_json::from_str(&body)?;
            fact.apply_operation(op);
            conn.execute(
                "UPDATE facts SET body = ?2 WHERE id = ?1",
                params![fact_id.to_string(), serde_json::to_string(&fact)?],
            )?;
        }
        Ok(())
    }

    fn insert_agent_log(conn: &Connection, log: &AgentLog) -> Result<()> {
        conn.execute(
            "INSERT INTO agent_logs (id, scope, created_at, target, version, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                log.id.to_string(),
                log.scope.to_string(),
                ts(&log.created_at),
                log.commit.as_ref().map(|c| c.target.to_string()),
                log.commit.as_ref().map(|c| c.version as i64),
                serde_json::to_string(log)?,
            ],
        )?;
        Ok(())
    }

    fn insert_pattern(conn: &Connection, pattern: &Pattern) -> Result<()> {
        conn.execute(
            "INSERT INTO patterns (scope, key, last_seen_at, body) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(scope, key) DO UPDATE SET last_seen_at = excluded.last_seen_at, body = excluded.body",
            params![
                pattern.scope.to_string(),
                pattern.key,
                ts(&pattern.last_seen_at),
                serde_json::to_string(pattern)?,
            ],
        )?;
        Ok(())
    }

    fn row_to_version(version: i64, committed_at: String, body: String) -> Result<Versioned<OwnedEntity>> {
        Ok(Versioned {
            version: version as u64,
            value: serde_json::from_str(&body)?,
            committed_at: parse_ts(&committed_at)?,
        })
    }
}

#[async_trait]
impl EvolutionStore for SqliteStore {
    async fn get_current(
        &self,
        scope: &Scope,
        key: &EntityKey,
    ) -> Result<Option<Versioned<OwnedEntity>>> {
        let row = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT version, committed_at, body FROM entity_versions
                     WHERE scope = ?1 AND target = ?2 ORDER BY version DESC LIMIT 1",
                    params![scope.to_string(), key.to_string()],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
                )
                .optional()?)
        })?;
        row.map(|(v, c, b)| Self::row_to_version(v, c, b)).transpose()
    }

    async fn history(&self, scope: &Scope, key: &EntityKey) -> Result<Vec<Versioned<OwnedEntity>>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT version, committed_at, body FROM entity_versions
                 WHERE scope = ?1 AND target = ?2 ORDER BY version ASC",
            )?;
            let rows = stmt
                .query_map(params![scope.to_string(), key.to_string()], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter()
            .map(|(v, c, b)| Self::row_to_version(v, c, b))
            .collect()
    }

    async fn list_current(&self, scope: &Scope) -> Result<Vec<Versioned<OwnedEntity>>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT v.version, v.committed_at, v.body FROM entity_versions v
                 JOIN (SELECT target, MAX(version) AS version FROM entity_versions
                       WHERE scope = ?1 GROUP BY target) latest
                   ON v.target = latest.target AND v.version = latest.version
                 WHERE v.scope = ?1 ORDER BY v.target ASC",
            )?;
            let rows = stmt
                .query_map(params![scope.to_string()], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter()
            .map(|(v, c, b)| Self::row_to_version(v, c, b))
            .collect()
    }

    async fn commit(&self, commit: Commit) -> Result<Ack> {
        let target = commit.target();
        let version = commit.next_version();

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let found: Option<i64> = tx.query_row(
                "SELECT MAX(version) FROM entity_versions WHERE scope = ?1 AND target = ?2",
                params![commit.scope.to_string(), target.to_string()],
                |row| row.get(0),
            )?;
            let found = found.map(|v| v as u64);
            if found != commit.expected_version {
                // Dropping the transaction rolls it back
                return Err(commit.conflict(found));
            }

            tx.execute(
                "INSERT INTO entity_versions (scope, target, version, committed_at, body)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    commit.scope.to_string(),
                    target.to_string(),
                    version as i64,
                    ts(&commit.committed_at()),
                    serde_json::to_string(&commit.entity)?,
                ],
            )?;
            match &commit.audit {
                AuditEntry::Operation(op) => Self::insert_operation(&tx, op)?,
                AuditEntry::AgentLog(log) => Self::insert_agent_log(&tx, log)?,
            }
            for pattern in &commit.patterns {
                Self::insert_pattern(&tx, pattern)?;
            }
            tx.commit()?;
            Ok(())
        })?;

        Ok(Ack::Committed { target, version })
    }

    async fn append_fact(&self, fact: &MemoryFact) -> Result<Ack> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO facts (id, scope, created_at, body) VALUES (?1, ?2, ?3, ?4)",
                params![
                    fact.id.to_string(),
                    fact.scope.to_string(),
                    ts(&fact.created_at),
                    serde_json::to_string(fact)?,
                ],
            )?;
            Ok(Ack::Appended { count: 1 })
        })
    }

    async fn read_facts(
        &self,
        scope: &Scope,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MemoryFact>> {
        self.read_window("facts", "created_at", scope, since, limit)
    }

    async fn append_operation(&self, op: &MemoryOperation) -> Result<Ack> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            Self::insert_operation(&tx, op)?;
            tx.commit()?;
            Ok(Ack::Appended { count: 1 })
        })
    }

    async fn read_operations(
        &self,
        scope: &Scope,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MemoryOperation>> {
        self.read_window("memory_operations", "timestamp", scope, since, limit)
    }

    async fn append_agent_log(&self, log: &AgentLog) -> Result<Ack> {
        self.with_conn(|conn| {
            Self::insert_agent_log(conn, log)?;
            Ok(Ack::Appended { count: 1 })
        })
    }

    async fn read_agent_logs(
        &self,
        scope: &Scope,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AgentLog>> {
        self.read_window("agent_logs", "created_at", scope, since, limit)
    }

    async fn upsert_pattern(&self, pattern: &Pattern) -> Result<Ack> {
        self.with_conn(|conn| {
            Self::insert_pattern(conn, pattern)?;
            Ok(Ack::Appended { count: 1 })
        })
    }

    async fn read_patterns(
        &self,
        scope: &Scope,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Pattern>> {
        self.read_window("patterns", "last_seen_at", scope, since, limit)
    }

    async fn read_audit(&self, scope: &Scope, key: &EntityKey) -> Result<Vec<CommitRecord>> {
        let (ops, logs) = self.with_conn(|conn| {
            let mut ops_stmt = conn.prepare(
                "SELECT body FROM memory_operations WHERE scope = ?1 AND target = ?2",
            )?;
            let ops = ops_stmt
                .query_map(params![scope.to_string(), key.to_string()], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let mut logs_stmt =
                conn.prepare("SELECT body FROM agent_logs WHERE scope = ?1 AND target = ?2")?;
            let logs = logs_stmt
                .query_map(params![scope.to_string(), key.to_string()], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok((ops, logs))
        })?;

        let ops: Vec<MemoryOperation> = decode(ops)?;
        let logs: Vec<AgentLog> = decode(logs)?;
        let mut records: Vec<CommitRecord> = ops
            .into_iter()
            .filter_map(|o| o.commit)
            .chain(logs.into_iter().filter_map(|l| l.commit))
            .collect();
        records.sort_by_key(|r| r.version);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::Evidence;
    use crate::evolution::memory::MemoryParams;
    use crate::types::{Agent, OperationKind};
    use chrono::Duration;

    #[tokio::test]
    async fn test_commit_conflict_writes_nothing() {
        let store = SqliteStore::in_memory().unwrap();
        let scope = Scope::default();
        let now = Utc::now();
        let make = |expected| {
            Commit::new(
                scope.clone(),
                expected,
                OwnedEntity::MemoryParams(MemoryParams::default()),
                AuditEntry::Operation(MemoryOperation::new(scope.clone(), OperationKind::Tune, vec![], now)),
                None,
                Evidence::default(),
                now,
            )
        };

        store.commit(make(None)).await.unwrap();
        let err = store.commit(make(None)).await.unwrap_err();
        assert!(matches!(err, EvolutionError::CommitConflict { found: Some(1), .. }));

        let ops = store.read_operations(&scope, now - Duration::hours(1), 10).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(store.history(&scope, &EntityKey::MemoryParams).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fact_updates_through_operations() {
        let store = SqliteStore::in_memory().unwrap();
        let scope = Scope::session("s1");
        let now = Utc::now();
        let fact = MemoryFact::new(scope.clone(), "prefers dark mode", 0.9, now);
        store.append_fact(&fact).await.unwrap();

        let forget = MemoryOperation::new(scope.clone(), OperationKind::Forget, vec![fact.id], now);
        store.append_operation(&forget).await.unwrap();

        let facts = store.read_facts(&scope, now - Duration::minutes(1), 10).await.unwrap();
        assert!(facts[0].is_forgotten());
    }

    #[tokio::test]
    async fn test_list_current_returns_latest_per_target() {
        let store = SqliteStore::in_memory().unwrap();
        let scope = Scope::Global;
        let agent = Agent::new(scope.clone(), "reminder", Utc::now());
        store.register_agent(agent.clone()).await.unwrap();

        let mut updated = agent.clone();
        updated.settings.retry_count = 5;
        let log = AgentLog::new(
            Some(agent.id),
            scope.clone(),
            crate::types::LogLevel::Info,
            "tuned",
            crate::types::AgentLogKind::Registered,
            Utc::now(),
        );
        store
            .commit(Commit::new(
                scope.clone(),
                Some(1),
                OwnedEntity::Agent(updated),
                AuditEntry::AgentLog(log),
                None,
                Evidence::default(),
                Utc::now(),
            ))
            .await
            .unwrap();

        let agents = store.list_agents(&scope).await.unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].version, 2);
        assert_eq!(agents[0].value.settings.retry_count, 5);
    }
}
