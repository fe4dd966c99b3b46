// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL-backed link index.
//!
//! SQLite is the default backing store; MySQL covers shared deployments.
//! Both are reached through sqlx's `Any` driver with a dialect switch on
//! the connection string, so the schema sticks to the common denominator:
//! epoch-millisecond BIGINT timestamps and TEXT payloads.
//!
//! ## sqlx Any Driver Quirks
//!
//! The `Any` driver can surface MySQL TEXT columns as byte buffers rather
//! than strings, so every nullable text read goes through [`text_column`],
//! which tries `String` first and falls back to UTF-8 bytes.

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::sync::Once;
use std::time::Duration;
use tracing::debug;

use super::{Conflict, EntityRef, IndexError, LinkIndex, RunStatus, RunSummary};
use crate::record::{now_millis, Cursor};
use crate::retry::{with_backoff, BackoffPolicy};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

fn backend_err(e: sqlx::Error) -> IndexError {
    IndexError::Backend(e.to_string())
}

/// Read a nullable text column under the Any driver.
fn text_column(row: &AnyRow, col: &str) -> Option<String> {
    if let Ok(value) = row.try_get::<Option<String>, _>(col) {
        return value;
    }
    row.try_get::<Option<Vec<u8>>, _>(col)
        .ok()
        .flatten()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

pub struct SqlLinkIndex {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlLinkIndex {
    /// Connect and create the schema if needed. Fails fast on a bad
    /// connection string.
    pub async fn new(connection_string: &str) -> Result<Self, IndexError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = with_backoff("index_connect", &BackoffPolicy::connect(), || async {
            AnyPoolOptions::new()
                .max_connections(10)
                .acquire_timeout(Duration::from_secs(10))
                .connect(connection_string)
                .await
                .map_err(|e| IndexError::Connection(e.to_string()))
        })
        .await?;

        let index = Self { pool, is_sqlite };
        index.init_schema().await?;
        Ok(index)
    }

    async fn init_schema(&self) -> Result<(), IndexError> {
        let statements: Vec<&str> = if self.is_sqlite {
            vec![
                r#"
                CREATE TABLE IF NOT EXISTS links (
                    src_adapter TEXT NOT NULL,
                    src_table TEXT NOT NULL,
                    src_id TEXT NOT NULL,
                    dest_adapter TEXT NOT NULL,
                    dest_table TEXT NOT NULL,
                    dest_id TEXT NOT NULL,
                    last_sync_ts INTEGER,
                    PRIMARY KEY (src_adapter, src_table, src_id,
                                 dest_adapter, dest_table, dest_id)
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_links_dest
                 ON links (dest_adapter, dest_table, dest_id)",
                r#"
                CREATE TABLE IF NOT EXISTS cursors (
                    job_id TEXT NOT NULL,
                    adapter TEXT NOT NULL,
                    table_name TEXT NOT NULL,
                    cursor_token TEXT,
                    fail_count INTEGER NOT NULL DEFAULT 0,
                    disabled_at INTEGER,
                    PRIMARY KEY (job_id, adapter, table_name)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS runs (
                    run_id TEXT PRIMARY KEY,
                    job_id TEXT NOT NULL,
                    started_at INTEGER NOT NULL,
                    ended_at INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    summary_json TEXT
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS conflicts (
                    conflict_id TEXT PRIMARY KEY,
                    job_id TEXT NOT NULL,
                    src_adapter TEXT NOT NULL,
                    src_table TEXT NOT NULL,
                    src_id TEXT NOT NULL,
                    dest_adapter TEXT NOT NULL,
                    dest_table TEXT NOT NULL,
                    dest_id TEXT NOT NULL,
                    src_payload TEXT,
                    dest_payload TEXT,
                    detected_at INTEGER NOT NULL
                )
                "#,
            ]
        } else {
            // MySQL: VARCHAR(160) keys keep the six-column composite primary
            // key under the utf8mb4 index size limit.
            vec![
                r#"
                CREATE TABLE IF NOT EXISTS links (
                    src_adapter VARCHAR(160) NOT NULL,
                    src_table VARCHAR(160) NOT NULL,
                    src_id VARCHAR(160) NOT NULL,
                    dest_adapter VARCHAR(160) NOT NULL,
                    dest_table VARCHAR(160) NOT NULL,
                    dest_id VARCHAR(160) NOT NULL,
                    last_sync_ts BIGINT,
                    PRIMARY KEY (src_adapter, src_table, src_id,
                                 dest_adapter, dest_table, dest_id),
                    INDEX idx_links_dest (dest_adapter, dest_table, dest_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS cursors (
                    job_id VARCHAR(160) NOT NULL,
                    adapter VARCHAR(160) NOT NULL,
                    table_name VARCHAR(160) NOT NULL,
                    cursor_token TEXT,
                    fail_count INT NOT NULL DEFAULT 0,
                    disabled_at BIGINT,
                    PRIMARY KEY (job_id, adapter, table_name)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS runs (
                    run_id VARCHAR(64) PRIMARY KEY,
                    job_id VARCHAR(160) NOT NULL,
                    started_at BIGINT NOT NULL,
                    ended_at BIGINT NOT NULL,
                    status VARCHAR(16) NOT NULL,
                    summary_json TEXT,
                    INDEX idx_runs_job (job_id, started_at)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS conflicts (
                    conflict_id VARCHAR(64) PRIMARY KEY,
                    job_id VARCHAR(160) NOT NULL,
                    src_adapter VARCHAR(160) NOT NULL,
                    src_table VARCHAR(160) NOT NULL,
                    src_id VARCHAR(160) NOT NULL,
                    dest_adapter VARCHAR(160) NOT NULL,
                    dest_table VARCHAR(160) NOT NULL,
                    dest_id VARCHAR(160) NOT NULL,
                    src_payload TEXT,
                    dest_payload TEXT,
                    detected_at BIGINT NOT NULL
                )
                "#,
            ]
        };

        for sql in statements {
            with_backoff("index_init_schema", &BackoffPolicy::connect(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(backend_err)
            })
            .await?;
        }

        Ok(())
    }

    /// The other end of whatever link touches `entity`, regardless of the
    /// orientation the link row was written with.
    async fn counterpart(&self, entity: &EntityRef) -> Result<Option<String>, IndexError> {
        with_backoff("index_find_link", &BackoffPolicy::query(), || async {
            let forward = sqlx::query(
                "SELECT dest_id FROM links
                 WHERE src_adapter = ? AND src_table = ? AND src_id = ?",
            )
            .bind(&entity.adapter)
            .bind(&entity.table)
            .bind(&entity.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;

            if let Some(row) = forward {
                return Ok(row.try_get::<String, _>("dest_id").ok());
            }

            let reverse = sqlx::query(
                "SELECT src_id FROM links
                 WHERE dest_adapter = ? AND dest_table = ? AND dest_id = ?",
            )
            .bind(&entity.adapter)
            .bind(&entity.table)
            .bind(&entity.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;

            Ok(reverse.and_then(|row| row.try_get::<String, _>("src_id").ok()))
        })
        .await
    }
}

#[async_trait]
impl LinkIndex for SqlLinkIndex {
    async fn upsert_link(&self, src: &EntityRef, dest: &EntityRef) -> Result<(), IndexError> {
        with_backoff("index_upsert_link", &BackoffPolicy::query(), || async {
            let mut tx = self.pool.begin().await.map_err(backend_err)?;

            // Break every binding touching either endpoint, in both
            // orientations, then install the new pair. Readers see the old
            // binding or the new one, never a half-update.
            sqlx::query(
                "DELETE FROM links
                 WHERE (src_adapter = ? AND src_table = ? AND src_id = ?)
                    OR (dest_adapter = ? AND dest_table = ? AND dest_id = ?)
                    OR (src_adapter = ? AND src_table = ? AND src_id = ?)
                    OR (dest_adapter = ? AND dest_table = ? AND dest_id = ?)",
            )
            .bind(&src.adapter)
            .bind(&src.table)
            .bind(&src.id)
            .bind(&src.adapter)
            .bind(&src.table)
            .bind(&src.id)
            .bind(&dest.adapter)
            .bind(&dest.table)
            .bind(&dest.id)
            .bind(&dest.adapter)
            .bind(&dest.table)
            .bind(&dest.id)
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;

            sqlx::query(
                "INSERT INTO links (src_adapter, src_table, src_id,
                                    dest_adapter, dest_table, dest_id, last_sync_ts)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&src.adapter)
            .bind(&src.table)
            .bind(&src.id)
            .bind(&dest.adapter)
            .bind(&dest.table)
            .bind(&dest.id)
            .bind(now_millis())
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;

            tx.commit().await.map_err(backend_err)?;
            debug!(src = %src, dest = %dest, "link upserted");
            Ok(())
        })
        .await
    }

    async fn find_dest(&self, src: &EntityRef) -> Result<Option<String>, IndexError> {
        self.counterpart(src).await
    }

    async fn find_source(&self, dest: &EntityRef) -> Result<Option<String>, IndexError> {
        self.counterpart(dest).await
    }

    async fn load_cursor(
        &self,
        job: &str,
        adapter: &str,
        table: &str,
    ) -> Result<Cursor, IndexError> {
        with_backoff("index_load_cursor", &BackoffPolicy::query(), || async {
            let row = sqlx::query(
                "SELECT cursor_token FROM cursors
                 WHERE job_id = ? AND adapter = ? AND table_name = ?",
            )
            .bind(job)
            .bind(adapter)
            .bind(table)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;

            Ok(row
                .and_then(|r| text_column(&r, "cursor_token"))
                .map_or_else(Cursor::initial, Cursor::at))
        })
        .await
    }

    async fn save_cursor(
        &self,
        job: &str,
        adapter: &str,
        table: &str,
        cursor: &Cursor,
    ) -> Result<(), IndexError> {
        let sql = if self.is_sqlite {
            "INSERT INTO cursors (job_id, adapter, table_name, cursor_token)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(job_id, adapter, table_name)
             DO UPDATE SET cursor_token = excluded.cursor_token"
        } else {
            "INSERT INTO cursors (job_id, adapter, table_name, cursor_token)
             VALUES (?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE cursor_token = VALUES(cursor_token)"
        };

        with_backoff("index_save_cursor", &BackoffPolicy::query(), || async {
            sqlx::query(sql)
                .bind(job)
                .bind(adapter)
                .bind(table)
                .bind(&cursor.value)
                .execute(&self.pool)
                .await
                .map_err(backend_err)?;
            Ok(())
        })
        .await
    }

    async fn is_job_disabled(&self, job: &str) -> Result<bool, IndexError> {
        with_backoff("index_is_disabled", &BackoffPolicy::query(), || async {
            let row = sqlx::query(
                "SELECT 1 AS hit FROM cursors
                 WHERE job_id = ? AND disabled_at IS NOT NULL LIMIT 1",
            )
            .bind(job)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
            Ok(row.is_some())
        })
        .await
    }

    async fn set_job_disabled(&self, job: &str, ts_millis: i64) -> Result<(), IndexError> {
        with_backoff("index_set_disabled", &BackoffPolicy::query(), || async {
            sqlx::query("UPDATE cursors SET disabled_at = ? WHERE job_id = ?")
                .bind(ts_millis)
                .bind(job)
                .execute(&self.pool)
                .await
                .map_err(backend_err)?;
            Ok(())
        })
        .await
    }

    async fn increment_fail_count(
        &self,
        job: &str,
        adapter: &str,
        table: &str,
    ) -> Result<u32, IndexError> {
        let sql = if self.is_sqlite {
            "INSERT INTO cursors (job_id, adapter, table_name, fail_count)
             VALUES (?, ?, ?, 1)
             ON CONFLICT(job_id, adapter, table_name)
             DO UPDATE SET fail_count = fail_count + 1"
        } else {
            "INSERT INTO cursors (job_id, adapter, table_name, fail_count)
             VALUES (?, ?, ?, 1)
             ON DUPLICATE KEY UPDATE fail_count = fail_count + 1"
        };

        with_backoff("index_increment_fail", &BackoffPolicy::query(), || async {
            sqlx::query(sql)
                .bind(job)
                .bind(adapter)
                .bind(table)
                .execute(&self.pool)
                .await
                .map_err(backend_err)?;

            let row = sqlx::query(
                "SELECT fail_count FROM cursors
                 WHERE job_id = ? AND adapter = ? AND table_name = ?",
            )
            .bind(job)
            .bind(adapter)
            .bind(table)
            .fetch_one(&self.pool)
            .await
            .map_err(backend_err)?;

            let count: i64 = row.try_get("fail_count").map_err(backend_err)?;
            Ok(count as u32)
        })
        .await
    }

    async fn reset_fail_count(
        &self,
        job: &str,
        adapter: &str,
        table: &str,
    ) -> Result<(), IndexError> {
        with_backoff("index_reset_fail", &BackoffPolicy::query(), || async {
            sqlx::query(
                "UPDATE cursors SET fail_count = 0
                 WHERE job_id = ? AND adapter = ? AND table_name = ?",
            )
            .bind(job)
            .bind(adapter)
            .bind(table)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
            Ok(())
        })
        .await
    }

    async fn get_fail_count(
        &self,
        job: &str,
        adapter: &str,
        table: &str,
    ) -> Result<u32, IndexError> {
        with_backoff("index_get_fail", &BackoffPolicy::query(), || async {
            let row = sqlx::query(
                "SELECT fail_count FROM cursors
                 WHERE job_id = ? AND adapter = ? AND table_name = ?",
            )
            .bind(job)
            .bind(adapter)
            .bind(table)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;

            match row {
                Some(r) => {
                    let count: i64 = r.try_get("fail_count").map_err(backend_err)?;
                    Ok(count as u32)
                }
                None => Ok(0),
            }
        })
        .await
    }

    async fn insert_conflict(&self, conflict: &Conflict) -> Result<(), IndexError> {
        let src_payload =
            serde_json::to_string(&conflict.src_payload).unwrap_or_else(|_| "null".into());
        let dest_payload =
            serde_json::to_string(&conflict.dest_payload).unwrap_or_else(|_| "null".into());

        with_backoff("index_insert_conflict", &BackoffPolicy::query(), || async {
            sqlx::query(
                "INSERT INTO conflicts (conflict_id, job_id,
                     src_adapter, src_table, src_id,
                     dest_adapter, dest_table, dest_id,
                     src_payload, dest_payload, detected_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&conflict.conflict_id)
            .bind(&conflict.job_id)
            .bind(&conflict.src.adapter)
            .bind(&conflict.src.table)
            .bind(&conflict.src.id)
            .bind(&conflict.dest.adapter)
            .bind(&conflict.dest.table)
            .bind(&conflict.dest.id)
            .bind(&src_payload)
            .bind(&dest_payload)
            .bind(conflict.detected_at)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
            Ok(())
        })
        .await
    }

    async fn get_conflicts(&self, job: &str) -> Result<Vec<Conflict>, IndexError> {
        with_backoff("index_get_conflicts", &BackoffPolicy::query(), || async {
            let rows = sqlx::query(
                "SELECT conflict_id, job_id,
                        src_adapter, src_table, src_id,
                        dest_adapter, dest_table, dest_id,
                        src_payload, dest_payload, detected_at
                 FROM conflicts WHERE job_id = ? ORDER BY detected_at",
            )
            .bind(job)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;

            let mut conflicts = Vec::with_capacity(rows.len());
            for row in rows {
                let parse = |col: &str| {
                    text_column(&row, col)
                        .and_then(|s| serde_json::from_str(&s).ok())
                        .unwrap_or(serde_json::Value::Null)
                };
                conflicts.push(Conflict {
                    conflict_id: row.try_get("conflict_id").map_err(backend_err)?,
                    job_id: row.try_get("job_id").map_err(backend_err)?,
                    src: EntityRef::new(
                        row.try_get::<String, _>("src_adapter").map_err(backend_err)?,
                        row.try_get::<String, _>("src_table").map_err(backend_err)?,
                        row.try_get::<String, _>("src_id").map_err(backend_err)?,
                    ),
                    dest: EntityRef::new(
                        row.try_get::<String, _>("dest_adapter").map_err(backend_err)?,
                        row.try_get::<String, _>("dest_table").map_err(backend_err)?,
                        row.try_get::<String, _>("dest_id").map_err(backend_err)?,
                    ),
                    src_payload: parse("src_payload"),
                    dest_payload: parse("dest_payload"),
                    detected_at: row.try_get("detected_at").map_err(backend_err)?,
                });
            }
            Ok(conflicts)
        })
        .await
    }

    async fn resolve_conflict(&self, conflict_id: &str) -> Result<(), IndexError> {
        with_backoff("index_resolve_conflict", &BackoffPolicy::query(), || async {
            sqlx::query("DELETE FROM conflicts WHERE conflict_id = ?")
                .bind(conflict_id)
                .execute(&self.pool)
                .await
                .map_err(backend_err)?;
            Ok(())
        })
        .await
    }

    async fn insert_run(&self, run: &RunSummary) -> Result<(), IndexError> {
        with_backoff("index_insert_run", &BackoffPolicy::query(), || async {
            sqlx::query(
                "INSERT INTO runs (run_id, job_id, started_at, ended_at, status, summary_json)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&run.run_id)
            .bind(&run.job_id)
            .bind(run.started_at)
            .bind(run.ended_at)
            .bind(run.status.as_str())
            .bind(&run.summary_json)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
            Ok(())
        })
        .await
    }

    async fn get_runs(&self, job: &str) -> Result<Vec<RunSummary>, IndexError> {
        with_backoff("index_get_runs", &BackoffPolicy::query(), || async {
            let rows = sqlx::query(
                "SELECT run_id, job_id, started_at, ended_at, status, summary_json
                 FROM runs WHERE job_id = ? ORDER BY started_at",
            )
            .bind(job)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;

            let mut runs = Vec::with_capacity(rows.len());
            for row in rows {
                let status_text: String = row.try_get("status").map_err(backend_err)?;
                let status = RunStatus::parse(&status_text).ok_or_else(|| {
                    IndexError::Backend(format!("unknown run status '{status_text}'"))
                })?;
                runs.push(RunSummary {
                    run_id: row.try_get("run_id").map_err(backend_err)?,
                    job_id: row.try_get("job_id").map_err(backend_err)?,
                    started_at: row.try_get("started_at").map_err(backend_err)?,
                    ended_at: row.try_get("ended_at").map_err(backend_err)?,
                    status,
                    summary_json: text_column(&row, "summary_json").unwrap_or_default(),
                });
            }
            Ok(runs)
        })
        .await
    }
}
