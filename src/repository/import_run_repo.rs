// ==========================================
// 仓储导入对账系统 - 导入运行历史仓储
// ==========================================
// 职责: import_run 表的写入与查询
// 说明: 每次导入运行结束后落一条记录（含完整报告 JSON）
// ==========================================

use crate::domain::{ImportOutcome, ImportRun};
use crate::repository::error::{RepositoryError, RepositoryResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};

pub struct ImportRunRepository {
    conn: Arc<Mutex<Connection>>,
}

impl ImportRunRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    /// 记录一次导入运行（同 run_id 覆盖写）
    pub fn record_run(&self, run: &ImportRun) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO import_run (
                run_id, source_file, operator, outcome,
                total_rows, persisted_rows, error_count, elapsed_ms,
                report_json, started_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                run.run_id,
                run.source_file,
                run.operator,
                run.outcome.as_str(),
                run.total_rows,
                run.persisted_rows,
                run.error_count,
                run.elapsed_ms,
                run.report_json,
                run.started_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// 按 run_id 查询
    pub fn find_by_id(&self, run_id: &str) -> RepositoryResult<Option<ImportRun>> {
        let conn = self.get_conn()?;
        let run = conn
            .query_row(
                r#"
                SELECT run_id, source_file, operator, outcome,
                       total_rows, persisted_rows, error_count, elapsed_ms,
                       report_json, started_at
                FROM import_run
                WHERE run_id = ?1
                "#,
                params![run_id],
                map_run_row,
            )
            .optional()?;
        Ok(run)
    }

    /// 最近的导入运行（按开始时间倒序）
    pub fn list_recent(&self, limit: usize) -> RepositoryResult<Vec<ImportRun>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT run_id, source_file, operator, outcome,
                   total_rows, persisted_rows, error_count, elapsed_ms,
                   report_json, started_at
            FROM import_run
            ORDER BY started_at DESC
            LIMIT ?1
            "#,
        )?;
        let runs = stmt
            .query_map(params![limit as i64], map_run_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }
}

fn map_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ImportRun> {
    let outcome: String = row.get(3)?;
    let started_at: String = row.get(9)?;
    Ok(ImportRun {
        run_id: row.get(0)?,
        source_file: row.get(1)?,
        operator: row.get(2)?,
        outcome: ImportOutcome::from_str(&outcome),
        total_rows: row.get(4)?,
        persisted_rows: row.get(5)?,
        error_count: row.get(6)?,
        elapsed_ms: row.get(7)?,
        report_json: row.get(8)?,
        started_at: DateTime::parse_from_rfc3339(&started_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}
