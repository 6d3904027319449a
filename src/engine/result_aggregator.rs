// ==========================================
// 仓储导入对账系统 - 结果汇总器
// ==========================================
// 职责: 合并校验错误与批次结果为最终 ImportReport
// 约束:
// - 错误顺序: 校验错误（按行号）在前，批次错误按批次顺序
// - errors 仅保留前 N 条；error_count 始终为完整数量
// - 结论: Cancelled > Failure(无数据) > Success(零错误) > Failure(零成功) > PartialSuccess
// ==========================================

use crate::domain::{
    BatchResult, BatchStatus, DeltaStats, ErrorEntry, ErrorKind, ImportOutcome, ImportReport,
};
use std::collections::BTreeSet;
use std::time::Duration;

pub struct ResultAggregator {
    error_display_limit: usize,
}

impl ResultAggregator {
    pub fn new(error_display_limit: usize) -> Self {
        Self {
            error_display_limit,
        }
    }

    /// 汇总
    ///
    /// # 参数
    /// - total_rows: 文件中的数据行数（不含空白行）
    /// - validation_errors: 行级校验错误
    /// - results: 批次结果（任意顺序）
    ///
    /// 是否取消只看批次结果: 全部批次完成后才到达的取消信号不改变结论
    pub fn aggregate(
        &self,
        run_id: &str,
        total_rows: usize,
        mut validation_errors: Vec<ErrorEntry>,
        mut results: Vec<BatchResult>,
        elapsed: Duration,
    ) -> ImportReport {
        results.sort_by_key(|r| r.batch_index);
        validation_errors.sort_by_key(|e| e.row_number.unwrap_or(0));

        let rejected_rows = validation_errors
            .iter()
            .filter_map(|e| e.row_number)
            .collect::<BTreeSet<_>>()
            .len();

        let mut persisted_rows = 0;
        let mut failed_rows = 0;
        let mut unprocessed_rows = 0;
        let mut delta = DeltaStats::default();

        for r in &results {
            delta.merge(&r.delta);
            match r.status {
                BatchStatus::Succeeded => {
                    persisted_rows += r.succeeded_rows;
                    failed_rows += r.row_count.saturating_sub(r.succeeded_rows);
                }
                BatchStatus::Failed => failed_rows += r.row_count,
                _ => unprocessed_rows += r.row_count,
            }
        }

        let cancelled = results.iter().any(|r| r.status == BatchStatus::Cancelled);

        let mut errors = validation_errors;
        for r in &mut results {
            errors.append(&mut r.errors);
        }
        if cancelled {
            errors.push(ErrorEntry {
                kind: ErrorKind::Cancelled,
                batch_index: None,
                row_number: None,
                message: format!("导入已取消，{} 行未处理", unprocessed_rows),
            });
        }

        let error_count = errors.len();
        let outcome = if cancelled {
            ImportOutcome::Cancelled
        } else if total_rows == 0 {
            ImportOutcome::Failure
        } else if error_count == 0 {
            ImportOutcome::Success
        } else if persisted_rows == 0 {
            ImportOutcome::Failure
        } else {
            ImportOutcome::PartialSuccess
        };

        let message = match outcome {
            ImportOutcome::Success => format!("导入成功: {} 行", persisted_rows),
            ImportOutcome::PartialSuccess => format!(
                "导入完成，{} 个错误（成功 {} 行）",
                error_count, persisted_rows
            ),
            ImportOutcome::Cancelled => format!(
                "导入已取消: 已完成 {} 行，{} 行未处理",
                persisted_rows, unprocessed_rows
            ),
            ImportOutcome::Failure => match errors.first() {
                Some(first) => format!("导入失败: {}", first),
                None => "导入失败: 没有可导入的数据".to_string(),
            },
        };

        let errors_truncated = error_count > self.error_display_limit;
        errors.truncate(self.error_display_limit);

        ImportReport {
            run_id: run_id.to_string(),
            outcome,
            message,
            total_rows,
            valid_rows: total_rows.saturating_sub(rejected_rows),
            persisted_rows,
            rejected_rows,
            failed_rows,
            unprocessed_rows,
            batch_count: results.len(),
            retried_batches: results.iter().filter(|r| r.attempts > 1).count(),
            batches: results.iter().map(BatchResult::summary).collect(),
            delta,
            error_count,
            errors,
            errors_truncated,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// 运行无法开始（文件不可读、表头缺失等）时的报告
    pub fn failure_report(&self, run_id: &str, error: ErrorEntry, elapsed: Duration) -> ImportReport {
        self.aggregate(run_id, 0, vec![error], Vec::new(), elapsed)
    }
}
