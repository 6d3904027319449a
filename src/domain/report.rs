// ==========================================
// 仓储导入对账系统 - 导入结果模型
// ==========================================
// 职责: 行级/批次级结果、最终导入报告、运行历史
// ==========================================

use crate::domain::types::{BatchStatus, ErrorKind, ImportOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ==========================================
// ErrorEntry - 结构化错误条目
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub kind: ErrorKind,
    pub batch_index: Option<usize>,
    pub row_number: Option<usize>,
    pub message: String,
}

impl ErrorEntry {
    /// 行级校验错误
    pub fn validation(row_number: usize, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Validation,
            batch_index: None,
            row_number: Some(row_number),
            message: message.into(),
        }
    }

    pub fn for_row(
        kind: ErrorKind,
        batch_index: usize,
        row_number: usize,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            batch_index: Some(batch_index),
            row_number: Some(row_number),
            message: message.into(),
        }
    }

    pub fn for_batch(kind: ErrorKind, batch_index: usize, message: impl Into<String>) -> Self {
        Self {
            kind,
            batch_index: Some(batch_index),
            row_number: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.batch_index, self.row_number) {
            (Some(b), Some(r)) => write!(f, "批次 {} 行 {}: {}", b, r, self.message),
            (Some(b), None) => write!(f, "批次 {}: {}", b, self.message),
            (None, Some(r)) => write!(f, "行 {}: {}", r, self.message),
            (None, None) => write!(f, "{}", self.message),
        }
    }
}

// ==========================================
// DeltaStats - 实体/库存变更统计
// ==========================================
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaStats {
    pub entities_created: usize,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub over_provisioned: usize, // 因带序列号而无法删除的多余单元
}

impl DeltaStats {
    pub fn merge(&mut self, other: &DeltaStats) {
        self.entities_created += other.entities_created;
        self.added += other.added;
        self.updated += other.updated;
        self.removed += other.removed;
        self.over_provisioned += other.over_provisioned;
    }
}

// ==========================================
// BatchResult - 单批次结果
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_index: usize, // 从 1 开始
    pub status: BatchStatus,
    pub attempts: u32,
    pub row_count: usize,
    pub succeeded_rows: usize,
    pub errors: Vec<ErrorEntry>,
    pub delta: DeltaStats,
    pub elapsed_ms: u64,
}

impl BatchResult {
    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            batch_index: self.batch_index,
            status: self.status,
            attempts: self.attempts,
            row_count: self.row_count,
            succeeded_rows: self.succeeded_rows,
            error_count: self.errors.len(),
            elapsed_ms: self.elapsed_ms,
        }
    }
}

/// 报告中的批次摘要（不含错误明细）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_index: usize,
    pub status: BatchStatus,
    pub attempts: u32,
    pub row_count: usize,
    pub succeeded_rows: usize,
    pub error_count: usize,
    pub elapsed_ms: u64,
}

// ==========================================
// ImportReport - 最终导入报告
// ==========================================
// errors 仅保留前 N 条；error_count 始终为完整数量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportReport {
    pub run_id: String,
    pub outcome: ImportOutcome,
    pub message: String,

    // ===== 行统计 =====
    pub total_rows: usize,
    pub valid_rows: usize,
    pub persisted_rows: usize,
    pub rejected_rows: usize,    // 校验拒绝
    pub failed_rows: usize,      // 批次失败丢失
    pub unprocessed_rows: usize, // 取消后未处理

    // ===== 批次统计 =====
    pub batch_count: usize,
    pub retried_batches: usize,
    pub batches: Vec<BatchSummary>,
    pub delta: DeltaStats,

    // ===== 错误 =====
    pub error_count: usize,
    pub errors: Vec<ErrorEntry>,
    pub errors_truncated: bool,

    pub elapsed_ms: u64,
}

impl ImportReport {
    pub fn is_cancelled(&self) -> bool {
        self.outcome == ImportOutcome::Cancelled
    }
}

// ==========================================
// ImportRun - 导入运行历史
// ==========================================
// 对齐: import_run 表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportRun {
    pub run_id: String,
    pub source_file: Option<String>,
    pub operator: String,
    pub outcome: ImportOutcome,
    pub total_rows: i64,
    pub persisted_rows: i64,
    pub error_count: i64,
    pub elapsed_ms: i64,
    pub report_json: String,
    pub started_at: DateTime<Utc>,
}
