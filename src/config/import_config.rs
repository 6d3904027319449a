// ==========================================
// 仓储导入对账系统 - 导入运行参数
// ==========================================
// 职责: 批次切分、重试、超时、节流、上传限制等运行参数
// 来源: 默认值 → config_kv 覆写 → 命令行覆写
// ==========================================

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ==========================================
// RetryBackoff - 重试间隔增长策略
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryBackoff {
    #[default]
    Fixed, // 每次等待 retry_delay
    Linear,      // retry_delay * 失败次数
    Exponential, // retry_delay * 2^(失败次数-1)
}

impl RetryBackoff {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryBackoff::Fixed => "FIXED",
            RetryBackoff::Linear => "LINEAR",
            RetryBackoff::Exponential => "EXPONENTIAL",
        }
    }

    /// 解析配置值（未知值返回 None，由调用方回退默认）
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "FIXED" => Some(RetryBackoff::Fixed),
            "LINEAR" => Some(RetryBackoff::Linear),
            "EXPONENTIAL" => Some(RetryBackoff::Exponential),
            _ => None,
        }
    }

    /// 第 failed_attempts 次失败后的等待时长（failed_attempts 从 1 开始）
    pub fn delay(&self, base: Duration, failed_attempts: u32) -> Duration {
        let n = failed_attempts.max(1);
        match self {
            RetryBackoff::Fixed => base,
            RetryBackoff::Linear => base.saturating_mul(n),
            RetryBackoff::Exponential => {
                let factor = 1u32.checked_shl(n - 1).unwrap_or(u32::MAX);
                base.saturating_mul(factor)
            }
        }
    }
}

// ==========================================
// ImportSettings
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSettings {
    // ===== 批次 =====
    pub batch_size: usize,
    pub max_batch_size: usize,

    // ===== 重试 =====
    pub max_retries: u32, // 总尝试次数（含首次）
    pub retry_delay: Duration,
    pub retry_backoff: RetryBackoff,
    pub attempt_timeout: Duration,

    // ===== 节流与并行 =====
    pub pacing_delay: Duration, // 仅顺序模式下批次之间
    pub parallel_processing: bool,
    pub max_parallel_batches: usize,

    // ===== 上传限制 =====
    pub max_file_size_mb: u64,
    pub allowed_extensions: Vec<String>,

    // ===== 数量上限 =====
    /// 单行及单分组（数量之和）允许的最大数量
    pub max_quantity: u32,

    // ===== 报告 =====
    pub error_display_limit: usize,

    /// 新建实体的 created_by
    pub created_by: String,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_batch_size: 1000,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            retry_backoff: RetryBackoff::Fixed,
            attempt_timeout: Duration::from_secs(300),
            pacing_delay: Duration::from_secs(1),
            parallel_processing: false,
            max_parallel_batches: 4,
            max_file_size_mb: 50,
            allowed_extensions: vec![".xlsx".to_string(), ".xls".to_string(), ".csv".to_string()],
            max_quantity: 100_000,
            error_display_limit: 50,
            created_by: "system".to_string(),
        }
    }
}

impl ImportSettings {
    /// 实际批次大小：[1, max_batch_size]
    pub fn effective_batch_size(&self) -> usize {
        let cap = self.max_batch_size.max(1);
        self.batch_size.clamp(1, cap)
    }

    /// 实际尝试次数（0 视为 1）
    pub fn effective_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    /// 扩展名是否在允许列表中（忽略大小写，允许列表可带或不带点）
    pub fn is_extension_allowed(&self, extension: &str) -> bool {
        let ext = extension.trim_start_matches('.').to_lowercase();
        self.allowed_extensions
            .iter()
            .any(|allowed| allowed.trim_start_matches('.').to_lowercase() == ext)
    }
}
