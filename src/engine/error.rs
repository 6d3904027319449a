// ==========================================
// 仓储导入对账系统 - 批次引擎错误类型
// ==========================================
// 工具: thiserror 派生宏
// 分类: 可重试（解析/外部处理/超时/持久化） vs 不可重试（取消/内部一致性）
// ==========================================

use crate::domain::{EntityCategory, ErrorKind};
use crate::repository::error::RepositoryError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("实体解析失败 ({category}): {message}")]
    Resolution {
        category: EntityCategory,
        message: String,
    },

    #[error("外部处理失败: {0}")]
    ExternalProcessing(String),

    #[error("单次尝试超时（{0:?}）")]
    Timeout(Duration),

    #[error("持久化失败: {0}")]
    Persistence(#[from] RepositoryError),

    #[error("内部一致性错误: {category} 业务键 {key} 缺少已解析 ID")]
    MissingMapping {
        category: EntityCategory,
        key: String,
    },

    #[error("导入已取消")]
    Cancelled,

    #[error("内部错误: {0}")]
    Internal(String),
}

impl BatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BatchError::Resolution { .. } => ErrorKind::Resolution,
            BatchError::ExternalProcessing(_) | BatchError::Timeout(_) => {
                ErrorKind::ExternalProcessing
            }
            BatchError::Persistence(_) => ErrorKind::Persistence,
            BatchError::MissingMapping { .. } | BatchError::Internal(_) => ErrorKind::Internal,
            BatchError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// 是否允许重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Resolution | ErrorKind::ExternalProcessing | ErrorKind::Persistence
        )
    }
}

pub type BatchResultOf<T> = Result<T, BatchError>;
