// ==========================================
// 仓储导入对账系统 - 导入配置读取 Trait
// ==========================================
// 职责: 定义导入模块所需的配置读取接口（不包含实现）
// 红线: 不包含配置写入、不包含业务逻辑
// ==========================================

use crate::config::import_config::{ImportSettings, RetryBackoff};
use crate::repository::error::RepositoryResult;
use async_trait::async_trait;
use std::time::Duration;

// ==========================================
// ImportConfigReader Trait
// ==========================================
// 用途: 导入模块所需的配置读取接口
// 实现者: ConfigManager（从 config_kv 表读取）
// 约束: 配置值无法解析时返回默认值，不报错
#[async_trait]
pub trait ImportConfigReader: Send + Sync {
    // ===== 批次 =====

    /// 批次大小
    ///
    /// # 默认值
    /// - 500
    async fn get_batch_size(&self) -> RepositoryResult<usize>;

    /// 批次大小上限
    ///
    /// # 默认值
    /// - 1000
    async fn get_max_batch_size(&self) -> RepositoryResult<usize>;

    // ===== 重试 =====

    /// 每批次总尝试次数
    ///
    /// # 默认值
    /// - 3
    async fn get_max_retries(&self) -> RepositoryResult<u32>;

    /// 重试间隔（毫秒存储）
    ///
    /// # 默认值
    /// - 5000 ms
    async fn get_retry_delay(&self) -> RepositoryResult<Duration>;

    /// 重试间隔增长策略
    ///
    /// # 默认值
    /// - FIXED
    async fn get_retry_backoff(&self) -> RepositoryResult<RetryBackoff>;

    /// 单次尝试超时（秒存储）
    ///
    /// # 默认值
    /// - 300 s
    async fn get_attempt_timeout(&self) -> RepositoryResult<Duration>;

    // ===== 节流与并行 =====

    async fn get_pacing_delay(&self) -> RepositoryResult<Duration>;

    async fn get_parallel_processing(&self) -> RepositoryResult<bool>;

    async fn get_max_parallel_batches(&self) -> RepositoryResult<usize>;

    // ===== 上传限制 =====

    async fn get_max_file_size_mb(&self) -> RepositoryResult<u64>;

    /// 允许的扩展名（逗号分隔存储）
    async fn get_allowed_extensions(&self) -> RepositoryResult<Vec<String>>;

    /// 单行/单分组数量上限
    ///
    /// # 默认值
    /// - 100000
    async fn get_max_quantity(&self) -> RepositoryResult<u32>;

    async fn get_error_display_limit(&self) -> RepositoryResult<usize>;

    /// 汇总为 ImportSettings
    async fn load_import_settings(&self) -> RepositoryResult<ImportSettings> {
        let defaults = ImportSettings::default();
        Ok(ImportSettings {
            batch_size: self.get_batch_size().await?,
            max_batch_size: self.get_max_batch_size().await?,
            max_retries: self.get_max_retries().await?,
            retry_delay: self.get_retry_delay().await?,
            retry_backoff: self.get_retry_backoff().await?,
            attempt_timeout: self.get_attempt_timeout().await?,
            pacing_delay: self.get_pacing_delay().await?,
            parallel_processing: self.get_parallel_processing().await?,
            max_parallel_batches: self.get_max_parallel_batches().await?,
            max_file_size_mb: self.get_max_file_size_mb().await?,
            allowed_extensions: self.get_allowed_extensions().await?,
            max_quantity: self.get_max_quantity().await?,
            error_display_limit: self.get_error_display_limit().await?,
            created_by: defaults.created_by,
        })
    }
}
