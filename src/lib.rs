// ==========================================
// 仓储导入对账系统 - 核心库
// ==========================================
// 技术栈: Rust + Tokio + SQLite
// 系统定位: 批量导入 + 实体解析 + 库存数量对账
// ==========================================

// ==========================================
// 模块声明
// ==========================================

// 领域层 - 实体与结果模型
pub mod domain;

// 数据仓储层 - 数据访问
pub mod repository;

// 引擎层 - 解析/对账/编排/汇总
pub mod engine;

// 导入层 - 外部数据
pub mod importer;

// 配置层 - 系统配置
pub mod config;

// 数据库基础设施（连接初始化/PRAGMA 统一）
pub mod db;

// 日志系统
pub mod logging;

// API 层 - 业务接口
pub mod api;

// ==========================================
// 重导出核心类型
// ==========================================

// 领域类型
pub use domain::{
    BatchResult, BatchStatus, DeltaStats, EntityCategory, ErrorEntry, ErrorKind, ImportOutcome,
    ImportReport, ImportRun, InputRecord, RecordGroup, SourceRow,
};

// 引擎
pub use engine::{
    BatchOrchestrator, CommandLoader, EntityResolver, ExternalLoader, ImportService,
    LoaderCredentials, ResultAggregator,
};

// 配置
pub use config::{ConfigManager, ImportSettings, RetryBackoff};

// API
pub use api::{ApiError, ImportApi};

// ==========================================
// 常量定义
// ==========================================

// 系统版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// 系统名称
pub const APP_NAME: &str = "仓储导入对账系统";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
