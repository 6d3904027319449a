// ==========================================
// 仓储导入对账系统 - 引擎层
// ==========================================
// 职责: 实体解析、数量对账、批次编排、结果汇总、外部加载
// 红线: Engine 不拼 SQL，存储访问只经 StoreTransaction
// ==========================================

pub mod batch_orchestrator;
pub mod entity_resolver;
pub mod error;
pub mod import_service;
pub mod loader;
pub mod quantity_reconciler;
pub mod reconcile_processor;
pub mod result_aggregator;

// 重导出核心引擎
pub use batch_orchestrator::{
    partition, Batch, BatchItem, BatchOrchestrator, BatchOutcome, BatchProcessor,
    OrchestratorSettings,
};
pub use entity_resolver::EntityResolver;
pub use error::{BatchError, BatchResultOf};
pub use import_service::ImportService;
pub use loader::{
    archive_stale_error_file, parse_error_document, CommandLoader, ExternalLoader,
    LoaderBatchProcessor, LoaderCredentials, LoaderRejection,
};
pub use quantity_reconciler::{reconcile, ReconcilePlan};
pub use reconcile_processor::{apply_batch, ReconcileProcessor};
pub use result_aggregator::ResultAggregator;
