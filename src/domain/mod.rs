// ==========================================
// 仓储导入对账系统 - 领域模型层
// ==========================================
// 职责: 定义领域实体、类型、结果模型
// 红线: 不含数据访问逻辑,不含引擎逻辑
// ==========================================

pub mod inventory;
pub mod report;
pub mod types;

// 重导出核心类型
pub use inventory::{
    EntityKeySet, GroupKey, InputRecord, InventoryFields, InventoryRecord, RecordGroup,
    ResolvedEntitySet, SourceRow,
};
pub use report::{
    BatchResult, BatchSummary, DeltaStats, ErrorEntry, ImportReport, ImportRun,
};
pub use types::{BatchStatus, EntityCategory, ErrorKind, ImportOutcome};
