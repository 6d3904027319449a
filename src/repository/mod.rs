// ==========================================
// 仓储导入对账系统 - 数据仓储层
// ==========================================
// 红线: Repository 不含业务逻辑
// 职责: 提供数据访问接口,屏蔽数据库细节
// 约束: 所有值使用参数化绑定；表名只来自固定常量
// ==========================================

pub mod error;
pub mod import_run_repo;
pub mod inventory_store;
pub mod inventory_store_impl;

// 重导出核心仓储
pub use error::{RepositoryError, RepositoryResult};
pub use import_run_repo::ImportRunRepository;
pub use inventory_store::{InventoryStore, StoreTransaction};
pub use inventory_store_impl::SqliteInventoryStore;
