// ==========================================
// 仓储导入对账系统 - 库存存储 Trait
// ==========================================
// 职责: 定义实体解析与库存对账所需的数据访问接口
// 红线: Repository 不含业务规则，只做数据 CRUD
// 约束: 每批次一个事务（全有或全无），事务未提交即回滚
// ==========================================

use crate::domain::{EntityCategory, GroupKey, InventoryFields, InventoryRecord};
use crate::repository::error::RepositoryResult;
use std::collections::HashMap;

// ==========================================
// InventoryStore Trait
// ==========================================
// 用途: 开启批次事务
// 实现者: SqliteInventoryStore
pub trait InventoryStore: Send + Sync {
    /// 开启一个批次事务
    ///
    /// # 说明
    /// - 返回的事务在 drop 时若未提交则回滚
    /// - 同一时刻只允许一个事务（串行写入）
    fn begin(&self) -> RepositoryResult<Box<dyn StoreTransaction + '_>>;
}

// ==========================================
// StoreTransaction Trait
// ==========================================
// 用途: 批次事务内的批量读写
pub trait StoreTransaction {
    /// 批量查询业务键（key IN set）
    ///
    /// # 返回
    /// - 已存在的 业务键 → ID（不存在的键不出现在结果中）
    fn lookup_keys(
        &mut self,
        category: EntityCategory,
        keys: &[String],
    ) -> RepositoryResult<HashMap<String, i64>>;

    /// 批量创建业务键
    ///
    /// # 返回
    /// - Ok(usize): 创建数量
    /// - Err(UniqueConstraintViolation): 并发批次已创建同一键
    fn insert_keys(
        &mut self,
        category: EntityCategory,
        keys: &[String],
        created_by: &str,
    ) -> RepositoryResult<usize>;

    /// 查询一个分组的现有库存记录（按 ID 升序）
    fn find_group(&mut self, order_id: i64, group: &GroupKey)
        -> RepositoryResult<Vec<InventoryRecord>>;

    /// 批量新增库存记录
    fn insert_inventory(&mut self, records: &[InventoryFields]) -> RepositoryResult<usize>;

    /// 批量更新库存记录（按 ID）
    fn update_inventory(&mut self, records: &[InventoryRecord]) -> RepositoryResult<usize>;

    /// 批量删除库存记录（按 ID）
    fn delete_inventory(&mut self, ids: &[i64]) -> RepositoryResult<usize>;

    /// 提交事务
    fn commit(self: Box<Self>) -> RepositoryResult<()>;
}
