// ==========================================
// 仓储导入对账系统 - 对账批次处理步骤
// ==========================================
// 职责: 在一个事务内完成 实体解析 → 分组对账 → 写入
// 约束:
// - 全有或全无：任何失败（含取消）都回滚，不留实体或库存残留
// - 存储操作在 blocking 线程池执行，保证单次超时可被观察
// ==========================================

use crate::domain::{DeltaStats, EntityCategory, EntityKeySet, RecordGroup};
use crate::engine::batch_orchestrator::{Batch, BatchOutcome, BatchProcessor};
use crate::engine::entity_resolver::{require_id, EntityResolver};
use crate::engine::error::{BatchError, BatchResultOf};
use crate::engine::quantity_reconciler::reconcile;
use crate::repository::InventoryStore;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct ReconcileProcessor {
    store: Arc<dyn InventoryStore>,
    resolver: Arc<EntityResolver>,
}

impl ReconcileProcessor {
    pub fn new(store: Arc<dyn InventoryStore>, created_by: impl Into<String>) -> Self {
        Self {
            store,
            resolver: Arc::new(EntityResolver::new(created_by)),
        }
    }
}

#[async_trait]
impl BatchProcessor<RecordGroup> for ReconcileProcessor {
    async fn process(
        &self,
        batch: &Batch<RecordGroup>,
        attempt: u32,
        cancel: CancellationToken,
    ) -> BatchResultOf<BatchOutcome> {
        let store = Arc::clone(&self.store);
        let resolver = Arc::clone(&self.resolver);
        let groups = Arc::clone(&batch.items);
        let index = batch.index;

        debug!(batch = index, attempt, groups = groups.len(), "提交对账任务到 blocking 线程池");

        tokio::task::spawn_blocking(move || {
            apply_batch(store.as_ref(), &resolver, &groups, &cancel)
        })
        .await
        .map_err(|e| BatchError::Internal(format!("批次 {} 任务异常: {}", index, e)))?
    }
}

/// 单事务应用一个批次的全部分组
pub fn apply_batch(
    store: &dyn InventoryStore,
    resolver: &EntityResolver,
    groups: &[RecordGroup],
    cancel: &CancellationToken,
) -> BatchResultOf<BatchOutcome> {
    let mut tx = store.begin()?;

    let keys = EntityKeySet::from_records(groups.iter().flat_map(|g| g.records.iter()));
    let (resolved, created) = resolver.resolve_or_create(tx.as_mut(), &keys, cancel)?;

    let mut delta = DeltaStats {
        entities_created: created,
        ..Default::default()
    };
    let mut rows = 0;

    for group in groups {
        if cancel.is_cancelled() {
            return Err(BatchError::Cancelled);
        }
        let Some(template) = group.template() else {
            continue;
        };

        let order_id = require_id(&resolved, EntityCategory::Order, &template.order_code)?;
        let existing = tx.find_group(order_id, &group.key)?;
        let plan = reconcile(group, &resolved, &existing)?;

        if !plan.to_remove.is_empty() {
            tx.delete_inventory(&plan.to_remove)?;
        }
        if !plan.to_update.is_empty() {
            tx.update_inventory(&plan.to_update)?;
        }
        if !plan.to_add.is_empty() {
            tx.insert_inventory(&plan.to_add)?;
        }

        if plan.over_provisioned > 0 {
            warn!(
                group = %group.key,
                desired = group.desired_quantity(),
                existing = existing.len(),
                over_provisioned = plan.over_provisioned,
                "带序列号的记录无法删除，分组超量"
            );
        }

        delta.added += plan.to_add.len();
        delta.updated += plan.to_update.len();
        delta.removed += plan.to_remove.len();
        delta.over_provisioned += plan.over_provisioned;
        rows += group.records.len();
    }

    // 超时或取消后不再提交
    if cancel.is_cancelled() {
        return Err(BatchError::Cancelled);
    }
    tx.commit()?;

    Ok(BatchOutcome {
        succeeded_rows: rows,
        errors: Vec::new(),
        delta,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{configure_sqlite_connection, init_schema};
    use crate::domain::{GroupKey, InputRecord, InventoryFields, InventoryRecord};
    use crate::repository::{
        RepositoryError, RepositoryResult, SqliteInventoryStore, StoreTransaction,
    };
    use rusqlite::Connection;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn memory_store() -> SqliteInventoryStore {
        let conn = Connection::open_in_memory().unwrap();
        configure_sqlite_connection(&conn).unwrap();
        init_schema(&conn).unwrap();
        SqliteInventoryStore::from_connection(Arc::new(Mutex::new(conn)))
    }

    fn record(row: usize, line: &str, qty: u32) -> InputRecord {
        InputRecord {
            row_number: row,
            order_code: "PO1".to_string(),
            bill_code: "B1".to_string(),
            line_item_id: line.to_string(),
            contract_code: None,
            project_code: Some("PRJ".to_string()),
            producer_name: Some("Acme".to_string()),
            sub_department_name: None,
            item_name: "Server".to_string(),
            part_number: None,
            quantity: qty,
            warranty_term: None,
            account_manager: Some("am01".to_string()),
            buyer_account: None,
        }
    }

    fn count(store: &SqliteInventoryStore, table: &str) -> i64 {
        let conn = store.connection();
        let conn = conn.lock().unwrap();
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_apply_batch_twice_is_stable() {
        let store = memory_store();
        let resolver = EntityResolver::new("tester");
        let cancel = CancellationToken::new();
        let groups = RecordGroup::group_records(vec![
            record(2, "10", 2),
            record(3, "10", 1),
            record(4, "20", 2),
        ]);

        let first = apply_batch(&store, &resolver, &groups, &cancel).unwrap();
        assert_eq!(first.succeeded_rows, 3);
        assert_eq!(first.delta.added, 5);
        assert_eq!(first.delta.entities_created, 4);
        assert_eq!(count(&store, "warehouse_import"), 5);

        let second = apply_batch(&store, &resolver, &groups, &cancel).unwrap();
        assert_eq!(second.delta.added, 0);
        assert_eq!(second.delta.removed, 0);
        assert_eq!(second.delta.updated, 5);
        assert_eq!(second.delta.entities_created, 0);
        assert_eq!(count(&store, "warehouse_import"), 5);
    }

    #[test]
    fn test_cancelled_batch_leaves_no_artifacts() {
        let store = memory_store();
        let resolver = EntityResolver::new("tester");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let groups = RecordGroup::group_records(vec![record(2, "10", 1)]);
        let err = apply_batch(&store, &resolver, &groups, &cancel).unwrap_err();
        assert!(matches!(err, BatchError::Cancelled));
        assert_eq!(count(&store, "purchase_order"), 0);
    }

    // 插入库存时失败的存储，用于验证回滚
    struct FailingStore {
        inner: SqliteInventoryStore,
    }

    struct FailingTx<'a> {
        inner: Box<dyn StoreTransaction + 'a>,
    }

    impl InventoryStore for FailingStore {
        fn begin(&self) -> RepositoryResult<Box<dyn StoreTransaction + '_>> {
            Ok(Box::new(FailingTx {
                inner: self.inner.begin()?,
            }))
        }
    }

    impl StoreTransaction for FailingTx<'_> {
        fn lookup_keys(
            &mut self,
            c: EntityCategory,
            k: &[String],
        ) -> RepositoryResult<HashMap<String, i64>> {
            self.inner.lookup_keys(c, k)
        }
        fn insert_keys(&mut self, c: EntityCategory, k: &[String], by: &str) -> RepositoryResult<usize> {
            self.inner.insert_keys(c, k, by)
        }
        fn find_group(&mut self, o: i64, g: &GroupKey) -> RepositoryResult<Vec<InventoryRecord>> {
            self.inner.find_group(o, g)
        }
        fn insert_inventory(&mut self, _r: &[InventoryFields]) -> RepositoryResult<usize> {
            Err(RepositoryError::DatabaseQueryError("disk I/O error".into()))
        }
        fn update_inventory(&mut self, r: &[InventoryRecord]) -> RepositoryResult<usize> {
            self.inner.update_inventory(r)
        }
        fn delete_inventory(&mut self, ids: &[i64]) -> RepositoryResult<usize> {
            self.inner.delete_inventory(ids)
        }
        fn commit(self: Box<Self>) -> RepositoryResult<()> {
            self.inner.commit()
        }
    }

    #[test]
    fn test_failed_batch_rolls_back_created_entities() {
        let store = FailingStore {
            inner: memory_store(),
        };
        let resolver = EntityResolver::new("tester");
        let groups = RecordGroup::group_records(vec![record(2, "10", 1)]);

        let err = apply_batch(&store, &resolver, &groups, &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, BatchError::Persistence(_)));
        assert!(err.is_retryable());
        assert_eq!(count(&store.inner, "purchase_order"), 0);
        assert_eq!(count(&store.inner, "manufacturer"), 0);
    }

    // 在指定步骤上阻塞的存储，用于验证超时与提交的竞争
    struct SlowStore {
        inner: SqliteInventoryStore,
        find_delay: std::time::Duration,
        commit_delay: std::time::Duration,
    }

    struct SlowTx<'a> {
        inner: Box<dyn StoreTransaction + 'a>,
        find_delay: std::time::Duration,
        commit_delay: std::time::Duration,
    }

    impl InventoryStore for SlowStore {
        fn begin(&self) -> RepositoryResult<Box<dyn StoreTransaction + '_>> {
            Ok(Box::new(SlowTx {
                inner: self.inner.begin()?,
                find_delay: self.find_delay,
                commit_delay: self.commit_delay,
            }))
        }
    }

    impl StoreTransaction for SlowTx<'_> {
        fn lookup_keys(
            &mut self,
            c: EntityCategory,
            k: &[String],
        ) -> RepositoryResult<HashMap<String, i64>> {
            self.inner.lookup_keys(c, k)
        }
        fn insert_keys(&mut self, c: EntityCategory, k: &[String], by: &str) -> RepositoryResult<usize> {
            self.inner.insert_keys(c, k, by)
        }
        fn find_group(&mut self, o: i64, g: &GroupKey) -> RepositoryResult<Vec<InventoryRecord>> {
            std::thread::sleep(self.find_delay);
            self.inner.find_group(o, g)
        }
        fn insert_inventory(&mut self, r: &[InventoryFields]) -> RepositoryResult<usize> {
            self.inner.insert_inventory(r)
        }
        fn update_inventory(&mut self, r: &[InventoryRecord]) -> RepositoryResult<usize> {
            self.inner.update_inventory(r)
        }
        fn delete_inventory(&mut self, ids: &[i64]) -> RepositoryResult<usize> {
            self.inner.delete_inventory(ids)
        }
        fn commit(self: Box<Self>) -> RepositoryResult<()> {
            std::thread::sleep(self.commit_delay);
            self.inner.commit()
        }
    }

    async fn run_with_timeout(store: Arc<SlowStore>) -> crate::domain::BatchResult {
        use crate::config::RetryBackoff;
        use crate::engine::batch_orchestrator::{partition, BatchOrchestrator, OrchestratorSettings};
        use std::time::Duration;

        let settings = OrchestratorSettings {
            max_attempts: 1,
            attempt_timeout: Duration::from_millis(50),
            retry_delay: Duration::from_millis(1),
            retry_backoff: RetryBackoff::Fixed,
            pacing_delay: Duration::ZERO,
            parallel: false,
            max_parallel: 1,
        };
        let processor = ReconcileProcessor::new(store, "tester");
        let groups = RecordGroup::group_records(vec![record(2, "10", 2), record(3, "20", 1)]);
        let mut results = BatchOrchestrator::new(settings)
            .run(partition(groups, 10), &processor, &CancellationToken::new())
            .await;
        results.remove(0)
    }

    #[tokio::test]
    async fn test_commit_after_timeout_is_reported_as_persisted() {
        let store = Arc::new(SlowStore {
            inner: memory_store(),
            find_delay: std::time::Duration::ZERO,
            commit_delay: std::time::Duration::from_millis(300),
        });

        let result = run_with_timeout(Arc::clone(&store)).await;

        // 超时发生在最后检查点之后: 提交生效，报告必须与数据库一致
        assert_eq!(result.status, crate::domain::BatchStatus::Succeeded);
        assert_eq!(result.succeeded_rows, 2);
        assert!(result.errors.is_empty());
        assert_eq!(count(&store.inner, "warehouse_import"), 3);
    }

    #[tokio::test]
    async fn test_timeout_before_commit_rolls_back() {
        let store = Arc::new(SlowStore {
            inner: memory_store(),
            find_delay: std::time::Duration::from_millis(300),
            commit_delay: std::time::Duration::ZERO,
        });

        let result = run_with_timeout(Arc::clone(&store)).await;

        assert_eq!(result.status, crate::domain::BatchStatus::Failed);
        assert_eq!(result.errors.len(), 2);
        assert!(result.errors[0].message.contains("超时"));
        assert_eq!(count(&store.inner, "warehouse_import"), 0);
        assert_eq!(count(&store.inner, "purchase_order"), 0);
    }
}
