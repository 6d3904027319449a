// ==========================================
// 仓储导入对账系统 - 实体解析器
// ==========================================
// 职责: 业务键 → ID 批量解析，缺失键幂等创建
// 约束:
// - 每个类别一次 IN 查询，不做逐行查询
// - 创建后必须重新解析再使用
// - 唯一约束冲突视为"已存在"，重新解析（有限轮次）
// - 消费时缺少映射属于内部一致性错误，不重试、不跳过
// ==========================================

use crate::domain::{EntityCategory, EntityKeySet, ResolvedEntitySet};
use crate::engine::error::{BatchError, BatchResultOf};
use crate::repository::StoreTransaction;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 唯一约束冲突后的最大重试轮次
const MAX_CREATE_ROUNDS: usize = 3;

pub struct EntityResolver {
    created_by: String,
}

impl EntityResolver {
    pub fn new(created_by: impl Into<String>) -> Self {
        Self {
            created_by: created_by.into(),
        }
    }

    /// 批量解析（不创建）
    ///
    /// # 返回
    /// - 仅包含已存在的键；缺失键不出现在结果中
    pub fn resolve(
        &self,
        tx: &mut dyn StoreTransaction,
        keys: &EntityKeySet,
        cancel: &CancellationToken,
    ) -> BatchResultOf<ResolvedEntitySet> {
        let mut resolved = ResolvedEntitySet::default();
        for category in keys.categories() {
            if cancel.is_cancelled() {
                return Err(BatchError::Cancelled);
            }
            let found = tx.lookup_keys(category, &keys.keys(category))?;
            resolved.extend(category, found);
        }
        Ok(resolved)
    }

    /// 创建 already_resolved 中缺失的键
    ///
    /// # 返回
    /// - Ok(usize): 本次实际创建的数量
    pub fn create_missing(
        &self,
        tx: &mut dyn StoreTransaction,
        keys: &EntityKeySet,
        already_resolved: &ResolvedEntitySet,
        cancel: &CancellationToken,
    ) -> BatchResultOf<usize> {
        let mut created = 0;
        for category in keys.categories() {
            if cancel.is_cancelled() {
                return Err(BatchError::Cancelled);
            }
            let missing: Vec<String> = keys
                .keys(category)
                .into_iter()
                .filter(|k| !already_resolved.contains(category, k))
                .collect();
            if missing.is_empty() {
                continue;
            }
            created += self.create_category(tx, category, missing)?;
        }
        Ok(created)
    }

    fn create_category(
        &self,
        tx: &mut dyn StoreTransaction,
        category: EntityCategory,
        mut pending: Vec<String>,
    ) -> BatchResultOf<usize> {
        let mut created = 0;

        for round in 1..=MAX_CREATE_ROUNDS {
            if pending.is_empty() {
                break;
            }
            match tx.insert_keys(category, &pending, &self.created_by) {
                Ok(n) => {
                    debug!(category = %category, created = n, "新建业务键");
                    created += n;
                    pending.clear();
                }
                Err(e) if e.is_unique_violation() => {
                    // 其他批次已创建同一键：剔除已存在的键后重试
                    let existing = tx.lookup_keys(category, &pending)?;
                    warn!(
                        category = %category,
                        round,
                        existing = existing.len(),
                        "创建业务键遇到唯一约束冲突，按已存在处理"
                    );
                    pending.retain(|k| !existing.contains_key(k));
                }
                Err(e) => return Err(BatchError::Persistence(e)),
            }
        }

        if !pending.is_empty() {
            return Err(BatchError::Resolution {
                category,
                message: format!(
                    "{} 轮后仍有 {} 个业务键无法创建: {}",
                    MAX_CREATE_ROUNDS,
                    pending.len(),
                    pending.join(", ")
                ),
            });
        }
        Ok(created)
    }

    /// 解析 → 创建缺失 → 重新解析
    ///
    /// # 返回
    /// - (完整的已解析实体集, 新建数量)
    /// - Err(Resolution): 重新解析后仍有键缺失
    pub fn resolve_or_create(
        &self,
        tx: &mut dyn StoreTransaction,
        keys: &EntityKeySet,
        cancel: &CancellationToken,
    ) -> BatchResultOf<(ResolvedEntitySet, usize)> {
        let first = self.resolve(tx, keys, cancel)?;
        let created = self.create_missing(tx, keys, &first, cancel)?;

        let resolved = if created > 0 || !is_complete(keys, &first) {
            self.resolve(tx, keys, cancel)?
        } else {
            first
        };

        for category in keys.categories() {
            let missing: Vec<String> = keys
                .keys(category)
                .into_iter()
                .filter(|k| !resolved.contains(category, k))
                .collect();
            if !missing.is_empty() {
                return Err(BatchError::Resolution {
                    category,
                    message: format!("创建后仍未解析到: {}", missing.join(", ")),
                });
            }
        }

        Ok((resolved, created))
    }
}

fn is_complete(keys: &EntityKeySet, resolved: &ResolvedEntitySet) -> bool {
    keys.categories()
        .all(|c| keys.keys(c).iter().all(|k| resolved.contains(c, k)))
}

/// 消费已解析 ID；缺失即内部一致性错误
pub fn require_id(
    resolved: &ResolvedEntitySet,
    category: EntityCategory,
    key: &str,
) -> BatchResultOf<i64> {
    resolved
        .get(category, key)
        .ok_or_else(|| BatchError::MissingMapping {
            category,
            key: key.to_string(),
        })
}

/// 可选引用：空键返回 None，非空键必须已解析
pub fn optional_id(
    resolved: &ResolvedEntitySet,
    category: EntityCategory,
    key: Option<&str>,
) -> BatchResultOf<Option<i64>> {
    match key.filter(|k| !k.is_empty()) {
        Some(k) => require_id(resolved, category, k).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{configure_sqlite_connection, init_schema};
    use crate::domain::{GroupKey, InventoryFields, InventoryRecord};
    use crate::repository::{
        InventoryStore, RepositoryError, RepositoryResult, SqliteInventoryStore,
    };
    use rusqlite::Connection;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    fn memory_store() -> SqliteInventoryStore {
        let conn = Connection::open_in_memory().unwrap();
        configure_sqlite_connection(&conn).unwrap();
        init_schema(&conn).unwrap();
        SqliteInventoryStore::from_connection(Arc::new(Mutex::new(conn)))
    }

    fn key_set(entries: &[(EntityCategory, &str)]) -> EntityKeySet {
        let mut set = EntityKeySet::default();
        for (c, k) in entries {
            set.insert(*c, k);
        }
        set
    }

    #[test]
    fn test_resolve_or_create_is_idempotent() {
        let store = memory_store();
        let resolver = EntityResolver::new("tester");
        let cancel = CancellationToken::new();
        let keys = key_set(&[
            (EntityCategory::Order, "PO1"),
            (EntityCategory::Order, "PO2"),
            (EntityCategory::Producer, "Acme"),
        ]);

        let mut tx = store.begin().unwrap();
        let (first, created) = resolver.resolve_or_create(tx.as_mut(), &keys, &cancel).unwrap();
        assert_eq!(created, 3);
        assert_eq!(first.total(), 3);
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        let (second, created) = resolver.resolve_or_create(tx.as_mut(), &keys, &cancel).unwrap();
        assert_eq!(created, 0);
        assert_eq!(first, second);
        tx.commit().unwrap();
    }

    #[test]
    fn test_resolve_observes_cancellation() {
        let store = memory_store();
        let resolver = EntityResolver::new("tester");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut tx = store.begin().unwrap();
        let keys = key_set(&[(EntityCategory::Project, "PRJ")]);
        let err = resolver.resolve(tx.as_mut(), &keys, &cancel).unwrap_err();
        assert!(matches!(err, BatchError::Cancelled));
    }

    // 模拟并发创建：首次插入时键已被别人写入，返回唯一约束冲突
    #[derive(Default)]
    struct RacingTx {
        rows: HashMap<String, i64>,
        raced: bool,
    }

    impl StoreTransaction for RacingTx {
        fn lookup_keys(
            &mut self,
            _category: EntityCategory,
            keys: &[String],
        ) -> RepositoryResult<HashMap<String, i64>> {
            Ok(keys
                .iter()
                .filter_map(|k| self.rows.get(k).map(|id| (k.clone(), *id)))
                .collect())
        }

        fn insert_keys(
            &mut self,
            _category: EntityCategory,
            keys: &[String],
            _created_by: &str,
        ) -> RepositoryResult<usize> {
            if !self.raced {
                self.raced = true;
                let next = self.rows.len() as i64 + 1;
                self.rows.insert(keys[0].clone(), next);
                return Err(RepositoryError::UniqueConstraintViolation("UNIQUE".into()));
            }
            for k in keys {
                let next = self.rows.len() as i64 + 1;
                self.rows.insert(k.clone(), next);
            }
            Ok(keys.len())
        }

        fn find_group(&mut self, _: i64, _: &GroupKey) -> RepositoryResult<Vec<InventoryRecord>> {
            Ok(Vec::new())
        }
        fn insert_inventory(&mut self, r: &[InventoryFields]) -> RepositoryResult<usize> {
            Ok(r.len())
        }
        fn update_inventory(&mut self, r: &[InventoryRecord]) -> RepositoryResult<usize> {
            Ok(r.len())
        }
        fn delete_inventory(&mut self, ids: &[i64]) -> RepositoryResult<usize> {
            Ok(ids.len())
        }
        fn commit(self: Box<Self>) -> RepositoryResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_unique_violation_is_treated_as_existing() {
        let resolver = EntityResolver::new("tester");
        let cancel = CancellationToken::new();
        let keys = key_set(&[
            (EntityCategory::Contract, "C-1"),
            (EntityCategory::Contract, "C-2"),
        ]);

        let mut tx = RacingTx::default();
        let (resolved, created) = resolver.resolve_or_create(&mut tx, &keys, &cancel).unwrap();
        assert_eq!(resolved.len(EntityCategory::Contract), 2);
        assert_eq!(created, 1);
    }

    #[test]
    fn test_require_id_reports_missing_mapping() {
        let resolved = ResolvedEntitySet::default();
        let err = require_id(&resolved, EntityCategory::BillReference, "B1").unwrap_err();
        assert!(matches!(err, BatchError::MissingMapping { .. }));
        assert!(!err.is_retryable());
        assert_eq!(optional_id(&resolved, EntityCategory::Project, Some("")).unwrap(), None);
    }
}
