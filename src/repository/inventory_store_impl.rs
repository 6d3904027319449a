// ==========================================
// 仓储导入对账系统 - 库存存储 SQLite 实现
// ==========================================
// 职责: 实现 InventoryStore / StoreTransaction
// 约束: 事务持有连接锁，BEGIN IMMEDIATE 开启，drop 未提交即 ROLLBACK
// ==========================================

use crate::db::open_and_init;
use crate::domain::{EntityCategory, GroupKey, InventoryFields, InventoryRecord};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::inventory_store::{InventoryStore, StoreTransaction};
use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// IN 查询单次绑定的键数量上限
const LOOKUP_CHUNK_SIZE: usize = 500;

const INVENTORY_COLUMNS: &str = "id, order_id, bill_code, line_item_id, bill_id, \
     contract_id, project_id, producer_id, sub_department_id, \
     item_name, part_number, warranty_term, account_manager, buyer_account, \
     serial_number, synced";

// ==========================================
// SqliteInventoryStore
// ==========================================
pub struct SqliteInventoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteInventoryStore {
    /// 打开数据库并确保 schema 存在
    pub fn new(db_path: &str) -> RepositoryResult<Self> {
        let conn = open_and_init(db_path)
            .map_err(|e| RepositoryError::DatabaseConnectionError(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 复用共享连接（调用方负责 schema 初始化）
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }
}

impl InventoryStore for SqliteInventoryStore {
    fn begin(&self) -> RepositoryResult<Box<dyn StoreTransaction + '_>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))?;

        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;

        Ok(Box::new(SqliteTransaction {
            conn,
            finished: false,
        }))
    }
}

// ==========================================
// SqliteTransaction
// ==========================================
struct SqliteTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "事务回滚失败");
            } else {
                debug!("批次事务已回滚");
            }
        }
    }
}

fn map_inventory_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InventoryRecord> {
    Ok(InventoryRecord {
        id: row.get(0)?,
        fields: InventoryFields {
            order_id: row.get(1)?,
            bill_code: row.get(2)?,
            line_item_id: row.get(3)?,
            bill_id: row.get(4)?,
            contract_id: row.get(5)?,
            project_id: row.get(6)?,
            producer_id: row.get(7)?,
            sub_department_id: row.get(8)?,
            item_name: row.get(9)?,
            part_number: row.get(10)?,
            warranty_term: row.get(11)?,
            account_manager: row.get(12)?,
            buyer_account: row.get(13)?,
        },
        serial_number: row.get(14)?,
        synced: row.get::<_, i64>(15)? != 0,
    })
}

impl StoreTransaction for SqliteTransaction<'_> {
    fn lookup_keys(
        &mut self,
        category: EntityCategory,
        keys: &[String],
    ) -> RepositoryResult<HashMap<String, i64>> {
        let mut found = HashMap::with_capacity(keys.len());

        for chunk in keys.chunks(LOOKUP_CHUNK_SIZE) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT name, id FROM {} WHERE name IN ({})",
                category.table_name(),
                placeholders
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (name, id) = row?;
                found.insert(name, id);
            }
        }

        Ok(found)
    }

    fn insert_keys(
        &mut self,
        category: EntityCategory,
        keys: &[String],
        created_by: &str,
    ) -> RepositoryResult<usize> {
        let now = Utc::now().to_rfc3339();
        let sql = format!(
            "INSERT INTO {} (name, created_by, created_at) VALUES (?1, ?2, ?3)",
            category.table_name()
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;

        let mut count = 0;
        for key in keys {
            stmt.execute(params![key, created_by, now])?;
            count += 1;
        }
        Ok(count)
    }

    fn find_group(
        &mut self,
        order_id: i64,
        group: &GroupKey,
    ) -> RepositoryResult<Vec<InventoryRecord>> {
        let sql = format!(
            "SELECT {} FROM warehouse_import \
             WHERE order_id = ?1 AND bill_code = ?2 AND line_item_id = ?3 \
             ORDER BY id ASC",
            INVENTORY_COLUMNS
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let records = stmt
            .query_map(
                params![order_id, group.bill_code, group.line_item_id],
                map_inventory_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn insert_inventory(&mut self, records: &[InventoryFields]) -> RepositoryResult<usize> {
        let now = Utc::now().to_rfc3339();
        let mut stmt = self.conn.prepare_cached(
            r#"
            INSERT INTO warehouse_import (
                order_id, bill_code, line_item_id, bill_id,
                contract_id, project_id, producer_id, sub_department_id,
                item_name, part_number, warranty_term, account_manager, buyer_account,
                serial_number, synced, exported, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, NULL, 1, 0, ?14, ?14)
            "#,
        )?;

        let mut count = 0;
        for f in records {
            stmt.execute(params![
                f.order_id,
                f.bill_code,
                f.line_item_id,
                f.bill_id,
                f.contract_id,
                f.project_id,
                f.producer_id,
                f.sub_department_id,
                f.item_name,
                f.part_number,
                f.warranty_term,
                f.account_manager,
                f.buyer_account,
                now,
            ])?;
            count += 1;
        }
        Ok(count)
    }

    fn update_inventory(&mut self, records: &[InventoryRecord]) -> RepositoryResult<usize> {
        let now = Utc::now().to_rfc3339();
        let mut stmt = self.conn.prepare_cached(
            r#"
            UPDATE warehouse_import SET
                order_id = ?2, bill_code = ?3, line_item_id = ?4, bill_id = ?5,
                contract_id = ?6, project_id = ?7, producer_id = ?8, sub_department_id = ?9,
                item_name = ?10, part_number = ?11, warranty_term = ?12,
                account_manager = ?13, buyer_account = ?14,
                synced = ?15, updated_at = ?16
            WHERE id = ?1
            "#,
        )?;

        let mut count = 0;
        for r in records {
            let f = &r.fields;
            count += stmt.execute(params![
                r.id,
                f.order_id,
                f.bill_code,
                f.line_item_id,
                f.bill_id,
                f.contract_id,
                f.project_id,
                f.producer_id,
                f.sub_department_id,
                f.item_name,
                f.part_number,
                f.warranty_term,
                f.account_manager,
                f.buyer_account,
                r.synced as i64,
                now,
            ])?;
        }
        Ok(count)
    }

    fn delete_inventory(&mut self, ids: &[i64]) -> RepositoryResult<usize> {
        let mut stmt = self
            .conn
            .prepare_cached("DELETE FROM warehouse_import WHERE id = ?1")?;

        let mut count = 0;
        for id in ids {
            count += stmt.execute(params![id])?;
        }
        Ok(count)
    }

    fn commit(mut self: Box<Self>) -> RepositoryResult<()> {
        self.conn
            .execute_batch("COMMIT")
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;
        self.finished = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{configure_sqlite_connection, init_schema};

    fn memory_store() -> SqliteInventoryStore {
        let conn = Connection::open_in_memory().unwrap();
        configure_sqlite_connection(&conn).unwrap();
        init_schema(&conn).unwrap();
        SqliteInventoryStore::from_connection(Arc::new(Mutex::new(conn)))
    }

    fn fields(order_id: i64, bill_id: i64) -> InventoryFields {
        InventoryFields {
            order_id,
            bill_code: "B1".to_string(),
            line_item_id: "10".to_string(),
            bill_id,
            contract_id: None,
            project_id: None,
            producer_id: None,
            sub_department_id: None,
            item_name: "Switch".to_string(),
            part_number: Some("PN-1".to_string()),
            warranty_term: None,
            account_manager: None,
            buyer_account: None,
        }
    }

    fn count_rows(store: &SqliteInventoryStore, sql: &str) -> i64 {
        let conn = store.connection();
        let conn = conn.lock().unwrap();
        conn.query_row(sql, [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn test_keys_round_trip_within_transaction() {
        let store = memory_store();
        let mut tx = store.begin().unwrap();

        let keys = vec!["PO-1".to_string(), "PO-2".to_string()];
        assert_eq!(tx.insert_keys(EntityCategory::Order, &keys, "tester").unwrap(), 2);

        let found = tx
            .lookup_keys(EntityCategory::Order, &["PO-2".to_string(), "PO-9".to_string()])
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains_key("PO-2"));

        let err = tx
            .insert_keys(EntityCategory::Order, &["PO-1".to_string()], "tester")
            .unwrap_err();
        assert!(err.is_unique_violation());

        tx.commit().unwrap();
        assert_eq!(count_rows(&store, "SELECT COUNT(*) FROM purchase_order"), 2);
    }

    #[test]
    fn test_drop_without_commit_rolls_back() {
        let store = memory_store();
        {
            let mut tx = store.begin().unwrap();
            tx.insert_keys(EntityCategory::Project, &["PRJ".to_string()], "tester")
                .unwrap();
        }
        assert_eq!(count_rows(&store, "SELECT COUNT(*) FROM project_code"), 0);

        // 回滚后连接仍可开启新事务
        let tx = store.begin().unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn test_inventory_insert_find_update_delete() {
        let store = memory_store();
        let mut tx = store.begin().unwrap();

        tx.insert_keys(EntityCategory::Order, &["PO-1".to_string()], "t").unwrap();
        tx.insert_keys(EntityCategory::BillReference, &["B1".to_string()], "t").unwrap();
        let order_id = tx.lookup_keys(EntityCategory::Order, &["PO-1".to_string()]).unwrap()["PO-1"];
        let bill_id =
            tx.lookup_keys(EntityCategory::BillReference, &["B1".to_string()]).unwrap()["B1"];

        let group = GroupKey {
            order_code: "PO-1".to_string(),
            bill_code: "B1".to_string(),
            line_item_id: "10".to_string(),
        };

        tx.insert_inventory(&[fields(order_id, bill_id), fields(order_id, bill_id)])
            .unwrap();
        let mut existing = tx.find_group(order_id, &group).unwrap();
        assert_eq!(existing.len(), 2);
        assert!(existing[0].id < existing[1].id);
        assert!(existing.iter().all(|r| r.synced && r.serial_number.is_none()));

        existing[0].fields.warranty_term = Some("3Y".to_string());
        assert_eq!(tx.update_inventory(&existing[..1]).unwrap(), 1);
        assert_eq!(tx.delete_inventory(&[existing[1].id]).unwrap(), 1);

        let after = tx.find_group(order_id, &group).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].fields.warranty_term.as_deref(), Some("3Y"));
        tx.commit().unwrap();
    }

    #[test]
    fn test_lookup_chunks_large_key_sets() {
        let store = memory_store();
        let keys: Vec<String> = (0..1203).map(|i| format!("MFR-{i:05}")).collect();

        let mut tx = store.begin().unwrap();
        tx.insert_keys(EntityCategory::Producer, &keys, "t").unwrap();
        let found = tx.lookup_keys(EntityCategory::Producer, &keys).unwrap();
        assert_eq!(found.len(), keys.len());
        tx.commit().unwrap();
    }
}
