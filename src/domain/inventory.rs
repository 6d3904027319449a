// ==========================================
// 仓储导入对账系统 - 库存领域模型
// ==========================================
// 职责: 导入行、分组、已解析实体集、库存记录
// 红线: 领域层不含数据访问逻辑
// ==========================================

use crate::domain::types::EntityCategory;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

// ==========================================
// SourceRow - 表格原始行
// ==========================================
// 用途: 文件解析产物（列名 → 原始单元格文本）
// row_number 为表格中的实际行号（表头为第 1 行）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRow {
    pub row_number: usize,
    pub cells: HashMap<String, String>,
}

impl SourceRow {
    pub fn new(row_number: usize, cells: HashMap<String, String>) -> Self {
        Self { row_number, cells }
    }

    /// 读取单元格（缺失返回空串）
    pub fn cell(&self, column: &str) -> &str {
        self.cells.get(column).map(String::as_str).unwrap_or("")
    }
}

// ==========================================
// InputRecord - 一条逻辑导入行
// ==========================================
// 生命周期: 读取后不可变
// 多条 InputRecord 可共享同一个 GroupKey
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRecord {
    pub row_number: usize,

    // ===== 业务键 =====
    pub order_code: String,                  // 采购订单号（分组键①）
    pub bill_code: String,                   // 单据号（分组键②）
    pub line_item_id: String,                // 行项目 ID（分组键③）
    pub contract_code: Option<String>,       // 销售合同号
    pub project_code: Option<String>,        // 项目编码
    pub producer_name: Option<String>,       // 制造商
    pub sub_department_name: Option<String>, // 子部门

    // ===== 标量字段 =====
    pub item_name: String,
    pub part_number: Option<String>,
    pub quantity: u32,
    pub warranty_term: Option<String>,
    pub account_manager: Option<String>, // AM 账号
    pub buyer_account: Option<String>,   // BP 账号
}

impl InputRecord {
    pub fn group_key(&self) -> GroupKey {
        GroupKey {
            order_code: self.order_code.clone(),
            bill_code: self.bill_code.clone(),
            line_item_id: self.line_item_id.clone(),
        }
    }

    /// 指定类别的业务键（空值视为无引用）
    pub fn business_key(&self, category: EntityCategory) -> Option<&str> {
        let key = match category {
            EntityCategory::Order => Some(self.order_code.as_str()),
            EntityCategory::BillReference => Some(self.bill_code.as_str()),
            EntityCategory::Contract => self.contract_code.as_deref(),
            EntityCategory::Project => self.project_code.as_deref(),
            EntityCategory::Producer => self.producer_name.as_deref(),
            EntityCategory::SubDepartment => self.sub_department_name.as_deref(),
        };
        key.filter(|k| !k.is_empty())
    }
}

// ==========================================
// GroupKey - 分组键
// ==========================================
// (订单号, 单据号, 行项目 ID) 相同的行代表同一采购行
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    pub order_code: String,
    pub bill_code: String,
    pub line_item_id: String,
}

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.order_code, self.bill_code, self.line_item_id)
    }
}

// ==========================================
// RecordGroup - 预分组的导入行
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordGroup {
    pub key: GroupKey,
    pub records: Vec<InputRecord>,
}

impl RecordGroup {
    /// 期望数量 = 组内数量之和（u64 精确求和，不截断）
    pub fn desired_quantity(&self) -> u64 {
        self.records.iter().map(|r| u64::from(r.quantity)).sum()
    }

    /// 模板行（组内第一行）
    pub fn template(&self) -> Option<&InputRecord> {
        self.records.first()
    }

    /// 按首次出现顺序分组，组内保持输入顺序
    pub fn group_records(records: Vec<InputRecord>) -> Vec<RecordGroup> {
        let mut index: HashMap<GroupKey, usize> = HashMap::new();
        let mut groups: Vec<RecordGroup> = Vec::new();

        for record in records {
            let key = record.group_key();
            match index.get(&key) {
                Some(&pos) => groups[pos].records.push(record),
                None => {
                    index.insert(key.clone(), groups.len());
                    groups.push(RecordGroup {
                        key,
                        records: vec![record],
                    });
                }
            }
        }

        groups
    }
}

// ==========================================
// EntityKeySet - 每个类别待解析的业务键集合
// ==========================================
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityKeySet {
    keys: BTreeMap<EntityCategory, BTreeSet<String>>,
}

impl EntityKeySet {
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a InputRecord>,
    {
        let mut set = Self::default();
        for record in records {
            for category in EntityCategory::ALL {
                if let Some(key) = record.business_key(category) {
                    set.insert(category, key);
                }
            }
        }
        set
    }

    pub fn insert(&mut self, category: EntityCategory, key: &str) {
        self.keys
            .entry(category)
            .or_default()
            .insert(key.to_string());
    }

    /// 指定类别的键（有序）
    pub fn keys(&self, category: EntityCategory) -> Vec<String> {
        self.keys
            .get(&category)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn categories(&self) -> impl Iterator<Item = EntityCategory> + '_ {
        self.keys
            .iter()
            .filter(|(_, keys)| !keys.is_empty())
            .map(|(category, _)| *category)
    }

    pub fn len(&self, category: EntityCategory) -> usize {
        self.keys.get(&category).map(BTreeSet::len).unwrap_or(0)
    }
}

// ==========================================
// ResolvedEntitySet - 已解析实体集
// ==========================================
// 类别 → (业务键 → ID)
// 每批次构建一次，批次结束即丢弃
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedEntitySet {
    maps: BTreeMap<EntityCategory, HashMap<String, i64>>,
}

impl ResolvedEntitySet {
    pub fn insert(&mut self, category: EntityCategory, key: impl Into<String>, id: i64) {
        self.maps.entry(category).or_default().insert(key.into(), id);
    }

    pub fn extend(&mut self, category: EntityCategory, entries: HashMap<String, i64>) {
        self.maps.entry(category).or_default().extend(entries);
    }

    pub fn get(&self, category: EntityCategory, key: &str) -> Option<i64> {
        self.maps.get(&category).and_then(|m| m.get(key).copied())
    }

    pub fn contains(&self, category: EntityCategory, key: &str) -> bool {
        self.get(category, key).is_some()
    }

    pub fn len(&self, category: EntityCategory) -> usize {
        self.maps.get(&category).map(HashMap::len).unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.maps.values().map(HashMap::len).sum()
    }
}

// ==========================================
// InventoryFields - 库存记录的可写字段
// ==========================================
// 新增记录与更新记录共用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryFields {
    // ===== 分组定位 =====
    pub order_id: i64,
    pub bill_code: String,
    pub line_item_id: String,

    // ===== 已解析外键 =====
    pub bill_id: i64,
    pub contract_id: Option<i64>,
    pub project_id: Option<i64>,
    pub producer_id: Option<i64>,
    pub sub_department_id: Option<i64>,

    // ===== 标量字段 =====
    pub item_name: String,
    pub part_number: Option<String>,
    pub warranty_term: Option<String>,
    pub account_manager: Option<String>,
    pub buyer_account: Option<String>,
}

// ==========================================
// InventoryRecord - 持久化库存单元
// ==========================================
// 一条记录对应一个实物/核算单元
// 带序列号的记录代表实物跟踪单元，不得静默删除
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub id: i64,
    pub fields: InventoryFields,
    pub serial_number: Option<String>,
    pub synced: bool,
}

impl InventoryRecord {
    /// 是否带有序列号（空白视为无）
    pub fn has_serial_number(&self) -> bool {
        self.serial_number
            .as_deref()
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false)
    }
}
