// ==========================================
// 仓储导入对账系统 - 字段映射器实现
// ==========================================
// 职责: 表头别名 → 标准列 + 原始行 → InputRecord（含行级校验）
// 约束: 行级校验错误只排除该行，不中断导入
// ==========================================

use crate::config::ImportSettings;
use crate::domain::{ErrorEntry, InputRecord, SourceRow};
use crate::importer::data_cleaner::DataCleaner;
use crate::importer::error::{ImportError, ImportResult};
use std::collections::HashMap;

/// 业务键最大长度
pub const MAX_KEY_LENGTH: usize = 255;

// ==========================================
// 标准列名
// ==========================================
pub mod columns {
    pub const ORDER_CODE: &str = "order_code";
    pub const BILL_CODE: &str = "bill_code";
    pub const LINE_ITEM_ID: &str = "line_item_id";
    pub const CONTRACT_CODE: &str = "contract_code";
    pub const PROJECT_CODE: &str = "project_code";
    pub const PRODUCER_NAME: &str = "producer_name";
    pub const SUB_DEPARTMENT_NAME: &str = "sub_department_name";
    pub const ITEM_NAME: &str = "item_name";
    pub const PART_NUMBER: &str = "part_number";
    pub const QUANTITY: &str = "quantity";
    pub const WARRANTY_TERM: &str = "warranty_term";
    pub const ACCOUNT_MANAGER: &str = "account_manager";
    pub const BUYER_ACCOUNT: &str = "buyer_account";

    /// 必需列
    pub const REQUIRED: [&str; 5] = [ORDER_CODE, BILL_CODE, LINE_ITEM_ID, ITEM_NAME, QUANTITY];
}

/// 表头归一：小写并去除空格/下划线/连字符后匹配别名
pub fn normalize_header(header: &str) -> Option<&'static str> {
    let key: String = header
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .collect();

    let column = match key.as_str() {
        "ordercode" | "order" | "ponumber" | "pocode" | "po" | "采购订单号" | "订单号" => {
            columns::ORDER_CODE
        }
        "billcode" | "billnumber" | "bill" | "picode" | "单据号" => columns::BILL_CODE,
        "lineitemid" | "lineitem" | "poitemid" | "itemid" | "行项目" | "行项目号" => {
            columns::LINE_ITEM_ID
        }
        "contractcode" | "contract" | "sellcontract" | "合同号" | "销售合同号" => {
            columns::CONTRACT_CODE
        }
        "projectcode" | "project" | "项目编码" | "项目号" => columns::PROJECT_CODE,
        "producername" | "producer" | "manufacturer" | "制造商" | "厂商" => {
            columns::PRODUCER_NAME
        }
        "subdepartmentname" | "subdepartment" | "subdept" | "子部门" => {
            columns::SUB_DEPARTMENT_NAME
        }
        "itemname" | "productname" | "name" | "品名" | "物料名称" => columns::ITEM_NAME,
        "partnumber" | "partno" | "pn" | "料号" => columns::PART_NUMBER,
        "quantity" | "qty" | "数量" => columns::QUANTITY,
        "warrantyterm" | "warranty" | "保修期" => columns::WARRANTY_TERM,
        "accountmanager" | "am" | "客户经理" => columns::ACCOUNT_MANAGER,
        "buyeraccount" | "bp" | "采购账号" => columns::BUYER_ACCOUNT,
        _ => return None,
    };
    Some(column)
}

// ==========================================
// FieldMapper
// ==========================================
pub struct FieldMapper {
    // 标准列 → 文件中的原始表头
    column_map: HashMap<&'static str, String>,
    cleaner: DataCleaner,
    max_quantity: u32,
}

impl FieldMapper {
    /// 根据文件表头构建映射（缺少必需列时拒绝整个文件）
    pub fn from_headers(headers: &[String]) -> ImportResult<Self> {
        let mut column_map = HashMap::new();
        for header in headers {
            if let Some(column) = normalize_header(header) {
                // 同一标准列出现多次时取第一列
                column_map.entry(column).or_insert_with(|| header.clone());
            }
        }

        let missing: Vec<&str> = columns::REQUIRED
            .iter()
            .filter(|c| !column_map.contains_key(*c))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(ImportError::MissingColumns(missing.join(", ")));
        }

        Ok(Self {
            column_map,
            cleaner: DataCleaner,
            max_quantity: ImportSettings::default().max_quantity,
        })
    }

    /// 单行数量上限（超出视为行级校验错误）
    pub fn with_max_quantity(mut self, max_quantity: u32) -> Self {
        self.max_quantity = max_quantity;
        self
    }

    fn raw<'r>(&self, row: &'r SourceRow, column: &str) -> &'r str {
        match self.column_map.get(column) {
            Some(header) => row.cell(header),
            None => "",
        }
    }

    fn key(&self, row: &SourceRow, column: &str) -> Option<String> {
        self.cleaner.normalize_code(self.raw(row, column))
    }

    fn text(&self, row: &SourceRow, column: &str) -> Option<String> {
        self.cleaner.clean_text(self.raw(row, column))
    }

    /// 原始行 → InputRecord
    ///
    /// # 返回
    /// - Err(Vec<ErrorEntry>): 该行的全部校验错误
    pub fn map_row(&self, row: &SourceRow) -> Result<InputRecord, Vec<ErrorEntry>> {
        let n = row.row_number;
        let mut errors = Vec::new();

        let mut required_key = |column: &str, label: &str| -> String {
            match self.key(row, column) {
                Some(v) => v,
                None => {
                    errors.push(ErrorEntry::validation(n, format!("{}不能为空", label)));
                    String::new()
                }
            }
        };
        let order_code = required_key(columns::ORDER_CODE, "订单号");
        let bill_code = required_key(columns::BILL_CODE, "单据号");
        let line_item_id = required_key(columns::LINE_ITEM_ID, "行项目 ID");

        let item_name = match self.cleaner.clean_item_name(self.raw(row, columns::ITEM_NAME)) {
            Some(v) => v,
            None => {
                errors.push(ErrorEntry::validation(n, "品名不能为空"));
                String::new()
            }
        };

        let quantity = match self.cleaner.parse_quantity(self.raw(row, columns::QUANTITY)) {
            Ok(q) if q > self.max_quantity => {
                errors.push(ErrorEntry::validation(
                    n,
                    format!("数量 {} 超出上限 {}", q, self.max_quantity),
                ));
                0
            }
            Ok(q) => q,
            Err(msg) => {
                errors.push(ErrorEntry::validation(n, msg));
                0
            }
        };

        let record = InputRecord {
            row_number: n,
            order_code,
            bill_code,
            line_item_id,
            contract_code: self.key(row, columns::CONTRACT_CODE),
            project_code: self.key(row, columns::PROJECT_CODE),
            producer_name: self.text(row, columns::PRODUCER_NAME),
            sub_department_name: self.text(row, columns::SUB_DEPARTMENT_NAME),
            item_name,
            part_number: self.text(row, columns::PART_NUMBER),
            quantity,
            warranty_term: self.text(row, columns::WARRANTY_TERM),
            account_manager: self.text(row, columns::ACCOUNT_MANAGER),
            buyer_account: self.text(row, columns::BUYER_ACCOUNT),
        };

        for category in crate::domain::EntityCategory::ALL {
            if let Some(key) = record.business_key(category) {
                if key.chars().count() > MAX_KEY_LENGTH {
                    errors.push(ErrorEntry::validation(
                        n,
                        format!("{} 业务键超长（上限 {} 字符）", category, MAX_KEY_LENGTH),
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(record)
        } else {
            Err(errors)
        }
    }

    /// 批量映射（错误按行号顺序）
    pub fn map_rows(&self, rows: &[SourceRow]) -> (Vec<InputRecord>, Vec<ErrorEntry>) {
        let mut records = Vec::with_capacity(rows.len());
        let mut errors = Vec::new();
        for row in rows {
            match self.map_row(row) {
                Ok(r) => records.push(r),
                Err(mut e) => errors.append(&mut e),
            }
        }
        (records, errors)
    }
}
