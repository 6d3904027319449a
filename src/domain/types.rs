// ==========================================
// 仓储导入对账系统 - 领域类型定义
// ==========================================
// 职责: 实体类别、批次状态、导入结论、错误分类
// 约束: 所有枚举的持久化字符串统一为全大写
// ==========================================

use serde::{Deserialize, Serialize};
use std::fmt;

// ==========================================
// EntityCategory - 业务实体类别
// ==========================================
// 每个类别维护 业务键 → 整数 ID 的映射
// 业务键区分大小写、非空、类别内唯一
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityCategory {
    Order,         // 采购订单
    Contract,      // 销售合同
    Project,       // 项目编码
    Producer,      // 制造商
    SubDepartment, // 子部门
    BillReference, // 单据号
}

impl EntityCategory {
    /// 全部类别（固定顺序，决定解析顺序）
    pub const ALL: [EntityCategory; 6] = [
        EntityCategory::Order,
        EntityCategory::Contract,
        EntityCategory::Project,
        EntityCategory::Producer,
        EntityCategory::SubDepartment,
        EntityCategory::BillReference,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityCategory::Order => "ORDER",
            EntityCategory::Contract => "CONTRACT",
            EntityCategory::Project => "PROJECT",
            EntityCategory::Producer => "PRODUCER",
            EntityCategory::SubDepartment => "SUB_DEPARTMENT",
            EntityCategory::BillReference => "BILL_REFERENCE",
        }
    }

    /// 对应的实体表名（固定常量，可安全拼接进 SQL）
    pub fn table_name(&self) -> &'static str {
        match self {
            EntityCategory::Order => "purchase_order",
            EntityCategory::Contract => "sell_contract",
            EntityCategory::Project => "project_code",
            EntityCategory::Producer => "manufacturer",
            EntityCategory::SubDepartment => "sub_department",
            EntityCategory::BillReference => "bill_number",
        }
    }
}

impl fmt::Display for EntityCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==========================================
// BatchStatus - 批次状态机
// ==========================================
// Pending → Running → {Succeeded, Retrying, Failed}
// Retrying → Running（等待重试间隔后）
// 任意状态 → Cancelled（外部取消）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "PENDING",
            BatchStatus::Running => "RUNNING",
            BatchStatus::Retrying => "RETRYING",
            BatchStatus::Succeeded => "SUCCEEDED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Cancelled => "CANCELLED",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Succeeded | BatchStatus::Failed | BatchStatus::Cancelled
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==========================================
// ImportOutcome - 导入总体结论
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportOutcome {
    Success,        // 零错误
    PartialSuccess, // 有错误，也有成功
    Failure,        // 零成功
    Cancelled,      // 被外部取消（结果为部分）
}

impl ImportOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportOutcome::Success => "SUCCESS",
            ImportOutcome::PartialSuccess => "PARTIAL_SUCCESS",
            ImportOutcome::Failure => "FAILURE",
            ImportOutcome::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "SUCCESS" => ImportOutcome::Success,
            "PARTIAL_SUCCESS" => ImportOutcome::PartialSuccess,
            "CANCELLED" => ImportOutcome::Cancelled,
            _ => ImportOutcome::Failure,
        }
    }
}

impl fmt::Display for ImportOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==========================================
// ErrorKind - 错误分类
// ==========================================
// Validation: 只排除该行，不中断批次
// Resolution / ExternalProcessing / Persistence: 中断批次并重试
// Cancelled: 中断整个运行，不重试
// Internal: 内部一致性错误，批次直接失败
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Validation,
    Resolution,
    ExternalProcessing,
    Persistence,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Resolution => "RESOLUTION",
            ErrorKind::ExternalProcessing => "EXTERNAL_PROCESSING",
            ErrorKind::Persistence => "PERSISTENCE",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
