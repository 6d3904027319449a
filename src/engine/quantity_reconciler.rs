// ==========================================
// 仓储导入对账系统 - 数量对账器
// ==========================================
// 职责: 计算一个分组的最小变更（新增/更新/删除）
// 规则:
// - 无现有记录 → 按模板新增 desired 条
// - 有现有记录 → 保留的记录全部按模板刷新
//   - desired > existing: 新增差额（克隆已刷新记录的字段）
//   - desired < existing: 删除差额，只删无序列号的记录
//     带序列号的记录永不删除，缺口计入 over_provisioned
// - 幂等: 对已应用状态再次对账不产生新增/删除
// ==========================================

use crate::domain::{
    EntityCategory, InputRecord, InventoryFields, InventoryRecord, RecordGroup, ResolvedEntitySet,
};
use crate::engine::entity_resolver::{optional_id, require_id};
use crate::engine::error::{BatchError, BatchResultOf};

// ==========================================
// ReconcilePlan - 单分组对账计划
// ==========================================
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub to_add: Vec<InventoryFields>,
    pub to_update: Vec<InventoryRecord>,
    pub to_remove: Vec<i64>,
    pub over_provisioned: usize,
}

impl ReconcilePlan {
    pub fn is_noop(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty() && self.to_remove.is_empty()
    }

    /// 应用后的记录数
    pub fn resulting_count(&self, existing: usize) -> usize {
        existing + self.to_add.len() - self.to_remove.len()
    }
}

/// 由模板行和已解析实体构造库存字段
pub fn fields_from_template(
    template: &InputRecord,
    resolved: &ResolvedEntitySet,
) -> BatchResultOf<InventoryFields> {
    Ok(InventoryFields {
        order_id: require_id(resolved, EntityCategory::Order, &template.order_code)?,
        bill_code: template.bill_code.clone(),
        line_item_id: template.line_item_id.clone(),
        bill_id: require_id(resolved, EntityCategory::BillReference, &template.bill_code)?,
        contract_id: optional_id(
            resolved,
            EntityCategory::Contract,
            template.contract_code.as_deref(),
        )?,
        project_id: optional_id(
            resolved,
            EntityCategory::Project,
            template.project_code.as_deref(),
        )?,
        producer_id: optional_id(
            resolved,
            EntityCategory::Producer,
            template.producer_name.as_deref(),
        )?,
        sub_department_id: optional_id(
            resolved,
            EntityCategory::SubDepartment,
            template.sub_department_name.as_deref(),
        )?,
        item_name: template.item_name.clone(),
        part_number: template.part_number.clone(),
        warranty_term: template.warranty_term.clone(),
        account_manager: template.account_manager.clone(),
        buyer_account: template.buyer_account.clone(),
    })
}

/// 刷新一条现有记录（品名与分组定位保持不变）
fn refresh(existing: &InventoryRecord, template_fields: &InventoryFields) -> InventoryRecord {
    let mut fields = template_fields.clone();
    fields.item_name = existing.fields.item_name.clone();
    InventoryRecord {
        id: existing.id,
        fields,
        serial_number: existing.serial_number.clone(),
        synced: true,
    }
}

/// 对账一个分组
///
/// # 参数
/// - group: 分组（提供 desired 与模板行）
/// - resolved: 本批次已解析实体集
/// - existing: 该分组现有记录（按 ID 升序）
///
/// # 返回
/// - Err(MissingMapping): 模板引用的键未解析（内部一致性错误）
pub fn reconcile(
    group: &RecordGroup,
    resolved: &ResolvedEntitySet,
    existing: &[InventoryRecord],
) -> BatchResultOf<ReconcilePlan> {
    let desired = usize::try_from(group.desired_quantity()).map_err(|_| {
        BatchError::Internal(format!("分组 {} 期望数量超出平台范围", group.key))
    })?;
    let Some(template) = group.template() else {
        // 空分组：不做任何变更
        return Ok(ReconcilePlan::default());
    };
    let template_fields = fields_from_template(template, resolved)?;

    let mut plan = ReconcilePlan::default();

    if existing.is_empty() {
        plan.to_add = vec![template_fields; desired];
        return Ok(plan);
    }

    if desired < existing.len() {
        let needed = existing.len() - desired;
        plan.to_remove = existing
            .iter()
            .filter(|r| !r.has_serial_number())
            .take(needed)
            .map(|r| r.id)
            .collect();
        plan.over_provisioned = needed - plan.to_remove.len();
    }

    plan.to_update = existing
        .iter()
        .filter(|r| !plan.to_remove.contains(&r.id))
        .map(|r| refresh(r, &template_fields))
        .collect();

    if desired > existing.len() {
        let shape = plan
            .to_update
            .first()
            .map(|r| r.fields.clone())
            .unwrap_or(template_fields);
        plan.to_add = vec![shape; desired - existing.len()];
    }

    Ok(plan)
}
