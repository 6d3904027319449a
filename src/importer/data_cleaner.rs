// ==========================================
// 仓储导入对账系统 - 数据清洗器实现
// ==========================================
// 职责: TRIM / NULL 标准化 / Excel 数值文本归一 / 数量解析
// ==========================================

pub struct DataCleaner;

impl DataCleaner {
    /// TRIM + 空白视为 None
    pub fn clean_text(&self, value: &str) -> Option<String> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    /// 品名：去除换行符后 TRIM
    pub fn clean_item_name(&self, value: &str) -> Option<String> {
        let cleaned: String = value.chars().filter(|c| *c != '\r' && *c != '\n').collect();
        self.clean_text(&cleaned)
    }

    /// 编码类字段：Excel 数值单元格常被读成 "10.0"，还原为 "10"
    pub fn normalize_code(&self, value: &str) -> Option<String> {
        let trimmed = value.trim();
        if let Some((int_part, frac_part)) = trimmed.split_once('.') {
            if !int_part.is_empty()
                && int_part.chars().all(|c| c.is_ascii_digit())
                && !frac_part.is_empty()
                && frac_part.chars().all(|c| c == '0')
            {
                return Some(int_part.to_string());
            }
        }
        self.clean_text(trimmed)
    }

    /// 解析数量（非负整数；接受 "3.0"）
    ///
    /// # 返回
    /// - Err(String): 可直接作为行级校验消息
    pub fn parse_quantity(&self, value: &str) -> Result<u32, String> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("数量为空".to_string());
        }

        if let Ok(q) = trimmed.parse::<u32>() {
            return Ok(q);
        }

        match trimmed.parse::<f64>() {
            Ok(f) if !f.is_finite() => Err(format!("数量无法解析: {}", trimmed)),
            Ok(f) if f < 0.0 => Err(format!("数量不能为负数: {}", trimmed)),
            Ok(f) if f.fract() != 0.0 => Err(format!("数量必须为整数: {}", trimmed)),
            Ok(f) if f > u32::MAX as f64 => Err(format!("数量超出范围: {}", trimmed)),
            Ok(f) => Ok(f as u32),
            Err(_) => Err(format!("数量无法解析: {}", trimmed)),
        }
    }
}
