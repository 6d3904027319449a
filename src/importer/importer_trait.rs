// ==========================================
// 仓储导入对账系统 - 表格读写 Trait
// ==========================================
// 职责: 定义表格读取/写出接口（不包含实现）
// 实现者: CsvParser, ExcelParser, CsvWriter
// ==========================================

use crate::domain::SourceRow;
use crate::importer::error::ImportResult;
use std::path::Path;

// ==========================================
// ParsedSheet - 解析产物
// ==========================================
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSheet {
    pub sheet_name: String,
    pub headers: Vec<String>,  // 保持文件中的列顺序
    pub rows: Vec<SourceRow>,  // 已跳过完全空白的行
}

impl ParsedSheet {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

// ==========================================
// FileParser Trait
// ==========================================
// 用途: 文件 → 有序行（列名 → 原始值）
pub trait FileParser: Send + Sync {
    /// 解析文件首个工作表
    ///
    /// # 返回
    /// - Ok(ParsedSheet): 表头 + 数据行（行号从 2 开始，表头为第 1 行）
    /// - Err: 文件不存在、格式错误等
    fn parse(&self, file_path: &Path) -> ImportResult<ParsedSheet>;
}

// ==========================================
// TabularWriter Trait
// ==========================================
// 用途: 表头 + 行 → 文件（外部加载器的批次输入文件）
pub trait TabularWriter: Send + Sync {
    /// 写出表格
    ///
    /// # 说明
    /// - 列顺序以 headers 为准
    /// - 行中缺失的列写为空串
    fn write(&self, file_path: &Path, headers: &[String], rows: &[SourceRow]) -> ImportResult<()>;

    /// 输出文件扩展名（不含点）
    fn extension(&self) -> &'static str;
}
