// ==========================================
// 仓储导入对账系统 - 导入层
// ==========================================
// 职责: 上传校验、文件解析、表头映射、数据清洗
// 支持: Excel, CSV
// ==========================================

// 模块声明
pub mod data_cleaner;
pub mod error;
pub mod field_mapper;
pub mod file_parser;
pub mod importer_trait;

// 重导出核心类型
pub use data_cleaner::DataCleaner;
pub use error::{ImportError, ImportResult};
pub use field_mapper::{columns, normalize_header, FieldMapper, MAX_KEY_LENGTH};
pub use file_parser::{validate_upload, CsvParser, CsvWriter, ExcelParser, UniversalFileParser};

// 重导出 Trait 接口
pub use importer_trait::{FileParser, ParsedSheet, TabularWriter};
