// ==========================================
// 仓储导入对账系统 - 文件解析器实现
// ==========================================
// 支持: Excel (.xlsx/.xls) / CSV (.csv)
// 约束: 上传校验（大小/扩展名）先于任何解析
// ==========================================

use crate::config::ImportSettings;
use crate::domain::SourceRow;
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::importer_trait::{FileParser, ParsedSheet, TabularWriter};
use calamine::{open_workbook_auto, Reader};
use csv::{ReaderBuilder, WriterBuilder};
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

/// 数据行的起始行号（表头为第 1 行）
const FIRST_DATA_ROW: usize = 2;

fn file_extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

/// 将一行单元格组装为 SourceRow（全空白行返回 None）
fn build_row(headers: &[String], values: Vec<String>, row_number: usize) -> Option<SourceRow> {
    let mut cells = HashMap::with_capacity(headers.len());
    for (col_idx, value) in values.into_iter().enumerate() {
        if let Some(header) = headers.get(col_idx) {
            if header.is_empty() {
                continue;
            }
            cells.insert(header.clone(), value.trim().to_string());
        }
    }

    if cells.values().all(|v| v.is_empty()) {
        return None;
    }
    Some(SourceRow::new(row_number, cells))
}

// ==========================================
// 上传校验
// ==========================================

/// 校验上传文件：存在性、扩展名、大小
pub fn validate_upload(path: &Path, settings: &ImportSettings) -> ImportResult<u64> {
    if !path.exists() {
        return Err(ImportError::FileNotFound(path.display().to_string()));
    }

    let ext = file_extension(path);
    if !settings.is_extension_allowed(&ext) {
        return Err(ImportError::UnsupportedFormat(format!(
            "{}（允许: {}）",
            if ext.is_empty() { "<无扩展名>" } else { ext.as_str() },
            settings.allowed_extensions.join("/")
        )));
    }

    let size = std::fs::metadata(path)?.len();
    let limit = settings.max_file_size_bytes();
    if size > limit {
        return Err(ImportError::FileTooLarge { size, limit });
    }

    Ok(size)
}

// ==========================================
// CSV Parser 实现
// ==========================================
pub struct CsvParser;

impl FileParser for CsvParser {
    fn parse(&self, file_path: &Path) -> ImportResult<ParsedSheet> {
        if !file_path.exists() {
            return Err(ImportError::FileNotFound(file_path.display().to_string()));
        }

        let file = File::open(file_path)?;
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true) // 允许行长度不一致
            .from_reader(file);

        // 表头（去除 UTF-8 BOM）
        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
            .collect();

        let mut rows = Vec::new();
        for (idx, result) in reader.records().enumerate() {
            let record = result?;
            let values = record.iter().map(str::to_string).collect();
            if let Some(row) = build_row(&headers, values, idx + FIRST_DATA_ROW) {
                rows.push(row);
            }
        }

        let sheet_name = file_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("Sheet1")
            .to_string();

        Ok(ParsedSheet {
            sheet_name,
            headers,
            rows,
        })
    }
}

// ==========================================
// Excel Parser 实现
// ==========================================
pub struct ExcelParser;

impl FileParser for ExcelParser {
    fn parse(&self, file_path: &Path) -> ImportResult<ParsedSheet> {
        if !file_path.exists() {
            return Err(ImportError::FileNotFound(file_path.display().to_string()));
        }

        let mut workbook = open_workbook_auto(file_path)?;

        // 读取第一个 sheet
        let sheet_name = workbook
            .sheet_names()
            .first()
            .cloned()
            .ok_or_else(|| ImportError::ExcelParseError("Excel 文件无工作表".to_string()))?;

        let range = workbook.worksheet_range(&sheet_name)?;

        let mut iter = range.rows();
        let header_row = iter.next().ok_or(ImportError::EmptyFile)?;
        let headers: Vec<String> = header_row
            .iter()
            .map(|cell| cell.to_string().trim().to_string())
            .collect();

        // range 起点可能不在 A1，行号以 range 起始行为准
        let start_row = range.start().map(|(r, _)| r as usize + 1).unwrap_or(1);

        let mut rows = Vec::new();
        for (idx, data_row) in iter.enumerate() {
            let values = data_row.iter().map(|c| c.to_string()).collect();
            if let Some(row) = build_row(&headers, values, start_row + 1 + idx) {
                rows.push(row);
            }
        }

        Ok(ParsedSheet {
            sheet_name,
            headers,
            rows,
        })
    }
}

// ==========================================
// 通用文件解析器（根据扩展名自动选择）
// ==========================================
pub struct UniversalFileParser;

impl FileParser for UniversalFileParser {
    fn parse(&self, file_path: &Path) -> ImportResult<ParsedSheet> {
        match file_extension(file_path).as_str() {
            "csv" => CsvParser.parse(file_path),
            "xlsx" | "xls" | "xlsm" => ExcelParser.parse(file_path),
            other => Err(ImportError::UnsupportedFormat(other.to_string())),
        }
    }
}

// ==========================================
// CSV Writer 实现
// ==========================================
pub struct CsvWriter;

impl TabularWriter for CsvWriter {
    fn write(&self, file_path: &Path, headers: &[String], rows: &[SourceRow]) -> ImportResult<()> {
        let mut writer = WriterBuilder::new()
            .from_path(file_path)
            .map_err(|e| ImportError::FileWriteError(e.to_string()))?;

        writer
            .write_record(headers)
            .map_err(|e| ImportError::FileWriteError(e.to_string()))?;

        for row in rows {
            writer
                .write_record(headers.iter().map(|h| row.cell(h)))
                .map_err(|e| ImportError::FileWriteError(e.to_string()))?;
        }

        writer
            .flush()
            .map_err(|e| ImportError::FileWriteError(e.to_string()))?;
        Ok(())
    }

    fn extension(&self) -> &'static str {
        "csv"
    }
}
