// ==========================================
// 仓储导入对账系统 - 外部加载器批次处理
// ==========================================
// 职责: 原始行分批 → 写出批次文件 → 调用外部加载器 → 解析错误描述文件
// 批次文件约定:
// - 输入: <work_dir>/<stem>.<ext>
// - 错误描述: <work_dir>/<stem>_err.xml（/GRLoader/ci/{name,class}）
// - 运行前已存在的错误描述文件归档到 History/<stem>_err_<时间戳>.xml
// - 运行结束（成功或失败）删除输入文件与错误描述文件
// ==========================================

use crate::domain::{ErrorEntry, ErrorKind, SourceRow};
use crate::engine::batch_orchestrator::{Batch, BatchItem, BatchOutcome, BatchProcessor};
use crate::engine::error::{BatchError, BatchResultOf};
use crate::importer::TabularWriter;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 归档目录名
pub const HISTORY_DIR: &str = "History";

// ==========================================
// LoaderCredentials - 调用时显式传入
// ==========================================
#[derive(Clone)]
pub struct LoaderCredentials {
    pub username: String,
    pub password: String,
}

impl LoaderCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for LoaderCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

// ==========================================
// ExternalLoader Trait
// ==========================================
#[async_trait]
pub trait ExternalLoader: Send + Sync {
    /// 运行一次加载作业
    ///
    /// # 返回
    /// - Ok(String): 标准输出文本
    /// - Err(ExternalProcessing): 无法启动或非零退出
    /// - Err(Cancelled): 取消令牌触发
    async fn load(
        &self,
        credentials: &LoaderCredentials,
        input_file: &Path,
        sheet_name: &str,
        cancel: CancellationToken,
    ) -> BatchResultOf<String>;
}

// ==========================================
// CommandLoader - 命令行外部加载器
// ==========================================
// 参数模板占位符: {user} {password} {file} {sheet}
pub struct CommandLoader {
    program: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandLoader {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn render_args(&self, credentials: &LoaderCredentials, input: &Path, sheet: &str) -> Vec<String> {
        let file = input.display().to_string();
        self.args
            .iter()
            .map(|a| {
                a.replace("{user}", &credentials.username)
                    .replace("{password}", &credentials.password)
                    .replace("{file}", &file)
                    .replace("{sheet}", sheet)
            })
            .collect()
    }
}

#[async_trait]
impl ExternalLoader for CommandLoader {
    async fn load(
        &self,
        credentials: &LoaderCredentials,
        input_file: &Path,
        sheet_name: &str,
        cancel: CancellationToken,
    ) -> BatchResultOf<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.render_args(credentials, input_file, sheet_name))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|e| {
            BatchError::ExternalProcessing(format!(
                "无法启动外部加载器 {}: {}",
                self.program.display(),
                e
            ))
        })?;

        // 取消时丢弃 future，子进程随之被 kill
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(BatchError::Cancelled),
            out = child.wait_with_output() => out.map_err(|e| {
                BatchError::ExternalProcessing(format!("等待外部加载器失败: {}", e))
            })?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BatchError::ExternalProcessing(format!(
                "外部加载器退出码 {}: {}",
                output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr.trim()
            )));
        }

        Ok(stdout)
    }
}

// ==========================================
// 错误描述文件
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderRejection {
    pub name: String,
    pub class: String,
}

impl fmt::Display for LoaderRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.class)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorDocument {
    #[serde(rename = "ci", default)]
    entries: Vec<ErrorDocumentEntry>,
}

#[derive(Debug, Deserialize)]
struct ErrorDocumentEntry {
    name: Option<String>,
    class: Option<String>,
}

/// 解析错误描述 XML
pub fn parse_error_document(xml: &str) -> Result<Vec<LoaderRejection>, String> {
    let doc: ErrorDocument = quick_xml::de::from_str(xml).map_err(|e| e.to_string())?;
    Ok(doc
        .entries
        .into_iter()
        .map(|e| LoaderRejection {
            name: e.name.unwrap_or_else(|| "Unknown".to_string()),
            class: e.class.unwrap_or_else(|| "Unknown".to_string()),
        })
        .collect())
}

/// <dir>/<stem>_err.xml
pub fn error_file_path(input_file: &Path) -> PathBuf {
    let stem = input_file
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("batch");
    let dir = input_file.parent().unwrap_or_else(|| Path::new("."));
    dir.join(format!("{}_err.xml", stem))
}

/// 归档运行前已存在的错误描述文件
///
/// # 返回
/// - Some(归档路径): 已归档
/// - None: 无需归档
pub async fn archive_stale_error_file(input_file: &Path) -> std::io::Result<Option<PathBuf>> {
    let err_path = error_file_path(input_file);
    if !tokio::fs::try_exists(&err_path).await? {
        return Ok(None);
    }

    let dir = input_file.parent().unwrap_or_else(|| Path::new("."));
    let history = dir.join(HISTORY_DIR);
    tokio::fs::create_dir_all(&history).await?;

    let modified: DateTime<Local> = tokio::fs::metadata(&err_path).await?.modified()?.into();
    let stem = input_file
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("batch");
    let target = history.join(format!(
        "{}_err_{}.xml",
        stem,
        modified.format("%Y%m%d%H%M%S")
    ));

    tokio::fs::rename(&err_path, &target).await?;
    Ok(Some(target))
}

/// 批次文件清理（drop 时删除）
struct BatchFileGuard {
    paths: Vec<PathBuf>,
}

impl Drop for BatchFileGuard {
    fn drop(&mut self) {
        for path in &self.paths {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "批次临时文件删除失败");
                }
            }
        }
    }
}

// ==========================================
// LoaderBatchProcessor
// ==========================================
pub struct LoaderBatchProcessor {
    loader: Arc<dyn ExternalLoader>,
    writer: Arc<dyn TabularWriter>,
    credentials: LoaderCredentials,
    headers: Arc<Vec<String>>,
    work_dir: PathBuf,
    sheet_name: String,
}

impl LoaderBatchProcessor {
    pub fn new(
        loader: Arc<dyn ExternalLoader>,
        writer: Arc<dyn TabularWriter>,
        credentials: LoaderCredentials,
        headers: Vec<String>,
        work_dir: impl Into<PathBuf>,
        sheet_name: impl Into<String>,
    ) -> Self {
        Self {
            loader,
            writer,
            credentials,
            headers: Arc::new(headers),
            work_dir: work_dir.into(),
            sheet_name: sheet_name.into(),
        }
    }

    /// 批次输入文件路径（同一批次的重试复用同一文件名）
    pub fn batch_file_path(&self, batch_index: usize) -> PathBuf {
        self.work_dir.join(format!(
            "{}_batch_{:04}.{}",
            sanitize(&self.sheet_name),
            batch_index,
            self.writer.extension()
        ))
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[async_trait]
impl BatchProcessor<SourceRow> for LoaderBatchProcessor {
    async fn process(
        &self,
        batch: &Batch<SourceRow>,
        attempt: u32,
        cancel: CancellationToken,
    ) -> BatchResultOf<BatchOutcome> {
        let input = self.batch_file_path(batch.index);
        let err_path = error_file_path(&input);

        tokio::fs::create_dir_all(&self.work_dir).await.map_err(|e| {
            BatchError::ExternalProcessing(format!("无法创建工作目录: {}", e))
        })?;

        if let Some(archived) = archive_stale_error_file(&input).await.map_err(|e| {
            BatchError::ExternalProcessing(format!("归档旧错误文件失败: {}", e))
        })? {
            info!(batch = batch.index, archived = %archived.display(), "旧错误描述文件已归档");
        }

        let _guard = BatchFileGuard {
            paths: vec![input.clone(), err_path.clone()],
        };

        // 写出在 blocking 线程池执行，不占用 runtime 工作线程
        let writer = Arc::clone(&self.writer);
        let headers = Arc::clone(&self.headers);
        let items = Arc::clone(&batch.items);
        let target = input.clone();
        tokio::task::spawn_blocking(move || writer.write(&target, &headers, &items))
            .await
            .map_err(|e| BatchError::Internal(format!("批次 {} 写出任务异常: {}", batch.index, e)))?
            .map_err(|e| BatchError::ExternalProcessing(format!("批次文件写出失败: {}", e)))?;

        if cancel.is_cancelled() {
            return Err(BatchError::Cancelled);
        }

        debug!(batch = batch.index, attempt, file = %input.display(), "调用外部加载器");
        let stdout = self
            .loader
            .load(&self.credentials, &input, &self.sheet_name, cancel)
            .await?;
        debug!(batch = batch.index, output = %stdout.trim(), "外部加载器完成");

        let mut errors = Vec::new();
        let has_error_file = tokio::fs::try_exists(&err_path).await.map_err(|e| {
            BatchError::ExternalProcessing(format!("检查错误描述文件失败: {}", e))
        })?;
        if has_error_file {
            let content = tokio::fs::read_to_string(&err_path).await.map_err(|e| {
                BatchError::ExternalProcessing(format!("读取错误描述文件失败: {}", e))
            })?;
            match parse_error_document(&content) {
                Ok(rejections) => {
                    errors.extend(rejections.iter().map(|r| {
                        ErrorEntry::for_batch(ErrorKind::ExternalProcessing, batch.index, r.to_string())
                    }));
                }
                Err(e) => errors.push(ErrorEntry::for_batch(
                    ErrorKind::ExternalProcessing,
                    batch.index,
                    format!("error parsing XML: {}", e),
                )),
            }
        }

        let rows = batch.items.iter().map(BatchItem::row_count).sum::<usize>();
        if !errors.is_empty() {
            warn!(batch = batch.index, rejected = errors.len(), rows, "外部加载器拒绝部分记录");
        }

        Ok(BatchOutcome {
            succeeded_rows: rows.saturating_sub(errors.len()),
            errors,
            delta: Default::default(),
        })
    }
}
