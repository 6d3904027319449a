// ==========================================
// 仓储导入对账系统 - 导入服务
// ==========================================
// 职责: 串联 上传校验 → 解析 → 映射校验 → 分组分批 → 编排 → 汇总 → 运行历史
// 红线: 运行从不越界失败，任何情况下都返回 ImportReport
// ==========================================

use crate::config::ImportSettings;
use crate::domain::{
    ErrorEntry, ErrorKind, ImportReport, ImportRun, InputRecord, RecordGroup, SourceRow,
};
use crate::engine::batch_orchestrator::{partition, BatchOrchestrator, OrchestratorSettings};
use crate::engine::loader::{ExternalLoader, LoaderBatchProcessor, LoaderCredentials};
use crate::engine::reconcile_processor::ReconcileProcessor;
use crate::engine::result_aggregator::ResultAggregator;
use crate::importer::{
    validate_upload, CsvWriter, FieldMapper, FileParser, ImportError, ParsedSheet,
    TabularWriter, UniversalFileParser,
};
use crate::repository::{ImportRunRepository, InventoryStore};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

// ==========================================
// ImportService
// ==========================================
/// 导入服务
///
/// # 职责
/// 1. 对账导入: 文件 → 实体解析 + 数量对账 → 库存表
/// 2. 外部加载: 文件 → 分批写出 → 外部加载器
/// 3. 每次运行写入 import_run 历史
pub struct ImportService {
    store: Arc<dyn InventoryStore>,
    runs: Arc<ImportRunRepository>,
    parser: Arc<dyn FileParser>,
    writer: Arc<dyn TabularWriter>,
    settings: ImportSettings,
}

impl ImportService {
    pub fn new(
        store: Arc<dyn InventoryStore>,
        runs: Arc<ImportRunRepository>,
        settings: ImportSettings,
    ) -> Self {
        Self {
            store,
            runs,
            parser: Arc::new(UniversalFileParser),
            writer: Arc::new(CsvWriter),
            settings,
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn FileParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_writer(mut self, writer: Arc<dyn TabularWriter>) -> Self {
        self.writer = writer;
        self
    }

    pub fn settings(&self) -> &ImportSettings {
        &self.settings
    }

    fn orchestrator(&self) -> BatchOrchestrator {
        BatchOrchestrator::new(OrchestratorSettings::from(&self.settings))
    }

    fn aggregator(&self) -> ResultAggregator {
        ResultAggregator::new(self.settings.error_display_limit)
    }

    // ==========================================
    // 对账导入
    // ==========================================

    /// 文件对账导入（主入口）
    #[instrument(skip(self, cancel), fields(file = %file_path.display()))]
    pub async fn import_file(&self, file_path: &Path, cancel: CancellationToken) -> ImportReport {
        let started = Instant::now();
        let run_id = Uuid::new_v4().to_string();

        let report = match self.read_sheet(file_path) {
            Ok(sheet) => match FieldMapper::from_headers(&sheet.headers) {
                Ok(mapper) => {
                    let mapper = mapper.with_max_quantity(self.settings.max_quantity);
                    let total_rows = sheet.row_count();
                    let (records, rejected) = mapper.map_rows(&sheet.rows);
                    info!(
                        run_id = %run_id,
                        total_rows,
                        valid_rows = records.len(),
                        rejected = rejected.len(),
                        "文件解析完成"
                    );
                    self.reconcile_records(&run_id, total_rows, records, rejected, started, &cancel)
                        .await
                }
                Err(e) => self.startup_failure(&run_id, e, started),
            },
            Err(e) => self.startup_failure(&run_id, e, started),
        };

        self.record_run(&report, Some(file_path));
        report
    }

    /// 已映射记录的对账导入（不经文件）
    pub async fn import_records(
        &self,
        records: Vec<InputRecord>,
        cancel: CancellationToken,
    ) -> ImportReport {
        let started = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        let total_rows = records.len();
        let report = self
            .reconcile_records(&run_id, total_rows, records, Vec::new(), started, &cancel)
            .await;
        self.record_run(&report, None);
        report
    }

    async fn reconcile_records(
        &self,
        run_id: &str,
        total_rows: usize,
        records: Vec<InputRecord>,
        mut rejected: Vec<ErrorEntry>,
        started: Instant,
        cancel: &CancellationToken,
    ) -> ImportReport {
        let groups = self.bound_groups(RecordGroup::group_records(records), &mut rejected);
        let batches = partition(groups, self.settings.effective_batch_size());
        info!(run_id = %run_id, batches = batches.len(), "开始对账导入");

        let processor = ReconcileProcessor::new(Arc::clone(&self.store), &self.settings.created_by);
        let results = self.orchestrator().run(batches, &processor, cancel).await;

        let report = self.aggregator().aggregate(
            run_id,
            total_rows,
            rejected,
            results,
            started.elapsed(),
        );
        info!(
            run_id = %run_id,
            outcome = %report.outcome,
            persisted = report.persisted_rows,
            errors = report.error_count,
            "对账导入结束"
        );
        report
    }

    // ==========================================
    // 外部加载
    // ==========================================

    /// 通过外部加载器分批加载文件
    ///
    /// # 参数
    /// - loader: 外部加载器
    /// - credentials: 调用时显式传入的凭据
    /// - work_dir: 批次文件目录（None 时使用输入文件所在目录）
    #[instrument(skip(self, loader, credentials, cancel), fields(file = %file_path.display()))]
    pub async fn load_file_via_loader(
        &self,
        file_path: &Path,
        loader: Arc<dyn ExternalLoader>,
        credentials: LoaderCredentials,
        work_dir: Option<PathBuf>,
        cancel: CancellationToken,
    ) -> ImportReport {
        let started = Instant::now();
        let run_id = Uuid::new_v4().to_string();

        let report = match self.read_sheet(file_path) {
            Ok(sheet) => {
                let work_dir = work_dir.unwrap_or_else(|| {
                    file_path
                        .parent()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| PathBuf::from("."))
                });
                self.load_sheet(&run_id, sheet, loader, credentials, work_dir, started, &cancel)
                    .await
            }
            Err(e) => self.startup_failure(&run_id, e, started),
        };

        self.record_run(&report, Some(file_path));
        report
    }

    #[allow(clippy::too_many_arguments)]
    async fn load_sheet(
        &self,
        run_id: &str,
        sheet: ParsedSheet,
        loader: Arc<dyn ExternalLoader>,
        credentials: LoaderCredentials,
        work_dir: PathBuf,
        started: Instant,
        cancel: &CancellationToken,
    ) -> ImportReport {
        let total_rows = sheet.row_count();
        let processor = LoaderBatchProcessor::new(
            loader,
            Arc::clone(&self.writer),
            credentials,
            sheet.headers,
            work_dir,
            sheet.sheet_name,
        );
        let batches: Vec<_> = partition::<SourceRow>(sheet.rows, self.settings.effective_batch_size());
        info!(run_id = %run_id, total_rows, batches = batches.len(), "开始外部加载");

        let results = self.orchestrator().run(batches, &processor, cancel).await;
        self.aggregator().aggregate(
            run_id,
            total_rows,
            Vec::new(),
            results,
            started.elapsed(),
        )
    }

    // ==========================================
    // 内部辅助
    // ==========================================

    fn read_sheet(&self, file_path: &Path) -> Result<ParsedSheet, ImportError> {
        let size = validate_upload(file_path, &self.settings)?;
        info!(size, "上传校验通过");
        self.parser.parse(file_path)
    }

    /// 单行与分组数量之和都不得超过 max_quantity
    ///
    /// 超限分组的每一行记一条校验错误，整组不进入批次
    fn bound_groups(&self, groups: Vec<RecordGroup>, rejected: &mut Vec<ErrorEntry>) -> Vec<RecordGroup> {
        let limit = u64::from(self.settings.max_quantity);
        let (within, oversized): (Vec<_>, Vec<_>) = groups
            .into_iter()
            .partition(|g| g.desired_quantity() <= limit && g.records.iter().all(|r| u64::from(r.quantity) <= limit));

        for group in &oversized {
            let total = group.desired_quantity();
            warn!(group = %group.key, total, limit, "分组数量超出上限，整组拒绝");
            rejected.extend(group.records.iter().map(|r| {
                ErrorEntry::validation(
                    r.row_number,
                    format!("分组 {} 数量合计 {} 超出上限 {}", group.key, total, limit),
                )
            }));
        }
        within
    }

    fn startup_failure(&self, run_id: &str, e: ImportError, started: Instant) -> ImportReport {
        warn!(run_id = %run_id, error = %e, "导入无法开始");
        let entry = ErrorEntry {
            kind: ErrorKind::Validation,
            batch_index: None,
            row_number: None,
            message: e.to_string(),
        };
        self.aggregator().failure_report(run_id, entry, started.elapsed())
    }

    /// 写入运行历史（失败只记日志，不影响报告）
    fn record_run(&self, report: &ImportReport, source: Option<&Path>) {
        let report_json = match serde_json::to_string(report) {
            Ok(json) => json,
            Err(e) => {
                error!(run_id = %report.run_id, error = %e, "报告序列化失败");
                return;
            }
        };

        let run = ImportRun {
            run_id: report.run_id.clone(),
            source_file: source.map(|p| p.display().to_string()),
            operator: self.settings.created_by.clone(),
            outcome: report.outcome,
            total_rows: report.total_rows as i64,
            persisted_rows: report.persisted_rows as i64,
            error_count: report.error_count as i64,
            elapsed_ms: report.elapsed_ms as i64,
            report_json,
            started_at: Utc::now(),
        };

        if let Err(e) = self.runs.record_run(&run) {
            error!(run_id = %report.run_id, error = %e, "运行历史写入失败");
        }
    }
}
