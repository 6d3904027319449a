// ==========================================
// 仓储导入对账系统 - 导入API
// ==========================================
// 职责: 对外门面，组装 连接 → 配置 → 存储 → 导入服务
// 说明: 同一 ImportApi 内所有组件共享一个 SQLite 连接
// ==========================================

use crate::api::error::{ApiError, ApiResult};
use crate::config::{ConfigManager, ImportConfigReader, ImportSettings};
use crate::db::open_and_init;
use crate::domain::{ImportReport, ImportRun};
use crate::engine::{ExternalLoader, ImportService, LoaderCredentials};
use crate::repository::{ImportRunRepository, SqliteInventoryStore};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// 历史查询的最大条数
pub const MAX_RUN_LIST_LIMIT: usize = 500;

/// 导入API
pub struct ImportApi {
    conn: Arc<Mutex<Connection>>,
    config: ConfigManager,
    runs: Arc<ImportRunRepository>,
}

impl ImportApi {
    /// 打开（必要时创建）数据库
    pub fn new(db_path: &str) -> ApiResult<Self> {
        let conn = open_and_init(db_path)
            .map_err(|e| ApiError::DatabaseConnectionError(format!("{}: {}", db_path, e)))?;
        info!(db_path, "数据库已就绪");
        Self::from_connection(Arc::new(Mutex::new(conn)))
    }

    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> ApiResult<Self> {
        let config = ConfigManager::from_connection(Arc::clone(&conn))?;
        let runs = Arc::new(ImportRunRepository::new(Arc::clone(&conn)));
        Ok(Self { conn, config, runs })
    }

    // ==========================================
    // 配置
    // ==========================================

    /// 读取导入配置（config_kv 覆写 + 默认值）
    pub async fn load_settings(&self) -> ApiResult<ImportSettings> {
        Ok(self.config.load_import_settings().await?)
    }

    pub fn set_config_value(&self, key: &str, value: &str) -> ApiResult<()> {
        if key.trim().is_empty() {
            return Err(ApiError::InvalidInput("配置键不能为空".to_string()));
        }
        Ok(self.config.set_config_value(key, value)?)
    }

    fn service(&self, settings: ImportSettings) -> ImportService {
        let store = Arc::new(SqliteInventoryStore::from_connection(Arc::clone(&self.conn)));
        ImportService::new(store, Arc::clone(&self.runs), settings)
    }

    // ==========================================
    // 导入
    // ==========================================

    /// 文件对账导入
    ///
    /// # 返回
    /// 始终返回报告；文件不可读、全部批次失败等都体现在 outcome 中
    pub async fn import_file(
        &self,
        file_path: &Path,
        settings: ImportSettings,
        cancel: CancellationToken,
    ) -> ImportReport {
        self.service(settings).import_file(file_path, cancel).await
    }

    /// 经外部加载器分批加载
    pub async fn load_file(
        &self,
        file_path: &Path,
        settings: ImportSettings,
        loader: Arc<dyn ExternalLoader>,
        credentials: LoaderCredentials,
        work_dir: Option<PathBuf>,
        cancel: CancellationToken,
    ) -> ImportReport {
        self.service(settings)
            .load_file_via_loader(file_path, loader, credentials, work_dir, cancel)
            .await
    }

    // ==========================================
    // 运行历史
    // ==========================================

    pub fn list_runs(&self, limit: usize) -> ApiResult<Vec<ImportRun>> {
        if limit == 0 || limit > MAX_RUN_LIST_LIMIT {
            return Err(ApiError::InvalidInput(format!(
                "limit 应在 1-{} 之间: {}",
                MAX_RUN_LIST_LIMIT, limit
            )));
        }
        Ok(self.runs.list_recent(limit)?)
    }

    pub fn get_run(&self, run_id: &str) -> ApiResult<ImportRun> {
        self.runs
            .find_by_id(run_id)?
            .ok_or_else(|| ApiError::NotFound(format!("导入运行 {}", run_id)))
    }
}
