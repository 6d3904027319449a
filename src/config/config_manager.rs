// ==========================================
// 仓储导入对账系统 - 配置管理器
// ==========================================
// 职责: 配置加载、查询、覆写管理
// 存储: config_kv 表 (key-value + scope)
// ==========================================

use crate::config::import_config::{ImportSettings, RetryBackoff};
use crate::config::import_config_trait::ImportConfigReader;
use crate::db::open_and_init;
use crate::repository::error::{RepositoryError, RepositoryResult};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ==========================================
// ConfigManager - 配置管理器
// ==========================================
pub struct ConfigManager {
    conn: Arc<Mutex<Connection>>,
}

impl ConfigManager {
    /// 创建新的 ConfigManager 实例
    ///
    /// # 参数
    /// - db_path: 数据库文件路径
    pub fn new(db_path: &str) -> RepositoryResult<Self> {
        let conn = open_and_init(db_path)
            .map_err(|e| RepositoryError::DatabaseConnectionError(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 从已有连接创建 ConfigManager
    ///
    /// 说明：为保证连接行为一致，会对传入连接再次应用统一 PRAGMA（幂等）。
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> RepositoryResult<Self> {
        {
            let guard = conn
                .lock()
                .map_err(|e| RepositoryError::LockError(e.to_string()))?;
            crate::db::configure_sqlite_connection(&guard)?;
        }

        Ok(Self { conn })
    }

    /// 从 config_kv 表读取配置值（scope_id='global'）
    ///
    /// # 返回
    /// - Some(String): 配置值
    /// - None: 配置不存在
    pub fn get_config_value(&self, key: &str) -> RepositoryResult<Option<String>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))?;

        let result = conn.query_row(
            "SELECT value FROM config_kv WHERE scope_id = 'global' AND key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// 写入 global scope 配置（UPSERT）
    pub fn set_config_value(&self, key: &str, value: &str) -> RepositoryResult<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))?;

        conn.execute(
            "INSERT INTO config_kv (scope_id, key, value, updated_at) \
             VALUES ('global', ?1, ?2, datetime('now')) \
             ON CONFLICT(scope_id, key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
            params![key, value],
        )?;
        Ok(())
    }

    /// 获取所有 global 配置的快照
    pub fn get_config_snapshot(&self) -> RepositoryResult<HashMap<String, String>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))?;

        let mut stmt =
            conn.prepare("SELECT key, value FROM config_kv WHERE scope_id = 'global' ORDER BY key")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut map = HashMap::new();
        for row in rows {
            let (key, value) = row?;
            map.insert(key, value);
        }
        Ok(map)
    }

    /// 读取并解析配置值；缺失或无法解析时回退默认值
    fn get_parsed_or<T>(&self, key: &str, default: T) -> RepositoryResult<T>
    where
        T: FromStr,
    {
        let Some(raw) = self.get_config_value(key)? else {
            return Ok(default);
        };
        match raw.trim().parse::<T>() {
            Ok(v) => Ok(v),
            Err(_) => {
                tracing::warn!(config_key = key, raw_value = %raw, "配置值无法解析，使用默认值");
                Ok(default)
            }
        }
    }
}

// ==========================================
// ImportConfigReader Trait 实现
// ==========================================
#[async_trait]
impl ImportConfigReader for ConfigManager {
    // ===== 批次 =====

    async fn get_batch_size(&self) -> RepositoryResult<usize> {
        let d = ImportSettings::default();
        let v = self.get_parsed_or(config_keys::BATCH_SIZE, d.batch_size)?;
        Ok(if v == 0 { d.batch_size } else { v })
    }

    async fn get_max_batch_size(&self) -> RepositoryResult<usize> {
        let d = ImportSettings::default();
        let v = self.get_parsed_or(config_keys::MAX_BATCH_SIZE, d.max_batch_size)?;
        Ok(if v == 0 { d.max_batch_size } else { v })
    }

    // ===== 重试 =====

    async fn get_max_retries(&self) -> RepositoryResult<u32> {
        let v = self.get_parsed_or(config_keys::MAX_RETRIES, ImportSettings::default().max_retries)?;
        Ok(v.max(1))
    }

    async fn get_retry_delay(&self) -> RepositoryResult<Duration> {
        let ms = self.get_parsed_or(config_keys::RETRY_DELAY_MS, 5_000u64)?;
        Ok(Duration::from_millis(ms))
    }

    async fn get_retry_backoff(&self) -> RepositoryResult<RetryBackoff> {
        Ok(self
            .get_config_value(config_keys::RETRY_BACKOFF)?
            .and_then(|v| RetryBackoff::parse(&v))
            .unwrap_or_default())
    }

    async fn get_attempt_timeout(&self) -> RepositoryResult<Duration> {
        let secs = self.get_parsed_or(config_keys::ATTEMPT_TIMEOUT_SECS, 300u64)?;
        Ok(Duration::from_secs(secs.max(1)))
    }

    // ===== 节流与并行 =====

    async fn get_pacing_delay(&self) -> RepositoryResult<Duration> {
        let ms = self.get_parsed_or(config_keys::PACING_DELAY_MS, 1_000u64)?;
        Ok(Duration::from_millis(ms))
    }

    async fn get_parallel_processing(&self) -> RepositoryResult<bool> {
        let raw = self.get_config_value(config_keys::PARALLEL_PROCESSING)?;
        Ok(matches!(
            raw.as_deref().map(|v| v.trim().to_lowercase()).as_deref(),
            Some("true") | Some("1") | Some("yes")
        ))
    }

    async fn get_max_parallel_batches(&self) -> RepositoryResult<usize> {
        let v = self.get_parsed_or(
            config_keys::MAX_PARALLEL_BATCHES,
            ImportSettings::default().max_parallel_batches,
        )?;
        Ok(v.max(1))
    }

    // ===== 上传限制 =====

    async fn get_max_file_size_mb(&self) -> RepositoryResult<u64> {
        self.get_parsed_or(
            config_keys::MAX_FILE_SIZE_MB,
            ImportSettings::default().max_file_size_mb,
        )
    }

    async fn get_allowed_extensions(&self) -> RepositoryResult<Vec<String>> {
        let raw = self.get_config_value(config_keys::ALLOWED_EXTENSIONS)?;
        let exts: Vec<String> = raw
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        if exts.is_empty() {
            Ok(ImportSettings::default().allowed_extensions)
        } else {
            Ok(exts)
        }
    }

    async fn get_max_quantity(&self) -> RepositoryResult<u32> {
        let v = self.get_parsed_or(
            config_keys::MAX_QUANTITY,
            ImportSettings::default().max_quantity,
        )?;
        Ok(v.max(1))
    }

    async fn get_error_display_limit(&self) -> RepositoryResult<usize> {
        self.get_parsed_or(
            config_keys::ERROR_DISPLAY_LIMIT,
            ImportSettings::default().error_display_limit,
        )
    }
}

// ==========================================
// 配置键常量
// ==========================================
pub mod config_keys {
    // 批次
    pub const BATCH_SIZE: &str = "import.batch_size";
    pub const MAX_BATCH_SIZE: &str = "import.max_batch_size";

    // 重试
    pub const MAX_RETRIES: &str = "import.max_retries";
    pub const RETRY_DELAY_MS: &str = "import.retry_delay_ms";
    pub const RETRY_BACKOFF: &str = "import.retry_backoff";
    pub const ATTEMPT_TIMEOUT_SECS: &str = "import.attempt_timeout_secs";

    // 节流与并行
    pub const PACING_DELAY_MS: &str = "import.pacing_delay_ms";
    pub const PARALLEL_PROCESSING: &str = "import.parallel_processing";
    pub const MAX_PARALLEL_BATCHES: &str = "import.max_parallel_batches";

    // 上传
    pub const MAX_FILE_SIZE_MB: &str = "upload.max_file_size_mb";
    pub const ALLOWED_EXTENSIONS: &str = "upload.allowed_extensions";

    // 数量
    pub const MAX_QUANTITY: &str = "import.max_quantity";

    // 报告
    pub const ERROR_DISPLAY_LIMIT: &str = "report.error_display_limit";
}
