// ==========================================
// 外部加载器集成测试
// ==========================================
// 测试目标: 文件 → 分批写出 → 外部加载器 → 错误描述文件 → 报告
// ==========================================


use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_helpers::*;
use tokio_util::sync::CancellationToken;
use warehouse_import::engine::{BatchError, BatchResultOf};
use warehouse_import::{ExternalLoader, ImportApi, ImportOutcome, LoaderCredentials};

const CI_HEADER: &str = "Name,Class,Serial";

fn ci_lines(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("CI-{:03},Server,SN{:03}", i, i)).collect()
}

/// 拒绝指定名称并写出错误描述文件的模拟加载器
struct RejectingLoader {
    reject: Vec<String>,
    batches: Mutex<Vec<String>>,
}

#[async_trait]
impl ExternalLoader for RejectingLoader {
    async fn load(
        &self,
        credentials: &LoaderCredentials,
        input_file: &Path,
        sheet_name: &str,
        _cancel: CancellationToken,
    ) -> BatchResultOf<String> {
        assert_eq!(credentials.username, "loader");
        assert_eq!(sheet_name, "cis");

        let content = std::fs::read_to_string(input_file).unwrap();
        self.batches.lock().unwrap().push(content.clone());

        let rejected: String = self
            .reject
            .iter()
            .filter(|name| content.contains(name.as_str()))
            .map(|name| format!("<ci><name>{}</name><class>Server</class></ci>", name))
            .collect();
        if !rejected.is_empty() {
            let stem = input_file.file_stem().unwrap().to_str().unwrap();
            let err = input_file.with_file_name(format!("{}_err.xml", stem));
            std::fs::write(err, format!("<GRLoader>{}</GRLoader>", rejected)).unwrap();
        }
        Ok(format!("loaded {}", input_file.display()))
    }
}

#[tokio::test]
async fn test_loader_rejections_become_error_entries() {
    let (_db, db_path) = create_test_db().expect("Failed to create test db");
    let dir = tempfile::tempdir().unwrap();
    let work_dir = dir.path().join("work");
    let api = ImportApi::new(&db_path).unwrap();

    let lines = ci_lines(25);
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let file = write_csv(dir.path(), "cis.csv", CI_HEADER, &refs);

    let loader = Arc::new(RejectingLoader {
        reject: vec!["CI-003".to_string(), "CI-021".to_string()],
        batches: Mutex::new(Vec::new()),
    });
    let settings = warehouse_import::ImportSettings {
        batch_size: 10,
        ..fast_settings()
    };

    let report = api
        .load_file(
            &file,
            settings,
            loader.clone(),
            LoaderCredentials::new("loader", "secret"),
            Some(work_dir.clone()),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(report.outcome, ImportOutcome::PartialSuccess);
    assert_eq!(report.batch_count, 3);
    assert_eq!(report.total_rows, 25);
    assert_eq!(report.persisted_rows, 23);
    assert_eq!(report.failed_rows, 2);
    assert_eq!(report.errors[0].message, "CI-003 (Server)");
    assert_eq!(report.errors[0].batch_index, Some(1));
    assert_eq!(report.errors[1].batch_index, Some(3));

    let batches = loader.batches.lock().unwrap();
    assert_eq!(batches.len(), 3);
    assert!(batches[0].starts_with("Name,Class,Serial\nCI-000,Server,SN000\n"));

    // 批次临时文件全部清理
    let leftovers: Vec<_> = std::fs::read_dir(&work_dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.path().is_file())
        .collect();
    assert!(leftovers.is_empty());
}

/// 始终失败的加载器
struct BrokenLoader;

#[async_trait]
impl ExternalLoader for BrokenLoader {
    async fn load(
        &self,
        _credentials: &LoaderCredentials,
        _input_file: &Path,
        _sheet_name: &str,
        _cancel: CancellationToken,
    ) -> BatchResultOf<String> {
        Err(BatchError::ExternalProcessing("loader exited with code 2".into()))
    }
}

#[tokio::test]
async fn test_loader_failure_exhausts_retries() {
    let (_db, db_path) = create_test_db().expect("Failed to create test db");
    let dir = tempfile::tempdir().unwrap();
    let api = ImportApi::new(&db_path).unwrap();

    let lines = ci_lines(4);
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let file = write_csv(dir.path(), "cis.csv", CI_HEADER, &refs);

    let settings = warehouse_import::ImportSettings {
        max_retries: 2,
        ..fast_settings()
    };
    let report = api
        .load_file(
            &file,
            settings,
            Arc::new(BrokenLoader),
            LoaderCredentials::new("loader", "secret"),
            None,
            CancellationToken::new(),
        )
        .await;

    assert_eq!(report.outcome, ImportOutcome::Failure);
    assert_eq!(report.failed_rows, 4);
    assert_eq!(report.error_count, 4);
    assert_eq!(report.batches[0].attempts, 2);
    assert!(report.errors[0].message.starts_with("2 次尝试后仍失败"));
}

/// 长时间运行、只响应取消的加载器
struct SlowLoader;

#[async_trait]
impl ExternalLoader for SlowLoader {
    async fn load(
        &self,
        _credentials: &LoaderCredentials,
        _input_file: &Path,
        _sheet_name: &str,
        cancel: CancellationToken,
    ) -> BatchResultOf<String> {
        tokio::select! {
            _ = cancel.cancelled() => Err(BatchError::Cancelled),
            _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(String::new()),
        }
    }
}

#[tokio::test]
async fn test_cancel_stops_inflight_loader() {
    let (_db, db_path) = create_test_db().expect("Failed to create test db");
    let dir = tempfile::tempdir().unwrap();
    let api = ImportApi::new(&db_path).unwrap();

    let lines = ci_lines(3);
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let file = write_csv(dir.path(), "cis.csv", CI_HEADER, &refs);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let report = api
        .load_file(
            &file,
            fast_settings(),
            Arc::new(SlowLoader),
            LoaderCredentials::new("loader", "secret"),
            None,
            cancel,
        )
        .await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(report.outcome, ImportOutcome::Cancelled);
    assert_eq!(report.unprocessed_rows, 3);
    assert!(!dir.path().join("cis_batch_0001.csv").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_command_loader_error_file_round_trip() {
    use warehouse_import::CommandLoader;

    let (_db, db_path) = create_test_db().expect("Failed to create test db");
    let dir = tempfile::tempdir().unwrap();
    let api = ImportApi::new(&db_path).unwrap();

    let lines = ci_lines(2);
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let file = write_csv(dir.path(), "cis.csv", CI_HEADER, &refs);

    // 加载器把第一条记录写入错误描述文件
    let script = r#"f="{file}"; printf '<GRLoader><ci><name>CI-000</name><class>Server</class></ci></GRLoader>' > "${f%.*}_err.xml""#;
    let loader = Arc::new(CommandLoader::new("sh", vec!["-c".to_string(), script.to_string()]));

    let report = api
        .load_file(
            &file,
            fast_settings(),
            loader,
            LoaderCredentials::new("loader", "secret"),
            None,
            CancellationToken::new(),
        )
        .await;

    assert_eq!(report.outcome, ImportOutcome::PartialSuccess);
    assert_eq!(report.persisted_rows, 1);
    assert_eq!(report.errors[0].message, "CI-000 (Server)");
}
