// ==========================================
// 仓储导入对账系统 - 命令行入口
// ==========================================
// 子命令:
// - import: 文件 → 实体解析 + 数量对账 → 数据库
// - load:   文件 → 分批写出 → 外部加载器
// - runs:   最近的导入运行历史
// 报告以 JSON 输出到 stdout，日志输出到 stderr
// ==========================================

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use warehouse_import::db::get_default_db_path;
use warehouse_import::{
    logging, CommandLoader, ImportApi, ImportOutcome, ImportReport, ImportSettings,
    LoaderCredentials, RetryBackoff,
};

#[derive(Parser)]
#[command(name = "warehouse-import", about = "仓储导入对账系统", version)]
struct Cli {
    /// SQLite 数据库路径
    #[arg(long, global = true, env = "WAREHOUSE_IMPORT_DB_PATH")]
    db: Option<String>,

    /// 日志以 JSON 格式输出
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 导入并对账库存
    Import(ImportArgs),
    /// 经外部加载器分批加载
    Load(LoadArgs),
    /// 查看导入运行历史
    Runs(RunsArgs),
}

#[derive(Args)]
struct ImportArgs {
    /// 输入文件（.xlsx/.xls/.csv）
    file: PathBuf,

    #[command(flatten)]
    settings: SettingsArgs,
}

#[derive(Args)]
struct LoadArgs {
    /// 输入文件（.xlsx/.xls/.csv）
    file: PathBuf,

    /// 外部加载器程序
    #[arg(long, env = "WAREHOUSE_LOADER_PROGRAM")]
    loader: PathBuf,

    /// 加载器参数模板，可多次指定；占位符: {user} {password} {file} {sheet}
    #[arg(long = "loader-arg", allow_hyphen_values = true)]
    loader_args: Vec<String>,

    #[arg(long, env = "WAREHOUSE_LOADER_USER")]
    user: String,

    #[arg(long, env = "WAREHOUSE_LOADER_PASSWORD", hide_env_values = true)]
    password: String,

    /// 批次文件目录（默认为输入文件所在目录）
    #[arg(long)]
    work_dir: Option<PathBuf>,

    #[command(flatten)]
    settings: SettingsArgs,
}

#[derive(Args)]
struct RunsArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,

    /// 查看单次运行的完整报告
    #[arg(long)]
    run_id: Option<String>,
}

/// 覆写 config_kv 中的配置
#[derive(Args, Default)]
struct SettingsArgs {
    #[arg(long)]
    batch_size: Option<usize>,

    /// 每批次总尝试次数
    #[arg(long)]
    max_retries: Option<u32>,

    #[arg(long)]
    retry_delay_ms: Option<u64>,

    #[arg(long, value_parser = parse_backoff)]
    retry_backoff: Option<RetryBackoff>,

    #[arg(long)]
    timeout_secs: Option<u64>,

    #[arg(long)]
    pacing_ms: Option<u64>,

    #[arg(long, action = ArgAction::SetTrue)]
    parallel: bool,

    #[arg(long)]
    max_parallel: Option<usize>,

    /// 单行/单分组数量上限
    #[arg(long)]
    max_quantity: Option<u32>,

    /// 写入 created_by 的操作人
    #[arg(long)]
    operator: Option<String>,
}

fn parse_backoff(s: &str) -> Result<RetryBackoff, String> {
    RetryBackoff::parse(s).ok_or_else(|| format!("未知的退避策略: {} (fixed/linear/exponential)", s))
}

impl SettingsArgs {
    fn apply(&self, mut settings: ImportSettings) -> ImportSettings {
        if let Some(v) = self.batch_size {
            settings.batch_size = v;
        }
        if let Some(v) = self.max_retries {
            settings.max_retries = v;
        }
        if let Some(v) = self.retry_delay_ms {
            settings.retry_delay = Duration::from_millis(v);
        }
        if let Some(v) = self.retry_backoff {
            settings.retry_backoff = v;
        }
        if let Some(v) = self.timeout_secs {
            settings.attempt_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.pacing_ms {
            settings.pacing_delay = Duration::from_millis(v);
        }
        if self.parallel {
            settings.parallel_processing = true;
        }
        if let Some(v) = self.max_parallel {
            settings.max_parallel_batches = v;
        }
        if let Some(v) = self.max_quantity {
            settings.max_quantity = v.max(1);
        }
        if let Some(v) = &self.operator {
            settings.created_by = v.clone();
        }
        settings
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.log_json {
        logging::init_json();
    } else {
        logging::init();
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("错误: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let db_path = cli.db.unwrap_or_else(get_default_db_path);
    info!("{} v{}", warehouse_import::APP_NAME, warehouse_import::VERSION);
    let api = ImportApi::new(&db_path).context("无法打开数据库")?;

    match cli.command {
        Commands::Import(args) => {
            let settings = args.settings.apply(api.load_settings().await?);
            let cancel = cancel_on_ctrl_c();
            let report = api.import_file(&args.file, settings, cancel).await;
            print_report(&report)
        }
        Commands::Load(args) => {
            let settings = args.settings.apply(api.load_settings().await?);
            let loader = Arc::new(CommandLoader::new(&args.loader, args.loader_args));
            let credentials = LoaderCredentials::new(args.user, args.password);
            let cancel = cancel_on_ctrl_c();
            let report = api
                .load_file(&args.file, settings, loader, credentials, args.work_dir, cancel)
                .await;
            print_report(&report)
        }
        Commands::Runs(args) => {
            match args.run_id {
                Some(run_id) => {
                    let run = api.get_run(&run_id)?;
                    let report: serde_json::Value = serde_json::from_str(&run.report_json)
                        .context("运行报告无法解析")?;
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                None => {
                    let runs = api.list_runs(args.limit)?;
                    println!("{}", serde_json::to_string_pretty(&runs)?);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Ctrl-C 触发运行的取消令牌
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，正在取消导入（已完成批次保留）");
            child.cancel();
        }
    });
    token
}

fn print_report(report: &ImportReport) -> Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(match report.outcome {
        ImportOutcome::Success => ExitCode::SUCCESS,
        ImportOutcome::PartialSuccess => ExitCode::from(2),
        ImportOutcome::Failure => ExitCode::FAILURE,
        ImportOutcome::Cancelled => ExitCode::from(130),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_override_settings() {
        let cli = Cli::parse_from([
            "warehouse-import",
            "import",
            "inventory.csv",
            "--batch-size",
            "200",
            "--retry-backoff",
            "exponential",
            "--parallel",
        ]);
        let Commands::Import(args) = cli.command else {
            panic!("expected import");
        };
        let settings = args.settings.apply(ImportSettings::default());
        assert_eq!(settings.batch_size, 200);
        assert_eq!(settings.retry_backoff, RetryBackoff::Exponential);
        assert!(settings.parallel_processing);
        assert_eq!(settings.max_retries, 3);
    }
}
