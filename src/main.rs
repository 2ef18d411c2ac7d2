use anyhow::Result;
use clap::Parser;
use objsync::logging::{init_logging, LogConfig};
use objsync::{prepare_request, AppConfig, SyncConfig, SyncEngine, SyncReport, SyncStatus};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

/// 将源对象存储账户单向复制到目标账户
#[derive(Debug, Parser)]
#[command(name = "objsync", version, about)]
struct Cli {
    /// 配置文件路径
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// 容器名过滤（正则），覆盖配置文件中的 prefix
    #[arg(long)]
    prefix: Option<String>,

    /// 本地暂存目录，覆盖配置文件中的 localPath
    #[arg(long)]
    local_path: Option<String>,

    /// 只列出需要传输的内容，不传输
    #[arg(long)]
    dry_run: bool,
}

const EXIT_FATAL: u8 = 1;
const EXIT_PARTIAL: u8 = 2;
/// 128 + SIGINT
const EXIT_CANCELLED: u8 = 130;

fn status_code(status: SyncStatus) -> u8 {
    match status {
        SyncStatus::UpToDate | SyncStatus::Completed => 0,
        SyncStatus::CompletedWithFailures => EXIT_PARTIAL,
        SyncStatus::Cancelled => EXIT_CANCELLED,
    }
}

fn exit_code(report: &SyncReport) -> ExitCode {
    ExitCode::from(status_code(report.status))
}

/// Ctrl-C 时请求取消：不再调度新对象，进行中的传输完成后返回报告
fn cancel_on_ctrl_c(engine: Arc<SyncEngine>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("收到中断信号，等待进行中的传输完成后退出");
                engine.cancel();
            }
            Err(e) => error!("无法监听中断信号: {}", e),
        }
    })
}

async fn run(cli: Cli, mut config: AppConfig) -> Result<ExitCode> {
    if let Some(prefix) = cli.prefix {
        config.prefix = prefix;
    }
    if let Some(local_path) = cli.local_path {
        config.localPath = local_path;
    }

    let request = prepare_request(&config).await?;
    let engine = Arc::new(SyncEngine::with_config(SyncConfig::from(&config.transfer)));

    if cli.dry_run {
        let plan = engine.plan(&request).await?;
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(ExitCode::SUCCESS);
    }

    let signal = cancel_on_ctrl_c(engine.clone());
    let result = engine.run_sync(&request, None).await;
    signal.abort();

    let report = result?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(exit_code(&report))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match AppConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            let _ = init_logging(&LogConfig {
                enabled: false,
                ..LogConfig::default()
            });
            error!("{:#}", e);
            return ExitCode::from(EXIT_FATAL);
        }
    };

    if let Err(e) = init_logging(&config.log) {
        eprintln!("初始化日志失败: {:#}", e);
    }
    info!("objsync v{}", env!("CARGO_PKG_VERSION"));

    match run(cli, config).await {
        Ok(code) => code,
        Err(e) => {
            error!("同步失败: {:#}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}
