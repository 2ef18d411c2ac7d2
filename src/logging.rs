//! 日志模块：控制台输出 + 按大小轮转的文件日志

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// 日志文件名
pub const LOG_FILE_NAME: &str = "objsync.log";

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否写日志文件
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
    /// 单个日志文件的最大大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 日志目录，未设置时使用当前目录下的 `logs`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            level: default_level(),
            max_size_mb: default_max_size_mb(),
            dir: None,
        }
    }
}

impl LogConfig {
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| PathBuf::from("logs"))
    }
}

struct RotatingFile {
    path: PathBuf,
    max_size: u64,
    file: Option<File>,
}

impl RotatingFile {
    fn open(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    /// `objsync.log` -> `objsync.log.old`，旧备份被覆盖
    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut f) = self.file.take() {
            let _ = f.flush();
        }
        let backup = backup_path(&self.path);
        if backup.exists() {
            fs::remove_file(&backup)?;
        }
        fs::rename(&self.path, &backup)?;
        self.file = Some(Self::open(&self.path)?);
        Ok(())
    }

    fn current_len(&self) -> u64 {
        self.file
            .as_ref()
            .and_then(|f| f.metadata().ok())
            .map_or(0, |m| m.len())
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".old");
    PathBuf::from(name)
}

/// 带大小限制的日志写入器
#[derive(Clone)]
pub struct SizeRotatingWriter {
    inner: Arc<Mutex<RotatingFile>>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let path = log_dir.join(LOG_FILE_NAME);
        let max_size = u64::from(max_size_mb.max(1)) * 1024 * 1024;
        let mut rotating = RotatingFile {
            file: Some(RotatingFile::open(&path)?),
            path,
            max_size,
        };
        // 启动时文件已超限则先轮转
        if rotating.current_len() > max_size {
            rotating.rotate()?;
        }

        Ok(Self {
            inner: Arc::new(Mutex::new(rotating)),
        })
    }

    #[cfg(test)]
    fn with_max_bytes(log_dir: &Path, max_size: u64) -> io::Result<Self> {
        let writer = Self::new(log_dir, 1)?;
        lock(&writer.inner).max_size = max_size;
        Ok(writer)
    }
}

// 日志线程 panic 后仍可继续写
fn lock(inner: &Mutex<RotatingFile>) -> MutexGuard<'_, RotatingFile> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 单次写入的句柄
pub struct LogWriter {
    inner: Arc<Mutex<RotatingFile>>,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = lock(&self.inner);
        let written = match guard.file.as_mut() {
            Some(f) => f.write(buf)?,
            None => return Err(io::Error::new(io::ErrorKind::Other, "log file not available")),
        };
        if guard.current_len() > guard.max_size {
            guard.rotate()?;
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match lock(&self.inner).file.as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for SizeRotatingWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            inner: self.inner.clone(),
        }
    }
}

fn directive(s: &str) -> Result<Directive> {
    s.parse().with_context(|| format!("无效的日志过滤指令: {}", s))
}

/// 初始化日志系统
///
/// `RUST_LOG` 优先；未设置时使用配置中的级别。HTTP 相关的库固定为 warn。
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(config.tracing_level().into())
        .from_env_lossy()
        .add_directive(directive("hyper=warn")?)
        .add_directive(directive("reqwest=warn")?)
        .add_directive(directive("opendal=warn")?);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false);

    let file_layer = if config.enabled {
        let dir = config.log_dir();
        let writer = SizeRotatingWriter::new(&dir, config.max_size_mb)
            .with_context(|| format!("创建日志目录失败: {}", dir.display()))?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("日志系统已初始化")?;

    Ok(())
}
