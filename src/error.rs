//! 错误类型
//!
//! 存储层与传输层使用带类型的错误，编排层（引擎、入口）使用 anyhow。

use std::path::PathBuf;
use thiserror::Error;

/// 存储能力返回的错误
#[derive(Error, Debug)]
pub enum StorageError {
    /// 容器或对象不存在（用于判断是否需要创建目标容器）
    #[error("not found: {0}")]
    NotFound(String),

    /// 认证失败
    #[error("authentication failed: {0}")]
    Auth(String),

    /// 服务端返回了非预期的 HTTP 状态
    #[error("unexpected status {status} for {target}")]
    Http { status: u16, target: String },

    /// 网络错误（连接、超时等）
    #[error("network error: {0}")]
    Network(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// 后端配置错误
    #[error("storage configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) if status == reqwest::StatusCode::NOT_FOUND => {
                StorageError::NotFound(e.url().map(|u| u.to_string()).unwrap_or_default())
            }
            Some(status) => StorageError::Http {
                status: status.as_u16(),
                target: e.url().map(|u| u.to_string()).unwrap_or_default(),
            },
            None => StorageError::Network(e.to_string()),
        }
    }
}

impl From<opendal::Error> for StorageError {
    fn from(e: opendal::Error) -> Self {
        match e.kind() {
            opendal::ErrorKind::NotFound => StorageError::NotFound(e.to_string()),
            opendal::ErrorKind::PermissionDenied => StorageError::Auth(e.to_string()),
            opendal::ErrorKind::ConfigInvalid => StorageError::Config(e.to_string()),
            _ => StorageError::Other(e.to_string()),
        }
    }
}

/// 单个对象传输过程中的错误，由重试控制器处理
#[derive(Error, Debug)]
pub enum TransferError {
    /// 从源下载失败
    #[error("download of {container}/{object} failed: {source}")]
    Download {
        container: String,
        object: String,
        #[source]
        source: StorageError,
    },

    /// 下载后的本地文件 MD5 与源端不一致
    #[error("checksum mismatch for {container}/{object}: expected {expected}, got {actual}")]
    Verification {
        container: String,
        object: String,
        expected: String,
        actual: String,
    },

    /// 上传到目标失败
    #[error("upload of {container}/{object} failed: {source}")]
    Upload {
        container: String,
        object: String,
        #[source]
        source: StorageError,
    },

    /// 确保目标容器存在时失败
    #[error("cannot ensure destination container {container}: {source}")]
    Container {
        container: String,
        #[source]
        source: StorageError,
    },

    /// 对象名会逃出暂存目录
    #[error("object name {0:?} cannot be mirrored under the staging directory")]
    InvalidName(String),

    /// 本地暂存文件读写失败
    #[error("staging io error at {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TransferError {
    pub(crate) fn staging(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TransferError::Staging {
            path: path.into(),
            source,
        }
    }
}
