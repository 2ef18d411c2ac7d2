pub mod local;
pub mod memory;
pub mod s3;
pub mod swift;

use crate::config::{EndpointConfig, StorageType};
use crate::error::StorageError;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use s3::S3Store;
pub use swift::SwiftStore;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- list, head, put container 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- get, put object 等，按单次读写计，大对象传输不受总时长限制
pub const IO_TIMEOUT_SECS: u64 = 300;
/// 建立连接超时（秒）
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// 列表中的单个对象
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectInfo {
    pub name: String,
    /// 内容摘要（ETag / MD5 十六进制）
    pub hash: String,
    pub bytes: u64,
}

/// head 对象返回的元数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    /// 远端报告的摘要；部分后端可能不提供
    pub hash: Option<String>,
}

/// 对象存储能力
///
/// 同步引擎只依赖这组操作。`head_container` / `head_object` 在目标不存在时
/// 必须返回 [`StorageError::NotFound`]，其他失败不能混用该变体，
/// 否则引擎会在瞬时错误时误建容器。
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// 列出账户下所有容器名
    async fn list_containers(&self) -> StorageResult<Vec<String>>;

    /// 列出容器内所有对象
    async fn list_objects(&self, container: &str) -> StorageResult<Vec<ObjectInfo>>;

    async fn head_container(&self, container: &str) -> StorageResult<()>;

    async fn put_container(&self, container: &str) -> StorageResult<()>;

    async fn head_object(&self, container: &str, name: &str) -> StorageResult<ObjectMeta>;

    /// 读取整个对象
    async fn get_object(&self, container: &str, name: &str) -> StorageResult<Bytes>;

    /// 写入整个对象，覆盖已有内容
    async fn put_object(&self, container: &str, name: &str, data: Bytes) -> StorageResult<()>;

    /// 检查容器是否存在（仅 NotFound 视为不存在）
    async fn container_exists(&self, container: &str) -> StorageResult<bool> {
        match self.head_container(container).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 规范化远端 ETag：去掉引号并转为小写
pub(crate) fn normalize_etag(raw: &str) -> String {
    raw.trim().trim_matches('"').to_ascii_lowercase()
}

/// 根据配置创建存储实例
pub async fn create_store(config: &EndpointConfig) -> Result<Arc<dyn ObjectStore>> {
    match config.typ {
        StorageType::Swift => {
            let auth_url = config.required("authUrl", config.authUrl.as_ref())?;
            let username = config.required("username", config.username.as_ref())?;
            let password = config.required("password", config.password.as_ref())?;
            let tenant_name = config.required("tenantName", config.tenantName.as_ref())?;
            let region = config.required("region", config.region.as_ref())?;
            tracing::info!("初始化 Swift 存储: auth={}, tenant={}, region={}", auth_url, tenant_name, region);
            Ok(Arc::new(SwiftStore::new(
                auth_url,
                username,
                password,
                tenant_name,
                region,
            )?) as Arc<dyn ObjectStore>)
        }
        StorageType::S3 => {
            let bucket = config.required("bucket", config.bucket.as_ref())?;
            let region = config.required("region", config.region.as_ref())?;
            let access_key = config.required("accessKey", config.accessKey.as_ref())?;
            let secret_key = config.required("secretKey", config.secretKey.as_ref())?;
            tracing::info!("初始化 S3 存储: bucket={}, region={}", bucket, region);
            Ok(Arc::new(S3Store::new(
                bucket,
                region,
                access_key,
                secret_key,
                config.endpoint.clone(),
            )?) as Arc<dyn ObjectStore>)
        }
        StorageType::Local => {
            let path = config.required("path", config.path.as_ref())?;
            tracing::info!("初始化本地存储: {}", path);
            Ok(Arc::new(LocalStore::new(path)?) as Arc<dyn ObjectStore>)
        }
    }
}
