use super::{
    normalize_etag, ObjectInfo, ObjectMeta, ObjectStore, StorageResult, IO_TIMEOUT_SECS,
    OP_TIMEOUT_SECS,
};
use crate::error::StorageError;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use opendal::{layers::TimeoutLayer, Metakey, Operator};
use std::time::Duration;

/// S3 桶作为对象存储账户：桶内一级前缀是容器
///
/// 单次 PUT 上传的对象 ETag 即内容 MD5，分片上传的对象 ETag 不是 MD5，
/// 这类对象每次都会被判定为不一致并在下载校验时失败。
pub struct S3Store {
    operator: Operator,
    name: String,
}

impl S3Store {
    pub fn new(
        bucket: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        endpoint: Option<String>,
    ) -> Result<Self> {
        use opendal::services::S3;

        let mut builder = S3::default()
            .bucket(bucket)
            .region(region)
            .access_key_id(access_key)
            .secret_access_key(secret_key);

        if let Some(ref ep) = endpoint {
            builder = builder.endpoint(ep);
        }

        // 添加超时层
        let operator = Operator::new(builder)?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
            .finish();

        Ok(Self {
            operator,
            name: format!("s3://{}", bucket),
        })
    }

    fn prefix(container: &str) -> String {
        format!("{}/", container.trim_matches('/'))
    }

    fn key(container: &str, name: &str) -> String {
        format!("{}{}", Self::prefix(container), name.trim_start_matches('/'))
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list_containers(&self) -> StorageResult<Vec<String>> {
        let entries = self.operator.list("/").await?;
        let mut containers: Vec<String> = entries
            .iter()
            .map(|e| e.path())
            .filter(|p| p.ends_with('/'))
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty())
            .collect();
        containers.sort();
        containers.dedup();
        Ok(containers)
    }

    async fn list_objects(&self, container: &str) -> StorageResult<Vec<ObjectInfo>> {
        let prefix = Self::prefix(container);
        let mut objects = Vec::new();

        // 使用 lister_with 进行递归列表
        let mut lister = self
            .operator
            .lister_with(&prefix)
            .recursive(true)
            .metakey(Metakey::ContentLength | Metakey::Etag | Metakey::Mode)
            .await?;

        while let Some(entry) = lister.try_next().await? {
            let path = entry.path();
            // 跳过目录占位对象
            if path.ends_with('/') {
                continue;
            }
            let meta = entry.metadata();
            let name = match path.strip_prefix(&prefix) {
                Some(n) if !n.is_empty() => n.to_string(),
                _ => continue,
            };
            objects.push(ObjectInfo {
                name,
                hash: meta.etag().map(normalize_etag).unwrap_or_default(),
                bytes: meta.content_length(),
            });
        }

        Ok(objects)
    }

    async fn head_container(&self, container: &str) -> StorageResult<()> {
        // 前缀没有真实的“存在”概念：前缀下有任意条目即视为存在
        let mut lister = self.operator.lister(&Self::prefix(container)).await?;
        match lister.try_next().await? {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound(container.to_string())),
        }
    }

    async fn put_container(&self, container: &str) -> StorageResult<()> {
        self.operator.create_dir(&Self::prefix(container)).await?;
        Ok(())
    }

    async fn head_object(&self, container: &str, name: &str) -> StorageResult<ObjectMeta> {
        let meta = self.operator.stat(&Self::key(container, name)).await?;
        Ok(ObjectMeta {
            size: meta.content_length(),
            hash: meta.etag().map(normalize_etag),
        })
    }

    async fn get_object(&self, container: &str, name: &str) -> StorageResult<Bytes> {
        let data = self.operator.read(&Self::key(container, name)).await?;
        Ok(Bytes::from(data.to_vec()))
    }

    async fn put_object(&self, container: &str, name: &str, data: Bytes) -> StorageResult<()> {
        self.operator.write(&Self::key(container, name), data).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
