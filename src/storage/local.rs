use super::{ObjectInfo, ObjectMeta, ObjectStore, StorageResult};
use crate::core::checksum::{md5_file, md5_file_blocking};
use crate::error::StorageError;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use walkdir::WalkDir;

/// 写入中的临时文件放在根目录旁的 `<base>.objsync-tmp/`，不进入对象命名空间
const TEMP_DIR_SUFFIX: &str = ".objsync-tmp";

/// 以目录树作为对象存储：一级子目录是容器，其下的文件是对象
pub struct LocalStore {
    base_path: PathBuf,
    name: String,
}

impl LocalStore {
    pub fn new(path: &str) -> Result<Self> {
        let base_path = PathBuf::from(path);
        if !base_path.exists() {
            std::fs::create_dir_all(&base_path)?;
        }
        let name = format!("local:{}", path);
        Ok(Self { base_path, name })
    }

    fn container_path(&self, container: &str) -> StorageResult<PathBuf> {
        if container.is_empty() || !is_plain_relative(container) || container.contains('/') {
            return Err(StorageError::Other(format!("invalid container name: {}", container)));
        }
        Ok(self.base_path.join(container))
    }

    fn object_path(&self, container: &str, name: &str) -> StorageResult<PathBuf> {
        let name = name.trim_start_matches('/');
        if name.is_empty() || !is_plain_relative(name) {
            return Err(StorageError::Other(format!("invalid object name: {}", name)));
        }
        Ok(self.container_path(container)?.join(name))
    }

    fn temp_dir(&self) -> PathBuf {
        let mut dir = self.base_path.clone().into_os_string();
        dir.push(TEMP_DIR_SUFFIX);
        PathBuf::from(dir)
    }

    /// 规范化路径分隔符（统一使用 /）
    fn normalize_path(path: &str) -> String {
        path.replace('\\', "/")
    }
}

/// 只允许普通路径段，拒绝 `..`、根目录等
fn is_plain_relative(path: &str) -> bool {
    Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
}

fn map_io(e: std::io::Error, target: &str) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(target.to_string())
    } else {
        StorageError::Io(e)
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn list_containers(&self) -> StorageResult<Vec<String>> {
        let mut entries = fs::read_dir(&self.base_path).await?;
        let mut containers = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    containers.push(name.to_string());
                }
            }
        }
        containers.sort();
        Ok(containers)
    }

    async fn list_objects(&self, container: &str) -> StorageResult<Vec<ObjectInfo>> {
        let base = self.container_path(container)?;
        if !base.is_dir() {
            return Err(StorageError::NotFound(container.to_string()));
        }

        // 遍历与哈希都是阻塞操作，放到 spawn_blocking 中
        let entries = tokio::task::spawn_blocking(move || -> StorageResult<Vec<ObjectInfo>> {
            let mut objects = Vec::new();
            for entry in WalkDir::new(&base).follow_links(false) {
                let entry = entry.map_err(|e| StorageError::Other(e.to_string()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                let relative = match path.strip_prefix(&base).ok().and_then(|p| p.to_str()) {
                    Some(r) => Self::normalize_path(r),
                    None => continue,
                };
                let metadata = entry.metadata().map_err(|e| StorageError::Other(e.to_string()))?;
                objects.push(ObjectInfo {
                    name: relative,
                    hash: md5_file_blocking(path)?,
                    bytes: metadata.len(),
                });
            }
            Ok(objects)
        })
        .await
        .map_err(|e| StorageError::Other(e.to_string()))??;

        Ok(entries)
    }

    async fn head_container(&self, container: &str) -> StorageResult<()> {
        let path = self.container_path(container)?;
        match fs::metadata(&path).await {
            Ok(m) if m.is_dir() => Ok(()),
            Ok(_) => Err(StorageError::Other(format!("{} is not a directory", path.display()))),
            Err(e) => Err(map_io(e, container)),
        }
    }

    async fn put_container(&self, container: &str) -> StorageResult<()> {
        fs::create_dir_all(self.container_path(container)?).await?;
        Ok(())
    }

    async fn head_object(&self, container: &str, name: &str) -> StorageResult<ObjectMeta> {
        let path = self.object_path(container, name)?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| map_io(e, &format!("{}/{}", container, name)))?;
        if metadata.is_dir() {
            return Err(StorageError::NotFound(format!("{}/{}", container, name)));
        }
        Ok(ObjectMeta {
            size: metadata.len(),
            hash: Some(md5_file(&path).await?),
        })
    }

    async fn get_object(&self, container: &str, name: &str) -> StorageResult<Bytes> {
        let path = self.object_path(container, name)?;
        let data = fs::read(&path)
            .await
            .map_err(|e| map_io(e, &format!("{}/{}", container, name)))?;
        Ok(Bytes::from(data))
    }

    async fn put_object(&self, container: &str, name: &str, data: Bytes) -> StorageResult<()> {
        self.head_container(container).await?;
        let full_path = self.object_path(container, name)?;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // 使用临时文件写入，然后原子重命名
        let temp_dir = self.temp_dir();
        fs::create_dir_all(&temp_dir).await?;
        let temp_path = temp_dir.join(uuid::Uuid::new_v4().to_string());
        if let Err(e) = fs::write(&temp_path, &data).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        if fs::rename(&temp_path, &full_path).await.is_err() {
            // 根目录是挂载点时临时目录在另一个文件系统上，改为复制
            let copied = fs::copy(&temp_path, &full_path).await;
            let _ = fs::remove_file(&temp_path).await;
            copied?;
        }

        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
