//! 单个对象的传输管线：暂存 -> 校验 -> 上传

use crate::core::checksum::md5_file;
use crate::core::staging::StagingArea;
use crate::error::TransferError;
use crate::storage::ObjectStore;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// 暂存结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub path: PathBuf,
    pub size: u64,
    /// 是否复用了已有的本地副本（未下载）
    pub reused: bool,
}

/// 传输管线
pub struct TransferPipeline {
    source: Arc<dyn ObjectStore>,
    dest: Arc<dyn ObjectStore>,
    staging: StagingArea,
    /// 大小一致时是否仍重新计算本地 MD5
    verify_staged: bool,
    /// 每个目标容器一个初始化单元：同一容器只检查/创建一次，不同容器互不阻塞
    ensured: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
}

impl TransferPipeline {
    pub fn new(source: Arc<dyn ObjectStore>, dest: Arc<dyn ObjectStore>, staging: StagingArea) -> Self {
        Self {
            source,
            dest,
            staging,
            verify_staged: false,
            ensured: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_verify_staged(mut self, verify_staged: bool) -> Self {
        self.verify_staged = verify_staged;
        self
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// 将源对象暂存到本地并校验
    ///
    /// 本地已有同样大小的文件时直接复用，既不下载也不计算摘要
    /// （对全部本地副本做 MD5 代价太高）。新下载的文件必须通过 MD5 校验，
    /// 校验失败时本地文件被删除。
    pub async fn stage_and_verify(
        &self,
        container: &str,
        object: &str,
    ) -> Result<StagedFile, TransferError> {
        let local_path = self.staging.object_path(container, object)?;
        self.staging.ensure_container_dir(container).await?;

        let remote = self
            .source
            .head_object(container, object)
            .await
            .map_err(|source| TransferError::Download {
                container: container.to_string(),
                object: object.to_string(),
                source,
            })?;

        if StagingArea::staged_size(&local_path).await == Some(remote.size) {
            if !self.verify_staged {
                debug!("本地副本大小一致，跳过下载: {}", local_path.display());
                return Ok(StagedFile {
                    path: local_path,
                    size: remote.size,
                    reused: true,
                });
            }

            let local_hash = md5_file(&local_path)
                .await
                .map_err(|e| TransferError::staging(&local_path, e))?;
            if remote.hash.as_deref() == Some(local_hash.as_str()) {
                debug!("本地副本 MD5 一致，跳过下载: {}", local_path.display());
                return Ok(StagedFile {
                    path: local_path,
                    size: remote.size,
                    reused: true,
                });
            }
            warn!("本地副本 MD5 不一致，重新下载: {}", local_path.display());
        }

        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::staging(parent, e))?;
        }

        debug!("从源下载: {}/{}", container, object);
        let data = self
            .source
            .get_object(container, object)
            .await
            .map_err(|source| TransferError::Download {
                container: container.to_string(),
                object: object.to_string(),
                source,
            })?;

        let partial = self.staging.new_partial_path().await?;
        if let Err(e) = fs::write(&partial, &data).await {
            StagingArea::discard(&partial).await?;
            return Err(TransferError::staging(&partial, e));
        }

        debug!("计算下载文件的 MD5: {}", partial.display());
        let actual = match md5_file(&partial).await {
            Ok(h) => h,
            Err(e) => {
                StagingArea::discard(&partial).await?;
                return Err(TransferError::staging(&partial, e));
            }
        };

        let expected = remote.hash.unwrap_or_default();
        if actual != expected {
            warn!(
                "本地副本 MD5 不一致，删除文件: {} (expected={}, actual={})",
                local_path.display(),
                expected,
                actual
            );
            StagingArea::discard(&partial).await?;
            // 旧的同名副本同样不可信
            StagingArea::discard(&local_path).await?;
            return Err(TransferError::Verification {
                container: container.to_string(),
                object: object.to_string(),
                expected,
                actual,
            });
        }

        if let Err(e) = fs::rename(&partial, &local_path).await {
            StagingArea::discard(&partial).await?;
            return Err(TransferError::staging(&local_path, e));
        }
        debug!("本地副本 MD5 与源一致: {}", local_path.display());

        Ok(StagedFile {
            path: local_path,
            size: data.len() as u64,
            reused: false,
        })
    }

    /// 确保目标容器存在，不存在时创建
    ///
    /// 只有 NotFound 会触发创建，其他错误原样返回，下次调用会重新检查。
    pub async fn ensure_destination_container(&self, container: &str) -> Result<(), TransferError> {
        let cell = {
            let mut ensured = self.ensured.lock().unwrap_or_else(|e| e.into_inner());
            ensured.entry(container.to_string()).or_default().clone()
        };

        cell.get_or_try_init(|| async {
            let to_error = |source| TransferError::Container {
                container: container.to_string(),
                source,
            };
            if !self.dest.container_exists(container).await.map_err(to_error)? {
                info!("创建目标容器: {}", container);
                self.dest.put_container(container).await.map_err(to_error)?;
            }
            Ok::<(), TransferError>(())
        })
        .await?;

        Ok(())
    }

    /// 上传暂存文件，覆盖目标端同名对象，返回上传字节数
    pub async fn upload_object(
        &self,
        container: &str,
        object: &str,
        staged_path: &Path,
    ) -> Result<u64, TransferError> {
        let data = fs::read(staged_path)
            .await
            .map_err(|e| TransferError::staging(staged_path, e))?;
        let size = data.len() as u64;

        debug!("上传对象到目标: {}/{} ({} 字节)", container, object, size);
        self.dest
            .put_object(container, object, Bytes::from(data))
            .await
            .map_err(|source| TransferError::Upload {
                container: container.to_string(),
                object: object.to_string(),
                source,
            })?;

        Ok(size)
    }

    /// 移动单个对象：确保容器 -> 暂存校验 -> 上传
    ///
    /// 暂存失败时直接返回错误，未经校验的数据永远不会被上传。
    pub async fn move_object(&self, container: &str, object: &str) -> Result<u64, TransferError> {
        self.ensure_destination_container(container).await?;

        let staged = match self.stage_and_verify(container, object).await {
            Ok(staged) => staged,
            Err(e) => {
                warn!("下载失败: {}/{}: {}", container, object, e);
                return Err(e);
            }
        };

        self.upload_object(container, object, &staged.path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::checksum::md5_hex;
    use crate::error::StorageError;
    use crate::storage::MemoryStore;

    struct Fixture {
        source: Arc<MemoryStore>,
        dest: Arc<MemoryStore>,
        pipeline: TransferPipeline,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MemoryStore::new("src"));
        let dest = Arc::new(MemoryStore::new("dst"));
        let pipeline = TransferPipeline::new(
            source.clone(),
            dest.clone(),
            StagingArea::new(dir.path().join("mirror")),
        );
        Fixture {
            source,
            dest,
            pipeline,
            _dir: dir,
        }
    }

    /// 残留在临时下载目录中的文件数
    fn leftover_partials(pipeline: &TransferPipeline) -> usize {
        match std::fs::read_dir(pipeline.staging().partial_dir()) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    #[tokio::test]
    async fn test_fresh_download_is_verified_and_kept() {
        let f = fixture();
        f.source.insert("c1", "dir/a.txt", b"0123456789");

        let staged = f.pipeline.stage_and_verify("c1", "dir/a.txt").await.unwrap();

        assert!(!staged.reused);
        assert_eq!(staged.size, 10);
        assert!(staged.path.ends_with("c1/dir/a.txt"));
        assert_eq!(std::fs::read(&staged.path).unwrap(), b"0123456789");
        assert_eq!(leftover_partials(&f.pipeline), 0);
        assert_eq!(MemoryStore::count(&f.source.calls.get_object), 1);
    }

    #[tokio::test]
    async fn test_same_size_local_copy_skips_download() {
        let f = fixture();
        f.source.insert("c1", "a", b"0123456789");
        let path = f.pipeline.staging().object_path("c1", "a").unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        // 内容不同但大小相同：按大小策略仍视为已暂存
        std::fs::write(&path, b"xxxxxxxxxx").unwrap();

        let staged = f.pipeline.stage_and_verify("c1", "a").await.unwrap();

        assert!(staged.reused);
        assert_eq!(MemoryStore::count(&f.source.calls.get_object), 0);
    }

    #[tokio::test]
    async fn test_verify_staged_redownloads_on_mismatch() {
        let mut f = fixture();
        f.pipeline = TransferPipeline::new(
            f.source.clone(),
            f.dest.clone(),
            StagingArea::new(f._dir.path().join("mirror")),
        )
        .with_verify_staged(true);
        f.source.insert("c1", "a", b"0123456789");
        let path = f.pipeline.staging().object_path("c1", "a").unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"xxxxxxxxxx").unwrap();

        let staged = f.pipeline.stage_and_verify("c1", "a").await.unwrap();

        assert!(!staged.reused);
        assert_eq!(MemoryStore::count(&f.source.calls.get_object), 1);
        assert_eq!(std::fs::read(&path).unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn test_different_size_local_copy_is_replaced() {
        let f = fixture();
        f.source.insert("c1", "a", b"0123456789");
        let path = f.pipeline.staging().object_path("c1", "a").unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"short").unwrap();

        let staged = f.pipeline.stage_and_verify("c1", "a").await.unwrap();

        assert!(!staged.reused);
        assert_eq!(std::fs::read(&path).unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn test_checksum_mismatch_removes_local_file() {
        let f = fixture();
        f.source.insert("c1", "a", b"0123456789");
        f.source.corrupt_reads_of("c1", "a");
        let path = f.pipeline.staging().object_path("c1", "a").unwrap();

        let err = f.pipeline.stage_and_verify("c1", "a").await.unwrap_err();

        match err {
            TransferError::Verification { expected, actual, .. } => {
                assert_eq!(expected, md5_hex(b"0123456789"));
                assert_ne!(actual, expected);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!path.exists());
        assert_eq!(leftover_partials(&f.pipeline), 0);
    }

    #[tokio::test]
    async fn test_missing_remote_hash_fails_verification() {
        let f = fixture();
        // 空摘要：head 不返回 hash
        f.source.insert_with_hash("c1", "a", b"0123456789", "");
        let path = f.pipeline.staging().object_path("c1", "a").unwrap();

        let err = f.pipeline.stage_and_verify("c1", "a").await.unwrap_err();

        match err {
            TransferError::Verification { expected, actual, .. } => {
                assert_eq!(expected, "");
                assert_eq!(actual, md5_hex(b"0123456789"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!path.exists());
        assert_eq!(leftover_partials(&f.pipeline), 0);

        // 未校验的数据不会被上传
        assert!(f.pipeline.move_object("c1", "a").await.is_err());
        assert_eq!(MemoryStore::count(&f.dest.calls.put_object), 0);
    }

    #[tokio::test]
    async fn test_object_named_like_partial_file_keeps_its_own_bytes() {
        let f = fixture();
        // 同样大小，内容不同
        f.source.insert("c1", "foo", b"AAAA");
        f.source.insert("c1", "foo.part", b"BBBB");

        f.pipeline.move_object("c1", "foo.part").await.unwrap();
        f.pipeline.move_object("c1", "foo").await.unwrap();
        // 再次移动时复用暂存副本，也不能被另一个对象的下载覆盖
        f.pipeline.move_object("c1", "foo.part").await.unwrap();

        assert_eq!(f.dest.object("c1", "foo").unwrap(), Bytes::from_static(b"AAAA"));
        assert_eq!(f.dest.object("c1", "foo.part").unwrap(), Bytes::from_static(b"BBBB"));
        let staged = f.pipeline.staging().object_path("c1", "foo.part").unwrap();
        assert_eq!(std::fs::read(staged).unwrap(), b"BBBB");
        assert_eq!(leftover_partials(&f.pipeline), 0);
    }

    #[tokio::test]
    async fn test_concurrent_downloads_of_colliding_names() {
        let f = fixture();
        f.source.insert("c1", "foo", b"AAAA");
        f.source.insert("c1", "foo.part", b"BBBB");
        let pipeline = Arc::new(f.pipeline);

        let a = tokio::spawn({
            let p = pipeline.clone();
            async move { p.move_object("c1", "foo").await }
        });
        let b = tokio::spawn({
            let p = pipeline.clone();
            async move { p.move_object("c1", "foo.part").await }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(f.dest.object("c1", "foo").unwrap(), Bytes::from_static(b"AAAA"));
        assert_eq!(f.dest.object("c1", "foo.part").unwrap(), Bytes::from_static(b"BBBB"));
        assert_eq!(leftover_partials(&pipeline), 0);
    }

    #[tokio::test]
    async fn test_stale_copy_removed_on_mismatch() {
        let f = fixture();
        f.source.insert("c1", "a", b"0123456789");
        f.source.corrupt_reads_of("c1", "a");
        let path = f.pipeline.staging().object_path("c1", "a").unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"old").unwrap();

        assert!(f.pipeline.stage_and_verify("c1", "a").await.is_err());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_ensure_container_creates_only_when_missing() {
        let f = fixture();
        f.dest.create_container("exists");

        f.pipeline.ensure_destination_container("exists").await.unwrap();
        f.pipeline.ensure_destination_container("fresh").await.unwrap();
        f.pipeline.ensure_destination_container("fresh").await.unwrap();

        assert!(f.dest.has_container("fresh"));
        assert_eq!(MemoryStore::count(&f.dest.calls.put_container), 1);
        // 第二次调用走本地记录，不再访问目标端
        assert_eq!(MemoryStore::count(&f.dest.calls.head_container), 2);
    }

    #[tokio::test]
    async fn test_ensure_container_does_not_create_on_transient_error() {
        let f = fixture();
        f.dest
            .fail_head_container_once(StorageError::Http { status: 503, target: "c".into() });

        let err = f.pipeline.ensure_destination_container("c").await.unwrap_err();

        assert!(matches!(err, TransferError::Container { .. }));
        assert_eq!(MemoryStore::count(&f.dest.calls.put_container), 0);
        assert!(!f.dest.has_container("c"));

        // 下一次调用正常创建
        f.pipeline.ensure_destination_container("c").await.unwrap();
        assert!(f.dest.has_container("c"));
    }

    #[tokio::test]
    async fn test_slow_container_check_does_not_block_other_containers() {
        let f = fixture();
        f.source.insert("fast", "a", b"payload");
        let gate = f.dest.stall_head_container("slow");
        let pipeline = Arc::new(f.pipeline);

        let slow = tokio::spawn({
            let p = pipeline.clone();
            async move { p.ensure_destination_container("slow").await }
        });
        // 等待慢容器的检查真正挂起
        while MemoryStore::count(&f.dest.calls.head_container) == 0 {
            tokio::task::yield_now().await;
        }

        let moved = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            pipeline.move_object("fast", "a"),
        )
        .await
        .expect("other container must not wait for the stalled one");
        assert_eq!(moved.unwrap(), 7);
        assert!(!slow.is_finished());

        gate.notify_one();
        slow.await.unwrap().unwrap();
        assert!(f.dest.has_container("slow"));
        assert!(f.dest.has_container("fast"));
    }

    #[tokio::test]
    async fn test_concurrent_ensure_creates_container_once() {
        let f = fixture();
        let gate = f.dest.stall_head_container("c");
        let pipeline = Arc::new(f.pipeline);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let p = pipeline.clone();
                tokio::spawn(async move { p.ensure_destination_container("c").await })
            })
            .collect();
        while MemoryStore::count(&f.dest.calls.head_container) == 0 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(MemoryStore::count(&f.dest.calls.head_container), 1);
        assert_eq!(MemoryStore::count(&f.dest.calls.put_container), 1);
    }

    #[tokio::test]
    async fn test_upload_error_is_reported() {
        let f = fixture();
        f.source.insert("c1", "a", b"payload");
        f.dest.fail_put_once(StorageError::Http { status: 500, target: "c1/a".into() });

        let err = f.pipeline.move_object("c1", "a").await.unwrap_err();

        assert!(matches!(err, TransferError::Upload { .. }));
        assert!(f.dest.object("c1", "a").is_none());
        // 暂存副本保留，下一次尝试直接复用
        f.pipeline.move_object("c1", "a").await.unwrap();
        assert_eq!(MemoryStore::count(&f.source.calls.get_object), 1);
        assert_eq!(f.dest.object("c1", "a").unwrap(), Bytes::from_static(b"payload"));
    }

    #[tokio::test]
    async fn test_move_object_uploads_verified_copy() {
        let f = fixture();
        f.source.insert("c1", "a", b"payload");

        let bytes = f.pipeline.move_object("c1", "a").await.unwrap();

        assert_eq!(bytes, 7);
        assert_eq!(f.dest.object("c1", "a").unwrap(), Bytes::from_static(b"payload"));
    }

    #[tokio::test]
    async fn test_move_object_overwrites_changed_destination() {
        let f = fixture();
        f.source.insert("c1", "a", b"new contents");
        f.dest.insert("c1", "a", b"old");

        f.pipeline.move_object("c1", "a").await.unwrap();

        assert_eq!(f.dest.object("c1", "a").unwrap(), Bytes::from_static(b"new contents"));
    }

    #[tokio::test]
    async fn test_move_object_never_uploads_unverified_data() {
        let f = fixture();
        f.source.insert("c1", "a", b"payload");
        f.source.corrupt_reads_of("c1", "a");

        assert!(f.pipeline.move_object("c1", "a").await.is_err());
        assert_eq!(MemoryStore::count(&f.dest.calls.put_object), 0);
        assert!(f.dest.object("c1", "a").is_none());
    }

    #[tokio::test]
    async fn test_download_error_is_reported() {
        let f = fixture();
        f.source.insert("c1", "a", b"payload");
        f.source.fail_get_once(StorageError::Network("timeout".into()));

        let err = f.pipeline.move_object("c1", "a").await.unwrap_err();
        assert!(matches!(err, TransferError::Download { .. }));
        assert_eq!(MemoryStore::count(&f.dest.calls.put_object), 0);
    }
}
