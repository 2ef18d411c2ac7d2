//! 本地暂存区
//!
//! 对象先下载到 `<root>.partial/<uuid>`，校验通过后才移动到
//! `<root>/<container>/<object>` 并上传。下载中的文件不在镜像目录内，
//! 不会与任何对象名冲突。暂存文件跨运行保留作为缓存：大小与远端一致即视为已暂存。

use crate::core::checksum::short_id;
use crate::core::models::EndpointRole;
use crate::error::TransferError;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

/// 下载目录相对暂存根目录的后缀
const PARTIAL_DIR_SUFFIX: &str = ".partial";

#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    /// 直接以 `root` 为暂存根目录
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// 按端点隔离的暂存目录：`<root>/<role>-<id>`
    ///
    /// 不同源账户的缓存文件互不覆盖。
    pub fn for_endpoint(root: impl AsRef<Path>, role: EndpointRole, identity: &str) -> Self {
        let dir = format!("{}-{}", role, short_id(identity));
        Self::new(root.as_ref().join(dir))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn container_dir(&self, container: &str) -> Result<PathBuf, TransferError> {
        if container.is_empty() || container.contains('/') || !is_plain_relative(container) {
            return Err(TransferError::InvalidName(container.to_string()));
        }
        Ok(self.root.join(container))
    }

    /// 对象在暂存区中的镜像路径
    pub fn object_path(&self, container: &str, object: &str) -> Result<PathBuf, TransferError> {
        if object.is_empty() || object.starts_with('/') || !is_plain_relative(object) {
            return Err(TransferError::InvalidName(object.to_string()));
        }
        Ok(self.container_dir(container)?.join(object))
    }

    /// 下载中文件所在目录：`<root>.partial`，与镜像目录同级
    pub fn partial_dir(&self) -> PathBuf {
        let mut name: OsString = self.root.as_os_str().to_owned();
        name.push(PARTIAL_DIR_SUFFIX);
        PathBuf::from(name)
    }

    /// 为一次下载分配唯一的临时路径，并确保其目录存在
    pub async fn new_partial_path(&self) -> Result<PathBuf, TransferError> {
        let dir = self.partial_dir();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| TransferError::staging(&dir, e))?;
        Ok(dir.join(format!("{}.part", uuid::Uuid::new_v4())))
    }

    /// 确保容器的暂存目录存在
    pub async fn ensure_container_dir(&self, container: &str) -> Result<PathBuf, TransferError> {
        let dir = self.container_dir(container)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| TransferError::staging(&dir, e))?;
        Ok(dir)
    }

    /// 已暂存文件的大小；不存在或不是普通文件时返回 None
    pub async fn staged_size(path: &Path) -> Option<u64> {
        match fs::metadata(path).await {
            Ok(m) if m.is_file() => Some(m.len()),
            _ => None,
        }
    }

    /// 删除暂存文件，文件不存在不算错误
    pub async fn discard(path: &Path) -> Result<(), TransferError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TransferError::staging(path, e)),
        }
    }
}

/// 只允许普通路径段（拒绝 `..`、`.`、根目录与盘符）
fn is_plain_relative(path: &str) -> bool {
    Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_path_mirrors_container_and_name() {
        let staging = StagingArea::new("/tmp/mirror");
        assert_eq!(
            staging.object_path("c1", "dir/file.txt").unwrap(),
            PathBuf::from("/tmp/mirror/c1/dir/file.txt")
        );
    }

    #[test]
    fn test_escaping_names_are_rejected() {
        let staging = StagingArea::new("/tmp/mirror");
        for bad in ["../x", "a/../../x", "/etc/passwd", "", "./a"] {
            assert!(
                matches!(staging.object_path("c", bad), Err(TransferError::InvalidName(_))),
                "{:?}",
                bad
            );
        }
        assert!(staging.container_dir("..").is_err());
        assert!(staging.container_dir("a/b").is_err());
    }

    #[test]
    fn test_endpoint_isolation() {
        let a = StagingArea::for_endpoint("/m", EndpointRole::Source, "swift|a");
        let b = StagingArea::for_endpoint("/m", EndpointRole::Source, "swift|b");
        assert_ne!(a.root(), b.root());
        assert!(a
            .root()
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("source-"));
    }

    #[tokio::test]
    async fn test_partial_paths_live_outside_mirrored_tree() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(dir.path().join("mirror"));

        let a = staging.new_partial_path().await.unwrap();
        let b = staging.new_partial_path().await.unwrap();

        assert_ne!(a, b);
        assert!(!a.starts_with(staging.root()));
        assert_eq!(a.parent().unwrap(), dir.path().join("mirror.partial"));
        assert!(a.parent().unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_discard_missing_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        StagingArea::discard(&dir.path().join("nope")).await.unwrap();
    }
}
