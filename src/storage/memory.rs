//! 内存对象存储
//!
//! 主要用于测试：不持久化，记录每类调用的次数，并支持注入故障。

use super::{ObjectInfo, ObjectMeta, ObjectStore, StorageResult};
use crate::core::checksum::md5_hex;
use crate::error::StorageError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    hash: String,
}

/// 各操作的调用次数
#[derive(Debug, Default)]
pub struct CallCounts {
    pub list_containers: AtomicUsize,
    pub list_objects: AtomicUsize,
    pub head_container: AtomicUsize,
    pub put_container: AtomicUsize,
    pub head_object: AtomicUsize,
    pub get_object: AtomicUsize,
    pub put_object: AtomicUsize,
}

#[derive(Default)]
struct Faults {
    /// 依次弹出，get_object 调用时返回错误
    get_errors: VecDeque<StorageError>,
    put_errors: VecDeque<StorageError>,
    head_container_errors: VecDeque<StorageError>,
    list_errors: VecDeque<StorageError>,
    /// 读取这些对象时返回被篡改的内容（head 仍报告原始摘要）
    corrupt_reads: HashSet<(String, String)>,
    /// head_container 在这些容器上等待通知后才返回
    head_container_gates: HashMap<String, Arc<Notify>>,
}

pub struct MemoryStore {
    name: String,
    containers: Mutex<BTreeMap<String, BTreeMap<String, StoredObject>>>,
    faults: Mutex<Faults>,
    pub calls: CallCounts,
}

impl MemoryStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: format!("memory:{}", name),
            containers: Mutex::new(BTreeMap::new()),
            faults: Mutex::new(Faults::default()),
            calls: CallCounts::default(),
        }
    }

    /// 创建空容器
    pub fn create_container(&self, container: &str) {
        self.lock_containers()
            .entry(container.to_string())
            .or_default();
    }

    /// 写入对象，摘要为内容的 MD5
    pub fn insert(&self, container: &str, name: &str, data: &[u8]) {
        let hash = md5_hex(data);
        self.insert_with_hash(container, name, data, &hash);
    }

    /// 写入对象并指定远端报告的摘要；空串表示 head 时不报告摘要
    pub fn insert_with_hash(&self, container: &str, name: &str, data: &[u8], hash: &str) {
        self.lock_containers()
            .entry(container.to_string())
            .or_default()
            .insert(
                name.to_string(),
                StoredObject {
                    data: Bytes::copy_from_slice(data),
                    hash: hash.to_string(),
                },
            );
    }

    pub fn object(&self, container: &str, name: &str) -> Option<Bytes> {
        self.lock_containers()
            .get(container)
            .and_then(|objects| objects.get(name))
            .map(|o| o.data.clone())
    }

    pub fn has_container(&self, container: &str) -> bool {
        self.lock_containers().contains_key(container)
    }

    pub fn fail_get_once(&self, error: StorageError) {
        self.lock_faults().get_errors.push_back(error);
    }

    pub fn fail_put_once(&self, error: StorageError) {
        self.lock_faults().put_errors.push_back(error);
    }

    pub fn fail_head_container_once(&self, error: StorageError) {
        self.lock_faults().head_container_errors.push_back(error);
    }

    pub fn fail_list_once(&self, error: StorageError) {
        self.lock_faults().list_errors.push_back(error);
    }

    /// 之后每次读取该对象都返回损坏的内容
    pub fn corrupt_reads_of(&self, container: &str, name: &str) {
        self.lock_faults()
            .corrupt_reads
            .insert((container.to_string(), name.to_string()));
    }

    /// 之后对该容器的 head_container 调用会挂起，直到返回的 Notify 被通知
    pub fn stall_head_container(&self, container: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.lock_faults()
            .head_container_gates
            .insert(container.to_string(), gate.clone());
        gate
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// 所有对象级传输调用（get + put object）的总数
    pub fn transfer_calls(&self) -> usize {
        Self::count(&self.calls.get_object) + Self::count(&self.calls.put_object)
    }

    fn lock_containers(
        &self,
    ) -> std::sync::MutexGuard<'_, BTreeMap<String, BTreeMap<String, StoredObject>>> {
        self.containers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn not_found(container: &str, name: Option<&str>) -> StorageError {
        match name {
            Some(n) => StorageError::NotFound(format!("{}/{}", container, n)),
            None => StorageError::NotFound(container.to_string()),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_containers(&self) -> StorageResult<Vec<String>> {
        self.calls.list_containers.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.lock_faults().list_errors.pop_front() {
            return Err(e);
        }
        Ok(self.lock_containers().keys().cloned().collect())
    }

    async fn list_objects(&self, container: &str) -> StorageResult<Vec<ObjectInfo>> {
        self.calls.list_objects.fetch_add(1, Ordering::SeqCst);
        let containers = self.lock_containers();
        let objects = containers
            .get(container)
            .ok_or_else(|| Self::not_found(container, None))?;
        Ok(objects
            .iter()
            .map(|(name, o)| ObjectInfo {
                name: name.clone(),
                hash: o.hash.clone(),
                bytes: o.data.len() as u64,
            })
            .collect())
    }

    async fn head_container(&self, container: &str) -> StorageResult<()> {
        self.calls.head_container.fetch_add(1, Ordering::SeqCst);
        let gate = {
            let mut faults = self.lock_faults();
            if let Some(e) = faults.head_container_errors.pop_front() {
                return Err(e);
            }
            faults.head_container_gates.remove(container)
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.lock_containers().contains_key(container) {
            Ok(())
        } else {
            Err(Self::not_found(container, None))
        }
    }

    async fn put_container(&self, container: &str) -> StorageResult<()> {
        self.calls.put_container.fetch_add(1, Ordering::SeqCst);
        self.create_container(container);
        Ok(())
    }

    async fn head_object(&self, container: &str, name: &str) -> StorageResult<ObjectMeta> {
        self.calls.head_object.fetch_add(1, Ordering::SeqCst);
        self.lock_containers()
            .get(container)
            .and_then(|objects| objects.get(name))
            .map(|o| ObjectMeta {
                size: o.data.len() as u64,
                // 空摘要表示后端不报告摘要
                hash: Some(o.hash.clone()).filter(|h| !h.is_empty()),
            })
            .ok_or_else(|| Self::not_found(container, Some(name)))
    }

    async fn get_object(&self, container: &str, name: &str) -> StorageResult<Bytes> {
        self.calls.get_object.fetch_add(1, Ordering::SeqCst);
        let corrupt = {
            let mut faults = self.lock_faults();
            if let Some(e) = faults.get_errors.pop_front() {
                return Err(e);
            }
            faults
                .corrupt_reads
                .contains(&(container.to_string(), name.to_string()))
        };

        let data = self
            .object(container, name)
            .ok_or_else(|| Self::not_found(container, Some(name)))?;

        if corrupt {
            // 长度不变，内容翻转
            let flipped: Vec<u8> = data.iter().map(|b| !b).collect();
            return Ok(Bytes::from(flipped));
        }
        Ok(data)
    }

    async fn put_object(&self, container: &str, name: &str, data: Bytes) -> StorageResult<()> {
        self.calls.put_object.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.lock_faults().put_errors.pop_front() {
            return Err(e);
        }
        let mut containers = self.lock_containers();
        let objects = containers
            .get_mut(container)
            .ok_or_else(|| Self::not_found(container, None))?;
        let hash = md5_hex(&data);
        objects.insert(name.to_string(), StoredObject { data, hash });
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_requires_existing_container() {
        let store = MemoryStore::new("t");
        let err = store
            .put_object("nope", "a", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        store.put_container("c").await.unwrap();
        store
            .put_object("c", "a", Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert_eq!(store.object("c", "a").unwrap(), Bytes::from_static(b"x"));
    }

    #[tokio::test]
    async fn test_listing_reports_md5_and_size() {
        let store = MemoryStore::new("t");
        store.insert("c", "hello.txt", b"hello");

        let objects = store.list_objects("c").await.unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].hash, "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(objects[0].bytes, 5);
    }

    #[tokio::test]
    async fn test_corrupt_reads_keep_length() {
        let store = MemoryStore::new("t");
        store.insert("c", "a", b"abcd");
        store.corrupt_reads_of("c", "a");

        let data = store.get_object("c", "a").await.unwrap();
        assert_eq!(data.len(), 4);
        assert_ne!(&data[..], b"abcd");
    }
}
