//! 列表与移动清单的数据模型

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 端点角色
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    Source,
    Destination,
}

impl std::fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointRole::Source => write!(f, "source"),
            EndpointRole::Destination => write!(f, "destination"),
        }
    }
}

/// 一个已存储的对象
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectRecord {
    pub name: String,
    pub content_hash: String,
    pub size_bytes: u64,
}

/// 单个容器的对象表
pub type ObjectTable = BTreeMap<String, ObjectRecord>;

/// 一个端点的完整列表快照：容器 -> 对象名 -> 记录
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub role: Option<EndpointRole>,
    containers: BTreeMap<String, ObjectTable>,
}

impl Listing {
    pub fn new(role: EndpointRole) -> Self {
        Self {
            role: Some(role),
            containers: BTreeMap::new(),
        }
    }

    /// 登记容器；已存在时保持原样
    pub fn add_container(&mut self, container: &str) {
        self.containers.entry(container.to_string()).or_default();
    }

    /// 登记对象。快照只增不改：同名对象已存在时忽略后来者，返回 false
    pub fn add_object(&mut self, container: &str, record: ObjectRecord) -> bool {
        let table = self.containers.entry(container.to_string()).or_default();
        if table.contains_key(&record.name) {
            return false;
        }
        table.insert(record.name.clone(), record);
        true
    }

    pub fn container(&self, name: &str) -> Option<&ObjectTable> {
        self.containers.get(name)
    }

    pub fn containers(&self) -> impl Iterator<Item = (&String, &ObjectTable)> {
        self.containers.iter()
    }

    pub fn container_count(&self) -> usize {
        self.containers.len()
    }

    pub fn object_count(&self) -> usize {
        self.containers.values().map(|t| t.len()).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.containers
            .values()
            .flat_map(|t| t.values())
            .map(|r| r.size_bytes)
            .sum()
    }
}

/// 需要传输的对象集合及汇总
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MoveList {
    pub containers: BTreeMap<String, ObjectTable>,
    pub files_to_move: u64,
    pub bytes_to_move: u64,
    /// 执行过的逐对象比较次数
    pub hash_comparisons: u64,
}

impl MoveList {
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    pub fn contains(&self, container: &str, object: &str) -> bool {
        self.containers
            .get(container)
            .is_some_and(|t| t.contains_key(object))
    }

    pub(crate) fn add(&mut self, container: &str, record: &ObjectRecord) {
        self.files_to_move += 1;
        self.bytes_to_move += record.size_bytes;
        self.containers
            .entry(container.to_string())
            .or_default()
            .insert(record.name.clone(), record.clone());
    }
}
