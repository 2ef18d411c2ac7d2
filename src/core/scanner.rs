use crate::core::models::{EndpointRole, Listing, ObjectRecord};
use crate::storage::ObjectStore;
use anyhow::{Context, Result};
use futures::{StreamExt, TryStreamExt};
use regex::Regex;
use tracing::{debug, info, warn};

/// 容器名过滤器
///
/// 表达式在容器名任意位置搜索（非锚定），空表达式匹配全部容器。
#[derive(Debug, Clone)]
pub struct ContainerFilter {
    pattern: Option<Regex>,
}

impl ContainerFilter {
    pub fn new(expr: &str) -> Result<Self> {
        if expr.is_empty() {
            return Ok(Self::all());
        }
        let pattern = Regex::new(expr).with_context(|| format!("无效的容器过滤表达式: {}", expr))?;
        Ok(Self {
            pattern: Some(pattern),
        })
    }

    pub fn all() -> Self {
        Self { pattern: None }
    }

    pub fn matches(&self, container: &str) -> bool {
        self.pattern
            .as_ref()
            .map_or(true, |re| re.is_match(container))
    }
}

impl Default for ContainerFilter {
    fn default() -> Self {
        Self::all()
    }
}

/// 列表构建器
pub struct ListingScanner {
    max_concurrent: usize,
    filter: ContainerFilter,
}

impl ListingScanner {
    pub fn new(filter: ContainerFilter) -> Self {
        Self {
            max_concurrent: 4,
            filter,
        }
    }

    pub fn with_concurrency(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    /// 构建端点的完整列表
    ///
    /// 任意列表请求失败都会使整个构建失败：不完整的列表不能用于比较。
    pub async fn build_listing(&self, store: &dyn ObjectStore, role: EndpointRole) -> Result<Listing> {
        info!("开始列出{}存储: {}", role, store.name());

        let containers = store
            .list_containers()
            .await
            .with_context(|| format!("列出容器失败: {}", store.name()))?;

        let total = containers.len();
        let kept: Vec<String> = containers
            .into_iter()
            .filter(|c| self.filter.matches(c))
            .collect();
        debug!("{} 个容器中 {} 个匹配过滤条件", total, kept.len());

        // 并发列出各容器，保持容器顺序
        let tables: Vec<(String, Vec<crate::storage::ObjectInfo>)> = futures::stream::iter(kept)
            .map(|container| async move {
                let objects = store
                    .list_objects(&container)
                    .await
                    .with_context(|| format!("列出容器对象失败: {}/{}", store.name(), container))?;
                Ok::<_, anyhow::Error>((container, objects))
            })
            .buffered(self.max_concurrent)
            .try_collect()
            .await?;

        let mut listing = Listing::new(role);
        for (container, objects) in tables {
            listing.add_container(&container);
            for object in objects {
                let name = object.name.clone();
                let inserted = listing.add_object(
                    &container,
                    ObjectRecord {
                        name: object.name,
                        content_hash: object.hash,
                        size_bytes: object.bytes,
                    },
                );
                if !inserted {
                    warn!("重复的对象条目已忽略: {}/{}", container, name);
                }
            }
        }

        info!(
            "列表完成: {} 个容器, {} 个对象, {} 字节",
            listing.container_count(),
            listing.object_count(),
            listing.total_bytes()
        );

        Ok(listing)
    }
}

/// 使用默认并发构建列表
pub async fn build_listing(
    store: &dyn ObjectStore,
    role: EndpointRole,
    filter: &ContainerFilter,
) -> Result<Listing> {
    ListingScanner::new(filter.clone())
        .build_listing(store, role)
        .await
}
