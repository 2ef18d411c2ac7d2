use crate::core::models::{Listing, MoveList, ObjectRecord};
use tracing::debug;

/// 单个对象与目标端的关系
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectRelation {
    /// 目标端没有该对象
    Missing,
    /// 目标端有同名对象但摘要不同
    Changed,
    /// 摘要一致
    Equal,
}

/// 比较源和目标的列表，生成移动清单
#[derive(Debug, Default)]
pub struct ListingComparator;

impl ListingComparator {
    pub fn new() -> Self {
        Self
    }

    /// 比较单个对象
    pub fn compare_object(source: &ObjectRecord, dest: Option<&ObjectRecord>) -> ObjectRelation {
        match dest {
            None => ObjectRelation::Missing,
            Some(d) if d.content_hash != source.content_hash => ObjectRelation::Changed,
            Some(_) => ObjectRelation::Equal,
        }
    }

    /// 计算需要传输的对象
    ///
    /// 目标端缺失整个容器时，容器内所有非零字节对象直接加入清单，不做逐对象比较；
    /// 容器本身也会登记（即使只有零字节对象），以便在目标端创建。
    /// 零字节对象永远不会被传输。
    pub fn build_move_list(&self, source: &Listing, dest: &Listing) -> MoveList {
        let mut move_list = MoveList::default();

        for (container, objects) in source.containers() {
            let Some(dest_objects) = dest.container(container) else {
                debug!("目标端缺少容器 {}，整个容器加入清单", container);
                move_list.containers.entry(container.clone()).or_default();
                for record in objects.values().filter(|r| r.size_bytes > 0) {
                    move_list.add(container, record);
                }
                continue;
            };

            for (name, record) in objects {
                move_list.hash_comparisons += 1;
                let relation = Self::compare_object(record, dest_objects.get(name));
                if relation == ObjectRelation::Equal {
                    continue;
                }
                if record.size_bytes == 0 {
                    continue;
                }
                debug!("{:?}: {}/{} ({} 字节)", relation, container, name, record.size_bytes);
                move_list.add(container, record);
            }
        }

        debug!(
            "比较完成: {} 个容器, {} 个对象, {} 字节, {} 次逐对象比较",
            move_list.containers.len(),
            move_list.files_to_move,
            move_list.bytes_to_move,
            move_list.hash_comparisons
        );

        move_list
    }
}

/// 计算移动清单
pub fn build_move_list(source: &Listing, dest: &Listing) -> MoveList {
    ListingComparator::new().build_move_list(source, dest)
}
