pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;

use anyhow::Result;
use tracing::info;

pub use crate::config::{AppConfig, EndpointConfig, StorageType, TransferConfig};
pub use crate::core::{
    ContainerFilter, EndpointRole, StagingArea, SyncConfig, SyncEngine, SyncPlan, SyncProgress,
    SyncReport, SyncRequest, SyncStatus,
};
pub use crate::error::{StorageError, TransferError};
pub use crate::storage::{create_store, ObjectStore};

/// 根据配置准备一次同步运行
///
/// 过滤表达式在连接任何端点之前校验。
pub async fn prepare_request(config: &AppConfig) -> Result<SyncRequest> {
    let filter = ContainerFilter::new(&config.prefix)?;

    let source = create_store(&config.source).await?;
    let destination = create_store(&config.destination).await?;

    let staging = if config.transfer.isolateStaging {
        StagingArea::for_endpoint(&config.localPath, EndpointRole::Source, &config.source.identity())
    } else {
        StagingArea::new(&config.localPath)
    };
    info!("本地暂存目录: {}", staging.root().display());

    Ok(SyncRequest {
        source,
        destination,
        filter,
        staging,
    })
}
