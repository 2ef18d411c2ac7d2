#![allow(non_snake_case)]

use crate::config::TransferConfig;
use crate::core::comparator::ListingComparator;
use crate::core::models::{EndpointRole, Listing, MoveList};
use crate::core::retry::{with_retry, RetryPolicy};
use crate::core::scanner::{ContainerFilter, ListingScanner};
use crate::core::staging::StagingArea;
use crate::core::transfer::TransferPipeline;
use crate::storage::ObjectStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{error, info, warn};

/// 同步配置
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// 最大并发传输数
    pub max_concurrent_transfers: usize,
    /// 单个对象的总尝试次数
    pub max_attempts: u32,
    /// 重试基础延迟（毫秒）
    pub retry_base_delay_ms: u64,
    /// 已暂存文件大小一致时是否仍校验 MD5
    pub verify_staged: bool,
    /// 并发列出容器的数量
    pub listing_concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 4,
            max_attempts: 3,
            retry_base_delay_ms: 1000,
            verify_staged: false,
            listing_concurrency: 4,
        }
    }
}

impl From<&TransferConfig> for SyncConfig {
    fn from(config: &TransferConfig) -> Self {
        Self {
            max_concurrent_transfers: config.maxConcurrentTransfers.max(1),
            max_attempts: config.maxAttempts.max(1),
            retry_base_delay_ms: config.retryBaseDelayMs,
            verify_staged: config.verifyStaged,
            ..Self::default()
        }
    }
}

impl SyncConfig {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
        )
    }
}

/// 一次同步运行的输入
pub struct SyncRequest {
    pub source: Arc<dyn ObjectStore>,
    pub destination: Arc<dyn ObjectStore>,
    pub filter: ContainerFilter,
    pub staging: StagingArea,
}

/// 运行结果状态
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    /// 目标端已包含源端的全部内容
    UpToDate,
    Completed,
    /// 部分对象在重试耗尽后仍失败
    CompletedWithFailures,
    Cancelled,
}

/// 进度阶段
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SyncPhase {
    Listing,
    Transferring,
    Finished,
}

/// 同步进度
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub runId: String,
    pub phase: SyncPhase,
    pub currentObject: String,
    pub filesMoved: u64,
    pub filesToMove: u64,
    pub bytesMoved: u64,
    pub bytesToMove: u64,
    pub percent: f64,
}

/// 干跑结果：不传输，只给出移动清单
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPlan {
    pub sourceContainers: usize,
    pub sourceObjects: usize,
    pub destinationContainers: usize,
    pub destinationObjects: usize,
    pub containersToSync: Vec<String>,
    pub filesToMove: u64,
    pub bytesToMove: u64,
    pub hashComparisons: u64,
    #[serde(skip)]
    pub moveList: MoveList,
}

impl SyncPlan {
    fn new(source: &Listing, dest: &Listing, move_list: MoveList) -> Self {
        Self {
            sourceContainers: source.container_count(),
            sourceObjects: source.object_count(),
            destinationContainers: dest.container_count(),
            destinationObjects: dest.object_count(),
            containersToSync: move_list.containers.keys().cloned().collect(),
            filesToMove: move_list.files_to_move,
            bytesToMove: move_list.bytes_to_move,
            hashComparisons: move_list.hash_comparisons,
            moveList: move_list,
        }
    }
}

/// 同步报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub runId: String,
    pub status: SyncStatus,
    pub startedAt: DateTime<Utc>,
    pub finishedAt: DateTime<Utc>,
    pub durationMs: u64,
    pub filesToMove: u64,
    pub bytesToMove: u64,
    pub objectsAttempted: u64,
    pub objectsSucceeded: u64,
    pub objectsFailed: u64,
    pub bytesTransferred: u64,
    pub errors: Vec<String>,
}

impl SyncReport {
    pub fn has_failures(&self) -> bool {
        self.status == SyncStatus::CompletedWithFailures
    }
}

/// 百分比；总量为 0 时视为 100%
pub fn percent(moved: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        moved as f64 * 100.0 / total as f64
    }
}

/// 传输统计
#[derive(Debug, Default)]
struct TransferStats {
    /// 已处理（无论成败）的对象数与字节数，用于进度
    files_moved: AtomicU64,
    bytes_moved: AtomicU64,
    attempted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    bytes_transferred: AtomicU64,
}

/// 同步引擎
pub struct SyncEngine {
    config: SyncConfig,
    cancelled: Arc<AtomicBool>,
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncEngine {
    pub fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    pub fn with_config(config: SyncConfig) -> Self {
        Self {
            config,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 取消同步：不再调度新的对象，进行中的传输会完成
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// 列出两端并计算移动清单，不做任何传输
    pub async fn plan(&self, request: &SyncRequest) -> Result<SyncPlan> {
        let scanner = ListingScanner::new(request.filter.clone())
            .with_concurrency(self.config.listing_concurrency);

        let source = scanner
            .build_listing(request.source.as_ref(), EndpointRole::Source)
            .await?;
        let dest = scanner
            .build_listing(request.destination.as_ref(), EndpointRole::Destination)
            .await?;

        let move_list = ListingComparator::new().build_move_list(&source, &dest);
        info!(
            "需要传输 {} 个对象, 共 {} 字节",
            move_list.files_to_move, move_list.bytes_to_move
        );

        Ok(SyncPlan::new(&source, &dest, move_list))
    }

    /// 运行一次完整同步
    ///
    /// 列表失败是致命错误；单个对象的失败只记录在报告中。
    pub async fn run_sync(
        &self,
        request: &SyncRequest,
        progress_tx: Option<mpsc::Sender<SyncProgress>>,
    ) -> Result<SyncReport> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();

        info!(
            "开始同步: {} -> {} ({})",
            request.source.name(),
            request.destination.name(),
            run_id
        );

        if self.is_cancelled() {
            return Ok(self.finish(
                &run_id,
                started_at,
                SyncStatus::Cancelled,
                0,
                0,
                &TransferStats::default(),
                Vec::new(),
            ));
        }

        self.send_progress(&progress_tx, progress(&run_id, SyncPhase::Listing, "", 0, 0, 0, 0))
            .await;
        let plan = self.plan(request).await?;
        let move_list = plan.moveList;
        let files_total = move_list.files_to_move;
        let bytes_total = move_list.bytes_to_move;

        if move_list.is_empty() {
            info!("目标端已包含源端的全部内容");
            self.send_progress(
                &progress_tx,
                progress(&run_id, SyncPhase::Finished, "", 0, 0, 0, 0),
            )
            .await;
            return Ok(self.finish(
                &run_id,
                started_at,
                SyncStatus::UpToDate,
                0,
                0,
                &TransferStats::default(),
                Vec::new(),
            ));
        }

        let pipeline = Arc::new(
            TransferPipeline::new(
                request.source.clone(),
                request.destination.clone(),
                request.staging.clone(),
            )
            .with_verify_staged(self.config.verify_staged),
        );
        let policy = self.config.retry_policy();
        let stats = Arc::new(TransferStats::default());
        let errors = Arc::new(Mutex::new(Vec::<String>::new()));

        // 没有对象可传的容器也要在目标端创建
        for (container, objects) in &move_list.containers {
            if !objects.is_empty() || self.is_cancelled() {
                continue;
            }
            let label = format!("创建容器 {}", container);
            let result =
                with_retry(policy, &label, |_| pipeline.ensure_destination_container(container))
                    .await;
            if let Err(e) = result {
                errors.lock().await.push(e.to_string());
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_transfers.max(1)));
        let mut handles = Vec::new();

        'containers: for (container, objects) in &move_list.containers {
            for (name, record) in objects {
                if record.size_bytes == 0 {
                    continue;
                }
                if self.is_cancelled() {
                    warn!("同步已取消，停止调度新的对象");
                    break 'containers;
                }

                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break 'containers,
                };

                let pipeline = pipeline.clone();
                let stats = stats.clone();
                let errors = errors.clone();
                let progress_tx = progress_tx.clone();
                let run_id = run_id.clone();
                let container = container.clone();
                let name = name.clone();
                let size = record.size_bytes;
                let label = format!("{}/{}", container, name);
                let task_label = label.clone();
                stats.attempted.fetch_add(1, Ordering::Relaxed);

                let handle = tokio::spawn(async move {
                    let files_moved = stats.files_moved.load(Ordering::Relaxed);
                    let bytes_moved = stats.bytes_moved.load(Ordering::Relaxed);
                    info!(
                        "进度: {}/{} 个对象, {}/{} 字节, {:.1}%",
                        files_moved,
                        files_total,
                        bytes_moved,
                        bytes_total,
                        percent(bytes_moved, bytes_total)
                    );
                    info!("传输对象 {}/{} ({} 字节)", container, name, size);
                    if let Some(tx) = &progress_tx {
                        let _ = tx
                            .send(progress(
                                &run_id,
                                SyncPhase::Transferring,
                                &label,
                                files_moved,
                                files_total,
                                bytes_moved,
                                bytes_total,
                            ))
                            .await;
                    }

                    let result =
                        with_retry(policy, &label, |_| pipeline.move_object(&container, &name)).await;

                    match result {
                        Ok(bytes) => {
                            stats.succeeded.fetch_add(1, Ordering::Relaxed);
                            stats.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
                        }
                        Err(e) => {
                            stats.failed.fetch_add(1, Ordering::Relaxed);
                            errors.lock().await.push(e.to_string());
                        }
                    }
                    stats.files_moved.fetch_add(1, Ordering::Relaxed);
                    stats.bytes_moved.fetch_add(size, Ordering::Relaxed);

                    drop(permit);
                });

                handles.push((task_label, handle));
            }
        }

        // 等待所有任务完成
        for (label, handle) in handles {
            if let Err(e) = handle.await {
                error!("传输任务异常退出: {}: {}", label, e);
                stats.failed.fetch_add(1, Ordering::Relaxed);
                errors.lock().await.push(format!("{}: 任务异常退出: {}", label, e));
            }
        }

        let error_list = errors.lock().await.clone();
        let status = if self.is_cancelled() {
            SyncStatus::Cancelled
        } else if stats.failed.load(Ordering::Relaxed) > 0 || !error_list.is_empty() {
            SyncStatus::CompletedWithFailures
        } else {
            SyncStatus::Completed
        };

        self.send_progress(
            &progress_tx,
            progress(
                &run_id,
                SyncPhase::Finished,
                "",
                stats.files_moved.load(Ordering::Relaxed),
                files_total,
                stats.bytes_moved.load(Ordering::Relaxed),
                bytes_total,
            ),
        )
        .await;

        let report = self.finish(
            &run_id,
            started_at,
            status,
            files_total,
            bytes_total,
            &stats,
            error_list,
        );
        info!(
            "同步完成: 成功 {}, 失败 {}, 传输 {} 字节",
            report.objectsSucceeded, report.objectsFailed, report.bytesTransferred
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        run_id: &str,
        started_at: DateTime<Utc>,
        status: SyncStatus,
        files_to_move: u64,
        bytes_to_move: u64,
        stats: &TransferStats,
        errors: Vec<String>,
    ) -> SyncReport {
        let finished_at = Utc::now();
        SyncReport {
            runId: run_id.to_string(),
            status,
            startedAt: started_at,
            finishedAt: finished_at,
            durationMs: (finished_at - started_at).num_milliseconds().max(0) as u64,
            filesToMove: files_to_move,
            bytesToMove: bytes_to_move,
            objectsAttempted: stats.attempted.load(Ordering::Relaxed),
            objectsSucceeded: stats.succeeded.load(Ordering::Relaxed),
            objectsFailed: stats.failed.load(Ordering::Relaxed),
            bytesTransferred: stats.bytes_transferred.load(Ordering::Relaxed),
            errors,
        }
    }

    /// 发送进度更新
    async fn send_progress(&self, tx: &Option<mpsc::Sender<SyncProgress>>, progress: SyncProgress) {
        if let Some(tx) = tx {
            let _ = tx.send(progress).await;
        }
    }
}

fn progress(
    run_id: &str,
    phase: SyncPhase,
    current: &str,
    files_moved: u64,
    files_total: u64,
    bytes_moved: u64,
    bytes_total: u64,
) -> SyncProgress {
    SyncProgress {
        runId: run_id.to_string(),
        phase,
        currentObject: current.to_string(),
        filesMoved: files_moved,
        filesToMove: files_total,
        bytesMoved: bytes_moved,
        bytesToMove: bytes_total,
        percent: percent(bytes_moved, bytes_total),
    }
}
