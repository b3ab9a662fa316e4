//! 传输执行
//!
//! 下载使用独立于扫描的并发预算。单个文件失败只计入失败数，
//! 不中断整批；取消时清理写到一半的临时文件再向上传播。

use crate::core::planner::TransferPlan;
use crate::core::{format_file_size, Progress};
use crate::error::SyncError;
use crate::remote::{RemoteEntry, RemoteSource};
use futures::StreamExt;
use scopeguard::ScopeGuard;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 一次同步调用的计数结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCounters {
    pub downloaded: u64,
    pub skipped: u64,
    pub deleted: u64,
    pub failed: u64,
    pub bytes_transferred: u64,
}

/// 并发任务间的原子统计，调用结束后折算成 [`SyncCounters`]
#[derive(Default)]
struct TransferStats {
    downloaded: AtomicU64,
    deleted: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
}

/// 传输执行器
pub struct TransferExecutor {
    max_concurrent: usize,
    cancel: CancellationToken,
}

impl TransferExecutor {
    pub fn new(max_concurrent: usize, cancel: CancellationToken) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            cancel,
        }
    }

    /// 执行传输计划，返回计数和错误消息列表
    pub async fn execute(
        &self,
        source: Arc<dyn RemoteSource>,
        plan: TransferPlan,
        progress: &Progress,
    ) -> (SyncCounters, Vec<String>) {
        let TransferPlan {
            downloads,
            delete_files,
            delete_dirs,
            up_to_date,
        } = plan;

        let stats = Arc::new(TransferStats::default());
        let errors: Arc<RwLock<Vec<String>>> = Arc::new(RwLock::new(Vec::new()));

        // 远程是权威来源：先清理孤儿，再下载
        self.delete_orphans(&delete_files, &delete_dirs, &stats, progress)
            .await;

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();

        for (entry, local_path) in downloads {
            if self.cancel.is_cancelled() {
                break;
            }
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };

            let source = source.clone();
            let stats = stats.clone();
            let errors = errors.clone();
            let cancel = self.cancel.clone();
            let progress = progress.clone();

            tasks.spawn(async move {
                progress.send(format!(
                    "下载: {} => {} ({})",
                    entry.full_path,
                    local_path.display(),
                    format_file_size(entry.size)
                ));

                match download_one(source.as_ref(), &entry, &local_path, &cancel).await {
                    Ok(bytes) => {
                        stats.downloaded.fetch_add(1, Ordering::Relaxed);
                        stats.bytes.fetch_add(bytes, Ordering::Relaxed);
                    }
                    // 取消既不算成功也不算失败
                    Err(SyncError::Cancelled) => {}
                    Err(e) => {
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                        warn!("{}", e);
                        progress.send(format!("下载失败: {}: {}", entry.name, e));
                        errors.write().await.push(e.to_string());
                    }
                }
                drop(permit);
            });
        }

        while tasks.join_next().await.is_some() {}

        let counters = SyncCounters {
            downloaded: stats.downloaded.load(Ordering::Relaxed),
            skipped: up_to_date,
            deleted: stats.deleted.load(Ordering::Relaxed),
            failed: stats.failed.load(Ordering::Relaxed),
            bytes_transferred: stats.bytes.load(Ordering::Relaxed),
        };
        let error_list = errors.read().await.clone();
        (counters, error_list)
    }

    /// 删除孤儿文件和目录，全部尽力而为
    async fn delete_orphans(
        &self,
        files: &[PathBuf],
        dirs: &[PathBuf],
        stats: &TransferStats,
        progress: &Progress,
    ) {
        for path in files {
            if self.cancel.is_cancelled() {
                return;
            }
            match tokio::fs::remove_file(path).await {
                Ok(()) => {
                    stats.deleted.fetch_add(1, Ordering::Relaxed);
                    progress.send(format!("删除 (远程不存在): {}", path.display()));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("删除失败: {:?}: {}", path, e);
                    progress.send(format!("删除失败: {}: {}", path.display(), e));
                }
            }
        }

        for dir in dirs {
            if self.cancel.is_cancelled() {
                return;
            }
            // 计划阶段已保证目录里不会留下要保留的文件
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => {
                    progress.send(format!("删除目录 (远程不存在): {}", dir.display()));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("删除目录失败: {:?}: {}", dir, e);
                    progress.send(format!("删除目录失败: {}: {}", dir.display(), e));
                }
            }
        }
    }
}

/// 下载单个文件：先写临时文件，成功后原子改名
async fn download_one(
    source: &dyn RemoteSource,
    entry: &RemoteEntry,
    local_path: &Path,
    cancel: &CancellationToken,
) -> Result<u64, SyncError> {
    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }

    if let Some(parent) = local_path.parent() {
        // create_dir_all 幂等且并发安全
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| SyncError::from(e).into_transfer(&entry.full_path))?;
    }

    let file_name = local_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("download");
    let part_path = local_path.with_file_name(format!("{}.part", file_name));

    // 出错或取消时清掉写了一半的临时文件；成功后解除
    let cleanup = scopeguard::guard(part_path.clone(), |p| {
        let _ = std::fs::remove_file(&p);
    });

    let mut stream = source
        .fetch(&entry.full_path)
        .await
        .map_err(|e| e.into_transfer(&entry.full_path))?;
    let mut file = tokio::fs::File::create(&part_path)
        .await
        .map_err(|e| SyncError::from(e).into_transfer(&entry.full_path))?;

    let mut bytes_written = 0u64;
    while let Some(chunk) = stream.next().await {
        // 写完当前数据块之前不响应取消
        if cancel.is_cancelled() {
            drop(file);
            return Err(SyncError::Cancelled);
        }
        let chunk = chunk.map_err(|e| SyncError::from(e).into_transfer(&entry.full_path))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| SyncError::from(e).into_transfer(&entry.full_path))?;
        bytes_written += chunk.len() as u64;
    }
    file.flush()
        .await
        .map_err(|e| SyncError::from(e).into_transfer(&entry.full_path))?;
    drop(file);

    // 恢复远程修改时间；拿不到或设置失败不影响结果
    if let Some(modified) = entry.modified {
        let part = part_path.clone();
        let set_result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let f = std::fs::File::options().write(true).open(&part)?;
            f.set_modified(std::time::SystemTime::from(modified))
        })
        .await;
        match set_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("设置修改时间失败: {:?}: {}", local_path, e),
            Err(e) => debug!("设置修改时间任务异常: {}", e),
        }
    }

    tokio::fs::rename(&part_path, local_path)
        .await
        .map_err(|e| SyncError::from(e).into_transfer(&entry.full_path))?;
    let _ = ScopeGuard::into_inner(cleanup);

    Ok(bytes_written)
}
