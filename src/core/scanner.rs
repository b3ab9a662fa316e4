//! 远程目录树扫描
//!
//! 协调器 + 工作任务池的扇出/收拢结构：每个目录一个工作任务，
//! 信号量限制同时进行的列表操作数；协调器在派发前通过已认领
//! 集合保证任何路径只被列一次。

use crate::core::Progress;
use crate::error::SyncError;
use crate::remote::{
    join_remote, normalize_remote, ListingParser, ParsedListing, RemoteEntry, RemoteSource,
    Snapshot,
};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

type DirMap = HashMap<String, Vec<RemoteEntry>>;

/// 目录扫描器
pub struct DirectoryScanner {
    max_concurrent: usize,
    cancel: CancellationToken,
}

impl DirectoryScanner {
    pub fn new(max_concurrent: usize, cancel: CancellationToken) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            cancel,
        }
    }

    /// 列出单个目录的直接子项
    ///
    /// 裸名清单方言在这里补齐类型与大小：SIZE 查询成功按文件处理，
    /// 失败按大小为 0 的目录处理；补查按列表顺序进行。
    pub async fn list_directory(
        source: &dyn RemoteSource,
        path: &str,
        probe_limit: usize,
    ) -> Result<Vec<RemoteEntry>, SyncError> {
        let raw = source
            .read_listing(path)
            .await
            .map_err(|e| e.into_listing(path))?;

        match ListingParser::parse(&raw, path) {
            ParsedListing::Entries(entries) => Ok(entries),
            ParsedListing::Names(names) => {
                let resolved = stream::iter(names.into_iter().map(|name| {
                    let full_path = join_remote(path, &name);
                    async move {
                        match source.probe_size(&full_path).await {
                            Ok(size) => RemoteEntry {
                                name,
                                full_path,
                                is_dir: false,
                                size,
                                modified: None,
                            },
                            Err(_) => RemoteEntry {
                                name,
                                full_path,
                                is_dir: true,
                                size: 0,
                                modified: None,
                            },
                        }
                    }
                }))
                .buffered(probe_limit.max(1))
                .collect::<Vec<_>>()
                .await;
                Ok(resolved)
            }
        }
    }

    /// 从指定根路径递归扫描，产出完整快照
    ///
    /// 子目录列表失败只放弃该子树并继续其余部分；根路径列表失败
    /// 意味着无法建立快照，整次扫描失败。
    pub async fn scan(
        &self,
        source: Arc<dyn RemoteSource>,
        root: &str,
        progress: &Progress,
    ) -> Result<Snapshot, SyncError> {
        let root = normalize_remote(root);
        info!("开始扫描 {} 根路径 {}", source.name(), root);

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let dirs: Arc<Mutex<DirMap>> = Arc::new(Mutex::new(HashMap::new()));
        let claimed: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let mut workers: JoinSet<Result<Vec<String>, SyncError>> = JoinSet::new();

        claimed.lock().unwrap().insert(root.clone());
        self.spawn_worker(&mut workers, &source, &semaphore, &dirs, progress, root.clone());

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(children)) => {
                    for child in children {
                        // 认领每个路径前都先检查取消
                        if self.cancel.is_cancelled() {
                            workers.shutdown().await;
                            return Err(SyncError::Cancelled);
                        }
                        if claimed.lock().unwrap().insert(child.clone()) {
                            self.spawn_worker(
                                &mut workers,
                                &source,
                                &semaphore,
                                &dirs,
                                progress,
                                child,
                            );
                        }
                    }
                }
                Ok(Err(SyncError::Cancelled)) => {
                    workers.shutdown().await;
                    return Err(SyncError::Cancelled);
                }
                Ok(Err(e)) => {
                    if let SyncError::Listing { path, .. } = &e {
                        if *path == root {
                            workers.shutdown().await;
                            return Err(e);
                        }
                    }
                    // 该子树被放弃，兄弟子树继续
                    warn!("{}", e);
                    progress.send(format!("扫描出错: {}", e));
                }
                Err(join_err) => warn!("扫描任务异常退出: {}", join_err),
            }
        }

        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let dirs = Arc::try_unwrap(dirs)
            .map(|m| m.into_inner().unwrap())
            .unwrap_or_else(|arc| arc.lock().unwrap().clone());

        let snapshot = Snapshot {
            dirs,
            scan_roots: vec![root],
        };
        info!(
            "扫描完成: {} 个目录, {} 个文件, 共 {} 字节",
            snapshot.total_directories(),
            snapshot.total_files(),
            snapshot.total_bytes()
        );
        Ok(snapshot)
    }

    fn spawn_worker(
        &self,
        workers: &mut JoinSet<Result<Vec<String>, SyncError>>,
        source: &Arc<dyn RemoteSource>,
        semaphore: &Arc<Semaphore>,
        dirs: &Arc<Mutex<DirMap>>,
        progress: &Progress,
        path: String,
    ) {
        let source = source.clone();
        let semaphore = semaphore.clone();
        let dirs = dirs.clone();
        let progress = progress.clone();
        let cancel = self.cancel.clone();
        let probe_limit = self.max_concurrent;

        workers.spawn(async move {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            // 等待预算槽位时同样响应取消
            let permit = tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                permit = semaphore.acquire_owned() => {
                    permit.map_err(|_| SyncError::Cancelled)?
                }
            };

            let entries = Self::list_directory(source.as_ref(), &path, probe_limit).await?;
            drop(permit);

            progress.send(format!("已扫描: {} ({} 项)", path, entries.len()));

            let children: Vec<String> = entries
                .iter()
                .filter(|e| e.is_dir)
                .map(|e| e.full_path.clone())
                .collect();
            dirs.lock().unwrap().insert(path, entries);
            Ok(children)
        });
    }
}
