//! 同步引擎
//!
//! 每次同步调用经过固定的状态流转：连接预检 → 取缓存或重扫 →
//! 计划 → 传输。只有连接预检失败会使整次调用失败；取消可以在
//! 任何非终态发生；其余错误都被限定在文件或子树范围内。

use crate::config::EngineConfig;
use crate::core::cache::{CacheRecord, SnapshotCache};
use crate::core::planner::SyncPlanner;
use crate::core::scanner::DirectoryScanner;
use crate::core::transfer::{SyncCounters, TransferExecutor};
use crate::core::Progress;
use crate::error::SyncError;
use crate::remote::{normalize_remote, FtpSource, RemoteEntry, RemoteSource, Snapshot};
use crate::repository::Repository;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 同步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    Connecting,
    Scanning,
    CacheWriting,
    Planning,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

/// 同步报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub repository_id: String,
    pub started_at: i64,
    pub finished_at: i64,
    pub status: SyncStatus,
    pub counters: SyncCounters,
    pub errors: Vec<String>,
}

impl SyncReport {
    pub fn success(&self) -> bool {
        matches!(self.status, SyncStatus::Completed)
    }
}

/// 同步引擎
pub struct SyncEngine {
    config: EngineConfig,
    cache: SnapshotCache,
    /// 当前调用的取消令牌，每次调用更换
    cancel: Mutex<CancellationToken>,
}

impl SyncEngine {
    pub fn new(config: EngineConfig) -> Self {
        let cache_dir = crate::dirs::cache_dir()
            .map(|p| p.join("modsync").join("snapshots"))
            .unwrap_or_else(|| PathBuf::from(".modsync/snapshots"));
        Self::with_cache(config, SnapshotCache::new(cache_dir))
    }

    pub fn with_cache(config: EngineConfig, cache: SnapshotCache) -> Self {
        let cache = cache.with_ttl(config.cache_ttl_secs);
        Self {
            config,
            cache,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// 请求取消当前进行中的调用
    pub fn cancel(&self) {
        self.cancel.lock().unwrap().cancel();
    }

    fn fresh_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock().unwrap() = token.clone();
        token
    }

    fn source_for(&self, repository: &Repository) -> Arc<dyn RemoteSource> {
        Arc::new(FtpSource::with_timeout(
            repository,
            Duration::from_secs(self.config.connect_timeout_secs),
        ))
    }

    /// 把整个仓库镜像到本地目录
    pub async fn sync_repository(
        &self,
        repository: &Repository,
        dest: &Path,
        progress: &Progress,
        force_refresh: bool,
    ) -> SyncReport {
        let source = self.source_for(repository);
        self.sync_repository_with_source(source, repository, dest, progress, force_refresh)
            .await
    }

    /// 同 `sync_repository`，但使用外部提供的数据源
    pub async fn sync_repository_with_source(
        &self,
        source: Arc<dyn RemoteSource>,
        repository: &Repository,
        dest: &Path,
        progress: &Progress,
        force_refresh: bool,
    ) -> SyncReport {
        let token = self.fresh_token();
        let started_at = chrono::Utc::now().timestamp();
        info!("开始同步仓库: {} ({})", repository.name, repository.id);

        // Connecting：预检失败是唯一使整次调用失败的错误
        progress.send(format!(
            "正在连接 {}:{}...",
            repository.host, repository.port
        ));
        if let Err(e) = source.check().await {
            warn!("{}", e);
            progress.send("无法连接仓库。".to_string());
            return Self::report(repository, started_at, SyncStatus::Failed, vec![e.to_string()]);
        }
        if token.is_cancelled() {
            return Self::report(repository, started_at, SyncStatus::Cancelled, Vec::new());
        }

        // 取缓存，未命中/过期/指纹不符则重扫
        let record = if force_refresh {
            progress.send("强制刷新，重新扫描目录结构...".to_string());
            match self
                .rebuild_cache(&source, repository, "/", &token, progress)
                .await
            {
                Ok(record) => record,
                Err(e) => return Self::report_error(repository, started_at, e),
            }
        } else {
            match self.cache.load(&repository.id) {
                // 懒浏览建立的缓存不覆盖全树，对整库同步视为未命中
                Some(record) if self.cache.is_valid(&record, repository) && record.covers("/") => {
                    progress.send(format!(
                        "使用缓存的目录结构 (扫描于{})",
                        SnapshotCache::format_age(record.age_seconds().max(0) as u64)
                    ));
                    progress.send(format!(
                        "  缓存 {} 个文件, {} 个目录",
                        record.total_files, record.total_directories
                    ));
                    record
                }
                cached => {
                    let reason = match &cached {
                        None => "无缓存",
                        Some(r) if r.fingerprint != repository.fingerprint() => "仓库配置已变更",
                        Some(r) if r.is_expired() => "缓存已过期",
                        Some(_) => "缓存不完整",
                    };
                    progress.send(format!("重新建立缓存 ({})...", reason));
                    match self
                        .rebuild_cache(&source, repository, "/", &token, progress)
                        .await
                    {
                        Ok(record) => record,
                        Err(e) => return Self::report_error(repository, started_at, e),
                    }
                }
            }
        };

        self.plan_and_transfer(source, repository, &record, "/", dest, progress, started_at, token)
            .await
    }

    /// 只镜像仓库中的一个远程目录
    ///
    /// 已有缓存覆盖该路径时直接使用；缓存有效但不含该路径时扫描
    /// 子树并并入缓存，其余子树保持不变。
    pub async fn sync_folder(
        &self,
        repository: &Repository,
        remote_path: &str,
        dest: &Path,
        progress: &Progress,
    ) -> SyncReport {
        let source = self.source_for(repository);
        self.sync_folder_with_source(source, repository, remote_path, dest, progress)
            .await
    }

    /// 同 `sync_folder`，但使用外部提供的数据源
    pub async fn sync_folder_with_source(
        &self,
        source: Arc<dyn RemoteSource>,
        repository: &Repository,
        remote_path: &str,
        dest: &Path,
        progress: &Progress,
    ) -> SyncReport {
        let token = self.fresh_token();
        let started_at = chrono::Utc::now().timestamp();
        let remote_path = normalize_remote(remote_path);
        info!("开始同步目录: {} {}", repository.name, remote_path);

        progress.send(format!(
            "正在连接 {}:{}...",
            repository.host, repository.port
        ));
        if let Err(e) = source.check().await {
            warn!("{}", e);
            progress.send("无法连接仓库。".to_string());
            return Self::report(repository, started_at, SyncStatus::Failed, vec![e.to_string()]);
        }
        if token.is_cancelled() {
            return Self::report(repository, started_at, SyncStatus::Cancelled, Vec::new());
        }

        let record = match self.cache.load(&repository.id) {
            Some(record)
                if self.cache.is_valid(&record, repository) && record.covers(&remote_path) =>
            {
                progress.send(format!(
                    "使用缓存数据: {} (扫描于{})",
                    remote_path,
                    SnapshotCache::format_age(record.age_seconds().max(0) as u64)
                ));
                record
            }
            Some(record) if self.cache.is_valid(&record, repository) => {
                // 缓存有效但没有这个子树：扫描后并入
                progress.send(format!("为新路径建立缓存: {}", remote_path));
                let scanner =
                    DirectoryScanner::new(self.config.max_concurrent_scans, token.clone());
                match scanner.scan(source.clone(), &remote_path, progress).await {
                    Ok(sub) => {
                        let merged = record.merged_with(sub, self.cache.ttl_secs());
                        progress.send("正在写入缓存...".to_string());
                        if let Err(e) = self.cache.save(&merged) {
                            warn!("保存缓存失败: {}", e);
                        }
                        progress.send(format!(
                            "缓存已更新: {} 个文件, {} 个目录",
                            merged.total_files, merged.total_directories
                        ));
                        merged
                    }
                    Err(e) => return Self::report_error(repository, started_at, e),
                }
            }
            _ => {
                progress.send(format!("建立目录结构缓存: {}", remote_path));
                match self
                    .rebuild_cache(&source, repository, &remote_path, &token, progress)
                    .await
                {
                    Ok(record) => record,
                    Err(e) => return Self::report_error(repository, started_at, e),
                }
            }
        };

        self.plan_and_transfer(
            source,
            repository,
            &record,
            &remote_path,
            dest,
            progress,
            started_at,
            token,
        )
        .await
    }

    /// 浏览单个远程目录（供选择器使用），懒加载并并入缓存
    ///
    /// 由此建立的缓存没有完整覆盖范围，永远不会驱动删除决策。
    pub async fn browse(
        &self,
        repository: &Repository,
        path: &str,
    ) -> Result<Vec<RemoteEntry>, SyncError> {
        let source = self.source_for(repository);
        self.browse_with_source(source, repository, path).await
    }

    /// 同 `browse`，但使用外部提供的数据源
    pub async fn browse_with_source(
        &self,
        source: Arc<dyn RemoteSource>,
        repository: &Repository,
        path: &str,
    ) -> Result<Vec<RemoteEntry>, SyncError> {
        let path = normalize_remote(path);

        if let Some(record) = self.cache.load(&repository.id) {
            if !record.is_expired() && record.fingerprint == repository.fingerprint() {
                if let Some(items) = record.snapshot.dirs.get(&path) {
                    info!("浏览命中缓存: {}", path);
                    return Ok(items.clone());
                }
            }
        }

        let entries = DirectoryScanner::list_directory(
            source.as_ref(),
            &path,
            self.config.max_concurrent_scans,
        )
        .await?;

        // 并入缓存；懒浏览不添加扫描根，不扩展覆盖范围
        let mut sub = Snapshot::default();
        sub.dirs.insert(path.clone(), entries.clone());
        let record = match self.cache.load(&repository.id) {
            Some(existing)
                if !existing.is_expired()
                    && existing.fingerprint == repository.fingerprint() =>
            {
                existing.merged_with(sub, self.cache.ttl_secs())
            }
            _ => CacheRecord::build(repository, sub, self.cache.ttl_secs()),
        };
        if let Err(e) = self.cache.save(&record) {
            warn!("保存浏览缓存失败: {}", e);
        }

        Ok(entries)
    }

    /// 批量预扫描多个仓库，已有有效缓存的跳过；每次扫描之间留出
    /// 间隔，避免连续压垮服务器
    pub async fn cache_all(&self, repositories: &[Repository], progress: &Progress) -> usize {
        let token = self.fresh_token();
        let total = repositories.len();
        let mut cached = 0usize;
        let mut skipped = 0usize;

        for (index, repository) in repositories.iter().enumerate() {
            if token.is_cancelled() {
                break;
            }

            if let Some(record) = self.cache.load(&repository.id) {
                if self.cache.is_valid(&record, repository) {
                    skipped += 1;
                    progress.send(format!(
                        "后台缓存 ({}/{}): {} 已有有效缓存",
                        index + 1,
                        total,
                        repository.name
                    ));
                    continue;
                }
            }

            progress.send(format!(
                "后台缓存 ({}/{}): 正在扫描 {}...",
                index + 1,
                total,
                repository.name
            ));

            let source = self.source_for(repository);
            let scanner = DirectoryScanner::new(self.config.max_concurrent_scans, token.clone());
            match scanner.scan(source, "/", &Progress::none()).await {
                Ok(snapshot) => {
                    let record = CacheRecord::build(repository, snapshot, self.cache.ttl_secs());
                    if let Err(e) = self.cache.save(&record) {
                        warn!("保存缓存失败: {}: {}", repository.name, e);
                    } else {
                        cached += 1;
                    }
                }
                Err(SyncError::Cancelled) => break,
                Err(e) => {
                    warn!("缓存仓库失败: {}: {}", repository.name, e);
                    skipped += 1;
                }
            }

            if index + 1 < total {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        progress.send(format!(
            "后台缓存完成 ({} 个已缓存, {} 个跳过)",
            cached, skipped
        ));
        cached
    }

    /// 作废并重建一个仓库的缓存
    pub async fn refresh_cache(
        &self,
        repository: &Repository,
        progress: &Progress,
    ) -> Result<(), SyncError> {
        let token = self.fresh_token();
        info!("刷新缓存: {}", repository.name);
        self.cache.invalidate(&repository.id);

        let source = self.source_for(repository);
        self.rebuild_cache(&source, repository, "/", &token, progress)
            .await?;
        progress.send(format!("缓存已刷新: {}", repository.name));
        Ok(())
    }

    /// 缓存状态描述
    pub fn cache_info(&self, repository_id: &str) -> String {
        self.cache.info(repository_id)
    }

    /// 删除一个仓库的缓存
    pub fn invalidate_cache(&self, repository_id: &str) {
        self.cache.invalidate(repository_id);
    }

    /// 清理所有过期缓存，返回清理数量
    pub fn clear_expired_caches(&self) -> usize {
        self.cache.clear_expired()
    }

    /// 扫描指定子树并写入缓存（Scanning → CacheWriting）
    async fn rebuild_cache(
        &self,
        source: &Arc<dyn RemoteSource>,
        repository: &Repository,
        root: &str,
        token: &CancellationToken,
        progress: &Progress,
    ) -> Result<CacheRecord, SyncError> {
        let scanner = DirectoryScanner::new(self.config.max_concurrent_scans, token.clone());
        let snapshot = scanner.scan(source.clone(), root, progress).await?;

        progress.send(format!(
            "扫描完成: {} 个文件, {} 个目录",
            snapshot.total_files(),
            snapshot.total_directories()
        ));

        let record = CacheRecord::build(repository, snapshot, self.cache.ttl_secs());
        progress.send("正在写入缓存...".to_string());
        if let Err(e) = self.cache.save(&record) {
            // 缓存写不进去不阻塞同步，下次按未命中处理
            warn!("保存缓存失败: {}", e);
        } else {
            progress.send(format!(
                "缓存已保存 (有效期 {} 分钟)",
                self.cache.ttl_secs() / 60
            ));
        }
        Ok(record)
    }

    /// Planning → Transferring → 终态
    #[allow(clippy::too_many_arguments)]
    async fn plan_and_transfer(
        &self,
        source: Arc<dyn RemoteSource>,
        repository: &Repository,
        record: &CacheRecord,
        remote_root: &str,
        dest: &Path,
        progress: &Progress,
        started_at: i64,
        token: CancellationToken,
    ) -> SyncReport {
        if token.is_cancelled() {
            return Self::report(repository, started_at, SyncStatus::Cancelled, Vec::new());
        }

        // 只有完整覆盖该子树的快照才允许删除孤儿
        let complete = record.covers(remote_root);
        let plan = SyncPlanner::plan(&record.snapshot, remote_root, dest, complete);
        progress.send(format!(
            "{} 个文件需要下载, {} 个已是最新",
            plan.downloads.len(),
            plan.up_to_date
        ));

        let executor = TransferExecutor::new(self.config.max_concurrent_transfers, token.clone());
        let (counters, errors) = executor.execute(source, plan, progress).await;

        let status = if token.is_cancelled() {
            progress.send("同步已取消。".to_string());
            SyncStatus::Cancelled
        } else {
            let deletion_note = if counters.deleted > 0 {
                format!(", 删除 {} 个", counters.deleted)
            } else {
                String::new()
            };
            progress.send(format!(
                "同步完成: 下载 {} 个, {} 个已是最新{}",
                counters.downloaded, counters.skipped, deletion_note
            ));
            SyncStatus::Completed
        };

        info!(
            "同步结束: {} - 下载 {}, 跳过 {}, 删除 {}, 失败 {}",
            repository.id, counters.downloaded, counters.skipped, counters.deleted, counters.failed
        );

        SyncReport {
            repository_id: repository.id.clone(),
            started_at,
            finished_at: chrono::Utc::now().timestamp(),
            status,
            counters,
            errors,
        }
    }

    fn report(
        repository: &Repository,
        started_at: i64,
        status: SyncStatus,
        errors: Vec<String>,
    ) -> SyncReport {
        SyncReport {
            repository_id: repository.id.clone(),
            started_at,
            finished_at: chrono::Utc::now().timestamp(),
            status,
            counters: SyncCounters::default(),
            errors,
        }
    }

    /// 扫描阶段的错误归类：取消→Cancelled，其余（根目录列不出来）→Failed
    fn report_error(repository: &Repository, started_at: i64, error: SyncError) -> SyncReport {
        if error.is_cancelled() {
            Self::report(repository, started_at, SyncStatus::Cancelled, Vec::new())
        } else {
            Self::report(
                repository,
                started_at,
                SyncStatus::Failed,
                vec![error.to_string()],
            )
        }
    }
}
