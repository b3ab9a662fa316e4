//! 仓库快照缓存
//!
//! 每个仓库一份 JSON 记录落盘，避免每次同步都重新扫描远程目录树。
//! 记录带扫描时间、过期时间和连接身份指纹；指纹不匹配时无论是否
//! 过期都视为无效。

use crate::remote::Snapshot;
use crate::repository::Repository;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 一个仓库的缓存记录，整体读写
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    pub repository_id: String,
    pub repository_name: String,
    /// 连接身份指纹，见 [`Repository::fingerprint`]
    pub fingerprint: String,
    pub scanned_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub snapshot: Snapshot,
    pub total_files: u64,
    pub total_directories: u64,
    pub total_bytes: u64,
}

impl CacheRecord {
    /// 由一次完整扫描构建新记录
    pub fn build(repository: &Repository, snapshot: Snapshot, ttl_secs: u64) -> Self {
        let now = Utc::now();
        Self {
            repository_id: repository.id.clone(),
            repository_name: repository.name.clone(),
            fingerprint: repository.fingerprint(),
            scanned_at: now,
            expires_at: now + Duration::seconds(ttl_secs as i64),
            total_files: snapshot.total_files(),
            total_directories: snapshot.total_directories(),
            total_bytes: snapshot.total_bytes(),
            snapshot,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// 缓存是否完整覆盖指定子树（孤儿删除的前提）
    pub fn covers(&self, path: &str) -> bool {
        self.snapshot.covers(path)
    }

    /// 缓存年龄（秒）
    pub fn age_seconds(&self) -> i64 {
        (Utc::now() - self.scanned_at).num_seconds().max(0)
    }

    /// 合并一个新扫描的子快照，生成新记录
    ///
    /// 新路径的条目优先，未涉及的子树全部保留，汇总计数重新计算。
    /// 覆盖范围只随子快照自带的扫描根扩展。
    pub fn merged_with(&self, sub: Snapshot, ttl_secs: u64) -> Self {
        let mut snapshot = self.snapshot.clone();
        snapshot.merge(sub);

        let now = Utc::now();
        Self {
            repository_id: self.repository_id.clone(),
            repository_name: self.repository_name.clone(),
            fingerprint: self.fingerprint.clone(),
            scanned_at: now,
            expires_at: now + Duration::seconds(ttl_secs as i64),
            total_files: snapshot.total_files(),
            total_directories: snapshot.total_directories(),
            total_bytes: snapshot.total_bytes(),
            snapshot,
        }
    }
}

/// 快照缓存管理器
pub struct SnapshotCache {
    cache_dir: PathBuf,
    /// 缓存有效期（秒）
    ttl_secs: u64,
}

impl SnapshotCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        let cache_dir = cache_dir.into();
        // 目录建不出来时 save 会失败并被调用方降级处理
        let _ = std::fs::create_dir_all(&cache_dir);
        Self {
            cache_dir,
            ttl_secs: 3600,
        }
    }

    /// 设置缓存有效期（秒）
    pub fn with_ttl(mut self, seconds: u64) -> Self {
        self.ttl_secs = seconds;
        self
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    fn record_path(&self, repository_id: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.cache", repository_id))
    }

    /// 加载仓库的缓存记录，损坏的记录直接删除并按未命中处理
    pub fn load(&self, repository_id: &str) -> Option<CacheRecord> {
        let path = self.record_path(repository_id);
        if !path.exists() {
            return None;
        }

        let data = match std::fs::read(&path) {
            Ok(d) => d,
            Err(e) => {
                warn!("读取缓存失败: {:?}: {}", path, e);
                return None;
            }
        };

        match serde_json::from_slice::<CacheRecord>(&data) {
            Ok(record) => {
                debug!(
                    "加载缓存 {}: {} 个文件, {} 个目录",
                    repository_id, record.total_files, record.total_directories
                );
                Some(record)
            }
            Err(e) => {
                warn!("缓存记录损坏，删除: {:?}: {}", path, e);
                let _ = std::fs::remove_file(&path);
                None
            }
        }
    }

    /// 保存记录；失败由调用方记录日志并继续
    pub fn save(&self, record: &CacheRecord) -> Result<()> {
        let path = self.record_path(&record.repository_id);
        let data = serde_json::to_vec(record)?;
        std::fs::write(&path, data)?;
        info!(
            "已缓存 {} 个文件 / {} 个目录到 {:?}",
            record.total_files, record.total_directories, path
        );
        Ok(())
    }

    /// 记录是否可用：指纹匹配、未过期且年龄在当前有效期内
    pub fn is_valid(&self, record: &CacheRecord, repository: &Repository) -> bool {
        record.fingerprint == repository.fingerprint()
            && !record.is_expired()
            && record.age_seconds() < self.ttl_secs as i64
    }

    /// 删除指定仓库的缓存
    pub fn invalidate(&self, repository_id: &str) {
        let _ = std::fs::remove_file(self.record_path(repository_id));
    }

    /// 清理所有已过期的缓存记录，返回清理数量
    pub fn clear_expired(&self) -> usize {
        let mut removed = 0;
        let Ok(entries) = std::fs::read_dir(&self.cache_dir) else {
            return 0;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "cache") != Some(true) {
                continue;
            }
            let expired = std::fs::read(&path)
                .ok()
                .and_then(|d| serde_json::from_slice::<CacheRecord>(&d).ok())
                .map_or(true, |r| r.is_expired());
            if expired && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }

        if removed > 0 {
            info!("已清理 {} 份过期缓存", removed);
        }
        removed
    }

    /// 缓存状态描述（供外部展示）
    pub fn info(&self, repository_id: &str) -> String {
        match self.load(repository_id) {
            None => "无缓存".to_string(),
            Some(record) => {
                let state = if record.is_expired() {
                    "已过期"
                } else {
                    "有效"
                };
                format!(
                    "{} 个文件, {} 个目录, 缓存于{} ({})",
                    record.total_files,
                    record.total_directories,
                    Self::format_age(record.age_seconds().max(0) as u64),
                    state
                )
            }
        }
    }

    /// 格式化缓存年龄
    pub fn format_age(age_seconds: u64) -> String {
        if age_seconds < 60 {
            format!("{}秒前", age_seconds)
        } else if age_seconds < 3600 {
            format!("{}分钟前", age_seconds / 60)
        } else if age_seconds < 86400 {
            format!("{}小时前", age_seconds / 3600)
        } else {
            format!("{}天前", age_seconds / 86400)
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}
