//! 同步计划
//!
//! 把快照和本地目标目录的差异变成下载/删除清单。远程永远是
//! 权威来源：本地独有的内容视为孤儿。字节大小是唯一的重新下载
//! 判据，修改时间不参与比较。

use crate::remote::{normalize_remote, RemoteEntry, Snapshot};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// 一次同步调用的传输计划，不持久化
#[derive(Debug, Default)]
pub struct TransferPlan {
    /// 需要下载的远程文件及其本地目标路径
    pub downloads: Vec<(RemoteEntry, PathBuf)>,
    /// 待删除的本地孤儿文件
    pub delete_files: Vec<PathBuf>,
    /// 待删除的本地孤儿目录（由深到浅）
    pub delete_dirs: Vec<PathBuf>,
    /// 本地已是最新而跳过的文件数
    pub up_to_date: u64,
}

impl TransferPlan {
    pub fn total_download_bytes(&self) -> u64 {
        self.downloads.iter().map(|(e, _)| e.size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.downloads.is_empty() && self.delete_files.is_empty() && self.delete_dirs.is_empty()
    }
}

/// 同步计划器
pub struct SyncPlanner;

impl SyncPlanner {
    /// 对比快照与本地目录，生成传输计划
    ///
    /// `snapshot_complete` 表示快照对 `remote_root` 子树是完整的
    /// （来自新扫描或覆盖该子树的缓存）。只有完整快照才允许计算
    /// 孤儿删除；懒浏览得到的局部快照绝不触发删除。
    pub fn plan(
        snapshot: &Snapshot,
        remote_root: &str,
        dest: &Path,
        snapshot_complete: bool,
    ) -> TransferPlan {
        let remote_root = normalize_remote(remote_root);
        let mut plan = TransferPlan::default();
        let mut expected_files = HashSet::new();
        let mut expected_dirs = HashSet::new();

        Self::collect(
            snapshot,
            &remote_root,
            dest,
            &mut plan,
            &mut expected_files,
            &mut expected_dirs,
        );

        // 固定顺序，便于日志与测试
        plan.downloads
            .sort_by(|a, b| a.0.full_path.cmp(&b.0.full_path));

        if snapshot_complete {
            Self::collect_orphans(dest, &expected_files, &expected_dirs, &mut plan);
        } else {
            debug!("快照对 {} 不完整，跳过孤儿清理", remote_root);
        }

        plan
    }

    /// 本地缺失或字节大小不一致才需要下载
    fn should_download(local: &Path, remote_size: u64) -> bool {
        match std::fs::metadata(local) {
            Ok(meta) if meta.is_file() => meta.len() != remote_size,
            _ => true,
        }
    }

    fn collect(
        snapshot: &Snapshot,
        current: &str,
        local_dir: &Path,
        plan: &mut TransferPlan,
        expected_files: &mut HashSet<PathBuf>,
        expected_dirs: &mut HashSet<PathBuf>,
    ) {
        let Some(items) = snapshot.dirs.get(current) else {
            return;
        };

        for item in items {
            let local_path = local_dir.join(&item.name);
            if item.is_dir {
                expected_dirs.insert(local_path.clone());
                Self::collect(
                    snapshot,
                    &item.full_path,
                    &local_path,
                    plan,
                    expected_files,
                    expected_dirs,
                );
            } else {
                expected_files.insert(local_path.clone());
                if Self::should_download(&local_path, item.size) {
                    plan.downloads.push((item.clone(), local_path));
                } else {
                    plan.up_to_date += 1;
                }
            }
        }
    }

    /// 收集孤儿：期望集合之外的本地文件一律删除；期望集合之外、
    /// 且子树里不会留下任何文件的目录也删除
    fn collect_orphans(
        dest: &Path,
        expected_files: &HashSet<PathBuf>,
        expected_dirs: &HashSet<PathBuf>,
        plan: &mut TransferPlan,
    ) {
        if !dest.exists() {
            return;
        }

        let mut orphan_files = Vec::new();
        let mut candidate_dirs = Vec::new();

        for entry in WalkDir::new(dest)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if path == dest {
                continue;
            }
            if entry.file_type().is_dir() {
                if !expected_dirs.contains(path) {
                    candidate_dirs.push(path.to_path_buf());
                }
            } else if entry.file_type().is_file() && !expected_files.contains(path) {
                orphan_files.push(path.to_path_buf());
            }
        }

        let mut orphan_dirs: Vec<PathBuf> = candidate_dirs
            .into_iter()
            .filter(|dir| !expected_files.iter().any(|f| f.starts_with(dir)))
            .collect();
        // 先删深层目录
        orphan_dirs.sort_by(|a, b| b.components().count().cmp(&a.components().count()));
        orphan_files.sort();

        plan.delete_files = orphan_files;
        plan.delete_dirs = orphan_dirs;
    }
}
