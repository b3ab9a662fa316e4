pub mod ftp;
pub mod listing;

use crate::error::SyncError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;

pub use ftp::FtpSource;
pub use listing::{ListingParser, ParsedListing};

// ============ 公共常量 ============

/// 非传输操作超时（秒）- 登录、SIZE 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// 传输操作超时（秒）- 目录列表读取等
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 下载数据流
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// 远程目录条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub name: String,
    /// 远程绝对路径（快照内唯一），始终使用 / 分隔且不转义
    pub full_path: String,
    pub is_dir: bool,
    pub size: u64,
    /// 远程修改时间，无法得知时为 None
    pub modified: Option<DateTime<Utc>>,
}

impl RemoteEntry {
    pub fn file(name: &str, dir: &str, size: u64, modified: Option<DateTime<Utc>>) -> Self {
        Self {
            name: name.to_string(),
            full_path: join_remote(dir, name),
            is_dir: false,
            size,
            modified,
        }
    }

    pub fn dir(name: &str, dir: &str) -> Self {
        Self {
            name: name.to_string(),
            full_path: join_remote(dir, name),
            is_dir: true,
            size: 0,
            modified: None,
        }
    }
}

/// 远程目录树快照
///
/// 目录路径 -> 直接子项（保持列表顺序）。快照是"远程路径是否存在"
/// 的唯一依据；`scan_roots` 记录本快照完整覆盖的扫描根，孤儿删除
/// 只允许在覆盖范围内进行。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub dirs: HashMap<String, Vec<RemoteEntry>>,
    pub scan_roots: Vec<String>,
}

impl Snapshot {
    /// 该快照是否完整覆盖指定子树
    pub fn covers(&self, path: &str) -> bool {
        self.scan_roots.iter().any(|root| is_path_prefix(root, path))
    }

    pub fn total_files(&self) -> u64 {
        self.dirs
            .values()
            .map(|items| items.iter().filter(|i| !i.is_dir).count() as u64)
            .sum()
    }

    pub fn total_directories(&self) -> u64 {
        self.dirs.len() as u64
    }

    pub fn total_bytes(&self) -> u64 {
        self.dirs
            .values()
            .flat_map(|items| items.iter())
            .map(|i| i.size)
            .sum()
    }

    /// 合并一个新扫描的子快照，新路径的条目优先
    pub fn merge(&mut self, sub: Snapshot) {
        for (path, items) in sub.dirs {
            self.dirs.insert(path, items);
        }
        for root in sub.scan_roots {
            if !self.scan_roots.contains(&root) {
                self.scan_roots.push(root);
            }
        }
    }
}

/// 远程数据源抽象
///
/// 引擎只通过该接口访问远程仓库，便于测试替换。
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// 连通性预检（登录成功即通过）
    async fn check(&self) -> Result<(), SyncError>;

    /// 获取一个目录的原始列表响应文本
    async fn read_listing(&self, path: &str) -> Result<String, SyncError>;

    /// 按名补查：文件返回字节大小，目录（或查询失败）返回 Err
    async fn probe_size(&self, path: &str) -> Result<u64, SyncError>;

    /// 以流方式下载一个远程文件
    async fn fetch(&self, path: &str) -> Result<ByteStream, SyncError>;

    /// 数据源名称（用于日志）
    fn name(&self) -> &str;
}

/// 拼接远程路径
pub fn join_remote(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

/// 规范化远程目录路径：保证以 / 开头，除根外不以 / 结尾
pub fn normalize_remote(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// prefix 是否覆盖 path（按路径段比较）
pub fn is_path_prefix(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    path == prefix || path.starts_with(&format!("{}/", prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_and_normalize() {
        assert_eq!(join_remote("/", "@CUP"), "/@CUP");
        assert_eq!(join_remote("/mods", "a.pbo"), "/mods/a.pbo");
        assert_eq!(normalize_remote(""), "/");
        assert_eq!(normalize_remote("mods/"), "/mods");
        assert_eq!(normalize_remote("/mods"), "/mods");
    }

    #[test]
    fn test_path_prefix() {
        assert!(is_path_prefix("/", "/anything/below"));
        assert!(is_path_prefix("/mods", "/mods"));
        assert!(is_path_prefix("/mods", "/mods/@CUP"));
        // 只按路径段匹配，不是字符串前缀
        assert!(!is_path_prefix("/mods", "/mods2"));
    }

    #[test]
    fn test_snapshot_totals_and_merge() {
        let mut snapshot = Snapshot::default();
        snapshot.dirs.insert(
            "/".to_string(),
            vec![
                RemoteEntry::dir("@CUP", "/"),
                RemoteEntry::file("readme.txt", "/", 10, None),
            ],
        );
        snapshot.dirs.insert(
            "/@CUP".to_string(),
            vec![RemoteEntry::file("cup.pbo", "/@CUP", 90, None)],
        );
        snapshot.scan_roots.push("/".to_string());

        assert_eq!(snapshot.total_files(), 2);
        assert_eq!(snapshot.total_directories(), 2);
        assert_eq!(snapshot.total_bytes(), 100);

        // 合并后新条目覆盖旧条目，其余目录保留
        let mut sub = Snapshot::default();
        sub.dirs.insert(
            "/@CUP".to_string(),
            vec![RemoteEntry::file("cup.pbo", "/@CUP", 120, None)],
        );
        snapshot.merge(sub);

        assert_eq!(snapshot.dirs["/@CUP"][0].size, 120);
        assert!(snapshot.dirs.contains_key("/"));
    }
}
