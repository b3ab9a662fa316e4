//! 错误类型定义
//!
//! 只有连接失败和取消会改变整次同步的结果，其余错误均限定在
//! 单个文件或子目录范围内，由调用方记录后继续。

use thiserror::Error;

/// 同步引擎错误
#[derive(Debug, Error)]
pub enum SyncError {
    /// 无法连接或登录远程仓库（整次同步失败）
    #[error("无法连接仓库: {0}")]
    Connectivity(String),

    /// 目录列表获取或解析失败（仅放弃该子树）
    #[error("获取目录列表失败: {path}: {reason}")]
    Listing { path: String, reason: String },

    /// 单个文件传输失败（仅该文件计为失败）
    #[error("传输失败: {path}: {reason}")]
    Transfer { path: String, reason: String },

    /// 缓存读写失败（降级为缓存未命中）
    #[error("缓存操作失败: {0}")]
    Cache(String),

    /// 用户取消，不视为错误
    #[error("操作已取消")]
    Cancelled,

    /// FTP 协议层错误
    #[error("协议错误: {0}")]
    Protocol(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }

    /// 包装为目录列表错误
    pub fn into_listing(self, path: &str) -> SyncError {
        match self {
            SyncError::Cancelled => SyncError::Cancelled,
            other => SyncError::Listing {
                path: path.to_string(),
                reason: other.to_string(),
            },
        }
    }

    /// 包装为传输错误
    pub fn into_transfer(self, path: &str) -> SyncError {
        match self {
            SyncError::Cancelled => SyncError::Cancelled,
            other => SyncError::Transfer {
                path: path.to_string(),
                reason: other.to_string(),
            },
        }
    }
}
