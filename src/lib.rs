//! modsync - FTP 模组仓库镜像引擎
//!
//! 把一个通过 FTP 访问的远程目录树镜像到本地：并发递归扫描远程
//! 目录、多方言列表解析、带过期与指纹校验的磁盘快照缓存、本地与
//! 远程差异计划、受并发预算限制的下载执行。远程永远是权威来源，
//! 本地独有内容按孤儿清理。
//!
//! 图形界面、仓库目录持久化和进程启动逻辑都不在本 crate 范围内，
//! 调用方通过 [`Repository`] 描述连接信息并消费进度事件字符串。

pub mod config;
pub mod core;
pub mod dirs;
pub mod error;
pub mod logging;
pub mod remote;
pub mod repository;

pub use config::EngineConfig;
pub use core::{
    format_file_size, Progress, ProgressSink, SnapshotCache, SyncCounters, SyncEngine, SyncReport,
    SyncStatus,
};
pub use error::SyncError;
pub use remote::{FtpSource, RemoteEntry, RemoteSource, Snapshot};
pub use repository::Repository;
