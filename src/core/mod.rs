pub mod cache;
pub mod engine;
pub mod planner;
pub mod scanner;
pub mod transfer;

pub use cache::{CacheRecord, SnapshotCache};
pub use engine::{SyncEngine, SyncReport, SyncStatus};
pub use planner::{SyncPlanner, TransferPlan};
pub use scanner::DirectoryScanner;
pub use transfer::{SyncCounters, TransferExecutor};

/// 进度事件发送端，消费方收到的是人类可读的事件字符串
pub type ProgressSink = tokio::sync::mpsc::UnboundedSender<String>;

/// 可选的进度上报句柄
///
/// 发送永不阻塞；没有接收方或接收方已关闭时事件被静默丢弃。
#[derive(Clone, Default)]
pub struct Progress(Option<ProgressSink>);

impl Progress {
    pub fn new(sink: ProgressSink) -> Self {
        Self(Some(sink))
    }

    pub fn none() -> Self {
        Self(None)
    }

    pub fn send(&self, message: impl Into<String>) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(message.into());
        }
    }
}

/// 人类可读的文件大小
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut order = 0;
    while value >= 1024.0 && order < UNITS.len() - 1 {
        value /= 1024.0;
        order += 1;
    }
    if order == 0 {
        format!("{} {}", bytes, UNITS[order])
    } else {
        format!("{:.2} {}", value, UNITS[order])
    }
}
