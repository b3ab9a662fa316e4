//! 引擎集成测试
//!
//! 用内存中的远程数据源桩驱动完整的同步流程，桩会记录每个路径
//! 被列出的次数，便于验证并发扫描的去重行为。

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use modsync::core::{DirectoryScanner, Progress, SnapshotCache};
use modsync::error::SyncError;
use modsync::remote::{ByteStream, RemoteSource};
use modsync::{EngineConfig, Repository, SyncEngine, SyncStatus};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 内存远程目录树桩
struct StubSource {
    /// 目录路径 -> 原始列表响应文本
    listings: HashMap<String, String>,
    /// 文件路径 -> 内容
    files: HashMap<String, Vec<u8>>,
    list_counts: Mutex<HashMap<String, usize>>,
    /// 每个数据块之间的延迟，用于测试取消
    chunk_delay: Option<Duration>,
    chunk_size: usize,
    fail_check: bool,
}

impl StubSource {
    fn new(listings: HashMap<String, String>, files: HashMap<String, Vec<u8>>) -> Self {
        Self {
            listings,
            files,
            list_counts: Mutex::new(HashMap::new()),
            chunk_delay: None,
            chunk_size: 64 * 1024,
            fail_check: false,
        }
    }

    fn list_count(&self, path: &str) -> usize {
        self.list_counts
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    fn total_list_count(&self) -> usize {
        self.list_counts.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl RemoteSource for StubSource {
    async fn check(&self) -> Result<(), SyncError> {
        if self.fail_check {
            return Err(SyncError::Connectivity("连接被拒绝".to_string()));
        }
        Ok(())
    }

    async fn read_listing(&self, path: &str) -> Result<String, SyncError> {
        *self
            .list_counts
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_insert(0) += 1;
        self.listings
            .get(path)
            .cloned()
            .ok_or_else(|| SyncError::Protocol(format!("目录不存在: {}", path)))
    }

    async fn probe_size(&self, path: &str) -> Result<u64, SyncError> {
        self.files
            .get(path)
            .map(|data| data.len() as u64)
            .ok_or_else(|| SyncError::Protocol(format!("SIZE 被拒绝: {}", path)))
    }

    async fn fetch(&self, path: &str) -> Result<ByteStream, SyncError> {
        let data = self
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| SyncError::Protocol(format!("文件不存在: {}", path)))?;
        let chunks: Vec<Bytes> = data
            .chunks(self.chunk_size.max(1))
            .map(Bytes::copy_from_slice)
            .collect();
        let delay = self.chunk_delay;

        let stream = stream::unfold(chunks.into_iter(), move |mut iter| async move {
            let chunk = iter.next()?;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Some((Ok::<_, std::io::Error>(chunk), iter))
        });
        Ok(Box::pin(stream))
    }

    fn name(&self) -> &str {
        "stub://test"
    }
}

fn facts_line(name: &str, is_dir: bool, size: u64) -> String {
    if is_dir {
        format!("type=dir;size=0;modify=20240315100000; {}", name)
    } else {
        format!("type=file;size={};modify=20240315100000; {}", size, name)
    }
}

/// 根目录下一个模组目录加一个配置文件
fn standard_tree() -> StubSource {
    let mut listings = HashMap::new();
    let mut files = HashMap::new();

    listings.insert(
        "/".to_string(),
        [
            facts_line("@New", true, 0),
            facts_line("server.cfg", false, 5),
        ]
        .join("\r\n"),
    );
    listings.insert("/@New".to_string(), facts_line("new.pbo", false, 3));
    files.insert("/server.cfg".to_string(), b"12345".to_vec());
    files.insert("/@New/new.pbo".to_string(), b"abc".to_vec());

    StubSource::new(listings, files)
}

fn test_repository() -> Repository {
    Repository::new("测试仓库", "ftp.example.com", 21, "user", "pw")
}

fn test_engine(cache_dir: &Path, scan_budget: usize) -> SyncEngine {
    let config = EngineConfig {
        max_concurrent_scans: scan_budget,
        max_concurrent_transfers: 4,
        cache_ttl_secs: 3600,
        connect_timeout_secs: 5,
    };
    SyncEngine::with_cache(config, SnapshotCache::new(cache_dir))
}

#[tokio::test]
async fn full_sync_then_second_run_is_idempotent() {
    let cache_dir = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let engine = test_engine(cache_dir.path(), 4);
    let repo = test_repository();
    let stub = Arc::new(standard_tree());

    let report = engine
        .sync_repository_with_source(stub.clone(), &repo, dest.path(), &Progress::none(), false)
        .await;

    assert!(report.success());
    assert_eq!(report.counters.downloaded, 2);
    assert_eq!(report.counters.deleted, 0);
    assert_eq!(report.counters.failed, 0);
    assert_eq!(
        std::fs::read(dest.path().join("server.cfg")).unwrap(),
        b"12345"
    );
    assert_eq!(
        std::fs::read(dest.path().join("@New/new.pbo")).unwrap(),
        b"abc"
    );

    let listings_after_first = stub.total_list_count();

    // 第二次运行：远程未变，应该全部跳过且不产生删除
    let report = engine
        .sync_repository_with_source(stub.clone(), &repo, dest.path(), &Progress::none(), false)
        .await;

    assert!(report.success());
    assert_eq!(report.counters.downloaded, 0);
    assert_eq!(report.counters.deleted, 0);
    assert_eq!(report.counters.skipped, 2);
    // 缓存命中，没有再扫描
    assert_eq!(stub.total_list_count(), listings_after_first);
}

#[tokio::test]
async fn orphans_deleted_and_matching_files_untouched() {
    let cache_dir = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let engine = test_engine(cache_dir.path(), 4);
    let repo = test_repository();
    let stub = Arc::new(standard_tree());

    // @Old 远程不存在；@New/new.pbo 大小一致不应重新下载
    std::fs::create_dir(dest.path().join("@Old")).unwrap();
    std::fs::write(dest.path().join("@Old/old.pbo"), b"stale").unwrap();
    std::fs::create_dir(dest.path().join("@New")).unwrap();
    std::fs::write(dest.path().join("@New/new.pbo"), b"abc").unwrap();
    std::fs::write(dest.path().join("server.cfg"), b"12345").unwrap();

    let report = engine
        .sync_repository_with_source(stub, &repo, dest.path(), &Progress::none(), false)
        .await;

    assert!(report.success());
    assert_eq!(report.counters.downloaded, 0);
    assert_eq!(report.counters.deleted, 1);
    assert!(!dest.path().join("@Old").exists());
    assert!(dest.path().join("@New/new.pbo").exists());
}

#[tokio::test]
async fn small_budget_scan_lists_each_path_exactly_once() {
    // 六个模组目录，每个三层子目录
    let mut listings = HashMap::new();
    let mut files = HashMap::new();
    let mut root_lines = Vec::new();
    for i in 0..6 {
        let pack = format!("pack{}", i);
        root_lines.push(facts_line(&pack, true, 0));
        let mut pack_lines = Vec::new();
        for j in 0..3 {
            let sub = format!("addons{}", j);
            pack_lines.push(facts_line(&sub, true, 0));
            listings.insert(
                format!("/{}/{}", pack, sub),
                facts_line("mod.pbo", false, 2),
            );
            files.insert(format!("/{}/{}/mod.pbo", pack, sub), b"ab".to_vec());
        }
        listings.insert(format!("/{}", pack), pack_lines.join("\r\n"));
    }
    listings.insert("/".to_string(), root_lines.join("\r\n"));

    let stub = Arc::new(StubSource::new(listings, files));
    let scanner = DirectoryScanner::new(2, CancellationToken::new());
    let snapshot = scanner
        .scan(stub.clone(), "/", &Progress::none())
        .await
        .expect("扫描应成功");

    // 每个路径恰好列出一次
    for (path, count) in stub.list_counts.lock().unwrap().iter() {
        assert_eq!(*count, 1, "路径 {} 被列出 {} 次", path, count);
    }
    assert_eq!(snapshot.total_directories(), 1 + 6 + 18);
    assert_eq!(snapshot.total_files(), 18);

    // 快照内所有 full_path 唯一
    let mut seen = HashSet::new();
    for entry in snapshot.dirs.values().flatten() {
        assert!(
            seen.insert(entry.full_path.clone()),
            "重复路径: {}",
            entry.full_path
        );
    }
}

#[tokio::test]
async fn cancel_mid_download_leaves_no_partial_file() {
    let cache_dir = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let engine = Arc::new(test_engine(cache_dir.path(), 4));
    let repo = test_repository();

    // 一个 2MB 的文件，数据块之间 50ms 延迟，给取消留足窗口
    let mut listings = HashMap::new();
    let mut files = HashMap::new();
    let payload = vec![0xA5u8; 2 * 1024 * 1024];
    listings.insert(
        "/".to_string(),
        facts_line("big.bin", false, payload.len() as u64),
    );
    files.insert("/big.bin".to_string(), payload);
    let mut stub = StubSource::new(listings, files);
    stub.chunk_delay = Some(Duration::from_millis(50));
    let stub = Arc::new(stub);

    let task_engine = engine.clone();
    let task_repo = repo.clone();
    let task_dest = dest.path().to_path_buf();
    let task = tokio::spawn(async move {
        task_engine
            .sync_repository_with_source(stub, &task_repo, &task_dest, &Progress::none(), false)
            .await
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    engine.cancel();
    let report = task.await.unwrap();

    assert_eq!(report.status, SyncStatus::Cancelled);
    assert!(!report.success());
    // 目标路径和临时文件都不应残留
    assert!(!dest.path().join("big.bin").exists());
    assert!(!dest.path().join("big.bin.part").exists());
}

#[tokio::test]
async fn fingerprint_change_forces_rescan() {
    let cache_dir = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let engine = test_engine(cache_dir.path(), 4);
    let mut repo = test_repository();
    let stub = Arc::new(standard_tree());

    let report = engine
        .sync_repository_with_source(stub.clone(), &repo, dest.path(), &Progress::none(), false)
        .await;
    assert!(report.success());
    let listings_after_first = stub.total_list_count();

    // 同一 id 换主机：缓存必须按无效处理并重新扫描
    repo.host = "mirror.example.com".to_string();
    let report = engine
        .sync_repository_with_source(stub.clone(), &repo, dest.path(), &Progress::none(), false)
        .await;

    assert!(report.success());
    assert!(stub.total_list_count() > listings_after_first);
}

#[tokio::test]
async fn unix_listing_dialect_synced_correctly() {
    let cache_dir = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let engine = test_engine(cache_dir.path(), 4);
    let repo = test_repository();

    // facts 解析失败后回退到 Unix 方言
    let mut listings = HashMap::new();
    let mut files = HashMap::new();
    listings.insert(
        "/".to_string(),
        "total 2\r\n\
         drwxr-xr-x   2 ftp  ftp         0 Dec 01 12:00 @ACE\r\n\
         -rw-r--r--   1 ftp  ftp         5 Dec 01 12:00 server.cfg\r\n"
            .to_string(),
    );
    listings.insert(
        "/@ACE".to_string(),
        "-rw-r--r--   1 ftp  ftp         3 Dec 01 12:00 ace_main.pbo\r\n".to_string(),
    );
    files.insert("/server.cfg".to_string(), b"12345".to_vec());
    files.insert("/@ACE/ace_main.pbo".to_string(), b"ace".to_vec());
    let stub = Arc::new(StubSource::new(listings, files));

    let report = engine
        .sync_repository_with_source(stub, &repo, dest.path(), &Progress::none(), false)
        .await;

    assert!(report.success());
    assert_eq!(report.counters.downloaded, 2);
    assert!(dest.path().join("@ACE").is_dir());
    assert_eq!(
        std::fs::read(dest.path().join("@ACE/ace_main.pbo")).unwrap(),
        b"ace"
    );
}

#[tokio::test]
async fn bare_name_listing_resolved_by_probe() {
    let cache_dir = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let engine = test_engine(cache_dir.path(), 4);
    let repo = test_repository();

    // 裸名清单：SIZE 成功的是文件，失败的按目录处理
    let mut listings = HashMap::new();
    let mut files = HashMap::new();
    listings.insert("/".to_string(), "readme.txt\r\n@Mods\r\n".to_string());
    listings.insert("/@Mods".to_string(), "a.pbo\r\n".to_string());
    files.insert("/readme.txt".to_string(), b"hi".to_vec());
    files.insert("/@Mods/a.pbo".to_string(), b"pbo!".to_vec());
    let stub = Arc::new(StubSource::new(listings, files));

    let report = engine
        .sync_repository_with_source(stub, &repo, dest.path(), &Progress::none(), false)
        .await;

    assert!(report.success());
    assert_eq!(report.counters.downloaded, 2);
    assert_eq!(std::fs::read(dest.path().join("readme.txt")).unwrap(), b"hi");
    assert_eq!(
        std::fs::read(dest.path().join("@Mods/a.pbo")).unwrap(),
        b"pbo!"
    );
}

#[tokio::test]
async fn connectivity_failure_fails_whole_call() {
    let cache_dir = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let engine = test_engine(cache_dir.path(), 4);
    let repo = test_repository();

    let mut stub = standard_tree();
    stub.fail_check = true;
    let stub = Arc::new(stub);

    let report = engine
        .sync_repository_with_source(stub.clone(), &repo, dest.path(), &Progress::none(), false)
        .await;

    assert_eq!(report.status, SyncStatus::Failed);
    assert!(!report.errors.is_empty());
    // 预检失败后不应有任何扫描发生
    assert_eq!(stub.total_list_count(), 0);
    assert!(std::fs::read_dir(dest.path()).unwrap().next().is_none());
}

#[tokio::test]
async fn broken_subtree_does_not_abort_siblings() {
    let cache_dir = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let engine = test_engine(cache_dir.path(), 4);
    let repo = test_repository();

    // @Broken 在根目录可见，但它自身列不出来
    let mut listings = HashMap::new();
    let mut files = HashMap::new();
    listings.insert(
        "/".to_string(),
        [
            facts_line("@Broken", true, 0),
            facts_line("@Good", true, 0),
        ]
        .join("\r\n"),
    );
    listings.insert("/@Good".to_string(), facts_line("good.pbo", false, 4));
    files.insert("/@Good/good.pbo".to_string(), b"good".to_vec());
    let stub = Arc::new(StubSource::new(listings, files));

    let report = engine
        .sync_repository_with_source(stub, &repo, dest.path(), &Progress::none(), false)
        .await;

    assert!(report.success());
    assert_eq!(report.counters.downloaded, 1);
    assert!(dest.path().join("@Good/good.pbo").exists());
}

#[tokio::test]
async fn sync_folder_reuses_covering_cache() {
    let cache_dir = tempfile::tempdir().unwrap();
    let engine = test_engine(cache_dir.path(), 4);
    let repo = test_repository();
    let stub = Arc::new(standard_tree());

    // 先整库同步建立覆盖全树的缓存
    let dest_full = tempfile::tempdir().unwrap();
    let report = engine
        .sync_repository_with_source(
            stub.clone(),
            &repo,
            dest_full.path(),
            &Progress::none(),
            false,
        )
        .await;
    assert!(report.success());
    let listings_after_full = stub.total_list_count();

    // 单独同步 /@New：缓存覆盖该路径，不需要再扫描
    let dest_folder = tempfile::tempdir().unwrap();
    let report = engine
        .sync_folder_with_source(
            stub.clone(),
            &repo,
            "/@New",
            dest_folder.path(),
            &Progress::none(),
        )
        .await;

    assert!(report.success());
    assert_eq!(report.counters.downloaded, 1);
    assert_eq!(stub.total_list_count(), listings_after_full);
    assert_eq!(
        std::fs::read(dest_folder.path().join("new.pbo")).unwrap(),
        b"abc"
    );
}

#[tokio::test]
async fn browse_is_cached_and_does_not_rescan() {
    let cache_dir = tempfile::tempdir().unwrap();
    let engine = test_engine(cache_dir.path(), 4);
    let repo = test_repository();
    let stub = Arc::new(standard_tree());

    let entries = engine
        .browse_with_source(stub.clone(), &repo, "/")
        .await
        .expect("浏览应成功");
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().any(|e| e.name == "@New" && e.is_dir));
    assert_eq!(stub.list_count("/"), 1);

    // 第二次浏览命中缓存
    let entries = engine
        .browse_with_source(stub.clone(), &repo, "/")
        .await
        .expect("浏览应成功");
    assert_eq!(entries.len(), 2);
    assert_eq!(stub.list_count("/"), 1);
}

#[tokio::test]
async fn logging_init_writes_to_log_dir() {
    let log_dir = tempfile::tempdir().unwrap();
    let config = modsync::logging::LogConfig::default();

    // 全局 subscriber 只能装一次，重复初始化返回 None 也算正常
    let guard = modsync::logging::init(&config, log_dir.path());
    tracing::info!("日志初始化测试");
    drop(guard);

    assert!(log_dir.path().exists());
}

#[tokio::test]
async fn progress_events_are_emitted() {
    let cache_dir = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let engine = test_engine(cache_dir.path(), 4);
    let repo = test_repository();
    let stub = Arc::new(standard_tree());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let report = engine
        .sync_repository_with_source(stub, &repo, dest.path(), &Progress::new(tx), false)
        .await;
    assert!(report.success());

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    assert!(events.iter().any(|e| e.contains("正在连接")));
    assert!(events.iter().any(|e| e.contains("已扫描: /")));
    assert!(events.iter().any(|e| e.contains("下载:")));
    assert!(events.iter().any(|e| e.contains("同步完成")));
}
