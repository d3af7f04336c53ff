//! 磁盘缓存 (Persistent Caches)
//!
//! 维护原始订阅集、工作集的 append-unique 文本缓存，以及均衡器热启动种子。
//! 所有 I/O 失败仅记录日志，不影响周期推进。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::model::CandidateSeed;
use crate::utils::now_unix;

const RAW_CACHE_FILE: &str = "subscriptions_cache.txt";
const WORKING_CACHE_FILE: &str = "working_configs_cache.txt";
const BALANCER_CACHE_FILE: &str = "HUNTER_balancer_cache.json";
const GOLD_FILE: &str = "HUNTER_gold.txt";
const SILVER_FILE: &str = "HUNTER_silver.txt";

/// 均衡器缓存条目上限
const BALANCER_CACHE_CAP: usize = 1000;

/// append-unique 缓存文件选择器
#[derive(Debug, Clone, Copy)]
pub enum CacheFile {
    /// 见过的全部原始 URI
    Raw,
    /// 至少通过一次基准测试的 URI
    Working,
}

impl CacheFile {
    fn filename(self) -> &'static str {
        match self {
            CacheFile::Raw => RAW_CACHE_FILE,
            CacheFile::Working => WORKING_CACHE_FILE,
        }
    }
}

/// 均衡器热启动种子的磁盘格式
#[derive(Debug, Serialize, Deserialize)]
struct BalancerCache {
    saved_at: u64,
    configs: Vec<CandidateSeed>,
}

/// 缓存存储，单写者多读者
pub struct CacheStore {
    dir: PathBuf,
    /// 连续采集失败计数，任何一次成功即清零
    consecutive_failures: AtomicU32,
}

impl CacheStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    async fn ensure_dir(&self) {
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            warn!("Cache dir creation failed: {}", e);
        }
    }

    // --- append-unique 文本缓存 ---

    /// 追加去重后的新行，返回实际写入条数
    ///
    /// 对同一集合重复调用不会增加文件行数 (幂等)。
    pub async fn append_unique(&self, file: CacheFile, uris: &IndexSet<String>) -> usize {
        self.ensure_dir().await;
        let path = self.path(file.filename());

        let existing: IndexSet<String> = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text.lines().map(str::to_string).collect(),
            Err(_) => IndexSet::new(),
        };

        let fresh: Vec<&String> = uris
            .iter()
            .filter(|u| !u.trim().is_empty() && !existing.contains(u.as_str()))
            .collect();

        if fresh.is_empty() {
            return 0;
        }

        let mut block = String::new();
        for uri in &fresh {
            block.push_str(uri);
            block.push('\n');
        }

        use tokio::io::AsyncWriteExt;
        let result = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await;

        match result {
            Ok(mut f) => {
                if let Err(e) = f.write_all(block.as_bytes()).await {
                    warn!("Cache append failed ({}): {}", file.filename(), e);
                    return 0;
                }
                debug!("Appended {} entries to {}", fresh.len(), file.filename());
                fresh.len()
            }
            Err(e) => {
                warn!("Cache open failed ({}): {}", file.filename(), e);
                0
            }
        }
    }

    /// 读取缓存文件，最多返回 `max` 条
    pub async fn load(&self, file: CacheFile, max: usize) -> Vec<String> {
        match tokio::fs::read_to_string(self.path(file.filename())).await {
            Ok(text) => text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .take(max)
                .map(str::to_string)
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    // --- 均衡器热启动种子 ---

    /// 持久化均衡器种子，内容未变化时跳过重写
    pub async fn save_balancer_seed(&self, seeds: &[CandidateSeed]) {
        self.ensure_dir().await;
        let cache = BalancerCache {
            saved_at: now_unix(),
            configs: seeds.iter().take(BALANCER_CACHE_CAP).cloned().collect(),
        };

        let json = match serde_json::to_string_pretty(&cache) {
            Ok(j) => j,
            Err(e) => {
                warn!("Balancer cache serialization failed: {}", e);
                return;
            }
        };

        let path = self.path(BALANCER_CACHE_FILE);

        // saved_at 之外的内容一致则无需落盘
        if let Ok(old) = tokio::fs::read_to_string(&path).await
            && let (Ok(old_cache), Ok(new_configs)) = (
                serde_json::from_str::<BalancerCache>(&old),
                serde_json::to_vec(&cache.configs),
            )
            && let Ok(old_configs) = serde_json::to_vec(&old_cache.configs)
            && blake3::hash(&old_configs) == blake3::hash(&new_configs)
        {
            debug!("Balancer cache unchanged, skipping rewrite");
            return;
        }

        if let Err(e) = tokio::fs::write(&path, json).await {
            warn!("Balancer cache write failed: {}", e);
        }
    }

    /// 读取均衡器种子 (热启动)
    pub async fn load_balancer_seed(&self) -> Vec<CandidateSeed> {
        let path = self.path(BALANCER_CACHE_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => match serde_json::from_str::<BalancerCache>(&text) {
                Ok(cache) => {
                    let age = now_unix().saturating_sub(cache.saved_at);
                    debug!(
                        entries = cache.configs.len(),
                        age_secs = age,
                        "Balancer cache loaded"
                    );
                    cache.configs
                }
                Err(e) => {
                    warn!("Balancer cache corrupt, ignoring: {}", e);
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        }
    }

    /// 导出分级结果 (换行分隔的 URI 清单)
    pub async fn write_tier_dumps(&self, gold: &[String], silver: &[String]) {
        self.ensure_dir().await;
        for (name, uris) in [(GOLD_FILE, gold), (SILVER_FILE, silver)] {
            let body = uris.join("\n");
            if let Err(e) = tokio::fs::write(self.path(name), body).await {
                warn!("Tier dump write failed ({}): {}", name, e);
            }
        }
    }

    // --- 采集失败计数 ---

    pub fn record_fetch_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn record_fetch_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(tag: &str) -> CacheStore {
        let dir = std::env::temp_dir().join(format!("hunter-cache-test-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        CacheStore::new(dir)
    }

    fn set_of(items: &[&str]) -> IndexSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn append_unique_is_idempotent() {
        let store = temp_store("idem");
        let uris = set_of(&["vmess://aaa", "vless://bbb", "trojan://ccc"]);

        assert_eq!(store.append_unique(CacheFile::Raw, &uris).await, 3);
        assert_eq!(store.append_unique(CacheFile::Raw, &uris).await, 0);

        let loaded = store.load(CacheFile::Raw, usize::MAX).await;
        assert_eq!(loaded.len(), 3);
    }

    #[tokio::test]
    async fn append_unique_merges_new_entries_only() {
        let store = temp_store("merge");
        store
            .append_unique(CacheFile::Working, &set_of(&["ss://one", "ss://two"]))
            .await;
        let added = store
            .append_unique(CacheFile::Working, &set_of(&["ss://two", "ss://three"]))
            .await;

        assert_eq!(added, 1);
        assert_eq!(store.load(CacheFile::Working, usize::MAX).await.len(), 3);
    }

    #[tokio::test]
    async fn balancer_seed_round_trip() {
        let store = temp_store("seed");
        let seeds = vec![
            CandidateSeed {
                uri: "vless://u@h:443?security=tls#a".into(),
                latency_ms: 120,
            },
            CandidateSeed {
                uri: "trojan://p@h2:443#b".into(),
                latency_ms: 310,
            },
        ];

        store.save_balancer_seed(&seeds).await;
        let loaded = store.load_balancer_seed().await;

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].uri, seeds[0].uri);
        assert_eq!(loaded[0].latency_ms, 120);
    }

    #[tokio::test]
    async fn missing_files_load_empty() {
        let store = temp_store("empty");
        assert!(store.load(CacheFile::Raw, 100).await.is_empty());
        assert!(store.load_balancer_seed().await.is_empty());
    }

    #[test]
    fn failure_counter_resets_on_success() {
        let store = temp_store("fail");
        assert_eq!(store.record_fetch_failure(), 1);
        assert_eq!(store.record_fetch_failure(), 2);
        store.record_fetch_success();
        assert_eq!(store.consecutive_failures(), 0);
    }
}
