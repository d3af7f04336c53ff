//! 基准测试引擎 (Benchmark Engine)
//!
//! 在全局撤回令牌与内存背压约束下，对已排序的候选 URI 执行有界并发验证。
//! 单条 URI 内部按引擎顺序串行回退；URI 之间不承诺任何顺序。

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::config::AppConfig;
use crate::core::model::{BenchResult, ParsedConfig};
use crate::engine::memory::{MemoryReading, MemoryWatch};
use crate::engine::ports::PortPool;
use crate::engine::probe;
use crate::engine::runner::{EngineKind, EngineRunner};
use crate::utils::{parser, xconfig};

/// 分片大小：每批最多同时在途的候选数
pub const CHUNK_SIZE: usize = 50;
/// 引擎拉起后的绑定等待
const STARTUP_WAIT: Duration = Duration::from_millis(1500);
/// 分片之间的释放间歇
const INTER_CHUNK_PAUSE: Duration = Duration::from_millis(200);
/// 软水位触发的退让休眠
const PRESSURE_PAUSE: Duration = Duration::from_millis(500);

/// 软水位：强制释放 + 退让
const SOFT_PRESSURE_PCT: f64 = 85.0;
/// 硬水位：放弃本周期剩余分片
const HARD_PRESSURE_PCT: f64 = 90.0;
/// 低内存阈值 (MiB)，触发并发降档
const LOW_MEMORY_MIB: u64 = 500;
const LOW_MEMORY_WORKERS: usize = 8;

/// 单次基准测试的选项集
#[derive(Debug, Clone)]
pub struct BenchOptions {
    pub workers: usize,
    pub timeout: Duration,
    pub test_url: String,
    /// 引擎尝试顺序，首个成功即停
    pub engine_order: Vec<EngineKind>,
    /// 测试模式：跳过引擎，产出 [50,300] ms 均匀随机延迟
    pub test_mode: bool,
}

impl BenchOptions {
    pub fn from_config(config: &AppConfig, engine_order: Vec<EngineKind>) -> Self {
        Self {
            workers: config.workers,
            timeout: config.probe_timeout(),
            test_url: config.test_url.clone(),
            engine_order,
            test_mode: config.test_mode,
        }
    }
}

/// 自适应并发：min(userCap, max(1, min(cpu*2, 150)))，低内存时降至 8
pub(crate) fn effective_workers(user_cap: usize, mem: MemoryReading) -> usize {
    let cpu = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let adaptive = (cpu * 2).min(150).max(1);
    let mut workers = user_cap.min(adaptive).max(1);
    if mem.available_mib < LOW_MEMORY_MIB {
        workers = workers.min(LOW_MEMORY_WORKERS);
    }
    workers
}

pub struct BenchmarkEngine {
    runner: Arc<EngineRunner>,
    ports: Arc<PortPool>,
    memory: Arc<MemoryWatch>,
}

impl BenchmarkEngine {
    pub fn new(runner: Arc<EngineRunner>, ports: Arc<PortPool>, memory: Arc<MemoryWatch>) -> Self {
        Self {
            runner,
            ports,
            memory,
        }
    }

    /// 验证候选列表，返回按延迟升序排序的存活结果
    ///
    /// 操作自身永不失败；单条失败静默丢弃 (debug 级记录)。
    /// 返回前所有引擎子进程与临时配置都已回收。
    pub async fn benchmark(
        &self,
        uris: &[String],
        opts: &BenchOptions,
        cancel: &CancellationToken,
    ) -> Vec<BenchResult> {
        let workers = effective_workers(opts.workers, self.memory.read());
        let sem = Arc::new(Semaphore::new(workers));
        let opts = Arc::new(opts.clone());
        let mut results: Vec<BenchResult> = Vec::new();

        info!(
            candidates = uris.len(),
            workers,
            test_mode = opts.test_mode,
            "Benchmark pass started"
        );

        for chunk in uris.chunks(CHUNK_SIZE) {
            if cancel.is_cancelled() {
                break;
            }

            let mem = self.memory.read();
            if mem.used_percent >= HARD_PRESSURE_PCT {
                warn!(
                    used = format!("{:.1}%", mem.used_percent),
                    "Memory ceiling reached, aborting remaining chunks"
                );
                break;
            }
            if mem.used_percent >= SOFT_PRESSURE_PCT {
                debug!("Memory pressure, backing off");
                results.shrink_to_fit();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(PRESSURE_PAUSE) => {}
                }
            }

            let mut set: JoinSet<Option<BenchResult>> = JoinSet::new();
            for uri in chunk {
                let Some(parsed) = parser::parse(uri) else {
                    debug!("Unparsable candidate dropped");
                    continue;
                };

                set.spawn(bench_one(
                    self.runner.clone(),
                    self.ports.clone(),
                    sem.clone(),
                    cancel.clone(),
                    opts.clone(),
                    uri.clone(),
                    parsed,
                ));
            }

            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(Some(result)) => results.push(result),
                    Ok(None) => {}
                    Err(e) => error!("Bench worker join error: {}", e),
                }
            }

            results.shrink_to_fit();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(INTER_CHUNK_PAUSE) => {}
            }
        }

        results.sort_by_key(|r| r.latency_ms);
        info!(alive = results.len(), "Benchmark pass finished");
        results
    }
}

/// 单候选验证：租端口、按序尝试引擎、首个成功立即返回
///
/// 第一个引擎使用 max(3s, timeout/2) 的快速预算，后续引擎拿全额预算。
async fn bench_one(
    runner: Arc<EngineRunner>,
    ports: Arc<PortPool>,
    sem: Arc<Semaphore>,
    cancel: CancellationToken,
    opts: Arc<BenchOptions>,
    uri: String,
    parsed: ParsedConfig,
) -> Option<BenchResult> {
    let _permit = sem.acquire_owned().await.ok()?;
    if cancel.is_cancelled() {
        return None;
    }

    if opts.test_mode {
        let latency = rand::rng().random_range(50..=300);
        return Some(BenchResult::new(uri, parsed, latency));
    }

    let lease = ports.acquire(&cancel).await?;
    let port = lease.port();
    let doc = xconfig::bench_config(&parsed.outbound, port);
    let label = format!("bench-{port}");

    let mut budget = std::cmp::max(Duration::from_secs(3), opts.timeout / 2);

    for engine in &opts.engine_order {
        let mut handle = match runner.start(*engine, &doc, port, &label).await {
            Ok(h) => h,
            Err(e) => {
                debug!("{} start failed: {:#}", engine, e);
                budget = opts.timeout;
                continue;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                runner.stop(&mut handle).await;
                return None;
            }
            _ = tokio::time::sleep(STARTUP_WAIT) => {}
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                runner.stop(&mut handle).await;
                return None;
            }
            r = probe::probe(port, &opts.test_url, budget) => r,
        };
        runner.stop(&mut handle).await;

        match outcome {
            Ok(latency_ms) => {
                debug!("{} ok via {} in {}ms", parsed.host, engine, latency_ms);
                return Some(BenchResult::new(uri, parsed, latency_ms));
            }
            Err(e) => {
                debug!("{} probe failed via {}: {}", parsed.host, engine, e);
                budget = opts.timeout;
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::Tier;

    fn engine_under_test(memory: MemoryWatch) -> BenchmarkEngine {
        let mut cfg = AppConfig::default();
        cfg.runtime_dir = std::env::temp_dir()
            .join(format!("hunter-bench-test-{}", std::process::id()))
            .display()
            .to_string();
        BenchmarkEngine::new(
            Arc::new(EngineRunner::new(&cfg)),
            Arc::new(PortPool::new(23800, 8)),
            Arc::new(memory),
        )
    }

    fn test_opts() -> BenchOptions {
        BenchOptions {
            workers: 10,
            timeout: Duration::from_secs(5),
            test_url: "https://www.gstatic.com/generate_204".into(),
            engine_order: EngineKind::fallback_order().to_vec(),
            test_mode: true,
        }
    }

    fn synthetic_uris() -> Vec<String> {
        vec![
            "vless://7f0e6a9c-2f92-4c3a-9f09-3d6318cb55e2@a.example:443?security=reality&pbk=k#1"
                .to_string(),
            "trojan://pw@b.example:443?security=tls&type=ws#2".to_string(),
            "ss://YWVzLTI1Ni1nY206cGFzcw@4.3.2.1:8388#3".to_string(),
            "not-a-proxy-uri-at-all".to_string(),
        ]
    }

    #[tokio::test]
    async fn test_mode_emits_plausible_results() {
        let engine = engine_under_test(MemoryWatch::fixed(40.0, 4096));
        let cancel = CancellationToken::new();

        let results = engine
            .benchmark(&synthetic_uris(), &test_opts(), &cancel)
            .await;

        // 三条可解析，一条垃圾被丢弃
        assert_eq!(results.len(), 3);
        for r in &results {
            assert!((50..=300).contains(&r.latency_ms));
            assert!(r.latency_ms > 0);
            assert_eq!(r.tier, Tier::from_latency(r.latency_ms));
            assert!(matches!(r.tier, Tier::Gold | Tier::Silver));
            assert!(synthetic_uris().contains(&r.uri));
        }

        // 升序排序
        let latencies: Vec<u64> = results.iter().map(|r| r.latency_ms).collect();
        let mut sorted = latencies.clone();
        sorted.sort_unstable();
        assert_eq!(latencies, sorted);
    }

    #[tokio::test]
    async fn memory_ceiling_aborts_all_chunks() {
        let engine = engine_under_test(MemoryWatch::fixed(92.0, 300));
        let cancel = CancellationToken::new();

        let uris: Vec<String> = (0..120)
            .map(|i| format!("trojan://pw@host{i}.example:443?security=tls#n{i}"))
            .collect();
        let results = engine.benchmark(&uris, &test_opts(), &cancel).await;

        assert!(results.is_empty());
    }

    #[test]
    fn low_memory_clamps_workers_to_eight() {
        let reading = MemoryReading {
            used_percent: 92.0,
            available_mib: 300,
        };
        assert_eq!(effective_workers(100, reading), 8);

        let healthy = MemoryReading {
            used_percent: 20.0,
            available_mib: 8192,
        };
        assert!(effective_workers(1, healthy) == 1);
        assert!(effective_workers(100, healthy) <= 150);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let engine = engine_under_test(MemoryWatch::fixed(40.0, 4096));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let results = engine
            .benchmark(&synthetic_uris(), &test_opts(), &cancel)
            .await;
        assert!(results.is_empty());
    }
}
