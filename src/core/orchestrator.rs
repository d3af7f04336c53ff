//! 周期编排器 (Cycle Orchestrator)
//!
//! 顶层驱动：采集扇出 → 去重排序 → 基准测试 → 分级 → 均衡器换池 → 缓存落盘。
//! 周期按固定间隔推进，间隔休眠以 ≤1s 切片执行以保持对停机信号的响应。

use std::sync::Arc;
use std::time::{Duration, Instant};

use flume::Sender;
use indexmap::IndexSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::actors::balancer::BalancerMsg;
use crate::core::config::AppConfig;
use crate::core::model::{BenchResult, CandidateSeed, Tier};
use crate::engine::bench::{BenchOptions, BenchmarkEngine};
use crate::engine::runner::{EngineKind, EngineRunner};
use crate::interfaces::Reporter;
use crate::sources::SourceSet;
use crate::utils::cache::{CacheFile, CacheStore};
use crate::utils::{now_unix, priority};

/// 采集量低于此阈值时并入磁盘缓存热启动
const MIN_POOL: usize = 500;
/// 金级结果入池上限
const GOLD_CAP: usize = 100;
/// 银级结果入池上限
const SILVER_CAP: usize = 200;
/// 连续采集失败达到该值后整体回退至工作集缓存
const FALLBACK_AFTER_FAILURES: u32 = 2;

/// 单周期的统计摘要
#[derive(Debug, Default)]
pub struct CycleSummary {
    pub scraped: usize,
    pub candidates: usize,
    pub alive: usize,
    pub gold: usize,
    pub silver: usize,
}

pub struct Orchestrator {
    config: Arc<AppConfig>,
    sources: SourceSet,
    bench: BenchmarkEngine,
    runner: Arc<EngineRunner>,
    balancer: Sender<BalancerMsg>,
    cache: Arc<CacheStore>,
    reporter: Arc<dyn Reporter>,
    cancel: CancellationToken,
    cycle: u64,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<AppConfig>,
        sources: SourceSet,
        bench: BenchmarkEngine,
        runner: Arc<EngineRunner>,
        balancer: Sender<BalancerMsg>,
        cache: Arc<CacheStore>,
        reporter: Arc<dyn Reporter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            sources,
            bench,
            runner,
            balancer,
            cache,
            reporter,
            cancel,
            cycle: 0,
        }
    }

    /// 主循环：热启动均衡器后按固定间隔推进周期直到撤回
    pub async fn run(&mut self) {
        let seed = self.cache.load_balancer_seed().await;
        if !seed.is_empty() {
            info!(seed = seed.len(), "Warm-starting balancer from disk cache");
        }
        let _ = self.balancer.send(BalancerMsg::Start { seed });

        while !self.cancel.is_cancelled() {
            self.cycle += 1;
            let started = Instant::now();
            info!(cycle = self.cycle, "Cycle started");

            let summary = self.run_cycle().await;
            info!(
                cycle = self.cycle,
                scraped = summary.scraped,
                candidates = summary.candidates,
                alive = summary.alive,
                gold = summary.gold,
                silver = summary.silver,
                elapsed_s = started.elapsed().as_secs(),
                "Cycle finished"
            );

            if !self.sleep_between_cycles().await {
                break;
            }
        }
        info!("Orchestrator loop terminated");
    }

    /// 执行单个完整周期
    async fn run_cycle(&self) -> CycleSummary {
        let mut summary = CycleSummary::default();

        // 1. 采集扇出，单源失败已在源内折叠为空
        let mut raw: IndexSet<String> = self.sources.scrape_all(&self.cancel).await;
        summary.scraped = raw.len();

        if raw.is_empty() {
            let failures = self.cache.record_fetch_failure();
            if failures >= FALLBACK_AFTER_FAILURES {
                warn!(failures, "All sources dry, falling back to working-set cache");
                raw = self
                    .cache
                    .load(CacheFile::Working, self.config.max_configs)
                    .await
                    .into_iter()
                    .collect();
            }
        } else {
            self.cache.record_fetch_success();
        }

        // 2. 采集量不足时并入原始缓存热启动
        if raw.len() < MIN_POOL {
            let cached = self
                .cache
                .load(CacheFile::Raw, self.config.max_configs)
                .await;
            debug!(cached = cached.len(), "Merging warm-start cache");
            raw.extend(cached);
        }

        // 3. 原始集 append-unique 落盘
        self.cache.append_unique(CacheFile::Raw, &raw).await;

        // 4. 去重 + 排序 + 截断
        let nonce = self.cycle.wrapping_mul(0x9e3779b9).wrapping_add(now_unix());
        let candidates = priority::prioritize(raw, self.config.max_configs, nonce);
        summary.candidates = candidates.len();

        if self.cancel.is_cancelled() {
            return summary;
        }

        // 5. 基准测试
        let opts = BenchOptions::from_config(&self.config, self.engine_order());
        let results = self.bench.benchmark(&candidates, &opts, &self.cancel).await;
        summary.alive = results.len();

        // 6. 幸存者进入工作集缓存
        let survivors: IndexSet<String> = results.iter().map(|r| r.uri.clone()).collect();
        self.cache
            .append_unique(CacheFile::Working, &survivors)
            .await;

        // 7. 分级与截断
        let gold: Vec<&BenchResult> = results
            .iter()
            .filter(|r| r.tier == Tier::Gold)
            .take(GOLD_CAP)
            .collect();
        let silver: Vec<&BenchResult> = results
            .iter()
            .filter(|r| r.tier == Tier::Silver)
            .take(SILVER_CAP)
            .collect();
        summary.gold = gold.len();
        summary.silver = silver.len();

        // 8. 原子换池：金级在前，银级垫后
        let pool: Vec<CandidateSeed> = gold
            .iter()
            .chain(silver.iter())
            .map(|r| CandidateSeed::from(*r))
            .collect();
        let _ = self
            .balancer
            .send(BalancerMsg::UpdateAvailable { candidates: pool.clone() });

        // 9. 均衡器热启动种子落盘
        self.cache.save_balancer_seed(&pool).await;

        // 10. 分级清单导出
        let gold_uris: Vec<String> = gold.iter().map(|r| r.uri.clone()).collect();
        let silver_uris: Vec<String> = silver.iter().map(|r| r.uri.clone()).collect();
        self.cache.write_tier_dumps(&gold_uris, &silver_uris).await;

        // 11. fire-and-forget 上报
        let reporter = self.reporter.clone();
        let gold_owned: Vec<BenchResult> = gold.into_iter().cloned().collect();
        tokio::spawn(async move {
            reporter.report(&gold_owned).await;
        });

        summary
    }

    /// 引擎尝试顺序：优先探测到的可用引擎，全部缺席时保留默认顺序
    fn engine_order(&self) -> Vec<EngineKind> {
        let available = self.runner.available();
        if available.is_empty() {
            EngineKind::fallback_order().to_vec()
        } else {
            available
        }
    }

    /// 周期间隔休眠，以 1s 切片保持可中断；返回 false 表示应当退出
    async fn sleep_between_cycles(&self) -> bool {
        debug!(seconds = self.config.sleep_seconds, "Sleeping until next cycle");
        for _ in 0..self.config.sleep_seconds {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
        !self.cancel.is_cancelled()
    }
}
