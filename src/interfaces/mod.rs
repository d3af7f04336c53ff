//! 外部协作者契约 (External Collaborator Contracts)
//!
//! 采集源与上报端只以 trait 形式存在于核心；Telegram 爬虫、机器人上报等
//! 具体实现位于仓库之外，核心必须在零源、仅缓存、单源存活等场景下工作。

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::model::BenchResult;

/// 候选 URI 采集源
///
/// 实现可以超时、可以返回空，但永远不向外抛错。
#[async_trait]
pub trait Source: Send + Sync {
    /// 源标识，用于日志归因
    fn name(&self) -> &str;

    /// 拉取一批原始 URI；失败一律折叠为空列表
    async fn fetch(&self, cancel: &CancellationToken) -> Vec<String>;
}

/// 周期结果上报端 (fire-and-forget)
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, gold: &[BenchResult]);
}

/// 缺省上报端：仅写入结构化日志
pub struct LogReporter;

#[async_trait]
impl Reporter for LogReporter {
    async fn report(&self, gold: &[BenchResult]) {
        let best = gold.first().map(|r| r.latency_ms);
        info!(gold = gold.len(), best_ms = best, "Cycle report");
    }
}
