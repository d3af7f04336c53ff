//! 负载均衡监督者 (Load Balancer Supervisor Actor)
//!
//! 对外提供单一稳定的本地 SOCKS5 端点，由一个多出站引擎子进程按连接随机
//! 选路。候选池可被编排器原子替换；健康环在后端全灭时重新选种并重启引擎。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, Sender};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::config::AppConfig;
use crate::core::model::{BalancerStats, CandidateSeed};
use crate::engine::ports::PortPool;
use crate::engine::probe;
use crate::engine::runner::{EngineHandle, EngineKind, EngineRunner};
use crate::utils::{now_unix, parser, xconfig};

/// 候选预筛探测的时间预算
const CANDIDATE_PROBE_TIMEOUT: Duration = Duration::from_secs(3);
/// 新引擎拉起后的绑定确认等待
const BIND_WAIT: Duration = Duration::from_millis(1000);
/// 健康检查中的握手超时
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Actor Messages
pub enum BalancerMsg {
    /// 以种子列表开始服务 (通常来自上个周期的磁盘缓存)
    Start { seed: Vec<CandidateSeed> },
    /// 原子替换候选池；健康后端不足 K 时立即补位
    UpdateAvailable { candidates: Vec<CandidateSeed> },
    /// 运行状态快照
    Status { reply: Sender<BalancerStats> },
    /// 终止服务引擎与全部循环
    Stop {
        reply: Option<tokio::sync::oneshot::Sender<()>>,
    },
}

/// 监督者状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Reseeding,
}

/// 在役后端，由监督者独占持有
struct Backend {
    seed: CandidateSeed,
    outbound: Value,
    healthy: bool,
    added_at: u64,
    consecutive_failures: u32,
}

/// Actor Implementation
pub struct BalancerManager {
    rx: Receiver<BalancerMsg>,
    runner: Arc<EngineRunner>,
    scratch_ports: Arc<PortPool>,
    config: Arc<AppConfig>,
    cancel: CancellationToken,

    state: SupervisorState,
    serving: Option<EngineHandle>,
    serve_engine: EngineKind,
    backends: Vec<Backend>,
    pool: Vec<CandidateSeed>,
    /// 候选黑名单：每次 `UpdateAvailable` 清空，同一轮内失败候选不再重试
    blacklist: HashSet<String>,
    config_seq: u64,

    restarts: u64,
    health_checks: u64,
    backend_swaps: u64,
    last_restart: Option<u64>,
}

impl BalancerManager {
    /// 启动监督者 Actor
    pub fn start(
        config: Arc<AppConfig>,
        runner: Arc<EngineRunner>,
        scratch_ports: Arc<PortPool>,
        cancel: CancellationToken,
    ) -> (Sender<BalancerMsg>, JoinHandle<()>) {
        let (tx, rx) = flume::unbounded();

        let serve_engine = runner
            .available()
            .first()
            .copied()
            .unwrap_or(EngineKind::Xray);

        let actor = BalancerManager {
            rx,
            runner,
            scratch_ports,
            config,
            cancel,
            state: SupervisorState::Stopped,
            serving: None,
            serve_engine,
            backends: Vec::new(),
            pool: Vec::new(),
            blacklist: HashSet::new(),
            config_seq: 0,
            restarts: 0,
            health_checks: 0,
            backend_swaps: 0,
            last_restart: None,
        };

        let handle = tokio::spawn(actor.run());
        (tx, handle)
    }

    /// Actor 消息循环 (Event Loop)
    async fn run(mut self) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.health_interval.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval 的首个 tick 立即触发，对 Stopped 状态是空操作
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.shutdown().await;
                    break;
                }
                msg = self.rx.recv_async() => match msg {
                    Ok(m) => {
                        if self.handle(m).await {
                            break;
                        }
                    }
                    Err(_) => {
                        self.shutdown().await;
                        break;
                    }
                },
                _ = ticker.tick() => self.health_check().await,
            }
        }
    }

    /// 处理单条消息；返回 true 表示 Actor 应当退出
    async fn handle(&mut self, msg: BalancerMsg) -> bool {
        match msg {
            BalancerMsg::Start { seed } => {
                self.do_start(seed).await;
                false
            }
            BalancerMsg::UpdateAvailable { candidates } => {
                self.update_available(candidates).await;
                false
            }
            BalancerMsg::Status { reply } => {
                let _ = reply.send(self.snapshot());
                false
            }
            BalancerMsg::Stop { reply } => {
                self.shutdown().await;
                if let Some(tx) = reply {
                    let _ = tx.send(());
                }
                true
            }
        }
    }

    fn snapshot(&self) -> BalancerStats {
        BalancerStats {
            running: matches!(
                self.state,
                SupervisorState::Running | SupervisorState::Reseeding
            ),
            port: self.config.multiproxy_port,
            healthy_backends: self.backends.iter().filter(|b| b.healthy).count(),
            restarts: self.restarts,
            health_checks: self.health_checks,
            backend_swaps: self.backend_swaps,
            last_restart: self.last_restart,
        }
    }

    async fn do_start(&mut self, mut seed: Vec<CandidateSeed>) {
        if self.state != SupervisorState::Stopped {
            debug!("Balancer already active, ignoring start");
            return;
        }
        self.state = SupervisorState::Starting;
        info!(
            seed = seed.len(),
            port = self.config.multiproxy_port,
            "Balancer starting"
        );

        seed.sort_by_key(|s| s.latency_ms);
        self.backends = self.select_backends(&seed).await;

        if self.backends.is_empty() {
            // 没有可用后端也保持 RUNNING，等候选池到位后由健康环补种
            warn!("Balancer started with zero backends");
        } else {
            self.swap_engine(false).await;
        }
        self.state = SupervisorState::Running;
    }

    /// 原子替换候选池
    ///
    /// 空候选池永远不会触碰仍有健康后端的服务引擎。
    async fn update_available(&mut self, mut candidates: Vec<CandidateSeed>) {
        self.blacklist.clear();
        candidates.sort_by_key(|s| s.latency_ms);
        self.pool = candidates;
        debug!(pool = self.pool.len(), "Candidate pool replaced");

        if self.state != SupervisorState::Running {
            return;
        }

        let healthy = self.backends.iter().filter(|b| b.healthy).count();
        let want = self.config.balancer_size;
        if healthy >= want || self.pool.is_empty() {
            return;
        }

        self.state = SupervisorState::Reseeding;
        let in_service: HashSet<String> = self
            .backends
            .iter()
            .filter(|b| b.healthy)
            .map(|b| b.seed.uri.clone())
            .collect();
        let vacancies = want - healthy;

        let spare: Vec<CandidateSeed> = self
            .pool
            .iter()
            .filter(|c| !in_service.contains(&c.uri))
            .cloned()
            .collect();
        let mut promoted = self.select_n_backends(&spare, vacancies).await;

        if promoted.is_empty() {
            debug!("No promotable candidates");
            self.state = SupervisorState::Running;
            return;
        }

        info!(promoted = promoted.len(), "Promoting fresh backends");
        self.backends.retain(|b| b.healthy);
        self.backends.append(&mut promoted);
        self.swap_engine(true).await;
        self.backend_swaps += 1;
        self.state = SupervisorState::Running;
    }

    /// 健康环：引擎失联则全量降级，后端全灭且有候选时重新选种
    async fn health_check(&mut self) {
        if self.state != SupervisorState::Running {
            return;
        }
        self.health_checks += 1;

        if !self.config.test_mode {
            let engine_dead = match self.serving.as_mut() {
                Some(handle) => {
                    !handle.is_alive()
                        || probe::socks5_handshake(
                            self.config.multiproxy_port,
                            HANDSHAKE_TIMEOUT,
                        )
                        .await
                        .is_err()
                }
                None => !self.backends.is_empty(),
            };

            if engine_dead && !self.backends.is_empty() {
                warn!("Serving engine unresponsive, degrading all backends");
                for b in &mut self.backends {
                    b.healthy = false;
                    b.consecutive_failures += 1;
                }
            }
        }

        let healthy = self.backends.iter().filter(|b| b.healthy).count();
        if healthy > 0 {
            // 引擎自身按连接做随机选路，健康时无需干预
            return;
        }
        if self.pool.is_empty() && self.backends.is_empty() {
            return;
        }

        self.state = SupervisorState::Reseeding;
        let pool = self.pool.clone();
        let reseeded = self.select_backends(&pool).await;

        if reseeded.is_empty() {
            // 选种失败：保持 RUNNING，最后一个引擎继续占住端口，下个周期再试
            warn!("Re-seed produced no working backends, retrying next interval");
            self.state = SupervisorState::Running;
            return;
        }

        self.backends = reseeded;
        self.swap_engine(true).await;
        self.backend_swaps += 1;
        self.state = SupervisorState::Running;
        info!(
            backends = self.backends.len(),
            restarts = self.restarts,
            "Balancer re-seeded"
        );
    }

    async fn shutdown(&mut self) {
        if let Some(mut handle) = self.serving.take() {
            self.runner.stop(&mut handle).await;
        }
        if self.state != SupervisorState::Stopped {
            info!("Balancer stopped");
        }
        self.state = SupervisorState::Stopped;
        self.backends.clear();
    }

    // --- 后端选种 ---

    async fn select_backends(&mut self, candidates: &[CandidateSeed]) -> Vec<Backend> {
        let want = self.config.balancer_size;
        self.select_n_backends(candidates, want).await
    }

    /// 依延迟顺序逐个试用候选，收满 `want` 个即停
    ///
    /// 失败者进入本轮黑名单；测试模式下跳过隔离探测直接采纳。
    async fn select_n_backends(&mut self, candidates: &[CandidateSeed], want: usize) -> Vec<Backend> {
        let mut adopted = Vec::new();

        for candidate in candidates {
            if adopted.len() >= want || self.cancel.is_cancelled() {
                break;
            }
            if self.blacklist.contains(&candidate.uri) {
                continue;
            }

            let Some(parsed) = parser::parse(&candidate.uri) else {
                self.blacklist.insert(candidate.uri.clone());
                continue;
            };

            if !self.config.test_mode && !self.probe_candidate(&parsed.outbound).await {
                self.blacklist.insert(candidate.uri.clone());
                continue;
            }

            adopted.push(Backend {
                seed: candidate.clone(),
                outbound: parsed.outbound,
                healthy: true,
                added_at: now_unix(),
                consecutive_failures: 0,
            });
        }

        adopted
    }

    /// 在临时端口上隔离验证单个候选 (与基准测试同一套机制)
    async fn probe_candidate(&self, outbound: &Value) -> bool {
        let Some(lease) = self.scratch_ports.acquire(&self.cancel).await else {
            return false;
        };
        let port = lease.port();
        let doc = xconfig::bench_config(outbound, port);

        let mut handle = match self
            .runner
            .start(self.serve_engine, &doc, port, &format!("probe-{port}"))
            .await
        {
            Ok(h) => h,
            Err(e) => {
                debug!("Candidate engine start failed: {:#}", e);
                return false;
            }
        };

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let ok = probe::probe(port, &self.config.test_url, CANDIDATE_PROBE_TIMEOUT)
            .await
            .is_ok();
        self.runner.stop(&mut handle).await;
        ok
    }

    // --- 服务引擎交接 ---

    /// 构建新配置 → 拉起新进程 → 交换句柄 → 停掉旧进程
    ///
    /// 端口被旧进程占用导致新进程夭折时，先收旧再重拉一次，
    /// 保证监听端口只在极短的重试窗内无主。
    async fn swap_engine(&mut self, count_restart: bool) {
        if self.config.test_mode {
            debug!("Test mode: serving engine suppressed");
            return;
        }
        if self.backends.is_empty() {
            return;
        }

        let outbounds: Vec<Value> = self.backends.iter().map(|b| b.outbound.clone()).collect();
        let doc = xconfig::balancer_config(
            &outbounds,
            self.config.multiproxy_port,
            self.config.iran_fragment,
        );
        self.config_seq += 1;
        let label = format!("balancer-{}", self.config_seq);

        let started = match self
            .runner
            .start(self.serve_engine, &doc, self.config.multiproxy_port, &label)
            .await
        {
            Ok(mut fresh) => {
                tokio::time::sleep(BIND_WAIT).await;
                if fresh.is_alive() {
                    if let Some(mut old) = self.serving.replace(fresh) {
                        self.runner.stop(&mut old).await;
                    }
                    true
                } else {
                    // 绑定冲突：回收双方后重试一次
                    self.runner.stop(&mut fresh).await;
                    if let Some(mut old) = self.serving.take() {
                        self.runner.stop(&mut old).await;
                    }
                    match self
                        .runner
                        .start(self.serve_engine, &doc, self.config.multiproxy_port, &label)
                        .await
                    {
                        Ok(h) => {
                            self.serving = Some(h);
                            true
                        }
                        Err(e) => {
                            error!("Serving engine restart failed: {:#}", e);
                            false
                        }
                    }
                }
            }
            Err(e) => {
                error!("Serving engine start failed: {:#}", e);
                false
            }
        };

        if started && count_restart {
            self.restarts += 1;
            self.last_restart = Some(now_unix());
        }
    }
}
