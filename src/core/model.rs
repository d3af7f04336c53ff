//! 核心数据模型 (Core Data Model)
//!
//! 定义基准测试结果、延迟分级及均衡器相关的共享结构。
//! 所有结构在产生后不可变，跨周期传递时整体替换。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 延迟质量分级 (Latency Tiers)
///
/// `Dead` 仅作为分级函数的返回值存在，永远不会被存储。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Gold,
    Silver,
    Bronze,
    Dead,
}

impl Tier {
    /// 从实测延迟推导分级
    pub fn from_latency(latency_ms: u64) -> Self {
        match latency_ms {
            0..=199 => Tier::Gold,
            200..=799 => Tier::Silver,
            800..=2000 => Tier::Bronze,
            _ => Tier::Dead,
        }
    }

    pub fn is_alive(self) -> bool {
        !matches!(self, Tier::Dead)
    }
}

/// 解析后的代理节点配置 (Parsed Proxy Config)
///
/// `outbound` 是面向引擎二进制的 JSON 出站记录，业务代码不深入其内部结构。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedConfig {
    /// 协议标识 (vmess/vless/trojan/shadowsocks)
    pub scheme: String,
    /// 服务器地址 (非空，IPv6 不含方括号)
    pub host: String,
    /// 服务器端口 (1-65535)
    pub port: u16,
    /// 身份凭据 (uuid / password / method:password)
    pub identity: String,
    /// 清洗后的节点备注
    pub ps: String,
    /// 引擎出站记录 (opaque JSON)
    pub outbound: Value,
}

/// 基准测试结果 (Benchmark Result)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchResult {
    /// 原始 URI (与输入字节级一致)
    pub uri: String,
    pub parsed: ParsedConfig,
    /// 实测延迟，恒为正
    pub latency_ms: u64,
    pub tier: Tier,
    /// 测量时刻 (unix 秒)
    pub measured_at: u64,
}

impl BenchResult {
    pub fn new(uri: String, parsed: ParsedConfig, latency_ms: u64) -> Self {
        Self {
            uri,
            parsed,
            latency_ms,
            tier: Tier::from_latency(latency_ms),
            measured_at: crate::utils::now_unix(),
        }
    }
}

/// 均衡器候选种子 (Candidate Seed)
///
/// 既是 `updateAvailable` 的元素，也是均衡器磁盘缓存的行格式。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateSeed {
    pub uri: String,
    pub latency_ms: u64,
}

impl From<&BenchResult> for CandidateSeed {
    fn from(r: &BenchResult) -> Self {
        Self {
            uri: r.uri.clone(),
            latency_ms: r.latency_ms,
        }
    }
}

/// 均衡器运行状态快照 (Balancer Stats)
#[derive(Debug, Clone, Default, Serialize)]
pub struct BalancerStats {
    pub running: bool,
    pub port: u16,
    pub healthy_backends: usize,
    pub restarts: u64,
    pub health_checks: u64,
    pub backend_swaps: u64,
    /// 最近一次引擎重启时刻 (unix 秒)
    pub last_restart: Option<u64>,
}
