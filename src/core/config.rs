//! 配置管理系统 (Configuration Management)
//!
//! 负责 `.env` 文件与进程环境变量的合并加载，支持默认值回退与启动期校验。
//! 未知键一律忽略；布尔值为大小写不敏感的字面量 `true`。

use std::time::Duration;

use bon::Builder;
use config::{Config, Environment};
use serde::{Deserialize, Deserializer};

use crate::core::error::{HunterError, Result};

/// 全局应用配置
#[derive(Debug, Deserialize, Builder, Clone)]
#[serde(default)]
pub struct AppConfig {
    /// Telegram 采集端身份 (外部协作者透传)
    #[serde(alias = "hunter_api_id", deserialize_with = "de_opt_string")]
    pub api_id: Option<String>,
    #[serde(alias = "hunter_api_hash", deserialize_with = "de_opt_string")]
    pub api_hash: Option<String>,
    #[serde(alias = "hunter_phone", deserialize_with = "de_opt_string")]
    pub phone: Option<String>,
    /// 是否启用 Telegram 采集端 (启用时上述三元组必填)
    #[serde(alias = "hunter_telegram_enabled", deserialize_with = "de_flag")]
    pub telegram_enabled: bool,

    /// 均衡器 SOCKS5 监听端口
    #[serde(alias = "hunter_multiproxy_port")]
    pub multiproxy_port: u16,

    /// 基准测试并发基数
    #[serde(alias = "hunter_workers")]
    pub workers: usize,

    /// 单周期候选硬上限
    #[serde(alias = "hunter_max_configs")]
    pub max_configs: usize,

    /// 单次探测超时 (秒)
    #[serde(alias = "hunter_test_timeout")]
    pub test_timeout: u64,

    /// 周期间隔休眠 (秒)
    #[serde(alias = "hunter_sleep")]
    pub sleep_seconds: u64,

    /// 测试模式：跳过引擎调用，产出 [50,300] ms 均匀随机延迟
    #[serde(alias = "hunter_test_mode", deserialize_with = "de_flag")]
    pub test_mode: bool,

    /// 均衡器后端数量 K
    #[serde(alias = "hunter_balancer_size")]
    pub balancer_size: usize,

    /// 均衡器健康检查间隔 (秒)
    #[serde(alias = "hunter_health_interval")]
    pub health_interval: u64,

    /// 端口池基准端口，占用 [base, base+workers)
    #[serde(alias = "hunter_port_base")]
    pub port_base: u16,

    /// 探测目标 URL
    #[serde(alias = "hunter_test_url")]
    pub test_url: String,

    /// 运行时目录 (缓存、引擎配置、日志)
    #[serde(alias = "hunter_runtime_dir")]
    pub runtime_dir: String,

    /// 附加订阅源 (逗号分隔的 URL 列表)
    #[serde(alias = "hunter_sources", deserialize_with = "de_opt_string")]
    pub extra_sources: Option<String>,

    /// 在均衡器配置中注入 TLS 分片出站
    #[serde(alias = "iran_fragment_enabled", deserialize_with = "de_flag")]
    pub iran_fragment: bool,

    /// 引擎二进制路径覆盖 (缺省时在 ./bin 内自动探测)
    #[serde(alias = "xray_path", deserialize_with = "de_opt_string")]
    pub xray_path: Option<String>,
    #[serde(alias = "singbox_path", deserialize_with = "de_opt_string")]
    pub singbox_path: Option<String>,
    #[serde(alias = "mihomo_path", deserialize_with = "de_opt_string")]
    pub mihomo_path: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_id: None,
            api_hash: None,
            phone: None,
            telegram_enabled: false,
            multiproxy_port: 10808,
            workers: 10,
            max_configs: 3000,
            test_timeout: 8,
            sleep_seconds: 300,
            test_mode: false,
            balancer_size: 5,
            health_interval: 60,
            port_base: 20800,
            test_url: "https://www.gstatic.com/generate_204".to_string(),
            runtime_dir: "cache".to_string(),
            extra_sources: None,
            iran_fragment: false,
            xray_path: None,
            singbox_path: None,
            mihomo_path: None,
        }
    }
}

impl AppConfig {
    /// 从 `.env` 文件与进程环境加载配置
    ///
    /// `.env` 缺失不是错误；环境变量优先于文件内容。
    pub fn load() -> Result<Self> {
        // dotenvy 只填充尚未设置的变量，进程环境天然胜出
        let _ = dotenvy::dotenv();

        let settings = Config::builder()
            .add_source(Environment::default().try_parsing(true))
            .build()?;

        let cfg: AppConfig = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// 启动期校验，违反任意一条即为致命错误 (退出码 1)
    pub fn validate(&self) -> Result<()> {
        if self.multiproxy_port == 0 {
            return Err(HunterError::ConfigInvalid(
                "HUNTER_MULTIPROXY_PORT must be in 1..=65535".into(),
            ));
        }
        if !(1..=200).contains(&self.workers) {
            return Err(HunterError::ConfigInvalid(format!(
                "HUNTER_WORKERS out of range 1..=200: {}",
                self.workers
            )));
        }
        if !(1..=10000).contains(&self.max_configs) {
            return Err(HunterError::ConfigInvalid(format!(
                "HUNTER_MAX_CONFIGS out of range 1..=10000: {}",
                self.max_configs
            )));
        }
        if self.telegram_enabled
            && (self.api_id.is_none() || self.api_hash.is_none() || self.phone.is_none())
        {
            return Err(HunterError::ConfigInvalid(
                "telegram scraper enabled but HUNTER_API_ID/HUNTER_API_HASH/HUNTER_PHONE incomplete"
                    .into(),
            ));
        }
        if self.balancer_size == 0 {
            return Err(HunterError::ConfigInvalid(
                "HUNTER_BALANCER_SIZE must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout)
    }

    /// 解析附加订阅源列表
    pub fn extra_source_urls(&self) -> Vec<String> {
        self.extra_sources
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// 布尔字面量解析：大小写不敏感的 "true" 为真，其余一律为假
fn de_flag<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Text(String),
        Num(i64),
    }

    Ok(match Raw::deserialize(d)? {
        Raw::Bool(b) => b,
        Raw::Text(s) => s.trim().eq_ignore_ascii_case("true"),
        Raw::Num(n) => n != 0,
    })
}

/// 数值形态的环境值也按字符串接收 (如纯数字的 API ID)
fn de_opt_string<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
        Float(f64),
        Bool(bool),
    }

    Ok(Option::<Raw>::deserialize(d)?.map(|raw| match raw {
        Raw::Text(s) => s,
        Raw::Int(n) => n.to_string(),
        Raw::Float(f) => f.to_string(),
        Raw::Bool(b) => b.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.multiproxy_port, 10808);
        assert_eq!(cfg.workers, 10);
        assert_eq!(cfg.max_configs, 3000);
        assert!(!cfg.test_mode);
    }

    #[test]
    fn worker_range_is_fatal() {
        let cfg = AppConfig::builder()
            .telegram_enabled(false)
            .multiproxy_port(10808)
            .workers(0)
            .max_configs(3000)
            .test_timeout(8)
            .sleep_seconds(300)
            .test_mode(false)
            .balancer_size(5)
            .health_interval(60)
            .port_base(20800)
            .test_url("https://example.com".into())
            .runtime_dir("cache".into())
            .iran_fragment(false)
            .build();
        assert!(matches!(
            cfg.validate(),
            Err(HunterError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn telegram_triplet_enforced_when_enabled() {
        let mut cfg = AppConfig::default();
        cfg.telegram_enabled = true;
        cfg.api_id = Some("12345".into());
        assert!(cfg.validate().is_err());

        cfg.api_hash = Some("abcdef".into());
        cfg.phone = Some("+100000000".into());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn extra_sources_split() {
        let mut cfg = AppConfig::default();
        cfg.extra_sources = Some("https://a.example/x , ,https://b.example/y".into());
        assert_eq!(
            cfg.extra_source_urls(),
            vec![
                "https://a.example/x".to_string(),
                "https://b.example/y".to_string()
            ]
        );
    }
}
