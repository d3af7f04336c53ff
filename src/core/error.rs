//! 错误处理体系 (Error Handling System)
//!
//! 定义领域相关的错误类型及全局 Result 别名。
//! 启动期配置校验是唯一的硬失败；其余错误在各自层级被吸收或降级。

use thiserror::Error;

/// 全局错误定义 (Hunter Domain Errors)
#[derive(Error, Debug)]
pub enum HunterError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// 启动期校验失败，进程以退出码 1 终止
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 代理引擎子进程相关错误 (启动失败、提前退出等)
    #[error("Engine error: {0}")]
    Engine(String),

    /// 单次探测失败 (超时、非 2xx、SOCKS 握手被拒)
    #[error("Probe failed: {0}")]
    Probe(String),

    /// 生命周期撤回令牌已触发
    #[error("Cancelled")]
    Cancelled,

    #[error("Other error: {0}")]
    Custom(String),
}

/// 全局 Result 别名
pub type Result<T> = std::result::Result<T, HunterError>;

impl From<anyhow::Error> for HunterError {
    fn from(err: anyhow::Error) -> Self {
        HunterError::Engine(format!("{err:#}"))
    }
}
