//! 引擎进程管理器 (Engine Process Controller)
//!
//! 负责 Xray / Sing-box / Mihomo 二进制的生命周期：配置落盘、子进程拉起、
//! 限时回收与日志汇聚。单个句柄由唯一监督者持有，进程不会逃逸出监督者存活期。

use std::collections::HashMap;
use std::env::consts::EXE_SUFFIX;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::core::config::AppConfig;

/// 停止时的礼貌等待窗口，超出后硬杀
const STOP_GRACE: Duration = Duration::from_millis(500);

/// 支持的引擎变体
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum EngineKind {
    #[strum(serialize = "xray")]
    Xray,
    #[strum(serialize = "sing-box")]
    SingBox,
    #[strum(serialize = "mihomo")]
    Mihomo,
}

impl EngineKind {
    /// 基准测试时的默认回退顺序
    pub fn fallback_order() -> [EngineKind; 3] {
        [EngineKind::Xray, EngineKind::SingBox, EngineKind::Mihomo]
    }

    fn binary_name(self) -> String {
        format!("{self}{EXE_SUFFIX}")
    }

    fn launch_args(self, config_path: &Path) -> Vec<std::ffi::OsString> {
        match self {
            EngineKind::Xray | EngineKind::SingBox => vec![
                "run".into(),
                "-c".into(),
                config_path.as_os_str().to_os_string(),
            ],
            EngineKind::Mihomo => vec!["-f".into(), config_path.as_os_str().to_os_string()],
        }
    }
}

/// 活跃引擎句柄
///
/// 持有者拥有唯一的停止权；槽位与配置文件的回收都以停止为前置。
pub struct EngineHandle {
    pub engine: EngineKind,
    pub listen_port: u16,
    pub started_at: Instant,
    config_path: PathBuf,
    child: Option<Child>,
}

impl EngineHandle {
    /// 子进程是否仍然存活
    pub fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

/// 引擎基础设施控制器
pub struct EngineRunner {
    runtime_dir: PathBuf,
    binaries: HashMap<EngineKind, PathBuf>,
}

impl EngineRunner {
    /// 解析二进制路径：环境覆盖优先，否则在 ./bin 内按平台命名探测
    pub fn new(config: &AppConfig) -> Self {
        use strum::IntoEnumIterator;

        let bin_dir = PathBuf::from("bin");
        let overrides = [
            (EngineKind::Xray, config.xray_path.clone()),
            (EngineKind::SingBox, config.singbox_path.clone()),
            (EngineKind::Mihomo, config.mihomo_path.clone()),
        ];

        let mut binaries = HashMap::new();
        for kind in EngineKind::iter() {
            let configured = overrides
                .iter()
                .find(|(k, _)| *k == kind)
                .and_then(|(_, p)| p.clone());
            let path = configured
                .map(PathBuf::from)
                .unwrap_or_else(|| bin_dir.join(kind.binary_name()));
            binaries.insert(kind, path);
        }

        Self {
            runtime_dir: PathBuf::from(&config.runtime_dir),
            binaries,
        }
    }

    /// 当前可用的引擎集合 (二进制存在)
    pub fn available(&self) -> Vec<EngineKind> {
        EngineKind::fallback_order()
            .into_iter()
            .filter(|k| self.binaries.get(k).is_some_and(|p| p.exists()))
            .collect()
    }

    /// 拉起引擎子进程
    ///
    /// 配置写入 `{runtime_dir}/{label}.json`，stdout/stderr 追加至按引擎
    /// 命名的日志文件。绑定等待由调用方负责，本函数不做启动确认。
    pub async fn start(
        &self,
        engine: EngineKind,
        config_doc: &Value,
        listen_port: u16,
        label: &str,
    ) -> Result<EngineHandle> {
        let executable = self
            .binaries
            .get(&engine)
            .ok_or_else(|| anyhow!("Unknown engine: {engine}"))?;
        if !executable.exists() {
            return Err(anyhow!("Engine binary missing: {}", executable.display()));
        }

        tokio::fs::create_dir_all(&self.runtime_dir)
            .await
            .context("Failed to create runtime directory")?;

        let config_path = self.runtime_dir.join(format!("{label}.json"));
        let body = serde_json::to_string_pretty(config_doc).context("Config serialization failed")?;
        tokio::fs::write(&config_path, body)
            .await
            .context("Failed to write engine config")?;

        let log_path = self.runtime_dir.join(format!("{engine}.log"));
        let log_file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .context("Failed to open engine log")?;
        let log_file_std = log_file.into_std().await;

        debug!("Spawning {} on 127.0.0.1:{}", engine, listen_port);

        let child = Command::new(executable)
            .args(engine.launch_args(&config_path))
            .stdin(Stdio::null())
            .stdout(Stdio::from(
                log_file_std.try_clone().context("Handle cloning error")?,
            ))
            .stderr(Stdio::from(log_file_std))
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to execute {engine}"))?;

        Ok(EngineHandle {
            engine,
            listen_port,
            started_at: Instant::now(),
            config_path,
            child: Some(child),
        })
    }

    /// 终止引擎并回收配置文件，可重复调用
    pub async fn stop(&self, handle: &mut EngineHandle) {
        if let Some(mut child) = handle.child.take() {
            // 先请求终止，限时未退出则硬杀再收尸
            if let Err(e) = child.start_kill() {
                debug!("Kill request failed ({}): {}", handle.engine, e);
            }
            match timeout(STOP_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!("{} exited: {}", handle.engine, status);
                }
                Ok(Err(e)) => warn!("{} reap error: {}", handle.engine, e),
                Err(_) => {
                    if let Err(e) = child.kill().await {
                        warn!("{} hard kill failed: {}", handle.engine, e);
                    }
                }
            }
        }

        if let Err(e) = tokio::fs::remove_file(&handle.config_path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            debug!("Config cleanup failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::AppConfig;

    #[test]
    fn binary_resolution_prefers_overrides() {
        let mut cfg = AppConfig::default();
        cfg.xray_path = Some("/opt/engines/custom-xray".into());
        let runner = EngineRunner::new(&cfg);

        assert_eq!(
            runner.binaries[&EngineKind::Xray],
            PathBuf::from("/opt/engines/custom-xray")
        );
        assert_eq!(
            runner.binaries[&EngineKind::SingBox],
            PathBuf::from("bin").join(format!("sing-box{EXE_SUFFIX}"))
        );
    }

    #[test]
    fn fallback_order_is_xray_first() {
        assert_eq!(
            EngineKind::fallback_order(),
            [EngineKind::Xray, EngineKind::SingBox, EngineKind::Mihomo]
        );
    }

    #[tokio::test]
    async fn start_fails_cleanly_when_binary_missing() {
        let mut cfg = AppConfig::default();
        cfg.runtime_dir = std::env::temp_dir()
            .join(format!("hunter-runner-test-{}", std::process::id()))
            .display()
            .to_string();
        cfg.xray_path = Some("/nonexistent/xray".into());
        let runner = EngineRunner::new(&cfg);

        let doc = serde_json::json!({ "outbounds": [] });
        let err = runner
            .start(EngineKind::Xray, &doc, 20801, "bench-20801")
            .await;
        assert!(err.is_err());
    }
}
