#![allow(dead_code)]

//! 应用程序入口 (Application Entrypoint)
//!
//! 负责 CLI 指令解析、遥测层初始化、依赖注入及系统生命周期管理。
//! 退出码：0 正常停机，1 配置非法，2 致命运行时错误。

mod actors;
mod core;
mod engine;
mod interfaces;
mod sources;
mod utils;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::actors::balancer::{BalancerManager, BalancerMsg};
use crate::core::config::AppConfig;
use crate::core::orchestrator::Orchestrator;
use crate::engine::bench::BenchmarkEngine;
use crate::engine::memory::MemoryWatch;
use crate::engine::ports::PortPool;
use crate::engine::runner::EngineRunner;
use crate::interfaces::LogReporter;
use crate::sources::SourceSet;
use crate::utils::cache::CacheStore;

/// 停机序列的总预算
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);

/// 命令行界面脚手架 (CLI Scaffolding)
#[derive(Parser)]
#[command(
    name = "hunter",
    author,
    version,
    about = "Autonomous proxy hunting pipeline",
    long_about = None
)]
struct Cli {}

#[tokio::main]
async fn main() {
    // 遥测层初始化 (Telemetry Layer Initialization)
    if std::env::var("RUST_LOG").is_err() {
        unsafe {
            std::env::set_var("RUST_LOG", "info");
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_ansi(true)
        .init();

    let _cli = Cli::parse();

    let config = match AppConfig::load() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    };

    let code = match run(config).await {
        Ok(()) => 0,
        Err(e) => {
            error!("Fatal runtime error: {}", e);
            2
        }
    };
    std::process::exit(code);
}

async fn run(config: Arc<AppConfig>) -> crate::core::error::Result<()> {
    // 依赖项初始化与注入 (Dependency Injection)
    let cancel = CancellationToken::new();

    let runner = Arc::new(EngineRunner::new(&config));
    let ports = Arc::new(PortPool::new(config.port_base, config.workers));
    let memory = Arc::new(MemoryWatch::new());
    let cache = Arc::new(CacheStore::new(&config.runtime_dir));
    let bench = BenchmarkEngine::new(runner.clone(), ports.clone(), memory);
    let sources = SourceSet::standard(&config);

    let (balancer_tx, balancer_handle) = BalancerManager::start(
        config.clone(),
        runner.clone(),
        ports.clone(),
        cancel.clone(),
    );

    info!(
        engines = ?runner.available(),
        port = config.multiproxy_port,
        test_mode = config.test_mode,
        "Hunter starting"
    );

    // 信号处理与优雅退出 (Signal Handling)
    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Shutdown signal received");
        cancel_signal.cancel();
    });

    let mut orchestrator = Orchestrator::new(
        config,
        sources,
        bench,
        runner,
        balancer_tx.clone(),
        cache,
        Arc::new(LogReporter),
        cancel.clone(),
    );
    orchestrator.run().await;

    // 停机序列：撤回令牌 → 均衡器确认 → 回收 Actor
    cancel.cancel();
    let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
    let _ = balancer_tx.send(BalancerMsg::Stop {
        reply: Some(ack_tx),
    });
    if tokio::time::timeout(SHUTDOWN_BUDGET, ack_rx).await.is_err() {
        error!("Balancer stop acknowledgement timed out");
    }
    let _ = tokio::time::timeout(Duration::from_secs(2), balancer_handle).await;

    info!("Shutdown complete");
    Ok(())
}

/// 等待 SIGINT / SIGTERM
async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
