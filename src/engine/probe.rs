//! 探测器 (Probe)
//!
//! 穿过本地引擎的 SOCKS5 入站执行一次真实 HTTPS 请求，测量首包耗时。
//! 同一机制同时服务于基准测试与均衡器健康检查。

use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::core::error::{HunterError, Result};

/// 通过 `socks5h://127.0.0.1:{port}` 发起 HTTPS GET，返回首响应耗时 (ms)
///
/// 2xx 与 204 视为成功；其余状态、连接失败与超时一律为 `Err`。
/// 域名解析发生在代理侧 (socks5h)，避免本地 DNS 污染影响测量。
pub async fn probe(port: u16, test_url: &str, timeout: Duration) -> Result<u64> {
    let proxy = reqwest::Proxy::all(format!("socks5h://127.0.0.1:{port}"))
        .map_err(|e| HunterError::Probe(format!("proxy setup: {e}")))?;

    let client = reqwest::Client::builder()
        .proxy(proxy)
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .map_err(|e| HunterError::Probe(format!("client build: {e}")))?;

    let start = Instant::now();
    let resp = client
        .get(test_url)
        .send()
        .await
        .map_err(|e| HunterError::Probe(format!("request: {e}")))?;

    let status = resp.status();
    if status.is_success() || status.as_u16() == 204 {
        // 下限钳到 1ms，保证延迟恒为正
        Ok((start.elapsed().as_millis() as u64).max(1))
    } else {
        Err(HunterError::Probe(format!("status {status}")))
    }
}

/// 对本地 SOCKS5 监听端口执行 RFC1928 无认证握手
///
/// 均衡器健康环用它确认服务引擎仍然持有监听端口。
pub async fn socks5_handshake(port: u16, timeout: Duration) -> Result<()> {
    let fut = async {
        let mut stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .map_err(|e| HunterError::Probe(format!("connect: {e}")))?;

        // VER=5, NMETHODS=1, METHOD=0 (no auth)
        stream
            .write_all(&[0x05, 0x01, 0x00])
            .await
            .map_err(|e| HunterError::Probe(format!("greeting: {e}")))?;

        let mut reply = [0u8; 2];
        stream
            .read_exact(&mut reply)
            .await
            .map_err(|e| HunterError::Probe(format!("reply: {e}")))?;

        if reply == [0x05, 0x00] {
            Ok(())
        } else {
            Err(HunterError::Probe(format!(
                "unexpected method selection: {reply:02x?}"
            )))
        }
    };

    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| HunterError::Probe("handshake timeout".into()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn handshake_against_minimal_socks_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 3];
            sock.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, [0x05, 0x01, 0x00]);
            sock.write_all(&[0x05, 0x00]).await.unwrap();
        });

        socks5_handshake(port, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn handshake_rejects_non_socks_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 3];
            let _ = sock.read_exact(&mut buf).await;
            let _ = sock.write_all(&[0xff, 0xff]).await;
        });

        assert!(socks5_handshake(port, Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn handshake_times_out_on_dead_port() {
        // 端口未监听：连接被拒或超时，二者都必须表现为 Err
        let r = socks5_handshake(1, Duration::from_millis(200)).await;
        assert!(r.is_err());
    }
}
