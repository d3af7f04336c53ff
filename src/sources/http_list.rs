//! HTTP 清单源 (HTTP List Source)
//!
//! 从 GitHub raw 等公开地址抓取订阅清单。整体可能是明文 URI 列表，
//! 也可能是 Base64 打包的整页订阅，二者都被透明识别。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::interfaces::Source;
use crate::utils::parser::decode_base64_auto;

/// 单请求超时
const REQUEST_TIMEOUT: Duration = Duration::from_secs(8);
/// 同源并发抓取上限
const FETCH_CONCURRENCY: usize = 5;
/// 识别的订阅 scheme 前缀
const URI_SCHEMES: &[&str] = &[
    "vmess://",
    "vless://",
    "trojan://",
    "ss://",
    "shadowsocks://",
];

/// 把一段响应体拆解为 URI 行
///
/// 正文不含 scheme 时尝试整体 Base64 解包 (常见的打包订阅格式)。
pub fn extract_uris(body: &str) -> Vec<String> {
    let text = if body.contains("://") {
        body.to_string()
    } else {
        match decode_base64_auto(body.trim()) {
            Some(decoded) if decoded.contains("://") => decoded,
            _ => return Vec::new(),
        }
    };

    text.lines()
        .map(str::trim)
        .filter(|l| URI_SCHEMES.iter().any(|s| l.starts_with(s)))
        .map(str::to_string)
        .collect()
}

pub struct HttpListSource {
    name: String,
    urls: Vec<String>,
    client: Arc<Client>,
    /// 整源截止时间：超出后放弃仍未完成的 URL
    deadline: Duration,
}

impl HttpListSource {
    pub fn new(name: impl Into<String>, urls: Vec<String>, deadline: Duration) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("v2rayNG/1.8.5")
            .build()
            .expect("HTTP client construction");

        Self {
            name: name.into(),
            urls,
            client: Arc::new(client),
            deadline,
        }
    }
}

#[async_trait]
impl Source for HttpListSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, cancel: &CancellationToken) -> Vec<String> {
        let fetches = stream::iter(self.urls.clone())
            .map(|url| {
                let client = self.client.clone();
                async move {
                    debug!("Fetching list: {}", url);
                    client
                        .get(&url)
                        .send()
                        .await
                        .map_err(|e| {
                            warn!("Request failed {}: {}", url, e);
                            e
                        })
                        .ok()?
                        .text()
                        .await
                        .map_err(|e| {
                            warn!("Content read error {}: {}", url, e);
                            e
                        })
                        .ok()
                }
            })
            .buffer_unordered(FETCH_CONCURRENCY)
            .collect::<Vec<Option<String>>>();

        let bodies = tokio::select! {
            _ = cancel.cancelled() => return Vec::new(),
            r = tokio::time::timeout(self.deadline, fetches) => match r {
                Ok(bodies) => bodies,
                Err(_) => {
                    warn!("Source [{}] deadline exceeded", self.name);
                    return Vec::new();
                }
            },
        };

        let mut uris = Vec::new();
        for body in bodies.into_iter().flatten() {
            uris.extend(extract_uris(&body));
        }
        debug!("Source [{}] yielded {} raw URIs", self.name, uris.len());
        uris
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    #[test]
    fn plain_list_extraction() {
        let body = "vmess://abc\n# comment\ntrojan://pw@h:443#x\n\nhttp://ignored.example\n";
        let uris = extract_uris(body);
        assert_eq!(uris, vec!["vmess://abc", "trojan://pw@h:443#x"]);
    }

    #[test]
    fn base64_packed_subscription() {
        let packed = STANDARD.encode("vless://u@h:443?security=tls#a\nss://abc@1.2.3.4:8388#b\n");
        let uris = extract_uris(&packed);
        assert_eq!(uris.len(), 2);
    }

    #[test]
    fn garbage_body_yields_nothing() {
        assert!(extract_uris("<!DOCTYPE html><html></html>").is_empty());
        assert!(extract_uris("").is_empty());
    }

    #[tokio::test]
    async fn unreachable_urls_fold_to_empty() {
        let src = HttpListSource::new(
            "test",
            vec!["http://127.0.0.1:9/none".to_string()],
            Duration::from_secs(2),
        );
        let cancel = CancellationToken::new();
        assert!(src.fetch(&cancel).await.is_empty());
    }
}
