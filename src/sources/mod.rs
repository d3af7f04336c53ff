//! 采集源集合 (Source Set)
//!
//! 对全部注册源做并发扇出，单源失败折叠为空；产出显式的 URI 集合，
//! 调用侧只对集合计数，杜绝列表/集合形态错配。

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use indexmap::IndexSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::config::AppConfig;
use crate::interfaces::Source;

pub mod builtin;
pub mod http_list;

pub struct SourceSet {
    sources: Vec<Arc<dyn Source>>,
}

impl SourceSet {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
        }
    }

    /// 标准源配置：内置聚合源 + 配置注入的附加订阅
    pub fn standard(config: &AppConfig) -> Self {
        let mut set = Self::new();
        set.push(Arc::new(builtin::iran_priority_source()));
        set.push(Arc::new(builtin::anti_censorship_source()));

        let extra = config.extra_source_urls();
        if !extra.is_empty() {
            set.push(Arc::new(http_list::HttpListSource::new(
                "extra",
                extra,
                Duration::from_secs(60),
            )));
        }
        set
    }

    pub fn push(&mut self, source: Arc<dyn Source>) {
        self.sources.push(source);
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// 并发拉取全部源并做集合并
    pub async fn scrape_all(&self, cancel: &CancellationToken) -> IndexSet<String> {
        let fetches = self.sources.iter().map(|source| {
            let source = source.clone();
            let cancel = cancel.clone();
            async move {
                let uris = source.fetch(&cancel).await;
                debug!("Source [{}] contributed {} URIs", source.name(), uris.len());
                uris
            }
        });

        let mut merged: IndexSet<String> = IndexSet::new();
        for uris in join_all(fetches).await {
            merged.extend(uris);
        }

        info!(total = merged.len(), sources = self.sources.len(), "Scrape fan-out done");
        merged
    }
}

impl Default for SourceSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedSource {
        name: &'static str,
        uris: Vec<String>,
    }

    #[async_trait]
    impl Source for FixedSource {
        fn name(&self) -> &str {
            self.name
        }

        async fn fetch(&self, _cancel: &CancellationToken) -> Vec<String> {
            self.uris.clone()
        }
    }

    #[tokio::test]
    async fn union_deduplicates_across_sources() {
        let mut set = SourceSet::new();
        set.push(Arc::new(FixedSource {
            name: "a",
            uris: vec!["vmess://one".into(), "vmess://two".into()],
        }));
        set.push(Arc::new(FixedSource {
            name: "b",
            uris: vec!["vmess://two".into(), "trojan://three".into()],
        }));
        set.push(Arc::new(FixedSource {
            name: "dead",
            uris: vec![],
        }));

        let merged = set.scrape_all(&CancellationToken::new()).await;
        assert_eq!(merged.len(), 3);
        assert!(merged.contains("vmess://one"));
        assert!(merged.contains("trojan://three"));
    }
}
