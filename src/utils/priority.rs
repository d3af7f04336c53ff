//! 候选排序与去重 (Prioritizer & Deduplicator)
//!
//! 按抗 DPI 启发式将候选 URI 划入 8 个梯队，梯队内乱序、梯队间保序。
//! 乱序由周期随机数种子驱动，同一周期内结果可复现。

use indexmap::IndexSet;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::debug;

/// 最短可信 URI 长度，低于此长度的输入直接丢弃
const MIN_URI_LEN: usize = 10;

/// 黑名单子串：伊朗境内域名、私有网段及环回地址
const BLOCKED_PATTERNS: &[&str] = &[
    ".ir",
    "iran",
    "10.",
    "192.168.",
    "127.",
    "0.0.0.0",
    "localhost",
    "10.10.34.",
];

/// CDN 域名白名单 (子串匹配)
const CDN_PATTERNS: &[&str] = &[
    "cloudflare",
    "cdn.",
    "fastly",
    "akamai",
    "azureedge",
    "azurefd",
    "amazonaws",
    "cloudfront",
    "googleusercontent",
    "googleapis",
    "gcore",
    "jsdelivr",
    "vercel",
    "netlify",
    "arvancloud",
    "pages.dev",
    "workers.dev",
];

/// 常见放行端口
const WHITELIST_PORTS: &[u16] = &[443, 8443, 2053, 2083, 2087, 2096, 80, 8080];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn has_whitelist_port(lower: &str) -> bool {
    WHITELIST_PORTS.iter().any(|p| lower.contains(&format!(":{p}")))
}

fn is_blocked(lower: &str) -> bool {
    contains_any(lower, BLOCKED_PATTERNS)
}

fn has_tls(lower: &str) -> bool {
    lower.contains("tls") || lower.contains("security=reality") || lower.contains("pbk=")
}

fn has_reality(lower: &str) -> bool {
    lower.contains("reality") || lower.contains("pbk=")
}

fn is_ipv6_literal(lower: &str) -> bool {
    lower.contains("@[") || lower.contains("://[")
}

/// 梯队判定 (1..=8)，首个命中即停
///
/// 越靠前的梯队在受审查网络中存活概率越高，优先进入基准测试。
pub fn tier_of(uri: &str) -> u8 {
    let lower = uri.to_lowercase();
    let cdn = contains_any(&lower, CDN_PATTERNS);
    let tls = has_tls(&lower);
    let ws = lower.contains("ws") || lower.contains("websocket");

    if lower.starts_with("vless://") && has_reality(&lower) {
        return if cdn { 1 } else { 2 };
    }
    if (lower.starts_with("vless://")
        || lower.starts_with("trojan://")
        || lower.starts_with("vmess://"))
        && (lower.contains("grpc") || lower.contains("gun") || lower.contains("h2"))
        && tls
    {
        return 3;
    }
    if ws && tls && lower.contains(":443") {
        return 4;
    }
    if lower.starts_with("vmess://") && ws && tls && cdn {
        return 5;
    }
    if tls && has_whitelist_port(&lower) {
        return 6;
    }
    if is_ipv6_literal(&lower) {
        return 7;
    }
    8
}

/// 去重、过滤、分级、乱序并截断
///
/// 输出顺序：梯队 1..8 依次拼接，梯队内部按 `nonce` 种子乱序。
pub fn prioritize<I>(uris: I, max_total: usize, nonce: u64) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut deduped: IndexSet<String> = IndexSet::new();
    let mut dropped_short = 0usize;
    let mut dropped_blocked = 0usize;

    for uri in uris {
        let uri = uri.trim();
        if uri.len() < MIN_URI_LEN {
            dropped_short += 1;
            continue;
        }
        if is_blocked(&uri.to_lowercase()) {
            dropped_blocked += 1;
            continue;
        }
        deduped.insert(uri.to_string());
    }

    let mut tiers: [Vec<String>; 8] = std::array::from_fn(|_| Vec::new());
    for uri in deduped {
        let t = tier_of(&uri) as usize - 1;
        tiers[t].push(uri);
    }

    let mut out = Vec::new();
    for (idx, bucket) in tiers.iter_mut().enumerate() {
        let mut rng = StdRng::seed_from_u64(nonce ^ (idx as u64 + 1));
        bucket.shuffle(&mut rng);
        out.append(bucket);
    }

    debug!(
        short = dropped_short,
        blocked = dropped_blocked,
        kept = out.len(),
        "priority filter applied"
    );

    out.truncate(max_total);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<String> {
        vec![
            // tier 1: vless reality + CDN
            "vless://u1@node.cloudflare.example:443?security=reality&pbk=k#a".to_string(),
            // tier 2: vless reality
            "vless://u2@plain.example:443?security=reality&pbk=k#b".to_string(),
            // tier 3: trojan grpc + tls
            "trojan://p@host.example:2053?security=tls&type=grpc&serviceName=s#c".to_string(),
            // tier 4: ws + tls on 443
            "trojan://p@ws.example:443?security=tls&type=ws#d".to_string(),
            // tier 8
            "ss://YWVzLTI1Ni1nY206cGFzcw@4.3.2.1:8388#e".to_string(),
        ]
    }

    #[test]
    fn duplicates_and_short_inputs_dropped() {
        let mut uris = sample();
        uris.push(sample()[0].clone());
        uris.push("ss://x".to_string());
        uris.push("".to_string());

        let out = prioritize(uris, 3000, 7);
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn blocked_patterns_dropped() {
        let uris = vec![
            "vless://u@server.example.ir:443?security=tls#x".to_string(),
            "trojan://p@192.168.1.10:443?security=tls#y".to_string(),
            "vmess://p@localhost:1080#z".to_string(),
            "trojan://p@10.10.34.35:443#w".to_string(),
            sample()[2].clone(),
        ];
        let out = prioritize(uris, 3000, 7);
        assert_eq!(out, vec![sample()[2].clone()]);
    }

    #[test]
    fn tier_order_is_stable() {
        let out = prioritize(sample(), 3000, 99);
        let tiers: Vec<u8> = out.iter().map(|u| tier_of(u)).collect();
        let mut sorted = tiers.clone();
        sorted.sort_unstable();
        assert_eq!(tiers, sorted, "tiers must be emitted in ascending order");
    }

    #[test]
    fn prioritize_invariant_under_input_shuffle() {
        let base = prioritize(sample(), 3000, 42);

        let mut reversed = sample();
        reversed.reverse();
        let other = prioritize(reversed, 3000, 42);

        // 整体集合一致，且梯队序列一致 (梯队内排列允许不同)
        let mut a = base.clone();
        let mut b = other.clone();
        a.sort();
        b.sort();
        assert_eq!(a, b);
        assert_eq!(
            base.iter().map(|u| tier_of(u)).collect::<Vec<_>>(),
            other.iter().map(|u| tier_of(u)).collect::<Vec<_>>(),
        );
    }

    #[test]
    fn hard_cap_applies_after_sort() {
        let mut uris = Vec::new();
        for i in 0..50 {
            uris.push(format!(
                "trojan://p@host{i}.example:443?security=tls&type=ws#n{i}"
            ));
        }
        let out = prioritize(uris, 10, 1);
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn ipv6_literals_fall_to_tier_seven() {
        assert_eq!(tier_of("ss://YWVzOnB3@[2001:db8::2]:8388#v6"), 7);
    }
}
