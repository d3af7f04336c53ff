//! 引擎运行时配置生成 (Engine Config Documents)
//!
//! 产出面向 Xray / Sing-box / Mihomo 二进制的 JSON 配置文档。
//! 文档形态是与引擎之间的硬契约：SOCKS5 入站、标签化出站、随机策略均衡路由。

use serde_json::{Value, json};

/// 均衡器出站标签前缀，出站依次为 proxy-0..proxy-(K-1)
pub const PROXY_TAG_PREFIX: &str = "proxy-";
/// 黑洞出站标签
pub const BLOCK_TAG: &str = "block";
/// TLS 分片前置出站标签
pub const FRAGMENT_TAG: &str = "fragment";

fn socks_inbound(listen_port: u16, udp: bool) -> Value {
    json!({
        "tag": "socks",
        "protocol": "socks",
        "listen": "127.0.0.1",
        "port": listen_port,
        "settings": {
            "auth": "noauth",
            "udp": udp,
        },
    })
}

/// 基准探测配置：单入站 + 恰好一个未命名出站
///
/// UDP 关闭，探测只走 TCP CONNECT。
pub fn bench_config(outbound: &Value, listen_port: u16) -> Value {
    json!({
        "log": { "loglevel": "warning" },
        "inbounds": [socks_inbound(listen_port, false)],
        "outbounds": [outbound],
    })
}

/// 均衡器配置：K 个标签化出站 + 黑洞 + 随机策略均衡器
///
/// `fragment` 开启时前置 freedom 分片出站，并将每个后端的
/// `sockopt.dialerProxy` 指向它，使 TLS ClientHello 分片后发出。
pub fn balancer_config(outbounds: &[Value], listen_port: u16, fragment: bool) -> Value {
    let mut tagged: Vec<Value> = Vec::with_capacity(outbounds.len() + 2);
    let mut selector: Vec<String> = Vec::with_capacity(outbounds.len());

    if fragment {
        tagged.push(json!({
            "tag": FRAGMENT_TAG,
            "protocol": "freedom",
            "settings": {
                "fragment": {
                    "packets": "tlshello",
                    "length": "10-20",
                    "interval": "10-20",
                },
            },
        }));
    }

    for (i, outbound) in outbounds.iter().enumerate() {
        let tag = format!("{PROXY_TAG_PREFIX}{i}");
        let mut ob = outbound.clone();
        ob["tag"] = Value::String(tag.clone());

        if fragment {
            let stream = ob
                .as_object_mut()
                .expect("outbound is always a JSON object")
                .entry("streamSettings")
                .or_insert_with(|| json!({}));
            stream["sockopt"] = json!({ "dialerProxy": FRAGMENT_TAG });
        }

        selector.push(tag);
        tagged.push(ob);
    }

    tagged.push(json!({ "tag": BLOCK_TAG, "protocol": "blackhole" }));

    json!({
        "log": { "loglevel": "warning" },
        "inbounds": [socks_inbound(listen_port, true)],
        "outbounds": tagged,
        "routing": {
            "balancers": [{
                "tag": "proxy-pool",
                "selector": [PROXY_TAG_PREFIX],
                "strategy": { "type": "random" },
            }],
            "rules": [{
                "type": "field",
                "inboundTag": ["socks"],
                "balancerTag": "proxy-pool",
            }],
        },
    })
}
