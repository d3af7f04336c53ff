//! 代理 URI 解析器 (Proxy URI Parser)
//!
//! 将 vmess/vless/trojan/ss 订阅 URI 解析为引擎可消费的出站记录。
//! 解析是纯函数且永不报错：无法识别或畸形的输入一律返回 `None`。

use std::collections::HashMap;

use base64::{Engine as _, engine::general_purpose};
use serde_json::{Value, json};

use crate::core::model::ParsedConfig;
use crate::utils::sanitize_remark;

/// 执行启发式 Base64 解码 (Heuristic Decoding)
///
/// 依次尝试标准与 URL-safe 字母表的有垫/无垫变体，等价于自动修复缺失的 padding。
pub fn decode_base64_auto(input: &str) -> Option<String> {
    let clean: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let engines = [
        &general_purpose::STANDARD,
        &general_purpose::STANDARD_NO_PAD,
        &general_purpose::URL_SAFE,
        &general_purpose::URL_SAFE_NO_PAD,
    ];

    for engine in engines {
        if let Ok(b) = engine.decode(&clean) {
            return Some(String::from_utf8_lossy(&b).to_string());
        }
    }
    None
}

fn json_as_u64(v: &Value) -> Option<u64> {
    v.as_u64().or_else(|| v.as_str()?.trim().parse().ok())
}

fn json_str<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(|s| s.as_str())
}

/// 校验主机与端口是否构成合法节点地址
///
/// 私有网段在此处放行，由优先级过滤器统一拦截。
fn valid_endpoint(host: &str, port: u64) -> bool {
    !host.is_empty() && host != "0.0.0.0" && (1..=65535).contains(&port)
}

/// IPv6 字面量去除方括号
fn strip_brackets(host: &str) -> &str {
    host.trim_start_matches('[').trim_end_matches(']')
}

/// 解析单条代理 URI
///
/// 识别 `vmess` / `vless` / `trojan` / `ss` / `shadowsocks`，其余 scheme 返回 `None`。
pub fn parse(uri: &str) -> Option<ParsedConfig> {
    let uri = uri.trim();
    let (scheme, body) = uri.split_once("://")?;

    match scheme {
        "vmess" => parse_vmess(body),
        "vless" => parse_userinfo_url(uri, Protocol::Vless),
        "trojan" => parse_userinfo_url(uri, Protocol::Trojan),
        "ss" | "shadowsocks" => parse_ss(body),
        _ => None,
    }
}

// --- vmess ---

fn parse_vmess(body: &str) -> Option<ParsedConfig> {
    let decoded = decode_base64_auto(body)?;
    let v: Value = serde_json::from_str(&decoded).ok()?;

    let host = json_str(&v, "add")?.trim().to_string();
    let port = json_as_u64(v.get("port")?)?;
    let uuid = json_str(&v, "id")?.trim().to_string();

    if !valid_endpoint(&host, port) || uuid.is_empty() {
        return None;
    }

    // aid 字段在野外订阅里既有数字也有字符串形态
    let alter_id = v.get("aid").and_then(json_as_u64).unwrap_or(0);
    let security = json_str(&v, "scy").filter(|s| !s.is_empty()).unwrap_or("auto");
    let net = json_str(&v, "net").filter(|s| !s.is_empty()).unwrap_or("tcp");
    let tls_on = json_str(&v, "tls") == Some("tls");
    let sni = json_str(&v, "sni").filter(|s| !s.is_empty());
    let ws_path = json_str(&v, "path").filter(|s| !s.is_empty());
    let ws_host = json_str(&v, "host").filter(|s| !s.is_empty());

    let mut stream = json!({ "network": net });
    if tls_on {
        stream["security"] = json!("tls");
        stream["tlsSettings"] = json!({
            "serverName": sni.or(ws_host).unwrap_or(&host),
            "allowInsecure": false,
        });
    }
    match net {
        "ws" => {
            let mut ws = json!({});
            if let Some(p) = ws_path {
                ws["path"] = json!(p);
            }
            if let Some(h) = ws_host {
                ws["headers"] = json!({ "Host": h });
            }
            stream["wsSettings"] = ws;
        }
        "grpc" | "gun" => {
            stream["grpcSettings"] = json!({
                "serviceName": json_str(&v, "path").unwrap_or_default(),
            });
        }
        "h2" | "http" => {
            let mut h2 = json!({ "path": ws_path.unwrap_or("/") });
            if let Some(h) = ws_host {
                h2["host"] = json!([h]);
            }
            stream["httpSettings"] = h2;
        }
        _ => {}
    }

    let outbound = json!({
        "protocol": "vmess",
        "settings": {
            "vnext": [{
                "address": strip_brackets(&host),
                "port": port,
                "users": [{
                    "id": uuid,
                    "alterId": alter_id,
                    "security": security,
                }],
            }],
        },
        "streamSettings": stream,
    });

    Some(ParsedConfig {
        scheme: "vmess".to_string(),
        host: strip_brackets(&host).to_string(),
        port: port as u16,
        identity: uuid,
        ps: sanitize_remark(json_str(&v, "ps").unwrap_or_default()),
        outbound,
    })
}

// --- vless / trojan ---

#[derive(Clone, Copy, PartialEq)]
enum Protocol {
    Vless,
    Trojan,
}

fn parse_userinfo_url(line: &str, proto: Protocol) -> Option<ParsedConfig> {
    let url = url::Url::parse(line).ok()?;
    let query: HashMap<_, _> = url.query_pairs().collect();
    let q = |key: &str| query.get(key).map(|s| s.to_string()).filter(|s| !s.is_empty());

    let raw_host = url.host_str()?.to_string();
    let host = strip_brackets(&raw_host).to_string();
    let port = u64::from(url.port()?);
    let user = percent_encoding::percent_decode_str(url.username())
        .decode_utf8_lossy()
        .to_string();

    if !valid_endpoint(&host, port) || user.is_empty() {
        return None;
    }

    let security = q("security").unwrap_or_else(|| "none".to_string());
    let net = q("type").unwrap_or_else(|| "tcp".to_string());
    let sni = q("sni");

    let mut stream = json!({ "network": net });
    match security.as_str() {
        "reality" => {
            // reality 没有公钥无法握手，视为解析失败
            let pbk = q("pbk")?;
            stream["security"] = json!("reality");
            stream["realitySettings"] = json!({
                "serverName": sni.clone().unwrap_or_else(|| host.clone()),
                "publicKey": pbk,
                "shortId": q("sid").unwrap_or_default(),
                "fingerprint": q("fp").unwrap_or_else(|| "chrome".to_string()),
                "spiderX": "",
            });
        }
        "tls" | "xtls" => {
            stream["security"] = json!("tls");
            let mut tls = json!({
                "serverName": sni.clone().unwrap_or_else(|| host.clone()),
                "allowInsecure": false,
            });
            if let Some(fp) = q("fp") {
                tls["fingerprint"] = json!(fp);
            }
            stream["tlsSettings"] = tls;
        }
        _ => {}
    }

    match net.as_str() {
        "ws" | "websocket" => {
            let mut ws = json!({});
            if let Some(p) = q("path") {
                ws["path"] = json!(p);
            }
            if let Some(h) = q("host") {
                ws["headers"] = json!({ "Host": h });
            }
            stream["wsSettings"] = ws;
        }
        "grpc" | "gun" => {
            stream["grpcSettings"] = json!({
                "serviceName": q("serviceName").unwrap_or_default(),
            });
        }
        "splithttp" | "xhttp" => {
            let mut sh = json!({});
            if let Some(p) = q("path") {
                sh["path"] = json!(p);
            }
            if let Some(h) = q("host") {
                sh["host"] = json!(h);
            }
            stream["splithttpSettings"] = sh;
        }
        "h2" | "http" => {
            let mut h2 = json!({ "path": q("path").unwrap_or_else(|| "/".to_string()) });
            if let Some(h) = q("host") {
                h2["host"] = json!([h]);
            }
            stream["httpSettings"] = h2;
        }
        _ => {}
    }

    let ps = sanitize_remark(url.fragment().unwrap_or_default());
    let addr = host.clone();

    let (scheme, outbound) = match proto {
        Protocol::Vless => (
            "vless",
            json!({
                "protocol": "vless",
                "settings": {
                    "vnext": [{
                        "address": addr,
                        "port": port,
                        "users": [{
                            "id": user,
                            "encryption": "none",
                            "flow": q("flow").unwrap_or_default(),
                        }],
                    }],
                },
                "streamSettings": stream,
            }),
        ),
        Protocol::Trojan => (
            "trojan",
            json!({
                "protocol": "trojan",
                "settings": {
                    "servers": [{
                        "address": addr,
                        "port": port,
                        "password": user,
                    }],
                },
                "streamSettings": stream,
            }),
        ),
    };

    Some(ParsedConfig {
        scheme: scheme.to_string(),
        host,
        port: port as u16,
        identity: user,
        ps,
        outbound,
    })
}

// --- shadowsocks ---

/// 贪婪提取端口前缀数字，容忍尾部杂质 (如 "8388/?plugin=...")
fn greedy_port(raw: &str) -> Option<u64> {
    let digits: String = raw.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok().filter(|p| (1..=65535).contains(p))
}

fn split_host_port(addr: &str) -> Option<(String, u64)> {
    let (host, port_raw) = addr.rsplit_once(':')?;
    let port = greedy_port(port_raw)?;
    let host = strip_brackets(host.trim()).to_string();
    Some((host, port))
}

fn split_method_password(userinfo: &str) -> Option<(String, String)> {
    let (method, password) = userinfo.split_once(':')?;
    if method.is_empty() || password.is_empty() || method.contains('@') {
        return None;
    }
    Some((method.to_string(), password.to_string()))
}

/// 解析 ss 核心段：依次尝试明文 userinfo、Base64 userinfo、整段 Base64
fn parse_ss(body: &str) -> Option<ParsedConfig> {
    let (core, fragment) = match body.split_once('#') {
        Some((c, f)) => (c, f),
        None => (body, ""),
    };
    // 插件等查询参数不参与出站构造
    let core = core.split('?').next().unwrap_or(core);

    let decoded = (|| -> Option<(String, String, String, u64)> {
        if let Some((userinfo, addr)) = core.rsplit_once('@') {
            let (host, port) = split_host_port(addr)?;

            if let Some((method, password)) = split_method_password(userinfo) {
                return Some((method, password, host, port));
            }
            let plain = decode_base64_auto(userinfo)?;
            let (method, password) = split_method_password(&plain)?;
            return Some((method, password, host, port));
        }

        // 整段 Base64: method:password@host:port
        let plain = decode_base64_auto(core)?;
        let (userinfo, addr) = plain.rsplit_once('@')?;
        let (method, password) = split_method_password(userinfo)?;
        let (host, port) = split_host_port(addr)?;
        Some((method, password, host, port))
    })();

    let (method, password, host, port) = decoded?;
    if !valid_endpoint(&host, port) {
        return None;
    }

    let outbound = json!({
        "protocol": "shadowsocks",
        "settings": {
            "servers": [{
                "address": host,
                "port": port,
                "method": method,
                "password": password,
            }],
        },
        "streamSettings": { "network": "tcp" },
    });

    Some(ParsedConfig {
        scheme: "shadowsocks".to_string(),
        host: host.clone(),
        port: port as u16,
        identity: format!("{method}:{password}"),
        ps: sanitize_remark(fragment),
        outbound,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{Engine as _, engine::general_purpose::STANDARD_NO_PAD};

    #[test]
    fn vmess_string_port_and_unpadded_base64() {
        let payload = r#"{"add":"example.com","port":"443","id":"a3482e88-686a-4a58-8126-99c9df64b7bf","aid":"0","net":"ws","tls":"tls","path":"/dl","host":"cdn.example.com","ps":"node-1"}"#;
        let uri = format!("vmess://{}", STANDARD_NO_PAD.encode(payload));

        let parsed = parse(&uri).expect("must parse");
        assert_eq!(parsed.scheme, "vmess");
        assert_eq!(parsed.host, "example.com");
        assert_eq!(parsed.port, 443);
        assert_eq!(parsed.identity, "a3482e88-686a-4a58-8126-99c9df64b7bf");
        assert_eq!(parsed.ps, "node-1");
        assert_eq!(
            parsed.outbound["streamSettings"]["wsSettings"]["path"],
            "/dl"
        );
        assert_eq!(parsed.outbound["streamSettings"]["security"], "tls");
    }

    #[test]
    fn vless_reality_ipv6_with_escaped_fragment() {
        let uri = "vless://7f0e6a9c-2f92-4c3a-9f09-3d6318cb55e2@[2001:db8::1]:443?security=reality&pbk=k&fp=chrome&sid=ab#my%20host";
        let parsed = parse(uri).expect("must parse");

        assert_eq!(parsed.scheme, "vless");
        assert_eq!(parsed.host, "2001:db8::1");
        assert_eq!(parsed.port, 443);
        assert_eq!(parsed.ps, "my host");
        let reality = &parsed.outbound["streamSettings"]["realitySettings"];
        assert_eq!(reality["publicKey"], "k");
        assert_eq!(reality["fingerprint"], "chrome");
    }

    #[test]
    fn vless_reality_without_pbk_is_rejected() {
        let uri = "vless://7f0e6a9c-2f92-4c3a-9f09-3d6318cb55e2@host.example:443?security=reality#x";
        assert!(parse(uri).is_none());
    }

    #[test]
    fn ss_base64_userinfo() {
        // YWVzLTI1Ni1nY206cGFzcw == "aes-256-gcm:pass"
        let parsed = parse("ss://YWVzLTI1Ni1nY206cGFzcw@1.2.3.4:8388#t").expect("must parse");
        assert_eq!(parsed.scheme, "shadowsocks");
        assert_eq!(parsed.host, "1.2.3.4");
        assert_eq!(parsed.port, 8388);
        assert_eq!(parsed.identity, "aes-256-gcm:pass");
        assert_eq!(parsed.ps, "t");
    }

    #[test]
    fn ss_whole_core_base64_with_port_garbage() {
        let core = STANDARD_NO_PAD.encode("chacha20-ietf-poly1305:secret@9.9.9.9:8388/extra");
        let parsed = parse(&format!("ss://{core}")).expect("must parse");
        assert_eq!(parsed.port, 8388);
        assert_eq!(parsed.ps, "Unknown");
    }

    #[test]
    fn trojan_zero_host_is_rejected() {
        assert!(parse("trojan://pw@0.0.0.0:443?security=tls#dead").is_none());
    }

    #[test]
    fn unknown_scheme_and_garbage_yield_none() {
        assert!(parse("http://example.com").is_none());
        assert!(parse("vmess://!!!not-base64!!!").is_none());
        assert!(parse("").is_none());
        assert!(parse("vless://@host:443").is_none());
    }

    #[test]
    fn parse_is_idempotent_on_identity_fields() {
        let uri = "trojan://secret@server.example:8443?security=tls&type=grpc&serviceName=svc#remark";
        let a = parse(uri).unwrap();
        let b = parse(uri).unwrap();
        assert_eq!(a.host, b.host);
        assert_eq!(a.port, b.port);
        assert_eq!(a.identity, b.identity);
        assert_eq!(a.outbound, b.outbound);

        // 出站记录保留全部识别字段 (host/port/identity/scheme)
        assert_eq!(a.outbound["protocol"], "trojan");
        assert_eq!(a.outbound["settings"]["servers"][0]["address"], "server.example");
        assert_eq!(a.outbound["settings"]["servers"][0]["port"], 8443);
        assert_eq!(a.outbound["settings"]["servers"][0]["password"], "secret");
    }
}
