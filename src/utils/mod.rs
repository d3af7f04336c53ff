//! 通用工具集 (Shared Utilities)

use std::time::{SystemTime, UNIX_EPOCH};

pub mod cache;
pub mod parser;
pub mod priority;
pub mod xconfig;

/// 当前 unix 秒
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// 清洗节点备注：URL 反转义后剔除不可打印字节，空串回退为 "Unknown"
pub fn sanitize_remark(raw: &str) -> String {
    let decoded = percent_encoding::percent_decode_str(raw).decode_utf8_lossy();
    let cleaned: String = decoded
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .to_string();

    if cleaned.is_empty() {
        "Unknown".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remark_unescape_and_strip() {
        assert_eq!(sanitize_remark("my%20host"), "my host");
        assert_eq!(sanitize_remark("a\u{0}b\u{7}c"), "abc");
        assert_eq!(sanitize_remark(""), "Unknown");
        assert_eq!(sanitize_remark("%0a%0d"), "Unknown");
    }
}
