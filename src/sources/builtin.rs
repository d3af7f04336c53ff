//! 内置采集源清单 (Built-in Source Lists)
//!
//! 公开的反审查配置聚合仓库，按优先级分组。清单会随仓库消亡而腐化，
//! 单个地址失效只影响自身，不影响周期推进。

use std::time::Duration;

use crate::sources::http_list::HttpListSource;

/// 通用反审查聚合源
const ANTI_CENSORSHIP_LISTS: &[&str] = &[
    "https://raw.githubusercontent.com/barry-far/V2ray-Configs/main/All_Configs_Sub.txt",
    "https://raw.githubusercontent.com/mahdibland/ShadowsocksAggregator/master/Eternity.txt",
    "https://raw.githubusercontent.com/ALIILAPRO/v2rayNG-Config/main/sub.txt",
    "https://raw.githubusercontent.com/MatinGhanbari/v2ray-config/main/subscriptions/v2ray/all_sub.txt",
];

/// 伊朗可达性优先源 (整理自面向伊朗网络的收集仓库)
const IRAN_PRIORITY_LISTS: &[&str] = &[
    "https://raw.githubusercontent.com/soroushmirzaei/telegram-configs-collector/main/splitted/mixed",
    "https://raw.githubusercontent.com/yebekhe/TVC/main/subscriptions/xray/base64/mix",
];

/// 通用源的整体截止时间
const ANTI_CENSORSHIP_DEADLINE: Duration = Duration::from_secs(120);
/// 优先源走更短的截止时间，保证其结果先进入池子
const IRAN_PRIORITY_DEADLINE: Duration = Duration::from_secs(45);

pub fn anti_censorship_source() -> HttpListSource {
    HttpListSource::new(
        "anti-censorship",
        ANTI_CENSORSHIP_LISTS.iter().map(|s| s.to_string()).collect(),
        ANTI_CENSORSHIP_DEADLINE,
    )
}

pub fn iran_priority_source() -> HttpListSource {
    HttpListSource::new(
        "iran-priority",
        IRAN_PRIORITY_LISTS.iter().map(|s| s.to_string()).collect(),
        IRAN_PRIORITY_DEADLINE,
    )
}
