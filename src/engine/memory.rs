//! 内存水位监测 (Memory Watch)
//!
//! 供基准引擎实施背压：高水位强制休眠，极限水位中止剩余分片。
//! 测试通过固定读数注入水位场景。

use parking_lot::Mutex;
use sysinfo::System;

/// 一次内存读数
#[derive(Debug, Clone, Copy)]
pub struct MemoryReading {
    /// 已用内存百分比 (0-100)
    pub used_percent: f64,
    /// 可用内存 (MiB)
    pub available_mib: u64,
}

enum Inner {
    Live(Mutex<System>),
    Fixed(MemoryReading),
}

pub struct MemoryWatch {
    inner: Inner,
}

impl MemoryWatch {
    pub fn new() -> Self {
        Self {
            inner: Inner::Live(Mutex::new(System::new())),
        }
    }

    /// 固定读数实例，用于水位场景测试
    pub fn fixed(used_percent: f64, available_mib: u64) -> Self {
        Self {
            inner: Inner::Fixed(MemoryReading {
                used_percent,
                available_mib,
            }),
        }
    }

    pub fn read(&self) -> MemoryReading {
        match &self.inner {
            Inner::Fixed(r) => *r,
            Inner::Live(sys) => {
                let mut sys = sys.lock();
                sys.refresh_memory();

                let total = sys.total_memory().max(1);
                let available = sys.available_memory();
                MemoryReading {
                    used_percent: (total.saturating_sub(available)) as f64 / total as f64 * 100.0,
                    available_mib: available / (1024 * 1024),
                }
            }
        }
    }
}

impl Default for MemoryWatch {
    fn default() -> Self {
        Self::new()
    }
}
