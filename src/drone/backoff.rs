//! 随机退避
//!
//! 没有工作(NODATA)时和重连前都随机等待一段时间，避免所有客户端同时访问服务端。

use std::time::Duration;

/// 在闭区间[min, max]内均匀取值的随机等待
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jitter {
    min: Duration,
    max: Duration,
}

impl Jitter {
    /// 创建退避区间，上下限颠倒时自动交换
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn from_millis(min_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(min_ms), Duration::from_millis(max_ms))
    }

    pub fn bounds(&self) -> (Duration, Duration) {
        (self.min, self.max)
    }

    /// 计算下一次等待时长
    pub fn next_delay(&self) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        Duration::from_millis(rand::random_range(min..=max))
    }
}

/// 重连策略: 最多重连次数和每次重连前的随机等待
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_reconnects: u32,
    pub jitter: Jitter,
}

impl ReconnectPolicy {
    pub fn new(max_reconnects: u32, jitter: Jitter) -> Self {
        Self {
            max_reconnects,
            jitter,
        }
    }

    /// 连续失败`attempts`次后是否还允许重连
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_reconnects
    }
}
