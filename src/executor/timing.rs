//! 返回时间统计与自适应超时
//!
//! 单个工作单元的超时 = 等待系数 × (平均返回间隔 × 预期数量 + 最长周转时间)，
//! 平均返回间隔使用EMA平滑。每代结束后根据是否发生超时调整等待系数。

use std::time::{Duration, Instant};

use moving_averages::ema::Ema;

use crate::config::WaitFactorBounds;

const DEFAULT_ALPHA: f64 = 0.2;

/// 工作单元返回时间统计
#[derive(Debug)]
pub struct TurnaroundStats {
    interval: Ema<f64>,
    // 最近一次平滑后的返回间隔(秒)
    average: Option<f64>,
    last_return: Option<Instant>,
    max_turnaround: Duration,
    samples: u64,
}

impl Default for TurnaroundStats {
    fn default() -> Self {
        Self::new(DEFAULT_ALPHA)
    }
}

impl TurnaroundStats {
    /// # 参数
    /// - alpha: 平滑系数，超出(0,1]时被截断
    pub fn new(alpha: f64) -> Self {
        Self {
            interval: Ema::new(alpha.clamp(f64::EPSILON, 1.0)),
            average: None,
            last_return: None,
            max_turnaround: Duration::ZERO,
            samples: 0,
        }
    }

    /// 记录一次返回: 返回时刻和该工作单元从发出到返回的时长
    pub fn record(&mut self, returned_at: Instant, turnaround: Duration) {
        if let Some(last) = self.last_return {
            let gap = returned_at.saturating_duration_since(last);
            self.average = Some(self.interval.next(gap.as_secs_f64()));
        }
        self.last_return = Some(returned_at);
        self.max_turnaround = self.max_turnaround.max(turnaround);
        self.samples += 1;
        metrics::histogram!("zerg_broker_turnaround_seconds").record(turnaround.as_secs_f64());
    }

    /// 新一代开始时调用，避免把两代之间的空闲计入返回间隔
    pub fn start_generation(&mut self) {
        self.last_return = None;
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn max_turnaround(&self) -> Duration {
        self.max_turnaround
    }

    /// 平滑后的返回间隔
    pub fn average_interval(&self) -> Option<Duration> {
        self.average.map(Duration::from_secs_f64)
    }

    /// 计算单个工作单元的超时；还没有统计数据时返回`None`
    pub fn item_timeout(&self, wait_factor: f64, expected: usize) -> Option<Duration> {
        if self.samples == 0 {
            return None;
        }
        let interval = self.average.unwrap_or(0.0);
        let secs = wait_factor * (interval * expected as f64 + self.max_turnaround.as_secs_f64());
        Duration::try_from_secs_f64(secs.max(0.0)).ok()
    }
}

/// 在上下限之间调整的等待系数
#[derive(Debug, Clone)]
pub struct WaitFactor {
    current: f64,
    bounds: WaitFactorBounds,
}

impl WaitFactor {
    pub fn new(bounds: WaitFactorBounds) -> Self {
        let current = bounds.initial.max(bounds.min).min(bounds.max);
        Self { current, bounds }
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    /// 本代出现过超时
    pub fn on_timeout(&mut self) {
        self.current = (self.current + self.bounds.increment).min(self.bounds.max);
    }

    /// 本代没有超时
    pub fn on_clean_generation(&mut self) {
        self.current = (self.current - self.bounds.decrement).max(self.bounds.min);
    }
}
