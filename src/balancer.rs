//! 轮询选择模块
//!
//! broker为提交和取回各维护一个游标，
//! 每次从游标位置开始依次尝试各port，选中后游标移到其后一个。

/// 轮询游标
#[derive(Debug, Default, Clone)]
pub struct RoundRobin {
    cursor: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前游标位置
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// 从游标开始遍历全部下标，恰好每个一次
    pub fn order(&self, len: usize) -> impl Iterator<Item = usize> {
        let start = if len == 0 { 0 } else { self.cursor % len };
        (0..len).map(move |offset| (start + offset) % len)
    }

    /// 选中`idx`后推进游标
    pub fn advance_past(&mut self, idx: usize, len: usize) {
        self.cursor = if len == 0 { 0 } else { (idx + 1) % len };
    }

    /// 注销第`idx`个port后修正游标，保持下一个候选不变
    pub fn on_removed(&mut self, idx: usize, len_after: usize) {
        if idx < self.cursor {
            self.cursor -= 1;
        }
        if len_after == 0 || self.cursor >= len_after {
            self.cursor = 0;
        }
    }
}
