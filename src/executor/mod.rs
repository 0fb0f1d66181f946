//! Executor - 按代(generation)提交工作单元并收集结果
//!
//! [`BrokerExecutor`]通过broker分发，[`SerialExecutor`]和[`MtExecutor`]在本进程内执行，
//! 三者实现同一个[`Executor`]接口。

pub mod broker;
pub mod local;
pub mod timing;

use std::time::{Duration, Instant};

use crate::item::{GenerationId, Processable, WorkItem};
use crate::Result;

pub use broker::BrokerExecutor;
pub use local::{MtExecutor, SerialExecutor};

/// 回收策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReturnPolicy {
    /// 等待全部返回，超时后重新提交未返回的工作单元
    #[default]
    ExpectFullReturn,
    /// 返回比例达到配置的最小百分比即可结束
    IncompleteReturnAllowed,
    /// 按统计出的单项超时逐个重新提交
    ResubmitAfterTimeout,
}

/// 一代提交的凭据，`collect`时交回
#[must_use = "a submitted generation has to be collected"]
#[derive(Debug)]
pub struct GenerationHandle {
    generation: GenerationId,
    expected: usize,
    submitted_at: Instant,
}

impl GenerationHandle {
    pub(crate) fn new(generation: GenerationId, expected: usize) -> Self {
        Self {
            generation,
            expected,
            submitted_at: Instant::now(),
        }
    }

    pub fn generation(&self) -> GenerationId {
        self.generation
    }

    /// 需要处理的工作单元数量(不含忽略的)
    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }
}

/// 一代的收集结果，各列表按提交位置排序
#[derive(Debug, Clone)]
pub struct ReturnReport<P> {
    pub generation: GenerationId,
    pub processed: Vec<WorkItem<P>>,
    pub exception_caught: Vec<WorkItem<P>>,
    /// 重新提交次数用尽后仍被标记错误的
    pub error_flagged: Vec<WorkItem<P>>,
    /// 原样返回的忽略项
    pub ignored: Vec<WorkItem<P>>,
    /// 超时且重新提交次数用尽，返回的是提交时的原始工作单元
    pub missing: Vec<WorkItem<P>>,
    /// 收集期间到达的更早代的工作单元
    pub late: Vec<WorkItem<P>>,
    pub resubmissions: usize,
    pub elapsed: Duration,
}

impl<P> ReturnReport<P> {
    pub(crate) fn new(generation: GenerationId) -> Self {
        Self {
            generation,
            processed: Vec::new(),
            exception_caught: Vec::new(),
            error_flagged: Vec::new(),
            ignored: Vec::new(),
            missing: Vec::new(),
            late: Vec::new(),
            resubmissions: 0,
            elapsed: Duration::ZERO,
        }
    }

    /// 已返回的工作单元数(任一终态)
    pub fn returned(&self) -> usize {
        self.processed.len() + self.exception_caught.len() + self.error_flagged.len()
    }

    /// 所有需要处理的工作单元都已返回
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        !self.exception_caught.is_empty() || !self.error_flagged.is_empty()
    }

    pub(crate) fn finish(&mut self, started: Instant) {
        for list in [
            &mut self.processed,
            &mut self.exception_caught,
            &mut self.error_flagged,
            &mut self.ignored,
            &mut self.missing,
        ] {
            list.sort_by_key(|item| item.position());
        }
        self.elapsed = started.elapsed();
    }
}

/// 执行器接口
pub trait Executor<P: Processable> {
    /// 提交一代工作单元，返回的凭据用于`collect`
    fn submit(&mut self, items: Vec<WorkItem<P>>) -> Result<GenerationHandle>;

    /// 按策略收集一代的结果
    fn collect(
        &mut self,
        handle: GenerationHandle,
        policy: ReturnPolicy,
        timeout: Duration,
    ) -> Result<ReturnReport<P>>;

    /// 提交并收集
    fn work_on(
        &mut self,
        items: Vec<WorkItem<P>>,
        policy: ReturnPolicy,
        timeout: Duration,
    ) -> Result<ReturnReport<P>> {
        let handle = self.submit(items)?;
        self.collect(handle, policy, timeout)
    }
}
