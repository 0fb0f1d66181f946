//! 本地executor: 串行执行和基于rayon线程池的并行执行
//!
//! 本地执行总能完整返回，回收策略和超时被忽略。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rayon::prelude::*;

use crate::executor::{Executor, GenerationHandle, ReturnPolicy, ReturnReport};
use crate::item::{GenerationId, ProcessingStatus, Processable, StatusError, WorkItem};
use crate::{PoolError, Result};

/// 按代暂存已提交的工作单元
struct Staged<P> {
    next_generation: GenerationId,
    pending: HashMap<GenerationId, Vec<WorkItem<P>>>,
}

impl<P: Processable> Staged<P> {
    fn new() -> Self {
        Self {
            next_generation: 1,
            pending: HashMap::new(),
        }
    }

    fn stage(&mut self, items: Vec<WorkItem<P>>) -> Result<GenerationHandle> {
        let generation = self.next_generation;
        self.next_generation += 1;

        let mut staged = Vec::with_capacity(items.len());
        let mut expected = 0;
        for (position, mut item) in items.into_iter().enumerate() {
            match item.status() {
                ProcessingStatus::Ignore => {}
                ProcessingStatus::PendingProcessing => expected += 1,
                other => return Err(PoolError::Status(StatusError::NotPending(other))),
            }
            item.stamp(generation, position);
            staged.push(item);
        }
        self.pending.insert(generation, staged);
        Ok(GenerationHandle::new(generation, expected))
    }

    fn take(&mut self, handle: &GenerationHandle) -> Result<Vec<WorkItem<P>>> {
        self.pending
            .remove(&handle.generation())
            .ok_or(PoolError::UnknownGeneration(handle.generation()))
    }
}

fn build_report<P>(generation: GenerationId, items: Vec<WorkItem<P>>, started: Instant) -> ReturnReport<P> {
    let mut report = ReturnReport::new(generation);
    for item in items {
        match item.status() {
            ProcessingStatus::Processed => report.processed.push(item),
            ProcessingStatus::ExceptionCaught => report.exception_caught.push(item),
            ProcessingStatus::ErrorFlagged => report.error_flagged.push(item),
            ProcessingStatus::Ignore | ProcessingStatus::PendingProcessing => report.ignored.push(item),
        }
    }
    report.finish(started);
    report
}

fn run_one<P: Processable>(item: &mut WorkItem<P>) {
    if item.status() == ProcessingStatus::PendingProcessing {
        if let Err(e) = item.process() {
            log::warn!("Item {} skipped: {}", item.id(), e);
        }
    }
}

/// 在调用线程中依次执行，适合调试
pub struct SerialExecutor<P> {
    staged: Staged<P>,
}

impl<P: Processable> SerialExecutor<P> {
    pub fn new() -> Self {
        Self {
            staged: Staged::new(),
        }
    }
}

impl<P: Processable> Default for SerialExecutor<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Processable> Executor<P> for SerialExecutor<P> {
    fn submit(&mut self, items: Vec<WorkItem<P>>) -> Result<GenerationHandle> {
        self.staged.stage(items)
    }

    fn collect(
        &mut self,
        handle: GenerationHandle,
        _policy: ReturnPolicy,
        _timeout: Duration,
    ) -> Result<ReturnReport<P>> {
        let started = Instant::now();
        let mut items = self.staged.take(&handle)?;
        items.iter_mut().for_each(run_one);
        Ok(build_report(handle.generation(), items, started))
    }
}

/// 在rayon线程池中并行执行
pub struct MtExecutor<P> {
    pool: rayon::ThreadPool,
    staged: Staged<P>,
}

impl<P: Processable> MtExecutor<P> {
    /// 创建线程池，`threads`为0时使用CPU核数
    pub fn new(threads: usize) -> Result<Self> {
        let threads = if threads == 0 { num_cpus::get() } else { threads };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("zerg-mt-{}", i))
            .build()
            .map_err(|e| PoolError::Consumer(format!("failed to build thread pool: {}", e)))?;
        Ok(Self {
            pool,
            staged: Staged::new(),
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl<P: Processable> Executor<P> for MtExecutor<P> {
    fn submit(&mut self, items: Vec<WorkItem<P>>) -> Result<GenerationHandle> {
        self.staged.stage(items)
    }

    fn collect(
        &mut self,
        handle: GenerationHandle,
        _policy: ReturnPolicy,
        _timeout: Duration,
    ) -> Result<ReturnReport<P>> {
        let started = Instant::now();
        let mut items = self.staged.take(&handle)?;
        self.pool.install(|| items.par_iter_mut().for_each(run_one));
        Ok(build_report(handle.generation(), items, started))
    }
}
