//! 通过broker分发的executor

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::broker::Broker;
use crate::config::ExecutorConfig;
use crate::executor::timing::{TurnaroundStats, WaitFactor};
use crate::executor::{Executor, GenerationHandle, ReturnPolicy, ReturnReport};
use crate::item::{GenerationId, ItemId, ProcessingStatus, Processable, WorkItem};
use crate::{BrokerError, PoolError, Result};

/// 已发出、尚未返回的工作单元
struct Outstanding<P> {
    // 提交时的副本，用于重新提交或报告缺失
    template: WorkItem<P>,
    sent_at: Instant,
    resubmissions: usize,
}

struct Generation<P> {
    expected: usize,
    outstanding: HashMap<ItemId, Outstanding<P>>,
    ignored: Vec<WorkItem<P>>,
}

/// broker executor
pub struct BrokerExecutor<P> {
    broker: Arc<Broker<P>>,
    config: ExecutorConfig,
    next_generation: GenerationId,
    pending: HashMap<GenerationId, Generation<P>>,
    // 属于已提交但尚未开始收集的代的提前返回
    early: HashMap<GenerationId, Vec<WorkItem<P>>>,
    stats: TurnaroundStats,
    wait_factor: WaitFactor,
}

impl<P: Processable> BrokerExecutor<P> {
    pub fn new(broker: Arc<Broker<P>>, config: ExecutorConfig) -> Self {
        let wait_factor = WaitFactor::new(config.wait_factor.clone());
        Self {
            broker,
            config,
            next_generation: 1,
            pending: HashMap::new(),
            early: HashMap::new(),
            stats: TurnaroundStats::default(),
            wait_factor,
        }
    }

    /// 使用该负载类型的全局broker
    pub fn with_global_broker(config: ExecutorConfig) -> Result<Self> {
        let broker = Broker::<P>::global().ok_or(BrokerError::NoPortsAvailable)?;
        Ok(Self::new(broker, config))
    }

    pub fn broker(&self) -> &Arc<Broker<P>> {
        &self.broker
    }

    /// 当前等待系数
    pub fn wait_factor(&self) -> f64 {
        self.wait_factor.current()
    }

    pub fn stats(&self) -> &TurnaroundStats {
        &self.stats
    }

    fn send(&self, item: WorkItem<P>) {
        let id = item.id();
        if let Err(e) = self.broker.submit(item, self.config.submission_timeout()) {
            // 仍记为在途，超时后会重新提交
            log::warn!("Submission of item {} failed: {}", id, e);
        }
    }

    fn resubmit(&self, entry: &mut Outstanding<P>, report: &mut ReturnReport<P>) {
        entry.resubmissions += 1;
        entry.sent_at = Instant::now();
        report.resubmissions += 1;
        metrics::counter!("zerg_broker_executor_resubmissions_total").increment(1);
        log::debug!(
            "Resubmitting item {} (attempt {})",
            entry.template.id(),
            entry.resubmissions
        );
        self.send(entry.template.clone());
    }

    /// 处理一个返回的工作单元
    fn accept(
        &mut self,
        mut item: WorkItem<P>,
        generation: GenerationId,
        gen: &mut Generation<P>,
        report: &mut ReturnReport<P>,
    ) {
        if item.generation() != generation {
            if self.pending.contains_key(&item.generation()) {
                self.early.entry(item.generation()).or_default().push(item);
            } else {
                log::debug!(
                    "Late item {} from generation {} while collecting {}",
                    item.id(),
                    item.generation(),
                    generation
                );
                report.late.push(item);
            }
            return;
        }

        let Some(mut entry) = gen.outstanding.remove(&item.id()) else {
            log::debug!("Dropping duplicate return of item {}", item.id());
            return;
        };

        if !item.status().is_final() {
            let _ = item.flag_error("returned without a final status");
        }

        match item.status() {
            ProcessingStatus::Processed => {
                self.stats.record(Instant::now(), entry.sent_at.elapsed());
                report.processed.push(item);
            }
            ProcessingStatus::ExceptionCaught => {
                self.stats.record(Instant::now(), entry.sent_at.elapsed());
                report.exception_caught.push(item);
            }
            _ => {
                if entry.resubmissions < self.config.max_resubmissions {
                    log::info!(
                        "Item {} flagged ({}), resubmitting",
                        item.id(),
                        item.error().unwrap_or("no reason")
                    );
                    self.resubmit(&mut entry, report);
                    gen.outstanding.insert(item.id(), entry);
                } else {
                    report.error_flagged.push(item);
                }
            }
        }
    }

    fn partial_target_reached(&self, gen: &Generation<P>, report: &ReturnReport<P>) -> bool {
        let pct = self.config.min_partial_return_percentage as usize;
        if pct == 0 || gen.expected == 0 {
            return false;
        }
        report.returned() * 100 >= pct * gen.expected
    }

    /// 按单项超时逐个重新提交，返回下一个到期时间
    fn resubmit_overdue(
        &self,
        gen: &mut Generation<P>,
        report: &mut ReturnReport<P>,
        fallback: Duration,
    ) -> (Instant, bool) {
        let item_timeout = self
            .stats
            .item_timeout(self.wait_factor.current(), gen.expected)
            .unwrap_or(fallback)
            .max(self.config.min_item_timeout());

        let now = Instant::now();
        let mut timed_out = false;
        let mut exhausted = Vec::new();
        for (id, entry) in gen.outstanding.iter_mut() {
            if now.duration_since(entry.sent_at) < item_timeout {
                continue;
            }
            timed_out = true;
            if entry.resubmissions < self.config.max_resubmissions {
                self.resubmit(entry, report);
            } else {
                exhausted.push(*id);
            }
        }
        for id in exhausted {
            if let Some(entry) = gen.outstanding.remove(&id) {
                log::warn!("Item {} missing after {} resubmissions", id, entry.resubmissions);
                report.missing.push(entry.template);
            }
        }

        let next_due = gen
            .outstanding
            .values()
            .map(|e| e.sent_at + item_timeout)
            .min()
            .unwrap_or(now + item_timeout);
        (next_due, timed_out)
    }
}

impl<P: Processable> Executor<P> for BrokerExecutor<P> {
    fn submit(&mut self, items: Vec<WorkItem<P>>) -> Result<GenerationHandle> {
        let generation = self.next_generation;
        self.next_generation += 1;

        let mut gen = Generation {
            expected: 0,
            outstanding: HashMap::with_capacity(items.len()),
            ignored: Vec::new(),
        };
        let mut to_send = Vec::with_capacity(items.len());
        for (position, mut item) in items.into_iter().enumerate() {
            item.stamp(generation, position);
            match item.status() {
                ProcessingStatus::Ignore => gen.ignored.push(item),
                ProcessingStatus::PendingProcessing => to_send.push(item),
                other => {
                    return Err(PoolError::Status(crate::item::StatusError::NotPending(other)));
                }
            }
        }

        gen.expected = to_send.len();
        for item in to_send {
            gen.outstanding.insert(
                item.id(),
                Outstanding {
                    template: item.clone(),
                    sent_at: Instant::now(),
                    resubmissions: 0,
                },
            );
            self.send(item);
        }

        log::info!(
            "Submitted generation {} ({} items, {} ignored)",
            generation,
            gen.expected,
            gen.ignored.len()
        );
        let handle = GenerationHandle::new(generation, gen.expected);
        self.pending.insert(generation, gen);
        Ok(handle)
    }

    fn collect(
        &mut self,
        handle: GenerationHandle,
        policy: ReturnPolicy,
        timeout: Duration,
    ) -> Result<ReturnReport<P>> {
        let generation = handle.generation();
        let mut gen = self
            .pending
            .remove(&generation)
            .ok_or(PoolError::UnknownGeneration(generation))?;
        let started = Instant::now();
        let mut report = ReturnReport::new(generation);
        report.ignored = std::mem::take(&mut gen.ignored);
        self.stats.start_generation();

        for item in self.early.remove(&generation).unwrap_or_default() {
            self.accept(item, generation, &mut gen, &mut report);
        }

        let poll = self.config.poll_slice();
        let mut cycle = 0;
        let mut deadline = started + timeout;
        let mut timed_out = false;

        while !gen.outstanding.is_empty() {
            if policy == ReturnPolicy::IncompleteReturnAllowed
                && self.partial_target_reached(&gen, &report)
            {
                break;
            }

            match policy {
                ReturnPolicy::ResubmitAfterTimeout => {
                    let (next_due, overdue) = self.resubmit_overdue(&mut gen, &mut report, timeout);
                    timed_out |= overdue;
                    deadline = next_due;
                }
                _ => {
                    if Instant::now() >= deadline {
                        timed_out = true;
                        if cycle < self.config.max_resubmissions {
                            cycle += 1;
                            log::info!(
                                "Generation {}: {} items outstanding after timeout, resubmitting (cycle {})",
                                generation,
                                gen.outstanding.len(),
                                cycle
                            );
                            for entry in gen.outstanding.values_mut() {
                                self.resubmit(entry, &mut report);
                            }
                            deadline = Instant::now() + timeout;
                        } else {
                            break;
                        }
                    }
                }
            }
            if gen.outstanding.is_empty() {
                break;
            }

            let wait = deadline
                .saturating_duration_since(Instant::now())
                .min(poll)
                .max(Duration::from_millis(1));
            match self.broker.retrieve(wait) {
                Ok(item) => self.accept(item, generation, &mut gen, &mut report),
                Err(BrokerError::Timeout) => {}
                Err(BrokerError::NoPortsAvailable) | Err(BrokerError::PortClosed) => {
                    // 暂时没有consumer
                    std::thread::sleep(wait);
                }
                Err(e) => return Err(e.into()),
            }
        }

        for (_, entry) in gen.outstanding.drain() {
            report.missing.push(entry.template);
        }
        if !report.missing.is_empty() {
            log::warn!(
                "Generation {} collected with {} of {} items missing",
                generation,
                report.missing.len(),
                gen.expected
            );
        }

        if timed_out {
            self.wait_factor.on_timeout();
        } else {
            self.wait_factor.on_clean_generation();
        }
        report.finish(started);
        Ok(report)
    }
}
