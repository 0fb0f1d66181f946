//! BufferPort - 基于crossbeam-channel的双向有界队列
//!
//! outbound方向承载待处理的工作单元(broker -> consumer)，
//! inbound方向承载处理结果(consumer -> broker)。
//! 关闭port会唤醒所有阻塞在该port上的调用方。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Select, Sender, TrySendError};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::item::{ProcessingStatus, WorkItem};
use crate::BrokerError;

/// 默认队列容量
pub const DEFAULT_BUFFER_SIZE: usize = 10000;

/// port编号，由broker在注册时分配
pub type PortId = u64;

/// 失败的推送会把工作单元交还调用方
pub(crate) type Rejected<P> = (BrokerError, WorkItem<P>);

#[derive(Debug, Default)]
struct Counters {
    outbound_pushed: AtomicUsize,
    outbound_popped: AtomicUsize,
    inbound_pushed: AtomicUsize,
    inbound_popped: AtomicUsize,
}

/// 单向队列
struct Lane<P> {
    tx: Sender<WorkItem<P>>,
    rx: Receiver<WorkItem<P>>,
}

impl<P> Lane<P> {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx }
    }
}

/// 双向有界缓冲port
pub struct BufferPort<P> {
    id: PortId,
    capacity: usize,
    outbound: Lane<P>,
    inbound: Lane<P>,
    closed: AtomicBool,
    // 丢弃发送端即广播关闭
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
    counters: Counters,
    first_retrieval: OnceCell<DateTime<Utc>>,
    // broker的孤儿队列，关闭后无法送达的工作单元交还到这里
    salvage: OnceCell<Sender<WorkItem<P>>>,
}

impl<P> BufferPort<P> {
    /// 创建新的port
    pub fn new(id: PortId, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (close_tx, close_rx) = bounded(0);
        Self {
            id,
            capacity,
            outbound: Lane::new(capacity),
            inbound: Lane::new(capacity),
            closed: AtomicBool::new(false),
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
            counters: Counters::default(),
            first_retrieval: OnceCell::new(),
            salvage: OnceCell::new(),
        }
    }

    /// 由broker在注册时设置
    pub(crate) fn attach_salvage(&self, tx: Sender<WorkItem<P>>) {
        if self.salvage.set(tx).is_err() {
            log::warn!("Buffer port {} already has a salvage queue", self.id);
        }
    }

    /// 把无法写回的工作单元交还broker
    ///
    /// 仍处于待处理状态的工作单元会被标记为`ErrorFlagged`。
    /// 没有所属broker时返回`false`，工作单元被丢弃。
    pub fn hand_back(&self, mut item: WorkItem<P>, reason: &str) -> bool {
        if item.status() == ProcessingStatus::PendingProcessing {
            if let Err(e) = item.flag_error(reason) {
                log::debug!("Item {} not flagged: {}", item.id(), e);
            }
        }
        match self.salvage.get() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 推入待处理工作单元，`None`表示无限等待
    pub fn push_outbound(
        &self,
        item: WorkItem<P>,
        timeout: Option<Duration>,
    ) -> Result<(), BrokerError> {
        self.push_outbound_or_return(item, timeout)
            .map_err(|(err, _)| err)
    }

    /// consumer取出待处理工作单元
    pub fn pop_outbound(&self, timeout: Option<Duration>) -> Result<WorkItem<P>, BrokerError> {
        let mut item = self.pop_from(&self.outbound.rx, timeout)?;
        self.after_outbound_pop(&mut item);
        Ok(item)
    }

    /// consumer推入处理结果
    pub fn push_inbound(
        &self,
        item: WorkItem<P>,
        timeout: Option<Duration>,
    ) -> Result<(), BrokerError> {
        self.push_inbound_or_return(item, timeout)
            .map_err(|(err, _)| err)
    }

    /// broker取回处理结果
    pub fn pop_inbound(&self, timeout: Option<Duration>) -> Result<WorkItem<P>, BrokerError> {
        let mut item = self.pop_from(&self.inbound.rx, timeout)?;
        self.after_inbound_pop(&mut item);
        Ok(item)
    }

    pub(crate) fn push_outbound_or_return(
        &self,
        mut item: WorkItem<P>,
        timeout: Option<Duration>,
    ) -> Result<(), Rejected<P>> {
        item.set_port(self.id);
        item.marks_mut().outbound_submitted = Some(Utc::now());
        self.push_to(&self.outbound.tx, item, timeout)?;
        self.counters.outbound_pushed.fetch_add(1, Ordering::Relaxed);
        self.recover_after_close();
        Ok(())
    }

    pub(crate) fn push_inbound_or_return(
        &self,
        mut item: WorkItem<P>,
        timeout: Option<Duration>,
    ) -> Result<(), Rejected<P>> {
        item.marks_mut().inbound_submitted = Some(Utc::now());
        self.push_to(&self.inbound.tx, item, timeout)?;
        self.counters.inbound_pushed.fetch_add(1, Ordering::Relaxed);
        self.recover_after_close();
        Ok(())
    }

    // 推入与关闭并发时，写入可能晚于broker最后一次清空，这里补交
    fn recover_after_close(&self) {
        if !self.is_closed() || self.salvage.get().is_none() {
            return;
        }
        for item in self.drain_inbound() {
            self.hand_back(item, "port closed before result was returned");
        }
        for item in self.drain_outbound() {
            self.hand_back(item, "port closed before processing");
        }
    }

    /// 非阻塞推入outbound，队列满时返回`Timeout`
    pub(crate) fn try_push_outbound(&self, mut item: WorkItem<P>) -> Result<(), Rejected<P>> {
        if self.is_closed() {
            return Err((BrokerError::PortClosed, item));
        }
        item.set_port(self.id);
        item.marks_mut().outbound_submitted = Some(Utc::now());
        match self.outbound.tx.try_send(item) {
            Ok(()) => {
                self.counters.outbound_pushed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(item)) => Err((BrokerError::Timeout, item)),
            Err(TrySendError::Disconnected(item)) => Err((BrokerError::PortClosed, item)),
        }
    }

    /// 非阻塞取出inbound结果
    pub(crate) fn try_pop_inbound(&self) -> Option<WorkItem<P>> {
        let mut item = self.inbound.rx.try_recv().ok()?;
        self.after_inbound_pop(&mut item);
        Some(item)
    }

    pub(crate) fn inbound_receiver(&self) -> &Receiver<WorkItem<P>> {
        &self.inbound.rx
    }

    pub(crate) fn close_receiver(&self) -> &Receiver<()> {
        &self.close_rx
    }

    pub(crate) fn after_inbound_pop(&self, item: &mut WorkItem<P>) {
        item.marks_mut().inbound_retrieved = Some(Utc::now());
        self.counters.inbound_popped.fetch_add(1, Ordering::Relaxed);
    }

    fn after_outbound_pop(&self, item: &mut WorkItem<P>) {
        let now = Utc::now();
        self.first_retrieval.get_or_init(|| now);
        item.marks_mut().outbound_retrieved = Some(now);
        self.counters.outbound_popped.fetch_add(1, Ordering::Relaxed);
    }

    fn push_to(
        &self,
        tx: &Sender<WorkItem<P>>,
        item: WorkItem<P>,
        timeout: Option<Duration>,
    ) -> Result<(), Rejected<P>> {
        if self.is_closed() {
            return Err((BrokerError::PortClosed, item));
        }

        let mut sel = Select::new();
        let send_idx = sel.send(tx);
        sel.recv(&self.close_rx);
        let oper = match timeout {
            None => sel.select(),
            Some(t) => match sel.select_timeout(t) {
                Ok(oper) => oper,
                Err(_) => return Err((BrokerError::Timeout, item)),
            },
        };

        if oper.index() == send_idx {
            oper.send(tx, item)
                .map_err(|e| (BrokerError::PortClosed, e.into_inner()))
        } else {
            let _ = oper.recv(&self.close_rx);
            Err((BrokerError::PortClosed, item))
        }
    }

    fn pop_from(
        &self,
        rx: &Receiver<WorkItem<P>>,
        timeout: Option<Duration>,
    ) -> Result<WorkItem<P>, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::PortClosed);
        }

        let mut sel = Select::new();
        let recv_idx = sel.recv(rx);
        sel.recv(&self.close_rx);
        let oper = match timeout {
            None => sel.select(),
            Some(t) => sel.select_timeout(t).map_err(|_| BrokerError::Timeout)?,
        };

        if oper.index() == recv_idx {
            oper.recv(rx).map_err(|_| BrokerError::PortClosed)
        } else {
            let _ = oper.recv(&self.close_rx);
            Err(BrokerError::PortClosed)
        }
    }

    /// 关闭port并唤醒所有等待者，可重复调用
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_tx.lock().take();
            log::debug!("Buffer port {} closed", self.id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 清空outbound队列
    pub(crate) fn drain_outbound(&self) -> Vec<WorkItem<P>> {
        self.outbound.rx.try_iter().collect()
    }

    /// 清空inbound队列
    pub(crate) fn drain_inbound(&self) -> Vec<WorkItem<P>> {
        self.inbound
            .rx
            .try_iter()
            .map(|mut item| {
                self.after_inbound_pop(&mut item);
                item
            })
            .collect()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.rx.len()
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.rx.len()
    }

    /// outbound是否已满(负载感知轮询时跳过)
    pub fn is_saturated(&self) -> bool {
        self.outbound.tx.is_full()
    }

    /// consumer第一次取走工作的时间
    pub fn first_retrieval(&self) -> Option<DateTime<Utc>> {
        self.first_retrieval.get().copied()
    }

    /// 获取队列使用情况 (outbound推入, outbound取出, inbound推入, inbound取出)
    pub fn usage(&self) -> (usize, usize, usize, usize) {
        (
            self.counters.outbound_pushed.load(Ordering::Relaxed),
            self.counters.outbound_popped.load(Ordering::Relaxed),
            self.counters.inbound_pushed.load(Ordering::Relaxed),
            self.counters.inbound_popped.load(Ordering::Relaxed),
        )
    }
}

impl<P> std::fmt::Debug for BufferPort<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPort")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("outbound", &self.outbound_len())
            .field("inbound", &self.inbound_len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
