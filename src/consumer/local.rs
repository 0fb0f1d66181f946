//! 本地线程池consumer

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::broker::Broker;
use crate::consumer::Consumer;
use crate::item::Processable;
use crate::port::{BufferPort, PortId};
use crate::worker::Worker;
use crate::{PoolError, Result};

const DEFAULT_POLL: Duration = Duration::from_millis(50);

/// 在本进程内用固定数量的线程执行工作单元
pub struct LocalConsumer<P> {
    threads: usize,
    poll: Duration,
    broker: Weak<Broker<P>>,
    port: Option<Arc<BufferPort<P>>>,
    workers: Vec<Worker>,
    stop: Arc<AtomicBool>,
    processed: Arc<AtomicU64>,
}

impl<P: Processable> LocalConsumer<P> {
    /// 创建consumer，`threads`为0时使用CPU核数
    pub fn new(threads: usize) -> Self {
        Self {
            threads: if threads == 0 { num_cpus::get() } else { threads },
            poll: DEFAULT_POLL,
            broker: Weak::new(),
            port: None,
            workers: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            processed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 空闲时检查停止标志的间隔
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn port_id(&self) -> Option<PortId> {
        self.port.as_ref().map(|p| p.id())
    }

    /// 已执行的工作单元数量
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

impl<P: Processable> Consumer<P> for LocalConsumer<P> {
    fn name(&self) -> &str {
        "local thread-pool consumer"
    }

    fn mnemonic(&self) -> &str {
        "local"
    }

    fn register_port(&mut self, broker: &Arc<Broker<P>>) -> Result<PortId> {
        if let Some(port) = &self.port {
            return Ok(port.id());
        }
        let port = broker.register_port()?;
        let id = port.id();
        self.broker = Arc::downgrade(broker);
        self.port = Some(port);
        Ok(id)
    }

    fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        let port = self
            .port
            .clone()
            .ok_or_else(|| PoolError::Consumer("local consumer started without a port".into()))?;

        self.stop.store(false, Ordering::Release);
        for id in 0..self.threads {
            let worker = Worker::new(
                id,
                Arc::clone(&port),
                Arc::clone(&self.stop),
                self.poll,
                Arc::clone(&self.processed),
            )?;
            self.workers.push(worker);
        }
        log::info!("Local consumer started {} workers on port {}", self.threads, port.id());
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        // 先等线程交回正在处理的工作单元，再注销port
        let stopped = self.workers.len();
        self.workers.clear();

        if let Some(port) = self.port.take() {
            match self.broker.upgrade() {
                Some(broker) => {
                    if let Err(e) = broker.deregister_port(port.id()) {
                        log::debug!("Port {} already gone: {}", port.id(), e);
                        port.close();
                    }
                }
                None => port.close(),
            }
        }
        if stopped > 0 {
            log::info!("Local consumer stopped {} workers", stopped);
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }

    fn capable_of_full_return(&self) -> bool {
        true
    }

    fn processing_units_estimate(&self) -> (usize, bool) {
        (self.threads, true)
    }
}

impl<P> Drop for LocalConsumer<P> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(port) = self.port.take() {
            port.close();
        }
    }
}
