//! Broker - 在生产者与consumer之间路由工作单元
//!
//! 维护已注册BufferPort的注册表，提交时按轮询把工作单元放入某个port的outbound队列，
//! 取回时按轮询从各port的inbound队列取结果。
//! 每种负载类型可以有一个进程级实例(`init_global`/`global`/`teardown_global`)，
//! 测试中直接用`Broker::new`创建互相隔离的实例。

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Select, Sender};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use crate::balancer::RoundRobin;
use crate::config::BrokerConfig;
use crate::consumer::Consumer;
use crate::item::{Processable, WorkItem};
use crate::port::{BufferPort, PortId};
use crate::{BrokerError, PoolError};

type GlobalBrokers = HashMap<TypeId, Box<dyn Any + Send + Sync>>;

/// 按负载类型索引的全局broker
static GLOBAL_BROKERS: Lazy<Mutex<GlobalBrokers>> = Lazy::new(|| Mutex::new(HashMap::new()));

struct Registry<P> {
    ports: Vec<Arc<BufferPort<P>>>,
    submit_rr: RoundRobin,
}

impl<P> Registry<P> {
    fn position(&self, id: PortId) -> Option<usize> {
        self.ports.iter().position(|p| p.id() == id)
    }
}

/// 工作单元路由器
pub struct Broker<P> {
    config: BrokerConfig,
    registry: RwLock<Registry<P>>,
    // 取回只需注册表读锁，游标单独加锁；加锁顺序为先注册表后游标
    retrieve_rr: Mutex<RoundRobin>,
    next_port_id: AtomicU64,
    // 注销时残留在port中的工作单元
    orphans_tx: Sender<WorkItem<P>>,
    orphans_rx: Receiver<WorkItem<P>>,
    consumers: Mutex<Vec<Box<dyn Consumer<P>>>>,
}

impl<P: Processable> Broker<P> {
    /// 创建独立的broker实例
    pub fn new(config: BrokerConfig) -> Arc<Self> {
        let (orphans_tx, orphans_rx) = unbounded();
        Arc::new(Self {
            config,
            registry: RwLock::new(Registry {
                ports: Vec::new(),
                submit_rr: RoundRobin::new(),
            }),
            retrieve_rr: Mutex::new(RoundRobin::new()),
            next_port_id: AtomicU64::new(1),
            orphans_tx,
            orphans_rx,
            consumers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// 初始化该负载类型的全局broker
    pub fn init_global(config: BrokerConfig) -> Result<Arc<Self>, BrokerError> {
        let mut brokers = GLOBAL_BROKERS.lock();
        let key = TypeId::of::<P>();
        if brokers.contains_key(&key) {
            return Err(BrokerError::AlreadyInitialized);
        }
        let broker = Self::new(config);
        brokers.insert(key, Box::new(Arc::clone(&broker)));
        log::info!("Global broker initialised for {}", std::any::type_name::<P>());
        Ok(broker)
    }

    /// 获取该负载类型的全局broker
    pub fn global() -> Option<Arc<Self>> {
        GLOBAL_BROKERS
            .lock()
            .get(&TypeId::of::<P>())
            .and_then(|b| b.downcast_ref::<Arc<Self>>())
            .cloned()
    }

    /// 关闭并移除全局broker，返回之前是否存在
    pub fn teardown_global() -> bool {
        let removed = GLOBAL_BROKERS.lock().remove(&TypeId::of::<P>());
        match removed.and_then(|b| b.downcast::<Arc<Self>>().ok()) {
            Some(broker) => {
                broker.shutdown();
                log::info!("Global broker for {} torn down", std::any::type_name::<P>());
                true
            }
            None => false,
        }
    }

    /// 创建并注册一个新port
    pub fn register_port(&self) -> Result<Arc<BufferPort<P>>, BrokerError> {
        let mut registry = self.registry.write();
        if registry.ports.len() >= self.config.max_registered_ports {
            return Err(BrokerError::RegistryFull {
                max: self.config.max_registered_ports,
            });
        }
        let id = self.next_port_id.fetch_add(1, Ordering::Relaxed);
        let port = Arc::new(BufferPort::new(id, self.config.port_capacity));
        port.attach_salvage(self.orphans_tx.clone());
        registry.ports.push(Arc::clone(&port));
        metrics::gauge!("zerg_broker_ports_registered").set(registry.ports.len() as f64);
        log::info!("Registered buffer port {} ({} active)", id, registry.ports.len());
        Ok(port)
    }

    /// 注销port并唤醒其等待者
    ///
    /// inbound中的结果和outbound中未被处理的工作单元都交给后续的`retrieve`，
    /// 后者被标记为`ErrorFlagged`。注销时正在执行的工作单元在consumer写回失败后
    /// 由port交还，同样进入孤儿队列。
    pub fn deregister_port(&self, id: PortId) -> Result<(), BrokerError> {
        let port = {
            let mut registry = self.registry.write();
            let idx = registry.position(id).ok_or(BrokerError::UnknownPort(id))?;
            let port = registry.ports.remove(idx);
            let len = registry.ports.len();
            registry.submit_rr.on_removed(idx, len);
            self.retrieve_rr.lock().on_removed(idx, len);
            metrics::gauge!("zerg_broker_ports_registered").set(len as f64);
            port
        };

        // 关闭前后各收集一次，避免遗漏正在写入的结果
        let mut salvaged = self.salvage(&port);
        port.close();
        salvaged += self.salvage(&port);

        log::info!("Deregistered buffer port {} ({} items salvaged)", id, salvaged);
        Ok(())
    }

    fn salvage(&self, port: &BufferPort<P>) -> usize {
        let mut count = 0;
        for item in port.drain_inbound() {
            count += 1;
            let _ = self.orphans_tx.send(item);
        }
        for mut item in port.drain_outbound() {
            if let Err(e) = item.flag_error("port closed before processing") {
                log::warn!("Unprocessed item {} has unexpected status: {}", item.id(), e);
            }
            count += 1;
            let _ = self.orphans_tx.send(item);
        }
        count
    }

    /// 提交工作单元，返回接收它的port
    ///
    /// 先无阻塞地按轮询尝试所有未关闭且未满的port，全部满时在截止时间前轮流阻塞等待。
    pub fn submit(&self, item: WorkItem<P>, timeout: Duration) -> Result<PortId, BrokerError> {
        let deadline = Instant::now() + timeout;
        let mut item = item;

        {
            let mut registry = self.registry.write();
            if registry.ports.is_empty() {
                return Err(BrokerError::NoPortsAvailable);
            }
            let len = registry.ports.len();
            let order: Vec<usize> = registry.submit_rr.order(len).collect();
            for idx in order {
                let port = &registry.ports[idx];
                if port.is_closed() || port.is_saturated() {
                    continue;
                }
                match port.try_push_outbound(item) {
                    Ok(()) => {
                        let id = port.id();
                        registry.submit_rr.advance_past(idx, len);
                        self.on_submitted(id);
                        return Ok(id);
                    }
                    Err((_, back)) => item = back,
                }
            }
        }

        // 所有port都满，轮流等待
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(BrokerError::Timeout);
            }
            let port = {
                let mut registry = self.registry.write();
                let len = registry.ports.len();
                let candidate = registry
                    .submit_rr
                    .order(len)
                    .find(|&idx| !registry.ports[idx].is_closed());
                match candidate {
                    Some(idx) => {
                        registry.submit_rr.advance_past(idx, len);
                        Arc::clone(&registry.ports[idx])
                    }
                    None => return Err(BrokerError::NoPortsAvailable),
                }
            };

            let slice = self.config.poll_slice().min(deadline - now);
            match port.push_outbound_or_return(item, Some(slice)) {
                Ok(()) => {
                    self.on_submitted(port.id());
                    return Ok(port.id());
                }
                Err((_, back)) => item = back,
            }
        }
    }

    fn on_submitted(&self, port: PortId) {
        metrics::counter!("zerg_broker_items_submitted_total").increment(1);
        log::debug!("Submitted item to port {}", port);
    }

    /// 取回一个处理结果
    ///
    /// 先取注销时留下的工作单元，再按轮询无阻塞检查各port，
    /// 都为空时同时等待所有inbound队列和关闭信号。
    pub fn retrieve(&self, timeout: Duration) -> Result<WorkItem<P>, BrokerError> {
        let deadline = Instant::now() + timeout;
        let mut first_pass = true;
        let mut saw_close = false;

        loop {
            if let Ok(item) = self.orphans_rx.try_recv() {
                return Ok(self.on_retrieved(item));
            }

            let ports = {
                let registry = self.registry.read();
                if registry.ports.is_empty() {
                    return Err(if first_pass && !saw_close {
                        BrokerError::NoPortsAvailable
                    } else {
                        BrokerError::PortClosed
                    });
                }
                let len = registry.ports.len();
                let mut cursor = self.retrieve_rr.lock();
                let order: Vec<usize> = cursor.order(len).collect();
                for idx in order {
                    if let Some(item) = registry.ports[idx].try_pop_inbound() {
                        cursor.advance_past(idx, len);
                        return Ok(self.on_retrieved(item));
                    }
                }
                drop(cursor);
                registry
                    .ports
                    .iter()
                    .filter(|p| !p.is_closed())
                    .cloned()
                    .collect::<Vec<_>>()
            };
            first_pass = false;

            if ports.is_empty() {
                return Err(BrokerError::PortClosed);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(BrokerError::Timeout);
            }
            let slice = self.config.poll_slice().min(deadline - now);

            match self.wait_inbound(&ports, slice) {
                Wake::Item(idx, mut item) => {
                    ports[idx].after_inbound_pop(&mut item);
                    let registry = self.registry.read();
                    let len = registry.ports.len();
                    if let Some(pos) = registry.position(ports[idx].id()) {
                        self.retrieve_rr.lock().advance_past(pos, len);
                    }
                    return Ok(self.on_retrieved(item));
                }
                Wake::Orphan(item) => return Ok(self.on_retrieved(item)),
                Wake::Closed => saw_close = true,
                Wake::Idle => {}
            }
        }
    }

    fn wait_inbound(&self, ports: &[Arc<BufferPort<P>>], slice: Duration) -> Wake<P> {
        let mut sel = Select::new();
        for port in ports {
            sel.recv(port.inbound_receiver());
        }
        for port in ports {
            sel.recv(port.close_receiver());
        }
        let orphan_idx = sel.recv(&self.orphans_rx);

        let oper = match sel.select_timeout(slice) {
            Ok(oper) => oper,
            Err(_) => return Wake::Idle,
        };
        let idx = oper.index();
        if idx < ports.len() {
            match oper.recv(ports[idx].inbound_receiver()) {
                Ok(item) => Wake::Item(idx, item),
                Err(_) => Wake::Closed,
            }
        } else if idx == orphan_idx {
            match oper.recv(&self.orphans_rx) {
                Ok(item) => Wake::Orphan(item),
                Err(_) => Wake::Idle,
            }
        } else {
            let _ = oper.recv(ports[idx - ports.len()].close_receiver());
            Wake::Closed
        }
    }

    fn on_retrieved(&self, item: WorkItem<P>) -> WorkItem<P> {
        metrics::counter!("zerg_broker_items_retrieved_total").increment(1);
        log::debug!(
            "Retrieved item {} (generation {}, status {})",
            item.id(),
            item.generation(),
            item.status()
        );
        item
    }

    /// 注册consumer的port并启动它，broker关闭前一直持有该consumer
    pub fn enrol(self: &Arc<Self>, mut consumer: Box<dyn Consumer<P>>) -> Result<(), PoolError> {
        let port = consumer.register_port(self)?;
        if let Err(e) = consumer.start() {
            let _ = self.deregister_port(port);
            return Err(e);
        }
        log::info!(
            "Enrolled consumer {} ({}) on port {}",
            consumer.name(),
            consumer.mnemonic(),
            port
        );
        self.consumers.lock().push(consumer);
        Ok(())
    }

    pub fn has_consumers(&self) -> bool {
        !self.consumers.lock().is_empty()
    }

    /// 所有已加入的consumer是否都能保证完整返回
    pub fn capable_of_full_return(&self) -> bool {
        let consumers = self.consumers.lock();
        !consumers.is_empty() && consumers.iter().all(|c| c.capable_of_full_return())
    }

    /// 已加入consumer的处理单元估计总数
    pub fn processing_units_estimate(&self) -> usize {
        self.consumers
            .lock()
            .iter()
            .map(|c| c.processing_units_estimate().0)
            .sum()
    }

    pub fn port_count(&self) -> usize {
        self.registry.read().ports.len()
    }

    pub fn port_ids(&self) -> Vec<PortId> {
        self.registry.read().ports.iter().map(|p| p.id()).collect()
    }

    pub fn port(&self, id: PortId) -> Option<Arc<BufferPort<P>>> {
        self.registry
            .read()
            .ports
            .iter()
            .find(|p| p.id() == id)
            .cloned()
    }

    /// 注销时留下、尚未被取回的工作单元数量
    pub fn orphan_count(&self) -> usize {
        self.orphans_rx.len()
    }

    /// 停止所有consumer并注销剩余port
    pub fn shutdown(&self) {
        let consumers: Vec<_> = self.consumers.lock().drain(..).collect();
        for mut consumer in consumers {
            if let Err(e) = consumer.stop() {
                log::warn!("Failed to stop consumer {}: {}", consumer.name(), e);
            }
        }
        for id in self.port_ids() {
            let _ = self.deregister_port(id);
        }
        log::info!("Broker shut down");
    }
}

enum Wake<P> {
    Item(usize, WorkItem<P>),
    Orphan(WorkItem<P>),
    Closed,
    Idle,
}
