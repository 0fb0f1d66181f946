//! Queen模块 - 网络consumer
//!
//! 在独立的tokio运行时上监听TCP连接，每个连接对应一个会话，
//! 会话把port中的工作单元按请求发给远程客户端(drone)并把结果写回port。

mod session;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::runtime::Runtime;

use crate::broker::Broker;
use crate::config::ServerConfig;
use crate::consumer::Consumer;
use crate::item::Processable;
use crate::port::{BufferPort, PortId};
use crate::signal::StopSignal;
use crate::{PoolError, Result};

/// 停止时等待会话归还在途工作单元的上限
const SESSION_DRAIN_GRACE: Duration = Duration::from_secs(2);
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// 服务端统计
#[derive(Debug, Default)]
pub struct ServerStats {
    active: AtomicUsize,
    accepted: AtomicUsize,
    served: AtomicUsize,
    returned: AtomicUsize,
    stale: AtomicUsize,
}

impl ServerStats {
    /// 当前连接数
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn accepted_sessions(&self) -> usize {
        self.accepted.load(Ordering::Relaxed)
    }

    /// 用COMPUTE发出的工作单元数
    pub fn items_served(&self) -> usize {
        self.served.load(Ordering::Relaxed)
    }

    /// 收到的RESULT数
    pub fn results_returned(&self) -> usize {
        self.returned.load(Ordering::Relaxed)
    }

    /// 因失联被关闭的会话数
    pub fn stale_sessions(&self) -> usize {
        self.stale.load(Ordering::Relaxed)
    }
}

/// 会话共享的上下文
pub(crate) struct ServerContext<P> {
    pub(crate) port: Arc<BufferPort<P>>,
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) stop: StopSignal,
    pub(crate) stats: Arc<ServerStats>,
}

impl<P> Clone for ServerContext<P> {
    fn clone(&self) -> Self {
        Self {
            port: Arc::clone(&self.port),
            config: Arc::clone(&self.config),
            stop: self.stop.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

/// 网络consumer
pub struct NetworkedConsumer<P> {
    config: Arc<ServerConfig>,
    broker: Weak<Broker<P>>,
    port: Option<Arc<BufferPort<P>>>,
    runtime: Option<Runtime>,
    stop: StopSignal,
    local_addr: Option<SocketAddr>,
    stats: Arc<ServerStats>,
}

impl<P: Processable> NetworkedConsumer<P> {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            broker: Weak::new(),
            port: None,
            runtime: None,
            stop: StopSignal::new(),
            local_addr: None,
            stats: Arc::new(ServerStats::default()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// 实际监听地址，绑定到0端口时用于获取分配的端口
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    fn bind(&self) -> std::io::Result<std::net::TcpListener> {
        let addr = self.config.bind_addr;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(self.config.reuse_address)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    }

    fn wait_for_sessions(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        while self.stats.active_sessions() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

async fn accept_loop<P: Processable>(listener: TcpListener, ctx: ServerContext<P>) {
    loop {
        tokio::select! {
            _ = ctx.stop.wait() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(ctx.config.no_delay) {
                        log::warn!("Failed to configure socket for {}: {}", peer, e);
                    }
                    ctx.stats.accepted.fetch_add(1, Ordering::Relaxed);
                    ctx.stats.active.fetch_add(1, Ordering::Relaxed);
                    let session_ctx = ctx.clone();
                    tokio::spawn(async move {
                        let stats = Arc::clone(&session_ctx.stats);
                        let code = session::run_session(stream, peer, session_ctx).await;
                        stats.active.fetch_sub(1, Ordering::Relaxed);
                        log::info!("Session with {} closed ({})", peer, code);
                    });
                }
                Err(e) => {
                    log::error!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }
    log::debug!("Accept loop stopped");
}

impl<P: Processable> Consumer<P> for NetworkedConsumer<P> {
    fn name(&self) -> &str {
        "networked consumer"
    }

    fn mnemonic(&self) -> &str {
        "net"
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
        self.config.validate()?;
        let port = self
            .port
            .clone()
            .ok_or_else(|| PoolError::Consumer("networked consumer started without a port".into()))?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.config.listener_threads)
            .thread_name("zerg-queen")
            .enable_all()
            .build()?;

        let std_listener = self.bind()?;
        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(std_listener)?
        };
        let local_addr = listener.local_addr()?;

        self.stop = StopSignal::new();
        let ctx = ServerContext {
            port,
            config: Arc::clone(&self.config),
            stop: self.stop.clone(),
            stats: Arc::clone(&self.stats),
        };
        runtime.spawn(accept_loop(listener, ctx));

        log::info!(
            "Networked consumer listening on {} ({} threads)",
            local_addr,
            self.config.listener_threads
        );
        self.local_addr = Some(local_addr);
        self.runtime = Some(runtime);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.stop.trigger();
        if self.runtime.is_some() {
            self.wait_for_sessions(SESSION_DRAIN_GRACE);
        }

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

        if let Some(runtime) = self.runtime.take() {
            shutdown_runtime(runtime);
            log::info!("Networked consumer stopped");
        }
        self.local_addr = None;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.runtime.is_some()
    }

    fn capable_of_full_return(&self) -> bool {
        // 远程客户端随时可能消失
        false
    }

    fn processing_units_estimate(&self) -> (usize, bool) {
        (self.stats.active_sessions(), false)
    }
}

fn shutdown_runtime(runtime: Runtime) {
    // 在异步上下文中不能阻塞等待
    if tokio::runtime::Handle::try_current().is_ok() {
        runtime.shutdown_background();
    } else {
        runtime.shutdown_timeout(Duration::from_secs(5));
    }
}

impl<P> Drop for NetworkedConsumer<P> {
    fn drop(&mut self) {
        self.stop.trigger();
        if let Some(port) = self.port.take() {
            port.close();
        }
        if let Some(runtime) = self.runtime.take() {
            shutdown_runtime(runtime);
        }
    }
}
