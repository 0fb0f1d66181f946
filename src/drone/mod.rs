//! Drone模块 - 远程客户端
//!
//! 客户端连接到网络consumer，循环请求工作、执行并返回结果。
//! 状态机顺序推进: Resolving -> Connecting -> Handshaking ->
//! (AwaitingCommand -> AwaitingResponse -> Processing)* -> Closing -> Closed，
//! 每个等待点都会检查停止信号。

pub mod backoff;
pub mod state;

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::config::ClientConfig;
use crate::item::{ProcessingStatus, Processable, WorkItem};
use crate::protocol::frame::{read_frame, write_frame};
use crate::protocol::{CloseCode, Command, Envelope, Frame, FrameKind, Hello, NetworkError};
use crate::signal::StopSignal;
use crate::Result;

pub use backoff::{Jitter, ReconnectPolicy};
pub use state::ConnectionState;

/// 客户端运行结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientReport {
    /// 执行过的工作单元数(包含抛出异常的)
    pub processed: u64,
    /// 其中以`ExceptionCaught`结束的数量
    pub exceptions: u64,
    /// 收到NODATA/ERROR的次数
    pub no_data: u64,
    pub reconnects: u32,
    pub close_code: CloseCode,
}

/// 可跨线程观察的客户端状态
#[derive(Debug, Clone, Default)]
pub struct StateHandle(Arc<Mutex<ConnectionState>>);

impl StateHandle {
    pub fn get(&self) -> ConnectionState {
        *self.0.lock()
    }

    fn set(&self, state: ConnectionState) {
        let mut current = self.0.lock();
        if *current != state {
            log::trace!("Client state {} -> {}", *current, state);
            *current = state;
        }
    }
}

/// 远程客户端
pub struct Client<P> {
    config: ClientConfig,
    stop: StopSignal,
    state: StateHandle,
    _payload: PhantomData<fn() -> P>,
}

impl<P: Processable> Client<P> {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            stop: StopSignal::new(),
            state: StateHandle::default(),
            _payload: PhantomData,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// 用于从其他任务或线程停止客户端
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn state_handle(&self) -> StateHandle {
        self.state.clone()
    }

    /// 在当前线程上创建运行时并运行到结束
    pub fn run_blocking(&self) -> Result<ClientReport> {
        self.config.validate()?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(runtime.block_on(self.run()))
    }

    /// 运行直到停止、达到上限、不可恢复的错误或重连次数用尽
    pub async fn run(&self) -> ClientReport {
        let started = Instant::now();
        let mut report = ClientReport::default();
        let policy = ReconnectPolicy::new(
            self.config.max_reconnects,
            Jitter::from_millis(self.config.reconnect_min_ms, self.config.reconnect_max_ms),
        );
        let mut failures = 0;

        loop {
            let (code, established) = self.run_connection(&mut report, started).await;
            report.close_code = code;
            if code != CloseCode::GoingAway || self.should_halt(&report, started) {
                break;
            }
            if established {
                failures = 0;
            }
            if !policy.allows(failures) {
                log::warn!(
                    "Giving up on {}:{} after {} reconnect attempts",
                    self.config.server,
                    self.config.port,
                    failures
                );
                break;
            }
            failures += 1;
            report.reconnects += 1;

            let delay = policy.jitter.next_delay();
            log::info!(
                "Reconnecting to {}:{} in {:?} (attempt {}/{})",
                self.config.server,
                self.config.port,
                delay,
                failures,
                policy.max_reconnects
            );
            tokio::select! {
                _ = self.stop.wait() => {
                    report.close_code = CloseCode::Normal;
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state.set(ConnectionState::Closed);
        log::info!(
            "Client finished: {} processed, {} without data, {} reconnects ({})",
            report.processed,
            report.no_data,
            report.reconnects,
            report.close_code
        );
        report
    }

    fn should_halt(&self, report: &ClientReport, started: Instant) -> bool {
        if self.stop.is_triggered() {
            return true;
        }
        if let Some(max) = self.config.process_max() {
            if report.processed >= max {
                return true;
            }
        }
        if let Some(max) = self.config.max_duration() {
            if started.elapsed() >= max {
                return true;
            }
        }
        false
    }

    /// 一次连接的完整生命周期，返回关闭原因和是否完成过握手
    async fn run_connection(&self, report: &mut ClientReport, started: Instant) -> (CloseCode, bool) {
        let mut stream = match self.connect().await {
            Ok(stream) => stream,
            Err(code) => return (code, false),
        };

        let (code, established) = match self.handshake(&mut stream).await {
            Ok(()) => (self.exchange(&mut stream, report, started).await, true),
            Err(code) => (code, false),
        };

        self.state.set(ConnectionState::Closing(code));
        if let Err(e) = stream.shutdown().await {
            log::debug!("Socket shutdown failed: {}", e);
        }
        (code, established)
    }

    async fn connect(&self) -> std::result::Result<TcpStream, CloseCode> {
        self.state.set(ConnectionState::Resolving);
        let target = (self.config.server.as_str(), self.config.port);
        let resolved = tokio::select! {
            _ = self.stop.wait() => return Err(CloseCode::Normal),
            resolved = tokio::net::lookup_host(target) => resolved,
        };
        let addr = match resolved.map(|mut addrs| addrs.next()) {
            Ok(Some(addr)) => addr,
            Ok(None) => {
                log::warn!("No address found for {}", self.config.server);
                return Err(CloseCode::GoingAway);
            }
            Err(e) => {
                log::warn!("Failed to resolve {}: {}", self.config.server, e);
                return Err(CloseCode::GoingAway);
            }
        };

        self.state.set(ConnectionState::Connecting);
        let stream = tokio::select! {
            _ = self.stop.wait() => return Err(CloseCode::Normal),
            stream = TcpStream::connect(addr) => stream,
        };
        match stream {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    log::debug!("Failed to disable Nagle on {}: {}", addr, e);
                }
                log::debug!("Connected to {}", addr);
                Ok(stream)
            }
            Err(e) => {
                log::warn!("Failed to connect to {}: {}", addr, e);
                Err(CloseCode::GoingAway)
            }
        }
    }

    async fn handshake(&self, stream: &mut TcpStream) -> std::result::Result<(), CloseCode> {
        self.state.set(ConnectionState::Handshaking);
        let mode = self.config.serialization_mode;
        self.send(stream, &Hello::new(mode).to_frame()).await?;

        let frame = self.receive(stream).await?;
        match frame.kind {
            FrameKind::Hello => {
                let hello = Hello::from_frame(&frame).map_err(|e| {
                    log::warn!("Invalid handshake reply: {}", e);
                    CloseCode::InternalError
                })?;
                if !hello.is_compatible() || hello.mode != mode {
                    log::warn!(
                        "Server speaks {} / {}, expected our {} mode",
                        hello.version,
                        hello.mode.as_str_name(),
                        mode.as_str_name()
                    );
                    return Err(CloseCode::InternalError);
                }
                Ok(())
            }
            FrameKind::Command(Command::Error) => {
                log::warn!(
                    "Server rejected handshake: {}",
                    String::from_utf8_lossy(&frame.body)
                );
                Err(CloseCode::InternalError)
            }
            other => {
                log::warn!("Unexpected {} during handshake", other.as_str_name());
                Err(CloseCode::InternalError)
            }
        }
    }

    /// 请求/执行/返回循环
    async fn exchange(&self, stream: &mut TcpStream, report: &mut ClientReport, started: Instant) -> CloseCode {
        let mode = self.config.serialization_mode;
        let mut outgoing: Envelope<P> = Envelope::fetch_work();

        loop {
            let requesting = outgoing.command == Command::FetchWork;
            if requesting && self.should_halt(report, started) {
                return CloseCode::Normal;
            }

            self.state.set(ConnectionState::AwaitingCommand);
            let frame = match outgoing.to_frame(mode) {
                Ok(frame) => frame,
                Err(e) => {
                    log::error!("Failed to encode {}: {}", outgoing.command, e);
                    return CloseCode::InternalError;
                }
            };
            if let Err(code) = self.send(stream, &frame).await {
                return code;
            }
            if !requesting {
                // RESULT没有回复，接着请求下一个
                outgoing = Envelope::fetch_work();
                continue;
            }

            self.state.set(ConnectionState::AwaitingResponse);
            let frame = match self.receive(stream).await {
                Ok(frame) => frame,
                Err(code) => return code,
            };
            let envelope = match Envelope::<P>::from_frame(&frame, mode) {
                Ok(envelope) => envelope,
                Err(e) => {
                    log::warn!("Undecodable reply from server: {}", e);
                    return CloseCode::InternalError;
                }
            };

            match (envelope.command, envelope.item) {
                (Command::Compute, Some(item)) => {
                    self.state.set(ConnectionState::Processing);
                    let item = match self.process(item).await {
                        Ok(item) => item,
                        Err(code) => return code,
                    };
                    report.processed += 1;
                    if item.status() == ProcessingStatus::ExceptionCaught {
                        report.exceptions += 1;
                    }
                    outgoing = Envelope::result(item);
                }
                (Command::NoData, _) | (Command::Error, _) => {
                    report.no_data += 1;
                    metrics::counter!("zerg_broker_client_nodata_total").increment(1);
                    let delay = Jitter::from_millis(self.config.nodata_min_ms, self.config.nodata_max_ms)
                        .next_delay();
                    log::debug!("No work available, retrying in {:?}", delay);
                    tokio::select! {
                        _ = self.stop.wait() => return CloseCode::Normal,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    outgoing = Envelope::fetch_work();
                }
                (other, _) => {
                    log::warn!("Unexpected {} from server", other);
                    return CloseCode::InternalError;
                }
            }
        }
    }

    async fn process(&self, item: WorkItem<P>) -> std::result::Result<WorkItem<P>, CloseCode> {
        let joined = tokio::task::spawn_blocking(move || {
            let mut item = item;
            let outcome = item.process();
            (item, outcome)
        })
        .await;

        match joined {
            Ok((item, Ok(status))) => {
                log::debug!("Processed item {} ({})", item.id(), status);
                Ok(item)
            }
            Ok((item, Err(e))) => {
                log::warn!("Returning item {} untouched: {}", item.id(), e);
                Ok(item)
            }
            Err(e) => {
                log::error!("Processing task failed: {}", e);
                Err(CloseCode::InternalError)
            }
        }
    }

    /// 读取下一个非控制帧，PING在此直接应答
    async fn receive(&self, stream: &mut TcpStream) -> std::result::Result<Frame, CloseCode> {
        loop {
            let read = tokio::select! {
                _ = self.stop.wait() => return Err(CloseCode::Normal),
                read = read_frame(stream, self.config.max_frame_len) => read,
            };
            match read {
                Ok(Some(frame)) => match frame.kind {
                    FrameKind::Ping => self.send(stream, &Frame::empty(FrameKind::Pong)).await?,
                    FrameKind::Pong => {}
                    _ => return Ok(frame),
                },
                Ok(None) => {
                    log::info!("Server closed the connection");
                    return Err(CloseCode::GoingAway);
                }
                Err(NetworkError::Io(e)) => {
                    log::warn!("Connection lost: {}", e);
                    return Err(CloseCode::GoingAway);
                }
                Err(e) => {
                    log::warn!("Malformed frame from server: {}", e);
                    return Err(CloseCode::InternalError);
                }
            }
        }
    }

    /// 写出一帧；服务端不再读取时写操作可能一直阻塞，停止信号同样可以打断它
    async fn send(&self, stream: &mut TcpStream, frame: &Frame) -> std::result::Result<(), CloseCode> {
        let written = tokio::select! {
            _ = self.stop.wait() => {
                log::debug!("Stop requested while sending {}", frame.kind.as_str_name());
                return Err(CloseCode::Normal);
            }
            written = write_frame(stream, frame) => written,
        };
        written.map_err(|e| {
            log::warn!("Failed to send {}: {}", frame.kind.as_str_name(), e);
            CloseCode::GoingAway
        })
    }
}
