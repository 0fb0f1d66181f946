//! 单个客户端连接的会话
//!
//! 读半部由独立任务持续读帧并转发到通道，主循环在通道、ping定时器和停止信号之间select，
//! 因此被取消的只会是通道接收，不会截断半个帧。

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};

use super::ServerContext;
use crate::item::{Processable, WorkItem};
use crate::port::BufferPort;
use crate::protocol::codec::SerializationMode;
use crate::protocol::frame::{read_frame, write_frame};
use crate::protocol::{CloseCode, Command, Envelope, Frame, FrameKind, Hello, NetworkError};
use crate::BrokerError;

type Incoming = Result<Frame, NetworkError>;

struct Session<P: Processable> {
    ctx: ServerContext<P>,
    peer: SocketAddr,
    writer: OwnedWriteHalf,
    mode: SerializationMode,
    // 已用COMPUTE发出、尚未收到RESULT的工作单元
    in_flight: Option<WorkItem<P>>,
    pending_pings: u32,
}

/// 运行会话直到连接关闭，返回关闭原因
pub(crate) async fn run_session<P: Processable>(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: ServerContext<P>,
) -> CloseCode {
    let (reader, writer) = stream.into_split();
    let (frame_tx, mut frame_rx) = mpsc::channel(16);
    let read_task = tokio::spawn(read_loop(reader, ctx.config.max_frame_len, frame_tx));

    let mut session = Session {
        mode: ctx.config.serialization_mode,
        ctx,
        peer,
        writer,
        in_flight: None,
        pending_pings: 0,
    };

    let code = session.run(&mut frame_rx).await;
    read_task.abort();
    session.salvage_in_flight("connection lost before result").await;
    if let Err(e) = session.writer.shutdown().await {
        log::debug!("Shutdown of session with {} failed: {}", peer, e);
    }
    code
}

async fn read_loop(mut reader: OwnedReadHalf, max_len: usize, tx: mpsc::Sender<Incoming>) {
    loop {
        match read_frame(&mut reader, max_len).await {
            Ok(Some(frame)) => {
                if tx.send(Ok(frame)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }
}

impl<P: Processable> Session<P> {
    async fn run(&mut self, frames: &mut mpsc::Receiver<Incoming>) -> CloseCode {
        let stop = self.ctx.stop.clone();
        let first = tokio::select! {
            _ = stop.wait() => return CloseCode::Normal,
            first = time::timeout(self.ctx.config.handshake_timeout(), frames.recv()) => first,
        };
        let hello = match first {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                log::warn!("Malformed handshake from {}: {}", self.peer, e);
                return CloseCode::InternalError;
            }
            Ok(None) => return CloseCode::GoingAway,
            Err(_) => {
                log::warn!("Handshake with {} timed out", self.peer);
                return CloseCode::GoingAway;
            }
        };
        if let Err(code) = self.handshake(&hello).await {
            return code;
        }

        let interval = self.ctx.config.ping_interval();
        let mut ping = time::interval_at(Instant::now() + interval, interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.wait() => return CloseCode::Normal,
                incoming = frames.recv() => match incoming {
                    None => {
                        log::debug!("Client {} disconnected", self.peer);
                        return CloseCode::GoingAway;
                    }
                    Some(Err(e)) => {
                        log::warn!("Failed to read frame from {}: {}", self.peer, e);
                        return match e {
                            NetworkError::Io(_) => CloseCode::GoingAway,
                            _ => {
                                self.send_error().await;
                                CloseCode::InternalError
                            }
                        };
                    }
                    Some(Ok(frame)) => {
                        // 任何帧都证明客户端仍然存活
                        self.pending_pings = 0;
                        if let Err(code) = self.handle(frame).await {
                            return code;
                        }
                    }
                },
                _ = ping.tick() => {
                    if self.pending_pings >= self.ctx.config.max_open_pings {
                        log::warn!(
                            "Client {} stale after {} unanswered pings",
                            self.peer,
                            self.pending_pings
                        );
                        self.ctx.stats.stale.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("zerg_broker_sessions_stale_total").increment(1);
                        return CloseCode::GoingAway;
                    }
                    self.pending_pings += 1;
                    if let Err(e) = self.send(&Frame::empty(FrameKind::Ping)).await {
                        log::debug!("Ping to {} failed: {}", self.peer, e);
                        return CloseCode::GoingAway;
                    }
                }
            }
        }
    }

    async fn handshake(&mut self, frame: &Frame) -> Result<(), CloseCode> {
        let rejection = match Hello::from_frame(frame) {
            Ok(hello) if !hello.is_compatible() => {
                format!("unsupported protocol version {:?}", hello.version)
            }
            Ok(hello) if hello.mode != self.mode => format!(
                "serialization mode {} does not match server mode {}",
                hello.mode.as_str_name(),
                self.mode.as_str_name()
            ),
            Ok(_) => {
                let reply = Hello::new(self.mode).to_frame();
                return match self.send(&reply).await {
                    Ok(()) => {
                        log::info!("Client {} connected ({})", self.peer, self.mode.as_str_name());
                        Ok(())
                    }
                    Err(_) => Err(CloseCode::GoingAway),
                };
            }
            Err(e) => e.to_string(),
        };

        log::warn!("Rejecting handshake from {}: {}", self.peer, rejection);
        let reply = Frame::new(FrameKind::Command(Command::Error), rejection.into_bytes());
        let _ = self.send(&reply).await;
        Err(CloseCode::InternalError)
    }

    async fn handle(&mut self, frame: Frame) -> Result<(), CloseCode> {
        match frame.kind {
            FrameKind::Ping => self
                .send(&Frame::empty(FrameKind::Pong))
                .await
                .map_err(|_| CloseCode::GoingAway),
            FrameKind::Pong => Ok(()),
            FrameKind::Hello => {
                log::warn!("Unexpected HELLO from {}", self.peer);
                self.send_error().await;
                Err(CloseCode::InternalError)
            }
            FrameKind::Command(_) => {
                let envelope = match Envelope::<P>::from_frame(&frame, self.mode) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        log::warn!("Undecodable frame from {}: {}", self.peer, e);
                        self.send_error().await;
                        return Err(CloseCode::InternalError);
                    }
                };
                match envelope.command {
                    Command::FetchWork => self.serve_work().await,
                    Command::Result => self.accept_result(envelope.item).await,
                    Command::Error => {
                        log::warn!("Client {} reported an error", self.peer);
                        match envelope.item {
                            Some(item) => self.accept_result(Some(item)).await,
                            None => {
                                self.salvage_in_flight("client reported an error").await;
                                Ok(())
                            }
                        }
                    }
                    other => {
                        log::warn!("Unexpected {} from client {}", other, self.peer);
                        self.send_error().await;
                        Err(CloseCode::InternalError)
                    }
                }
            }
        }
    }

    /// GETDATA: 有工作则回复COMPUTE，否则NODATA
    async fn serve_work(&mut self) -> Result<(), CloseCode> {
        if let Some(previous) = self.in_flight.take() {
            log::warn!(
                "Client {} requested work before returning item {}",
                self.peer,
                previous.id()
            );
            self.return_flagged(previous, "superseded by a new request").await;
        }

        let port = Arc::clone(&self.ctx.port);
        let timeout = self.ctx.config.fetch_timeout();
        let popped = tokio::task::spawn_blocking(move || port.pop_outbound(Some(timeout))).await;

        let reply = match popped {
            Ok(Ok(item)) => {
                log::debug!("Sending item {} to {}", item.id(), self.peer);
                self.ctx.stats.served.fetch_add(1, Ordering::Relaxed);
                self.in_flight = Some(item.clone());
                Envelope::compute(item)
            }
            Ok(Err(BrokerError::Timeout)) => Envelope::no_data(),
            Ok(Err(e)) => {
                log::info!("Port unavailable for {}: {}", self.peer, e);
                self.send_error().await;
                return Err(CloseCode::Normal);
            }
            Err(e) => {
                log::error!("Work fetch task failed: {}", e);
                return Err(CloseCode::InternalError);
            }
        };
        self.send_envelope(reply).await
    }

    /// RESULT: 结果写回inbound，不回复
    async fn accept_result(&mut self, item: Option<WorkItem<P>>) -> Result<(), CloseCode> {
        let Some(mut item) = item else {
            return Err(CloseCode::InternalError);
        };

        match self.in_flight.take() {
            Some(sent) if sent.id() == item.id() => {}
            Some(sent) => {
                log::warn!(
                    "Result {} from {} does not match in-flight item {}",
                    item.id(),
                    self.peer,
                    sent.id()
                );
                self.return_flagged(sent, "result mismatch").await;
            }
            None => log::warn!("Unsolicited result {} from {}", item.id(), self.peer),
        }

        if !item.status().is_final() {
            let _ = item.flag_error("returned unprocessed");
        }
        self.ctx.stats.returned.fetch_add(1, Ordering::Relaxed);
        Self::push_result(Arc::clone(&self.ctx.port), item).await
    }

    async fn return_flagged(&mut self, mut item: WorkItem<P>, reason: &str) {
        if let Err(e) = item.flag_error(reason) {
            log::debug!("Item {} not flagged: {}", item.id(), e);
        }
        let _ = Self::push_result(Arc::clone(&self.ctx.port), item).await;
    }

    async fn salvage_in_flight(&mut self, reason: &str) {
        if let Some(item) = self.in_flight.take() {
            log::info!("Returning in-flight item {} from {} ({})", item.id(), self.peer, reason);
            self.return_flagged(item, reason).await;
        }
    }

    /// 结果写回inbound；port已关闭时交还broker，不会丢失
    async fn push_result(port: Arc<BufferPort<P>>, item: WorkItem<P>) -> Result<(), CloseCode> {
        let pushed = tokio::task::spawn_blocking(move || {
            port.push_inbound_or_return(item, None).map_err(|(e, back)| {
                let id = back.id();
                let handed_back = port.hand_back(back, "port closed before result was returned");
                (e, id, handed_back)
            })
        })
        .await;
        match pushed {
            Ok(Ok(())) => Ok(()),
            Ok(Err((e, id, handed_back))) => {
                if handed_back {
                    log::info!("Result {} handed back to the broker: {}", id, e);
                } else {
                    log::warn!("Dropping result {}: {}", id, e);
                }
                Err(CloseCode::Normal)
            }
            Err(e) => {
                log::error!("Result push task failed: {}", e);
                Err(CloseCode::InternalError)
            }
        }
    }

    async fn send_envelope(&mut self, envelope: Envelope<P>) -> Result<(), CloseCode> {
        let frame = envelope.to_frame(self.mode).map_err(|e| {
            log::error!("Failed to encode {}: {}", envelope.command, e);
            CloseCode::InternalError
        })?;
        self.send(&frame).await.map_err(|e| {
            log::debug!("Write to {} failed: {}", self.peer, e);
            CloseCode::GoingAway
        })
    }

    async fn send_error(&mut self) {
        let _ = self.send(&Frame::empty(FrameKind::Command(Command::Error))).await;
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), NetworkError> {
        match time::timeout(self.ctx.config.stale_after(), write_frame(&mut self.writer, frame)).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "write timed out",
            ))),
        }
    }
}
