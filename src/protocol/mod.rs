//! 网络协议定义
//!
//! 每一帧由定长(36字节)的命令字段、定长的十进制长度字段和负载组成。
//! 协议命令帧承载工作单元，控制帧(HELLO/PING/PONG)用于握手和存活检测。

pub mod codec;
pub mod frame;

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

use crate::item::{Processable, WorkItem};
use codec::{CodecError, SerializationMode};
pub use frame::Frame;

/// 命令字段和长度字段的宽度
pub const COMMAND_LENGTH: usize = 36;
/// 帧头总长度
pub const HEADER_LENGTH: usize = 2 * COMMAND_LENGTH;
/// 默认最大负载长度(64 MiB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
/// 握手中交换的协议版本
pub const PROTOCOL_VERSION: &str = "zerg/1";

/// 网络通信错误类型
#[derive(thiserror::Error, Debug)]
pub enum NetworkError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("stopped")]
    Stopped,
}

/// 协议命令
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    None,
    FetchWork,
    Compute,
    Result,
    NoData,
    Error,
}

impl Command {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            Command::None => "NONE",
            Command::FetchWork => "GETDATA",
            Command::Compute => "COMPUTE",
            Command::Result => "RESULT",
            Command::NoData => "NODATA",
            Command::Error => "ERROR",
        }
    }

    pub fn from_str_name(value: &str) -> Option<Self> {
        match value {
            "NONE" => Some(Self::None),
            "GETDATA" => Some(Self::FetchWork),
            "COMPUTE" => Some(Self::Compute),
            "RESULT" => Some(Self::Result),
            "NODATA" => Some(Self::NoData),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str_name())
    }
}

/// 帧类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Command(Command),
    Hello,
    Ping,
    Pong,
}

impl FrameKind {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            FrameKind::Command(cmd) => cmd.as_str_name(),
            FrameKind::Hello => "HELLO",
            FrameKind::Ping => "PING",
            FrameKind::Pong => "PONG",
        }
    }

    pub fn from_str_name(value: &str) -> Option<Self> {
        match value {
            "HELLO" => Some(Self::Hello),
            "PING" => Some(Self::Ping),
            "PONG" => Some(Self::Pong),
            other => Command::from_str_name(other).map(Self::Command),
        }
    }
}

/// 连接关闭原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CloseCode {
    #[default]
    Normal,
    /// 对端消失或网络中断，客户端可以重连
    GoingAway,
    /// 协议或编解码错误
    InternalError,
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseCode::Normal => "normal",
            CloseCode::GoingAway => "going away",
            CloseCode::InternalError => "internal error",
        };
        f.write_str(name)
    }
}

/// 握手参数: 协议版本和序列化模式
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: String,
    pub mode: SerializationMode,
}

impl Hello {
    pub fn new(mode: SerializationMode) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            mode,
        }
    }

    pub fn to_frame(&self) -> Frame {
        Frame::new(
            FrameKind::Hello,
            format!("{} {}", self.version, self.mode.as_str_name()).into_bytes(),
        )
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, NetworkError> {
        if frame.kind != FrameKind::Hello {
            return Err(NetworkError::ProtocolViolation(format!(
                "expected HELLO, got {}",
                frame.kind.as_str_name()
            )));
        }
        let text = std::str::from_utf8(&frame.body)
            .map_err(|_| NetworkError::ProtocolViolation("HELLO body is not UTF-8".into()))?;
        let mut parts = text.split_whitespace();
        let version = parts.next().unwrap_or_default().to_string();
        let mode = parts
            .next()
            .and_then(SerializationMode::from_str_name)
            .ok_or_else(|| NetworkError::HandshakeRejected(format!("unknown mode in {:?}", text)))?;
        Ok(Self { version, mode })
    }

    pub fn is_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}

/// 协议消息: 命令加可选的工作单元
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<P> {
    pub command: Command,
    pub item: Option<WorkItem<P>>,
}

impl<P> Envelope<P> {
    pub fn fetch_work() -> Self {
        Self {
            command: Command::FetchWork,
            item: None,
        }
    }

    pub fn no_data() -> Self {
        Self {
            command: Command::NoData,
            item: None,
        }
    }

    pub fn compute(item: WorkItem<P>) -> Self {
        Self {
            command: Command::Compute,
            item: Some(item),
        }
    }

    pub fn result(item: WorkItem<P>) -> Self {
        Self {
            command: Command::Result,
            item: Some(item),
        }
    }

    pub fn error(item: Option<WorkItem<P>>) -> Self {
        Self {
            command: Command::Error,
            item,
        }
    }

    /// 检查命令与负载是否匹配
    pub fn validate(&self) -> Result<(), NetworkError> {
        let ok = match self.command {
            Command::None => false,
            Command::FetchWork | Command::NoData => self.item.is_none(),
            Command::Compute | Command::Result => self.item.is_some(),
            Command::Error => true,
        };
        if ok {
            Ok(())
        } else {
            Err(NetworkError::ProtocolViolation(format!(
                "{} {} a work item",
                self.command,
                if self.item.is_some() { "must not carry" } else { "requires" }
            )))
        }
    }
}

impl<P: Processable> Envelope<P> {
    /// 按给定模式编码成帧
    pub fn to_frame(&self, mode: SerializationMode) -> Result<Frame, NetworkError> {
        self.validate()?;
        let body = match &self.item {
            Some(item) => mode.encode_item(item)?,
            None => Vec::new(),
        };
        Ok(Frame::new(FrameKind::Command(self.command), body))
    }

    /// 从帧解码
    pub fn from_frame(frame: &Frame, mode: SerializationMode) -> Result<Self, NetworkError> {
        let FrameKind::Command(command) = frame.kind else {
            return Err(NetworkError::ProtocolViolation(format!(
                "{} is a control frame",
                frame.kind.as_str_name()
            )));
        };
        let item = if frame.body.is_empty() {
            None
        } else {
            Some(mode.decode_item(&frame.body)?)
        };
        let envelope = Self { command, item };
        envelope.validate()?;
        Ok(envelope)
    }
}
