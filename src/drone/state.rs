//! 客户端连接状态

use std::fmt;

use crate::protocol::CloseCode;

/// 客户端状态机的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// 尚未运行
    #[default]
    Idle,
    Resolving,
    Connecting,
    Handshaking,
    /// 正在发送请求
    AwaitingCommand,
    /// 等待服务端回复
    AwaitingResponse,
    Processing,
    Closing(CloseCode),
    Closed,
}

impl ConnectionState {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "IDLE",
            ConnectionState::Resolving => "RESOLVING",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Handshaking => "HANDSHAKING",
            ConnectionState::AwaitingCommand => "AWAITING_COMMAND",
            ConnectionState::AwaitingResponse => "AWAITING_RESPONSE",
            ConnectionState::Processing => "PROCESSING",
            ConnectionState::Closing(_) => "CLOSING",
            ConnectionState::Closed => "CLOSED",
        }
    }

    /// 连接已建立(握手完成之后)
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::AwaitingCommand
                | ConnectionState::AwaitingResponse
                | ConnectionState::Processing
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Closing(code) => write!(f, "CLOSING({})", code),
            other => f.write_str(other.as_str_name()),
        }
    }
}
