//! ZergBroker 核心库入口
//!
//! 生产者通过[`Broker`]把工作单元分发到已注册的[`BufferPort`]，
//! 本地线程池([`LocalConsumer`])或网络consumer([`NetworkedConsumer`] + 远程[`Client`])
//! 从port取走工作、执行并送回结果，[`BrokerExecutor`]按回收策略收集每一代的结果。

pub mod balancer;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod drone;
pub mod executor;
pub mod item;
pub mod port;
pub mod protocol;
pub mod queen;
pub mod signal;
mod worker;

use crate::item::{GenerationId, StatusError};
use crate::port::PortId;

/// Broker/BufferPort层面的错误
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("等待超时")]
    Timeout,
    #[error("buffer port已关闭")]
    PortClosed,
    #[error("没有已注册的buffer port")]
    NoPortsAvailable,
    #[error("注册表已满(上限 {max})")]
    RegistryFull { max: usize },
    #[error("未知的buffer port: {0}")]
    UnknownPort(PortId),
    #[error("全局broker已初始化")]
    AlreadyInitialized,
}

/// 通用错误类型
#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    #[error("broker错误: {0}")]
    Broker(#[from] BrokerError),

    #[error("网络通信错误: {0}")]
    Network(#[from] protocol::NetworkError),

    #[error("配置错误: {0}")]
    Config(#[from] config::ConfigError),

    #[error("工作单元状态错误: {0}")]
    Status(#[from] StatusError),

    #[error("consumer错误: {0}")]
    Consumer(String),

    #[error("未知的代: {0}")]
    UnknownGeneration(GenerationId),

    #[error("运行时错误: {0}")]
    Runtime(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PoolError>;

// 公开导出模块的公共接口
pub use broker::Broker;
pub use config::{BrokerConfig, ClientConfig, Config, ExecutorConfig, ServerConfig};
pub use consumer::{Consumer, LocalConsumer};
pub use drone::{Client, ClientReport, ConnectionState};
pub use executor::{
    BrokerExecutor, Executor, GenerationHandle, MtExecutor, ReturnPolicy, ReturnReport,
    SerialExecutor,
};
pub use item::{ProcessingFault, ProcessingStatus, Processable, WorkItem};
pub use port::BufferPort;
pub use protocol::codec::SerializationMode;
pub use protocol::{CloseCode, Command};
pub use queen::NetworkedConsumer;
pub use signal::StopSignal;
