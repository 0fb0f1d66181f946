//! 配置模块
//!
//! 所有配置结构都实现`Default`并支持从JSON加载，缺省字段取默认值。
//! 时间类字段以毫秒存储，通过同名访问器转换成`Duration`。

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::port::DEFAULT_BUFFER_SIZE;
use crate::protocol::codec::SerializationMode;
use crate::protocol::DEFAULT_MAX_FRAME_LEN;

/// 最大注册port数量
pub const DEFAULT_MAX_PORTS: usize = 256;
/// 默认监听端口
pub const DEFAULT_PORT: u16 = 10000;

/// 配置错误
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("读取配置失败: {0}")]
    Io(#[from] std::io::Error),
    #[error("解析配置失败: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("无效地址: {0}")]
    InvalidAddress(String),
    #[error("无效配置: {0}")]
    Invalid(String),
}

/// Broker配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// 每个port单方向的容量
    pub port_capacity: usize,
    pub max_registered_ports: usize,
    /// 阻塞等待时重新检查注册表的间隔
    pub poll_slice_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            port_capacity: DEFAULT_BUFFER_SIZE,
            max_registered_ports: DEFAULT_MAX_PORTS,
            poll_slice_ms: 10,
        }
    }
}

impl BrokerConfig {
    pub fn poll_slice(&self) -> Duration {
        Duration::from_millis(self.poll_slice_ms.max(1))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port_capacity == 0 {
            return Err(ConfigError::Invalid("port_capacity must be positive".into()));
        }
        if self.max_registered_ports == 0 {
            return Err(ConfigError::Invalid(
                "max_registered_ports must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// 网络consumer(服务端)配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// 处理会话的工作线程数
    pub listener_threads: usize,
    pub reuse_address: bool,
    pub no_delay: bool,
    pub serialization_mode: SerializationMode,
    pub ping_interval_ms: u64,
    /// 连续未应答的ping超过该值即判定客户端失联
    pub max_open_pings: u32,
    /// 处理GETDATA时等待工作的时长，超时回复NODATA
    pub fetch_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub max_frame_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            listener_threads: 4,
            reuse_address: true,
            no_delay: true,
            serialization_mode: SerializationMode::default(),
            ping_interval_ms: 1000,
            max_open_pings: 100,
            fetch_timeout_ms: 50,
            handshake_timeout_ms: 5000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ServerConfig {
    /// 使用给定的TCP地址创建配置，其余取默认值
    pub fn with_tcp_addr(addr: &str) -> Result<Self, ConfigError> {
        if addr.trim().is_empty() {
            return Err(ConfigError::InvalidAddress("empty address".into()));
        }
        let bind_addr = addr
            .to_socket_addrs()
            .map_err(|e| ConfigError::InvalidAddress(format!("{}: {}", addr, e)))?
            .next()
            .ok_or_else(|| ConfigError::InvalidAddress(addr.to_string()))?;
        Ok(Self {
            bind_addr,
            ..Self::default()
        })
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// 客户端最长静默时间
    pub fn stale_after(&self) -> Duration {
        self.ping_interval() * self.max_open_pings.max(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listener_threads == 0 {
            return Err(ConfigError::Invalid("listener_threads must be positive".into()));
        }
        if self.max_frame_len == 0 {
            return Err(ConfigError::Invalid("max_frame_len must be positive".into()));
        }
        Ok(())
    }
}

/// 远程客户端(drone)配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server: String,
    pub port: u16,
    pub serialization_mode: SerializationMode,
    pub max_reconnects: u32,
    pub nodata_min_ms: u64,
    pub nodata_max_ms: u64,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
    /// 处理数量上限，0表示不限
    pub process_max: u64,
    /// 最长运行时间，0表示不限
    pub max_duration_ms: u64,
    pub max_frame_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "localhost".to_string(),
            port: DEFAULT_PORT,
            serialization_mode: SerializationMode::default(),
            max_reconnects: 10,
            nodata_min_ms: 50,
            nodata_max_ms: 200,
            reconnect_min_ms: 500,
            reconnect_max_ms: 1000,
            process_max: 0,
            max_duration_ms: 0,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ClientConfig {
    pub fn new(server: impl Into<String>, port: u16) -> Self {
        Self {
            server: server.into(),
            port,
            ..Self::default()
        }
    }

    pub fn max_duration(&self) -> Option<Duration> {
        (self.max_duration_ms > 0).then(|| Duration::from_millis(self.max_duration_ms))
    }

    pub fn process_max(&self) -> Option<u64> {
        (self.process_max > 0).then_some(self.process_max)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.trim().is_empty() {
            return Err(ConfigError::InvalidAddress("empty server name".into()));
        }
        if self.nodata_min_ms > self.nodata_max_ms {
            return Err(ConfigError::Invalid("nodata_min_ms exceeds nodata_max_ms".into()));
        }
        if self.reconnect_min_ms > self.reconnect_max_ms {
            return Err(ConfigError::Invalid(
                "reconnect_min_ms exceeds reconnect_max_ms".into(),
            ));
        }
        Ok(())
    }
}

/// 等待系数的范围与调整步长
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitFactorBounds {
    pub initial: f64,
    pub min: f64,
    pub max: f64,
    /// 出现超时后增加的量
    pub increment: f64,
    /// 一代无超时完成后减少的量
    pub decrement: f64,
}

impl Default for WaitFactorBounds {
    fn default() -> Self {
        Self {
            initial: 2.0,
            min: 1.0,
            max: 10.0,
            increment: 1.0,
            decrement: 0.25,
        }
    }
}

/// Executor配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub max_resubmissions: usize,
    /// 允许不完整返回时需达到的最小百分比，0表示要求全部返回
    pub min_partial_return_percentage: u8,
    pub wait_factor: WaitFactorBounds,
    pub submission_timeout_ms: u64,
    pub poll_slice_ms: u64,
    /// 自适应超时的下限
    pub min_item_timeout_ms: u64,
    /// 本地executor的线程数，0表示按CPU核数
    pub threads: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_resubmissions: 5,
            min_partial_return_percentage: 80,
            wait_factor: WaitFactorBounds::default(),
            submission_timeout_ms: 1000,
            poll_slice_ms: 20,
            min_item_timeout_ms: 50,
            threads: 0,
        }
    }
}

impl ExecutorConfig {
    pub fn submission_timeout(&self) -> Duration {
        Duration::from_millis(self.submission_timeout_ms)
    }

    pub fn poll_slice(&self) -> Duration {
        Duration::from_millis(self.poll_slice_ms.max(1))
    }

    pub fn min_item_timeout(&self) -> Duration {
        Duration::from_millis(self.min_item_timeout_ms)
    }

    pub fn threads(&self) -> usize {
        if self.threads == 0 {
            num_cpus::get()
        } else {
            self.threads
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let wf = &self.wait_factor;
        if !(wf.min > 0.0 && wf.min <= wf.initial && wf.initial <= wf.max) {
            return Err(ConfigError::Invalid(format!(
                "wait factor bounds must satisfy 0 < min <= initial <= max (got {} / {} / {})",
                wf.min, wf.initial, wf.max
            )));
        }
        if wf.increment < 0.0 || wf.decrement < 0.0 {
            return Err(ConfigError::Invalid("wait factor steps must be non-negative".into()));
        }
        if self.min_partial_return_percentage > 100 {
            return Err(ConfigError::Invalid(
                "min_partial_return_percentage must be within 0..=100".into(),
            ));
        }
        Ok(())
    }
}

/// 聚合配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub executor: ExecutorConfig,
}

impl Config {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;
        self.server.validate()?;
        self.client.validate()?;
        self.executor.validate()
    }
}
