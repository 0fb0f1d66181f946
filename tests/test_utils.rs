#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use zerg_broker::{
    Broker, BrokerConfig, ClientConfig, Consumer, NetworkedConsumer, ProcessingFault, Processable,
    SerializationMode, ServerConfig, WorkItem,
};

/// 测试负载的行为
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Behaviour {
    Square,
    Fault,
    Panic,
}

/// 测试专用负载: 计算平方，可配置延迟和故障
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Square {
    pub value: i64,
    pub delay_ms: u64,
    pub behaviour: Behaviour,
}

impl Square {
    pub fn new(value: i64) -> Self {
        Self {
            value,
            delay_ms: 0,
            behaviour: Behaviour::Square,
        }
    }

    pub fn slow(value: i64, delay_ms: u64) -> Self {
        Self {
            delay_ms,
            ..Self::new(value)
        }
    }

    pub fn faulty(value: i64) -> Self {
        Self {
            behaviour: Behaviour::Fault,
            ..Self::new(value)
        }
    }

    pub fn panicking(value: i64) -> Self {
        Self {
            behaviour: Behaviour::Panic,
            ..Self::new(value)
        }
    }
}

impl Processable for Square {
    fn process(&mut self) -> Result<(), ProcessingFault> {
        if self.delay_ms > 0 {
            thread::sleep(Duration::from_millis(self.delay_ms));
        }
        match self.behaviour {
            Behaviour::Square => {
                self.value *= self.value;
                Ok(())
            }
            Behaviour::Fault => Err(ProcessingFault::new(format!("cannot square {}", self.value))),
            Behaviour::Panic => panic!("square of {} exploded", self.value),
        }
    }
}

/// 测试专用的日志初始化
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 生成`n`个待处理工作单元，值为0..n
pub fn items(n: usize) -> Vec<WorkItem<Square>> {
    (0..n as i64).map(|v| WorkItem::new(Square::new(v))).collect()
}

/// 使用较短轮询间隔的隔离broker
pub fn test_broker() -> Arc<Broker<Square>> {
    Broker::new(BrokerConfig {
        port_capacity: 64,
        poll_slice_ms: 5,
        ..BrokerConfig::default()
    })
}

/// 测试用服务端配置: 绑定到本机的临时端口
pub fn server_config(mode: SerializationMode) -> ServerConfig {
    let mut config = ServerConfig::with_tcp_addr("127.0.0.1:0").unwrap();
    config.serialization_mode = mode;
    config.listener_threads = 2;
    config.fetch_timeout_ms = 20;
    config
}

/// 在broker上启动网络consumer，返回consumer和实际监听端口
pub fn start_server(
    broker: &Arc<Broker<Square>>,
    config: ServerConfig,
) -> (NetworkedConsumer<Square>, u16) {
    let mut server = NetworkedConsumer::new(config);
    server.register_port(broker).unwrap();
    server.start().unwrap();
    let port = server.local_addr().unwrap().port();
    (server, port)
}

/// 指向本机测试服务端的客户端配置，退避时间缩短
pub fn client_config(port: u16, mode: SerializationMode) -> ClientConfig {
    ClientConfig {
        server: "127.0.0.1".to_string(),
        port,
        serialization_mode: mode,
        nodata_min_ms: 5,
        nodata_max_ms: 20,
        reconnect_min_ms: 10,
        reconnect_max_ms: 20,
        max_reconnects: 2,
        ..ClientConfig::default()
    }
}
