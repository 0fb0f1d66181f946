//! Consumer抽象
//!
//! consumer从broker注册一个port，取走outbound中的工作单元执行后把结果写回inbound。
//! 本地线程池见[`local::LocalConsumer`]，网络consumer见[`crate::queen::NetworkedConsumer`]。

pub mod local;

use std::sync::Arc;

use crate::broker::Broker;
use crate::item::Processable;
use crate::port::PortId;
use crate::Result;

pub use local::LocalConsumer;

/// 工作单元的执行端
pub trait Consumer<P: Processable>: Send {
    /// 完整名称
    fn name(&self) -> &str;

    /// 简短标识，用于日志
    fn mnemonic(&self) -> &str;

    /// 在broker上注册该consumer使用的port
    fn register_port(&mut self, broker: &Arc<Broker<P>>) -> Result<PortId>;

    fn start(&mut self) -> Result<()>;

    /// 停止执行并注销port，可重复调用
    fn stop(&mut self) -> Result<()>;

    fn is_running(&self) -> bool;

    /// 是否保证每个取走的工作单元都会返回
    fn capable_of_full_return(&self) -> bool;

    /// (处理单元数量, 是否精确)
    fn processing_units_estimate(&self) -> (usize, bool) {
        (1, false)
    }
}
