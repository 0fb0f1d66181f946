//! 工作单元(WorkItem)定义
//!
//! 生产者(Executor)创建处于`PendingProcessing`状态的工作单元，
//! 执行端(本地线程或远程drone)恰好修改一次处理状态。

use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::port::PortId;

/// 工作单元唯一标识
pub type ItemId = Uuid;

/// 代(generation)编号，由Executor每次提交递增
pub type GenerationId = u64;

/// 用户代码执行失败时返回的领域错误
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ProcessingFault(pub String);

impl ProcessingFault {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// 可被broker分发执行的负载
///
/// 负载按值在队列间转移，跨网络时总是编码后在对端解码成新值。
pub trait Processable: Serialize + DeserializeOwned + Clone + Send + 'static {
    /// 执行计算。返回`Err`或panic都会被记录为`ExceptionCaught`
    fn process(&mut self) -> Result<(), ProcessingFault>;
}

/// 处理状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingStatus {
    Ignore,
    PendingProcessing,
    Processed,
    ExceptionCaught,
    ErrorFlagged,
}

impl ProcessingStatus {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            ProcessingStatus::Ignore => "IGNORE",
            ProcessingStatus::PendingProcessing => "PENDING_PROCESSING",
            ProcessingStatus::Processed => "PROCESSED",
            ProcessingStatus::ExceptionCaught => "EXCEPTION_CAUGHT",
            ProcessingStatus::ErrorFlagged => "ERROR_FLAGGED",
        }
    }

    pub fn from_str_name(value: &str) -> Option<Self> {
        match value {
            "IGNORE" => Some(Self::Ignore),
            "PENDING_PROCESSING" => Some(Self::PendingProcessing),
            "PROCESSED" => Some(Self::Processed),
            "EXCEPTION_CAUGHT" => Some(Self::ExceptionCaught),
            "ERROR_FLAGGED" => Some(Self::ErrorFlagged),
            _ => None,
        }
    }

    /// 是否已离开待处理状态(终态)
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ProcessingStatus::Processed
                | ProcessingStatus::ExceptionCaught
                | ProcessingStatus::ErrorFlagged
        )
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str_name())
    }
}

/// 状态迁移错误
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StatusError {
    #[error("work item is not pending (current status {0})")]
    NotPending(ProcessingStatus),
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: ProcessingStatus,
        to: ProcessingStatus,
    },
}

/// 工作单元在各队列间流转的时间记录
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingMarks {
    /// 进入outbound队列
    pub outbound_submitted: Option<DateTime<Utc>>,
    /// 被consumer从outbound取走
    pub outbound_retrieved: Option<DateTime<Utc>>,
    /// 结果进入inbound队列
    pub inbound_submitted: Option<DateTime<Utc>>,
    /// 被broker从inbound取回
    pub inbound_retrieved: Option<DateTime<Utc>>,
}

/// 工作单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem<P> {
    pub(crate) id: ItemId,
    pub(crate) generation: GenerationId,
    pub(crate) position: usize,
    pub(crate) status: ProcessingStatus,
    pub(crate) error: Option<String>,
    pub(crate) port: Option<PortId>,
    pub(crate) marks: TimingMarks,
    pub(crate) payload: P,
}

impl<P> WorkItem<P> {
    /// 以待处理状态创建新工作单元
    pub fn new(payload: P) -> Self {
        Self {
            id: Uuid::new_v4(),
            generation: 0,
            position: 0,
            status: ProcessingStatus::PendingProcessing,
            error: None,
            port: None,
            marks: TimingMarks::default(),
            payload,
        }
    }

    /// 以忽略状态创建，Executor不会提交它
    pub fn ignored(payload: P) -> Self {
        let mut item = Self::new(payload);
        item.status = ProcessingStatus::Ignore;
        item
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn generation(&self) -> GenerationId {
        self.generation
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn status(&self) -> ProcessingStatus {
        self.status
    }

    /// 执行端记录的错误描述
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// 最近一次被路由到的port
    pub fn port(&self) -> Option<PortId> {
        self.port
    }

    pub fn marks(&self) -> &TimingMarks {
        &self.marks
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// 仅在待处理/忽略状态下允许修改负载
    pub fn payload_mut(&mut self) -> Result<&mut P, StatusError> {
        if self.status.is_final() {
            return Err(StatusError::NotPending(self.status));
        }
        Ok(&mut self.payload)
    }

    pub fn into_payload(self) -> P {
        self.payload
    }

    /// 生产者侧：标记为需要处理
    pub fn mark_for_processing(&mut self) -> Result<(), StatusError> {
        self.producer_transition(ProcessingStatus::PendingProcessing)
    }

    /// 生产者侧：标记为忽略
    pub fn mark_ignore(&mut self) -> Result<(), StatusError> {
        self.producer_transition(ProcessingStatus::Ignore)
    }

    fn producer_transition(&mut self, target: ProcessingStatus) -> Result<(), StatusError> {
        match self.status {
            ProcessingStatus::Ignore | ProcessingStatus::PendingProcessing => {
                self.status = target;
                Ok(())
            }
            from => Err(StatusError::InvalidTransition { from, to: target }),
        }
    }

    /// 基础设施侧：标记外部故障(例如传输中断)
    pub fn flag_error(&mut self, reason: impl Into<String>) -> Result<(), StatusError> {
        self.finish(ProcessingStatus::ErrorFlagged, Some(reason.into()))
    }

    fn finish(&mut self, to: ProcessingStatus, error: Option<String>) -> Result<(), StatusError> {
        if self.status != ProcessingStatus::PendingProcessing {
            return Err(StatusError::NotPending(self.status));
        }
        debug_assert!(to.is_final());
        self.status = to;
        self.error = error;
        Ok(())
    }

    pub(crate) fn stamp(&mut self, generation: GenerationId, position: usize) {
        self.generation = generation;
        self.position = position;
    }

    pub(crate) fn set_port(&mut self, port: PortId) {
        self.port = Some(port);
    }

    pub(crate) fn marks_mut(&mut self) -> &mut TimingMarks {
        &mut self.marks
    }
}

impl<P: Processable> WorkItem<P> {
    /// 执行负载并设置最终状态
    ///
    /// 只允许执行一次，非待处理状态的工作单元会被拒绝。
    pub fn process(&mut self) -> Result<ProcessingStatus, StatusError> {
        if self.status != ProcessingStatus::PendingProcessing {
            return Err(StatusError::NotPending(self.status));
        }

        let payload = &mut self.payload;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| payload.process()));
        match outcome {
            Ok(Ok(())) => self.finish(ProcessingStatus::Processed, None)?,
            Ok(Err(fault)) => {
                log::debug!("Work item {} raised a processing fault: {}", self.id, fault);
                self.finish(ProcessingStatus::ExceptionCaught, Some(fault.0))?
            }
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                log::warn!("Work item {} panicked during processing: {}", self.id, msg);
                self.finish(ProcessingStatus::ExceptionCaught, Some(msg))?
            }
        }
        Ok(self.status)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
